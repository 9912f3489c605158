//! Cached programming state of the memory access ports.
//!
//! The first access to an AP reads its IDR and probes which transfer sizes it implements.
//! Everything learned that way is kept in an [`ApContext`] until the session reconnects.

use bitflags::bitflags;

use super::memory_ap::{csw, AddressIncrement, DataSize};
use super::{KnownAp, IDR};
use crate::architecture::arm::memory::SecurityType;
use crate::architecture::arm::ArmError;

/// Number of debug ports a session can address.
pub const MAX_DPS: usize = 64;
/// Number of access ports per debug port.
pub const MAX_APS: usize = 32;

bitflags! {
    /// Transfer widths an AP was found to support.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessSizes: u8 {
        const BYTE = 0x01;
        const HWORD = 0x02;
        const WORD = 0x04;
    }
}

impl AccessSizes {
    pub fn supports(&self, size: DataSize) -> bool {
        self.contains(Self::from(size))
    }
}

impl From<DataSize> for AccessSizes {
    fn from(size: DataSize) -> Self {
        match size {
            DataSize::U8 => AccessSizes::BYTE,
            DataSize::U16 => AccessSizes::HWORD,
            DataSize::U32 => AccessSizes::WORD,
        }
    }
}

/// What the engine knows about one access port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApContext {
    /// Raw IDR value, `0` while the AP has not been probed.
    pub id: u32,
    /// Bits ORed into every CSW write before the size and increment fields.
    pub csw_base: u32,
    pub access_sizes: AccessSizes,
    /// The CSW bit selecting non-secure transfers on this AP class.
    pub sprot: u32,
    /// Leave the SPROT bit alone whatever the access attributes ask for.
    pub keep_sprot: bool,
    pub packed: bool,
    /// Writable CSW bits.
    pub rw_bits: u32,
    /// The CSW value last written through this context.
    pub(crate) last_csw: Option<u32>,
}

impl Default for ApContext {
    fn default() -> Self {
        Self {
            id: 0,
            csw_base: csw::DEFAULT_BASE,
            access_sizes: AccessSizes::WORD,
            sprot: csw::SPROT,
            keep_sprot: false,
            packed: true,
            rw_bits: csw::RWBITS,
            last_csw: None,
        }
    }
}

/// Follow-up probes an AP needs after its IDR has been classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePlan {
    /// Read CSW and decide the initial security state from SPIDEN.
    pub spiden: bool,
    /// Try the byte and half-word sizes.
    pub sizes: bool,
}

impl ApContext {
    pub fn is_probed(&self) -> bool {
        self.id != 0
    }

    /// Set the class specific defaults for the AP identified by `idr`.
    ///
    /// APs that are not memory APs, or not known, keep the Cortex-M AHB-AP defaults.
    pub fn classify(&mut self, idr: u32) -> ProbePlan {
        self.id = idr;

        let mut plan = ProbePlan {
            spiden: false,
            sizes: true,
        };

        let idr = IDR::from(idr);
        if !idr.is_memory_ap() {
            return plan;
        }

        match idr.known_ap() {
            Some(KnownAp::AhbCoreSight) => {
                self.csw_base &= !csw::MSTRDBG;
                plan.spiden = true;
            }
            Some(KnownAp::ApbCoreSight) => {
                self.csw_base = csw::DBGSWENABLE;
                self.packed = false;
                plan.sizes = false;
            }
            Some(KnownAp::AxiCoreSight) => {
                self.rw_bits = csw::AXI_RWBITS;
                self.sprot = csw::AXI_SPROT;
                self.csw_base &= !(csw::MSTRDBG | csw::HPROT | csw::AXI_DOM | csw::AXI_ACE_ENA);
                self.csw_base |= csw::AXI_PRIV | csw::AXI_DOM_SHSYS;
                plan.spiden = true;
            }
            Some(_) | None => {}
        }

        plan
    }

    /// Pick the starting security state of a CoreSight AHB-AP or AXI-AP from the CSW SPIDEN bit.
    pub fn apply_spiden(&mut self, csw_value: u32) {
        if csw_value & csw::SPIDEN == 0 {
            // Secure debug is disabled, only non-secure transfers can ever succeed.
            self.csw_base |= self.sprot;
            self.keep_sprot = true;
        } else {
            self.csw_base &= !self.sprot;
            self.keep_sprot = false;
        }
    }

    /// The CSW value written to find out whether `size` with packed increment sticks.
    pub fn size_probe_value(&self, size: DataSize) -> u32 {
        self.csw_base | size as u32 | csw::PADDRINC
    }

    /// Record the CSW read back after writing [`ApContext::size_probe_value`].
    pub fn record_size_probe(&mut self, size: DataSize, readback: u32) {
        if readback & csw::SIZE == size as u32 {
            self.access_sizes |= AccessSizes::from(size);
        }
        if readback & csw::ADDRINC == csw::NADDRINC {
            self.packed = false;
        }
    }

    /// The CSW value for a transfer of `size` with the given increment mode.
    pub fn csw_value(&self, size: DataSize, increment: AddressIncrement) -> u32 {
        let increment = match increment {
            AddressIncrement::Packed if !self.packed => AddressIncrement::Single,
            other => other,
        };

        (self.csw_base | size as u32 | ((increment as u32) << 4)) & self.rw_bits
    }

    /// Update the SPROT bit of the CSW base for the requested security type.
    pub fn apply_security(&mut self, security: SecurityType) {
        match security {
            SecurityType::Any if self.keep_sprot => {}
            SecurityType::Any | SecurityType::Secure | SecurityType::Cpu => {
                self.csw_base &= !self.sprot;
            }
            SecurityType::NonSecure => self.csw_base |= self.sprot,
        }
    }

    pub fn check_size(&self, size: DataSize) -> Result<(), ArmError> {
        if self.access_sizes.supports(size) {
            Ok(())
        } else {
            Err(ArmError::UnsupportedAccessSize(size))
        }
    }
}

/// One [`ApContext`] per (DP, AP) pair.
#[derive(Debug, Clone)]
pub struct ApContextTable {
    contexts: Vec<ApContext>,
}

impl Default for ApContextTable {
    fn default() -> Self {
        Self {
            contexts: vec![ApContext::default(); MAX_DPS * MAX_APS],
        }
    }
}

impl ApContextTable {
    fn index(dp: usize, ap: usize) -> Result<usize, ArmError> {
        if dp >= MAX_DPS || ap >= MAX_APS {
            return Err(ArmError::InvalidAccessPort { dp, ap });
        }

        Ok(dp * MAX_APS + ap)
    }

    pub fn get(&self, dp: usize, ap: usize) -> Result<&ApContext, ArmError> {
        Ok(&self.contexts[Self::index(dp, ap)?])
    }

    pub fn get_mut(&mut self, dp: usize, ap: usize) -> Result<&mut ApContext, ArmError> {
        let index = Self::index(dp, ap)?;
        Ok(&mut self.contexts[index])
    }

    /// Forget everything, the next access to any AP probes it again.
    pub fn reset(&mut self) {
        self.contexts.fill(ApContext::default());
    }

    /// Forget the CSW values written so far, without dropping the probe results.
    pub(crate) fn invalidate_csw(&mut self) {
        for ctx in &mut self.contexts {
            ctx.last_csw = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test]
    fn cortex_m_ahb_ap_keeps_defaults() {
        let mut ctx = ApContext::default();
        let plan = ctx.classify(0x2477_0011);

        assert!(ctx.is_probed());
        assert_eq!(
            plan,
            ProbePlan {
                spiden: false,
                sizes: true
            }
        );
        assert_eq!(ctx.csw_base, csw::DEFAULT_BASE);
        assert!(!ctx.keep_sprot);
    }

    #[test]
    fn apb_ap_is_word_only() {
        let mut ctx = ApContext::default();
        let plan = ctx.classify(0x4477_0002);

        assert!(!plan.sizes);
        assert!(!ctx.packed);
        assert_eq!(ctx.access_sizes, AccessSizes::WORD);
        assert_eq!(
            ctx.csw_value(DataSize::U32, AddressIncrement::Packed),
            csw::DBGSWENABLE | csw::SIZE32 | csw::SADDRINC
        );
    }

    #[test]
    fn axi_ap_moves_sprot() {
        let mut ctx = ApContext::default();
        let plan = ctx.classify(0x4477_0004);
        assert!(plan.spiden);

        assert_eq!(ctx.sprot, csw::AXI_SPROT);
        assert_eq!(
            ctx.csw_base,
            csw::DBGSTAT | csw::AXI_PRIV | csw::AXI_DOM_SHSYS
        );
        ctx.apply_security(SecurityType::NonSecure);
        assert_eq!(ctx.csw_base & csw::AXI_SPROT, csw::AXI_SPROT);
        assert_eq!(ctx.csw_base & csw::SPROT, 0);
    }

    #[test_case(0, true; "secure debug disabled")]
    #[test_case(csw::SPIDEN, false; "secure debug enabled")]
    fn coresight_ahb_spiden(readback: u32, pinned: bool) {
        let mut ctx = ApContext::default();
        let plan = ctx.classify(0x0477_0001);
        assert!(plan.spiden);
        assert_eq!(ctx.csw_base & csw::MSTRDBG, 0);

        ctx.apply_spiden(readback);
        assert_eq!(ctx.keep_sprot, pinned);
        assert_eq!(ctx.csw_base & csw::SPROT != 0, pinned);
    }

    #[test_case(false, SecurityType::Any, 0; "any clears")]
    #[test_case(true, SecurityType::Any, csw::SPROT; "any keeps pinned")]
    #[test_case(true, SecurityType::Secure, 0; "secure overrides pin")]
    #[test_case(false, SecurityType::Cpu, 0; "cpu is secure")]
    #[test_case(false, SecurityType::NonSecure, csw::SPROT; "non-secure sets")]
    fn security_update(keep: bool, security: SecurityType, expected: u32) {
        let mut ctx = ApContext {
            csw_base: csw::DEFAULT_BASE | csw::SPROT,
            keep_sprot: keep,
            ..Default::default()
        };

        ctx.apply_security(security);
        assert_eq!(ctx.csw_base & csw::SPROT, expected);
    }

    #[test]
    fn size_probe_trusts_readback() {
        let mut ctx = ApContext::default();
        ctx.record_size_probe(DataSize::U8, csw::DEFAULT_BASE | csw::SIZE32 | csw::PADDRINC);
        ctx.record_size_probe(DataSize::U16, csw::DEFAULT_BASE | csw::SIZE16);

        assert_eq!(ctx.access_sizes, AccessSizes::WORD | AccessSizes::HWORD);
        assert!(!ctx.packed);
        assert!(ctx.check_size(DataSize::U8).is_err());
    }

    #[test]
    fn table_bounds() {
        let mut table = ApContextTable::default();
        table.get_mut(63, 31).unwrap().id = 1;
        assert!(table.get(63, 31).unwrap().is_probed());
        assert!(matches!(
            table.get(64, 0),
            Err(ArmError::InvalidAccessPort { dp: 64, ap: 0 })
        ));

        table.reset();
        assert!(!table.get(63, 31).unwrap().is_probed());
    }
}
