//! Cortex-M core debug registers and CPU identification.

use bitfield::bitfield;

use super::MemoryMappedRegister;
use crate::architecture::arm::ap::csw;
use crate::architecture::arm::communication_interface::{ArmCommunicationInterface, DapInterface};
use crate::architecture::arm::memory::AccessAttributes;
use crate::architecture::arm::ArmError;

/// Address of DHCSR, the first register of the core debug block.
pub const DHCSR_ADDRESS: u32 = 0xE000_EDF0;

/// Written to DHCSR[31:16] to unlock writes to the control bits.
pub const DBGKEY: u32 = 0xA05F_0000;

bitfield! {
    /// Debug Halting Control and Status Register, DHCSR
    #[derive(Copy, Clone)]
    pub struct Dhcsr(u32);
    impl Debug;
    pub s_reset_st, _: 25;
    pub s_retire_st, _: 24;
    pub s_lockup, _: 19;
    pub s_sleep, _: 18;
    pub s_halt, _: 17;
    pub s_regrdy, _: 16;
    pub c_maskints, set_c_maskints: 3;
    pub c_step, set_c_step: 2;
    pub c_halt, set_c_halt: 1;
    pub c_debugen, set_c_debugen: 0;
}

impl Dhcsr {
    /// Set the debug key so the write is not ignored.
    pub fn enable_write(&mut self) {
        self.0 &= !(0xffff << 16);
        self.0 |= DBGKEY;
    }
}

impl From<u32> for Dhcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dhcsr> for u32 {
    fn from(value: Dhcsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dhcsr {
    const ADDRESS: u32 = DHCSR_ADDRESS;
    const NAME: &'static str = "DHCSR";
}

bitfield! {
    /// Debug Core Register Selector Register, DCRSR
    #[derive(Copy, Clone)]
    pub struct Dcrsr(u32);
    impl Debug;
    pub _, set_regwnr: 16;
    pub u8, _, set_regsel: 6, 0;
}

impl From<u32> for Dcrsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcrsr> for u32 {
    fn from(value: Dcrsr) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Dcrsr {
    const ADDRESS: u32 = 0xE000_EDF4;
    const NAME: &'static str = "DCRSR";
}

bitfield! {
    /// CPUID Base Register
    #[derive(Copy, Clone)]
    pub struct Cpuid(u32);
    impl Debug;
    pub u8, implementer, _: 31, 24;
    pub u8, variant, _: 23, 20;
    pub u16, partno, _: 15, 4;
    pub u8, revision, _: 3, 0;
}

impl From<u32> for Cpuid {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Cpuid> for u32 {
    fn from(value: Cpuid) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Cpuid {
    const ADDRESS: u32 = 0xE000_ED00;
    const NAME: &'static str = "CPUID";
}

bitfield! {
    /// Media and VFP Feature Register 0, MVFR0
    #[derive(Copy, Clone)]
    pub struct Mvfr0(u32);
    impl Debug;
    pub u8, double_precision, _: 11, 8;
    pub u8, single_precision, _: 7, 4;
    pub u8, simd_registers, _: 3, 0;
}

impl Mvfr0 {
    pub fn fpu_present(&self) -> bool {
        self.single_precision() != 0 || self.double_precision() != 0
    }
}

impl From<u32> for Mvfr0 {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Mvfr0> for u32 {
    fn from(value: Mvfr0) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for Mvfr0 {
    const ADDRESS: u32 = 0xE000_EF40;
    const NAME: &'static str = "MVFR0";
}

bitfield! {
    /// Debug Authentication Status Register, DAUTHSTATUS
    #[derive(Copy, Clone)]
    pub struct DauthStatus(u32);
    impl Debug;
    /// Secure non-invasive debug.
    pub u8, snid, _: 7, 6;
    /// Secure invasive debug.
    pub u8, sid, _: 5, 4;
    pub u8, nsnid, _: 3, 2;
    pub u8, nsid, _: 1, 0;
}

impl From<u32> for DauthStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DauthStatus> for u32 {
    fn from(value: DauthStatus) -> Self {
        value.0
    }
}

impl MemoryMappedRegister for DauthStatus {
    const ADDRESS: u32 = 0xE000_EFB8;
    const NAME: &'static str = "DAUTHSTATUS";
}

/// The Cortex-M implementations this crate can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuModel {
    M0,
    M0Plus,
    M1,
    SC000,
    M3,
    SC300,
    M4,
    M7,
    M23,
    M33,
    M35P,
}

impl CpuModel {
    /// Identify the CPU from the implementer and part number fields of CPUID.
    pub fn from_cpuid(cpuid: u32) -> Option<Self> {
        let model = match cpuid & 0xFF00_FFF0 {
            0x4100_C200 => CpuModel::M0,
            0x4100_C600 => CpuModel::M0Plus,
            0x4100_C210 => CpuModel::M1,
            0x4100_C300 => CpuModel::SC000,
            0x4100_C230 => CpuModel::M3,
            0x4100_C330 => CpuModel::SC300,
            0x4100_C240 => CpuModel::M4,
            0x4100_C270 => CpuModel::M7,
            0x4100_D200 => CpuModel::M23,
            0x4100_D210 => CpuModel::M33,
            0x4100_D310 => CpuModel::M35P,
            _ => return None,
        };

        Some(model)
    }

    /// Size of the TAR auto-increment page of the AP in front of this CPU.
    pub fn rw_page(&self) -> u32 {
        match self {
            CpuModel::M3 | CpuModel::SC300 | CpuModel::M4 => 0x1000,
            _ => 0x400,
        }
    }

    pub fn is_v8m(&self) -> bool {
        matches!(self, CpuModel::M23 | CpuModel::M33 | CpuModel::M35P)
    }

    /// Debugger accesses must be cacheable to stay coherent with the data cache.
    pub fn has_data_cache(&self) -> bool {
        matches!(self, CpuModel::M7 | CpuModel::M35P)
    }
}

/// What was learned about the CPU when the session connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub model: CpuModel,
    pub cpuid: u32,
    pub fpu: bool,
    /// The CPU implements the ARMv8-M security extension.
    pub security_extensions: bool,
}

impl DapInterface {
    /// Identify the CPU behind the CPU AP and adjust the AP context to it.
    pub fn detect_cpu(&mut self) -> Result<CpuInfo, ArmError> {
        self.select_cpu_ap()?;
        let attributes = AccessAttributes::default();

        let cpuid = self.read_32(Cpuid::ADDRESS, attributes)?;
        let model = CpuModel::from_cpuid(cpuid).ok_or(ArmError::UnsupportedCpu(cpuid))?;

        // Cores without an FPU may fault on MVFR0.
        let fpu = match self.read_32(Mvfr0::ADDRESS, attributes) {
            Ok(value) => Mvfr0::from(value).fpu_present(),
            Err(e) if e.is_memory_error() => false,
            Err(e) => return Err(e),
        };

        let security_extensions = if model.is_v8m() {
            match self.read_32(DauthStatus::ADDRESS, attributes) {
                Ok(value) => DauthStatus::from(value).sid() != 0,
                Err(e) if e.is_memory_error() => {
                    tracing::warn!("Failed to read DAUTHSTATUS, assuming no security extension");
                    false
                }
                Err(e) => return Err(e),
            }
        } else {
            false
        };

        self.check_sticky()?;

        let info = CpuInfo {
            model,
            cpuid,
            fpu,
            security_extensions,
        };
        tracing::info!("Detected {:?}", info);

        if model.has_data_cache() {
            let ctx = self.ap_current_ctx_mut()?;
            ctx.csw_base |= csw::HPROT_CACHE;
            ctx.last_csw = None;
        }

        self.cpu = Some(info);

        Ok(info)
    }
}

impl ArmCommunicationInterface {
    pub fn detect_cpu(&self) -> Result<CpuInfo, ArmError> {
        self.transaction(|interface| interface.detect_cpu())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0x410C_C200, CpuModel::M0, 0x400; "m0")]
    #[test_case(0x410C_C601, CpuModel::M0Plus, 0x400; "m0 plus")]
    #[test_case(0x412F_C230, CpuModel::M3, 0x1000; "m3 r2p0")]
    #[test_case(0x410F_C241, CpuModel::M4, 0x1000; "m4 r0p1")]
    #[test_case(0x411F_C272, CpuModel::M7, 0x400; "m7")]
    #[test_case(0x410F_D213, CpuModel::M33, 0x400; "m33")]
    fn cpuid_decoding(cpuid: u32, model: CpuModel, page: u32) {
        let detected = CpuModel::from_cpuid(cpuid).unwrap();
        assert_eq!(detected, model);
        assert_eq!(detected.rw_page(), page);
    }

    #[test]
    fn unknown_cpuid() {
        // Cortex-A9
        assert_eq!(CpuModel::from_cpuid(0x413F_C090), None);
    }

    #[test]
    fn dhcsr_key() {
        let mut dhcsr = Dhcsr::from(0x0003_0003);
        dhcsr.enable_write();
        dhcsr.set_c_halt(false);
        assert_eq!(u32::from(dhcsr), 0xA05F_0001);
    }
}
