//! Data Watchpoint and Trace unit.
//!
//! The comparator capabilities are not advertised in one register. ARMv8-M describes each
//! comparator in the ID field of its FUNCTION register, older units have to be probed by
//! writing a match type and reading back what stuck.

use bitfield::bitfield;

use crate::architecture::arm::memory::MemoryInterface;
use crate::architecture::arm::ArmError;

bitfield! {
    /// DWT Control Register, DWT_CTRL
    #[derive(Copy, Clone)]
    pub struct DwtCtrl(u32);
    impl Debug;
    pub u8, numcomp, _: 31, 28;
    pub notrcpkt, _: 27;
    pub noexttrig, _: 26;
    pub nocyccnt, _: 25;
    pub noprfcnt, _: 24;
    pub cyccntena, set_cyccntena: 0;
}

impl From<u32> for DwtCtrl {
    fn from(value: u32) -> Self {
        DwtCtrl(value)
    }
}

impl From<DwtCtrl> for u32 {
    fn from(value: DwtCtrl) -> Self {
        value.0
    }
}

bitfield! {
    /// DWT Comparator Function Register, DWT_FUNCTIONn
    ///
    /// The field layout differs between ARMv6/7-M and ARMv8-M, only the common match flag
    /// and the ARMv8-M capability bits are named here.
    #[derive(Copy, Clone)]
    pub struct DwtFunction(u32);
    impl Debug;
    pub matched, _: 24;
    /// ARMv8-M: the comparator can act as the limit of an address range.
    pub id_limit, _: 31;
    pub id_daddr, _: 30;
    /// ARMv8-M: the comparator can match data values.
    pub id_dval, _: 29;
    pub id_iaddr, _: 28;
    pub id_cyccnt, _: 27;
}

impl From<u32> for DwtFunction {
    fn from(value: u32) -> Self {
        DwtFunction(value)
    }
}

impl From<DwtFunction> for u32 {
    fn from(value: DwtFunction) -> Self {
        value.0
    }
}

/// ARMv6/7-M FUNCTION bits used to probe comparator capabilities.
pub mod legacy_function {
    pub const DISABLED: u32 = 0;
    pub const CYCMATCH: u32 = 0x0000_0080;
    pub const DATAVMATCH: u32 = 0x0000_0100;
    /// Read-only: the comparator can be the second link of a data value match.
    pub const LNK1ENA: u32 = 0x0000_0200;
}

/// Largest value of the MASK field.
pub const MASK_MAX: u32 = 0x1F;

/// Assumed mask width when the MASK register cannot be probed.
const FALLBACK_MASK_BITS: u32 = 0x0F;

pub fn mask_address(base: u32, n: u32) -> u32 {
    base + 0x24 + 16 * n
}

pub fn function_address(base: u32, n: u32) -> u32 {
    base + 0x28 + 16 * n
}

/// Comparator capabilities of the DWT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DwtInfo {
    pub num_comps: u32,
    /// Comparators able to match data values.
    pub value_comps: u32,
    /// ARMv6/7-M: comparators able to link a second data value match.
    pub link2nd_comps: u32,
    /// ARMv8-M: comparators able to be the upper limit of a range.
    pub limit_comps: u32,
    /// ARMv8-M: comparators able to link to the previous one.
    pub link_comps: u32,
    pub cycle_comps: u32,
    /// ARMv6/7-M: number of writable MASK bits.
    pub max_mask_bits: u32,
}

/// Read the watchpoint capabilities of the DWT at `base`.
///
/// A comparator that cannot be inspected is logged and counted as having no extra
/// capabilities, only a failure to read DWT_CTRL aborts the detection.
pub fn detect_dwt(
    memory: &mut dyn MemoryInterface,
    base: Option<u32>,
    v8m: bool,
) -> Result<DwtInfo, ArmError> {
    let Some(base) = base else {
        return Ok(DwtInfo::default());
    };

    let ctrl = DwtCtrl::from(memory.read_word_32(base)?);
    let mut info = DwtInfo {
        num_comps: ctrl.numcomp() as u32,
        ..Default::default()
    };

    if v8m {
        detect_v8m(memory, base, &mut info);
    } else {
        detect_legacy(memory, base, &mut info);
    }

    tracing::info!("DWT: {:?}", info);

    Ok(info)
}

fn detect_v8m(memory: &mut dyn MemoryInterface, base: u32, info: &mut DwtInfo) {
    for n in 0..info.num_comps {
        let function = match memory.read_word_32(function_address(base, n)) {
            Ok(value) => DwtFunction::from(value),
            Err(e) => {
                tracing::warn!("Failed to read DWT_FUNCTION{}: {}", n, e);
                continue;
            }
        };

        // Comparator 0 has nothing to link to.
        if n > 0 {
            if function.id_limit() {
                info.limit_comps += 1;
            }
            if function.id_dval() {
                info.value_comps += 1;
            }
            if function.id_limit() || function.id_dval() {
                info.link_comps += 1;
            }
        }
        if function.id_cyccnt() {
            info.cycle_comps += 1;
        }
    }
}

fn detect_legacy(memory: &mut dyn MemoryInterface, base: u32, info: &mut DwtInfo) {
    if info.num_comps == 0 {
        return;
    }

    info.max_mask_bits = match probe_mask_bits(memory, base) {
        Ok(bits) => bits,
        Err(e) => {
            tracing::warn!("Failed to probe DWT_MASK0, assuming {} bits: {}", FALLBACK_MASK_BITS, e);
            FALLBACK_MASK_BITS
        }
    };

    for n in 0..info.num_comps {
        if let Err(e) = probe_legacy_comparator(memory, base, n, info) {
            tracing::warn!("Failed to probe DWT comparator {}: {}", n, e);
        }
    }
}

fn probe_mask_bits(memory: &mut dyn MemoryInterface, base: u32) -> Result<u32, ArmError> {
    let mask = mask_address(base, 0);
    memory.write_word_32(mask, MASK_MAX)?;
    let bits = memory.read_word_32(mask)? & MASK_MAX;
    memory.write_word_32(mask, 0)?;
    Ok(bits)
}

fn probe_legacy_comparator(
    memory: &mut dyn MemoryInterface,
    base: u32,
    n: u32,
    info: &mut DwtInfo,
) -> Result<(), ArmError> {
    let function = function_address(base, n);

    memory.write_word_32(function, legacy_function::DATAVMATCH)?;
    let readback = memory.read_word_32(function)?;
    if readback & legacy_function::DATAVMATCH != 0 {
        info.value_comps += 1;
    }
    if readback & legacy_function::LNK1ENA != 0 {
        info.link2nd_comps += 1;
    }

    memory.write_word_32(function, legacy_function::CYCMATCH)?;
    if memory.read_word_32(function)? & legacy_function::CYCMATCH != 0 {
        info.cycle_comps += 1;
    }

    memory.write_word_32(function, legacy_function::DISABLED)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::arm::DapError;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    const BASE: u32 = 0xE000_1000;

    /// A DWT that only keeps the FUNCTION bits its comparators implement.
    struct FakeDwt {
        registers: HashMap<u32, u32>,
        function_masks: Vec<u32>,
        mask_bits: u32,
        broken: Option<u32>,
    }

    impl FakeDwt {
        fn new(ctrl: u32, function_masks: Vec<u32>) -> Self {
            let mut registers = HashMap::new();
            registers.insert(BASE, ctrl);
            Self {
                registers,
                function_masks,
                mask_bits: MASK_MAX,
                broken: None,
            }
        }

        fn comparator_of(address: u32) -> Option<u32> {
            let offset = address.checked_sub(BASE + 0x20)?;
            Some(offset / 16)
        }
    }

    impl MemoryInterface for FakeDwt {
        fn read_word_32(&mut self, address: u32) -> Result<u32, ArmError> {
            if Some(address) == self.broken {
                return Err(ArmError::MemoryFault);
            }
            Ok(self.registers.get(&address).copied().unwrap_or(0))
        }

        fn write_word_32(&mut self, address: u32, data: u32) -> Result<(), ArmError> {
            if Some(address) == self.broken {
                return Err(ArmError::MemoryFault);
            }
            let value = match Self::comparator_of(address) {
                Some(n) if (address - BASE) % 16 == 8 => {
                    let implemented = self.function_masks[n as usize];
                    (data & implemented) | (implemented & legacy_function::LNK1ENA)
                }
                Some(_) if (address - BASE) % 16 == 4 => data & self.mask_bits,
                _ => data,
            };
            self.registers.insert(address, value);
            Ok(())
        }

        fn read_word_16(&mut self, _address: u32) -> Result<u16, ArmError> {
            Err(ArmError::Dap(DapError::Failure))
        }

        fn write_word_16(&mut self, _address: u32, _data: u16) -> Result<(), ArmError> {
            Err(ArmError::Dap(DapError::Failure))
        }

        fn read_word_8(&mut self, _address: u32) -> Result<u8, ArmError> {
            Err(ArmError::Dap(DapError::Failure))
        }

        fn write_word_8(&mut self, _address: u32, _data: u8) -> Result<(), ArmError> {
            Err(ArmError::Dap(DapError::Failure))
        }
    }

    #[test]
    fn absent_dwt() {
        let mut dwt = FakeDwt::new(0, vec![]);
        assert_eq!(detect_dwt(&mut dwt, None, false).unwrap(), DwtInfo::default());
    }

    #[test]
    fn cortex_m3_comparators() {
        // Comparator 0 counts cycles, comparator 1 matches values and links a second match.
        let all = legacy_function::CYCMATCH | legacy_function::DATAVMATCH;
        let mut dwt = FakeDwt::new(
            0x4000_0000,
            vec![legacy_function::CYCMATCH, all | legacy_function::LNK1ENA, 0xF, 0xF],
        );
        dwt.mask_bits = 0x1F;

        let info = detect_dwt(&mut dwt, Some(BASE), false).unwrap();
        assert_eq!(
            info,
            DwtInfo {
                num_comps: 4,
                value_comps: 1,
                link2nd_comps: 1,
                limit_comps: 0,
                link_comps: 0,
                cycle_comps: 2,
                max_mask_bits: 0x1F,
            }
        );

        // Every comparator is left disabled and MASK0 cleared.
        for n in 0..4 {
            let function = dwt.registers[&function_address(BASE, n)];
            assert_eq!(function & !legacy_function::LNK1ENA, 0);
        }
        assert_eq!(dwt.registers[&mask_address(BASE, 0)], 0);
    }

    #[test]
    fn small_mask_is_probed() {
        let mut dwt = FakeDwt::new(0x2000_0000, vec![0, 0]);
        dwt.mask_bits = 0x0A;

        let info = detect_dwt(&mut dwt, Some(BASE), false).unwrap();
        assert_eq!(info.max_mask_bits, 0x0A);
    }

    #[test]
    fn mask_probe_failure_falls_back() {
        let mut dwt = FakeDwt::new(0x1000_0000, vec![legacy_function::DATAVMATCH]);
        dwt.broken = Some(mask_address(BASE, 0));

        let info = detect_dwt(&mut dwt, Some(BASE), false).unwrap();
        assert_eq!(info.max_mask_bits, FALLBACK_MASK_BITS);
        assert_eq!(info.value_comps, 1);
    }

    #[test]
    fn v8m_function_ids() {
        let mut dwt = FakeDwt::new(0x4000_0000, vec![0; 4]);
        // Cortex-M33 style: 0 cycle/address, 1 value+limit, 2 address, 3 value+limit
        dwt.registers.insert(function_address(BASE, 0), 0x5800_0000);
        dwt.registers.insert(function_address(BASE, 1), 0xF000_0000);
        dwt.registers.insert(function_address(BASE, 2), 0x5000_0000);
        dwt.registers.insert(function_address(BASE, 3), 0xF000_0000);

        let info = detect_dwt(&mut dwt, Some(BASE), true).unwrap();
        assert_eq!(info.num_comps, 4);
        assert_eq!(info.value_comps, 2);
        assert_eq!(info.limit_comps, 2);
        assert_eq!(info.link_comps, 2);
        assert_eq!(info.cycle_comps, 1);
        assert_eq!(info.link2nd_comps, 0);
    }

    #[test]
    fn v8m_comparator_zero_never_links() {
        let mut dwt = FakeDwt::new(0x1000_0000, vec![0]);
        dwt.registers.insert(function_address(BASE, 0), 0xF800_0000);

        let info = detect_dwt(&mut dwt, Some(BASE), true).unwrap();
        assert_eq!(info.value_comps, 0);
        assert_eq!(info.limit_comps, 0);
        assert_eq!(info.link_comps, 0);
        assert_eq!(info.cycle_comps, 1);
    }

    #[test]
    fn v8m_unreadable_comparator_is_skipped() {
        let mut dwt = FakeDwt::new(0x2000_0000, vec![0; 2]);
        dwt.registers.insert(function_address(BASE, 1), 0x2000_0000);
        dwt.broken = Some(function_address(BASE, 1));

        let info = detect_dwt(&mut dwt, Some(BASE), true).unwrap();
        assert_eq!(info.num_comps, 2);
        assert_eq!(info.value_comps, 0);
    }

    #[test]
    fn unreadable_ctrl_fails() {
        let mut dwt = FakeDwt::new(0, vec![]);
        dwt.broken = Some(BASE);
        assert!(detect_dwt(&mut dwt, Some(BASE), false).is_err());
    }
}
