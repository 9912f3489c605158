//! Core register access through the debug core register selector.

pub mod cortex_m;

use super::ap::{DataSize, BD0, BD1, BD2, TAR};
use super::communication_interface::{ArmCommunicationInterface, DapInterface};
use super::memory::AccessAttributes;
use super::{ArmError, Register};

pub use cortex_m::{CpuInfo, CpuModel, Dcrsr, Dhcsr, DBGKEY, DHCSR_ADDRESS};

/// A register at a fixed address of the target memory map.
pub trait MemoryMappedRegister: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    const ADDRESS: u32;
    const NAME: &'static str;
}

/// Number of logical core registers a register mask can select.
pub const NUM_REGISTERS: usize = 64;

pub const R0: usize = 0;
pub const R9: usize = 9;
pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;
pub const XPSR: usize = 16;
pub const FPSCR: usize = 31;
/// First single precision FPU register, S0..S31 follow.
pub const S0: usize = 32;

/// Registers written before a debugger injected call: R0..R3, R9, SP, LR, PC and xPSR.
pub const SYSCALL_MASK: u64 = 0x0001_E20F;

/// First security banked register, MSP_NS. SYS_NS at 30 is the last one.
pub const MSP_NS: usize = 21;
/// Combined CONTROL, FAULTMASK, BASEPRI and PRIMASK of the secure state.
pub const SYS_S: usize = 29;

/// The DCRSR REGSEL value of logical register `n`.
///
/// Bit 19 of a register mask is reserved. The security banked registers only exist on ARMv8-M.
pub fn register_selector(n: usize, v8m: bool) -> Option<u8> {
    match n {
        0..=18 | 20 => Some(n as u8),
        MSP_NS..=28 if v8m => Some((0x18 + (n - MSP_NS)) as u8),
        SYS_S | 30 if v8m => Some((0x22 + (n - SYS_S)) as u8),
        FPSCR => Some(0x21),
        S0..=63 => Some((0x40 + (n - S0)) as u8),
        _ => None,
    }
}

/// Values of the logical core registers, indexed like a register mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    values: [u32; NUM_REGISTERS],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            values: [0; NUM_REGISTERS],
        }
    }
}

impl std::ops::Index<usize> for RegisterFile {
    type Output = u32;

    fn index(&self, index: usize) -> &Self::Output {
        &self.values[index]
    }
}

impl std::ops::IndexMut<usize> for RegisterFile {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.values[index]
    }
}

/// The registers selected by `mask` with their selectors. Fails on the first bit without one.
fn selected(mask: u64, v8m: bool) -> Result<Vec<(usize, u8)>, ArmError> {
    (0..NUM_REGISTERS)
        .filter(|n| mask & (1 << n) != 0)
        .map(|n| {
            register_selector(n, v8m)
                .map(|sel| (n, sel))
                .ok_or(ArmError::InvalidCoreRegister(n))
        })
        .collect()
}

impl DapInterface {
    /// Point TAR at the core debug block, so BD0..BD2 map to DHCSR, DCRSR and DCRDR.
    fn open_core_debug_window(&mut self) -> Result<(), ArmError> {
        self.select_cpu_ap()?;
        self.prepare_transfer(DataSize::U32, AccessAttributes::default())?;
        self.write_ap(TAR::ADDRESS, self.dbg_addr)
    }

    fn wait_register_ready(&mut self) -> Result<(), ArmError> {
        for _ in 0..self.register_poll_retries {
            let dhcsr = Dhcsr::from(self.read_ap(BD0::ADDRESS)?);
            if dhcsr.s_regrdy() {
                return Ok(());
            }
        }

        tracing::warn!("Core register transfer did not complete");
        Err(ArmError::RegisterTransferTimeout)
    }

    /// Read the core registers selected by `mask` into `registers`.
    ///
    /// Bit `n` of the mask selects logical register `n`. A selected register the CPU does not
    /// have fails the whole request before anything is transferred.
    pub fn get_arm_regs(&mut self, mask: u64, registers: &mut RegisterFile) -> Result<(), ArmError> {
        if mask == 0 {
            return Err(ArmError::EmptyRegisterMask);
        }
        let selection = selected(mask, self.is_v8m())?;

        let _suspend = self.suspend_monitor(self.dbg_addr, 12);
        self.open_core_debug_window()?;

        for (n, sel) in selection {
            let mut dcrsr = Dcrsr::from(0);
            dcrsr.set_regsel(sel);
            self.write_ap(BD1::ADDRESS, dcrsr.into())?;
            self.wait_register_ready()?;
            registers[n] = self.read_ap(BD2::ADDRESS)?;
        }

        self.flush()?;
        self.check_sticky()
    }

    /// Write the core registers selected by `mask` from `registers`.
    pub fn set_arm_regs(&mut self, mask: u64, registers: &RegisterFile) -> Result<(), ArmError> {
        if mask == 0 {
            return Err(ArmError::EmptyRegisterMask);
        }
        let selection = selected(mask, self.is_v8m())?;

        let _suspend = self.suspend_monitor(self.dbg_addr, 12);
        self.open_core_debug_window()?;

        for (n, sel) in selection {
            let mut dcrsr = Dcrsr::from(0);
            dcrsr.set_regsel(sel);
            dcrsr.set_regwnr(true);

            self.write_ap(BD2::ADDRESS, registers[n])?;
            self.write_ap(BD1::ADDRESS, dcrsr.into())?;
            self.wait_register_ready()?;
        }

        self.flush()?;
        self.check_sticky()
    }

    pub fn read_core_register(&mut self, n: usize) -> Result<u32, ArmError> {
        if register_selector(n, self.is_v8m()).is_none() {
            return Err(ArmError::InvalidCoreRegister(n));
        }

        let mut registers = RegisterFile::default();
        self.get_arm_regs(1 << n, &mut registers)?;
        Ok(registers[n])
    }

    pub fn write_core_register(&mut self, n: usize, value: u32) -> Result<(), ArmError> {
        if register_selector(n, self.is_v8m()).is_none() {
            return Err(ArmError::InvalidCoreRegister(n));
        }

        let mut registers = RegisterFile::default();
        registers[n] = value;
        self.set_arm_regs(1 << n, &registers)
    }

    /// Start a debugger injected call.
    ///
    /// Loads the argument, stack and return registers and lets the core run. The caller
    /// waits for the core to halt again and fetches the result with
    /// [`DapInterface::syscall_result`].
    pub fn syscall_exec(&mut self, registers: &RegisterFile) -> Result<(), ArmError> {
        self.set_arm_regs(SYSCALL_MASK, registers)?;

        let mut dhcsr = Dhcsr::from(0);
        dhcsr.enable_write();
        dhcsr.set_c_debugen(true);

        tracing::debug!("Starting call at {:#010x}", registers[PC]);
        self.write_32(self.dbg_addr, dhcsr.into(), AccessAttributes::default())?;
        self.check_sticky()
    }

    /// The return value of the last injected call.
    pub fn syscall_result(&mut self) -> Result<u32, ArmError> {
        self.read_core_register(R0)
    }
}

impl ArmCommunicationInterface {
    pub fn get_arm_regs(&self, mask: u64, registers: &mut RegisterFile) -> Result<(), ArmError> {
        self.transaction(|interface| interface.get_arm_regs(mask, registers))
    }

    pub fn set_arm_regs(&self, mask: u64, registers: &RegisterFile) -> Result<(), ArmError> {
        self.transaction(|interface| interface.set_arm_regs(mask, registers))
    }

    pub fn read_core_register(&self, n: usize) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.read_core_register(n))
    }

    pub fn write_core_register(&self, n: usize, value: u32) -> Result<(), ArmError> {
        self.transaction(|interface| interface.write_core_register(n, value))
    }

    pub fn syscall_exec(&self, registers: &RegisterFile) -> Result<(), ArmError> {
        self.transaction(|interface| interface.syscall_exec(registers))
    }

    pub fn syscall_result(&self) -> Result<u32, ArmError> {
        self.transaction(|interface| interface.syscall_result())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0, false, Some(0x00); "r0")]
    #[test_case(PC, false, Some(0x0F); "debug return address")]
    #[test_case(18, false, Some(0x12); "psp")]
    #[test_case(19, true, None; "reserved")]
    #[test_case(20, false, Some(0x14); "control")]
    #[test_case(MSP_NS, false, None; "banked without v8m")]
    #[test_case(MSP_NS, true, Some(0x18); "msp ns")]
    #[test_case(28, true, Some(0x1F); "psplim ns")]
    #[test_case(SYS_S, true, Some(0x22); "sys s")]
    #[test_case(30, true, Some(0x23); "sys ns")]
    #[test_case(FPSCR, true, Some(0x21); "fpscr")]
    #[test_case(S0 + 31, false, Some(0x5F); "s31")]
    #[test_case(64, true, None; "out of range")]
    fn selector_mapping(n: usize, v8m: bool, expected: Option<u8>) {
        assert_eq!(register_selector(n, v8m), expected);
    }

    #[test]
    fn syscall_mask_covers_call_registers() {
        let registers: Vec<usize> = selected(SYSCALL_MASK, false)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(registers, vec![0, 1, 2, 3, R9, SP, LR, PC, XPSR]);
    }

    #[test]
    fn unknown_registers_fail_the_selection() {
        let banked = 0x7FE0_0000 | (1 << FPSCR);
        assert!(matches!(
            selected(banked, false),
            Err(ArmError::InvalidCoreRegister(MSP_NS))
        ));
        assert_eq!(selected(banked, true).unwrap().len(), 11);
        assert!(matches!(
            selected(1 << 19, true),
            Err(ArmError::InvalidCoreRegister(19))
        ));
    }
}
