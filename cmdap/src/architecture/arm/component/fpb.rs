//! Flash Patch and Breakpoint unit.

use bitfield::bitfield;

use crate::architecture::arm::memory::MemoryInterface;
use crate::architecture::arm::ArmError;

bitfield! {
    /// Flash Patch Control Register, FP_CTRL
    #[derive(Copy, Clone)]
    pub struct FpCtrl(u32);
    impl Debug;
    /// `0`: version 1, code region only. `1`: version 2, full address space.
    pub u8, rev, _: 31, 28;
    num_code_1, _: 14, 12;
    pub num_lit, _: 11, 8;
    num_code_0, _: 7, 4;
    pub _, set_key: 1;
    pub enable, set_enable: 0;
}

impl FpCtrl {
    /// The number of instruction address comparators.
    pub fn num_code(&self) -> u32 {
        (self.num_code_1() << 4) | self.num_code_0()
    }
}

impl From<u32> for FpCtrl {
    fn from(value: u32) -> Self {
        FpCtrl(value)
    }
}

impl From<FpCtrl> for u32 {
    fn from(value: FpCtrl) -> Self {
        value.0
    }
}

/// Breakpoint capabilities of the FPB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FpbInfo {
    pub revision: u8,
    pub num_code: u16,
    pub num_lit: u16,
}

impl FpbInfo {
    /// Revision 2 units can break anywhere, revision 1 only below 0x2000_0000.
    pub fn full_address_space(&self) -> bool {
        self.revision > 0
    }

    /// Revision 1 comparators match a word and break on either of its half-words.
    pub fn linked_half_words(&self) -> bool {
        !self.full_address_space()
    }
}

/// Read the breakpoint capabilities of the FPB at `base`.
///
/// A target without an FPB has no breakpoint comparators.
pub fn detect_fpb(memory: &mut dyn MemoryInterface, base: Option<u32>) -> Result<FpbInfo, ArmError> {
    let Some(base) = base else {
        return Ok(FpbInfo::default());
    };

    let ctrl = FpCtrl::from(memory.read_word_32(base)?);

    let info = FpbInfo {
        revision: ctrl.rev(),
        num_code: ctrl.num_code() as u16,
        num_lit: ctrl.num_lit() as u16,
    };
    tracing::info!(
        "FPB revision {}: {} code and {} literal comparators",
        info.revision,
        info.num_code,
        info.num_lit
    );

    Ok(info)
}
