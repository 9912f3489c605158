//! Software breakpoints.
//!
//! A software breakpoint replaces the instruction with `BKPT`. Whether that works at an
//! address is found out by writing the instruction and reading it back, and remembered.
//! Memory regions can be configured to never take software breakpoints, or to need a
//! particular access size for the test.

use serde::{Deserialize, Serialize};

use super::{Breakpoint, BreakpointManager};
use crate::architecture::arm::ap::AccessSizes;
use crate::architecture::arm::memory::MemoryInterface;
use crate::architecture::arm::ArmError;
use crate::ErrorKind;

/// `BKPT #0`
pub const BKPT_INSTRUCTION: u16 = 0xBE00;

/// The system region never holds code.
const SYSTEM_REGION: u32 = 0xE000_0000;

const MAX_ALIGNMENT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SwBreakEntry {
    address: u32,
    can_set: bool,
    valid: bool,
}

/// Addresses already tested for software breakpoints.
#[derive(Debug, Default)]
pub(super) struct SwBreakCache {
    entries: Vec<SwBreakEntry>,
}

impl SwBreakCache {
    pub fn lookup(&self, address: u32) -> Option<bool> {
        self.entries
            .iter()
            .find(|entry| entry.valid && entry.address == address)
            .map(|entry| entry.can_set)
    }

    pub fn record(&mut self, address: u32, can_set: bool) {
        match self.entries.iter_mut().find(|entry| entry.address == address) {
            Some(entry) => {
                entry.can_set = can_set;
                entry.valid = true;
            }
            None => self.entries.push(SwBreakEntry {
                address,
                can_set,
                valid: true,
            }),
        }
    }

    pub fn invalidate(&mut self, address: u32) {
        self.invalidate_range(address, address);
    }

    /// Forget the addresses in `start..=end`.
    pub fn invalidate_range(&mut self, start: u32, end: u32) {
        for entry in &mut self.entries {
            if (start..=end).contains(&entry.address) {
                entry.valid = false;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Known addresses.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| entry.valid).count()
    }

    pub fn dump(&self) {
        for entry in self.entries.iter().filter(|entry| entry.valid) {
            tracing::debug!(
                "  {:#010x}: software breakpoint {}",
                entry.address,
                if entry.can_set { "possible" } else { "impossible" }
            );
        }
    }
}

fn default_enable() -> bool {
    true
}

/// How software breakpoints behave in a memory region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwBreakConfigItem {
    /// Assigned when the item is added.
    #[serde(default)]
    pub id: u16,
    pub start: u32,
    /// Last address of the region.
    pub end: u32,
    /// Access size for writing the BKPT in bytes, 0 for the default half-word.
    #[serde(default)]
    pub access_size: u8,
    #[serde(default)]
    pub alignment: u32,
    /// Software breakpoints are allowed in the region.
    #[serde(default = "default_enable")]
    pub enable: bool,
}

impl SwBreakConfigItem {
    pub fn new(start: u32, end: u32, enable: bool) -> Self {
        Self {
            id: 0,
            start,
            end,
            access_size: 0,
            alignment: 0,
            enable,
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        (self.start..=self.end).contains(&address)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwBreakConfigError {
    #[error("Access size {0} is not supported by the memory AP")]
    AccessSize(u8),
    #[error("Alignment {0} is larger than 1024 bytes")]
    AlignmentTooLarge(u32),
    #[error("The region overlaps the configured region {start:#010x}..={end:#010x}")]
    Overlap { start: u32, end: u32 },
    #[error("Cannot disable software breakpoints in a region holding software breakpoints")]
    SetDirty,
    #[error("Cannot remove a region while software breakpoints are set in it")]
    RemoveDirty,
    #[error("No software breakpoint region with id {0}")]
    UnknownId(u16),
    #[error("Software breakpoint regions are out of sync")]
    Internal,
}

impl SwBreakConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SwBreakConfigError::Internal => ErrorKind::Internal,
            _ => ErrorKind::InvalidRequest,
        }
    }
}

/// Configured regions, ids are their positions.
#[derive(Debug, Default)]
pub(super) struct SwBreakConfig {
    items: Vec<SwBreakConfigItem>,
}

impl SwBreakConfig {
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn find(&self, address: u32) -> Option<&SwBreakConfigItem> {
        self.items.iter().find(|item| item.contains(address))
    }

    fn renumber(&mut self) {
        for (id, item) in self.items.iter_mut().enumerate() {
            item.id = id as u16;
        }
    }
}

/// A region cannot be disabled or dropped while an address breakpoint is set in it.
///
/// Hardware breakpoints count too, they may be reallocated as software breakpoints later.
fn is_dirty(item: &SwBreakConfigItem, breakpoints: &[Breakpoint]) -> bool {
    !item.enable
        && breakpoints.iter().any(|bp| {
            bp.is_execution() && bp.enabled && bp.allocated && item.contains(bp.address)
        })
}

fn test_sw_break(
    memory: &mut dyn MemoryInterface,
    address: u32,
    access_size: u8,
) -> Result<bool, ArmError> {
    match access_size {
        4 => {
            let word_address = address & !0x3;
            let shift = (address & 0x2) * 8;
            let original = memory.read_word_32(word_address)?;
            let patched = (original & !(0xFFFF << shift)) | ((BKPT_INSTRUCTION as u32) << shift);

            let readback = memory
                .write_word_32(word_address, patched)
                .and_then(|_| memory.read_word_32(word_address));
            let restored = memory.write_word_32(word_address, original);

            let readback = readback?;
            restored?;
            Ok((readback >> shift) as u16 == BKPT_INSTRUCTION)
        }
        1 => {
            let [low, high] = BKPT_INSTRUCTION.to_le_bytes();
            let original = [memory.read_word_8(address)?, memory.read_word_8(address + 1)?];

            let readback = memory
                .write_word_8(address, low)
                .and_then(|_| memory.write_word_8(address + 1, high))
                .and_then(|_| Ok([memory.read_word_8(address)?, memory.read_word_8(address + 1)?]));
            let restored = memory
                .write_word_8(address, original[0])
                .and_then(|_| memory.write_word_8(address + 1, original[1]));

            let readback = readback?;
            restored?;
            Ok(u16::from_le_bytes(readback) == BKPT_INSTRUCTION)
        }
        _ => {
            let original = memory.read_word_16(address)?;

            let readback = memory
                .write_word_16(address, BKPT_INSTRUCTION)
                .and_then(|_| memory.read_word_16(address));
            let restored = memory.write_word_16(address, original);

            let readback = readback?;
            restored?;
            Ok(readback == BKPT_INSTRUCTION)
        }
    }
}

impl BreakpointManager {
    /// Whether a `BKPT` can be placed at `address`.
    ///
    /// The first call for an address writes the instruction and restores the memory.
    pub fn can_sw_break(&mut self, memory: &mut dyn MemoryInterface, address: u32) -> bool {
        if !self.allow_sw_breaks || address >= SYSTEM_REGION || address & 0x1 != 0 {
            return false;
        }

        let access_size = match self.sw_config.find(address) {
            Some(item) if !item.enable => return false,
            Some(item) => item.access_size,
            None => 0,
        };

        if let Some(can_set) = self.sw_breaks.lookup(address) {
            return can_set;
        }

        let can_set = match test_sw_break(memory, address, access_size) {
            Ok(can_set) => can_set,
            Err(e) => {
                tracing::debug!("Software breakpoint test at {:#010x} failed: {}", address, e);
                false
            }
        };
        self.sw_breaks.record(address, can_set);
        can_set
    }

    /// Forget the software breakpoint test results for `start..=end`.
    ///
    /// Needed after the memory behind the range changed, e.g. by remapping.
    pub fn invalidate_sw_breaks(&mut self, start: u32, end: u32) {
        self.sw_breaks.invalidate_range(start, end);
    }

    /// Forget the software breakpoint test result for one address.
    pub fn invalidate_sw_break(&mut self, address: u32) {
        self.sw_breaks.invalidate(address);
    }

    pub fn sw_break_configs(&self) -> &[SwBreakConfigItem] {
        &self.sw_config.items
    }

    pub fn sw_break_conf(&self, address: u32) -> Option<&SwBreakConfigItem> {
        self.sw_config.find(address)
    }

    /// Add a region and return its id.
    ///
    /// `access_sizes` are the sizes the memory AP of the CPU supports.
    pub fn add_sw_break_config(
        &mut self,
        mut item: SwBreakConfigItem,
        access_sizes: AccessSizes,
        breakpoints: &[Breakpoint],
    ) -> Result<u16, SwBreakConfigError> {
        let supported = match item.access_size {
            0 => true,
            1 => access_sizes.contains(AccessSizes::BYTE),
            2 => access_sizes.contains(AccessSizes::HWORD),
            4 => access_sizes.contains(AccessSizes::WORD),
            _ => false,
        };
        if !supported {
            return Err(SwBreakConfigError::AccessSize(item.access_size));
        }
        if item.alignment > MAX_ALIGNMENT {
            return Err(SwBreakConfigError::AlignmentTooLarge(item.alignment));
        }

        if let Some(other) = self
            .sw_config
            .items
            .iter()
            .find(|other| other.contains(item.start) || other.contains(item.end))
        {
            return Err(SwBreakConfigError::Overlap {
                start: other.start,
                end: other.end,
            });
        }

        if is_dirty(&item, breakpoints) {
            return Err(SwBreakConfigError::SetDirty);
        }

        item.id = self.sw_config.items.len() as u16;
        tracing::debug!(
            "Software breakpoint region {}: {:#010x}..={:#010x}, enabled {}",
            item.id,
            item.start,
            item.end,
            item.enable
        );
        self.sw_breaks.invalidate_range(item.start, item.end);
        let id = item.id;
        self.sw_config.items.push(item);

        Ok(id)
    }

    /// Remove the region `id`, or all regions.
    pub fn remove_sw_break_config(
        &mut self,
        id: Option<u16>,
        breakpoints: &[Breakpoint],
    ) -> Result<(), SwBreakConfigError> {
        let Some(id) = id else {
            if self
                .sw_config
                .items
                .iter()
                .any(|item| is_dirty(item, breakpoints))
            {
                return Err(SwBreakConfigError::RemoveDirty);
            }
            for item in &self.sw_config.items {
                self.sw_breaks.invalidate_range(item.start, item.end);
            }
            self.sw_config.clear();
            return Ok(());
        };

        let index = self
            .sw_config
            .items
            .iter()
            .position(|item| item.id == id)
            .ok_or(SwBreakConfigError::UnknownId(id))?;

        let item = &self.sw_config.items[index];
        if is_dirty(item, breakpoints) {
            return Err(SwBreakConfigError::RemoveDirty);
        }
        self.sw_breaks.invalidate_range(item.start, item.end);

        self.sw_config.items.remove(index);
        self.sw_config.renumber();
        Ok(())
    }
}
