//! Address breakpoints set while the target is executing.
//!
//! Whether an address takes a software breakpoint cannot be tested on a running target, so
//! such breakpoints only reserve an FPB comparator here. The exact allocation is redone by
//! [`BreakpointManager::merge_run_breaks`] once the target halts.

use super::descriptor::other_half;
use super::{AllocMode, Breakpoint, BreakpointManager, ResourceError, ResourceKind};
use crate::architecture::arm::memory::MemoryInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunBreak {
    address: u32,
    /// The comparator was reserved for run breaks, it is not shared with a halted allocation.
    run_comp: bool,
}

#[derive(Debug, Default)]
pub(super) struct RunBreaks {
    entries: Vec<RunBreak>,
    capacity: usize,
    /// Comparators reserved by run breaks.
    added_comps: u32,
}

impl RunBreaks {
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.added_comps = 0;
    }

    pub fn contains(&self, address: u32) -> bool {
        self.find(address).is_some()
    }

    fn find(&self, address: u32) -> Option<&RunBreak> {
        self.entries.iter().find(|entry| entry.address == address)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addresses(&self) -> Vec<u32> {
        self.entries.iter().map(|entry| entry.address).collect()
    }

    pub fn dump(&self) {
        tracing::debug!(
            "Run breaks: {} of {}, {} comparators reserved",
            self.entries.len(),
            self.capacity,
            self.added_comps
        );
        for entry in &self.entries {
            tracing::debug!("  {:#010x} (own comparator: {})", entry.address, entry.run_comp);
        }
    }
}

/// Hardware breakpoints the run control takes for itself, e.g. to step over a breakpoint.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsedResources {
    pub breaks: u32,
    pub literals: u32,
}

impl UsedResources {
    pub(super) fn clear(&mut self) {
        *self = Self::default();
    }
}

impl BreakpointManager {
    fn set_run_break(
        &mut self,
        address: u32,
        new_comp: bool,
        run_comp: bool,
    ) -> Result<(), ResourceError> {
        let num_code = self.resources.fpb.num_code as u32;
        let run_breaks = &mut self.run_breaks;

        if new_comp && run_breaks.added_comps + self.resources.allocated().breaks >= num_code {
            return Err(ResourceError::Exhausted(ResourceKind::Break));
        }
        if run_breaks.entries.len() >= run_breaks.capacity {
            return Err(ResourceError::Exhausted(ResourceKind::Break));
        }

        run_breaks.entries.push(RunBreak { address, run_comp });
        if new_comp {
            run_breaks.added_comps += 1;
        }
        Ok(())
    }

    /// Reserve a comparator for an address breakpoint while the target runs.
    pub(super) fn add_run_break(
        &mut self,
        address: u32,
        others: &[Breakpoint],
    ) -> Result<(), ResourceError> {
        self.resources.check_hw_break_address(address)?;

        if self.run_breaks.contains(address) {
            return Ok(());
        }

        let mut allocated = others
            .iter()
            .filter(|other| other.is_execution() && other.allocated);

        if self.resources.fpb.linked_half_words() {
            if let Some(other) = self.run_breaks.find(other_half(address)) {
                let run_comp = other.run_comp;
                return self.set_run_break(address, false, run_comp);
            }

            let mut same_word = false;
            for other in allocated {
                if other.address == address {
                    return Ok(());
                }
                if !other.software && other.address & !0x3 == address & !0x3 {
                    same_word = true;
                }
            }
            if same_word {
                return self.set_run_break(address, false, false);
            }
        } else if allocated.any(|other| other.address == address) {
            return Ok(());
        }

        if self.used.breaks >= self.resources.fpb.num_code as u32 {
            return Err(ResourceError::Exhausted(ResourceKind::Break));
        }

        self.set_run_break(address, true, true)
    }

    /// Drop the run break at `address`.
    pub(super) fn free_run_break(&mut self, address: u32) -> Result<(), ResourceError> {
        let index = self
            .run_breaks
            .entries
            .iter()
            .position(|entry| entry.address == address)
            .ok_or(ResourceError::NoAlloc)?;

        let entry = self.run_breaks.entries.remove(index);
        let shared =
            self.resources.fpb.linked_half_words() && self.run_breaks.contains(other_half(address));
        if entry.run_comp && !shared {
            self.run_breaks.added_comps = self.run_breaks.added_comps.saturating_sub(1);
        }

        Ok(())
    }

    /// Addresses of the breakpoints set while the target was running.
    pub fn run_breaks(&self) -> Vec<u32> {
        self.run_breaks.addresses()
    }

    pub fn clear_run_breaks(&mut self) {
        self.run_breaks.clear();
    }

    /// Allocate the breakpoints set while running, now that the target is halted.
    ///
    /// Every run break is attempted. The first error is returned, and the run break table is
    /// empty afterwards either way.
    pub fn merge_run_breaks(
        &mut self,
        memory: &mut dyn MemoryInterface,
        breakpoints: &mut [Breakpoint],
    ) -> Result<(), ResourceError> {
        if self.run_breaks.is_empty() {
            return Ok(());
        }

        self.merging = true;
        let mut result = Ok(());

        for address in self.run_breaks.addresses() {
            for index in 0..breakpoints.len() {
                let candidate = &breakpoints[index];
                if !candidate.is_execution() || candidate.allocated || candidate.address != address
                {
                    continue;
                }

                let candidate = candidate.clone();
                match self.alloc_breakpoint(memory, AllocMode::Allocate, &candidate, breakpoints) {
                    Ok(outcome) => breakpoints[index].apply(&outcome),
                    Err(e) => {
                        tracing::warn!("Failed to allocate run break at {:#010x}: {}", address, e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
        }

        self.merging = false;
        self.run_breaks.clear();
        result
    }

    pub fn used_resources(&self) -> &UsedResources {
        &self.used
    }

    pub fn inc_used_hw_breaks(&mut self) -> Result<(), ResourceError> {
        if self.used.breaks >= self.resources.fpb.num_code as u32 {
            return Err(ResourceError::Exhausted(ResourceKind::Break));
        }
        self.used.breaks += 1;
        Ok(())
    }

    pub fn dec_used_hw_breaks(&mut self) -> Result<(), ResourceError> {
        self.used.breaks = self
            .used
            .breaks
            .checked_sub(1)
            .ok_or(ResourceError::NoAlloc)?;
        Ok(())
    }

    pub fn clear_used_resources(&mut self) {
        self.used.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::breakpoints::test::{FakeMemory, ManagerBuilder};
    use crate::breakpoints::{RequestFlags, RequestType};
    use pretty_assertions::assert_eq;

    fn running_legacy() -> BreakpointManager {
        let mut manager = ManagerBuilder::legacy().build();
        manager.set_running(true);
        manager
    }

    fn set_all(
        manager: &mut BreakpointManager,
        memory: &mut FakeMemory,
        breakpoints: &mut [Breakpoint],
    ) -> Result<(), ResourceError> {
        for index in 0..breakpoints.len() {
            let candidate = breakpoints[index].clone();
            let outcome =
                manager.alloc_breakpoint(memory, AllocMode::Allocate, &candidate, breakpoints)?;
            breakpoints[index].apply(&outcome);
        }
        Ok(())
    }

    #[test]
    fn breakpoint_while_running_is_a_run_break() {
        let mut manager = running_legacy();
        let mut memory = FakeMemory::default();

        let breakpoint = Breakpoint::execution(0x0800_0100);
        let outcome = manager
            .alloc_breakpoint(&mut memory, AllocMode::Allocate, &breakpoint, &[])
            .unwrap();

        assert!(outcome.run_break);
        assert!(!outcome.allocated);
        assert_eq!(manager.run_breaks(), vec![0x0800_0100]);
        assert_eq!(manager.resources().allocated().breaks, 0);

        // Setting it again changes nothing.
        manager
            .alloc_breakpoint(&mut memory, AllocMode::Allocate, &breakpoint, &[])
            .unwrap();
        assert_eq!(manager.run_breaks(), vec![0x0800_0100]);
    }

    #[test]
    fn run_breaks_share_half_words() {
        let mut manager = running_legacy();

        manager.add_run_break(0x0800_0100, &[]).unwrap();
        manager.add_run_break(0x0800_0102, &[]).unwrap();
        assert_eq!(manager.run_breaks.added_comps, 1);

        manager.free_run_break(0x0800_0100).unwrap();
        assert_eq!(manager.run_breaks.added_comps, 1);
        manager.free_run_break(0x0800_0102).unwrap();
        assert_eq!(manager.run_breaks.added_comps, 0);
    }

    #[test]
    fn run_break_next_to_allocated_breakpoint() {
        let mut manager = running_legacy();

        let mut halted = Breakpoint::execution(0x0800_0100);
        halted.allocated = true;

        manager.add_run_break(0x0800_0102, &[halted]).unwrap();
        assert_eq!(manager.run_breaks.added_comps, 0);
        assert_eq!(manager.run_breaks(), vec![0x0800_0102]);
    }

    #[test]
    fn run_breaks_run_out_of_comparators() {
        let mut manager = running_legacy();

        for n in 0..6 {
            manager.add_run_break(0x0800_0000 + 0x10 * n, &[]).unwrap();
        }
        assert_eq!(
            manager.add_run_break(0x0800_1000, &[]),
            Err(ResourceError::Exhausted(ResourceKind::Break))
        );
        // The other half-word of a reserved comparator is still free.
        manager.add_run_break(0x0800_0002, &[]).unwrap();
    }

    #[test]
    fn run_breaks_need_comparator_addresses() {
        let mut manager = running_legacy();
        assert_eq!(
            manager.add_run_break(0x2000_0000, &[]),
            Err(ResourceError::AddressNotSupported(0x2000_0000))
        );
    }

    #[test]
    fn free_while_running() {
        let mut manager = running_legacy();
        let mut memory = FakeMemory::default();

        let breakpoint = Breakpoint::execution(0x0800_0100);
        manager
            .alloc_breakpoint(&mut memory, AllocMode::Allocate, &breakpoint, &[])
            .unwrap();
        let outcome = manager
            .alloc_breakpoint(&mut memory, AllocMode::Free, &breakpoint, &[])
            .unwrap();

        assert!(!outcome.run_break);
        assert!(manager.run_breaks().is_empty());
        assert_eq!(manager.free_run_break(0x0800_0100), Err(ResourceError::NoAlloc));
    }

    #[test]
    fn breakpoint_allocated_while_halted_is_freed_while_running() {
        let mut manager = ManagerBuilder::legacy().build();
        let mut memory = FakeMemory::read_only();

        let mut breakpoint = Breakpoint::execution(0x0800_0100);
        set_all(&mut manager, &mut memory, std::slice::from_mut(&mut breakpoint)).unwrap();
        assert_eq!(manager.resources().allocated().breaks, 1);

        manager.set_running(true);
        let outcome = manager
            .alloc_breakpoint(&mut memory, AllocMode::Free, &breakpoint, &[])
            .unwrap();
        assert!(!outcome.allocated);
        assert_eq!(manager.resources().allocated().breaks, 0);
    }

    #[test]
    fn merge_matches_halted_allocation() {
        let addresses = [0x0800_0100, 0x0800_0102, 0x0800_0200, 0x0800_0300];
        let mut memory = FakeMemory::read_only();

        let mut direct = ManagerBuilder::legacy().build();
        let mut direct_breakpoints: Vec<_> =
            addresses.iter().map(|a| Breakpoint::execution(*a)).collect();
        set_all(&mut direct, &mut memory, &mut direct_breakpoints).unwrap();

        let mut merged = running_legacy();
        let mut merged_breakpoints: Vec<_> =
            addresses.iter().map(|a| Breakpoint::execution(*a)).collect();
        set_all(&mut merged, &mut memory, &mut merged_breakpoints).unwrap();
        assert_eq!(merged.resources().allocated().breaks, 0);

        merged.set_running(false);
        merged
            .merge_run_breaks(&mut memory, &mut merged_breakpoints)
            .unwrap();

        assert_eq!(merged.resources().allocated(), direct.resources().allocated());
        assert_eq!(merged_breakpoints, direct_breakpoints);
        assert!(merged.run_breaks().is_empty());
    }

    #[test]
    fn merge_keeps_first_error() {
        let mut manager = running_legacy();
        let mut memory = FakeMemory::read_only();

        let mut breakpoints: Vec<_> = (0..4)
            .map(|n| Breakpoint::execution(0x0800_0000 + 0x10 * n))
            .collect();
        set_all(&mut manager, &mut memory, &mut breakpoints).unwrap();

        // Comparators were taken behind the run breaks' back.
        manager.set_running(false);
        for _ in 0..4 {
            manager
                .alloc(RequestType::Pc, RequestFlags::empty())
                .unwrap();
        }

        assert_eq!(
            manager.merge_run_breaks(&mut memory, &mut breakpoints),
            Err(ResourceError::Exhausted(ResourceKind::Break))
        );
        assert_eq!(manager.resources().allocated().breaks, 6);
        assert!(manager.run_breaks().is_empty());
        assert_eq!(breakpoints.iter().filter(|bp| bp.allocated).count(), 2);
    }

    #[test]
    fn used_breaks_are_bounded() {
        let mut manager = ManagerBuilder::legacy().build();
        assert_eq!(manager.dec_used_hw_breaks(), Err(ResourceError::NoAlloc));

        for _ in 0..6 {
            manager.inc_used_hw_breaks().unwrap();
        }
        assert_eq!(
            manager.inc_used_hw_breaks(),
            Err(ResourceError::Exhausted(ResourceKind::Break))
        );
        manager.dec_used_hw_breaks().unwrap();
        assert_eq!(manager.used_resources().breaks, 5);

        manager.clear_used_resources();
        assert_eq!(*manager.used_resources(), UsedResources::default());
    }
}
