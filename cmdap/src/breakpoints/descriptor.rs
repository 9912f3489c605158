//! Breakpoint descriptors and their allocation.

use super::{BreakpointManager, RequestFlags, RequestType, ResourceError};
use crate::architecture::arm::memory::MemoryInterface;

/// A contiguous run of equally sized watched elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchRange {
    pub address: u32,
    /// Size of one element in bytes.
    pub access_size: u32,
    pub count: u32,
}

impl WatchRange {
    /// Watched bytes.
    pub fn len(&self) -> u32 {
        self.access_size.saturating_mul(self.count)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a tracepoint does when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePoint {
    Start,
    Stop,
    /// Trigger the ETM, and halt through the companion breakpoint.
    Halt,
    /// Trace the matched access only.
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Halt when an instruction at the address executes.
    Execution,
    /// Halt on a data access.
    Watch,
    /// Halt when the cycle counter matches the address field.
    CycleWatch,
    Trace(TracePoint),
}

/// A breakpoint as the run control layer keeps it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub kind: BreakpointKind,
    pub address: u32,
    pub access_size: u32,
    pub count: u32,
    /// Only match accesses of this value.
    pub value: Option<u32>,
    pub enabled: bool,
    pub allocated: bool,
    /// The breakpoint is a BKPT instruction written to memory.
    pub software: bool,
    /// The range asked for, when the watched range had to be widened.
    pub original: Option<WatchRange>,
    /// The breakpoint halting the target for a [`TracePoint::Halt`].
    pub companion: Option<Box<Breakpoint>>,
}

impl Breakpoint {
    fn new(kind: BreakpointKind, address: u32, access_size: u32, count: u32) -> Self {
        Self {
            kind,
            address,
            access_size,
            count,
            value: None,
            enabled: true,
            allocated: false,
            software: false,
            original: None,
            companion: None,
        }
    }

    pub fn execution(address: u32) -> Self {
        Self::new(BreakpointKind::Execution, address, 2, 1)
    }

    /// Watch `count` elements of `access_size` bytes.
    pub fn watch(address: u32, access_size: u32, count: u32) -> Self {
        Self::new(BreakpointKind::Watch, address, access_size, count)
    }

    pub fn value_watch(address: u32, access_size: u32, value: u32) -> Self {
        Self {
            value: Some(value),
            ..Self::watch(address, access_size, 1)
        }
    }

    pub fn cycle_watch(cycles: u32) -> Self {
        Self::new(BreakpointKind::CycleWatch, cycles, 4, 1)
    }

    pub fn trace(point: TracePoint, address: u32, access_size: u32, count: u32) -> Self {
        Self::new(BreakpointKind::Trace(point), address, access_size, count)
    }

    pub fn with_companion(mut self, companion: Breakpoint) -> Self {
        self.companion = Some(Box::new(companion));
        self
    }

    pub fn is_execution(&self) -> bool {
        self.kind == BreakpointKind::Execution
    }

    fn is_data(&self) -> bool {
        matches!(self.kind, BreakpointKind::Watch | BreakpointKind::Trace(_))
    }

    pub fn range(&self) -> WatchRange {
        WatchRange {
            address: self.address,
            access_size: self.access_size,
            count: self.count,
        }
    }

    /// Store the result of an allocation.
    pub fn apply(&mut self, outcome: &AllocOutcome) {
        self.allocated = outcome.allocated;
        self.software = outcome.software;

        if let Some(range) = outcome.range {
            self.original = outcome.original;
            self.address = range.address;
            self.access_size = range.access_size;
            self.count = range.count;
        }

        if let (Some(companion), Some(outcome)) = (&mut self.companion, &outcome.companion) {
            companion.apply(outcome);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    Free,
    Allocate,
    /// Only make the watched range legal, nothing is allocated.
    AdjustOnly,
}

/// The state a breakpoint is in after [`BreakpointManager::alloc_breakpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocOutcome {
    pub allocated: bool,
    pub software: bool,
    /// Tracked in the run break table until the target halts.
    pub run_break: bool,
    /// The widened range to program instead of the requested one.
    pub range: Option<WatchRange>,
    pub original: Option<WatchRange>,
    pub companion: Option<Box<AllocOutcome>>,
}

impl AllocOutcome {
    fn unchanged(breakpoint: &Breakpoint, run_break: bool) -> Self {
        Self {
            allocated: breakpoint.allocated,
            software: breakpoint.software,
            run_break,
            range: None,
            original: None,
            companion: None,
        }
    }
}

/// The other half-word of the word `address` is in.
pub(crate) fn other_half(address: u32) -> u32 {
    if address & 0x2 != 0 {
        address & !0x3
    } else {
        address | 0x2
    }
}

impl BreakpointManager {
    /// The comparator shape `breakpoint` needs.
    pub fn classify(
        &self,
        breakpoint: &Breakpoint,
    ) -> Result<(RequestType, RequestFlags), ResourceError> {
        let v8m = self.resources.v8m;
        let span = breakpoint.range().len();

        let mut flags = RequestFlags::empty();
        let request = match breakpoint.kind {
            BreakpointKind::Execution => RequestType::Pc,
            BreakpointKind::CycleWatch => RequestType::Cycle,
            _ if span == 0 => return Err(ResourceError::RangeSize),
            BreakpointKind::Watch => {
                if breakpoint.value.is_some() {
                    RequestType::DataLinked1
                } else if v8m && (span > 4 || span == 3) {
                    RequestType::DataRange
                } else if v8m && breakpoint.address & (span - 1) != 0 {
                    // An unaligned access needs a range on ARMv8-M.
                    RequestType::DataRange
                } else {
                    RequestType::DataAddress
                }
            }
            BreakpointKind::Trace(point) => {
                flags |= match point {
                    TracePoint::Start => RequestFlags::ETM_START,
                    TracePoint::Stop => RequestFlags::ETM_STOP,
                    TracePoint::Halt => RequestFlags::ETM_TRIGGER,
                    TracePoint::Data => RequestFlags::empty(),
                };

                if breakpoint.value.is_some() {
                    RequestType::DataLinked1
                } else if v8m && span == 3 {
                    return Err(ResourceError::RangeUnaligned);
                } else if v8m && span > 4 {
                    return Err(ResourceError::RangeSize);
                } else if v8m && breakpoint.address & (span - 1) != 0 {
                    return Err(ResourceError::RangeUnaligned);
                } else {
                    RequestType::DataAddress
                }
            }
        };

        Ok((request, flags))
    }

    /// Allocate, free, or adjust the resources for `breakpoint`.
    ///
    /// `others` are the breakpoints the caller already holds. Address breakpoints on the same
    /// word can share a comparator with them. Allocating what is allocated, or freeing what
    /// is free, succeeds without changes.
    ///
    /// The returned outcome has to be [applied](Breakpoint::apply) to the breakpoint.
    pub fn alloc_breakpoint(
        &mut self,
        memory: &mut dyn MemoryInterface,
        mode: AllocMode,
        breakpoint: &Breakpoint,
        others: &[Breakpoint],
    ) -> Result<AllocOutcome, ResourceError> {
        let (request, flags) = self.classify(breakpoint)?;

        let companion = match (breakpoint.kind, &breakpoint.companion) {
            (BreakpointKind::Trace(TracePoint::Halt), Some(companion)) => {
                Some(self.alloc_breakpoint(memory, mode, companion, others)?)
            }
            _ => None,
        };

        match self.alloc_classified(memory, mode, breakpoint, request, flags, others) {
            Ok(mut outcome) => {
                outcome.companion = companion.map(Box::new);
                Ok(outcome)
            }
            Err(e) => {
                if let (AllocMode::Allocate, Some(outcome), Some(companion)) =
                    (mode, companion, &breakpoint.companion)
                {
                    self.roll_back_companion(memory, companion, &outcome, others);
                }
                Err(e)
            }
        }
    }

    fn roll_back_companion(
        &mut self,
        memory: &mut dyn MemoryInterface,
        companion: &Breakpoint,
        outcome: &AllocOutcome,
        others: &[Breakpoint],
    ) {
        if companion.allocated || !outcome.allocated {
            return;
        }

        let mut allocated = companion.clone();
        allocated.apply(outcome);
        if let Err(e) = self.alloc_breakpoint(memory, AllocMode::Free, &allocated, others) {
            tracing::warn!("Failed to release companion breakpoint: {}", e);
        }
    }

    fn alloc_classified(
        &mut self,
        memory: &mut dyn MemoryInterface,
        mode: AllocMode,
        breakpoint: &Breakpoint,
        request: RequestType,
        mut flags: RequestFlags,
        others: &[Breakpoint],
    ) -> Result<AllocOutcome, ResourceError> {
        let run_break = breakpoint.is_execution()
            && !self.merging
            && self.run_breaks.contains(breakpoint.address);
        let holds_resources = breakpoint.allocated || run_break;

        match mode {
            AllocMode::Allocate | AllocMode::Free
                if holds_resources == (mode == AllocMode::Allocate) =>
            {
                return Ok(AllocOutcome::unchanged(breakpoint, run_break));
            }
            _ => {}
        }

        let mut outcome = AllocOutcome::unchanged(breakpoint, run_break);

        let masked_watch = !self.resources.v8m && self.resources.dwt.num_comps > 0;
        if masked_watch && mode != AllocMode::Free && breakpoint.is_data() {
            let range = breakpoint.range();
            if let Err(e) = self.resources.check_watch_address(&range) {
                // Tracing a superset is harmless, a watch is only widened on request.
                let adjustable = matches!(breakpoint.kind, BreakpointKind::Trace(_))
                    || mode == AllocMode::AdjustOnly;
                if !adjustable {
                    return Err(e);
                }

                let adjusted = self.resources.adjust_watch_address(&range)?;
                tracing::debug!("Watch {:x?} widened to {:x?}", range, adjusted);
                outcome.range = Some(adjusted);
                outcome.original = Some(range);
            }
        }

        if mode == AllocMode::AdjustOnly {
            return Ok(outcome);
        }

        let mut software = false;
        if breakpoint.is_execution() {
            if self.running && !self.merging && !self.set_sw_break_run {
                if mode == AllocMode::Allocate {
                    self.add_run_break(breakpoint.address, others)?;
                    outcome.run_break = self.run_breaks.contains(breakpoint.address);
                    return Ok(outcome);
                }

                match self.free_run_break(breakpoint.address) {
                    Ok(()) => {
                        outcome.run_break = false;
                        return Ok(outcome);
                    }
                    // Allocated while the target was halted.
                    Err(ResourceError::NoAlloc) => {}
                    Err(e) => return Err(e),
                }
            }

            software = match mode {
                AllocMode::Allocate => self.can_sw_break(memory, breakpoint.address),
                _ => breakpoint.software,
            };
            if software {
                flags |= RequestFlags::CAN_SW_BREAK;
            } else {
                self.resources.check_hw_break_address(breakpoint.address)?;
            }
        }

        match mode {
            AllocMode::Allocate => {
                if !(breakpoint.is_execution() && self.break_on_word(breakpoint, software, others))
                {
                    self.resources.alloc(request, flags)?;
                }
                outcome.allocated = true;
            }
            _ => {
                if !(breakpoint.is_execution()
                    && self.other_break_on_word(breakpoint, software, others))
                {
                    self.resources.free(request, flags)?;
                }
                outcome.allocated = false;
            }
        }
        outcome.software = software;
        outcome.run_break = false;

        Ok(outcome)
    }

    /// Another allocated breakpoint already provides the comparator or BKPT `breakpoint` needs.
    fn break_on_word(&self, breakpoint: &Breakpoint, software: bool, others: &[Breakpoint]) -> bool {
        let active = others
            .iter()
            .filter(|other| other.is_execution() && other.enabled && other.allocated);

        if self.resources.fpb.linked_half_words() && !software {
            active
                .filter(|other| !other.software)
                .any(|other| other.address & !0x3 == breakpoint.address & !0x3)
        } else {
            active
                .filter(|other| other.software == software)
                .any(|other| other.address == breakpoint.address)
        }
    }

    /// The comparator of `breakpoint` is still used for the other half-word.
    fn other_break_on_word(
        &self,
        breakpoint: &Breakpoint,
        software: bool,
        others: &[Breakpoint],
    ) -> bool {
        if software || !self.resources.fpb.linked_half_words() {
            return false;
        }

        let other_address = other_half(breakpoint.address);
        others.iter().any(|other| {
            other.is_execution() && other.allocated && !other.software && other.address == other_address
        })
    }
}
