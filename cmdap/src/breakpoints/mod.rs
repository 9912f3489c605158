//! Breakpoint and watchpoint resource management.
//!
//! The FPB and DWT have a fixed number of comparators, and only some DWT comparators can
//! match values, count cycles, or link to a neighbour. A request is first classified into a
//! [`RequestType`], checked against every pool it would draw from, and only then committed,
//! so a failed request never leaves a counter changed.
//!
//! Address breakpoints fall back to software breakpoints where the target memory accepts a
//! BKPT instruction. While the target runs, new address breakpoints take a shortcut through
//! the run break table, which is merged back into the exact counters on the next halt.

mod descriptor;
mod resources;
mod run;
mod software;

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::architecture::arm::component::{
    detect_dwt, detect_fpb, DwtInfo, EtmCapabilities, EtmInfo, FpbInfo,
};
use crate::architecture::arm::memory::MemoryInterface;
use crate::architecture::arm::ArmError;
use crate::config::{DebugTopology, SessionConfig};
use crate::ErrorKind;

pub use descriptor::{AllocMode, AllocOutcome, Breakpoint, BreakpointKind, TracePoint, WatchRange};
pub use resources::{AllocatedResources, BreakResources, MAX_ETM_TRIGGER_INPUTS};
pub use run::UsedResources;
pub use software::{SwBreakConfigError, SwBreakConfigItem, BKPT_INSTRUCTION};

use run::RunBreaks;
use software::{SwBreakCache, SwBreakConfig};

/// The hardware feature a resource error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// FPB instruction address comparators.
    Break,
    /// Any DWT comparator.
    Watch,
    WatchValue,
    /// A value or limit comparator linked to one address comparator.
    WatchLink1,
    /// A value comparator linked to two address comparators.
    WatchLink2,
    WatchCycle,
    Etm,
    EtmStartStop,
    EtmDwtInput,
    EtmTrigger,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceKind::Break => "hardware breakpoints",
            ResourceKind::Watch => "watchpoints",
            ResourceKind::WatchValue => "watchpoints with value match",
            ResourceKind::WatchLink1 => "watchpoints linked to one address",
            ResourceKind::WatchLink2 => "watchpoints linked to two addresses",
            ResourceKind::WatchCycle => "cycle count watchpoints",
            ResourceKind::Etm => "ETM trace",
            ResourceKind::EtmStartStop => "ETM start/stop logic",
            ResourceKind::EtmDwtInput => "DWT inputs to the ETM",
            ResourceKind::EtmTrigger => "ETM trigger inputs",
        };
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("Unknown resource request type {0}")]
    UnknownRequest(u16),
    #[error("The target does not support {0}")]
    Unsupported(ResourceKind),
    #[error("All {0} of the target are in use")]
    Exhausted(ResourceKind),
    #[error("The watch address is not aligned to the watched size")]
    WatchAddressUnaligned,
    #[error("The watched range is not a power of two in size")]
    RangeUnaligned,
    #[error("The watched range is too large")]
    RangeSize,
    #[error("Tried to free a resource that is not allocated")]
    NoAlloc,
    #[error("A hardware breakpoint cannot be set at {0:#010x}")]
    AddressNotSupported(u32),
    #[error("Breakpoint bookkeeping is out of sync")]
    Internal,
}

impl ResourceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ResourceError::Unsupported(kind) => ErrorKind::UnsupportedConfiguration(*kind),
            ResourceError::Exhausted(kind) => ErrorKind::ResourceExhausted(*kind),
            ResourceError::AddressNotSupported(_) => {
                ErrorKind::UnsupportedConfiguration(ResourceKind::Break)
            }
            ResourceError::UnknownRequest(_)
            | ResourceError::WatchAddressUnaligned
            | ResourceError::RangeUnaligned
            | ResourceError::RangeSize => ErrorKind::InvalidRequest,
            ResourceError::NoAlloc | ResourceError::Internal => ErrorKind::Internal,
        }
    }
}

/// The comparator shape a breakpoint request needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Primitive)]
pub enum RequestType {
    /// Instruction address.
    Pc = 0,
    /// One data address.
    DataAddress = 1,
    /// A data address range, an address comparator and a limit comparator.
    DataRange = 2,
    /// A data value anywhere.
    DataValue = 3,
    /// A data value at one address.
    DataLinked1 = 4,
    /// A data value at one of two addresses.
    DataLinked2 = 5,
    /// A cycle count.
    Cycle = 6,
}

impl RequestType {
    /// DWT comparators the request occupies.
    pub fn comparators(&self) -> u32 {
        match self {
            RequestType::Pc => 0,
            RequestType::DataAddress | RequestType::DataValue | RequestType::Cycle => 1,
            RequestType::DataRange | RequestType::DataLinked1 => 2,
            RequestType::DataLinked2 => 3,
        }
    }
}

impl TryFrom<u16> for RequestType {
    type Error = ResourceError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        RequestType::from_u16(value).ok_or(ResourceError::UnknownRequest(value))
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestFlags: u16 {
        /// The address accepts a software breakpoint, no comparator is needed.
        const CAN_SW_BREAK = 0x01;
        const ETM_START = 0x02;
        const ETM_STOP = 0x04;
        const ETM_TRIGGER = 0x08;
        const ETM_ENABLE_EVENT = 0x10;

        const ETM = Self::ETM_START.bits()
            | Self::ETM_STOP.bits()
            | Self::ETM_TRIGGER.bits()
            | Self::ETM_ENABLE_EVENT.bits();
    }
}

/// Hands out the breakpoint and watchpoint comparators of one CPU.
///
/// Driven by the thread owning run control, it is not shared between threads.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    resources: BreakResources,
    run_breaks: RunBreaks,
    used: UsedResources,
    sw_breaks: SwBreakCache,
    sw_config: SwBreakConfig,
    allow_sw_breaks: bool,
    set_sw_break_run: bool,
    running: bool,
    merging: bool,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the FPB capabilities.
    pub fn detect_break_resources(
        &mut self,
        memory: &mut dyn MemoryInterface,
        topology: &DebugTopology,
    ) -> Result<&FpbInfo, ArmError> {
        self.resources.fpb = detect_fpb(memory, topology.fpb)?;
        self.run_breaks.set_capacity(self.max_run_breaks());
        Ok(&self.resources.fpb)
    }

    /// Read the DWT capabilities.
    pub fn detect_dwt_resources(
        &mut self,
        memory: &mut dyn MemoryInterface,
        topology: &DebugTopology,
        v8m: bool,
    ) -> Result<&DwtInfo, ArmError> {
        self.resources.v8m = v8m;
        self.resources.dwt = detect_dwt(memory, topology.dwt, v8m)?;
        Ok(&self.resources.dwt)
    }

    /// Derive the remaining capabilities and start with nothing allocated.
    ///
    /// Called after both detections.
    pub fn init_break_resources(&mut self, config: &SessionConfig, topology: &DebugTopology) {
        self.resources.etm = EtmInfo::from_version(topology.etm_version, &self.resources.dwt);
        self.resources.free_all();

        self.allow_sw_breaks = config.allow_software_breakpoints;
        self.set_sw_break_run = config.set_sw_break_run;
        self.merging = false;

        self.run_breaks.set_capacity(self.max_run_breaks());
        self.run_breaks.clear();
        self.used.clear();
        self.sw_breaks.clear();
        self.sw_config.clear();
    }

    fn max_run_breaks(&self) -> usize {
        let fpb = &self.resources.fpb;
        let comparators = fpb.num_code as usize;
        if fpb.linked_half_words() {
            comparators * 2
        } else {
            comparators
        }
    }

    pub fn resources(&self) -> &BreakResources {
        &self.resources
    }

    pub fn check_resources(
        &self,
        request: RequestType,
        flags: RequestFlags,
    ) -> Result<(), ResourceError> {
        self.resources.check(request, flags)
    }

    pub fn alloc(&mut self, request: RequestType, flags: RequestFlags) -> Result<(), ResourceError> {
        self.resources.alloc(request, flags)
    }

    pub fn free(&mut self, request: RequestType, flags: RequestFlags) -> Result<(), ResourceError> {
        self.resources.free(request, flags)
    }

    /// Release every allocation. Known software breakpoint locations are kept.
    pub fn free_all(&mut self) {
        self.resources.free_all();
    }

    /// Back to the state before detection. Capabilities, allocations and settings are all lost.
    pub fn crt_init(&mut self) {
        *self = Self::default();
    }

    /// Tell the manager whether the target is executing.
    ///
    /// While it is, address breakpoints are tracked as run breaks.
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn allow_software_breakpoints(&mut self, allow: bool) {
        self.allow_sw_breaks = allow;
    }

    pub fn can_value_watch(&self) -> bool {
        self.resources.dwt.value_comps > 0
    }

    pub fn can_link_watch(&self) -> bool {
        if self.resources.v8m {
            self.resources.dwt.link_comps > 0
        } else {
            self.resources.dwt.link2nd_comps > 0
        }
    }

    pub fn can_cycle_watch(&self) -> bool {
        self.resources.dwt.cycle_comps > 0
    }

    pub fn can_range_watch(&self) -> bool {
        self.resources.v8m && self.resources.dwt.limit_comps > 0
    }

    pub fn can_etm_start_stop(&self) -> bool {
        self.resources
            .etm
            .capabilities
            .contains(EtmCapabilities::START_STOP | EtmCapabilities::START_STOP_DWT)
    }

    pub fn break_comparator_count(&self) -> u32 {
        self.resources.fpb.num_code as u32
    }

    pub fn dwt_comparator_count(&self) -> u32 {
        self.resources.dwt.num_comps
    }

    pub fn dwt_value_comparator_count(&self) -> u32 {
        self.resources.dwt.value_comps
    }

    pub fn dwt_link_comparator_count(&self) -> u32 {
        self.resources.dwt.link_comps
    }

    pub fn dwt_limit_comparator_count(&self) -> u32 {
        self.resources.dwt.limit_comps
    }

    pub fn dwt_cycle_comparator_count(&self) -> u32 {
        self.resources.dwt.cycle_comps
    }

    /// Log the complete allocation state.
    pub fn dump(&self) {
        let fpb = &self.resources.fpb;
        let dwt = &self.resources.dwt;
        let etm = &self.resources.etm;
        let allocated = self.resources.allocated();

        tracing::debug!(
            "FPB: full address space {}, {} breaks ({} allocated), {} literals",
            fpb.full_address_space(),
            fpb.num_code,
            allocated.breaks,
            fpb.num_lit
        );
        tracing::debug!(
            "DWT: {} comparators ({} allocated), {} value ({} allocated), {} cycle ({} allocated), max mask bits {}",
            dwt.num_comps,
            allocated.comps,
            dwt.value_comps,
            allocated.value,
            dwt.cycle_comps,
            allocated.cycle,
            dwt.max_mask_bits
        );
        if self.resources.v8m {
            tracing::debug!(
                "DWT: {} limit ({} allocated), {} linkable ({} allocated)",
                dwt.limit_comps,
                allocated.limit,
                dwt.link_comps,
                allocated.link
            );
        } else {
            tracing::debug!(
                "DWT: {} second link ({} allocated)",
                dwt.link2nd_comps,
                allocated.link2nd
            );
        }
        tracing::debug!(
            "Software breakpoints: allowed {}, {} allocated, {} known locations",
            self.allow_sw_breaks,
            allocated.sw_breaks,
            self.sw_breaks.len()
        );
        self.sw_breaks.dump();
        self.run_breaks.dump();
        tracing::debug!(
            "ETM: {:?}, {} DWT inputs, {} trigger inputs allocated",
            etm.capabilities,
            etm.dwt_inputs,
            allocated.trigger_inputs
        );
        tracing::debug!(
            "Used during run: {} breaks, {} literals",
            self.used.breaks,
            self.used.literals
        );
    }
}
