use super::descriptor::WatchRange;
use super::{RequestFlags, RequestType, ResourceError, ResourceKind};
use crate::architecture::arm::component::{DwtInfo, EtmCapabilities, EtmInfo, FpbInfo};

/// The ETM trigger logic takes two inputs.
pub const MAX_ETM_TRIGGER_INPUTS: u32 = 2;

/// Revision 1 FPBs only compare addresses in the code region.
const FPB_V1_CODE_LIMIT: u32 = 0x2000_0000;

/// Allocation counters, one per hardware pool.
///
/// The specialized DWT pools are subsets of `comps`, an allocation counts in every pool it
/// draws from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatedResources {
    pub breaks: u32,
    pub sw_breaks: u32,
    pub comps: u32,
    pub value: u32,
    pub link2nd: u32,
    pub limit: u32,
    pub link: u32,
    pub cycle: u32,
    pub trigger_inputs: u32,
}

/// The comparator pools of the target and how much of each is allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakResources {
    pub fpb: FpbInfo,
    pub dwt: DwtInfo,
    pub etm: EtmInfo,
    /// ARMv8-M comparator rules apply.
    pub v8m: bool,
    allocated: AllocatedResources,
}

impl BreakResources {
    pub fn new(fpb: FpbInfo, dwt: DwtInfo, etm: EtmInfo, v8m: bool) -> Self {
        Self {
            fpb,
            dwt,
            etm,
            v8m,
            allocated: AllocatedResources::default(),
        }
    }

    pub fn allocated(&self) -> &AllocatedResources {
        &self.allocated
    }

    pub fn free_all(&mut self) {
        self.allocated = AllocatedResources::default();
    }

    /// Check that `request` can be satisfied without changing anything.
    ///
    /// The error names the first pool that is missing or exhausted.
    pub fn check(&self, request: RequestType, flags: RequestFlags) -> Result<(), ResourceError> {
        self.check_etm(flags)?;

        match request {
            RequestType::Pc => {
                if !flags.contains(RequestFlags::CAN_SW_BREAK) {
                    let num_breaks = self.fpb.num_code as u32;
                    if num_breaks == 0 {
                        return Err(ResourceError::Unsupported(ResourceKind::Break));
                    }
                    if self.allocated.breaks >= num_breaks {
                        return Err(ResourceError::Exhausted(ResourceKind::Break));
                    }
                }
                Ok(())
            }
            _ => {
                self.check_dwt_support(request)?;
                self.check_dwt_usage(request)
            }
        }
    }

    fn check_etm(&self, flags: RequestFlags) -> Result<(), ResourceError> {
        if flags.intersects(RequestFlags::ETM) {
            if !self.etm.capabilities.contains(EtmCapabilities::IMPLEMENTED) {
                return Err(ResourceError::Unsupported(ResourceKind::Etm));
            }
            if self.etm.dwt_inputs == 0 {
                return Err(ResourceError::Unsupported(ResourceKind::EtmDwtInput));
            }
        }

        if flags.intersects(RequestFlags::ETM_START | RequestFlags::ETM_STOP)
            && !self.etm.capabilities.contains(EtmCapabilities::START_STOP)
        {
            return Err(ResourceError::Unsupported(ResourceKind::EtmStartStop));
        }

        if flags.contains(RequestFlags::ETM_TRIGGER)
            && self.allocated.trigger_inputs >= MAX_ETM_TRIGGER_INPUTS
        {
            return Err(ResourceError::Exhausted(ResourceKind::EtmTrigger));
        }

        Ok(())
    }

    fn check_dwt_support(&self, request: RequestType) -> Result<(), ResourceError> {
        let dwt = &self.dwt;

        if dwt.num_comps == 0 {
            return Err(ResourceError::Unsupported(ResourceKind::Watch));
        }

        match request {
            RequestType::Cycle if dwt.cycle_comps == 0 => {
                Err(ResourceError::Unsupported(ResourceKind::WatchCycle))
            }
            RequestType::DataLinked2 => {
                // ARMv8-M links at most two comparators.
                if self.v8m || dwt.link2nd_comps == 0 {
                    return Err(ResourceError::Unsupported(ResourceKind::WatchLink2));
                }
                self.check_linked1_support()
            }
            RequestType::DataLinked1 => self.check_linked1_support(),
            RequestType::DataValue if dwt.value_comps == 0 => {
                Err(ResourceError::Unsupported(ResourceKind::WatchValue))
            }
            RequestType::DataRange => {
                if !self.v8m || dwt.limit_comps == 0 || dwt.link_comps == 0 {
                    return Err(ResourceError::Unsupported(ResourceKind::WatchLink1));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_linked1_support(&self) -> Result<(), ResourceError> {
        let dwt = &self.dwt;
        if self.v8m {
            if dwt.value_comps == 0 || dwt.link_comps == 0 {
                return Err(ResourceError::Unsupported(ResourceKind::WatchLink1));
            }
        } else if dwt.value_comps == 0 {
            return Err(ResourceError::Unsupported(ResourceKind::WatchValue));
        }
        Ok(())
    }

    fn check_dwt_usage(&self, request: RequestType) -> Result<(), ResourceError> {
        let dwt = &self.dwt;
        let allocated = &self.allocated;

        if dwt.num_comps.saturating_sub(allocated.comps) < request.comparators() {
            return Err(ResourceError::Exhausted(ResourceKind::Watch));
        }

        match request {
            RequestType::Cycle => {
                if allocated.cycle >= dwt.cycle_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchCycle));
                }
            }
            RequestType::DataLinked2 => {
                if allocated.link2nd >= dwt.link2nd_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchLink2));
                }
                if allocated.value >= dwt.value_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchValue));
                }
            }
            RequestType::DataLinked1 if self.v8m => {
                if allocated.value >= dwt.value_comps || allocated.link >= dwt.link_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchLink1));
                }
                self.check_pair_fits()?;
            }
            RequestType::DataLinked1 => {
                if allocated.value >= dwt.value_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchValue));
                }
            }
            RequestType::DataValue => {
                if allocated.value >= dwt.value_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchValue));
                }
                if self.v8m && allocated.link >= dwt.link_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchValue));
                }
            }
            RequestType::DataRange => {
                if allocated.limit >= dwt.limit_comps || allocated.link >= dwt.link_comps {
                    return Err(ResourceError::Exhausted(ResourceKind::WatchLink1));
                }
                self.check_pair_fits()?;
            }
            RequestType::Pc | RequestType::DataAddress => {}
        }

        Ok(())
    }

    /// ARMv8-M pairs a linkable comparator with the one below it. Comparators allocated
    /// singly beyond those that can never pair take pairs away.
    fn check_pair_fits(&self) -> Result<(), ResourceError> {
        let dwt = &self.dwt;
        let allocated = &self.allocated;

        let single_use = dwt.num_comps as i64 - 2 * dwt.link_comps as i64;
        let single_use_allocated = allocated.comps as i64 - 2 * allocated.link as i64;
        let free_pairs = dwt.link_comps as i64 - allocated.link as i64;

        if single_use_allocated > single_use && single_use_allocated - single_use > 2 * free_pairs
        {
            return Err(ResourceError::Exhausted(ResourceKind::Watch));
        }

        Ok(())
    }

    /// Check and commit `request`.
    pub fn alloc(&mut self, request: RequestType, flags: RequestFlags) -> Result<(), ResourceError> {
        self.check(request, flags)?;

        let v8m = self.v8m;
        let allocated = &mut self.allocated;

        match request {
            RequestType::Pc => {
                if flags.contains(RequestFlags::CAN_SW_BREAK) {
                    allocated.sw_breaks += 1;
                } else {
                    allocated.breaks += 1;
                }
            }
            RequestType::Cycle => {
                allocated.comps += 1;
                allocated.cycle += 1;
            }
            RequestType::DataLinked2 => {
                allocated.comps += 3;
                allocated.link2nd += 1;
                allocated.value += 1;
            }
            RequestType::DataLinked1 => {
                allocated.comps += 2;
                allocated.value += 1;
                if v8m {
                    allocated.link += 1;
                }
            }
            RequestType::DataValue => {
                allocated.comps += 1;
                allocated.value += 1;
                // A value comparator on ARMv8-M is always linkable, the link is gone with it.
                if v8m {
                    allocated.link += 1;
                }
            }
            RequestType::DataAddress => {
                allocated.comps += 1;
            }
            RequestType::DataRange => {
                allocated.comps += 2;
                allocated.limit += 1;
                allocated.link += 1;
            }
        }

        if flags.contains(RequestFlags::ETM_TRIGGER) {
            allocated.trigger_inputs += 1;
        }

        Ok(())
    }

    /// Release what [`BreakResources::alloc`] took for the same arguments.
    ///
    /// Nothing is released when any of the counters is already zero.
    pub fn free(&mut self, request: RequestType, flags: RequestFlags) -> Result<(), ResourceError> {
        let mut allocated = self.allocated;

        if flags.contains(RequestFlags::ETM_TRIGGER) {
            release(&mut allocated.trigger_inputs, 1)?;
        }

        match request {
            RequestType::Pc => {
                if flags.contains(RequestFlags::CAN_SW_BREAK) {
                    release(&mut allocated.sw_breaks, 1)?;
                } else {
                    release(&mut allocated.breaks, 1)?;
                }
            }
            RequestType::Cycle => {
                release(&mut allocated.comps, 1)?;
                release(&mut allocated.cycle, 1)?;
            }
            RequestType::DataLinked2 => {
                if self.v8m {
                    return Err(ResourceError::NoAlloc);
                }
                release(&mut allocated.comps, 3)?;
                release(&mut allocated.link2nd, 1)?;
                release(&mut allocated.value, 1)?;
            }
            RequestType::DataLinked1 => {
                release(&mut allocated.comps, 2)?;
                release(&mut allocated.value, 1)?;
                if self.v8m {
                    release(&mut allocated.link, 1)?;
                }
            }
            RequestType::DataValue => {
                release(&mut allocated.comps, 1)?;
                release(&mut allocated.value, 1)?;
                if self.v8m {
                    release(&mut allocated.link, 1)?;
                }
            }
            RequestType::DataAddress => {
                release(&mut allocated.comps, 1)?;
            }
            RequestType::DataRange => {
                if !self.v8m {
                    return Err(ResourceError::NoAlloc);
                }
                release(&mut allocated.comps, 2)?;
                release(&mut allocated.limit, 1)?;
                release(&mut allocated.link, 1)?;
            }
        }

        self.allocated = allocated;
        Ok(())
    }

    /// Check that `range` can be watched by one ARMv6/7-M comparator as it is.
    ///
    /// The size must be a power of two the MASK field can express, and the address aligned
    /// to it.
    pub fn check_watch_address(&self, range: &WatchRange) -> Result<(), ResourceError> {
        if self.v8m {
            return Ok(());
        }

        let len = range.len();
        let mask_bits = (0..self.dwt.max_mask_bits)
            .find(|bits| (1u64 << bits) >= len as u64)
            .ok_or(ResourceError::RangeSize)?;

        let size = 1u64 << mask_bits;
        if size != len as u64 {
            return Err(ResourceError::RangeUnaligned);
        }
        if range.address as u64 & (size - 1) != 0 {
            return Err(ResourceError::WatchAddressUnaligned);
        }

        Ok(())
    }

    /// The smallest naturally aligned power of two range covering `range`.
    pub fn adjust_watch_address(&self, range: &WatchRange) -> Result<WatchRange, ResourceError> {
        if self.v8m {
            return Ok(*range);
        }

        let start = range.address;
        let end = range
            .address
            .wrapping_add(range.len().saturating_sub(1));

        let mut mask = u32::MAX;
        let mut mask_bits = 0;
        while mask_bits < self.dwt.max_mask_bits {
            if start & mask == end & mask {
                break;
            }
            mask &= !(1 << mask_bits);
            mask_bits += 1;
        }

        if mask_bits >= self.dwt.max_mask_bits {
            return Err(ResourceError::RangeSize);
        }

        let address = start & mask;
        let bytes = ((end & mask) | !mask) - address + 1;
        let access_size = range.access_size.min(4);

        Ok(WatchRange {
            address,
            access_size,
            count: bytes / access_size,
        })
    }

    /// Revision 1 FPBs only break below 0x2000_0000.
    pub fn check_hw_break_address(&self, address: u32) -> Result<(), ResourceError> {
        if !self.fpb.full_address_space() && address >= FPB_V1_CODE_LIMIT {
            return Err(ResourceError::AddressNotSupported(address));
        }
        Ok(())
    }
}

fn release(counter: &mut u32, amount: u32) -> Result<(), ResourceError> {
    *counter = counter
        .checked_sub(amount)
        .ok_or(ResourceError::NoAlloc)?;
    Ok(())
}
