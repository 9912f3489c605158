//! Debug components next to the CPU that hold breakpoint and watchpoint comparators.

pub mod dwt;
pub mod fpb;

pub use dwt::{detect_dwt, DwtInfo};
pub use fpb::{detect_fpb, FpbInfo};

bitflags::bitflags! {
    /// What the ETM can do with DWT comparator outputs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EtmCapabilities: u32 {
        const IMPLEMENTED = 0x01;
        /// Trace can be started and stopped by an event.
        const START_STOP = 0x02;
        /// DWT comparators can feed the start/stop logic.
        const START_STOP_DWT = 0x04;
    }
}

/// Trace capabilities of the ETM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EtmInfo {
    pub capabilities: EtmCapabilities,
    /// Number of DWT comparator outputs wired into the ETM.
    pub dwt_inputs: u32,
}

impl EtmInfo {
    /// Only an ETMv3 is driven, its DWT inputs mirror the DWT comparators.
    pub fn from_version(version: Option<u8>, dwt: &DwtInfo) -> Self {
        match version {
            Some(3) => EtmInfo {
                capabilities: EtmCapabilities::IMPLEMENTED
                    | EtmCapabilities::START_STOP
                    | EtmCapabilities::START_STOP_DWT,
                dwt_inputs: dwt.num_comps,
            },
            _ => EtmInfo::default(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn etm_v3_uses_dwt_inputs() {
        let dwt = DwtInfo {
            num_comps: 4,
            ..Default::default()
        };

        let etm = EtmInfo::from_version(Some(3), &dwt);
        assert!(etm.capabilities.contains(EtmCapabilities::START_STOP_DWT));
        assert_eq!(etm.dwt_inputs, 4);

        assert_eq!(EtmInfo::from_version(Some(4), &dwt), EtmInfo::default());
        assert_eq!(EtmInfo::from_version(None, &dwt), EtmInfo::default());
    }
}
