//! The parts of DAP handling that differ between SWD and JTAG.

use std::fmt::Debug;

use super::dp::{Abort, Ctrl};
use super::{ArmError, DapError, PortType, RawDapAccess, Register};
use crate::config::WireProtocol;

/// Protocol specific error recovery and power-up details.
///
/// One implementation is picked when the session is created, everything above this
/// trait is protocol agnostic.
pub trait DapProtocol: Debug + Send + Sync {
    fn wire_protocol(&self) -> WireProtocol;

    /// Recover the DAP after a failed transfer and return the error to report.
    ///
    /// Timeouts abort the stalled AP transaction and become a memory fault, so the caller
    /// can decide whether the access is worth a retry.
    fn recover(&self, probe: &mut dyn RawDapAccess, error: DapError) -> ArmError {
        match error {
            DapError::Timeout => {
                tracing::debug!("Transfer timed out, aborting the AP transaction");
                match probe.raw_abort(Abort::DAPABORT) {
                    Ok(()) => ArmError::MemoryFault,
                    Err(e) => ArmError::Dap(e),
                }
            }
            DapError::StickyError => match self.clear_sticky(probe) {
                Ok(()) => ArmError::MemoryFault,
                Err(e) => ArmError::Dap(e),
            },
            DapError::Failure => ArmError::Dap(DapError::Failure),
        }
    }

    /// Whether CTRL/STAT reports a failed transaction.
    fn sticky_error(&self, ctrl: Ctrl) -> bool;

    /// Clear the sticky error flags reported in CTRL/STAT.
    fn clear_sticky(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError>;

    /// Clear the sticky flags a pushed verify may leave behind, including STICKYCMP.
    fn clear_compare(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        self.clear_sticky(probe)
    }

    /// Clear whatever error state the DP may hold before it is powered up.
    fn clear_errors(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError>;

    /// The CTRL/STAT value written once both power domains are up.
    fn powered_ctrl(&self) -> Ctrl {
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_mask_lane(0b1111);
        ctrl
    }
}

/// Serial Wire Debug.
///
/// Sticky flags are cleared through the ABORT register.
#[derive(Debug, Default, Clone, Copy)]
pub struct Swd;

impl DapProtocol for Swd {
    fn wire_protocol(&self) -> WireProtocol {
        WireProtocol::Swd
    }

    fn sticky_error(&self, ctrl: Ctrl) -> bool {
        ctrl.sticky_err() || ctrl.w_data_err()
    }

    fn clear_sticky(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        tracing::debug!("Clearing sticky error flags via ABORT");
        probe.raw_abort(Abort::STKERRCLR | Abort::WDERRCLR)
    }

    fn clear_compare(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        probe.raw_abort(Abort::STKERRCLR | Abort::STKCMPCLR | Abort::WDERRCLR)
    }

    fn clear_errors(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        probe.raw_abort(Abort::clear_all().into())
    }
}

/// JTAG.
///
/// The ABORT scan chain cannot clear sticky flags, they are write-one-to-clear bits of
/// CTRL/STAT instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct Jtag;

impl DapProtocol for Jtag {
    fn wire_protocol(&self) -> WireProtocol {
        WireProtocol::Jtag
    }

    fn sticky_error(&self, ctrl: Ctrl) -> bool {
        ctrl.sticky_err()
    }

    fn clear_sticky(&self, probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        let ctrl = probe.raw_read_register(PortType::DebugPort, Ctrl::ADDRESS)?;
        tracing::debug!("Clearing sticky error flags, CTRL/STAT = {:#010x}", ctrl);
        probe.raw_write_register(PortType::DebugPort, Ctrl::ADDRESS, ctrl)
    }

    fn clear_errors(&self, _probe: &mut dyn RawDapAccess) -> Result<(), DapError> {
        Ok(())
    }

    fn powered_ctrl(&self) -> Ctrl {
        let mut ctrl = Ctrl::default();
        ctrl.set_cdbgpwrupreq(true);
        ctrl.set_csyspwrupreq(true);
        ctrl.set_mask_lane(0b1111);
        ctrl.set_sticky_err(true);
        ctrl.set_sticky_cmp(true);
        ctrl.set_sticky_orun(true);
        ctrl
    }
}

impl From<WireProtocol> for Box<dyn DapProtocol> {
    fn from(protocol: WireProtocol) -> Self {
        match protocol {
            WireProtocol::Swd => Box::new(Swd),
            WireProtocol::Jtag => Box::new(Jtag),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn jtag_clears_sticky_bits_on_power_up() {
        assert_eq!(u32::from(Swd.powered_ctrl()), 0x5000_0F00);
        assert_eq!(u32::from(Jtag.powered_ctrl()), 0x5000_0F32);
    }

    #[test]
    fn write_data_error_is_sticky_on_swd_only() {
        let mut ctrl = Ctrl::default();
        ctrl.set_w_data_err(true);

        assert!(Swd.sticky_error(ctrl));
        assert!(!Jtag.sticky_error(ctrl));
    }
}
