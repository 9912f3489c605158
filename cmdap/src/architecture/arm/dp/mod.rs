//! Debug port registers.

use super::Register;
use bitfield::bitfield;
use jep106::JEP106Code;

/// Implements the raw conversions and the [`Register`] trait for a bitfield newtype.
macro_rules! dp_register {
    ($name:ident, $address:expr, $display:expr) => {
        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(raw: $name) -> Self {
                raw.0
            }
        }

        impl Register for $name {
            const ADDRESS: u8 = $address;
            const NAME: &'static str = $display;
        }
    };
}

bitfield! {
    /// ABORT, write only. Clears sticky flags and aborts a stalled AP transaction.
    #[derive(Clone, Copy, Default)]
    pub struct Abort(u32);
    impl Debug;
    pub _, set_orunerrclr: 4;
    pub _, set_wderrclr: 3;
    pub _, set_stkerrclr: 2;
    pub _, set_stkcmpclr: 1;
    pub _, set_dapabort: 0;
}

dp_register!(Abort, 0x0, "ABORT");

impl Abort {
    /// Abort the current AP transaction.
    pub const DAPABORT: u32 = 1 << 0;
    pub const STKCMPCLR: u32 = 1 << 1;
    pub const STKERRCLR: u32 = 1 << 2;
    pub const WDERRCLR: u32 = 1 << 3;
    pub const ORUNERRCLR: u32 = 1 << 4;

    /// Clears every sticky flag without aborting.
    pub fn clear_all() -> Self {
        let mut abort = Abort(0);
        abort.set_stkcmpclr(true);
        abort.set_stkerrclr(true);
        abort.set_wderrclr(true);
        abort.set_orunerrclr(true);
        abort
    }
}

/// Transfer mode of the debug port, CTRL/STAT bits [3:2].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Normal = 0,
    /// Pushed verify: AP writes compare against the target instead of storing.
    PushedVerify = 1,
    PushedCompare = 2,
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Ctrl(u32);
    impl Debug;
    pub csyspwrupack, _: 31;
    pub csyspwrupreq, set_csyspwrupreq: 30;
    pub cdbgpwrupack, _: 29;
    pub cdbgpwrupreq, set_cdbgpwrupreq: 28;
    pub cdbgrstack, _: 27;
    pub c_dbg_rst_req, set_c_dbg_rst_req: 26;
    pub u16, trn_cnt, set_trn_cnt: 23, 12;
    pub u8, mask_lane, set_mask_lane: 11, 8;
    pub w_data_err, set_w_data_err: 7;
    pub read_ok, _: 6;
    pub sticky_err, set_sticky_err: 5;
    pub sticky_cmp, set_sticky_cmp: 4;
    pub u8, trn_mode, set_trn_mode: 3, 2;
    pub sticky_orun, set_sticky_orun: 1;
    pub orun_detect, set_orun_detect: 0;
}

dp_register!(Ctrl, 0x4, "CTRL/STAT");

impl Ctrl {
    pub fn transfer_mode(&self) -> TransferMode {
        match self.trn_mode() {
            1 => TransferMode::PushedVerify,
            2 => TransferMode::PushedCompare,
            _ => TransferMode::Normal,
        }
    }

    pub fn set_transfer_mode(&mut self, mode: TransferMode) {
        self.set_trn_mode(mode as u8);
    }

    /// Both power domains acknowledged their power-up request.
    pub fn powered_up(&self) -> bool {
        self.cdbgpwrupack() && self.csyspwrupack()
    }
}

bitfield! {
    #[derive(Clone, Copy, Default)]
    pub struct Select(u32);
    impl Debug;
    pub u8, ap_sel, set_ap_sel: 31, 24;
    pub u8, ap_bank_sel, set_ap_bank_sel: 7, 4;
    pub u8, dp_bank_sel, set_dp_bank_sel: 3, 0;
}

dp_register!(Select, 0x8, "SELECT");

bitfield! {
    #[derive(Clone, Copy)]
    pub struct RdBuff(u32);
    impl Debug;
    pub u32, data, _: 31, 0;
}

dp_register!(RdBuff, 0xC, "RDBUFF");

bitfield! {
    #[derive(Clone, Copy)]
    pub struct DPIDR(u32);
    impl Debug;
    pub u8, revision, _: 31, 28;
    pub u8, part_no, _: 27, 20;
    pub min, _: 16;
    pub u8, version, _: 15, 12;
    pub u16, designer, _: 11, 1;
    u8, jep_cc, _: 11, 8;
    u8, jep_id, _: 7, 1;
}

dp_register!(DPIDR, 0x0, "DPIDR");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugPortId {
    pub revision: u8,
    pub part_no: u8,
    pub version: DebugPortVersion,
    pub min_dp_support: bool,
    pub designer: JEP106Code,
}

impl From<DPIDR> for DebugPortId {
    fn from(dpidr: DPIDR) -> DebugPortId {
        DebugPortId {
            revision: dpidr.revision(),
            part_no: dpidr.part_no(),
            version: dpidr.version().into(),
            min_dp_support: dpidr.min(),
            designer: JEP106Code::new(dpidr.jep_cc(), dpidr.jep_id()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPortVersion {
    DPv0,
    DPv1,
    DPv2,
    Unsupported,
}

impl From<u8> for DebugPortVersion {
    fn from(value: u8) -> Self {
        match value {
            0 => DebugPortVersion::DPv0,
            1 => DebugPortVersion::DPv1,
            2 => DebugPortVersion::DPv2,
            _ => DebugPortVersion::Unsupported,
        }
    }
}
