//! Memory access port
//!
//! The memory AP can be used to access a memory-mapped
//! set of debug resources of the attached system.

use bitfield::bitfield;
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::architecture::arm::Register;

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataSize {
    U8 = 0b000,
    U16 = 0b001,
    #[default]
    U32 = 0b010,
}

impl DataSize {
    pub fn to_byte_count(self) -> usize {
        match self {
            DataSize::U8 => 1,
            DataSize::U16 => 2,
            DataSize::U32 => 4,
        }
    }
}

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressIncrement {
    Off = 0b00,
    #[default]
    Single = 0b01,
    Packed = 0b10,
}

/// Bit definitions of the Control/Status Word.
///
/// The engine composes CSW values from raw masks because the meaning of the protection bits
/// depends on the bus the AP is attached to.
pub mod csw {
    pub const SIZE: u32 = 0x0000_0007;
    pub const SIZE8: u32 = 0x0000_0000;
    pub const SIZE16: u32 = 0x0000_0001;
    pub const SIZE32: u32 = 0x0000_0002;
    pub const ADDRINC: u32 = 0x0000_0030;
    pub const NADDRINC: u32 = 0x0000_0000;
    pub const SADDRINC: u32 = 0x0000_0010;
    pub const PADDRINC: u32 = 0x0000_0020;
    pub const DBGSTAT: u32 = 0x0000_0040;
    pub const TINPROG: u32 = 0x0000_0080;
    pub const SPIDEN: u32 = 0x0080_0000;
    pub const HPROT: u32 = 0x7F00_0000;
    pub const RESERVED: u32 = 0x0100_0000;
    pub const HPROT_PRIV: u32 = 0x0200_0000;
    pub const HPROT_CACHE: u32 = 0x0800_0000;
    pub const MSTRDBG: u32 = 0x2000_0000;
    pub const SPROT: u32 = 0x4000_0000;
    pub const DBGSWENABLE: u32 = 0x8000_0000;
    /// Bits of an AHB-AP CSW the debugger may write.
    pub const RWBITS: u32 = 0xFF00_0F77;

    pub const AXI_RWBITS: u32 = 0xFF00_7F77;
    pub const AXI_SPROT: u32 = 0x2000_0000;
    pub const AXI_PRIV: u32 = 0x1000_0000;
    pub const AXI_DOM: u32 = 0x0000_6000;
    /// Shareable, system domain.
    pub const AXI_DOM_SHSYS: u32 = 0x0000_6000;
    pub const AXI_ACE_ENA: u32 = 0x0000_1000;

    /// Privileged, debug master, data access.
    pub const DEFAULT_BASE: u32 = RESERVED | MSTRDBG | HPROT_PRIV | DBGSTAT;
}

bitfield! {
    /// Control and Status Word register
    ///
    /// The control and status word register (CSW) is used
    /// to configure memory access through the memory AP.
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct CSW(u32);
    impl Debug;
    pub dbg_sw_enable, set_dbg_sw_enable: 31;
    pub u8, prot, set_prot: 30, 24;
    pub spiden, _: 23;
    pub u8, mode, _: 11, 8;
    pub tr_in_prog, _: 7;
    pub device_en, _: 6;
    pub u8, addr_inc_raw, set_addr_inc_raw: 5, 4;
    pub u8, size_raw, set_size_raw: 2, 0;
}

impl CSW {
    /// The transfer size, or `None` if the AP reports a size this crate never programs.
    pub fn size(&self) -> Option<DataSize> {
        DataSize::from_u8(self.size_raw())
    }

    pub fn set_size(&mut self, size: DataSize) {
        self.set_size_raw(size as u8);
    }

    pub fn addr_inc(&self) -> Option<AddressIncrement> {
        AddressIncrement::from_u8(self.addr_inc_raw())
    }

    pub fn set_addr_inc(&mut self, increment: AddressIncrement) {
        self.set_addr_inc_raw(increment as u8);
    }
}

impl From<u32> for CSW {
    fn from(raw: u32) -> Self {
        CSW(raw)
    }
}

impl From<CSW> for u32 {
    fn from(raw: CSW) -> Self {
        raw.0
    }
}

impl Register for CSW {
    const ADDRESS: u8 = 0x00;
    const NAME: &'static str = "CSW";
}

define_ap_register!(
    /// Transfer Address Register
    ///
    /// The transfer address register (TAR) holds the memory
    /// address which will be accessed through a read or
    /// write of the DRW register.
    name: TAR,
    address: 0x04,
    fields: [address: u32],
    from: value => TAR { address: value },
    to: value => value.address
);

define_ap_register!(
    /// Data Read/Write register
    ///
    /// A write to the *DRW* register is translated to a memory write
    /// to the address specified in the TAR register.
    ///
    /// A read from the *DRW* register is translated to a memory read
    /// from the address specified in the TAR register.
    name: DRW,
    address: 0x0C,
    fields: [data: u32],
    from: value => DRW { data: value },
    to: value => value.data
);

define_ap_register!(
    /// Banked Data 0 register, the word at `TAR & !0xF`.
    name: BD0,
    address: 0x10,
    fields: [data: u32],
    from: value => BD0 { data: value },
    to: value => value.data
);

define_ap_register!(
    /// Banked Data 1 register, the word at `(TAR & !0xF) + 4`.
    name: BD1,
    address: 0x14,
    fields: [data: u32],
    from: value => BD1 { data: value },
    to: value => value.data
);

define_ap_register!(
    /// Banked Data 2 register, the word at `(TAR & !0xF) + 8`.
    name: BD2,
    address: 0x18,
    fields: [data: u32],
    from: value => BD2 { data: value },
    to: value => value.data
);

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn csw_size_and_increment() {
        let mut value = CSW::from(csw::DEFAULT_BASE);
        value.set_size(DataSize::U16);
        value.set_addr_inc(AddressIncrement::Packed);

        assert_eq!(u32::from(value), csw::DEFAULT_BASE | csw::SIZE16 | csw::PADDRINC);
        assert_eq!(value.size(), Some(DataSize::U16));
        assert_eq!(value.addr_inc(), Some(AddressIncrement::Packed));
    }

    #[test]
    fn size_codes_match_masks() {
        assert_eq!(DataSize::U8 as u32, csw::SIZE8);
        assert_eq!(DataSize::U16 as u32, csw::SIZE16);
        assert_eq!(DataSize::U32 as u32, csw::SIZE32);
        assert_eq!((AddressIncrement::Single as u32) << 4, csw::SADDRINC);
    }
}
