//! Access port registers and identification.

#[macro_use]
mod register_generation;
pub mod context;
pub mod memory_ap;

use enum_primitive_derive::Primitive;
use jep106::JEP106Code;
use num_traits::FromPrimitive;

pub use context::{AccessSizes, ApContext, ApContextTable};
pub use memory_ap::{csw, AddressIncrement, DataSize, BD0, BD1, BD2, CSW, DRW, TAR};

/// JEP106 code of ARM Ltd.
pub const ARM_DESIGNER: JEP106Code = JEP106Code { id: 0x3B, cc: 0x4 };

#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApClass {
    #[default]
    Undefined = 0b0000,
    ComAp = 0b0001,
    MemAp = 0b1000,
}

/// The bus an AP is attached to, IDR bits [3:0].
#[derive(Debug, Primitive, Clone, Copy, PartialEq, Eq)]
pub enum ApType {
    JtagComAp = 0x0,
    AmbaAhb3 = 0x1,
    AmbaApb2Apb3 = 0x2,
    AmbaAxi3Axi4 = 0x4,
    AmbaAhb5 = 0x5,
    AmbaApb4Apb5 = 0x6,
    AmbaAxi5 = 0x7,
    AmbaAhb5Hprot = 0x8,
}

define_ap_register!(
    /// Identification Register
    ///
    /// Identifies the designer, class and bus type of the access port.
    name: IDR,
    address: 0xFC,
    fields: [
        revision: u8,
        designer: JEP106Code,
        class: ApClass,
        variant: u8,
        ty: u8,
    ],
    from: value => IDR {
        revision: ((value >> 28) & 0x0F) as u8,
        designer: JEP106Code::new(((value >> 24) & 0x0F) as u8, ((value >> 17) & 0x7F) as u8),
        class: ApClass::from_u8(((value >> 13) & 0x0F) as u8).unwrap_or_default(),
        variant: ((value >> 4) & 0x0F) as u8,
        ty: (value & 0x0F) as u8,
    },
    to: value => (u32::from(value.revision) << 28)
        | (u32::from(value.designer.cc) << 24)
        | (u32::from(value.designer.id) << 17)
        | ((value.class as u32) << 13)
        | (u32::from(value.variant) << 4)
        | u32::from(value.ty)
);

impl IDR {
    pub fn ap_type(&self) -> Option<ApType> {
        ApType::from_u8(self.ty)
    }

    /// The combined variant and type byte, which ARM uses to tell its AP implementations apart.
    pub fn id(&self) -> u8 {
        (self.variant << 4) | self.ty
    }

    pub fn is_arm(&self) -> bool {
        self.designer == ARM_DESIGNER
    }

    pub fn is_memory_ap(&self) -> bool {
        self.class == ApClass::MemAp
    }

    /// Identifies one of the ARM designed memory APs this crate has dedicated handling for.
    pub fn known_ap(&self) -> Option<KnownAp> {
        if !self.is_arm() || !self.is_memory_ap() {
            return None;
        }

        KnownAp::from_id(self.id())
    }
}

/// Memory access ports designed by ARM, keyed by the IDR variant and type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownAp {
    /// CoreSight AHB-AP.
    AhbCoreSight,
    AhbCortexM3,
    AhbCortexM0,
    AhbCortexM0Plus,
    AhbCortexM7,
    Ahb5Soc600,
    Ahb5CortexM33,
    Ahb5CortexM23,
    /// CoreSight APB-AP.
    ApbCoreSight,
    /// CoreSight AXI-AP.
    AxiCoreSight,
}

impl KnownAp {
    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0x01 => KnownAp::AhbCoreSight,
            0x11 => KnownAp::AhbCortexM3,
            0x21 => KnownAp::AhbCortexM0,
            0x31 => KnownAp::AhbCortexM0Plus,
            0x41 => KnownAp::AhbCortexM7,
            0x05 => KnownAp::Ahb5Soc600,
            0x15 => KnownAp::Ahb5CortexM33,
            0x25 => KnownAp::Ahb5CortexM23,
            0x02 => KnownAp::ApbCoreSight,
            0x04 => KnownAp::AxiCoreSight,
            _ => return None,
        })
    }
}
