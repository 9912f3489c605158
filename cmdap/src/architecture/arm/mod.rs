//! All the interface bits for ARM.

pub mod ap;
pub(crate) mod communication_interface;
pub mod component;
pub mod core;
pub mod dp;
mod error;
pub mod memory;
mod protocol;
mod traits;

pub use communication_interface::{ArmCommunicationInterface, DapInterface, DeviceMonitor};
pub use error::{ArmError, DapError};
pub use protocol::{DapProtocol, Jtag, Swd};
pub use traits::*;

/// A DP or AP register with a fixed address.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + std::fmt::Debug {
    const ADDRESS: u8;
    const NAME: &'static str;
}
