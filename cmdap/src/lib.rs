//! # Debug access for ARM Cortex-M targets
//!
//! This crate sits between a raw JTAG/SWD register transport and a debugger's run control.
//! It keeps a cached view of every memory access port it touches, turns arbitrary memory
//! requests into the cheapest sequence of DP/AP transfers, and hands out the target's
//! breakpoint and watchpoint comparators.
//!
//! # Examples
//!
//! ## Reading from RAM
//!
//! ```no_run
//! # use cmdap::Error;
//! use cmdap::architecture::arm::{memory::AccessAttributes, RawDapAccess};
//! use cmdap::{DebugTopology, Session, SessionConfig};
//!
//! # fn transport() -> Box<dyn RawDapAccess> { unimplemented!() }
//! let probe: Box<dyn RawDapAccess> = transport();
//! let session = Session::connect(probe, SessionConfig::default(), DebugTopology::default())?;
//!
//! let mut buffer = [0u8; 13];
//! session.read_arm_mem(0x2000_0003, &mut buffer, AccessAttributes::default())?;
//! # Ok::<(), Error>(())
//! ```
//!
//! ## Allocating a watchpoint
//!
//! ```no_run
//! # use cmdap::Error;
//! # use cmdap::Session;
//! use cmdap::breakpoints::{AllocMode, Breakpoint};
//!
//! # fn session() -> Session { unimplemented!() }
//! let mut session = session();
//! let mut watch = Breakpoint::watch(0x2000_1000, 4, 1);
//! let outcome = session.alloc_breakpoint(AllocMode::Allocate, &watch, &[])?;
//! watch.apply(&outcome);
//! # Ok::<(), Error>(())
//! ```

pub mod architecture;
pub mod breakpoints;
pub mod config;
mod error;
#[cfg(any(test, feature = "test"))]
pub mod probe;
mod session;

pub use crate::architecture::arm::DeviceMonitor;
pub use crate::config::{DebugTopology, SessionConfig};
pub use crate::error::{Error, ErrorKind};
pub use crate::session::Session;
