//! Register transports that do not need hardware.

pub mod fake_probe;

pub use fake_probe::{FakeAp, FakeProbe, FakeStats};
