//! Session configuration.
//!
//! Everything in here is decided once, before the debug port is powered up, and stays fixed
//! for the lifetime of a [`Session`](crate::Session).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::breakpoints::SwBreakConfigItem;
use crate::Error;

/// The wire protocol spoken to the debug port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireProtocol {
    #[default]
    Swd,
    Jtag,
}

impl std::fmt::Display for WireProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireProtocol::Swd => f.write_str("SWD"),
            WireProtocol::Jtag => f.write_str("JTAG"),
        }
    }
}

/// The main struct holding all the possible session options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub protocol: WireProtocol,
    /// Index of the debug port the CPU is reached through.
    pub dp: u8,
    /// Index of the access port the CPU is reached through.
    pub ap: u8,
    /// How long to wait for the debug and system power domains to acknowledge power-up, in
    /// milliseconds.
    pub power_up_timeout: u64,
    /// How often the core register transfer ready flag is polled before giving up.
    pub register_poll_retries: u32,
    pub allow_software_breakpoints: bool,
    /// Allow software breakpoints to be written while the target is running.
    pub set_sw_break_run: bool,
    /// Address ranges with explicit software breakpoint rules.
    pub sw_break_regions: Vec<SwBreakConfigItem>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol: WireProtocol::Swd,
            dp: 0,
            ap: 0,
            power_up_timeout: 1000,
            register_poll_retries: 100,
            allow_software_breakpoints: true,
            set_sw_break_run: false,
            sw_break_regions: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn from_yaml(source: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn power_up_timeout(&self) -> Duration {
        Duration::from_millis(self.power_up_timeout)
    }
}

/// Base addresses of the debug components of the CPU.
///
/// These usually come out of a ROM table walk. The defaults are the architectural
/// Cortex-M locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugTopology {
    /// Core debug block, the address of DHCSR.
    pub dbg: u32,
    pub fpb: Option<u32>,
    pub dwt: Option<u32>,
    pub itm: Option<u32>,
    pub etm: Option<u32>,
    /// Architecture version of the ETM, if one is present.
    pub etm_version: Option<u8>,
}

impl Default for DebugTopology {
    fn default() -> Self {
        Self {
            dbg: 0xE000_EDF0,
            fpb: Some(0xE000_2000),
            dwt: Some(0xE000_1000),
            itm: Some(0xE000_0000),
            etm: None,
            etm_version: None,
        }
    }
}
