use crate::architecture::arm::{ArmError, DapError};
use crate::breakpoints::{ResourceError, ResourceKind, SwBreakConfigError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An ARM specific error occurred")]
    Arm(#[from] ArmError),
    #[error("Breakpoint resource allocation failed")]
    Resource(#[from] ResourceError),
    #[error("Software breakpoint configuration rejected")]
    SwBreakConfig(#[from] SwBreakConfigError),
    #[error("Failed to parse the session configuration")]
    Config(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DapError> for Error {
    fn from(error: DapError) -> Self {
        Error::Arm(ArmError::Dap(error))
    }
}

/// The class of an error, used by callers to decide between retrying, giving up, or
/// reporting a specific message to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The debug link did not answer in time.
    TransportTimeout,
    /// The target refused or could not complete a memory transaction.
    MemoryAccess,
    /// The access port cannot perform transfers of the requested width.
    UnsupportedAccessSize,
    /// All units of a hardware resource are in use.
    ResourceExhausted(ResourceKind),
    /// The target does not implement a hardware resource at all.
    UnsupportedConfiguration(ResourceKind),
    /// The target CPU is not one this crate knows how to drive.
    UnsupportedTarget,
    /// The caller passed arguments that can never succeed.
    InvalidRequest,
    /// Bookkeeping went out of sync or the debug link itself is broken.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Arm(e) => e.kind(),
            Error::Resource(e) => e.kind(),
            Error::SwBreakConfig(e) => e.kind(),
            Error::Config(_) => ErrorKind::InvalidRequest,
            Error::Other(_) => ErrorKind::Internal,
        }
    }
}
