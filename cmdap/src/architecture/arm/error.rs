use super::ap::memory_ap::DataSize;
use super::memory::AccessDirection;
use crate::ErrorKind;

/// Status of a single transfer as reported by the register transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DapError {
    #[error("The transfer timed out")]
    Timeout,
    #[error("A sticky error flag is set in the debug port")]
    StickyError,
    #[error("The transfer failed")]
    Failure,
}

impl DapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DapError::Timeout => ErrorKind::TransportTimeout,
            DapError::StickyError => ErrorKind::MemoryAccess,
            DapError::Failure => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    /// A transfer faulted on the target bus. The engine upgrades this into
    /// [`ArmError::MemoryAccess`] once the faulting address is known.
    #[error("The target did not complete the memory transaction")]
    MemoryFault,
    #[error("Failed to {direction} {size} byte(s) at address {address:#010x}")]
    MemoryAccess {
        address: u32,
        direction: AccessDirection,
        size: u8,
    },
    #[error("The access port does not support {0:?} transfers")]
    UnsupportedAccessSize(DataSize),
    #[error("Failed to access address {address:#010x} as it is not aligned to {alignment} bytes")]
    MemoryNotAligned { address: u32, alignment: usize },
    #[error("A block transfer of {len} bytes at {address:#010x} does not fit the {page} byte auto-increment page")]
    InvalidBlockLength { address: u32, len: usize, page: u32 },
    #[error("No registers were selected for transfer")]
    EmptyRegisterMask,
    #[error("Core register {0} cannot be transferred on its own")]
    InvalidCoreRegister(usize),
    #[error("There is no access port {ap} on debug port {dp}")]
    InvalidAccessPort { dp: usize, ap: usize },
    #[error("Timeout while powering up the debug domain")]
    PowerUpTimeout,
    #[error("Timeout while waiting for the core register transfer to complete")]
    RegisterTransferTimeout,
    #[error("The CPU with CPUID {0:#010x} is not supported")]
    UnsupportedCpu(u32),
    #[error("Re-entrant access to the debug interface while a transaction is in progress")]
    Reentrant,
    #[error("Failed to convert target data")]
    Conversion(#[from] scroll::Error),
    #[error("Error in the register transport")]
    Dap(#[from] DapError),
}

impl ArmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArmError::MemoryFault | ArmError::MemoryAccess { .. } => ErrorKind::MemoryAccess,
            ArmError::UnsupportedAccessSize(_) => ErrorKind::UnsupportedAccessSize,
            ArmError::MemoryNotAligned { .. }
            | ArmError::InvalidBlockLength { .. }
            | ArmError::EmptyRegisterMask
            | ArmError::InvalidCoreRegister(_) => ErrorKind::InvalidRequest,
            ArmError::InvalidAccessPort { .. } | ArmError::Reentrant | ArmError::Conversion(_) => {
                ErrorKind::Internal
            }
            ArmError::PowerUpTimeout | ArmError::RegisterTransferTimeout => {
                ErrorKind::TransportTimeout
            }
            ArmError::UnsupportedCpu(_) => ErrorKind::UnsupportedTarget,
            ArmError::Dap(e) => e.kind(),
        }
    }

    /// Whether this is a fault of a target memory transaction, as opposed to a broken link.
    pub fn is_memory_error(&self) -> bool {
        matches!(self, ArmError::MemoryFault | ArmError::MemoryAccess { .. })
    }

    /// Attach the address of a failed access to a bare memory fault.
    pub(crate) fn at(self, address: u32, direction: AccessDirection, size: DataSize) -> Self {
        match self {
            ArmError::MemoryFault => ArmError::MemoryAccess {
                address,
                direction,
                size: size.to_byte_count() as u8,
            },
            other => other,
        }
    }
}
