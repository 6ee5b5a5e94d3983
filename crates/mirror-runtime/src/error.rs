//! Error taxonomy shared by the runtimes and the mirrored buffers

use std::fmt;

/// Result type for runtime and buffer operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Which side of a mirrored pair an allocation targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Host,
    Device,
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Host => f.write_str("host"),
            Region::Device => f.write_str("device"),
        }
    }
}

/// Direction of a copy between the host and the accelerator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::HostToDevice => f.write_str("host-to-device"),
            TransferDirection::DeviceToHost => f.write_str("device-to-host"),
        }
    }
}

/// Fieldless category of a [`MirrorError`], for matching without destructuring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    AllocationFailure,
    TransferFailure,
    BindingFailure,
    InvalidState,
}

/// Errors reported by runtimes, launch planning and mirrored buffers
///
/// Nothing in this workspace retries or terminates on these; they are handed
/// to the immediate caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MirrorError {
    /// Bad input to a pure computation or a runtime call
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Host or device memory could not be allocated
    #[error("{region} allocation of {bytes} bytes failed: {reason}")]
    AllocationFailure { region: Region, bytes: usize, reason: String },

    /// A copy was rejected by the runtime
    #[error("{direction} transfer failed: {reason}")]
    TransferFailure { direction: TransferDirection, reason: String },

    /// A texture descriptor was rejected by the runtime
    #[error("texture binding failed: {0}")]
    BindingFailure(String),

    /// Operation attempted on a buffer or handle that is not in a usable state
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl MirrorError {
    /// Category of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            MirrorError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MirrorError::AllocationFailure { .. } => ErrorKind::AllocationFailure,
            MirrorError::TransferFailure { .. } => ErrorKind::TransferFailure,
            MirrorError::BindingFailure(_) => ErrorKind::BindingFailure,
            MirrorError::InvalidState(_) => ErrorKind::InvalidState,
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a binding failure
    pub fn binding(msg: impl Into<String>) -> Self {
        Self::BindingFailure(msg.into())
    }

    /// Create an allocation failure
    pub fn allocation(region: Region, bytes: usize, reason: impl fmt::Display) -> Self {
        Self::AllocationFailure {
            region,
            bytes,
            reason: reason.to_string(),
        }
    }

    /// Create a transfer failure
    pub fn transfer(direction: TransferDirection, reason: impl fmt::Display) -> Self {
        Self::TransferFailure {
            direction,
            reason: reason.to_string(),
        }
    }
}
