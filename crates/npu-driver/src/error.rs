//! Error types for NPU driver operations

use npu_chip::tee;
use npu_models::{ContainerError, SizingError};
use std::fmt;
use thiserror::Error;

/// Result type alias for NPU driver operations
pub type Result<T> = std::result::Result<T, NpuError>;

/// Why an execution did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No completion within the run timeout
    Timeout,
    /// Completion interrupt with an empty status word
    SpuriousInterrupt,
    /// Bus error on the accelerator memory port
    BusError,
    /// Accelerator MMU exception
    MmuException,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::SpuriousInterrupt => write!(f, "spurious interrupt"),
            Self::BusError => write!(f, "bus error"),
            Self::MmuException => write!(f, "MMU exception"),
        }
    }
}

/// Errors that can occur during NPU operations
#[derive(Debug, Error)]
pub enum NpuError {
    /// Container failed validation
    #[error("Invalid container: {source}")]
    Format {
        /// Parser error
        #[from]
        source: ContainerError,
    },

    /// Container is valid but cannot be sized
    #[error("Cannot size container: {source}")]
    Sizing {
        /// Sizing error
        #[from]
        source: SizingError,
    },

    /// Memory could not be provided
    #[error("Resource failure: {reason}")]
    Resource {
        /// Reason for failure
        reason: String,
    },

    /// The trusted side rejected a command
    #[error("{} failed: {} ({code:#010x})", tee::command_name(*command), tee::describe(*code))]
    Protocol {
        /// Command id
        command: u32,
        /// Result code
        code: u32,
    },

    /// The accelerator faulted; it has been deactivated
    #[error("Hardware fault: {kind}")]
    HardwareFault {
        /// Fault classification
        kind: FaultKind,
    },

    /// Caller misuse
    #[error("Invalid usage: {reason}")]
    Usage {
        /// Reason for rejection
        reason: String,
    },

    /// Hardware reserved by another session
    #[error("NPU reserved by session {holder}")]
    Busy {
        /// Session holding the reservation
        holder: u64,
    },

    /// Stale or unknown handle
    #[error("No {kind} with handle {handle:#x}")]
    NotFound {
        /// Handle namespace
        kind: &'static str,
        /// Raw handle value
        handle: u64,
    },
}

impl NpuError {
    /// Create a resource error
    pub fn resource(reason: impl Into<String>) -> Self {
        Self::Resource {
            reason: reason.into(),
        }
    }

    /// Create a usage error
    pub fn usage(reason: impl Into<String>) -> Self {
        Self::Usage {
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: &'static str, handle: u64) -> Self {
        Self::NotFound { kind, handle }
    }

    /// Create a protocol error
    pub fn protocol(command: u32, code: u32) -> Self {
        Self::Protocol { command, code }
    }

    /// Result code if this is a protocol error
    pub fn protocol_code(&self) -> Option<u32> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}
