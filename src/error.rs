// Intel DSA/IAA Userspace Submission Engine
// SPDX-License-Identifier: MIT

//! Error types for engine operations.

use thiserror::Error;

/// Errors returned by submission-path APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller mistake: bad alignment, unsupported PI parameters,
    /// unsupported vectored compress/decompress, etc.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The descriptor free stack or the open batch is out of slots.
    ///
    /// This is the engine's backpressure signal: nothing is queued on top
    /// of the hardware work queue, the caller retries after polling.
    #[error("descriptor pool exhausted")]
    PoolExhausted,

    /// A virtual page could not be translated to a physical address.
    #[error("address translation failed")]
    Translation,

    /// The device flagged a non-success completion status.
    #[error("device reported completion status {status:#04x}")]
    DeviceError { status: u8 },

    /// The device reported a protection-information (DIF) failure.
    #[error("protection information check failed")]
    Integrity,

    /// The driver backend cannot be changed once selected.
    #[error("driver backend already selected")]
    AlreadyInitialized,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Completion status delivered to request callbacks.
///
/// Device-side failures surface here rather than as [`Error`] returns:
/// submission is asynchronous and the outcome is only known when the
/// completion poller reaps the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Operation completed successfully.
    Success,
    /// The operation was cancelled before reaching the device
    /// (open batch torn down on channel release or rollback).
    Cancelled,
    /// Compare operation found the buffers unequal.
    Mismatch,
    /// The device reported a failure status byte.
    DeviceError(u8),
    /// The device reported a DIF check failure.
    Integrity,
}

impl OpStatus {
    /// Returns true if the operation completed without error.
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(OpStatus::Success.is_success());
        assert!(!OpStatus::Cancelled.is_success());
        assert!(!OpStatus::DeviceError(0x03).is_success());
        assert!(!OpStatus::Integrity.is_success());
    }

    #[test]
    fn test_error_display() {
        let err = Error::DeviceError { status: 0x13 };
        assert_eq!(err.to_string(), "device reported completion status 0x13");
        assert_eq!(Error::PoolExhausted.to_string(), "descriptor pool exhausted");
    }
}
