use crate::task::TaskId;
use std::io::{self, Error};

/// A centralized error type for every task, table and hardware operation.
#[derive(thiserror::Error, Debug)]
pub enum VipError {
    /// Malformed ids, out-of-range subtask index, core range overflow. Rejected
    /// synchronously, nothing was mutated.
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// A table or queue is at capacity. The caller may retry once resources
    /// have been released.
    #[error("Out of resource: {0}")]
    OutOfResource(String),

    /// The operation is disabled on this build, or a process is trying to touch
    /// a task it does not own.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The same task id is still queued or running on the hardware.
    #[error("Task {0} is already submitted")]
    AlreadySubmitted(TaskId),

    /// The hardware did not complete within its budget and could not be
    /// recovered.
    #[error("FATAL: hardware timed out")]
    Timeout,

    /// Generic internal fault (signal, thread or hardware programming failure).
    #[error("FATAL: {0}")]
    Failure(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A catch-all for any other type of unexpected error.
    #[error("An unexpected error occurred: {0}")]
    Other(#[from] anyhow::Error),
}

impl VipError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        VipError::InvalidArguments(msg.into())
    }

    pub(crate) fn out_of_resource(msg: impl Into<String>) -> Self {
        VipError::OutOfResource(msg.into())
    }

    pub(crate) fn not_supported(msg: impl Into<String>) -> Self {
        VipError::NotSupported(msg.into())
    }

    pub(crate) fn failure(msg: impl Into<String>) -> Self {
        VipError::Failure(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, VipError::OutOfResource(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, VipError::Timeout | VipError::Failure(_))
    }
}

impl PartialEq for VipError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidArguments(_), Self::InvalidArguments(_)) => true,
            (Self::OutOfResource(_), Self::OutOfResource(_)) => true,
            (Self::NotSupported(_), Self::NotSupported(_)) => true,
            (Self::AlreadySubmitted(a), Self::AlreadySubmitted(b)) => a == b,
            (Self::Timeout, Self::Timeout) => true,
            (Self::Failure(_), Self::Failure(_)) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl From<VipError> for io::Error {
    fn from(e: VipError) -> Self {
        match e {
            VipError::Io(io_err) => io_err,
            VipError::Timeout => Error::new(io::ErrorKind::TimedOut, e.to_string()),
            _ => Error::other(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(VipError: Send, Sync);

    #[test]
    fn test_retryable_and_fatal() {
        assert!(VipError::out_of_resource("table full").is_retryable());
        assert!(!VipError::invalid("bad id").is_retryable());

        assert!(VipError::Timeout.is_fatal());
        assert!(VipError::failure("thread").is_fatal());
        assert!(!VipError::not_supported("pid").is_fatal());
    }

    #[test]
    fn test_timeout_maps_to_io_timed_out() {
        let err: io::Error = VipError::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
