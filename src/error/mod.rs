//! Error taxonomy for the pass-through core.
//!
//! Every underlying filesystem failure is classified at the point of
//! occurrence and converted into exactly one errno reply at the handler
//! boundary. Only two kinds reach the caller: "no such entry" and
//! "I/O error".

use rfuse3::Errno;
use std::fmt;

/// Failure of a pass-through operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The requested inode or path does not resolve.
    NotFound,
    /// The underlying filesystem call failed.
    OperationFailed,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn errno(self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::OperationFailed => libc::EIO,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such entry"),
            FsError::OperationFailed => write!(f, "I/O error"),
        }
    }
}

impl std::error::Error for FsError {}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::OperationFailed,
        }
    }
}

impl From<FsError> for Errno {
    fn from(e: FsError) -> Self {
        e.errno().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_classification() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(FsError::from(missing), FsError::NotFound);

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(FsError::from(denied), FsError::OperationFailed);
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::OperationFailed.errno(), libc::EIO);
    }
}
