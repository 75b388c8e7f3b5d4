//! Error types for the blockio engine
//!
//! Application-visible failures are reported to operation callbacks as
//! negative errno values, the convention the replication layer above the
//! engine speaks. [`Error::to_retval`] performs that mapping; everything
//! that has no errno equivalent is a fatal class the engine does not
//! return but aborts on.

use thiserror::Error;

/// Common result type for blockio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the blockio engine
#[derive(Debug, Error)]
pub enum Error {
    /// A version at or above the requested one already exists
    #[error("object version already exists")]
    VersionExists,

    /// Compare-and-set version precondition failed
    #[error("version compare mismatch")]
    VersionMismatch,

    /// The data area has no free blocks left
    #[error("no space left in data area")]
    NoSpace,

    /// The store was opened read-only
    #[error("store is read-only")]
    ReadOnly,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is shutting down; queued operations are cancelled
    #[error("engine is shutting down")]
    ShuttingDown,

    /// A data checksum did not verify on read
    #[error("checksum mismatch in block {block} at offset {offset}")]
    ChecksumMismatch { block: u64, offset: u64 },

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    /// On-disk state contradicts an invariant; not recoverable in-process
    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Check if this error must abort the process (fail-stop classes)
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption(_) | Self::DiskIo(_))
    }

    /// Map to the negative errno reported on the operation callback
    #[must_use]
    pub fn to_retval(&self) -> i64 {
        let errno = match self {
            Self::VersionExists => libc::EEXIST,
            Self::VersionMismatch => libc::EINTR,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
            Self::InvalidArgument(_) | Self::Configuration(_) => libc::EINVAL,
            Self::ShuttingDown => libc::EPIPE,
            Self::ChecksumMismatch { .. } => libc::EDOM,
            Self::DiskIo(_) | Self::Corruption(_) => libc::EIO,
        };
        -i64::from(errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retval_mapping() {
        assert_eq!(Error::VersionExists.to_retval(), -i64::from(libc::EEXIST));
        assert_eq!(Error::NoSpace.to_retval(), -i64::from(libc::ENOSPC));
        assert_eq!(Error::ShuttingDown.to_retval(), -i64::from(libc::EPIPE));
        assert_eq!(
            Error::ChecksumMismatch { block: 1, offset: 0 }.to_retval(),
            -i64::from(libc::EDOM)
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::corruption("bad meta entry").is_fatal());
        assert!(!Error::VersionExists.is_fatal());
        assert!(!Error::ReadOnly.is_fatal());
    }
}
