//! Error taxonomy for share operations.
//!
//! Backends translate host failures into [`VfsError`] exactly once, through the
//! `From<io::Error>` impl below. Everything above the backend passes errors
//! through unchanged.

use std::io;

use thiserror::Error;

/// Result type used throughout the crate.
pub type VfsResult<T> = Result<T, VfsError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("cross-device link: {0}")]
    CrossDevice(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A byte-range lock held by another owner covers the requested range.
    /// The remote client may retry.
    #[error("byte range locked: {0}")]
    LockConflict(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("range too large: {0}")]
    RangeTooLarge(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// The data reached the backend but could not be made durable.
    #[error("flush failed after write: {0}")]
    FlushFailure(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("buffer too small: need {needed} bytes, have {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("not supported: {0}")]
    Unsupported(String),
}

impl VfsError {
    /// Build an error from a raw errno value.
    pub fn from_errno(errno: i32, context: impl Into<String>) -> Self {
        let context = context.into();
        match errno {
            libc::ENOENT | libc::ENODATA => VfsError::NotFound(context),
            libc::EACCES | libc::EPERM | libc::EROFS | libc::ETXTBSY => {
                VfsError::PermissionDenied(context)
            }
            libc::EEXIST => VfsError::Exists(context),
            libc::ENOTEMPTY => VfsError::NotEmpty(context),
            libc::EXDEV => VfsError::CrossDevice(context),
            libc::ENAMETOOLONG | libc::ELOOP => VfsError::InvalidName(context),
            libc::EINVAL | libc::EBADF => VfsError::InvalidOperation(context),
            libc::EAGAIN | libc::EDEADLK => VfsError::LockConflict(context),
            libc::ENOSPC | libc::EDQUOT => VfsError::NoSpace(context),
            libc::ERANGE | libc::E2BIG | libc::EFBIG | libc::EOVERFLOW => {
                VfsError::RangeTooLarge(context)
            }
            libc::EISDIR => VfsError::IsDirectory(context),
            libc::ENOTDIR => VfsError::NotDirectory(context),
            libc::ENOMEM => VfsError::NoMemory(context),
            libc::ENOTSUP | libc::ENOSYS => VfsError::Unsupported(context),
            _ => VfsError::IoFailure(context),
        }
    }

    /// The POSIX errno a caller speaking errno would report.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::PermissionDenied(_) => libc::EACCES,
            VfsError::Exists(_) => libc::EEXIST,
            VfsError::NotEmpty(_) => libc::ENOTEMPTY,
            VfsError::CrossDevice(_) => libc::EXDEV,
            VfsError::InvalidName(_) => libc::ENOENT,
            VfsError::InvalidOperation(_) => libc::EINVAL,
            VfsError::LockConflict(_) => libc::EAGAIN,
            VfsError::NoSpace(_) => libc::ENOSPC,
            VfsError::RangeTooLarge(_) => libc::E2BIG,
            VfsError::IoFailure(_) | VfsError::FlushFailure(_) => libc::EIO,
            VfsError::IsDirectory(_) => libc::EISDIR,
            VfsError::NotDirectory(_) => libc::ENOTDIR,
            VfsError::BufferTooSmall { .. } | VfsError::NoMemory(_) => libc::ENOMEM,
            VfsError::Unsupported(_) => libc::EOPNOTSUPP,
        }
    }

    /// The NTSTATUS an SMB2 response carries for this failure.
    pub fn nt_status(&self) -> NtStatus {
        match self {
            VfsError::NotFound(_) => NtStatus::ObjectNameNotFound,
            VfsError::PermissionDenied(_) => NtStatus::AccessDenied,
            VfsError::Exists(_) => NtStatus::ObjectNameCollision,
            VfsError::NotEmpty(_) => NtStatus::DirectoryNotEmpty,
            VfsError::CrossDevice(_) => NtStatus::NotSameDevice,
            VfsError::InvalidName(_) => NtStatus::ObjectNameInvalid,
            VfsError::InvalidOperation(_) | VfsError::RangeTooLarge(_) => {
                NtStatus::InvalidParameter
            }
            VfsError::LockConflict(_) => NtStatus::FileLockConflict,
            VfsError::NoSpace(_) => NtStatus::DiskFull,
            VfsError::IoFailure(_) | VfsError::FlushFailure(_) => NtStatus::UnexpectedIoError,
            VfsError::IsDirectory(_) => NtStatus::FileIsDirectory,
            VfsError::NotDirectory(_) => NtStatus::NotADirectory,
            VfsError::BufferTooSmall { .. } => NtStatus::BufferTooSmall,
            VfsError::NoMemory(_) => NtStatus::NoMemory,
            VfsError::Unsupported(_) => NtStatus::NotSupported,
        }
    }

    /// Whether a remote client may sensibly retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VfsError::LockConflict(_))
    }
}

impl From<io::Error> for VfsError {
    fn from(err: io::Error) -> Self {
        let context = err.to_string();
        if let Some(errno) = err.raw_os_error() {
            return VfsError::from_errno(errno, context);
        }
        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound(context),
            io::ErrorKind::PermissionDenied => VfsError::PermissionDenied(context),
            io::ErrorKind::AlreadyExists => VfsError::Exists(context),
            io::ErrorKind::InvalidInput => VfsError::InvalidOperation(context),
            io::ErrorKind::WouldBlock => VfsError::LockConflict(context),
            io::ErrorKind::OutOfMemory => VfsError::NoMemory(context),
            io::ErrorKind::Unsupported => VfsError::Unsupported(context),
            _ => VfsError::IoFailure(context),
        }
    }
}

/// NTSTATUS values produced by [`VfsError::nt_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NtStatus {
    Success = 0x0000_0000,
    InvalidParameter = 0xC000_000D,
    NoMemory = 0xC000_0017,
    AccessDenied = 0xC000_0022,
    BufferTooSmall = 0xC000_0023,
    ObjectNameInvalid = 0xC000_0033,
    ObjectNameNotFound = 0xC000_0034,
    ObjectNameCollision = 0xC000_0035,
    FileLockConflict = 0xC000_0054,
    DiskFull = 0xC000_007F,
    DirectoryNotEmpty = 0xC000_0101,
    NotADirectory = 0xC000_0103,
    FileIsDirectory = 0xC000_00BA,
    NotSupported = 0xC000_00BB,
    NotSameDevice = 0xC000_00D4,
    UnexpectedIoError = 0xC000_00E9,
}

impl NtStatus {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:08X})", self, *self as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err = VfsError::from(io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(err, VfsError::NotFound(_)));

        let err = VfsError::from(io::Error::from_raw_os_error(libc::ENOTEMPTY));
        assert!(matches!(err, VfsError::NotEmpty(_)));

        let err = VfsError::from(io::Error::from_raw_os_error(libc::EXDEV));
        assert!(matches!(err, VfsError::CrossDevice(_)));

        let err = VfsError::from(io::Error::from_raw_os_error(libc::ERANGE));
        assert!(matches!(err, VfsError::RangeTooLarge(_)));

        let err = VfsError::from(io::Error::from_raw_os_error(libc::EIO));
        assert!(matches!(err, VfsError::IoFailure(_)));
    }

    #[test]
    fn test_kind_mapping_without_errno() {
        let err = VfsError::from(io::Error::new(io::ErrorKind::AlreadyExists, "dup"));
        assert!(matches!(err, VfsError::Exists(_)));
    }

    #[test]
    fn test_errno_roundtrip_for_common_codes() {
        for errno in [libc::ENOENT, libc::EEXIST, libc::ENOTEMPTY, libc::EXDEV, libc::ENOSPC] {
            assert_eq!(VfsError::from_errno(errno, "x").errno(), errno);
        }
    }

    #[test]
    fn test_nt_status() {
        assert_eq!(
            VfsError::LockConflict("x".into()).nt_status(),
            NtStatus::FileLockConflict
        );
        assert_eq!(
            VfsError::NotEmpty("x".into()).nt_status().as_u32(),
            0xC000_0101
        );
        assert_eq!(
            VfsError::BufferTooSmall { needed: 10, capacity: 4 }.nt_status(),
            NtStatus::BufferTooSmall
        );
    }

    #[test]
    fn test_only_lock_conflict_is_retryable() {
        assert!(VfsError::LockConflict("x".into()).is_retryable());
        assert!(!VfsError::FlushFailure("x".into()).is_retryable());
        assert!(!VfsError::IoFailure("x".into()).is_retryable());
    }
}
