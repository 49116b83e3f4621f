//! Shared error taxonomy for every module in this crate.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("no space available")]
    NoSpace,

    #[error("position namespace exhausted")]
    NamespaceExhausted,

    #[error("read error on {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("write error on {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parity unavailable")]
    ParityUnavailable,

    #[error("too many failed drives ({failed}) for {parity_levels} parity level(s)")]
    TooManyFailures { failed: usize, parity_levels: usize },

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("corrupt content file: {0}")]
    CorruptContent(String),

    #[error("bad config: {0}")]
    BadConfig(String),

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to the closest POSIX errno, for the adapter-facing boundary.
    pub fn to_errno(&self) -> libc_errno::Errno {
        use libc_errno::Errno;
        match self {
            Error::NotFound(_) => Errno::ENOENT,
            Error::Exists(_) => Errno::EEXIST,
            Error::NoSpace | Error::NamespaceExhausted => Errno::ENOSPC,
            Error::ReadError { .. } => Errno::EIO,
            Error::WriteError { .. } => Errno::EIO,
            Error::ParityUnavailable | Error::TooManyFailures { .. } => Errno::EIO,
            Error::Unrecoverable(_) => Errno::EIO,
            Error::CorruptContent(_) => Errno::EIO,
            Error::BadConfig(_) => Errno::EINVAL,
            Error::Invalid(_) => Errno::EINVAL,
            Error::Io(e) => Errno::from_io(e),
        }
    }
}

/// A minimal errno wrapper so this crate's core has no hard dependency on
/// `libc`; the CLI/adapter crate converts this into the real `libc::c_int`.
pub mod libc_errno {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Errno {
        ENOENT,
        EEXIST,
        ENOSPC,
        EIO,
        EINVAL,
        ENOTEMPTY,
        EXDEV,
    }

    impl Errno {
        pub fn from_io(e: &std::io::Error) -> Self {
            match e.raw_os_error() {
                Some(2) => Errno::ENOENT,
                Some(17) => Errno::EEXIST,
                Some(28) => Errno::ENOSPC,
                Some(22) => Errno::EINVAL,
                Some(39) => Errno::ENOTEMPTY,
                Some(18) => Errno::EXDEV,
                _ => Errno::EIO,
            }
        }
    }
}
