//! The error taxonomy shared by every layer of the package engine.
//!
//! Variants map 1:1 onto the error kinds named by the design: callers such as
//! `appfs-mount` translate each variant to an errno using [`Error::errno`].

use thiserror::Error;

/// Something went wrong while manipulating a package.
#[derive(Debug, Error)]
pub enum Error {
    #[error("path is not valid")]
    PathNotValid,
    #[error("filename is too long")]
    FilenameTooLong,
    #[error("file not found")]
    FileNotFound,
    #[error("file already exists")]
    FileExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("directory has reached its maximum number of children")]
    DirectoryChildLimitReached,
    #[error("file is too big ({requested} > {max})")]
    FileTooBig { requested: u64, max: u64 },
    #[error("no free space left in package")]
    NoFreeSpace,
    #[error("access denied")]
    AccessDenied,
    #[error("operation not supported")]
    NotSupported,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("invalid open mode")]
    InvalidOpenMode,
    #[error("refusing to save an inode that fails validation")]
    InodeSaveInvalid,
    #[error("failed to save inode")]
    InodeSaveFailed,
    #[error("no free inode id available")]
    InodeExhaustion,
    #[error("internal inconsistency detected in package: {0}")]
    InternalInconsistency(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Maps a core error to the errno the host-filesystem bridge should
    /// return, per the bridge-to-errno table.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::PathNotValid
            | Error::InternalInconsistency(_)
            | Error::InodeSaveInvalid
            | Error::InodeSaveFailed
            | Error::InodeExhaustion
            | Error::DirectoryChildLimitReached
            | Error::Io(_) => libc::EIO,
            Error::FileNotFound => libc::ENOENT,
            Error::NoFreeSpace => libc::ENOSPC,
            Error::AccessDenied => libc::EACCES,
            Error::FileExists => libc::EEXIST,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::FileTooBig { .. } => libc::EFBIG,
            Error::NotSupported | Error::NotImplemented | Error::InvalidOpenMode => libc::ENOTSUP,
            Error::FilenameTooLong => libc::ENAMETOOLONG,
        }
    }
}
