//! Error taxonomy and errno translation.
//!
//! Backend failures are modeled as a closed set of sentinel variants plus an
//! opaque catch-all. Translation to a POSIX errno follows a fixed order:
//! a native OS code embedded in the error wins, then the sentinel table,
//! then the caller-supplied fallback.

use std::io;

use crate::config::ConfigError;
use crate::doc::ParseError;

/// Failure reported by a remote backend or the VFS layer above it.
///
/// Most remote protocols produce string errors with no native code, so
/// beyond the sentinels below callers must not branch on the translated
/// errno except where a code is documented as reliable (`AlreadyExists`
/// from create-type operations).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("directory not empty")]
    NotEmpty,
    #[error("illegal seek")]
    BadSeek,
    #[error("bad file descriptor")]
    BadHandle,
    #[error("read only file system")]
    ReadOnly,
    #[error("operation not supported")]
    Unsupported,
    #[error("too many levels of symbolic links")]
    TooManySymlinks,
    #[error("no such file or directory")]
    NotFound,
    #[error("file already exists")]
    AlreadyExists,
    #[error("operation not permitted")]
    NoPermission,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("file handle closed")]
    ClosedHandle,
    #[error("directory not found")]
    DirNotFound,
    #[error("object not found")]
    ObjectNotFound,
    #[error("is a file not a directory")]
    IsFile,
    #[error("is a directory not a file")]
    IsDir,
    #[error("directory not empty to be deleted")]
    DirectoryNotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("optional feature not implemented")]
    NotImplemented,
    #[error("command not found")]
    CommandNotFound,
    #[error("file name too long")]
    NameTooLong,
    #[error("config file not found")]
    ConfigNotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Nearest errno for this error, if one is known.
    ///
    /// A native OS code carried by an embedded I/O error is used verbatim;
    /// sentinels map through a fixed table; opaque errors have no code.
    pub fn errno(&self) -> Option<i32> {
        if let BackendError::Io(err) = self {
            if let Some(code) = err.raw_os_error() {
                return Some(code);
            }
        }

        let code = match self {
            BackendError::NotEmpty => libc::ENOTEMPTY,
            BackendError::BadSeek => libc::ESPIPE,
            BackendError::BadHandle => libc::EBADF,
            BackendError::ReadOnly => libc::EROFS,
            BackendError::Unsupported => libc::ENOSYS,
            BackendError::TooManySymlinks => libc::ELOOP,
            BackendError::NotFound => libc::ENOENT,
            BackendError::AlreadyExists => libc::EEXIST,
            BackendError::NoPermission => libc::EPERM,
            BackendError::InvalidArgument => libc::EINVAL,
            BackendError::ClosedHandle => libc::EBADF,
            BackendError::DirNotFound => libc::ENOENT,
            BackendError::ObjectNotFound => libc::ENOENT,
            BackendError::IsFile => libc::ENOTDIR,
            BackendError::IsDir => libc::EISDIR,
            BackendError::DirectoryNotEmpty => libc::ENOTEMPTY,
            BackendError::PermissionDenied => libc::EACCES,
            BackendError::NotImplemented => libc::ENOSYS,
            BackendError::CommandNotFound => libc::ENOENT,
            BackendError::NameTooLong => libc::ENAMETOOLONG,
            BackendError::ConfigNotFound => libc::ENOENT,
            BackendError::Io(_) | BackendError::Other(_) => return None,
        };

        Some(code)
    }

    /// Whether the error means the addressed node does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.errno(), Some(code) if code == libc::ENOENT)
    }
}

/// Any failure that can surface from resolving a doc to a live instance.
#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Public operation outcome: a human-readable message plus a best-effort
/// errno. The message is for diagnostics; the code is only for coarse
/// classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpError {
    pub message: String,
    pub code: i32,
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (errno {})", self.message, self.code)
    }
}

impl std::error::Error for OpError {}

impl OpError {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }
}

/// Translate a backend error, falling back to `fallback` when neither a
/// native OS code nor a sentinel mapping applies.
pub fn translate(err: &BackendError, fallback: i32) -> OpError {
    OpError {
        message: err.to_string(),
        code: err.errno().unwrap_or(fallback),
    }
}

/// Translate a doc parse failure. Malformed input is the caller's fault, so
/// everything maps to EINVAL except the directory-target case which keeps
/// its own code.
pub fn translate_parse(err: &ParseError) -> OpError {
    let code = match err {
        ParseError::IsDirectory(_) => libc::EISDIR,
        _ => libc::EINVAL,
    };
    OpError {
        message: err.to_string(),
        code,
    }
}

/// Translate a configuration failure. A missing config file keeps ENOENT so
/// the host can treat it as the normal empty-config case; everything else
/// is either an I/O failure or the caller's fault.
pub fn translate_config(err: &ConfigError, fallback: i32) -> OpError {
    let code = match err {
        ConfigError::NotFound => libc::ENOENT,
        ConfigError::Io(io_err) => io_err.raw_os_error().unwrap_or(fallback),
        ConfigError::UnknownOption(_)
        | ConfigError::EmptyValue(_)
        | ConfigError::InvalidValue { .. }
        | ConfigError::Obscured(_) => libc::EINVAL,
        ConfigError::Json(_) => fallback,
    };
    OpError {
        message: err.to_string(),
        code,
    }
}

/// Translate a composite resolution failure with the given backend fallback.
pub fn translate_vfs(err: &VfsError, fallback: i32) -> OpError {
    match err {
        VfsError::Parse(parse) => translate_parse(parse),
        VfsError::Config(config) => translate_config(config, libc::EINVAL),
        VfsError::Backend(backend) => translate(backend, fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_mapping_ignores_fallback() {
        let err = BackendError::ObjectNotFound;
        let translated = translate(&err, libc::EIO);
        assert_eq!(translated.code, libc::ENOENT);
        assert_eq!(translated.message, "object not found");
    }

    #[test]
    fn opaque_error_uses_fallback() {
        let err = BackendError::Other("quota exceeded on remote".into());
        assert_eq!(translate(&err, libc::EIO).code, libc::EIO);
        assert_eq!(translate(&err, libc::EINVAL).code, libc::EINVAL);
    }

    #[test]
    fn native_os_code_wins() {
        let err = BackendError::Io(io::Error::from_raw_os_error(libc::ENOTDIR));
        assert_eq!(translate(&err, libc::EIO).code, libc::ENOTDIR);
    }

    #[test]
    fn io_error_without_code_uses_fallback() {
        let err = BackendError::Io(io::Error::new(io::ErrorKind::Other, "wrapped"));
        assert_eq!(translate(&err, libc::EIO).code, libc::EIO);
    }

    #[test]
    fn closed_handle_is_bad_descriptor() {
        assert_eq!(BackendError::ClosedHandle.errno(), Some(libc::EBADF));
        assert_eq!(BackendError::BadHandle.errno(), Some(libc::EBADF));
    }
}
