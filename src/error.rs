//! Unified error surface for the engine. Mirrors std::io::ErrorKind where a
//! kind exists so channel-style callers can round-trip through io::Error.

use std::io::ErrorKind;
use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

/// Render the optional path context of a variant as a `: /path` suffix.
fn at(path: &Option<String>) -> String {
    match path.as_deref() {
        Some(p) if !p.is_empty() => format!(": {p}"),
        _ => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("no such file{}", at(.path))]
    NoSuchFile { path: Option<String> },

    #[error("already exists{}", at(.path))]
    AlreadyExists { path: Option<String> },

    #[error("directory not empty{}", at(.path))]
    DirectoryNotEmpty { path: Option<String> },

    #[error("not a directory{}", at(.path))]
    NotDirectory { path: Option<String> },

    #[error("access denied ({reason}){}", at(.path))]
    AccessDenied { path: Option<String>, reason: String },

    #[error("atomic move not supported{}", at(.path))]
    AtomicMoveNotSupported { path: Option<String> },

    #[error("unsupported open option: {option}")]
    UnsupportedOption { option: String },

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("node belongs to a different filesystem instance{}", at(.path))]
    ProviderMismatch { path: Option<String> },

    #[error("i/o error: {0}")]
    Io(#[from] anyhow::Error),
}

impl FsError {
    pub fn no_such_file(path: impl Into<String>) -> Self {
        FsError::NoSuchFile {
            path: Some(path.into()),
        }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        FsError::AlreadyExists {
            path: Some(path.into()),
        }
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        FsError::NotDirectory {
            path: Some(path.into()),
        }
    }

    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        FsError::DirectoryNotEmpty {
            path: Some(path.into()),
        }
    }

    pub fn access_denied(path: impl Into<String>, reason: impl Into<String>) -> Self {
        FsError::AccessDenied {
            path: Some(path.into()),
            reason: reason.into(),
        }
    }

    pub fn unsupported_option(option: impl Into<String>) -> Self {
        FsError::UnsupportedOption {
            option: option.into(),
        }
    }
}

impl From<serde_json::Error> for FsError {
    fn from(value: serde_json::Error) -> Self {
        FsError::Io(anyhow::Error::new(value).context("metadata encoding"))
    }
}

impl From<std::io::Error> for FsError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            ErrorKind::NotFound => FsError::NoSuchFile { path: None },
            ErrorKind::AlreadyExists => FsError::AlreadyExists { path: None },
            ErrorKind::NotADirectory => FsError::NotDirectory { path: None },
            ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty { path: None },
            ErrorKind::PermissionDenied => FsError::AccessDenied {
                path: None,
                reason: value.to_string(),
            },
            ErrorKind::InvalidInput => FsError::InvalidPath(value.to_string()),
            _ => FsError::Io(anyhow::Error::new(value)),
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(value: FsError) -> Self {
        let kind = match &value {
            FsError::NoSuchFile { .. } => ErrorKind::NotFound,
            FsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FsError::DirectoryNotEmpty { .. } => ErrorKind::DirectoryNotEmpty,
            FsError::NotDirectory { .. } => ErrorKind::NotADirectory,
            FsError::AccessDenied { .. } => ErrorKind::PermissionDenied,
            FsError::AtomicMoveNotSupported { .. } => ErrorKind::Unsupported,
            FsError::UnsupportedOption { .. } => ErrorKind::Unsupported,
            FsError::InvalidPath(_) => ErrorKind::InvalidInput,
            FsError::ProviderMismatch { .. } => ErrorKind::InvalidInput,
            FsError::Io(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_round_trip_keeps_kind() {
        let err = FsError::no_such_file("/a/b");
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), ErrorKind::NotFound);
        let back: FsError = io.into();
        assert!(matches!(back, FsError::NoSuchFile { .. }));
    }

    #[test]
    fn test_path_suffix_formatting() {
        let err = FsError::already_exists("/x");
        assert_eq!(err.to_string(), "already exists: /x");
        let bare = FsError::AlreadyExists { path: None };
        assert_eq!(bare.to_string(), "already exists");
    }

    #[test]
    fn test_access_denied_carries_reason() {
        let err = FsError::access_denied("/f", "stream open");
        assert_eq!(err.to_string(), "access denied (stream open): /f");
    }
}
