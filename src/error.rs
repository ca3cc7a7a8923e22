//! Error types for sourcetags.
//!
//! One enum per layer, joined by `TagsError` at the top. Every error
//! carries a machine-readable code used in error responses sent back to
//! socket clients.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level daemon error.
#[derive(Error, Debug)]
pub enum TagsError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("A daemon is already running with pid {0}")]
    AlreadyRunning(i32),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage (SQLite) errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("Invalid value for option {name}: expected {expected}")]
    InvalidOptionValue { name: String, expected: &'static str },

    #[error("Corrupt stored value for {name}: {reason}")]
    Corrupt { name: String, reason: String },
}

/// Errors raised while rebuilding the index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Parser initialization failed: {0}")]
    ParserInit(String),

    #[error("tree-sitter returned no tree for {0}")]
    ParseFailed(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),
}

/// Filesystem notification errors.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Notification facility unavailable: {0}")]
    Unavailable(#[source] notify::Error),

    #[error("Cannot watch {path}: {source}")]
    AddWatch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Cannot stop watching {path}: {source}")]
    RemoveWatch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Notification channel closed")]
    Disconnected,
}

/// Update engine errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Update engine has stopped")]
    Stopped,
}

/// Errors binding an incoming request to a command.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Command already registered: {0}")]
    DuplicateCommand(String),

    #[error("Unknown command: {name} (available: {available})")]
    UnknownCommand { name: String, available: String },

    #[error("Unknown option for {command}: {option}")]
    UnknownOption { command: String, option: String },

    #[error("Option {option} expects {expected}, got {found}")]
    TypeMismatch {
        option: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Cannot decode option {option}: {reason}")]
    Decode { option: String, reason: String },

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Option {0} is not declared")]
    Undeclared(String),
}

/// Errors raised by a command while executing.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, TagsError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for indexing operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

impl TagsError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code(),
            Self::Index(e) => e.code(),
            Self::Watch(e) => e.code(),
            Self::Update(e) => e.code(),
            Self::Request(e) => e.code(),
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl StorageError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Pool(_) => "POOL_ERROR",
            Self::UnknownOption(_) => "UNKNOWN_CONFIG_OPTION",
            Self::InvalidOptionValue { .. } => "INVALID_CONFIG_VALUE",
            Self::Corrupt { .. } => "STORAGE_CORRUPT",
        }
    }
}

impl IndexError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.code(),
            Self::ParserInit(_) => "PARSER_INIT_ERROR",
            Self::ParseFailed(_) => "PARSE_FAILED",
            Self::Read { .. } => "FILE_READ_ERROR",
            Self::InvalidPattern(_) => "INVALID_PATTERN",
        }
    }
}

impl WatchError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "WATCH_UNAVAILABLE",
            Self::AddWatch { .. } => "WATCH_ADD_FAILED",
            Self::RemoveWatch { .. } => "WATCH_REMOVE_FAILED",
            Self::Disconnected => "WATCH_DISCONNECTED",
        }
    }
}

impl UpdateError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Stopped => "ENGINE_STOPPED",
        }
    }
}

impl RequestError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateCommand(_) => "DUPLICATE_COMMAND",
            Self::UnknownCommand { .. } => "UNKNOWN_COMMAND",
            Self::UnknownOption { .. } => "UNKNOWN_OPTION",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::Decode { .. } => "DECODE_ERROR",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::Undeclared(_) => "UNDECLARED_OPTION",
        }
    }
}

impl CommandError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request(e) => e.code(),
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::Storage(e) => e.code(),
            Self::Index(e) => e.code(),
            Self::Update(e) => e.code(),
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}
