//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Bad or conflicting request that the user must correct; never retried.
    User(String),
    /// Control-plane call failure.
    Manager(String),
    /// Cluster API failure (workload lookup, event watch, pod logs).
    Cluster(String),
    /// Mount or port-forward session failure.
    Mount(String),
    /// IPC communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A deadline elapsed before the awaited state was reached.
    Timeout(String),
    /// The surrounding scope was cancelled.
    Cancelled(String),
    /// Unexpected internal fault caught at an operation boundary.
    Internal(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// The category reported alongside this error when it crosses a
    /// process boundary.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::User(_) | Self::NotFound(_) | Self::Timeout(_) => ErrorCategory::User,
            Self::Config(_) => ErrorCategory::Config,
            _ => ErrorCategory::Unknown,
        }
    }

    /// The bare message without the kind prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(msg)
            | Self::User(msg)
            | Self::Manager(msg)
            | Self::Cluster(msg)
            | Self::Mount(msg)
            | Self::Ipc(msg)
            | Self::NotFound(msg)
            | Self::Timeout(msg)
            | Self::Cancelled(msg)
            | Self::Internal(msg)
            | Self::Io(msg) => msg,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::User(msg) => write!(f, "{msg}"),
            Self::Manager(msg) => write!(f, "manager: {msg}"),
            Self::Cluster(msg) => write!(f, "cluster: {msg}"),
            Self::Mount(msg) => write!(f, "mount: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Cancelled(msg) => write!(f, "cancelled: {msg}"),
            Self::Internal(msg) => write!(f, "internal: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Manager(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Coarse error classification carried across the control-plane boundary
/// as a numeric code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unclassified failure.
    #[default]
    Unknown,
    /// The user can correct the request.
    User,
    /// Configuration is invalid.
    Config,
    /// Failure that should not prompt the user to inspect daemon logs.
    NoDaemonLogs,
}

impl ErrorCategory {
    /// Numeric wire code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::User => 1,
            Self::Config => 2,
            Self::NoDaemonLogs => 3,
        }
    }

    /// Decode a numeric wire code; unknown codes map to [`ErrorCategory::Unknown`].
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::User,
            2 => Self::Config,
            3 => Self::NoDaemonLogs,
            _ => Self::Unknown,
        }
    }

    /// Rebuild an [`AppError`] of this category from a bare message.
    #[must_use]
    pub fn into_error(self, message: impl Into<String>) -> AppError {
        let message = message.into();
        match self {
            Self::User | Self::NoDaemonLogs => AppError::User(message),
            Self::Config => AppError::Config(message),
            Self::Unknown => AppError::Manager(message),
        }
    }
}

/// Describe a panic payload caught at an operation boundary.
#[must_use]
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: unknown payload".into()
    }
}
