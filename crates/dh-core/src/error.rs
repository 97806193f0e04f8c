//! Core error types for devhost
//!
//! [`DevhostError`] is the one error every caller-facing operation returns.
//! Its [`ErrorKind`] travels over the control IPC unchanged so front ends can
//! render guidance for the exact failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use dh_protocol::{FailureReason, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used throughout the devhost crates
pub type Result<T, E = DevhostError> = std::result::Result<T, E>;

/// Top-level error type for devhost
#[derive(Error, Debug)]
pub enum DevhostError {
    /// Unknown id or name
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate name or domain
    #[error("{entity} already exists: {name}")]
    AlreadyExists { entity: &'static str, name: String },

    /// Port is claimed by another instance or process
    #[error("Port {port} is already held by {holder}")]
    PortConflict { port: u16, holder: String },

    /// No installed binary for the requested service version
    #[error("Service binary missing: {}", path.display())]
    BinaryMissing { path: PathBuf },

    /// Process could not be spawned or died during startup
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Instance is already running
    #[error("Instance already running: {0}")]
    AlreadyRunning(String),

    /// Instance is not running
    #[error("Instance not running: {0}")]
    NotRunning(String),

    /// Proxy configuration could not be written or reloaded
    #[error("Reverse proxy reload failed: {0}")]
    ProxyReloadFailed(String),

    /// State snapshot could not be written
    #[error("Failed to persist state: {0}")]
    PersistenceFailed(String),

    /// Helper is not installed or not listening
    #[error("Privileged helper unavailable: {0}")]
    HelperUnavailable(String),

    /// Helper did not answer in time
    #[error("Privileged helper did not answer within {0:?}")]
    HelperTimeout(Duration),

    /// Helper answered with a typed failure
    #[error("Privileged helper refused request ({reason}): {detail}")]
    HelperFailed {
        reason: FailureReason,
        detail: String,
    },

    /// Local CA certificate does not exist
    #[error("Local certificate authority not found at {}", .0.display())]
    CertificateNotFound(PathBuf),

    /// Local CA exists but the OS does not trust it
    #[error("Local certificate authority is not trusted: {0}")]
    CertificateNotTrusted(String),

    /// Malformed input, rejected before any mutation
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// A listener address is held by another process
    #[error("Address already in use: {0}")]
    PortInUse(SocketAddr),

    /// Operation stopped by a cancellation request
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Helper wire protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DevhostError {
    /// Shorthand for a `NotFound` error
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Shorthand for an `AlreadyExists` error
    pub fn already_exists(entity: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            name: name.into(),
        }
    }

    /// Shorthand for a `ValidationFailed` error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Machine-readable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::PortConflict { .. } => ErrorKind::PortConflict,
            Self::BinaryMissing { .. } => ErrorKind::BinaryMissing,
            Self::ProcessSpawnFailed(_) => ErrorKind::ProcessSpawnFailed,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::ProxyReloadFailed(_) => ErrorKind::ProxyReloadFailed,
            Self::PersistenceFailed(_) => ErrorKind::PersistenceFailed,
            Self::HelperUnavailable(_) => ErrorKind::HelperUnavailable,
            Self::HelperTimeout(_) => ErrorKind::HelperTimeout,
            Self::HelperFailed { .. } => ErrorKind::HelperFailed,
            Self::CertificateNotFound(_) => ErrorKind::CertificateNotFound,
            Self::CertificateNotTrusted(_) => ErrorKind::CertificateNotTrusted,
            Self::ValidationFailed(_) => ErrorKind::ValidationFailed,
            Self::PortInUse(_) => ErrorKind::PortInUse,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether a caller-facing operation should retry once before surfacing
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HelperTimeout(_) | Self::ProxyReloadFailed(_))
    }
}

/// Serializable discriminant of [`DevhostError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PortConflict,
    BinaryMissing,
    ProcessSpawnFailed,
    AlreadyRunning,
    NotRunning,
    ProxyReloadFailed,
    PersistenceFailed,
    HelperUnavailable,
    HelperTimeout,
    HelperFailed,
    CertificateNotFound,
    CertificateNotTrusted,
    ValidationFailed,
    PortInUse,
    Cancelled,
    Config,
    Protocol,
    Io,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
