//! Message types for the helper protocol
//!
//! The helper exposes a closed set of privileged operations. Each one is a
//! variant of [`HelperRequest`] with its own kind byte; adding a privileged
//! capability means adding a variant here and a handler on the helper side.
//!
//! # Message Flow
//!
//! 1. Orchestrator connects to the helper socket
//! 2. Orchestrator sends one request frame with a fresh request id
//! 3. Helper answers with a single `Response` frame carrying the same id
//! 4. Frames the helper cannot understand are answered with
//!    `HelperResponse::Failure` and the connection stays open
//!
//! # Idempotency
//!
//! Every request is safe to repeat. Queries have no side effects, and the
//! mutating requests (`TrustCA`, `InstallDaemon`, `UninstallDaemon`,
//! `SetupPrivilegedDirectory`) converge on the same end state and report
//! through `Done { changed }` whether this call did any work.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Version string reported by the helper in `Pong`
pub const HELPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Message kind identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Read certificate metadata
    GetCertInfo = 0x01,
    /// Ask whether a CA certificate is trusted by the OS
    IsCaddyCaTrusted = 0x02,
    /// Add a CA certificate to the OS trust store
    TrustCa = 0x03,
    /// Install a background daemon definition
    InstallDaemon = 0x04,
    /// Remove a background daemon definition
    UninstallDaemon = 0x05,
    /// Create a root-owned directory handed to a user
    SetupPrivilegedDirectory = 0x06,
    /// Liveness and version check
    Ping = 0x07,
    /// Any response
    Response = 0x80,
}

impl MessageKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::GetCertInfo),
            0x02 => Some(Self::IsCaddyCaTrusted),
            0x03 => Some(Self::TrustCa),
            0x04 => Some(Self::InstallDaemon),
            0x05 => Some(Self::UninstallDaemon),
            0x06 => Some(Self::SetupPrivilegedDirectory),
            0x07 => Some(Self::Ping),
            0x80 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Requests the orchestrator may send to the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperRequest {
    /// Read subject and expiry of a certificate the caller cannot read
    GetCertInfo { path: PathBuf },

    /// Check whether the certificate at `path` is trusted by the OS
    IsCaddyCaTrusted { path: PathBuf },

    /// Trust the certificate at `path` system-wide
    TrustCa { path: PathBuf },

    /// Install and load a daemon definition
    InstallDaemon {
        /// Reverse-DNS style label, e.g. `dev.devhost.dns`
        label: String,
        /// Absolute path of the program to run
        program: PathBuf,
        /// Arguments passed to the program
        args: Vec<String>,
    },

    /// Unload and remove a daemon definition
    UninstallDaemon { label: String },

    /// Create `path` (root owned parents) and hand it to `owner_uid`
    SetupPrivilegedDirectory { path: PathBuf, owner_uid: u32 },

    /// Liveness check
    Ping,
}

impl HelperRequest {
    /// Kind byte used on the wire for this request
    pub fn kind(&self) -> MessageKind {
        match self {
            HelperRequest::GetCertInfo { .. } => MessageKind::GetCertInfo,
            HelperRequest::IsCaddyCaTrusted { .. } => MessageKind::IsCaddyCaTrusted,
            HelperRequest::TrustCa { .. } => MessageKind::TrustCa,
            HelperRequest::InstallDaemon { .. } => MessageKind::InstallDaemon,
            HelperRequest::UninstallDaemon { .. } => MessageKind::UninstallDaemon,
            HelperRequest::SetupPrivilegedDirectory { .. } => {
                MessageKind::SetupPrivilegedDirectory
            }
            HelperRequest::Ping => MessageKind::Ping,
        }
    }

    /// Whether this request changes system state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            HelperRequest::TrustCa { .. }
                | HelperRequest::InstallDaemon { .. }
                | HelperRequest::UninstallDaemon { .. }
                | HelperRequest::SetupPrivilegedDirectory { .. }
        )
    }
}

/// Certificate metadata returned by `GetCertInfo`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertInfo {
    /// Whether a certificate exists at the path
    pub exists: bool,
    /// Subject common name
    pub name: Option<String>,
    /// `notAfter` as printed by the certificate tooling
    pub expiry: Option<String>,
}

impl CertInfo {
    /// Info for a path with no certificate
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Typed failure reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Target file or daemon does not exist
    NotFound,
    /// The helper itself lacks the rights, or the caller is not allowed
    PermissionDenied,
    /// Path failed validation (relative, traversal, outside allowed roots)
    InvalidPath,
    /// Kind byte not recognised by this helper
    UnsupportedRequest,
    /// Header or payload could not be decoded
    MalformedRequest,
    /// Sender speaks a different protocol version
    VersionMismatch,
    /// A system command exited unsuccessfully
    CommandFailed,
    /// Anything else
    Internal,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::NotFound => "not found",
            FailureReason::PermissionDenied => "permission denied",
            FailureReason::InvalidPath => "invalid path",
            FailureReason::UnsupportedRequest => "unsupported request",
            FailureReason::MalformedRequest => "malformed request",
            FailureReason::VersionMismatch => "version mismatch",
            FailureReason::CommandFailed => "command failed",
            FailureReason::Internal => "internal error",
        };
        f.write_str(s)
    }
}

/// Responses sent by the helper
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperResponse {
    /// Answer to `GetCertInfo`
    CertInfo(CertInfo),

    /// Answer to `IsCaddyCaTrusted`
    Trusted { trusted: bool },

    /// A mutating request completed
    Done {
        /// False if the system was already in the requested state
        changed: bool,
    },

    /// Answer to `Ping`
    Pong { version: String },

    /// The request was not carried out
    Failure {
        reason: FailureReason,
        detail: String,
    },
}

impl HelperResponse {
    /// Build a failure response
    pub fn failure(reason: FailureReason, detail: impl Into<String>) -> Self {
        HelperResponse::Failure {
            reason,
            detail: detail.into(),
        }
    }
}

/// Anything that travels in a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(HelperRequest),
    Response(HelperResponse),
}

impl Message {
    /// Get the kind byte for this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(request) => request.kind(),
            Message::Response(_) => MessageKind::Response,
        }
    }
}
