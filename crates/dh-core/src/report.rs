//! Result payloads of orchestration operations
//!
//! These are returned by the orchestrator facade and carried verbatim by the
//! control IPC.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::model::{Domain, Instance, Stack};
use crate::service::{ServiceConfig, ServiceType};
use crate::types::{InstanceId, StackId};

/// Where trust information came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustSource {
    /// Read directly by the orchestrator
    Direct,
    /// Obtained through the privileged helper
    Helper,
}

/// State of the reverse proxy's local certificate authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStatus {
    pub ca_exists: bool,
    pub is_trusted: bool,
    pub cert_name: Option<String>,
    pub expiry: Option<String>,
    pub source: TrustSource,
}

impl TrustStatus {
    /// Status for a CA that does not exist
    pub fn missing(source: TrustSource) -> Self {
        Self {
            ca_exists: false,
            is_trusted: false,
            cert_name: None,
            expiry: None,
            source,
        }
    }
}

/// DNS responder status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsStatus {
    pub running: bool,
    pub listening: Option<SocketAddr>,
    pub tld: String,
}

/// A domain record plus non-fatal warnings raised while applying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainReport {
    pub domain: Domain,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Outcome of refreshing one parked directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub path: PathBuf,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Children skipped because their domain is taken or the name is unusable
    pub skipped: Vec<String>,
    /// Stopped early by a cancellation request
    pub cancelled: bool,
}

impl RefreshReport {
    /// Whether the refresh changed the registry
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Answer to `parkStatus(path)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkStatus {
    pub path: PathBuf,
    /// The parked parent containing `path`, if any
    pub parked_parent: Option<PathBuf>,
    /// Domain `path` resolves to through that parent
    pub domain: Option<String>,
    /// Whether the parent is itself parked (rather than a child of one)
    pub is_parked_root: bool,
}

/// Per-member result of a bulk stack operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MemberOutcome {
    Ok,
    /// Nothing to do (already running or already stopped)
    Unchanged,
    /// Not attempted because the operation was cancelled
    Skipped,
    Failed { kind: ErrorKind, message: String },
}

/// One row of a bulk stack operation's report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberResult {
    pub instance_id: InstanceId,
    pub name: String,
    #[serde(flatten)]
    pub outcome: MemberOutcome,
}

impl MemberResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, MemberOutcome::Failed { .. })
    }
}

/// A stack with its current members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInfo {
    pub stack: Stack,
    pub members: Vec<Instance>,
}

/// Current export document format
pub const STACK_EXPORT_FORMAT: u32 = 1;

/// Portable stack definition (no runtime state, no ids)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackExport {
    pub format_version: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub instances: Vec<ExportedInstance>,
}

/// One member of an exported stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedInstance {
    pub name: String,
    pub service_type: ServiceType,
    pub version: String,
    pub config: ServiceConfig,
    /// Port the member used on the exporting machine
    pub preferred_port: u16,
    /// Subdomains (without tld) routed to the member
    #[serde(default)]
    pub domains: Vec<ExportedDomain>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDomain {
    pub subdomain: String,
    pub ssl_enabled: bool,
}

/// Outcome of `importStack`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub stack_id: StackId,
    pub stack_name: String,
    pub instances: Vec<Instance>,
    /// Exported names that had to be changed, as (original, new)
    pub renamed: Vec<(String, String)>,
    /// Domains not recreated because they already exist
    pub skipped_domains: Vec<String>,
}

/// Daemon status summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub instance_count: usize,
    pub running_count: usize,
    pub domain_count: usize,
    pub stack_count: usize,
    pub parked_count: usize,
    pub tld: String,
    pub dns: DnsStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_result_flattens_outcome() {
        let result = MemberResult {
            instance_id: InstanceId::new("i1"),
            name: "db".to_string(),
            outcome: MemberOutcome::Failed {
                kind: ErrorKind::BinaryMissing,
                message: "missing".to_string(),
            },
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "binary_missing");
        assert!(result.is_failure());

        let back: MemberResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_refresh_report_noop() {
        let mut report = RefreshReport::default();
        assert!(report.is_noop());
        report.skipped.push("taken".into());
        assert!(report.is_noop());
        report.added.push("blog.test".into());
        assert!(!report.is_noop());
    }
}
