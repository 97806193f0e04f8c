//! Control IPC protocol between front ends (CLI/GUI) and the daemon
//!
//! JSON-encoded messages, one per line, over a Unix socket that only the
//! owning user can open. Every request receives exactly one response;
//! after `Subscribe`, events are interleaved on the same connection.
//!
//! Instances, domains and stacks may be referenced by id or by name.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DevhostError, ErrorKind};
use crate::model::{Domain, HealthStatus, Instance, ParkedDirectory, ProcessManager, Stack};
use crate::report::{
    DaemonStatus, DnsStatus, DomainReport, ImportReport, MemberResult, ParkStatus, RefreshReport,
    StackExport, StackInfo, TrustStatus,
};
use crate::service::{ConfigField, ServiceConfig, ServiceType};
use crate::types::{InstanceId, StackId};

/// Parameters of `createInstance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub service_type: ServiceType,
    pub version: String,
    /// Explicit port; allocated from the type default when absent
    #[serde(default)]
    pub port: Option<u16>,
    /// Type-specific configuration; defaults for the type when absent
    #[serde(default)]
    pub config: Option<ServiceConfig>,
    /// Initial domain (subdomain or full name)
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub ssl_enabled: bool,
    #[serde(default)]
    pub process_manager: ProcessManager,
    /// Start right away; the instance is removed again if this fails
    #[serde(default)]
    pub autostart: bool,
}

impl CreateInstanceRequest {
    /// Minimal request with defaults for everything optional
    pub fn new(name: impl Into<String>, service_type: ServiceType, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type,
            version: version.into(),
            port: None,
            config: None,
            domain: None,
            ssl_enabled: false,
            process_manager: ProcessManager::Direct,
            autostart: false,
        }
    }
}

/// What a new domain routes to, as given by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TargetSpec {
    /// Instance id or name
    Instance(String),
    Port(u16),
}

/// Parameters of `createDomain`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDomainRequest {
    /// Subdomain or full domain
    pub name: String,
    pub target: TargetSpec,
    #[serde(default)]
    pub ssl_enabled: bool,
}

/// IPC request from a front end to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    /// Daemon status summary
    GetStatus,
    /// Keepalive
    Ping,
    /// Start streaming events on this connection
    Subscribe,
    /// Stop the daemon
    Shutdown,

    ListInstances,
    GetInstance { instance: String },
    CreateInstance(CreateInstanceRequest),
    StartInstance { instance: String },
    StopInstance { instance: String },
    RestartInstance { instance: String },
    DeleteInstance { instance: String },
    RenameInstance { instance: String, new_name: String },
    ChangeInstanceVersion { instance: String, version: String },
    UpdateInstanceConfig { instance: String, config: ServiceConfig },
    CheckInstanceHealth { instance: String },
    GetConfigSchema { service_type: ServiceType },

    ListDomains,
    CreateDomain(CreateDomainRequest),
    DeleteDomain { domain: String },
    UpdateDomainSsl { domain: String, ssl_enabled: bool },

    ListParked,
    Park {
        path: PathBuf,
        #[serde(default)]
        upstream_port: Option<u16>,
    },
    Forget { path: PathBuf },
    RefreshParked { path: PathBuf },
    ParkStatus { path: PathBuf },

    ListStacks,
    GetStack { stack: String },
    CreateStack {
        name: String,
        #[serde(default)]
        description: Option<String>,
        instances: Vec<String>,
    },
    DeleteStack { stack: String, cascade: bool },
    AddToStack { stack: String, instance: String },
    RemoveFromStack { stack: String, instance: String },
    StartStack { stack: String },
    StopStack { stack: String },
    ExportStack { stack: String },
    ImportStack { document: StackExport },

    GetTrustStatus,
    GetDnsStatus,
    RestartDns,
}

/// IPC response from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Status(DaemonStatus),
    Pong,
    Ok,
    Subscribed,

    Instances { instances: Vec<Instance> },
    Instance(Instance),
    Health { instance_id: InstanceId, healthy: HealthStatus },
    ConfigSchema { fields: Vec<ConfigField> },

    Domains { domains: Vec<Domain> },
    Domain(DomainReport),

    ParkedDirectories { parked: Vec<ParkedDirectory> },
    ParkedDirectory(ParkedDirectory),
    Refreshed(RefreshReport),
    ParkStatus(ParkStatus),

    Stacks { stacks: Vec<StackInfo> },
    Stack(StackInfo),
    StackResults { stack_id: StackId, results: Vec<MemberResult> },
    StackExported { document: StackExport },
    StackImported(ImportReport),

    TrustStatus(TrustStatus),
    DnsStatus(DnsStatus),

    /// Operation failed with a typed error
    Error { kind: ErrorKind, message: String },
}

impl From<DevhostError> for IpcResponse {
    fn from(err: DevhostError) -> Self {
        IpcResponse::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// IPC event pushed from the daemon to subscribed clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcEvent {
    /// Instance created or changed (state, health, domains, fields)
    InstanceChanged(Instance),
    InstanceRemoved { instance_id: InstanceId },
    DomainChanged(Domain),
    DomainRemoved { full_domain: String },
    StackChanged(Stack),
    StackRemoved { stack_id: StackId },
    ParkedChanged(ParkedDirectory),
    ParkedRemoved { path: PathBuf },
    /// Proxy configuration was rendered and reloaded
    ProxyReloaded { domain_count: usize },
    DnsStatusChanged(DnsStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let json = r#"{"type":"start_instance","instance":"api"}"#;
        match serde_json::from_str::<IpcRequest>(json).unwrap() {
            IpcRequest::StartInstance { instance } => assert_eq!(instance, "api"),
            other => panic!("Expected StartInstance, got {:?}", other),
        }
    }

    #[test]
    fn test_create_instance_defaults() {
        let json = r#"{"type":"create_instance","name":"api","service_type":"cache","version":"7.2"}"#;
        match serde_json::from_str::<IpcRequest>(json).unwrap() {
            IpcRequest::CreateInstance(req) => {
                assert_eq!(req, CreateInstanceRequest::new("api", ServiceType::Cache, "7.2"));
            }
            other => panic!("Expected CreateInstance, got {:?}", other),
        }
    }

    #[test]
    fn test_create_domain_target() {
        let json = r#"{"type":"create_domain","name":"api","target":{"type":"port","value":3000}}"#;
        match serde_json::from_str::<IpcRequest>(json).unwrap() {
            IpcRequest::CreateDomain(req) => {
                assert_eq!(req.target, TargetSpec::Port(3000));
                assert!(!req.ssl_enabled);
            }
            other => panic!("Expected CreateDomain, got {:?}", other),
        }
    }

    #[test]
    fn test_error_response_carries_kind() {
        let response: IpcResponse = DevhostError::PortConflict {
            port: 8001,
            holder: "instance web".into(),
        }
        .into();
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "port_conflict");
    }
}
