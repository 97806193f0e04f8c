//! Persisted entities: instances, domains, stacks and parked directories

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::DevhostError;
use crate::service::{ServiceConfig, ServiceType};
use crate::types::{DomainId, InstanceId, StackId};

/// Milliseconds since the Unix epoch, as stored in `created_at`/`updated_at`
///
/// A clock set before 1970 yields 0 rather than failing a mutation.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Supervision state of an instance
///
/// ```text
/// Stopped ──> Starting ──> Running ──> Stopping ──> Stopped
///    ^           │            │
///    │           v            v
///    └──────── Crashed <──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl SupervisionState {
    /// States in which a process id is recorded
    pub fn has_process(&self) -> bool {
        matches!(self, SupervisionState::Running | SupervisionState::Stopping)
    }

    /// States in which the instance's port is claimed
    pub fn claims_port(&self) -> bool {
        matches!(
            self,
            SupervisionState::Starting | SupervisionState::Running | SupervisionState::Stopping
        )
    }

    /// Whether moving to `next` is a legal transition
    pub fn can_transition_to(&self, next: SupervisionState) -> bool {
        use SupervisionState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Crashed, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Stopping, Stopped)
                | (Crashed, Stopped)
                | (Stopped, Stopped)
        )
    }
}

impl fmt::Display for SupervisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SupervisionState::Stopped => "stopped",
            SupervisionState::Starting => "starting",
            SupervisionState::Running => "running",
            SupervisionState::Stopping => "stopping",
            SupervisionState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Tri-state health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Not probed yet, or the probe timed out
    #[default]
    Unknown,
    Healthy,
    /// Confirmed down
    Unhealthy,
}

/// Who owns the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessManager {
    /// Child of the daemon, stopped when the daemon exits
    #[default]
    Direct,
    /// Detached; survives daemon restarts and is re-adopted by pid
    External,
}

/// A managed service process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub service_type: ServiceType,
    pub version: String,
    pub port: u16,
    #[serde(default)]
    pub state: SupervisionState,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub healthy: HealthStatus,
    /// Primary domain; empty when none has been assigned
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub domain_enabled: bool,
    #[serde(default)]
    pub process_manager: ProcessManager,
    #[serde(default)]
    pub stack_id: Option<StackId>,
    /// Every full domain routed to this instance, in attach order
    #[serde(default)]
    pub mapped_domains: Vec<String>,
    pub config: ServiceConfig,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Instance {
    /// Create a stopped instance with a fresh id
    pub fn new(name: impl Into<String>, config: ServiceConfig, version: impl Into<String>, port: u16) -> Self {
        let now = now_millis();
        Self {
            id: InstanceId::generate(),
            name: name.into(),
            service_type: config.service_type(),
            version: version.into(),
            port,
            state: SupervisionState::Stopped,
            pid: None,
            healthy: HealthStatus::Unknown,
            domain: String::new(),
            domain_enabled: false,
            process_manager: ProcessManager::Direct,
            stack_id: None,
            mapped_domains: Vec::new(),
            config,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a process is recorded for this instance
    pub fn running(&self) -> bool {
        self.state.has_process()
    }

    fn transition(&mut self, next: SupervisionState) -> Result<(), DevhostError> {
        if !self.state.can_transition_to(next) {
            return Err(DevhostError::validation(format!(
                "instance {} cannot go from {} to {}",
                self.name, self.state, next
            )));
        }
        self.state = next;
        self.updated_at = now_millis();
        Ok(())
    }

    /// Stopped or Crashed -> Starting
    pub fn mark_starting(&mut self) -> Result<(), DevhostError> {
        self.transition(SupervisionState::Starting)?;
        self.pid = None;
        self.healthy = HealthStatus::Unknown;
        Ok(())
    }

    /// Starting -> Running with the spawned pid
    pub fn mark_running(&mut self, pid: u32) -> Result<(), DevhostError> {
        self.transition(SupervisionState::Running)?;
        self.pid = Some(pid);
        Ok(())
    }

    /// Running -> Stopping
    pub fn mark_stopping(&mut self) -> Result<(), DevhostError> {
        self.transition(SupervisionState::Stopping)
    }

    /// Any stop path ends here: no pid, health unknown
    pub fn mark_stopped(&mut self) -> Result<(), DevhostError> {
        self.transition(SupervisionState::Stopped)?;
        self.pid = None;
        self.healthy = HealthStatus::Unknown;
        Ok(())
    }

    /// Process found dead: no pid, confirmed unhealthy
    pub fn mark_crashed(&mut self) -> Result<(), DevhostError> {
        self.transition(SupervisionState::Crashed)?;
        self.pid = None;
        self.healthy = HealthStatus::Unhealthy;
        Ok(())
    }

    /// Record a routed domain; the first one becomes primary
    pub fn attach_domain(&mut self, full_domain: &str) {
        if !self.mapped_domains.iter().any(|d| d == full_domain) {
            self.mapped_domains.push(full_domain.to_string());
        }
        if self.domain.is_empty() || !self.domain_enabled {
            self.domain = full_domain.to_string();
        }
        self.domain_enabled = true;
        self.updated_at = now_millis();
    }

    /// Forget a routed domain; promotes the next one or disables routing
    pub fn detach_domain(&mut self, full_domain: &str) {
        self.mapped_domains.retain(|d| d != full_domain);
        if self.domain == full_domain {
            match self.mapped_domains.first() {
                Some(next) => self.domain = next.clone(),
                None => self.domain.clear(),
            }
        }
        self.domain_enabled = !self.mapped_domains.is_empty();
        self.updated_at = now_millis();
    }

    /// Check the per-record invariants, returning a description of the first violation
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.running() != self.pid.is_some() {
            return Err(format!(
                "{}: state {} with pid {:?}",
                self.name, self.state, self.pid
            ));
        }
        if self.domain_enabled && !self.mapped_domains.iter().any(|d| d == &self.domain) {
            return Err(format!(
                "{}: primary domain {:?} missing from mapped domains",
                self.name, self.domain
            ));
        }
        if self.config.service_type() != self.service_type {
            return Err(format!("{}: config does not match service type", self.name));
        }
        Ok(())
    }
}

/// Where a domain routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DomainTarget {
    Instance(InstanceId),
    Port(u16),
}

/// How a domain came to exist
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainOrigin {
    /// Created by a caller
    #[default]
    Explicit,
    /// Derived from a child of a parked directory
    Parked { parent: PathBuf },
}

/// A routable name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub subdomain: String,
    pub full_domain: String,
    pub target: DomainTarget,
    pub ssl_enabled: bool,
    #[serde(default)]
    pub origin: DomainOrigin,
    /// Directory served for parked domains
    #[serde(default)]
    pub document_root: Option<PathBuf>,
    pub created_at: u64,
}

impl Domain {
    /// Create an explicit domain
    pub fn new(subdomain: impl Into<String>, tld: &str, target: DomainTarget, ssl_enabled: bool) -> Self {
        let subdomain = subdomain.into();
        Self {
            id: DomainId::generate(),
            full_domain: crate::naming::full_domain(&subdomain, tld),
            subdomain,
            target,
            ssl_enabled,
            origin: DomainOrigin::Explicit,
            document_root: None,
            created_at: now_millis(),
        }
    }

    /// The instance this domain routes to, if any
    pub fn instance_id(&self) -> Option<&InstanceId> {
        match &self.target {
            DomainTarget::Instance(id) => Some(id),
            DomainTarget::Port(_) => None,
        }
    }

    /// Whether this domain was derived by parking `parent`
    pub fn is_parked_under(&self, parent: &std::path::Path) -> bool {
        matches!(&self.origin, DomainOrigin::Parked { parent: p } if p == parent)
    }
}

/// A named group of instances
///
/// Members are not stored here; they are the instances whose `stack_id`
/// points at this stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Stack {
    pub fn new(name: impl Into<String>, description: Option<String>) -> Self {
        let now = now_millis();
        Self {
            id: StackId::generate(),
            name: name.into(),
            description,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A watched parent directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedDirectory {
    pub path: PathBuf,
    pub enabled: bool,
    /// Full domains currently derived from children (rebuildable cache)
    #[serde(default)]
    pub derived_domains: BTreeSet<String>,
    /// Port parked domains are proxied to
    pub upstream_port: u16,
    pub parked_at: u64,
}

impl ParkedDirectory {
    pub fn new(path: PathBuf, upstream_port: u16) -> Self {
        Self {
            path,
            enabled: true,
            derived_domains: BTreeSet::new(),
            upstream_port,
            parked_at: now_millis(),
        }
    }
}
