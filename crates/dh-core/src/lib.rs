//! dh-core: Core abstractions and configuration for devhost
//!
//! This crate provides the shared model (instances, domains, stacks, parked
//! directories), the caller-facing error taxonomy, configuration structures,
//! the control IPC message types and the traits the orchestrator uses at its
//! process boundaries.

pub mod certs;
pub mod config;
pub mod error;
pub mod ipc;
pub mod model;
pub mod naming;
pub mod pidfile;
pub mod report;
pub mod service;
pub mod traits;
pub mod types;

pub use config::DevhostConfig;
pub use error::{DevhostError, ErrorKind, Result};
pub use model::{
    Domain, DomainOrigin, DomainTarget, HealthStatus, Instance, ParkedDirectory, ProcessManager,
    Stack, SupervisionState,
};
pub use service::{ServiceConfig, ServiceType};
pub use types::{DomainId, InstanceId, StackId};
