//! dh-orchestrator: Local daemon supervising developer services
//!
//! The orchestrator runs on the developer's machine. It keeps the registry
//! of instances, domains, stacks and parked directories, supervises service
//! processes, renders the reverse-proxy configuration, answers DNS for the
//! local top-level domain, and reaches privileged operations only through
//! the helper bridge. Front ends talk to it over the control IPC socket.

pub mod dns;
pub mod events;
pub mod helper;
pub mod instances;
pub mod ipc;
pub mod parking;
pub mod retry;
pub mod router;
pub mod stack;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod trust;

pub use state::{OrchestratorBuilder, OrchestratorState};
pub use store::{Snapshot, StateStore};
