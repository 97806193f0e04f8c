//! dh-helper: The privileged side of the devhost helper protocol
//!
//! A small root-owned service that performs the handful of operations the
//! orchestrator is not allowed to do itself. It accepts framed requests on
//! a Unix socket, checks who is asking and what they are asking for, and
//! answers every request with a typed response.

pub mod error;
pub mod ops;
pub mod server;
pub mod validate;

pub use error::RequestError;
pub use ops::{PrivilegedOps, SystemOps};
pub use server::HelperServer;
