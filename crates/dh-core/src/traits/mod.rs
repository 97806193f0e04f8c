//! Core trait definitions

mod helper;
mod proxy;

pub use helper::PrivilegedHelper;
pub use proxy::ReverseProxy;
