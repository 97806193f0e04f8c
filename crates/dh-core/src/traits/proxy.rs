//! Reverse-proxy daemon abstraction

use std::path::Path;

use async_trait::async_trait;

use crate::error::DevhostError;

/// The external process that terminates TLS and forwards traffic per domain
///
/// The domain router is the only writer of the configuration directory; an
/// implementation only has to make the running daemon pick up `config_file`.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Apply the configuration at `config_file` without dropping connections
    /// on unaffected sites. Must return within a bounded time.
    async fn reload(&self, config_file: &Path) -> Result<(), DevhostError>;

    /// Human-readable name for logs
    fn name(&self) -> &str {
        "reverse-proxy"
    }
}
