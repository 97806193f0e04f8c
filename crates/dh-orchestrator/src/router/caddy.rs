//! Caddy as the reverse proxy

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use dh_core::traits::ReverseProxy;
use dh_core::DevhostError;

/// Reloads a running Caddy through its CLI
pub struct CaddyProxy {
    binary: PathBuf,
    timeout: Duration,
}

impl CaddyProxy {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl ReverseProxy for CaddyProxy {
    async fn reload(&self, config_file: &Path) -> Result<(), DevhostError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("reload")
            .arg("--config")
            .arg(config_file)
            .args(["--adapter", "caddyfile"])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                DevhostError::ProxyReloadFailed(format!("caddy reload timed out after {:?}", self.timeout))
            })?
            .map_err(|e| {
                DevhostError::ProxyReloadFailed(format!("cannot run {}: {}", self.binary.display(), e))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(DevhostError::ProxyReloadFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn name(&self) -> &str {
        "caddy"
    }
}
