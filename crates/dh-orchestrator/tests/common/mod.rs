//! Shared harness for the orchestrator integration tests

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use dh_core::service::ServiceType;
use dh_core::traits::{PrivilegedHelper, ReverseProxy};
use dh_core::{DevhostConfig, DevhostError};
use dh_orchestrator::{OrchestratorBuilder, OrchestratorState};
use dh_protocol::{HelperRequest, HelperResponse};

/// Counts reloads; can be told to reject the next configurations
pub struct RecordingProxy {
    reloads: AtomicUsize,
    rejecting: AtomicBool,
    /// Reloads accepted before every later one is rejected
    accept_limit: AtomicUsize,
}

impl Default for RecordingProxy {
    fn default() -> Self {
        Self {
            reloads: AtomicUsize::new(0),
            rejecting: AtomicBool::new(false),
            accept_limit: AtomicUsize::new(usize::MAX),
        }
    }
}

impl RecordingProxy {
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn reject(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Accept `more` further reloads, then reject the rest
    pub fn reject_after(&self, more: usize) {
        self.accept_limit
            .store(self.reloads() + more, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReverseProxy for RecordingProxy {
    async fn reload(&self, config_file: &Path) -> Result<(), DevhostError> {
        if self.rejecting.load(Ordering::SeqCst)
            || self.reloads() >= self.accept_limit.load(Ordering::SeqCst)
        {
            return Err(DevhostError::ProxyReloadFailed(format!(
                "{} rejected",
                config_file.display()
            )));
        }
        assert!(config_file.exists(), "reload called before the config was written");
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording-proxy"
    }
}

/// A helper that is never running
pub struct AbsentHelper;

#[async_trait]
impl PrivilegedHelper for AbsentHelper {
    async fn call(&self, _request: HelperRequest) -> Result<HelperResponse, DevhostError> {
        Err(DevhostError::HelperUnavailable("no helper in tests".into()))
    }
}

/// Config rooted in `dir` with DNS off and short timeouts
pub fn test_config(dir: &Path) -> DevhostConfig {
    let mut config = DevhostConfig::with_data_dir(dir.join("data"));
    config.tld = "test".into();
    config.dns.enabled = false;
    config.proxy.ca_cert_path = dir.join("ca").join("root.crt");
    config.helper.socket_path = dir.join("helper.sock");
    config.helper.request_timeout = Duration::from_secs(2);
    config.supervisor.startup_timeout = Duration::from_secs(3);
    config.supervisor.stop_grace_period = Duration::from_secs(2);
    config.supervisor.health_timeout = Duration::from_millis(300);
    config.supervisor.sweep_interval = Duration::from_secs(1);
    config.parking.refresh_interval = Duration::from_secs(1);
    config
}

pub struct TestEnv {
    pub dir: TempDir,
    pub proxy: Arc<RecordingProxy>,
    pub state: Arc<OrchestratorState>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut DevhostConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);
        Self::build(dir, config).await
    }

    async fn build(dir: TempDir, config: DevhostConfig) -> Self {
        let proxy = Arc::new(RecordingProxy::default());
        let state = OrchestratorBuilder::new(config)
            .proxy(proxy.clone())
            .helper(Arc::new(AbsentHelper))
            .build()
            .await
            .unwrap();
        Self {
            dir,
            proxy,
            state: Arc::new(state),
        }
    }

    /// A fresh orchestrator over the same data directory, as after a restart
    pub async fn reopen(self) -> Self {
        let config = (*self.state.config).clone();
        drop(self.state);
        Self::build(self.dir, config).await
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Install an executable shell script as the binary for a type and version
    pub fn install_binary(&self, service_type: ServiceType, version: &str, script: &str) -> PathBuf {
        let dir = self
            .state
            .config
            .bin_dir()
            .join(service_type.as_str())
            .join(version);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(service_type.binary_name());
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A binary that stays up until signalled
    pub fn install_sleeper(&self, service_type: ServiceType, version: &str) -> PathBuf {
        self.install_binary(service_type, version, "exec sleep 60")
    }

    /// Create a directory under the temp root
    pub fn mkdir(&self, relative: &str) -> PathBuf {
        let path = self.path().join(relative);
        std::fs::create_dir_all(&path).unwrap();
        path.canonicalize().unwrap()
    }
}

/// Bind a loopback listener on a free port, standing in for a service
pub async fn fake_service() -> (tokio::net::TcpListener, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Wait until `check` holds or give up after a few seconds
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..50 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}
