//! The helper bridge against a real helper server
//!
//! The helper runs in-process with fake operations; the bridge and the trust
//! manager talk to it over the socket exactly as the daemon does.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use dh_core::config::HelperConfig;
use dh_core::report::TrustSource;
use dh_core::traits::PrivilegedHelper;
use dh_core::DevhostError;
use dh_helper::{HelperServer, PrivilegedOps, RequestError};
use dh_orchestrator::helper::HelperBridge;
use dh_orchestrator::trust::{CaReader, TrustManager};
use dh_protocol::{CertInfo, FailureReason, HELPER_VERSION};

#[derive(Default)]
struct FakeOps {
    trusted: Mutex<bool>,
}

#[async_trait]
impl PrivilegedOps for FakeOps {
    async fn cert_info(&self, _path: &Path) -> Result<CertInfo, RequestError> {
        Ok(CertInfo {
            exists: true,
            name: Some("Caddy Local Authority".into()),
            expiry: Some("Jan  1 00:00:00 2035 GMT".into()),
        })
    }

    async fn is_trusted(&self, _path: &Path) -> Result<bool, RequestError> {
        Ok(*self.trusted.lock().unwrap())
    }

    async fn trust_ca(&self, _path: &Path) -> Result<bool, RequestError> {
        let mut trusted = self.trusted.lock().unwrap();
        let changed = !*trusted;
        *trusted = true;
        Ok(changed)
    }

    async fn install_daemon(
        &self,
        _label: &str,
        _program: &Path,
        _args: &[String],
    ) -> Result<bool, RequestError> {
        Ok(true)
    }

    async fn uninstall_daemon(&self, label: &str) -> Result<bool, RequestError> {
        Err(RequestError::NotFound(label.to_string()))
    }

    async fn setup_directory(&self, _path: &Path, _owner_uid: u32) -> Result<bool, RequestError> {
        Ok(true)
    }
}

/// Direct reads always hit a permission wall
struct DeniedReader;

#[async_trait]
impl CaReader for DeniedReader {
    async fn inspect(&self, _path: &Path) -> io::Result<CertInfo> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }

    async fn is_trusted(&self, _path: &Path) -> io::Result<bool> {
        Err(io::Error::from(io::ErrorKind::PermissionDenied))
    }
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    config: HelperConfig,
    cancel: CancellationToken,
}

impl Fixture {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("caddy");
        std::fs::create_dir_all(&root).unwrap();

        let config = HelperConfig {
            socket_path: dir.path().join("helper.sock"),
            request_timeout: Duration::from_secs(2),
            allowed_roots: vec![root.clone()],
            ..HelperConfig::default()
        };
        let server = Arc::new(HelperServer::new(config.clone(), Arc::new(FakeOps::default())));
        let listener = server.bind().await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(listener, cancel.clone()));

        Self {
            _dir: dir,
            root,
            config,
            cancel,
        }
    }

    fn bridge(&self) -> HelperBridge {
        HelperBridge::new(&self.config)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[tokio::test]
async fn test_ping_through_bridge() {
    let fixture = Fixture::start().await;
    let bridge = fixture.bridge();

    assert_eq!(bridge.ping().await.unwrap(), HELPER_VERSION);
    // The connection is reused for the next call
    assert_eq!(bridge.ping().await.unwrap(), HELPER_VERSION);
}

#[tokio::test]
async fn test_trust_through_bridge() {
    let fixture = Fixture::start().await;
    let bridge = fixture.bridge();
    let ca = fixture.root.join("root.crt");

    assert!(!bridge.is_ca_trusted(&ca).await.unwrap());
    assert!(bridge.trust_ca(&ca).await.unwrap());
    assert!(!bridge.trust_ca(&ca).await.unwrap());
    assert!(bridge.is_ca_trusted(&ca).await.unwrap());

    let info = bridge.cert_info(&ca).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Caddy Local Authority"));
}

#[tokio::test]
async fn test_helper_failures_are_typed() {
    let fixture = Fixture::start().await;
    let bridge = fixture.bridge();

    match bridge.trust_ca(Path::new("/etc/shadow")).await {
        Err(DevhostError::HelperFailed { reason, .. }) => {
            assert_eq!(reason, FailureReason::InvalidPath)
        }
        other => panic!("Expected HelperFailed, got {:?}", other),
    }
    match bridge.uninstall_daemon("dev.devhost.proxy").await {
        Err(DevhostError::HelperFailed { reason, .. }) => {
            assert_eq!(reason, FailureReason::NotFound)
        }
        other => panic!("Expected HelperFailed, got {:?}", other),
    }

    // A failure does not poison the connection
    assert_eq!(bridge.ping().await.unwrap(), HELPER_VERSION);
}

#[tokio::test]
async fn test_stopped_helper_is_unavailable() {
    let fixture = Fixture::start().await;
    let bridge = fixture.bridge();
    bridge.ping().await.unwrap();

    fixture.cancel.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let _ = std::fs::remove_file(&fixture.config.socket_path);

    let fresh = fixture.bridge();
    assert!(matches!(
        fresh.ping().await,
        Err(DevhostError::HelperUnavailable(_))
    ));
}

#[tokio::test]
async fn test_trust_status_escalates_to_helper() {
    let fixture = Fixture::start().await;
    let bridge: Arc<dyn PrivilegedHelper> = Arc::new(fixture.bridge());
    let ca = fixture.root.join("root.crt");
    let trust = TrustManager::new(ca.clone(), Arc::new(DeniedReader), Arc::clone(&bridge));

    let status = trust.get_trust_status().await.unwrap();
    assert_eq!(status.source, TrustSource::Helper);
    assert!(status.ca_exists);
    assert!(!status.is_trusted);
    assert!(matches!(
        trust.require_trusted().await,
        Err(DevhostError::CertificateNotTrusted(_))
    ));

    bridge.trust_ca(&ca).await.unwrap();
    let status = trust.require_trusted().await.unwrap();
    assert!(status.is_trusted);
    assert_eq!(status.cert_name.as_deref(), Some("Caddy Local Authority"));
}
