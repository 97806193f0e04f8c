//! Certificate trust manager
//!
//! Reports whether the reverse proxy's local CA exists and whether the OS
//! trusts it. Reads happen directly when the orchestrator has permission and
//! fall back to the privileged helper when it does not. Nothing here changes
//! trust; that is a user-consented action performed through the helper.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dh_core::certs;
use dh_core::report::{TrustSource, TrustStatus};
use dh_core::traits::PrivilegedHelper;
use dh_core::{DevhostError, Result};
use dh_protocol::CertInfo;

use crate::retry::retry_once;

/// Direct, unprivileged access to CA material
#[async_trait]
pub trait CaReader: Send + Sync {
    async fn inspect(&self, path: &Path) -> io::Result<CertInfo>;
    async fn is_trusted(&self, path: &Path) -> io::Result<bool>;
}

/// Reads the CA with the orchestrator's own permissions
pub struct LocalCaReader;

#[async_trait]
impl CaReader for LocalCaReader {
    async fn inspect(&self, path: &Path) -> io::Result<CertInfo> {
        certs::inspect_certificate(path).await
    }

    async fn is_trusted(&self, path: &Path) -> io::Result<bool> {
        certs::is_trusted_by_os(path).await
    }
}

pub struct TrustManager {
    ca_path: PathBuf,
    reader: Arc<dyn CaReader>,
    helper: Arc<dyn PrivilegedHelper>,
    last_known: Mutex<Option<TrustStatus>>,
}

impl TrustManager {
    pub fn new(
        ca_path: PathBuf,
        reader: Arc<dyn CaReader>,
        helper: Arc<dyn PrivilegedHelper>,
    ) -> Self {
        Self {
            ca_path,
            reader,
            helper,
            last_known: Mutex::new(None),
        }
    }

    pub fn ca_path(&self) -> &Path {
        &self.ca_path
    }

    /// Full trust status, escalating to the helper when direct reads are denied
    pub async fn get_trust_status(&self) -> Result<TrustStatus> {
        let status = match self.reader.inspect(&self.ca_path).await {
            Ok(info) if !info.exists => TrustStatus::missing(TrustSource::Direct),
            Ok(info) => {
                let is_trusted = match self.reader.is_trusted(&self.ca_path).await {
                    Ok(trusted) => trusted,
                    Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                        self.helper_is_trusted().await?
                    }
                    Err(e) => {
                        tracing::warn!("Could not verify CA trust directly: {}", e);
                        false
                    }
                };
                status_from(info, is_trusted, TrustSource::Direct)
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!(
                    "CA at {} not readable, asking the helper",
                    self.ca_path.display()
                );
                let helper = Arc::clone(&self.helper);
                let path = self.ca_path.clone();
                let info = retry_once("helper cert info", || {
                    let helper = Arc::clone(&helper);
                    let path = path.clone();
                    async move { helper.cert_info(&path).await }
                })
                .await?;
                if info.exists {
                    let is_trusted = self.helper_is_trusted().await?;
                    status_from(info, is_trusted, TrustSource::Helper)
                } else {
                    TrustStatus::missing(TrustSource::Helper)
                }
            }
            Err(e) => return Err(e.into()),
        };

        if let Ok(mut last) = self.last_known.lock() {
            *last = Some(status.clone());
        }
        Ok(status)
    }

    async fn helper_is_trusted(&self) -> Result<bool> {
        let helper = Arc::clone(&self.helper);
        let path = self.ca_path.clone();
        retry_once("helper trust check", || {
            let helper = Arc::clone(&helper);
            let path = path.clone();
            async move { helper.is_ca_trusted(&path).await }
        })
        .await
    }

    /// Cheap existence check used while rendering
    ///
    /// Needs only directory search permission. When even that is denied the
    /// last full status decides.
    pub async fn ca_exists(&self) -> bool {
        match tokio::fs::metadata(&self.ca_path).await {
            Ok(meta) => meta.is_file(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(_) => self
                .last_known
                .lock()
                .ok()
                .and_then(|last| last.as_ref().map(|s| s.ca_exists))
                .unwrap_or(false),
        }
    }

    /// Fail with `CertificateNotFound` unless the CA exists
    pub async fn require_ca(&self) -> Result<TrustStatus> {
        let status = self.get_trust_status().await?;
        if !status.ca_exists {
            return Err(DevhostError::CertificateNotFound(self.ca_path.clone()));
        }
        Ok(status)
    }

    /// Fail unless the CA exists and is trusted by the OS
    pub async fn require_trusted(&self) -> Result<TrustStatus> {
        let status = self.require_ca().await?;
        if !status.is_trusted {
            return Err(DevhostError::CertificateNotTrusted(format!(
                "{} is not in the system trust store",
                status.cert_name.as_deref().unwrap_or("local CA")
            )));
        }
        Ok(status)
    }
}

fn status_from(info: CertInfo, is_trusted: bool, source: TrustSource) -> TrustStatus {
    TrustStatus {
        ca_exists: true,
        is_trusted,
        cert_name: info.name,
        expiry: info.expiry,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dh_protocol::{FailureReason, HelperRequest, HelperResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    struct ReadableReader {
        info: CertInfo,
        trusted: bool,
    }

    #[async_trait]
    impl CaReader for ReadableReader {
        async fn inspect(&self, _path: &Path) -> io::Result<CertInfo> {
            Ok(self.info.clone())
        }
        async fn is_trusted(&self, _path: &Path) -> io::Result<bool> {
            Ok(self.trusted)
        }
    }

    /// Helper double answering from a fixed script
    struct ScriptedHelper {
        available: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PrivilegedHelper for ScriptedHelper {
        async fn call(&self, request: HelperRequest) -> Result<HelperResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.available {
                return Err(DevhostError::HelperUnavailable("not installed".into()));
            }
            Ok(match request {
                HelperRequest::GetCertInfo { .. } => HelperResponse::CertInfo(CertInfo {
                    exists: true,
                    name: Some("Caddy Local Authority".into()),
                    expiry: Some("Jan  1 00:00:00 2035 GMT".into()),
                }),
                HelperRequest::IsCaddyCaTrusted { .. } => HelperResponse::Trusted { trusted: true },
                _ => HelperResponse::failure(FailureReason::UnsupportedRequest, "unexpected"),
            })
        }
    }

    fn helper(available: bool) -> Arc<ScriptedHelper> {
        Arc::new(ScriptedHelper {
            available,
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_direct_read_skips_helper() {
        let helper = helper(true);
        let manager = TrustManager::new(
            PathBuf::from("/ca/root.crt"),
            Arc::new(ReadableReader {
                info: CertInfo {
                    exists: true,
                    name: Some("Local".into()),
                    expiry: None,
                },
                trusted: false,
            }),
            helper.clone(),
        );

        let status = manager.get_trust_status().await.unwrap();
        assert!(status.ca_exists);
        assert!(!status.is_trusted);
        assert_eq!(status.source, TrustSource::Direct);
        assert_eq!(helper.calls.load(Ordering::SeqCst), 0);

        assert!(manager.require_ca().await.is_ok());
        assert!(matches!(
            manager.require_trusted().await,
            Err(DevhostError::CertificateNotTrusted(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_escalates_to_helper() {
        let manager = TrustManager::new(
            PathBuf::from("/ca/root.crt"),
            Arc::new(DeniedReader),
            helper(true),
        );
        let status = manager.get_trust_status().await.unwrap();
        assert!(status.ca_exists);
        assert!(status.is_trusted);
        assert_eq!(status.source, TrustSource::Helper);
        assert_eq!(status.cert_name.as_deref(), Some("Caddy Local Authority"));
    }

    #[tokio::test]
    async fn test_unavailable_helper_surfaces() {
        let helper = helper(false);
        let manager = TrustManager::new(
            PathBuf::from("/ca/root.crt"),
            Arc::new(DeniedReader),
            helper.clone(),
        );
        assert!(matches!(
            manager.get_trust_status().await,
            Err(DevhostError::HelperUnavailable(_))
        ));
        // Not transient, so not retried
        assert_eq!(helper.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_ca() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = TrustManager::new(
            dir.path().join("root.crt"),
            Arc::new(LocalCaReader),
            helper(true),
        );
        let status = manager.get_trust_status().await.unwrap();
        assert_eq!(status, TrustStatus::missing(TrustSource::Direct));
        assert!(!manager.ca_exists().await);
        assert!(matches!(
            manager.require_ca().await,
            Err(DevhostError::CertificateNotFound(_))
        ));
    }
}
