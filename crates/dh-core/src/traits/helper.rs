//! Privileged helper abstraction

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dh_protocol::{CertInfo, FailureReason, HelperRequest, HelperResponse};

use crate::error::DevhostError;

/// Client side of the privilege boundary
///
/// Implementations marshal a request to the helper and return its typed
/// response, mapping absence and silence to `HelperUnavailable` and
/// `HelperTimeout`. The typed wrappers turn `Failure` responses into
/// `HelperFailed` errors.
#[async_trait]
pub trait PrivilegedHelper: Send + Sync {
    /// Send one request and wait for its response
    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, DevhostError>;

    /// Certificate metadata for a file the caller cannot read
    async fn cert_info(&self, path: &Path) -> Result<CertInfo, DevhostError> {
        match self
            .call(HelperRequest::GetCertInfo {
                path: path.to_path_buf(),
            })
            .await?
        {
            HelperResponse::CertInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    /// Whether the OS trusts the certificate at `path`
    async fn is_ca_trusted(&self, path: &Path) -> Result<bool, DevhostError> {
        match self
            .call(HelperRequest::IsCaddyCaTrusted {
                path: path.to_path_buf(),
            })
            .await?
        {
            HelperResponse::Trusted { trusted } => Ok(trusted),
            other => Err(unexpected(other)),
        }
    }

    /// Trust the certificate at `path` system-wide
    async fn trust_ca(&self, path: &Path) -> Result<bool, DevhostError> {
        expect_done(
            self.call(HelperRequest::TrustCa {
                path: path.to_path_buf(),
            })
            .await?,
        )
    }

    /// Install and load a background daemon
    async fn install_daemon(
        &self,
        label: &str,
        program: PathBuf,
        args: Vec<String>,
    ) -> Result<bool, DevhostError> {
        expect_done(
            self.call(HelperRequest::InstallDaemon {
                label: label.to_string(),
                program,
                args,
            })
            .await?,
        )
    }

    /// Unload and remove a background daemon
    async fn uninstall_daemon(&self, label: &str) -> Result<bool, DevhostError> {
        expect_done(
            self.call(HelperRequest::UninstallDaemon {
                label: label.to_string(),
            })
            .await?,
        )
    }

    /// Create a privileged directory owned by `owner_uid`
    async fn setup_privileged_directory(
        &self,
        path: &Path,
        owner_uid: u32,
    ) -> Result<bool, DevhostError> {
        expect_done(
            self.call(HelperRequest::SetupPrivilegedDirectory {
                path: path.to_path_buf(),
                owner_uid,
            })
            .await?,
        )
    }

    /// Helper version
    async fn ping(&self) -> Result<String, DevhostError> {
        match self.call(HelperRequest::Ping).await? {
            HelperResponse::Pong { version } => Ok(version),
            other => Err(unexpected(other)),
        }
    }
}

fn expect_done(response: HelperResponse) -> Result<bool, DevhostError> {
    match response {
        HelperResponse::Done { changed } => Ok(changed),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: HelperResponse) -> DevhostError {
    match response {
        HelperResponse::Failure { reason, detail } => DevhostError::HelperFailed { reason, detail },
        other => DevhostError::HelperFailed {
            reason: FailureReason::Internal,
            detail: format!("unexpected response: {:?}", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned(HelperResponse);

    #[async_trait]
    impl PrivilegedHelper for Canned {
        async fn call(&self, _request: HelperRequest) -> Result<HelperResponse, DevhostError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_failure_maps_to_helper_failed() {
        let helper = Canned(HelperResponse::failure(FailureReason::InvalidPath, "outside roots"));
        match helper.trust_ca(Path::new("/etc/x.crt")).await {
            Err(DevhostError::HelperFailed { reason, .. }) => {
                assert_eq!(reason, FailureReason::InvalidPath)
            }
            other => panic!("Expected HelperFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatched_response_is_rejected() {
        let helper = Canned(HelperResponse::Done { changed: true });
        assert!(helper.is_ca_trusted(Path::new("/tmp/root.crt")).await.is_err());
    }
}
