//! Helper socket server
//!
//! One framed connection per client. Frames on a connection are answered in
//! order; a frame the codec rejects gets a failure reply and the connection
//! stays open, while a transport error closes it.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use dh_core::config::HelperConfig;
use dh_protocol::{
    Decoded, FailureReason, Frame, FrameCodec, HelperRequest, HelperResponse, Message,
    HELPER_VERSION,
};

use crate::error::RequestError;
use crate::ops::PrivilegedOps;
use crate::validate;

/// Serves helper requests on a Unix socket
pub struct HelperServer {
    config: HelperConfig,
    ops: Arc<dyn PrivilegedOps>,
    /// Daemon programs must belong to the helper's own user
    program_owner: u32,
}

impl HelperServer {
    pub fn new(config: HelperConfig, ops: Arc<dyn PrivilegedOps>) -> Self {
        // SAFETY: geteuid has no preconditions
        let program_owner = unsafe { libc::geteuid() };
        Self {
            config,
            ops,
            program_owner,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Bind the socket, replacing a stale one
    ///
    /// The socket is world-connectable; callers are filtered by peer
    /// credentials on accept.
    pub async fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        if path.exists() {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("Failed to remove stale socket {:?}", path))?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind helper socket {:?}", path))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666))
            .await
            .with_context(|| format!("Failed to set permissions on {:?}", path))?;
        Ok(listener)
    }

    /// Bind and serve until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Accept connections until cancelled
    pub async fn serve(self: Arc<Self>, listener: UnixListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Helper listening on {}", self.config.socket_path.display());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let Some(peer_uid) = self.authorize(&stream) else {
                            continue;
                        };
                        let server = Arc::clone(&self);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream, peer_uid, cancel).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept helper connection: {}", e);
                    }
                },
                _ = cancel.cancelled() => break,
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.config.socket_path).await {
            tracing::debug!("Failed to remove {}: {}", self.config.socket_path.display(), e);
        }
        tracing::info!("Helper shutting down");
        Ok(())
    }

    /// Peer uid if the peer may use the helper
    fn authorize(&self, stream: &UnixStream) -> Option<u32> {
        let uid = match stream.peer_cred() {
            Ok(cred) => cred.uid(),
            Err(e) => {
                tracing::warn!("Failed to read helper peer credentials: {}", e);
                return None;
            }
        };
        // SAFETY: geteuid has no preconditions
        let own = unsafe { libc::geteuid() };
        if uid == 0 || uid == own || self.config.allowed_uid == Some(uid) {
            Some(uid)
        } else {
            tracing::warn!("Rejected helper connection from uid {}", uid);
            None
        }
    }

    async fn handle_connection(&self, stream: UnixStream, peer_uid: u32, cancel: CancellationToken) {
        let mut framed = Framed::new(stream, FrameCodec::new());

        loop {
            let decoded = tokio::select! {
                next = framed.next() => match next {
                    Some(Ok(decoded)) => decoded,
                    Some(Err(e)) => {
                        tracing::warn!("Closing helper connection: {}", e);
                        break;
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            let reply = match decoded {
                Decoded::Valid(Frame {
                    request_id,
                    message: Message::Request(request),
                }) => Frame::response(request_id, self.dispatch(request, peer_uid).await),
                Decoded::Valid(Frame {
                    request_id,
                    message: Message::Response(_),
                }) => Frame::response(
                    request_id,
                    HelperResponse::failure(
                        FailureReason::MalformedRequest,
                        "the helper does not accept responses",
                    ),
                ),
                Decoded::Rejected(rejected) => {
                    tracing::debug!(
                        "Rejected frame {}: {}",
                        rejected.request_id,
                        rejected.detail
                    );
                    rejected.into_response()
                }
            };

            if let Err(e) = framed.send(reply).await {
                tracing::warn!("Failed to send helper response: {}", e);
                break;
            }
        }
    }

    /// Validate and run one request
    pub async fn dispatch(&self, request: HelperRequest, peer_uid: u32) -> HelperResponse {
        let kind = request.kind();
        if request.is_mutating() {
            tracing::info!("uid {} requested {:?}", peer_uid, kind);
        } else {
            tracing::debug!("uid {} requested {:?}", peer_uid, kind);
        }

        match self.execute(request, peer_uid).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{:?} failed: {}", kind, e);
                e.into_response()
            }
        }
    }

    async fn execute(
        &self,
        request: HelperRequest,
        peer_uid: u32,
    ) -> Result<HelperResponse, RequestError> {
        validate::check_request(&request, &self.config)?;
        let roots = &self.config.allowed_roots;

        let response = match request {
            HelperRequest::GetCertInfo { path } => {
                let path = validate::resolve_path(&path, roots).await?;
                HelperResponse::CertInfo(self.ops.cert_info(&path).await?)
            }
            HelperRequest::IsCaddyCaTrusted { path } => {
                let path = validate::resolve_path(&path, roots).await?;
                HelperResponse::Trusted {
                    trusted: self.ops.is_trusted(&path).await?,
                }
            }
            HelperRequest::TrustCa { path } => {
                let path = validate::resolve_path(&path, roots).await?;
                HelperResponse::Done {
                    changed: self.ops.trust_ca(&path).await?,
                }
            }
            HelperRequest::InstallDaemon {
                label,
                program,
                args,
            } => {
                let program = validate::resolve_path(&program, &self.config.program_roots).await?;
                validate::check_program(&program, self.program_owner).await?;
                HelperResponse::Done {
                    changed: self.ops.install_daemon(&label, &program, &args).await?,
                }
            }
            HelperRequest::UninstallDaemon { label } => HelperResponse::Done {
                changed: self.ops.uninstall_daemon(&label).await?,
            },
            HelperRequest::SetupPrivilegedDirectory { path, owner_uid } => {
                if peer_uid != 0 && owner_uid != peer_uid {
                    return Err(RequestError::PermissionDenied(format!(
                        "uid {} may not hand directories to uid {}",
                        peer_uid, owner_uid
                    )));
                }
                let path = validate::resolve_path(&path, roots).await?;
                HelperResponse::Done {
                    changed: self.ops.setup_directory(&path, owner_uid).await?,
                }
            }
            HelperRequest::Ping => HelperResponse::Pong {
                version: HELPER_VERSION.to_string(),
            },
        };
        Ok(response)
    }
}
