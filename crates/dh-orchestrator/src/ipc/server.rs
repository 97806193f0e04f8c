//! IPC server implementation
//!
//! Listens on a Unix socket created with mode 0600 and additionally checks
//! the peer's uid, so only the owning user (or root) can drive the daemon.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use dh_core::ipc::{IpcEvent, IpcRequest, IpcResponse};
use dh_core::ErrorKind;

use crate::state::OrchestratorState;

/// IPC server for CLI/GUI communication
pub struct IpcServer {
    /// Socket path
    pub socket_path: PathBuf,
    /// Orchestrator state
    state: Arc<OrchestratorState>,
    /// Cancellation token for shutdown
    shutdown_token: Option<CancellationToken>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(socket_path: PathBuf, state: Arc<OrchestratorState>) -> Self {
        Self {
            socket_path,
            state,
            shutdown_token: None,
        }
    }

    /// Set the shutdown token (call before run)
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown_token = Some(token);
        self
    }

    /// Bind the socket, replacing a stale one left by a dead daemon
    pub async fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                bail!(
                    "Another daemon is already listening on {}",
                    self.socket_path.display()
                );
            }
            tokio::fs::remove_file(&self.socket_path)
                .await
                .with_context(|| format!("Failed to remove stale socket {:?}", self.socket_path))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind IPC socket {:?}", self.socket_path))?;
        tokio::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict {:?}", self.socket_path))?;
        Ok(listener)
    }

    /// Start the IPC server
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections until the shutdown token fires
    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        tracing::info!("IPC server listening on {}", self.socket_path.display());
        let shutdown = self.shutdown_token.clone().unwrap_or_default();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if !peer_is_trusted(&stream) {
                            tracing::warn!("Rejected IPC connection from another user");
                            continue;
                        }

                        let state = Arc::clone(&self.state);
                        let shutdown_token = self.shutdown_token.clone();

                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, state, shutdown_token).await {
                                tracing::warn!("IPC client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept IPC connection: {}", e);
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.socket_path).await {
            tracing::debug!("Failed to remove {}: {}", self.socket_path.display(), e);
        }
        tracing::info!("IPC server stopped");
        Ok(())
    }
}

fn peer_is_trusted(stream: &UnixStream) -> bool {
    // SAFETY: geteuid has no preconditions
    let own = unsafe { libc::geteuid() };
    match stream.peer_cred() {
        Ok(cred) => cred.uid() == own || cred.uid() == 0,
        Err(e) => {
            tracing::warn!("Failed to read IPC peer credentials: {}", e);
            false
        }
    }
}

/// Next event for a subscribed connection; never resolves otherwise
async fn next_event(
    events: &mut Option<broadcast::Receiver<IpcEvent>>,
) -> std::result::Result<IpcEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_client(
    stream: UnixStream,
    state: Arc<OrchestratorState>,
    shutdown_token: Option<CancellationToken>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    let mut events: Option<broadcast::Receiver<IpcEvent>> = None;

    loop {
        tokio::select! {
            // Handle incoming requests
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break, // EOF
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            line.clear();
                            continue;
                        }

                        let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                            Ok(IpcRequest::Subscribe) => {
                                if events.is_none() {
                                    events = Some(state.events.subscribe());
                                    tracing::debug!("IPC client subscribed to events");
                                }
                                IpcResponse::Subscribed
                            }
                            Ok(request) => {
                                handle_request(request, &state, shutdown_token.as_ref()).await
                            }
                            Err(e) => IpcResponse::Error {
                                kind: ErrorKind::Protocol,
                                message: format!("Invalid request: {}", e),
                            },
                        };

                        let mut response_json = serde_json::to_string(&response)?;
                        response_json.push('\n');
                        writer.write_all(response_json.as_bytes()).await?;

                        line.clear();
                    }
                    Err(e) => {
                        return Err(e.into());
                    }
                }
            }

            // Forward events to subscribed clients
            result = next_event(&mut events) => {
                match result {
                    Ok(event) => {
                        let mut event_json = serde_json::to_string(&event)?;
                        event_json.push('\n');
                        writer.write_all(event_json.as_bytes()).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("IPC client lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Turn an operation result into a response
fn respond<T>(result: dh_core::Result<T>, ok: impl FnOnce(T) -> IpcResponse) -> IpcResponse {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            tracing::debug!("Request failed: {}", e);
            e.into()
        }
    }
}

async fn handle_request(
    request: IpcRequest,
    state: &OrchestratorState,
    shutdown_token: Option<&CancellationToken>,
) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => IpcResponse::Status(state.status().await),
        IpcRequest::Ping => IpcResponse::Pong,

        // Handled per connection in handle_client
        IpcRequest::Subscribe => IpcResponse::Subscribed,

        IpcRequest::Shutdown => {
            tracing::info!("Shutdown requested via IPC");
            if let Some(token) = shutdown_token {
                token.cancel();
                IpcResponse::Ok
            } else {
                IpcResponse::Error {
                    kind: ErrorKind::ValidationFailed,
                    message: "Shutdown not supported (no shutdown token configured)".to_string(),
                }
            }
        }

        // Instances
        IpcRequest::ListInstances => IpcResponse::Instances {
            instances: state.list_instances(),
        },
        IpcRequest::GetInstance { instance } => {
            respond(state.get_instance(&instance), IpcResponse::Instance)
        }
        IpcRequest::CreateInstance(request) => {
            respond(state.create_instance(request).await, IpcResponse::Instance)
        }
        IpcRequest::StartInstance { instance } => {
            respond(state.start_instance(&instance).await, IpcResponse::Instance)
        }
        IpcRequest::StopInstance { instance } => {
            respond(state.stop_instance(&instance).await, IpcResponse::Instance)
        }
        IpcRequest::RestartInstance { instance } => {
            respond(state.restart_instance(&instance).await, IpcResponse::Instance)
        }
        IpcRequest::DeleteInstance { instance } => {
            respond(state.delete_instance(&instance).await, |_| IpcResponse::Ok)
        }
        IpcRequest::RenameInstance { instance, new_name } => respond(
            state.rename_instance(&instance, &new_name).await,
            IpcResponse::Instance,
        ),
        IpcRequest::ChangeInstanceVersion { instance, version } => respond(
            state.change_instance_version(&instance, &version).await,
            IpcResponse::Instance,
        ),
        IpcRequest::UpdateInstanceConfig { instance, config } => respond(
            state.update_instance_config(&instance, config).await,
            IpcResponse::Instance,
        ),
        IpcRequest::CheckInstanceHealth { instance } => respond(
            state.check_instance_health(&instance).await,
            |(instance, healthy)| IpcResponse::Health {
                instance_id: instance.id,
                healthy,
            },
        ),
        IpcRequest::GetConfigSchema { service_type } => IpcResponse::ConfigSchema {
            fields: state.config_schema(service_type),
        },

        // Domains
        IpcRequest::ListDomains => IpcResponse::Domains {
            domains: state.list_domains(),
        },
        IpcRequest::CreateDomain(request) => {
            respond(state.create_domain(request).await, IpcResponse::Domain)
        }
        IpcRequest::DeleteDomain { domain } => {
            respond(state.delete_domain(&domain).await, |_| IpcResponse::Ok)
        }
        IpcRequest::UpdateDomainSsl {
            domain,
            ssl_enabled,
        } => respond(
            state.update_domain_ssl(&domain, ssl_enabled).await,
            IpcResponse::Domain,
        ),

        // Parking
        IpcRequest::ListParked => IpcResponse::ParkedDirectories {
            parked: state.list_parked(),
        },
        IpcRequest::Park {
            path,
            upstream_port,
        } => respond(state.park(&path, upstream_port).await, |(parked, _)| {
            IpcResponse::ParkedDirectory(parked)
        }),
        IpcRequest::Forget { path } => respond(state.forget(&path).await, |_| IpcResponse::Ok),
        IpcRequest::RefreshParked { path } => {
            respond(state.refresh_parked(&path).await, IpcResponse::Refreshed)
        }
        IpcRequest::ParkStatus { path } => IpcResponse::ParkStatus(state.park_status(&path).await),

        // Stacks
        IpcRequest::ListStacks => IpcResponse::Stacks {
            stacks: state.list_stacks(),
        },
        IpcRequest::GetStack { stack } => respond(state.get_stack(&stack), IpcResponse::Stack),
        IpcRequest::CreateStack {
            name,
            description,
            instances,
        } => respond(
            state.create_stack(&name, description, &instances).await,
            IpcResponse::Stack,
        ),
        IpcRequest::DeleteStack { stack, cascade } => {
            respond(state.delete_stack(&stack, cascade).await, |_| IpcResponse::Ok)
        }
        IpcRequest::AddToStack { stack, instance } => respond(
            state.add_to_stack(&stack, &instance).await,
            IpcResponse::Stack,
        ),
        IpcRequest::RemoveFromStack { stack, instance } => respond(
            state.remove_from_stack(&stack, &instance).await,
            IpcResponse::Stack,
        ),
        IpcRequest::StartStack { stack } => {
            respond(state.start_stack(&stack).await, |(stack_id, results)| {
                IpcResponse::StackResults { stack_id, results }
            })
        }
        IpcRequest::StopStack { stack } => {
            respond(state.stop_stack(&stack).await, |(stack_id, results)| {
                IpcResponse::StackResults { stack_id, results }
            })
        }
        IpcRequest::ExportStack { stack } => respond(state.export_stack(&stack), |document| {
            IpcResponse::StackExported { document }
        }),
        IpcRequest::ImportStack { document } => {
            respond(state.import_stack(document).await, IpcResponse::StackImported)
        }

        // Trust and DNS
        IpcRequest::GetTrustStatus => respond(state.trust_status().await, IpcResponse::TrustStatus),
        IpcRequest::GetDnsStatus => IpcResponse::DnsStatus(state.dns_status().await),
        IpcRequest::RestartDns => respond(state.restart_dns().await, IpcResponse::DnsStatus),
    }
}
