//! IPC integration tests
//!
//! Drives the daemon through the control socket the way a front end does.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use dh_core::ipc::{CreateInstanceRequest, IpcEvent, IpcRequest, IpcResponse};
use dh_core::service::ServiceType;
use dh_core::config::DevhostConfig;
use dh_core::ErrorKind;
use dh_orchestrator::ipc::IpcServer;

use common::TestEnv;

/// IPC test client wrapper
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
    /// Events read while waiting for a response
    events: Vec<IpcEvent>,
}

impl TestClient {
    async fn connect(path: &Path) -> Self {
        let mut last_err = None;
        for _ in 0..10 {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Self {
                        reader: BufReader::new(reader),
                        writer: BufWriter::new(writer),
                        events: Vec::new(),
                    };
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        panic!("Failed to connect to IPC server at {:?}: {:?}", path, last_err);
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .expect("Failed to write request");
        self.writer.flush().await.expect("Failed to flush");
    }

    async fn read_line(&mut self) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for the daemon")
            .expect("Failed to read line");
        if line.is_empty() {
            panic!("Server sent empty response (connection closed?)");
        }
        line
    }

    /// Next response, setting aside any events that arrive first
    async fn read_response(&mut self) -> IpcResponse {
        loop {
            let line = self.read_line().await;
            if let Ok(event) = serde_json::from_str::<IpcEvent>(&line) {
                self.events.push(event);
                continue;
            }
            return serde_json::from_str(&line).expect("Failed to parse response");
        }
    }

    async fn send_request(&mut self, request: IpcRequest) -> IpcResponse {
        let json = serde_json::to_string(&request).expect("Failed to serialize request");
        self.send_raw(&json).await;
        self.read_response().await
    }

    async fn next_event(&mut self) -> IpcEvent {
        if !self.events.is_empty() {
            return self.events.remove(0);
        }
        let line = self.read_line().await;
        serde_json::from_str(&line).expect("Failed to parse event")
    }
}

struct Daemon {
    env: TestEnv,
    socket: PathBuf,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

async fn start_daemon() -> Daemon {
    start_daemon_with(|_| {}).await
}

async fn start_daemon_with(adjust: impl FnOnce(&mut DevhostConfig)) -> Daemon {
    let env = TestEnv::with_config(adjust).await;
    let socket = env.state.config.ipc_socket_path();
    let shutdown = CancellationToken::new();

    let server = IpcServer::new(socket.clone(), Arc::clone(&env.state))
        .with_shutdown_token(shutdown.clone());
    let listener = server.bind().await.unwrap();
    let handle = tokio::spawn(async move { server.serve(listener).await });

    Daemon {
        env,
        socket,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn test_ipc_ping_pong() {
    let daemon = start_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let response = client.send_request(IpcRequest::Ping).await;
    assert!(matches!(response, IpcResponse::Pong));

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_get_status() {
    let daemon = start_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    match client.send_request(IpcRequest::GetStatus).await {
        IpcResponse::Status(status) => {
            assert_eq!(status.tld, "test");
            assert_eq!(status.instance_count, 0);
            assert!(!status.dns.running);
        }
        other => panic!("Expected Status, got {:?}", other),
    }

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_socket_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let daemon = start_daemon().await;
    let mode = std::fs::metadata(&daemon.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // A second daemon on the same socket is refused
    let second = IpcServer::new(daemon.socket.clone(), Arc::clone(&daemon.env.state));
    assert!(second.bind().await.is_err());

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_invalid_request() {
    let daemon = start_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    client.send_raw("{\"type\":\"launch_rockets\"}").await;
    match client.read_response().await {
        IpcResponse::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Protocol);
            assert!(message.contains("Invalid request"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }

    // The connection is still usable
    let response = client.send_request(IpcRequest::Ping).await;
    assert!(matches!(response, IpcResponse::Pong));

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_instance_round_trip() {
    let daemon = start_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let request = CreateInstanceRequest {
        port: Some(16379),
        ..CreateInstanceRequest::new("cache", ServiceType::Cache, "7.2")
    };
    let created = match client.send_request(IpcRequest::CreateInstance(request)).await {
        IpcResponse::Instance(instance) => instance,
        other => panic!("Expected Instance, got {:?}", other),
    };
    assert_eq!(created.port, 16379);

    match client
        .send_request(IpcRequest::GetInstance {
            instance: created.id.to_string(),
        })
        .await
    {
        IpcResponse::Instance(instance) => assert_eq!(instance.name, "cache"),
        other => panic!("Expected Instance, got {:?}", other),
    }

    match client
        .send_request(IpcRequest::StartInstance {
            instance: "cache".into(),
        })
        .await
    {
        IpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::BinaryMissing),
        other => panic!("Expected Error, got {:?}", other),
    }

    match client
        .send_request(IpcRequest::GetInstance {
            instance: "missing".into(),
        })
        .await
    {
        IpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("Expected Error, got {:?}", other),
    }

    match client.send_request(IpcRequest::ListInstances).await {
        IpcResponse::Instances { instances } => assert_eq!(instances.len(), 1),
        other => panic!("Expected Instances, got {:?}", other),
    }

    match client
        .send_request(IpcRequest::GetConfigSchema {
            service_type: ServiceType::SqlDatabase,
        })
        .await
    {
        IpcResponse::ConfigSchema { fields } => {
            assert!(fields.iter().any(|f| f.key == "username" && f.required));
        }
        other => panic!("Expected ConfigSchema, got {:?}", other),
    }

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_subscribe_receives_events() {
    let daemon = start_daemon().await;
    let mut watcher = TestClient::connect(&daemon.socket).await;
    let mut client = TestClient::connect(&daemon.socket).await;

    assert!(matches!(
        watcher.send_request(IpcRequest::Subscribe).await,
        IpcResponse::Subscribed
    ));

    let created = match client
        .send_request(IpcRequest::CreateInstance(CreateInstanceRequest::new(
            "search",
            ServiceType::Search,
            "1.7",
        )))
        .await
    {
        IpcResponse::Instance(instance) => instance,
        other => panic!("Expected Instance, got {:?}", other),
    };

    loop {
        if let IpcEvent::InstanceChanged(instance) = watcher.next_event().await {
            assert_eq!(instance.id, created.id);
            break;
        }
    }

    assert!(matches!(
        client
            .send_request(IpcRequest::DeleteInstance {
                instance: "search".into(),
            })
            .await,
        IpcResponse::Ok
    ));
    // Routing events may come first
    loop {
        if let IpcEvent::InstanceRemoved { instance_id } = watcher.next_event().await {
            assert_eq!(instance_id, created.id);
            break;
        }
    }

    daemon.shutdown.cancel();
}

#[tokio::test]
async fn test_ipc_shutdown_stops_server() {
    let daemon = start_daemon().await;
    let mut client = TestClient::connect(&daemon.socket).await;

    let response = client.send_request(IpcRequest::Shutdown).await;
    assert!(matches!(response, IpcResponse::Ok));
    assert!(daemon.shutdown.is_cancelled());

    timeout(Duration::from_secs(5), daemon.handle)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
    assert!(!daemon.socket.exists());
}

#[tokio::test]
async fn test_ipc_dns_status_and_restart() {
    let daemon = start_daemon_with(|config| {
        config.dns.bind = "127.0.0.1:0".parse().unwrap();
    })
    .await;
    let mut client = TestClient::connect(&daemon.socket).await;

    match client.send_request(IpcRequest::GetDnsStatus).await {
        IpcResponse::DnsStatus(status) => {
            assert!(!status.running);
            assert_eq!(status.listening, None);
            assert_eq!(status.tld, "test");
        }
        other => panic!("Expected DnsStatus, got {:?}", other),
    }

    let addr = match client.send_request(IpcRequest::RestartDns).await {
        IpcResponse::DnsStatus(status) => {
            assert!(status.running);
            status.listening.expect("restarted responder reports its address")
        }
        other => panic!("Expected DnsStatus, got {:?}", other),
    };
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);

    match client.send_request(IpcRequest::GetDnsStatus).await {
        IpcResponse::DnsStatus(status) => assert_eq!(status.listening, Some(addr)),
        other => panic!("Expected DnsStatus, got {:?}", other),
    }

    daemon.env.state.shutdown().await;
    assert!(!daemon.env.state.dns_status().await.running);
}
