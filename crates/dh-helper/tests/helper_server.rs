//! Helper server integration tests
//!
//! The server runs on a socket in a temp directory with fake operations, and
//! a raw framed client talks to it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use dh_core::config::HelperConfig;
use dh_helper::{HelperServer, PrivilegedOps, RequestError};
use dh_protocol::{
    CertInfo, Decoded, FailureReason, Frame, FrameCodec, HelperRequest, HelperResponse,
    Message, HELPER_VERSION, PROTOCOL_VERSION,
};

/// Records calls; the CA is "trusted" once trust_ca ran
#[derive(Default)]
struct FakeOps {
    calls: Mutex<Vec<String>>,
    trusted: Mutex<bool>,
}

impl FakeOps {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PrivilegedOps for FakeOps {
    async fn cert_info(&self, path: &Path) -> Result<CertInfo, RequestError> {
        self.record(format!("cert_info {}", path.display()));
        Ok(CertInfo {
            exists: true,
            name: Some("Caddy Local Authority".into()),
            expiry: Some("Jan  1 00:00:00 2035 GMT".into()),
        })
    }

    async fn is_trusted(&self, _path: &Path) -> Result<bool, RequestError> {
        Ok(*self.trusted.lock().unwrap())
    }

    async fn trust_ca(&self, path: &Path) -> Result<bool, RequestError> {
        self.record(format!("trust_ca {}", path.display()));
        let mut trusted = self.trusted.lock().unwrap();
        let changed = !*trusted;
        *trusted = true;
        Ok(changed)
    }

    async fn install_daemon(
        &self,
        label: &str,
        _program: &Path,
        _args: &[String],
    ) -> Result<bool, RequestError> {
        self.record(format!("install {}", label));
        Ok(true)
    }

    async fn uninstall_daemon(&self, label: &str) -> Result<bool, RequestError> {
        Err(RequestError::NotFound(label.to_string()))
    }

    async fn setup_directory(&self, path: &Path, owner_uid: u32) -> Result<bool, RequestError> {
        self.record(format!("setup {} {}", path.display(), owner_uid));
        Ok(true)
    }
}

struct TestHelper {
    _dir: TempDir,
    root: PathBuf,
    socket: PathBuf,
    ops: Arc<FakeOps>,
    server: Arc<HelperServer>,
    cancel: CancellationToken,
}

impl TestHelper {
    async fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("allowed");
        std::fs::create_dir_all(&root).unwrap();
        let socket = dir.path().join("helper.sock");

        let config = HelperConfig {
            socket_path: socket.clone(),
            allowed_roots: vec![root.clone()],
            ..HelperConfig::default()
        };
        let ops = Arc::new(FakeOps::default());
        let server = Arc::new(HelperServer::new(config, ops.clone()));
        let cancel = CancellationToken::new();

        let listener = server.bind().await.unwrap();
        tokio::spawn(Arc::clone(&server).serve(listener, cancel.clone()));

        Self {
            _dir: dir,
            root,
            socket,
            ops,
            server,
            cancel,
        }
    }

    async fn connect(&self) -> Framed<UnixStream, FrameCodec> {
        let stream = UnixStream::connect(&self.socket).await.unwrap();
        Framed::new(stream, FrameCodec::new())
    }
}

impl Drop for TestHelper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn round_trip(
    client: &mut Framed<UnixStream, FrameCodec>,
    request_id: u32,
    request: HelperRequest,
) -> HelperResponse {
    client.send(Frame::request(request_id, request)).await.unwrap();
    read_response(client, request_id).await
}

async fn read_response(
    client: &mut Framed<UnixStream, FrameCodec>,
    request_id: u32,
) -> HelperResponse {
    let decoded = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("helper did not answer")
        .expect("connection closed")
        .unwrap();
    match decoded {
        Decoded::Valid(Frame {
            request_id: id,
            message: Message::Response(response),
        }) => {
            assert_eq!(id, request_id);
            response
        }
        other => panic!("Expected a response frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ping_reports_version() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;

    match round_trip(&mut client, 1, HelperRequest::Ping).await {
        HelperResponse::Pong { version } => assert_eq!(version, HELPER_VERSION),
        other => panic!("Expected Pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_trust_is_idempotent() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;
    let ca = helper.root.join("root.crt");

    let first = round_trip(&mut client, 1, HelperRequest::TrustCa { path: ca.clone() }).await;
    assert_eq!(first, HelperResponse::Done { changed: true });

    let second = round_trip(&mut client, 2, HelperRequest::TrustCa { path: ca.clone() }).await;
    assert_eq!(second, HelperResponse::Done { changed: false });

    let trusted = round_trip(&mut client, 3, HelperRequest::IsCaddyCaTrusted { path: ca }).await;
    assert_eq!(trusted, HelperResponse::Trusted { trusted: true });
}

#[tokio::test]
async fn test_paths_outside_allowed_roots_are_refused() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;

    for (id, path) in [
        (1, PathBuf::from("/etc/ssl/private/key.pem")),
        (2, helper.root.join("..").join("escape.crt")),
        (3, PathBuf::from("relative.crt")),
    ] {
        match round_trip(&mut client, id, HelperRequest::GetCertInfo { path }).await {
            HelperResponse::Failure { reason, .. } => assert_eq!(reason, FailureReason::InvalidPath),
            other => panic!("Expected Failure, got {:?}", other),
        }
    }
    assert!(helper.ops.calls().is_empty());

    match round_trip(
        &mut client,
        4,
        HelperRequest::GetCertInfo {
            path: helper.root.join("root.crt"),
        },
    )
    .await
    {
        HelperResponse::CertInfo(info) => assert!(info.exists),
        other => panic!("Expected CertInfo, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_kind_keeps_connection_usable() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;

    // version, request id 7, kind 0x42, empty payload
    let mut raw = vec![PROTOCOL_VERSION];
    raw.extend_from_slice(&7u32.to_be_bytes());
    raw.extend_from_slice(&[0x42, 0, 0, 0]);
    client.get_mut().write_all(&raw).await.unwrap();

    match read_response(&mut client, 7).await {
        HelperResponse::Failure { reason, .. } => {
            assert_eq!(reason, FailureReason::UnsupportedRequest)
        }
        other => panic!("Expected Failure, got {:?}", other),
    }

    // Same connection still answers
    match round_trip(&mut client, 8, HelperRequest::Ping).await {
        HelperResponse::Pong { .. } => {}
        other => panic!("Expected Pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_responses_from_clients_are_refused() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;

    client
        .send(Frame::response(3, HelperResponse::Done { changed: true }))
        .await
        .unwrap();
    match read_response(&mut client, 3).await {
        HelperResponse::Failure { reason, .. } => {
            assert_eq!(reason, FailureReason::MalformedRequest)
        }
        other => panic!("Expected Failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_operation_errors_are_typed() {
    let helper = TestHelper::start().await;
    let mut client = helper.connect().await;

    let response = round_trip(
        &mut client,
        1,
        HelperRequest::UninstallDaemon {
            label: "dev.devhost.dns".into(),
        },
    )
    .await;
    match response {
        HelperResponse::Failure { reason, detail } => {
            assert_eq!(reason, FailureReason::NotFound);
            assert!(detail.contains("dev.devhost.dns"));
        }
        other => panic!("Expected Failure, got {:?}", other),
    }

    let response = round_trip(
        &mut client,
        2,
        HelperRequest::InstallDaemon {
            label: "../evil".into(),
            program: helper.root.join("devhost"),
            args: vec![],
        },
    )
    .await;
    match response {
        HelperResponse::Failure { reason, .. } => {
            assert_eq!(reason, FailureReason::MalformedRequest)
        }
        other => panic!("Expected Failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_directory_owner_must_be_the_caller() {
    let helper = TestHelper::start().await;
    let path = helper.root.join("run");

    let response = helper
        .server
        .dispatch(
            HelperRequest::SetupPrivilegedDirectory {
                path: path.clone(),
                owner_uid: 1001,
            },
            1000,
        )
        .await;
    match response {
        HelperResponse::Failure { reason, .. } => {
            assert_eq!(reason, FailureReason::PermissionDenied)
        }
        other => panic!("Expected Failure, got {:?}", other),
    }
    assert!(helper.ops.calls().is_empty());

    let response = helper
        .server
        .dispatch(
            HelperRequest::SetupPrivilegedDirectory {
                path: path.clone(),
                owner_uid: 1000,
            },
            1000,
        )
        .await;
    assert_eq!(response, HelperResponse::Done { changed: true });

    // Root may hand a directory to anyone
    let response = helper
        .server
        .dispatch(
            HelperRequest::SetupPrivilegedDirectory {
                path,
                owner_uid: 1001,
            },
            0,
        )
        .await;
    assert_eq!(response, HelperResponse::Done { changed: true });
    assert_eq!(helper.ops.calls().len(), 2);
}
