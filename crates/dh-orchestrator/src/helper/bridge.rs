//! Client side of the privileged helper protocol
//!
//! One connection, one request in flight. Callers beyond that wait in a
//! small bounded queue; once the queue is full new calls fail fast instead
//! of piling up. Every round trip is bounded by the configured timeout, and
//! a timed-out connection is dropped so a late reply can never be matched
//! to the next request.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::codec::Framed;

use dh_core::config::HelperConfig;
use dh_core::traits::PrivilegedHelper;
use dh_core::DevhostError;
use dh_protocol::{Decoded, Frame, FrameCodec, HelperRequest, HelperResponse, Message};

type Connection = Framed<UnixStream, FrameCodec>;

pub struct HelperBridge {
    socket_path: PathBuf,
    timeout: Duration,
    /// Permits for the request in flight plus the queue
    slots: Semaphore,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU32,
}

impl HelperBridge {
    pub fn new(config: &HelperConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            timeout: config.request_timeout,
            slots: Semaphore::new(config.queue_depth + 1),
            connection: Mutex::new(None),
            next_id: AtomicU32::new(1),
        }
    }

    async fn connect(&self) -> Result<Connection, DevhostError> {
        match UnixStream::connect(&self.socket_path).await {
            Ok(stream) => {
                tracing::debug!("Connected to helper at {}", self.socket_path.display());
                Ok(Framed::new(stream, FrameCodec::new()))
            }
            Err(e) => Err(unavailable(&self.socket_path, e)),
        }
    }

    async fn round_trip(
        &self,
        slot: &mut Option<Connection>,
        request: HelperRequest,
    ) -> Result<HelperResponse, DevhostError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(request_id, request);

        let reused = slot.is_some();
        let conn = match slot {
            Some(conn) => conn,
            None => slot.insert(self.connect().await?),
        };

        if let Err(e) = conn.send(frame.clone()).await {
            // A cached connection may have gone stale; reconnect once
            *slot = None;
            if !reused {
                return Err(DevhostError::HelperUnavailable(e.to_string()));
            }
            let conn = slot.insert(self.connect().await?);
            conn.send(frame).await.map_err(|e| {
                DevhostError::HelperUnavailable(format!("send failed after reconnect: {}", e))
            })?;
        }

        let result = self.read_response(slot, request_id).await;
        if result.is_err() {
            *slot = None;
        }
        result
    }

    async fn read_response(
        &self,
        slot: &mut Option<Connection>,
        request_id: u32,
    ) -> Result<HelperResponse, DevhostError> {
        let Some(conn) = slot.as_mut() else {
            return Err(DevhostError::HelperUnavailable("not connected".into()));
        };
        loop {
            match conn.next().await {
                Some(Ok(Decoded::Valid(frame))) if frame.request_id == request_id => {
                    return match frame.message {
                        Message::Response(response) => Ok(response),
                        Message::Request(_) => Err(DevhostError::HelperUnavailable(
                            "helper sent a request instead of a response".into(),
                        )),
                    };
                }
                Some(Ok(Decoded::Valid(frame))) => {
                    tracing::debug!("Discarding helper frame for stale request {}", frame.request_id);
                }
                Some(Ok(Decoded::Rejected(rejected))) => {
                    return Err(DevhostError::HelperFailed {
                        reason: rejected.reason,
                        detail: rejected.detail,
                    });
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(DevhostError::HelperUnavailable(
                        "helper closed the connection".into(),
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl PrivilegedHelper for HelperBridge {
    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, DevhostError> {
        let _permit = self.slots.try_acquire().map_err(|_| {
            DevhostError::HelperUnavailable("helper request queue is full".into())
        })?;

        let mut slot = self.connection.lock().await;
        let kind = request.kind();
        match tokio::time::timeout(self.timeout, self.round_trip(&mut slot, request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("Helper did not answer {:?} within {:?}", kind, self.timeout);
                *slot = None;
                Err(DevhostError::HelperTimeout(self.timeout))
            }
        }
    }
}

fn unavailable(path: &std::path::Path, err: io::Error) -> DevhostError {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => DevhostError::HelperUnavailable(
            format!("no helper listening at {} ({})", path.display(), err),
        ),
        _ => DevhostError::HelperUnavailable(format!("{}: {}", path.display(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    fn config(socket_path: PathBuf, timeout: Duration, queue_depth: usize) -> HelperConfig {
        HelperConfig {
            socket_path,
            request_timeout: timeout,
            queue_depth,
            ..HelperConfig::default()
        }
    }

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let bridge = HelperBridge::new(&config(
            dir.path().join("helper.sock"),
            Duration::from_secs(1),
            2,
        ));
        assert!(matches!(
            bridge.ping().await,
            Err(DevhostError::HelperUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_helper_times_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            // Accept and never answer
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let bridge = HelperBridge::new(&config(path, Duration::from_millis(200), 2));
        let started = std::time::Instant::now();
        assert!(matches!(
            bridge.ping().await,
            Err(DevhostError::HelperTimeout(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        // One in flight, no queue
        let bridge = std::sync::Arc::new(HelperBridge::new(&config(path, Duration::from_secs(2), 0)));
        let first = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.ping().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        match bridge.ping().await {
            Err(DevhostError::HelperUnavailable(message)) => assert!(message.contains("queue")),
            other => panic!("Expected HelperUnavailable, got {:?}", other),
        }
        first.abort();
    }
}
