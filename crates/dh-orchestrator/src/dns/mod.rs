//! DNS responder for the local tld
//!
//! Binds UDP and TCP on the configured address. A bind conflict surfaces as
//! `PortInUse`; restart retries the bind briefly while the old sockets close.

mod handler;

pub use handler::{build_resolver, local_records, LocalTldHandler};

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_server::ServerFuture;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dh_core::config::DnsConfig;
use dh_core::ipc::IpcEvent;
use dh_core::report::DnsStatus;
use dh_core::{DevhostError, Result};

use crate::events::EventBus;

/// Timeout for idle TCP connections
const TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on waiting for the server task after cancellation
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

const RESTART_ATTEMPTS: usize = 20;
const RESTART_BACKOFF: Duration = Duration::from_millis(100);

struct RunningServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DnsResponder {
    config: DnsConfig,
    tld: String,
    events: EventBus,
    running: Mutex<Option<RunningServer>>,
}

impl DnsResponder {
    pub fn new(config: DnsConfig, tld: impl Into<String>, events: EventBus) -> Self {
        Self {
            config,
            tld: tld.into().trim_matches('.').to_string(),
            events,
            running: Mutex::new(None),
        }
    }

    /// Bind and serve; a no-op when already running
    pub async fn start(&self) -> Result<DnsStatus> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref().filter(|s| !s.task.is_finished()) {
            return Ok(self.status_for(Some(server.addr)));
        }

        let server = self.spawn_server().await?;
        tracing::info!("DNS responder for .{} listening on {}", self.tld, server.addr);
        let status = self.status_for(Some(server.addr));
        *running = Some(server);
        drop(running);

        self.events.emit(IpcEvent::DnsStatusChanged(status.clone()));
        Ok(status)
    }

    /// Stop serving and release the sockets
    pub async fn stop(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };
        server.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, server.task).await.is_err() {
            tracing::warn!("DNS server task did not stop within {:?}", STOP_TIMEOUT);
        }
        tracing::info!("DNS responder on {} stopped", server.addr);
        self.events.emit(IpcEvent::DnsStatusChanged(self.status_for(None)));
    }

    /// Stop, then start again, retrying while the old sockets are released
    pub async fn restart(&self) -> Result<DnsStatus> {
        self.stop().await;

        let mut attempt = 1;
        loop {
            match self.start().await {
                Err(DevhostError::PortInUse(addr)) if attempt < RESTART_ATTEMPTS => {
                    tracing::debug!("{} still in use (attempt {}), retrying", addr, attempt);
                    attempt += 1;
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    pub async fn status(&self) -> DnsStatus {
        let running = self.running.lock().await;
        let addr = running
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.addr);
        self.status_for(addr)
    }

    fn status_for(&self, listening: Option<SocketAddr>) -> DnsStatus {
        DnsStatus {
            running: listening.is_some(),
            listening,
            tld: self.tld.clone(),
        }
    }

    async fn spawn_server(&self) -> Result<RunningServer> {
        let udp = UdpSocket::bind(self.config.bind)
            .await
            .map_err(|e| bind_error(self.config.bind, e))?;
        // Port 0 picks a port for UDP; TCP follows it
        let addr = udp.local_addr()?;
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| bind_error(addr, e))?;

        let handler = LocalTldHandler::new(
            self.tld.clone(),
            self.config.ttl,
            build_resolver(self.config.upstream),
        );
        let mut server = ServerFuture::new(handler);
        server.register_socket(udp);
        server.register_listener(tcp, TCP_TIMEOUT);

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = server.block_until_done() => {
                    if let Err(e) = result {
                        tracing::error!("DNS server failed: {}", e);
                    }
                }
                _ = token.cancelled() => {}
            }
            // Dropping the server closes its sockets
            drop(server);
        });

        Ok(RunningServer { addr, cancel, task })
    }
}

fn bind_error(addr: SocketAddr, err: io::Error) -> DevhostError {
    if err.kind() == io::ErrorKind::AddrInUse {
        DevhostError::PortInUse(addr)
    } else {
        DevhostError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_server::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_server::proto::rr::{Name, RData, RecordType};
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn responder(bind: SocketAddr) -> DnsResponder {
        let config = DnsConfig {
            enabled: true,
            bind,
            ttl: 5,
            upstream: None,
        };
        DnsResponder::new(config, "test", EventBus::new())
    }

    async fn query(addr: SocketAddr, name: &str, record_type: RecordType) -> Message {
        let mut message = Message::new();
        message
            .set_id(7)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        message.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&message.to_vec().unwrap(), addr).await.unwrap();
        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Message::from_vec(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_answers_loopback_under_tld() {
        let dns = responder("127.0.0.1:0".parse().unwrap());
        let status = dns.start().await.unwrap();
        let addr = status.listening.unwrap();

        let response = query(addr, "api.test.", RecordType::A).await;
        assert_eq!(response.id(), 7);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        match response.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::LOCALHOST),
            other => panic!("Expected A record, got {:?}", other),
        }

        let response = query(addr, "deep.admin.api.test.", RecordType::AAAA).await;
        match response.answers()[0].data() {
            Some(RData::AAAA(aaaa)) => assert_eq!(aaaa.0, Ipv6Addr::LOCALHOST),
            other => panic!("Expected AAAA record, got {:?}", other),
        }

        let response = query(addr, "api.test.", RecordType::MX).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.answers().is_empty());

        dns.stop().await;
        assert!(!dns.status().await.running);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_port_in_use() {
        let first = responder("127.0.0.1:0".parse().unwrap());
        let addr = first.start().await.unwrap().listening.unwrap();

        let second = responder(addr);
        match second.start().await {
            Err(DevhostError::PortInUse(conflict)) => assert_eq!(conflict, addr),
            other => panic!("Expected PortInUse, got {:?}", other),
        }
        first.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_restart_rebinds() {
        let probe = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let dns = responder(addr);
        assert_eq!(dns.start().await.unwrap().listening, Some(addr));
        assert_eq!(dns.start().await.unwrap().listening, Some(addr));

        let status = dns.restart().await.unwrap();
        assert!(status.running);
        assert_eq!(status.listening, Some(addr));

        let response = query(addr, "shop.test.", RecordType::A).await;
        assert_eq!(response.answers().len(), 1);
        dns.stop().await;
    }
}
