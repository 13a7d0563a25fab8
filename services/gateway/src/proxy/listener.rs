//! TCP listener and connection handling.
//!
//! Accepts connections, reads the opening handshake, routes on the
//! hostname it carries and relays the connection to the chosen backend.
//!
//! Each connection runs in its own task behind a panic boundary. A fault in
//! one connection is logged and contained; the acceptor keeps running.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn, Instrument};

use super::handshake::{extract_host, HandshakeConfig, HandshakeInspector, MIN_HANDSHAKE_LEN};
use super::relay::{relay, RelayConfig, RelayStats};
use super::router::ConfigStore;
use crate::error::{GatewayError, Result};

/// Back-off after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Initial read configuration.
    pub handshake: HandshakeConfig,
    /// Relay configuration.
    pub relay: RelayConfig,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            handshake: HandshakeConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections whose handling task has finished.
    pub connections_closed: AtomicU64,
    /// Failed accept calls.
    pub accept_errors: AtomicU64,
    /// Connections abandoned before routing (read error or short handshake).
    pub handshakes_rejected: AtomicU64,
    /// Connections routed by an exact hostname match.
    pub routes_matched: AtomicU64,
    /// Connections routed to the default backend.
    pub routes_defaulted: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Connection tasks that panicked.
    pub handler_faults: AtomicU64,
    /// Bytes proxied to backends, handshake included.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// Per-connection routing state, recorded for logging.
#[derive(Debug)]
struct Session {
    peer_addr: SocketAddr,
    requested_host: String,
    resolved_backend: String,
}

/// The gateway's TCP acceptor.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    config_store: Arc<ConfigStore>,
    inspector: HandshakeInspector,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, config_store: Arc<ConfigStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| GatewayError::Listen {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Listen {
            addr: config.bind_addr,
            source,
        })?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            inspector: HandshakeInspector::with_config(config.handshake.clone()),
            listener,
            config,
            config_store,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self: Arc<Self>) {
        info!(bind_addr = ?self.listener.local_addr().ok(), "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    tokio::spawn(
                        async move { listener.dispatch(stream, peer_addr).await }
                            .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    self.stats.accept_errors.fetch_add(1, Ordering::Relaxed);
                    let err = GatewayError::Accept(e);
                    error!(error = %err, reason = err.reason_code(), "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Run one connection behind a panic boundary.
    async fn dispatch(&self, stream: TcpStream, peer_addr: SocketAddr) {
        match contain_faults(self.handle_connection(stream, peer_addr)).await {
            Ok(()) => {}
            Err(err @ GatewayError::HandlerFault(_)) => {
                self.stats.handler_faults.fetch_add(1, Ordering::Relaxed);
                error!(
                    peer_addr = %peer_addr,
                    error = %err,
                    reason = err.reason_code(),
                    "Panic while handling connection"
                );
            }
            Err(err) => {
                debug!(
                    peer_addr = %peer_addr,
                    error = %err,
                    reason = err.reason_code(),
                    "Connection ended with error"
                );
            }
        }

        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Parse, route, dial, forward the handshake, then relay.
    ///
    /// Both sockets are owned by this future and are closed on every exit.
    async fn handle_connection(&self, mut client: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let mut initial = Vec::new();
        if let Err(e) = self.inspector.read_initial(&mut client, &mut initial).await {
            self.stats
                .handshakes_rejected
                .fetch_add(1, Ordering::Relaxed);
            return Err(GatewayError::HandshakeRead(e));
        }

        if initial.len() < MIN_HANDSHAKE_LEN {
            self.stats
                .handshakes_rejected
                .fetch_add(1, Ordering::Relaxed);
            debug!(
                bytes_read = initial.len(),
                "Handshake too short, closing without dialing"
            );
            return Ok(());
        }

        // One snapshot per connection.
        let table = self.config_store.current();
        let requested_host = extract_host(&initial);
        let matched = table.routes().contains_key(&requested_host);
        let session = Session {
            peer_addr,
            resolved_backend: table.resolve(&requested_host).to_string(),
            requested_host,
        };

        #[cfg(test)]
        if session.requested_host == tests::FAULT_HOST {
            panic!("fault injected for {}", session.requested_host);
        }

        if matched {
            self.stats.routes_matched.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.routes_defaulted.fetch_add(1, Ordering::Relaxed);
        }

        info!(
            client = %session.peer_addr,
            host = %session.requested_host,
            backend = %session.resolved_backend,
            matched = matched,
            "Routing connection"
        );

        let mut backend = match TcpStream::connect(session.resolved_backend.as_str()).await {
            Ok(stream) => {
                self.stats.backend_connected.fetch_add(1, Ordering::Relaxed);
                stream
            }
            Err(source) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(backend = %session.resolved_backend, error = %source, "Backend dial failed");
                return Err(GatewayError::Dial {
                    backend: session.resolved_backend,
                    source,
                });
            }
        };

        // The backend must see the same handshake we inspected.
        backend
            .write_all(&initial)
            .await
            .map_err(GatewayError::Relay)?;
        self.stats
            .bytes_to_backend
            .fetch_add(initial.len() as u64, Ordering::Relaxed);

        let RelayStats {
            bytes_to_backend,
            bytes_from_backend,
            closed_by,
        } = relay(client, backend, &self.config.relay).await;

        self.stats
            .bytes_to_backend
            .fetch_add(bytes_to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(bytes_from_backend, Ordering::Relaxed);

        debug!(
            host = %session.requested_host,
            bytes_to_backend = bytes_to_backend,
            bytes_from_backend = bytes_from_backend,
            closed_by = ?closed_by,
            "Connection closed"
        );

        Ok(())
    }
}

/// Convert a panic inside `fut` into [`GatewayError::HandlerFault`].
///
/// Everything owned by `fut` is dropped during unwinding.
async fn contain_faults<F, T>(fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(GatewayError::HandlerFault(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::RoutingTable;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    /// Hostname whose connections panic inside `handle_connection`.
    pub(super) const FAULT_HOST: &str = "fault.test";

    const WAIT: Duration = Duration::from_secs(5);

    async fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    fn handshake(host: &str) -> Vec<u8> {
        let mut buf = vec![0x10, 0x00, 0xfb, 0x05, host.len() as u8];
        buf.extend_from_slice(host.as_bytes());
        buf
    }

    async fn connect(addr: SocketAddr, host: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hs = handshake(host);
        stream.write_all(&hs).await.unwrap();
        let mut echoed = vec![0u8; hs.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, hs);
        stream
    }

    async fn roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_panicking_connection_leaves_others_running() {
        let backend = spawn_echo_backend().await;
        let mut routes = HashMap::new();
        routes.insert("play.example.com".to_string(), backend.to_string());
        routes.insert(FAULT_HOST.to_string(), backend.to_string());
        let store = Arc::new(ConfigStore::new(RoutingTable::new(0, routes, backend.to_string())));

        let listener = Arc::new(
            Listener::bind(ListenerConfig::new("127.0.0.1:0".parse().unwrap()), store)
                .await
                .unwrap(),
        );
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&listener).run());

        let mut established = tokio::time::timeout(WAIT, connect(addr, "play.example.com"))
            .await
            .unwrap();
        assert_eq!(roundtrip(&mut established, b"before").await, b"before");

        // The faulting connection is closed without a reply.
        let mut faulty = TcpStream::connect(addr).await.unwrap();
        faulty.write_all(&handshake(FAULT_HOST)).await.unwrap();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(WAIT, faulty.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        tokio::time::timeout(WAIT, async {
            while listener.stats().handler_faults.load(Ordering::Relaxed) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Existing connections and the acceptor are unaffected.
        let echoed = tokio::time::timeout(WAIT, roundtrip(&mut established, b"after"))
            .await
            .unwrap();
        assert_eq!(echoed, b"after");

        let mut fresh = tokio::time::timeout(WAIT, connect(addr, "play.example.com"))
            .await
            .unwrap();
        assert_eq!(roundtrip(&mut fresh, b"fresh").await, b"fresh");

        assert_eq!(listener.stats().handler_faults.load(Ordering::Relaxed), 1);
        assert_eq!(listener.stats().backend_connected.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_listener_config_defaults() {
        let config = ListenerConfig::new("0.0.0.0:25565".parse().unwrap());
        assert_eq!(config.handshake.max_bytes, 1024);
        assert!(config.handshake.timeout.is_none());
        assert!(config.relay.idle_timeout.is_none());
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");

        let boxed: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_contain_faults_converts_panic() {
        let result = contain_faults(async {
            if true {
                panic!("handler blew up");
            }
            Ok::<(), GatewayError>(())
        })
        .await;

        match result {
            Err(GatewayError::HandlerFault(msg)) => assert_eq!(msg, "handler blew up"),
            other => panic!("Expected HandlerFault, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_contain_faults_passes_errors_through() {
        let result = contain_faults(async {
            Err::<(), _>(GatewayError::HandshakeRead(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "eof",
            )))
        })
        .await;

        assert!(matches!(result, Err(GatewayError::HandshakeRead(_))));
    }
}
