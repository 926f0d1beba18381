//! SEWS Server
//!
//! TCP accept loop tying the pieces together. Every accepted connection runs
//! in its own task, tracked so that shutdown can drain them.
//!
//! # Example
//!
//! ```rust,ignore
//! use sews::config::Config;
//! use sews::server::{run, AppState};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let source = config.metrics.source()?;
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!
//!     run(AppState::new(config), source, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

mod connection;
mod error;
mod state;

pub use connection::{handle_connection, ConnectionState};
pub use error::{ConnectionError, ServerError, ServerResult};
pub use state::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::metrics::{CollectorSource, MetricCollector};

/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Resolve once shutdown is requested or the signal's sender is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// A bound listener ready to serve
pub struct Server {
    listener: TcpListener,
    state: AppState,
}

impl Server {
    /// Bind the configured address
    pub async fn bind(state: AppState) -> ServerResult<Self> {
        let addr = state.config.server.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;

        tracing::info!(address = %addr, "SEWS listening");
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accept connections until shutdown, then drain them
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> ServerResult<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = self.state.clone();
                        let shutdown = shutdown.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state, shutdown).await {
                                tracing::debug!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
            }
        }

        tracing::info!(active = connections.len(), "Draining connections");
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }
        Ok(())
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Connection task panicked");
        }
    }
}

/// Bind, start the background tasks, and serve until shutdown
///
/// Returns after every task has been joined. A bind failure is returned
/// before anything is started.
pub async fn run(
    state: AppState,
    source: CollectorSource,
    shutdown: watch::Receiver<bool>,
) -> ServerResult<()> {
    let server = Server::bind(state.clone()).await?;

    let collector = Arc::new(MetricCollector::new(
        Arc::clone(&state.store),
        state.config.metrics.interval(),
    ));
    let collector_task = collector.start(source.into_source(), shutdown.clone());
    let dispatcher_task = Arc::clone(&state.dispatcher).start(shutdown.clone());
    let sweeper_task = Arc::clone(&state.tokens)
        .spawn_sweeper(state.config.tokens.sweep_interval(), shutdown.clone());

    let result = server.serve(shutdown).await;

    for (name, task) in [
        ("collector", collector_task),
        ("dispatcher", dispatcher_task),
        ("token sweeper", sweeper_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "Background task failed");
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::websocket::{frame, Frame, Opcode, ProtocolError};
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    const CLIENT_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Harness {
        addr: SocketAddr,
        state: AppState,
        shutdown: watch::Sender<bool>,
        server: JoinHandle<ServerResult<()>>,
        dispatcher: JoinHandle<()>,
    }

    impl Harness {
        async fn start(max_clients: usize, www_root: &Path) -> Self {
            let mut config = Config::default();
            config.server.host = "127.0.0.1".to_string();
            config.server.port = 0;
            config.server.max_clients = max_clients;
            config.server.www_root = www_root.to_path_buf();

            let state = AppState::new(config);
            let server = Server::bind(state.clone()).await.unwrap();
            let addr = server.local_addr().unwrap();
            let (shutdown, shutdown_rx) = watch::channel(false);

            let dispatcher = Arc::clone(&state.dispatcher).start(shutdown_rx.clone());
            let server = tokio::spawn(server.serve(shutdown_rx));

            Self {
                addr,
                state,
                shutdown,
                server,
                dispatcher,
            }
        }

        async fn stop(self) {
            self.shutdown.send(true).unwrap();
            tokio::time::timeout(TIMEOUT, self.server)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            tokio::time::timeout(TIMEOUT, self.dispatcher)
                .await
                .unwrap()
                .unwrap();
        }
    }

    /// Client side of a connection with a receive buffer
    struct TestClient {
        stream: TcpStream,
        pending: Vec<u8>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                pending: Vec::new(),
            }
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn handshake(&mut self) -> String {
            let request = format!(
                "GET /ws HTTP/1.1\r\n\
                 Host: localhost\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Key: {}\r\n\
                 Sec-WebSocket-Version: 13\r\n\r\n",
                CLIENT_KEY
            );
            self.send_raw(request.as_bytes()).await;
            self.read_head().await
        }

        /// Fill the buffer; false on EOF
        async fn fill(&mut self) -> bool {
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut chunk))
                .await
                .unwrap()
                .unwrap();
            self.pending.extend_from_slice(&chunk[..n]);
            n > 0
        }

        async fn read_head(&mut self) -> String {
            loop {
                if let Some(pos) = self.pending.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head: Vec<u8> = self.pending.drain(..pos + 4).collect();
                    return String::from_utf8(head).unwrap();
                }
                assert!(self.fill().await, "connection closed before response head");
            }
        }

        async fn read_to_end(&mut self) -> String {
            while self.fill().await {}
            String::from_utf8_lossy(&std::mem::take(&mut self.pending)).to_string()
        }

        async fn read_frame(&mut self) -> Frame {
            loop {
                match frame::decode(&self.pending) {
                    Ok((decoded, used)) => {
                        self.pending.drain(..used);
                        return decoded;
                    }
                    Err(ProtocolError::TruncatedFrame { .. }) => {
                        assert!(self.fill().await, "connection closed before frame");
                    }
                    Err(e) => panic!("bad frame from server: {}", e),
                }
            }
        }

        async fn expect_eof(&mut self) {
            assert!(self.pending.is_empty());
            assert!(!self.fill().await, "expected connection to close");
        }
    }

    async fn wait_for_clients(state: &AppState, expected: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while state.registry.len().await != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_websocket_session_end_to_end() {
        let www = tempfile::tempdir().unwrap();
        let harness = Harness::start(4, www.path()).await;
        harness.state.store.set("cpu", 1, Some("%")).await.unwrap();

        let mut client = TestClient::connect(harness.addr).await;
        let head = client.handshake().await;
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let initial = client.read_frame().await;
        assert_eq!(initial.opcode, Opcode::Text);
        assert!(!initial.masked);
        assert_eq!(initial.text(), r#"{"cpu":1}"#);
        assert_eq!(harness.state.registry.len().await, 1);

        harness.state.store.set("cpu", 42, None).await.unwrap();
        harness.state.store.set("memory", 123, None).await.unwrap();
        let latest = loop {
            let update = client.read_frame().await;
            let json: serde_json::Value = serde_json::from_slice(&update.payload).unwrap();
            if json.get("memory").is_some() {
                break json;
            }
        };
        assert_eq!(latest, serde_json::json!({"cpu": 42, "memory": 123}));

        client
            .send_raw(&frame::encode_masked(Opcode::Close, &[], MASK))
            .await;
        let mut reply = client.read_frame().await;
        while reply.opcode != Opcode::Close {
            reply = client.read_frame().await;
        }
        assert!(reply.payload.is_empty());
        client.expect_eof().await;

        wait_for_clients(&harness.state, 0).await;
        harness.stop().await;
    }

    async fn read_until_cpu(client: &mut TestClient, expected: i64) {
        loop {
            let update = client.read_frame().await;
            assert_eq!(update.opcode, Opcode::Text);
            let json: serde_json::Value = serde_json::from_slice(&update.payload).unwrap();
            if json["cpu"] == expected {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_survives_departed_client() {
        let www = tempfile::tempdir().unwrap();
        let harness = Harness::start(3, www.path()).await;
        harness.state.store.set("cpu", 1, None).await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            let mut client = TestClient::connect(harness.addr).await;
            assert!(client.handshake().await.contains(" 101 "));
            client.read_frame().await;
            clients.push(client);
        }
        wait_for_clients(&harness.state, 3).await;

        let mut third = clients.pop().unwrap();
        let second = clients.pop().unwrap();
        let mut first = clients.pop().unwrap();

        // The middle client goes away without a close frame
        drop(second);
        harness.state.store.set("cpu", 2, None).await.unwrap();
        read_until_cpu(&mut first, 2).await;
        read_until_cpu(&mut third, 2).await;

        wait_for_clients(&harness.state, 2).await;

        harness.state.store.set("cpu", 3, None).await.unwrap();
        let report = harness.state.dispatcher.broadcast_snapshot().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());
        read_until_cpu(&mut first, 3).await;
        read_until_cpu(&mut third, 3).await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_client_limit_answers_503() {
        let www = tempfile::tempdir().unwrap();
        let harness = Harness::start(1, www.path()).await;

        let mut first = TestClient::connect(harness.addr).await;
        assert!(first.handshake().await.contains(" 101 "));

        let mut second = TestClient::connect(harness.addr).await;
        let head = second.handshake().await;
        assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert_eq!(harness.state.registry.len().await, 1);

        let state = harness.state.clone();
        harness.stop().await;

        // Shutdown sends a close frame to the open client
        let mut last = first.read_frame().await;
        while last.opcode != Opcode::Close {
            last = first.read_frame().await;
        }
        first.expect_eof().await;
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_bad_handshake_answers_400() {
        let www = tempfile::tempdir().unwrap();
        let harness = Harness::start(1, www.path()).await;

        let mut client = TestClient::connect(harness.addr).await;
        client
            .send_raw(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await;
        let response = client.read_to_end().await;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(harness.state.registry.is_empty().await);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unmasked_client_frame_closes_connection() {
        let www = tempfile::tempdir().unwrap();
        let harness = Harness::start(1, www.path()).await;

        let mut client = TestClient::connect(harness.addr).await;
        client.handshake().await;
        client.read_frame().await;

        client.send_raw(&frame::encode(Opcode::Text, b"hello")).await;
        let mut reply = client.read_frame().await;
        while reply.opcode != Opcode::Close {
            reply = client.read_frame().await;
        }
        client.expect_eof().await;
        wait_for_clients(&harness.state, 0).await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_static_file_over_tcp() {
        let www = tempfile::tempdir().unwrap();
        std::fs::write(
            www.path().join("index.html"),
            r#"<html><head><meta name="metrics" content="cpu,memory"></head></html>"#,
        )
        .unwrap();
        let harness = Harness::start(1, www.path()).await;

        let mut client = TestClient::connect(harness.addr).await;
        client.send_raw(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let response = client.read_to_end().await;

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Set-Cookie: sews_token="));
        assert_eq!(harness.state.tokens.len().await, 1);
        // Plain HTTP does not occupy a client slot
        assert!(harness.state.registry.is_empty().await);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = taken.local_addr().unwrap().port();

        match Server::bind(AppState::new(config)).await {
            Err(ServerError::Bind { addr, .. }) => assert!(addr.starts_with("127.0.0.1:")),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bind should fail on a used port"),
        }
    }

    #[tokio::test]
    async fn test_run_collects_and_stops() {
        let www = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.www_root = www.path().to_path_buf();
        config.metrics.interval_ms = 10;

        let state = AppState::new(config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut changes = state.store.subscribe();
        let task = tokio::spawn(run(
            state.clone(),
            CollectorSource::Simulated {
                increment: 1,
                base: 100,
            },
            shutdown_rx,
        ));

        tokio::time::timeout(TIMEOUT, changes.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(state.store.get().await.value("cpu").is_some());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(TIMEOUT, task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
