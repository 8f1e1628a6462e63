//! Scripted loopback engine for socket-level tests.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing_subscriber::EnvFilter;

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// EngineConn
// ============================================================================

/// Server side of one client connection.
pub(crate) struct EngineConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl EngineConn {
    /// Next request as `(kind, body)`, or `None` once the client hangs up.
    pub(crate) async fn recv(&mut self) -> Option<(String, Value)> {
        let line = self.lines.next_line().await.ok()??;
        let value: Value = serde_json::from_str(&line).ok()?;
        let (kind, body) = value.as_object()?.iter().next()?;
        Some((kind.clone(), body.clone()))
    }

    /// Writes raw text; include `\n` yourself.
    pub(crate) async fn send_raw(&mut self, text: &str) {
        let _ = self.writer.write_all(text.as_bytes()).await;
        let _ = self.writer.flush().await;
    }

    /// Writes one line.
    pub(crate) async fn send_line(&mut self, line: &str) {
        self.send_raw(&format!("{line}\n")).await;
    }
}

/// Extracts `request_id` from a request body.
pub(crate) fn request_id(body: &Value) -> u64 {
    body.get("request_id").and_then(Value::as_u64).unwrap_or(0)
}

// ============================================================================
// ScriptedEngine
// ============================================================================

/// Handle to a running scripted engine.
pub(crate) struct ScriptedEngine {
    pub(crate) addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Port the engine listens on.
    pub(crate) fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Binds a loopback listener and runs `handler` for every accepted
/// connection, passing the zero-based connection index.
pub(crate) async fn spawn_engine<F, Fut>(handler: F) -> ScriptedEngine
where
    F: Fn(EngineConn, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .expect("bind scripted engine");
    let addr = listener.local_addr().expect("local addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let (read_half, write_half) = stream.into_split();
            let conn = EngineConn {
                lines: BufReader::new(read_half).lines(),
                writer: write_half,
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move { handler(conn, index).await });
        }
    });

    ScriptedEngine { addr, connections }
}

/// Returns a loopback port with nothing listening on it.
pub(crate) async fn closed_port() -> u16 {
    let listener = TcpListener::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);
    port
}
