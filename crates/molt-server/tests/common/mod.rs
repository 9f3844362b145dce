//! Shared helpers for molt-server integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use molt_ecdysis::{ListenerHandle, ProcessRole, ProcessSupervisor, ReloadProtocol};
use molt_server::{server, Reply, ServerConfig};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Initialize tracing for tests.
pub fn init_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    });
}

/// An in-process server generation on an ephemeral port.
pub struct TestServer {
    pub supervisor: Arc<ProcessSupervisor>,
    pub addr: SocketAddr,
    pub http: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    pub async fn start(drain_timeout: Duration) -> Self {
        Self::start_with(ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            drain_timeout_ms: drain_timeout.as_millis() as u64,
            banner: Some("test".to_string()),
            ..ServerConfig::default()
        })
        .await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let listener = ListenerHandle::bind(&config.bind_addr)
            .await
            .expect("Bind test listener");
        let addr = listener.local_addr();
        let supervisor = Arc::new(ProcessSupervisor::with_listener(
            ProcessRole::Primary,
            listener,
            config.drain_timeout(),
            ReloadProtocol::new("/bin/true", Vec::new()),
        ));
        let http = server::spawn_http_server(&supervisor, &config).expect("Start HTTP server");

        Self {
            supervisor,
            addr,
            http,
        }
    }

    pub fn ws_url(&self) -> String {
        ws_url(self.addr)
    }

    pub async fn connect(&self) -> WsStream {
        connect(self.addr).await.expect("Connect websocket")
    }

    /// Wait until the registry tracks `count` connections.
    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(DEFAULT_TIMEOUT, async {
            while self.supervisor.registry().size() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Registry did not reach the expected size");
    }
}

pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

pub async fn connect(addr: SocketAddr) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    connect_async(ws_url(addr)).await.map(|(ws, _)| ws)
}

/// Send a text frame and wait for the server's reply.
pub async fn exchange(ws: &mut WsStream, text: &str) -> Reply {
    ws.send(Message::text(text)).await.expect("Send frame");
    read_reply(ws).await
}

pub async fn read_reply(ws: &mut WsStream) -> Reply {
    let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("Timed out waiting for reply")
            .expect("Stream ended before reply")
            .expect("Websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("Reply is JSON");
        }
    }
}

/// Read until the server closes the connection. Returns `false` on timeout.
pub async fn wait_closed(ws: &mut WsStream, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .is_ok()
}
