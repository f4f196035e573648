#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use runboard_live::ws::config::Config;
use runboard_live::ws::{ConnectionManager, ConnectionStatus, Disposer};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{accept_async, accept_hdr_async};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const WAIT: Duration = Duration::from_secs(3);

/// Mock push server.
///
/// Every accepted connection is subscribed to the broadcast channel before
/// its handshake finishes, so a message sent right after the client reports
/// `connected` is never lost.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast messages to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Close every open connection from the server side
    kick_tx: broadcast::Sender<()>,
    /// Text frames written by clients, in arrival order
    frames_rx: mpsc::UnboundedReceiver<String>,
    connections: Arc<AtomicUsize>,
    request_uris: Arc<Mutex<Vec<String>>>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (kick_tx, _) = broadcast::channel::<()>(8);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<String>();
        let connections = Arc::new(AtomicUsize::new(0));
        let request_uris = Arc::new(Mutex::new(Vec::new()));

        let broadcast_tx = message_tx.clone();
        let kick = kick_tx.clone();
        let accepted = Arc::clone(&connections);
        let uris = Arc::clone(&request_uris);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let mut msg_rx = broadcast_tx.subscribe();
                let mut kick_rx = kick.subscribe();
                let uris = Arc::clone(&uris);
                let record_uri =
                    move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        uris.lock().unwrap().push(request.uri().to_string());
                        Ok(response)
                    };

                let Ok(ws_stream) = accept_hdr_async(stream, record_uri).await else {
                    continue;
                };
                accepted.fetch_add(1, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let frames_tx = frames_tx.clone();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(frames_tx.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                                    Some(Ok(_)) => {}
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            _ = kick_rx.recv() => {
                                drop(write.send(Message::Close(None)).await);
                                break;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            kick_tx,
            frames_rx,
            connections,
            request_uris,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Send a message to all connected clients.
    pub fn send(&self, message: &str) {
        drop(self.message_tx.send(message.to_owned()));
    }

    /// Close every open connection with a close frame.
    pub fn kick_all(&self) {
        drop(self.kick_tx.send(()));
    }

    /// Number of completed handshakes so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Request URIs of every handshake, including the query string.
    pub fn request_uris(&self) -> Vec<String> {
        self.request_uris.lock().unwrap().clone()
    }

    /// Receive the next client frame as JSON.
    pub async fn recv_frame(&mut self) -> Option<Value> {
        let text = timeout(WAIT, self.frames_rx.recv()).await.ok().flatten()?;
        Some(serde_json::from_str(&text).unwrap())
    }

    /// Assert that the client writes nothing for `wait`.
    pub async fn expect_no_frame(&mut self, wait: Duration) {
        if let Ok(Some(frame)) = timeout(wait, self.frames_rx.recv()).await {
            panic!("unexpected client frame: {frame}");
        }
    }
}

/// Push server that completes every handshake and then never reads again,
/// so protocol PINGs go unanswered.
pub struct SilentWsServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl SilentWsServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::clone(&connections);

        tokio::spawn(async move {
            // Keep every socket alive without polling it.
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws_stream) = accept_async(stream).await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    held.push(ws_stream);
                }
            }
        });

        Self { addr, connections }
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Records every status transition a manager reports, starting with the replay.
pub struct StatusRecorder {
    seen: Arc<Mutex<Vec<ConnectionStatus>>>,
    _observer: Disposer,
}

impl StatusRecorder {
    pub fn attach(manager: &ConnectionManager) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = manager.on_status_change(move |status| sink.lock().unwrap().push(status));
        Self {
            seen,
            _observer: observer,
        }
    }

    pub fn history(&self) -> Vec<ConnectionStatus> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count(&self, status: ConnectionStatus) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| **seen == status)
            .count()
    }
}

/// Reconnect quickly so tests finish in milliseconds.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.reconnect.interval = Duration::from_millis(50);
    config
}

/// Poll `condition` until it holds or [`WAIT`] elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

/// Wait until the manager reports `status`.
pub async fn wait_for_status(manager: &ConnectionManager, status: ConnectionStatus) {
    let mut rx = manager.state_receiver();
    let reached = timeout(WAIT, async { rx.wait_for(|current| *current == status).await.is_ok() })
        .await
        .unwrap_or(false);
    assert!(reached, "manager never reached {status:?}, now {:?}", manager.status());
}

/// Record every event emitted on this thread as plain text until the guard drops.
///
/// `#[tokio::test]` runs spawned tasks on the test thread, so connection
/// tasks log into the same buffer.
#[cfg(feature = "tracing")]
pub fn capture_logs() -> (Arc<Mutex<String>>, tracing::subscriber::DefaultGuard) {
    use tracing_subscriber::layer::SubscriberExt as _;

    struct CaptureWriter(Arc<Mutex<String>>);

    impl std::io::Write for CaptureWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap()
                .push_str(&String::from_utf8_lossy(buf));
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let output = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&output);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(move || CaptureWriter(Arc::clone(&sink)))
        .with_ansi(false);
    let guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));
    (output, guard)
}
