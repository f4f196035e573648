#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use backoff::backoff::Backoff as _;
use futures::{SinkExt as _, Stream, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::config::{Config, LinearBackoff};
use super::envelope::{Envelope, OutboundEnvelope, WILDCARD};
use super::error::WsError;
use super::registry::{Disposer, HandlerRegistry, invoke_all};
use super::traits::{JsonEnvelopeParser, MessageParser};
use crate::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Envelopes buffered per [`ConnectionManager::stream`] before the oldest are dropped.
const STREAM_CAPACITY: usize = 1024;

type StatusHandler = Arc<dyn Fn(ConnectionStatus) + Send + Sync + 'static>;

/// Connection status as seen by consumers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Channel is being opened
    Connecting,
    /// Channel is open
    Connected,
    /// No channel; a reconnect may be pending
    Disconnected,
    /// The transport reported an error; a close normally follows
    Error,
}

impl ConnectionStatus {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Short label for a status indicator.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Error => "Connection Error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Owns one physical WebSocket channel and multiplexes it.
///
/// The manager handles all connection concerns for its consumers:
/// - Opening the channel on [`connect`](Self::connect) and closing it on
///   [`disconnect`](Self::disconnect)
/// - Automatic reconnection with a capped linear backoff
/// - Routing inbound envelopes to handlers by `type`, plus `"*"` handlers
///   that see every envelope
/// - Broadcasting status transitions to observers
///
/// Cloning is cheap; every clone drives the same channel. When the last clone
/// is dropped, the channel and any pending reconnect are torn down.
///
/// # Example
///
/// ```rust, no_run
/// use runboard_live::ws::ConnectionManager;
/// use runboard_live::ws::config::Config;
///
/// # async fn run() -> runboard_live::Result<()> {
/// let manager = ConnectionManager::new("ws://localhost:8000/ws", None, Config::default())?;
/// let _logs = manager.on_message("run_log", |body| println!("{body}"));
/// manager.connect();
/// manager.send("subscribe_run", &serde_json::json!({ "project_id": "p1", "run_id": "r1" }))?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`ConnectionManager`].
#[derive(Clone)]
pub(crate) struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    pub(crate) fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

struct Inner {
    /// Push endpoint without the credential
    endpoint: Url,
    credential: Option<SecretString>,
    config: Config,
    parser: Box<dyn MessageParser>,
    handlers: Arc<HandlerRegistry>,
    /// Watch channel for the current status (also serves async consumers)
    status_tx: watch::Sender<ConnectionStatus>,
    observers: Mutex<Vec<(u64, StatusHandler)>>,
    next_observer_id: AtomicU64,
    state: Mutex<ChannelState>,
}

/// Mutable connection bookkeeping. Never locked while callbacks run.
///
/// Every status transition is committed while this lock is held, so the
/// published status always matches the channel it describes.
struct ChannelState {
    channel: Option<Channel>,
    generation: u64,
    backoff: LinearBackoff,
    reconnect_timer: Option<ReconnectTimer>,
    next_timer_id: u64,
    /// Committed transitions not yet delivered to observers
    pending: VecDeque<Notice>,
    /// Set while one caller is draining `pending`
    notifying: bool,
}

/// One physical connection attempt and, once open, its writer queue.
struct Channel {
    generation: u64,
    open: bool,
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

struct ReconnectTimer {
    id: u64,
    task: JoinHandle<()>,
}

/// A status waiting for delivery, either to every observer or, for the
/// replay on registration, to one.
struct Notice {
    status: ConnectionStatus,
    only: Option<u64>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint`. The channel is not opened until
    /// [`connect`](Self::connect) is called.
    pub fn new(endpoint: &str, credential: Option<SecretString>, config: Config) -> Result<Self> {
        Self::with_parser(endpoint, credential, config, JsonEnvelopeParser)
    }

    /// Create a manager that decodes frames with a custom parser.
    pub fn with_parser<P: MessageParser>(
        endpoint: &str,
        credential: Option<SecretString>,
        config: Config,
        parser: P,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(WsError::InvalidEndpoint(endpoint.to_string()).into());
        }

        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let backoff = LinearBackoff::from(config.reconnect.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                credential,
                config,
                parser: Box::new(parser),
                handlers: Arc::new(HandlerRegistry::default()),
                status_tx,
                observers: Mutex::new(Vec::new()),
                next_observer_id: AtomicU64::new(0),
                state: Mutex::new(ChannelState {
                    channel: None,
                    generation: 0,
                    backoff,
                    reconnect_timer: None,
                    next_timer_id: 0,
                    pending: VecDeque::new(),
                    notifying: false,
                }),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether both handles drive the same channel.
    #[must_use]
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The push endpoint, without the credential.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    /// Open the channel.
    ///
    /// Does nothing if the channel is already open or being opened.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn connect(&self) {
        Inner::connect(&self.inner);
    }

    /// Close the channel and cancel any pending reconnect.
    ///
    /// The manager stays disconnected until [`connect`](Self::connect) is
    /// called again.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock_state();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.task.abort();
            }
            if let Some(channel) = state.channel.take() {
                channel.close();
            }
            self.inner.transition(&mut state, ConnectionStatus::Disconnected);
        }

        self.inner.notify_observers();
    }

    /// Serialize `{type, payload}` and write it to the channel.
    ///
    /// If the channel is not open the message is dropped with a warning and
    /// `Ok(())` is returned: delivery is never guaranteed, and subscriptions
    /// must be re-issued after a reconnect. An error is returned only when
    /// `payload` cannot be serialized.
    pub fn send<P: Serialize + ?Sized>(&self, msg_type: &str, payload: &P) -> Result<()> {
        let json = serde_json::to_string(&OutboundEnvelope { msg_type, payload })?;

        let state = self.inner.lock_state();
        match state.channel.as_ref() {
            Some(channel) if channel.open => {
                #[cfg(feature = "tracing")]
                tracing::trace!(msg_type, "Queueing WebSocket message");
                if channel.outbound.send(Message::Text(json.into())).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(msg_type, "WebSocket writer is gone, dropping message");
                }
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!(msg_type, "WebSocket not connected, cannot send message");
            }
        }

        Ok(())
    }

    /// Register `handler` for envelopes of `msg_type`.
    ///
    /// Type-specific handlers receive the envelope without its `type` field.
    /// Handlers registered under `"*"` receive every envelope in full.
    pub fn on_message<F>(&self, msg_type: &str, handler: F) -> Disposer
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.register(msg_type, handler)
    }

    /// Register a status observer. The current status is replayed to it
    /// before any later transition.
    pub fn on_status_change<F>(&self, handler: F) -> Disposer
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let handler: StatusHandler = Arc::new(handler);
        {
            // Queued behind any transition committed before it, so the
            // replay is never delivered after a newer status.
            let mut state = self.inner.lock_state();
            self.inner.lock_observers().push((id, handler));
            state.pending.push_back(Notice {
                status: *self.inner.status_tx.borrow(),
                only: Some(id),
            });
        }
        self.inner.notify_observers();

        let inner = Arc::downgrade(&self.inner);
        Disposer::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .lock_observers()
                    .retain(|(existing, _)| *existing != id);
            }
        })
    }

    /// Envelopes of `msg_type` as a stream. Dropping the stream deregisters it.
    ///
    /// Up to 1024 envelopes are buffered while the stream is not polled;
    /// beyond that the oldest are dropped with a warning.
    pub fn stream(&self, msg_type: &str) -> impl Stream<Item = Value> + Send + use<> {
        let (tx, mut rx) = broadcast::channel(STREAM_CAPACITY);
        let disposer = self.on_message(msg_type, move |body| {
            _ = tx.send(body.clone());
        });
        let msg_type = msg_type.to_owned();

        async_stream::stream! {
            let _disposer = disposer;
            loop {
                match rx.recv().await {
                    Ok(body) => {
                        yield body;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(msg_type = %msg_type, missed, "Stream lagged, dropped oldest envelopes");
                        #[cfg(not(feature = "tracing"))]
                        let _ = (&msg_type, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Number of handlers registered under `msg_type`.
    #[must_use]
    pub fn handler_count(&self, msg_type: &str) -> usize {
        self.inner.handlers.len(msg_type)
    }

    /// Get the current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Whether outbound messages would currently be written.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner
            .lock_state()
            .channel
            .as_ref()
            .is_some_and(|channel| channel.open)
    }

    /// Reconnects scheduled since the last successful open.
    ///
    /// Once this reaches the configured maximum and the status is
    /// [`ConnectionStatus::Disconnected`], no further attempt will be made.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock_state().backoff.attempts()
    }

    /// Whether a reconnect is scheduled.
    #[must_use]
    pub fn reconnect_pending(&self) -> bool {
        self.inner.lock_state().reconnect_timer.is_some()
    }

    /// Subscribe to status changes.
    ///
    /// Returns a receiver that notifies when the status changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.endpoint.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        // Every mutation of ChannelState is a single field write, so a
        // poisoned lock still holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<(u64, StatusHandler)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Channel URL with the credential attached as the `token` query parameter.
    fn channel_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(credential) = &self.credential {
            url.query_pairs_mut()
                .append_pair("token", credential.expose_secret());
        }
        url
    }

    fn connect(this: &Arc<Self>) {
        let opened = Self::open_channel(this, &mut this.lock_state());
        if opened {
            this.notify_observers();
        }
    }

    /// Start a channel task unless one already exists. Returns whether a
    /// `connecting` transition was committed.
    fn open_channel(this: &Arc<Self>, state: &mut ChannelState) -> bool {
        if state.channel.is_some() {
            return false;
        }

        state.generation += 1;
        let generation = state.generation;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %this.endpoint, generation, "Opening WebSocket channel");

        // The task reports back through the state lock, so it cannot observe
        // the channel before it is recorded here.
        let task = tokio::spawn(run_channel(
            Arc::downgrade(this),
            generation,
            this.channel_url(),
            outbound_rx,
        ));
        state.channel = Some(Channel {
            generation,
            open: false,
            outbound,
            task,
        });
        this.transition(state, ConnectionStatus::Connecting);
        true
    }

    /// Returns whether `generation` is still the live channel.
    fn on_open(&self, generation: u64) -> bool {
        {
            let mut state = self.lock_state();
            match state.channel.as_mut() {
                Some(channel) if channel.generation == generation => channel.open = true,
                _ => return false,
            }
            state.backoff.reset();
            if let Some(timer) = state.reconnect_timer.take() {
                timer.task.abort();
            }
            self.transition(&mut state, ConnectionStatus::Connected);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, generation, "WebSocket channel open");

        self.notify_observers();
        true
    }

    fn on_error(&self, generation: u64) {
        {
            let mut state = self.lock_state();
            if !state.is_current(generation) {
                return;
            }
            self.transition(&mut state, ConnectionStatus::Error);
        }
        self.notify_observers();
    }

    fn on_close(this: &Arc<Self>, generation: u64) {
        {
            let mut state = this.lock_state();
            // Deliberately closed or superseded; never reconnect for it.
            if !state.is_current(generation) {
                return;
            }
            state.channel = None;
            this.transition(&mut state, ConnectionStatus::Disconnected);
            Self::schedule_reconnect(this, &mut state);
        }
        this.notify_observers();
    }

    fn schedule_reconnect(this: &Arc<Self>, state: &mut ChannelState) {
        if state.reconnect_timer.is_some() {
            return;
        }

        let Some(delay) = state.backoff.next_backoff() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                endpoint = %this.endpoint,
                attempts = state.backoff.attempts(),
                "Reconnect attempts exhausted, staying disconnected"
            );
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            attempt = state.backoff.attempts(),
            ?delay,
            "Scheduling WebSocket reconnect"
        );

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let weak = Arc::downgrade(this);
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Self::reconnect_due(&inner, id);
            }
        });
        state.reconnect_timer = Some(ReconnectTimer { id, task });
    }

    /// Fire reconnect timer `id`, unless it was cancelled or replaced while
    /// it slept.
    fn reconnect_due(this: &Arc<Self>, id: u64) {
        let opened = {
            let mut state = this.lock_state();
            if state
                .reconnect_timer
                .as_ref()
                .is_none_or(|timer| timer.id != id)
            {
                return;
            }
            state.reconnect_timer = None;
            Self::open_channel(this, &mut state)
        };
        if opened {
            this.notify_observers();
        }
    }

    /// Publish `status` to the watch channel and queue it for observers.
    /// Callers hold the state lock and call
    /// [`notify_observers`](Self::notify_observers) once it is released.
    fn transition(&self, state: &mut ChannelState, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
        state.pending.push_back(Notice { status, only: None });
    }

    /// Deliver queued transitions in commit order.
    ///
    /// Only one caller drains at a time; everyone else returns immediately
    /// and leaves their transitions to it. Observers run with no lock held,
    /// and a transition an observer triggers is delivered by the same loop.
    fn notify_observers(&self) {
        {
            let mut state = self.lock_state();
            if state.notifying || state.pending.is_empty() {
                return;
            }
            state.notifying = true;
        }

        loop {
            let notice = {
                let mut state = self.lock_state();
                let notice = state.pending.pop_front();
                if notice.is_none() {
                    state.notifying = false;
                }
                notice
            };
            let Some(Notice { status, only }) = notice else {
                return;
            };

            let observers: Vec<StatusHandler> = self
                .lock_observers()
                .iter()
                .filter(|(id, _)| only.is_none_or(|only| only == *id))
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            for observer in observers {
                if catch_unwind(AssertUnwindSafe(|| observer(status))).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!(%status, "Status observer panicked");
                }
            }
        }
    }

    fn handle_frame(&self, bytes: &[u8]) {
        match self.parser.parse(bytes) {
            Ok(envelope) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(msg_type = %envelope.msg_type, "Dispatching WebSocket envelope");
                self.dispatch(envelope);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Failed to parse WebSocket message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let typed = self.handlers.snapshot(&envelope.msg_type);
        let wildcard = self.handlers.snapshot(WILDCARD);
        if typed.is_empty() && wildcard.is_empty() {
            return;
        }

        let full = if wildcard.is_empty() {
            None
        } else {
            Some(envelope.to_value())
        };
        let (msg_type, rest) = envelope.into_parts();

        invoke_all(&msg_type, &typed, &rest);
        if let Some(full) = full {
            invoke_all(WILDCARD, &wildcard, &full);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.reconnect_timer.take() {
            timer.task.abort();
        }
        if let Some(channel) = state.channel.take() {
            channel.close();
        }
    }
}

impl ChannelState {
    fn is_current(&self, generation: u64) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.generation == generation)
    }
}

impl Channel {
    fn close(self) {
        if self.open {
            // The writer flushes the close frame, then the task ends on its own.
            _ = self.outbound.send(Message::Close(None));
        } else {
            self.task.abort();
        }
    }
}

/// Drive one physical connection from handshake to close.
async fn run_channel(
    inner: Weak<Inner>,
    generation: u64,
    url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    let connected = connect_async(url.as_str()).await;

    let Some(this) = inner.upgrade() else {
        return;
    };

    match connected {
        Ok((ws_stream, _)) => {
            if !this.on_open(generation) {
                return;
            }
            let config = this.config.clone();
            drop(this);

            let result = handle_connection(ws_stream, &mut outbound_rx, &inner, &config).await;

            let Some(this) = inner.upgrade() else {
                return;
            };
            if let Err(e) = result {
                #[cfg(feature = "tracing")]
                tracing::warn!(endpoint = %this.endpoint, error = %e, "WebSocket channel failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                this.on_error(generation);
            }
            Inner::on_close(&this, generation);
        }
        Err(e) => {
            let error = crate::error::Error::from(e);
            #[cfg(feature = "tracing")]
            tracing::warn!(endpoint = %this.endpoint, error = %error, "Unable to connect");
            #[cfg(not(feature = "tracing"))]
            let _ = &error;
            this.on_error(generation);
            Inner::on_close(&this, generation);
        }
    }
}

/// Pump frames in both directions until either side closes.
async fn handle_connection(
    ws_stream: WsStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<Message>,
    inner: &Weak<Inner>,
    config: &Config,
) -> Result<()> {
    let (mut write, mut read) = ws_stream.split();

    // Channel to notify heartbeat loop when PONG is received
    let (pong_tx, pong_rx) = watch::channel(Instant::now());
    let (mut ping_rx, heartbeat_handle) = match config.heartbeat_interval {
        Some(every) => {
            let (ping_tx, ping_rx) = mpsc::unbounded_channel();
            let deadline = config.heartbeat_timeout;
            let handle = tokio::spawn(heartbeat_loop(ping_tx, every, deadline, pong_rx));
            (Some(ping_rx), Some(handle))
        }
        None => (None, None),
    };

    let result = loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");
                        let Some(this) = inner.upgrade() else {
                            break Ok(());
                        };
                        this.handle_frame(text.as_bytes());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let Some(this) = inner.upgrade() else {
                            break Ok(());
                        };
                        this.handle_frame(&bytes);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        _ = pong_tx.send(Instant::now());
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break Ok(());
                    }
                    Some(Ok(_)) => {
                        // PING replies are queued by tungstenite itself.
                    }
                    Some(Err(e)) => {
                        break Err(e.into());
                    }
                }
            }

            out = outbound_rx.recv() => {
                match out {
                    Some(Message::Close(frame)) => {
                        _ = write.send(Message::Close(frame)).await;
                        break Ok(());
                    }
                    Some(message) => {
                        if let Err(e) = write.send(message).await {
                            break Err(e.into());
                        }
                    }
                    // Every sender is gone: the manager was dropped.
                    None => {
                        _ = write.close().await;
                        break Ok(());
                    }
                }
            }

            ping = next_ping(&mut ping_rx) => {
                match ping {
                    Some(()) => {
                        if let Err(e) = write.send(Message::Ping(Vec::new().into())).await {
                            break Err(e.into());
                        }
                    }
                    None => break Err(WsError::Timeout.into()),
                }
            }
        }
    };

    if let Some(handle) = heartbeat_handle {
        handle.abort();
    }

    result
}

async fn next_ping(ping_rx: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match ping_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Heartbeat loop that requests PINGs and monitors PONG responses.
///
/// Returning drops `ping_tx`, which the connection loop reads as a dead channel.
async fn heartbeat_loop(
    ping_tx: mpsc::UnboundedSender<()>,
    every: std::time::Duration,
    deadline: std::time::Duration,
    mut pong_rx: watch::Receiver<Instant>,
) {
    let mut ping_interval = interval(every);
    // The first tick completes immediately; the channel was just opened.
    ping_interval.tick().await;

    loop {
        ping_interval.tick().await;

        // Mark current PONG state as seen before sending PING
        // This prevents changed() from returning immediately due to a stale PONG
        drop(pong_rx.borrow_and_update());

        let ping_sent = Instant::now();
        if ping_tx.send(()).is_err() {
            // Message loop has terminated
            return;
        }

        match timeout(deadline, pong_rx.changed()).await {
            Ok(Ok(())) => {
                let last_pong = *pong_rx.borrow_and_update();
                if last_pong < ping_sent {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("PONG received but older than last PING, connection may be stale");
                    return;
                }
            }
            Ok(Err(_)) => return,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Heartbeat timeout: no PONG received within {deadline:?}");
                return;
            }
        }
    }
}
