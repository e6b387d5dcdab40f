//! Streaming connection to the audit server.
//!
//! One [`Connector`] owns at most one WebSocket connection. Lifecycle:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──handshake ok──▶ Connected
//!      ▲                        │                          │
//!      │◀──────error/cancel─────┘                          │ disconnect
//!      │◀────────────── involuntary close ─────────────────┤
//!      └──────────────────────── Closing ◀─────────────────┘
//! ```
//!
//! Frames and lifecycle changes are delivered in order on the event channel
//! returned by [`Connector::new`]. Reconnection is never automatic here; the
//! owner decides (see [`crate::feed`]).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TransportError;
use crate::events::{InboundFrame, OutboundMessage};

/// Default audit stream endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:8083/api/v1/audit/ws";

/// Default handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Closing => write!(f, "CLOSING"),
        }
    }
}

/// Something the connector observed.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Handshake completed.
    Connected,
    /// A text frame (binary frames are decoded lossily).
    Frame(InboundFrame),
    /// The connection failed or dropped without being asked to.
    Lost { reason: String },
    /// The connection was closed by [`Connector::disconnect`].
    Closed,
}

/// Result of a [`Connector::connect`] call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new connection is up.
    Started,
    /// A connection was already open, opening or closing; nothing was done.
    AlreadyActive,
}

/// Where the bearer token travels during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPlacement {
    /// `?token=<value>` on the URL.
    #[default]
    Query,
    /// `Authorization: Bearer <value>`.
    Header,
}

/// A stream endpoint plus the credential to present.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub url: String,
    pub token: Option<SecretString>,
    pub token_placement: TokenPlacement,
    pub connect_timeout: Duration,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_WS_URL)
    }
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            token_placement: TokenPlacement::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, placement: TokenPlacement) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self.token_placement = placement;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Build the handshake request, attaching the token if any.
    pub fn client_request(&self) -> Result<Request, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", self.url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{}', expected ws or wss",
                url.scheme()
            )));
        }

        let token = self
            .token
            .as_ref()
            .map(|t| t.expose_secret())
            .filter(|t| !t.is_empty());

        if let Some(token) = token
            && self.token_placement == TokenPlacement::Query
        {
            url.query_pairs_mut().append_pair("token", token);
        }

        let mut request = url.as_str().into_client_request()?;

        if let Some(token) = token
            && self.token_placement == TokenPlacement::Header
        {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                TransportError::InvalidEndpoint("token is not a valid header value".to_string())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        Ok(request)
    }
}

#[derive(Default)]
struct Inner {
    shutdown: Option<oneshot::Sender<()>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

struct Core {
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    inner: Mutex<Inner>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "Connection state changed");
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver going away just means nobody is listening anymore.
        let _ = self.events.send(event);
    }
}

/// What a `disconnect` call waits on once the lock is released.
enum Teardown {
    Session(JoinHandle<()>),
    Follow(watch::Receiver<ConnectionState>),
}

/// Single-connection WebSocket client.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Connector {
    core: Arc<Core>,
}

impl Connector {
    /// Create a disconnected connector and the receiver for its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let connector = Self {
            core: Arc::new(Core {
                state,
                events,
                inner: Mutex::new(Inner::default()),
            }),
        };
        (connector, rx)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.core.state.borrow()
    }

    /// Watch lifecycle changes (connectivity indicator).
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Open the connection unless one is already open or opening.
    ///
    /// A [`disconnect`](Self::disconnect) issued while the handshake is in
    /// flight cancels it and this call returns [`TransportError::Cancelled`].
    pub async fn connect(&self, endpoint: &Endpoint) -> Result<ConnectOutcome, TransportError> {
        let request = endpoint.client_request()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        {
            let mut inner = self.core.lock();
            if self.state() != ConnectionState::Disconnected {
                debug!(state = %self.state(), "Connect ignored, connection already active");
                return Ok(ConnectOutcome::AlreadyActive);
            }
            inner.shutdown = Some(shutdown_tx);
            self.core.set_state(ConnectionState::Connecting);
        }

        info!(url = %endpoint.url, "Connecting to audit stream");
        let timeout_ms = u64::try_from(endpoint.connect_timeout.as_millis()).unwrap_or(u64::MAX);
        let handshake = tokio::select! {
            _ = &mut shutdown_rx => Err(TransportError::Cancelled),
            res = tokio::time::timeout(endpoint.connect_timeout, connect_async(request)) => match res {
                Ok(Ok((stream, _response))) => Ok(stream),
                Ok(Err(e)) => Err(TransportError::Handshake(e)),
                Err(_) => Err(TransportError::Timeout(timeout_ms)),
            },
        };

        let mut inner = self.core.lock();

        // Disconnect took our shutdown sender: it already reset the state and
        // a newer attempt may own `inner` now. Touch nothing.
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            debug!("Connection attempt cancelled");
            return Err(TransportError::Cancelled);
        }

        let stream = match handshake {
            Ok(stream) => stream,
            Err(err) => {
                inner.shutdown = None;
                self.core.set_state(ConnectionState::Disconnected);
                warn!(url = %endpoint.url, error = %err, "Audit stream connection failed");
                self.core.emit(TransportEvent::Lost {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        inner.outbound = Some(outbound_tx);
        self.core.set_state(ConnectionState::Connected);
        // Before the session starts, so `Connected` precedes every frame.
        self.core.emit(TransportEvent::Connected);
        inner.task = Some(tokio::spawn(run_session(
            Arc::clone(&self.core),
            stream,
            outbound_rx,
            shutdown_rx,
        )));
        info!(url = %endpoint.url, "Audit stream connected");

        Ok(ConnectOutcome::Started)
    }

    /// Close the connection if one is open or opening. Always safe to call.
    ///
    /// Returns once the connection is fully torn down, including when another
    /// caller started the close.
    pub async fn disconnect(&self) {
        let teardown = {
            let mut inner = self.core.lock();
            match self.state() {
                ConnectionState::Disconnected => return,
                ConnectionState::Connecting => {
                    if let Some(tx) = inner.shutdown.take() {
                        let _ = tx.send(());
                    }
                    self.core.set_state(ConnectionState::Disconnected);
                    self.core.emit(TransportEvent::Closed);
                    return;
                }
                ConnectionState::Connected => {
                    self.core.set_state(ConnectionState::Closing);
                    if let Some(tx) = inner.shutdown.take() {
                        let _ = tx.send(());
                    }
                    match inner.task.take() {
                        Some(task) => Teardown::Session(task),
                        None => return,
                    }
                }
                // The first caller owns the session handle; follow the state.
                ConnectionState::Closing => Teardown::Follow(self.core.state.subscribe()),
            }
        };

        match teardown {
            Teardown::Session(task) => {
                if let Err(e) = task.await {
                    warn!(error = %e, "Session task ended abnormally");
                }
                // The session resets the state itself; this covers a panicked task.
                let _inner = self.core.lock();
                if self.state() == ConnectionState::Closing {
                    self.core.set_state(ConnectionState::Disconnected);
                }
            }
            Teardown::Follow(mut state) => {
                let _ = state
                    .wait_for(|s| *s != ConnectionState::Closing)
                    .await;
            }
        }
    }

    /// Queue `message` for sending. Returns `false` unless connected.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(state = %self.state(), "Send dropped, not connected");
            return false;
        }

        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message");
                return false;
            }
        };

        let inner = self.core.lock();
        match &inner.outbound {
            Some(tx) => tx.send(Message::text(payload)).is_ok(),
            None => false,
        }
    }
}

async fn run_session(
    core: Arc<Core>,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let (mut sink, mut source) = stream.split();

    let lost: Option<String> = loop {
        tokio::select! {
            _ = &mut shutdown => {
                // Flush what was queued before the close was requested.
                while let Ok(message) = outbound.try_recv() {
                    if let Err(e) = sink.send(message).await {
                        debug!(error = %e, "Queued frame not delivered");
                        break;
                    }
                }
                if let Err(e) = sink.send(Message::Close(None)).await {
                    debug!(error = %e, "Close frame not delivered");
                }
                break None;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = sink.send(message).await {
                    break Some(format!("send failed: {}", e));
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    core.emit(TransportEvent::Frame(InboundFrame::new(text.as_str())));
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    core.emit(TransportEvent::Frame(InboundFrame::new(text)));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(frame) if !frame.reason.is_empty() => {
                            format!("closed by server ({}): {}", frame.code, frame.reason.as_str())
                        }
                        Some(frame) => format!("closed by server ({})", frame.code),
                        None => "closed by server".to_string(),
                    };
                    break Some(reason);
                }
                // Ping/pong are answered by the protocol layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(e.to_string()),
                None => break Some("stream ended".to_string()),
            },
        }
    };

    let mut inner = core.lock();
    inner.outbound = None;
    inner.shutdown = None;
    inner.task = None;

    core.set_state(ConnectionState::Disconnected);
    match lost {
        None => {
            info!("Audit stream closed");
            core.emit(TransportEvent::Closed);
        }
        Some(reason) => {
            warn!(reason = %reason, "Audit stream connection lost");
            core.emit(TransportEvent::Lost { reason });
        }
    }
}
