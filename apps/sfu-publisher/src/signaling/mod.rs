//! WebSocket signaling channel.
//!
//! The channel knows nothing about the protocol spoken over it. Text handed
//! to [`SignalingChannel::send`] before the socket is open is queued and
//! flushed, in order, the moment the connection opens. Inbound text frames
//! are handed to a single registered handler in arrival order.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("signaling channel closed")]
    Closed,
}

/// Outbound half of a signaling connection, as seen by the negotiator.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: String) -> Result<(), SignalingError>;
}

type MessageHandler = Box<dyn Fn(String) + Send + Sync>;

enum Outbound {
    Text(String),
    Close,
}

#[derive(Default)]
struct Shared {
    queue: VecDeque<String>,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    handler: Option<MessageHandler>,
    // Frames that arrived before a handler was registered.
    backlog: VecDeque<String>,
}

struct Inner {
    endpoint: Url,
    // Only written while `shared` is locked.
    state: watch::Sender<ConnectionState>,
    shared: Mutex<Shared>,
    connection_task: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Publishes the writer and flushes the queue. Returns false when the
    /// channel was closed while the socket was still connecting.
    fn open(&self, writer: mpsc::UnboundedSender<Outbound>) -> bool {
        let mut shared = self.shared.lock();
        if self.current() == ConnectionState::Closed {
            let _ = writer.send(Outbound::Close);
            return false;
        }
        let drained = shared.queue.len();
        while let Some(message) = shared.queue.pop_front() {
            let _ = writer.send(Outbound::Text(message));
        }
        shared.writer = Some(writer);
        self.state.send_replace(ConnectionState::Open);
        tracing::info!(
            target = "signaling",
            url = %self.endpoint,
            drained,
            "signaling websocket connected"
        );
        true
    }

    fn deliver(&self, text: String) {
        let mut shared = self.shared.lock();
        if let Some(handler) = shared.handler.as_ref() {
            handler(text);
        } else {
            shared.backlog.push_back(text);
        }
    }

    /// Moves to `Closed`, dropping anything still queued. Returns the state
    /// the channel was in and how many queued messages were discarded.
    fn mark_closed(&self) -> (ConnectionState, usize) {
        let mut shared = self.shared.lock();
        let previous = self.current();
        let discarded = shared.queue.len();
        shared.queue.clear();
        shared.backlog.clear();
        if let Some(writer) = shared.writer.take() {
            let _ = writer.send(Outbound::Close);
        }
        self.state.send_replace(ConnectionState::Closed);
        (previous, discarded)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.connection_task.get_mut().take() {
            task.abort();
        }
    }
}

#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    /// Starts connecting to `endpoint` in the background. The channel is
    /// `Connecting` on return; it becomes `Open` once the handshake completes
    /// or `Closed` if it fails. Failed connections are logged, never retried.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn connect(endpoint: &str) -> Result<Self, SignalingError> {
        let endpoint = parse_endpoint(endpoint)?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let inner = Arc::new(Inner {
            endpoint: endpoint.clone(),
            state,
            shared: Mutex::new(Shared::default()),
            connection_task: Mutex::new(None),
        });
        tracing::debug!(target = "signaling", url = %endpoint, "signaling websocket connecting");
        let task = tokio::spawn(run_connection(Arc::downgrade(&inner), endpoint));
        *inner.connection_task.lock() = Some(task);
        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> &Url {
        &self.inner.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of messages waiting for the connection to open.
    pub fn queued(&self) -> usize {
        self.inner.shared.lock().queue.len()
    }

    /// Transmits `message` if the connection is open, queues it while the
    /// connection is still being established, and rejects it once closed.
    pub fn send(&self, message: String) -> Result<(), SignalingError> {
        let mut shared = self.inner.shared.lock();
        match self.inner.current() {
            ConnectionState::Open => {
                let writer = shared.writer.as_ref().ok_or(SignalingError::Closed)?;
                writer
                    .send(Outbound::Text(message))
                    .map_err(|_| SignalingError::Closed)
            }
            ConnectionState::Connecting => {
                shared.queue.push_back(message);
                tracing::trace!(
                    target = "signaling",
                    queued = shared.queue.len(),
                    "queued outbound message until connected"
                );
                Ok(())
            }
            ConnectionState::Closed => {
                tracing::debug!(
                    target = "signaling",
                    "dropping outbound message on closed channel"
                );
                Err(SignalingError::Closed)
            }
        }
    }

    /// Registers the handler for inbound text frames, replacing any previous
    /// one. Frames received before registration are replayed to it first.
    ///
    /// The handler runs with the channel's internal lock held and must not
    /// call back into the channel.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let mut shared = self.inner.shared.lock();
        while let Some(text) = shared.backlog.pop_front() {
            handler(text);
        }
        shared.handler = Some(Box::new(handler));
    }

    /// Closes the connection. Queued messages are discarded, not flushed.
    /// Safe to call more than once.
    pub fn close(&self) {
        let (previous, discarded) = self.inner.mark_closed();
        if let Some(task) = self.inner.connection_task.lock().take() {
            task.abort();
        }
        if previous != ConnectionState::Closed {
            tracing::info!(
                target = "signaling",
                url = %self.inner.endpoint,
                discarded,
                "signaling channel closed"
            );
        }
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: String) -> Result<(), SignalingError> {
        SignalingChannel::send(self, message)
    }
}

async fn run_connection(inner: Weak<Inner>, endpoint: Url) {
    let ws_stream = match connect_async(endpoint.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            tracing::warn!(
                target = "signaling",
                url = %endpoint,
                "signaling websocket connect failed: {err}"
            );
            if let Some(inner) = inner.upgrade() {
                inner.mark_closed();
            }
            return;
        }
    };
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Outbound>();

    // The writer ends after sending a close frame or once every sender is gone.
    tokio::spawn(async move {
        while let Some(frame) = writer_rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    tracing::trace!(target = "signaling", event = "ws_out", len = text.len());
                    if let Err(err) = ws_write.send(Message::Text(text)).await {
                        tracing::warn!(target = "signaling", "signaling websocket write failed: {err}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    let _ = ws_write.close().await;
                    break;
                }
            }
        }
    });

    match inner.upgrade() {
        Some(inner) => {
            if !inner.open(writer_tx) {
                return;
            }
        }
        None => return,
    }

    while let Some(frame) = ws_read.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!(target = "signaling", "dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                match &err {
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                        tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                    }
                    _ => {
                        tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                    }
                }
                break;
            }
        };
        tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
        match inner.upgrade() {
            Some(inner) => inner.deliver(text),
            None => return,
        }
    }

    if let Some(inner) = inner.upgrade() {
        let (previous, _) = inner.mark_closed();
        if previous != ConnectionState::Closed {
            tracing::info!(target = "signaling", url = %endpoint, "signaling websocket disconnected");
        }
    }
}

/// Accepts `ws`/`wss` endpoints, mapping `http`/`https` onto them.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: String| SignalingError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let mut url = Url::parse(endpoint).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    Ok(url)
}
