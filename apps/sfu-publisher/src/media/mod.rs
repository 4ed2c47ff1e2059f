//! Seams to the media engine, the capture source and the preview sinks.
//!
//! None of these are implemented for real in this crate. The negotiator and
//! the publisher session only talk to the traits below; [`synthetic`]
//! provides an in-process backend for the binary and the tests.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::protocol::{DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions};

pub use crate::protocol::MediaKind;

pub mod synthetic;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("device load failed: {0}")]
    Load(String),
    #[error("device not loaded")]
    NotLoaded,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport closed")]
    TransportClosed,
    #[error("acknowledgement dropped before it was resolved")]
    AckDropped,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerId(String);

impl ProducerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Locally minted id used when the server's id is not awaited.
    pub fn synthesized() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }
}

/// Locally captured tracks, in the order the capture source reported them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track_id: String,
}

/// One-shot responder the media engine waits on before it continues.
pub struct Acknowledge<T> {
    tx: oneshot::Sender<Result<T, MediaError>>,
}

impl<T> Acknowledge<T> {
    pub fn channel() -> (Self, oneshot::Receiver<Result<T, MediaError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Returns false when the requester is no longer waiting.
    pub fn resolve(self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    pub fn reject(self, error: MediaError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }
}

impl<T> fmt::Debug for Acknowledge<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledge")
            .field("pending", &!self.tx.is_closed())
            .finish()
    }
}

/// Events a send transport raises while it sets itself up.
#[derive(Debug)]
pub enum TransportRequest {
    /// Raised once, before the first produce, with the local DTLS parameters.
    Connect {
        dtls_parameters: DtlsParameters,
        ack: Acknowledge<()>,
    },
    /// Raised per track; resolved with the producer id.
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        ack: Acknowledge<ProducerId>,
    },
}

impl TransportRequest {
    pub fn name(&self) -> &'static str {
        match self {
            TransportRequest::Connect { .. } => "connect",
            TransportRequest::Produce { .. } => "produce",
        }
    }
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Attaches a track, raising `Connect`/`Produce` requests as needed and
    /// completing once they are acknowledged.
    async fn produce(&self, track: MediaTrack) -> Result<Producer, MediaError>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A freshly created transport together with the stream of requests it raises.
pub struct TransportHandle {
    pub transport: Arc<dyn SendTransport>,
    pub requests: mpsc::UnboundedReceiver<TransportRequest>,
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("transport", &self.transport.id())
            .finish()
    }
}

#[async_trait]
pub trait MediaDevice: Send {
    fn is_loaded(&self) -> bool;

    async fn load(&mut self, capabilities: &RtpCapabilities) -> Result<(), MediaError>;

    /// Fails with [`MediaError::NotLoaded`] until [`MediaDevice::load`] succeeded.
    fn create_send_transport(
        &mut self,
        options: &TransportOptions,
    ) -> Result<TransportHandle, MediaError>;
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<LocalMediaStream, MediaError>;

    fn release(&self, stream: LocalMediaStream) {
        drop(stream);
    }
}

pub trait PreviewSink: Send + Sync {
    fn attach(&self, stream: &LocalMediaStream);
    fn detach(&self);
}

/// Factory for the per-session media collaborators.
pub trait MediaBackend: Send + Sync {
    fn create_device(&self) -> Box<dyn MediaDevice>;
    fn capture(&self) -> Arc<dyn MediaCapture>;
}

#[derive(Clone)]
pub struct PreviewSinks {
    pub local: Arc<dyn PreviewSink>,
    pub remote: Arc<dyn PreviewSink>,
}

impl PreviewSinks {
    pub fn new(local: Arc<dyn PreviewSink>, remote: Arc<dyn PreviewSink>) -> Self {
        Self { local, remote }
    }
}
