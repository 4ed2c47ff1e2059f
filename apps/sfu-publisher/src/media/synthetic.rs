//! In-process media backend.
//!
//! Behaves like a browser media engine from the negotiator's point of view:
//! the device must be loaded with router capabilities before it hands out a
//! send transport, and the transport raises `Connect` before its first
//! `Produce`. No media flows.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use uuid::Uuid;

use super::{
    Acknowledge, CaptureConstraints, LocalMediaStream, MediaBackend, MediaCapture, MediaDevice,
    MediaError, MediaKind, MediaTrack, PreviewSink, Producer, SendTransport, TransportHandle,
    TransportRequest,
};
use crate::protocol::{DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions};

pub struct SyntheticBackend {
    capture: Arc<SyntheticCapture>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::with_capture(SyntheticCapture::new())
    }

    pub fn with_capture(capture: SyntheticCapture) -> Self {
        Self {
            capture: Arc::new(capture),
        }
    }

    pub fn capture_handle(&self) -> Arc<SyntheticCapture> {
        Arc::clone(&self.capture)
    }
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaBackend for SyntheticBackend {
    fn create_device(&self) -> Box<dyn MediaDevice> {
        Box::new(SyntheticDevice::default())
    }

    fn capture(&self) -> Arc<dyn MediaCapture> {
        self.capture.clone()
    }
}

#[derive(Debug, Default)]
pub struct SyntheticDevice {
    codecs: Option<Vec<Value>>,
}

#[async_trait]
impl MediaDevice for SyntheticDevice {
    fn is_loaded(&self) -> bool {
        self.codecs.is_some()
    }

    async fn load(&mut self, capabilities: &RtpCapabilities) -> Result<(), MediaError> {
        if self.codecs.is_some() {
            return Err(MediaError::Load("device already loaded".into()));
        }
        let codecs = capabilities
            .0
            .get("codecs")
            .and_then(Value::as_array)
            .ok_or_else(|| MediaError::Load("router capabilities carry no codecs".into()))?;
        tracing::debug!(
            target = "media",
            codecs = codecs.len(),
            "synthetic device loaded"
        );
        self.codecs = Some(codecs.clone());
        Ok(())
    }

    fn create_send_transport(
        &mut self,
        options: &TransportOptions,
    ) -> Result<TransportHandle, MediaError> {
        let codecs = self.codecs.as_ref().ok_or(MediaError::NotLoaded)?;
        let id = options
            .0
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MediaError::Transport("transport options carry no id".into()))?;
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let transport = Arc::new(SyntheticTransport {
            id: id.to_owned(),
            codecs: codecs.clone(),
            requests: requests_tx,
            connected: AsyncMutex::new(false),
            closed: AtomicBool::new(false),
            next_mid: AtomicU32::new(0),
        });
        tracing::debug!(target = "media", transport_id = %id, "synthetic send transport created");
        Ok(TransportHandle {
            transport,
            requests,
        })
    }
}

pub struct SyntheticTransport {
    id: String,
    codecs: Vec<Value>,
    requests: mpsc::UnboundedSender<TransportRequest>,
    // Held across the connect round trip so concurrent produces connect once.
    connected: AsyncMutex<bool>,
    closed: AtomicBool,
    next_mid: AtomicU32,
}

impl SyntheticTransport {
    async fn ensure_connected(&self) -> Result<(), MediaError> {
        let mut connected = self.connected.lock().await;
        if *connected {
            return Ok(());
        }
        let (ack, response) = Acknowledge::channel();
        self.raise(TransportRequest::Connect {
            dtls_parameters: local_dtls_parameters(),
            ack,
        })?;
        response.await.map_err(|_| MediaError::AckDropped)??;
        *connected = true;
        Ok(())
    }

    fn raise(&self, request: TransportRequest) -> Result<(), MediaError> {
        self.requests
            .send(request)
            .map_err(|_| MediaError::TransportClosed)
    }

    fn codecs_for(&self, kind: MediaKind) -> Vec<Value> {
        self.codecs
            .iter()
            .filter(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SendTransport for SyntheticTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn produce(&self, track: MediaTrack) -> Result<Producer, MediaError> {
        if self.is_closed() {
            return Err(MediaError::TransportClosed);
        }
        self.ensure_connected().await?;

        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        let rtp_parameters = RtpParameters(json!({
            "mid": mid.to_string(),
            "codecs": self.codecs_for(track.kind),
            "encodings": [{ "ssrc": Uuid::new_v4().as_u128() as u32 }],
            "rtcp": { "cname": track.id },
        }));
        let (ack, response) = Acknowledge::channel();
        self.raise(TransportRequest::Produce {
            kind: track.kind,
            rtp_parameters,
            ack,
        })?;
        let id = response.await.map_err(|_| MediaError::AckDropped)??;
        Ok(Producer {
            id,
            kind: track.kind,
            track_id: track.id,
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!(target = "media", transport_id = %self.id, "synthetic send transport closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn local_dtls_parameters() -> DtlsParameters {
    let mut digest = Vec::with_capacity(32);
    digest.extend_from_slice(Uuid::new_v4().as_bytes());
    digest.extend_from_slice(Uuid::new_v4().as_bytes());
    let fingerprint = digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":");
    DtlsParameters(json!({
        "role": "auto",
        "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }],
    }))
}

/// Capture source yielding one microphone and one camera track.
#[derive(Debug, Default)]
pub struct SyntheticCapture {
    failure: Option<String>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl SyntheticCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source that rejects every request, like a denied permission prompt.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn acquire(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<LocalMediaStream, MediaError> {
        if let Some(reason) = &self.failure {
            return Err(MediaError::Capture(reason.clone()));
        }
        if !constraints.audio && !constraints.video {
            return Err(MediaError::Capture(
                "at least one of audio or video must be requested".into(),
            ));
        }
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(MediaKind::Audio, "synthetic microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(MediaKind::Video, "synthetic camera"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMediaStream::new(tracks))
    }

    fn release(&self, stream: LocalMediaStream) {
        self.released.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            target = "media",
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "released synthetic stream"
        );
    }
}

/// Preview sink that only records and logs what it was given.
#[derive(Debug)]
pub struct TracingPreview {
    name: &'static str,
    attached: Mutex<Option<String>>,
    detaches: AtomicUsize,
}

impl TracingPreview {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            attached: Mutex::new(None),
            detaches: AtomicUsize::new(0),
        }
    }

    pub fn attached_stream(&self) -> Option<String> {
        self.attached.lock().clone()
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }
}

impl PreviewSink for TracingPreview {
    fn attach(&self, stream: &LocalMediaStream) {
        tracing::info!(
            target = "publisher",
            sink = self.name,
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "preview attached"
        );
        *self.attached.lock() = Some(stream.id().to_owned());
    }

    fn detach(&self) {
        self.attached.lock().take();
        self.detaches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target = "publisher", sink = self.name, "preview detached");
    }
}
