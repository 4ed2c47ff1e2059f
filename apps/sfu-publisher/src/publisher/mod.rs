//! Publisher session: opens signaling, captures local media and publishes
//! every captured track once the send transport exists.
//!
//! All negotiation runs on one driver task fed by a single event queue.
//! Inbound frames, transport requests, capture and production results, and
//! channel closure all arrive there, so the negotiator is never touched
//! concurrently. Production itself runs on a separate task and produces
//! tracks one after another in stream order.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::media::{
    CaptureConstraints, LocalMediaStream, MediaBackend, MediaCapture, MediaError, PreviewSinks,
    Producer, SendTransport, TransportHandle, TransportRequest,
};
use crate::negotiation::{NegotiationError, NegotiationState, Negotiator, Reaction};
use crate::signaling::{ConnectionState, SignalingChannel, SignalingError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already active; stop it first")]
    AlreadyActive,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("session driver failed: {0}")]
    Driver(String),
}

enum SessionEvent {
    Inbound(String),
    Transport(TransportRequest),
    Captured(Result<LocalMediaStream, MediaError>),
    Produced(Result<Producer, MediaError>),
    ChannelClosed,
}

// Everything stop() has to tear down without going through the driver.
#[derive(Default)]
struct Resources {
    transport: Option<Arc<dyn SendTransport>>,
    stream: Option<LocalMediaStream>,
    tasks: Vec<JoinHandle<()>>,
}

struct ActiveSession {
    channel: SignalingChannel,
    capture: Arc<dyn MediaCapture>,
    resources: Arc<Mutex<Resources>>,
    driver: Option<JoinHandle<Result<(), SessionError>>>,
}

pub struct PublisherSession {
    config: Config,
    backend: Arc<dyn MediaBackend>,
    previews: PreviewSinks,
    state: Arc<watch::Sender<NegotiationState>>,
    producers: Arc<Mutex<Vec<Producer>>>,
    active: Option<ActiveSession>,
}

impl PublisherSession {
    pub fn new(config: Config, backend: Arc<dyn MediaBackend>, previews: PreviewSinks) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            config,
            backend,
            previews,
            state: Arc::new(state),
            producers: Arc::new(Mutex::new(Vec::new())),
            active: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    /// Producers created so far, in production order.
    pub fn producers(&self) -> Vec<Producer> {
        self.producers.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Opens the signaling channel, requests router capabilities and starts
    /// capturing local media. Returns once the work is scheduled; progress is
    /// observable through [`PublisherSession::subscribe`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyActive);
        }
        let channel = SignalingChannel::connect(&self.config.signaling_url)?;
        let (events_tx, events) = mpsc::unbounded_channel();

        let inbound = events_tx.clone();
        channel.on_message(move |text| {
            let _ = inbound.send(SessionEvent::Inbound(text));
        });

        let mut negotiator = Negotiator::new(
            self.backend.create_device(),
            Arc::new(channel.clone()),
            self.config.ack_policy,
        )
        .with_state(Arc::clone(&self.state));
        negotiator.begin()?;
        self.producers.lock().clear();

        let resources = Arc::new(Mutex::new(Resources::default()));
        let capture = self.backend.capture();
        {
            let mut resources = resources.lock();
            resources.tasks.push(watch_channel(&channel, events_tx.clone()));
            resources.tasks.push(acquire_media(
                Arc::clone(&capture),
                self.config.capture,
                events_tx.clone(),
            ));
        }

        let driver = Driver {
            negotiator,
            channel: channel.clone(),
            events_tx,
            events,
            resources: Arc::clone(&resources),
            previews: self.previews.clone(),
            producers: Arc::clone(&self.producers),
            transport: None,
            stream: None,
            production_started: false,
        };
        tracing::info!(
            target = "publisher",
            url = %channel.endpoint(),
            ack_policy = ?driver.negotiator.ack_policy(),
            "publisher session starting"
        );
        self.active = Some(ActiveSession {
            channel,
            capture,
            resources,
            driver: Some(tokio::spawn(driver.run())),
        });
        Ok(())
    }

    /// Resolves when the session driver ends. `Ok` when nothing is running or
    /// the session was stopped.
    pub async fn closed(&mut self) -> Result<(), SessionError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let Some(driver) = active.driver.as_mut() else {
            return Ok(());
        };
        let result = match driver.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(SessionError::Driver(err.to_string())),
        };
        active.driver = None;
        result
    }

    /// Tears the session down without waiting for in-flight steps. Always
    /// detaches both preview sinks, whether or not a session was running.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            if let Some(driver) = active.driver {
                driver.abort();
            }
            let resources = std::mem::take(&mut *active.resources.lock());
            for task in resources.tasks {
                task.abort();
            }
            if let Some(transport) = resources.transport {
                transport.close();
            }
            active.channel.close();
            if let Some(stream) = resources.stream {
                active.capture.release(stream);
            }
            self.state.send_replace(NegotiationState::Closed);
            tracing::info!(target = "publisher", "publisher session stopped");
        }
        self.previews.local.detach();
        self.previews.remote.detach();
    }
}

impl Drop for PublisherSession {
    fn drop(&mut self) {
        if self.active.is_some() {
            self.stop();
        }
    }
}

// Forwards the channel's transition to Closed into the event queue.
fn watch_channel(
    channel: &SignalingChannel,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    let mut states = channel.state_changes();
    tokio::spawn(async move {
        if states
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .is_ok()
        {
            let _ = events.send(SessionEvent::ChannelClosed);
        }
    })
}

fn acquire_media(
    capture: Arc<dyn MediaCapture>,
    constraints: CaptureConstraints,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = capture.acquire(constraints).await;
        // Stopped before capture finished: hand the stream straight back.
        if let Err(SendError(SessionEvent::Captured(Ok(stream)))) =
            events.send(SessionEvent::Captured(result))
        {
            capture.release(stream);
        }
    })
}

struct Driver {
    negotiator: Negotiator,
    channel: SignalingChannel,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    resources: Arc<Mutex<Resources>>,
    previews: PreviewSinks,
    producers: Arc<Mutex<Vec<Producer>>>,
    transport: Option<Arc<dyn SendTransport>>,
    stream: Option<LocalMediaStream>,
    production_started: bool,
}

impl Driver {
    async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        if let Err(err) = &result {
            tracing::warn!(target = "publisher", "publisher session ended: {err}");
            self.negotiator.close();
            self.channel.close();
        }
        result
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::Inbound(text) => {
                    if let Reaction::TransportReady(handle) =
                        self.negotiator.handle_message(&text).await?
                    {
                        self.on_transport_ready(handle);
                    }
                }
                SessionEvent::Transport(request) => {
                    self.negotiator.handle_transport_request(request)?;
                }
                SessionEvent::Captured(result) => self.on_captured(result?),
                SessionEvent::Produced(result) => self.on_produced(result?),
                SessionEvent::ChannelClosed => return Err(SessionError::ChannelClosed),
            }
        }
        Ok(())
    }

    fn on_transport_ready(&mut self, handle: TransportHandle) {
        let TransportHandle {
            transport,
            mut requests,
        } = handle;
        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                if events.send(SessionEvent::Transport(request)).is_err() {
                    break;
                }
            }
        });
        {
            let mut resources = self.resources.lock();
            resources.transport = Some(Arc::clone(&transport));
            resources.tasks.push(forwarder);
        }
        self.transport = Some(transport);
        self.start_production();
    }

    fn on_captured(&mut self, stream: LocalMediaStream) {
        tracing::info!(
            target = "publisher",
            stream = %stream.id(),
            tracks = stream.tracks().len(),
            "local media acquired"
        );
        self.previews.local.attach(&stream);
        self.resources.lock().stream = Some(stream.clone());
        self.stream = Some(stream);
        self.start_production();
    }

    fn on_produced(&mut self, producer: Producer) {
        tracing::info!(
            target = "publisher",
            kind = %producer.kind,
            producer = %producer.id,
            "track published"
        );
        self.producers.lock().push(producer);
    }

    // Needs both the transport and the captured stream; whichever arrives
    // second kicks production off.
    fn start_production(&mut self) {
        if self.production_started {
            return;
        }
        let (Some(transport), Some(stream)) = (self.transport.as_ref(), self.stream.as_ref())
        else {
            return;
        };
        self.production_started = true;
        let transport = Arc::clone(transport);
        let tracks = stream.tracks().to_vec();
        let events = self.events_tx.clone();
        let production = tokio::spawn(async move {
            for track in tracks {
                tracing::debug!(
                    target = "publisher",
                    kind = %track.kind,
                    track = %track.id,
                    label = %track.label,
                    "producing track"
                );
                let result = transport.produce(track).await;
                let failed = result.is_err();
                if events.send(SessionEvent::Produced(result)).is_err() || failed {
                    break;
                }
            }
        });
        self.resources.lock().tasks.push(production);
    }
}
