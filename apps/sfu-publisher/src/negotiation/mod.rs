//! Handshake state machine for a single producer session.
//!
//! Owns the media device and the send transport, reacts to inbound
//! signaling frames and to requests raised by the transport, and is the only
//! place outbound protocol messages are produced.

use clap::ValueEnum;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::media::{
    Acknowledge, MediaDevice, MediaError, ProducerId, SendTransport, TransportHandle,
    TransportRequest,
};
use crate::protocol::{ClientMessage, RtpCapabilities, ServerMessage, TransportOptions};
use crate::signaling::{SignalSink, SignalingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Idle,
    CapabilitiesRequested,
    DeviceLoaded,
    TransportRequested,
    TransportCreated,
    Connected,
    Producing,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::CapabilitiesRequested => "capabilities_requested",
            NegotiationState::DeviceLoaded => "device_loaded",
            NegotiationState::TransportRequested => "transport_requested",
            NegotiationState::TransportCreated => "transport_created",
            NegotiationState::Connected => "connected",
            NegotiationState::Producing => "producing",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How transport `connect`/`produce` requests are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AckPolicy {
    /// Resolve as soon as the request is forwarded; produce ids are minted
    /// locally. Matches servers that never confirm.
    #[default]
    Optimistic,
    /// Resolve only on `producerTransportConnected` / `produced` from the server.
    #[value(alias = "server")]
    AwaitServer,
}

impl AckPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "optimistic" => Some(AckPolicy::Optimistic),
            "server" | "await-server" | "await_server" => Some(AckPolicy::AwaitServer),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed signaling message: {0}")]
    Malformed(serde_json::Error),
    #[error("failed to encode signaling message: {0}")]
    Encode(serde_json::Error),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("negotiation already started")]
    AlreadyStarted,
}

/// What the caller has to do after a frame was handled.
#[derive(Debug)]
pub enum Reaction {
    Continue,
    /// The send transport exists; its requests must be fed back through
    /// [`Negotiator::handle_transport_request`] and tracks may be produced.
    TransportReady(TransportHandle),
}

pub struct Negotiator {
    device: Box<dyn MediaDevice>,
    signals: Arc<dyn SignalSink>,
    ack_policy: AckPolicy,
    state: Arc<watch::Sender<NegotiationState>>,
    transport: Option<Arc<dyn SendTransport>>,
    pending_connect: Option<Acknowledge<()>>,
    pending_produce: VecDeque<Acknowledge<ProducerId>>,
}

impl Negotiator {
    pub fn new(
        device: Box<dyn MediaDevice>,
        signals: Arc<dyn SignalSink>,
        ack_policy: AckPolicy,
    ) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            device,
            signals,
            ack_policy,
            state: Arc::new(state),
            transport: None,
            pending_connect: None,
            pending_produce: VecDeque::new(),
        }
    }

    /// Publishes state changes through `state` instead of a private channel.
    pub fn with_state(mut self, state: Arc<watch::Sender<NegotiationState>>) -> Self {
        state.send_replace(NegotiationState::Idle);
        self.state = state;
        self
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    pub fn transport(&self) -> Option<Arc<dyn SendTransport>> {
        self.transport.clone()
    }

    /// Asks the server for its router capabilities.
    pub fn begin(&mut self) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::Idle {
            return Err(NegotiationError::AlreadyStarted);
        }
        self.emit(ClientMessage::GetRouterRtpCapabilities)?;
        self.transition(NegotiationState::CapabilitiesRequested);
        Ok(())
    }

    pub async fn handle_message(&mut self, text: &str) -> Result<Reaction, NegotiationError> {
        // Confirmations only mean something when acks wait for them.
        let decoded = match self.ack_policy {
            AckPolicy::Optimistic => ServerMessage::decode(text),
            AckPolicy::AwaitServer => ServerMessage::decode_with_confirmations(text),
        };
        let message = decoded.map_err(NegotiationError::Malformed)?;
        match message {
            ServerMessage::RouterRtpCapabilities(capabilities) => {
                self.on_router_capabilities(capabilities).await?;
                Ok(Reaction::Continue)
            }
            ServerMessage::ProducerTransportCreated(options) => self.on_transport_created(options),
            ServerMessage::ProducerTransportConnected => {
                self.on_connect_confirmed();
                Ok(Reaction::Continue)
            }
            ServerMessage::Produced { id } => {
                self.on_produce_confirmed(id);
                Ok(Reaction::Continue)
            }
            ServerMessage::Ignored { kind } => {
                tracing::debug!(
                    target = "negotiation",
                    kind = kind.as_deref().unwrap_or("<none>"),
                    "ignoring signaling message"
                );
                Ok(Reaction::Continue)
            }
        }
    }

    pub fn handle_transport_request(
        &mut self,
        request: TransportRequest,
    ) -> Result<(), NegotiationError> {
        if self.transport.is_none() {
            tracing::warn!(
                target = "negotiation",
                request = request.name(),
                "transport request without an active transport"
            );
            reject(request, MediaError::TransportClosed);
            return Ok(());
        }
        match request {
            TransportRequest::Connect {
                dtls_parameters,
                ack,
            } => {
                self.emit(ClientMessage::ConnectProducerTransport { dtls_parameters })?;
                match self.ack_policy {
                    AckPolicy::Optimistic => {
                        ack.resolve(());
                        self.transition(NegotiationState::Connected);
                    }
                    AckPolicy::AwaitServer => {
                        tracing::debug!(
                            target = "negotiation",
                            "transport connect pending server confirmation"
                        );
                        self.pending_connect = Some(ack);
                    }
                }
            }
            TransportRequest::Produce {
                kind,
                rtp_parameters,
                ack,
            } => {
                self.emit(ClientMessage::Produce {
                    kind,
                    rtp_parameters,
                })?;
                self.transition(NegotiationState::Producing);
                match self.ack_policy {
                    AckPolicy::Optimistic => {
                        let id = ProducerId::synthesized();
                        tracing::debug!(target = "negotiation", %kind, producer = %id, "produce acknowledged locally");
                        ack.resolve(id);
                    }
                    AckPolicy::AwaitServer => self.pending_produce.push_back(ack),
                }
            }
        }
        Ok(())
    }

    /// Closes the transport if one exists. Pending acknowledgements are
    /// dropped, which fails the transport calls waiting on them.
    pub fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.pending_connect = None;
        self.pending_produce.clear();
        self.transition(NegotiationState::Closed);
    }

    async fn on_router_capabilities(
        &mut self,
        capabilities: RtpCapabilities,
    ) -> Result<(), NegotiationError> {
        if self.state() != NegotiationState::CapabilitiesRequested || self.device.is_loaded() {
            tracing::warn!(
                target = "negotiation",
                state = %self.state(),
                "ignoring unexpected routerRtpCapabilities"
            );
            return Ok(());
        }
        self.device.load(&capabilities).await?;
        self.transition(NegotiationState::DeviceLoaded);
        self.emit(ClientMessage::CreateProducerTransport)?;
        self.transition(NegotiationState::TransportRequested);
        Ok(())
    }

    fn on_transport_created(
        &mut self,
        options: TransportOptions,
    ) -> Result<Reaction, NegotiationError> {
        if self.state() != NegotiationState::TransportRequested {
            tracing::warn!(
                target = "negotiation",
                state = %self.state(),
                "ignoring unexpected producerTransportCreated"
            );
            return Ok(Reaction::Continue);
        }
        let handle = self.device.create_send_transport(&options)?;
        tracing::info!(
            target = "negotiation",
            transport_id = %handle.transport.id(),
            "producer transport created"
        );
        self.transport = Some(Arc::clone(&handle.transport));
        self.transition(NegotiationState::TransportCreated);
        Ok(Reaction::TransportReady(handle))
    }

    fn on_connect_confirmed(&mut self) {
        match self.pending_connect.take() {
            Some(ack) => {
                ack.resolve(());
                self.transition(NegotiationState::Connected);
            }
            None => tracing::debug!(
                target = "negotiation",
                "unsolicited producerTransportConnected"
            ),
        }
    }

    fn on_produce_confirmed(&mut self, id: String) {
        match self.pending_produce.pop_front() {
            Some(ack) => {
                ack.resolve(ProducerId::new(id));
            }
            None => tracing::debug!(
                target = "negotiation",
                producer = %id,
                "unsolicited produced confirmation"
            ),
        }
    }

    fn emit(&self, message: ClientMessage) -> Result<(), NegotiationError> {
        let text = message.encode().map_err(NegotiationError::Encode)?;
        tracing::debug!(target = "negotiation", kind = message.kind(), "sending signaling message");
        self.signals.send(text)?;
        Ok(())
    }

    fn transition(&self, next: NegotiationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                target = "negotiation",
                from = %previous,
                to = %next,
                "negotiation state changed"
            );
        }
    }
}

fn reject(request: TransportRequest, error: MediaError) {
    match request {
        TransportRequest::Connect { ack, .. } => {
            ack.reject(error);
        }
        TransportRequest::Produce { ack, .. } => {
            ack.reject(error);
        }
    }
}
