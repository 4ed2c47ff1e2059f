//! Wire messages exchanged with the SFU signaling peer.
//!
//! Every frame is a JSON object tagged by `type`. Payloads that belong to the
//! media engine (capabilities, transport options, DTLS and RTP parameters)
//! are carried as opaque JSON and never inspected here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Router RTP capabilities as announced by the SFU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// Parameters the SFU returns when it creates the producer transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportOptions(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    GetRouterRtpCapabilities,
    CreateProducerTransport,
    ConnectProducerTransport {
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: RtpParameters,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The `type` tag this message is sent with.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientMessage::CreateProducerTransport => "createProducerTransport",
            ClientMessage::ConnectProducerTransport { .. } => "connectProducerTransport",
            ClientMessage::Produce { .. } => "produce",
        }
    }
}

/// Inbound message after dispatch on its `type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    RouterRtpCapabilities(RtpCapabilities),
    ProducerTransportCreated(TransportOptions),
    /// Server confirmation of `connectProducerTransport`.
    ProducerTransportConnected,
    /// Server confirmation of `produce`, carrying the assigned producer id.
    Produced { id: String },
    /// Any frame whose `type` is missing or not one of the above.
    Ignored { kind: Option<String> },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum KnownServerMessage {
    RouterRtpCapabilities { data: RtpCapabilities },
    ProducerTransportCreated { data: TransportOptions },
    ProducerTransportConnected,
    Produced { data: ProducedPayload },
}

#[derive(Debug, Deserialize)]
struct ProducedPayload {
    id: String,
}

const HANDSHAKE_TYPES: &[&str] = &["routerRtpCapabilities", "producerTransportCreated"];

const HANDSHAKE_AND_CONFIRMATION_TYPES: &[&str] = &[
    "routerRtpCapabilities",
    "producerTransportCreated",
    "producerTransportConnected",
    "produced",
];

impl ServerMessage {
    /// Decodes one inbound text frame of the handshake.
    ///
    /// Invalid JSON and handshake types with an invalid payload are errors.
    /// Every other frame, server confirmations included, decodes to
    /// [`ServerMessage::Ignored`] whatever its payload.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        Self::decode_known(text, HANDSHAKE_TYPES)
    }

    /// Like [`ServerMessage::decode`], but `producerTransportConnected` and
    /// `produced` are decoded too, and a bad `produced` payload is an error.
    pub fn decode_with_confirmations(text: &str) -> Result<Self, serde_json::Error> {
        Self::decode_known(text, HANDSHAKE_AND_CONFIRMATION_TYPES)
    }

    fn decode_known(text: &str, known: &[&str]) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            Some(tag) if known.contains(&tag) => {
                let known: KnownServerMessage = serde_json::from_value(value)?;
                Ok(known.into())
            }
            _ => Ok(ServerMessage::Ignored { kind }),
        }
    }
}

impl From<KnownServerMessage> for ServerMessage {
    fn from(message: KnownServerMessage) -> Self {
        match message {
            KnownServerMessage::RouterRtpCapabilities { data } => {
                ServerMessage::RouterRtpCapabilities(data)
            }
            KnownServerMessage::ProducerTransportCreated { data } => {
                ServerMessage::ProducerTransportCreated(data)
            }
            KnownServerMessage::ProducerTransportConnected => {
                ServerMessage::ProducerTransportConnected
            }
            KnownServerMessage::Produced { data } => ServerMessage::Produced { id: data.id },
        }
    }
}
