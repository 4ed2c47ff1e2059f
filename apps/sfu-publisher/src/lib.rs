pub mod config;
pub mod logging;
pub mod media;
pub mod negotiation;
pub mod protocol;
pub mod publisher;
pub mod signaling;

pub use config::{Config, ConfigError};
pub use negotiation::{AckPolicy, NegotiationState, Negotiator};
pub use publisher::{PublisherSession, SessionError};
pub use signaling::{ConnectionState, SignalingChannel};
