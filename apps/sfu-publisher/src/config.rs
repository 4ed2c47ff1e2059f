use std::env;
use thiserror::Error;

use crate::media::CaptureConstraints;
use crate::negotiation::AckPolicy;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:3001";

const URL_VAR: &str = "SFU_SIGNALING_URL";
const ACK_POLICY_VAR: &str = "SFU_ACK_POLICY";
const CAPTURE_AUDIO_VAR: &str = "SFU_CAPTURE_AUDIO";
const CAPTURE_VIDEO_VAR: &str = "SFU_CAPTURE_VIDEO";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be one of optimistic, server (got {value:?})")]
    AckPolicy { var: &'static str, value: String },
    #[error("{var} must be a boolean (got {value:?})")]
    Flag { var: &'static str, value: String },
}

/// Publisher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// WebSocket endpoint of the SFU signaling server
    pub signaling_url: String,
    pub ack_policy: AckPolicy,
    pub capture: CaptureConstraints,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let signaling_url = env::var(URL_VAR)
            .map(|url| normalize_url(&url))
            .unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());
        let ack_policy = match env::var(ACK_POLICY_VAR) {
            Ok(value) => AckPolicy::parse(&value).ok_or(ConfigError::AckPolicy {
                var: ACK_POLICY_VAR,
                value,
            })?,
            Err(_) => AckPolicy::default(),
        };
        let capture = CaptureConstraints {
            audio: env_flag(CAPTURE_AUDIO_VAR)?.unwrap_or(true),
            video: env_flag(CAPTURE_VIDEO_VAR)?.unwrap_or(true),
        };
        Ok(Self {
            signaling_url,
            ack_policy,
            capture,
        })
    }

    pub fn with_signaling_url(mut self, url: &str) -> Self {
        self.signaling_url = normalize_url(url);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ack_policy: AckPolicy::default(),
            capture: CaptureConstraints::default(),
        }
    }
}

// Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    for scheme in ["ws://", "wss://", "http://", "https://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/")
            {
                return format!("{scheme}{}", rest.replacen("localhost", "127.0.0.1", 1));
            }
        }
    }
    url.to_string()
}

fn env_flag(var: &'static str) -> Result<Option<bool>, ConfigError> {
    let Ok(value) = env::var(var) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::Flag { var, value }),
    }
}
