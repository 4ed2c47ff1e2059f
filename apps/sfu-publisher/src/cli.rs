use clap::{Args, Parser};
use std::path::PathBuf;

use sfu_publisher::config::Config;
use sfu_publisher::logging::{LogConfig, LogLevel};
use sfu_publisher::negotiation::AckPolicy;

#[derive(Parser, Debug)]
#[command(
    name = "sfu-publisher",
    about = "Publish local audio/video to an SFU over WebSocket signaling",
    version
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "URL",
        help = "Signaling endpoint (overrides SFU_SIGNALING_URL)"
    )]
    pub url: Option<String>,

    #[arg(
        long,
        value_enum,
        help = "When transport connect/produce are acknowledged (overrides SFU_ACK_POLICY)"
    )]
    pub ack_policy: Option<AckPolicy>,

    #[arg(long, help = "Do not capture or publish audio")]
    pub no_audio: bool,

    #[arg(long, help = "Do not capture or publish video")]
    pub no_video: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

impl Cli {
    /// Layers command line overrides on top of the environment config.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(url) = self.url.as_deref() {
            config = config.with_signaling_url(url);
        }
        if let Some(policy) = self.ack_policy {
            config.ack_policy = policy;
        }
        if self.no_audio {
            config.capture.audio = false;
        }
        if self.no_video {
            config.capture.video = false;
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SFU_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SFU_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
