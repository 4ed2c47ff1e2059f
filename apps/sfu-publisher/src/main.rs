mod cli;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use cli::Cli;
use sfu_publisher::config::Config;
use sfu_publisher::logging;
use sfu_publisher::media::PreviewSinks;
use sfu_publisher::media::synthetic::{SyntheticBackend, TracingPreview};
use sfu_publisher::publisher::PublisherSession;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let config = cli.apply(Config::from_env()?);
    let previews = PreviewSinks::new(
        Arc::new(TracingPreview::new("local")),
        Arc::new(TracingPreview::new("remote")),
    );
    let mut session = PublisherSession::new(config, Arc::new(SyntheticBackend::new()), previews);
    let capture = session.config().capture;
    tracing::info!(
        target = "publisher",
        audio = capture.audio,
        video = capture.video,
        "capturing synthetic media"
    );
    session
        .start()
        .context("failed to start publisher session")?;

    let outcome = tokio::select! {
        result = session.closed() => result.context("publisher session ended"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!(target = "publisher", "interrupted; shutting down");
            Ok(())
        }
    };
    session.stop();
    outcome
}
