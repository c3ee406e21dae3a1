//! Main Entrypoint for the Roomlink Agent
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment (and an optional env file).
//! 2. Initializing logging.
//! 3. Wiring the token issuer, WebSocket transport and default handlers into
//!    a session manager.
//! 4. Running the session until it fails fatally or a shutdown signal arrives.

use anyhow::Context;
use clap::Parser;
use roomlink_agent::{
    config::Config,
    handlers::{ByteLengthAudioSink, KeywordReplies},
    transport::WebSocketTransport,
};
use roomlink_core::{EventRouter, SessionManager, TokenIssuer};
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about = "Keeps a local agent connected to a media room")]
struct Args {
    /// Room to join, overriding ROOM_NAME.
    #[arg(long)]
    room: Option<String>,

    /// Participant identity, overriding PARTICIPANT_IDENTITY.
    #[arg(long)]
    identity: Option<String>,

    /// Env file loaded before reading the environment.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal. Stopping session...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    if let Some(path) = &args.env_file {
        dotenvy::from_path(path)
            .with_context(|| format!("Failed to load env file {}", path.display()))?;
    }
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(room) = args.room {
        config.room_name = room;
    }
    if let Some(identity) = args.identity {
        config.participant_identity = identity;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(
        server = %config.server_url,
        room = %config.room_name,
        identity = %config.participant_identity,
        "Configuration loaded. Starting agent..."
    );

    // --- 3. Wire the Session ---
    let session_config = config.session_config();
    session_config
        .validate()
        .context("Invalid session configuration")?;

    let router = EventRouter::new(Arc::new(KeywordReplies::new(
        config.participant_name.clone(),
    )))
    .with_audio_sink(Arc::new(ByteLengthAudioSink::new()));
    let transport = Arc::new(WebSocketTransport::new(config.connect_timeout));
    let issuer = TokenIssuer::new(config.api_key, config.api_secret)
        .with_display_name(config.participant_name);

    let manager = SessionManager::new(session_config, issuer, transport, Arc::new(router));
    let stats = manager.stats();

    // --- 4. Run Until Stopped ---
    let handle = manager.start();
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    let outcome = handle.wait().await;
    let summary = stats.snapshot();
    info!(
        messages_sent = summary.messages_sent,
        messages_received = summary.messages_received,
        audio_units_processed = summary.audio_units_processed,
        "Session finished"
    );

    if let Err(e) = outcome {
        error!(error = %e, "Session terminated");
        return Err(e).context("Agent session failed");
    }
    info!("Agent has shut down.");
    Ok(())
}
