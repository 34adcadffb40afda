//! Host binary for the system information transport.
//!
//! Loads a JSON5 configuration, wires the transport to stdout or a Zenoh
//! key expression and runs until Ctrl+C or until the transport reports an
//! error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use systeminfo_transport::{
    ByteSink, HostArgs, HostConfig, RunningState, SharedProperties, SinkKind, SystemInfoTransport,
    WriterSink, ZenohSink,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = HostArgs::parse();

    let mut config = HostConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    systeminfo_common::init_tracing(&config.logging)?;

    let session = match config.sink.kind {
        SinkKind::Zenoh => Some(Arc::new(systeminfo_common::connect(&config.zenoh).await?)),
        SinkKind::Stdout => None,
    };

    let sink: Arc<dyn ByteSink> = match &session {
        Some(session) => {
            let sink = ZenohSink::new(session.clone(), config.sink.key.clone());
            tracing::info!(key = %sink.key(), "Publishing records to Zenoh");
            Arc::new(sink)
        }
        None => Arc::new(WriterSink::stdout()),
    };

    let transport = Arc::new(
        SystemInfoTransport::builder(sink)
            .properties(Arc::new(SharedProperties::from(
                config.transport.properties.clone(),
            )))
            .format(config.transport.encoding)
            .build(),
    );

    transport.start();

    let watcher = {
        let transport = transport.clone();
        tokio::task::spawn_blocking(move || {
            loop {
                let state = transport
                    .wait_for_state(Duration::from_secs(60), |s| !s.is_active());
                if !state.is_active() {
                    return state;
                }
            }
        })
    };

    let failed = tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            }
            tracing::info!("Received shutdown signal");
            false
        }
        state = watcher => {
            let failed = matches!(state, Ok(RunningState::Error));
            if failed {
                tracing::error!("Transport entered the error state, shutting down");
            }
            failed
        }
    };

    transport.stop();
    let joiner = transport.clone();
    tokio::task::spawn_blocking(move || joiner.join()).await?;

    if let Some(session) = session {
        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Error closing Zenoh session");
        }
    }

    tracing::info!("Goodbye!");

    if failed {
        anyhow::bail!("transport stopped after an unrecoverable error");
    }
    Ok(())
}
