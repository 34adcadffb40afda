//! Zenoh session setup for the publishing sink.

use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

fn insert(config: &mut zenoh::Config, key: &str, value: &str) -> Result<()> {
    config
        .insert_json5(key, value)
        .map_err(|e| Error::Config(format!("Failed to set {}: {}", key, e)))
}

fn insert_endpoints(config: &mut zenoh::Config, key: &str, endpoints: &[String]) -> Result<()> {
    if endpoints.is_empty() {
        return Ok(());
    }
    insert(config, key, &serde_json::to_string(endpoints)?)
}

/// Translate our connection settings into a native Zenoh config.
pub fn zenoh_config(config: &ZenohConfig) -> Result<zenoh::Config> {
    let mut native = zenoh::Config::default();
    insert(&mut native, "mode", &format!("\"{}\"", config.mode))?;
    insert_endpoints(&mut native, "connect/endpoints", &config.connect)?;
    insert_endpoints(&mut native, "listen/endpoints", &config.listen)?;
    Ok(native)
}

/// Open a session for publishing records.
pub async fn connect(config: &ZenohConfig) -> Result<Session> {
    let native = zenoh_config(config)?;

    tracing::info!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        "Opening Zenoh session"
    );

    let session = zenoh::open(native).await?;
    tracing::info!(zid = %session.zid(), "Zenoh session open");
    Ok(session)
}
