//! Configuration for the transport.
//!
//! Two layers live here: the property interface the transport reads at
//! start time ([`PropertySource`], applied through [`SampleConfig`]) and the
//! JSON5 file the host binary loads ([`HostConfig`]).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use systeminfo_common::{LoggingConfig, ZenohConfig};
use thiserror::Error;

/// Name of the update interval property.
pub const UPDATE_INTERVAL_PROPERTY: &str = "updateIntervalSeconds";

/// Update interval used until a valid property value is applied.
pub const DEFAULT_UPDATE_INTERVAL_SECS: f64 = 1.0;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] systeminfo_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// A raw configuration property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
    Boolean(bool),
}

impl PropertyValue {
    /// Interpret the value as a real number.
    ///
    /// Numbers pass through; text is trimmed and parsed. Booleans and
    /// unparsable text yield `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Text(s) => s.trim().parse().ok(),
            PropertyValue::Boolean(_) => None,
        }
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Boolean(v)
    }
}

/// Read access to externally stored configuration properties.
pub trait PropertySource: Send + Sync {
    /// Current value of a property, if set.
    fn property(&self, name: &str) -> Option<PropertyValue>;
}

impl PropertySource for HashMap<String, PropertyValue> {
    fn property(&self, name: &str) -> Option<PropertyValue> {
        self.get(name).cloned()
    }
}

/// In-memory property store that can be updated while the transport runs.
///
/// Updates take effect the next time the transport is started.
#[derive(Debug, Clone, Default)]
pub struct SharedProperties {
    inner: Arc<RwLock<HashMap<String, PropertyValue>>>,
}

impl SharedProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property.
    pub fn set(&self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Remove a property.
    pub fn remove(&self, name: &str) -> Option<PropertyValue> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl From<HashMap<String, PropertyValue>> for SharedProperties {
    fn from(map: HashMap<String, PropertyValue>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }
}

impl PropertySource for SharedProperties {
    fn property(&self, name: &str) -> Option<PropertyValue> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Sampling settings, re-read from properties at every start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleConfig {
    update_interval_secs: f64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
        }
    }
}

impl SampleConfig {
    /// Interval between ticks, in seconds.
    pub fn update_interval_secs(&self) -> f64 {
        self.update_interval_secs
    }

    /// Interval between ticks, truncated to whole milliseconds.
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis((self.update_interval_secs * 1000.0) as u64)
    }

    /// Apply `updateIntervalSeconds` from `source`.
    ///
    /// Absent, non-numeric, non-finite and non-positive values are ignored
    /// and the current interval is kept. Returns true if the interval changed.
    pub fn apply_properties(&mut self, source: &dyn PropertySource) -> bool {
        let Some(raw) = source.property(UPDATE_INTERVAL_PROPERTY) else {
            return false;
        };

        match raw.as_f64() {
            Some(value) if value.is_finite() && value > 0.0 => {
                if value != self.update_interval_secs {
                    self.update_interval_secs = value;
                    return true;
                }
                false
            }
            _ => {
                tracing::warn!(
                    property = UPDATE_INTERVAL_PROPERTY,
                    value = ?raw,
                    kept = self.update_interval_secs,
                    "Ignoring invalid property value"
                );
                false
            }
        }
    }
}

/// Record encoding used on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Permissive hand-built text, the historical wire format (default).
    #[default]
    Text,
    /// Strict JSON produced by serde_json, same field order.
    Json,
}

/// Transport section of the host configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportSection {
    /// Record encoding.
    #[serde(default)]
    pub encoding: RecordFormat,

    /// Remaining keys are exposed to the transport as properties
    /// (e.g. `updateIntervalSeconds`).
    #[serde(flatten)]
    pub properties: HashMap<String, PropertyValue>,
}

/// Where the host binary delivers records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Newline-delimited records on standard output (default).
    #[default]
    Stdout,
    /// One Zenoh publication per record.
    Zenoh,
}

/// Sink section of the host configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Zenoh key expression records are published to.
    #[serde(default = "default_sink_key")]
    pub key: String,
}

fn default_sink_key() -> String {
    "systeminfo/records".to_string()
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::default(),
            key: default_sink_key(),
        }
    }
}

/// Complete host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub sink: SinkConfig,

    /// Zenoh connection settings (used by the Zenoh sink only).
    #[serde(default)]
    pub zenoh: ZenohConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HostConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: HostConfig = systeminfo_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sink.kind == SinkKind::Zenoh && self.sink.key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "sink.key must not be empty for the zenoh sink".to_string(),
            ));
        }
        Ok(())
    }
}
