//! Record encoding.
//!
//! Every record has the shape
//!
//! ```text
//! {"OperatingSystemInformation": {"hostname": "...", "ip": "...", <fields>, "threads": N, "DatetimeStamp": MILLIS}}
//! ```
//!
//! followed by [`RECORD_DELIMITER`]. Failed fields are emitted as `null`.

use std::fmt::Write as _;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::RecordFormat;
use crate::error::TransportError;
use crate::identity::HostIdentity;
use crate::sampler::{MetricSnapshot, MetricValue};

/// Top-level key wrapping every record.
pub const RECORD_KEY: &str = "OperatingSystemInformation";

/// Terminates each record.
pub const RECORD_DELIMITER: u8 = b'\n';

/// One encoded record, delimiter included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRecord {
    bytes: Vec<u8>,
}

impl EncodedRecord {
    /// Wrap an encoded body and append the record delimiter.
    pub fn from_body(body: impl Into<Vec<u8>>) -> Self {
        let mut bytes = body.into();
        bytes.push(RECORD_DELIMITER);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Turns a snapshot and identity into wire bytes.
pub trait RecordEncoder: Send + Sync {
    fn encode(
        &self,
        snapshot: &MetricSnapshot,
        identity: &HostIdentity,
    ) -> Result<EncodedRecord, TransportError>;
}

/// Encoder for the given format.
pub fn encoder_for(format: RecordFormat) -> Arc<dyn RecordEncoder> {
    match format {
        RecordFormat::Text => Arc::new(TextRecordEncoder),
        RecordFormat::Json => Arc::new(JsonRecordEncoder),
    }
}

/// Hand-built text encoding.
///
/// Strings are quoted without escaping. Field names come from the provider
/// and hostnames from the OS, neither contains quotes in practice, and
/// consumers tolerate the occasional malformed line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRecordEncoder;

fn push_value(out: &mut String, value: Option<MetricValue>) {
    match value {
        Some(v) if v.is_finite() => {
            let _ = write!(out, "{}", v);
        }
        _ => out.push_str("null"),
    }
}

impl RecordEncoder for TextRecordEncoder {
    fn encode(
        &self,
        snapshot: &MetricSnapshot,
        identity: &HostIdentity,
    ) -> Result<EncodedRecord, TransportError> {
        let mut out = String::with_capacity(128 + snapshot.fields().len() * 48);

        let _ = write!(
            out,
            "{{\"{}\": {{\"hostname\": \"{}\", \"ip\": \"{}\"",
            RECORD_KEY, identity.hostname, identity.address
        );

        for field in snapshot.fields() {
            let _ = write!(out, ", \"{}\": ", field.name);
            push_value(&mut out, field.value);
        }

        out.push_str(", \"threads\": ");
        match snapshot.threads() {
            Some(n) => {
                let _ = write!(out, "{}", n);
            }
            None => out.push_str("null"),
        }

        let _ = write!(out, ", \"DatetimeStamp\": {}}}}}", snapshot.timestamp());

        Ok(EncodedRecord::from_body(out))
    }
}

/// Strict JSON encoding through serde_json, same field order as the text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRecordEncoder;

struct Record<'a> {
    snapshot: &'a MetricSnapshot,
    identity: &'a HostIdentity,
}

struct Body<'a>(&'a Record<'a>);

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(RECORD_KEY, &Body(self))?;
        map.end()
    }
}

impl Serialize for Body<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Record { snapshot, identity } = self.0;
        let mut map = serializer.serialize_map(Some(snapshot.fields().len() + 4))?;
        map.serialize_entry("hostname", &identity.hostname)?;
        map.serialize_entry("ip", &identity.address)?;
        for field in snapshot.fields() {
            map.serialize_entry(&field.name, &field.value)?;
        }
        map.serialize_entry("threads", &snapshot.threads())?;
        map.serialize_entry("DatetimeStamp", &snapshot.timestamp())?;
        map.end()
    }
}

impl RecordEncoder for JsonRecordEncoder {
    fn encode(
        &self,
        snapshot: &MetricSnapshot,
        identity: &HostIdentity,
    ) -> Result<EncodedRecord, TransportError> {
        let body = serde_json::to_vec(&Record { snapshot, identity })
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        Ok(EncodedRecord::from_body(body))
    }
}
