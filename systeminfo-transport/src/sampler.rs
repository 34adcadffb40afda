//! Metric sampling.
//!
//! A [`MetricsProvider`] exposes whatever read-only counters the host offers;
//! [`sample`] walks them once per tick and builds a [`MetricSnapshot`].

use std::fmt;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::error::SampleError;

/// Value of one sampled metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Integral counter or size.
    Integer(i64),
    /// Load, ratio or other real number.
    Float(f64),
}

impl MetricValue {
    /// False for NaN and infinite floats, which have no JSON representation.
    pub fn is_finite(&self) -> bool {
        match self {
            MetricValue::Integer(_) => true,
            MetricValue::Float(v) => v.is_finite(),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Float(v) => write!(f, "{}", v),
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Integer(v) => serializer.serialize_i64(*v),
            MetricValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            MetricValue::Float(_) => serializer.serialize_none(),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Integer(v)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

/// Host OS metrics capability.
///
/// Implementations decide at runtime which fields exist. The sampler never
/// assumes a fixed list.
pub trait MetricsProvider: Send {
    /// Refresh cached counters before a tick. Defaults to a no-op.
    fn refresh(&mut self) {}

    /// Names of the fields currently readable, in discovery order.
    fn available_fields(&mut self) -> Vec<String>;

    /// Read one field.
    fn read_field(&mut self, name: &str) -> Result<MetricValue, SampleError>;

    /// Number of live threads in this process.
    fn thread_count(&mut self) -> Result<u64, SampleError>;
}

impl<P: MetricsProvider + ?Sized> MetricsProvider for Box<P> {
    fn refresh(&mut self) {
        (**self).refresh()
    }

    fn available_fields(&mut self) -> Vec<String> {
        (**self).available_fields()
    }

    fn read_field(&mut self, name: &str) -> Result<MetricValue, SampleError> {
        (**self).read_field(name)
    }

    fn thread_count(&mut self) -> Result<u64, SampleError> {
        (**self).thread_count()
    }
}

/// One sampled field; `value` is `None` when the read failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledField {
    pub name: String,
    pub value: Option<MetricValue>,
}

/// One tick's worth of metric values.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSnapshot {
    fields: Vec<SampledField>,
    threads: Option<u64>,
    timestamp: i64,
}

impl MetricSnapshot {
    pub fn new(fields: Vec<SampledField>, threads: Option<u64>, timestamp: i64) -> Self {
        Self {
            fields,
            threads,
            timestamp,
        }
    }

    /// Fields in discovery order.
    pub fn fields(&self) -> &[SampledField] {
        &self.fields
    }

    /// Look up a field by name. Outer `None` means the field was not
    /// sampled at all, inner `None` means the read failed.
    pub fn get(&self, name: &str) -> Option<Option<MetricValue>> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.value)
    }

    /// Live thread count, `None` if it could not be read.
    pub fn threads(&self) -> Option<u64> {
        self.threads
    }

    /// Unix epoch milliseconds the sample was taken at.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Sample every available field of `provider`.
///
/// A failing field is recorded as `None` and sampling continues with the
/// next one.
pub fn sample(provider: &mut dyn MetricsProvider) -> MetricSnapshot {
    provider.refresh();

    let fields = provider
        .available_fields()
        .into_iter()
        .map(|name| {
            let value = match provider.read_field(&name) {
                Ok(value) => {
                    debug!(field = %name, %value, "Sampled field");
                    Some(value)
                }
                Err(e) => {
                    debug!(field = %name, error = %e, "Field unavailable");
                    None
                }
            };
            SampledField { name, value }
        })
        .collect();

    let threads = match provider.thread_count() {
        Ok(count) => Some(count),
        Err(e) => {
            debug!(error = %e, "Thread count unavailable");
            None
        }
    };

    MetricSnapshot::new(
        fields,
        threads,
        systeminfo_common::current_timestamp_millis(),
    )
}
