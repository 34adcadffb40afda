//! Host system information transport.
//!
//! Samples operating-system metrics on a fixed cadence and hands one
//! newline-terminated record per tick to a downstream byte sink:
//!
//! ```text
//! {"OperatingSystemInformation": {"hostname": "server01", "ip": "10.0.0.5", "SystemCpuLoad": 0.36, ..., "threads": 17, "DatetimeStamp": 1700000000123}}
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use systeminfo_transport::{SharedProperties, SystemInfoTransport, WriterSink};
//!
//! let properties = SharedProperties::new();
//! properties.set("updateIntervalSeconds", 0.5);
//!
//! let transport = SystemInfoTransport::builder(Arc::new(WriterSink::stdout()))
//!     .properties(Arc::new(properties))
//!     .build();
//!
//! transport.start();
//! // ...
//! transport.stop();
//! ```

pub mod args;
pub mod config;
pub mod encoder;
pub mod error;
pub mod identity;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod provider;
pub mod sampler;
pub mod sink;
pub mod state;
pub mod transport;

pub use args::HostArgs;
pub use config::{
    HostConfig, PropertySource, PropertyValue, RecordFormat, SampleConfig, SharedProperties,
    SinkConfig, SinkKind, UPDATE_INTERVAL_PROPERTY,
};
pub use encoder::{EncodedRecord, JsonRecordEncoder, RecordEncoder, TextRecordEncoder};
pub use error::{Result, SampleError, SinkError, TransportError};
pub use identity::{HostIdentity, IdentityResolver, NetworkProbe, UdpProbe};
pub use provider::SysinfoProvider;
pub use sampler::{MetricSnapshot, MetricValue, MetricsProvider, SampledField, sample};
pub use sink::{ByteSink, ChannelSink, SinkAdapter, WriterSink, ZenohSink};
pub use state::RunningState;
pub use transport::{SystemInfoTransport, TransportBuilder};
