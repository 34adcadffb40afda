//! Hand-off of encoded records to the downstream byte consumer.

use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{error, trace, warn};
use zenoh::Wait;

use crate::encoder::EncodedRecord;
use crate::error::SinkError;

/// Channel identifier passed with every record.
pub const DEFAULT_CHANNEL: &str = "";

/// Downstream consumer of record bytes.
///
/// The sink is owned by the host and may be stateful. Returning
/// [`SinkError::Rejected`] skips the record; any other error ends the run.
pub trait ByteSink: Send + Sync {
    fn receive(&self, buffer: &[u8], channel_id: &str) -> Result<(), SinkError>;
}

impl<F> ByteSink for F
where
    F: Fn(&[u8], &str) -> Result<(), SinkError> + Send + Sync,
{
    fn receive(&self, buffer: &[u8], channel_id: &str) -> Result<(), SinkError> {
        self(buffer, channel_id)
    }
}

/// Fixed-capacity buffer a record is copied into before hand-off.
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl FrameBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `data`, refusing to grow past the capacity.
    pub fn put(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let needed = self.bytes.len() + data.len();
        if needed > self.capacity {
            return Err(SinkError::Overflow {
                capacity: self.capacity,
                needed,
            });
        }
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Outcome of handing one record to the sink.
#[derive(Debug)]
pub enum Emission {
    /// The sink accepted the record.
    Delivered,
    /// The sink rejected the record; the loop continues with the next tick.
    Rejected,
    /// The record did not fit its buffer.
    Overflow(SinkError),
    /// The sink failed.
    Failed(SinkError),
}

/// Copies each record into an exactly sized buffer and passes it to the sink,
/// classifying the sink's answer.
#[derive(Clone)]
pub struct SinkAdapter {
    sink: Arc<dyn ByteSink>,
}

impl SinkAdapter {
    pub fn new(sink: Arc<dyn ByteSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, record: &EncodedRecord) -> Emission {
        let mut frame = FrameBuffer::with_capacity(record.len());
        if let Err(e) = frame.put(record.as_bytes()) {
            error!(error = %e, "Buffer overflow while preparing record");
            return Emission::Overflow(e);
        }

        match self.sink.receive(frame.as_slice(), DEFAULT_CHANNEL) {
            Ok(()) => {
                trace!(bytes = frame.as_slice().len(), "Record delivered");
                Emission::Delivered
            }
            Err(SinkError::Rejected(reason)) => {
                warn!(%reason, "Sink rejected record, skipping tick");
                Emission::Rejected
            }
            Err(e @ SinkError::Overflow { .. }) => {
                error!(error = %e, "Buffer overflow in sink");
                Emission::Overflow(e)
            }
            Err(e) => {
                error!(error = %e, "Unexpected sink error");
                Emission::Failed(e)
            }
        }
    }
}

/// Writes records to any [`Write`] implementation, flushing after each one.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl WriterSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> ByteSink for WriterSink<W> {
    fn receive(&self, buffer: &[u8], _channel_id: &str) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(buffer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Forwards records over a std channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiver its records arrive on.
    pub fn new() -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl ByteSink for ChannelSink {
    fn receive(&self, buffer: &[u8], _channel_id: &str) -> Result<(), SinkError> {
        self.tx
            .send(buffer.to_vec())
            .map_err(|_| SinkError::Closed)
    }
}

/// Publishes each record to a Zenoh key expression.
pub struct ZenohSink {
    session: Arc<zenoh::Session>,
    key: String,
}

impl ZenohSink {
    pub fn new(session: Arc<zenoh::Session>, key: impl Into<String>) -> Self {
        Self {
            session,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl ByteSink for ZenohSink {
    fn receive(&self, buffer: &[u8], _channel_id: &str) -> Result<(), SinkError> {
        self.session
            .put(&self.key, buffer.to_vec())
            .wait()
            .map_err(|e| SinkError::other(format!("Failed to publish to {}: {}", self.key, e)))
    }
}
