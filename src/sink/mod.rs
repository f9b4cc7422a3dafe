//! Per-destination sink buffering, enforcing the ingest API's batch limits.

pub mod credentials;
pub mod shipper;

use std::sync::Arc;

use crate::config::SinkSettings;
use crate::errors::Result;
use crate::record::Record;
use crate::sink::credentials::TokenProvider;
use crate::sink::shipper::Shipper;

/// Maximum number of records per ingest request.
pub const MAX_BATCH_ENTRIES: usize = 5000;

/// Maximum uncompressed payload size per ingest request, in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 5_242_880;

// JSON array framing accounted for in the running payload size.
const LIST_BRACKETS_LENGTH: usize = 2;

/// A log-ingest destination with its per-invocation buffer state.
pub struct LogSink {
    pub id: String,
    shipper: Shipper,
    buffer: Vec<Record>,
    approx_bytes: usize,
    batch_num: u32,
    source_descriptor: String,
}

impl LogSink {
    pub fn new(settings: &SinkSettings, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        Ok(LogSink {
            id: settings.id.clone(),
            shipper: Shipper::new(settings, tokens)?,
            buffer: Vec::new(),
            approx_bytes: LIST_BRACKETS_LENGTH,
            batch_num: 1,
            source_descriptor: String::new(),
        })
    }

    /// Records the object currently being forwarded, for diagnostics.
    pub fn set_source(&mut self, bucket: &str, key: &str) {
        self.source_descriptor = format!("{bucket}/{key}");
    }

    pub fn buffered_records(&self) -> usize {
        self.buffer.len()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn batch_num(&self) -> u32 {
        self.batch_num
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Buffers one record, flushing first if appending it would exceed the
    /// count or byte cap.
    pub async fn push(&mut self, mut record: Record) -> Result<()> {
        record.enforce_content_limit();
        let record_bytes = record.encoded_len()?;

        if self.buffer.len() + 1 > MAX_BATCH_ENTRIES
            || self.approx_bytes + record_bytes > MAX_PAYLOAD_BYTES
        {
            self.flush().await?;
            self.batch_num += 1;
        }

        self.buffer.push(record);
        self.approx_bytes += record_bytes;
        Ok(())
    }

    /// Ships the buffered batch, if any. The buffer is cleared regardless of
    /// the outcome; the shipper's error is propagated.
    pub async fn flush(&mut self) -> Result<()> {
        let outcome = if self.buffer.is_empty() {
            Ok(())
        } else {
            match serde_json::to_vec(&self.buffer) {
                Ok(payload) => {
                    self.shipper
                        .ship(&payload, self.batch_num, &self.source_descriptor)
                        .await
                }
                Err(err) => Err(err.into()),
            }
        };

        self.buffer.clear();
        self.approx_bytes = LIST_BRACKETS_LENGTH;
        outcome
    }

    /// Discards all buffer state. Called at the start of each notification
    /// so leftovers from an earlier failure never leak across.
    pub fn empty_sink(&mut self) {
        self.buffer.clear();
        self.approx_bytes = LIST_BRACKETS_LENGTH;
        self.batch_num = 1;
        self.source_descriptor.clear();
    }
}
