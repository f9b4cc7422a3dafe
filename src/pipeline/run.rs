//! The pipeline driver: iterates a notification batch in order, wires the
//! matcher, fetcher, decoder, shaper and sinks together, and reports which
//! notifications must be retried.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::{LogtapError, Result};
use crate::pipeline::decoder::{self, DecodeSpec, RawEntry};
use crate::pipeline::shape::{self, ShapeContext};
use crate::pipeline::RemainingTime;
use crate::rules::{forwarding, processing, ForwardingRuleIndex, ProcessingRuleIndex};
use crate::s3::ObjectStore;
use crate::sink::LogSink;

/// How many entries are processed between deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 1000;

/// Remaining execution time below which processing stops, in milliseconds.
const MIN_REMAINING_TIME_MS: u64 = 10_000;

/// Inbound notification batch, as handed over by the dispatcher.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationBatch {
    #[serde(rename = "Records", default)]
    pub records: Vec<NotificationMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub body: String,
}

/// Outbound failure report: notifications listed here are retried by the
/// dispatcher; everything else counts as processed.
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct FailureReport {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<ItemFailure>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

impl FailureReport {
    fn from_ids(ids: Vec<String>) -> Self {
        FailureReport {
            batch_item_failures: ids
                .into_iter()
                .map(|item_identifier| ItemFailure { item_identifier })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct S3NotificationBody {
    s3: S3Section,
    #[serde(rename = "awsRegion", default)]
    aws_region: Option<String>,
    #[serde(rename = "userIdentity", default)]
    user_identity: Option<UserIdentity>,
}

#[derive(Debug, Deserialize)]
struct S3Section {
    bucket: BucketRef,
    object: ObjectRef,
}

#[derive(Debug, Deserialize)]
struct BucketRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    key: String,
}

#[derive(Debug, Deserialize)]
struct UserIdentity {
    #[serde(rename = "principalId", default)]
    principal_id: Option<String>,
}

/// The worker: immutable rules plus per-invocation sink state.
pub struct Forwarder {
    forwarding_rules: ForwardingRuleIndex,
    processing_rules: ProcessingRuleIndex,
    sinks: IndexMap<String, LogSink>,
    store: Arc<dyn ObjectStore>,
    forwarder_arn: String,
}

impl Forwarder {
    pub fn new(
        forwarding_rules: ForwardingRuleIndex,
        processing_rules: ProcessingRuleIndex,
        sinks: IndexMap<String, LogSink>,
        store: Arc<dyn ObjectStore>,
        forwarder_arn: String,
    ) -> Self {
        Forwarder {
            forwarding_rules,
            processing_rules,
            sinks,
            store,
            forwarder_arn,
        }
    }

    /// Processes a notification batch in order, stopping early when the
    /// execution deadline approaches. Returns the failure report for the
    /// dispatcher.
    pub async fn handle_event(
        &mut self,
        event: &NotificationBatch,
        clock: &dyn RemainingTime,
    ) -> FailureReport {
        let mut failed_ids: Vec<String> = Vec::new();

        for (index, message) in event.records.iter().enumerate() {
            // Shed anything left over from an earlier failed notification.
            for sink in self.sinks.values_mut() {
                sink.empty_sink();
            }

            let body: S3NotificationBody = match serde_json::from_str(&message.body) {
                Ok(body) => body,
                Err(err) => {
                    warn!(
                        "Dropping message {}, body is not valid JSON: {err}",
                        message.message_id
                    );
                    continue;
                }
            };

            info!(
                "Processing object s3://{}/{}; posted by {}",
                body.s3.bucket.name,
                body.s3.object.key,
                body.user_identity
                    .as_ref()
                    .and_then(|identity| identity.principal_id.as_deref())
                    .unwrap_or("unknown")
            );

            match self.process_notification(&body, clock).await {
                Ok(()) => {}
                Err(LogtapError::NonUtf8TextEntry(key)) => {
                    error!(
                        "Error decoding log object. Log contains non-UTF-8 characters. \
                         Dropping object s3://{}/{key}",
                        body.s3.bucket.name
                    );
                    metrics::counter!("DroppedObjectsDecodingErrors").increment(1);
                }
                Err(LogtapError::DeadlineApproaching) => {
                    error!(
                        "Unable to process log file s3://{}/{} with remaining execution time. \
                         {} total non-processed log files in batch",
                        body.s3.bucket.name,
                        body.s3.object.key,
                        event.records.len() - index
                    );
                    metrics::counter!("NotEnoughExecutionTimeRemainingErrors").increment(1);

                    for unprocessed in &event.records[index..] {
                        failed_ids.push(unprocessed.message_id.clone());
                    }
                    metrics::counter!("LogProcessingFailures")
                        .increment(failed_ids.len() as u64);
                    return FailureReport::from_ids(failed_ids);
                }
                Err(err) => {
                    error!("Error processing message {}: {err}", message.message_id);
                    failed_ids.push(message.message_id.clone());
                }
            }
        }

        metrics::counter!("LogProcessingFailures").increment(failed_ids.len() as u64);
        FailureReport::from_ids(failed_ids)
    }

    async fn process_notification(
        &mut self,
        body: &S3NotificationBody,
        clock: &dyn RemainingTime,
    ) -> Result<()> {
        let bucket = &body.s3.bucket.name;
        let key = &body.s3.object.key;

        let Some(forwarding_rule) =
            forwarding::get_matching_rule(&self.forwarding_rules, bucket, key)
        else {
            info!("Dropping object. s3://{bucket}/{key} doesn't match any forwarding rule");
            metrics::counter!("DroppedObjectsNotMatchingFwdRules").increment(1);
            return Ok(());
        };
        debug!(
            "Object s3://{bucket}/{key} matched log forwarding rule {}",
            forwarding_rule.name
        );

        let Some(processing_rule) = processing::lookup_rule(
            &self.processing_rules,
            forwarding_rule.source_kind,
            forwarding_rule.source_name.as_deref(),
            key,
        ) else {
            warn!(
                "Could not find a matching log processing rule for source {} and key {key}. \
                 Skipping...",
                forwarding_rule.source_kind
            );
            metrics::counter!("LogFilesSkipped").increment(1);
            return Ok(());
        };

        let mut destinations: Vec<String> = Vec::new();
        for sink_id in &forwarding_rule.sinks {
            if self.sinks.contains_key(sink_id) {
                destinations.push(sink_id.clone());
            } else {
                warn!(
                    "Invalid sink id {sink_id} defined on log forwarding rule {} in bucket {bucket}",
                    forwarding_rule.name
                );
            }
        }
        if destinations.is_empty() {
            error!(
                "There are no valid sinks defined in log forwarding rule {} in bucket {bucket}",
                forwarding_rule.name
            );
            metrics::counter!("LogFilesSkipped").increment(1);
            return Ok(());
        }
        for sink_id in &destinations {
            if let Some(sink) = self.sinks.get_mut(sink_id) {
                sink.set_source(bucket, key);
            }
        }

        let started = Instant::now();

        let object = self.store.fetch(bucket, key).await?;
        let mut entries = decoder::decode_object(object, DecodeSpec::from_rule(processing_rule), key);

        let key_attributes = processing_rule.attrs_from_key(key);
        let region = body.aws_region.clone().unwrap_or_default();
        let shape_context = ShapeContext {
            bucket,
            key,
            region: &region,
            forwarder_arn: &self.forwarder_arn,
            key_attributes: &key_attributes,
        };

        let mut num_entries: u64 = 0;
        while let Some(item) = entries.next().await {
            let entry = item?;

            num_entries += 1;
            if num_entries % DEADLINE_CHECK_INTERVAL == 0
                && clock.remaining_time_ms() <= MIN_REMAINING_TIME_MS
            {
                return Err(LogtapError::DeadlineApproaching);
            }

            if matches!(entry, RawEntry::HeaderSkipped) {
                continue;
            }
            let Some(record) =
                shape::shape_entry(processing_rule, forwarding_rule, &entry, &shape_context)
            else {
                continue;
            };

            for sink_id in &destinations {
                if let Some(sink) = self.sinks.get_mut(sink_id) {
                    sink.push(record.clone()).await?;
                }
            }
        }

        if num_entries == 0 {
            warn!(
                "Can't find log entries applying processing rule {} on s3://{bucket}/{key}",
                processing_rule.name
            );
            metrics::counter!("FilesWithInvalidLogEntries").increment(1);
        } else {
            debug!("Total log entries processed: {num_entries}");
        }

        for sink_id in &destinations {
            if let Some(sink) = self.sinks.get_mut(sink_id) {
                sink.flush().await?;
            }
        }

        metrics::counter!("LogFilesProcessed").increment(1);
        metrics::histogram!("LogProcessingTime").record(started.elapsed().as_secs_f64());
        Ok(())
    }
}
