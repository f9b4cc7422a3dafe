//! Command-line interface and worker bootstrap.
//!
//! `logtap-run` replays a notification-batch JSON file against the worker
//! with a synthetic execution deadline and prints the resulting failure
//! report, mirroring how the production dispatcher invokes the library.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indexmap::IndexMap;
use tracing::info;

use crate::config::{self, Settings};
use crate::errors::Result;
use crate::pipeline::run::{Forwarder, NotificationBatch};
use crate::pipeline::DeadlineClock;
use crate::rules::{forwarding, processing};
use crate::s3::S3ObjectStore;
use crate::sink::credentials::{SsmTokenCache, TokenProvider};
use crate::sink::LogSink;

/// Command-line interface structure for the logtap worker.
#[derive(Parser, Debug)]
#[command(
    name = "logtap-run",
    version,
    about = "Forward object-store log files to log-ingest endpoints.",
    long_about = "Forward object-store log files to log-ingest endpoints.\n\
Rule-driven S3 log forwarding worker.\n\n\
Resources:\n  • Forwarding rules: per-bucket YAML declaring what to forward and where\n  • Processing rules: how to decode and enrich each object's entries\n  • Sinks: discovered from DYNATRACE_<ID>_ENV_URL / _API_KEY_PARAM env pairs\n  • Execution: notification batch JSON → decode → enrich → batched ingest POSTs"
)]
pub struct Cli {
    /// Path to a notification-batch JSON file ({"Records": [...]}).
    #[arg(long = "event", short = 'e', value_name = "FILE")]
    pub event: String,

    /// Synthetic execution budget for the invocation, in milliseconds.
    #[arg(long = "deadline-ms", value_name = "MS", default_value_t = 300_000)]
    pub deadline_ms: u64,

    /// Emit logs in JSON format.
    #[arg(long = "log-json")]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    ///
    /// Example: info,warn,debug
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// Loads rules and sinks, runs the worker over the event file, and returns
/// the failure report.
pub async fn run_worker(event_path: &str, deadline_ms: u64) -> Result<crate::pipeline::run::FailureReport> {
    let settings = Settings::from_env()?;

    let (forwarding_rules, forwarding_version) = forwarding::load(&settings).await?;
    info!(
        "Loaded log-forwarding-rules version {:?} for {} bucket(s)",
        forwarding_version,
        forwarding_rules.len()
    );

    let (processing_rules, processing_version) = processing::load(&settings).await?;
    info!(
        "Loaded log-processing-rules version {:?}",
        processing_version
    );

    let aws_config = aws_config::load_from_env().await;
    let tokens: Arc<dyn TokenProvider> =
        Arc::new(SsmTokenCache::new(aws_sdk_ssm::Client::new(&aws_config)));

    let mut sinks = IndexMap::new();
    for sink_settings in config::discover_sink_settings(settings.verify_tls) {
        let sink = LogSink::new(&sink_settings, Arc::clone(&tokens))?;
        sinks.insert(sink_settings.id.clone(), sink);
    }
    info!("Configured {} sink(s)", sinks.len());

    let store = Arc::new(S3ObjectStore::new(aws_sdk_s3::Client::new(&aws_config)));

    let mut forwarder = Forwarder::new(
        forwarding_rules,
        processing_rules,
        sinks,
        store,
        settings.forwarder_arn.clone(),
    );

    let event_raw = std::fs::read_to_string(event_path)?;
    let event: NotificationBatch = serde_json::from_str(&event_raw)?;
    info!("Processing {} notification(s)", event.records.len());

    let clock = DeadlineClock::new(Duration::from_millis(deadline_ms));
    Ok(forwarder.handle_event(&event, &clock).await)
}
