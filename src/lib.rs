//! # logtap
//!
//! Rule-driven S3 log forwarding worker.
//!
//! ## Overview
//!
//! logtap consumes notifications describing newly created object-store
//! entries, and for each one:
//! - **Matches** the object against per-bucket forwarding rules and
//!   per-source processing rules
//! - **Streams** the object body, transparently gunzipping, into a lazy
//!   sequence of text lines or structured records
//! - **Enriches** every entry with extracted attributes (key-name regexes,
//!   line patterns, structured queries, timestamp normalization)
//! - **Ships** the enriched records to one or more log-ingest HTTP
//!   endpoints, in size-capped gzip batches with bounded retries
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use logtap::cmd::{run_worker, Cli};
//!
//! #[tokio::main]
//! async fn main() -> logtap::Result<()> {
//!     let cli = Cli::parse();
//!     let report = run_worker(&cli.event, cli.deadline_ms).await?;
//!     println!("{}", serde_json::to_string_pretty(&report)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Notifications → Matcher → Fetcher/Decoder → Extractor → Shaper → Sink Batcher → HTTP
//! ```
//!
//! The worker is deadline-aware: it processes as many notifications as it
//! can before the execution budget runs out, then reports the rest as
//! failed so the dispatcher retries them.

// Public API exports
pub use errors::{LogtapError, Result};

// Public modules
pub mod cmd;
pub mod config;
pub mod errors;
pub mod log;
pub mod pipeline;
pub mod record;
pub mod rules;
pub mod s3;
pub mod sink;
pub mod utils;
