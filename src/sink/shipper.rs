//! HTTP shipper: compresses a batch and POSTs it to the log-ingest API,
//! classifying the response into an outcome for the pipeline driver.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use flate2::Compression;
use http::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::policies::ExponentialBackoff;
use reqwest_retry::{RetryTransientMiddleware, Retryable, RetryableStrategy};
use tracing::{debug, error, warn};

use crate::config::SinkSettings;
use crate::errors::{LogtapError, Result};
use crate::sink::credentials::TokenProvider;

pub const LOG_INGEST_URL_SUFFIX: &str = "/api/v2/logs/ingest";

const ENVIRONMENT_AG_URL_PART: &str = "/e/";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const READ_TIMEOUT: Duration = Duration::from_secs(12);
const MAX_RETRIES: u32 = 3;
const GZIP_LEVEL: u32 = 6;

/// Retry only on the throttling/space statuses; everything else is settled
/// by the first response, and transport errors surface immediately.
struct IngestRetryStrategy;

impl RetryableStrategy for IngestRetryStrategy {
    fn handle(
        &self,
        result: &reqwest_middleware::Result<reqwest::Response>,
    ) -> Option<Retryable> {
        match result {
            Ok(response) if matches!(response.status().as_u16(), 429 | 503) => {
                Some(Retryable::Transient)
            }
            Ok(_) => None,
            Err(_) => Some(Retryable::Fatal),
        }
    }
}

/// Shipper for one sink.
pub struct Shipper {
    http: ClientWithMiddleware,
    ingest_url: String,
    tenant_id: String,
    api_key_parameter: String,
    tokens: Arc<dyn TokenProvider>,
}

impl Shipper {
    pub fn new(settings: &SinkSettings, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .user_agent(format!("logtap/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()?;

        let backoff = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_secs(4))
            .build_with_max_retries(MAX_RETRIES);
        let http = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy_and_strategy(
                backoff,
                IngestRetryStrategy,
            ))
            .build();

        Ok(Shipper {
            http,
            ingest_url: format!(
                "{}{}",
                settings.environment_url.trim_end_matches('/'),
                LOG_INGEST_URL_SUFFIX
            ),
            tenant_id: extract_tenant_id_from_url(&settings.environment_url),
            api_key_parameter: settings.api_key_parameter.clone(),
            tokens,
        })
    }

    /// POSTs one serialized batch (a JSON array) with gzip compression and
    /// bounded retries, classifying the response per the ingest contract.
    pub async fn ship(&self, payload: &[u8], batch_num: u32, source: &str) -> Result<()> {
        let token = self.tokens.get_token(&self.api_key_parameter).await?;

        metrics::histogram!("UncompressedIngestPayloadSize").record(payload.len() as f64);

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(GZIP_LEVEL));
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        debug!(
            "{}: posting batch {batch_num} ({} bytes compressed)",
            self.tenant_id,
            compressed.len()
        );

        let started = Instant::now();
        let response = self
            .http
            .post(&self.ingest_url)
            .header(AUTHORIZATION, format!("Api-Token {token}"))
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header(CONTENT_ENCODING, "gzip")
            .body(compressed)
            .send()
            .await?;

        let outcome = self
            .classify(response, payload.len(), batch_num, source)
            .await;
        metrics::histogram!("IngestionTime").record(started.elapsed().as_secs_f64());
        outcome
    }

    async fn classify(
        &self,
        response: reqwest::Response,
        payload_len: usize,
        batch_num: u32,
        source: &str,
    ) -> Result<()> {
        let status = response.status().as_u16();
        match status {
            204 => {
                debug!(
                    "{}: successfully posted batch {batch_num}. Ingested {:.2} KB of log data",
                    self.tenant_id,
                    payload_len as f64 / 1024.0
                );
                metrics::counter!("IngestHTTP204").increment(1);
                Ok(())
            }
            200 => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "{}: parts of batch {batch_num} were not successfully posted: {body}. Source file: {source}",
                    self.tenant_id
                );
                metrics::counter!("IngestHTTP200").increment(1);
                Ok(())
            }
            400 => {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "{}: parts of batch {batch_num} were not successfully posted: {body}. Source file: {source}",
                    self.tenant_id
                );
                metrics::counter!("IngestHTTP400").increment(1);
                Ok(())
            }
            429 => {
                error!(
                    "{}: throttled by the ingest endpoint. Exhausted retry attempts. Source file: {source}",
                    self.tenant_id
                );
                metrics::counter!("IngestHTTP429").increment(1);
                Err(LogtapError::Throttled)
            }
            503 => {
                error!(
                    "{}: usable space limit reached. Exhausted retry attempts. Source file: {source}",
                    self.tenant_id
                );
                metrics::counter!("IngestHTTP503").increment(1);
                Err(LogtapError::SpaceLimitReached)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(
                    "{}: HTTP {status} error posting batch {batch_num}: {body}. Source file: {source}",
                    self.tenant_id
                );
                metrics::counter!("IngestHTTPOther").increment(1);
                Err(LogtapError::IngestionFailure { status, body })
            }
        }
    }
}

/// Extracts the tenant id from an environment URL, for diagnostics.
///
/// Managed URLs carry the tenant behind `/e/`; SaaS URLs carry it as the
/// first host label.
pub fn extract_tenant_id_from_url(environment_url: &str) -> String {
    if let Some(position) = environment_url.find(ENVIRONMENT_AG_URL_PART) {
        let start = position + ENVIRONMENT_AG_URL_PART.len();
        let rest = &environment_url[start..];
        let end = rest.find('/').unwrap_or(rest.len());
        rest[..end].to_string()
    } else {
        let start = environment_url
            .find("//")
            .map(|position| position + 2)
            .unwrap_or(0);
        let rest = &environment_url[start..];
        let end = rest.find('.').unwrap_or(rest.len());
        rest[..end].to_string()
    }
}
