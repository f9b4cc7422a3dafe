//! API-token lookup against the credential service, with a short-lived
//! in-process cache.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::errors::{LogtapError, Result};

/// How long a fetched token stays valid in the cache.
pub const TOKEN_CACHE_TTL: Duration = Duration::from_secs(120);

/// Source of sink API tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, parameter_name: &str) -> Result<String>;
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Token provider backed by the SSM parameter store. Parameters are fetched
/// decrypted and cached process-wide for [`TOKEN_CACHE_TTL`].
pub struct SsmTokenCache {
    ssm: aws_sdk_ssm::Client,
    ttl: Duration,
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl SsmTokenCache {
    pub fn new(client: aws_sdk_ssm::Client) -> Self {
        SsmTokenCache {
            ssm: client,
            ttl: TOKEN_CACHE_TTL,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        SsmTokenCache::new(aws_sdk_ssm::Client::new(&config))
    }
}

#[async_trait]
impl TokenProvider for SsmTokenCache {
    async fn get_token(&self, parameter_name: &str) -> Result<String> {
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.get(parameter_name) {
            if cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.value.clone());
            }
        }

        let response = self
            .ssm
            .get_parameter()
            .name(parameter_name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|err| LogtapError::CredentialError(format!("{parameter_name}: {err}")))?;

        let value = response
            .parameter()
            .and_then(|parameter| parameter.value())
            .ok_or_else(|| {
                LogtapError::CredentialError(format!("parameter {parameter_name} has no value"))
            })?
            .to_string();

        entries.insert(
            parameter_name.to_string(),
            CachedToken {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }
}

/// Fixed-token provider for local runs and tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenProvider {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _parameter_name: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}
