//! Pull client for the remote configuration endpoint.
//!
//! Configuration profiles are served over a local HTTP endpoint
//! (`http://localhost:2772`) that fronts AWS AppConfig. Every response
//! carries the profile body plus a monotonically increasing
//! `Configuration-Version` header.

use std::time::Duration;

use crate::errors::{LogtapError, Result};

pub const APPCONFIG_BASE_URL: &str = "http://localhost:2772";

const APPCONFIG_TIMEOUT: Duration = Duration::from_secs(5);

/// A pulled configuration profile.
#[derive(Debug, Clone)]
pub struct ConfigurationDocument {
    pub body: String,
    pub version: i64,
}

/// Client for the configuration endpoint of one deployment.
#[derive(Debug, Clone)]
pub struct AppConfigClient {
    http: reqwest::Client,
    base_url: String,
    application: String,
    environment: String,
}

impl AppConfigClient {
    /// Builds a client for the given deployment name. The application name
    /// is derived as `<deployment>-app-config`.
    pub fn new(deployment_name: &str) -> Result<Self> {
        Self::with_base_url(deployment_name, APPCONFIG_BASE_URL)
    }

    pub fn with_base_url(deployment_name: &str, base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(APPCONFIG_TIMEOUT)
            .build()?;

        Ok(AppConfigClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            application: format!("{deployment_name}-app-config"),
            environment: deployment_name.to_string(),
        })
    }

    /// Pulls one configuration profile by name.
    ///
    /// Network errors, non-2xx responses and a missing version header all
    /// map to `ConfigSourceUnavailable`.
    pub async fn get_configuration(&self, profile_name: &str) -> Result<ConfigurationDocument> {
        let url = format!(
            "{}/applications/{}/environments/{}/configurations/{}",
            self.base_url, self.application, self.environment, profile_name
        );

        let response = self.http.get(&url).send().await.map_err(|err| {
            LogtapError::ConfigSourceUnavailable(format!(
                "failed to pull configuration {profile_name}: {err}"
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LogtapError::ConfigSourceUnavailable(format!(
                "configuration endpoint returned HTTP {status} for {profile_name}"
            )));
        }

        let version = response
            .headers()
            .get("Configuration-Version")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| {
                LogtapError::ConfigSourceUnavailable(format!(
                    "configuration response for {profile_name} is missing Configuration-Version"
                ))
            })?;

        let body = response.text().await.map_err(|err| {
            LogtapError::ConfigSourceUnavailable(format!(
                "failed to read configuration body for {profile_name}: {err}"
            ))
        })?;

        Ok(ConfigurationDocument { body, version })
    }
}
