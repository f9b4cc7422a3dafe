//! Worker configuration, read from the environment at startup.

pub mod appconfig;

use std::path::PathBuf;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::errors::{LogtapError, Result};

pub const DEFAULT_FORWARDING_RULES_PATH: &str = "./config/log_forwarding_rules";
pub const DEFAULT_PROCESSING_RULES_PATH: &str = "./config/log_processing_rules";
pub const DEFAULT_PROCESSING_RULES_FILE: &str = "./config/log-processing-rules.yaml";

/// Where rule documents are loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigLocation {
    #[default]
    Local,
    AwsAppConfig,
}

impl FromStr for ConfigLocation {
    type Err = LogtapError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(ConfigLocation::Local),
            "aws-appconfig" => Ok(ConfigLocation::AwsAppConfig),
            other => Err(LogtapError::ConfigError(format!(
                "invalid LOG_FORWARDER_CONFIGURATION_LOCATION: {other}"
            ))),
        }
    }
}

/// Startup settings for the worker.
#[derive(Debug, Clone)]
pub struct Settings {
    pub configuration_location: ConfigLocation,
    pub forwarding_rules_path: PathBuf,
    pub processing_rules_path: PathBuf,
    pub processing_rules_file: PathBuf,
    pub deployment_name: Option<String>,
    /// Identity stamped on every record as `cloud.log_forwarder`.
    pub forwarder_arn: String,
    pub verify_tls: bool,
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self> {
        let configuration_location = match std::env::var("LOG_FORWARDER_CONFIGURATION_LOCATION") {
            Ok(value) => value.parse()?,
            Err(_) => ConfigLocation::Local,
        };

        Ok(Settings {
            configuration_location,
            forwarding_rules_path: std::env::var("LOG_FORWARDING_RULES_PATH")
                .unwrap_or_else(|_| DEFAULT_FORWARDING_RULES_PATH.to_string())
                .into(),
            processing_rules_path: std::env::var("LOG_PROCESSING_RULES_PATH")
                .unwrap_or_else(|_| DEFAULT_PROCESSING_RULES_PATH.to_string())
                .into(),
            processing_rules_file: DEFAULT_PROCESSING_RULES_FILE.into(),
            deployment_name: std::env::var("DEPLOYMENT_NAME").ok(),
            forwarder_arn: std::env::var("FORWARDER_FUNCTION_ARN")
                .unwrap_or_else(|_| "logtap-local".to_string()),
            verify_tls: std::env::var("VERIFY_DT_SSL_CERT")
                .map(|value| value != "false")
                .unwrap_or(true),
        })
    }
}

/// Connection settings for one log-ingest destination.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkSettings {
    pub id: String,
    pub environment_url: String,
    /// Name of the credential-service parameter holding the API token.
    pub api_key_parameter: String,
    pub verify_tls: bool,
}

static SINK_ENV_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^DYNATRACE_([A-Z0-9]+)_ENV_URL$").expect("sink env regex is valid"));

/// Discovers sink settings from `DYNATRACE_<ID>_ENV_URL` /
/// `DYNATRACE_<ID>_API_KEY_PARAM` environment variable pairs.
///
/// An URL without the matching API-key parameter is skipped with a warning.
pub fn discover_sink_settings(verify_tls: bool) -> Vec<SinkSettings> {
    let mut sinks = Vec::new();

    let mut vars: Vec<(String, String)> = std::env::vars().collect();
    vars.sort();

    for (name, value) in vars {
        let Some(captures) = SINK_ENV_URL_RE.captures(&name) else {
            continue;
        };
        let id = captures[1].to_string();
        match std::env::var(format!("DYNATRACE_{id}_API_KEY_PARAM")) {
            Ok(api_key_parameter) => sinks.push(SinkSettings {
                id,
                environment_url: value,
                api_key_parameter,
                verify_tls,
            }),
            Err(_) => warn!("No API key configured for sink id {id}"),
        }
    }

    sinks
}
