use thiserror::Error;
use tracing_subscriber::filter::FromEnvError;

/// Main error type for logtap operations
#[derive(Error, Debug)]
pub enum LogtapError {
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("Grok error: {0}")]
    GrokError(#[from] grok::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Tracing From Env Error: {0}")]
    FromEnvError(#[from] FromEnvError),

    #[error("Reqwest Middleware Error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Configuration source unavailable: {0}")]
    ConfigSourceUnavailable(String),

    #[error("Incorrect rule format: {0}")]
    IncorrectRuleFormat(String),

    #[error("Notification body is not valid JSON: {0}")]
    NotificationParseError(String),

    #[error("No valid sinks: {0}")]
    NoValidSinks(String),

    #[error("Log object contains non-UTF-8 text: {0}")]
    NonUtf8TextEntry(String),

    #[error("Malformed structured log entry: {0}")]
    MalformedStructuredEntry(String),

    #[error("Object fetch failed: {0}")]
    ObjectFetchError(String),

    #[error("Credential lookup failed: {0}")]
    CredentialError(String),

    #[error("Ingest endpoint throttled the request")]
    Throttled,

    #[error("Ingest endpoint usable space limit reached")]
    SpaceLimitReached,

    #[error("Ingestion failed with HTTP {status}: {body}")]
    IngestionFailure { status: u16, body: String },

    #[error("Not enough execution time remaining to keep processing")]
    DeadlineApproaching,
}

/// Convenience Result type that uses LogtapError
pub type Result<T> = std::result::Result<T, LogtapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LogtapError::ConfigError("missing url".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing url");
    }

    #[test]
    fn test_ingestion_failure_carries_status() {
        let err = LogtapError::IngestionFailure {
            status: 500,
            body: "boom".to_string(),
        };
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }
}
