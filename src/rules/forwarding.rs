//! Forwarding rules: which objects to forward, and to which sinks.

use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::appconfig::AppConfigClient;
use crate::config::{ConfigLocation, Settings};
use crate::errors::{LogtapError, Result};
use crate::rules::{is_yaml_file, SourceKind};

/// Forwarding rules indexed by bucket, then by rule name in document order.
pub type ForwardingRuleIndex = IndexMap<String, IndexMap<String, ForwardingRule>>;

/// Bucket name rules fall back to when the notification's bucket carries no
/// rules of its own.
pub const DEFAULT_BUCKET: &str = "default";

/// A single forwarding rule.
#[derive(Debug)]
pub struct ForwardingRule {
    pub name: String,
    pub key_pattern: Regex,
    pub source_kind: SourceKind,
    pub source_name: Option<String>,
    pub annotations: IndexMap<String, String>,
    /// Sink ids every record of a matched object is delivered to.
    pub sinks: Vec<String>,
}

impl ForwardingRule {
    /// Tests the rule's key pattern against an object key. The match is
    /// anchored at the start of the key.
    pub fn matches_key(&self, key: &str) -> bool {
        self.key_pattern
            .find(key)
            .map(|m| m.start() == 0)
            .unwrap_or(false)
    }
}

/// Wire shape of one forwarding rule inside a rule document.
#[derive(Debug, Deserialize)]
pub struct ForwardingRuleSpec {
    pub name: String,
    pub key_pattern: String,
    pub source_kind: SourceKind,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub annotations: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub sinks: Option<Vec<String>>,
}

impl TryFrom<ForwardingRuleSpec> for ForwardingRule {
    type Error = LogtapError;

    fn try_from(spec: ForwardingRuleSpec) -> Result<Self> {
        let source_name = match spec.source_kind {
            SourceKind::Aws => {
                if spec.source_name.is_some() {
                    return Err(LogtapError::IncorrectRuleFormat(format!(
                        "rule {}: source_name must not be set for aws sources",
                        spec.name
                    )));
                }
                None
            }
            SourceKind::Custom => Some(spec.source_name.ok_or_else(|| {
                LogtapError::IncorrectRuleFormat(format!(
                    "rule {}: source_name is required when source_kind is custom",
                    spec.name
                ))
            })?),
            SourceKind::Generic => Some(
                spec.source_name
                    .unwrap_or_else(|| SourceKind::Generic.as_str().to_string()),
            ),
        };

        let key_pattern = Regex::new(&spec.key_pattern).map_err(|err| {
            LogtapError::IncorrectRuleFormat(format!(
                "rule {}: invalid key_pattern: {err}",
                spec.name
            ))
        })?;

        let sinks = match spec.sinks {
            None => vec!["1".to_string()],
            Some(sinks) if sinks.is_empty() => {
                return Err(LogtapError::IncorrectRuleFormat(format!(
                    "rule {}: sinks must not be empty",
                    spec.name
                )))
            }
            Some(sinks) => sinks,
        };

        Ok(ForwardingRule {
            name: spec.name,
            key_pattern,
            source_kind: spec.source_kind,
            source_name,
            annotations: spec.annotations.unwrap_or_default(),
            sinks,
        })
    }
}

/// Loads forwarding rules from the configured source.
///
/// Returns the index plus the configuration version (`None` for local
/// sources). A forwarding-rule source that cannot be reached at all is a
/// startup failure.
pub async fn load(settings: &Settings) -> Result<(ForwardingRuleIndex, Option<i64>)> {
    match settings.configuration_location {
        ConfigLocation::AwsAppConfig => {
            let deployment = settings.deployment_name.as_deref().ok_or_else(|| {
                LogtapError::ConfigError(
                    "DEPLOYMENT_NAME is required for aws-appconfig configuration".to_string(),
                )
            })?;
            let client = AppConfigClient::new(deployment)?;
            let document = client.get_configuration("log-forwarding-rules").await?;
            Ok((
                parse_rule_documents(&document.body),
                Some(document.version),
            ))
        }
        ConfigLocation::Local => {
            Ok((load_from_dir(&settings.forwarding_rules_path)?, None))
        }
    }
}

/// Loads forwarding rules from a directory of per-bucket YAML files.
///
/// The file stem is the bucket name; the content is a sequence of rule
/// objects. Invalid rules and invalid files are skipped; an unreadable
/// directory is `ConfigSourceUnavailable`.
pub fn load_from_dir(directory: &Path) -> Result<ForwardingRuleIndex> {
    info!("Loading log-forwarding-rules from {}", directory.display());

    let entries = std::fs::read_dir(directory).map_err(|err| {
        LogtapError::ConfigSourceUnavailable(format!(
            "cannot read forwarding rules directory {}: {err}",
            directory.display()
        ))
    })?;

    let mut file_paths = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let is_rule_file = path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .map(is_yaml_file)
                .unwrap_or(false);
        if is_rule_file {
            file_paths.push(path);
        }
    }
    file_paths.sort();

    let mut index = ForwardingRuleIndex::new();

    for path in file_paths {
        let Some(bucket) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                warn!("Failed to read rule file {}: {err}", path.display());
                continue;
            }
        };

        let rule_values: Vec<serde_yaml::Value> = match serde_yaml::from_str(&content) {
            Ok(values) => values,
            Err(err) => {
                warn!(
                    "Invalid forwarding rules file {}: not a sequence of rules: {err}",
                    path.display()
                );
                continue;
            }
        };

        let bucket_rules = index.entry(bucket.to_string()).or_default();
        for value in rule_values {
            match build_rule(value) {
                Ok(rule) => {
                    debug!("Loaded forwarding rule {} for bucket {bucket}", rule.name);
                    bucket_rules.insert(rule.name.clone(), rule);
                }
                Err(err) => {
                    warn!("Skipping incorrect forwarding rule in {}: {err}", path.display());
                }
            }
        }
    }

    Ok(index)
}

/// Parses a multi-document YAML stream of
/// `{bucket_name, log_forwarding_rules: [...]}` documents, as served by the
/// remote configuration source.
pub fn parse_rule_documents(body: &str) -> ForwardingRuleIndex {
    let mut index = ForwardingRuleIndex::new();

    for (position, document) in serde_yaml::Deserializer::from_str(body).enumerate() {
        let value = match serde_yaml::Value::deserialize(document) {
            Ok(value) => value,
            Err(err) => {
                warn!("Encountered an error while parsing log-forwarding-rules: {err}");
                break;
            }
        };
        if value.is_null() {
            warn!("Skipping empty log forwarding rule document {position}");
            continue;
        }

        let Some(bucket) = value
            .get("bucket_name")
            .and_then(|bucket| bucket.as_str())
            .map(str::to_string)
        else {
            warn!("Forwarding rule document {position} is missing bucket_name");
            continue;
        };

        let Some(rule_values) = value
            .get("log_forwarding_rules")
            .and_then(|rules| rules.as_sequence())
            .cloned()
        else {
            warn!("Forwarding rule document {position} for bucket {bucket} has no rule list");
            continue;
        };

        info!("Loading log-forwarding-rules for S3 bucket: {bucket}");
        let bucket_rules = index.entry(bucket.clone()).or_default();
        for rule_value in rule_values {
            match build_rule(rule_value) {
                Ok(rule) => {
                    bucket_rules.insert(rule.name.clone(), rule);
                }
                Err(err) => {
                    warn!("{bucket}: skipping incorrect forwarding rule: {err}");
                }
            }
        }
    }

    index
}

fn build_rule(value: serde_yaml::Value) -> Result<ForwardingRule> {
    let spec: ForwardingRuleSpec = serde_yaml::from_value(value)
        .map_err(|err| LogtapError::IncorrectRuleFormat(err.to_string()))?;
    spec.try_into()
}

/// Returns the first rule whose key pattern matches, testing the bucket's
/// rules in document order, or the `default` pseudo-bucket's rules when the
/// bucket has none at all.
pub fn get_matching_rule<'a>(
    index: &'a ForwardingRuleIndex,
    bucket: &str,
    key: &str,
) -> Option<&'a ForwardingRule> {
    match index.get(bucket) {
        Some(bucket_rules) => bucket_rules.values().find(|rule| rule.matches_key(key)),
        None => index
            .get(DEFAULT_BUCKET)
            .and_then(|default_rules| default_rules.values().find(|rule| rule.matches_key(key))),
    }
}
