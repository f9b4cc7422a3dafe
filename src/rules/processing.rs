//! Processing rules: how to parse a matched object and enrich its entries.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::appconfig::AppConfigClient;
use crate::config::{ConfigLocation, Settings};
use crate::errors::{LogtapError, Result};
use crate::record::{AttrMap, AttrValue};
use crate::rules::patterns::{compile_helper_regex, CompiledGrok};
use crate::rules::{builtin, is_yaml_file, SourceKind, AVAILABLE_SOURCE_KINDS};
use crate::utils::{cloudwatch, query, timestamp};

/// Processing rules indexed by source kind, then by name in load order.
pub type ProcessingRuleIndex = IndexMap<SourceKind, IndexMap<String, ProcessingRule>>;

/// Framing of the log entries inside an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
    JsonStream,
}

/// Key-set filter of the top-level bulk mapping.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    Include(HashSet<String>),
    Exclude(HashSet<String>),
}

impl KeyFilter {
    pub fn allows(&self, key: &str) -> bool {
        match self {
            KeyFilter::Include(keys) => keys.contains(key),
            KeyFilter::Exclude(keys) => !keys.contains(key),
        }
    }
}

/// Bulk mapping of enclosing-object keys onto prefixed/postfixed attributes.
#[derive(Debug, Clone)]
pub struct TopLevelMapping {
    pub prefix: String,
    pub postfix: String,
    pub filter: KeyFilter,
}

/// A raw log entry handed to the extractor.
#[derive(Debug, Clone, Copy)]
pub enum LogMessage<'a> {
    Text(&'a str),
    /// A structured entry; always a JSON object.
    Structured(&'a Value),
}

/// A single processing rule with all patterns compiled.
#[derive(Debug)]
pub struct ProcessingRule {
    pub name: String,
    pub source_kind: SourceKind,
    pub key_path_pattern: Regex,
    pub log_format: LogFormat,
    pub log_entries_key: Option<String>,
    pub filter_object_key: Option<String>,
    pub filter_object_value: Option<String>,
    pub annotations: IndexMap<String, AttrValue>,
    pub attr_from_key_name: IndexMap<String, Regex>,
    pub grok: Option<CompiledGrok>,
    pub query_expressions: IndexMap<String, String>,
    /// Query → attribute pairs inherited from the enclosing object into
    /// each sub-record of a `json_stream`.
    pub attrs_from_top_level_json: IndexMap<String, String>,
    pub attr_mapping_from_top_level_json: Option<TopLevelMapping>,
    pub skip_header_lines: usize,
    pub skip_content_attribute: bool,
}

/// Wire shape of a processing rule document.
#[derive(Debug, Deserialize)]
pub struct ProcessingRuleSpec {
    pub name: String,
    pub source_kind: SourceKind,
    pub key_path_pattern: String,
    pub log_format: LogFormat,
    #[serde(default)]
    pub log_entries_key: Option<String>,
    #[serde(default)]
    pub filter_object_key: Option<String>,
    #[serde(default)]
    pub filter_object_value: Option<String>,
    #[serde(default)]
    pub annotations: Option<IndexMap<String, AttrValue>>,
    #[serde(default)]
    pub attr_from_key_name: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub grok_pattern: Option<String>,
    #[serde(default)]
    pub query_expressions: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub attrs_from_top_level_json: Option<IndexMap<String, String>>,
    #[serde(default)]
    pub attr_mapping_from_top_level_json: Option<TopLevelMappingSpec>,
    #[serde(default)]
    pub skip_header_lines: Option<u32>,
    #[serde(default)]
    pub skip_content_attribute: bool,
}

#[derive(Debug, Deserialize)]
pub struct TopLevelMappingSpec {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub postfix: String,
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

impl TryFrom<TopLevelMappingSpec> for TopLevelMapping {
    type Error = LogtapError;

    fn try_from(spec: TopLevelMappingSpec) -> Result<Self> {
        let filter = match (spec.include, spec.exclude) {
            (Some(include), None) => KeyFilter::Include(include.into_iter().collect()),
            (None, Some(exclude)) => KeyFilter::Exclude(exclude.into_iter().collect()),
            _ => {
                return Err(LogtapError::IncorrectRuleFormat(
                    "attr_mapping_from_top_level_json must define exactly one of include or exclude"
                        .to_string(),
                ))
            }
        };
        Ok(TopLevelMapping {
            prefix: spec.prefix,
            postfix: spec.postfix,
            filter,
        })
    }
}

impl TryFrom<ProcessingRuleSpec> for ProcessingRule {
    type Error = LogtapError;

    fn try_from(spec: ProcessingRuleSpec) -> Result<Self> {
        let rule_name = spec.name.clone();
        let incorrect =
            |message: String| LogtapError::IncorrectRuleFormat(format!("rule {rule_name}: {message}"));

        let skip_header_lines = spec.skip_header_lines.unwrap_or(0) as usize;
        if skip_header_lines != 0 && spec.log_format != LogFormat::Text {
            return Err(incorrect(
                "skip_header_lines is only valid for text log format".to_string(),
            ));
        }

        if spec.attrs_from_top_level_json.is_some()
            && !(spec.log_format == LogFormat::JsonStream && spec.log_entries_key.is_some())
        {
            return Err(incorrect(
                "attrs_from_top_level_json is only valid for json_stream with sub-record entries"
                    .to_string(),
            ));
        }

        if spec.filter_object_key.is_some() && spec.filter_object_value.is_none() {
            return Err(incorrect(
                "filter_object_value is required when filter_object_key is set".to_string(),
            ));
        }

        let key_path_pattern = compile_helper_regex(&spec.key_path_pattern)
            .map_err(|err| incorrect(format!("invalid key_path_pattern: {err}")))?;

        let mut attr_from_key_name = IndexMap::new();
        for (attribute, pattern) in spec.attr_from_key_name.unwrap_or_default() {
            let compiled = compile_helper_regex(&pattern)
                .map_err(|err| incorrect(format!("invalid pattern for {attribute}: {err}")))?;
            attr_from_key_name.insert(attribute, compiled);
        }

        let grok = match spec.grok_pattern {
            Some(expression) => Some(
                CompiledGrok::compile(&expression)
                    .map_err(|err| incorrect(format!("invalid grok_pattern: {err}")))?,
            ),
            None => None,
        };

        let attr_mapping_from_top_level_json = spec
            .attr_mapping_from_top_level_json
            .map(TryInto::try_into)
            .transpose()?;

        Ok(ProcessingRule {
            name: spec.name,
            source_kind: spec.source_kind,
            key_path_pattern,
            log_format: spec.log_format,
            log_entries_key: spec.log_entries_key,
            filter_object_key: spec.filter_object_key,
            filter_object_value: spec.filter_object_value,
            annotations: spec.annotations.unwrap_or_default(),
            attr_from_key_name,
            grok,
            query_expressions: spec.query_expressions.unwrap_or_default(),
            attrs_from_top_level_json: spec.attrs_from_top_level_json.unwrap_or_default(),
            attr_mapping_from_top_level_json,
            skip_header_lines,
            skip_content_attribute: spec.skip_content_attribute,
        })
    }
}

impl ProcessingRule {
    /// Matches the object key against the rule's key-path pattern, anchored
    /// at the start of the key.
    pub fn matches_key(&self, key: &str) -> bool {
        self.key_path_pattern
            .find(key)
            .map(|m| m.start() == 0)
            .unwrap_or(false)
    }

    /// Extracts attributes from the object key name.
    pub fn attrs_from_key(&self, key: &str) -> AttrMap {
        let mut attributes = AttrMap::new();
        for (attribute, pattern) in &self.attr_from_key_name {
            if let Some(found) = pattern.find(key) {
                attributes.insert(attribute.clone(), AttrValue::from(found.as_str()));
            }
        }
        attributes
    }

    /// Runs the per-entry extraction pipeline: line-pattern captures,
    /// structured queries, top-level bulk mapping, timestamp normalization,
    /// CloudWatch derivation, and the rule's annotations, in that order.
    /// Later writers overwrite earlier ones for the same attribute.
    pub fn extract(&self, message: LogMessage<'_>, enclosing: Option<&Value>) -> AttrMap {
        let mut attributes = AttrMap::new();

        // Line-pattern captures also lift a text entry into a structured
        // view so queries can run against them.
        let mut lifted: Option<Value> = None;
        if let Some(grok) = &self.grok {
            match message {
                LogMessage::Text(line) => match grok.extract(line) {
                    Some(captured) => {
                        let mut map = serde_json::Map::new();
                        for (name, value) in &captured {
                            map.insert(name.clone(), attr_to_json(value));
                        }
                        attributes.extend(captured);
                        lifted = Some(Value::Object(map));
                    }
                    None => {
                        debug!(
                            "Line pattern did not match log message --> no attributes extracted"
                        );
                    }
                },
                LogMessage::Structured(_) => {
                    error!("Can't apply line pattern to a structured entry");
                }
            }
        }

        let structured: Option<&Value> = match message {
            LogMessage::Structured(value) => Some(value),
            LogMessage::Text(_) => lifted.as_ref(),
        };

        if let Some(json_message) = structured {
            for (attribute, expression) in &self.query_expressions {
                match query::evaluate(expression, json_message) {
                    Some(result) => match AttrValue::from_json(&result) {
                        Some(value) => {
                            attributes.insert(attribute.clone(), value);
                            // Rename-style mapping: drop the source-named
                            // field when the attribute name differs.
                            if attribute != expression {
                                attributes.shift_remove(expression);
                            }
                        }
                        None => {
                            debug!("Query expression {expression} produced a non-scalar value");
                        }
                    },
                    None => debug!("No matches for query expression {expression}"),
                }
            }
        }

        if let (Some(mapping), Some(enclosing_object)) = (
            &self.attr_mapping_from_top_level_json,
            enclosing.and_then(|value| value.as_object()),
        ) {
            for (key, value) in enclosing_object {
                if !mapping.filter.allows(key) {
                    continue;
                }
                if let Some(scalar) = AttrValue::from_json(value) {
                    attributes.insert(
                        format!("{}{}{}", mapping.prefix, key, mapping.postfix),
                        scalar,
                    );
                }
            }
        }

        if let Some(AttrValue::String(raw)) = attributes.get("timestamp_to_transform").cloned() {
            match timestamp::normalize_timestamp(&raw) {
                Some(normalized) => {
                    attributes.shift_remove("timestamp_to_transform");
                    attributes.insert("timestamp".to_string(), AttrValue::String(normalized));
                }
                None => warn!("Unable to convert string timestamp: {raw}"),
            }
        }

        if let Some(json_message) = structured {
            let log_group = query::evaluate("\"aws.log_group\"", json_message);
            let log_stream = query::evaluate("\"aws.log_stream\"", json_message);
            if let (Some(Value::String(log_group)), Some(Value::String(log_stream))) =
                (log_group, log_stream)
            {
                attributes.extend(cloudwatch::attributes_from_cloudwatch_logs(
                    &log_group,
                    &log_stream,
                ));
            }
        }

        for (attribute, value) in &self.annotations {
            attributes.insert(attribute.clone(), value.clone());
        }

        attributes
    }

}

fn attr_to_json(value: &AttrValue) -> Value {
    match value {
        AttrValue::Bool(b) => Value::Bool(*b),
        AttrValue::Int(i) => Value::from(*i),
        AttrValue::Float(f) => Value::from(*f),
        AttrValue::String(s) => Value::String(s.clone()),
    }
}

fn empty_index() -> ProcessingRuleIndex {
    AVAILABLE_SOURCE_KINDS
        .iter()
        .map(|kind| (*kind, IndexMap::new()))
        .collect()
}

fn merge_into(index: &mut ProcessingRuleIndex, overlay: ProcessingRuleIndex) {
    for (kind, rules) in overlay {
        index.entry(kind).or_default().extend(rules);
    }
}

/// Builds one processing rule from a YAML value, reporting rule-level
/// problems as `IncorrectRuleFormat`.
pub fn build_rule(value: serde_yaml::Value) -> Result<ProcessingRule> {
    let spec: ProcessingRuleSpec = serde_yaml::from_value(value)
        .map_err(|err| LogtapError::IncorrectRuleFormat(err.to_string()))?;
    spec.try_into()
}

/// Loads the built-in processing rules shipped with the crate.
pub fn built_in_rules() -> ProcessingRuleIndex {
    let mut index = empty_index();
    for (file_name, content) in builtin::BUILT_IN_RULES {
        match serde_yaml::from_str::<serde_yaml::Value>(content).map_err(Into::into).and_then(build_rule) {
            Ok(rule) => {
                index
                    .entry(rule.source_kind)
                    .or_default()
                    .insert(rule.name.clone(), rule);
            }
            Err(err) => {
                error!("Built-in processing rule {file_name} failed to load: {err}");
            }
        }
    }
    index
}

/// Loads processing rules: built-ins first, custom rules merged on top,
/// source kind by source kind.
///
/// An unreachable custom-rule source logs a warning and the worker continues
/// with built-ins only.
pub async fn load(settings: &Settings) -> Result<(ProcessingRuleIndex, Option<i64>)> {
    let mut index = built_in_rules();

    match load_custom(settings).await {
        Ok((custom, version)) => {
            merge_into(&mut index, custom);
            Ok((index, version))
        }
        Err(LogtapError::ConfigSourceUnavailable(message)) => {
            warn!("Unable to load custom processing rules ({message}); continuing with built-ins");
            Ok((index, None))
        }
        Err(other) => Err(other),
    }
}

async fn load_custom(settings: &Settings) -> Result<(ProcessingRuleIndex, Option<i64>)> {
    match settings.configuration_location {
        ConfigLocation::AwsAppConfig => {
            let deployment = settings.deployment_name.as_deref().ok_or_else(|| {
                LogtapError::ConfigError(
                    "DEPLOYMENT_NAME is required for aws-appconfig configuration".to_string(),
                )
            })?;
            let client = AppConfigClient::new(deployment)?;
            let document = client.get_configuration("log-processing-rules").await?;
            Ok((
                parse_rule_documents(&document.body),
                Some(document.version),
            ))
        }
        ConfigLocation::Local => {
            if settings.processing_rules_file.is_file() {
                info!(
                    "Loading custom log-processing-rules from {}",
                    settings.processing_rules_file.display()
                );
                let body = std::fs::read_to_string(&settings.processing_rules_file)?;
                Ok((parse_rule_documents(&body), None))
            } else if settings.processing_rules_path.is_dir() {
                Ok((load_from_dir(&settings.processing_rules_path), None))
            } else {
                Ok((empty_index(), None))
            }
        }
    }
}

/// Loads one-rule-per-file YAML documents from a directory tree.
pub fn load_from_dir(directory: &Path) -> ProcessingRuleIndex {
    info!("Loading log-processing-rules from {}", directory.display());

    let mut index = empty_index();

    let mut file_paths: Vec<_> = walkdir::WalkDir::new(directory)
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(is_yaml_file)
                .unwrap_or(false)
        })
        .collect();
    file_paths.sort();

    for path in file_paths {
        let loaded = std::fs::read_to_string(&path)
            .map_err(LogtapError::from)
            .and_then(|content| Ok(serde_yaml::from_str::<serde_yaml::Value>(&content)?))
            .and_then(build_rule);
        match loaded {
            Ok(rule) => {
                index
                    .entry(rule.source_kind)
                    .or_default()
                    .insert(rule.name.clone(), rule);
            }
            Err(err) => {
                warn!(
                    "Skipping invalid processing rule file {}: {err}",
                    path.display()
                );
            }
        }
    }

    index
}

/// Parses a multi-document YAML stream of processing rules.
pub fn parse_rule_documents(body: &str) -> ProcessingRuleIndex {
    let mut index = empty_index();

    for (position, document) in serde_yaml::Deserializer::from_str(body).enumerate() {
        let value = match serde_yaml::Value::deserialize(document) {
            Ok(value) => value,
            Err(err) => {
                warn!("Encountered an error while parsing log-processing-rules: {err}");
                break;
            }
        };
        if value.is_null() {
            warn!("Skipping empty log processing rule {position}");
            continue;
        }
        match build_rule(value) {
            Ok(rule) => {
                index
                    .entry(rule.source_kind)
                    .or_default()
                    .insert(rule.name.clone(), rule);
            }
            Err(err) => {
                warn!("Skipping invalid processing rule {position}: {err}");
            }
        }
    }

    index
}

/// Selects the processing rule for a matched forwarding rule.
///
/// `generic`/`custom` sources are addressed by name; `aws` sources are
/// matched against the per-service key-path patterns in load order. Every
/// miss falls back to `generic/generic`.
pub fn lookup_rule<'a>(
    index: &'a ProcessingRuleIndex,
    source_kind: SourceKind,
    source_name: Option<&str>,
    key: &str,
) -> Option<&'a ProcessingRule> {
    match source_kind {
        SourceKind::Generic | SourceKind::Custom => {
            let name = source_name.unwrap_or(SourceKind::Generic.as_str());
            match index.get(&source_kind).and_then(|rules| rules.get(name)) {
                Some(rule) => {
                    debug!("Matched log processing rule {source_kind}.{name}");
                    Some(rule)
                }
                None => {
                    warn!(
                        "No matching log processing rule for {source_kind}.{name}. \
                         Defaulting to 'generic' log ingestion."
                    );
                    generic_rule(index)
                }
            }
        }
        SourceKind::Aws => {
            if let Some(rule) = index
                .get(&SourceKind::Aws)
                .and_then(|rules| rules.values().find(|rule| rule.matches_key(key)))
            {
                debug!("Matched aws log processing rule {}", rule.name);
                return Some(rule);
            }
            warn!(
                "Couldn't find a matching aws processing rule for {key}. \
                 Defaulting to generic ingestion."
            );
            generic_rule(index)
        }
    }
}

fn generic_rule(index: &ProcessingRuleIndex) -> Option<&ProcessingRule> {
    index
        .get(&SourceKind::Generic)
        .and_then(|rules| rules.get(SourceKind::Generic.as_str()))
}
