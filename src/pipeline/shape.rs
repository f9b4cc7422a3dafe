//! Record assembly: raw entry + rule + context → enriched record.

use serde_json::Value;
use tracing::warn;

use crate::pipeline::decoder::RawEntry;
use crate::record::{attribute_fingerprint, AttrMap, AttrValue, Record};
use crate::rules::processing::{LogMessage, ProcessingRule};
use crate::rules::ForwardingRule;
use crate::utils::query;

/// Per-object context merged into every record.
pub struct ShapeContext<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    /// Region reported by the notification; fallback for `aws.region`.
    pub region: &'a str,
    pub forwarder_arn: &'a str,
    /// Key-name extraction output, computed once per object.
    pub key_attributes: &'a AttrMap,
}

/// Assembles the enriched record for one raw entry.
///
/// Returns `None` for structured entries that are not objects; those are
/// counted and skipped without failing the notification.
pub fn shape_entry(
    rule: &ProcessingRule,
    forwarding_rule: &ForwardingRule,
    entry: &RawEntry,
    context: &ShapeContext<'_>,
) -> Option<Record> {
    let mut attributes = AttrMap::new();

    for (attribute, value) in &forwarding_rule.annotations {
        attributes.insert(attribute.clone(), AttrValue::String(value.clone()));
    }

    attributes.insert(
        "log.source.bucket".to_string(),
        AttrValue::from(context.bucket),
    );
    attributes.insert("log.source.key".to_string(), AttrValue::from(context.key));
    attributes.insert(
        "cloud.log_forwarder".to_string(),
        AttrValue::from(context.forwarder_arn),
    );

    for (attribute, value) in context.key_attributes {
        attributes.insert(attribute.clone(), value.clone());
    }

    let extracted = match entry {
        RawEntry::Line(line) => rule.extract(LogMessage::Text(line), None),
        RawEntry::Object(value) => {
            if !value.is_object() {
                warn!("Log entry is not an object");
                metrics::counter!("FilesWithInvalidLogEntries").increment(1);
                return None;
            }
            rule.extract(LogMessage::Structured(value), None)
        }
        RawEntry::SubRecord { record, enclosing } => {
            if !record.is_object() {
                warn!("Log entry is not an object");
                metrics::counter!("FilesWithInvalidLogEntries").increment(1);
                return None;
            }

            // Lift inherited top-level fields into the sub-record under
            // their attribute names, so extraction (and the CloudWatch
            // derivation in particular) sees them alongside the record's
            // own fields.
            let mut lifted = record.clone();
            if let Some(lifted_object) = lifted.as_object_mut() {
                for (source, attribute) in &rule.attrs_from_top_level_json {
                    if let Some(inherited) = query::evaluate(source, enclosing.as_ref()) {
                        if let Some(scalar) = AttrValue::from_json(&inherited) {
                            attributes.insert(attribute.clone(), scalar);
                        }
                        lifted_object.insert(attribute.clone(), inherited);
                    }
                }
            }
            rule.extract(LogMessage::Structured(&lifted), Some(enclosing.as_ref()))
        }
        RawEntry::HeaderSkipped => return None,
    };

    for (attribute, value) in extracted {
        attributes.insert(attribute, value);
    }

    if !attributes.contains_key("aws.region") && !context.region.is_empty() {
        attributes.insert("aws.region".to_string(), AttrValue::from(context.region));
    }

    // An extraction-produced content attribute wins over the generic
    // encoding of the entry.
    let content = match attributes.shift_remove("content") {
        Some(AttrValue::String(content)) => content,
        Some(other) => scalar_to_string(&other),
        None => match entry {
            RawEntry::Line(line) => line.clone(),
            RawEntry::Object(value) => compact_json(value),
            RawEntry::SubRecord { record, .. } => compact_json(record),
            RawEntry::HeaderSkipped => return None,
        },
    };

    let mut record = Record::new(content, attributes);
    record.enforce_content_limit();

    if rule.skip_content_attribute {
        record.content = attribute_fingerprint(&record.attributes).to_string();
    }

    Some(record)
}

fn compact_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn scalar_to_string(value: &AttrValue) -> String {
    match value {
        AttrValue::String(s) => s.clone(),
        AttrValue::Int(i) => i.to_string(),
        AttrValue::Float(f) => f.to_string(),
        AttrValue::Bool(b) => b.to_string(),
    }
}
