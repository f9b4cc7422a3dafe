//! Enriched log records and the scalar attribute values they carry.

use crc::Crc;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;

/// Marker appended to content that exceeded the ingest limit.
pub const CONTENT_MARK_TRIMMED: &str = "[TRUNCATED]";

/// Maximum accepted length of the `content` field, in characters.
pub const CONTENT_MAX_LENGTH: usize = 8192;

// Fixed polynomial so fingerprints stay stable across releases.
const ATTRIBUTE_FINGERPRINT_CRC: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_ECMA_182);

/// A scalar attribute value.
///
/// Log-ingest records are flat maps of scalars; richer JSON shapes are
/// rejected when attributes are assembled so serialization can never fail on
/// a surprise type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl AttrValue {
    /// Converts a JSON value into a scalar attribute value.
    ///
    /// Returns `None` for null and for arrays/objects.
    pub fn from_json(value: &Value) -> Option<AttrValue> {
        match value {
            Value::Bool(b) => Some(AttrValue::Bool(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(AttrValue::Int(i))
                } else {
                    n.as_f64().map(AttrValue::Float)
                }
            }
            Value::String(s) => Some(AttrValue::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

/// Flat map of attribute names to scalar values, in insertion order.
pub type AttrMap = IndexMap<String, AttrValue>;

/// The unit delivered to a sink: content plus a flat attribute map.
///
/// Serializes flat, with `content` alongside the attributes.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    pub content: String,
    #[serde(flatten)]
    pub attributes: AttrMap,
}

impl Record {
    pub fn new(content: String, attributes: AttrMap) -> Self {
        Record {
            content,
            attributes,
        }
    }

    /// Truncates `content` to the ingest limit, appending the trimmed marker.
    ///
    /// Idempotent; returns `true` when content was actually trimmed.
    pub fn enforce_content_limit(&mut self) -> bool {
        if self.content.chars().count() <= CONTENT_MAX_LENGTH {
            return false;
        }
        let keep = CONTENT_MAX_LENGTH - CONTENT_MARK_TRIMMED.len();
        let mut trimmed: String = self.content.chars().take(keep).collect();
        trimmed.push_str(CONTENT_MARK_TRIMMED);
        self.content = trimmed;
        metrics::counter!("LogMessagesTrimmed").increment(1);
        true
    }

    /// Approximate wire size of this record within a JSON array payload:
    /// the compact encoding plus one comma separator.
    pub fn encoded_len(&self) -> Result<usize> {
        Ok(serde_json::to_vec(self)?.len() + 1)
    }
}

/// Stable 64-bit fingerprint of an attribute set.
///
/// Used in place of `content` when a rule strips it. Keys are hashed in
/// sorted order so the digest does not depend on extraction order.
pub fn attribute_fingerprint(attributes: &AttrMap) -> u64 {
    let mut keys: Vec<&String> = attributes.keys().collect();
    keys.sort();

    let mut digest = ATTRIBUTE_FINGERPRINT_CRC.digest();
    for key in keys {
        digest.update(key.as_bytes());
        digest.update(b"=");
        if let Ok(encoded) = serde_json::to_vec(&attributes[key]) {
            digest.update(&encoded);
        }
        digest.update(b"\n");
    }
    digest.finalize()
}
