//! Forwarding and processing rules: typed values, validation, loading, and
//! matching.

pub mod builtin;
pub mod forwarding;
pub mod patterns;
pub mod processing;

use serde::{Deserialize, Serialize};

pub use forwarding::{ForwardingRule, ForwardingRuleIndex};
pub use processing::{LogFormat, ProcessingRule, ProcessingRuleIndex};

/// The kind of source an object was produced by.
///
/// `aws` objects are matched against the built-in per-service rules by key
/// path; `custom` rules are addressed by name; `generic` is the catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Aws,
    Generic,
    Custom,
}

pub const AVAILABLE_SOURCE_KINDS: [SourceKind; 3] =
    [SourceKind::Aws, SourceKind::Generic, SourceKind::Custom];

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Aws => "aws",
            SourceKind::Generic => "generic",
            SourceKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn is_yaml_file(file_name: &str) -> bool {
    file_name.ends_with(".yaml") || file_name.ends_with(".yml")
}
