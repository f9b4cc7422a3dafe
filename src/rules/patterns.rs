//! Shared pattern machinery for rule compilation.
//!
//! Rule documents reference a table of helper sub-patterns by name
//! (`{aws_account_id_pattern}`, `{aws_region_pattern}`, ...) so individual
//! rules stay readable. Substitution happens once, when a rule is compiled.
//!
//! Line-pattern extraction uses grok. Capture aliases may carry an `:int` or
//! `:float` suffix requesting numeric coercion of the captured text; the
//! suffix is stripped before compilation and remembered per alias.

use std::collections::HashMap;

use grok::Grok;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::errors::Result;
use crate::record::{AttrMap, AttrValue};

/// Helper sub-patterns usable as `{name}` placeholders in key patterns and
/// key-name extraction regexes.
pub static HELPER_PATTERNS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("aws_logs_prefix", "AWSLogs"),
        ("aws_account_id_pattern", r"\d{12}"),
        ("year_pattern", r"[2]\d{3}"),
        ("month_pattern", r"(0[1-9]|1[012])"),
        ("day_pattern", r"(0[1-9]|[12][0-9]|3[01])"),
        ("hour_pattern", r"([0][0-9]|[1][0-9]|[2][0-3])"),
        ("minutes_pattern", r"[0-5][0-9]"),
        (
            "aws_region_pattern",
            r"(us(-gov)?|ap|ca|cn|eu|sa|me|af)-(central|((north(east|west)?|south(east|west)?)|(east|west)))-\d{1}",
        ),
        (
            "classic_load_balancer_id_pattern",
            r"[a-zA-Z0-9][a-zA-Z0-9-]{0,30}[a-zA-Z0-9]",
        ),
        // ALB / NLB load balancer ids can be up to 48 chars, / is substituted with .
        (
            "elbv2_id_pattern",
            r"[a-zA-Z0-9][a-zA-Z0-9-.]{0,46}[a-zA-Z0-9]",
        ),
        (
            "ipv4_address_pattern",
            r"(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)",
        ),
        ("aws_resource_name_pattern", r"[a-zA-Z0-9-_]{1,128}"),
        ("vpc_id_pattern", r"vpc-[0-9a-f]{8}(?:[0-9a-f]{9})?"),
        ("cloudfront_distribution_id_pattern", r"E[A-Z0-9]{13}"),
        ("vpc_flow_id_pattern", r"fl-[0-9a-f]{8}(?:[0-9a-f]{9})?"),
        (
            "aws_global_accelerator_id_pattern",
            r"[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}",
        ),
    ])
});

/// Grok pattern definitions not shipped with the stock pattern set.
pub const CUSTOM_GROK_DEFINITIONS: &[(&str, &str)] = &[
    // grab timestamp from CloudFront log (YYYY-mm-dd\tHH:MM:SS)
    (
        "CLOUDFRONTTIMESTAMP",
        "%{YEAR}-%{MONTHNUM}-%{MONTHDAY}%{SPACE}%{TIME}",
    ),
    // load balancer request URI, decomposed; URIHOST carries a nested port
    // capture
    (
        "ELBURI",
        "%{URIPROTO:proto}://(?:%{URIHOST:urihost})?(?:%{URIPATH:path})?(?:%{URIPARAM:params})?",
    ),
];

/// Replaces `{name}` helper placeholders with their sub-patterns.
///
/// Only known helper names are substituted; regex quantifier braces pass
/// through untouched.
pub fn substitute_helper_patterns(template: &str) -> String {
    let mut out = template.to_string();
    for (name, pattern) in HELPER_PATTERNS.iter() {
        let placeholder = format!("{{{name}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, pattern);
        }
    }
    out
}

/// Compiles a helper-substituted regular expression.
pub fn compile_helper_regex(template: &str) -> Result<Regex> {
    Ok(Regex::new(&substitute_helper_patterns(template))?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Coercion {
    Int,
    Float,
}

/// A compiled grok expression plus the per-alias numeric coercions that were
/// declared with `:int` / `:float` suffixes.
pub struct CompiledGrok {
    pattern: grok::Pattern,
    coercions: HashMap<String, Coercion>,
}

static TYPED_ALIAS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%\{(\w+):([A-Za-z0-9_]+):(int|float)\}").expect("typed alias regex is valid")
});

impl std::fmt::Debug for CompiledGrok {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGrok")
            .field("coercions", &self.coercions)
            .finish()
    }
}

impl CompiledGrok {
    /// Compiles a grok expression once, registering custom definitions and
    /// stripping the coercion suffixes.
    pub fn compile(expression: &str) -> Result<Self> {
        let mut coercions = HashMap::new();
        let stripped = TYPED_ALIAS_RE
            .replace_all(expression, |caps: &Captures<'_>| {
                let coercion = if &caps[3] == "int" {
                    Coercion::Int
                } else {
                    Coercion::Float
                };
                coercions.insert(caps[2].to_string(), coercion);
                format!("%{{{}:{}}}", &caps[1], &caps[2])
            })
            .into_owned();

        let mut grok = Grok::with_default_patterns();
        for (name, definition) in CUSTOM_GROK_DEFINITIONS {
            grok.add_pattern(*name, *definition);
        }
        let pattern = grok.compile(&stripped, true)?;

        Ok(CompiledGrok { pattern, coercions })
    }

    /// Applies the pattern to a line, returning the named captures.
    ///
    /// Returns `None` on non-match. Captures from non-participating groups
    /// are dropped. A capture that fails its declared coercion keeps the
    /// raw string.
    pub fn extract(&self, line: &str) -> Option<AttrMap> {
        let matches = self.pattern.match_against(line)?;

        let mut attributes = AttrMap::new();
        for (name, value) in matches.iter() {
            if value.is_empty() {
                continue;
            }
            let attr = match self.coercions.get(name) {
                Some(Coercion::Int) => value
                    .parse::<i64>()
                    .map(AttrValue::Int)
                    .unwrap_or_else(|_| AttrValue::from(value)),
                Some(Coercion::Float) => value
                    .parse::<f64>()
                    .map(AttrValue::Float)
                    .unwrap_or_else(|_| AttrValue::from(value)),
                None => AttrValue::from(value),
            };
            attributes.insert(name.to_string(), attr);
        }
        Some(attributes)
    }
}
