//! Structured-object queries over log entries.
//!
//! Rule documents address fields with dotted paths (`userIdentity.type`,
//! `data.logs.events`). Segments may be double-quoted to address keys that
//! themselves contain dots (`"aws.log_group"`). Numeric segments index into
//! arrays.
//!
//! On top of paths, expressions support the small conditional subset the
//! built-in rules use: `&&` / `||` chains, `==` `!=` `<` `<=` `>` `>=`
//! comparisons, raw string literals in single quotes (`'WARN'`) and JSON
//! literals in backticks (`` `400` ``). `a && b` yields `b` when `a` is
//! truthy, else `a`; `a || b` yields the first truthy operand. Null, false,
//! and empty strings/arrays/objects are falsy. Ordering comparisons are
//! only defined for numbers and yield null otherwise.

use serde_json::Value;

/// Splits a dotted path into its segments, honoring double-quoted segments.
///
/// # Example
///
/// ```
/// use logtap::utils::query::parse_path;
///
/// assert_eq!(parse_path("a.b"), vec!["a", "b"]);
/// assert_eq!(parse_path("\"aws.log_group\""), vec!["aws.log_group"]);
/// ```
pub fn parse_path(expression: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in expression.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '.' if !in_quotes => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);
    segments
}

/// Evaluates a query expression against a structured entry.
///
/// Returns `None` when the result is JSON null (missing paths included).
pub fn evaluate(expression: &str, entry: &Value) -> Option<Value> {
    let result = eval_or(expression, entry);
    if result.is_null() {
        None
    } else {
        Some(result)
    }
}

fn eval_or(expression: &str, entry: &Value) -> Value {
    let mut last = Value::Null;
    for part in split_top_level(expression, "||") {
        last = eval_and(part, entry);
        if is_truthy(&last) {
            return last;
        }
    }
    last
}

fn eval_and(expression: &str, entry: &Value) -> Value {
    let mut value = Value::Null;
    for part in split_top_level(expression, "&&") {
        value = eval_comparison(part, entry);
        if !is_truthy(&value) {
            return value;
        }
    }
    value
}

fn eval_comparison(expression: &str, entry: &Value) -> Value {
    match split_comparison(expression) {
        Some((lhs, operator, rhs)) => {
            let left = eval_operand(lhs, entry);
            let right = eval_operand(rhs, entry);
            compare(&left, operator, &right)
        }
        None => eval_operand(expression, entry),
    }
}

fn eval_operand(expression: &str, entry: &Value) -> Value {
    let expression = expression.trim();

    if expression.len() >= 2 && expression.starts_with('\'') && expression.ends_with('\'') {
        return Value::String(expression[1..expression.len() - 1].to_string());
    }
    if expression.len() >= 2 && expression.starts_with('`') && expression.ends_with('`') {
        return serde_json::from_str(&expression[1..expression.len() - 1])
            .unwrap_or(Value::Null);
    }

    eval_path(expression, entry)
}

fn eval_path(expression: &str, entry: &Value) -> Value {
    let mut current = entry;
    for segment in parse_path(expression) {
        current = match current {
            Value::Object(map) => match map.get(&segment) {
                Some(value) => value,
                None => return Value::Null,
            },
            Value::Array(items) => {
                let Some(value) = segment
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| items.get(index))
                else {
                    return Value::Null;
                };
                value
            }
            _ => return Value::Null,
        };
    }
    current.clone()
}

fn compare(left: &Value, operator: &str, right: &Value) -> Value {
    match operator {
        "==" => Value::Bool(left == right),
        "!=" => Value::Bool(left != right),
        _ => {
            let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
                return Value::Null;
            };
            let ordered = match operator {
                "<" => a < b,
                "<=" => a <= b,
                ">" => a > b,
                ">=" => a >= b,
                _ => return Value::Null,
            };
            Value::Bool(ordered)
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(_) => true,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Splits on a separator, ignoring occurrences inside quoted sections.
fn split_top_level<'e>(expression: &'e str, separator: &str) -> Vec<&'e str> {
    let separator = separator.as_bytes();
    let bytes = expression.as_bytes();
    let mut parts = Vec::new();
    let mut quote: Option<u8> = None;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' | b'`' => {
                quote = Some(c);
                i += 1;
            }
            _ if bytes[i..].starts_with(separator) => {
                parts.push(&expression[start..i]);
                i += separator.len();
                start = i;
            }
            _ => i += 1,
        }
    }
    parts.push(&expression[start..]);
    parts
}

/// Finds the first comparison operator outside quoted sections.
fn split_comparison(expression: &str) -> Option<(&str, &str, &str)> {
    let bytes = expression.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(open) = quote {
            if c == open {
                quote = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'\'' | b'"' | b'`' => {
                quote = Some(c);
                i += 1;
            }
            b'=' | b'!' if bytes.get(i + 1) == Some(&b'=') => {
                return Some((&expression[..i], &expression[i..i + 2], &expression[i + 2..]));
            }
            b'<' | b'>' => {
                let len = if bytes.get(i + 1) == Some(&b'=') { 2 } else { 1 };
                return Some((
                    &expression[..i],
                    &expression[i..i + len],
                    &expression[i + len..],
                ));
            }
            _ => i += 1,
        }
    }
    None
}
