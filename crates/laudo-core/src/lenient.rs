//! Tolerant deserializers for values typed into form inputs
//!
//! Browsers hand back whatever the input held: numbers arrive as strings,
//! cleared inputs as `""`, currency as `"R$ 1.234,56"`. These helpers accept
//! all of that instead of rejecting an entire save.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Parse a decimal or amount typed by a user.
///
/// An optional `R$` prefix is ignored. Values containing a comma are read as
/// pt-BR (`1.234,56`); anything else is parsed as-is (`3.5`, `4500.50`).
pub fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_start_matches("R$").trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains(',') {
        return parse_currency(trimmed);
    }
    trimmed.parse().ok().filter(|v: &f64| v.is_finite())
}

/// Parse a pt-BR currency string, with or without the `R$` prefix.
///
/// Dots are thousands separators and the comma is the decimal mark.
pub fn parse_currency(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '.')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok().filter(|v: &f64| v.is_finite())
}

/// Deserialize free text, coercing numbers and booleans and treating `null`
/// as empty.
pub fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected text, found {}",
            kind(&other)
        ))),
    }
}

/// Like [`text`], but `null` and blank strings become `None`.
pub fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = text(deserializer)?;
    Ok(if value.trim().is_empty() {
        None
    } else {
        Some(value)
    })
}

/// Deserialize an optional number from a number, a numeric string, `""` or
/// `null`. Unparsable strings are dropped rather than failing the document.
pub fn number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_f64()),
        Value::String(s) => {
            let parsed = parse_decimal(&s);
            if parsed.is_none() && !s.trim().is_empty() {
                tracing::warn!("Dropping unparsable number {:?}", s);
            }
            Ok(parsed)
        }
        Value::Bool(_) => Ok(None),
        other => Err(serde::de::Error::custom(format!(
            "expected a number, found {}",
            kind(&other)
        ))),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
