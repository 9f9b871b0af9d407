//! Best-effort typing of free-text field values
//!
//! Precedence is fixed: boolean keywords, then integer, then decimal, then raw text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A typed value accumulated from free-text entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Decimal(f64),
    Text(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Decimal(v) => write!(f, "{v}"),
            FieldValue::Text(v) => f.write_str(v),
        }
    }
}

const TRUE_KEYWORDS: [&str; 4] = ["true", "1", "yes", "да"];
const FALSE_KEYWORDS: [&str; 4] = ["false", "0", "no", "нет"];

/// Parse one value. "1" and "0" are booleans, not integers.
pub fn parse_auto_type(raw: &str) -> FieldValue {
    let val = raw.trim();
    let lower = val.to_lowercase();

    if TRUE_KEYWORDS.contains(&lower.as_str()) {
        return FieldValue::Bool(true);
    }
    if FALSE_KEYWORDS.contains(&lower.as_str()) {
        return FieldValue::Bool(false);
    }
    if let Ok(v) = val.parse::<i64>() {
        return FieldValue::Int(v);
    }
    // "inf" and "nan" parse as f64 but are kept as text
    if let Ok(v) = val.parse::<f64>() {
        if v.is_finite() {
            return FieldValue::Decimal(v);
        }
    }
    FieldValue::Text(val.to_string())
}

/// One comma-separated value as typed, with its parsed form
#[derive(Debug, Clone, PartialEq)]
pub struct EnteredField {
    /// Trimmed input
    pub raw: String,
    pub value: FieldValue,
}

impl EnteredField {
    pub fn parse(raw: &str) -> Self {
        Self {
            raw: raw.trim().to_string(),
            value: parse_auto_type(raw),
        }
    }
}

/// Split a comma-separated entry into typed values
pub fn split_values(input: &str) -> Vec<EnteredField> {
    input.split(',').map(EnteredField::parse).collect()
}
