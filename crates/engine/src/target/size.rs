//! Size predicates over attributes such as disk capacity.
//!
//! A predicate pattern is a size range or an exact size:
//!
//! ```text
//! size:10G:40G   at least 10G and at most 40G
//! size:50G:      at least 50G
//! size::60G      at most 60G
//! size:20G       exactly 20G
//! ```
//!
//! Units are powers of ten: `K`, `M`, `G`, `T`, each optionally followed by
//! `B`, case-insensitive. Attribute values may be numbers (bytes) or strings
//! such as `"20.00 GB"`.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static SIZE_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(\d+(?:\.\d+)?)\s*([kmgt]?)(b?)\s*$").expect("size literal regex should compile"));

const UNITS: [(u64, &str); 4] = [
    (1_000_000_000_000, "TB"),
    (1_000_000_000, "GB"),
    (1_000_000, "MB"),
    (1_000, "KB"),
];

/// Inclusive byte bounds of a size predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeBound {
    Between { low: u64, high: u64 },
    AtLeast(u64),
    AtMost(u64),
    Exactly(u64),
}

enum Side {
    Empty,
    Size(u64),
    Other,
}

impl SizeBound {
    /// Interprets an attribute pattern as a size predicate.
    ///
    /// Returns `Ok(None)` for patterns that are not size predicates (plain
    /// globs, including globs containing `:`), and an error for ranges that
    /// mix a size with something else or whose bounds are inverted.
    pub fn parse(pattern: &str) -> Result<Option<Self>, String> {
        let Some((low, high)) = pattern.split_once(':') else {
            return Ok(parse_bytes(pattern, true).map(SizeBound::Exactly));
        };

        match (side(low), side(high)) {
            (Side::Size(low), Side::Size(high)) if low > high => {
                Err(format!("size range '{pattern}' has a lower bound above its upper bound"))
            }
            (Side::Size(low), Side::Size(high)) => Ok(Some(SizeBound::Between { low, high })),
            (Side::Size(low), Side::Empty) => Ok(Some(SizeBound::AtLeast(low))),
            (Side::Empty, Side::Size(high)) => Ok(Some(SizeBound::AtMost(high))),
            (Side::Empty, Side::Empty) => Err("size range needs at least one bound".to_string()),
            (Side::Size(_), Side::Other) | (Side::Other, Side::Size(_)) => {
                Err(format!("'{pattern}' is not a valid size range"))
            }
            (Side::Other | Side::Empty, Side::Other | Side::Empty) => Ok(None),
        }
    }

    pub fn contains(self, bytes: u64) -> bool {
        match self {
            SizeBound::Between { low, high } => (low..=high).contains(&bytes),
            SizeBound::AtLeast(low) => bytes >= low,
            SizeBound::AtMost(high) => bytes <= high,
            SizeBound::Exactly(size) => bytes == size,
        }
    }

    /// Numbers are bytes, strings are size literals, lists match by any element.
    pub fn matches_value(self, value: &Value) -> bool {
        match value {
            Value::Number(number) => number
                .as_f64()
                .filter(|bytes| *bytes >= 0.0)
                .is_some_and(|bytes| self.contains(bytes.round() as u64)),
            Value::String(text) => parse_bytes(text, false).is_some_and(|bytes| self.contains(bytes)),
            Value::Array(items) => items.iter().any(|item| !item.is_array() && self.matches_value(item)),
            Value::Bool(_) | Value::Object(_) | Value::Null => false,
        }
    }
}

impl fmt::Display for SizeBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeBound::Between { low, high } => write!(f, "{}:{}", format_bytes(*low), format_bytes(*high)),
            SizeBound::AtLeast(low) => write!(f, "{}:", format_bytes(*low)),
            SizeBound::AtMost(high) => write!(f, ":{}", format_bytes(*high)),
            SizeBound::Exactly(size) => f.write_str(&format_bytes(*size)),
        }
    }
}

fn side(text: &str) -> Side {
    if text.is_empty() {
        return Side::Empty;
    }
    parse_bytes(text, true).map_or(Side::Other, Side::Size)
}

/// Parses `"10G"`, `"1.5 TB"` or `"512"` into bytes; `require_unit` rejects bare numbers.
fn parse_bytes(text: &str, require_unit: bool) -> Option<u64> {
    let captures = SIZE_LITERAL.captures(text)?;
    let number: f64 = captures.get(1)?.as_str().parse().ok()?;
    let prefix = captures.get(2).map_or("", |prefix| prefix.as_str());
    let byte_suffix = captures.get(3).is_some_and(|suffix| !suffix.as_str().is_empty());
    if require_unit && prefix.is_empty() && !byte_suffix {
        return None;
    }

    let multiplier = match prefix.to_ascii_uppercase().as_str() {
        "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => 1.0,
    };
    Some((number * multiplier).round() as u64)
}

fn format_bytes(bytes: u64) -> String {
    UNITS
        .iter()
        .find(|(multiplier, _)| bytes >= *multiplier)
        .map(|(multiplier, unit)| format!("{}{unit}", bytes as f64 / *multiplier as f64))
        .unwrap_or_else(|| format!("{bytes}B"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_all_four_forms() {
        assert_eq!(
            SizeBound::parse("10G:40GB"),
            Ok(Some(SizeBound::Between {
                low: 10_000_000_000,
                high: 40_000_000_000
            }))
        );
        assert_eq!(SizeBound::parse("50g:"), Ok(Some(SizeBound::AtLeast(50_000_000_000))));
        assert_eq!(SizeBound::parse(":1.5T"), Ok(Some(SizeBound::AtMost(1_500_000_000_000))));
        assert_eq!(SizeBound::parse("20M"), Ok(Some(SizeBound::Exactly(20_000_000))));
    }

    #[test]
    fn non_size_patterns_stay_globs() {
        assert_eq!(SizeBound::parse("storage"), Ok(None));
        assert_eq!(SizeBound::parse("1.0"), Ok(None));
        assert_eq!(SizeBound::parse("aa:bb:cc"), Ok(None));
    }

    #[test]
    fn malformed_ranges_are_rejected() {
        assert!(SizeBound::parse("40G:10G").is_err());
        assert!(SizeBound::parse("10G:lots").is_err());
        assert!(SizeBound::parse(":").is_err());
    }

    #[test]
    fn values_compare_in_bytes() {
        let bound = SizeBound::Between {
            low: 10_000_000_000,
            high: 40_000_000_000,
        };
        assert!(bound.matches_value(&json!("20.00 GB")));
        assert!(bound.matches_value(&json!(40_000_000_000u64)));
        assert!(bound.matches_value(&json!(["1 TB", "10G"])));
        assert!(!bound.matches_value(&json!("500 MB")));
        assert!(!bound.matches_value(&json!("unknown")));
        assert_eq!(bound.to_string(), "10GB:40GB");
    }
}
