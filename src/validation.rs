//! Condition validation for device-reported values.
//!
//! A [`Condition`] is a declarative expectation loaded from the condition table.
//! [`validate`] checks one value against it and only ever answers `true` or
//! `false`: a value that cannot be parsed is a failed check, never an error.
//!
//! Operands may reference device parameters with `${name}` placeholders
//! (`expected: "${device_sn}"`). Call [`Condition::resolve`] with the parameter
//! map of the current session before validating.

use crate::error::{HarnessError, HarnessResult};
use chrono::{Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;
use tracing::warn;

/// Flat mapping of device field to expected value (e.g. `device_sn` -> `1212324500026`).
pub type Parameters = BTreeMap<String, String>;

/// Default MAC address format: six hex octets separated by `:` or `-`.
pub const DEFAULT_MAC_PATTERN: &str = r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$";

/// Transform that renders unix seconds as local `YYYY-MM-DD HH:MM:SS`.
pub const UNIX_TO_DATETIME: &str = "unix_to_datetime";

/// Matches placeholders like `${device_sn}`.
static PLACEHOLDER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("Invalid placeholder regex"));

/// A condition operand.
///
/// Stored as text so a YAML number, string or placeholder all load the same
/// way; numeric interpretation happens at validation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawOperand", into = "String")]
pub struct Operand(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawOperand {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<RawOperand> for Operand {
    fn from(raw: RawOperand) -> Self {
        match raw {
            RawOperand::Text(s) => Operand(s),
            RawOperand::Integer(i) => Operand(i.to_string()),
            RawOperand::Float(f) => Operand(f.to_string()),
            RawOperand::Bool(b) => Operand(b.to_string()),
        }
    }
}

impl From<Operand> for String {
    fn from(operand: Operand) -> Self {
        operand.0
    }
}

impl Operand {
    /// Create an operand from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Operand(value.into())
    }

    /// Raw operand text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if the operand parses as a number.
    pub fn as_f64(&self) -> Option<f64> {
        self.0.trim().parse().ok()
    }

    fn resolve(&self, params: &Parameters) -> HarnessResult<Operand> {
        interpolate(&self.0, params).map(Operand)
    }
}

impl From<f64> for Operand {
    fn from(value: f64) -> Self {
        Operand(value.to_string())
    }
}

impl From<&str> for Operand {
    fn from(value: &str) -> Self {
        Operand(value.to_string())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Character class a `LengthAndType` value must consist of.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Identifier made of decimal digits (serial numbers, lot codes)
    #[default]
    Char,
    /// Plain decimal number
    Numeric,
}

/// Declarative expectation for a single device-reported value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "condition", rename_all = "snake_case")]
pub enum Condition {
    /// Numeric `low <= value <= high`, inclusive.
    Between {
        /// Lower bound
        low: Operand,
        /// Upper bound
        high: Operand,
    },
    /// Numeric equality after coercion.
    Equal {
        /// Expected number
        expected: Operand,
    },
    /// Exact string equality (version strings and other non-numeric ids).
    TextEqual {
        /// Expected text
        expected: Operand,
    },
    /// Digits only, with an exact length.
    #[serde(rename = "check_length_and_type", alias = "length_and_type")]
    LengthAndType {
        /// Required number of characters
        #[serde(alias = "expected_length")]
        length: usize,
        /// Character class
        #[serde(rename = "type", alias = "expected_type", default)]
        value_type: ValueType,
    },
    /// Transform the value, then compare it as a string.
    Timestamp {
        /// Transform name; unknown names pass the value through
        #[serde(alias = "transformation_type", default = "default_transform")]
        transform: String,
        /// Expected rendered value
        expected: Operand,
    },
    /// MAC address format plus an optional vendor prefix allow-list.
    MacAddress {
        /// Regex override for the address format
        #[serde(default)]
        pattern: Option<String>,
        /// Accepted prefixes; empty means any prefix
        #[serde(default, alias = "validPrefixes")]
        valid_prefixes: Vec<String>,
    },
}

fn default_transform() -> String {
    UNIX_TO_DATETIME.to_string()
}

impl Condition {
    /// Substitute `${name}` placeholders in every operand.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::UnknownParameter`] when a placeholder names a
    /// parameter that is not in `params`.
    pub fn resolve(&self, params: &Parameters) -> HarnessResult<Condition> {
        Ok(match self {
            Condition::Between { low, high } => Condition::Between {
                low: low.resolve(params)?,
                high: high.resolve(params)?,
            },
            Condition::Equal { expected } => Condition::Equal {
                expected: expected.resolve(params)?,
            },
            Condition::TextEqual { expected } => Condition::TextEqual {
                expected: expected.resolve(params)?,
            },
            Condition::LengthAndType { .. } => self.clone(),
            Condition::Timestamp {
                transform,
                expected,
            } => Condition::Timestamp {
                transform: transform.clone(),
                expected: expected.resolve(params)?,
            },
            Condition::MacAddress {
                pattern,
                valid_prefixes,
            } => Condition::MacAddress {
                pattern: pattern.clone(),
                valid_prefixes: valid_prefixes
                    .iter()
                    .map(|prefix| interpolate(prefix, params))
                    .collect::<HarnessResult<Vec<_>>>()?,
            },
        })
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Between { low, high } => write!(f, "between {low} and {high}"),
            Condition::Equal { expected } => write!(f, "== {expected}"),
            Condition::TextEqual { expected } => write!(f, "\"{expected}\""),
            Condition::LengthAndType { length, value_type } => {
                write!(f, "{length} digits ({value_type:?})")
            }
            Condition::Timestamp {
                transform,
                expected,
            } => write!(f, "{transform} == {expected}"),
            Condition::MacAddress { valid_prefixes, .. } if valid_prefixes.is_empty() => {
                write!(f, "MAC address")
            }
            Condition::MacAddress { valid_prefixes, .. } => {
                write!(f, "MAC address with prefix {}", valid_prefixes.join("|"))
            }
        }
    }
}

/// Check `value` against a resolved condition.
///
/// Never panics and never errors: unparseable input simply fails the check.
pub fn validate(value: &str, condition: &Condition) -> bool {
    match condition {
        Condition::Between { low, high } => {
            match (parse_number(value), low.as_f64(), high.as_f64()) {
                (Some(v), Some(lo), Some(hi)) => compare_between(v, lo, hi),
                _ => false,
            }
        }
        Condition::Equal { expected } => match (parse_number(value), expected.as_f64()) {
            (Some(v), Some(e)) => v == e,
            _ => false,
        },
        Condition::TextEqual { expected } => value.trim() == expected.as_str().trim(),
        Condition::LengthAndType { length, .. } => check_length_and_type(value, *length),
        Condition::Timestamp {
            transform,
            expected,
        } => match transform_timestamp(value, transform) {
            Some(rendered) => rendered.trim() == expected.as_str().trim(),
            None => false,
        },
        Condition::MacAddress {
            pattern,
            valid_prefixes,
        } => is_valid_mac_address(
            value,
            pattern.as_deref().unwrap_or(DEFAULT_MAC_PATTERN),
            valid_prefixes,
        ),
    }
}

/// Inclusive range check.
pub fn compare_between(value: f64, low: f64, high: f64) -> bool {
    low <= value && value <= high
}

/// Digits only, exactly `length` characters.
pub fn check_length_and_type(value: &str, length: usize) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) && value.len() == length
}

/// Apply a named timestamp transform.
///
/// Returns `None` when the transform is known but the value does not fit it.
/// Unknown transform names return the value unchanged.
pub fn transform_timestamp(value: &str, transform: &str) -> Option<String> {
    if transform != UNIX_TO_DATETIME {
        return Some(value.to_string());
    }
    let seconds: i64 = value.trim().parse().ok()?;
    Local
        .timestamp_opt(seconds, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Format check plus optional prefix allow-list. Both must pass.
pub fn is_valid_mac_address(value: &str, pattern: &str, valid_prefixes: &[String]) -> bool {
    let regex = match Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => {
            warn!(pattern, error = %e, "Invalid MAC address pattern");
            return false;
        }
    };
    if !regex.is_match(value) {
        return false;
    }
    valid_prefixes.is_empty() || valid_prefixes.iter().any(|p| value.starts_with(p.as_str()))
}

fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse().ok()
}

fn interpolate(template: &str, params: &Parameters) -> HarnessResult<String> {
    let mut missing = None;
    let resolved = PLACEHOLDER_REGEX.replace_all(template, |caps: &regex::Captures<'_>| {
        let name = caps[1].trim();
        match params.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(HarnessError::UnknownParameter(name)),
        None => Ok(resolved.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn between(low: f64, high: f64) -> Condition {
        Condition::Between {
            low: low.into(),
            high: high.into(),
        }
    }

    #[test]
    fn between_is_inclusive() {
        let cond = between(10.0, 20.0);
        assert!(validate("10", &cond));
        assert!(validate("15", &cond));
        assert!(validate("20", &cond));
        assert!(!validate("21", &cond));
        assert!(!validate("9.999", &cond));
    }

    #[test]
    fn between_rejects_garbage_without_panicking() {
        assert!(!validate("ten", &between(0.0, 100.0)));
        assert!(!validate("", &between(0.0, 100.0)));
        assert!(!validate("NaN", &between(0.0, 100.0)));
    }

    #[test]
    fn equal_coerces_numbers() {
        let cond = Condition::Equal {
            expected: 98.6.into(),
        };
        assert!(validate("98.6", &cond));
        assert!(validate(" 98.60 ", &cond));
        assert!(!validate("abc", &cond));
    }

    #[test]
    fn length_and_type_requires_digits() {
        let cond = Condition::LengthAndType {
            length: 4,
            value_type: ValueType::Char,
        };
        assert!(validate("1234", &cond));
        assert!(!validate("12A4", &cond));
        assert!(!validate("12345", &cond));
        assert!(!validate("", &Condition::LengthAndType {
            length: 0,
            value_type: ValueType::Char,
        }));
    }

    #[test]
    fn unknown_transform_passes_value_through() {
        assert_eq!(
            transform_timestamp("1700000000", "raw").as_deref(),
            Some("1700000000")
        );
        let cond = Condition::Timestamp {
            transform: "raw".into(),
            expected: "1700000000".into(),
        };
        assert!(validate("1700000000", &cond));
    }

    #[test]
    fn unix_to_datetime_renders_local_time() {
        let expected = Local
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let cond = Condition::Timestamp {
            transform: UNIX_TO_DATETIME.into(),
            expected: Operand::new(expected),
        };
        assert!(validate("1700000000", &cond));
        assert!(!validate("17000x0000", &cond));
    }

    #[test]
    fn mac_address_prefix_allow_list() {
        let ok = Condition::MacAddress {
            pattern: None,
            valid_prefixes: vec!["9C:65".into()],
        };
        let wrong_vendor = Condition::MacAddress {
            pattern: None,
            valid_prefixes: vec!["00:1A".into()],
        };
        assert!(validate("9C:65:F9:3C:A1:9B", &ok));
        assert!(!validate("9C:65:F9:3C:A1:9B", &wrong_vendor));
        assert!(!validate("9C:65:F9:3C:A1", &ok));
        assert!(validate("9c-65-f9-3c-a1-9b", &Condition::MacAddress {
            pattern: None,
            valid_prefixes: vec![],
        }));
    }

    #[test]
    fn invalid_mac_pattern_fails_closed() {
        assert!(!is_valid_mac_address("9C:65:F9:3C:A1:9B", "([", &[]));
    }

    #[test]
    fn resolve_substitutes_device_parameters() {
        let mut params = Parameters::new();
        params.insert("device_sn".into(), "1212324500026".into());
        let cond = Condition::TextEqual {
            expected: "${device_sn}".into(),
        };
        let resolved = cond.resolve(&params).unwrap();
        assert!(validate("1212324500026", &resolved));
    }

    #[test]
    fn resolve_reports_missing_parameter() {
        let cond = Condition::Equal {
            expected: "${fw_version}".into(),
        };
        match cond.resolve(&Parameters::new()) {
            Err(HarnessError::UnknownParameter(name)) => assert_eq!(name, "fw_version"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn conditions_load_from_yaml() {
        let yaml = r#"
- condition: between
  low: 10
  high: 20.5
- condition: equal
  expected: "98.6"
- condition: check_length_and_type
  expected_length: 13
  expected_type: char
- condition: timestamp
  expected: "2024-01-01 00:00:00"
- condition: mac_address
  valid_prefixes: ["9C:65", "AC:DE"]
"#;
        let conditions: Vec<Condition> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conditions.len(), 5);
        assert!(validate("20.5", &conditions[0]));
        assert!(validate("98.6", &conditions[1]));
        assert!(matches!(
            conditions[2],
            Condition::LengthAndType { length: 13, .. }
        ));
        assert!(matches!(
            &conditions[3],
            Condition::Timestamp { transform, .. } if transform == UNIX_TO_DATETIME
        ));
        assert!(validate("AC:DE:00:11:22:33", &conditions[4]));
    }

    #[test]
    fn display_describes_expectation() {
        assert_eq!(between(1.0, 2.5).to_string(), "between 1 and 2.5");
    }
}
