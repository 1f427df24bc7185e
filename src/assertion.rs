//! Typed assertions against JSON response bodies.
//!
//! Evaluation is pure: each assertion is checked on its own and the
//! outcome carries the actual and expected values for reporting.

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigError;
use crate::json_path::JsonPath;
use crate::model::{Assertion, AssertionResult, Operator, ResponseBody, StatusCheck};

/// JSON type names understood by `type_is`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    String,
    Number,
    /// A number without a fractional part.
    Integer,
    /// A number written with a fraction or exponent.
    Float,
    Boolean,
    List,
    Dict,
    Null,
}

impl JsonType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" | "str" => Some(JsonType::String),
            "number" => Some(JsonType::Number),
            "float" | "double" => Some(JsonType::Float),
            "int" | "integer" => Some(JsonType::Integer),
            "boolean" | "bool" => Some(JsonType::Boolean),
            "list" | "array" => Some(JsonType::List),
            "dict" | "object" | "map" => Some(JsonType::Dict),
            "null" | "none" => Some(JsonType::Null),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            JsonType::String => value.is_string(),
            JsonType::Number => value.is_number(),
            JsonType::Integer => value.is_i64() || value.is_u64(),
            JsonType::Float => value.is_f64(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::List => value.is_array(),
            JsonType::Dict => value.is_object(),
            JsonType::Null => value.is_null(),
        }
    }
}

/// Canonical type name of a JSON value.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Deep equality. Numbers compare by value (`1 == 1.0`); everything
/// else is type-sensitive (`1 != "1"`).
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return x == y;
            }
            if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                return x == y;
            }
            match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Check that an assertion can be evaluated at all.
pub fn validate(case_id: &str, index: usize, assertion: &Assertion) -> Result<(), ConfigError> {
    JsonPath::parse(&assertion.path).map_err(|reason| ConfigError::InvalidPath {
        case_id: case_id.to_string(),
        path: assertion.path.clone(),
        reason,
    })?;

    let Some(value) = &assertion.value else {
        if assertion.operator.requires_value() {
            return Err(ConfigError::MissingAssertionValue {
                case_id: case_id.to_string(),
                index,
                operator: assertion.operator.to_string(),
            });
        }
        return Ok(());
    };

    match assertion.operator {
        Operator::TypeIs => {
            let known = value.as_str().and_then(JsonType::from_name).is_some();
            if !known {
                return Err(ConfigError::UnknownTypeName {
                    case_id: case_id.to_string(),
                    type_name: crate::variables::value_to_string(value),
                });
            }
        }
        Operator::Matches => {
            let pattern = crate::variables::value_to_string(value);
            Regex::new(&pattern).map_err(|source| ConfigError::InvalidPattern {
                case_id: case_id.to_string(),
                pattern,
                source,
            })?;
        }
        _ => {}
    }
    Ok(())
}

/// Evaluate one assertion against a response body.
pub fn evaluate(body: &ResponseBody, assertion: &Assertion) -> AssertionResult {
    match body {
        ResponseBody::Json(json) => evaluate_json(json, assertion),
        ResponseBody::Text(_) => outcome(
            assertion,
            None,
            false,
            "response body is not valid JSON".to_string(),
        ),
    }
}

/// Evaluate one assertion against a parsed JSON document.
pub fn evaluate_json(body: &Value, assertion: &Assertion) -> AssertionResult {
    let path = &assertion.path;
    let actual = match JsonPath::parse(path) {
        Ok(parsed) => parsed.resolve(body),
        Err(reason) => {
            return outcome(assertion, None, false, format!("invalid path '{path}': {reason}"));
        }
    };

    if assertion.operator == Operator::Exists {
        let passed = actual.is_some();
        let message = if passed {
            format!("'{path}' exists")
        } else {
            format!("'{path}' does not exist")
        };
        return outcome(assertion, actual.cloned(), passed, message);
    }

    let Some(actual) = actual else {
        return outcome(assertion, None, false, format!("'{path}' not found in response"));
    };
    let Some(expected) = &assertion.value else {
        return outcome(
            assertion,
            Some(actual.clone()),
            false,
            format!("{} requires a value", assertion.operator),
        );
    };

    let (passed, message) = compare(assertion.operator, path, actual, expected);
    outcome(assertion, Some(actual.clone()), passed, message)
}

fn compare(operator: Operator, path: &str, actual: &Value, expected: &Value) -> (bool, String) {
    match operator {
        Operator::Equals => {
            let passed = json_equal(actual, expected);
            let message = if passed {
                format!("'{path}' equals {expected}")
            } else {
                format!("'{path}' expected {expected}, got {actual}")
            };
            (passed, message)
        }
        Operator::NotEquals => {
            let passed = !json_equal(actual, expected);
            let message = if passed {
                format!("'{path}' differs from {expected}")
            } else {
                format!("'{path}' must not equal {expected}")
            };
            (passed, message)
        }
        Operator::Contains => contains(path, actual, expected),
        Operator::GreaterThan | Operator::LessThan => {
            match (actual.as_f64(), expected.as_f64()) {
                (Some(a), Some(e)) => {
                    let (passed, symbol) = if operator == Operator::GreaterThan {
                        (a > e, ">")
                    } else {
                        (a < e, "<")
                    };
                    let message = if passed {
                        format!("'{path}' {actual} {symbol} {expected}")
                    } else {
                        format!("'{path}' {actual} is not {symbol} {expected}")
                    };
                    (passed, message)
                }
                _ => (
                    false,
                    format!(
                        "type mismatch: {operator} needs numeric operands, \
                         got {} and {}",
                        type_name(actual),
                        type_name(expected)
                    ),
                ),
            }
        }
        Operator::TypeIs => {
            let Some(wanted) = expected.as_str().and_then(JsonType::from_name) else {
                return (false, format!("unknown type name {expected}"));
            };
            let passed = wanted.matches(actual);
            let message = if passed {
                format!("'{path}' is of type {expected}")
            } else {
                format!("'{path}' expected type {expected}, got {}", type_name(actual))
            };
            (passed, message)
        }
        Operator::Matches => {
            let pattern = crate::variables::value_to_string(expected);
            match Regex::new(&pattern) {
                Ok(re) => {
                    let text = crate::variables::value_to_string(actual);
                    let passed = matches_at_start(&re, &text);
                    let message = if passed {
                        format!("'{path}' matches /{pattern}/")
                    } else {
                        format!("'{path}' value {text:?} does not match /{pattern}/")
                    };
                    (passed, message)
                }
                Err(e) => (false, format!("invalid regular expression /{pattern}/: {e}")),
            }
        }
        Operator::Exists => (true, format!("'{path}' exists")),
    }
}

/// Leftmost match starting at offset 0: anchored at the start of the
/// value, open at the end.
fn matches_at_start(re: &Regex, text: &str) -> bool {
    re.find(text).is_some_and(|m| m.start() == 0)
}

fn contains(path: &str, actual: &Value, expected: &Value) -> (bool, String) {
    let passed = match (actual, expected) {
        (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| json_equal(item, expected)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => {
            return (
                false,
                format!(
                    "type mismatch: cannot check whether {} contains {}",
                    type_name(actual),
                    type_name(expected)
                ),
            );
        }
    };
    let message = if passed {
        format!("'{path}' contains {expected}")
    } else {
        format!("'{path}' does not contain {expected}")
    };
    (passed, message)
}

fn outcome(
    assertion: &Assertion,
    actual: Option<Value>,
    passed: bool,
    message: String,
) -> AssertionResult {
    AssertionResult {
        path: assertion.path.clone(),
        operator: assertion.operator,
        passed,
        actual,
        expected: assertion.value.clone(),
        message,
    }
}

/// Compare the expected status, if any, against the actual one.
pub fn check_status(expected: Option<u16>, actual: u16) -> Option<StatusCheck> {
    expected.map(|expected| StatusCheck {
        expected,
        actual,
        passed: expected == actual,
    })
}

/// A case passes iff its status check (when present) and every
/// assertion passed.
pub fn case_passed(status: Option<&StatusCheck>, results: &[AssertionResult]) -> bool {
    status.map_or(true, |s| s.passed) && results.iter().all(|r| r.passed)
}
