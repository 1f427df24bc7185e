//! Run-scoped variable store and `{{name}}` interpolation.

use regex::{Captures, Regex};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use crate::error::VariableNotFound;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*\}\}")
        .expect("failed to compile placeholder regex")
});

/// Mapping of variable name to value for the duration of one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariableStore {
    vars: HashMap<String, Value>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with suite-level variables.
    pub fn seeded(seed: &HashMap<String, Value>) -> Self {
        Self { vars: seed.clone() }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&Value, VariableNotFound> {
        self.vars
            .get(name)
            .ok_or_else(|| VariableNotFound::new(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.vars.iter()
    }

    /// Replace every `{{name}}` token in `template` with the string
    /// form of the stored value. Fails on the first undefined token,
    /// scanning left to right.
    pub fn interpolate(&self, template: &str) -> Result<String, VariableNotFound> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }

        let mut missing = None;
        let expanded = PLACEHOLDER_RE.replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match self.vars.get(name) {
                Some(value) => value_to_string(value),
                None => {
                    if missing.is_none() {
                        missing = Some(VariableNotFound::new(name));
                    }
                    caps[0].to_string()
                }
            }
        });

        match missing {
            Some(err) => Err(err),
            None => Ok(expanded.into_owned()),
        }
    }

    /// Interpolate a structured value recursively. A string that is
    /// exactly one token takes the stored value with its JSON type;
    /// any other string is interpolated as text. Keys are untouched.
    pub fn interpolate_value(&self, value: &Value) -> Result<Value, VariableNotFound> {
        match value {
            Value::String(s) => {
                if let Some(name) = sole_token(s) {
                    return self.get(name).cloned();
                }
                self.interpolate(s).map(Value::String)
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.interpolate_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(key.clone(), self.interpolate_value(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Extend<(String, Value)> for VariableStore {
    fn extend<T: IntoIterator<Item = (String, Value)>>(&mut self, iter: T) {
        self.vars.extend(iter);
    }
}

/// String form used for substitution inside larger strings.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Names referenced by `{{name}}` tokens in `template`.
pub fn referenced_names(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Names referenced anywhere inside a structured value.
pub fn referenced_names_in_value(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => out.extend(referenced_names(s)),
        Value::Array(items) => {
            for item in items {
                referenced_names_in_value(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                referenced_names_in_value(item, out);
            }
        }
        _ => {}
    }
}

fn sole_token(s: &str) -> Option<&str> {
    let caps = PLACEHOLDER_RE.captures(s)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == s.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> VariableStore {
        let mut store = VariableStore::new();
        store.set("id", json!(42));
        store.set("token", json!("abc123"));
        store.set("flags", json!({"admin": true}));
        store
    }

    #[test]
    fn test_set_and_get() {
        let store = store();
        assert_eq!(store.get("id").unwrap(), &json!(42));
        assert_eq!(
            store.get("missing").unwrap_err(),
            VariableNotFound::new("missing")
        );
    }

    #[test]
    fn test_interpolate_replaces_every_token() {
        let store = store();
        assert_eq!(
            store.interpolate("/users/{{id}}/tokens/{{ token }}").unwrap(),
            "/users/42/tokens/abc123"
        );
        assert_eq!(
            store.interpolate("flags={{flags}}").unwrap(),
            r#"flags={"admin":true}"#
        );
        assert_eq!(store.interpolate("no tokens").unwrap(), "no tokens");
    }

    #[test]
    fn test_interpolate_reports_first_missing_token() {
        let store = store();
        let err = store
            .interpolate("/a/{{first_missing}}/{{id}}/{{second_missing}}")
            .unwrap_err();
        assert_eq!(err.name, "first_missing");
    }

    #[test]
    fn test_sole_token_keeps_type() {
        let store = store();
        let body = json!({
            "user_id": "{{id}}",
            "label": "user-{{id}}",
            "nested": [{"flags": "{{flags}}"}],
            "count": 3
        });
        assert_eq!(
            store.interpolate_value(&body).unwrap(),
            json!({
                "user_id": 42,
                "label": "user-42",
                "nested": [{"flags": {"admin": true}}],
                "count": 3
            })
        );
    }

    #[test]
    fn test_interpolate_value_propagates_missing() {
        let store = store();
        let err = store
            .interpolate_value(&json!({"deep": ["{{ghost}}"]}))
            .unwrap_err();
        assert_eq!(err.name, "ghost");
    }

    #[test]
    fn test_malformed_tokens_are_left_alone() {
        let store = store();
        assert_eq!(store.interpolate("{{ }} and {{1abc}}").unwrap(), "{{ }} and {{1abc}}");
    }

    #[test]
    fn test_referenced_names() {
        assert_eq!(
            referenced_names("/u/{{id}}?t={{ token }}"),
            vec!["id".to_string(), "token".to_string()]
        );
        let mut names = BTreeSet::new();
        referenced_names_in_value(&json!({"a": ["{{x}}", {"b": "{{y}}-{{x}}"}]}), &mut names);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["x", "y"]);
    }
}
