//! JSON path queries shared by body predicates and template helpers.

use jsonpath_rust::JsonPath;
use serde_json::Value;
use std::fmt;

/// A JSON path parsed once and evaluated many times.
#[derive(Clone)]
pub struct CompiledPath {
    expression: String,
    path: JsonPath<Value>,
}

impl CompiledPath {
    pub fn compile(expression: &str) -> Result<Self, String> {
        let path = JsonPath::<Value>::try_from(expression)
            .map_err(|e| format!("Invalid JSON path `{}`: {}", expression, e))?;
        Ok(Self {
            expression: expression.to_string(),
            path,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First value selected in `json`, or `None` when nothing resolves.
    pub fn first(&self, json: &Value) -> Option<Value> {
        match self.path.find(json) {
            Value::Null => None,
            Value::Array(mut found) => {
                if found.is_empty() {
                    None
                } else {
                    Some(found.swap_remove(0))
                }
            }
            other => Some(other),
        }
    }
}

impl fmt::Debug for CompiledPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompiledPath").field(&self.expression).finish()
    }
}

/// Check that `expression` parses as a JSON path.
pub fn validate(expression: &str) -> Result<(), String> {
    CompiledPath::compile(expression).map(|_| ())
}

/// First value selected by `expression`, or `None` when nothing resolves.
///
/// An expression that fails to parse selects nothing.
pub fn first(json: &Value, expression: &str) -> Option<Value> {
    CompiledPath::compile(expression).ok()?.first(json)
}

/// Parse `body` as JSON and select the first value at `expression`.
///
/// Bodies that are not valid JSON select nothing.
pub fn select(body: &[u8], expression: &str) -> Option<Value> {
    let json: Value = serde_json::from_slice(body).ok()?;
    first(&json, expression)
}

/// Render a selected value as template text: strings unquoted, everything
/// else in its JSON form.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_resolves_field() {
        let doc = json!({"name": "Elena", "secondName": "Orlova", "orders": [1, 2, 3]});
        assert_eq!(first(&doc, "$.secondName"), Some(json!("Orlova")));
        assert_eq!(first(&doc, "$.orders[1]"), Some(json!(2)));
    }

    #[test]
    fn test_missing_field_selects_nothing() {
        let doc = json!({"name": "Elena"});
        assert_eq!(first(&doc, "$.secondName"), None);
    }

    #[test]
    fn test_select_fails_closed_on_non_json() {
        assert_eq!(select(b"not json", "$.name"), None);
        assert_eq!(select(br#"{"name":"Ivan"}"#, "$.name"), Some(json!("Ivan")));
    }

    #[test]
    fn test_compiled_path_is_reusable() {
        let path = CompiledPath::compile("$.client.orders").unwrap();
        assert_eq!(path.expression(), "$.client.orders");
        assert_eq!(path.first(&json!({"client": {"orders": 6}})), Some(json!(6)));
        assert_eq!(path.first(&json!({"client": {"orders": 2}})), Some(json!(2)));
        assert_eq!(path.first(&json!({"client": {}})), None);
    }

    #[test]
    fn test_validate() {
        assert!(validate("$.client.orders[0]").is_ok());
        assert!(validate("$[").is_err());
    }

    #[test]
    fn test_to_text() {
        assert_eq!(to_text(&json!("Orlova")), "Orlova");
        assert_eq!(to_text(&json!(6)), "6");
        assert_eq!(to_text(&json!({"a": 1})), r#"{"a":1}"#);
    }
}
