//! Process variables in the engine's typed wire shape
//!
//! The engine exchanges variables as `name -> {"value": .., "type": .., "valueInfo": ..}`.
//! [`Variables`] keeps that shape so it can be passed to the gateway untouched, and offers
//! plain-JSON accessors for handler code.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type name used for structured (object / array) values
pub const JSON_TYPE: &str = "Json";

/// Type name used for explicit nulls
pub const NULL_TYPE: &str = "Null";

/// Value types whose payload is never written to logs
const LARGE_TYPES: [&str; 2] = ["File", "Bytes"];

/// A single typed variable value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedValue {
    /// Raw value as sent by the engine
    pub value: Value,

    /// Engine type name (`String`, `Integer`, `Json`, ...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,

    /// Additional type information (serialization format, file name, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_info: Option<Value>,
}

impl TypedValue {
    /// Wrap a plain JSON value the way the engine expects it
    ///
    /// Scalars are sent untyped and the engine infers the type. Anything
    /// structured is serialized to text and tagged as `Json`.
    pub fn from_plain(value: Value) -> Self {
        match value {
            Value::Bool(_) | Value::Number(_) | Value::String(_) => Self::untyped(value),
            Value::Null => Self {
                value: Value::Null,
                value_type: Some(NULL_TYPE.to_string()),
                value_info: None,
            },
            Value::Object(ref map) if map.get("value").is_some_and(is_scalar) => {
                // Already in wire form
                match serde_json::from_value::<TypedValue>(value.clone()) {
                    Ok(typed) => typed,
                    Err(_) => Self::json(&value),
                }
            }
            other => Self::json(&other),
        }
    }

    fn untyped(value: Value) -> Self {
        Self {
            value,
            value_type: None,
            value_info: None,
        }
    }

    fn json(value: &Value) -> Self {
        Self {
            value: Value::String(value.to_string()),
            value_type: Some(JSON_TYPE.to_string()),
            value_info: None,
        }
    }

    /// Check whether the value carries the given engine type (case-insensitive)
    pub fn is_type(&self, type_name: &str) -> bool {
        self.value_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case(type_name))
    }

    /// Decode to plain JSON, parsing `Json`-typed text
    pub fn to_plain(&self) -> Value {
        if self.is_type(JSON_TYPE) {
            if let Value::String(text) = &self.value {
                if let Ok(parsed) = serde_json::from_str(text) {
                    return parsed;
                }
            }
        }
        self.value.clone()
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// Named collection of typed variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables(BTreeMap<String, TypedValue>);

impl Variables {
    /// Create an empty variable set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from plain `name -> value` pairs
    pub fn from_plain<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut vars = Self::new();
        for (name, value) in pairs {
            vars.insert(name, value);
        }
        vars
    }

    /// Build from a JSON object; anything else yields an empty set
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::from_plain(map),
            _ => Self::new(),
        }
    }

    /// Builder-style insert of a plain value
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    /// Insert a plain value, converting it to wire form
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.0.insert(name.into(), TypedValue::from_plain(value));
    }

    /// Insert an already typed value
    pub fn insert_typed(&mut self, name: impl Into<String>, value: TypedValue) {
        self.0.insert(name.into(), value);
    }

    /// Plain value of a variable
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).map(TypedValue::to_plain)
    }

    /// Typed value of a variable, including its metadata
    pub fn get_typed(&self, name: &str) -> Option<&TypedValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TypedValue)> {
        self.0.iter()
    }

    /// Decode every variable into a plain JSON object
    pub fn to_plain(&self) -> serde_json::Map<String, Value> {
        self.0
            .iter()
            .map(|(name, typed)| (name.clone(), typed.to_plain()))
            .collect()
    }

    /// Copy suitable for logging, with file and binary payloads elided
    pub fn redacted(&self) -> Self {
        let inner = self
            .0
            .iter()
            .map(|(name, typed)| {
                let shown = if LARGE_TYPES.iter().any(|t| typed.is_type(t)) {
                    TypedValue {
                        value: Value::String("...".to_string()),
                        ..typed.clone()
                    }
                } else {
                    typed.clone()
                };
                (name.clone(), shown)
            })
            .collect();
        Self(inner)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Variables {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self::from_plain(iter)
    }
}

/// String-valued extension properties attached to a task's activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionProperties(BTreeMap<String, String>);

impl ExtensionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_are_sent_untyped() {
        let vars = Variables::new()
            .with("count", 1)
            .with("flag", true)
            .with("name", "abc")
            .with("ratio", 0.5);

        assert_eq!(
            serde_json::to_value(&vars).unwrap(),
            json!({
                "count": {"value": 1},
                "flag": {"value": true},
                "name": {"value": "abc"},
                "ratio": {"value": 0.5},
            })
        );
    }

    #[test]
    fn test_structured_values_become_json() {
        let vars = Variables::new().with("order", json!({"id": 7, "items": [1, 2]}));

        let typed = vars.get_typed("order").unwrap();
        assert_eq!(typed.value_type.as_deref(), Some("Json"));
        assert!(typed.value.is_string());
        assert_eq!(vars.get("order"), Some(json!({"id": 7, "items": [1, 2]})));
    }

    #[test]
    fn test_wire_form_is_kept() {
        let vars = Variables::from_json(json!({
            "amount": {"value": 10, "type": "Long"},
        }));

        let typed = vars.get_typed("amount").unwrap();
        assert_eq!(typed.value, json!(10));
        assert_eq!(typed.value_type.as_deref(), Some("Long"));
    }

    #[test]
    fn test_null_value() {
        let vars = Variables::new().with("missing", Value::Null);
        assert!(vars.get_typed("missing").unwrap().is_type("null"));
        assert_eq!(vars.get("missing"), Some(Value::Null));
    }

    #[test]
    fn test_deserialize_engine_payload() {
        let vars: Variables = serde_json::from_value(json!({
            "customer": {"value": "{\"tier\":\"gold\"}", "type": "json", "valueInfo": {}},
            "total": {"value": 42, "type": "Integer", "valueInfo": {}},
        }))
        .unwrap();

        assert_eq!(vars.get("customer"), Some(json!({"tier": "gold"})));
        assert_eq!(vars.get("total"), Some(json!(42)));
        assert_eq!(vars.get("absent"), None);
        assert_eq!(vars.to_plain().len(), 2);
    }

    #[test]
    fn test_redacted_elides_files() {
        let mut vars = Variables::new().with("note", "keep");
        vars.insert_typed(
            "attachment",
            TypedValue {
                value: json!("aGVsbG8="),
                value_type: Some("File".into()),
                value_info: Some(json!({"filename": "a.txt"})),
            },
        );

        let redacted = vars.redacted();
        assert_eq!(redacted.get("attachment"), Some(json!("...")));
        assert_eq!(redacted.get("note"), Some(json!("keep")));
        assert_eq!(vars.get("attachment"), Some(json!("aGVsbG8=")));
    }

    #[test]
    fn test_extension_properties() {
        let props: ExtensionProperties =
            serde_json::from_value(json!({"owner": "billing", "sla": "5m"})).unwrap();
        assert_eq!(props.get("owner"), Some("billing"));
        assert_eq!(props.get("unknown"), None);
    }
}
