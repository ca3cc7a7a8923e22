//! Typed command options.
//!
//! Each option is a tagged cell plus metadata, declared through a small
//! builder:
//!
//! ```text
//! OptionSpec::int("offset", 0)
//!     .metavar("OFFSET")
//!     .description("Offset in bytes")
//! ```
//!
//! Decoding a JSON value dispatches on the cell's tag.

use serde_json::{Map, Value};
use std::fmt;

use crate::error::RequestError;

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Enum { value: String, choices: Vec<String> },
    Json(Value),
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl OptionValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "boolean",
            Self::Int(_) => "integer",
            Self::Str(_) => "string",
            Self::Enum { .. } => "enum",
            Self::Json(_) => "JSON value",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Str(s) => Value::String(s.clone()),
            Self::Enum { value, .. } => Value::String(value.clone()),
            Self::Json(v) => v.clone(),
        }
    }

    /// Decodes `raw` into a value of the same variant as `self`.
    pub fn decode(&self, option: &str, raw: &Value) -> Result<OptionValue, RequestError> {
        let mismatch = || RequestError::TypeMismatch {
            option: option.to_string(),
            expected: self.type_name(),
            found: json_type(raw),
        };

        match (self, raw) {
            (Self::Bool(_), Value::Bool(b)) => Ok(Self::Bool(*b)),
            (Self::Int(_), Value::Number(n)) => n.as_i64().map(Self::Int).ok_or_else(|| {
                RequestError::Decode {
                    option: option.to_string(),
                    reason: format!("{n} is not a 64-bit integer"),
                }
            }),
            (Self::Str(_), Value::String(s)) => Ok(Self::Str(s.clone())),
            (Self::Enum { choices, .. }, Value::String(s)) => {
                if choices.iter().any(|c| c == s) {
                    Ok(Self::Enum {
                        value: s.clone(),
                        choices: choices.clone(),
                    })
                } else {
                    Err(RequestError::Decode {
                        option: option.to_string(),
                        reason: format!("{s:?} is not one of {}", choices.join("|")),
                    })
                }
            }
            (Self::Json(_), v) => Ok(Self::Json(v.clone())),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// One declared option: metadata, default, and the currently bound value.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    name: String,
    metavar: String,
    description: String,
    default: OptionValue,
    value: OptionValue,
}

impl OptionSpec {
    fn new(name: &str, default: OptionValue, metavar: &str) -> Self {
        Self {
            name: name.to_string(),
            metavar: metavar.to_string(),
            description: String::new(),
            value: default.clone(),
            default,
        }
    }

    pub fn bool(name: &str, default: bool) -> Self {
        Self::new(name, OptionValue::Bool(default), "true|false")
    }

    pub fn int(name: &str, default: i64) -> Self {
        Self::new(name, OptionValue::Int(default), "N")
    }

    pub fn string(name: &str, default: impl Into<String>) -> Self {
        Self::new(name, OptionValue::Str(default.into()), "STRING")
    }

    pub fn enumeration(name: &str, choices: &[&str], default: &str) -> Self {
        let choices: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
        let metavar = choices.join("|");
        let value = OptionValue::Enum {
            value: default.to_string(),
            choices,
        };
        Self::new(name, value, &metavar)
    }

    pub fn json(name: &str, default: Value) -> Self {
        Self::new(name, OptionValue::Json(default), "JSON")
    }

    pub fn metavar(mut self, metavar: &str) -> Self {
        self.metavar = metavar.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &OptionValue {
        &self.value
    }

    pub fn default_value(&self) -> &OptionValue {
        &self.default
    }

    fn reset(&mut self) {
        self.value = self.default.clone();
    }

    fn assign(&mut self, raw: &Value) -> Result<(), RequestError> {
        self.value = self.value.decode(&self.name, raw)?;
        Ok(())
    }

    /// `name=METAVAR  description (default: …)`
    pub fn usage(&self) -> String {
        let mut line = format!("{}={}", self.name, self.metavar);
        if !self.description.is_empty() {
            line.push_str(&format!("  {}", self.description));
        }
        line.push_str(&format!(" (default: {})", self.default));
        line
    }
}

/// Ordered option declarations of one command.
#[derive(Debug, Clone, Default)]
pub struct OptionSet {
    options: Vec<OptionSpec>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: OptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionSpec> {
        self.options.iter()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.options.iter().find(|o| o.name == name)
    }

    /// Restore every option to its default.
    pub fn reset(&mut self) {
        for option in &mut self.options {
            option.reset();
        }
    }

    pub fn assign(&mut self, command: &str, name: &str, raw: &Value) -> Result<(), RequestError> {
        let option = self
            .options
            .iter_mut()
            .find(|o| o.name == name)
            .ok_or_else(|| RequestError::UnknownOption {
                command: command.to_string(),
                option: name.to_string(),
            })?;
        option.assign(raw)
    }

    fn lookup(&self, name: &str) -> Result<&OptionValue, RequestError> {
        self.get(name)
            .map(OptionSpec::value)
            .ok_or_else(|| RequestError::Undeclared(name.to_string()))
    }

    fn wrong_tag(name: &str, expected: &'static str, found: &OptionValue) -> RequestError {
        RequestError::TypeMismatch {
            option: name.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, RequestError> {
        match self.lookup(name)? {
            OptionValue::Bool(b) => Ok(*b),
            other => Err(Self::wrong_tag(name, "boolean", other)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, RequestError> {
        match self.lookup(name)? {
            OptionValue::Int(i) => Ok(*i),
            other => Err(Self::wrong_tag(name, "integer", other)),
        }
    }

    /// String or enum value.
    pub fn str(&self, name: &str) -> Result<&str, RequestError> {
        match self.lookup(name)? {
            OptionValue::Str(s) => Ok(s),
            OptionValue::Enum { value, .. } => Ok(value),
            other => Err(Self::wrong_tag(name, "string", other)),
        }
    }

    pub fn json(&self, name: &str) -> Result<&Value, RequestError> {
        match self.lookup(name)? {
            OptionValue::Json(v) => Ok(v),
            other => Err(Self::wrong_tag(name, "JSON value", other)),
        }
    }

    /// Current values as a JSON object.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.options
            .iter()
            .map(|o| (o.name.clone(), o.value.to_json()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn find_options() -> OptionSet {
        OptionSet::new()
            .with(OptionSpec::string("file", ""))
            .with(OptionSpec::int("offset", 0))
            .with(OptionSpec::bool("mostSpecific", false))
            .with(OptionSpec::enumeration("format", &["text", "json"], "text"))
            .with(OptionSpec::json("value", Value::Null))
    }

    #[test]
    fn test_assign_and_reset() {
        let mut options = find_options();
        options.assign("find", "offset", &json!(120)).unwrap();
        options.assign("find", "format", &json!("json")).unwrap();
        options.assign("find", "value", &json!({"a": [1]})).unwrap();
        assert_eq!(options.int("offset").unwrap(), 120);
        assert_eq!(options.str("format").unwrap(), "json");
        assert_eq!(options.json("value").unwrap(), &json!({"a": [1]}));

        options.reset();
        assert_eq!(options.int("offset").unwrap(), 0);
        assert_eq!(options.str("format").unwrap(), "text");
        assert_eq!(options.json("value").unwrap(), &Value::Null);
    }

    #[test]
    fn test_binding_errors() {
        let mut options = find_options();

        let err = options.assign("find", "nope", &json!(1)).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_OPTION");

        let err = options.assign("find", "offset", &json!("12")).unwrap_err();
        assert_eq!(err.code(), "TYPE_MISMATCH");

        let err = options.assign("find", "offset", &json!(1.5)).unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");

        let err = options.assign("find", "format", &json!("xml")).unwrap_err();
        assert_eq!(err.code(), "DECODE_ERROR");

        // A failed assignment leaves the previous value in place
        assert_eq!(options.int("offset").unwrap(), 0);
    }

    #[test]
    fn test_typed_getters_check_tag() {
        let options = find_options();
        assert_eq!(options.bool("offset").unwrap_err().code(), "TYPE_MISMATCH");
        assert_eq!(options.int("missing").unwrap_err().code(), "UNDECLARED_OPTION");
    }

    #[test]
    fn test_usage_line() {
        let spec = OptionSpec::int("offset", 0)
            .metavar("OFFSET")
            .description("Offset in bytes");
        assert_eq!(spec.usage(), "offset=OFFSET  Offset in bytes (default: 0)");
        assert_eq!(
            OptionSpec::string("usr", "c:@F@main").usage(),
            "usr=STRING (default: \"c:@F@main\")"
        );
    }
}
