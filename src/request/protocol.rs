//! Wire format — one JSON request in, one response out.
//!
//! A request names its command and carries option values either inline or
//! under `args`:
//!
//! ```text
//! {"command": "find", "file": "a.cpp", "offset": 120}
//! {"command": "find", "args": {"file": "a.cpp", "offset": 120}}
//! ```
//!
//! Successful commands write free-form output. Failures are reported as a
//! single JSON line tagged with `"status": "error"`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RequestError;

/// A decoded request: command name plus raw option values.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: String,
    pub values: Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            values: Map::new(),
        }
    }

    pub fn with(mut self, option: impl Into<String>, value: Value) -> Self {
        self.values.insert(option.into(), value);
        self
    }

    pub fn from_value(value: Value) -> Result<Self, RequestError> {
        let Value::Object(mut object) = value else {
            return Err(RequestError::MalformedRequest(
                "request must be a JSON object".to_string(),
            ));
        };

        let command = match object.remove("command") {
            Some(Value::String(name)) => name,
            Some(_) => {
                return Err(RequestError::MalformedRequest(
                    "\"command\" must be a string".to_string(),
                ))
            }
            None => {
                return Err(RequestError::MalformedRequest(
                    "missing \"command\"".to_string(),
                ))
            }
        };

        let values = match object.remove("args") {
            Some(Value::Object(args)) => {
                if let Some(extra) = object.keys().next() {
                    return Err(RequestError::MalformedRequest(format!(
                        "unexpected key {extra:?} next to \"args\""
                    )));
                }
                args
            }
            Some(_) => {
                return Err(RequestError::MalformedRequest(
                    "\"args\" must be an object".to_string(),
                ))
            }
            None => object,
        };

        Ok(Self { command, values })
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.values.clone();
        object.insert("command".to_string(), Value::String(self.command.clone()));
        Value::Object(object)
    }
}

/// Structured status line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl Response {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Response::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Parses a response line, if it is a structured one.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_and_nested_forms_agree() {
        let flat = Request::from_value(json!({"command": "find", "file": "a.cpp", "offset": 120})).unwrap();
        let nested =
            Request::from_value(json!({"command": "find", "args": {"file": "a.cpp", "offset": 120}}))
                .unwrap();
        assert_eq!(flat, nested);
        assert_eq!(flat.values["offset"], json!(120));
    }

    #[test]
    fn test_malformed_requests() {
        for bad in [
            json!([1, 2]),
            json!({"file": "a.cpp"}),
            json!({"command": 3}),
            json!({"command": "find", "args": 1}),
            json!({"command": "find", "args": {}, "file": "x"}),
        ] {
            let err = Request::from_value(bad).unwrap_err();
            assert_eq!(err.code(), "MALFORMED_REQUEST");
        }
    }

    #[test]
    fn test_error_response_shape() {
        let line = serde_json::to_string(&Response::error("UNKNOWN_COMMAND", "nope")).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap(),
            json!({"status": "error", "code": "UNKNOWN_COMMAND", "message": "nope"})
        );
        assert!(matches!(Response::parse(&line), Some(Response::Error { .. })));
        assert_eq!(Response::parse("Done."), None);
    }
}
