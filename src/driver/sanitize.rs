//! Renders driver messages for logs with every `secrets` field replaced.

use serde::Serialize;
use serde_json::Value;
use std::fmt;

const STRIPPED: &str = "***stripped***";

/// Display wrapper: `info!("request: {}", StripSecrets(&req))`
#[derive(Debug)]
pub struct StripSecrets<'a, T: Serialize>(pub &'a T);

impl<T: Serialize> fmt::Display for StripSecrets<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_value(self.0) {
            Ok(mut value) => {
                strip(&mut value);
                write!(f, "{value}")
            }
            Err(e) => write!(f, "<unrenderable message: {e}>"),
        }
    }
}

fn strip(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if key == "secrets" {
                    if !is_empty(field) {
                        *field = Value::String(STRIPPED.to_string());
                    }
                } else {
                    strip(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip),
        _ => {}
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
