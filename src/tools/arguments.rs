//! Typed access to a tool call's JSON arguments.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::TurnstileError;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolArguments {
    tool: String,
    raw: Value,
}

impl ToolArguments {
    pub fn new(tool: impl Into<String>, raw: Value) -> Self {
        Self {
            tool: tool.into(),
            raw,
        }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    fn invalid(&self, message: String) -> TurnstileError {
        TurnstileError::InvalidArgument(format!("{}: {message}", self.tool))
    }

    pub fn get_str(&self, key: &str) -> Result<&str, TurnstileError> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| self.invalid(format!("missing string argument '{key}'")))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(Value::as_str)
    }

    pub fn get_u64_or(&self, key: &str, default: u64) -> u64 {
        self.raw.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    /// String array argument; absent means empty.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.raw
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, TurnstileError> {
        serde_json::from_value(self.raw.clone()).map_err(|err| self.invalid(err.to_string()))
    }
}
