//! Typed access to tool call arguments.

use crate::error::OutflowError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArguments {
    value: serde_json::Value,
}

impl ToolArguments {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Get the raw JSON value.
    pub fn raw(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.value
    }

    pub fn get_str(&self, key: &str) -> Result<&str, OutflowError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| missing("string", key))
    }

    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, OutflowError> {
        self.value
            .get(key)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| missing("integer", key))
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, OutflowError> {
        self.value
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| missing("number", key))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, OutflowError> {
        self.value
            .get(key)
            .and_then(|v| v.as_bool())
            .ok_or_else(|| missing("boolean", key))
    }

    /// Deserialize the whole argument object into a typed struct.
    ///
    /// Arguments that arrived as a JSON-encoded string are parsed first; an
    /// empty string counts as `{}`.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, OutflowError> {
        let value = match &self.value {
            serde_json::Value::String(raw) if raw.trim().is_empty() => serde_json::json!({}),
            serde_json::Value::String(raw) => {
                serde_json::from_str::<serde_json::Value>(raw.trim()).map_err(|e| {
                    OutflowError::InvalidArgument(format!("failed to parse arguments: {e}"))
                })?
            }
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| {
            OutflowError::InvalidArgument(format!("failed to deserialize arguments: {e}"))
        })
    }
}

impl From<serde_json::Value> for ToolArguments {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

fn missing(kind: &str, key: &str) -> OutflowError {
    OutflowError::InvalidArgument(format!("missing {kind} argument: {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn typed_getters() {
        let args = ToolArguments::new(serde_json::json!({"city": "Oslo", "days": 3, "metric": true}));
        assert_eq!(args.get_str("city").unwrap(), "Oslo");
        assert_eq!(args.get_i64("days").unwrap(), 3);
        assert!(args.get_bool("metric").unwrap());
        assert!(args.get_str_opt("country").is_none());
        assert!(matches!(
            args.get_f64("lat"),
            Err(OutflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn deserialize_accepts_encoded_strings() {
        #[derive(Deserialize, Debug, PartialEq, Default)]
        struct Query {
            #[serde(default)]
            city: String,
        }
        let encoded = ToolArguments::new(serde_json::json!("{\"city\":\"Lima\"}"));
        assert_eq!(
            encoded.deserialize::<Query>().unwrap(),
            Query {
                city: "Lima".into()
            }
        );
        let empty = ToolArguments::new(serde_json::json!("  "));
        assert_eq!(empty.deserialize::<Query>().unwrap(), Query::default());
    }
}
