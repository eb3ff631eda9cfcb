//! Suite configuration.
//!
//! The configuration is a free-form JSON object loaded once per suite. It is
//! shared read-only: tools receive it through the builtin `config` tool and
//! through [`SuiteView::configuration`](crate::view::SuiteView::configuration),
//! and no holder can mutate what another holder sees.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::error::{EngineError, Result};

/// Immutable suite-wide key/value settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    entries: Arc<BTreeMap<String, Value>>,
}

impl Configuration {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from an existing mapping
    pub fn from_map(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Load configuration from a JSON file whose top level is an object
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| EngineError::config(format!("{} ({})", e, path.display())))
    }

    /// Parse configuration from a JSON string whose top level is an object
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        match value {
            Value::Object(map) => Ok(Self::from_map(map.into_iter().collect())),
            other => Err(EngineError::config(format!(
                "configuration must be a JSON object, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Look up a setting
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Look up a string setting
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Look up a numeric setting
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Returns true if the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterate over all settings in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Number of settings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no settings
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy the settings into an owned, independent mapping
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        self.entries.as_ref().clone()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_from_json_object() {
        let config = Configuration::from_json(r#"{"station": "bench-3", "vcc": 3.3}"#).unwrap();
        assert_eq!(config.len(), 2);
        assert_eq!(config.get_str("station"), Some("bench-3"));
        assert_eq!(config.get_f64("vcc"), Some(3.3));
        assert!(config.get("missing").is_none());
    }

    #[test]
    fn test_rejects_non_object() {
        let err = Configuration::from_json("[1, 2]").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = Configuration::from_json("{not json").unwrap_err();
        assert!(matches!(err, EngineError::Json(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"retries": 0, "operator": "ci"}}"#).unwrap();

        let config = Configuration::load_from_file(file.path()).unwrap();
        assert_eq!(config.get("retries"), Some(&json!(0)));
        assert_eq!(config.get_str("operator"), Some("ci"));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Configuration::load_from_file(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_clones_share_but_copies_are_independent() {
        let config = Configuration::from_json(r#"{"a": 1}"#).unwrap();
        let shared = config.clone();
        assert_eq!(shared, config);

        let mut copy = config.to_map();
        copy.insert("a".to_string(), json!(2));
        assert_eq!(config.get("a"), Some(&json!(1)));
    }
}
