use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ConfigError;

/// Configuration map for a component.
///
/// Values are opaque JSON values; the typed getters below perform the lenient
/// numeric coercions that scenario files rely on (an integer literal is
/// accepted where a float is expected, and vice versa). Validation of ranges
/// happens in the factory, which is the only place that constructs components
/// from untrusted property maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(Map<String, Value>);

impl Properties {
    /// Constructs an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the raw value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns `true` if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Inserts a value, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Returns a float value, falling back to `default` when absent.
    #[must_use]
    pub fn float_or(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(Value::as_f64).unwrap_or(default)
    }

    /// Returns an integer value, falling back to `default` when absent.
    /// Floats with no fractional part are accepted.
    #[must_use]
    pub fn int_or(&self, key: &str, default: u64) -> u64 {
        match self.0.get(key) {
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_f64().map(|f| f as u64))
                .unwrap_or(default),
            None => default,
        }
    }

    /// Returns a string value, falling back to `default` when absent.
    #[must_use]
    pub fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.0.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    /// Returns a boolean value, falling back to `default` when absent.
    #[must_use]
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Returns the array stored under `key`, if any.
    #[must_use]
    pub fn array(&self, key: &str) -> Option<&Vec<Value>> {
        self.0.get(key).and_then(Value::as_array)
    }

    /// Checks that the value under `key`, if present, is a number in
    /// `[0, 1]`. Used for probability fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProperty`] otherwise.
    pub fn expect_probability(&self, key: &str) -> Result<(), ConfigError> {
        match self.0.get(key) {
            None => Ok(()),
            Some(value) => match value.as_f64() {
                Some(p) if (0.0..=1.0).contains(&p) => Ok(()),
                _ => Err(ConfigError::InvalidProperty {
                    key: key.into(),
                    reason: "must be a number between 0 and 1".into(),
                }),
            },
        }
    }

    /// Checks that the value under `key`, if present, is a positive number.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidProperty`] otherwise.
    pub fn expect_positive(&self, key: &str) -> Result<(), ConfigError> {
        match self.0.get(key) {
            None => Ok(()),
            Some(value) => match value.as_f64() {
                Some(v) if v > 0.0 => Ok(()),
                _ => Err(ConfigError::InvalidProperty {
                    key: key.into(),
                    reason: "must be a positive number".into(),
                }),
            },
        }
    }
}

impl From<Map<String, Value>> for Properties {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_typed_getters_with_defaults() {
        let props = Properties::new()
            .with("processing_time", 2.5)
            .with("max_concurrency", 4)
            .with("algorithm", "weighted")
            .with("auto_drain", false);
        assert_eq!(props.float_or("processing_time", 1.0), 2.5);
        assert_eq!(props.float_or("missing", 1.0), 1.0);
        assert_eq!(props.int_or("max_concurrency", 10), 4);
        assert_eq!(props.str_or("algorithm", "round_robin"), "weighted");
        assert!(!props.bool_or("auto_drain", true));
    }

    #[test]
    fn test_int_accepts_float_literal() {
        let props = Properties::new().with("max_size", 3.0);
        assert_eq!(props.int_or("max_size", 0), 3);
    }

    #[test]
    fn test_probability_validation() {
        let props = Properties::new()
            .with("failure_rate", 0.5)
            .with("hit_ratio", 1.5)
            .with("bad", "nope");
        assert!(props.expect_probability("failure_rate").is_ok());
        assert!(props.expect_probability("missing").is_ok());
        assert!(props.expect_probability("hit_ratio").is_err());
        assert!(props.expect_probability("bad").is_err());
    }

    #[test]
    fn test_positive_validation() {
        let props = Properties::new()
            .with("processing_time", 0.1)
            .with("access_time", 0.0);
        assert!(props.expect_positive("processing_time").is_ok());
        assert!(props.expect_positive("access_time").is_err());
    }
}
