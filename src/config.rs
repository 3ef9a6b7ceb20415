//! Rule configuration surface (spec §6): an immutable options bag backed by
//! `serde_json::Value`, with typed accessors centralizing the "recognized
//! options" lookups every detector needs. Loading a `RuleConfig` from a file
//! on disk is out of scope here — construction is always in-memory, from a
//! caller-supplied `serde_json::Value` or a literal built in tests.

use std::time::Duration;

use serde_json::Value as Json;

use crate::error::{CoreError, CoreResult};

/// Read-only view over a rule's configuration options.
#[derive(Debug, Clone)]
pub struct RuleConfig {
    raw: Json,
}

impl RuleConfig {
    pub fn new(raw: Json) -> Self {
        Self { raw }
    }

    pub fn empty() -> Self {
        Self { raw: Json::Object(Default::default()) }
    }

    fn field(&self, key: &str) -> Option<&Json> {
        self.raw.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.field(key).and_then(Json::as_str)
    }

    pub fn require_str(&self, key: &str) -> CoreResult<&str> {
        self.get_str(key)
            .ok_or_else(|| CoreError::configuration(format!("missing required option '{key}'")))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.field(key).and_then(Json::as_bool)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.field(key).and_then(Json::as_f64)
    }

    pub fn require_f64(&self, key: &str) -> CoreResult<f64> {
        self.get_f64(key)
            .ok_or_else(|| CoreError::configuration(format!("missing required option '{key}'")))
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.field(key).and_then(Json::as_u64).map(|n| n as usize)
    }

    pub fn require_usize(&self, key: &str) -> CoreResult<usize> {
        self.get_usize(key)
            .ok_or_else(|| CoreError::configuration(format!("missing required option '{key}'")))
    }

    /// Durations are configured as a number of seconds.
    pub fn get_duration(&self, key: &str) -> Option<Duration> {
        self.get_f64(key).map(Duration::from_secs_f64)
    }

    pub fn require_duration(&self, key: &str) -> CoreResult<Duration> {
        self.get_duration(key)
            .ok_or_else(|| CoreError::configuration(format!("missing required option '{key}'")))
    }

    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.field(key) {
            Some(Json::Array(items)) => items
                .iter()
                .filter_map(Json::as_str)
                .map(str::to_string)
                .collect(),
            Some(Json::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Escape hatch for options whose shape doesn't fit the typed
    /// accessors above (e.g. `NewTermsRule`'s `fields`, which may be a flat
    /// list of names or a list mixing names and composite-key arrays).
    pub fn get_raw(&self, key: &str) -> Option<&Json> {
        self.field(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.raw.get(key).is_some()
    }

    /// `rule_type`-agnostic metadata every elastalert rule carries, defaulted
    /// to an empty string when absent rather than failing construction.
    pub fn category(&self) -> String {
        self.get_str("category").unwrap_or_default().to_string()
    }

    pub fn description(&self) -> String {
        self.get_str("description").unwrap_or_default().to_string()
    }

    pub fn owner(&self) -> String {
        self.get_str("owner").unwrap_or_default().to_string()
    }

    pub fn priority(&self) -> i64 {
        self.field("priority").and_then(Json::as_i64).unwrap_or(2)
    }

    pub fn name(&self) -> String {
        self.get_str("name").unwrap_or("<unnamed rule>").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors() {
        let cfg = RuleConfig::new(json!({
            "threshold": 10,
            "timeframe": 300.0,
            "terms": ["a", "b"],
            "attach_related": true,
        }));
        assert_eq!(cfg.get_usize("threshold"), Some(10));
        assert_eq!(cfg.get_duration("timeframe"), Some(Duration::from_secs(300)));
        assert_eq!(cfg.get_string_list("terms"), vec!["a".to_string(), "b".to_string()]);
        assert!(cfg.get_bool_or("attach_related", false));
        assert!(!cfg.get_bool_or("missing_flag", false));
    }

    #[test]
    fn defaults_for_absent_metadata() {
        let cfg = RuleConfig::empty();
        assert_eq!(cfg.category(), "");
        assert_eq!(cfg.priority(), 2);
    }

    #[test]
    fn require_missing_is_configuration_error() {
        let cfg = RuleConfig::empty();
        assert!(matches!(cfg.require_str("field"), Err(CoreError::Configuration(_))));
    }
}
