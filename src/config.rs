//! Router configuration
//!
//! Defaults, then an optional JSON file, then `NLQ_ROUTER_*` environment variables.

use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const ENV_PREFIX: &str = "NLQ_ROUTER_";

/// Hard upper bound on clarification options, whatever the configuration says.
pub const MAX_CLARIFICATION_OPTIONS: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Minimum Jaro-Winkler similarity for a fuzzy entity match
    pub fuzzy_threshold: f64,
    /// Fuzzy matches further than this many edits are never accepted
    pub max_edit_distance: usize,
    /// Terms shorter than this are only matched exactly or by prefix
    pub min_fuzzy_term_len: usize,
    /// Candidates within this score margin of the best one are ambiguous
    pub ambiguity_margin: f64,
    /// Minimum resolver score for an utterance mention to set the scope
    pub scope_threshold: f64,
    pub min_confidence: f64,
    pub tie_margin: f64,
    pub memory_capacity: usize,
    pub max_rows: u64,
    pub default_list_limit: u64,
    pub max_time_range_days: i64,
    pub delegate_timeout_ms: u64,
    pub statement_timeout_ms: u64,
    pub max_clarification_options: usize,
    pub audit_capacity: usize,
    /// Sessions kept in memory; the least recently used one is evicted beyond this
    pub max_sessions: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.85,
            max_edit_distance: 2,
            min_fuzzy_term_len: 5,
            ambiguity_margin: 0.05,
            scope_threshold: 0.85,
            min_confidence: 0.55,
            tie_margin: 0.10,
            memory_capacity: 5,
            max_rows: 200,
            default_list_limit: 50,
            max_time_range_days: 731,
            delegate_timeout_ms: 5_000,
            statement_timeout_ms: 3_000,
            max_clarification_options: MAX_CLARIFICATION_OPTIONS,
            audit_capacity: 500,
            max_sessions: 10_000,
        }
    }
}

impl RouterConfig {
    /// Load configuration: defaults, optional file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RouterConfig = serde_json::from_str(&content)?;
        debug!("Loaded router config from {}", path.display());
        Ok(config)
    }

    /// Apply `NLQ_ROUTER_<FIELD>` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim().parse::<T>().map_err(|_| {
                RouterError::Config(format!("Invalid value '{}' for {}", raw, key))
            })
        }

        macro_rules! override_field {
            ($field:ident) => {{
                let key = format!("{}{}", ENV_PREFIX, stringify!($field).to_uppercase());
                if let Some(raw) = lookup(&key) {
                    self.$field = parse(&key, &raw)?;
                }
            }};
        }

        override_field!(fuzzy_threshold);
        override_field!(max_edit_distance);
        override_field!(min_fuzzy_term_len);
        override_field!(ambiguity_margin);
        override_field!(scope_threshold);
        override_field!(min_confidence);
        override_field!(tie_margin);
        override_field!(memory_capacity);
        override_field!(max_rows);
        override_field!(default_list_limit);
        override_field!(max_time_range_days);
        override_field!(delegate_timeout_ms);
        override_field!(statement_timeout_ms);
        override_field!(max_clarification_options);
        override_field!(audit_capacity);
        override_field!(max_sessions);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let unit = [
            ("fuzzy_threshold", self.fuzzy_threshold),
            ("ambiguity_margin", self.ambiguity_margin),
            ("scope_threshold", self.scope_threshold),
            ("min_confidence", self.min_confidence),
            ("tie_margin", self.tie_margin),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(RouterError::Config(format!(
                    "{} must be within 0..=1, got {}",
                    name, value
                )));
            }
        }
        if self.memory_capacity == 0 || self.audit_capacity == 0 || self.max_sessions == 0 {
            return Err(RouterError::Config(
                "memory_capacity, audit_capacity and max_sessions must be positive".to_string(),
            ));
        }
        if self.max_rows == 0 || self.default_list_limit > self.max_rows {
            return Err(RouterError::Config(format!(
                "default_list_limit ({}) must be within 1..=max_rows ({})",
                self.default_list_limit, self.max_rows
            )));
        }
        if self.max_time_range_days <= 0 {
            return Err(RouterError::Config(
                "max_time_range_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn clarification_limit(&self) -> usize {
        self.max_clarification_options.min(MAX_CLARIFICATION_OPTIONS)
    }

    pub fn delegate_timeout(&self) -> Duration {
        Duration::from_millis(self.delegate_timeout_ms)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        RouterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("NLQ_ROUTER_MAX_ROWS", "500"),
            ("NLQ_ROUTER_FUZZY_THRESHOLD", "0.9"),
        ]
        .into_iter()
        .collect();

        let mut config = RouterConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_rows, 500);
        assert!((config.fuzzy_threshold - 0.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = RouterConfig::default();
        let result = config.apply_env(|k| {
            (k == "NLQ_ROUTER_MAX_ROWS").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(RouterError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_list_limit_above_max_rows() {
        let config = RouterConfig {
            max_rows: 10,
            default_list_limit: 20,
            ..RouterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clarification_limit_is_capped() {
        let config = RouterConfig {
            max_clarification_options: 10,
            ..RouterConfig::default()
        };
        assert_eq!(config.clarification_limit(), 3);
    }

    #[test]
    fn test_partial_json_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("router.json");
        std::fs::write(&path, r#"{ "max_rows": 100 }"#).unwrap();
        let config = RouterConfig::from_file(&path).unwrap();
        assert_eq!(config.max_rows, 100);
        assert_eq!(config.memory_capacity, 5);
    }
}
