use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::errors::ConfigError;

fn default_precision() -> u32 {
    8
}

fn default_broker() -> String {
    "zero-commission".to_string()
}

fn default_parallel_runs() -> usize {
    1
}

fn default_cache_capacity() -> usize {
    4096
}

/// Engine configuration, parsed from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub initial_capital: Decimal,
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_precision")]
    pub decimal_precision: u32,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Runs executed concurrently; 1 preserves lifecycle-callback ordering.
    #[serde(default = "default_parallel_runs")]
    pub max_parallel_runs: usize,
    /// Host calls a strategy may issue within one bar. Unlimited when unset.
    #[serde(default)]
    pub max_host_calls_per_bar: Option<u32>,
    /// Entry cap for the per-run KV cache; LRU eviction beyond it.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "initial_capital".to_string(),
                message: format!("must be positive, got {}", self.initial_capital),
            });
        }
        // rust_decimal supports at most 28 fractional digits
        if self.decimal_precision > 28 {
            return Err(ConfigError::InvalidValue {
                field: "decimal_precision".to_string(),
                message: format!("must be <= 28, got {}", self.decimal_precision),
            });
        }
        if self.max_parallel_runs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_parallel_runs".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(ConfigError::InvalidValue {
                    field: "start_time".to_string(),
                    message: format!("start_time {} is not before end_time {}", start, end),
                });
            }
        }
        Ok(())
    }
}

/// One (strategy, config, data-file) triple executed end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub strategy_name: String,
    pub config_name: String,
    pub data_file_path: PathBuf,
    pub result_folder: PathBuf,
    pub start_wall_time: DateTime<Utc>,
    pub end_wall_time: Option<DateTime<Utc>>,
}

impl Run {
    pub fn begin(
        results_root: &std::path::Path,
        strategy_name: impl Into<String>,
        config_name: impl Into<String>,
        data_file_path: impl Into<PathBuf>,
    ) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            strategy_name: strategy_name.into(),
            config_name: config_name.into(),
            data_file_path: data_file_path.into(),
            result_folder: results_root.join(run_id.to_string()),
            start_wall_time: Utc::now(),
            end_wall_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minimal_yaml() {
        let config = EngineConfig::from_yaml("initial_capital: 10000\n").unwrap();
        assert_eq!(config.initial_capital, dec!(10000));
        assert_eq!(config.broker, "zero-commission");
        assert_eq!(config.decimal_precision, 8);
        assert_eq!(config.max_parallel_runs, 1);
        assert!(config.start_time.is_none());
        assert!(config.max_host_calls_per_bar.is_none());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
initial_capital: 25000.50
broker: per-share
decimal_precision: 4
start_time: 2024-01-01T00:00:00Z
end_time: 2024-06-30T00:00:00Z
max_parallel_runs: 4
max_host_calls_per_bar: 500
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.initial_capital, dec!(25000.50));
        assert_eq!(config.broker, "per-share");
        assert_eq!(config.decimal_precision, 4);
        assert_eq!(config.max_parallel_runs, 4);
        assert_eq!(config.max_host_calls_per_bar, Some(500));
    }

    #[test]
    fn test_rejects_non_positive_capital() {
        assert!(EngineConfig::from_yaml("initial_capital: 0\n").is_err());
        assert!(EngineConfig::from_yaml("initial_capital: -5\n").is_err());
    }

    #[test]
    fn test_rejects_inverted_time_range() {
        let yaml = r#"
initial_capital: 1000
start_time: 2024-06-30T00:00:00Z
end_time: 2024-01-01T00:00:00Z
"#;
        assert!(EngineConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_capital_is_parse_error() {
        assert!(EngineConfig::from_yaml("broker: per-share\n").is_err());
    }

    #[test]
    fn test_run_folder_uses_run_id() {
        let run = Run::begin(std::path::Path::new("/tmp/results"), "s", "c", "d.parquet");
        assert_eq!(
            run.result_folder,
            PathBuf::from("/tmp/results").join(run.run_id.to_string())
        );
        assert!(run.end_wall_time.is_none());
    }
}
