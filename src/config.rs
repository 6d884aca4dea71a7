use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::cohort::DEFAULT_RETENTION_OFFSETS;
use crate::context::validate_confidence;
use crate::error::{AnalyticsError, Result};
use crate::experiment::{DEFAULT_CONFIDENCE, DEFAULT_SEED};
use crate::models::{Window, FUNNEL_STAGES};
use crate::segmentation::{self, DEFAULT_CLUSTERS};

/// Caller-tunable analytics parameters. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub funnel_stages: Vec<String>,
    pub retention_offsets: Vec<i64>,
    pub active_window: Window,
    pub experiment_seed: u64,
    pub confidence_level: f64,
    pub cluster_count: usize,
    pub cluster_seed: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            funnel_stages: FUNNEL_STAGES.iter().map(|s| s.to_string()).collect(),
            retention_offsets: DEFAULT_RETENTION_OFFSETS.to_vec(),
            active_window: Window::Day,
            experiment_seed: DEFAULT_SEED,
            confidence_level: DEFAULT_CONFIDENCE,
            cluster_count: DEFAULT_CLUSTERS,
            cluster_seed: segmentation::DEFAULT_SEED,
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.funnel_stages.is_empty() {
            return Err(AnalyticsError::InvalidParameter(
                "funnel_stages must not be empty".to_string(),
            ));
        }
        validate_confidence(self.confidence_level)?;
        segmentation::validate_cluster_count(self.cluster_count)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<AnalyticsConfig> {
    let content = fs::read_to_string(path)?;
    let config: AnalyticsConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_dashboard() {
        let config = AnalyticsConfig::default();
        assert_eq!(config.funnel_stages.len(), 6);
        assert_eq!(config.funnel_stages[0], "signup");
        assert_eq!(config.retention_offsets, vec![1, 7, 30]);
        assert_eq!(config.experiment_seed, 42);
        assert_eq!(config.cluster_count, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cluster_count": 6, "active_window": "week"}}"#).unwrap();
        file.flush().unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.cluster_count, 6);
        assert_eq!(config.active_window, Window::Week);
        assert_eq!(config.confidence_level, 0.95);
    }

    #[test]
    fn out_of_range_values_fail_validation() {
        let config = AnalyticsConfig {
            cluster_count: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalyticsConfig {
            confidence_level: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalyticsConfig {
            funnel_stages: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_a_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        file.flush().unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(AnalyticsError::Serialization(_))
        ));
    }
}
