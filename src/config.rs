use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::FeatureConfig;
use crate::limits::ActionLimitConfig;

#[derive(Debug, Error)]
pub enum MeterConfigError {
    #[error("read config failed: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config failed: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeterConfig {
    #[serde(default)]
    pub actions: Vec<ActionLimitConfig>,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    /// Balance provisioned when a subject's account is first touched.
    #[serde(default)]
    pub starting_balance_micros: u64,
    /// Transient-store retries for the post-call debit. Admission never
    /// retries; it fails closed immediately to bound request latency.
    #[serde(default = "default_charge_retries")]
    pub charge_retries: u32,
    /// Upper bound on the post-charge usage write. The charge outcome is
    /// already decided by then; a slow store must not hold the response.
    #[serde(default = "default_usage_timeout_ms")]
    pub usage_timeout_ms: u64,
}

fn default_charge_retries() -> u32 {
    2
}

fn default_usage_timeout_ms() -> u64 {
    2_000
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            features: Vec::new(),
            starting_balance_micros: 0,
            charge_retries: default_charge_retries(),
            usage_timeout_ms: default_usage_timeout_ms(),
        }
    }
}

impl MeterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MeterConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn action(&self, name: &str) -> Option<&ActionLimitConfig> {
        self.actions.iter().find(|config| config.action == name)
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureConfig> {
        self.features.iter().find(|config| config.feature == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_toml_with_defaults() {
        let raw = r#"
            starting_balance_micros = 5_000_000

            [[actions]]
            action = "chat"
            limit = 3

            [[features]]
            feature = "chat"
            daily_limit = 10
            monetary = true
        "#;
        let config = MeterConfig::from_toml_str(raw).expect("config");

        let action = config.action("chat").expect("chat action");
        assert_eq!(action.limit, 3);
        assert_eq!(action.window_secs, 60);

        let feature = config.feature("chat").expect("chat feature");
        assert_eq!(feature.daily_limit, Some(10));
        assert!(feature.monetary);
        assert_eq!(feature.min_balance_micros, 1);

        assert_eq!(config.starting_balance_micros, 5_000_000);
        assert_eq!(config.charge_retries, 2);
        assert!(config.action("image").is_none());
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("meter.toml");
        std::fs::write(&path, "starting_balance_micros = 42\n").expect("write");

        let config = MeterConfig::load(&path).expect("load");
        assert_eq!(config.starting_balance_micros, 42);

        let err = MeterConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(err, Err(MeterConfigError::Read(_))));
    }
}
