//! `flowplane.toml` configuration.

use anyhow::{bail, Context, Result};
use flow_dataplane::{DataplaneConfig, AS_MAX};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level workbench configuration: one VIP and its backend set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlowplaneConfig {
    /// VIP identifier; names the shared-memory object (`shm_vip_<id>`).
    #[serde(default = "FlowplaneConfig::default_vip")]
    pub vip: u32,
    /// Backend indices registered at startup.
    #[serde(default = "FlowplaneConfig::default_backends")]
    pub backends: Vec<u32>,
    /// Fast-path tuning; every field has a sensible default.
    #[serde(default)]
    pub dataplane: DataplaneConfig,
}

impl FlowplaneConfig {
    fn default_vip() -> u32 {
        1
    }

    fn default_backends() -> Vec<u32> {
        (0..4).collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one backend must be configured");
        }
        if let Some(&bad) = self.backends.iter().find(|&&b| b as usize >= AS_MAX) {
            bail!("backend index {bad} out of range (max {AS_MAX})");
        }
        self.dataplane.validate()
    }

    /// Default config printed by `flowplane init`.
    pub fn default_example() -> Self {
        Self {
            vip: Self::default_vip(),
            backends: Self::default_backends(),
            dataplane: DataplaneConfig::default(),
        }
    }
}

impl Default for FlowplaneConfig {
    fn default() -> Self {
        Self::default_example()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_example_roundtrips() {
        let text = toml::to_string_pretty(&FlowplaneConfig::default_example()).unwrap();
        let cfg: FlowplaneConfig = toml::from_str(&text).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.vip, 1);
        assert_eq!(cfg.backends, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let cfg: FlowplaneConfig = toml::from_str("").unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.dataplane.buckets, 1024);
    }

    #[test]
    fn test_rejects_out_of_range_backend() {
        let cfg: FlowplaneConfig = toml::from_str("backends = [0, 64]").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_backends() {
        let cfg: FlowplaneConfig = toml::from_str("backends = []").unwrap();
        assert!(cfg.validate().is_err());
    }
}
