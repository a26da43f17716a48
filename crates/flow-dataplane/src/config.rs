//! Data-plane configuration.

use crate::stats::{layout, SHM_OFFSET};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// All recognised tuning knobs of one VIP's data plane.
///
/// Layout constants (`AS_MAX`, ring depth, reservoir bins) size wire records
/// and are deliberately not configurable here.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataplaneConfig {
    /// Flow-table size in buckets; must be a power of two.
    #[serde(default = "DataplaneConfig::default_buckets")]
    pub buckets: u32,
    /// Idle seconds before a slot is considered evictable.
    #[serde(default = "DataplaneConfig::default_timeout_sec")]
    pub timeout_sec: u32,
    /// Flow timeout assumed when estimating the completion time of a flow
    /// that was lazily evicted without a clean close.
    #[serde(default = "DataplaneConfig::default_flow_timeout_sec")]
    pub default_flow_timeout_sec: f32,
    /// Shared-memory region size in bytes.
    #[serde(default = "DataplaneConfig::default_shm_size")]
    pub shm_size: usize,
    /// Seconds between outbound frame publishes (and inbound fetches).
    #[serde(default = "DataplaneConfig::default_publish_interval")]
    pub publish_interval: f32,
    /// Geometric decay applied to `n_flow_on` per packet, in (0, 1].
    /// 1.0 disables decay (pure accumulation).
    #[serde(default = "DataplaneConfig::default_flow_decay")]
    pub flow_decay: f32,
    /// Millisecond offset applied when seeding the VIP clock baseline from a
    /// flow's own timestamps.
    #[serde(default = "DataplaneConfig::default_pt_offset_ms")]
    pub pt_offset_ms: u32,
}

impl DataplaneConfig {
    fn default_buckets() -> u32 { 1024 }
    fn default_timeout_sec() -> u32 { 40 }
    fn default_flow_timeout_sec() -> f32 { 40.0 }
    fn default_shm_size() -> usize { 1_048_576 }
    fn default_publish_interval() -> f32 { 0.2 }
    fn default_flow_decay() -> f32 { 1.0 }
    fn default_pt_offset_ms() -> u32 { 500 }

    /// Reject configurations that cannot start. Nothing here is recoverable
    /// at runtime; the VIP simply does not come up.
    pub fn validate(&self) -> Result<()> {
        if !self.buckets.is_power_of_two() {
            bail!("buckets must be a power of two, got {}", self.buckets);
        }
        if self.timeout_sec == 0 {
            bail!("timeout_sec must be non-zero");
        }
        if !(self.flow_decay > 0.0 && self.flow_decay <= 1.0) {
            bail!("flow_decay must be in (0, 1], got {}", self.flow_decay);
        }
        if self.publish_interval <= 0.0 {
            bail!("publish_interval must be positive");
        }
        if self.shm_size < SHM_OFFSET + layout::END {
            bail!(
                "shm_size {} too small for the region layout ({} bytes required)",
                self.shm_size,
                SHM_OFFSET + layout::END
            );
        }
        Ok(())
    }
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            buckets: Self::default_buckets(),
            timeout_sec: Self::default_timeout_sec(),
            default_flow_timeout_sec: Self::default_flow_timeout_sec(),
            shm_size: Self::default_shm_size(),
            publish_interval: Self::default_publish_interval(),
            flow_decay: Self::default_flow_decay(),
            pt_offset_ms: Self::default_pt_offset_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DataplaneConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_pow2_buckets() {
        let cfg = DataplaneConfig { buckets: 1000, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_decay() {
        for decay in [0.0, -0.5, 1.5] {
            let cfg = DataplaneConfig { flow_decay: decay, ..Default::default() };
            assert!(cfg.validate().is_err(), "decay {decay} should be rejected");
        }
        let cfg = DataplaneConfig { flow_decay: 0.9, ..Default::default() };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_undersized_region() {
        let cfg = DataplaneConfig { shm_size: 4096, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
