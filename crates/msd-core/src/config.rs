//! Session configuration.
//!
//! The whole tree is a TOML document; every field has a default so a
//! minimal file only names what it changes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::uds::{SeedKeyAlgorithm, default_algorithm_order};
use crate::variant::EcuVariant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport backend: `socketcan` or `mock`.
    pub driver: String,
    /// Channel name, e.g. `can0`.
    pub channel: String,
    pub bitrate: u32,
    /// Tester → ECU identifier.
    pub tx_id: u32,
    /// ECU → tester identifier.
    pub rx_id: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            driver: "socketcan".into(),
            channel: "can0".into(),
            bitrate: 500_000,
            tx_id: 0x612,
            rx_id: 0x613,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantConfig {
    pub id: EcuVariant,
    /// Bus address override for the calibration region.
    pub base_addr: Option<u32>,
    /// Size override; must match the variant's declared size when set.
    pub size: Option<u32>,
    pub zone_map_id: Option<String>,
}

impl Default for VariantConfig {
    fn default() -> Self {
        Self {
            id: EcuVariant::Msd80,
            base_addr: None,
            size: None,
            zone_map_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub p2_ms: u64,
    pub p2_star_ms: u64,
    /// STmin announced in the tester's flow control.
    pub st_min_override: Option<u8>,
    /// Block size announced in the tester's flow control.
    pub block_size_override: Option<u8>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            p2_ms: 1000,
            p2_star_ms: 5000,
            st_min_override: None,
            block_size_override: None,
        }
    }
}

impl TimingConfig {
    pub fn p2(&self) -> Duration {
        Duration::from_millis(self.p2_ms)
    }

    pub fn p2_star(&self) -> Duration {
        Duration::from_millis(self.p2_star_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub require_explicit_warning_ack: bool,
    pub backup_store_path: PathBuf,
    /// When false, a failed backup downgrades to a warning and the session
    /// continues without a rollback source.
    pub forbid_missing_backup: bool,
    /// Operation log path; `None` disables the log.
    pub operation_log_path: Option<PathBuf>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            require_explicit_warning_ack: true,
            backup_store_path: PathBuf::from("backups"),
            forbid_missing_backup: true,
            operation_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub algorithm_order: Vec<SeedKeyAlgorithm>,
    pub lockout_backoff_ms: u64,
    /// Odd request-seed sub-function.
    pub access_level: u8,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            algorithm_order: default_algorithm_order(),
            lockout_backoff_ms: 10_000,
            access_level: 0x01,
        }
    }
}

/// Complete session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    pub transport: TransportConfig,
    pub variant: VariantConfig,
    pub timing: TimingConfig,
    pub safety: SafetyConfig,
    pub security: SecurityConfig,
}

impl FlashConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        let config: FlashConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Calibration bus address, honouring the override.
    pub fn base_addr(&self) -> u32 {
        self.variant
            .base_addr
            .unwrap_or(self.variant.id.spec().base_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = FlashConfig::default();
        assert_eq!(config.transport.tx_id, 0x612);
        assert_eq!(config.transport.rx_id, 0x613);
        assert_eq!(config.timing.p2_star(), Duration::from_secs(5));
        assert!(config.safety.require_explicit_warning_ack);
        assert_eq!(config.security.algorithm_order.len(), 4);
        assert_eq!(config.base_addr(), 0x0090_0000);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: FlashConfig = toml::from_str(
            r#"
            [variant]
            id = "msd81"

            [transport]
            channel = "can1"

            [security]
            algorithm_order = ["legacy-c", "rftx"]
            "#,
        )
        .unwrap();
        assert_eq!(config.variant.id, EcuVariant::Msd81);
        assert_eq!(config.transport.channel, "can1");
        assert_eq!(config.transport.bitrate, 500_000);
        assert_eq!(
            config.security.algorithm_order,
            vec![SeedKeyAlgorithm::LegacyC, SeedKeyAlgorithm::Rftx]
        );
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FlashConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: FlashConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.transport.channel, config.transport.channel);
        assert_eq!(back.security.lockout_backoff_ms, 10_000);
    }
}
