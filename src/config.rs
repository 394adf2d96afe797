//! Broker configuration.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker-wide settings recognised by the registry and the reaper.
///
/// Durations are (de)serialised as whole seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Suffix after `@` in generated subscription ids.
    /// Default: "broker"
    pub broker_prefix: String,

    /// Whether new subscriptions must be renewed by resubscribing.
    /// Default: false
    pub requires_renewal: bool,

    /// Maximum age of a renewal-required subscription.
    /// Default: 1 hour
    #[serde(rename = "expiration_ttl_secs", with = "duration_secs")]
    pub expiration_ttl: Duration,

    /// Minimum time between liveness probes of one consumer.
    /// Default: 10 minutes
    #[serde(rename = "liveness_check_interval_secs", with = "duration_secs")]
    pub liveness_check_interval: Duration,

    /// Pause between reaper sweeps.
    /// Default: 5 minutes
    #[serde(rename = "sweep_interval_secs", with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Consecutive probe failures tolerated before eviction.
    /// Default: 3
    pub max_unavailable_attempts: u32,

    /// Run the background reaper.
    /// Default: true
    pub auto_clean_enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_prefix: "broker".to_string(),
            requires_renewal: false,
            expiration_ttl: Duration::from_secs(60 * 60),
            liveness_check_interval: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            max_unavailable_attempts: 3,
            auto_clean_enabled: true,
        }
    }
}

impl BrokerConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BrokerConfig = serde_json::from_str(json)
            .map_err(|e| RegistryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker_prefix.is_empty() {
            return Err(RegistryError::InvalidConfig(
                "broker_prefix must not be empty".into(),
            ));
        }
        if self.broker_prefix.contains('@') {
            return Err(RegistryError::InvalidConfig(format!(
                "broker_prefix must not contain '@': {}",
                self.broker_prefix
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "sweep_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Settings consumed by the registry.
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            broker_prefix: self.broker_prefix.clone(),
            requires_renewal: self.requires_renewal,
        }
    }

    /// Settings consumed by the reaper.
    pub fn reaper(&self) -> ReaperConfig {
        ReaperConfig {
            expiration_ttl: self.expiration_ttl,
            liveness_check_interval: self.liveness_check_interval,
            sweep_interval: self.sweep_interval,
            max_unavailable_attempts: self.max_unavailable_attempts,
        }
    }
}

/// Registry settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    pub broker_prefix: String,
    pub requires_renewal: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        BrokerConfig::default().registry()
    }
}

/// Reaper settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReaperConfig {
    pub expiration_ttl: Duration,
    pub liveness_check_interval: Duration,
    pub sweep_interval: Duration,
    pub max_unavailable_attempts: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        BrokerConfig::default().reaper()
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
