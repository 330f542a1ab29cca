//! Gateway settings with environment overrides.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::hub::ExpiryMonitor;
use crate::lease::LeaseSettings;
use crate::policy::ReconnectPolicy;
use crate::runtime::LocalRuntime;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid lease store {0:?}: expected `memory` or `sqlite:<path>`")]
    InvalidLeaseStore(String),
    #[error("lease renew interval ({renew_ms}ms) must be shorter than the lease ttl ({ttl_ms}ms)")]
    RenewNotBelowTtl { renew_ms: u128, ttl_ms: u128 },
    #[error("instance id must not be empty")]
    EmptyInstanceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStoreConfig {
    Memory,
    Sqlite(PathBuf),
}

impl FromStr for LeaseStoreConfig {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value == "memory" {
            return Ok(Self::Memory);
        }
        match value.strip_prefix("sqlite:") {
            Some(path) if !path.is_empty() => Ok(Self::Sqlite(PathBuf::from(path))),
            _ => Err(ConfigError::InvalidLeaseStore(value.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub instance_id: String,
    pub lease: LeaseSettings,
    pub tool_retention: Duration,
    pub tool_timeout: Duration,
    pub aux_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub monitor: ExpiryMonitor,
    pub lease_store: LeaseStoreConfig,
    pub sessions_file: Option<PathBuf>,
    pub sandbox_root: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            lease: LeaseSettings::default(),
            tool_retention: Duration::from_secs(5 * 60),
            tool_timeout: Duration::from_secs(120),
            aux_timeout: Duration::from_secs(15),
            reconnect: ReconnectPolicy::default(),
            monitor: ExpiryMonitor::default(),
            lease_store: LeaseStoreConfig::Memory,
            sessions_file: None,
            sandbox_root: LocalRuntime::default_root(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `SESSION_GATEWAY_*` variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            instance_id: std::env::var("SESSION_GATEWAY_INSTANCE_ID")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.instance_id),
            lease: LeaseSettings {
                ttl: duration_from_env_ms("SESSION_GATEWAY_LEASE_TTL_MS", defaults.lease.ttl),
                renew_interval: duration_from_env_ms(
                    "SESSION_GATEWAY_LEASE_RENEW_MS",
                    defaults.lease.renew_interval,
                ),
            },
            tool_retention: duration_from_env_ms(
                "SESSION_GATEWAY_TOOL_RETENTION_MS",
                defaults.tool_retention,
            ),
            tool_timeout: duration_from_env_ms(
                "SESSION_GATEWAY_TOOL_TIMEOUT_MS",
                defaults.tool_timeout,
            ),
            aux_timeout: duration_from_env_ms("SESSION_GATEWAY_AUX_TIMEOUT_MS", defaults.aux_timeout),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::EmptyInstanceId);
        }
        if self.lease.renew_interval >= self.lease.ttl {
            return Err(ConfigError::RenewNotBelowTtl {
                renew_ms: self.lease.renew_interval.as_millis(),
                ttl_ms: self.lease.ttl.as_millis(),
            });
        }
        Ok(())
    }
}

pub fn default_instance_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|host| !host.trim().is_empty())
        .unwrap_or_else(|| "gateway".to_string());
    format!("{host}-{}", std::process::id())
}

pub fn duration_from_env_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}
