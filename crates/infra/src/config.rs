//! Configuration loading and representation.
//!
//! Layering, later wins: built-in defaults, then `identityd.toml` if present,
//! then `IDENTITYD_*` environment variables with `__` separating nested keys
//! (e.g. `IDENTITYD_OUTBOX__INTERVAL_SECS=30`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use identityd_auth::{LockoutPolicy, LockoutScope};
use identityd_core::DomainResult;
use identityd_observability::LogFormat;

use crate::outbox::{DeliveryPolicy, PERMANENT_FAILURE_THRESHOLD};

pub const DEFAULT_CONFIG_FILE: &str = "identityd.toml";
pub const ENV_PREFIX: &str = "IDENTITYD_";

/// Entity names a retention horizon may be configured for.
pub const RETAINED_ENTITIES: &[&str] = &["login_attempts", "outbox_items"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Postgres connection string; in-memory stores are used when unset.
    pub database_url: Option<String>,
    pub observability: ObservabilitySettings,
    pub outbox: OutboxSettings,
    pub lockout: LockoutSettings,
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub format: LogFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    pub interval_secs: u64,
    pub permanent_failure_threshold: u32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            permanent_failure_threshold: PERMANENT_FAILURE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockoutSettings {
    pub window_mins: u32,
    pub max_failures: u32,
    pub scope: LockoutScope,
    /// Append a failed attempt when a login is refused by the lockout.
    pub record_locked_attempts: bool,
}

impl Default for LockoutSettings {
    fn default() -> Self {
        Self {
            window_mins: 15,
            max_failures: 5,
            scope: LockoutScope::Account,
            record_locked_attempts: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub interval_secs: u64,
    /// Entity name to horizon in days. Entities not listed are kept forever.
    pub horizon_days: BTreeMap<String, u32>,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            horizon_days: BTreeMap::from([("login_attempts".to_string(), 30)]),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            observability: ObservabilitySettings::default(),
            outbox: OutboxSettings::default(),
            lockout: LockoutSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

impl Settings {
    /// Load from `identityd.toml` in the working directory and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from the given TOML file (missing is fine) and the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.outbox.interval_secs == 0 {
            return invalid("outbox.interval_secs must be positive");
        }
        if self.outbox.permanent_failure_threshold == 0 {
            return invalid("outbox.permanent_failure_threshold must be positive");
        }
        if self.lockout.window_mins == 0 {
            return invalid("lockout.window_mins must be positive");
        }
        if self.lockout.max_failures == 0 {
            return invalid("lockout.max_failures must be positive");
        }
        if self.retention.interval_secs == 0 {
            return invalid("retention.interval_secs must be positive");
        }
        for (entity, days) in &self.retention.horizon_days {
            if !RETAINED_ENTITIES.contains(&entity.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "retention.horizon_days: unknown entity {entity:?}"
                )));
            }
            if *days == 0 {
                return Err(ConfigError::Invalid(format!(
                    "retention.horizon_days.{entity} must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn outbox_interval(&self) -> Duration {
        Duration::from_secs(self.outbox.interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }

    pub fn delivery_policy(&self) -> DeliveryPolicy {
        DeliveryPolicy::new(self.outbox.permanent_failure_threshold)
    }

    pub fn lockout_policy(&self) -> DomainResult<LockoutPolicy> {
        Ok(LockoutPolicy::new(self.lockout.window_mins, self.lockout.max_failures)?
            .with_scope(self.lockout.scope))
    }

    /// Configured horizon for an entity, if it is swept at all.
    pub fn horizon_days(&self, entity: &str) -> Option<u32> {
        self.retention.horizon_days.get(entity).copied()
    }
}
