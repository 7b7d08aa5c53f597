//! Configuration module
//!
//! Settings for the registry connection, optimistic registration retries, the
//! blocked-constraint monitor and the step driver.

use std::env;
use std::time::Duration;

const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const REGISTER_MAX_ATTEMPTS: u32 = 5;
const REGISTER_BACKOFF_MS: u64 = 20;
const REGISTER_MAX_BACKOFF_MS: u64 = 1000;
const MONITOR_INTERVAL_SECS: u64 = 60;
const STEP_TIMEOUT_SECS: u64 = 600;
const STEP_MAX_RETRIES: u32 = 3;
const STEP_RECHECK_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct RestraintConfig {
    /// PostgreSQL registry; `None` keeps consumers in memory.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    /// Optimistic registration attempts before `UnableToRegisterConsumer`.
    pub register_max_attempts: u32,
    pub register_backoff_ms: u64,
    pub register_max_backoff_ms: u64,
    /// Interval between blocked-constraint sweeps. 0 = disabled.
    pub monitor_interval_secs: u64,
    pub step_timeout_secs: u64,
    pub step_max_retries: u32,
    /// How often a waiting step re-reads its consumer in case a wake-up was lost. 0 = never.
    pub step_recheck_secs: u64,
    pub environment: String,
}

impl Default for RestraintConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: DB_MAX_CONNECTIONS,
            db_timeout_seconds: DB_TIMEOUT_SECS,
            register_max_attempts: REGISTER_MAX_ATTEMPTS,
            register_backoff_ms: REGISTER_BACKOFF_MS,
            register_max_backoff_ms: REGISTER_MAX_BACKOFF_MS,
            monitor_interval_secs: MONITOR_INTERVAL_SECS,
            step_timeout_secs: STEP_TIMEOUT_SECS,
            step_max_retries: STEP_MAX_RETRIES,
            step_recheck_secs: STEP_RECHECK_SECS,
            environment: "development".to_string(),
        }
    }
}

impl RestraintConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = RestraintConfig {
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            db_max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DB_MAX_CONNECTIONS),
            db_timeout_seconds: lookup("DB_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(DB_TIMEOUT_SECS),
            register_max_attempts: lookup("RESTRAINT_REGISTER_MAX_ATTEMPTS")
                .map(|s| s.parse())
                .transpose()
                .map_err(|_| {
                    anyhow::anyhow!("RESTRAINT_REGISTER_MAX_ATTEMPTS must be a valid number")
                })?
                .unwrap_or(REGISTER_MAX_ATTEMPTS),
            register_backoff_ms: lookup("RESTRAINT_REGISTER_BACKOFF_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(REGISTER_BACKOFF_MS),
            register_max_backoff_ms: lookup("RESTRAINT_REGISTER_MAX_BACKOFF_MS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(REGISTER_MAX_BACKOFF_MS),
            monitor_interval_secs: lookup("RESTRAINT_MONITOR_INTERVAL_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(MONITOR_INTERVAL_SECS),
            step_timeout_secs: lookup("RESTRAINT_STEP_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(STEP_TIMEOUT_SECS),
            step_max_retries: lookup("RESTRAINT_STEP_MAX_RETRIES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(STEP_MAX_RETRIES),
            step_recheck_secs: lookup("RESTRAINT_STEP_RECHECK_SECS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(STEP_RECHECK_SECS),
            environment: lookup("ENVIRONMENT")
                .or_else(|| lookup("APP_ENV"))
                .unwrap_or_else(|| "development".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        if self.register_max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "RESTRAINT_REGISTER_MAX_ATTEMPTS must be at least 1"
            ));
        }

        if self.register_backoff_ms > self.register_max_backoff_ms {
            return Err(anyhow::anyhow!(
                "RESTRAINT_REGISTER_BACKOFF_MS cannot exceed RESTRAINT_REGISTER_MAX_BACKOFF_MS"
            ));
        }

        if self.step_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "RESTRAINT_STEP_TIMEOUT_SECS must be greater than zero"
            ));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_seconds)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn step_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.step_recheck_secs)
    }
}
