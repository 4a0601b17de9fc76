use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Controller settings, read from `GAMEFLEET_*` environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// Non-live revisions kept per deployment unless the spec overrides it.
    pub revision_history_limit: usize,
    pub expectation_timeout_secs: u64,
    /// Requeue delay while expectations are unsatisfied.
    pub expectation_recheck_secs: u64,
    /// Deadline for each cluster call.
    pub call_timeout_secs: u64,
    /// Deadline for a whole reconcile pass.
    pub pass_timeout_secs: u64,
    pub status_update_retries: u32,
    /// Recheck interval while a hook run is in flight.
    pub hook_poll_secs: u64,
    pub queue_base_delay_ms: u64,
    pub queue_max_delay_secs: u64,
    pub log_level: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            revision_history_limit: 10,
            expectation_timeout_secs: 300,
            expectation_recheck_secs: 5,
            call_timeout_secs: 10,
            pass_timeout_secs: 60,
            status_update_retries: 5,
            hook_poll_secs: 10,
            queue_base_delay_ms: 5,
            queue_max_delay_secs: 1000,
            log_level: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            workers: env_or("GAMEFLEET_WORKERS", defaults.workers)?,
            revision_history_limit: env_or(
                "GAMEFLEET_REVISION_HISTORY_LIMIT",
                defaults.revision_history_limit,
            )?,
            expectation_timeout_secs: env_or(
                "GAMEFLEET_EXPECTATION_TIMEOUT_SECS",
                defaults.expectation_timeout_secs,
            )?,
            expectation_recheck_secs: env_or(
                "GAMEFLEET_EXPECTATION_RECHECK_SECS",
                defaults.expectation_recheck_secs,
            )?,
            call_timeout_secs: env_or("GAMEFLEET_CALL_TIMEOUT_SECS", defaults.call_timeout_secs)?,
            pass_timeout_secs: env_or("GAMEFLEET_PASS_TIMEOUT_SECS", defaults.pass_timeout_secs)?,
            status_update_retries: env_or(
                "GAMEFLEET_STATUS_UPDATE_RETRIES",
                defaults.status_update_retries,
            )?,
            hook_poll_secs: env_or("GAMEFLEET_HOOK_POLL_SECS", defaults.hook_poll_secs)?,
            queue_base_delay_ms: env_or(
                "GAMEFLEET_QUEUE_BASE_DELAY_MS",
                defaults.queue_base_delay_ms,
            )?,
            queue_max_delay_secs: env_or(
                "GAMEFLEET_QUEUE_MAX_DELAY_SECS",
                defaults.queue_max_delay_secs,
            )?,
            log_level: std::env::var("GAMEFLEET_LOG_LEVEL").unwrap_or(defaults.log_level),
        };

        if config.workers == 0 {
            anyhow::bail!("GAMEFLEET_WORKERS must be at least 1");
        }

        Ok(config)
    }

    pub fn expectation_timeout(&self) -> Duration {
        Duration::from_secs(self.expectation_timeout_secs)
    }

    pub fn expectation_recheck(&self) -> Duration {
        Duration::from_secs(self.expectation_recheck_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_timeout_secs)
    }

    pub fn hook_poll(&self) -> Duration {
        Duration::from_secs(self.hook_poll_secs)
    }

    pub fn queue_base_delay(&self) -> Duration {
        Duration::from_millis(self.queue_base_delay_ms)
    }

    pub fn queue_max_delay(&self) -> Duration {
        Duration::from_secs(self.queue_max_delay_secs)
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
