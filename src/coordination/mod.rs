//! Admit, bound, execute and observe concurrent chat completion requests.

pub mod admission;
pub mod backend;
pub mod coordinator;
pub mod error;
pub mod fallback;
pub mod internal_event;
pub mod management;
pub mod persistence;
pub mod queue;
pub mod rate_limiter;
pub mod request;
pub mod retries;
pub mod session;
pub mod stats;
mod worker;

use std::{env, str::FromStr, time::Duration};

use bon::Builder;
use serde::Deserialize;

use self::{error::ConfigError, retries::JitterMode};

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the coordinator.
///
/// Field names double as the keys of the JSON configuration source
/// (`maxConcurrentChats`, `requestsPerMinute`, ...). Unknown keys are rejected and
/// missing keys take the defaults below.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `max_concurrent_chats` | 5 | Global number of execution slots. Keep it at or below the backend's own concurrency ceiling. |
/// | `max_concurrent_per_user` | 3 | Running + queued requests allowed per user. Submissions beyond it are rejected. |
/// | `requests_per_minute` | 20 | Admissions per user within the rate window. |
/// | `rate_window_secs` | 60 | Length of the trailing rate window. |
/// | `chat_timeout_secs` | 300 | Backend-level timeout. |
/// | `watchdog_timeout_secs` | 60 | Coordinator-enforced upper bound on one execution attempt. Must be shorter than `chat_timeout_secs`. |
/// | `retry_attempts` | 2 | Retries after the first attempt for transient backend errors. |
/// | `retry_initial_backoff_ms` | 500 | First retry delay. Doubles per retry. |
/// | `retry_max_delay_ms` | 5000 | Cap on a single retry delay. |
/// | `jitter_mode` | `full` | Jitter applied to retry delays. |
/// | `cancel_grace_ms` | 5000 | How long a cancelled running request may take to acknowledge before its slot is force-released. |
/// | `circuit_failure_threshold` | 3 | Consecutive concurrent-path failures that open the circuit. |
/// | `circuit_cooldown_secs` | 30 | Time the circuit stays open before a trial is allowed. |
/// | `enable_concurrent_processing` | true | When false every request runs through the sequential lane. |
/// | `session_channel_capacity` | 256 | Buffered events per session before slow observers start lagging. |
///
/// # Example
///
/// ```rust
/// use chat_coordinator::coordination::CoordinatorSettings;
///
/// let settings = CoordinatorSettings::builder()
///     .max_concurrent_chats(3)
///     .max_concurrent_per_user(1)
///     .requests_per_minute(10)
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CoordinatorSettings {
    #[builder(default = default_max_concurrent_chats())]
    pub(super) max_concurrent_chats: usize,

    #[builder(default = default_max_concurrent_per_user())]
    pub(super) max_concurrent_per_user: usize,

    #[builder(default = default_requests_per_minute())]
    pub(super) requests_per_minute: usize,

    #[builder(default = default_rate_window_secs())]
    pub(super) rate_window_secs: u64,

    /// Backend-level timeout. Passed on to backend clients that enforce one.
    #[builder(default = default_chat_timeout_secs())]
    pub(super) chat_timeout_secs: u64,

    #[builder(default = default_watchdog_timeout_secs())]
    pub(super) watchdog_timeout_secs: u64,

    #[builder(default = default_retry_attempts())]
    pub(super) retry_attempts: usize,

    #[builder(default = default_retry_initial_backoff_ms())]
    pub(super) retry_initial_backoff_ms: u64,

    #[builder(default = default_retry_max_delay_ms())]
    pub(super) retry_max_delay_ms: u64,

    #[builder(default)]
    pub(super) jitter_mode: JitterMode,

    #[builder(default = default_cancel_grace_ms())]
    pub(super) cancel_grace_ms: u64,

    #[builder(default = default_circuit_failure_threshold())]
    pub(super) circuit_failure_threshold: u32,

    #[builder(default = default_circuit_cooldown_secs())]
    pub(super) circuit_cooldown_secs: u64,

    #[builder(default = true)]
    pub(super) enable_concurrent_processing: bool,

    #[builder(default = default_session_channel_capacity())]
    pub(super) session_channel_capacity: usize,
}

const fn default_max_concurrent_chats() -> usize {
    5
}

const fn default_max_concurrent_per_user() -> usize {
    3
}

const fn default_requests_per_minute() -> usize {
    20
}

const fn default_rate_window_secs() -> u64 {
    60
}

/// Five minutes, the ceiling a single streamed completion may take at the backend.
const fn default_chat_timeout_secs() -> u64 {
    5 * 60
}

const fn default_watchdog_timeout_secs() -> u64 {
    60
}

const fn default_retry_attempts() -> usize {
    2
}

const fn default_retry_initial_backoff_ms() -> u64 {
    500
}

const fn default_retry_max_delay_ms() -> u64 {
    5_000
}

const fn default_cancel_grace_ms() -> u64 {
    5_000
}

const fn default_circuit_failure_threshold() -> u32 {
    3
}

const fn default_circuit_cooldown_secs() -> u64 {
    30
}

const fn default_session_channel_capacity() -> usize {
    256
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_chats: default_max_concurrent_chats(),
            max_concurrent_per_user: default_max_concurrent_per_user(),
            requests_per_minute: default_requests_per_minute(),
            rate_window_secs: default_rate_window_secs(),
            chat_timeout_secs: default_chat_timeout_secs(),
            watchdog_timeout_secs: default_watchdog_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff_ms: default_retry_initial_backoff_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            jitter_mode: JitterMode::default(),
            cancel_grace_ms: default_cancel_grace_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            enable_concurrent_processing: true,
            session_channel_capacity: default_session_channel_capacity(),
        }
    }
}

// Environment variable names understood by `CoordinatorSettings::from_env`.
const ENV_MAX_CONCURRENT_CHATS: &str = "CHAT_MAX_CONCURRENT_CHATS";
const ENV_MAX_CONCURRENT_PER_USER: &str = "CHAT_MAX_CONCURRENT_PER_USER";
const ENV_REQUESTS_PER_MINUTE: &str = "CHAT_REQUESTS_PER_MINUTE";
const ENV_CHAT_TIMEOUT_SECS: &str = "CHAT_TIMEOUT_SECS";
const ENV_WATCHDOG_TIMEOUT_SECS: &str = "CHAT_WATCHDOG_TIMEOUT_SECS";
const ENV_RETRY_ATTEMPTS: &str = "CHAT_RETRY_ATTEMPTS";
const ENV_CANCEL_GRACE_MS: &str = "CHAT_CANCEL_GRACE_MS";
const ENV_CIRCUIT_FAILURE_THRESHOLD: &str = "CHAT_CIRCUIT_FAILURE_THRESHOLD";
const ENV_CIRCUIT_COOLDOWN_SECS: &str = "CHAT_CIRCUIT_COOLDOWN_SECS";
const ENV_ENABLE_CONCURRENT_PROCESSING: &str = "CHAT_ENABLE_CONCURRENT_PROCESSING";

// Parses an environment variable, keeping the default when it is unset or malformed.
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

impl CoordinatorSettings {
    /// Reads `CHAT_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_concurrent_chats: get_env_var(
                ENV_MAX_CONCURRENT_CHATS,
                defaults.max_concurrent_chats,
            ),
            max_concurrent_per_user: get_env_var(
                ENV_MAX_CONCURRENT_PER_USER,
                defaults.max_concurrent_per_user,
            ),
            requests_per_minute: get_env_var(ENV_REQUESTS_PER_MINUTE, defaults.requests_per_minute),
            chat_timeout_secs: get_env_var(ENV_CHAT_TIMEOUT_SECS, defaults.chat_timeout_secs),
            watchdog_timeout_secs: get_env_var(
                ENV_WATCHDOG_TIMEOUT_SECS,
                defaults.watchdog_timeout_secs,
            ),
            retry_attempts: get_env_var(ENV_RETRY_ATTEMPTS, defaults.retry_attempts),
            cancel_grace_ms: get_env_var(ENV_CANCEL_GRACE_MS, defaults.cancel_grace_ms),
            circuit_failure_threshold: get_env_var(
                ENV_CIRCUIT_FAILURE_THRESHOLD,
                defaults.circuit_failure_threshold,
            ),
            circuit_cooldown_secs: get_env_var(
                ENV_CIRCUIT_COOLDOWN_SECS,
                defaults.circuit_cooldown_secs,
            ),
            enable_concurrent_processing: get_env_var(
                ENV_ENABLE_CONCURRENT_PROCESSING,
                defaults.enable_concurrent_processing,
            ),
            ..defaults
        }
    }

    /// Parses the JSON configuration source.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_json::from_str(raw).map_err(|source| ConfigError::Parse { source })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("maxConcurrentChats", self.max_concurrent_chats),
            ("maxConcurrentPerUser", self.max_concurrent_per_user),
            ("requestsPerMinute", self.requests_per_minute),
            ("sessionChannelCapacity", self.session_channel_capacity),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }
        if self.watchdog_timeout_secs == 0 || self.rate_window_secs == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "watchdogTimeoutSecs/rateWindowSecs",
            });
        }
        if self.watchdog_timeout_secs >= self.chat_timeout_secs {
            return Err(ConfigError::WatchdogNotShorter {
                watchdog_secs: self.watchdog_timeout_secs,
                backend_secs: self.chat_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn max_concurrent_chats(&self) -> usize {
        self.max_concurrent_chats
    }

    pub fn max_concurrent_per_user(&self) -> usize {
        self.max_concurrent_per_user
    }

    pub fn requests_per_minute(&self) -> usize {
        self.requests_per_minute
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    pub fn chat_timeout(&self) -> Duration {
        Duration::from_secs(self.chat_timeout_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }

    pub fn retry_attempts(&self) -> usize {
        self.retry_attempts
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn jitter_mode(&self) -> JitterMode {
        self.jitter_mode
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn circuit_failure_threshold(&self) -> u32 {
        self.circuit_failure_threshold
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    pub fn enable_concurrent_processing(&self) -> bool {
        self.enable_concurrent_processing
    }

    pub fn session_channel_capacity(&self) -> usize {
        self.session_channel_capacity
    }
}
