//! Runtime configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use acrt_drv::MAX_DEVICE_NUM;
use tracing::warn;

use crate::mem_pool::PoolPolicy;
use crate::spin::SpinPolicy;

/// Where the "current context" and subscribe ids live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Hosted OS threads: thread-local current context, subscription table
    /// keyed by thread id.
    Hosted,
    /// Embedded task scheduler: a mutex-guarded table keyed by task id, and
    /// the task id doubles as the subscribe id.
    TaskTable,
}

impl Default for Platform {
    fn default() -> Self {
        if cfg!(feature = "task-table") {
            Self::TaskTable
        } else {
            Self::Hosted
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hosted => write!(f, "hosted"),
            Self::TaskTable => write!(f, "task-table"),
        }
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hosted" | "thread-local" => Ok(Self::Hosted),
            "task-table" | "tasktable" => Ok(Self::TaskTable),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Current-context and subscription backend
    pub platform: Platform,
    /// Number of device slots
    pub max_devices: u32,
    /// Upper bound on live contexts
    pub context_pool_capacity: u32,
    /// Whether freed context nodes are reused
    pub context_pool_policy: PoolPolicy,
    /// Busy-wait behavior of reference counters
    pub spin: SpinPolicy,
    /// Bound on `stream_synchronize`; `None` waits forever
    pub stream_sync_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            max_devices: MAX_DEVICE_NUM,
            context_pool_capacity: 1024,
            context_pool_policy: PoolPolicy::Reuse,
            spin: SpinPolicy::DEFAULT,
            stream_sync_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `ACRT_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(platform) = env_parse("ACRT_PLATFORM") {
            config.platform = platform;
        }
        if let Some(max) = env_parse("ACRT_MAX_DEVICES") {
            config.max_devices = max;
        }
        if let Some(cap) = env_parse("ACRT_CONTEXT_POOL_CAPACITY") {
            config.context_pool_capacity = cap;
        }
        if let Some(reuse) = env_parse::<u8>("ACRT_CONTEXT_POOL_REUSE") {
            config.context_pool_policy = if reuse == 0 {
                PoolPolicy::Release
            } else {
                PoolPolicy::Reuse
            };
        }
        if let Some(limit) = env_parse("ACRT_SPIN_RETRY_LIMIT") {
            config.spin.retry_limit = Some(limit);
        }
        if let Some(ms) = env_parse("ACRT_SYNC_TIMEOUT_MS") {
            config.stream_sync_timeout = Some(Duration::from_millis(ms));
        }
        config
    }

    /// Set the platform backend
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Set the number of device slots
    #[must_use]
    pub fn with_max_devices(mut self, max_devices: u32) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Set the context pool capacity and policy
    #[must_use]
    pub fn with_context_pool(mut self, capacity: u32, policy: PoolPolicy) -> Self {
        self.context_pool_capacity = capacity;
        self.context_pool_policy = policy;
        self
    }

    /// Set the spin policy
    #[must_use]
    pub fn with_spin(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Set the synchronize timeout
    #[must_use]
    pub fn with_stream_sync_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stream_sync_timeout = timeout;
        self
    }
}

fn env_parse<T>(key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {key}={raw}: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_devices, MAX_DEVICE_NUM);
        assert_eq!(config.context_pool_capacity, 1024);
        assert_eq!(config.context_pool_policy, PoolPolicy::Reuse);
        assert_eq!(config.spin.retry_limit, None);
        assert_eq!(config.spin.yield_interval, 1024);
        assert!(config.stream_sync_timeout.is_none());
    }

    #[test]
    fn platform_parses_both_spellings() {
        assert_eq!("hosted".parse::<Platform>(), Ok(Platform::Hosted));
        assert_eq!(" Task-Table ".parse::<Platform>(), Ok(Platform::TaskTable));
        assert!("bare-metal".parse::<Platform>().is_err());
        assert_eq!(Platform::TaskTable.to_string(), "task-table");
    }

    #[test]
    fn builders_override_fields() {
        let config = RuntimeConfig::default()
            .with_platform(Platform::TaskTable)
            .with_max_devices(2)
            .with_context_pool(8, PoolPolicy::Release)
            .with_stream_sync_timeout(Some(Duration::from_millis(5)));
        assert_eq!(config.platform, Platform::TaskTable);
        assert_eq!(config.max_devices, 2);
        assert_eq!(config.context_pool_capacity, 8);
        assert_eq!(config.context_pool_policy, PoolPolicy::Release);
        assert_eq!(config.stream_sync_timeout, Some(Duration::from_millis(5)));
    }
}
