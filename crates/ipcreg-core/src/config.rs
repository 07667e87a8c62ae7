//! Registry configuration

use std::time::Duration;

/// Well-known name of the registry segment
pub const DEFAULT_SHM_NAME: &str = "/ipcreg_p2p";

/// Interval between probe passes of a blocking lookup
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long an attacher waits for the creator to finish initializing
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Registry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Shared memory object name, with a leading `/`
    pub shm_name: String,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            shm_name: DEFAULT_SHM_NAME.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }
}
