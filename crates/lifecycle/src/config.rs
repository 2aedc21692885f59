//! Runtime configuration for the controller, read from the environment.

use std::time::Duration;

use kform_converge::{WaitOptions, DEFAULT_INITIAL_INTERVAL, DEFAULT_MAX_INTERVAL};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub create_timeout: Duration,
    pub update_timeout: Duration,
    pub delete_timeout: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
    /// Namespace used when the desired configuration leaves it empty.
    pub default_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            create_timeout: DEFAULT_TIMEOUT,
            update_timeout: DEFAULT_TIMEOUT,
            delete_timeout: DEFAULT_TIMEOUT,
            poll_initial: DEFAULT_INITIAL_INTERVAL,
            poll_max: DEFAULT_MAX_INTERVAL,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            create_timeout: env_u64("KFORM_CREATE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.create_timeout),
            update_timeout: env_u64("KFORM_UPDATE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.update_timeout),
            delete_timeout: env_u64("KFORM_DELETE_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.delete_timeout),
            poll_initial: env_u64("KFORM_POLL_INITIAL_MS").map(Duration::from_millis).unwrap_or(d.poll_initial),
            poll_max: env_u64("KFORM_POLL_MAX_MS").map(Duration::from_millis).unwrap_or(d.poll_max),
            default_namespace: std::env::var("KFORM_DEFAULT_NAMESPACE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(d.default_namespace),
        }
    }

    pub fn wait_options(&self, timeout: Duration) -> WaitOptions {
        WaitOptions::new(timeout).with_intervals(self.poll_initial, self.poll_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ControllerConfig::default();
        assert_eq!(c.create_timeout, Duration::from_secs(600));
        assert_eq!(c.poll_initial, Duration::from_millis(500));
        assert_eq!(c.poll_max, Duration::from_secs(10));
        assert_eq!(c.default_namespace, "default");
    }

    #[test]
    fn wait_options_carry_intervals() {
        let c = ControllerConfig { poll_initial: Duration::from_millis(10), poll_max: Duration::from_millis(40), ..Default::default() };
        let o = c.wait_options(Duration::from_secs(1));
        assert_eq!(o.timeout, Duration::from_secs(1));
        assert_eq!(o.initial_interval, Duration::from_millis(10));
        assert_eq!(o.max_interval, Duration::from_millis(40));
    }
}
