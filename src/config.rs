//! Runtime configuration

use std::path::PathBuf;
use std::time::Duration;

/// Bounded-retry policy with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up (initial connect only; reconnects retry
    /// indefinitely at the capped delay)
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (zero-based) retry attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Configuration for the orchestrator and its components
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding identity, prekeys, sessions and contacts
    pub data_dir: PathBuf,
    /// Rendezvous relay URL
    pub relay_url: String,
    /// Signaling connect/reconnect policy
    pub retry: RetryPolicy,
    /// How long a direct-channel negotiation may stay unanswered
    pub negotiation_timeout: Duration,
    /// Inactivity window after which an open direct link is torn down
    pub idle_timeout: Duration,
    /// Local listen address for inbound direct channels
    pub direct_listen: String,
    /// Negotiate direct channels with known contacts on startup
    pub eager_direct: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("cipherlink-data"),
            relay_url: "ws://127.0.0.1:8765".to_string(),
            retry: RetryPolicy::default(),
            negotiation_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            direct_listen: "0.0.0.0:0".to_string(),
            eager_direct: false,
        }
    }
}

impl Config {
    /// Fast timeouts and loopback listening, for tests
    pub fn local_test(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            relay_url: String::new(),
            retry: RetryPolicy {
                attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
            negotiation_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(5),
            direct_listen: "127.0.0.1:0".to_string(),
            eager_direct: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.eager_direct);
        assert_eq!(config.retry.attempts, 5);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryPolicy {
            attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(8), Duration::from_secs(1));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_secs(1));
    }
}
