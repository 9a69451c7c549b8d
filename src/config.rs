//! Tunables and protocol constants.
//!
//! The constants mirror the wire protocol's preferences (chunk cap) and the
//! pool-management cadence; the only runtime tunables are environment
//! integers read once at construction.

use std::time::Duration;
use tracing::warn;

/// Upper bound on a single range segment, in bytes.
pub const MAX_CHUNK: u64 = 512 * 1024;

/// Cadence for source checks while the pool is short of replicas.
pub(crate) const SHORT_OPEN_DELAY: Duration = Duration::from_secs(5);

/// Cadence for source checks once two replicas are active, and the back-off
/// applied after a failed or duplicate open.
pub(crate) const LONG_OPEN_DELAY: Duration = Duration::from_secs(2 * 60);

/// Chance, in percent, of a speculative open when the pool has been stable
/// for a full [`LONG_OPEN_DELAY`].
pub(crate) const OPEN_PROBE_PERCENT: u32 = 10;

/// Minimal quality difference required to swap an active and inactive source.
pub(crate) const SOURCE_QUALITY_FUDGE: u32 = 100;

/// Quality above which an active source is demoted outright.
pub(crate) const QUALITY_HARD_LIMIT: u32 = 5130;

/// Quality above which an active source is demoted when its peer is at least
/// four times better.
pub(crate) const QUALITY_SOFT_LIMIT: u32 = 260;

/// Attempts for the initial synchronous open.
pub(crate) const OPEN_RETRIES: usize = 5;

/// Grace added on top of the stream-error window for bounded waits during
/// failure recovery and shutdown.
pub(crate) const OPEN_WAIT_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Environment variable overriding the stream-error window, in seconds.
pub const STREAM_ERROR_WINDOW_ENV: &str = "XRDMUX_STREAM_ERROR_WINDOW";

/// Environment variable carrying the monitoring job id.
pub const MONITOR_ID_ENV: &str = "XRDMUX_MONITOR_ID";

/// Runtime tunables, resolved once at manager construction.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Stream-error window: the bound on recovery waits (plus a fixed 10 s
    /// grace). Default 180 s.
    pub timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Settings {
    /// Reads overrides from the environment.
    ///
    /// An unparsable value is ignored with a warning rather than failing the
    /// open.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Ok(value) = std::env::var(STREAM_ERROR_WINDOW_ENV) {
            match value.parse::<u64>() {
                Ok(secs) => settings.timeout = Duration::from_secs(secs),
                Err(_) => warn!(
                    value = %value,
                    "Ignoring unparsable stream-error window override"
                ),
            }
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout_is_three_minutes() {
        assert_eq!(Settings::default().timeout, Duration::from_secs(180));
    }

    #[test]
    fn test_env_override_and_invalid_value() {
        std::env::set_var(STREAM_ERROR_WINDOW_ENV, "60");
        assert_eq!(Settings::from_env().timeout, Duration::from_secs(60));

        std::env::set_var(STREAM_ERROR_WINDOW_ENV, "not-a-number");
        assert_eq!(Settings::from_env().timeout, Duration::from_secs(180));

        std::env::remove_var(STREAM_ERROR_WINDOW_ENV);
        assert_eq!(Settings::from_env().timeout, Duration::from_secs(180));
    }
}
