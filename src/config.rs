use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Environment variable carrying an absolute process deadline, epoch
/// milliseconds. When set, safety-net timers are sized to fire just before
/// the process itself is cut off.
pub const DEADLINE_ENV: &str = "REQPROBE_DEADLINE_AT";

/// Outbound header marking requests generated by the metrics sink itself;
/// such requests are never instrumented.
pub const SINK_MARKER_HEADER: &str = "x-reqprobe-sink";

/// Instrumentation settings. `Default` gives the fixed fallbacks;
/// [`Config::from_env`] additionally picks up the process deadline.
#[derive(Debug, Clone)]
pub struct Config {
    /// Header name whose presence excludes a request from instrumentation.
    pub sink_marker: String,
    /// Absolute deadline (epoch ms) the safety net must beat, if known.
    pub deadline_at: Option<u64>,
    /// Subtracted from the deadline so the report wins the race against
    /// process teardown.
    pub safety_margin: Duration,
    /// Safety-net window when no deadline is known.
    pub fallback_window: Duration,
    /// Outer timeout on the request exchange itself.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sink_marker: String::from(SINK_MARKER_HEADER),
            deadline_at: None,
            safety_margin: Duration::from_millis(500),
            fallback_window: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(DEADLINE_ENV) {
            match raw.parse::<u64>() {
                Ok(ms) => config.deadline_at = Some(ms),
                Err(_) => warn!("ignoring malformed {}={:?}", DEADLINE_ENV, raw),
            }
        }
        config
    }

    /// Duration the safety-net timer should run: time left until the
    /// deadline minus the margin, clamped to a small floor, or the fixed
    /// fallback when no deadline is known.
    pub fn safety_net_window(&self) -> Duration {
        let Some(deadline_at) = self.deadline_at else {
            return self.fallback_window;
        };
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let remaining = Duration::from_millis(deadline_at.saturating_sub(now_ms))
            .saturating_sub(self.safety_margin);
        remaining.max(Duration::from_millis(50))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_window_without_deadline() {
        let config = Config::default();
        assert_eq!(config.safety_net_window(), Duration::from_secs(30));
    }

    #[test]
    fn deadline_window_subtracts_margin() {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let config = Config {
            deadline_at: Some(now_ms + 10_000),
            ..Default::default()
        };
        let window = config.safety_net_window();
        assert!(window <= Duration::from_millis(9_500));
        assert!(window > Duration::from_secs(8));
    }

    #[test]
    fn expired_deadline_clamps_to_floor() {
        let config = Config {
            deadline_at: Some(1),
            ..Default::default()
        };
        assert_eq!(config.safety_net_window(), Duration::from_millis(50));
    }
}
