use std::time::Duration;

use crate::model::{Ms, DAY_MS, MINUTE_MS};

/// Runtime tuning. The hold TTL and generation horizon are product defaults,
/// not architectural constants, so they live here rather than in `limits`.
#[derive(Debug, Clone)]
pub struct Config {
    /// How long a hold pins a slot before the reaper releases it.
    pub hold_ttl_ms: Ms,
    /// How far ahead the materializer generates slots.
    pub horizon_days: u32,
    /// Upper bound on caller-supplied expansion horizons.
    pub max_horizon_days: u32,
    pub reaper_interval: Duration,
    pub materializer_interval: Duration,
    pub busy_sync_interval: Duration,
    pub completion_interval: Duration,
    /// Per-call timeout on payment and calendar capability I/O.
    pub capability_timeout: Duration,
    /// Bounded attempts for payment authorization before surfacing failure.
    pub payment_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 10 * MINUTE_MS,
            horizon_days: 56, // 8 weeks
            max_horizon_days: 90,
            reaper_interval: Duration::from_secs(5),
            materializer_interval: Duration::from_secs(3600),
            busy_sync_interval: Duration::from_secs(300),
            completion_interval: Duration::from_secs(60),
            capability_timeout: Duration::from_secs(5),
            payment_attempts: 3,
        }
    }
}

impl Config {
    /// Read overrides from `BOOKABLE_*` environment variables, falling back
    /// to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hold_ttl_ms: env_parse("BOOKABLE_HOLD_TTL_SECS")
                .map(|s: i64| s * 1000)
                .unwrap_or(defaults.hold_ttl_ms),
            horizon_days: env_parse("BOOKABLE_HORIZON_DAYS").unwrap_or(defaults.horizon_days),
            max_horizon_days: env_parse("BOOKABLE_MAX_HORIZON_DAYS")
                .unwrap_or(defaults.max_horizon_days),
            reaper_interval: env_parse("BOOKABLE_REAPER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            materializer_interval: env_parse("BOOKABLE_MATERIALIZER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.materializer_interval),
            busy_sync_interval: env_parse("BOOKABLE_BUSY_SYNC_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.busy_sync_interval),
            completion_interval: env_parse("BOOKABLE_COMPLETION_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.completion_interval),
            capability_timeout: env_parse("BOOKABLE_CAPABILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.capability_timeout),
            payment_attempts: env_parse("BOOKABLE_PAYMENT_ATTEMPTS")
                .unwrap_or(defaults.payment_attempts),
        }
    }

    pub fn horizon_ms(&self) -> Ms {
        self.horizon_days as Ms * DAY_MS
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_product_settings() {
        let cfg = Config::default();
        assert_eq!(cfg.hold_ttl_ms, 10 * MINUTE_MS);
        assert_eq!(cfg.horizon_days, 56);
        assert_eq!(cfg.horizon_ms(), 56 * DAY_MS);
    }
}
