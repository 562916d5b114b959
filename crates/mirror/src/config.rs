use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime knobs of a mirror. Durations are kept as integers so the struct stays plain data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MirrorConfig {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_factor: f64,
    /// Fraction of each delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
    /// Forced resync interval while watching; 0 disables it.
    pub resync_secs: u64,
    /// Server-side watch timeout requested from the source.
    pub watch_timeout_secs: u32,
    /// Upper bound of events applied under one store write.
    pub max_batch: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 800,
            backoff_max_ms: 30_000,
            backoff_factor: 2.0,
            jitter: 0.5,
            resync_secs: 300,
            watch_timeout_secs: 290,
            max_batch: 256,
        }
    }
}

impl MirrorConfig {
    /// Defaults overridden by `KMIRROR_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u64>("KMIRROR_WATCH_BACKOFF_MAX_SECS") {
            cfg.backoff_max_ms = v.saturating_mul(1000);
        }
        if let Some(v) = env_parse::<u64>("KMIRROR_RELIST_SECS") {
            cfg.resync_secs = v;
        }
        if let Some(v) = env_parse::<u32>("KMIRROR_WATCH_TIMEOUT_SECS") {
            cfg.watch_timeout_secs = v;
        }
        if let Some(v) = env_parse::<usize>("KMIRROR_MAX_BATCH") {
            cfg.max_batch = v.max(1);
        }
        cfg
    }

    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults_and_ignores_garbage() {
        std::env::set_var("KMIRROR_WATCH_BACKOFF_MAX_SECS", "12");
        std::env::set_var("KMIRROR_RELIST_SECS", "0");
        std::env::set_var("KMIRROR_WATCH_TIMEOUT_SECS", "60");
        std::env::set_var("KMIRROR_MAX_BATCH", "0");
        let cfg = MirrorConfig::from_env();
        for key in ["KMIRROR_WATCH_BACKOFF_MAX_SECS", "KMIRROR_RELIST_SECS", "KMIRROR_WATCH_TIMEOUT_SECS", "KMIRROR_MAX_BATCH"] {
            std::env::remove_var(key);
        }

        assert_eq!(cfg.backoff_max_ms, 12_000);
        assert_eq!(cfg.resync_period(), None);
        assert_eq!(cfg.watch_timeout_secs, 60);
        assert_eq!(cfg.max_batch, 1);
        assert_eq!(cfg.backoff_initial_ms, MirrorConfig::default().backoff_initial_ms);

        // unparsable values keep the default
        std::env::set_var("KMIRROR_WATCH_TIMEOUT_SECS", "soon");
        let cfg = MirrorConfig::from_env();
        std::env::remove_var("KMIRROR_WATCH_TIMEOUT_SECS");
        assert_eq!(cfg.watch_timeout_secs, 290);
        assert_eq!(cfg.resync_period(), Some(Duration::from_secs(300)));
    }
}
