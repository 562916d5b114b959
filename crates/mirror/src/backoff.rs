use std::time::Duration;

use rand::Rng;

use crate::MirrorConfig;

/// Capped exponential backoff with jitter. Delays never exceed `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, factor: f64, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        let factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        Self { initial, max: max.max(initial), factor, jitter, attempt: 0 }
    }

    pub fn from_config(cfg: &MirrorConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_initial_ms),
            Duration::from_millis(cfg.backoff_max_ms),
            cfg.backoff_factor,
            cfg.jitter,
        )
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the current attempt.
    fn base(&self) -> Duration {
        let exp = self.factor.powi(self.attempt.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base();
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return base;
        }
        let cut = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 - cut)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
