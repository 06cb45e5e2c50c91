//! Reconnect backoff policy

use std::time::Duration;

/// Ceiling for any reconnect delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff: `base * 1.5^attempt`, capped at [`MAX_BACKOFF`]
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    /// Policy starting from `base` with the default cap
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            cap: MAX_BACKOFF,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1.5_f64.powi(attempt.min(63) as i32);
        let ms = (self.base.as_millis() as f64) * factor;
        let capped = ms.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
