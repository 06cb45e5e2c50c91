//! Sliding-window rate limiting
//!
//! Each socket carries one limiter: a global window plus per-event windows
//! for events with a registered override. An event without an override
//! falls through to the global window. Denials are soft — the caller sends
//! a `__rate-limited__` notification and drops the frame.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which window refused the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// Default per-socket window
    Global,
    /// Per-event override window
    Event,
}

impl LimitScope {
    /// Stable wire code for this denial
    pub fn code(self) -> &'static str {
        match self {
            Self::Global => skein_protocol::error::codes::RATE_LIMITED,
            Self::Event => skein_protocol::error::codes::EVENT_RATE_LIMITED,
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Frame may be dispatched
    Allowed,
    /// Frame must be dropped; the window frees up after `retry_after`
    Denied {
        /// Which window refused
        scope: LimitScope,
        /// Time until the oldest hit leaves the window
        retry_after: Duration,
    },
}

/// Ring of admission timestamps truncated to the window length
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max: usize,
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create a window admitting `max` hits per `window`
    pub fn new(window: Duration, max: usize) -> Self {
        Self {
            window,
            max,
            hits: VecDeque::with_capacity(max.min(64)),
        }
    }

    /// Drop hits older than the window, then admit if capacity remains
    pub fn admit(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() < self.max {
            self.hits.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest hit ages out
    pub fn retry_after(&self, now: Instant) -> Duration {
        self.hits
            .front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Forget all hits
    pub fn reset(&mut self) {
        self.hits.clear();
    }
}

/// Limiter settings shared across sockets
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Master switch
    pub enabled: bool,
    /// Default window length
    pub window: Duration,
    /// Default hits per window
    pub max_requests: usize,
    /// Overrides keyed by event name: (window, max)
    pub per_event: Arc<HashMap<String, (Duration, usize)>>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(1000),
            max_requests: 100,
            per_event: Arc::new(HashMap::new()),
        }
    }
}

/// Per-socket limiter state
#[derive(Debug)]
pub struct SocketRateLimiter {
    config: RateLimitConfig,
    global: SlidingWindow,
    per_event: HashMap<String, SlidingWindow>,
}

impl SocketRateLimiter {
    /// Create limiter state for a new socket
    pub fn new(config: RateLimitConfig) -> Self {
        let global = SlidingWindow::new(config.window, config.max_requests);
        Self {
            config,
            global,
            per_event: HashMap::new(),
        }
    }

    /// Admit or refuse one inbound frame for `event`
    pub fn admit(&mut self, event: &str, now: Instant) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }
        match self.config.per_event.get(event) {
            Some((window, max)) => {
                let win = self
                    .per_event
                    .entry(event.to_string())
                    .or_insert_with(|| SlidingWindow::new(*window, *max));
                if win.admit(now) {
                    Admission::Allowed
                } else {
                    Admission::Denied {
                        scope: LimitScope::Event,
                        retry_after: win.retry_after(now),
                    }
                }
            }
            None => {
                if self.global.admit(now) {
                    Admission::Allowed
                } else {
                    Admission::Denied {
                        scope: LimitScope::Global,
                        retry_after: self.global.retry_after(now),
                    }
                }
            }
        }
    }

    /// Clear one event window, or every window
    pub fn reset(&mut self, event: Option<&str>) {
        match event {
            Some(event) => {
                if let Some(win) = self.per_event.get_mut(event) {
                    win.reset();
                }
            }
            None => {
                self.global.reset();
                for win in self.per_event.values_mut() {
                    win.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(window_ms: u64, max: usize) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window: Duration::from_millis(window_ms),
            max_requests: max,
            per_event: Arc::new(HashMap::new()),
        }
    }

    #[test]
    fn test_window_admits_up_to_max() {
        let mut limiter = SocketRateLimiter::new(config(1000, 3));
        let t0 = Instant::now();

        for i in 0..3 {
            assert_eq!(
                limiter.admit("say", t0 + Duration::from_millis(i)),
                Admission::Allowed
            );
        }
        match limiter.admit("say", t0 + Duration::from_millis(10)) {
            Admission::Denied { scope, retry_after } => {
                assert_eq!(scope, LimitScope::Global);
                assert!(retry_after <= Duration::from_millis(1000));
                assert!(retry_after >= Duration::from_millis(900));
            }
            Admission::Allowed => panic!("fourth frame must be denied"),
        }
    }

    #[test]
    fn test_window_frees_after_expiry() {
        let mut limiter = SocketRateLimiter::new(config(1000, 3));
        let t0 = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.admit("say", t0), Admission::Allowed);
        }
        assert!(matches!(
            limiter.admit("say", t0 + Duration::from_millis(500)),
            Admission::Denied { .. }
        ));
        // Oldest hits age out after the window passes
        assert_eq!(
            limiter.admit("say", t0 + Duration::from_millis(1001)),
            Admission::Allowed
        );
    }

    #[test]
    fn test_at_most_max_in_any_window_interval() {
        let window = Duration::from_millis(1000);
        let mut limiter = SocketRateLimiter::new(config(1000, 5));
        let t0 = Instant::now();

        // Fire at a steady 10ms cadence, recording admitted timestamps
        let mut admitted: Vec<Instant> = Vec::new();
        for i in 0..300u64 {
            let now = t0 + Duration::from_millis(i * 10);
            if limiter.admit("x", now) == Admission::Allowed {
                admitted.push(now);
            }
        }

        // No window-length interval contains more than 5 admissions
        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < window)
                .count();
            assert!(in_window <= 5, "interval starting at {i} saw {in_window}");
        }
    }

    #[test]
    fn test_per_event_override_used_for_named_event() {
        let mut per_event = HashMap::new();
        per_event.insert("upload".to_string(), (Duration::from_millis(1000), 1));
        let mut limiter = SocketRateLimiter::new(RateLimitConfig {
            enabled: true,
            window: Duration::from_millis(1000),
            max_requests: 100,
            per_event: Arc::new(per_event),
        });
        let t0 = Instant::now();

        assert_eq!(limiter.admit("upload", t0), Admission::Allowed);
        match limiter.admit("upload", t0 + Duration::from_millis(1)) {
            Admission::Denied { scope, .. } => assert_eq!(scope, LimitScope::Event),
            Admission::Allowed => panic!("override must cap at 1"),
        }
        // Unrelated events fall through to the roomy global window
        assert_eq!(limiter.admit("say", t0), Admission::Allowed);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let mut limiter = SocketRateLimiter::new(RateLimitConfig {
            enabled: false,
            window: Duration::from_millis(10),
            max_requests: 0,
            per_event: Arc::new(HashMap::new()),
        });
        let t0 = Instant::now();
        for _ in 0..100 {
            assert_eq!(limiter.admit("say", t0), Admission::Allowed);
        }
    }

    #[test]
    fn test_reset_clears_window() {
        let mut limiter = SocketRateLimiter::new(config(1000, 1));
        let t0 = Instant::now();
        assert_eq!(limiter.admit("say", t0), Admission::Allowed);
        assert!(matches!(limiter.admit("say", t0), Admission::Denied { .. }));

        limiter.reset(None);
        assert_eq!(limiter.admit("say", t0), Admission::Allowed);
    }

    #[test]
    fn test_scope_codes() {
        assert_eq!(LimitScope::Global.code(), "rate_limited");
        assert_eq!(LimitScope::Event.code(), "event_rate_limited");
    }
}
