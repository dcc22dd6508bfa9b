//! Rate limiting for the credential flows.
//!
//! Handlers consult the [`RateLimiter`] seam before touching storage; the
//! default [`FixedWindowRateLimiter`] counts attempts per client IP and per
//! target email in fixed windows. Counters live in process memory, so limits
//! apply per instance.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Counter maps are pruned once they cross this many live keys.
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Clone, Copy, Debug)]
pub enum RateLimitAction {
    Join,
    Login,
    ResetRequest,
}

impl RateLimitAction {
    const fn key(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Login => "login",
            Self::ResetRequest => "reset",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision;
    fn check_email(&self, email: &str, action: RateLimitAction) -> RateLimitDecision;
}

/// Always allows; for tests that exercise the flows without throttling.
#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_ip(&self, _ip: Option<&str>, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn check_email(&self, _email: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}

/// Fixed-window counters keyed by `(action, ip)` and `(action, email)`.
///
/// A window opens on the first attempt for a key and every attempt inside it
/// counts toward the cap; once the window elapses the next attempt starts a
/// fresh one. Requests with no resolvable IP skip the IP check rather than
/// sharing one bucket.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    window: Duration,
    max_per_ip: u32,
    max_per_email: u32,
    counters: Mutex<HashMap<String, (Instant, u32)>>,
}

impl FixedWindowRateLimiter {
    /// Defaults: 15 minute windows, 30 attempts per IP, 10 per email.
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            max_per_ip: 30,
            max_per_email: 10,
            counters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_max_per_ip(mut self, max_per_ip: u32) -> Self {
        self.max_per_ip = max_per_ip;
        self
    }

    #[must_use]
    pub fn with_max_per_email(mut self, max_per_email: u32) -> Self {
        self.max_per_email = max_per_email;
        self
    }

    fn bump(&self, key: String, max: u32) -> RateLimitDecision {
        let now = Instant::now();
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if counters.len() > PRUNE_THRESHOLD {
            let window = self.window;
            counters.retain(|_, (started, _)| now.duration_since(*started) < window);
        }

        let entry = counters.entry(key).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= max {
            return RateLimitDecision::Limited;
        }
        entry.1 += 1;
        RateLimitDecision::Allowed
    }
}

impl Default for FixedWindowRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter for FixedWindowRateLimiter {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision {
        let Some(ip) = ip else {
            return RateLimitDecision::Allowed;
        };
        self.bump(format!("ip:{}:{ip}", action.key()), self.max_per_ip)
    }

    fn check_email(&self, email: &str, action: RateLimitAction) -> RateLimitDecision {
        self.bump(format!("email:{}:{email}", action.key()), self.max_per_email)
    }
}
