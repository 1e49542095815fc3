//! Fixed-window, per-client rate limiting.
//!
//! Used by front-ends that sit in front of the core (a server surface, a
//! shared CLI daemon). A client that exhausts its window is blocked until
//! the oldest in-window request ages out. `record_success` /
//! `record_failure` can retroactively exclude a request from the window
//! when the corresponding `skip_*` option is set, so that (for example)
//! failed requests do not consume quota.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-call limiter options.
#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Maximum requests per client within a window.
    pub max_requests: usize,
    /// When true, a later `record_success` removes the request from the window.
    pub skip_successful_requests: bool,
    /// When true, a later `record_failure` removes the request from the window.
    pub skip_failed_requests: bool,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 60,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// The request may proceed; `remaining` is the quota left in the window.
    Allowed { remaining: usize },
    /// The client is blocked; retry after the given delay.
    Blocked { retry_after_ms: u64 },
}

struct ClientWindow {
    requests: VecDeque<Instant>,
}

/// Fixed-window rate limiter keyed by client id.
///
/// # Example
///
/// ```rust
/// use automatosx::rate_limiter::{RateLimitDecision, RateLimitOptions, RateLimiter};
///
/// let limiter = RateLimiter::new();
/// let opts = RateLimitOptions { window_ms: 1_000, max_requests: 2, ..Default::default() };
///
/// assert!(matches!(limiter.check("cli", &opts), RateLimitDecision::Allowed { .. }));
/// assert!(matches!(limiter.check("cli", &opts), RateLimitDecision::Allowed { remaining: 0 }));
/// assert!(matches!(limiter.check("cli", &opts), RateLimitDecision::Blocked { .. }));
/// ```
pub struct RateLimiter {
    clients: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record a request for `client`.
    ///
    /// Requests older than the window are aged out before counting. When
    /// the window is full the request is not recorded and the caller
    /// receives the delay until the oldest in-window request expires.
    pub fn check(&self, client: &str, options: &RateLimitOptions) -> RateLimitDecision {
        let now = Instant::now();
        let window = Duration::from_millis(options.window_ms);
        let mut clients = self.clients.lock().unwrap();
        let entry = clients
            .entry(client.to_string())
            .or_insert_with(|| ClientWindow {
                requests: VecDeque::new(),
            });

        while let Some(front) = entry.requests.front() {
            if now.duration_since(*front) >= window {
                entry.requests.pop_front();
            } else {
                break;
            }
        }

        if entry.requests.len() >= options.max_requests {
            let oldest = *entry.requests.front().expect("non-empty window");
            let elapsed = now.duration_since(oldest);
            let retry_after = window.saturating_sub(elapsed);
            return RateLimitDecision::Blocked {
                retry_after_ms: retry_after.as_millis() as u64,
            };
        }

        entry.requests.push_back(now);
        RateLimitDecision::Allowed {
            remaining: options.max_requests - entry.requests.len(),
        }
    }

    /// Record that the client's most recent request succeeded.
    ///
    /// When `skip_successful_requests` is set, the request is removed from
    /// the window so it no longer counts against the quota.
    pub fn record_success(&self, client: &str, options: &RateLimitOptions) {
        if options.skip_successful_requests {
            self.forget_latest(client);
        }
    }

    /// Record that the client's most recent request failed.
    ///
    /// When `skip_failed_requests` is set, the request is removed from the
    /// window so it no longer counts against the quota.
    pub fn record_failure(&self, client: &str, options: &RateLimitOptions) {
        if options.skip_failed_requests {
            self.forget_latest(client);
        }
    }

    /// Drop all state for a client (e.g. on disconnect).
    pub fn reset(&self, client: &str) {
        self.clients.lock().unwrap().remove(client);
    }

    fn forget_latest(&self, client: &str) {
        let mut clients = self.clients.lock().unwrap();
        if let Some(entry) = clients.get_mut(client) {
            entry.requests.pop_back();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(window_ms: u64, max: usize) -> RateLimitOptions {
        RateLimitOptions {
            window_ms,
            max_requests: max,
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    #[test]
    fn blocks_after_quota_and_reports_retry_delay() {
        let limiter = RateLimiter::new();
        let options = opts(10_000, 2);

        assert_eq!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        match limiter.check("a", &options) {
            RateLimitDecision::Blocked { retry_after_ms } => {
                assert!(retry_after_ms <= 10_000);
            }
            other => panic!("expected blocked, got {:?}", other),
        }
    }

    #[test]
    fn clients_are_independent() {
        let limiter = RateLimiter::new();
        let options = opts(10_000, 1);

        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("b", &options),
            RateLimitDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Blocked { .. }
        ));
    }

    #[test]
    fn skipped_failures_release_quota() {
        let limiter = RateLimiter::new();
        let options = RateLimitOptions {
            window_ms: 10_000,
            max_requests: 1,
            skip_successful_requests: false,
            skip_failed_requests: true,
        };

        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { .. }
        ));
        limiter.record_failure("a", &options);
        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn window_ages_out() {
        let limiter = RateLimiter::new();
        let options = opts(5, 1);

        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { .. }
        ));
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(
            limiter.check("a", &options),
            RateLimitDecision::Allowed { .. }
        ));
    }
}
