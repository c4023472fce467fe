use core::time::Duration;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use tracing::warn;

use crate::transport::ConnectionId;

/// Sliding window width.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Requests allowed per window per client.
pub const WINDOW_CAP: usize = 1500;

/// Throttle count at which the client should be disconnected.
pub const DISCONNECT_AFTER: u32 = 10;

/// Idle windows after which a client's counters reset and its record is
/// dropped.
pub const IDLE_RESET_WINDOWS: u32 = 10;

/// How often the cleanup sweep runs (disabled under a test environment).
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(15);

/// What to do with an inbound message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RateDecision {
    Allow,
    /// Over the cap: delay processing until the window frees up.
    Throttle { delay: Duration },
    /// Sustained abuse: drop the connection.
    Disconnect,
}

#[derive(Debug)]
struct ClientWindow {
    hits: VecDeque<Instant>,
    throttles: u32,
    last_seen: Instant,
}

/// Per-client sliding-window rate limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    clients: HashMap<ConnectionId, ClientWindow>,
}

impl RateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one inbound message for `conn` and decide its fate.
    pub fn check(&mut self, conn: ConnectionId, now: Instant) -> RateDecision {
        let client = self.clients.entry(conn).or_insert_with(|| ClientWindow {
            hits: VecDeque::new(),
            throttles: 0,
            last_seen: now,
        });
        client.last_seen = now;

        while let Some(&oldest) = client.hits.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                let _ = client.hits.pop_front();
            } else {
                break;
            }
        }

        if client.hits.len() < WINDOW_CAP {
            client.hits.push_back(now);
            return RateDecision::Allow;
        }

        client.throttles += 1;
        if client.throttles >= DISCONNECT_AFTER {
            warn!(conn, throttles = client.throttles, "rate limit: disconnecting client");
            return RateDecision::Disconnect;
        }

        let oldest = client.hits.front().copied().unwrap_or(now);
        let delay = WINDOW.saturating_sub(now.saturating_duration_since(oldest));
        warn!(conn, ?delay, "rate limit: throttling client");
        RateDecision::Throttle { delay }
    }

    /// Forget a disconnected client.
    pub fn remove(&mut self, conn: ConnectionId) {
        let _ = self.clients.remove(&conn);
    }

    /// Drop records idle for [`IDLE_RESET_WINDOWS`] windows; their
    /// throttle counters reset with them.
    pub fn cleanup(&mut self, now: Instant) {
        self.clients.retain(|_, client| {
            now.saturating_duration_since(client.last_seen) < WINDOW * IDLE_RESET_WINDOWS
        });
    }

    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_the_cap_everything_is_allowed() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..WINDOW_CAP {
            assert_eq!(limiter.check(7, now), RateDecision::Allow);
        }
    }

    #[test]
    fn over_the_cap_throttles_with_window_remainder() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..WINDOW_CAP {
            let _ = limiter.check(7, now);
        }

        match limiter.check(7, now) {
            RateDecision::Throttle { delay } => {
                // The oldest hit is `now`, so the full window remains.
                assert_eq!(delay, WINDOW);
            }
            other => panic!("expected a throttle, got {other:?}"),
        }
    }

    #[test]
    fn sustained_breach_disconnects() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..WINDOW_CAP {
            let _ = limiter.check(7, now);
        }

        let mut saw_disconnect = false;
        for _ in 0..DISCONNECT_AFTER {
            if limiter.check(7, now) == RateDecision::Disconnect {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
    }

    #[test]
    fn windows_are_per_client() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        for _ in 0..WINDOW_CAP {
            let _ = limiter.check(1, now);
        }
        assert!(matches!(
            limiter.check(1, now),
            RateDecision::Throttle { .. }
        ));
        assert_eq!(limiter.check(2, now), RateDecision::Allow);
    }

    #[test]
    fn cleanup_drops_idle_clients() {
        let mut limiter = RateLimiter::new();
        let now = Instant::now();
        let _ = limiter.check(1, now);
        assert_eq!(limiter.tracked_clients(), 1);

        limiter.cleanup(now + WINDOW * (IDLE_RESET_WINDOWS + 1));
        assert_eq!(limiter.tracked_clients(), 0);
    }
}
