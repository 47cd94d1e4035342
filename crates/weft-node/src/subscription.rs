//! Client-side subscription tracking
//!
//! Mirrors the server's keepalive contract: a subscription is alive while
//! reports keep arriving within the max interval plus a grace allowance.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use weft_core::observable::Observable;

/// Slack on top of the max interval before a subscription counts as dead.
const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// The controller's view of one server-side subscription.
pub struct ClientSubscription {
    pub id: u32,
    pub min_interval: Duration,
    pub max_interval: Duration,
    last_report: Mutex<Instant>,
    /// Emitted with `true` on each report, `false` once reports stop.
    pub status_changed: Observable<bool>,
}

impl ClientSubscription {
    pub fn new(id: u32, min_interval: Duration, max_interval: Duration, now: Instant) -> Self {
        Self {
            id,
            min_interval,
            max_interval,
            last_report: Mutex::new(now),
            status_changed: Observable::new(),
        }
    }

    /// Record an incoming report (data or keepalive).
    pub fn report_received(&self, now: Instant) {
        *self.last_report.lock() = now;
        self.status_changed.emit(&true);
    }

    /// Whether the subscription still counts as alive at `now`.
    pub fn is_alive(&self, now: Instant) -> bool {
        now.duration_since(*self.last_report.lock()) <= self.max_interval + KEEPALIVE_GRACE
    }

    /// Check liveness and emit `status_changed(false)` on expiry.
    pub fn check(&self, now: Instant) -> bool {
        let alive = self.is_alive(now);
        if !alive {
            self.status_changed.emit(&false);
        }
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_alive_within_interval() {
        let t0 = Instant::now();
        let subscription =
            ClientSubscription::new(1, Duration::from_secs(0), Duration::from_secs(60), t0);
        assert!(subscription.is_alive(t0 + Duration::from_secs(30)));
        assert!(subscription.is_alive(t0 + Duration::from_secs(64)));
        assert!(!subscription.is_alive(t0 + Duration::from_secs(66)));
    }

    #[test]
    fn test_report_refreshes() {
        let t0 = Instant::now();
        let subscription =
            ClientSubscription::new(1, Duration::from_secs(0), Duration::from_secs(60), t0);
        subscription.report_received(t0 + Duration::from_secs(60));
        assert!(subscription.is_alive(t0 + Duration::from_secs(120)));
    }

    #[test]
    fn test_check_emits_on_expiry() {
        let t0 = Instant::now();
        let subscription =
            ClientSubscription::new(1, Duration::from_secs(0), Duration::from_secs(1), t0);
        let dead_signals = Arc::new(AtomicU32::new(0));
        let seen = dead_signals.clone();
        subscription.status_changed.on(move |alive| {
            if !alive {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(subscription.check(t0));
        assert!(!subscription.check(t0 + Duration::from_secs(10)));
        assert_eq!(dead_signals.load(Ordering::SeqCst), 1);
    }
}
