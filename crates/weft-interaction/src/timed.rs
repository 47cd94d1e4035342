//! Timed interactions
//!
//! A TimedRequest arms a short window during which exactly one Write or
//! Invoke flagged `timedRequest` is admitted. The pending state clears on
//! acceptance, success or failure alike.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use weft_core::{Error, Result};

/// Window bounds in milliseconds.
pub const MIN_TIMED_WINDOW_MS: u16 = 1;
pub const MAX_TIMED_WINDOW_MS: u16 = 60_000;

/// Pending timed-interaction state for one exchange context.
#[derive(Default)]
pub struct TimedInteraction {
    deadline: Mutex<Option<Instant>>,
}

impl TimedInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the window for `timeout_ms`, replacing any pending window.
    pub fn arm(&self, timeout_ms: u16, now: Instant) -> Result<()> {
        let timeout_ms = timeout_ms.clamp(MIN_TIMED_WINDOW_MS, MAX_TIMED_WINDOW_MS);
        *self.deadline.lock() = Some(now + Duration::from_millis(timeout_ms as u64));
        Ok(())
    }

    pub fn is_pending(&self, now: Instant) -> bool {
        matches!(*self.deadline.lock(), Some(deadline) if deadline > now)
    }

    /// Admit a Write or Invoke against the pending state.
    ///
    /// The request's `timedRequest` flag must match the pending state in
    /// both directions; group messages are never admitted while a window
    /// is pending; an expired window declines the request. Whatever the
    /// outcome, the pending state is cleared.
    pub fn admit(&self, timed_request: bool, is_group: bool, now: Instant) -> Result<()> {
        let deadline = self.deadline.lock().take();
        match deadline {
            Some(_) if is_group => Err(Error::UnexpectedData(
                "group message during a pending timed interaction".into(),
            )),
            Some(deadline) if deadline <= now => Err(Error::UnexpectedData(
                "Timed request window expired. Decline write/invoke request.".into(),
            )),
            Some(_) if !timed_request => Err(Error::UnexpectedData(
                "request is not timed but a timed interaction is pending".into(),
            )),
            None if timed_request => Err(Error::UnexpectedData(
                "timed request without a pending timed interaction".into(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timed_flow() {
        let timed = TimedInteraction::new();
        let t0 = Instant::now();

        timed.arm(500, t0).unwrap();
        assert!(timed.is_pending(t0));
        timed.admit(true, false, t0 + Duration::from_millis(100)).unwrap();
        // Cleared after acceptance.
        assert!(!timed.is_pending(t0 + Duration::from_millis(100)));
    }

    #[test]
    fn test_flag_mismatch_both_directions() {
        let timed = TimedInteraction::new();
        let t0 = Instant::now();

        // Timed flag without a pending window.
        assert!(timed.admit(true, false, t0).is_err());

        // Pending window without the timed flag.
        timed.arm(500, t0).unwrap();
        assert!(timed.admit(false, false, t0).is_err());
        // The failed admission cleared the window.
        assert!(!timed.is_pending(t0));
    }

    #[test]
    fn test_expired_window() {
        let timed = TimedInteraction::new();
        let t0 = Instant::now();
        timed.arm(10, t0).unwrap();

        let err = timed
            .admit(true, false, t0 + Duration::from_millis(50))
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Timed request window expired. Decline write/invoke request."));
        assert!(!timed.is_pending(t0 + Duration::from_millis(50)));
    }

    #[test]
    fn test_group_message_rejected_while_pending() {
        let timed = TimedInteraction::new();
        let t0 = Instant::now();
        timed.arm(500, t0).unwrap();
        assert!(timed.admit(true, true, t0).is_err());

        // An untimed group message with no pending window is fine.
        assert!(timed.admit(false, true, t0).is_ok());
    }

    #[test]
    fn test_window_clamped() {
        let timed = TimedInteraction::new();
        let t0 = Instant::now();
        timed.arm(0, t0).unwrap();
        // Clamped up to the 1 ms minimum rather than instantly expired.
        assert!(timed.is_pending(t0));
        assert!(!timed.is_pending(t0 + Duration::from_millis(2)));
    }
}
