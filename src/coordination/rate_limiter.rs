//! Per-user sliding-window admission gate.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;

use super::{instant_now, request::UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Keeps, for every user, the admission timestamps that still fall inside the
/// trailing window. A check never blocks.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    log: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            log: Mutex::new(HashMap::new()),
        }
    }

    /// Decides on one admission for `user`, recording it when allowed.
    pub fn check(&self, user: &UserId) -> RateDecision {
        self.check_at(user, instant_now())
    }

    pub(crate) fn check_at(&self, user: &UserId, now: Instant) -> RateDecision {
        let mut log = self.log.lock();
        let stamps = log.entry(user.clone()).or_default();
        Self::evict_expired(stamps, now, self.window);

        if stamps.len() >= self.limit {
            // the oldest admission is the first to leave the window
            let retry_after = stamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            debug!(
                target: "chat_coordinator::rate_limiter",
                user = %user,
                in_window = stamps.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Rate limit reached"
            );
            return RateDecision::Denied { retry_after };
        }

        stamps.push_back(now);
        RateDecision::Allowed
    }

    /// Gives back the most recent admission of `user`. Used when a request passed
    /// the rate gate but was refused by a later admission step.
    pub fn refund(&self, user: &UserId) {
        let mut log = self.log.lock();
        if let Some(stamps) = log.get_mut(user) {
            stamps.pop_back();
        }
    }

    /// Admissions of `user` still inside the window.
    pub fn in_window(&self, user: &UserId) -> usize {
        let now = instant_now();
        let mut log = self.log.lock();
        match log.get_mut(user) {
            Some(stamps) => {
                Self::evict_expired(stamps, now, self.window);
                stamps.len()
            }
            None => 0,
        }
    }

    /// Drops users whose window is empty.
    pub fn prune(&self) {
        let now = instant_now();
        let window = self.window;
        self.log.lock().retain(|_, stamps| {
            Self::evict_expired(stamps, now, window);
            !stamps.is_empty()
        });
    }

    fn evict_expired(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = stamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                stamps.pop_front();
            } else {
                break;
            }
        }
    }
}
