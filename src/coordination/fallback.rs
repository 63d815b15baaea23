//! Circuit breaker deciding between the concurrent path and the sequential lane.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use super::{
    instant_now,
    internal_event::{FallbackActivated, InternalEvent},
    request::RequestId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Concurrent dispatch.
    Closed,
    /// Sequential lane until the cool-down elapses.
    Open,
    /// Cool-down over; one trial runs on the concurrent path.
    HalfOpen,
}

/// How an execution on the concurrent path ended, from the breaker's viewpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// A failure attributable to the concurrent path itself.
    Failure,
    /// Says nothing about the path: cancellations, rejected prompts.
    Neutral,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// The request testing the concurrent path while half-open.
    trial: Option<RequestId>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerState>,
    activations: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                trial: None,
            }),
            activations: AtomicU64::new(0),
        }
    }

    /// Whether `candidate` must take the sequential lane.
    ///
    /// Once the cool-down is over the first candidate gets `false` and becomes the
    /// trial; everyone else keeps falling back until the trial reports or ends.
    pub fn should_fallback(&self, candidate: &RequestId) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = inner
                    .open_until
                    .is_none_or(|until| instant_now() >= until);
                if cooled_down {
                    debug!(
                        target: "chat_coordinator::fallback",
                        trial = %candidate,
                        "Cool-down over, probing the concurrent path"
                    );
                    inner.state = CircuitState::HalfOpen;
                    inner.trial = Some(candidate.clone());
                    false
                } else {
                    true
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial.is_some() {
                    true
                } else {
                    inner.trial = Some(candidate.clone());
                    false
                }
            }
        }
    }

    /// Lets the next candidate run the trial if `id` was the trial. Called for every
    /// request that ends, whether it ran or not, so a trial cancelled while waiting
    /// cannot keep the circuit half-open.
    pub fn release_trial(&self, id: &RequestId) {
        let mut inner = self.inner.lock();
        if inner.trial.as_ref() == Some(id) {
            debug!(
                target: "chat_coordinator::fallback",
                trial = %id,
                "Trial request ended without a verdict"
            );
            inner.trial = None;
        }
    }

    pub fn record_outcome(&self, outcome: Outcome) {
        let mut inner = self.inner.lock();
        match (inner.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => inner.consecutive_failures = 0,
            (CircuitState::Closed, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    self.open(&mut inner);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                info!(
                    target: "chat_coordinator::fallback",
                    "Trial request succeeded, circuit closed"
                );
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.open_until = None;
                inner.trial = None;
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                inner.consecutive_failures += 1;
                self.open(&mut inner);
            }
            (_, Outcome::Neutral) | (CircuitState::Open, _) => {}
        }
    }

    fn open(&self, inner: &mut BreakerState) {
        inner.state = CircuitState::Open;
        inner.open_until = Some(instant_now() + self.cooldown);
        inner.trial = None;
        self.activations.fetch_add(1, Ordering::Relaxed);
        FallbackActivated {
            consecutive_failures: inner.consecutive_failures,
            cooldown: self.cooldown,
        }
        .emit();
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_fallback_active(&self) -> bool {
        self.state() != CircuitState::Closed
    }

    /// Times the circuit has opened.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(30))
    }

    fn id(name: &str) -> RequestId {
        RequestId::from(name)
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_consecutive_failures() {
        let breaker = breaker();
        breaker.record_outcome(Outcome::Failure);
        breaker.record_outcome(Outcome::Failure);
        assert!(!breaker.should_fallback(&id("a")));
        breaker.record_outcome(Outcome::Failure);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.should_fallback(&id("b")));
        assert_eq!(breaker.activations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_the_failure_streak() {
        let breaker = breaker();
        breaker.record_outcome(Outcome::Failure);
        breaker.record_outcome(Outcome::Failure);
        breaker.record_outcome(Outcome::Success);
        breaker.record_outcome(Outcome::Failure);
        breaker.record_outcome(Outcome::Neutral);
        breaker.record_outcome(Outcome::Failure);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_closes_on_success() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_outcome(Outcome::Failure);
        }
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.should_fallback(&id("early")));

        tokio::time::advance(Duration::from_secs(1)).await;
        // the first caller is the trial, the rest keep falling back
        assert!(!breaker.should_fallback(&id("trial")));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.should_fallback(&id("other")));

        breaker.record_outcome(Outcome::Success);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.should_fallback(&id("after")));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_failure_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_outcome(Outcome::Failure);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.should_fallback(&id("trial")));
        breaker.record_outcome(Outcome::Failure);

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.activations(), 2);
        assert!(breaker.should_fallback(&id("next")));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_trial_frees_the_trial_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.record_outcome(Outcome::Failure);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.should_fallback(&id("trial")));

        // a neutral verdict or another request ending does not free it
        breaker.record_outcome(Outcome::Neutral);
        breaker.release_trial(&id("other"));
        assert!(breaker.should_fallback(&id("waiting")));

        breaker.release_trial(&id("trial"));
        assert!(!breaker.should_fallback(&id("second-trial")));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.should_fallback(&id("waiting")));
    }
}
