use std::{borrow::Cow, cmp, time::Duration};

use serde::Deserialize;

use super::backend::BackendError;

pub enum RetryAction {
    /// Indicate that this request should be retried with a reason
    Retry(Cow<'static, str>),
    /// Indicate that this request should not be retried with a reason
    DontRetry(Cow<'static, str>),
}

impl RetryAction {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, RetryAction::Retry(_))
    }

    pub const fn is_not_retryable(&self) -> bool {
        matches!(self, RetryAction::DontRetry(_))
    }
}

pub trait RetryLogic: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// When an attempt fails, this function allows implementors to specify what
    /// kinds of errors can be retried.
    fn is_retriable_error(&self, error: &Self::Error) -> bool;

    fn retry_action(&self, error: &Self::Error) -> RetryAction {
        if self.is_retriable_error(error) {
            RetryAction::Retry(Cow::Owned(error.to_string()))
        } else {
            RetryAction::DontRetry(Cow::Owned(error.to_string()))
        }
    }
}

/// Retries transient backend failures: transport errors, timeouts, broken streams,
/// 429 and 5xx responses.
#[derive(Clone, Debug, Default)]
pub struct BackendRetryLogic;

impl RetryLogic for BackendRetryLogic {
    type Error = BackendError;

    fn is_retriable_error(&self, error: &Self::Error) -> bool {
        error.is_transient()
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the
    /// backoff strategy.
    ///
    /// Incorporating full jitter into your backoff strategy can greatly reduce the likelihood
    /// of creating accidental denial of service (DoS) conditions against your own systems when
    /// many clients are recovering from a failure state.
    #[default]
    Full,
}

#[derive(Debug)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp(Cow<'static, str>),
}

/// Decides, per failed attempt, whether a request goes back to the queue and how
/// long it backs off first.
#[derive(Debug, Clone)]
pub struct RetryPolicy<L> {
    max_retries: usize,
    initial_backoff: Duration,
    max_delay: Duration,
    jitter_mode: JitterMode,
    logic: L,
}

impl<L: RetryLogic> RetryPolicy<L> {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_delay: Duration,
        logic: L,
        jitter_mode: JitterMode,
    ) -> Self {
        RetryPolicy {
            max_retries,
            initial_backoff,
            max_delay,
            jitter_mode,
            logic,
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// `retry_count` is the number of retries already taken.
    pub fn decide(&self, retry_count: usize, error: &L::Error) -> RetryDecision {
        match self.logic.retry_action(error) {
            RetryAction::DontRetry(reason) => {
                debug!(message = "Non-retriable error.", %error);
                RetryDecision::GiveUp(reason)
            }
            RetryAction::Retry(_) if retry_count >= self.max_retries => {
                error!(message = "Retries exhausted.", retries = retry_count, %error);
                RetryDecision::GiveUp(Cow::Borrowed("retries exhausted"))
            }
            RetryAction::Retry(reason) => {
                let delay = self.backoff(retry_count);
                warn!(
                    message = "Retrying after error.",
                    reason = %reason,
                    retry = retry_count + 1,
                    delay_ms = %delay.as_millis()
                );
                RetryDecision::RetryAfter(delay)
            }
        }
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn backoff(&self, retry_count: usize) -> Duration {
        let base = ExponentialBackoff::new(self.initial_backoff)
            .max_delay(self.max_delay)
            .nth(retry_count)
            .unwrap_or(self.max_delay);
        match self.jitter_mode {
            JitterMode::None => base,
            JitterMode::Full => add_full_jitter(base),
        }
    }
}

fn add_full_jitter(d: Duration) -> Duration {
    let millis = d.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::random_range(1..=millis))
}

/// Delays that double from an initial value, capped at an optional maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    multiplier: u32,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration) -> ExponentialBackoff {
        ExponentialBackoff {
            current: initial,
            multiplier: 2,
            max_delay: None,
        }
    }

    pub const fn multiplier(mut self, multiplier: u32) -> ExponentialBackoff {
        self.multiplier = multiplier;
        self
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let duration = match self.max_delay {
            Some(max_delay) => cmp::min(self.current, max_delay),
            None => self.current,
        };
        self.current = self
            .current
            .checked_mul(self.multiplier)
            .unwrap_or(Duration::MAX);
        Some(duration)
    }
}
