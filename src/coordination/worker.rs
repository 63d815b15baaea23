//! Executes one attempt of a dispatched request.
//!
//! A worker streams the completion into the session, persists the result and hands
//! the terminal outcome to the coordinator. Whatever happens to the task, the
//! request is finalized exactly once: either by the worker itself, by the grace
//! timer of a cancellation, or by the drop guard when the task dies.
//!
//! The watchdog deadline is fixed when the first attempt starts. Later attempts,
//! retry back-off and waiting for the sequential lane all count against it.

use std::{sync::Arc, time::Duration};

use futures::{StreamExt, future};
use tokio::time::{Instant, sleep, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;

use super::{
    admission::{Dispatch, Lane},
    backend::BackendError,
    coordinator::Core,
    error::ExecutionError,
    instant_now,
    internal_event::{ChatRequestRetried, InternalEvent},
    persistence::{PersistedMessage, PersistenceError},
    request::{ChatRequest, RequestId},
    retries::RetryDecision,
    session::SessionTicket,
};

/// Finalizes the request as an internal fault unless disarmed.
struct FinalizeGuard {
    core: Arc<Core>,
    request_id: RequestId,
    armed: bool,
}

impl FinalizeGuard {
    fn new(core: Arc<Core>, request_id: RequestId) -> Self {
        Self {
            core,
            request_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let fault = ExecutionError::Internal {
            message: "worker exited without a terminal signal".to_owned(),
        };
        if self.core.finalize(&self.request_id, Err(fault)) {
            error!(
                target: "chat_coordinator::worker",
                request_id = %self.request_id,
                "Worker died, slot released and session reset"
            );
        }
    }
}

enum Relay {
    Finished,
    Cancelled,
    Failed(BackendError),
}

enum Attempt {
    Completed,
    Cancelled,
    TimedOut,
    Failed(BackendError),
    PersistFailed(PersistenceError),
}

pub(crate) async fn run(core: Arc<Core>, dispatch: Dispatch) {
    let Dispatch {
        request,
        ticket,
        cancel,
        lane,
        first_started_at,
    } = dispatch;
    let watchdog = core.settings.watchdog_timeout();

    let (lane_permit, first_started_at) = match lane {
        Lane::Concurrent => (None, first_started_at.unwrap_or_else(instant_now)),
        Lane::Sequential => {
            let expired = async {
                match first_started_at {
                    Some(at) => sleep_until(at + watchdog).await,
                    None => future::pending().await,
                }
            };
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = expired => {
                    core.finalize(request.id(), Err(ExecutionError::Timeout { after: watchdog }));
                    return;
                }
                permit = core.sequential_lane.lock() => permit,
            };
            let Some(first_started_at) = core.admission.start_sequential(request.id()) else {
                return;
            };
            core.publish_slots();
            (Some(permit), first_started_at)
        }
    };
    let deadline = first_started_at + watchdog;

    let guard = FinalizeGuard::new(Arc::clone(&core), request.id().clone());
    debug!(
        target: "chat_coordinator::worker",
        request_id = %request.id(),
        retry = request.retry_count(),
        sequential = lane_permit.is_some(),
        "Executing chat request"
    );

    let attempt = execute(&core, &request, &ticket, &cancel, deadline).await;
    let result = match attempt {
        Attempt::Completed => Ok(()),
        Attempt::Cancelled => Err(ExecutionError::Cancelled),
        Attempt::TimedOut => Err(ExecutionError::Timeout { after: watchdog }),
        Attempt::PersistFailed(source) => Err(ExecutionError::Persistence { source }),
        Attempt::Failed(_) if cancel.is_cancelled() => Err(ExecutionError::Cancelled),
        Attempt::Failed(error) => match core.retry_policy.decide(request.retry_count(), &error) {
            RetryDecision::RetryAfter(delay) => {
                guard.disarm();
                drop(lane_permit);
                back_off(core, request, ticket, cancel, delay, deadline).await;
                return;
            }
            RetryDecision::GiveUp(_) => Err(ExecutionError::Backend { source: error }),
        },
    };

    core.finalize(request.id(), result);
    guard.disarm();
}

/// Gives the slot back, waits out the delay and puts the request back in line.
async fn back_off(
    core: Arc<Core>,
    request: ChatRequest,
    ticket: SessionTicket,
    cancel: CancellationToken,
    delay: Duration,
    deadline: Instant,
) {
    let id = request.id();
    let Some(next) = core.admission.begin_retry(id) else {
        return;
    };
    let retry = request.retry_count() + 1;
    core.stats.record_retry();
    ChatRequestRetried {
        request_id: id,
        retry,
        delay,
    }
    .emit();
    core.sessions.restart(&ticket, retry);
    core.start(next);

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            core.finalize(id, Err(ExecutionError::Cancelled));
        }
        _ = sleep_until(deadline) => {
            core.finalize(id, Err(ExecutionError::Timeout {
                after: core.settings.watchdog_timeout(),
            }));
        }
        _ = sleep(delay) => {
            let next = core.admission.requeue(id);
            core.start(next);
        }
    }
}

/// One attempt under the watchdog: stream, then persist.
async fn execute(
    core: &Core,
    request: &ChatRequest,
    ticket: &SessionTicket,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Attempt {
    if instant_now() >= deadline {
        return Attempt::TimedOut;
    }
    let mut content = String::new();

    let relayed = timeout_at(deadline, relay(core, request, ticket, cancel, &mut content)).await;
    match relayed {
        Err(_) => Attempt::TimedOut,
        Ok(Relay::Failed(error)) => Attempt::Failed(error),
        Ok(Relay::Cancelled) if content.is_empty() => Attempt::Cancelled,
        Ok(Relay::Cancelled) => {
            match timeout_at(deadline, persist(core, request, &content)).await {
                Ok(Ok(message)) => debug!(
                    target: "chat_coordinator::worker",
                    request_id = %request.id(),
                    message_id = %message.id,
                    "Persisted partial content of cancelled request"
                ),
                Ok(Err(error)) => warn!(
                    target: "chat_coordinator::worker",
                    request_id = %request.id(),
                    %error,
                    "Failed to persist partial content"
                ),
                Err(_) => warn!(
                    target: "chat_coordinator::worker",
                    request_id = %request.id(),
                    "Watchdog fired while persisting partial content"
                ),
            }
            Attempt::Cancelled
        }
        Ok(Relay::Finished) => match timeout_at(deadline, persist(core, request, &content)).await {
            Ok(Ok(_)) => Attempt::Completed,
            Ok(Err(error)) => Attempt::PersistFailed(error),
            Err(_) => Attempt::TimedOut,
        },
    }
}

async fn relay(
    core: &Core,
    request: &ChatRequest,
    ticket: &SessionTicket,
    cancel: &CancellationToken,
    content: &mut String,
) -> Relay {
    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Relay::Cancelled,
        started = core.backend.stream_completion(request.model(), request.messages()) => started,
    };
    let mut stream = match started {
        Ok(stream) => stream,
        Err(error) => return Relay::Failed(error),
    };

    // dropping `stream` on any return below aborts the backend call
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Relay::Cancelled,
            item = stream.next() => match item {
                Some(Ok(text)) if text.is_empty() => {}
                Some(Ok(text)) => {
                    content.push_str(&text);
                    core.sessions.append_chunk(ticket, &text);
                }
                Some(Err(error)) => return Relay::Failed(error),
                None => return Relay::Finished,
            },
        }
    }
}

async fn persist(
    core: &Core,
    request: &ChatRequest,
    content: &str,
) -> Result<PersistedMessage, PersistenceError> {
    core.persistence
        .save(request.last_user_message(), content, request.session_id())
        .await
}
