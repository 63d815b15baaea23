use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::{
    runtime::Handle,
    sync::{Mutex as AsyncMutex, Notify},
};

use super::{
    CoordinatorSettings,
    admission::{AdmissionController, CancelAction, Dispatch, Finished, Lane},
    backend::CompletionBackend,
    error::{AdmissionError, ConfigError, ExecutionError},
    fallback::{CircuitBreaker, CircuitState, Outcome},
    internal_event::{
        ChatRequestAccepted, ChatRequestFinished, ChatRequestRejected, InternalEvent,
    },
    persistence::PersistenceSink,
    rate_limiter::{RateDecision, RateLimiter},
    request::{ActiveRequestInfo, ChatRequest, RequestId, RequestStatus, SessionId, UserId},
    retries::{BackendRetryLogic, RetryPolicy},
    session::{
        ObserverHandle, SessionObserver, SessionRegistry, SessionSnapshot, SessionSubscription,
        observe,
    },
    stats::{Stats, StatsCollector},
    worker,
};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// It was waiting and has been removed; it never ran, or was between retries.
    RemovedFromQueue,
    /// It is running and has been told to stop. Its slot is released once the worker
    /// acknowledges, or after the cancellation grace period at the latest.
    Signalled,
    /// Nothing to do, it had already finished.
    AlreadyFinished { status: RequestStatus },
    NotFound,
}

impl CancelOutcome {
    /// Whether this call stopped (or is stopping) a request.
    pub const fn took_effect(&self) -> bool {
        matches!(self, CancelOutcome::RemovedFromQueue | CancelOutcome::Signalled)
    }
}

/// State shared by the coordinator handle and its worker tasks.
pub(crate) struct Core {
    pub(super) settings: CoordinatorSettings,
    pub(super) backend: Arc<dyn CompletionBackend>,
    pub(super) persistence: Arc<dyn PersistenceSink>,
    pub(super) rate_limiter: RateLimiter,
    pub(super) admission: AdmissionController,
    pub(super) sessions: SessionRegistry,
    pub(super) breaker: CircuitBreaker,
    pub(super) stats: StatsCollector,
    pub(super) retry_policy: RetryPolicy<BackendRetryLogic>,
    /// Held by the one request running in fallback mode.
    pub(super) sequential_lane: AsyncMutex<()>,
    idle: Notify,
    runtime: Handle,
}

impl Core {
    /// Spawns a worker for every dispatch.
    pub(super) fn start(self: &Arc<Self>, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            let id = dispatch.request.id().clone();
            let retry_count = dispatch.request.retry_count();
            let task = self.runtime.spawn(worker::run(Arc::clone(self), dispatch));
            self.admission.attach_task(&id, retry_count, task.abort_handle());
        }
        self.publish_slots();
    }

    pub(super) fn publish_slots(&self) {
        let snapshot = self.admission.snapshot();
        self.stats
            .record_slots(snapshot.running + snapshot.sequential_running, snapshot.queued);
    }

    /// Moves `id` to its terminal state, once. Returns `false` when some other path
    /// already did.
    pub(super) fn finalize(
        self: &Arc<Self>,
        id: &RequestId,
        result: Result<(), ExecutionError>,
    ) -> bool {
        let finished = self.admission.finish(id, terminal_status(&result));
        self.conclude_if_finished(finished, &result)
    }

    /// Like [`finalize`](Self::finalize) for one particular submission of `id`.
    fn finalize_submission(
        self: &Arc<Self>,
        id: &RequestId,
        submission: u64,
        result: Result<(), ExecutionError>,
    ) -> bool {
        let finished = self
            .admission
            .finish_submission(id, submission, terminal_status(&result));
        self.conclude_if_finished(finished, &result)
    }

    fn conclude_if_finished(
        self: &Arc<Self>,
        finished: Option<(Finished, Vec<Dispatch>)>,
        result: &Result<(), ExecutionError>,
    ) -> bool {
        match finished {
            Some((finished, next)) => {
                self.conclude(finished, next, result);
                true
            }
            None => false,
        }
    }

    /// Everything that follows a request leaving the admission table.
    fn conclude(
        self: &Arc<Self>,
        finished: Finished,
        next: Vec<Dispatch>,
        result: &Result<(), ExecutionError>,
    ) {
        let ticket = &finished.ticket;
        match result {
            Ok(()) => self.sessions.complete(ticket),
            Err(ExecutionError::Cancelled) => self.sessions.cancel(ticket),
            Err(ExecutionError::Timeout { .. }) => self.sessions.force_idle(ticket),
            Err(error) => self.sessions.fail(ticket, &error.to_string()),
        };

        if finished.was_running && finished.lane == Lane::Concurrent {
            let outcome = match result {
                Ok(()) => Outcome::Success,
                Err(error) if error.counts_against_circuit() => Outcome::Failure,
                Err(_) => Outcome::Neutral,
            };
            self.breaker.record_outcome(outcome);
        }
        self.breaker.release_trial(finished.request.id());

        let status = finished.request.status();
        self.stats.record_finished(status, finished.processing_time);
        let detail = result.as_ref().err().map(ToString::to_string);
        ChatRequestFinished {
            request_id: finished.request.id(),
            status,
            retries: finished.request.retry_count(),
            detail: detail.as_deref(),
        }
        .emit();

        self.start(next);
        if self.admission.snapshot().in_flight == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Force-releases a cancelled request that has not stopped within the grace
    /// period, and kills its worker. Only submission `submission` is affected, not a
    /// later request that reuses the id.
    fn arm_cancel_grace(self: &Arc<Self>, id: RequestId, submission: u64) {
        let core = Arc::downgrade(self);
        let grace = self.settings.cancel_grace();
        self.runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(core) = core.upgrade() else {
                return;
            };
            let task = core.admission.take_task(&id, submission);
            if core.finalize_submission(&id, submission, Err(ExecutionError::Cancelled)) {
                warn!(
                    target: "chat_coordinator::worker",
                    request_id = %id,
                    grace_ms = grace.as_millis() as u64,
                    "Cancelled request did not stop in time, slot force-released"
                );
                if let Some(task) = task {
                    task.abort();
                }
            }
        });
    }
}

fn terminal_status(result: &Result<(), ExecutionError>) -> RequestStatus {
    match result {
        Ok(()) => RequestStatus::Completed,
        Err(ExecutionError::Cancelled) => RequestStatus::Cancelled,
        Err(ExecutionError::Timeout { .. }) => RequestStatus::TimedOut,
        Err(_) => RequestStatus::Failed,
    }
}

/// Periodically forgets users whose rate window is empty.
fn spawn_janitor(core: &Arc<Core>) {
    let weak: Weak<Core> = Arc::downgrade(core);
    let period = core.settings.rate_window();
    core.runtime.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(core) = weak.upgrade() else {
                break;
            };
            core.rate_limiter.prune();
        }
    });
}

/// Entry point for submitting, cancelling and observing chat requests.
///
/// Cheap to clone; all clones drive the same coordinator.
#[derive(Clone)]
pub struct ChatCoordinator {
    core: Arc<Core>,
}

impl ChatCoordinator {
    /// Builds a coordinator on the current Tokio runtime.
    pub fn new(
        settings: CoordinatorSettings,
        backend: Arc<dyn CompletionBackend>,
        persistence: Arc<dyn PersistenceSink>,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let retry_policy = RetryPolicy::new(
            settings.retry_attempts(),
            settings.retry_initial_backoff(),
            settings.retry_max_delay(),
            BackendRetryLogic,
            settings.jitter_mode(),
        );
        let core = Arc::new(Core {
            rate_limiter: RateLimiter::new(settings.requests_per_minute(), settings.rate_window()),
            admission: AdmissionController::new(
                settings.max_concurrent_chats(),
                settings.max_concurrent_per_user(),
            ),
            sessions: SessionRegistry::new(settings.session_channel_capacity()),
            breaker: CircuitBreaker::new(
                settings.circuit_failure_threshold(),
                settings.circuit_cooldown(),
            ),
            stats: StatsCollector::new(),
            retry_policy,
            sequential_lane: AsyncMutex::new(()),
            idle: Notify::new(),
            runtime,
            backend,
            persistence,
            settings,
        });
        spawn_janitor(&core);

        info!(
            target: "chat_coordinator",
            max_concurrent_chats = core.settings.max_concurrent_chats(),
            max_concurrent_per_user = core.settings.max_concurrent_per_user(),
            requests_per_minute = core.settings.requests_per_minute(),
            concurrent_processing = core.settings.enable_concurrent_processing(),
            "Chat coordinator started"
        );
        Ok(Self { core })
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.core.settings
    }

    /// Admits `request` or refuses it right away. Never waits for the backend.
    ///
    /// An admitted request takes over the visible stream of its session at once,
    /// even while it still waits for a slot.
    pub fn submit(&self, request: ChatRequest) -> Result<RequestId, AdmissionError> {
        let core = &self.core;
        let user = request.user_id().clone();

        if let RateDecision::Denied { retry_after } = core.rate_limiter.check(&user) {
            return Err(self.reject(&user, AdmissionError::RateLimited { retry_after }));
        }
        let reservation = match core.admission.reserve(&request) {
            Ok(reservation) => reservation,
            Err(error) => {
                core.rate_limiter.refund(&user);
                return Err(self.reject(&user, error));
            }
        };

        let id = request.id().clone();
        let lane = if !core.settings.enable_concurrent_processing()
            || core.breaker.should_fallback(&id)
        {
            Lane::Sequential
        } else {
            Lane::Concurrent
        };
        let ticket = core.sessions.begin_request(request.session_id(), &id);
        let dispatches = core.admission.enqueue(reservation, request, ticket, lane);

        let placement = match lane {
            Lane::Sequential => "sequential",
            Lane::Concurrent if dispatches.iter().any(|d| d.request.id() == &id) => "running",
            Lane::Concurrent => "queued",
        };
        core.stats.record_accepted();
        ChatRequestAccepted {
            request_id: &id,
            user_id: &user,
            placement,
        }
        .emit();

        core.start(dispatches);
        Ok(id)
    }

    fn reject(&self, user: &UserId, error: AdmissionError) -> AdmissionError {
        self.core.stats.record_rejected();
        ChatRequestRejected {
            user_id: user,
            reason: error.code(),
        }
        .emit();
        error
    }

    pub fn cancel(&self, id: &RequestId) -> CancelOutcome {
        match self.core.admission.cancel(id) {
            CancelAction::Removed(finished, next) => {
                self.core.conclude(finished, next, &Err(ExecutionError::Cancelled));
                CancelOutcome::RemovedFromQueue
            }
            CancelAction::Signalled { submission } => {
                debug!(
                    target: "chat_coordinator::worker",
                    request_id = %id,
                    "Cancellation signalled"
                );
                self.core.arm_cancel_grace(id.clone(), submission);
                CancelOutcome::Signalled
            }
            CancelAction::AlreadyFinished(status) => CancelOutcome::AlreadyFinished { status },
            CancelAction::NotFound => CancelOutcome::NotFound,
        }
    }

    /// Cancels every in-flight request of `user`. Returns how many were stopped.
    pub fn cancel_all(&self, user: &UserId) -> usize {
        self.core
            .admission
            .ids_for_user(user)
            .iter()
            .map(|id| self.cancel(id))
            .filter(CancelOutcome::took_effect)
            .count()
    }

    /// Cancels the request currently owning `session`'s visible stream.
    pub fn cancel_session(&self, session_id: &SessionId) -> CancelOutcome {
        match self.core.sessions.active_owner(session_id) {
            Some(owner) => self.cancel(&owner),
            None => CancelOutcome::NotFound,
        }
    }

    pub fn list_active(&self, user: &UserId) -> Vec<ActiveRequestInfo> {
        self.core.admission.list_active(user)
    }

    /// Status of an in-flight or recently finished request.
    pub fn request_status(&self, id: &RequestId) -> Option<RequestStatus> {
        self.core.admission.status_of(id)
    }

    pub fn status(&self) -> Stats {
        let core = &self.core;
        let admission = core.admission.snapshot();
        core.stats.snapshot(
            admission.running + admission.sequential_running,
            admission.queued,
            core.breaker.activations(),
            core.breaker.is_fallback_active(),
        )
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.core.breaker.state()
    }

    pub fn session_state(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.core.sessions.get_state(session_id)
    }

    pub fn subscribe(&self, session_id: &SessionId) -> SessionSubscription {
        self.core.sessions.subscribe(session_id)
    }

    /// Drives `observer` from the session's events until the handle is dropped.
    pub fn subscribe_with<O: SessionObserver>(
        &self,
        session_id: &SessionId,
        observer: O,
    ) -> ObserverHandle {
        observe(self.subscribe(session_id), observer)
    }

    /// Drops idle sessions nobody is subscribed to.
    pub fn evict_idle_sessions(&self) -> usize {
        self.core.sessions.evict_idle()
    }

    /// Stops accepting new requests. In-flight requests run to completion.
    pub fn shutdown(&self) {
        self.core.admission.close();
        info!(target: "chat_coordinator", "Chat coordinator no longer accepts requests");
    }

    /// Resolves once no request is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.core.idle.notified();
            if self.core.admission.snapshot().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }
}
