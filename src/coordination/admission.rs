//! Global slot pool, per-user cap and the table of in-flight requests.
//!
//! Every counter, the wait queue and the request table live behind one mutex, so
//! each admission, release, retry and cancellation is a single critical section.
//! The lock is never held across an `.await`.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::AbortHandle, time::Instant};
use tokio_util::sync::CancellationToken;

use super::{
    error::AdmissionError,
    instant_now,
    queue::{QueuedEntry, RequestQueue},
    request::{ActiveRequestInfo, ChatRequest, RequestId, RequestStatus, UserId},
    session::SessionTicket,
};

const FINISHED_LOG_CAPACITY: usize = 1024;

/// Which path executes a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Bounded by the global slot pool and the wait queue.
    Concurrent,
    /// One at a time, bypassing the slot pool. Used in fallback mode.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    AwaitingLane,
    Running,
    BackingOff,
}

struct ActiveEntry {
    request: ChatRequest,
    seq: u64,
    ticket: SessionTicket,
    cancel: CancellationToken,
    lane: Lane,
    phase: Phase,
    started_at: Option<Instant>,
    first_started_at: Option<Instant>,
    task: Option<AbortHandle>,
}

/// Everything a worker needs to execute one attempt of a request.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub request: ChatRequest,
    pub ticket: SessionTicket,
    pub cancel: CancellationToken,
    pub lane: Lane,
    /// When the first attempt started. `None` until a sequential request first
    /// acquires the lane.
    pub first_started_at: Option<Instant>,
}

/// A request that has left the table.
#[derive(Debug)]
pub(crate) struct Finished {
    pub request: ChatRequest,
    pub ticket: SessionTicket,
    pub lane: Lane,
    pub processing_time: Option<Duration>,
    /// Whether it was executing when it left (as opposed to waiting).
    pub was_running: bool,
}

pub(crate) enum CancelAction {
    /// Removed while waiting, together with anything that may now start.
    Removed(Finished, Vec<Dispatch>),
    /// Running; its token has been cancelled and the worker must acknowledge.
    Signalled { submission: u64 },
    AlreadyFinished(RequestStatus),
    NotFound,
}

#[derive(Debug, Default, Clone, Copy)]
struct UserLoad {
    running: usize,
    /// Running, queued, backing off or waiting for the sequential lane.
    held: usize,
}

#[derive(Default)]
struct FinishedLog {
    order: VecDeque<RequestId>,
    status: HashMap<RequestId, RequestStatus>,
}

impl FinishedLog {
    fn record(&mut self, id: RequestId, status: RequestStatus) {
        if self.order.len() == FINISHED_LOG_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.status.remove(&evicted);
            }
        }
        self.order.push_back(id.clone());
        self.status.insert(id, status);
    }

    fn get(&self, id: &RequestId) -> Option<RequestStatus> {
        self.status.get(id).copied()
    }
}

struct AdmissionState {
    running: usize,
    sequential_running: usize,
    per_user: HashMap<UserId, UserLoad>,
    queue: RequestQueue,
    active: HashMap<RequestId, ActiveEntry>,
    finished: FinishedLog,
    next_seq: u64,
    accepting: bool,
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionSnapshot {
    pub running: usize,
    pub sequential_running: usize,
    pub queued: usize,
    pub in_flight: usize,
}

pub struct AdmissionController {
    max_global: usize,
    max_per_user: usize,
    state: Arc<Mutex<AdmissionState>>,
}

/// A per-user hold taken before the request becomes visible anywhere. Dropping it
/// without calling [`AdmissionController::enqueue`] gives the hold back.
pub(crate) struct Reservation {
    user: UserId,
    state: Arc<Mutex<AdmissionState>>,
    consumed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.consumed {
            let mut state = self.state.lock();
            release_hold(&mut state.per_user, &self.user);
        }
    }
}

fn release_hold(per_user: &mut HashMap<UserId, UserLoad>, user: &UserId) {
    if let Some(load) = per_user.get_mut(user) {
        load.held = load.held.saturating_sub(1);
        if load.held == 0 {
            per_user.remove(user);
        }
    }
}

impl AdmissionController {
    pub fn new(max_global: usize, max_per_user: usize) -> Self {
        Self {
            max_global,
            max_per_user,
            state: Arc::new(Mutex::new(AdmissionState {
                running: 0,
                sequential_running: 0,
                per_user: HashMap::new(),
                queue: RequestQueue::new(),
                active: HashMap::new(),
                finished: FinishedLog::default(),
                next_seq: 0,
                accepting: true,
            })),
        }
    }

    pub fn max_global(&self) -> usize {
        self.max_global
    }

    /// Takes one of the submitting user's holds. A user already at the cap is
    /// refused rather than queued behind their own work.
    pub(crate) fn reserve(&self, request: &ChatRequest) -> Result<Reservation, AdmissionError> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(AdmissionError::ServiceDisabled);
        }
        if state.active.contains_key(request.id()) {
            return Err(AdmissionError::DuplicateRequest {
                request_id: request.id().clone(),
            });
        }
        let user = request.user_id();
        let load = state.per_user.entry(user.clone()).or_default();
        if load.held >= self.max_per_user {
            return Err(AdmissionError::UserConcurrencyExceeded {
                user: user.clone(),
                limit: self.max_per_user,
            });
        }
        load.held += 1;
        Ok(Reservation {
            user: user.clone(),
            state: Arc::clone(&self.state),
            consumed: false,
        })
    }

    /// Registers a reserved request and returns whatever may start right away: the
    /// request itself on the sequential lane, or on the concurrent lane when a slot
    /// is free. Otherwise the request waits in the queue.
    pub(crate) fn enqueue(
        &self,
        mut reservation: Reservation,
        request: ChatRequest,
        ticket: SessionTicket,
        lane: Lane,
    ) -> Vec<Dispatch> {
        reservation.consumed = true;
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let id = request.id().clone();
        let user = request.user_id().clone();
        let entry = ActiveEntry {
            request,
            seq,
            ticket,
            cancel: CancellationToken::new(),
            lane,
            phase: match lane {
                Lane::Concurrent => Phase::Queued,
                Lane::Sequential => Phase::AwaitingLane,
            },
            started_at: None,
            first_started_at: None,
            task: None,
        };

        match lane {
            Lane::Sequential => {
                let dispatch = dispatch_of(&entry);
                state.active.insert(id, entry);
                vec![dispatch]
            }
            Lane::Concurrent => {
                state.active.insert(id.clone(), entry);
                state.queue.push(QueuedEntry {
                    seq,
                    request_id: id,
                    user_id: user,
                });
                self.drain(&mut state)
            }
        }
    }

    /// Starts queued requests while global slots are free.
    fn drain(&self, state: &mut AdmissionState) -> Vec<Dispatch> {
        let mut started = Vec::new();
        while state.running < self.max_global && !state.queue.is_empty() {
            let AdmissionState {
                queue, per_user, ..
            } = &mut *state;
            let max_per_user = self.max_per_user;
            let Some(next) = queue.pop_eligible(|user| {
                per_user
                    .get(user)
                    .is_none_or(|load| load.running < max_per_user)
            }) else {
                break;
            };

            let Some(entry) = state.active.get_mut(&next.request_id) else {
                continue;
            };
            if !entry.request.transition(RequestStatus::Running) {
                continue;
            }
            let now = instant_now();
            entry.phase = Phase::Running;
            entry.started_at = Some(now);
            entry.first_started_at.get_or_insert(now);
            started.push(dispatch_of(entry));

            state.running += 1;
            state.per_user.entry(next.user_id).or_default().running += 1;
        }
        started
    }

    /// Marks a sequential-lane request as running once the lane is acquired and
    /// returns when its first attempt started. `None` when it was cancelled while
    /// waiting.
    pub(crate) fn start_sequential(&self, id: &RequestId) -> Option<Instant> {
        let mut state = self.state.lock();
        let entry = state.active.get_mut(id)?;
        if entry.phase != Phase::AwaitingLane || !entry.request.transition(RequestStatus::Running)
        {
            return None;
        }
        let now = instant_now();
        entry.phase = Phase::Running;
        entry.started_at = Some(now);
        let first_started_at = *entry.first_started_at.get_or_insert(now);
        let user = entry.request.user_id().clone();
        state.sequential_running += 1;
        state.per_user.entry(user).or_default().running += 1;
        Some(first_started_at)
    }

    /// Records the task executing attempt `retry_count` of `id`, unless that attempt
    /// is already over.
    pub(crate) fn attach_task(&self, id: &RequestId, retry_count: usize, task: AbortHandle) {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get_mut(id) else {
            return;
        };
        let same_attempt = entry.request.retry_count() == retry_count;
        if same_attempt && matches!(entry.phase, Phase::Running | Phase::AwaitingLane) {
            entry.task = Some(task);
        }
    }

    /// Takes the worker task of submission `submission` of `id`, so it can be
    /// aborted.
    pub(crate) fn take_task(&self, id: &RequestId, submission: u64) -> Option<AbortHandle> {
        let mut state = self.state.lock();
        let entry = state.active.get_mut(id)?;
        if entry.seq != submission {
            return None;
        }
        entry.task.take()
    }

    /// Removes a request with a terminal status and hands its slot to the next
    /// eligible queued request, all in one critical section. Returns `None` when
    /// the request already left, which makes every finalization path idempotent.
    pub(crate) fn finish(
        &self,
        id: &RequestId,
        status: RequestStatus,
    ) -> Option<(Finished, Vec<Dispatch>)> {
        self.finish_matching(id, None, status)
    }

    /// Like [`finish`](Self::finish), but only while `id` still names submission
    /// `submission`. A later request reusing the id is left alone.
    pub(crate) fn finish_submission(
        &self,
        id: &RequestId,
        submission: u64,
        status: RequestStatus,
    ) -> Option<(Finished, Vec<Dispatch>)> {
        self.finish_matching(id, Some(submission), status)
    }

    fn finish_matching(
        &self,
        id: &RequestId,
        submission: Option<u64>,
        status: RequestStatus,
    ) -> Option<(Finished, Vec<Dispatch>)> {
        let mut state = self.state.lock();
        if let Some(submission) = submission {
            if state.active.get(id)?.seq != submission {
                return None;
            }
        }
        let mut entry = state.active.remove(id)?;

        let was_running = entry.phase == Phase::Running;
        if was_running {
            match entry.lane {
                Lane::Concurrent => state.running = state.running.saturating_sub(1),
                Lane::Sequential => {
                    state.sequential_running = state.sequential_running.saturating_sub(1)
                }
            }
            if let Some(load) = state.per_user.get_mut(entry.request.user_id()) {
                load.running = load.running.saturating_sub(1);
            }
        } else if entry.phase == Phase::Queued {
            state.queue.remove(id);
        }
        release_hold(&mut state.per_user, entry.request.user_id());

        if !entry.request.transition(status) {
            // only a worker fault ends a waiting request with anything but cancelled
            entry.request.force_status(status);
        }
        entry.cancel.cancel();
        state.finished.record(id.clone(), status);

        let next = self.drain(&mut state);
        let finished = Finished {
            processing_time: entry.started_at.map(|started| started.elapsed()),
            request: entry.request,
            ticket: entry.ticket,
            lane: entry.lane,
            was_running,
        };
        Some((finished, next))
    }

    /// Running → failed → queued. The request keeps its per-user hold while it
    /// backs off, but its global slot goes to the next queued request right away.
    pub(crate) fn begin_retry(&self, id: &RequestId) -> Option<Vec<Dispatch>> {
        let mut state = self.state.lock();
        let entry = state.active.get_mut(id)?;
        if entry.phase != Phase::Running {
            return None;
        }
        if !entry.request.transition(RequestStatus::Failed)
            || !entry.request.transition(RequestStatus::Queued)
        {
            return None;
        }
        entry.phase = Phase::BackingOff;
        entry.started_at = None;
        entry.task = None;
        let lane = entry.lane;
        let user = entry.request.user_id().clone();

        match lane {
            Lane::Concurrent => state.running = state.running.saturating_sub(1),
            Lane::Sequential => {
                state.sequential_running = state.sequential_running.saturating_sub(1)
            }
        }
        if let Some(load) = state.per_user.get_mut(&user) {
            load.running = load.running.saturating_sub(1);
        }
        Some(self.drain(&mut state))
    }

    /// Puts a backed-off request back in line, ordered by its original submission.
    pub(crate) fn requeue(&self, id: &RequestId) -> Vec<Dispatch> {
        let mut state = self.state.lock();
        let Some(entry) = state.active.get_mut(id) else {
            return Vec::new();
        };
        if entry.phase != Phase::BackingOff {
            return Vec::new();
        }
        match entry.lane {
            Lane::Sequential => {
                entry.phase = Phase::AwaitingLane;
                vec![dispatch_of(entry)]
            }
            Lane::Concurrent => {
                entry.phase = Phase::Queued;
                let queued = QueuedEntry {
                    seq: entry.seq,
                    request_id: id.clone(),
                    user_id: entry.request.user_id().clone(),
                };
                state.queue.push(queued);
                self.drain(&mut state)
            }
        }
    }

    /// Cancels `id`. Waiting requests are removed on the spot; running requests are
    /// signalled and must be finished by their worker or by the grace timer.
    pub(crate) fn cancel(&self, id: &RequestId) -> CancelAction {
        let phase = {
            let state = self.state.lock();
            match state.active.get(id) {
                Some(entry) => entry.phase,
                None => {
                    return match state.finished.get(id) {
                        Some(status) => CancelAction::AlreadyFinished(status),
                        None => CancelAction::NotFound,
                    };
                }
            }
        };

        match phase {
            Phase::Running => {
                let state = self.state.lock();
                match state.active.get(id) {
                    Some(entry) => {
                        entry.cancel.cancel();
                        CancelAction::Signalled {
                            submission: entry.seq,
                        }
                    }
                    None => state
                        .finished
                        .get(id)
                        .map_or(CancelAction::NotFound, CancelAction::AlreadyFinished),
                }
            }
            Phase::Queued | Phase::AwaitingLane | Phase::BackingOff => {
                match self.finish(id, RequestStatus::Cancelled) {
                    Some((finished, next)) => CancelAction::Removed(finished, next),
                    None => self
                        .state
                        .lock()
                        .finished
                        .get(id)
                        .map_or(CancelAction::NotFound, CancelAction::AlreadyFinished),
                }
            }
        }
    }

    pub fn ids_for_user(&self, user: &UserId) -> Vec<RequestId> {
        let state = self.state.lock();
        let mut ids: Vec<(u64, RequestId)> = state
            .active
            .iter()
            .filter(|(_, entry)| entry.request.user_id() == user)
            .map(|(id, entry)| (entry.seq, id.clone()))
            .collect();
        ids.sort_unstable();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn list_active(&self, user: &UserId) -> Vec<ActiveRequestInfo> {
        let state = self.state.lock();
        let mut entries: Vec<&ActiveEntry> = state
            .active
            .values()
            .filter(|entry| entry.request.user_id() == user)
            .collect();
        entries.sort_unstable_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| ActiveRequestInfo::of(&entry.request))
            .collect()
    }

    pub fn status_of(&self, id: &RequestId) -> Option<RequestStatus> {
        let state = self.state.lock();
        state
            .active
            .get(id)
            .map(|entry| entry.request.status())
            .or_else(|| state.finished.get(id))
    }

    /// Running + waiting requests held by `user`.
    pub fn held_by(&self, user: &UserId) -> usize {
        self.state.lock().per_user.get(user).map_or(0, |load| load.held)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let state = self.state.lock();
        AdmissionSnapshot {
            running: state.running,
            sequential_running: state.sequential_running,
            queued: state.queue.len(),
            in_flight: state.active.len(),
        }
    }

    /// Refuses new reservations. In-flight work is unaffected.
    pub fn close(&self) {
        self.state.lock().accepting = false;
    }
}

fn dispatch_of(entry: &ActiveEntry) -> Dispatch {
    Dispatch {
        request: entry.request.clone(),
        ticket: entry.ticket.clone(),
        cancel: entry.cancel.clone(),
        lane: entry.lane,
        first_started_at: entry.first_started_at,
    }
}
