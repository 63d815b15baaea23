//! Per-conversation state, isolated and generation-tokened.
//!
//! Each session records which request currently owns its visible stream. Starting
//! a request bumps the session's generation, and every later mutation must present
//! the generation it was started with: anything else is a stale write from a
//! superseded request and is discarded.
//!
//! Accepted mutations are also published, in order, on a per-session broadcast
//! channel. The publish happens under the same lock as the mutation, so every
//! subscriber sees exactly the state changes that were applied.

use std::{collections::HashMap, fmt};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};

use super::{
    internal_event::{InternalEvent, StaleSessionWrite},
    request::{RequestId, SessionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proof of ownership handed to the request that started a session stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed { message: String },
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        request_id: RequestId,
        generation: Generation,
    },
    Chunk {
        request_id: RequestId,
        generation: Generation,
        text: String,
    },
    Completed {
        request_id: RequestId,
        generation: Generation,
        content: String,
    },
    Failed {
        request_id: RequestId,
        generation: Generation,
        message: String,
    },
    Cancelled {
        request_id: RequestId,
        generation: Generation,
    },
    TimedOut {
        request_id: RequestId,
        generation: Generation,
    },
    /// The owning request is going to be attempted again; content streamed so far
    /// has been discarded.
    Retrying {
        request_id: RequestId,
        generation: Generation,
        retry: usize,
    },
    /// This subscriber fell behind and `skipped` events were dropped for it.
    Lagged { skipped: u64 },
}

impl SessionEvent {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            SessionEvent::Started { request_id, .. }
            | SessionEvent::Chunk { request_id, .. }
            | SessionEvent::Completed { request_id, .. }
            | SessionEvent::Failed { request_id, .. }
            | SessionEvent::Cancelled { request_id, .. }
            | SessionEvent::TimedOut { request_id, .. }
            | SessionEvent::Retrying { request_id, .. } => Some(request_id),
            SessionEvent::Lagged { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEvent::Completed { .. }
                | SessionEvent::Failed { .. }
                | SessionEvent::Cancelled { .. }
                | SessionEvent::TimedOut { .. }
        )
    }
}

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub generation: Generation,
    /// A request owns the session and has not reached a terminal state.
    pub is_loading: bool,
    /// The owning request has produced at least one chunk.
    pub is_streaming: bool,
    pub owner: Option<RequestId>,
    /// Visible content of the owning request so far.
    pub content: String,
    pub last_outcome: Option<SessionOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Loading,
    Streaming,
}

struct SessionEntry {
    generation: u64,
    owner: Option<RequestId>,
    phase: Phase,
    content: String,
    last_outcome: Option<SessionOutcome>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionEntry {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            generation: 0,
            owner: None,
            phase: Phase::Idle,
            content: String::new(),
            last_outcome: None,
            events,
        }
    }

    /// The ticket holder still owns this session and has not finished.
    fn accepts(&self, ticket: &SessionTicket) -> bool {
        self.generation == ticket.generation.get()
            && self.owner.as_ref() == Some(&ticket.request_id)
            && self.phase != Phase::Idle
    }

    fn publish(&self, event: SessionEvent) {
        // no receivers is fine, the state is still updated
        let _ = self.events.send(event);
    }

    fn snapshot(&self, session_id: &SessionId) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.clone(),
            generation: Generation(self.generation),
            is_loading: self.phase != Phase::Idle,
            is_streaming: self.phase == Phase::Streaming,
            owner: self.owner.clone(),
            content: self.content.clone(),
            last_outcome: self.last_outcome.clone(),
        }
    }
}

pub struct SessionRegistry {
    capacity: usize,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    /// `capacity` is the number of buffered events per session subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `request_id` the owner of the session's visible stream and returns its
    /// ticket. Any earlier owner is superseded from this point on.
    pub fn begin_request(&self, session_id: &SessionId, request_id: &RequestId) -> SessionTicket {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry::new(self.capacity));

        entry.generation += 1;
        entry.owner = Some(request_id.clone());
        entry.phase = Phase::Loading;
        entry.content.clear();
        entry.last_outcome = None;

        let generation = Generation(entry.generation);
        entry.publish(SessionEvent::Started {
            request_id: request_id.clone(),
            generation,
        });
        SessionTicket {
            session_id: session_id.clone(),
            request_id: request_id.clone(),
            generation,
        }
    }

    pub fn append_chunk(&self, ticket: &SessionTicket, text: &str) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Streaming;
            entry.content.push_str(text);
            SessionEvent::Chunk {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
                text: text.to_owned(),
            }
        })
    }

    /// Clears the partial content of a failed attempt before it is retried.
    pub fn restart(&self, ticket: &SessionTicket, retry: usize) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Loading;
            entry.content.clear();
            SessionEvent::Retrying {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
                retry,
            }
        })
    }

    pub fn complete(&self, ticket: &SessionTicket) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Idle;
            entry.last_outcome = Some(SessionOutcome::Completed);
            SessionEvent::Completed {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
                content: entry.content.clone(),
            }
        })
    }

    pub fn fail(&self, ticket: &SessionTicket, message: &str) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Idle;
            entry.last_outcome = Some(SessionOutcome::Failed {
                message: message.to_owned(),
            });
            SessionEvent::Failed {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
                message: message.to_owned(),
            }
        })
    }

    pub fn cancel(&self, ticket: &SessionTicket) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Idle;
            entry.last_outcome = Some(SessionOutcome::Cancelled);
            SessionEvent::Cancelled {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
            }
        })
    }

    /// Puts the session back into a clean idle state after the watchdog fired.
    /// Partial content of the timed-out request is dropped.
    pub fn force_idle(&self, ticket: &SessionTicket) -> bool {
        self.mutate(ticket, |entry| {
            entry.phase = Phase::Idle;
            entry.content.clear();
            entry.last_outcome = Some(SessionOutcome::TimedOut);
            SessionEvent::TimedOut {
                request_id: ticket.request_id.clone(),
                generation: ticket.generation,
            }
        })
    }

    fn mutate<F>(&self, ticket: &SessionTicket, apply: F) -> bool
    where
        F: FnOnce(&mut SessionEntry) -> SessionEvent,
    {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(&ticket.session_id) else {
            return false;
        };
        if !entry.accepts(ticket) {
            StaleSessionWrite {
                session_id: &ticket.session_id,
                request_id: &ticket.request_id,
                generation: ticket.generation.get(),
                current: entry.generation,
            }
            .emit();
            return false;
        }
        let event = apply(entry);
        entry.publish(event);
        true
    }

    pub fn get_state(&self, session_id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|entry| entry.snapshot(session_id))
    }

    /// The request currently owning the session, if it is still active.
    pub fn active_owner(&self, session_id: &SessionId) -> Option<RequestId> {
        self.sessions
            .lock()
            .get(session_id)
            .filter(|entry| entry.phase != Phase::Idle)
            .and_then(|entry| entry.owner.clone())
    }

    /// Subscribes to the events of one session, creating the session if needed so
    /// observers can attach before the first request arrives.
    pub fn subscribe(&self, session_id: &SessionId) -> SessionSubscription {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry::new(self.capacity));
        SessionSubscription {
            session_id: session_id.clone(),
            receiver: entry.events.subscribe(),
        }
    }

    /// Drops idle sessions nobody listens to. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, entry| entry.phase != Phase::Idle || entry.events.receiver_count() > 0);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// Pull-based stream of one session's events.
pub struct SessionSubscription {
    session_id: SessionId,
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionSubscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event, or `None` once the session has been dropped.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(
                    target: "chat_coordinator::session",
                    session_id = %self.session_id,
                    skipped,
                    "Session subscriber lagged behind"
                );
                Some(SessionEvent::Lagged { skipped })
            }
            Err(RecvError::Closed) => None,
        }
    }
}

/// Callback view of a session, driven by [`observe`].
pub trait SessionObserver: Send + 'static {
    fn on_started(&mut self, _request_id: &RequestId) {}

    fn on_chunk(&mut self, request_id: &RequestId, text: &str);

    /// Content received so far for `request_id` is void.
    fn on_retry(&mut self, _request_id: &RequestId, _retry: usize) {}

    fn on_complete(&mut self, request_id: &RequestId, content: &str);

    /// Failure, cancellation or timeout of a request.
    fn on_error(&mut self, request_id: &RequestId, outcome: &SessionOutcome);

    fn on_lagged(&mut self, _skipped: u64) {}
}

/// Keeps an observer attached to a session. Dropping it detaches the observer.
pub struct ObserverHandle {
    task: JoinHandle<()>,
}

impl ObserverHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Feeds every event of `subscription` to `observer` on a dedicated task, so a slow
/// observer never holds up a worker or another session.
pub fn observe<O: SessionObserver>(
    mut subscription: SessionSubscription,
    mut observer: O,
) -> ObserverHandle {
    let task = tokio::spawn(async move {
        while let Some(event) = subscription.next().await {
            match event {
                SessionEvent::Started { request_id, .. } => observer.on_started(&request_id),
                SessionEvent::Chunk {
                    request_id, text, ..
                } => observer.on_chunk(&request_id, &text),
                SessionEvent::Completed {
                    request_id,
                    content,
                    ..
                } => observer.on_complete(&request_id, &content),
                SessionEvent::Failed {
                    request_id,
                    message,
                    ..
                } => observer.on_error(&request_id, &SessionOutcome::Failed { message }),
                SessionEvent::Cancelled { request_id, .. } => {
                    observer.on_error(&request_id, &SessionOutcome::Cancelled)
                }
                SessionEvent::TimedOut { request_id, .. } => {
                    observer.on_error(&request_id, &SessionOutcome::TimedOut)
                }
                SessionEvent::Retrying {
                    request_id, retry, ..
                } => observer.on_retry(&request_id, retry),
                SessionEvent::Lagged { skipped } => observer.on_lagged(skipped),
            }
        }
    });
    ObserverHandle { task }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ids(session: &str, request: &str) -> (SessionId, RequestId) {
        (SessionId::from(session), RequestId::from(request))
    }

    #[test]
    fn begin_increments_generation_and_takes_ownership() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let first = registry.begin_request(&session, &r1);
        let second = registry.begin_request(&session, &RequestId::from("r2"));

        assert_eq!(first.generation, Generation::new(1));
        assert_eq!(second.generation, Generation::new(2));
        let state = registry.get_state(&session).unwrap();
        assert_eq!(state.owner, Some(RequestId::from("r2")));
        assert!(state.is_loading);
        assert!(!state.is_streaming);
    }

    #[test]
    fn late_chunk_from_superseded_request_is_discarded() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let old = registry.begin_request(&session, &r1);
        assert!(registry.append_chunk(&old, "old "));

        let new = registry.begin_request(&session, &RequestId::from("r2"));
        assert!(registry.append_chunk(&new, "fresh"));

        assert!(!registry.append_chunk(&old, "late"));
        assert!(!registry.complete(&old));
        assert!(!registry.force_idle(&old));

        let state = registry.get_state(&session).unwrap();
        assert_eq!(state.content, "fresh");
        assert!(state.is_streaming);
        assert_eq!(state.generation, new.generation);
    }

    #[test]
    fn terminal_mutation_closes_the_ticket() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let ticket = registry.begin_request(&session, &r1);
        registry.append_chunk(&ticket, "hello");
        assert!(registry.complete(&ticket));

        assert!(!registry.append_chunk(&ticket, " again"));
        assert!(!registry.cancel(&ticket));
        let state = registry.get_state(&session).unwrap();
        assert!(!state.is_loading);
        assert_eq!(state.content, "hello");
        assert_eq!(state.last_outcome, Some(SessionOutcome::Completed));
    }

    #[test]
    fn force_idle_resets_the_session() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let ticket = registry.begin_request(&session, &r1);
        registry.append_chunk(&ticket, "half");
        assert!(registry.force_idle(&ticket));

        let state = registry.get_state(&session).unwrap();
        assert!(!state.is_loading);
        assert!(!state.is_streaming);
        assert!(state.content.is_empty());
        assert_eq!(state.last_outcome, Some(SessionOutcome::TimedOut));
        assert_eq!(registry.active_owner(&session), None);
    }

    #[test]
    fn restart_discards_partial_content() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let ticket = registry.begin_request(&session, &r1);
        registry.append_chunk(&ticket, "broken");
        assert!(registry.restart(&ticket, 1));

        let state = registry.get_state(&session).unwrap();
        assert!(state.is_loading);
        assert!(!state.is_streaming);
        assert!(state.content.is_empty());
        assert!(registry.append_chunk(&ticket, "whole"));
    }

    #[test]
    fn sessions_are_isolated() {
        let registry = SessionRegistry::new(16);
        let a = registry.begin_request(&SessionId::from("a"), &RequestId::from("r1"));
        let b = registry.begin_request(&SessionId::from("b"), &RequestId::from("r2"));
        registry.append_chunk(&a, "for a");
        registry.fail(&b, "boom");

        assert_eq!(registry.get_state(&SessionId::from("a")).unwrap().content, "for a");
        let b_state = registry.get_state(&SessionId::from("b")).unwrap();
        assert!(b_state.content.is_empty());
        assert_eq!(
            b_state.last_outcome,
            Some(SessionOutcome::Failed {
                message: "boom".into()
            })
        );
    }

    #[tokio::test]
    async fn subscribers_see_accepted_mutations_in_order() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let mut events = registry.subscribe(&session);

        let old = registry.begin_request(&session, &r1);
        let new = registry.begin_request(&session, &RequestId::from("r2"));
        registry.append_chunk(&old, "stale");
        registry.append_chunk(&new, "a");
        registry.append_chunk(&new, "b");
        registry.complete(&new);

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(events.next().await.unwrap());
        }
        let generations: Vec<u64> = seen[..2]
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Started { generation, .. } => Some(generation.get()),
                _ => None,
            })
            .collect();
        assert_eq!(generations, vec![1, 2]);
        assert!(matches!(&seen[2], SessionEvent::Chunk { text, .. } if text == "a"));
        assert!(matches!(&seen[3], SessionEvent::Chunk { text, .. } if text == "b"));
        assert!(matches!(&seen[4], SessionEvent::Completed { content, .. } if content == "ab"));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let registry = SessionRegistry::new(2);
        let (session, r1) = ids("s", "r1");
        let mut events = registry.subscribe(&session);
        let ticket = registry.begin_request(&session, &r1);
        for i in 0..10 {
            assert!(registry.append_chunk(&ticket, &i.to_string()));
        }
        assert!(matches!(events.next().await, Some(SessionEvent::Lagged { .. })));
    }

    #[test]
    fn evicts_only_idle_unobserved_sessions() {
        let registry = SessionRegistry::new(4);
        let done = registry.begin_request(&SessionId::from("done"), &RequestId::from("r1"));
        registry.complete(&done);
        registry.begin_request(&SessionId::from("busy"), &RequestId::from("r2"));
        let _watching = registry.subscribe(&SessionId::from("watched"));

        assert_eq!(registry.evict_idle(), 1);
        assert!(registry.get_state(&SessionId::from("done")).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[derive(Default)]
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SessionObserver for Recorder {
        fn on_chunk(&mut self, _request_id: &RequestId, text: &str) {
            self.log.lock().push(format!("chunk:{text}"));
        }

        fn on_complete(&mut self, _request_id: &RequestId, content: &str) {
            self.log.lock().push(format!("complete:{content}"));
        }

        fn on_error(&mut self, _request_id: &RequestId, outcome: &SessionOutcome) {
            self.log.lock().push(format!("error:{outcome:?}"));
        }
    }

    #[tokio::test]
    async fn observer_receives_callbacks() {
        let registry = SessionRegistry::new(16);
        let (session, r1) = ids("s", "r1");
        let recorder = Recorder::default();
        let log = Arc::clone(&recorder.log);
        let _handle = observe(registry.subscribe(&session), recorder);

        let ticket = registry.begin_request(&session, &r1);
        registry.append_chunk(&ticket, "hi");
        registry.complete(&ticket);
        let second = registry.begin_request(&session, &RequestId::from("r2"));
        registry.cancel(&second);

        for _ in 0..100 {
            if log.lock().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            *log.lock(),
            vec!["chunk:hi", "complete:hi", "error:Cancelled"]
        );
    }
}
