use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::instant_now;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id! {
    /// Opaque identifier of one chat request.
    RequestId
}

string_id! {
    UserId
}

string_id! {
    /// Identifier of a conversation. Session state is isolated per `SessionId`.
    SessionId
}

static NEXT_REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    /// Generates a process-unique id, e.g. `chat-42-1f9c03ab`.
    pub fn generate() -> Self {
        let seq = NEXT_REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("chat-{}-{:08x}", seq, rand::random::<u32>()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl RequestStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::TimedOut
        )
    }

    /// The only transitions a request may take. `Failed -> Queued` is a retry,
    /// `Failed -> Failed` marks retries as exhausted. `Queued -> TimedOut` is a
    /// retry whose lifetime ran out before it got to run again.
    pub const fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Queued, TimedOut)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, TimedOut)
                | (Failed, Queued)
                | (Failed, Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// One conversational exchange submitted to the coordinator.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    id: RequestId,
    user_id: UserId,
    session_id: SessionId,
    model: String,
    messages: Vec<ChatMessage>,
    submitted_at: Instant,
    retry_count: usize,
    status: RequestStatus,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self::with_id(RequestId::generate(), user_id, session_id, model, messages)
    }

    pub fn with_id(
        id: impl Into<RequestId>,
        user_id: impl Into<UserId>,
        session_id: impl Into<SessionId>,
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            model: model.into(),
            messages,
            submitted_at: instant_now(),
            retry_count: 0,
            status: RequestStatus::Queued,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// The most recent user turn, which is what gets persisted next to the reply.
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    /// Applies a status change, refusing anything outside the allowed transitions.
    pub(crate) fn transition(&mut self, next: RequestStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                target: "chat_coordinator::request",
                request_id = %self.id,
                from = %self.status,
                to = %next,
                "Rejected illegal status transition"
            );
            return false;
        }
        if self.status == RequestStatus::Failed && next == RequestStatus::Queued {
            self.retry_count += 1;
        }
        self.status = next;
        true
    }

    /// Sets a terminal status on a fault path that bypassed the regular transitions.
    pub(crate) fn force_status(&mut self, status: RequestStatus) {
        self.status = status;
    }
}

/// Read-only view of an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRequestInfo {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub model: String,
    pub status: RequestStatus,
    pub retry_count: usize,
    pub age_ms: u64,
}

impl ActiveRequestInfo {
    pub(crate) fn of(request: &ChatRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            user_id: request.user_id.clone(),
            session_id: request.session_id.clone(),
            model: request.model.clone(),
            status: request.status,
            retry_count: request.retry_count,
            age_ms: request.submitted_at.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions_only() {
        use RequestStatus::*;
        let all = [Queued, Running, Completed, Failed, Cancelled, TimedOut];
        let allowed = [
            (Queued, Running),
            (Queued, Cancelled),
            (Queued, TimedOut),
            (Running, Completed),
            (Running, Failed),
            (Running, Cancelled),
            (Running, TimedOut),
            (Failed, Queued),
            (Failed, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_never_move() {
        use RequestStatus::*;
        for terminal in [Completed, Cancelled, TimedOut] {
            assert!(terminal.is_terminal());
            for to in [Queued, Running, Completed, Failed, Cancelled, TimedOut] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn retry_transition_bumps_retry_count() {
        let mut request = ChatRequest::new("u", "s", "m", vec![ChatMessage::user("hi")]);
        assert!(request.transition(RequestStatus::Running));
        assert!(request.transition(RequestStatus::Failed));
        assert!(request.transition(RequestStatus::Queued));
        assert_eq!(request.retry_count(), 1);
        assert!(!request.transition(RequestStatus::Completed));
        assert_eq!(request.status(), RequestStatus::Queued);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn last_user_message_skips_assistant_turns() {
        let request = ChatRequest::new(
            "u",
            "s",
            "m",
            vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("first"),
                ChatMessage::assistant("answer"),
                ChatMessage::user("second"),
                ChatMessage::assistant("partial"),
            ],
        );
        assert_eq!(request.last_user_message().unwrap().content, "second");
    }
}
