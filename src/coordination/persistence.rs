//! Where finished assistant messages are stored.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use snafu::Snafu;

use super::request::{ChatMessage, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedMessage {
    pub id: String,
    pub session_id: SessionId,
    pub user_message: Option<ChatMessage>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistenceError {
    #[snafu(display("Persistence store unavailable: {message}"))]
    Unavailable { message: String },

    #[snafu(display("Message rejected by the persistence store: {message}"))]
    Rejected { message: String },
}

/// Called once per completed request, and once per cancelled request that had
/// already produced content.
#[async_trait]
pub trait PersistenceSink: Send + Sync + 'static {
    async fn save(
        &self,
        user_message: Option<&ChatMessage>,
        content: &str,
        session_id: &SessionId,
    ) -> Result<PersistedMessage, PersistenceError>;
}

/// Keeps every saved message in memory, in save order.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    messages: Mutex<Vec<PersistedMessage>>,
}

impl InMemoryPersistence {
    pub fn messages(&self) -> Vec<PersistedMessage> {
        self.messages.lock().clone()
    }

    pub fn for_session(&self, session_id: &SessionId) -> Vec<PersistedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|message| &message.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

#[async_trait]
impl PersistenceSink for InMemoryPersistence {
    async fn save(
        &self,
        user_message: Option<&ChatMessage>,
        content: &str,
        session_id: &SessionId,
    ) -> Result<PersistedMessage, PersistenceError> {
        let mut messages = self.messages.lock();
        let message = PersistedMessage {
            id: format!("msg-{}", messages.len() + 1),
            session_id: session_id.clone(),
            user_message: user_message.cloned(),
            content: content.to_owned(),
        };
        messages.push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn saves_in_order_per_session() {
        let store = InMemoryPersistence::default();
        let question = ChatMessage::user("why?");
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        store.save(Some(&question), "because", &a).await.unwrap();
        store.save(None, "other", &b).await.unwrap();
        let saved = store.save(None, "again", &a).await.unwrap();

        assert_eq!(saved.id, "msg-3");
        assert_eq!(store.len(), 3);
        let contents: Vec<String> = store
            .for_session(&a)
            .into_iter()
            .map(|message| message.content)
            .collect();
        assert_eq!(contents, vec!["because", "again"]);
        assert_eq!(store.for_session(&a)[0].user_message, Some(question));
    }
}
