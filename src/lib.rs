//! Coordination core for concurrent, multi-user chat completion requests.
//!
//! Every submitted [`ChatRequest`](coordination::request::ChatRequest) passes through
//! the same pipeline:
//!
//! 1. **Rate limiting**: a per-user sliding window (default 20 requests / 60s).
//! 2. **Admission**: a global slot pool (default 5) plus a per-user cap (default 3).
//!    Requests that cannot get a slot wait in a queue that is FIFO per user.
//! 3. **Execution**: a worker streams the completion from the backend, relays every
//!    chunk into the conversation's isolated session state and persists the final
//!    content once. A watchdog bounds the lifetime of every request, counted from
//!    its first attempt and across retries.
//! 4. **Fallback**: after repeated failures of the concurrent path a circuit breaker
//!    routes new work through a sequential lane until the path recovers.
//!
//! Session state is generation-tokened: once a conversation starts a new request,
//! late output from the superseded one can no longer touch what observers see.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use chat_coordinator::coordination::{
//!     CoordinatorSettings,
//!     coordinator::ChatCoordinator,
//!     persistence::InMemoryPersistence,
//!     request::{ChatMessage, ChatRequest},
//! };
//! # async fn run(backend: Arc<dyn chat_coordinator::coordination::backend::CompletionBackend>) {
//! let coordinator = ChatCoordinator::new(
//!     CoordinatorSettings::default(),
//!     backend,
//!     Arc::new(InMemoryPersistence::default()),
//! )
//! .expect("default settings are valid");
//!
//! let request = ChatRequest::new("alice", "conversation-1", "gpt-4o-mini", vec![ChatMessage::user("hi")]);
//! let mut events = coordinator.subscribe(request.session_id());
//! let _id = coordinator.submit(request).expect("admitted");
//! while let Some(event) = events.next().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```
//!
//! # Configuration
//! See [`coordination::CoordinatorSettings`].
//!
//! # Metrics
//! Emitted through the `metrics` facade, see [`coordination::internal_event`].
#[macro_use]
extern crate tracing;

pub mod coordination;
#[cfg(test)]
pub mod test_utils;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
