use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    StreamExt, future,
    stream::{self, BoxStream},
};
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::coordination::{
    backend::{BackendError, CompletionBackend, CompletionStream},
    persistence::{PersistedMessage, PersistenceError, PersistenceSink},
    request::{ChatMessage, SessionId},
};

/// What the mock backend does for one call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Streams the chunks, then completes.
    Reply(Vec<&'static str>),
    /// Streams the chunks, then waits for [`MockBackend::release`] before completing.
    Gated(Vec<&'static str>),
    /// Streams the chunks, then never completes.
    Hang(Vec<&'static str>),
    /// `stream_completion` itself never returns.
    HangOnStart,
    /// Fails before streaming.
    Fail(BackendError),
    /// Streams the chunks, then fails.
    BreakAfter(Vec<&'static str>, BackendError),
    Panic,
}

/// Scriptable [`CompletionBackend`]. Calls consume scripts in order; once they run
/// out every call uses the fallback script.
pub struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    chunk_delay: Duration,
    gate: Arc<Semaphore>,
    calls: AtomicUsize,
    live: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    models: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(fallback: Script) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            chunk_delay: Duration::ZERO,
            gate: Arc::new(Semaphore::new(0)),
            calls: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            models: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(chunks: Vec<&'static str>) -> Self {
        Self::new(Script::Reply(chunks))
    }

    pub fn gated(chunks: Vec<&'static str>) -> Self {
        Self::new(Script::Gated(chunks))
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Queues scripts consumed before the fallback.
    pub fn then(self, script: Script) -> Self {
        self.scripts.lock().push_back(script);
        self
    }

    /// Lets `n` gated streams complete.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Streams currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most streams ever open at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn models(&self) -> Vec<String> {
        self.models.lock().clone()
    }

    fn chunks(
        &self,
        chunks: Vec<&'static str>,
    ) -> BoxStream<'static, Result<String, BackendError>> {
        let delay = self.chunk_delay;
        stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(chunk.to_owned())
            })
            .boxed()
    }
}

/// Decrements the live stream count when the stream is dropped.
struct LiveStream(Arc<AtomicUsize>);

impl Drop for LiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionBackend for MockBackend {
    async fn stream_completion(
        &self,
        model: &str,
        _messages: &[ChatMessage],
    ) -> Result<CompletionStream, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models.lock().push(model.to_owned());
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let body = match script {
            Script::Reply(chunks) => self.chunks(chunks),
            Script::Gated(chunks) => {
                let gate = Arc::clone(&self.gate);
                let wait = stream::once(async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                })
                .filter_map(|()| future::ready(None::<Result<String, BackendError>>));
                self.chunks(chunks).chain(wait).boxed()
            }
            Script::Hang(chunks) => self.chunks(chunks).chain(stream::pending()).boxed(),
            Script::HangOnStart => return future::pending().await,
            Script::Fail(error) => return Err(error),
            Script::BreakAfter(chunks, error) => self
                .chunks(chunks)
                .chain(stream::once(future::ready(Err(error))))
                .boxed(),
            Script::Panic => panic!("mock backend exploded"),
        };

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        let guard = LiveStream(Arc::clone(&self.live));
        Ok(body
            .map(move |item| {
                let _live = &guard;
                item
            })
            .boxed())
    }
}

/// [`PersistenceSink`] that records every save and can be told to fail or hang.
#[derive(Default)]
pub struct RecordingPersistence {
    saved: Mutex<Vec<PersistedMessage>>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl RecordingPersistence {
    pub fn failing() -> Self {
        let sink = Self::default();
        sink.failing.store(true, Ordering::SeqCst);
        sink
    }

    pub fn hanging() -> Self {
        let sink = Self::default();
        sink.hanging.store(true, Ordering::SeqCst);
        sink
    }

    pub fn saved(&self) -> Vec<PersistedMessage> {
        self.saved.lock().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.saved
            .lock()
            .iter()
            .map(|message| message.content.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceSink for RecordingPersistence {
    async fn save(
        &self,
        user_message: Option<&ChatMessage>,
        content: &str,
        session_id: &SessionId,
    ) -> Result<PersistedMessage, PersistenceError> {
        if self.hanging.load(Ordering::SeqCst) {
            future::pending::<()>().await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable {
                message: "store offline".to_owned(),
            });
        }
        let mut saved = self.saved.lock();
        let message = PersistedMessage {
            id: format!("saved-{}", saved.len() + 1),
            session_id: session_id.clone(),
            user_message: user_message.cloned(),
            content: content.to_owned(),
        };
        saved.push(message.clone());
        Ok(message)
    }
}
