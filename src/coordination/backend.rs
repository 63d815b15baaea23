//! The streaming completion service the coordinator drives.

use async_trait::async_trait;
use futures::stream::BoxStream;
use snafu::Snafu;

use super::request::ChatMessage;

/// Text fragments of one completion. The end of the stream is the completion
/// signal; dropping the stream aborts the backend call.
pub type CompletionStream = BoxStream<'static, Result<String, BackendError>>;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("Transport error: {message}"))]
    Transport { message: String },

    #[snafu(display("Backend responded with status {status}: {body}"))]
    Status { status: u16, body: String },

    #[snafu(display("Backend call timed out"))]
    Timeout,

    #[snafu(display("Malformed completion stream: {message}"))]
    Stream { message: String },

    /// The model refused or could not process this particular conversation.
    #[snafu(display("Completion rejected: {message}"))]
    Content { message: String },
}

impl BackendError {
    /// Worth another attempt with the same input.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Transport { .. }
            | BackendError::Timeout
            | BackendError::Stream { .. } => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::Content { .. } => false,
        }
    }

    /// Says something about the health of the concurrent execution path rather
    /// than about one conversation. A rejected prompt does not; an unreachable or
    /// overloaded backend does.
    pub fn counts_against_circuit(&self) -> bool {
        self.is_transient()
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync + 'static {
    /// Starts a streamed completion for `messages`.
    async fn stream_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<CompletionStream, BackendError>;
}
