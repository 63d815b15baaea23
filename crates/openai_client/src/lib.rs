//! Streaming OpenAI-compatible chat completion backend.
//!
//! [`OpenAIClient`] POSTs `stream: true` requests to `{base_url}/v1/chat/completions`
//! through a `tower` stack (a timeout layer around [`http::ReqwestService`]) and
//! exposes the server-sent events as a stream of content deltas, so it can be
//! plugged straight into a `ChatCoordinator`.

#[macro_use]
extern crate tracing;

pub mod http;
pub mod sse;

use std::{env, sync::Arc, time::Duration};

use async_trait::async_trait;
use bon::Builder;
use bytes::Bytes;
use chat_coordinator::coordination::{
    backend::{BackendError, CompletionBackend, CompletionStream},
    request::ChatMessage,
};
use futures::StreamExt;
use ::http::{HeaderValue, Request as HttpRequest, Response as HttpResponse, header};
use parking_lot::Mutex;
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use tower::{
    Service, ServiceBuilder, ServiceExt, timeout::error::Elapsed, util::BoxCloneService,
};

use self::{
    http::{ByteStream, HttpError, ReqwestService},
    sse::DeltaStream,
};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// The `tower` stack requests go through.
pub type HttpService = BoxCloneService<HttpRequest<Bytes>, HttpResponse<ByteStream>, Error>;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
/// Longest error body kept in a [`BackendError::Status`].
const MAX_ERROR_BODY: usize = 4 * 1024;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OpenAIClientError {
    #[snafu(display("API key cannot be empty"))]
    MissingApiKey,

    #[snafu(display("API key is not a valid header value: {source}"))]
    InvalidApiKey { source: ::http::header::InvalidHeaderValue },

    #[snafu(display("Failed to build the HTTP client: {source}"))]
    BuildClient { source: reqwest::Error },
}

const fn default_timeout_secs() -> u64 {
    // matches the coordinator's default backend timeout
    300
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_base_url() -> String {
    "https://api.openai.com".to_owned()
}

fn default_user_agent() -> String {
    format!("chat-coordinator-openai/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Builder)]
pub struct OpenAIClientConfig {
    #[builder(into)]
    api_key: String,

    #[builder(into, default = default_base_url())]
    base_url: String,

    /// Backend-level timeout. Keep it above the coordinator's watchdog.
    #[builder(default = default_timeout_secs())]
    timeout_secs: u64,

    #[builder(default = default_connect_timeout_secs())]
    connect_timeout_secs: u64,

    #[builder(into, default = default_user_agent())]
    user_agent: String,

    temperature: Option<f32>,

    max_tokens: Option<u32>,
}

impl OpenAIClientConfig {
    /// Reads `OPENAI_API_KEY`, `OPENAI_API_BASE_URL` and `OPENAI_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, OpenAIClientError> {
        let api_key = env::var("OPENAI_API_KEY").unwrap_or_default();
        if api_key.is_empty() {
            return Err(OpenAIClientError::MissingApiKey);
        }
        let base_url = env::var("OPENAI_API_BASE_URL").unwrap_or_else(|_| default_base_url());
        let timeout_secs = env::var("OPENAI_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(default_timeout_secs);
        Ok(Self::builder()
            .api_key(api_key)
            .base_url(base_url)
            .timeout_secs(timeout_secs)
            .build())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub struct OpenAIClient {
    service: Mutex<HttpService>,
    config: Arc<OpenAIClientConfig>,
    authorization: HeaderValue,
    chat_completions_url: String,
}

impl OpenAIClient {
    pub fn new(config: OpenAIClientConfig) -> Result<Self, OpenAIClientError> {
        // the tower timeout bounds the response head, reqwest's the whole exchange
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .context(BuildClientSnafu)?;
        let service = ServiceBuilder::new()
            .timeout(config.timeout())
            .map_err(Error::from)
            .service(ReqwestService::new_with_client(client));
        Self::with_service(config, BoxCloneService::new(service))
    }

    /// Uses `service` in place of the default reqwest stack.
    pub fn with_service(
        config: OpenAIClientConfig,
        service: HttpService,
    ) -> Result<Self, OpenAIClientError> {
        if config.api_key.is_empty() {
            return Err(OpenAIClientError::MissingApiKey);
        }
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context(InvalidApiKeySnafu)?;
        authorization.set_sensitive(true);
        let chat_completions_url = format!(
            "{}{}",
            config.base_url.trim_end_matches('/'),
            CHAT_COMPLETIONS_PATH
        );

        info!(
            target: "openai_client",
            base_url = %config.base_url,
            timeout_secs = config.timeout_secs,
            "OpenAIClient initialized"
        );
        Ok(Self {
            service: Mutex::new(service),
            config: Arc::new(config),
            authorization,
            chat_completions_url,
        })
    }

    pub fn config(&self) -> &OpenAIClientConfig {
        &self.config
    }

    fn build_request(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<HttpRequest<Bytes>, BackendError> {
        let payload = ChatCompletionRequest {
            model,
            messages,
            stream: true,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let body = serde_json::to_vec(&payload).map_err(|error| BackendError::Content {
            message: format!("Failed to encode the request: {error}"),
        })?;

        HttpRequest::post(self.chat_completions_url.as_str())
            .header(header::AUTHORIZATION, self.authorization.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .body(Bytes::from(body))
            .map_err(|error| BackendError::Content {
                message: format!("Failed to build the request: {error}"),
            })
    }
}

/// Maps an error from the tower stack onto the coordinator's taxonomy.
fn classify(error: Error) -> BackendError {
    if error.is::<Elapsed>() {
        return BackendError::Timeout;
    }
    match error.downcast::<HttpError>() {
        Ok(error) => match *error {
            HttpError::Timeout => BackendError::Timeout,
            HttpError::Transport { source } => BackendError::Transport {
                message: source.to_string(),
            },
            HttpError::InvalidRequest { details } => BackendError::Content { message: details },
        },
        Err(other) => BackendError::Transport {
            message: other.to_string(),
        },
    }
}

/// Reads at most [`MAX_ERROR_BODY`] bytes of an error response.
async fn error_body(mut body: ByteStream) -> String {
    let mut collected = Vec::new();
    while let Some(Ok(chunk)) = body.next().await {
        let room = MAX_ERROR_BODY.saturating_sub(collected.len());
        collected.extend_from_slice(&chunk[..chunk.len().min(room)]);
        if collected.len() >= MAX_ERROR_BODY {
            break;
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

#[async_trait]
impl CompletionBackend for OpenAIClient {
    async fn stream_completion(
        &self,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<CompletionStream, BackendError> {
        let request = self.build_request(model, messages)?;
        let mut service = self.service.lock().clone();
        debug!(
            target: "openai_client",
            model,
            num_messages = messages.len(),
            "Sending streaming chat completion request"
        );

        let response = service
            .ready()
            .await
            .map_err(classify)?
            .call(request)
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response.into_body()).await;
            if status.is_server_error() || status == ::http::StatusCode::TOO_MANY_REQUESTS {
                warn!(target: "openai_client", %status, "Completion endpoint is struggling");
            } else {
                debug!(target: "openai_client", %status, "Completion request rejected");
            }
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(target: "openai_client", %status, "Streaming completion started");
        Ok(DeltaStream::new(response.into_body()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use tokio_test::{assert_pending, assert_ready, task};
    use tower_test::mock;

    use super::*;

    type Handle = mock::Handle<HttpRequest<Bytes>, HttpResponse<ByteStream>>;

    fn config() -> OpenAIClientConfig {
        OpenAIClientConfig::builder()
            .api_key("sk-test")
            .base_url("http://llm.local/")
            .temperature(0.2)
            .build()
    }

    fn client() -> (OpenAIClient, Handle) {
        let (service, handle) = mock::pair::<HttpRequest<Bytes>, HttpResponse<ByteStream>>();
        let client = OpenAIClient::with_service(config(), BoxCloneService::new(service)).unwrap();
        (client, handle)
    }

    fn response(status: u16, parts: &[&'static str]) -> HttpResponse<ByteStream> {
        let chunks: Vec<Result<Bytes, Error>> = parts
            .iter()
            .map(|part| Ok(Bytes::from_static(part.as_bytes())))
            .collect();
        HttpResponse::builder()
            .status(status)
            .body(stream::iter(chunks).boxed())
            .unwrap()
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::system("Be brief."), ChatMessage::user("Capital of France?")]
    }

    #[tokio::test]
    async fn streams_deltas_from_the_endpoint() {
        let (client, mut handle) = client();
        let messages = messages();
        let mut call = task::spawn(client.stream_completion("gpt-test", &messages));
        assert_pending!(call.poll());

        let (request, send) = handle.next_request().await.unwrap();
        assert_eq!(request.uri(), "http://llm.local/v1/chat/completions");
        assert_eq!(request.method(), ::http::Method::POST);
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer sk-test");
        let payload: serde_json::Value = serde_json::from_slice(request.body()).unwrap();
        assert_eq!(payload["model"], "gpt-test");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["messages"][1]["role"], "user");
        assert_eq!(payload["messages"][1]["content"], "Capital of France?");
        assert!(payload.get("max_tokens").is_none());

        send.send_response(response(
            200,
            &[
                "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"Par\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"is\"},\"finish_reason\":\"stop\"}]}\n\n",
                "data: [DONE]\n\n",
            ],
        ));
        let stream = assert_ready!(call.poll()).unwrap();
        let deltas: Vec<String> = stream.map(Result::unwrap).collect().await;
        assert_eq!(deltas, vec!["Par", "is"]);
    }

    #[tokio::test]
    async fn status_errors_carry_the_body() {
        let (client, mut handle) = client();
        let messages = messages();
        let mut call = task::spawn(client.stream_completion("gpt-test", &messages));
        assert_pending!(call.poll());

        let (_, send) = handle.next_request().await.unwrap();
        send.send_response(response(429, &["{\"error\":{\"message\":\"slow down\"}}"]));
        let error = match call.await {
            Err(error) => error,
            Ok(_) => panic!("expected an error"),
        };
        assert!(error.is_transient());
        assert!(matches!(
            error,
            BackendError::Status { status: 429, ref body } if body.contains("slow down")
        ));
    }

    #[tokio::test]
    async fn client_errors_are_not_transient() {
        let (client, mut handle) = client();
        let messages = messages();
        let mut call = task::spawn(client.stream_completion("gpt-test", &messages));
        assert_pending!(call.poll());

        let (_, send) = handle.next_request().await.unwrap();
        send.send_response(response(400, &["bad request"]));
        let Err(error) = call.await else {
            panic!("expected an error");
        };
        assert!(!error.is_transient());
    }

    #[tokio::test]
    async fn transport_errors_are_transient() {
        let (client, mut handle) = client();
        let messages = messages();
        let mut call = task::spawn(client.stream_completion("gpt-test", &messages));
        assert_pending!(call.poll());

        let (_, send) = handle.next_request().await.unwrap();
        send.send_error(HttpError::Timeout);
        let Err(error) = call.await else {
            panic!("expected an error");
        };
        assert_eq!(error, BackendError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_bounds_the_response_head() {
        let (service, mut handle) = mock::pair::<HttpRequest<Bytes>, HttpResponse<ByteStream>>();
        let service = ServiceBuilder::new()
            .timeout(Duration::from_secs(5))
            .map_err(Error::from)
            .service(service);
        let client = OpenAIClient::with_service(config(), BoxCloneService::new(service)).unwrap();
        let messages = messages();
        let mut call = task::spawn(client.stream_completion("gpt-test", &messages));
        assert_pending!(call.poll());

        // the request is accepted but never answered
        let _pending = handle.next_request().await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let Err(error) = call.await else {
            panic!("expected a timeout");
        };
        assert_eq!(error, BackendError::Timeout);
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let (service, _handle) = mock::pair::<HttpRequest<Bytes>, HttpResponse<ByteStream>>();
        let config = OpenAIClientConfig::builder().api_key("").build();
        assert!(matches!(
            OpenAIClient::with_service(config, BoxCloneService::new(service)),
            Err(OpenAIClientError::MissingApiKey)
        ));
    }
}
