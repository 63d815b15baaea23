use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, future::BoxFuture, stream::BoxStream};
use http::{Request as HttpRequest, Response as HttpResponse};
use snafu::Snafu;
use tower::Service;

use crate::Error as CrateError;

/// Response body as it arrives off the wire.
pub type ByteStream = BoxStream<'static, Result<Bytes, CrateError>>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HttpError {
    #[snafu(display("Invalid request: {details}"))]
    InvalidRequest { details: String },

    #[snafu(display("Failed to reach the completion endpoint: {source}"))]
    Transport { source: reqwest::Error },

    #[snafu(display("Request timed out"))]
    Timeout,
}

impl HttpError {
    pub const fn is_retriable(&self) -> bool {
        match self {
            HttpError::InvalidRequest { .. } => false,
            HttpError::Transport { .. } | HttpError::Timeout => true,
        }
    }
}

/// A `tower::Service` over `reqwest::Client` that hands back the response head
/// right away and the body as a byte stream, whatever the status.
#[derive(Clone, Default)]
pub struct ReqwestService {
    client: reqwest::Client,
}

impl ReqwestService {
    pub fn new_with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Service<HttpRequest<Bytes>> for ReqwestService {
    type Response = HttpResponse<ByteStream>;
    type Error = HttpError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: HttpRequest<Bytes>) -> Self::Future {
        let request = match reqwest::Request::try_from(request) {
            Ok(request) => request,
            Err(error) => {
                let error = HttpError::InvalidRequest {
                    details: error.to_string(),
                };
                return Box::pin(async move { Err(error) });
            }
        };

        let client = self.client.clone();
        Box::pin(async move {
            let response = client.execute(request).await.map_err(|error| {
                if error.is_timeout() {
                    warn!(target: "openai_client::http", %error, "Request timed out");
                    HttpError::Timeout
                } else {
                    warn!(target: "openai_client::http", %error, "Transport error");
                    HttpError::Transport { source: error }
                }
            })?;

            let mut head = HttpResponse::builder().status(response.status());
            if let Some(headers) = head.headers_mut() {
                headers.extend(response.headers().clone());
            }
            let body: ByteStream = response
                .bytes_stream()
                .map_err(|error| Box::new(error) as CrateError)
                .boxed();
            head.body(body).map_err(|error| HttpError::InvalidRequest {
                details: error.to_string(),
            })
        })
    }
}
