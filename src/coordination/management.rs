//! Request/response management surface over [`ChatCoordinator`].
//!
//! Transport agnostic: hand it an [`http::Request`] with a string body and send the
//! returned [`http::Response`] back through whatever server is in use.
//!
//! | Route | Success | Errors |
//! |-------|---------|--------|
//! | `GET /chats?user=U` | 200, active requests of `U` | 400 without `user` |
//! | `POST /chats` | 202, `{"requestId": ...}` | 400 bad body, 409 duplicate id, 429 rate or capacity, 503 shutting down |
//! | `DELETE /chats/{id}` | 200, `{"outcome": ...}` | 404 unknown request |
//! | `DELETE /chats?user=U` | 200, `{"cancelled": n}` | 400 without `user` |
//! | `GET /sessions/{id}` | 200, session snapshot | 404 unknown session |
//! | `GET /status` | 200, aggregate stats | |

use http::{Method, Request, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{
    coordinator::{CancelOutcome, ChatCoordinator},
    error::AdmissionError,
    request::{ChatMessage, ChatRequest, RequestId, SessionId, UserId},
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubmitBody {
    user: UserId,
    session: SessionId,
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(default)]
    request_id: Option<RequestId>,
}

#[derive(Clone)]
pub struct ManagementApi {
    coordinator: ChatCoordinator,
}

impl ManagementApi {
    pub fn new(coordinator: ChatCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn handle(&self, request: Request<String>) -> Response<String> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path().trim_end_matches('/');
        let user = query_param(parts.uri.query(), "user").map(UserId::from);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        debug!(
            target: "chat_coordinator::management",
            method = %parts.method,
            path,
            "Handling management request"
        );

        match (&parts.method, segments.as_slice()) {
            (&Method::GET, ["chats"]) => match user {
                Some(user) => json_response(StatusCode::OK, &self.coordinator.list_active(&user)),
                None => missing_user(),
            },
            (&Method::POST, ["chats"]) => self.submit(&body),
            (&Method::DELETE, ["chats"]) => match user {
                Some(user) => {
                    let cancelled = self.coordinator.cancel_all(&user);
                    json_response(StatusCode::OK, &json!({ "cancelled": cancelled }))
                }
                None => missing_user(),
            },
            (&Method::DELETE, ["chats", id]) => {
                let id = RequestId::from(*id);
                match self.coordinator.cancel(&id) {
                    CancelOutcome::NotFound => not_found(&format!("Unknown request {id}")),
                    outcome => json_response(StatusCode::OK, &outcome),
                }
            }
            (&Method::GET, ["sessions", id]) => {
                let id = SessionId::from(*id);
                match self.coordinator.session_state(&id) {
                    Some(snapshot) => json_response(StatusCode::OK, &snapshot),
                    None => not_found(&format!("Unknown session {id}")),
                }
            }
            (&Method::GET, ["status"]) => json_response(StatusCode::OK, &self.coordinator.status()),
            _ => not_found("No such route"),
        }
    }

    fn submit(&self, body: &str) -> Response<String> {
        let body: SubmitBody = match serde_json::from_str(body) {
            Ok(body) => body,
            Err(error) => {
                return error_response(StatusCode::BAD_REQUEST, "INVALID_BODY", &error.to_string());
            }
        };
        let request = match body.request_id {
            Some(id) => {
                ChatRequest::with_id(id, body.user, body.session, body.model, body.messages)
            }
            None => ChatRequest::new(body.user, body.session, body.model, body.messages),
        };

        match self.coordinator.submit(request) {
            Ok(request_id) => {
                json_response(StatusCode::ACCEPTED, &json!({ "requestId": request_id }))
            }
            Err(error) => {
                let mut response =
                    error_response(error.status_code(), error.code(), &error.to_string());
                if let AdmissionError::RateLimited { retry_after } = error {
                    let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, header::HeaderValue::from(secs));
                }
                response
            }
        }
    }
}

fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<String> {
    match serde_json::to_string(body) {
        Ok(body) => build(status, body),
        Err(error) => {
            error!(target: "chat_coordinator::management", %error, "Failed to serialize response");
            build(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "INTERNAL", "message": "Internal error" }).to_string(),
            )
        }
    }
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<String> {
    build(status, json!({ "error": code, "message": message }).to_string())
}

fn missing_user() -> Response<String> {
    error_response(
        StatusCode::BAD_REQUEST,
        "MISSING_USER",
        "`user` query parameter is required",
    )
}

fn not_found(message: &str) -> Response<String> {
    error_response(StatusCode::NOT_FOUND, "NOT_FOUND", message)
}

fn build(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::Value;

    use super::*;
    use crate::{
        coordination::CoordinatorSettings,
        test_utils::{MockBackend, RecordingPersistence},
    };

    fn api(
        backend: MockBackend,
        settings: CoordinatorSettings,
    ) -> (ManagementApi, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let coordinator = ChatCoordinator::new(
            settings,
            backend.clone(),
            Arc::new(RecordingPersistence::default()),
        )
        .unwrap();
        (ManagementApi::new(coordinator), backend)
    }

    fn call(api: &ManagementApi, method: Method, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(body.to_owned())
            .unwrap();
        let response = api.handle(request);
        let status = response.status();
        (status, serde_json::from_str(response.body()).unwrap())
    }

    fn submit_body(user: &str, session: &str) -> String {
        json!({
            "user": user,
            "session": session,
            "model": "gpt-test",
            "messages": [{ "role": "user", "content": "hi" }],
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn submit_list_and_cancel() {
        let (api, backend) = api(MockBackend::gated(vec!["ok"]), CoordinatorSettings::default());

        let (status, body) = call(&api, Method::POST, "/chats", &submit_body("ann", "s1"));
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["requestId"].as_str().unwrap().to_owned();

        tokio::time::sleep(Duration::from_millis(1)).await;
        let (status, body) = call(&api, Method::GET, "/chats?user=ann", "");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["requestId"], id.as_str());
        assert_eq!(body[0]["status"], "running");

        let (status, body) = call(&api, Method::DELETE, &format!("/chats/{id}"), "");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "signalled");

        let (status, _) = call(&api, Method::DELETE, "/chats/nope", "");
        assert_eq!(status, StatusCode::NOT_FOUND);
        backend.release(1);
    }

    #[tokio::test(start_paused = true)]
    async fn user_capacity_maps_to_429() {
        let settings = CoordinatorSettings::builder().max_concurrent_per_user(1).build();
        let (api, _backend) = api(MockBackend::gated(vec!["ok"]), settings);

        let (status, _) = call(&api, Method::POST, "/chats", &submit_body("bo", "s"));
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, body) = call(&api, Method::POST, "/chats", &submit_body("bo", "s"));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "USER_CONCURRENCY_EXCEEDED");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_maps_to_429_with_retry_after() {
        let settings = CoordinatorSettings::builder().requests_per_minute(2).build();
        let (api, _backend) = api(MockBackend::gated(vec!["ok"]), settings);
        for session in ["a", "b"] {
            assert_eq!(
                call(&api, Method::POST, "/chats", &submit_body("bo", session)).0,
                StatusCode::ACCEPTED
            );
        }

        let request = Request::builder()
            .method(Method::POST)
            .uri("/chats")
            .body(submit_body("bo", "c"))
            .unwrap();
        let response = api.handle(request);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
        let body: Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "RATE_LIMITED");
    }

    #[tokio::test]
    async fn bad_requests() {
        let (api, _backend) = api(MockBackend::replying(vec![]), CoordinatorSettings::default());

        let (status, body) = call(&api, Method::POST, "/chats", "{\"user\": 1}");
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "INVALID_BODY");

        assert_eq!(call(&api, Method::GET, "/chats", "").0, StatusCode::BAD_REQUEST);
        assert_eq!(call(&api, Method::GET, "/nowhere", "").0, StatusCode::NOT_FOUND);
        assert_eq!(call(&api, Method::PUT, "/status", "").0, StatusCode::NOT_FOUND);
        assert_eq!(call(&api, Method::GET, "/sessions/unknown", "").0, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_and_status() {
        let (api, _backend) = api(MockBackend::gated(vec!["ok"]), CoordinatorSettings::default());
        for session in ["a", "b"] {
            call(&api, Method::POST, "/chats", &submit_body("cy", session));
        }

        let (status, body) = call(&api, Method::DELETE, "/chats?user=cy", "");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cancelled"], 2);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let (status, body) = call(&api, Method::GET, "/status", "");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 2);
        assert_eq!(body["cancelledRequests"], 2);
        assert_eq!(body["processingCount"], 0);

        let (status, body) = call(&api, Method::GET, "/sessions/a", "");
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isLoading"], false);
    }

    #[tokio::test]
    async fn shutdown_maps_to_503() {
        let (api, _backend) = api(MockBackend::replying(vec![]), CoordinatorSettings::default());
        api.coordinator.shutdown();
        let (status, body) = call(&api, Method::POST, "/chats", &submit_body("di", "s"));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "SERVICE_DISABLED");
    }

    #[tokio::test]
    async fn duplicate_request_id_maps_to_409() {
        let (api, _backend) = api(MockBackend::gated(vec![]), CoordinatorSettings::default());
        let body = json!({
            "user": "ed",
            "session": "s",
            "model": "gpt-test",
            "messages": [],
            "requestId": "fixed",
        })
        .to_string();
        assert_eq!(call(&api, Method::POST, "/chats", &body).0, StatusCode::ACCEPTED);
        let (status, body) = call(&api, Method::POST, "/chats", &body);
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "DUPLICATE_REQUEST");
    }
}
