use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::processor::log_message_flow;
use crate::queue::{BoundedQueue, EnqueueError};
use crate::types::InboundMessage;

use super::auth::bearer_matches;
use super::rate_limit::RateLimiter;

/// Body larger than this aborts the read; no callback.
pub const MAX_BODY_BYTES: usize = 15 * 1024 * 1024;

#[derive(Clone)]
pub struct HealthStatus {
    pub ok: bool,
    pub ready: bool,
    pub details: Value,
}

pub type HealthProbe = Arc<dyn Fn() -> HealthStatus + Send + Sync>;

pub struct PushServerConfig {
    pub token: String,
    pub push_path: String,
    pub rate_limit_per_second: u32,
    pub max_concurrent_requests: usize,
    pub message_flow_log: bool,
}

#[derive(Clone)]
struct AppState {
    token: Arc<str>,
    queue: Arc<BoundedQueue<InboundMessage>>,
    rate_limiter: Arc<RateLimiter>,
    in_flight: Arc<AtomicUsize>,
    max_concurrent: usize,
    health: HealthProbe,
    message_flow_log: bool,
}

/// Builds the push server router. The caller owns the listener lifecycle so
/// `main` can sequence "close HTTP listener" as its own graceful shutdown step,
/// ahead of draining the queue.
pub fn build_router(config: PushServerConfig, queue: Arc<BoundedQueue<InboundMessage>>, health: HealthProbe) -> Router {
    let state = AppState {
        token: Arc::from(config.token.as_str()),
        queue,
        rate_limiter: Arc::new(RateLimiter::new(config.rate_limit_per_second)),
        in_flight: Arc::new(AtomicUsize::new(0)),
        max_concurrent: config.max_concurrent_requests,
        health,
        message_flow_log: config.message_flow_log,
    };

    Router::new()
        .route(&config.push_path, post(push_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(router: Router, port: u16, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

async fn push_handler(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    if !bearer_matches(&headers, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing or invalid bearer token", None);
    }

    if !state.rate_limiter.try_acquire() {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED", "rate limit exceeded", None);
    }

    let in_flight = state.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
    let _guard = InFlightGuard(&state.in_flight);
    if in_flight > state.max_concurrent {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "BUSY", "too many concurrent requests", None);
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(_) => {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "request body exceeds the size cap",
                Some(json!({ "maxBodyBytes": MAX_BODY_BYTES })),
            );
        }
    };

    let message: InboundMessage = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                "request body does not match InboundMessage",
                Some(json!({ "parseError": e.to_string() })),
            );
        }
    };

    let message_id = message.message_id.clone();
    match state.queue.enqueue(message) {
        Ok(()) => {
            log_message_flow(state.message_flow_log, &message_id, None, "enqueued");
            (StatusCode::OK, Json(json!({ "accepted": true }))).into_response()
        }
        Err(EnqueueError::QueueClosed) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", "relay is shutting down", None)
        }
        Err(EnqueueError::QueueFull { max_queue }) => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "QUEUE_FULL",
            "work queue is full",
            Some(json!({ "maxQueue": max_queue })),
        ),
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let health = (state.health)();
    let status = if health.ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "status": if health.ok { "ok" } else { "degraded" }, "ok": health.ok, "ready": health.ready, "details": health.details }))).into_response()
}

async fn ready_handler(State(state): State<AppState>) -> Response {
    let health = (state.health)();
    let status = if health.ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "status": if health.ready { "ready" } else { "not_ready" }, "ok": health.ok, "ready": health.ready, "details": health.details }))).into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str, details: Option<Value>) -> Response {
    let mut body = json!({ "code": code, "message": message });
    if let Some(details) = details {
        body["details"] = details;
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BoundedQueue;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router(rate_limit: u32, max_concurrent: usize) -> Router {
        let queue: Arc<BoundedQueue<InboundMessage>> = Arc::new(BoundedQueue::start(2, 4, |_msg| async move {}));
        build_router(
            PushServerConfig {
                token: "secret".into(),
                push_path: "/relay/messages".into(),
                rate_limit_per_second: rate_limit,
                max_concurrent_requests: max_concurrent,
                message_flow_log: false,
            },
            queue,
            Arc::new(|| HealthStatus { ok: true, ready: true, details: json!({}) }),
        )
    }

    #[tokio::test]
    async fn rejects_missing_bearer_token() {
        let router = test_router(10, 10);
        let request = Request::post("/relay/messages").body(Body::from("{}")).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn accepts_a_well_formed_handshake_message() {
        let router = test_router(10, 10);
        let body = json!({ "messageId": "m1", "input": { "kind": "handshake", "nonce": "n1" } });
        let request = Request::post("/relay/messages")
            .header("Authorization", "Bearer secret")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_malformed_body_with_validation_error() {
        let router = test_router(10, 10);
        let request = Request::post("/relay/messages")
            .header("Authorization", "Bearer secret")
            .body(Body::from("not json"))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn second_request_in_same_second_past_limit_is_rate_limited() {
        let router = test_router(1, 10);
        let body = json!({ "messageId": "m1", "input": { "kind": "handshake", "nonce": "n1" } }).to_string();
        let first = Request::post("/relay/messages")
            .header("Authorization", "Bearer secret")
            .body(Body::from(body.clone()))
            .unwrap();
        assert_eq!(router.clone().oneshot(first).await.unwrap().status(), StatusCode::OK);

        let second = Request::post("/relay/messages")
            .header("Authorization", "Bearer secret")
            .body(Body::from(body))
            .unwrap();
        assert_eq!(router.oneshot(second).await.unwrap().status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
