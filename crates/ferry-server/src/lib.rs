//! Peer-facing HTTP server for a ferry node.
//!
//! Receives batches other nodes forward to this one (`POST /event/forward`)
//! and queues them on the matching processor's receive buffer. Also hosts
//! the tracing bootstrap used by binaries embedding ferry.

pub mod auth;
pub mod config;
pub mod error;
pub mod handler;
pub mod router;
pub mod server;
pub mod telemetry;

pub use auth::{AllowAllAuth, AuthProvider, BearerTokenAuth, Credentials, Identity};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{AppState, ForwardResponse, HealthResponse};
pub use server::FerryServer;
pub use telemetry::init_tracing;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use ferry_buffer::{BlockingBuffer, Buffer, BufferConfig, CircuitBreakingBuffer};
    use ferry_forward::{ReceiveBufferRegistry, WireBatch, FORWARD_PATH};
    use ferry_types::{Event, ManualCircuitBreaker};
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn app(registry: Arc<ReceiveBufferRegistry>, token: Option<&str>) -> Router {
        let config = ServerConfig {
            auth_token: token.map(str::to_string),
            write_timeout: Duration::from_millis(20),
            ..ServerConfig::default()
        };
        FerryServer::new(config, registry).router()
    }

    fn batch_body(plugin_id: &str, n: usize) -> Body {
        let events: Vec<Event> = (0..n)
            .map(|i| Event::new("log", json!({"n": i})).unwrap())
            .collect();
        Body::from(WireBatch::new(plugin_id, &events).encode().unwrap())
    }

    fn forward_request(body: Body, token: Option<&str>) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(FORWARD_PATH)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request.body(body).unwrap()
    }

    fn registry_with(plugin_id: &str, buffer: Arc<dyn Buffer<Event>>) -> Arc<ReceiveBufferRegistry> {
        let registry = Arc::new(ReceiveBufferRegistry::new());
        registry.register(plugin_id, buffer);
        registry
    }

    #[tokio::test]
    async fn health_endpoint() {
        let response = app(Arc::default(), None)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn forward_writes_into_receive_buffer() {
        let buffer = Arc::new(BlockingBuffer::<Event>::new(BufferConfig::default()).unwrap());
        let app = app(registry_with("aggregate", buffer.clone()), None);

        let response = app
            .oneshot(forward_request(batch_body("aggregate", 3), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let accepted: ForwardResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(accepted.accepted, 3);
        assert_eq!(buffer.queued(), 3);
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_found() {
        let response = app(Arc::default(), None)
            .oneshot(forward_request(batch_body("missing", 1), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn token_is_enforced() {
        let buffer = Arc::new(BlockingBuffer::<Event>::new(BufferConfig::default()).unwrap());
        let registry = registry_with("aggregate", buffer.clone());

        let denied = app(registry.clone(), Some("s3cret"))
            .oneshot(forward_request(batch_body("aggregate", 1), None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = app(registry.clone(), Some("s3cret"))
            .oneshot(forward_request(batch_body("aggregate", 1), Some("guess")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let allowed = app(registry, Some("s3cret"))
            .oneshot(forward_request(batch_body("aggregate", 1), Some("s3cret")))
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
        assert_eq!(buffer.queued(), 1);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let response = app(Arc::default(), None)
            .oneshot(forward_request(Body::from("{not json"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_buffer_is_service_unavailable() {
        let config = BufferConfig {
            capacity: 2,
            batch_size: 2,
            ..BufferConfig::default()
        };
        let buffer = Arc::new(BlockingBuffer::<Event>::new(config).unwrap());
        buffer
            .write(ferry_types::Record::new(Event::new("log", json!({})).unwrap()), Duration::ZERO)
            .await
            .unwrap();
        let app = app(registry_with("aggregate", buffer), None);

        let response = app
            .oneshot(forward_request(batch_body("aggregate", 2), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn open_circuit_is_too_many_requests() {
        let inner = Arc::new(BlockingBuffer::<Event>::new(BufferConfig::default()).unwrap());
        let breaker = Arc::new(ManualCircuitBreaker::new());
        breaker.trip();
        let buffer = Arc::new(CircuitBreakingBuffer::<Event>::new(inner, breaker));
        let app = app(registry_with("aggregate", buffer), None);

        let response = app
            .oneshot(forward_request(batch_body("aggregate", 1), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
