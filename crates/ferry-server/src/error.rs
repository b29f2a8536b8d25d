use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use ferry_buffer::BufferError;
use ferry_forward::ForwardError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("no receive buffer registered for plugin {0:?}")]
    UnknownPlugin(String),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("forwarding error: {0}")]
    Forward(#[from] ForwardError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::UnknownPlugin(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Forward(ForwardError::Codec(_)) => StatusCode::BAD_REQUEST,
            Self::Buffer(BufferError::WriteTimeout { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Buffer(BufferError::CircuitOpen) => StatusCode::TOO_MANY_REQUESTS,
            Self::Buffer(BufferError::CapacityExceeded { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "forward request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
