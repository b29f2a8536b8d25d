use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use ferry_forward::{ReceiveBufferRegistry, WireBatch};
use ferry_types::Record;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{AuthProvider, Credentials};
use crate::error::{ServerError, ServerResult};

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ReceiveBufferRegistry>,
    pub auth: Arc<dyn AuthProvider>,
    pub write_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub accepted: usize,
}

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}

/// Accept a batch forwarded by a peer and queue it on the owning
/// processor's receive buffer.
pub async fn forward_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ServerResult<Json<ForwardResponse>> {
    let identity = state
        .auth
        .authenticate(&Credentials::from_headers(&headers))
        .await?;
    let batch = WireBatch::decode(&body)?;
    let buffer = state
        .registry
        .get(&batch.plugin_id)
        .ok_or_else(|| ServerError::UnknownPlugin(batch.plugin_id.clone()))?;

    let plugin_id = batch.plugin_id.clone();
    let records: Vec<_> = batch.into_events()?.into_iter().map(Record::new).collect();
    let accepted = records.len();
    if accepted > 0 {
        buffer.write_all(records, state.write_timeout).await?;
    }
    debug!(plugin = %plugin_id, from = %identity.name, accepted, "forwarded batch received");
    Ok(Json(ForwardResponse { accepted }))
}
