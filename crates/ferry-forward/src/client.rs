use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::{ForwardError, ForwardResult};
use crate::wire::WireBatch;

/// Path peers accept forwarded batches on.
pub const FORWARD_PATH: &str = "/event/forward";

/// Sends a batch to one peer.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn send(&self, peer: &str, batch: &WireBatch) -> ForwardResult<()>;
}

/// JSON-over-HTTP peer client.
#[derive(Clone)]
pub struct HttpPeerClient {
    client: Client<HttpConnector, Full<Bytes>>,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(request_timeout: Duration, auth_token: Option<String>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            auth_token,
            request_timeout,
        }
    }

    fn transport(peer: &str, reason: impl ToString) -> ForwardError {
        ForwardError::Transport {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn send(&self, peer: &str, batch: &WireBatch) -> ForwardResult<()> {
        let body = batch.encode()?;
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{peer}{FORWARD_PATH}"))
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.auth_token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = request
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| Self::transport(peer, e))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| ForwardError::Timeout {
                peer: peer.to_string(),
            })?
            .map_err(|e| Self::transport(peer, e))?;

        let status = response.status();
        // Drain the body so the connection can be reused.
        let _ = response.into_body().collect().await;
        if !status.is_success() {
            return Err(ForwardError::Status {
                peer: peer.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(peer = %peer, events = batch.events.len(), "batch forwarded");
        Ok(())
    }
}
