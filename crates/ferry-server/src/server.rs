use std::sync::Arc;

use ferry_forward::ReceiveBufferRegistry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{AllowAllAuth, AuthProvider, BearerTokenAuth};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::AppState;
use crate::router::build_router;

/// Peer-facing HTTP server of one ferry node.
pub struct FerryServer {
    config: ServerConfig,
    registry: Arc<ReceiveBufferRegistry>,
    auth: Arc<dyn AuthProvider>,
}

impl FerryServer {
    /// Requests must carry `config.auth_token` when one is set.
    pub fn new(config: ServerConfig, registry: Arc<ReceiveBufferRegistry>) -> Self {
        let auth: Arc<dyn AuthProvider> = match &config.auth_token {
            Some(token) => Arc::new(BearerTokenAuth::new(token.clone())),
            None => Arc::new(AllowAllAuth),
        };
        Self {
            config,
            registry,
            auth,
        }
    }

    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = auth;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Build the router (useful for testing).
    pub fn router(&self) -> axum::Router {
        build_router(
            AppState {
                registry: self.registry.clone(),
                auth: self.auth.clone(),
                write_timeout: self.config.write_timeout,
            },
            self.config.max_request_bytes,
        )
    }

    /// Bind `config.bind_addr` and serve until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> ServerResult<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_on(listener, cancel).await
    }

    /// Serve on an already bound listener until `cancel` fires. In-flight
    /// requests finish before this returns.
    pub async fn serve_on(self, listener: TcpListener, cancel: CancellationToken) -> ServerResult<()> {
        let app = self.router();
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "ferry server listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        tracing::info!(%addr, "ferry server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_buffer::{BlockingBuffer, Buffer, BufferConfig};
    use ferry_forward::{ForwardError, HttpPeerClient, PeerClient, WireBatch};
    use ferry_types::Event;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn server_construction() {
        let server = FerryServer::new(ServerConfig::default(), Arc::default());
        assert_eq!(server.config().bind_addr.port(), 4994);
        let _router = server.router();
    }

    #[tokio::test]
    async fn peer_client_delivers_into_receive_buffer() {
        let buffer = Arc::new(BlockingBuffer::<Event>::new(BufferConfig::default()).unwrap());
        let registry = Arc::new(ReceiveBufferRegistry::new());
        registry.register("aggregate", buffer.clone());

        let config = ServerConfig {
            auth_token: Some("peer-token".into()),
            ..ServerConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(FerryServer::new(config, registry).serve_on(listener, cancel.clone()));

        let events = vec![
            Event::new("log", json!({"user": "a"})).unwrap(),
            Event::new("log", json!({"user": "b"})).unwrap(),
        ];
        let batch = WireBatch::new("aggregate", &events);

        let client = HttpPeerClient::new(Duration::from_secs(5), Some("peer-token".into()));
        client.send(&peer, &batch).await.unwrap();
        let (records, token) = buffer.read(Duration::from_secs(1)).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].data().get("user"), Some(&json!("a")));
        buffer.checkpoint(token).unwrap();

        let anonymous = HttpPeerClient::new(Duration::from_secs(5), None);
        assert!(matches!(
            anonymous.send(&peer, &batch).await,
            Err(ForwardError::Status { status: 401, .. })
        ));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
