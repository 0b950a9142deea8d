//! HTTP server implementation.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers::{router, AppState};
use crate::error::{RatewardenError, Result};

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Shared handler state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            node_id = %self.state.node_id(),
            "Starting HTTP server for rate limit checks"
        );

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                RatewardenError::Server(e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SharedClock};
    use crate::config::RatewardenConfig;
    use crate::ratelimit::RateLimiter;
    use crate::store::{MemoryStore, StateStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new(clock.clone()));
        let config = RatewardenConfig::default();
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            clock,
            &config.rate_limiting,
        ));
        let state = AppState::new(limiter, store, &config);

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, state);

        let result = server.serve_with_shutdown(async {}).await;
        assert!(result.is_ok());
    }
}
