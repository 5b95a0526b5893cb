//! HTTP server wrapping an application with the request gate.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::service::{rate_limit, RequestGate};
use crate::error::Result;

/// HTTP server that puts a [`RequestGate`] in front of an application.
pub struct GateServer {
    listener: TcpListener,
    app: Router,
}

impl GateServer {
    /// Bind to `addr` and wrap `app` with the gate.
    pub async fn bind(addr: SocketAddr, gate: Arc<RequestGate>, app: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let app = app.layer(middleware::from_fn_with_state(gate, rate_limit));
        Ok(Self { listener, app })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            self.listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Application served by the standalone binary: every admitted request
/// gets `200 OK`.
pub fn default_app() -> Router {
    Router::new().fallback(|| async { "OK\n" })
}
