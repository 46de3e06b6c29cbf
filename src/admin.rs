//! Admin HTTP server
//!
//! - `GET /live` - process is up
//! - `GET /ready` - 200 when an engine is Running, 503 otherwise
//! - `GET /stats` - JSON status of the active engine, or `null`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::supervisor::{EngineStatus, Supervisor};

/// Build the admin router over a shared supervisor
pub fn admin_routes(supervisor: Arc<Supervisor>) -> Router {
    Router::new()
        .route("/live", get(|| async { "ok" }))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(supervisor)
}

/// Serve the admin router on `addr` until `shutdown` is cancelled
pub async fn start_admin_server(
    addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    shutdown: CancellationToken,
) {
    let app = admin_routes(supervisor);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => {
            info!(addr = %addr, "admin server started");
            l
        }
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind admin server");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        error!(error = %e, "admin server error");
    }
}

async fn ready(State(supervisor): State<Arc<Supervisor>>) -> (StatusCode, &'static str) {
    if supervisor.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no running engine")
    }
}

async fn stats(State(supervisor): State<Arc<Supervisor>>) -> Json<Option<EngineStatus>> {
    Json(supervisor.status())
}
