//! HTTP API handlers and routing.

pub mod error;
mod health;
mod images;

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
///
/// Handlers read the caller address from `ConnectInfo`, so the router must be
/// served with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints (no network check)
        .merge(health::routes())
        // Image lifecycle endpoints
        .merge(images::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        // Application state
        .with_state(state)
}

/// Serve `app` until `shutdown` flips to true (or its sender is dropped).
///
/// Returns once in-flight requests have completed.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        info!("HTTP server shutting down");
    })
    .await
}
