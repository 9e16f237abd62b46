//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::app::state::AppState;
use crate::errors::FleetError;
use crate::server::handlers::{
    add_server_handler, batch_handler, cancel_batch_handler, health_handler,
    list_servers_handler, remove_server_handler, rollback_handler, start_batch_handler,
    test_pending_handler, test_server_handler, version_handler,
};
use crate::server::ws::deploy_feed_handler;

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Servers
        .route("/servers", get(list_servers_handler).post(add_server_handler))
        .route("/servers/test", post(test_pending_handler))
        .route("/servers/{id}", delete(remove_server_handler))
        .route("/servers/{id}/test", post(test_server_handler))
        .route("/servers/{id}/rollback", post(rollback_handler))
        // Batches
        .route("/batches", post(start_batch_handler))
        .route("/batches/{id}", get(batch_handler))
        .route("/batches/{id}/cancel", post(cancel_batch_handler))
        .route("/ws/deploy", get(deploy_feed_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<AppState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), FleetError>>, FleetError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FleetError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| FleetError::ServerError(e.to_string()))
    });

    Ok(handle)
}
