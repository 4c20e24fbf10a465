//! HTTP API over the library

mod routes;
mod websocket;

use crate::config::ServerSettings;
use crate::AppState;
use anyhow::Result;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Build the application router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", routes::api_routes())
        .route("/ws", axum::routing::get(websocket::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves
pub async fn run<F>(state: Arc<AppState>, settings: &ServerSettings, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", settings.host, settings.port);
    let app = router(state);

    info!("Starting web server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
