//! Zimkeeper - keeps an offline ZIM library current
//!
//! Runs as a background service: supervises the content server that
//! serves the archives, checks the catalog for newer versions and swaps
//! them in, and exposes a web API for managing the library.

mod catalog;
mod config;
mod content_server;
mod db;
mod disk;
mod download;
mod error;
mod library;
mod scheduler;
mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::content_server::ContentServer;
use crate::db::Database;
use crate::library::Library;
use crate::scheduler::UpdateScheduler;

/// Application state shared with the HTTP handlers
pub struct AppState {
    pub library: Library,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting Zimkeeper v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = config::load_or_create_default()?;
    info!("Configuration loaded from {:?}", config::config_path());

    // Initialize database
    let db = Database::open(&settings.database_path())?;
    info!("Database initialized");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let content_server = ContentServer::spawn(db.clone(), settings.content_server.clone());
        let library = Library::new(&settings, db, content_server.clone())?;

        content_server.start();
        let scheduler = UpdateScheduler::new(library.clone(), &settings.library).spawn();

        let state = Arc::new(AppState { library });
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        };

        let result = server::run(state, &settings.server, shutdown).await;
        if let Err(e) = &result {
            error!("Server error: {}", e);
        }

        scheduler.abort();
        content_server.stop().await;
        info!("Content server stopped");

        result
    })
}
