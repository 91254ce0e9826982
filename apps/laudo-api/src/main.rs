//! Laudo API Server - storage backend for appraisal reports
//!
//! Provides REST endpoints for:
//! - Report CRUD with per-year control numbers (`RL 001-2024`)
//! - Report duplication, attachments included
//! - Photo and document uploads

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use clap::Parser;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod files;
mod handlers;
mod models;
mod repo;
mod state;

use config::Args;
use state::AppState;

/// Build the router over an initialised state
pub fn app(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    // CORS configuration for web clients
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(handlers::health))
        // Reports
        .route(
            "/api/avaliacoes",
            get(handlers::list_reports).post(handlers::create_report),
        )
        .route(
            "/api/avaliacoes/:id",
            get(handlers::get_report)
                .put(handlers::update_report)
                .delete(handlers::delete_report),
        )
        .route("/api/avaliacoes/:id/duplicar", post(handlers::duplicate_report))
        // Attachments
        .route("/api/upload/fotos", post(handlers::upload_photos))
        .route("/api/upload/documentos", post(handlers::upload_document))
        .route("/api/fotos/:id", delete(handlers::delete_photo))
        .route("/api/documentos/:id", delete(handlers::delete_document))
        // Add middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize tracing
    let app_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("laudo_api={}", app_level).parse()?)
                .add_directive(format!("laudo_core={}", app_level).parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    // Initialize application state
    info!("Initializing Laudo API...");
    let state = Arc::new(AppState::new(&args).await?);
    info!("Data directory: {}", args.data_dir.display());
    info!("Upload limit: {} MB", args.max_upload_mb);

    let app = app(state, args.max_upload_bytes());

    // Start server
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting Laudo API on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
