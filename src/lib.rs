pub mod api;
pub mod app_state;
pub mod config;
pub mod error;
pub mod models;
pub mod store;
pub mod stream;

use axum::Router;
use axum::extract::Extension;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tower_http::cors::Any;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

//
// Re-export
//
pub use app_state::AppState;
pub use config::Config;
pub use error::{StreamError, StreamResult};
pub use models::{Platform, Resolution, StreamConfig, SystemConfig, Video, VideoId};
pub use store::Store;
pub use stream::{EngineSettings, SessionSnapshot, StreamEngine, StreamStatus};

/// Builds the control API router over `state`.
pub fn router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stream-status", get(api::stream_status))
        .route("/api/stream/start", post(api::start_stream))
        .route("/api/stream/stop", post(api::stop_stream))
        .route("/api/stream/set-current", post(api::set_current_video))
        .route("/api/stream/test", post(api::test_stream))
        .route("/api/stream/loop/status", get(api::loop_status))
        .route("/api/stream/loop/enable", post(api::enable_loop))
        .route("/api/stream/loop/disable", post(api::disable_loop))
        .route(
            "/api/stream-config",
            get(api::get_stream_config).post(api::save_stream_config),
        )
        .route(
            "/api/system-config",
            get(api::get_system_config).post(api::save_system_config),
        )
        .route("/api/videos", get(api::list_videos))
        .route("/api/videos/upload", post(api::upload_video))
        .route("/api/videos/reorder", post(api::reorder_videos))
        .route("/api/videos/{id}", delete(api::delete_video))
        .route("/api/database/install", post(api::install_database))
        .route("/api/database/backup", post(api::backup_database))
        .route("/api/database/backups", get(api::list_backups))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(Extension(state))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config).await?;
    let app = router(state.clone());

    let addr = format!("0.0.0.0:{}", config.listen_on_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Control API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No encoder may outlive the service
    state.engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(error) => {
            error!(?error, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
