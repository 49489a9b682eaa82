use std::time::Duration;

use axum::Json;
use axum::extract::State;
use imagecache_service::caching::CacheEntryView;
use imagecache_service::metric;
use serde::Serialize;

use super::{AppState, ResponseError};

/// How long the server keeps answering after a shutdown was requested.
const SHUTDOWN_DELAY: Duration = Duration::from_secs(1);

/// How long in-flight requests may take to finish once the server shuts down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
pub struct ApiInfo {
    message: &'static str,
    status: u16,
}

#[derive(Debug, Serialize)]
pub struct Message {
    message: &'static str,
}

pub async fn api_info() -> Json<ApiInfo> {
    Json(ApiInfo {
        message: "Image Service API",
        status: 200,
    })
}

/// Returns the location of a fresh image, fetching a new one if the cached image is stale.
pub async fn current_image(
    State(state): State<AppState>,
) -> Result<Json<CacheEntryView>, ResponseError> {
    let view = state.service.coordinator().get_current().await?;
    Ok(Json(view))
}

pub async fn shutdown(State(state): State<AppState>) -> Json<Message> {
    tracing::info!("Shutdown requested, stopping the server");
    metric!(counter("server.shutdown") += 1);

    let handle = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_DELAY).await;
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    });

    Json(Message {
        message: "Shutting down server...",
    })
}
