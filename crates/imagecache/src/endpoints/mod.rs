use axum::Router;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use axum_server::Handle;
use imagecache_service::config::Config;
use imagecache_service::metric;
use imagecache_service::services::ImageService;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;

mod error;
mod image;

pub use error::ResponseError;

use image::{api_info, current_image, shutdown};

/// Shared state of all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub service: ImageService,
    /// Stops the server.
    pub shutdown: Handle,
}

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = if config.allows_any_origin() {
        AllowOrigin::any()
    } else {
        let origins = config
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(%origin, "Ignoring invalid allowed origin");
                    None
                }
            })
            .collect::<Vec<_>>();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

pub fn create_app(service: ImageService, shutdown_handle: Handle) -> Router {
    let cors = cors_layer(service.config());
    let image_dir = service.coordinator().store().dir().to_owned();

    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(cors);

    let api = Router::new()
        .route("/", get(api_info))
        .route("/current", get(current_image))
        .route("/shutdown", post(shutdown))
        .nest_service("/files", ServeDir::new(image_dir));

    let state = AppState {
        service,
        shutdown: shutdown_handle,
    };

    Router::new()
        .nest("/api/image", api)
        .with_state(state)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
