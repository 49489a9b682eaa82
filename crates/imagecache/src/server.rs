use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum_server::Handle;
use imagecache_service::config::Config;
use imagecache_service::services::ImageService;

use crate::endpoints;

/// Creates the image service and runs the HTTP server until it is shut down.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    imagecache_service::metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("imagecache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;

    let service = ImageService::new(config).context("failed to create image service")?;

    web_pool.block_on(serve(service, socket, Handle::new()))?;
    tracing::info!("System shutdown complete");

    Ok(())
}

/// Serves the app on `socket` until `handle` shuts the server down.
pub async fn serve(service: ImageService, socket: SocketAddr, handle: Handle) -> Result<()> {
    let app = endpoints::create_app(service, handle.clone());

    tracing::info!("Starting HTTP server on {}", socket);
    axum_server::bind(socket)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")
}
