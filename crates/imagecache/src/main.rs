//! Imagecache.
//!
//! Imagecache is a small web service that serves one image from a remote origin. The image is
//! cached on disk and fetched again once it is older than the configured cache duration.
//! Concurrent requests for a stale image share a single fetch from the origin.

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
