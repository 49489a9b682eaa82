//! # Image caching
//!
//! The service keeps exactly one image artifact and serves it until it goes stale. This module
//! contains the pieces that make up that cache-aside layer, and the central [`CacheError`] type.
//!
//! - [`FreshnessPolicy`] decides whether the cached artifact may still be served.
//! - [`ArtifactStore`] holds the published [`CacheEntry`] and its backing file in the image
//!   directory. Writes go to a temporary file first and are published atomically.
//! - [`FetchCoordinator`] ties both to an [`Origin`](crate::download::Origin). It serves fresh
//!   artifacts directly, and deduplicates concurrent refills of a stale or missing artifact so
//!   that the origin is asked only once.
//!
//! A failed refill never replaces the published artifact. It is reported to every caller that
//! waited on it, and the next request starts a new refill. No retries happen in between.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.hit`: Accesses served from a fresh artifact.
//! - `caches.refill`: Refills started.
//! - `caches.refill.joined`: Accesses that waited on a refill started by another access.
//! - `caches.refill.error`: Failed refills, tagged with the `reason`.
//! - `caches.stale_served`: Stale artifacts served because a refill failed.
//! - `origin.fetch`: Origin fetches, tagged with their `status`.

mod cache_error;
mod coordinator;
mod freshness;
mod store;

pub use cache_error::{CacheContents, CacheError};
pub use coordinator::FetchCoordinator;
pub use freshness::{DEFAULT_TTL, FreshnessPolicy};
pub use store::{ArtifactStore, CacheEntry, CacheEntryView};

#[cfg(test)]
mod tests;
