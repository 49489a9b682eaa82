use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use super::CacheEntry;

/// The TTL used when none, or an invalid one, is configured.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Decides whether a cached artifact may still be served.
///
/// An entry is fresh while its age is strictly below the TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    ttl: TimeDelta,
}

impl FreshnessPolicy {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or(Duration::MAX)
    }

    /// Whether `entry` is still fresh at `now`. An absent entry is never fresh.
    pub fn is_fresh(&self, entry: Option<&CacheEntry>, now: DateTime<Utc>) -> bool {
        match entry {
            Some(entry) => now.signed_duration_since(entry.cached_at()) < self.ttl,
            None => false,
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
