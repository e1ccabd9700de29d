//! Per-category rate limiting for the GitHub REST API
//!
//! Implements reactive rate limiting that only activates after GitHub reports
//! exhaustion (a 429, or a 403 with `x-ratelimit-remaining: 0`). Search and
//! code search have much tighter budgets than the core API.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use tokio::sync::RwLock;

/// GitHub rate-limit buckets.
///
/// Budgets from GitHub's documentation for authenticated requests:
/// - core: 5000/hour
/// - search: 30/minute
/// - code search: 10/minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointCategory {
    /// Everything not covered below
    Core,
    /// /search/* except code search
    Search,
    /// /search/code
    CodeSearch,
}

impl EndpointCategory {
    /// All endpoint categories for initialization.
    pub const ALL: [EndpointCategory; 3] = [
        EndpointCategory::Core,
        EndpointCategory::Search,
        EndpointCategory::CodeSearch,
    ];

    /// Categorize a request by its API path (without base URL).
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/search/code") {
            return EndpointCategory::CodeSearch;
        }
        if path.starts_with("/search") {
            return EndpointCategory::Search;
        }
        EndpointCategory::Core
    }

    /// Requests allowed per minute once limiting is active.
    pub fn per_minute(&self) -> u32 {
        match self {
            EndpointCategory::Core => 5000 / 60,
            EndpointCategory::Search => 30,
            EndpointCategory::CodeSearch => 10,
        }
    }
}

/// Rate limiter state for a single endpoint category.
pub struct EndpointRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    active: AtomicBool,
    category: EndpointCategory,
}

impl EndpointRateLimiter {
    pub fn new(category: EndpointCategory) -> Self {
        let per_min = NonZeroU32::new(category.per_minute()).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_min)),
            active: AtomicBool::new(false),
            category,
        }
    }

    /// Activate rate limiting for this category.
    pub fn activate(&self) {
        let was_active = self.active.swap(true, Ordering::SeqCst);
        if !was_active {
            debug!("Rate limiting activated for {:?}", self.category);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait for permission if rate limiting is active.
    pub async fn wait_if_active(&self) {
        if self.is_active() {
            debug!("Waiting for rate limiter {:?}", self.category);
            self.limiter.until_ready().await;
        }
    }
}

/// Collection of rate limiters for all endpoint categories.
pub struct RateLimiterSet {
    limiters: RwLock<HashMap<EndpointCategory, EndpointRateLimiter>>,
}

impl Default for RateLimiterSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiterSet {
    pub fn new() -> Self {
        let map = EndpointCategory::ALL
            .into_iter()
            .map(|category| (category, EndpointRateLimiter::new(category)))
            .collect();

        Self {
            limiters: RwLock::new(map),
        }
    }

    /// Wait for rate limit permission for a category (if active).
    pub async fn wait_for(&self, category: EndpointCategory) {
        let limiters = self.limiters.read().await;
        if let Some(limiter) = limiters.get(&category) {
            limiter.wait_if_active().await;
        }
    }

    /// Activate rate limiting for a category (called when GitHub reports exhaustion).
    pub async fn activate(&self, category: EndpointCategory) {
        let limiters = self.limiters.read().await;
        if let Some(limiter) = limiters.get(&category) {
            limiter.activate();
        }
    }

    pub async fn is_active(&self, category: EndpointCategory) -> bool {
        let limiters = self.limiters.read().await;
        limiters.get(&category).is_some_and(|l| l.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_paths() {
        assert_eq!(
            EndpointCategory::from_path("/search/code"),
            EndpointCategory::CodeSearch
        );
        assert_eq!(
            EndpointCategory::from_path("/search/issues"),
            EndpointCategory::Search
        );
        assert_eq!(
            EndpointCategory::from_path("/repos/org/app/pulls"),
            EndpointCategory::Core
        );
        assert_eq!(EndpointCategory::from_path("/rate_limit"), EndpointCategory::Core);
    }

    #[test]
    fn test_budgets() {
        assert_eq!(EndpointCategory::Core.per_minute(), 83);
        assert_eq!(EndpointCategory::Search.per_minute(), 30);
        assert_eq!(EndpointCategory::CodeSearch.per_minute(), 10);
    }

    #[test]
    fn test_endpoint_rate_limiter_activation() {
        let limiter = EndpointRateLimiter::new(EndpointCategory::Search);
        assert!(!limiter.is_active());

        limiter.activate();
        assert!(limiter.is_active());

        // Second activation should be idempotent
        limiter.activate();
        assert!(limiter.is_active());
    }

    #[tokio::test]
    async fn test_rate_limiter_set_activation_is_per_category() {
        let set = RateLimiterSet::new();

        set.activate(EndpointCategory::Search).await;

        assert!(set.is_active(EndpointCategory::Search).await);
        assert!(!set.is_active(EndpointCategory::Core).await);
    }

    #[tokio::test]
    async fn test_inactive_limiter_does_not_wait() {
        let set = RateLimiterSet::new();
        let started = std::time::Instant::now();

        for _ in 0..50 {
            set.wait_for(EndpointCategory::CodeSearch).await;
        }

        assert!(started.elapsed() < std::time::Duration::from_secs(1));
    }
}
