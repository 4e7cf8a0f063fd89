//! Query cache configuration.
//!
//! Staleness windows are resolved per key: an explicit override for
//! `namespace.operation`, then one for the whole namespace, then the built-in
//! table below.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use super::keys::{Namespace, QueryKey, op};

const DEFAULT_CAPACITY: usize = 512;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_RETRY_DELAY_MS: u64 = 250;

const MINUTE: u64 = 60;

/// Per-query behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub stale_after: Duration,
    /// Extra attempts after the first one, for retryable failures only.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Show the last page while the next one loads.
    pub keep_previous_on_refetch: bool,
}

impl QueryOptions {
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Keyed by `namespace` or `namespace.operation`.
    pub stale_overrides: BTreeMap<String, Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            stale_overrides: BTreeMap::new(),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            capacity: settings.capacity,
            retry_count: settings.retry_count,
            retry_delay: settings.retry_delay,
            stale_overrides: settings.stale_overrides.clone(),
        }
    }
}

impl CacheConfig {
    pub fn options_for(&self, key: &QueryKey) -> QueryOptions {
        QueryOptions {
            stale_after: self.stale_after(key),
            retry_count: self.retry_count,
            retry_delay: self.retry_delay,
            keep_previous_on_refetch: keeps_previous(key),
        }
    }

    pub fn stale_after(&self, key: &QueryKey) -> Duration {
        let namespace = key.namespace().as_str();
        let qualified = format!("{namespace}.{}", key.operation());
        self.stale_overrides
            .get(&qualified)
            .or_else(|| self.stale_overrides.get(namespace))
            .copied()
            .unwrap_or_else(|| default_stale_after(key))
    }
}

fn keeps_previous(key: &QueryKey) -> bool {
    key.namespace() == Namespace::Books
        && matches!(key.operation(), op::LIST | op::SEARCH | op::CATEGORY)
}

fn default_stale_after(key: &QueryKey) -> Duration {
    let minutes = match (key.namespace(), key.operation()) {
        (Namespace::Books, op::SEARCH) => 2,
        (Namespace::Books, op::DETAIL) => 10,
        (Namespace::Books, op::STATS) => 15,
        (Namespace::Books, op::FILTERS) => 30,
        (Namespace::Books, _) => 5,
        (Namespace::Favorites, _) => 5,
        (Namespace::Recommendations, op::PERSONALIZED) => 10,
        (Namespace::Recommendations, op::CATEGORY) => 15,
        (Namespace::Recommendations, op::SIMILAR) => 20,
        (Namespace::Recommendations, _) => 5,
        (Namespace::Analytics, op::PLATFORM) => 5,
        (Namespace::Analytics, _) => 15,
        (Namespace::Categories | Namespace::Tags, _) => 30,
        (Namespace::Downloads, _) => 1,
        (Namespace::Users, _) => 5,
    };
    Duration::from_secs(minutes * MINUTE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::gateway::{BookQuery, RecommendationRequest};

    #[test]
    fn default_windows_follow_the_namespace_table() {
        let config = CacheConfig::default();
        let list = QueryKey::books_list(&BookQuery::default());
        assert_eq!(config.stale_after(&list), Duration::from_secs(300));
        assert_eq!(
            config.stale_after(&QueryKey::book_detail(1)),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.stale_after(&QueryKey::recommendations(
                &RecommendationRequest::Similar { book_id: 1, limit: 6 }
            )),
            Duration::from_secs(1200)
        );
        assert_eq!(
            config.stale_after(&QueryKey::downloads(0, 10)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn overrides_prefer_the_most_specific_entry() {
        let mut config = CacheConfig::default();
        config
            .stale_overrides
            .insert("books".to_string(), Duration::from_secs(1));
        config
            .stale_overrides
            .insert("books.detail".to_string(), Duration::from_secs(2));

        assert_eq!(
            config.stale_after(&QueryKey::book_detail(3)),
            Duration::from_secs(2)
        );
        assert_eq!(
            config.stale_after(&QueryKey::books_stats()),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn only_paginated_book_lists_keep_previous_data() {
        let config = CacheConfig::default();
        assert!(
            config
                .options_for(&QueryKey::books_list(&BookQuery::default()))
                .keep_previous_on_refetch
        );
        assert!(
            !config
                .options_for(&QueryKey::book_detail(1))
                .keep_previous_on_refetch
        );
        assert_eq!(config.options_for(&QueryKey::tags()).retry_count, 1);
    }
}
