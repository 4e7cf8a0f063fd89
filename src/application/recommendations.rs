//! Recommendation aggregator.
//!
//! Each source is its own cached query; feeds are derived views recomputed
//! from those entries on every call.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use libris_api_types::{Book, BookId, CategoryId, Recommendation, RecommendationSource};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::cache::QueryError;
use crate::cache::lock::mutex_lock;
use crate::infra::gateway::RecommendationRequest;

use super::queries::LibraryQueries;
use super::session::Session;

const SOURCE: &str = "application::recommendations";

pub const HOME_SECTION_LIMIT: u32 = 8;
pub const DISCOVER_LIMIT: usize = 10;
pub const PER_CATEGORY_LIMIT: u32 = 3;
pub const STATS_SAMPLE_LIMIT: u32 = 100;

/// Where a feed is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedContext {
    pub limit: u32,
    /// Book being viewed; switches the fallback from trending to similar.
    pub book_id: Option<BookId>,
}

impl FeedContext {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            book_id: None,
        }
    }

    pub fn viewing(book_id: BookId, limit: u32) -> Self {
        Self {
            limit,
            book_id: Some(book_id),
        }
    }
}

/// One independently loaded block of a composite feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "items", rename_all = "lowercase")]
pub enum Section {
    /// Not applicable, e.g. personalized picks for an anonymous visitor.
    Hidden,
    Ready(Vec<Recommendation>),
    Failed(#[serde(serialize_with = "display")] QueryError),
}

fn display<S: serde::Serializer>(error: &QueryError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

impl Section {
    pub fn items(&self) -> &[Recommendation] {
        match self {
            Self::Ready(items) => items,
            Self::Hidden | Self::Failed(_) => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HomeFeed {
    pub personalized: Section,
    pub trending: Section,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecommendationStats {
    pub average_score: BTreeMap<RecommendationSource, f64>,
    pub type_counts: BTreeMap<RecommendationSource, usize>,
}

/// Books behind `recommendations`, skipping records the backend could not resolve.
pub fn books(recommendations: &[Recommendation]) -> Vec<&Book> {
    recommendations
        .iter()
        .filter_map(|recommendation| recommendation.book.book())
        .collect()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct RecommendationAggregator {
    queries: LibraryQueries,
    session: Arc<Session>,
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl RecommendationAggregator {
    pub fn new(queries: LibraryQueries, session: Arc<Session>) -> Self {
        Self::with_rng(queries, session, Box::new(StdRng::from_os_rng()))
    }

    /// Aggregator with an injected random source for the discovery shuffle.
    pub fn with_rng(
        queries: LibraryQueries,
        session: Arc<Session>,
        rng: Box<dyn RngCore + Send>,
    ) -> Self {
        Self {
            queries,
            session,
            rng: Mutex::new(rng),
        }
    }

    pub async fn personalized(&self, limit: u32) -> Result<Vec<Recommendation>, QueryError> {
        self.queries
            .recommendations(RecommendationRequest::Personalized { limit })
            .await
    }

    pub async fn trending(&self, limit: u32) -> Result<Vec<Recommendation>, QueryError> {
        self.queries
            .recommendations(RecommendationRequest::Trending { limit })
            .await
    }

    pub async fn category(
        &self,
        category_id: CategoryId,
        limit: u32,
    ) -> Result<Vec<Recommendation>, QueryError> {
        self.queries
            .recommendations(RecommendationRequest::Category { category_id, limit })
            .await
    }

    pub async fn similar(&self, book_id: BookId, limit: u32) -> Result<Vec<Recommendation>, QueryError> {
        self.queries
            .recommendations(RecommendationRequest::Similar { book_id, limit })
            .await
    }

    /// Personalized picks when signed in and available, else the fallback source.
    #[instrument(skip(self))]
    pub async fn feed(&self, context: FeedContext) -> Result<Vec<Recommendation>, QueryError> {
        let limit = context.limit as usize;
        if self.session.is_authenticated() {
            match self.personalized(context.limit).await {
                Ok(mut items) if !items.is_empty() => {
                    items.truncate(limit);
                    return Ok(items);
                }
                Ok(_) => debug!("No personalized recommendations, falling back"),
                Err(error) => warn!(error = %error, "Personalized recommendations failed, falling back"),
            }
        }
        let mut items = match context.book_id {
            Some(book_id) => self.similar(book_id, context.limit).await?,
            None => self.trending(context.limit).await?,
        };
        items.truncate(limit);
        Ok(items)
    }

    /// Personalized and trending sections, loaded concurrently and failing independently.
    pub async fn home(&self) -> HomeFeed {
        let authenticated = self.session.is_authenticated();
        let personalized = async {
            if authenticated {
                Some(self.personalized(HOME_SECTION_LIMIT).await)
            } else {
                None
            }
        };
        let (personalized, trending) =
            tokio::join!(personalized, self.trending(HOME_SECTION_LIMIT));

        HomeFeed {
            personalized: match personalized {
                None => Section::Hidden,
                Some(Ok(items)) => Section::Ready(items),
                Some(Err(error)) => Section::Failed(error),
            },
            trending: match trending {
                Ok(items) => Section::Ready(items),
                Err(error) => Section::Failed(error),
            },
        }
    }

    /// Discovery feed: picks from every category among the user's favorites, shuffled.
    ///
    /// Without favorites this is the trending source as-is.
    #[instrument(skip(self))]
    pub async fn user_based(&self, limit: usize) -> Result<Vec<Recommendation>, QueryError> {
        let favorites = self.queries.favorites().await?;
        if favorites.is_empty() {
            let trending_limit = u32::try_from(limit).unwrap_or(u32::MAX);
            return self.trending(trending_limit).await;
        }

        let categories: BTreeSet<CategoryId> =
            favorites.iter().map(|book| book.category_id).collect();
        let batches = try_join_all(
            categories
                .iter()
                .map(|category_id| self.category(*category_id, PER_CATEGORY_LIMIT)),
        )
        .await?;

        let mut merged: Vec<Recommendation> = batches.into_iter().flatten().collect();
        {
            let mut rng = mutex_lock(&self.rng, SOURCE, "user_based.shuffle");
            merged.shuffle(&mut **rng);
        }
        merged.truncate(limit);
        debug!(
            categories = categories.len(),
            returned = merged.len(),
            "Built discovery feed"
        );
        Ok(merged)
    }

    /// Approximate per-source statistics over the cached personalized and trending feeds.
    pub async fn stats(&self) -> Result<RecommendationStats, QueryError> {
        let personalized = if self.session.is_authenticated() {
            self.personalized(STATS_SAMPLE_LIMIT).await?
        } else {
            Vec::new()
        };
        let trending = self.trending(STATS_SAMPLE_LIMIT).await?;

        let mut stats = RecommendationStats::default();
        for (source, items) in [
            (RecommendationSource::Personalized, &personalized),
            (RecommendationSource::Trending, &trending),
        ] {
            if items.is_empty() {
                continue;
            }
            let total: f64 = items.iter().map(|item| item.score).sum();
            stats
                .average_score
                .insert(source, round2(total / items.len() as f64));
        }
        for item in &personalized {
            *stats.type_counts.entry(item.source).or_default() += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use libris_api_types::BookRef;

    use super::*;
    use crate::cache::{CacheConfig, QueryCache};
    use crate::infra::gateway::GatewayError;
    use crate::infra::gateway::memory::{GatewayOp, MemoryGateway, sample_book, sample_category};

    fn aggregator(session: Session) -> (Arc<MemoryGateway>, RecommendationAggregator) {
        let session = Arc::new(session);
        let gateway = Arc::new(MemoryGateway::new().with_session(session.clone()));
        let roman = sample_category(1, "Roman");
        let science = sample_category(2, "Science");
        gateway.seed_categories(vec![roman.clone(), science.clone()]);
        for id in 1..=4 {
            gateway.seed_book(sample_book(id, &format!("Roman {id}"), "A", &roman));
        }
        for id in 5..=8 {
            gateway.seed_book(sample_book(id, &format!("Science {id}"), "B", &science));
        }
        let cache = QueryCache::new(CacheConfig {
            retry_count: 0,
            retry_delay: Duration::ZERO,
            ..CacheConfig::default()
        });
        let queries = LibraryQueries::new(gateway.clone(), cache, session.clone());
        let aggregator =
            RecommendationAggregator::with_rng(queries, session, Box::new(StdRng::seed_from_u64(7)));
        (gateway, aggregator)
    }

    fn recommendation(id: BookId, score: f64, source: RecommendationSource) -> Recommendation {
        Recommendation {
            book: BookRef::Loaded(sample_book(id, "T", "A", &sample_category(1, "Roman"))),
            score,
            reason: String::new(),
            source,
        }
    }

    #[tokio::test]
    async fn anonymous_feed_uses_trending() {
        let (gateway, aggregator) = aggregator(Session::new());
        let items = aggregator.feed(FeedContext::new(3)).await.expect("feed");
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|item| item.source == RecommendationSource::Trending));
        assert_eq!(
            gateway.calls(GatewayOp::Recommendations(RecommendationSource::Personalized)),
            0
        );
    }

    #[tokio::test]
    async fn empty_personalized_falls_back_to_similar() {
        let (gateway, aggregator) = aggregator(Session::with_token("t"));
        gateway.seed_personalized(Vec::new());
        let items = aggregator
            .feed(FeedContext::viewing(1, 5))
            .await
            .expect("feed");
        assert!(!items.is_empty());
        assert!(items.iter().all(|item| item.source == RecommendationSource::Similar));
    }

    #[tokio::test]
    async fn personalized_feed_respects_the_limit() {
        let (gateway, aggregator) = aggregator(Session::with_token("t"));
        gateway.seed_personalized(
            (1..=5)
                .map(|id| recommendation(id, 90.0, RecommendationSource::Personalized))
                .collect(),
        );
        let items = aggregator.feed(FeedContext::new(2)).await.expect("feed");
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|item| item.source == RecommendationSource::Personalized));
    }

    #[tokio::test]
    async fn home_sections_fail_independently() {
        let (gateway, aggregator) = aggregator(Session::with_token("t"));
        gateway.seed_personalized(vec![recommendation(2, 80.0, RecommendationSource::Personalized)]);
        gateway.fail_next(
            GatewayOp::Recommendations(RecommendationSource::Trending),
            GatewayError::server(503),
        );

        let home = aggregator.home().await;
        assert_eq!(home.personalized.items().len(), 1);
        assert!(home.trending.is_failed());
    }

    #[tokio::test]
    async fn discovery_is_a_truncated_permutation_of_category_picks() {
        let (gateway, aggregator) = aggregator(Session::with_token("t"));
        gateway.seed_favorites([1, 5]);

        let items = aggregator.user_based(4).await.expect("discovery");
        assert_eq!(items.len(), 4);

        let mut expected: Vec<BookId> = Vec::new();
        for category_id in [1, 2] {
            let picks = aggregator
                .category(category_id, PER_CATEGORY_LIMIT)
                .await
                .expect("cached category picks");
            expected.extend(books(&picks).iter().map(|book| book.id));
        }
        let got: Vec<BookId> = books(&items).iter().map(|book| book.id).collect();
        assert!(got.iter().all(|id| expected.contains(id)));
        let unique: BTreeSet<BookId> = got.iter().copied().collect();
        assert_eq!(unique.len(), got.len());
    }

    #[tokio::test]
    async fn discovery_without_favorites_is_trending() {
        let (_, aggregator) = aggregator(Session::with_token("t"));
        let items = aggregator.user_based(DISCOVER_LIMIT).await.expect("discovery");
        let trending = aggregator.trending(DISCOVER_LIMIT as u32).await.expect("trending");
        assert_eq!(items, trending);
    }

    #[tokio::test]
    async fn stats_average_per_source() {
        let (gateway, aggregator) = aggregator(Session::with_token("t"));
        gateway.seed_personalized(vec![
            recommendation(1, 90.0, RecommendationSource::Personalized),
            recommendation(2, 80.333, RecommendationSource::Personalized),
            recommendation(3, 50.0, RecommendationSource::Category),
        ]);
        let stats = aggregator.stats().await.expect("stats");
        assert_eq!(
            stats.average_score.get(&RecommendationSource::Personalized),
            Some(&73.44)
        );
        assert_eq!(stats.type_counts.get(&RecommendationSource::Personalized), Some(&2));
        assert_eq!(stats.type_counts.get(&RecommendationSource::Category), Some(&1));
        assert!(stats.average_score.contains_key(&RecommendationSource::Trending));
    }
}
