//! The explicit context object every consumer receives.
//!
//! One instance owns the cache, session, filters and preferences; tests build
//! a fresh one per case.

use std::sync::{Arc, Mutex, MutexGuard};

use libris_api_types::User;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::lock::mutex_lock;
use crate::cache::{CacheConfig, QueryCache};
use crate::config::Settings;
use crate::infra::gateway::RemoteGateway;
use crate::infra::gateway::http::HttpGateway;

use super::error::AppError;
use super::filters::FilterStaging;
use super::mutations::MutationCoordinator;
use super::preferences::PreferenceStore;
use super::queries::LibraryQueries;
use super::recommendations::RecommendationAggregator;
use super::session::{Session, SessionEvent};

const SOURCE: &str = "application::context";

#[derive(Clone)]
pub struct LibraryContext {
    inner: Arc<Inner>,
}

struct Inner {
    session: Arc<Session>,
    cache: QueryCache,
    queries: LibraryQueries,
    mutations: MutationCoordinator,
    recommendations: RecommendationAggregator,
    preferences: PreferenceStore,
    filters: Mutex<FilterStaging>,
}

impl LibraryContext {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        session: Arc<Session>,
        cache_config: CacheConfig,
        preferences: PreferenceStore,
    ) -> Self {
        let cache = QueryCache::new(cache_config);
        let queries = LibraryQueries::new(gateway.clone(), cache.clone(), session.clone());
        let mutations = MutationCoordinator::new(gateway, cache.clone(), queries.clone());
        let recommendations = RecommendationAggregator::new(queries.clone(), session.clone());
        let filters = FilterStaging::new(preferences.get().filter_defaults());
        Self {
            inner: Arc::new(Inner {
                session,
                cache,
                queries,
                mutations,
                recommendations,
                preferences,
                filters: Mutex::new(filters),
            }),
        }
    }

    /// Context talking to the configured backend over HTTP.
    pub async fn from_settings(settings: &Settings) -> Result<Self, AppError> {
        let session = Arc::new(match &settings.gateway.token {
            Some(token) => Session::with_token(token.clone()),
            None => Session::new(),
        });
        let gateway = HttpGateway::new(
            settings.gateway.base_url.as_str(),
            settings.gateway.timeout,
            session.clone(),
        )?;
        let preferences = PreferenceStore::load(settings.preferences.path.clone()).await?;
        Ok(Self::new(
            Arc::new(gateway),
            session,
            CacheConfig::from(&settings.cache),
            preferences,
        ))
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn queries(&self) -> &LibraryQueries {
        &self.inner.queries
    }

    pub fn mutations(&self) -> &MutationCoordinator {
        &self.inner.mutations
    }

    pub fn recommendations(&self) -> &RecommendationAggregator {
        &self.inner.recommendations
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.inner.preferences
    }

    pub fn filters(&self) -> MutexGuard<'_, FilterStaging> {
        mutex_lock(&self.inner.filters, SOURCE, "filters")
    }

    /// Start a session; data cached for a previous user is dropped first.
    pub fn login(&self, token: impl Into<String>, user: User) {
        let evicted = self.inner.cache.evict_user_scoped();
        self.inner.session.login(token, user);
        info!(evicted, "Signed in");
    }

    pub fn logout(&self) {
        self.inner.session.logout();
        let evicted = self.inner.cache.evict_user_scoped();
        info!(evicted, "Signed out");
    }

    /// Evict user-scoped entries whenever the session expires.
    pub fn watch_session(&self) -> JoinHandle<()> {
        let mut events = self.inner.session.subscribe();
        let cache = self.inner.cache.clone();
        tokio::spawn(async move {
            while events.changed().await.is_ok() {
                let event = events.borrow_and_update().clone();
                if event == SessionEvent::Expired {
                    let evicted = cache.evict_user_scoped();
                    warn!(evicted, "Session expired, dropped user data");
                }
            }
        })
    }
}
