//! Mutation coordinator: remote writes plus the cache reconciliation they imply.
//!
//! Writes against the same book id are serialized; writes against different
//! ids run concurrently.

mod intent;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use libris_api_types::{Book, BookCreateRequest, BookId, BookUpdateRequest, MessageResponse};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{Cacheable, KeyPattern, Namespace, QueryCache, QueryError, QueryKey, op};
use crate::infra::gateway::{GatewayError, RemoteGateway, Upload};

use super::queries::LibraryQueries;

pub use intent::{IntentState, MutationIntent, OptimisticPatch, Reconcile, merge_update};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("{operation} failed: {source}")]
    Remote {
        operation: &'static str,
        intent: Uuid,
        #[source]
        source: GatewayError,
    },
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl MutationError {
    pub fn gateway(&self) -> Option<&GatewayError> {
        match self {
            Self::Remote { source, .. } => Some(source),
            Self::Query(error) => error.gateway(),
        }
    }
}

type ReconcileFn<T> = Box<dyn FnOnce(&T) -> Vec<Reconcile> + Send>;
type RecoverFn = Box<dyn FnOnce(&GatewayError) -> Vec<Reconcile> + Send>;

/// One write: the remote call, its optimistic patches, and its follow-ups.
pub struct Mutation<T> {
    pub operation: &'static str,
    pub target: Option<BookId>,
    pub optimistic: Vec<OptimisticPatch>,
    pub execute: BoxFuture<'static, Result<T, GatewayError>>,
    pub on_success: ReconcileFn<T>,
    /// Runs after the rollback, for failures that still imply cache changes.
    pub on_error: RecoverFn,
}

impl<T> Mutation<T> {
    pub fn new(
        operation: &'static str,
        execute: BoxFuture<'static, Result<T, GatewayError>>,
    ) -> Self {
        Self {
            operation,
            target: None,
            optimistic: Vec::new(),
            execute,
            on_success: Box::new(|_| Vec::new()),
            on_error: Box::new(|_| Vec::new()),
        }
    }

    pub fn target(mut self, id: BookId) -> Self {
        self.target = Some(id);
        self
    }

    pub fn optimistic(mut self, patch: OptimisticPatch) -> Self {
        self.optimistic.push(patch);
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(&T) -> Vec<Reconcile> + Send + 'static) -> Self {
        self.on_success = Box::new(f);
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&GatewayError) -> Vec<Reconcile> + Send + 'static) -> Self {
        self.on_error = Box::new(f);
        self
    }
}

/// Outcome of removing every favorite one call at a time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearFavoritesReport {
    pub removed: Vec<BookId>,
    pub failed: Vec<(BookId, GatewayError)>,
}

impl ClearFavoritesReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// An applied intent that is abandoned if dropped before it settles.
struct PendingIntent<'a> {
    intent: MutationIntent,
    cache: &'a QueryCache,
}

impl<'a> PendingIntent<'a> {
    fn apply(mut intent: MutationIntent, cache: &'a QueryCache) -> Self {
        intent.apply(cache);
        Self { intent, cache }
    }
}

impl Drop for PendingIntent<'_> {
    fn drop(&mut self) {
        if self.intent.state() == IntentState::Pending {
            self.intent.abandon(self.cache);
        }
    }
}

#[derive(Clone)]
pub struct MutationCoordinator {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    queries: LibraryQueries,
    locks: Arc<DashMap<BookId, Arc<AsyncMutex<()>>>>,
    placeholder_ids: Arc<AtomicI64>,
}

fn book_lists() -> Reconcile {
    Reconcile::Invalidate(KeyPattern::Namespace(Namespace::Books))
}

fn favorites() -> Reconcile {
    Reconcile::Invalidate(KeyPattern::Namespace(Namespace::Favorites))
}

fn personalized() -> Reconcile {
    Reconcile::Invalidate(KeyPattern::Operation(
        Namespace::Recommendations,
        op::PERSONALIZED,
    ))
}

impl MutationCoordinator {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: QueryCache, queries: LibraryQueries) -> Self {
        Self {
            gateway,
            cache,
            queries,
            locks: Arc::new(DashMap::new()),
            placeholder_ids: Arc::new(AtomicI64::new(-1)),
        }
    }

    /// Run one mutation: patch, call, then confirm or roll back.
    pub async fn mutate<T>(&self, mutation: Mutation<T>) -> Result<T, MutationError> {
        let Mutation {
            operation,
            target,
            optimistic,
            execute,
            on_success,
            on_error,
        } = mutation;

        let mut pending =
            PendingIntent::apply(MutationIntent::new(operation, target, optimistic), &self.cache);
        let intent = &mut pending.intent;

        match execute.await {
            Ok(value) => {
                intent.confirm(&self.cache, on_success(&value));
                Ok(value)
            }
            Err(error) => {
                intent.roll_back(&self.cache);
                for step in on_error(&error) {
                    step.run(&self.cache);
                }
                if error.is_unauthorized() {
                    self.cache.evict_user_scoped();
                }
                warn!(
                    intent = %intent.id,
                    operation,
                    book_id = target,
                    kind = error.kind(),
                    error = %error,
                    "Mutation failed"
                );
                Err(MutationError::Remote {
                    operation,
                    intent: intent.id,
                    source: error,
                })
            }
        }
    }

    async fn lock(&self, id: BookId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn release(&self, id: BookId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks
            .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    // ------------------------------------------------------------------
    // Favorites
    // ------------------------------------------------------------------

    pub async fn add_favorite(&self, id: BookId) -> Result<MessageResponse, MutationError> {
        let guard = self.lock(id).await;
        let result = self.set_favorite_locked(id, true).await;
        self.release(id, guard);
        result
    }

    pub async fn remove_favorite(&self, id: BookId) -> Result<MessageResponse, MutationError> {
        let guard = self.lock(id).await;
        let result = self.set_favorite_locked(id, false).await;
        self.release(id, guard);
        result
    }

    /// Flip membership based on the FavoriteSet as of when this call's turn comes.
    ///
    /// Returns the new membership.
    #[instrument(skip(self))]
    pub async fn toggle_favorite(&self, id: BookId) -> Result<bool, MutationError> {
        let guard = self.lock(id).await;
        let result: Result<bool, MutationError> = async {
            let current = self.queries.favorite_ids().await?;
            let favorite = !current.contains(&id);
            self.set_favorite_locked(id, favorite).await?;
            Ok(favorite)
        }
        .await;
        self.release(id, guard);
        result
    }

    async fn set_favorite_locked(
        &self,
        id: BookId,
        favorite: bool,
    ) -> Result<MessageResponse, MutationError> {
        let gateway = self.gateway.clone();
        let execute = async move {
            if favorite {
                gateway.add_favorite(id).await
            } else {
                gateway.remove_favorite(id).await
            }
        }
        .boxed();
        let operation = if favorite {
            "favorite.add"
        } else {
            "favorite.remove"
        };

        let mutation = Mutation::new(operation, execute)
            .target(id)
            .optimistic(OptimisticPatch::SetFavorite {
                book_id: id,
                favorite,
            })
            .on_success(|_| vec![favorites(), personalized()])
            .on_error(move |error| {
                if error.is_not_found() {
                    vanished_book(id)
                } else {
                    Vec::new()
                }
            });
        self.mutate(mutation).await
    }

    /// Remove every favorite, one call per id.
    ///
    /// Ids that were removed stay removed even when others fail; failed ids
    /// remain in the FavoriteSet.
    pub async fn clear_favorites(&self) -> Result<ClearFavoritesReport, MutationError> {
        let ids: Vec<BookId> = self.queries.favorite_ids().await?.into_iter().collect();
        if ids.is_empty() {
            return Ok(ClearFavoritesReport::default());
        }

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            guards.push((*id, self.lock(*id).await));
        }

        let patches: Vec<OptimisticPatch> = ids
            .iter()
            .map(|id| OptimisticPatch::SetFavorite {
                book_id: *id,
                favorite: false,
            })
            .collect();
        let mut pending =
            PendingIntent::apply(MutationIntent::new("favorite.clear", None, patches), &self.cache);
        let intent = &mut pending.intent;

        let outcomes = join_all(ids.iter().map(|id| {
            let gateway = self.gateway.clone();
            let id = *id;
            async move { (id, gateway.remove_favorite(id).await) }
        }))
        .await;

        let mut report = ClearFavoritesReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => report.removed.push(id),
                Err(error) => report.failed.push((id, error)),
            }
        }

        if report.is_complete() {
            intent.confirm(&self.cache, vec![favorites(), personalized()]);
        } else {
            intent.roll_back(&self.cache);
            for id in &report.removed {
                Reconcile::Apply(OptimisticPatch::SetFavorite {
                    book_id: *id,
                    favorite: false,
                })
                .run(&self.cache);
            }
            favorites().run(&self.cache);
            personalized().run(&self.cache);
            if report.failed.iter().any(|(_, error)| error.is_unauthorized()) {
                self.cache.evict_user_scoped();
            }
            warn!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "Clearing favorites partially failed"
            );
        }

        for (id, guard) in guards {
            self.release(id, guard);
        }
        info!(removed = report.removed.len(), "Cleared favorites");
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Books
    // ------------------------------------------------------------------

    #[instrument(skip(self, request, file), fields(title = %request.title))]
    pub async fn create_book(
        &self,
        request: BookCreateRequest,
        file: Option<Upload>,
    ) -> Result<Book, MutationError> {
        let placeholder = self.placeholder(&request);
        let gateway = self.gateway.clone();
        let execute = async move { gateway.create_book(&request, file).await }.boxed();

        let mutation = Mutation::new("book.create", execute)
            .optimistic(OptimisticPatch::PrependToLists { book: placeholder })
            .on_success(|book: &Book| {
                vec![
                    book_lists(),
                    Reconcile::Invalidate(KeyPattern::Namespace(Namespace::Categories)),
                    Reconcile::Write {
                        key: QueryKey::book_detail(book.id),
                        data: book.clone().into_data(),
                    },
                ]
            });
        self.mutate(mutation).await
    }

    pub async fn update_book(
        &self,
        id: BookId,
        request: BookUpdateRequest,
        file: Option<Upload>,
    ) -> Result<Book, MutationError> {
        let guard = self.lock(id).await;
        let gateway = self.gateway.clone();
        let changes = request.clone();
        let execute = async move { gateway.update_book(id, &request, file).await }.boxed();

        let mutation = Mutation::new("book.update", execute)
            .target(id)
            .optimistic(OptimisticPatch::UpdateBook {
                book_id: id,
                changes,
            })
            .on_success(move |book: &Book| {
                vec![
                    book_lists(),
                    Reconcile::Write {
                        key: QueryKey::book_detail(id),
                        data: book.clone().into_data(),
                    },
                ]
            })
            .on_error(move |error| {
                if error.is_not_found() {
                    vanished_book(id)
                } else {
                    Vec::new()
                }
            });
        let result = self.mutate(mutation).await;
        self.release(id, guard);
        result
    }

    pub async fn delete_book(&self, id: BookId) -> Result<(), MutationError> {
        let guard = self.lock(id).await;
        let gateway = self.gateway.clone();
        let execute = async move { gateway.delete_book(id).await }.boxed();

        let mutation = Mutation::new("book.delete", execute)
            .target(id)
            .optimistic(OptimisticPatch::RemoveBook { book_id: id })
            .on_success(move |_| {
                let mut steps = vanished_book(id);
                steps.push(Reconcile::Invalidate(KeyPattern::Namespace(
                    Namespace::Recommendations,
                )));
                steps
            })
            .on_error(move |error| {
                if error.is_not_found() {
                    vanished_book(id)
                } else {
                    Vec::new()
                }
            });
        let result = self.mutate(mutation).await;
        self.release(id, guard);
        result
    }

    pub async fn upload_book_pdf(&self, id: BookId, file: Upload) -> Result<MessageResponse, MutationError> {
        let guard = self.lock(id).await;
        let gateway = self.gateway.clone();
        let execute = async move { gateway.upload_book_pdf(id, file).await }.boxed();
        let mutation = Mutation::new("book.upload_pdf", execute)
            .target(id)
            .on_success(move |_| uploaded(id));
        let result = self.mutate(mutation).await;
        self.release(id, guard);
        result
    }

    pub async fn upload_book_cover(
        &self,
        id: BookId,
        file: Upload,
    ) -> Result<MessageResponse, MutationError> {
        let guard = self.lock(id).await;
        let gateway = self.gateway.clone();
        let execute = async move { gateway.upload_book_cover(id, file).await }.boxed();
        let mutation = Mutation::new("book.upload_cover", execute)
            .target(id)
            .on_success(move |_| uploaded(id));
        let result = self.mutate(mutation).await;
        self.release(id, guard);
        result
    }

    /// Temporary list row shown until the server assigns an id.
    fn placeholder(&self, request: &BookCreateRequest) -> Book {
        let id = self.placeholder_ids.fetch_sub(1, Ordering::SeqCst);
        Book {
            id,
            title: request.title.clone(),
            author: request.author.clone(),
            isbn: request.isbn.clone(),
            description: request.description.clone(),
            publication_year: request.publication_year,
            page_count: request.page_count,
            language: request.language.clone(),
            cover_image: None,
            pdf_file: None,
            file_size: None,
            download_count: 0,
            favorite_count: 0,
            available: false,
            category_id: request.category_id,
            category_name: String::new(),
            tag_names: request.tag_names.clone(),
            created_at: String::new(),
            updated_at: String::new(),
            is_favorite: Some(false),
            recommendation_score: None,
        }
    }
}

/// The book is gone server-side: forget its detail, refresh what listed it.
fn vanished_book(id: BookId) -> Vec<Reconcile> {
    vec![
        Reconcile::Remove(QueryKey::book_detail(id)),
        Reconcile::Apply(OptimisticPatch::RemoveBook { book_id: id }),
        book_lists(),
        favorites(),
    ]
}

fn uploaded(id: BookId) -> Vec<Reconcile> {
    vec![
        Reconcile::Invalidate(KeyPattern::Exact(QueryKey::book_detail(id))),
        Reconcile::Invalidate(KeyPattern::Operation(Namespace::Books, op::LIST)),
        Reconcile::Invalidate(KeyPattern::Operation(Namespace::Books, op::SEARCH)),
    ]
}
