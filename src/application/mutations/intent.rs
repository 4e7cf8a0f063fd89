//! Optimistic-update bookkeeping.
//!
//! A [`MutationIntent`] moves `Pending -> Confirmed | RolledBack` exactly once.
//! The rollback snapshot is plain data (cloned cache entries), so restoring it
//! needs nothing from the network layer. Rolling back never hides a write or
//! invalidation that landed on the same key after the snapshot: such keys come
//! back stale.

use std::collections::HashMap;

use libris_api_types::{Book, BookId, BookUpdateRequest};
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{
    Baseline, CacheEntry, KeyPattern, Namespace, QueryCache, QueryData, QueryKey, op,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Pending,
    Confirmed,
    RolledBack,
}

/// Desired end state applied to the cache before the remote call.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticPatch {
    SetFavorite { book_id: BookId, favorite: bool },
    /// Show a new book at the head of unfiltered, newest-first first pages.
    PrependToLists { book: Book },
    UpdateBook {
        book_id: BookId,
        changes: BookUpdateRequest,
    },
    RemoveBook { book_id: BookId },
}

impl OptimisticPatch {
    /// Whether applying this patch could change the entry.
    pub fn affects(&self, key: &QueryKey, data: Option<&QueryData>) -> bool {
        let Some(data) = data else {
            return false;
        };
        match self {
            Self::SetFavorite { book_id, .. } => {
                matches!(data, QueryData::FavoriteIds(_)) || data.contains_book(*book_id)
            }
            Self::UpdateBook { book_id, .. } => data.contains_book(*book_id),
            Self::PrependToLists { book } => accepts_new_book(key, book),
            Self::RemoveBook { book_id } => {
                key.operation() != op::DETAIL && data.contains_book(*book_id)
            }
        }
    }

    pub fn apply(&self, key: &QueryKey, data: &mut QueryData) -> bool {
        match self {
            Self::SetFavorite { book_id, favorite } => data.set_favorite(*book_id, *favorite),
            Self::PrependToLists { book } => {
                accepts_new_book(key, book) && data.prepend_book(book)
            }
            Self::UpdateBook { book_id, changes } => {
                data.patch_book(*book_id, |book| merge_update(book, changes))
            }
            Self::RemoveBook { book_id } => {
                key.operation() != op::DETAIL && data.remove_book(*book_id)
            }
        }
    }
}

fn accepts_new_book(key: &QueryKey, book: &Book) -> bool {
    let newest_first = key
        .param("sortBy")
        .is_none_or(|value| value.to_string() == "createdAt")
        && key
            .param("sortDir")
            .is_none_or(|value| value.to_string() == "desc");
    key.namespace() == Namespace::Books
        && key.operation() == op::LIST
        && key.int_param("page").unwrap_or(0) == 0
        && key.param("query").is_none()
        && key.param("tags").is_none()
        && key
            .int_param("categoryId")
            .is_none_or(|category| category == book.category_id)
        && newest_first
}

/// Apply the non-empty fields of an update request.
pub fn merge_update(book: &mut Book, changes: &BookUpdateRequest) {
    if let Some(title) = &changes.title {
        book.title = title.clone();
    }
    if let Some(author) = &changes.author {
        book.author = author.clone();
    }
    if changes.isbn.is_some() {
        book.isbn = changes.isbn.clone();
    }
    if changes.description.is_some() {
        book.description = changes.description.clone();
    }
    if changes.publication_year.is_some() {
        book.publication_year = changes.publication_year;
    }
    if changes.page_count.is_some() {
        book.page_count = changes.page_count;
    }
    if changes.language.is_some() {
        book.language = changes.language.clone();
    }
    if let Some(category_id) = changes.category_id {
        book.category_id = category_id;
    }
    if let Some(tags) = &changes.tag_names {
        book.tag_names = tags.clone();
    }
    if let Some(available) = changes.available {
        book.available = available;
    }
}

/// Cache follow-up once the server has answered.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconcile {
    Invalidate(KeyPattern),
    /// Authoritative data; restarts the key's staleness window.
    Write { key: QueryKey, data: QueryData },
    Remove(QueryKey),
    /// Re-apply a patch the server confirmed.
    Apply(OptimisticPatch),
}

impl Reconcile {
    pub(crate) fn run(self, cache: &QueryCache) {
        match self {
            Self::Invalidate(pattern) => {
                cache.invalidate(&pattern);
            }
            Self::Write { key, data } => {
                cache.set_data::<QueryData, _>(&key, Baseline::Reset, |_| Some(data));
            }
            Self::Remove(key) => {
                cache.remove(&key);
            }
            Self::Apply(patch) => {
                cache.update_matching(&KeyPattern::All, |key, data| patch.apply(key, data));
            }
        }
    }
}

/// An in-flight write and everything needed to undo it.
#[derive(Debug, Clone)]
pub struct MutationIntent {
    pub id: Uuid,
    pub operation: &'static str,
    pub target: Option<BookId>,
    pub started_at: OffsetDateTime,
    state: IntentState,
    patches: Vec<OptimisticPatch>,
    snapshot: Vec<(QueryKey, Option<CacheEntry>)>,
    /// Data each snapshotted key held right after the patches ran.
    applied: HashMap<QueryKey, QueryData>,
}

impl MutationIntent {
    pub fn new(operation: &'static str, target: Option<BookId>, patches: Vec<OptimisticPatch>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            target,
            started_at: OffsetDateTime::now_utc(),
            state: IntentState::Pending,
            patches,
            snapshot: Vec::new(),
            applied: HashMap::new(),
        }
    }

    pub fn state(&self) -> IntentState {
        self.state
    }

    pub fn patches(&self) -> &[OptimisticPatch] {
        &self.patches
    }

    pub fn snapshot(&self) -> &[(QueryKey, Option<CacheEntry>)] {
        &self.snapshot
    }

    /// Snapshot every entry the patches touch, then apply them.
    pub(crate) fn apply(&mut self, cache: &QueryCache) {
        if self.patches.is_empty() {
            return;
        }
        let patches = &self.patches;
        self.snapshot = cache
            .entries_matching(&KeyPattern::All)
            .into_iter()
            .filter(|entry| {
                patches
                    .iter()
                    .any(|patch| patch.affects(&entry.key, entry.data.as_ref()))
            })
            .map(|entry| (entry.key.clone(), Some(entry)))
            .collect();

        let keys: Vec<QueryKey> = self.snapshot.iter().map(|(key, _)| key.clone()).collect();
        let changed = cache.update_matching(
            &|key: &QueryKey| keys.contains(key),
            |key, data| {
                patches
                    .iter()
                    .fold(false, |changed, patch| patch.apply(key, data) || changed)
            },
        );
        self.applied = cache
            .entries_matching(&|key: &QueryKey| keys.contains(key))
            .into_iter()
            .filter_map(|entry| entry.data.map(|data| (entry.key, data)))
            .collect();
        debug!(
            intent = %self.id,
            operation = self.operation,
            touched = changed.len(),
            "Applied optimistic update"
        );
    }

    pub(crate) fn confirm(&mut self, cache: &QueryCache, reconcile: Vec<Reconcile>) -> bool {
        if !self.settle(IntentState::Confirmed) {
            return false;
        }
        self.snapshot.clear();
        self.applied.clear();
        for step in reconcile {
            step.run(cache);
        }
        info!(
            intent = %self.id,
            operation = self.operation,
            book_id = self.target,
            "Mutation confirmed"
        );
        true
    }

    /// Restore every snapshotted entry.
    ///
    /// Entries nobody else touched come back exactly as they were.
    pub(crate) fn roll_back(&mut self, cache: &QueryCache) -> bool {
        if !self.settle(IntentState::RolledBack) {
            return false;
        }
        let restored = self.snapshot.len();
        let applied = std::mem::take(&mut self.applied);
        for (key, entry) in self.snapshot.drain(..) {
            cache.restore(&key, entry, applied.get(&key));
        }
        if !self.patches.is_empty() {
            counter!("libris_mutation_rollback_total", "operation" => self.operation).increment(1);
        }
        warn!(
            intent = %self.id,
            operation = self.operation,
            book_id = self.target,
            restored,
            "Mutation rolled back"
        );
        true
    }

    /// The caller went away before the server answered: undo the patches and
    /// mark every touched key stale, since the write may still have landed.
    pub(crate) fn abandon(&mut self, cache: &QueryCache) -> bool {
        let keys: Vec<QueryKey> = self.snapshot.iter().map(|(key, _)| key.clone()).collect();
        if !self.roll_back(cache) {
            return false;
        }
        cache.invalidate(&|key: &QueryKey| keys.contains(key));
        warn!(
            intent = %self.id,
            operation = self.operation,
            book_id = self.target,
            "Mutation abandoned before the server answered"
        );
        true
    }

    fn settle(&mut self, next: IntentState) -> bool {
        if self.state != IntentState::Pending {
            warn!(
                intent = %self.id,
                state = ?self.state,
                requested = ?next,
                "Ignoring transition of a settled mutation"
            );
            return false;
        }
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use libris_api_types::PageResponse;

    use super::*;
    use crate::cache::CacheConfig;
    use crate::infra::gateway::BookQuery;
    use crate::infra::gateway::memory::{sample_book, sample_category};

    fn seeded_cache() -> (QueryCache, QueryKey) {
        let cache = QueryCache::new(CacheConfig::default());
        let roman = sample_category(1, "Roman");
        let list = QueryKey::books_list(&BookQuery::default());
        cache.set_data::<PageResponse<Book>, _>(&list, Baseline::Reset, |_| {
            Some(PageResponse::from_items(
                vec![sample_book(1, "A", "X", &roman), sample_book(2, "B", "Y", &roman)],
                0,
                12,
            ))
        });
        cache.set_data::<BTreeSet<BookId>, _>(&QueryKey::favorite_ids(), Baseline::Reset, |_| {
            Some(BTreeSet::new())
        });
        (cache, list)
    }

    #[test]
    fn rollback_restores_exact_entries() {
        let (cache, list) = seeded_cache();
        let before_list = cache.entry(&list);
        let before_ids = cache.entry(&QueryKey::favorite_ids());

        let mut intent = MutationIntent::new(
            "favorite.add",
            Some(2),
            vec![OptimisticPatch::SetFavorite {
                book_id: 2,
                favorite: true,
            }],
        );
        intent.apply(&cache);
        assert_eq!(intent.snapshot().len(), 2);
        assert_ne!(cache.entry(&list), before_list);
        assert_ne!(cache.entry(&QueryKey::favorite_ids()), before_ids);

        assert!(intent.roll_back(&cache));
        assert_eq!(intent.state(), IntentState::RolledBack);
        assert_eq!(cache.entry(&list), before_list);
        assert_eq!(cache.entry(&QueryKey::favorite_ids()), before_ids);
    }

    #[test]
    fn favorite_set_is_patched_even_without_the_book() {
        let (cache, _) = seeded_cache();
        let mut intent = MutationIntent::new(
            "favorite.add",
            Some(9),
            vec![OptimisticPatch::SetFavorite {
                book_id: 9,
                favorite: true,
            }],
        );
        intent.apply(&cache);
        assert_eq!(intent.snapshot().len(), 1);
        let ids = cache
            .peek::<BTreeSet<BookId>>(&QueryKey::favorite_ids())
            .expect("favorite set cached");
        assert!(ids.contains(&9));
    }

    #[test]
    fn rollback_after_a_later_invalidation_stays_stale() {
        let (cache, _) = seeded_cache();
        let mut first = MutationIntent::new(
            "favorite.add",
            Some(1),
            vec![OptimisticPatch::SetFavorite {
                book_id: 1,
                favorite: true,
            }],
        );
        first.apply(&cache);
        let mut second = MutationIntent::new(
            "favorite.add",
            Some(2),
            vec![OptimisticPatch::SetFavorite {
                book_id: 2,
                favorite: true,
            }],
        );
        second.apply(&cache);
        second.confirm(
            &cache,
            vec![Reconcile::Invalidate(KeyPattern::Namespace(Namespace::Favorites))],
        );

        assert!(first.roll_back(&cache));
        let ids = cache.entry(&QueryKey::favorite_ids()).expect("favorite set");
        assert!(ids.is_stale());
    }

    #[test]
    fn abandoned_intents_restore_and_mark_stale() {
        let (cache, list) = seeded_cache();
        let before = cache.entry(&list).and_then(|entry| entry.data);
        let mut intent = MutationIntent::new(
            "favorite.add",
            Some(2),
            vec![OptimisticPatch::SetFavorite {
                book_id: 2,
                favorite: true,
            }],
        );
        intent.apply(&cache);
        assert!(intent.abandon(&cache));

        let entry = cache.entry(&list).expect("list kept");
        assert_eq!(entry.data, before);
        assert!(entry.is_stale());
        assert_eq!(intent.state(), IntentState::RolledBack);
    }

    #[test]
    fn settled_intents_ignore_further_transitions() {
        let (cache, _) = seeded_cache();
        let mut intent = MutationIntent::new("book.delete", Some(1), Vec::new());
        assert!(intent.confirm(&cache, Vec::new()));
        assert!(!intent.roll_back(&cache));
        assert_eq!(intent.state(), IntentState::Confirmed);
    }

    #[test]
    fn new_books_only_land_on_matching_first_pages() {
        let roman = sample_category(1, "Roman");
        let book = sample_book(50, "New", "Z", &roman);
        let patch = OptimisticPatch::PrependToLists { book };
        let data = QueryData::BookPage(PageResponse::empty(0, 12));

        let unfiltered = QueryKey::books_list(&BookQuery::default());
        let other_category = QueryKey::books_list(&BookQuery {
            category_id: Some(2),
            ..BookQuery::default()
        });
        let by_title = QueryKey::books_list(&BookQuery {
            sort_by: libris_api_types::SortField::Title,
            ..BookQuery::default()
        });
        assert!(patch.affects(&unfiltered, Some(&data)));
        assert!(!patch.affects(&other_category, Some(&data)));
        assert!(!patch.affects(&by_title, Some(&data)));
    }
}
