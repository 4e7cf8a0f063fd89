//! Cached values and per-key entry state.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use libris_api_types::{
    AuthorStats, Book, BookFilterOptions, BookId, Category, CategoryStats, DownloadHistory,
    PageResponse, PlatformStats, Recommendation, Tag, User, UserActivityStats,
};

use crate::application::queries::BookStats;
use crate::infra::gateway::GatewayError;

use super::events::Epoch;
use super::keys::QueryKey;

/// Every shape of data the cache stores.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    BookPage(PageResponse<Book>),
    Book(Book),
    Books(Vec<Book>),
    FavoriteIds(BTreeSet<BookId>),
    Recommendations(Vec<Recommendation>),
    Downloads(PageResponse<DownloadHistory>),
    Categories(Vec<Category>),
    Tags(Vec<Tag>),
    BookFilters(BookFilterOptions),
    BookStats(BookStats),
    PlatformStats(PlatformStats),
    CategoryStats(Vec<CategoryStats>),
    AuthorStats(Vec<AuthorStats>),
    UserActivity(Vec<UserActivityStats>),
    Profile(User),
}

impl QueryData {
    fn books(&self) -> Box<dyn Iterator<Item = &Book> + '_> {
        match self {
            Self::BookPage(page) => Box::new(page.content.iter()),
            Self::Book(book) => Box::new(std::iter::once(book)),
            Self::Books(books) => Box::new(books.iter()),
            Self::Recommendations(items) => Box::new(items.iter().filter_map(|item| item.book.book())),
            Self::Downloads(page) => {
                Box::new(page.content.iter().filter_map(|item| item.book.book()))
            }
            Self::PlatformStats(stats) => Box::new(
                stats
                    .most_downloaded_books
                    .iter()
                    .chain(stats.most_favorited_books.iter()),
            ),
            _ => Box::new(std::iter::empty()),
        }
    }

    fn books_mut(&mut self) -> Box<dyn Iterator<Item = &mut Book> + '_> {
        match self {
            Self::BookPage(page) => Box::new(page.content.iter_mut()),
            Self::Book(book) => Box::new(std::iter::once(book)),
            Self::Books(books) => Box::new(books.iter_mut()),
            Self::Recommendations(items) => {
                Box::new(items.iter_mut().filter_map(|item| item.book.book_mut()))
            }
            Self::Downloads(page) => {
                Box::new(page.content.iter_mut().filter_map(|item| item.book.book_mut()))
            }
            Self::PlatformStats(stats) => Box::new(
                stats
                    .most_downloaded_books
                    .iter_mut()
                    .chain(stats.most_favorited_books.iter_mut()),
            ),
            _ => Box::new(std::iter::empty()),
        }
    }

    /// Whether this value renders the given book anywhere.
    pub fn contains_book(&self, id: BookId) -> bool {
        match self {
            Self::FavoriteIds(ids) => ids.contains(&id),
            _ => self.books().any(|book| book.id == id),
        }
    }

    /// Set the favorite flag on every copy of `id`; returns whether anything changed.
    pub fn set_favorite(&mut self, id: BookId, favorite: bool) -> bool {
        if let Self::FavoriteIds(ids) = self {
            return if favorite { ids.insert(id) } else { ids.remove(&id) };
        }
        let mut changed = false;
        for book in self.books_mut().filter(|book| book.id == id) {
            if book.is_favorite != Some(favorite) {
                book.is_favorite = Some(favorite);
                changed = true;
            }
        }
        changed
    }

    /// Apply `edit` to every copy of `id`; returns whether any copy exists.
    pub fn patch_book(&mut self, id: BookId, mut edit: impl FnMut(&mut Book)) -> bool {
        let mut found = false;
        for book in self.books_mut().filter(|book| book.id == id) {
            edit(book);
            found = true;
        }
        found
    }

    /// Put a new book at the head of a first page.
    pub fn prepend_book(&mut self, book: &Book) -> bool {
        let Self::BookPage(page) = self else {
            return false;
        };
        if page.number != 0 || page.content.iter().any(|item| item.id == book.id) {
            return false;
        }
        page.content.insert(0, book.clone());
        if page.size > 0 && page.content.len() > page.size as usize {
            page.content.truncate(page.size as usize);
        }
        page.total_elements += 1;
        page.total_pages = u32::try_from(page.total_elements.div_ceil(u64::from(page.size.max(1))))
            .unwrap_or(u32::MAX);
        true
    }

    /// Drop a book from list-shaped values.
    pub fn remove_book(&mut self, id: BookId) -> bool {
        match self {
            Self::BookPage(page) => {
                let before = page.content.len();
                page.content.retain(|book| book.id != id);
                let removed = before - page.content.len();
                page.total_elements = page.total_elements.saturating_sub(removed as u64);
                removed > 0
            }
            Self::Books(books) => {
                let before = books.len();
                books.retain(|book| book.id != id);
                books.len() != before
            }
            Self::FavoriteIds(ids) => ids.remove(&id),
            _ => false,
        }
    }
}

/// Conversion between a typed query result and [`QueryData`].
pub trait Cacheable: Clone + Send + Sync + 'static {
    fn into_data(self) -> QueryData;
    fn from_data(data: &QueryData) -> Option<Self>;
}

macro_rules! cacheable {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl Cacheable for $ty {
                fn into_data(self) -> QueryData {
                    QueryData::$variant(self)
                }

                fn from_data(data: &QueryData) -> Option<Self> {
                    match data {
                        QueryData::$variant(value) => Some(value.clone()),
                        _ => None,
                    }
                }
            }
        )+
    };
}

impl Cacheable for QueryData {
    fn into_data(self) -> QueryData {
        self
    }

    fn from_data(data: &QueryData) -> Option<Self> {
        Some(data.clone())
    }
}

cacheable! {
    PageResponse<Book> => BookPage,
    Book => Book,
    Vec<Book> => Books,
    BTreeSet<BookId> => FavoriteIds,
    Vec<Recommendation> => Recommendations,
    PageResponse<DownloadHistory> => Downloads,
    Vec<Category> => Categories,
    Vec<Tag> => Tags,
    BookFilterOptions => BookFilters,
    BookStats => BookStats,
    PlatformStats => PlatformStats,
    Vec<CategoryStats> => CategoryStats,
    Vec<AuthorStats> => AuthorStats,
    Vec<UserActivityStats> => UserActivity,
    User => Profile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// State of one key. Owned by the cache; readers only ever see clones.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub error: Option<GatewayError>,
    pub fetched_at: Option<Instant>,
    pub stale_after: Duration,
    /// Epoch at which the fetch that produced `data` started.
    pub(crate) fetched_epoch: Option<Epoch>,
    pub(crate) invalidated_at: Option<Epoch>,
    /// Epoch of the fetch currently allowed to write this entry.
    pub(crate) pending: Option<Epoch>,
}

impl CacheEntry {
    pub(crate) fn idle(key: QueryKey, stale_after: Duration) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            stale_after,
            fetched_epoch: None,
            invalidated_at: None,
            pending: None,
        }
    }

    /// Invalidated after the data it holds was requested.
    pub fn is_invalidated(&self) -> bool {
        match (self.invalidated_at, self.fetched_epoch) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(fetched)) => at > fetched,
        }
    }

    pub fn is_stale(&self) -> bool {
        let expired = self
            .fetched_at
            .is_none_or(|at| at.elapsed() >= self.stale_after);
        expired || self.is_invalidated()
    }

    /// Servable without a fetch.
    pub fn is_fresh(&self) -> bool {
        self.status == QueryStatus::Success && self.data.is_some() && !self.is_stale()
    }
}

/// What a view renders for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot<T> {
    pub status: QueryStatus,
    pub data: Option<T>,
    pub error: Option<GatewayError>,
    pub is_stale: bool,
    /// `data` belongs to the previous key of a paginated list.
    pub is_previous_data: bool,
}

impl<T> QuerySnapshot<T> {
    pub(crate) fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_stale: true,
            is_previous_data: false,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}
