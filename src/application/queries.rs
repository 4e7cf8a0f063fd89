//! Read-side helpers: one method per backend read, each behind its cache key.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use libris_api_types::{
    AuthorStats, Book, BookFilterOptions, BookId, Category, CategoryId, CategoryStats,
    DownloadHistory, PageResponse, PlatformStats, Recommendation, Tag, User, UserActivityStats,
};
use serde::Serialize;

use crate::cache::{QueryCache, QueryError, QueryKey, QuerySnapshot};
use crate::infra::gateway::{BookQuery, GatewayError, RecommendationRequest, RemoteGateway};

use super::session::Session;

/// Books pulled for client-side statistics.
pub const STATS_SAMPLE_SIZE: u32 = 1000;
const TOP_N: usize = 5;
const UNKNOWN_YEAR: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedCount {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookStats {
    pub total_books: u64,
    pub books_by_category: Vec<NamedCount>,
    /// Ascending by year; books without one are counted under `"unknown"`, last.
    pub books_by_year: Vec<NamedCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FavoriteStats {
    pub total_favorites: u64,
    pub top_categories: Vec<NamedCount>,
    pub top_authors: Vec<NamedCount>,
}

pub fn compute_book_stats(sample: &PageResponse<Book>, categories: &[Category]) -> BookStats {
    let books_by_category = categories
        .iter()
        .map(|category| NamedCount {
            name: category.name.clone(),
            count: sample
                .content
                .iter()
                .filter(|book| book.category_id == category.id)
                .count() as u64,
        })
        .collect();

    let mut years: BTreeMap<i32, u64> = BTreeMap::new();
    let mut unknown = 0;
    for book in &sample.content {
        match book.publication_year {
            Some(year) => *years.entry(year).or_insert(0) += 1,
            None => unknown += 1,
        }
    }
    let mut books_by_year: Vec<NamedCount> = years
        .into_iter()
        .map(|(year, count)| NamedCount {
            name: year.to_string(),
            count,
        })
        .collect();
    if unknown > 0 {
        books_by_year.push(NamedCount {
            name: UNKNOWN_YEAR.to_string(),
            count: unknown,
        });
    }

    BookStats {
        total_books: sample.total_elements,
        books_by_category,
        books_by_year,
    }
}

pub fn compute_favorite_stats(favorites: &[Book]) -> FavoriteStats {
    FavoriteStats {
        total_favorites: favorites.len() as u64,
        top_categories: top_counts(favorites.iter().map(|book| book.category_name.as_str())),
        top_authors: top_counts(favorites.iter().map(|book| book.author.as_str())),
    }
}

/// Highest counts first, ties by name.
fn top_counts<'a>(names: impl Iterator<Item = &'a str>) -> Vec<NamedCount> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for name in names {
        *counts.entry(name).or_insert(0) += 1;
    }
    let mut ranked: Vec<NamedCount> = counts
        .into_iter()
        .map(|(name, count)| NamedCount {
            name: name.to_string(),
            count,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(TOP_N);
    ranked
}

type Fetch<T> = BoxFuture<'static, Result<T, GatewayError>>;

#[derive(Clone)]
pub struct LibraryQueries {
    gateway: Arc<dyn RemoteGateway>,
    cache: QueryCache,
    session: Arc<Session>,
}

impl LibraryQueries {
    pub fn new(gateway: Arc<dyn RemoteGateway>, cache: QueryCache, session: Arc<Session>) -> Self {
        Self {
            gateway,
            cache,
            session,
        }
    }

    fn call<T, F>(&self, f: F) -> impl Fn() -> Fetch<T> + Send + Sync + 'static
    where
        T: Send + 'static,
        F: Fn(Arc<dyn RemoteGateway>) -> Fetch<T> + Send + Sync + 'static,
    {
        let gateway = self.gateway.clone();
        move || f(gateway.clone())
    }

    /// Key of the listing `query` resolves to: search when there is text.
    pub fn books_key(query: &BookQuery) -> QueryKey {
        match query.search_text() {
            Some(_) => QueryKey::books_search(query),
            None => QueryKey::books_list(query),
        }
    }

    pub async fn books(&self, query: &BookQuery) -> Result<PageResponse<Book>, QueryError> {
        let key = Self::books_key(query);
        let searching = query.search_text().is_some();
        let query = query.clone();
        self.cache
            .get(
                key,
                self.call(move |gateway| {
                    let query = query.clone();
                    async move {
                        if searching {
                            gateway.search_books(&query).await
                        } else {
                            gateway.list_books(&query).await
                        }
                    }
                    .boxed()
                }),
            )
            .await
    }

    /// What to render for a listing, falling back to `previous` while it loads.
    pub fn books_snapshot(
        &self,
        query: &BookQuery,
        previous: Option<&BookQuery>,
    ) -> QuerySnapshot<PageResponse<Book>> {
        let previous = previous.map(Self::books_key);
        self.cache
            .snapshot(&Self::books_key(query), previous.as_ref())
    }

    pub async fn book(&self, id: BookId) -> Result<Book, QueryError> {
        self.cache
            .get(
                QueryKey::book_detail(id),
                self.call(move |gateway| async move { gateway.get_book(id).await }.boxed()),
            )
            .await
    }

    pub async fn books_by_category(
        &self,
        category_id: CategoryId,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Book>, QueryError> {
        self.cache
            .get(
                QueryKey::books_by_category(category_id, page, size),
                self.call(move |gateway| {
                    async move { gateway.books_by_category(category_id, page, size).await }.boxed()
                }),
            )
            .await
    }

    pub async fn book_filters(&self) -> Result<BookFilterOptions, QueryError> {
        self.cache
            .get(
                QueryKey::book_filters(),
                self.call(|gateway| async move { gateway.book_filters().await }.boxed()),
            )
            .await
    }

    pub async fn categories(&self) -> Result<Vec<Category>, QueryError> {
        self.cache
            .get(
                QueryKey::categories(),
                self.call(|gateway| async move { gateway.categories().await }.boxed()),
            )
            .await
    }

    pub async fn tags(&self) -> Result<Vec<Tag>, QueryError> {
        self.cache
            .get(
                QueryKey::tags(),
                self.call(|gateway| async move { gateway.tags().await }.boxed()),
            )
            .await
    }

    pub async fn books_stats(&self) -> Result<BookStats, QueryError> {
        self.cache
            .get(
                QueryKey::books_stats(),
                self.call(|gateway| {
                    async move {
                        let query = BookQuery {
                            size: STATS_SAMPLE_SIZE,
                            ..BookQuery::default()
                        };
                        let (sample, categories) =
                            futures::try_join!(gateway.list_books(&query), gateway.categories())?;
                        Ok(compute_book_stats(&sample, &categories))
                    }
                    .boxed()
                }),
            )
            .await
    }

    pub async fn favorites(&self) -> Result<Vec<Book>, QueryError> {
        if !self.session.is_authenticated() {
            return Ok(Vec::new());
        }
        self.cache
            .get(
                QueryKey::favorites_list(),
                self.call(|gateway| async move { gateway.favorites().await }.boxed()),
            )
            .await
    }

    /// The FavoriteSet. Empty, without a request, when signed out.
    pub async fn favorite_ids(&self) -> Result<BTreeSet<BookId>, QueryError> {
        if !self.session.is_authenticated() {
            return Ok(BTreeSet::new());
        }
        self.cache
            .get(
                QueryKey::favorite_ids(),
                self.call(|gateway| {
                    async move {
                        let books = gateway.favorites().await?;
                        Ok(books.into_iter().map(|book| book.id).collect())
                    }
                    .boxed()
                }),
            )
            .await
    }

    /// Favorite indicator from the cached FavoriteSet; never fetches.
    pub fn is_favorite(&self, id: BookId) -> bool {
        self.cache
            .peek::<BTreeSet<BookId>>(&QueryKey::favorite_ids())
            .is_some_and(|ids| ids.contains(&id))
    }

    pub async fn favorite_stats(&self) -> Result<FavoriteStats, QueryError> {
        let favorites = self.favorites().await?;
        Ok(compute_favorite_stats(&favorites))
    }

    pub async fn downloads(
        &self,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<DownloadHistory>, QueryError> {
        self.cache
            .get(
                QueryKey::downloads(page, size),
                self.call(move |gateway| async move { gateway.downloads(page, size).await }.boxed()),
            )
            .await
    }

    pub async fn recommendations(
        &self,
        request: RecommendationRequest,
    ) -> Result<Vec<Recommendation>, QueryError> {
        self.cache
            .get(
                QueryKey::recommendations(&request),
                self.call(move |gateway| async move { gateway.recommendations(request).await }.boxed()),
            )
            .await
    }

    pub async fn platform_stats(&self) -> Result<PlatformStats, QueryError> {
        self.cache
            .get(
                QueryKey::platform_stats(),
                self.call(|gateway| async move { gateway.platform_stats().await }.boxed()),
            )
            .await
    }

    pub async fn category_stats(&self) -> Result<Vec<CategoryStats>, QueryError> {
        self.cache
            .get(
                QueryKey::category_stats(),
                self.call(|gateway| async move { gateway.category_stats().await }.boxed()),
            )
            .await
    }

    pub async fn popular_authors(&self, limit: u32) -> Result<Vec<AuthorStats>, QueryError> {
        self.cache
            .get(
                QueryKey::popular_authors(limit),
                self.call(move |gateway| async move { gateway.popular_authors(limit).await }.boxed()),
            )
            .await
    }

    pub async fn active_users(
        &self,
        days: u32,
        limit: u32,
    ) -> Result<Vec<UserActivityStats>, QueryError> {
        self.cache
            .get(
                QueryKey::active_users(days, limit),
                self.call(move |gateway| {
                    async move { gateway.active_users(days, limit).await }.boxed()
                }),
            )
            .await
    }

    pub async fn profile(&self) -> Result<User, QueryError> {
        self.cache
            .get(
                QueryKey::profile(),
                self.call(|gateway| async move { gateway.profile().await }.boxed()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::infra::gateway::memory::{sample_book, sample_category};

    use super::*;

    #[test]
    fn book_stats_count_categories_and_years() {
        let roman = sample_category(1, "Roman");
        let science = sample_category(2, "Science");
        let mut a = sample_book(1, "A", "X", &roman);
        a.publication_year = Some(1900);
        let mut b = sample_book(2, "B", "Y", &roman);
        b.publication_year = Some(1850);
        let c = sample_book(3, "C", "Z", &science);
        let sample = PageResponse::from_items(vec![a, b, c], 0, STATS_SAMPLE_SIZE);

        let stats = compute_book_stats(&sample, &[roman, science]);
        assert_eq!(stats.total_books, 3);
        assert_eq!(stats.books_by_category[0].count, 2);
        assert_eq!(stats.books_by_category[1].count, 1);
        let years: Vec<&str> = stats.books_by_year.iter().map(|y| y.name.as_str()).collect();
        assert_eq!(years, vec!["1850", "1900", "unknown"]);
    }

    #[test]
    fn favorite_stats_rank_by_count_then_name() {
        let roman = sample_category(1, "Roman");
        let poesie = sample_category(2, "Poésie");
        let favorites = vec![
            sample_book(1, "A", "Zola", &roman),
            sample_book(2, "B", "Hugo", &poesie),
            sample_book(3, "C", "Zola", &roman),
            sample_book(4, "D", "Camus", &poesie),
        ];
        let stats = compute_favorite_stats(&favorites);
        assert_eq!(stats.total_favorites, 4);
        assert_eq!(
            stats.top_authors,
            vec![
                NamedCount {
                    name: "Zola".to_string(),
                    count: 2
                },
                NamedCount {
                    name: "Camus".to_string(),
                    count: 1
                },
                NamedCount {
                    name: "Hugo".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(stats.top_categories[0].name, "Poésie");
    }

    #[test]
    fn top_counts_keep_five() {
        let names = ["a", "b", "c", "d", "e", "f"];
        assert_eq!(top_counts(names.into_iter()).len(), 5);
    }
}
