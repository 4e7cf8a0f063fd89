//! In-process [`RemoteGateway`] backed by plain collections.
//!
//! Used by tests and the `--offline` CLI mode. Every call is counted per
//! operation, can be delayed, and can be made to fail a given number of
//! times, so cache dedup, retries, and rollbacks can be observed without a
//! server.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use libris_api_types::{
    AuthorStats, Book, BookCreateRequest, BookFilterOptions, BookId, BookRef, BookUpdateRequest,
    Category, CategoryId, CategoryRef, CategoryStats, DownloadHistory, MessageResponse,
    PageResponse, PlatformStats, Recommendation, RecommendationSource, SortDir, SortField, Tag,
    User, UserActivityStats,
};

use crate::application::session::Session;
use crate::cache::lock::mutex_lock;

use super::{BookQuery, GatewayError, RecommendationRequest, RemoteGateway, Upload};

const SOURCE: &str = "infra::gateway::memory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    ListBooks,
    SearchBooks,
    GetBook,
    BooksByCategory,
    BookFilters,
    CreateBook,
    UpdateBook,
    DeleteBook,
    UploadPdf,
    UploadCover,
    Categories,
    Tags,
    Favorites,
    AddFavorite,
    RemoveFavorite,
    Downloads,
    Recommendations(RecommendationSource),
    PlatformStats,
    CategoryStats,
    PopularAuthors,
    ActiveUsers,
    Profile,
}

/// A plausible book for seeding.
pub fn sample_book(id: BookId, title: &str, author: &str, category: &Category) -> Book {
    Book {
        id,
        title: title.to_string(),
        author: author.to_string(),
        isbn: None,
        description: None,
        publication_year: None,
        page_count: None,
        language: Some("fr".to_string()),
        cover_image: None,
        pdf_file: None,
        file_size: None,
        download_count: 0,
        favorite_count: 0,
        available: true,
        category_id: category.id,
        category_name: category.name.clone(),
        tag_names: Vec::new(),
        created_at: format!("{id:012}"),
        updated_at: format!("{id:012}"),
        is_favorite: Some(false),
        recommendation_score: None,
    }
}

pub fn sample_category(id: CategoryId, name: &str) -> Category {
    Category {
        id,
        name: name.to_string(),
        description: None,
        color: None,
        icon: None,
        book_count: 0,
    }
}

#[derive(Default)]
struct Library {
    books: BTreeMap<BookId, Book>,
    categories: Vec<Category>,
    tags: Vec<Tag>,
    favorites: BTreeSet<BookId>,
    downloads: Vec<DownloadHistory>,
    personalized: Option<Vec<Recommendation>>,
    profile: Option<User>,
    next_id: BookId,
    clock: u64,
}

impl Library {
    fn decorate(&self, book: &Book) -> Book {
        let mut book = book.clone();
        book.is_favorite = Some(self.favorites.contains(&book.id));
        book
    }

    fn category_name(&self, id: CategoryId) -> String {
        self.categories
            .iter()
            .find(|category| category.id == id)
            .map(|category| category.name.clone())
            .unwrap_or_default()
    }

    fn tick(&mut self) -> String {
        self.clock += 1;
        format!("{:012}", 1_000_000 + self.clock)
    }

    fn filtered(&self, query: &BookQuery) -> Vec<Book> {
        let needle = query.search_text().map(str::to_lowercase);
        let mut books: Vec<Book> = self
            .books
            .values()
            .filter(|book| {
                needle.as_deref().is_none_or(|needle| {
                    book.title.to_lowercase().contains(needle)
                        || book.author.to_lowercase().contains(needle)
                })
            })
            .filter(|book| query.category_id.is_none_or(|id| book.category_id == id))
            .filter(|book| {
                query.tags.is_empty() || query.tags.iter().any(|tag| book.tag_names.contains(tag))
            })
            .map(|book| self.decorate(book))
            .collect();

        books.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortField::Title => a.title.cmp(&b.title),
                SortField::Author => a.author.cmp(&b.author),
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::DownloadCount => a.download_count.cmp(&b.download_count),
                SortField::FavoriteCount => a.favorite_count.cmp(&b.favorite_count),
                SortField::PublicationYear => a.publication_year.cmp(&b.publication_year),
            }
            .then(a.id.cmp(&b.id));
            match query.sort_dir {
                SortDir::Asc => ordering,
                SortDir::Desc => ordering.reverse(),
            }
        });
        books
    }

    fn as_recommendations(
        &self,
        books: Vec<&Book>,
        source: RecommendationSource,
        reason: &str,
        limit: u32,
    ) -> Vec<Recommendation> {
        books
            .into_iter()
            .take(limit as usize)
            .enumerate()
            .map(|(rank, book)| Recommendation {
                book: BookRef::Loaded(self.decorate(book)),
                score: (100.0 - rank as f64 * 5.0).max(0.0),
                reason: reason.to_string(),
                source,
            })
            .collect()
    }

    fn recommend(&self, request: RecommendationRequest) -> Result<Vec<Recommendation>, GatewayError> {
        let limit = request.limit();
        let source = request.source();
        let recs = match request {
            RecommendationRequest::Personalized { .. } => {
                if let Some(seeded) = &self.personalized {
                    return Ok(seeded.clone());
                }
                let liked: BTreeSet<CategoryId> = self
                    .favorites
                    .iter()
                    .filter_map(|id| self.books.get(id))
                    .map(|book| book.category_id)
                    .collect();
                let books = self
                    .books
                    .values()
                    .filter(|book| liked.contains(&book.category_id))
                    .filter(|book| !self.favorites.contains(&book.id))
                    .collect();
                self.as_recommendations(books, source, "Based on your favorites", limit)
            }
            RecommendationRequest::Trending { .. } => {
                let mut books: Vec<&Book> = self.books.values().collect();
                books.sort_by(|a, b| b.download_count.cmp(&a.download_count).then(a.id.cmp(&b.id)));
                self.as_recommendations(books, source, "Popular right now", limit)
            }
            RecommendationRequest::Category { category_id, .. } => {
                let books = self
                    .books
                    .values()
                    .filter(|book| book.category_id == category_id)
                    .filter(|book| !self.favorites.contains(&book.id))
                    .collect();
                self.as_recommendations(books, source, "From a category you like", limit)
            }
            RecommendationRequest::Similar { book_id, .. } => {
                let anchor = self
                    .books
                    .get(&book_id)
                    .ok_or_else(|| GatewayError::not_found(format!("book {book_id}")))?;
                let books = self
                    .books
                    .values()
                    .filter(|book| book.id != book_id && book.category_id == anchor.category_id)
                    .collect();
                self.as_recommendations(books, source, "Similar to what you viewed", limit)
            }
        };
        Ok(recs)
    }
}

/// Collections-backed gateway with call counting and fault injection.
pub struct MemoryGateway {
    library: Mutex<Library>,
    calls: Mutex<HashMap<GatewayOp, usize>>,
    failures: Mutex<HashMap<GatewayOp, VecDeque<GatewayError>>>,
    latency: Mutex<HashMap<GatewayOp, Duration>>,
    default_latency: Mutex<Duration>,
    session: Option<Arc<Session>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            library: Mutex::new(Library {
                next_id: 1,
                ..Library::default()
            }),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            default_latency: Mutex::new(Duration::ZERO),
            session: None,
        }
    }

    /// Report 401s to `session` the way the HTTP gateway does.
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Small catalogue used by the offline CLI mode.
    pub fn demo() -> Self {
        let gateway = Self::new();
        let fiction = sample_category(1, "Roman");
        let science = sample_category(2, "Science");
        let history = sample_category(3, "Histoire");
        gateway.seed_categories(vec![fiction.clone(), science.clone(), history.clone()]);
        let titles = [
            ("Les Misérables", "Victor Hugo", &fiction, Some(1862)),
            ("Germinal", "Émile Zola", &fiction, Some(1885)),
            ("L'Étranger", "Albert Camus", &fiction, Some(1942)),
            ("Cosmos", "Carl Sagan", &science, Some(1980)),
            ("Une brève histoire du temps", "Stephen Hawking", &science, Some(1988)),
            ("Le Siècle des Lumières", "Alejo Carpentier", &history, None),
        ];
        let count = titles.len();
        for (index, (title, author, category, year)) in titles.into_iter().enumerate() {
            let id = index as BookId + 1;
            let mut book = sample_book(id, title, author, category);
            book.publication_year = year;
            book.download_count = (count - index) as i64 * 7;
            gateway.seed_book(book);
        }
        gateway.seed_tags(vec![
            Tag {
                id: 1,
                name: "classique".to_string(),
                color: None,
                book_count: 3,
            },
            Tag {
                id: 2,
                name: "vulgarisation".to_string(),
                color: None,
                book_count: 2,
            },
        ]);
        gateway
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn seed_book(&self, book: Book) {
        let mut library = mutex_lock(&self.library, SOURCE, "seed_book");
        library.next_id = library.next_id.max(book.id + 1);
        library.books.insert(book.id, book);
    }

    pub fn seed_categories(&self, categories: Vec<Category>) {
        mutex_lock(&self.library, SOURCE, "seed_categories").categories = categories;
    }

    pub fn seed_tags(&self, tags: Vec<Tag>) {
        mutex_lock(&self.library, SOURCE, "seed_tags").tags = tags;
    }

    pub fn seed_favorites(&self, ids: impl IntoIterator<Item = BookId>) {
        mutex_lock(&self.library, SOURCE, "seed_favorites")
            .favorites
            .extend(ids);
    }

    /// Canned personalized response, returned as-is whatever limit is asked for.
    pub fn seed_personalized(&self, recommendations: Vec<Recommendation>) {
        mutex_lock(&self.library, SOURCE, "seed_personalized").personalized =
            Some(recommendations);
    }

    pub fn seed_profile(&self, user: User) {
        mutex_lock(&self.library, SOURCE, "seed_profile").profile = Some(user);
    }

    /// Remove a book behind the client's back.
    pub fn delete_externally(&self, id: BookId) {
        let mut library = mutex_lock(&self.library, SOURCE, "delete_externally");
        library.books.remove(&id);
        library.favorites.remove(&id);
    }

    // ------------------------------------------------------------------
    // Inspection and fault injection
    // ------------------------------------------------------------------

    pub fn calls(&self, op: GatewayOp) -> usize {
        mutex_lock(&self.calls, SOURCE, "calls")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        mutex_lock(&self.calls, SOURCE, "total_calls").values().sum()
    }

    pub fn favorite_ids(&self) -> BTreeSet<BookId> {
        mutex_lock(&self.library, SOURCE, "favorite_ids")
            .favorites
            .clone()
    }

    pub fn book(&self, id: BookId) -> Option<Book> {
        let library = mutex_lock(&self.library, SOURCE, "book");
        library.books.get(&id).map(|book| library.decorate(book))
    }

    /// Fail the next call to `op` with `error`.
    pub fn fail_next(&self, op: GatewayOp, error: GatewayError) {
        self.fail_times(op, error, 1);
    }

    pub fn fail_times(&self, op: GatewayOp, error: GatewayError, times: usize) {
        let mut failures = mutex_lock(&self.failures, SOURCE, "fail_times");
        let queue = failures.entry(op).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    pub fn set_latency(&self, latency: Duration) {
        *mutex_lock(&self.default_latency, SOURCE, "set_latency") = latency;
    }

    pub fn set_op_latency(&self, op: GatewayOp, latency: Duration) {
        mutex_lock(&self.latency, SOURCE, "set_op_latency").insert(op, latency);
    }

    /// Count the call, wait out the configured latency, then apply injected failures.
    async fn enter(&self, op: GatewayOp) -> Result<(), GatewayError> {
        *mutex_lock(&self.calls, SOURCE, "enter.calls")
            .entry(op)
            .or_insert(0) += 1;

        let latency = mutex_lock(&self.latency, SOURCE, "enter.latency")
            .get(&op)
            .copied()
            .unwrap_or_else(|| *mutex_lock(&self.default_latency, SOURCE, "enter.default_latency"));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let injected = mutex_lock(&self.failures, SOURCE, "enter.failures")
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match injected {
            Some(error) => {
                if error.is_unauthorized()
                    && let Some(session) = &self.session
                {
                    session.mark_unauthorized();
                }
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn with_library<T>(&self, op: &'static str, f: impl FnOnce(&mut Library) -> T) -> T {
        f(&mut mutex_lock(&self.library, SOURCE, op))
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    async fn list_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError> {
        self.enter(GatewayOp::ListBooks).await?;
        Ok(self.with_library("list_books", |library| {
            PageResponse::from_items(library.filtered(query), query.page, query.size)
        }))
    }

    async fn search_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError> {
        self.enter(GatewayOp::SearchBooks).await?;
        Ok(self.with_library("search_books", |library| {
            PageResponse::from_items(library.filtered(query), query.page, query.size)
        }))
    }

    async fn get_book(&self, id: BookId) -> Result<Book, GatewayError> {
        self.enter(GatewayOp::GetBook).await?;
        self.with_library("get_book", |library| {
            library
                .books
                .get(&id)
                .map(|book| library.decorate(book))
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))
        })
    }

    async fn books_by_category(
        &self,
        category_id: CategoryId,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Book>, GatewayError> {
        self.enter(GatewayOp::BooksByCategory).await?;
        let query = BookQuery {
            category_id: Some(category_id),
            page,
            size,
            ..BookQuery::default()
        };
        Ok(self.with_library("books_by_category", |library| {
            PageResponse::from_items(library.filtered(&query), page, size)
        }))
    }

    async fn book_filters(&self) -> Result<BookFilterOptions, GatewayError> {
        self.enter(GatewayOp::BookFilters).await?;
        Ok(self.with_library("book_filters", |library| {
            let languages: BTreeSet<String> = library
                .books
                .values()
                .filter_map(|book| book.language.clone())
                .collect();
            let years: BTreeSet<i32> = library
                .books
                .values()
                .filter_map(|book| book.publication_year)
                .collect();
            BookFilterOptions {
                languages: languages.into_iter().collect(),
                years: years.into_iter().rev().collect(),
                categories: library
                    .categories
                    .iter()
                    .map(|category| CategoryRef {
                        id: category.id,
                        name: category.name.clone(),
                    })
                    .collect(),
            }
        }))
    }

    async fn create_book(
        &self,
        request: &BookCreateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError> {
        self.enter(GatewayOp::CreateBook).await?;
        if request.title.trim().is_empty() {
            return Err(GatewayError::validation("Title is required", Some("title")));
        }
        Ok(self.with_library("create_book", |library| {
            let id = library.next_id;
            library.next_id += 1;
            let stamp = library.tick();
            let book = Book {
                id,
                title: request.title.clone(),
                author: request.author.clone(),
                isbn: request.isbn.clone(),
                description: request.description.clone(),
                publication_year: request.publication_year,
                page_count: request.page_count,
                language: request.language.clone(),
                cover_image: None,
                pdf_file: file.as_ref().map(|upload| upload.file_name.clone()),
                file_size: file.as_ref().map(|upload| upload.bytes.len() as i64),
                download_count: 0,
                favorite_count: 0,
                available: true,
                category_id: request.category_id,
                category_name: library.category_name(request.category_id),
                tag_names: request.tag_names.clone(),
                created_at: stamp.clone(),
                updated_at: stamp,
                is_favorite: Some(false),
                recommendation_score: None,
            };
            library.books.insert(id, book.clone());
            book
        }))
    }

    async fn update_book(
        &self,
        id: BookId,
        request: &BookUpdateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError> {
        self.enter(GatewayOp::UpdateBook).await?;
        self.with_library("update_book", |library| {
            let stamp = library.tick();
            let category_name = request.category_id.map(|id| library.category_name(id));
            let book = library
                .books
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            if let Some(title) = &request.title {
                book.title = title.clone();
            }
            if let Some(author) = &request.author {
                book.author = author.clone();
            }
            if request.isbn.is_some() {
                book.isbn = request.isbn.clone();
            }
            if request.description.is_some() {
                book.description = request.description.clone();
            }
            if request.publication_year.is_some() {
                book.publication_year = request.publication_year;
            }
            if request.page_count.is_some() {
                book.page_count = request.page_count;
            }
            if request.language.is_some() {
                book.language = request.language.clone();
            }
            if let (Some(category_id), Some(name)) = (request.category_id, category_name) {
                book.category_id = category_id;
                book.category_name = name;
            }
            if let Some(tags) = &request.tag_names {
                book.tag_names = tags.clone();
            }
            if let Some(available) = request.available {
                book.available = available;
            }
            if let Some(upload) = file {
                book.pdf_file = Some(upload.file_name);
                book.file_size = Some(upload.bytes.len() as i64);
            }
            book.updated_at = stamp;
            let book = book.clone();
            Ok(library.decorate(&book))
        })
    }

    async fn delete_book(&self, id: BookId) -> Result<(), GatewayError> {
        self.enter(GatewayOp::DeleteBook).await?;
        self.with_library("delete_book", |library| {
            library
                .books
                .remove(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            library.favorites.remove(&id);
            Ok(())
        })
    }

    async fn upload_book_pdf(&self, id: BookId, file: Upload) -> Result<MessageResponse, GatewayError> {
        self.enter(GatewayOp::UploadPdf).await?;
        self.with_library("upload_book_pdf", |library| {
            let book = library
                .books
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            book.file_size = Some(file.bytes.len() as i64);
            book.pdf_file = Some(file.file_name);
            Ok(MessageResponse {
                message: "PDF uploaded".to_string(),
            })
        })
    }

    async fn upload_book_cover(
        &self,
        id: BookId,
        file: Upload,
    ) -> Result<MessageResponse, GatewayError> {
        self.enter(GatewayOp::UploadCover).await?;
        self.with_library("upload_book_cover", |library| {
            let book = library
                .books
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            book.cover_image = Some(file.file_name);
            Ok(MessageResponse {
                message: "Cover uploaded".to_string(),
            })
        })
    }

    async fn categories(&self) -> Result<Vec<Category>, GatewayError> {
        self.enter(GatewayOp::Categories).await?;
        Ok(self.with_library("categories", |library| {
            library
                .categories
                .iter()
                .map(|category| {
                    let mut category = category.clone();
                    category.book_count = library
                        .books
                        .values()
                        .filter(|book| book.category_id == category.id)
                        .count() as i64;
                    category
                })
                .collect()
        }))
    }

    async fn tags(&self) -> Result<Vec<Tag>, GatewayError> {
        self.enter(GatewayOp::Tags).await?;
        Ok(self.with_library("tags", |library| library.tags.clone()))
    }

    async fn favorites(&self) -> Result<Vec<Book>, GatewayError> {
        self.enter(GatewayOp::Favorites).await?;
        Ok(self.with_library("favorites", |library| {
            library
                .favorites
                .iter()
                .filter_map(|id| library.books.get(id))
                .map(|book| library.decorate(book))
                .collect()
        }))
    }

    async fn add_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError> {
        self.enter(GatewayOp::AddFavorite).await?;
        self.with_library("add_favorite", |library| {
            let book = library
                .books
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            if library.favorites.insert(id) {
                book.favorite_count += 1;
            }
            Ok(MessageResponse {
                message: "Book added to favorites".to_string(),
            })
        })
    }

    async fn remove_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError> {
        self.enter(GatewayOp::RemoveFavorite).await?;
        self.with_library("remove_favorite", |library| {
            let book = library
                .books
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(format!("book {id}")))?;
            if library.favorites.remove(&id) {
                book.favorite_count = (book.favorite_count - 1).max(0);
            }
            Ok(MessageResponse {
                message: "Book removed from favorites".to_string(),
            })
        })
    }

    async fn downloads(
        &self,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<DownloadHistory>, GatewayError> {
        self.enter(GatewayOp::Downloads).await?;
        Ok(self.with_library("downloads", |library| {
            PageResponse::from_items(library.downloads.clone(), page, size)
        }))
    }

    async fn recommendations(
        &self,
        request: RecommendationRequest,
    ) -> Result<Vec<Recommendation>, GatewayError> {
        self.enter(GatewayOp::Recommendations(request.source())).await?;
        self.with_library("recommendations", |library| library.recommend(request))
    }

    async fn platform_stats(&self) -> Result<PlatformStats, GatewayError> {
        self.enter(GatewayOp::PlatformStats).await?;
        Ok(self.with_library("platform_stats", |library| {
            let mut by_downloads: Vec<Book> = library.books.values().cloned().collect();
            by_downloads.sort_by(|a, b| b.download_count.cmp(&a.download_count));
            let mut by_favorites = by_downloads.clone();
            by_favorites.sort_by(|a, b| b.favorite_count.cmp(&a.favorite_count));
            let total_downloads = library
                .books
                .values()
                .map(|book| book.download_count.max(0) as u64)
                .sum();
            PlatformStats {
                total_books: library.books.len() as u64,
                total_users: u64::from(library.profile.is_some()),
                total_categories: library.categories.len() as u64,
                total_downloads,
                downloads_last_week: library.downloads.len() as u64,
                downloads_last_month: library.downloads.len() as u64,
                most_downloaded_books: by_downloads.into_iter().take(5).collect(),
                most_favorited_books: by_favorites.into_iter().take(5).collect(),
            }
        }))
    }

    async fn category_stats(&self) -> Result<Vec<CategoryStats>, GatewayError> {
        self.enter(GatewayOp::CategoryStats).await?;
        Ok(self.with_library("category_stats", |library| {
            library
                .categories
                .iter()
                .map(|category| {
                    let books: Vec<&Book> = library
                        .books
                        .values()
                        .filter(|book| book.category_id == category.id)
                        .collect();
                    let total_downloads: u64 =
                        books.iter().map(|book| book.download_count.max(0) as u64).sum();
                    CategoryStats {
                        category_id: category.id,
                        category_name: category.name.clone(),
                        book_count: books.len() as u64,
                        total_downloads,
                        average_downloads_per_book: if books.is_empty() {
                            0.0
                        } else {
                            total_downloads as f64 / books.len() as f64
                        },
                    }
                })
                .collect()
        }))
    }

    async fn popular_authors(&self, limit: u32) -> Result<Vec<AuthorStats>, GatewayError> {
        self.enter(GatewayOp::PopularAuthors).await?;
        Ok(self.with_library("popular_authors", |library| {
            let mut authors: BTreeMap<&str, AuthorStats> = BTreeMap::new();
            for book in library.books.values() {
                let stats = authors.entry(&book.author).or_insert_with(|| AuthorStats {
                    author_name: book.author.clone(),
                    book_count: 0,
                    total_downloads: 0,
                    total_favorites: 0,
                });
                stats.book_count += 1;
                stats.total_downloads += book.download_count.max(0) as u64;
                stats.total_favorites += book.favorite_count.max(0) as u64;
            }
            let mut authors: Vec<AuthorStats> = authors.into_values().collect();
            authors.sort_by(|a, b| b.total_downloads.cmp(&a.total_downloads));
            authors.truncate(limit as usize);
            authors
        }))
    }

    async fn active_users(
        &self,
        _days: u32,
        limit: u32,
    ) -> Result<Vec<UserActivityStats>, GatewayError> {
        self.enter(GatewayOp::ActiveUsers).await?;
        Ok(self.with_library("active_users", |library| {
            library
                .profile
                .iter()
                .take(limit as usize)
                .map(|user| UserActivityStats {
                    user_id: user.id,
                    username: user.username.clone(),
                    download_count: library.downloads.len() as u64,
                    favorite_count: library.favorites.len() as u64,
                })
                .collect()
        }))
    }

    async fn profile(&self) -> Result<User, GatewayError> {
        self.enter(GatewayOp::Profile).await?;
        self.with_library("profile", |library| {
            library.profile.clone().ok_or(GatewayError::Unauthorized)
        })
    }
}
