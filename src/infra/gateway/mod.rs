//! Remote gateway: the typed boundary to the Libris REST backend.
//!
//! Everything above this module talks to the backend through [`RemoteGateway`]
//! so that the cache and mutation layers can be exercised against
//! [`memory::MemoryGateway`] without a network.

mod error;
pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use libris_api_types::{
    AuthorStats, Book, BookCreateRequest, BookFilterOptions, BookId, BookUpdateRequest, Category,
    CategoryId, CategoryStats, DownloadHistory, MessageResponse, PageResponse, PlatformStats,
    Recommendation, RecommendationSource, SortDir, SortField, Tag, User, UserActivityStats,
};

pub use error::GatewayError;

pub const DEFAULT_PAGE_SIZE: u32 = 12;

/// Parameters of the paginated book listing and search endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookQuery {
    pub query: Option<String>,
    pub category_id: Option<CategoryId>,
    pub tags: Vec<String>,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
    pub page: u32,
    pub size: u32,
}

impl Default for BookQuery {
    fn default() -> Self {
        Self {
            query: None,
            category_id: None,
            tags: Vec::new(),
            sort_by: SortField::default(),
            sort_dir: SortDir::default(),
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl BookQuery {
    /// Non-blank search text, if any.
    pub fn search_text(&self) -> Option<&str> {
        self.query
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    /// Query-string pairs in the backend's format; empty values are omitted.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(7);
        if let Some(text) = self.search_text() {
            pairs.push(("query", text.to_string()));
        }
        pairs.push(("page", self.page.to_string()));
        pairs.push(("size", self.size.to_string()));
        pairs.push(("sortBy", self.sort_by.as_str().to_string()));
        pairs.push(("sortDir", self.sort_dir.as_str().to_string()));
        if let Some(category_id) = self.category_id {
            pairs.push(("categoryId", category_id.to_string()));
        }
        if !self.tags.is_empty() {
            pairs.push(("tags", self.tags.join(",")));
        }
        pairs
    }
}

/// Which recommendation feed to pull, with its size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecommendationRequest {
    Personalized { limit: u32 },
    Trending { limit: u32 },
    Category { category_id: CategoryId, limit: u32 },
    Similar { book_id: BookId, limit: u32 },
}

impl RecommendationRequest {
    pub fn source(&self) -> RecommendationSource {
        match self {
            Self::Personalized { .. } => RecommendationSource::Personalized,
            Self::Trending { .. } => RecommendationSource::Trending,
            Self::Category { .. } => RecommendationSource::Category,
            Self::Similar { .. } => RecommendationSource::Similar,
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Self::Personalized { limit }
            | Self::Trending { limit }
            | Self::Category { limit, .. }
            | Self::Similar { limit, .. } => *limit,
        }
    }

    pub(crate) fn path(&self) -> String {
        match self {
            Self::Personalized { .. } => "recommendations/personalized".to_string(),
            Self::Trending { .. } => "recommendations/trending".to_string(),
            Self::Category { category_id, .. } => format!("recommendations/category/{category_id}"),
            Self::Similar { book_id, .. } => format!("recommendations/similar/{book_id}"),
        }
    }
}

/// A file part for multipart uploads.
#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl Upload {
    pub fn pdf(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: "application/pdf".to_string(),
            bytes: bytes.into(),
        }
    }
}

/// CRUD-shaped calls per backend resource.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    async fn list_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError>;

    async fn search_books(&self, query: &BookQuery) -> Result<PageResponse<Book>, GatewayError>;

    async fn get_book(&self, id: BookId) -> Result<Book, GatewayError>;

    async fn books_by_category(
        &self,
        category_id: CategoryId,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<Book>, GatewayError>;

    async fn book_filters(&self) -> Result<BookFilterOptions, GatewayError>;

    async fn create_book(
        &self,
        request: &BookCreateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError>;

    async fn update_book(
        &self,
        id: BookId,
        request: &BookUpdateRequest,
        file: Option<Upload>,
    ) -> Result<Book, GatewayError>;

    async fn delete_book(&self, id: BookId) -> Result<(), GatewayError>;

    async fn upload_book_pdf(&self, id: BookId, file: Upload)
    -> Result<MessageResponse, GatewayError>;

    async fn upload_book_cover(
        &self,
        id: BookId,
        file: Upload,
    ) -> Result<MessageResponse, GatewayError>;

    async fn categories(&self) -> Result<Vec<Category>, GatewayError>;

    async fn tags(&self) -> Result<Vec<Tag>, GatewayError>;

    async fn favorites(&self) -> Result<Vec<Book>, GatewayError>;

    async fn add_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError>;

    async fn remove_favorite(&self, id: BookId) -> Result<MessageResponse, GatewayError>;

    async fn downloads(
        &self,
        page: u32,
        size: u32,
    ) -> Result<PageResponse<DownloadHistory>, GatewayError>;

    async fn recommendations(
        &self,
        request: RecommendationRequest,
    ) -> Result<Vec<Recommendation>, GatewayError>;

    async fn platform_stats(&self) -> Result<PlatformStats, GatewayError>;

    async fn category_stats(&self) -> Result<Vec<CategoryStats>, GatewayError>;

    async fn popular_authors(&self, limit: u32) -> Result<Vec<AuthorStats>, GatewayError>;

    async fn active_users(
        &self,
        days: u32,
        limit: u32,
    ) -> Result<Vec<UserActivityStats>, GatewayError>;

    async fn profile(&self) -> Result<User, GatewayError>;
}
