//! Request and response shapes of the Libris REST API.
//!
//! Field names follow the backend's camelCase JSON. Timestamps are kept as the
//! strings the backend emits; the client never does date arithmetic on them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type BookId = i64;
pub type CategoryId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub download_count: i64,
    #[serde(default)]
    pub favorite_count: i64,
    #[serde(default)]
    pub available: bool,
    pub category_id: CategoryId,
    #[serde(default)]
    pub category_name: String,
    #[serde(default)]
    pub tag_names: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub book_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub book_count: i64,
}

/// The four independent recommendation feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationSource {
    Personalized,
    Trending,
    Category,
    Similar,
}

impl RecommendationSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personalized => "personalized",
            Self::Trending => "trending",
            Self::Category => "category",
            Self::Similar => "similar",
        }
    }
}

impl fmt::Display for RecommendationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recommended book, or a marker that the backend could not resolve it.
///
/// The backend sends `"book": null` when the underlying record is gone.
#[derive(Debug, Clone, PartialEq)]
pub enum BookRef {
    Loaded(Book),
    Unavailable,
}

impl BookRef {
    pub fn book(&self) -> Option<&Book> {
        match self {
            Self::Loaded(book) => Some(book),
            Self::Unavailable => None,
        }
    }

    pub fn book_mut(&mut self) -> Option<&mut Book> {
        match self {
            Self::Loaded(book) => Some(book),
            Self::Unavailable => None,
        }
    }
}

impl From<Option<Book>> for BookRef {
    fn from(value: Option<Book>) -> Self {
        value.map_or(Self::Unavailable, Self::Loaded)
    }
}

impl Serialize for BookRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.book().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BookRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<Book>::deserialize(deserializer).map(Self::from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    #[serde(default = "unavailable")]
    pub book: BookRef,
    /// Relevance in `[0, 100]`.
    pub score: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(rename = "recommendationType")]
    pub source: RecommendationSource,
}

fn unavailable() -> BookRef {
    BookRef::Unavailable
}

/// Spring-style page envelope returned by every paginated endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub content: Vec<T>,
    pub total_elements: u64,
    pub total_pages: u32,
    /// Zero-based page index.
    pub number: u32,
    pub size: u32,
}

impl<T> PageResponse<T> {
    pub fn empty(number: u32, size: u32) -> Self {
        Self {
            content: Vec::new(),
            total_elements: 0,
            total_pages: 0,
            number,
            size,
        }
    }

    /// Slice `items` into the requested page.
    pub fn from_items(items: Vec<T>, number: u32, size: u32) -> Self {
        let total_elements = items.len() as u64;
        let size_u64 = u64::from(size.max(1));
        let total_pages = u32::try_from(total_elements.div_ceil(size_u64)).unwrap_or(u32::MAX);
        let start = usize::try_from(u64::from(number) * size_u64).unwrap_or(usize::MAX);
        let content = items
            .into_iter()
            .skip(start)
            .take(size.max(1) as usize)
            .collect();
        Self {
            content,
            total_elements,
            total_pages,
            number,
            size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadHistory {
    pub id: i64,
    #[serde(default = "unavailable")]
    pub book: BookRef,
    pub downloaded_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformStats {
    pub total_books: u64,
    pub total_users: u64,
    pub total_categories: u64,
    pub total_downloads: u64,
    pub downloads_last_week: u64,
    pub downloads_last_month: u64,
    #[serde(default)]
    pub most_downloaded_books: Vec<Book>,
    #[serde(default)]
    pub most_favorited_books: Vec<Book>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category_id: CategoryId,
    pub category_name: String,
    pub book_count: u64,
    pub total_downloads: u64,
    pub average_downloads_per_book: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorStats {
    pub author_name: String,
    pub book_count: u64,
    pub total_downloads: u64,
    pub total_favorites: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivityStats {
    pub user_id: i64,
    pub username: String,
    pub download_count: u64,
    pub favorite_count: u64,
}

/// Options offered by the catalogue's filter panel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookFilterOptions {
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub years: Vec<i32>,
    #[serde(default)]
    pub categories: Vec<CategoryRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: CategoryId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookCreateRequest {
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub category_id: CategoryId,
    #[serde(default)]
    pub tag_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<CategoryId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Error body returned by the backend on 4xx/5xx.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDir {
    Asc,
    #[default]
    Desc,
}

impl SortDir {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Self::Asc => Self::Desc,
            Self::Desc => Self::Asc,
        }
    }
}

impl FromStr for SortDir {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(format!("unknown sort direction `{other}`")),
        }
    }
}

/// Sortable book fields accepted by the listing endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortField {
    #[serde(rename = "title")]
    Title,
    #[serde(rename = "author")]
    Author,
    #[default]
    #[serde(rename = "createdAt")]
    CreatedAt,
    #[serde(rename = "downloadCount")]
    DownloadCount,
    #[serde(rename = "favoriteCount")]
    FavoriteCount,
    #[serde(rename = "publicationYear")]
    PublicationYear,
}

impl SortField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Author => "author",
            Self::CreatedAt => "createdAt",
            Self::DownloadCount => "downloadCount",
            Self::FavoriteCount => "favoriteCount",
            Self::PublicationYear => "publicationYear",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "title" => Ok(Self::Title),
            "author" => Ok(Self::Author),
            "createdAt" => Ok(Self::CreatedAt),
            "downloadCount" => Ok(Self::DownloadCount),
            "favoriteCount" => Ok(Self::FavoriteCount),
            "publicationYear" => Ok(Self::PublicationYear),
            other => Err(format!("unknown sort field `{other}`")),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
