//! Query key definitions.
//!
//! A [`QueryKey`] is `(namespace, operation, parameters…)`. Parameters live in
//! a sorted map, and absent or empty values are dropped when the key is built,
//! so equality and hashing ignore insertion order and omitted filters.

use std::collections::BTreeMap;
use std::fmt;

use libris_api_types::{BookId, CategoryId, SortDir, SortField};

use crate::infra::gateway::{BookQuery, RecommendationRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Books,
    Favorites,
    Downloads,
    Recommendations,
    Analytics,
    Categories,
    Tags,
    Users,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Books => "books",
            Self::Favorites => "favorites",
            Self::Downloads => "downloads",
            Self::Recommendations => "recommendations",
            Self::Analytics => "analytics",
            Self::Categories => "categories",
            Self::Tags => "tags",
            Self::Users => "users",
        }
    }
}

/// Operation names used inside each namespace.
pub mod op {
    pub const LIST: &str = "list";
    pub const SEARCH: &str = "search";
    pub const DETAIL: &str = "detail";
    pub const CATEGORY: &str = "category";
    pub const STATS: &str = "stats";
    pub const FILTERS: &str = "filters";
    pub const IDS: &str = "ids";
    pub const PERSONALIZED: &str = "personalized";
    pub const TRENDING: &str = "trending";
    pub const SIMILAR: &str = "similar";
    pub const PLATFORM: &str = "platform";
    pub const CATEGORIES: &str = "categories";
    pub const AUTHORS: &str = "authors";
    pub const ACTIVE_USERS: &str = "active-users";
    pub const PROFILE: &str = "profile";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamValue {
    Int(i64),
    Text(String),
    /// Sorted and deduplicated.
    List(Vec<String>),
    Flag(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::List(values) => write!(f, "[{}]", values.join(",")),
            Self::Flag(value) => write!(f, "{value}"),
        }
    }
}

/// Conversion into a key parameter; `None` means "omit".
pub trait IntoParam {
    fn into_param(self) -> Option<ParamValue>;
}

impl IntoParam for i64 {
    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Int(self))
    }
}

impl IntoParam for u32 {
    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Int(i64::from(self)))
    }
}

impl IntoParam for bool {
    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Flag(self))
    }
}

impl IntoParam for &str {
    fn into_param(self) -> Option<ParamValue> {
        let trimmed = self.trim();
        (!trimmed.is_empty()).then(|| ParamValue::Text(trimmed.to_string()))
    }
}

impl IntoParam for String {
    fn into_param(self) -> Option<ParamValue> {
        self.as_str().into_param()
    }
}

impl IntoParam for Vec<String> {
    fn into_param(self) -> Option<ParamValue> {
        let mut values: Vec<String> = self
            .into_iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        values.sort();
        values.dedup();
        (!values.is_empty()).then_some(ParamValue::List(values))
    }
}

impl IntoParam for SortField {
    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Text(self.as_str().to_string()))
    }
}

impl IntoParam for SortDir {
    fn into_param(self) -> Option<ParamValue> {
        Some(ParamValue::Text(self.as_str().to_string()))
    }
}

impl<T: IntoParam> IntoParam for Option<T> {
    fn into_param(self) -> Option<ParamValue> {
        self.and_then(IntoParam::into_param)
    }
}

/// Identity of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    namespace: Namespace,
    operation: &'static str,
    params: BTreeMap<&'static str, ParamValue>,
}

impl QueryKey {
    pub fn new(namespace: Namespace, operation: &'static str) -> Self {
        Self {
            namespace,
            operation,
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter; empty values are elided.
    pub fn with(mut self, name: &'static str, value: impl IntoParam) -> Self {
        match value.into_param() {
            Some(value) => {
                self.params.insert(name, value);
            }
            None => {
                self.params.remove(name);
            }
        }
        self
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }

    pub fn int_param(&self, name: &str) -> Option<i64> {
        match self.params.get(name) {
            Some(ParamValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Keys holding data that belongs to the signed-in user.
    pub fn is_user_scoped(&self) -> bool {
        match self.namespace {
            Namespace::Favorites | Namespace::Downloads | Namespace::Users => true,
            Namespace::Recommendations => self.operation == op::PERSONALIZED,
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Key factories
    // ------------------------------------------------------------------

    fn book_listing(operation: &'static str, query: &BookQuery) -> Self {
        Self::new(Namespace::Books, operation)
            .with("query", query.search_text())
            .with("categoryId", query.category_id)
            .with("tags", query.tags.clone())
            .with("sortBy", query.sort_by)
            .with("sortDir", query.sort_dir)
            .with("page", query.page)
            .with("size", query.size)
    }

    pub fn books_list(query: &BookQuery) -> Self {
        Self::book_listing(op::LIST, query)
    }

    pub fn books_search(query: &BookQuery) -> Self {
        Self::book_listing(op::SEARCH, query)
    }

    pub fn book_detail(id: BookId) -> Self {
        Self::new(Namespace::Books, op::DETAIL).with("id", id)
    }

    pub fn books_by_category(category_id: CategoryId, page: u32, size: u32) -> Self {
        Self::new(Namespace::Books, op::CATEGORY)
            .with("categoryId", category_id)
            .with("page", page)
            .with("size", size)
    }

    pub fn books_stats() -> Self {
        Self::new(Namespace::Books, op::STATS)
    }

    pub fn book_filters() -> Self {
        Self::new(Namespace::Books, op::FILTERS)
    }

    pub fn categories() -> Self {
        Self::new(Namespace::Categories, op::LIST)
    }

    pub fn tags() -> Self {
        Self::new(Namespace::Tags, op::LIST)
    }

    /// The FavoriteSet: ids of every favorited book.
    pub fn favorite_ids() -> Self {
        Self::new(Namespace::Favorites, op::IDS)
    }

    pub fn favorites_list() -> Self {
        Self::new(Namespace::Favorites, op::LIST)
    }

    pub fn downloads(page: u32, size: u32) -> Self {
        Self::new(Namespace::Downloads, op::LIST)
            .with("page", page)
            .with("size", size)
    }

    pub fn recommendations(request: &RecommendationRequest) -> Self {
        match *request {
            RecommendationRequest::Personalized { limit } => {
                Self::new(Namespace::Recommendations, op::PERSONALIZED).with("limit", limit)
            }
            RecommendationRequest::Trending { limit } => {
                Self::new(Namespace::Recommendations, op::TRENDING).with("limit", limit)
            }
            RecommendationRequest::Category { category_id, limit } => {
                Self::new(Namespace::Recommendations, op::CATEGORY)
                    .with("categoryId", category_id)
                    .with("limit", limit)
            }
            RecommendationRequest::Similar { book_id, limit } => {
                Self::new(Namespace::Recommendations, op::SIMILAR)
                    .with("bookId", book_id)
                    .with("limit", limit)
            }
        }
    }

    pub fn platform_stats() -> Self {
        Self::new(Namespace::Analytics, op::PLATFORM)
    }

    pub fn category_stats() -> Self {
        Self::new(Namespace::Analytics, op::CATEGORIES)
    }

    pub fn popular_authors(limit: u32) -> Self {
        Self::new(Namespace::Analytics, op::AUTHORS).with("limit", limit)
    }

    pub fn active_users(days: u32, limit: u32) -> Self {
        Self::new(Namespace::Analytics, op::ACTIVE_USERS)
            .with("days", days)
            .with("limit", limit)
    }

    pub fn profile() -> Self {
        Self::new(Namespace::Users, op::PROFILE)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace.as_str(), self.operation)?;
        if self.params.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (index, (name, value)) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

/// Selects cache entries for bulk invalidation, snapshots, and patches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPattern {
    Exact(QueryKey),
    Namespace(Namespace),
    Operation(Namespace, &'static str),
    UserScoped,
    All,
}

impl KeyPattern {
    /// Every paginated/filtered book listing (`books.list.*`, `books.search.*`, `books.category.*`).
    pub fn book_lists() -> Vec<Self> {
        vec![
            Self::Operation(Namespace::Books, op::LIST),
            Self::Operation(Namespace::Books, op::SEARCH),
            Self::Operation(Namespace::Books, op::CATEGORY),
        ]
    }
}

/// Anything that can decide whether a key is affected.
pub trait KeyMatcher {
    fn matches(&self, key: &QueryKey) -> bool;
}

impl KeyMatcher for KeyPattern {
    fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Namespace(namespace) => key.namespace == *namespace,
            Self::Operation(namespace, operation) => {
                key.namespace == *namespace && key.operation == *operation
            }
            Self::UserScoped => key.is_user_scoped(),
            Self::All => true,
        }
    }
}

impl KeyMatcher for QueryKey {
    fn matches(&self, key: &QueryKey) -> bool {
        self == key
    }
}

impl KeyMatcher for [KeyPattern] {
    fn matches(&self, key: &QueryKey) -> bool {
        self.iter().any(|pattern| pattern.matches(key))
    }
}

impl KeyMatcher for Vec<KeyPattern> {
    fn matches(&self, key: &QueryKey) -> bool {
        self.as_slice().matches(key)
    }
}

impl<F> KeyMatcher for F
where
    F: Fn(&QueryKey) -> bool,
{
    fn matches(&self, key: &QueryKey) -> bool {
        self(key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::*;

    fn hash_of(key: &QueryKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn empty_parameters_are_elided() {
        let with_empty_tags = BookQuery {
            category_id: Some(5),
            tags: Vec::new(),
            ..Default::default()
        };
        let without_tags = BookQuery {
            category_id: Some(5),
            ..Default::default()
        };
        let a = QueryKey::books_list(&with_empty_tags);
        let b = QueryKey::books_list(&without_tags);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert!(a.param("tags").is_none());
    }

    #[test]
    fn parameter_order_does_not_matter() {
        let a = QueryKey::new(Namespace::Books, op::LIST)
            .with("page", 0u32)
            .with("categoryId", 5i64);
        let b = QueryKey::new(Namespace::Books, op::LIST)
            .with("categoryId", 5i64)
            .with("page", 0u32);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn blank_search_text_is_elided() {
        let a = QueryKey::new(Namespace::Books, op::LIST).with("query", "  ");
        let b = QueryKey::new(Namespace::Books, op::LIST).with("query", None::<String>);
        assert_eq!(a, b);
    }

    #[test]
    fn page_change_never_collides_with_category_change() {
        let base = BookQuery {
            category_id: Some(2),
            ..Default::default()
        };
        let next_page = BookQuery {
            page: 1,
            ..base.clone()
        };
        let other_category = BookQuery {
            category_id: Some(3),
            ..base.clone()
        };
        let keys = [
            QueryKey::books_list(&base),
            QueryKey::books_list(&next_page),
            QueryKey::books_list(&other_category),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[0], keys[2]);
        assert_ne!(keys[1], keys[2]);
    }

    #[test]
    fn tag_lists_are_normalized() {
        let a = QueryKey::new(Namespace::Books, op::LIST)
            .with("tags", vec!["b".to_string(), "a".to_string(), "a".to_string()]);
        let b = QueryKey::new(Namespace::Books, op::LIST)
            .with("tags", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
    }

    #[test]
    fn patterns_select_by_namespace_and_operation() {
        let list = QueryKey::books_list(&BookQuery::default());
        let detail = QueryKey::book_detail(1);
        let favorites = QueryKey::favorite_ids();

        assert!(KeyPattern::book_lists().matches(&list));
        assert!(!KeyPattern::book_lists().matches(&detail));
        assert!(KeyPattern::Namespace(Namespace::Books).matches(&detail));
        assert!(KeyPattern::UserScoped.matches(&favorites));
        assert!(!KeyPattern::UserScoped.matches(&detail));
        assert!((|key: &QueryKey| key.int_param("id") == Some(1)).matches(&detail));
    }

    #[test]
    fn personalized_recommendations_are_user_scoped() {
        let personalized =
            QueryKey::recommendations(&RecommendationRequest::Personalized { limit: 8 });
        let trending = QueryKey::recommendations(&RecommendationRequest::Trending { limit: 8 });
        assert!(personalized.is_user_scoped());
        assert!(!trending.is_user_scoped());
    }

    #[test]
    fn display_is_stable() {
        let key = QueryKey::books_by_category(2, 0, 12);
        assert_eq!(key.to_string(), "books.category{categoryId=2,page=0,size=12}");
    }
}
