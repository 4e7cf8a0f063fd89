//! URL query-string projection of the applied filters.
//!
//! Parameters: `q`, `category`, `sort`, `dir`, `tags`, `page`, `size`. Each is
//! omitted when it matches the base state (the preference-derived defaults),
//! and parsing a projected string against the same base yields the state it
//! came from. Tags repeat the `tags` parameter once per tag.

use libris_api_types::{Category, CategoryId, SortDir, SortField};
use tracing::debug;
use url::form_urlencoded;

use super::state::{FilterState, normalize_tags};

/// Project `state` onto a query string (without the leading `?`).
pub fn to_query_string(state: &FilterState, base: &FilterState, categories: &[Category]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    if state.search != base.search {
        serializer.append_pair("q", &state.search);
    }
    if state.category_id != base.category_id
        && let Some(category_id) = state.category_id
    {
        serializer.append_pair("category", &category_param(category_id, categories));
    }
    if state.sort_by != base.sort_by {
        serializer.append_pair("sort", state.sort_by.as_str());
    }
    if state.sort_dir != base.sort_dir {
        serializer.append_pair("dir", state.sort_dir.as_str());
    }
    if state.tags != base.tags {
        for tag in &state.tags {
            serializer.append_pair("tags", tag);
        }
    }
    if state.page != base.page {
        serializer.append_pair("page", &state.page.to_string());
    }
    if state.size != base.size {
        serializer.append_pair("size", &state.size.to_string());
    }
    serializer.finish()
}

/// Rebuild filters from a query string, starting from `base`.
///
/// Values that do not parse keep the base value; URLs are user input.
pub fn from_query_string(query: &str, base: &FilterState, categories: &[Category]) -> FilterState {
    let query = query.strip_prefix('?').unwrap_or(query);
    let mut state = base.clone();
    let mut tags: Option<Vec<String>> = None;

    for (name, value) in form_urlencoded::parse(query.as_bytes()) {
        match name.as_ref() {
            "q" => state.search = value.trim().to_string(),
            "category" => state.category_id = resolve_category(&value, categories),
            "sort" => state.sort_by = parse_or("sort", &value, base.sort_by),
            "dir" => state.sort_dir = parse_or("dir", &value, base.sort_dir),
            "tags" => tags.get_or_insert_with(Vec::new).push(value.into_owned()),
            "page" => state.page = parse_or("page", &value, base.page),
            "size" => {
                state.size = value
                    .parse::<u32>()
                    .ok()
                    .filter(|size| *size > 0)
                    .unwrap_or(base.size);
            }
            other => debug!(param = other, "Ignoring unknown URL parameter"),
        }
    }
    if let Some(tags) = tags {
        state.tags = normalize_tags(tags.iter().map(String::as_str));
    }
    state
}

/// The lowercased name when it identifies the category unambiguously, else the id.
fn category_param(category_id: CategoryId, categories: &[Category]) -> String {
    let Some(category) = categories.iter().find(|category| category.id == category_id) else {
        return category_id.to_string();
    };
    let name = category.name.to_lowercase();
    let clashes = categories
        .iter()
        .filter(|other| other.name.to_lowercase() == name)
        .count()
        > 1;
    if clashes || name.parse::<CategoryId>().is_ok() {
        category_id.to_string()
    } else {
        name
    }
}

fn resolve_category(value: &str, categories: &[Category]) -> Option<CategoryId> {
    let wanted = value.trim().to_lowercase();
    categories
        .iter()
        .find(|category| category.name.to_lowercase() == wanted)
        .map(|category| category.id)
        .or_else(|| wanted.parse().ok())
}

fn parse_or<T: std::str::FromStr>(param: &'static str, value: &str, fallback: T) -> T {
    value.parse().unwrap_or_else(|_| {
        debug!(param, value, "Ignoring malformed URL parameter");
        fallback
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::infra::gateway::memory::sample_category;

    fn categories() -> Vec<Category> {
        vec![
            sample_category(1, "Roman"),
            sample_category(2, "Science-Fiction"),
            sample_category(3, "Histoire"),
        ]
    }

    fn base() -> FilterState {
        FilterState::default()
    }

    #[test]
    fn defaults_project_to_empty_string() {
        assert_eq!(to_query_string(&base(), &base(), &categories()), "");
    }

    #[test]
    fn projection_is_lossless() {
        let state = FilterState {
            search: "dune été".to_string(),
            category_id: Some(2),
            tags: BTreeSet::from(["classique".to_string(), "culte".to_string()]),
            sort_by: SortField::Title,
            sort_dir: SortDir::Asc,
            page: 3,
            size: 24,
        };
        let query = to_query_string(&state, &base(), &categories());
        assert!(query.contains("category=science-fiction"));
        assert!(query.contains("tags=classique&tags=culte"));
        assert_eq!(from_query_string(&query, &base(), &categories()), state);
    }

    #[test]
    fn tags_with_commas_survive() {
        let state = FilterState {
            tags: BTreeSet::from(["guerre, paix".to_string(), "russe".to_string()]),
            ..FilterState::default()
        };
        let query = to_query_string(&state, &base(), &categories());
        assert_eq!(from_query_string(&query, &base(), &categories()), state);
    }

    #[test]
    fn preferences_fill_what_the_url_omits() {
        let preferred = FilterState::with_preferences(SortField::Title, SortDir::Asc, 24);
        assert_eq!(from_query_string("", &preferred, &categories()), preferred);

        let state = FilterState {
            sort_by: SortField::CreatedAt,
            sort_dir: SortDir::Desc,
            size: 12,
            page: 1,
            ..preferred.clone()
        };
        let query = to_query_string(&state, &preferred, &categories());
        assert_eq!(query, "sort=createdAt&dir=desc&page=1&size=12");
        assert_eq!(from_query_string(&query, &preferred, &categories()), state);
        assert_eq!(to_query_string(&preferred, &preferred, &categories()), "");
    }

    #[test]
    fn category_names_resolve_case_insensitively() {
        let state = from_query_string("?category=HISTOIRE&page=2", &base(), &categories());
        assert_eq!(state.category_id, Some(3));
        assert_eq!(state.page, 2);
    }

    #[test]
    fn unknown_category_falls_back_to_id() {
        let state = FilterState {
            category_id: Some(42),
            ..FilterState::default()
        };
        let query = to_query_string(&state, &base(), &categories());
        assert_eq!(query, "category=42");
        assert_eq!(from_query_string(&query, &base(), &categories()).category_id, Some(42));
    }

    #[test]
    fn malformed_values_use_defaults() {
        let preferred = FilterState::with_preferences(SortField::Author, SortDir::Asc, 48);
        let state = from_query_string("sort=bogus&page=-1&size=0&dir=up", &preferred, &categories());
        assert_eq!(state, preferred);
    }
}
