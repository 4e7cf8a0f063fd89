use std::collections::BTreeSet;

use libris_api_types::{CategoryId, SortDir, SortField};

use crate::infra::gateway::{BookQuery, DEFAULT_PAGE_SIZE};

/// Criteria of the book listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterState {
    pub search: String,
    pub category_id: Option<CategoryId>,
    pub tags: BTreeSet<String>,
    pub sort_by: SortField,
    pub sort_dir: SortDir,
    pub page: u32,
    pub size: u32,
}

impl Default for FilterState {
    fn default() -> Self {
        Self {
            search: String::new(),
            category_id: None,
            tags: BTreeSet::new(),
            sort_by: SortField::default(),
            sort_dir: SortDir::default(),
            page: 0,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl FilterState {
    /// Defaults with a preferred ordering and page size.
    pub fn with_preferences(sort_by: SortField, sort_dir: SortDir, size: u32) -> Self {
        Self {
            sort_by,
            sort_dir,
            size,
            ..Self::default()
        }
    }

    /// Equality of everything except the page cursor.
    pub fn same_criteria(&self, other: &Self) -> bool {
        self.search == other.search
            && self.category_id == other.category_id
            && self.tags == other.tags
            && self.sort_by == other.sort_by
            && self.sort_dir == other.sort_dir
            && self.size == other.size
    }

    /// Whether anything narrows the listing.
    pub fn has_active_filters(&self) -> bool {
        !self.search.is_empty() || self.category_id.is_some() || !self.tags.is_empty()
    }

    pub fn to_query(&self) -> BookQuery {
        BookQuery {
            query: (!self.search.is_empty()).then(|| self.search.clone()),
            category_id: self.category_id,
            tags: self.tags.iter().cloned().collect(),
            sort_by: self.sort_by,
            sort_dir: self.sort_dir,
            page: self.page,
            size: self.size,
        }
    }

    /// Apply `patch`; a change to anything but the page resets the page.
    ///
    /// Returns whether the state changed.
    pub fn apply_patch(&mut self, patch: &FilterPatch) -> bool {
        let before = self.clone();
        if let Some(search) = &patch.search {
            self.search = search.trim().to_string();
        }
        if let Some(category_id) = patch.category_id {
            self.category_id = category_id;
        }
        if let Some(tags) = &patch.tags {
            self.tags = normalize_tags(tags.iter().map(String::as_str));
        }
        if let Some(sort_by) = patch.sort_by {
            self.sort_by = sort_by;
        }
        if let Some(sort_dir) = patch.sort_dir {
            self.sort_dir = sort_dir;
        }
        if let Some(size) = patch.size {
            self.size = size.max(1);
        }

        if !self.same_criteria(&before) {
            self.page = 0;
        } else if let Some(page) = patch.page {
            self.page = page;
        }
        *self != before
    }
}

pub(crate) fn normalize_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    tags.into_iter()
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// A partial edit of a [`FilterState`]; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPatch {
    pub search: Option<String>,
    /// `Some(None)` clears the category.
    pub category_id: Option<Option<CategoryId>>,
    pub tags: Option<BTreeSet<String>>,
    pub sort_by: Option<SortField>,
    pub sort_dir: Option<SortDir>,
    pub size: Option<u32>,
    pub page: Option<u32>,
}

impl FilterPatch {
    pub fn search(text: impl Into<String>) -> Self {
        Self {
            search: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn category(category_id: Option<CategoryId>) -> Self {
        Self {
            category_id: Some(category_id),
            ..Self::default()
        }
    }

    pub fn tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: Some(tags.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn page(page: u32) -> Self {
        Self {
            page: Some(page),
            ..Self::default()
        }
    }

    pub fn with_sort(mut self, sort_by: SortField, sort_dir: SortDir) -> Self {
        self.sort_by = Some(sort_by);
        self.sort_dir = Some(sort_dir);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_change_resets_page() {
        let mut state = FilterState {
            page: 4,
            ..FilterState::default()
        };
        assert!(state.apply_patch(&FilterPatch::category(Some(7))));
        assert_eq!(state.page, 0);
        assert_eq!(state.category_id, Some(7));
    }

    #[test]
    fn page_only_patch_keeps_criteria() {
        let mut state = FilterState::default();
        assert!(state.apply_patch(&FilterPatch::page(3)));
        assert_eq!(state.page, 3);
        assert!(state.same_criteria(&FilterState::default()));
    }

    #[test]
    fn blank_search_and_tags_are_dropped() {
        let mut state = FilterState::default();
        state.apply_patch(&FilterPatch {
            search: Some("   ".to_string()),
            tags: Some(BTreeSet::from([" ".to_string(), "poésie".to_string()])),
            ..FilterPatch::default()
        });
        assert!(state.search.is_empty());
        assert_eq!(state.tags, BTreeSet::from(["poésie".to_string()]));
        assert_eq!(state.to_query().query, None);
    }
}
