use libris_api_types::{Category, SortField};
use tracing::debug;

use crate::application::queries::LibraryQueries;
use crate::cache::QueryKey;
use crate::infra::gateway::BookQuery;

use super::state::{FilterPatch, FilterState};
use super::url;

/// Two-phase filter editing.
///
/// `applied` drives the active query; `temp` collects edits from the filter
/// panel and only reaches `applied` through [`FilterStaging::apply`]. Paging,
/// sorting and the search box act on `applied` directly.
#[derive(Debug, Clone)]
pub struct FilterStaging {
    defaults: FilterState,
    applied: FilterState,
    temp: FilterState,
    previous: Option<FilterState>,
    panel_open: bool,
}

impl Default for FilterStaging {
    fn default() -> Self {
        Self::new(FilterState::default())
    }
}

impl FilterStaging {
    pub fn new(defaults: FilterState) -> Self {
        Self {
            applied: defaults.clone(),
            temp: defaults.clone(),
            defaults,
            previous: None,
            panel_open: false,
        }
    }

    pub fn applied(&self) -> &FilterState {
        &self.applied
    }

    pub fn temp(&self) -> &FilterState {
        &self.temp
    }

    pub fn is_panel_open(&self) -> bool {
        self.panel_open
    }

    pub fn open_panel(&mut self) {
        self.panel_open = true;
    }

    /// Pending panel edits, page excluded.
    pub fn is_dirty(&self) -> bool {
        !self.temp.same_criteria(&self.applied)
    }

    pub fn has_active_filters(&self) -> bool {
        self.applied.has_active_filters()
    }

    pub fn active_query(&self) -> BookQuery {
        self.applied.to_query()
    }

    pub fn active_key(&self) -> QueryKey {
        LibraryQueries::books_key(&self.active_query())
    }

    /// The listing shown before the last change, for keep-previous rendering.
    pub fn previous_query(&self) -> Option<BookQuery> {
        self.previous.as_ref().map(FilterState::to_query)
    }

    pub fn edit_temp(&mut self, patch: FilterPatch) {
        self.temp.apply_patch(&patch);
    }

    pub fn toggle_temp_tag(&mut self, tag: &str) {
        let tag = tag.trim();
        if tag.is_empty() {
            return;
        }
        let mut tags = self.temp.tags.clone();
        if !tags.remove(tag) {
            tags.insert(tag.to_string());
        }
        self.temp.apply_patch(&FilterPatch {
            tags: Some(tags),
            ..FilterPatch::default()
        });
    }

    pub fn apply(&mut self) {
        let mut next = self.temp.clone();
        next.page = 0;
        self.commit(next);
        self.temp = self.applied.clone();
        self.panel_open = false;
        debug!(filters = ?self.applied, "Applied staged filters");
    }

    pub fn cancel(&mut self) {
        self.temp = self.applied.clone();
        self.panel_open = false;
    }

    pub fn reset_all(&mut self) {
        self.commit(self.defaults.clone());
        self.temp = self.defaults.clone();
        self.panel_open = false;
    }

    pub fn set_page(&mut self, page: u32) {
        let mut next = self.applied.clone();
        next.page = page;
        self.commit(next);
        self.temp.page = page;
    }

    /// Same field flips the direction; a new field starts descending.
    pub fn set_sort(&mut self, field: SortField) {
        let mut next = self.applied.clone();
        if next.sort_by == field {
            next.sort_dir = next.sort_dir.flipped();
        } else {
            next.sort_by = field;
            next.sort_dir = Default::default();
        }
        next.page = 0;
        self.commit_direct(next);
    }

    /// Search box submit: applies immediately.
    pub fn submit_search(&mut self, text: &str) {
        let mut next = self.applied.clone();
        next.apply_patch(&FilterPatch::search(text));
        next.page = 0;
        self.commit_direct(next);
    }

    pub fn set_page_size(&mut self, size: u32) {
        let mut next = self.applied.clone();
        next.size = size.max(1);
        next.page = 0;
        self.commit_direct(next);
    }

    /// Back/forward navigation: the URL wins over any staged edit.
    ///
    /// Parameters the URL omits take the preference-derived defaults.
    pub fn navigate(&mut self, query: &str, categories: &[Category]) {
        let next = url::from_query_string(query, &self.defaults, categories);
        self.commit(next);
        self.temp = self.applied.clone();
    }

    pub fn to_url(&self, categories: &[Category]) -> String {
        url::to_query_string(&self.applied, &self.defaults, categories)
    }

    /// Commit a direct change and carry it into `temp` without dropping staged edits.
    fn commit_direct(&mut self, next: FilterState) {
        self.commit(next);
        self.temp.search = self.applied.search.clone();
        self.temp.sort_by = self.applied.sort_by;
        self.temp.sort_dir = self.applied.sort_dir;
        self.temp.size = self.applied.size;
        self.temp.page = self.applied.page;
    }

    fn commit(&mut self, next: FilterState) {
        if next != self.applied {
            self.previous = Some(std::mem::replace(&mut self.applied, next));
        }
    }
}

#[cfg(test)]
mod tests {
    use libris_api_types::SortDir;

    use super::*;
    use crate::infra::gateway::memory::sample_category;

    #[test]
    fn cancel_leaves_applied_untouched() {
        let mut staging = FilterStaging::default();
        let applied = staging.applied().clone();
        let key = staging.active_key();

        staging.open_panel();
        staging.edit_temp(FilterPatch::category(Some(3)));
        assert!(staging.is_dirty());
        staging.cancel();

        assert_eq!(staging.applied(), &applied);
        assert_eq!(staging.active_key(), key);
        assert!(!staging.is_dirty());
        assert!(!staging.is_panel_open());
    }

    #[test]
    fn apply_commits_and_resets_page() {
        let mut staging = FilterStaging::default();
        staging.set_page(4);
        staging.edit_temp(FilterPatch::category(Some(7)));
        staging.apply();

        assert_eq!(staging.applied().category_id, Some(7));
        assert_eq!(staging.applied().page, 0);
        assert_eq!(staging.active_query().category_id, Some(7));
    }

    #[test]
    fn edits_never_reach_the_active_key() {
        let mut staging = FilterStaging::default();
        let key = staging.active_key();
        staging.edit_temp(FilterPatch::search("dune"));
        staging.toggle_temp_tag("classique");
        assert_eq!(staging.active_key(), key);
    }

    #[test]
    fn sorting_flips_or_restarts_descending() {
        let mut staging = FilterStaging::default();
        staging.set_page(2);
        staging.set_sort(SortField::CreatedAt);
        assert_eq!(staging.applied().sort_dir, SortDir::Asc);
        assert_eq!(staging.applied().page, 0);

        staging.set_sort(SortField::Title);
        assert_eq!(staging.applied().sort_by, SortField::Title);
        assert_eq!(staging.applied().sort_dir, SortDir::Desc);
    }

    #[test]
    fn direct_changes_keep_staged_edits() {
        let mut staging = FilterStaging::default();
        staging.edit_temp(FilterPatch::category(Some(2)));
        staging.set_sort(SortField::Author);
        assert!(staging.is_dirty());
        assert_eq!(staging.temp().category_id, Some(2));
        assert_eq!(staging.temp().sort_by, SortField::Author);
    }

    #[test]
    fn navigation_mirrors_into_temp() {
        let categories = vec![sample_category(1, "Roman")];
        let mut staging = FilterStaging::default();
        staging.edit_temp(FilterPatch::search("pending"));
        staging.navigate("?category=roman&page=1", &categories);

        assert_eq!(staging.applied().category_id, Some(1));
        assert_eq!(staging.applied().page, 1);
        assert_eq!(staging.temp(), staging.applied());
        assert_eq!(staging.to_url(&categories), "category=roman&page=1");
    }

    #[test]
    fn empty_url_keeps_preferred_ordering_and_size() {
        let defaults = FilterState::with_preferences(SortField::Title, SortDir::Asc, 24);
        let mut staging = FilterStaging::new(defaults.clone());
        staging.set_page(3);
        staging.navigate("", &[]);

        assert_eq!(staging.applied(), &defaults);
        assert_eq!(staging.active_query().sort_by, SortField::Title);
        assert_eq!(staging.active_query().size, 24);
        assert_eq!(staging.to_url(&[]), "");
    }

    #[test]
    fn reset_restores_defaults() {
        let defaults = FilterState::with_preferences(SortField::Title, SortDir::Asc, 24);
        let mut staging = FilterStaging::new(defaults.clone());
        staging.submit_search("dune");
        staging.edit_temp(FilterPatch::category(Some(1)));
        staging.reset_all();
        assert_eq!(staging.applied(), &defaults);
        assert_eq!(staging.temp(), &defaults);
        assert!(!staging.has_active_filters());
    }

    #[test]
    fn previous_query_tracks_last_listing() {
        let mut staging = FilterStaging::default();
        assert!(staging.previous_query().is_none());
        staging.set_page(1);
        assert_eq!(staging.previous_query().map(|q| q.page), Some(0));
    }
}
