//! Media Catalog (C1).
//!
//! Authoritative, in-process record of discovered media items. Reads are
//! concurrent and idempotent; the only writer is the scanner (`scanner.rs`).
//! Storage follows the same shape as a session store: a primary map keyed
//! by the opaque `id`, plus a secondary index for the other unique key
//! (`relPath`) so lookups by either are O(1).

use std::cmp::Ordering;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Coarse media kind, derived from file extension during scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Image,
    Other,
}

/// Stereo layout of a VR video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VrStereo {
    Sbs,
    Tb,
    Mono,
}

/// A single indexed media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaItem {
    pub id: String,
    pub rel_path: String,
    pub filename: String,
    pub title: String,
    pub ext: String,
    pub media_type: MediaType,
    pub size_bytes: u64,
    pub modified_ms: u64,
    pub duration_ms: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub has_funscript: bool,
    pub funscript_action_count: Option<u32>,
    pub funscript_avg_speed: Option<f64>,
    pub is_vr: bool,
    pub vr_fov: Option<u16>,
    pub vr_stereo: Option<VrStereo>,
    pub vr_projection: Option<String>,
}

/// Sort key for `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    Modified,
    Title,
    Filename,
    Duration,
    Speed,
    Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct Filters {
    /// Substring match against filename or title (case-insensitive).
    pub query: Option<String>,
    pub media_type: Option<MediaType>,
    pub has_funscript: Option<bool>,
    pub is_vr: Option<bool>,
    pub duration_ms_range: Option<(u64, u64)>,
    pub funscript_avg_speed_range: Option<(f64, f64)>,
    pub width_range: Option<(u32, u32)>,
    pub height_range: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            key: SortKey::Modified,
            direction: SortDirection::Desc,
        }
    }
}

pub struct SearchResult {
    pub items: Vec<MediaItem>,
    pub total: usize,
}

/// In-process media catalog. Concurrent reads, single writer (the scanner).
///
/// The scanner upserts/deletes one row at a time rather than swapping the
/// whole table, so `search`/`get` interleave freely with an in-progress scan.
pub struct MediaCatalog {
    by_id: DashMap<String, MediaItem>,
    id_by_rel_path: DashMap<String, String>,
}

impl Default for MediaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            id_by_rel_path: DashMap::new(),
        }
    }

    /// Inserts or replaces a row, keeping the secondary index in sync.
    pub fn upsert(&self, item: MediaItem) {
        self.id_by_rel_path
            .insert(item.rel_path.clone(), item.id.clone());
        self.by_id.insert(item.id.clone(), item);
    }

    /// Removes a row by id, if present.
    pub fn remove(&self, id: &str) -> Option<MediaItem> {
        let removed = self.by_id.remove(id).map(|(_, item)| item);
        if let Some(item) = &removed {
            self.id_by_rel_path.remove(&item.rel_path);
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<MediaItem> {
        self.by_id.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn get_by_rel_path(&self, rel_path: &str) -> Option<MediaItem> {
        let id = self.id_by_rel_path.get(rel_path)?.clone();
        self.get(&id)
    }

    /// Returns all known `relPath`s, for the scanner's cleanup sweep.
    #[must_use]
    pub fn all_rel_paths(&self) -> Vec<(String, String)> {
        self.by_id
            .iter()
            .map(|entry| (entry.value().id.clone(), entry.value().rel_path.clone()))
            .collect()
    }

    /// Returns up to `limit` VR videos, most-recently-modified first.
    #[must_use]
    pub fn list_vr(&self, limit: usize) -> Vec<MediaItem> {
        let mut items: Vec<MediaItem> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().is_vr)
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| b.modified_ms.cmp(&a.modified_ms));
        items.truncate(limit);
        items
    }

    /// Filtered, sorted, paginated search.
    #[must_use]
    pub fn search(&self, filters: &Filters, sort: &Sort, page: usize, page_size: usize) -> SearchResult {
        let mut items: Vec<MediaItem> = self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|item| matches_filters(item, filters))
            .collect();

        items.sort_by(|a, b| compare_items(a, b, sort));

        let total = items.len();
        let page = page.max(1);
        let start = (page - 1) * page_size;
        let page_items = items.into_iter().skip(start).take(page_size).collect();

        SearchResult {
            items: page_items,
            total,
        }
    }
}

fn matches_filters(item: &MediaItem, filters: &Filters) -> bool {
    if let Some(query) = &filters.query {
        let q = query.to_ascii_lowercase();
        let haystack = format!(
            "{} {}",
            item.filename.to_ascii_lowercase(),
            item.title.to_ascii_lowercase()
        );
        if !haystack.contains(&q) {
            return false;
        }
    }
    if let Some(media_type) = filters.media_type {
        if item.media_type != media_type {
            return false;
        }
    }
    if let Some(has_funscript) = filters.has_funscript {
        if item.has_funscript != has_funscript {
            return false;
        }
    }
    if let Some(is_vr) = filters.is_vr {
        if item.is_vr != is_vr {
            return false;
        }
    }
    if let Some((lo, hi)) = filters.duration_ms_range {
        match item.duration_ms {
            Some(d) if d >= lo && d <= hi => {}
            _ => return false,
        }
    }
    if let Some((lo, hi)) = filters.funscript_avg_speed_range {
        match item.funscript_avg_speed {
            Some(s) if s >= lo && s <= hi => {}
            _ => return false,
        }
    }
    if let Some((lo, hi)) = filters.width_range {
        match item.width {
            Some(w) if w >= lo && w <= hi => {}
            _ => return false,
        }
    }
    if let Some((lo, hi)) = filters.height_range {
        match item.height {
            Some(h) if h >= lo && h <= hi => {}
            _ => return false,
        }
    }
    true
}

/// Compares by the requested sort key/direction, with NULLs always last
/// (regardless of direction) and a `modified_ms DESC` tiebreaker, per
/// spec.md §4.1.
fn compare_items(a: &MediaItem, b: &MediaItem, sort: &Sort) -> Ordering {
    let primary = match sort.key {
        SortKey::Modified => ordered(a.modified_ms.cmp(&b.modified_ms), sort.direction),
        SortKey::Title => ordered(a.title.cmp(&b.title), sort.direction),
        SortKey::Filename => ordered(a.filename.cmp(&b.filename), sort.direction),
        SortKey::Duration => compare_nullable(a.duration_ms, b.duration_ms, sort.direction),
        SortKey::Speed => compare_nullable_f64(a.funscript_avg_speed, b.funscript_avg_speed, sort.direction),
        SortKey::Resolution => {
            compare_nullable(a.width.map(u64::from), b.width.map(u64::from), sort.direction)
        }
    };

    if primary != Ordering::Equal {
        return primary;
    }
    b.modified_ms.cmp(&a.modified_ms)
}

fn ordered(cmp: Ordering, direction: SortDirection) -> Ordering {
    match direction {
        SortDirection::Asc => cmp,
        SortDirection::Desc => cmp.reverse(),
    }
}

/// NULL-last: a missing value sorts after any present value in both
/// ascending and descending order; only present values are compared by
/// `direction`.
fn compare_nullable<T: Ord>(a: Option<T>, b: Option<T>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => ordered(a.cmp(&b), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn compare_nullable_f64(a: Option<f64>, b: Option<f64>, direction: SortDirection) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => ordered(a.partial_cmp(&b).unwrap_or(Ordering::Equal), direction),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, rel_path: &str, modified_ms: u64) -> MediaItem {
        MediaItem {
            id: id.to_string(),
            rel_path: rel_path.to_string(),
            filename: rel_path.to_string(),
            title: rel_path.to_string(),
            ext: "mp4".to_string(),
            media_type: MediaType::Video,
            size_bytes: 100,
            modified_ms,
            duration_ms: None,
            width: None,
            height: None,
            has_funscript: false,
            funscript_action_count: None,
            funscript_avg_speed: None,
            is_vr: false,
            vr_fov: None,
            vr_stereo: None,
            vr_projection: None,
        }
    }

    #[test]
    fn get_by_rel_path_follows_secondary_index() {
        let catalog = MediaCatalog::new();
        catalog.upsert(item("m1", "a/b.mp4", 100));
        let found = catalog.get_by_rel_path("a/b.mp4").unwrap();
        assert_eq!(found.id, "m1");
    }

    #[test]
    fn remove_clears_both_indexes() {
        let catalog = MediaCatalog::new();
        catalog.upsert(item("m1", "a/b.mp4", 100));
        catalog.remove("m1");
        assert!(catalog.get("m1").is_none());
        assert!(catalog.get_by_rel_path("a/b.mp4").is_none());
    }

    #[test]
    fn search_paginates_and_sorts_by_modified_desc_default() {
        let catalog = MediaCatalog::new();
        catalog.upsert(item("m1", "a.mp4", 100));
        catalog.upsert(item("m2", "b.mp4", 300));
        catalog.upsert(item("m3", "c.mp4", 200));

        let result = catalog.search(&Filters::default(), &Sort::default(), 1, 2);
        assert_eq!(result.total, 3);
        assert_eq!(result.items[0].id, "m2");
        assert_eq!(result.items[1].id, "m3");
    }

    #[test]
    fn search_filters_by_substring_query() {
        let catalog = MediaCatalog::new();
        catalog.upsert(item("m1", "vacation.mp4", 100));
        catalog.upsert(item("m2", "movie_lr_180.mp4", 100));

        let filters = Filters {
            query: Some("lr_180".to_string()),
            ..Default::default()
        };
        let result = catalog.search(&filters, &Sort::default(), 1, 10);
        assert_eq!(result.total, 1);
        assert_eq!(result.items[0].id, "m2");
    }

    #[test]
    fn upsert_by_rel_path_replaces_existing_row() {
        let catalog = MediaCatalog::new();
        catalog.upsert(item("m1", "a.mp4", 100));
        let mut updated = item("m1", "a.mp4", 200);
        updated.size_bytes = 999;
        catalog.upsert(updated);
        assert_eq!(catalog.get("m1").unwrap().size_bytes, 999);
        assert_eq!(catalog.all_rel_paths().len(), 1);
    }
}
