use std::collections::{BTreeMap, HashMap};

use rollcall_core::{fold_identifier, Column};
use tracing::{debug, warn};

use crate::formula::decode_link_cell;

/// Last known state of one persisted profile row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// 1-based sheet row; row 1 is the header. `None` when an append landed
    /// but its position could not be read back yet.
    pub row: Option<usize>,
    /// Display values in column order, as the sheet shows them.
    pub values: Vec<String>,
    /// URLs behind link cells, where known.
    pub links: BTreeMap<Column, String>,
}

impl CacheEntry {
    pub fn value(&self, column: Column) -> &str {
        self.values
            .get(column.index())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn link(&self, column: Column) -> Option<&str> {
        self.links.get(&column).map(String::as_str)
    }
}

/// In-memory snapshot of the `Profiles` table keyed by case-folded nickname.
/// Loaded once per run; every successful write refreshes its entry so later
/// reconciliations in the same run never re-read the store.
#[derive(Debug, Default, Clone)]
pub struct IdentityCache {
    entries: HashMap<String, CacheEntry>,
}

impl IdentityCache {
    /// Build from a full table read (header row included).
    pub fn load(rows: &[Vec<String>]) -> Self {
        let mut cache = Self::default();
        for (position, nickname, row) in data_rows(rows) {
            let key = fold_identifier(nickname);
            if let Some(existing) = cache.entries.get(&key) {
                warn!(
                    nickname,
                    kept_row = ?existing.row,
                    duplicate_row = position,
                    "duplicate profile row in sheet; keeping the first"
                );
                continue;
            }
            cache.entries.insert(key, decode_row(position, row));
        }
        debug!(profiles = cache.entries.len(), "identity cache loaded");
        cache
    }

    pub fn lookup(&self, identifier: &str) -> Option<&CacheEntry> {
        self.entries.get(&fold_identifier(identifier))
    }

    pub fn upsert(&mut self, identifier: &str, entry: CacheEntry) {
        self.entries.insert(fold_identifier(identifier), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 1-based position of the first row holding `identifier`, the same row
/// [`IdentityCache::load`] would keep.
pub fn locate_row(rows: &[Vec<String>], identifier: &str) -> Option<usize> {
    let key = fold_identifier(identifier);
    data_rows(rows)
        .find(|(_, nickname, _)| fold_identifier(nickname) == key)
        .map(|(position, _, _)| position)
}

/// Non-blank data rows with their 1-based positions and trimmed nicknames.
fn data_rows(rows: &[Vec<String>]) -> impl Iterator<Item = (usize, &str, &Vec<String>)> {
    rows.iter().enumerate().skip(1).filter_map(|(offset, row)| {
        let nickname = row.get(Column::NickName.index())?.trim();
        (!nickname.is_empty()).then_some((offset + 1, nickname, row))
    })
}

fn decode_row(position: usize, row: &[String]) -> CacheEntry {
    let mut values: Vec<String> = Column::ALL
        .iter()
        .map(|column| row.get(column.index()).cloned().unwrap_or_default())
        .collect();
    let mut links = BTreeMap::new();
    for column in Column::LINKS {
        let cell = decode_link_cell(&values[column.index()]);
        if let Some(url) = cell.url {
            links.insert(column, url);
        }
        values[column.index()] = cell.label;
    }
    CacheEntry {
        row: Some(position),
        values,
        links,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::profile_header;

    fn row(nickname: &str, city: &str) -> Vec<String> {
        let mut cells = vec![String::new(); Column::ALL.len()];
        cells[Column::NickName.index()] = nickname.to_string();
        cells[Column::City.index()] = city.to_string();
        cells
    }

    #[test]
    fn rows_are_keyed_case_insensitively_with_one_based_positions() {
        let rows = vec![profile_header(), row("Alice", "Lahore"), row("bob", "Karachi")];
        let cache = IdentityCache::load(&rows);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.lookup("ALICE").and_then(|e| e.row), Some(2));
        assert_eq!(cache.lookup(" Bob ").and_then(|e| e.row), Some(3));
        assert_eq!(cache.lookup("alice").unwrap().value(Column::City), "Lahore");
        assert!(cache.lookup("carol").is_none());
    }

    #[test]
    fn blank_and_duplicate_rows_are_skipped() {
        let rows = vec![
            profile_header(),
            row("", "Nowhere"),
            vec!["only-image".to_string()],
            row("Alice", "Lahore"),
            row("alice", "Quetta"),
        ];
        let cache = IdentityCache::load(&rows);
        assert_eq!(cache.len(), 1);
        let entry = cache.lookup("alice").unwrap();
        assert_eq!(entry.row, Some(4));
        assert_eq!(entry.value(Column::City), "Lahore");
        assert_eq!(locate_row(&rows, "ALICE"), Some(4));
        assert_eq!(locate_row(&rows, "carol"), None);
    }

    #[test]
    fn link_formulas_are_split_into_label_and_url() {
        let mut cells = row("Alice", "");
        cells[Column::Image.index()] = "=IMAGE(\"https://cdn/a.jpg\", 4, 50, 50)".to_string();
        cells[Column::ProfileLink.index()] = "=HYPERLINK(\"https://site/users/Alice/\", \"Profile\")".to_string();
        cells[Column::LastPost.index()] = "Post".to_string();
        let cache = IdentityCache::load(&[profile_header(), cells]);

        let entry = cache.lookup("alice").unwrap();
        assert_eq!(entry.value(Column::Image), "");
        assert_eq!(entry.link(Column::Image), Some("https://cdn/a.jpg"));
        assert_eq!(entry.value(Column::ProfileLink), "Profile");
        assert_eq!(entry.link(Column::ProfileLink), Some("https://site/users/Alice/"));
        assert_eq!(entry.value(Column::LastPost), "Post");
        assert_eq!(entry.link(Column::LastPost), None);
    }

    #[test]
    fn upsert_replaces_the_entry_in_place() {
        let mut cache = IdentityCache::load(&[profile_header(), row("Alice", "Lahore")]);
        let mut entry = cache.lookup("alice").cloned().unwrap();
        entry.values[Column::City.index()] = "Multan".to_string();
        cache.upsert("ALICE", entry);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup("Alice").unwrap().value(Column::City), "Multan");
    }
}
