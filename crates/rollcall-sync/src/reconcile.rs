//! Identity-preserving reconciliation of one normalized profile against the
//! cached `Profiles` table.
//!
//! The new/updated decision is made once from the cache before any write is
//! attempted, so a retried append can never produce a second row. Changed
//! rows are overwritten whole in one call; the link columns then receive
//! their presentation formulas cell by cell.
//!
//! An append whose position cannot be read back still enters the cache, with
//! no row. The next record for that identifier locates the row with one read
//! and never appends again.

use std::collections::BTreeMap;

use rollcall_core::{Column, ProfileRecord};
use rollcall_storage::{CellRef, ResilientWriter, ValueInput};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{locate_row, CacheEntry, IdentityCache};
use crate::formula::link_formula;
use crate::tags::TagIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    New,
    Updated,
    Unchanged,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub changed: Vec<Column>,
    pub row: Option<usize>,
    pub error: Option<String>,
}

impl Outcome {
    fn error(message: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Error,
            changed: Vec::new(),
            row: None,
            error: Some(message.into()),
        }
    }

    fn written(kind: OutcomeKind, row: usize, changed: Vec<Column>) -> Self {
        Self {
            kind,
            changed,
            row: Some(row),
            error: None,
        }
    }

    pub fn changed_headers(&self) -> Vec<&'static str> {
        self.changed.iter().map(|c| c.header()).collect()
    }
}

/// A record laid out in persisted column order. Link columns hold their
/// display label; the URLs travel separately to the formula step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedRow {
    pub values: Vec<String>,
    pub links: BTreeMap<Column, String>,
}

pub fn project(record: &ProfileRecord) -> ProjectedRow {
    let mut links = BTreeMap::new();
    let values = Column::ALL
        .iter()
        .map(|&column| {
            let value = record.value(column).trim();
            if !column.is_link() {
                return value.to_string();
            }
            if value.is_empty() {
                return String::new();
            }
            links.insert(column, value.to_string());
            column.link_label().to_string()
        })
        .collect();
    ProjectedRow { values, links }
}

/// Columns whose trimmed display value differs, plus link columns whose
/// known stored URL differs from the new one.
pub fn changed_columns(entry: &CacheEntry, projected: &ProjectedRow) -> Vec<Column> {
    Column::ALL
        .into_iter()
        .filter(|&column| {
            let new_value = projected.values[column.index()].trim();
            if entry.value(column).trim() != new_value {
                return true;
            }
            match entry.link(column) {
                Some(stored) if column.is_link() => {
                    let new_url = projected.links.get(&column).map(String::as_str).unwrap_or_default();
                    stored.trim() != new_url.trim()
                }
                _ => false,
            }
        })
        .collect()
}

pub struct Reconciler {
    writer: ResilientWriter,
    sheet: String,
}

impl Reconciler {
    pub fn new(writer: ResilientWriter, sheet: impl Into<String>) -> Self {
        Self {
            writer,
            sheet: sheet.into(),
        }
    }

    pub async fn reconcile(
        &self,
        mut record: ProfileRecord,
        cache: &mut IdentityCache,
        tags: &TagIndex,
    ) -> Outcome {
        let nickname = record.nickname.trim().to_string();
        if nickname.is_empty() {
            return Outcome::error("record has no nickname");
        }
        record.tags = tags.lookup(&nickname);
        let projected = project(&record);

        let Some(entry) = cache.lookup(&nickname) else {
            return self.insert(&nickname, projected, cache).await;
        };
        let changed = changed_columns(entry, &projected);
        let row = entry.row;
        match row {
            Some(row) if changed.is_empty() => Outcome {
                kind: OutcomeKind::Unchanged,
                changed,
                row: Some(row),
                error: None,
            },
            Some(row) => self.overwrite(&nickname, row, projected, changed, cache).await,
            None => self.settle_pending(&nickname, projected, changed, cache).await,
        }
    }

    async fn insert(&self, nickname: &str, projected: ProjectedRow, cache: &mut IdentityCache) -> Outcome {
        if self.writer.append_row(&self.sheet, &projected.values).await.is_none() {
            return Outcome::error("append failed");
        }
        let Some(rows) = self.writer.read_all(&self.sheet).await else {
            warn!(nickname, "profile appended but its row is unknown; link formulas deferred");
            cache.upsert(
                nickname,
                CacheEntry {
                    row: None,
                    values: projected.values,
                    links: BTreeMap::new(),
                },
            );
            return Outcome {
                kind: OutcomeKind::New,
                changed: Column::ALL.to_vec(),
                row: None,
                error: None,
            };
        };
        let row = rows.len();
        debug!(nickname, row, "profile appended");

        let links = self.write_links(row, &projected.links).await;
        cache.upsert(
            nickname,
            CacheEntry {
                row: Some(row),
                values: projected.values,
                links,
            },
        );
        Outcome::written(OutcomeKind::New, row, Column::ALL.to_vec())
    }

    /// Find the row of an earlier append whose position never came back. The
    /// deferred link formulas are written here even when nothing else changed.
    async fn settle_pending(
        &self,
        nickname: &str,
        projected: ProjectedRow,
        changed: Vec<Column>,
        cache: &mut IdentityCache,
    ) -> Outcome {
        let Some(rows) = self.writer.read_all(&self.sheet).await else {
            return Outcome::error("row position still unknown");
        };
        let Some(row) = locate_row(&rows, nickname) else {
            return Outcome::error("appended row not found in sheet");
        };
        debug!(nickname, row, "pending profile row located");
        if !changed.is_empty() {
            return self.overwrite(nickname, row, projected, changed, cache).await;
        }

        let links = self.write_links(row, &projected.links).await;
        cache.upsert(
            nickname,
            CacheEntry {
                row: Some(row),
                values: projected.values,
                links,
            },
        );
        Outcome::written(OutcomeKind::Unchanged, row, changed)
    }

    async fn overwrite(
        &self,
        nickname: &str,
        row: usize,
        projected: ProjectedRow,
        changed: Vec<Column>,
        cache: &mut IdentityCache,
    ) -> Outcome {
        if self
            .writer
            .update_row(&self.sheet, row, &projected.values)
            .await
            .is_none()
        {
            return Outcome::error(format!("update of row {row} failed"));
        }
        debug!(nickname, row, changed = changed.len(), "profile row overwritten");

        let links = self.write_links(row, &projected.links).await;
        cache.upsert(
            nickname,
            CacheEntry {
                row: Some(row),
                values: projected.values,
                links,
            },
        );
        Outcome::written(OutcomeKind::Updated, row, changed)
    }

    /// One formula write per populated link. Failures are logged and skipped;
    /// only successfully written URLs are returned.
    async fn write_links(&self, row: usize, links: &BTreeMap<Column, String>) -> BTreeMap<Column, String> {
        let mut written = BTreeMap::new();
        for (&column, url) in links {
            let Some(formula) = link_formula(column, url) else {
                continue;
            };
            let cell = CellRef::new(row, column.index());
            match self
                .writer
                .update_cell(&self.sheet, cell, &formula, ValueInput::UserEntered)
                .await
            {
                Some(()) => {
                    written.insert(column, url.clone());
                }
                None => warn!(row, column = column.header(), "link formula skipped"),
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use rollcall_core::{profile_header, FriendFlag, ProfileStatus};
    use rollcall_storage::{
        CellFormat, GridRange, InMemoryTableStore, RetryPolicy, StoreError, TableStore,
    };

    const SHEET: &str = "Profiles";

    fn record(nickname: &str) -> ProfileRecord {
        ProfileRecord {
            nickname: nickname.to_string(),
            image_url: "https://cdn/a.jpg".to_string(),
            city: "Lahore".to_string(),
            gender: "💃".to_string(),
            friend: FriendFlag::No,
            status: ProfileStatus::Verified,
            posts: "3".to_string(),
            profile_url: format!("https://site/users/{nickname}/"),
            source: "Online".to_string(),
            scraped_at: "15-Jun-24 02:05 PM".to_string(),
            ..Default::default()
        }
    }

    async fn setup() -> (Arc<InMemoryTableStore>, Reconciler, IdentityCache) {
        let store = Arc::new(InMemoryTableStore::new());
        store.seed(SHEET, vec![profile_header()]).await;
        let writer = ResilientWriter::new(store.clone(), RetryPolicy::immediate());
        let cache = IdentityCache::load(&store.rows(SHEET).await);
        (store, Reconciler::new(writer, SHEET), cache)
    }

    /// In-memory table whose reads fail for a while right after the first
    /// append lands.
    struct ReadsLagFirstAppend {
        inner: InMemoryTableStore,
        armed: AtomicBool,
        failing_reads: usize,
        blind: AtomicUsize,
    }

    impl ReadsLagFirstAppend {
        async fn new(failing_reads: usize) -> Arc<Self> {
            let inner = InMemoryTableStore::new();
            inner.seed(SHEET, vec![profile_header()]).await;
            Arc::new(Self {
                inner,
                armed: AtomicBool::new(true),
                failing_reads,
                blind: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TableStore for ReadsLagFirstAppend {
        async fn sheet_names(&self) -> Result<Vec<String>, StoreError> {
            self.inner.sheet_names().await
        }

        async fn ensure_sheet(&self, sheet: &str, rows: u32, columns: u32) -> Result<bool, StoreError> {
            self.inner.ensure_sheet(sheet, rows, columns).await
        }

        async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
            if self.blind.load(Ordering::SeqCst) > 0 {
                self.blind.fetch_sub(1, Ordering::SeqCst);
                return Err(StoreError::Transport("read timed out".into()));
            }
            self.inner.read_all(sheet).await
        }

        async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), StoreError> {
            self.inner.append_row(sheet, values).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.blind.store(self.failing_reads, Ordering::SeqCst);
            }
            Ok(())
        }

        async fn update_row(&self, sheet: &str, row: usize, values: &[String]) -> Result<(), StoreError> {
            self.inner.update_row(sheet, row, values).await
        }

        async fn update_cell(
            &self,
            sheet: &str,
            cell: CellRef,
            value: &str,
            input: ValueInput,
        ) -> Result<(), StoreError> {
            self.inner.update_cell(sheet, cell, value, input).await
        }

        async fn format_range(
            &self,
            sheet: &str,
            range: GridRange,
            format: &CellFormat,
        ) -> Result<(), StoreError> {
            self.inner.format_range(sheet, range, format).await
        }
    }

    fn lagging_reconciler(store: &Arc<ReadsLagFirstAppend>) -> Reconciler {
        Reconciler::new(ResilientWriter::new(store.clone(), RetryPolicy::immediate()), SHEET)
    }

    #[test]
    fn projection_replaces_urls_with_labels() {
        let mut rec = record("alice");
        rec.last_post_url = "https://site/p/1".to_string();
        let projected = project(&rec);
        assert_eq!(projected.values[Column::Image.index()], "");
        assert_eq!(projected.values[Column::LastPost.index()], "Post");
        assert_eq!(projected.values[Column::ProfileLink.index()], "Profile");
        assert_eq!(projected.values[Column::City.index()], "Lahore");
        assert_eq!(projected.values[Column::Status.index()], "Verified");
        assert_eq!(projected.links.len(), 3);
    }

    #[tokio::test]
    async fn new_row_takes_position_from_the_store() {
        let (store, reconciler, mut cache) = setup().await;
        store
            .append_row(SHEET, &["".to_string(), "stray".to_string()])
            .await
            .unwrap();

        let outcome = reconciler.reconcile(record("alice"), &mut cache, &TagIndex::default()).await;
        assert_eq!(outcome.kind, OutcomeKind::New);
        assert_eq!(outcome.row, Some(3));
        assert_eq!(outcome.changed.len(), Column::ALL.len());
        assert_eq!(cache.lookup("ALICE").unwrap().row, Some(3));

        let rows = store.rows(SHEET).await;
        assert_eq!(rows[2][Column::NickName.index()], "alice");
        assert_eq!(
            rows[2][Column::ProfileLink.index()],
            "=HYPERLINK(\"https://site/users/alice/\", \"Profile\")"
        );
        assert_eq!(rows[2][Column::Image.index()], "=IMAGE(\"https://cdn/a.jpg\", 4, 50, 50)");
    }

    #[tokio::test]
    async fn second_identical_record_is_unchanged_without_writes() {
        let (store, reconciler, mut cache) = setup().await;
        let tags = TagIndex::default();
        assert_eq!(reconciler.reconcile(record("alice"), &mut cache, &tags).await.kind, OutcomeKind::New);
        let writes = store.mutation_count().await;

        let again = reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(again.kind, OutcomeKind::Unchanged);
        assert!(again.changed.is_empty());
        assert_eq!(store.mutation_count().await, writes);
    }

    #[tokio::test]
    async fn case_variant_nickname_targets_the_same_row() {
        let (store, reconciler, mut cache) = setup().await;
        let tags = TagIndex::default();
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;

        let mut variant = record("ALICE");
        variant.profile_url = record("alice").profile_url;
        let outcome = reconciler.reconcile(variant, &mut cache, &tags).await;
        assert_eq!(outcome.kind, OutcomeKind::Updated);
        assert_eq!(outcome.row, Some(2));
        assert_eq!(outcome.changed, vec![Column::NickName]);
        assert_eq!(store.rows(SHEET).await.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn update_reports_exactly_the_differing_columns() {
        let (store, reconciler, mut cache) = setup().await;
        let tags = TagIndex::default();
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;

        let mut changed = record("alice");
        changed.city = "Quetta".to_string();
        changed.posts = "4".to_string();
        let outcome = reconciler.reconcile(changed, &mut cache, &tags).await;
        assert_eq!(outcome.kind, OutcomeKind::Updated);
        assert_eq!(outcome.changed, vec![Column::City, Column::Posts]);
        assert_eq!(outcome.changed_headers(), vec!["CITY", "POSTS"]);

        let rows = store.rows(SHEET).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][Column::City.index()], "Quetta");
    }

    #[tokio::test]
    async fn url_change_behind_an_identical_label_is_detected() {
        let (_store, reconciler, mut cache) = setup().await;
        let tags = TagIndex::default();
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;

        let mut moved = record("alice");
        moved.image_url = "https://cdn/b.jpg".to_string();
        let outcome = reconciler.reconcile(moved, &mut cache, &tags).await;
        assert_eq!(outcome.kind, OutcomeKind::Updated);
        assert_eq!(outcome.changed, vec![Column::Image]);
    }

    #[tokio::test]
    async fn tags_are_attached_before_comparison() {
        let (store, reconciler, mut cache) = setup().await;
        let tags = TagIndex::from_rows(&[vec!["VIP".to_string()], vec!["ALICE".to_string()]]);
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(store.rows(SHEET).await[1][Column::Tags.index()], "VIP");
    }

    #[tokio::test]
    async fn missing_nickname_is_an_error_without_writes() {
        let (store, reconciler, mut cache) = setup().await;
        let outcome = reconciler.reconcile(record("   "), &mut cache, &TagIndex::default()).await;
        assert_eq!(outcome.kind, OutcomeKind::Error);
        assert_eq!(store.mutation_count().await, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_append_leaves_cache_untouched() {
        let (store, reconciler, mut cache) = setup().await;
        for _ in 0..3 {
            store.fail_next(StoreError::Transport("reset".into())).await;
        }
        let outcome = reconciler.reconcile(record("alice"), &mut cache, &TagIndex::default()).await;
        assert_eq!(outcome.kind, OutcomeKind::Error);
        assert!(cache.lookup("alice").is_none());
        assert_eq!(store.rows(SHEET).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_position_after_append_never_appends_twice() {
        let store = ReadsLagFirstAppend::new(3).await;
        let reconciler = lagging_reconciler(&store);
        let mut cache = IdentityCache::default();
        let tags = TagIndex::default();

        let first = reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(first.kind, OutcomeKind::New);
        assert_eq!(first.row, None);
        assert_eq!(cache.lookup("alice").map(|e| e.row), Some(None));

        let second = reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(second.kind, OutcomeKind::Unchanged);
        assert_eq!(second.row, Some(2));

        let rows = store.inner.rows(SHEET).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[1][Column::ProfileLink.index()],
            "=HYPERLINK(\"https://site/users/alice/\", \"Profile\")"
        );
        let entry = cache.lookup("alice").unwrap();
        assert_eq!(entry.row, Some(2));
        assert_eq!(entry.link(Column::ProfileLink), Some("https://site/users/alice/"));
    }

    #[tokio::test]
    async fn pending_row_with_changes_is_overwritten_in_place() {
        let store = ReadsLagFirstAppend::new(3).await;
        let reconciler = lagging_reconciler(&store);
        let mut cache = IdentityCache::default();
        let tags = TagIndex::default();
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;

        let mut moved = record("ALICE");
        moved.city = "Quetta".to_string();
        let outcome = reconciler.reconcile(moved, &mut cache, &tags).await;
        assert_eq!(outcome.kind, OutcomeKind::Updated);
        assert_eq!(outcome.row, Some(2));
        assert!(outcome.changed.contains(&Column::City));

        let rows = store.inner.rows(SHEET).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][Column::City.index()], "Quetta");
    }

    #[tokio::test]
    async fn pending_row_that_stays_unreadable_is_an_error_not_a_new_row() {
        let store = ReadsLagFirstAppend::new(6).await;
        let reconciler = lagging_reconciler(&store);
        let mut cache = IdentityCache::default();
        let tags = TagIndex::default();
        reconciler.reconcile(record("alice"), &mut cache, &tags).await;

        let second = reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(second.kind, OutcomeKind::Error);
        assert_eq!(store.inner.rows(SHEET).await.len(), 2);
        assert_eq!(cache.lookup("alice").map(|e| e.row), Some(None));

        let third = reconciler.reconcile(record("alice"), &mut cache, &tags).await;
        assert_eq!(third.row, Some(2));
        assert_eq!(store.inner.rows(SHEET).await.len(), 2);
    }

    #[tokio::test]
    async fn failed_formula_write_is_skipped_and_the_url_forgotten() {
        let (store, reconciler, _cache) = setup().await;
        store.append_row(SHEET, &["".to_string(), "alice".to_string()]).await.unwrap();

        let mut links = BTreeMap::new();
        links.insert(Column::ProfileLink, "https://site/users/alice/".to_string());
        links.insert(Column::LastPost, "https://site/p/1".to_string());
        // LAST POST comes first in column order and exhausts its three attempts
        for _ in 0..3 {
            store
                .fail_next(StoreError::Api {
                    status: 400,
                    message: "bad formula".into(),
                })
                .await;
        }
        let written = reconciler.write_links(2, &links).await;

        assert_eq!(written.len(), 1);
        assert_eq!(written.get(&Column::LastPost), None);
        assert!(written.contains_key(&Column::ProfileLink));
        let row = &store.rows(SHEET).await[1];
        assert_eq!(
            row[Column::ProfileLink.index()],
            "=HYPERLINK(\"https://site/users/alice/\", \"Profile\")"
        );
        assert!(row.get(Column::LastPost.index()).map_or(true, |c| c.is_empty()));
    }
}
