use rollcall_core::{profile_header, DASHBOARD_HEADER, ONLINE_LOG_HEADER};
use rollcall_storage::{CellFormat, GridRange, ResilientWriter};
use tracing::{info, warn};

use crate::tags::TagIndex;
use crate::SyncError;

pub const PROFILES_SHEET: &str = "Profiles";
pub const ONLINE_SHEET: &str = "Online Status";
pub const DASHBOARD_SHEET: &str = "Dashboard";
pub const TAGS_SHEET: &str = "Tags";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetSpec {
    pub name: &'static str,
    pub rows: u32,
    pub columns: u32,
    pub header: Vec<String>,
}

impl SheetSpec {
    pub fn profiles() -> Self {
        let header = profile_header();
        Self {
            name: PROFILES_SHEET,
            rows: 1000,
            columns: header.len() as u32,
            header,
        }
    }

    pub fn online_status() -> Self {
        Self {
            name: ONLINE_SHEET,
            rows: 5000,
            columns: ONLINE_LOG_HEADER.len() as u32,
            header: ONLINE_LOG_HEADER.iter().map(|h| h.to_string()).collect(),
        }
    }

    pub fn dashboard() -> Self {
        Self {
            name: DASHBOARD_SHEET,
            rows: 100,
            columns: DASHBOARD_HEADER.len() as u32,
            header: DASHBOARD_HEADER.iter().map(|h| h.to_string()).collect(),
        }
    }
}

fn header_matches(actual: &[String], expected: &[String]) -> bool {
    let mut actual: Vec<&str> = actual.iter().map(|c| c.trim()).collect();
    while actual.last().is_some_and(|c| c.is_empty()) {
        actual.pop();
    }
    actual.len() == expected.len() && actual.iter().zip(expected).all(|(a, e)| *a == e.as_str())
}

/// Make sure the sheet exists with the expected header in row 1 and return
/// its full contents (header included). A missing or mismatched header is
/// (re)written and formatted.
pub async fn prepare_table(
    writer: &ResilientWriter,
    spec: &SheetSpec,
) -> Result<Vec<Vec<String>>, SyncError> {
    let created = writer
        .ensure_sheet(spec.name, spec.rows, spec.columns)
        .await
        .ok_or_else(|| SyncError::Setup(format!("could not open or create sheet {}", spec.name)))?;
    if created {
        info!(sheet = spec.name, "sheet created");
    }

    let mut rows = writer
        .read_all(spec.name)
        .await
        .ok_or_else(|| SyncError::Setup(format!("could not read sheet {}", spec.name)))?;

    let header_written = match rows.first() {
        None => writer.append_row(spec.name, &spec.header).await.map(|_| true),
        Some(existing) if !header_matches(existing, &spec.header) => {
            warn!(sheet = spec.name, "header mismatch; rewriting row 1");
            writer.update_row(spec.name, 1, &spec.header).await.map(|_| true)
        }
        Some(_) => Some(false),
    }
    .ok_or_else(|| SyncError::Setup(format!("could not write header of sheet {}", spec.name)))?;

    if header_written {
        let range = GridRange::row(1, spec.header.len());
        if writer
            .format_range(spec.name, range, &CellFormat::header())
            .await
            .is_none()
        {
            warn!(sheet = spec.name, "header formatting skipped");
        }
        match rows.first_mut() {
            Some(first) => *first = spec.header.clone(),
            None => rows.push(spec.header.clone()),
        }
    }
    Ok(rows)
}

/// Next run sequence number: existing dashboard data rows + 1.
pub fn run_number(dashboard_rows: &[Vec<String>]) -> u32 {
    let data_rows = dashboard_rows
        .iter()
        .skip(1)
        .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
        .count();
    u32::try_from(data_rows).unwrap_or(u32::MAX - 1) + 1
}

/// The `Tags` side table is optional and read-only; when it is absent or
/// unreadable the index is empty.
pub async fn load_tags(writer: &ResilientWriter) -> TagIndex {
    let Some(names) = writer.sheet_names().await else {
        warn!("sheet list unavailable; continuing without tags");
        return TagIndex::default();
    };
    if !names.iter().any(|name| name == TAGS_SHEET) {
        return TagIndex::default();
    }
    match writer.read_all(TAGS_SHEET).await {
        Some(rows) => {
            let index = TagIndex::from_rows(&rows);
            info!(tagged = index.len(), "tags loaded");
            index
        }
        None => {
            warn!("tags sheet unreadable; continuing without tags");
            TagIndex::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rollcall_storage::{InMemoryTableStore, RetryPolicy, StoreError};

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn writer(store: &Arc<InMemoryTableStore>) -> ResilientWriter {
        ResilientWriter::new(store.clone(), RetryPolicy::immediate())
    }

    #[tokio::test]
    async fn missing_sheet_is_created_with_formatted_header() {
        let store = Arc::new(InMemoryTableStore::new());
        let rows = prepare_table(&writer(&store), &SheetSpec::online_status())
            .await
            .unwrap();
        assert_eq!(rows, vec![strings(&["Nickname", "Status", "Timestamp"])]);
        assert_eq!(store.rows(ONLINE_SHEET).await, rows);
        assert_eq!(
            store.formatted_ranges().await,
            vec![(ONLINE_SHEET.to_string(), GridRange::row(1, 3))]
        );
    }

    #[tokio::test]
    async fn matching_header_is_left_alone() {
        let store = Arc::new(InMemoryTableStore::new());
        let spec = SheetSpec::dashboard();
        store
            .seed(DASHBOARD_SHEET, vec![spec.header.clone(), strings(&["1", "x"])])
            .await;
        let before = store.mutation_count().await;
        let rows = prepare_table(&writer(&store), &spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(store.mutation_count().await, before);
        assert_eq!(run_number(&rows), 2);
    }

    #[tokio::test]
    async fn mismatched_header_is_overwritten_in_place() {
        let store = Arc::new(InMemoryTableStore::new());
        let spec = SheetSpec::profiles();
        store
            .seed(PROFILES_SHEET, vec![strings(&["IMAGE", "NICK"]), strings(&["", "alice"])])
            .await;
        let rows = prepare_table(&writer(&store), &spec).await.unwrap();
        assert_eq!(rows[0], spec.header);
        assert_eq!(rows[1], strings(&["", "alice"]));
        assert_eq!(store.rows(PROFILES_SHEET).await[0], spec.header);
    }

    #[tokio::test]
    async fn unreadable_sheet_is_a_setup_error() {
        let store = Arc::new(InMemoryTableStore::new());
        store.seed(PROFILES_SHEET, Vec::new()).await;
        for _ in 0..4 {
            store
                .fail_next(StoreError::Api {
                    status: 500,
                    message: "backend".into(),
                })
                .await;
        }
        let err = prepare_table(&writer(&store), &SheetSpec::profiles())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Setup(_)));
    }

    #[tokio::test]
    async fn tags_are_optional() {
        let store = Arc::new(InMemoryTableStore::new());
        assert!(load_tags(&writer(&store)).await.is_empty());

        store
            .seed(TAGS_SHEET, vec![strings(&["VIP"]), strings(&["alice"])])
            .await;
        assert_eq!(load_tags(&writer(&store)).await.lookup("ALICE"), "VIP");
    }

    #[test]
    fn run_number_counts_non_blank_data_rows() {
        assert_eq!(run_number(&[]), 1);
        assert_eq!(run_number(&[strings(&["Run#"])]), 1);
        assert_eq!(
            run_number(&[strings(&["Run#"]), strings(&["1"]), strings(&["", " "]), strings(&["2"])]),
            3
        );
    }
}
