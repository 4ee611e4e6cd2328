//! Tabular store seam, its in-memory and Sheets-over-HTTP implementations,
//! the retrying writer every mutation goes through, and the page fetcher.

mod fetch;
mod memory;
mod sheets;
mod writer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fetch::{
    is_transient_error, is_transient_status, FetchError, Page, PageClientConfig, PageFetcher,
    PageRetry,
};
pub use memory::InMemoryTableStore;
pub use sheets::{spreadsheet_id_from_url, SheetsConfig, SheetsTableStore};
pub use writer::{ResilientWriter, RetryPolicy};

pub const CRATE_NAME: &str = "rollcall-storage";

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("quota exceeded (429): {0}")]
    Quota(String),
    #[error("table api status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sheet not found: {0}")]
    SheetNotFound(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignature {
    Quota,
    Other,
}

/// Quota errors are recognized by signature, since transports surface
/// throttling differently (status code, message text, or both).
pub fn classify_store_error(err: &StoreError) -> ErrorSignature {
    if matches!(err, StoreError::Quota(_)) {
        return ErrorSignature::Quota;
    }
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("429") || text.contains("quota") {
        ErrorSignature::Quota
    } else {
        ErrorSignature::Other
    }
}

/// How a written cell value is interpreted by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueInput {
    Raw,
    /// Parsed as if typed by a user, so `=FORMULA(...)` is evaluated.
    UserEntered,
}

/// Single cell address: 1-based row, 0-based column offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    pub row: usize,
    pub column: usize,
}

impl CellRef {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }

    pub fn a1(&self) -> String {
        format!("{}{}", column_letter(self.column), self.row)
    }
}

/// Inclusive rectangle: 1-based rows, 0-based columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridRange {
    pub first_row: usize,
    pub last_row: usize,
    pub first_column: usize,
    pub last_column: usize,
}

impl GridRange {
    pub fn row(row: usize, width: usize) -> Self {
        Self {
            first_row: row,
            last_row: row,
            first_column: 0,
            last_column: width.saturating_sub(1),
        }
    }

    pub fn a1(&self) -> String {
        format!(
            "{}{}:{}{}",
            column_letter(self.first_column),
            self.first_row,
            column_letter(self.last_column),
            self.last_row
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFormat {
    pub bold: bool,
    pub font_size: u32,
    pub font_family: Option<String>,
    pub centered: bool,
    pub background: Option<[f32; 3]>,
}

impl CellFormat {
    pub fn header() -> Self {
        Self {
            bold: true,
            font_size: 9,
            font_family: Some("Bona Nova SC".to_string()),
            centered: true,
            background: Some([0.9, 0.9, 0.9]),
        }
    }
}

/// Spreadsheet letters for a 0-based column offset: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letter(index: usize) -> String {
    let mut out = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        out.push(char::from(b'A' + (n % 26) as u8));
        n /= 26;
    }
    out.iter().rev().collect()
}

/// Quote a sheet title for use in an A1 range.
pub fn quoted_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

/// Row-oriented remote table. Rows are 1-based with row 1 reserved for the
/// header; every call may fail with a transient quota error.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn sheet_names(&self) -> Result<Vec<String>, StoreError>;

    /// Create the sheet when it does not exist. Returns true when created.
    async fn ensure_sheet(&self, sheet: &str, rows: u32, columns: u32) -> Result<bool, StoreError>;

    /// Header row plus all data rows. Formula cells come back as formula text.
    async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError>;

    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), StoreError>;

    /// Overwrite `values.len()` cells of `row` starting at column A, in one call.
    async fn update_row(&self, sheet: &str, row: usize, values: &[String]) -> Result<(), StoreError>;

    async fn update_cell(
        &self,
        sheet: &str,
        cell: CellRef,
        value: &str,
        input: ValueInput,
    ) -> Result<(), StoreError>;

    async fn format_range(
        &self,
        sheet: &str,
        range: GridRange,
        format: &CellFormat,
    ) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_follow_spreadsheet_convention() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(17), "R");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
    }

    #[test]
    fn a1_addresses_render() {
        assert_eq!(CellRef::new(5, 14).a1(), "O5");
        assert_eq!(GridRange::row(12, 18).a1(), "A12:R12");
        assert_eq!(quoted_sheet("Online Status"), "'Online Status'");
        assert_eq!(quoted_sheet("Bob's"), "'Bob''s'");
    }

    #[test]
    fn quota_is_detected_by_signature() {
        assert_eq!(
            classify_store_error(&StoreError::Quota("slow down".into())),
            ErrorSignature::Quota
        );
        assert_eq!(
            classify_store_error(&StoreError::Api {
                status: 403,
                message: "Quota exceeded for quota metric 'Write requests'".into(),
            }),
            ErrorSignature::Quota
        );
        assert_eq!(
            classify_store_error(&StoreError::Transport("upstream said 429".into())),
            ErrorSignature::Quota
        );
        assert_eq!(
            classify_store_error(&StoreError::Api {
                status: 400,
                message: "Invalid range".into(),
            }),
            ErrorSignature::Other
        );
    }
}
