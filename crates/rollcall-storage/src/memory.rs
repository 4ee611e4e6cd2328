use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{CellFormat, CellRef, GridRange, StoreError, TableStore, ValueInput};

/// Process-local table store used by tests and offline runs. Cells are kept
/// exactly as written, so a formula written with `UserEntered` reads back as
/// its formula text.
#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sheets: BTreeMap<String, Vec<Vec<String>>>,
    formats: Vec<(String, GridRange)>,
    failures: VecDeque<StoreError>,
    mutations: usize,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, sheet: &str, rows: Vec<Vec<String>>) {
        self.state.lock().await.sheets.insert(sheet.to_string(), rows);
    }

    pub async fn rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .await
            .sheets
            .get(sheet)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue an error returned by the next call of any kind.
    pub async fn fail_next(&self, err: StoreError) {
        self.state.lock().await.failures.push_back(err);
    }

    /// Number of successful mutating calls (appends, updates, formats, sheet creation).
    pub async fn mutation_count(&self) -> usize {
        self.state.lock().await.mutations
    }

    pub async fn formatted_ranges(&self) -> Vec<(String, GridRange)> {
        self.state.lock().await.formats.clone()
    }
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), StoreError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn sheet_mut(&mut self, sheet: &str) -> Result<&mut Vec<Vec<String>>, StoreError> {
        self.sheets
            .get_mut(sheet)
            .ok_or_else(|| StoreError::SheetNotFound(sheet.to_string()))
    }
}

fn row_slot(rows: &mut Vec<Vec<String>>, row: usize) -> Result<&mut Vec<String>, StoreError> {
    if row == 0 {
        return Err(StoreError::Api {
            status: 400,
            message: "row positions are 1-based".to_string(),
        });
    }
    if rows.len() < row {
        rows.resize_with(row, Vec::new);
    }
    Ok(&mut rows[row - 1])
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    async fn sheet_names(&self) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.sheets.keys().cloned().collect())
    }

    async fn ensure_sheet(&self, sheet: &str, _rows: u32, _columns: u32) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        if state.sheets.contains_key(sheet) {
            return Ok(false);
        }
        state.sheets.insert(sheet.to_string(), Vec::new());
        state.mutations += 1;
        Ok(true)
    }

    async fn read_all(&self, sheet: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        Ok(state.sheet_mut(sheet)?.clone())
    }

    async fn append_row(&self, sheet: &str, values: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.sheet_mut(sheet)?.push(values.to_vec());
        state.mutations += 1;
        Ok(())
    }

    async fn update_row(&self, sheet: &str, row: usize, values: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let slot = row_slot(state.sheet_mut(sheet)?, row)?;
        if slot.len() < values.len() {
            slot.resize(values.len(), String::new());
        }
        slot[..values.len()].clone_from_slice(values);
        state.mutations += 1;
        Ok(())
    }

    async fn update_cell(
        &self,
        sheet: &str,
        cell: CellRef,
        value: &str,
        _input: ValueInput,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        let slot = row_slot(state.sheet_mut(sheet)?, cell.row)?;
        if slot.len() <= cell.column {
            slot.resize(cell.column + 1, String::new());
        }
        slot[cell.column] = value.to_string();
        state.mutations += 1;
        Ok(())
    }

    async fn format_range(
        &self,
        sheet: &str,
        range: GridRange,
        _format: &CellFormat,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_failure()?;
        state.sheet_mut(sheet)?;
        state.formats.push((sheet.to_string(), range));
        state.mutations += 1;
        Ok(())
    }
}
