use std::collections::HashMap;

use rollcall_core::fold_identifier;

/// Identifier -> labels, derived from a side table where each column header
/// is a label and the cells below it list member nicknames.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    labels: HashMap<String, Vec<String>>,
}

impl TagIndex {
    pub fn from_rows(rows: &[Vec<String>]) -> Self {
        let mut index = Self::default();
        let Some((header, members)) = rows.split_first() else {
            return index;
        };
        for (column, label) in header.iter().enumerate() {
            let label = label.trim();
            if label.is_empty() {
                continue;
            }
            for row in members {
                let Some(nickname) = row.get(column).map(|cell| cell.trim()) else {
                    continue;
                };
                if nickname.is_empty() {
                    continue;
                }
                let entry = index.labels.entry(fold_identifier(nickname)).or_default();
                if !entry.iter().any(|existing| existing == label) {
                    entry.push(label.to_string());
                }
            }
        }
        index
    }

    /// Comma-joined labels in header order, or empty when untagged.
    pub fn lookup(&self, identifier: &str) -> String {
        self.labels
            .get(&fold_identifier(identifier))
            .map(|labels| labels.join(", "))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
