//! Read-only tabular datasets handed to submissions
//!
//! A [`DatasetHandle`] is a cheap, shareable reference to an immutable
//! [`Dataset`]. Each run receives its own serialized snapshot; nothing a run
//! does can reach the caller's copy.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::DatasetError;

/// A single JSON-like cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<serde_json::Value> for Cell {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Cell::Null,
            serde_json::Value::Bool(b) => Cell::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => n.as_f64().map(Cell::Float).unwrap_or(Cell::Null),
            },
            serde_json::Value::String(s) => Cell::Text(s),
            nested => Cell::Text(nested.to_string()),
        }
    }
}

/// Immutable table of rows with named columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

/// Accepted JSON shapes for datasets.
#[derive(Deserialize)]
#[serde(untagged)]
enum DatasetFile {
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    },
    Records(Vec<serde_json::Map<String, serde_json::Value>>),
}

impl Dataset {
    /// Build a dataset, checking that every row matches the column count.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self, DatasetError> {
        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.as_str()) {
                return Err(DatasetError::DuplicateColumn(column.clone()));
            }
        }

        for (index, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(DatasetError::RaggedRow {
                    row: index,
                    expected: columns.len(),
                    found: row.len(),
                });
            }
        }

        Ok(Self { columns, rows })
    }

    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Build from an array of records. Columns appear in first-seen order;
    /// missing keys become nulls.
    pub fn from_records(
        records: Vec<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Self, DatasetError> {
        let mut columns: Vec<String> = Vec::new();
        for record in &records {
            for key in record.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .into_iter()
            .map(|mut record| {
                columns
                    .iter()
                    .map(|column| record.remove(column).map(Cell::from).unwrap_or(Cell::Null))
                    .collect()
            })
            .collect();

        Self::new(columns, rows)
    }

    /// Parse `{"columns": [...], "rows": [[...]]}` or `[{...}, ...]`.
    pub fn from_json_str(json: &str) -> Result<Self, DatasetError> {
        let file: DatasetFile =
            serde_json::from_str(json).map_err(|e| DatasetError::Parse(e.to_string()))?;

        match file {
            DatasetFile::Table { columns, rows } => Self::new(columns, rows),
            DatasetFile::Records(records) => Self::from_records(records),
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DatasetError::Io(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&content)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    /// Canonical byte serialization used for fingerprints and snapshots.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Columns are strings and cells are scalars, so this cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Shared, read-only reference to a dataset.
#[derive(Debug, Clone)]
pub struct DatasetHandle {
    inner: Arc<Dataset>,
}

impl DatasetHandle {
    pub fn new(dataset: Dataset) -> Self {
        Self {
            inner: Arc::new(dataset),
        }
    }

    pub fn dataset(&self) -> &Dataset {
        &self.inner
    }

    /// Hex SHA-256 over the canonical serialization.
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.inner.canonical_bytes()))
    }

    /// An independent serialized copy for one run.
    pub fn snapshot(&self) -> DatasetSnapshot {
        DatasetSnapshot {
            bytes: self.inner.canonical_bytes(),
        }
    }
}

impl From<Dataset> for DatasetHandle {
    fn from(dataset: Dataset) -> Self {
        Self::new(dataset)
    }
}

/// Serialized dataset owned by exactly one run payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSnapshot {
    bytes: Vec<u8>,
}

impl DatasetSnapshot {
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.bytes))
    }

    /// Embed as a raw JSON value inside a larger payload.
    pub fn to_json_value(&self) -> Result<serde_json::Value, DatasetError> {
        serde_json::from_slice(&self.bytes).map_err(|e| DatasetError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new(
            vec!["player".into(), "goals".into(), "xg".into()],
            vec![
                vec![Cell::Text("Saka".into()), Cell::Int(14), Cell::Float(11.2)],
                vec![Cell::Text("Palmer".into()), Cell::Int(22), Cell::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_ragged_rows_are_rejected() {
        let err = Dataset::new(vec!["a".into(), "b".into()], vec![vec![Cell::Int(1)]]).unwrap_err();
        assert_eq!(
            err,
            DatasetError::RaggedRow {
                row: 0,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_duplicate_columns_are_rejected() {
        let err = Dataset::new(vec!["a".into(), "a".into()], vec![]).unwrap_err();
        assert_eq!(err, DatasetError::DuplicateColumn("a".into()));
    }

    #[test]
    fn test_table_and_records_forms_agree() {
        let table = Dataset::from_json_str(
            r#"{"columns": ["player", "goals"], "rows": [["Saka", 14], ["Palmer", 22]]}"#,
        )
        .unwrap();
        let records = Dataset::from_json_str(
            r#"[{"player": "Saka", "goals": 14}, {"player": "Palmer", "goals": 22}]"#,
        )
        .unwrap();
        assert_eq!(table, records);
    }

    #[test]
    fn test_records_fill_missing_keys_with_null() {
        let dataset =
            Dataset::from_json_str(r#"[{"a": 1}, {"b": true}]"#).unwrap();
        assert_eq!(dataset.columns(), &["a".to_string(), "b".to_string()]);
        assert_eq!(dataset.rows()[0], vec![Cell::Int(1), Cell::Null]);
        assert_eq!(dataset.rows()[1], vec![Cell::Null, Cell::Bool(true)]);
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = DatasetHandle::new(sample());
        let b = DatasetHandle::new(sample());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.snapshot().fingerprint());

        let other = DatasetHandle::new(Dataset::empty());
        assert_ne!(a.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_snapshot_round_trips_as_json() {
        let handle = DatasetHandle::new(sample());
        let value = handle.snapshot().to_json_value().unwrap();
        assert_eq!(value["columns"][1], serde_json::json!("goals"));
        assert_eq!(value["rows"][1][1], serde_json::json!(22));
    }
}
