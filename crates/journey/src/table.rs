//! Tabular touchpoint events as handed over by the ingestion layer.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use attribution_core::{AttributionError, EngineResult};

/// A column-oriented event table: named columns and positional rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl EventTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a table from JSON objects. Columns appear in the order they
    /// are first seen; keys missing from a record become nulls.
    pub fn from_records(records: &[Map<String, Value>]) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Appends a row; it must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> EngineResult<()> {
        if row.len() != self.columns.len() {
            return Err(AttributionError::Schema(format!(
                "row has {} values but the table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
