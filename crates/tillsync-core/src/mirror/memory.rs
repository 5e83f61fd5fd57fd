//! In-process spreadsheet used by tests and offline runs.
//!
//! Cells are stored as written. Reads return them the way the real service
//! does with `FORMATTED_VALUE`: every non-empty cell as a string, trailing
//! empty cells and rows dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use super::SheetsTransport;
use crate::codec;
use crate::error::{MirrorError, Result};

/// Transport operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    ListTables,
    AddTable,
    ReadHeader,
    ReadRows,
    WriteHeader,
    AppendRows,
    Clear,
    WriteRows,
}

impl MemoryOp {
    const ALL: [Self; 8] = [
        Self::ListTables,
        Self::AddTable,
        Self::ReadHeader,
        Self::ReadRows,
        Self::WriteHeader,
        Self::AppendRows,
        Self::Clear,
        Self::WriteRows,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Vec<Vec<Value>>>,
    offline: bool,
    pending_failures: HashMap<MemoryOp, u32>,
}

#[derive(Debug, Default)]
pub struct MemorySheets {
    state: Mutex<State>,
    calls: [AtomicUsize; MemoryOp::ALL.len()],
}

impl MemorySheets {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a table's raw cells (header row first).
    pub fn set_table(&self, table: &str, rows: Vec<Vec<Value>>) {
        if let Ok(mut state) = self.state.lock() {
            state.tables.insert(table.to_string(), rows);
        }
    }

    /// Add a raw row to the end of a table, creating it if missing.
    pub fn push_row(&self, table: &str, row: Vec<Value>) {
        if let Ok(mut state) = self.state.lock() {
            state.tables.entry(table.to_string()).or_default().push(row);
        }
    }

    /// Raw cells of a table as last written.
    #[must_use]
    pub fn raw_table(&self, table: &str) -> Option<Vec<Vec<Value>>> {
        self.state.lock().ok()?.tables.get(table).cloned()
    }

    /// When offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Fail the next `times` calls of `op`.
    pub fn fail_next(&self, op: MemoryOp, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_failures.insert(op, times);
        }
    }

    #[must_use]
    pub fn call_count(&self, op: MemoryOp) -> usize {
        self.calls[op.slot()].load(Ordering::SeqCst)
    }

    /// Calls that change remote state.
    #[must_use]
    pub fn write_count(&self) -> usize {
        [
            MemoryOp::AddTable,
            MemoryOp::WriteHeader,
            MemoryOp::AppendRows,
            MemoryOp::Clear,
            MemoryOp::WriteRows,
        ]
        .into_iter()
        .map(|op| self.call_count(op))
        .sum()
    }

    /// Count the call, apply injected failures, then run `f` on the state.
    fn with_state<T>(&self, op: MemoryOp, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        self.calls[op.slot()].fetch_add(1, Ordering::SeqCst);
        let mut state = self
            .state
            .lock()
            .map_err(|_| MirrorError::Transport("memory sheets lock poisoned".into()))?;
        if state.offline {
            return Err(MirrorError::Transport("memory sheets offline".into()).into());
        }
        if let Some(remaining) = state.pending_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MirrorError::Transport(format!("injected {op:?} failure")).into());
            }
        }
        f(&mut state)
    }
}

fn missing(table: &str) -> crate::error::Error {
    MirrorError::Http {
        status: 400,
        message: format!("Unable to parse range: {table}"),
    }
    .into()
}

fn formatted(rows: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut out: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            let mut cells: Vec<Value> = row
                .iter()
                .map(|cell| Value::String(codec::cell_text(cell)))
                .collect();
            while cells
                .last()
                .is_some_and(|c| c.as_str().is_some_and(str::is_empty))
            {
                cells.pop();
            }
            cells
        })
        .collect();
    while out.last().is_some_and(Vec::is_empty) {
        out.pop();
    }
    out
}

#[async_trait]
impl SheetsTransport for MemorySheets {
    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_state(MemoryOp::ListTables, |s| Ok(s.tables.keys().cloned().collect()))
    }

    async fn add_table(&self, table: &str) -> Result<()> {
        self.with_state(MemoryOp::AddTable, |s| {
            if s.tables.contains_key(table) {
                return Err(MirrorError::Http {
                    status: 400,
                    message: format!("A sheet with the name \"{table}\" already exists."),
                }
                .into());
            }
            s.tables.insert(table.to_string(), Vec::new());
            Ok(())
        })
    }

    async fn read_header(&self, table: &str) -> Result<Vec<Value>> {
        self.with_state(MemoryOp::ReadHeader, |s| {
            let rows = s.tables.get(table).ok_or_else(|| missing(table))?;
            Ok(formatted(&rows[..rows.len().min(1)])
                .into_iter()
                .next()
                .unwrap_or_default())
        })
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<Value>>> {
        self.with_state(MemoryOp::ReadRows, |s| {
            s.tables.get(table).map(|rows| formatted(rows)).ok_or_else(|| missing(table))
        })
    }

    async fn write_header(&self, table: &str, headers: &[String]) -> Result<()> {
        self.with_state(MemoryOp::WriteHeader, |s| {
            let rows = s.tables.get_mut(table).ok_or_else(|| missing(table))?;
            let header: Vec<Value> = headers.iter().cloned().map(Value::String).collect();
            if rows.is_empty() {
                rows.push(header);
            } else {
                rows[0] = header;
            }
            Ok(())
        })
    }

    async fn append_rows(&self, table: &str, new_rows: &[Vec<Value>]) -> Result<()> {
        self.with_state(MemoryOp::AppendRows, |s| {
            let rows = s.tables.get_mut(table).ok_or_else(|| missing(table))?;
            rows.extend(new_rows.iter().cloned());
            Ok(())
        })
    }

    async fn clear_from(&self, table: &str, first_row: usize) -> Result<()> {
        self.with_state(MemoryOp::Clear, |s| {
            s.tables
                .get_mut(table)
                .ok_or_else(|| missing(table))?
                .truncate(first_row);
            Ok(())
        })
    }

    async fn write_rows(&self, table: &str, new_rows: &[Vec<Value>]) -> Result<()> {
        self.with_state(MemoryOp::WriteRows, |s| {
            let rows = s.tables.get_mut(table).ok_or_else(|| missing(table))?;
            for (i, row) in new_rows.iter().enumerate() {
                if i < rows.len() {
                    rows[i] = row.clone();
                } else {
                    rows.push(row.clone());
                }
            }
            Ok(())
        })
    }
}
