//! Remote spreadsheet mirror.
//!
//! [`SheetsTransport`] is the wire seam: table-granular operations against a
//! spreadsheet service. [`MirrorClient`] layers retries, a per-process cache
//! of tables known to exist with a complete header, and row decoding on top.
//!
//! Two transports ship with the crate: [`HttpSheetsTransport`] for the
//! Google Sheets v4 REST API and [`MemorySheets`] for tests and offline runs.

mod memory;
mod sheets;

pub use memory::{MemoryOp, MemorySheets};
pub use sheets::{HttpSheetsTransport, quote_table};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::retry::{RetryPolicy, with_retry};
use crate::schema::{self, Row};

/// Table-level operations against a spreadsheet service.
///
/// Reads return cells the way the service formats them for display, so
/// numbers typically come back as strings.
#[async_trait]
pub trait SheetsTransport: Send + Sync {
    /// Titles of all tables (sheets/tabs) in the spreadsheet.
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn add_table(&self, table: &str) -> Result<()>;

    /// First row of the table; empty when the table is blank.
    async fn read_header(&self, table: &str) -> Result<Vec<Value>>;

    /// Every row, header included.
    async fn read_rows(&self, table: &str) -> Result<Vec<Vec<Value>>>;

    async fn write_header(&self, table: &str, headers: &[String]) -> Result<()>;

    /// Insert rows after the last non-empty row.
    async fn append_rows(&self, table: &str, rows: &[Vec<Value>]) -> Result<()>;

    /// Clear every row from `first_row` (0-based) to the end of the table.
    async fn clear_from(&self, table: &str, first_row: usize) -> Result<()>;

    /// Write rows starting at the top-left cell, overwriting what is there.
    async fn write_rows(&self, table: &str, rows: &[Vec<Value>]) -> Result<()>;
}

/// Decoded contents of one mirror table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    /// Header cells as displayed, trimmed.
    pub headers: Vec<String>,
    /// Data rows keyed by normalized header. Blank rows are dropped.
    pub rows: Vec<Row>,
}

/// Reachability report for `status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorStatus {
    pub enabled: bool,
    pub reachable: bool,
    pub tables: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tables confirmed to exist with at least `width` header cells.
#[derive(Debug, Default)]
struct KnownTables {
    widths: Mutex<HashMap<String, usize>>,
}

impl KnownTables {
    fn covers(&self, table: &str, width: usize) -> bool {
        self.widths
            .lock()
            .map(|w| w.get(table).is_some_and(|known| *known >= width))
            .unwrap_or(false)
    }

    fn remember(&self, table: &str, width: usize) {
        if let Ok(mut widths) = self.widths.lock() {
            widths.insert(table.to_string(), width);
        }
    }

    fn forget(&self, table: &str) {
        if let Ok(mut widths) = self.widths.lock() {
            widths.remove(table);
        }
    }
}

/// Retrying, caching front-end to a [`SheetsTransport`].
///
/// A client built without a transport is disabled: every operation fails
/// with [`MirrorError::Disabled`].
pub struct MirrorClient {
    transport: Option<Arc<dyn SheetsTransport>>,
    known: KnownTables,
    retry: RetryPolicy,
}

impl std::fmt::Debug for MirrorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorClient")
            .field("enabled", &self.is_enabled())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl MirrorClient {
    #[must_use]
    pub fn new(transport: Arc<dyn SheetsTransport>) -> Self {
        Self {
            transport: Some(transport),
            known: KnownTables::default(),
            retry: RetryPolicy::sheets_api(),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            transport: None,
            known: KnownTables::default(),
            retry: RetryPolicy::sheets_api(),
        }
    }

    /// HTTP-backed client when the mirror is enabled, disabled otherwise.
    pub fn from_config(config: &MirrorConfig) -> Result<Self> {
        if !config.enabled {
            info!("remote mirror disabled; running local-only");
            return Ok(Self::disabled());
        }
        let transport = HttpSheetsTransport::from_config(config)?;
        info!(spreadsheet = %config.spreadsheet_id, "remote mirror enabled");
        Ok(Self::new(Arc::new(transport)))
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    fn transport(&self) -> Result<&dyn SheetsTransport> {
        self.transport
            .as_deref()
            .ok_or_else(|| MirrorError::Disabled.into())
    }

    /// Make sure `table` exists and its header row is at least as wide as
    /// `headers`. An existing, complete header is never rewritten.
    pub async fn ensure_table(&self, table: &str, headers: &[String]) -> Result<()> {
        let transport = self.transport()?;
        if self.known.covers(table, headers.len()) {
            return Ok(());
        }

        let tables = with_retry(&self.retry, "list_tables", || transport.list_tables()).await?;
        if !tables.iter().any(|t| t == table) {
            with_retry(&self.retry, "add_table", || transport.add_table(table)).await?;
            info!(table, "created mirror table");
        }

        let current = with_retry(&self.retry, "read_header", || transport.read_header(table)).await?;
        let width = current
            .iter()
            .rposition(|cell| !codec::cell_text(cell).is_empty())
            .map_or(0, |last| last + 1);
        if width < headers.len() {
            with_retry(&self.retry, "write_header", || {
                transport.write_header(table, headers)
            })
            .await?;
            debug!(table, previous_width = width, "wrote mirror header");
        }

        self.known.remember(table, headers.len());
        Ok(())
    }

    /// Header and data rows of `table`.
    pub async fn read_table(&self, table: &str) -> Result<Table> {
        let transport = self.transport()?;
        let values = match with_retry(&self.retry, "read_rows", || transport.read_rows(table)).await {
            Ok(values) => values,
            Err(e) => {
                self.known.forget(table);
                return Err(e);
            }
        };

        let mut iter = values.into_iter();
        let headers: Vec<String> = iter
            .next()
            .unwrap_or_default()
            .iter()
            .map(codec::cell_text)
            .collect();
        let rows = iter
            .filter(|cells| cells.iter().any(|c| !codec::cell_text(c).is_empty()))
            .map(|cells| schema::row_from_cells(&headers, &cells))
            .collect();
        Ok(Table { headers, rows })
    }

    /// Add one row after the existing data, creating the table if needed.
    pub async fn append_row(&self, table: &str, headers: &[String], row: Vec<Value>) -> Result<()> {
        self.ensure_table(table, headers).await?;
        let transport = self.transport()?;
        let rows = [row];
        with_retry(&self.retry, "append_rows", || transport.append_rows(table, &rows)).await
    }

    /// Overwrite `table` with `headers` followed by `rows`, then clear
    /// whatever was left below them.
    ///
    /// The write goes first so a failure never leaves the table empty: a
    /// failed write keeps the previous contents and a failed clear leaves
    /// stale rows below the new ones, which the next pass replaces.
    pub async fn replace_table(
        &self,
        table: &str,
        headers: &[String],
        rows: Vec<Vec<Value>>,
    ) -> Result<()> {
        let transport = self.transport()?;
        let mut values = Vec::with_capacity(rows.len() + 1);
        values.push(headers.iter().cloned().map(Value::String).collect());
        values.extend(rows);

        let result = async {
            with_retry(&self.retry, "write_rows", || transport.write_rows(table, &values)).await?;
            with_retry(&self.retry, "clear_from", || {
                transport.clear_from(table, values.len())
            })
            .await
        }
        .await;
        match result {
            Ok(()) => {
                self.known.remember(table, headers.len());
                Ok(())
            }
            Err(e) => {
                warn!(table, error = %e, "mirror table replace failed");
                self.known.forget(table);
                Err(e)
            }
        }
    }

    /// Probe the service without touching any table.
    pub async fn status(&self) -> MirrorStatus {
        let Ok(transport) = self.transport() else {
            return MirrorStatus::default();
        };
        match with_retry(&self.retry, "list_tables", || transport.list_tables()).await {
            Ok(tables) => MirrorStatus {
                enabled: true,
                reachable: true,
                tables,
                error: None,
            },
            Err(e) => MirrorStatus {
                enabled: true,
                reachable: false,
                tables: Vec::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn client(sheets: &Arc<MemorySheets>) -> MirrorClient {
        MirrorClient::new(sheets.clone()).with_retry_policy(RetryPolicy::no_retry())
    }

    #[tokio::test]
    async fn disabled_client_refuses_everything() {
        let client = MirrorClient::disabled();
        assert!(!client.is_enabled());
        let err = client.read_table("Sales").await.unwrap_err();
        assert!(matches!(err, Error::Mirror(MirrorError::Disabled)));
        let status = client.status().await;
        assert!(!status.enabled && !status.reachable);
    }

    #[tokio::test]
    async fn ensure_table_creates_once_and_caches() {
        let sheets = Arc::new(MemorySheets::new());
        let client = client(&sheets);
        let h = headers(&["id", "amount"]);
        client.ensure_table("Sales", &h).await.unwrap();
        client.ensure_table("Sales", &h).await.unwrap();

        assert_eq!(sheets.call_count(MemoryOp::AddTable), 1);
        assert_eq!(sheets.call_count(MemoryOp::ListTables), 1);
        assert_eq!(sheets.call_count(MemoryOp::WriteHeader), 1);
        assert_eq!(sheets.raw_table("Sales").unwrap()[0], vec![json!("id"), json!("amount")]);
    }

    #[tokio::test]
    async fn ensure_table_keeps_complete_header_and_extends_short_one() {
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_table("Full", vec![vec![json!("ID"), json!("Amount")]]);
        sheets.set_table("Short", vec![vec![json!("id")]]);
        let client = client(&sheets);
        let h = headers(&["id", "amount"]);

        client.ensure_table("Full", &h).await.unwrap();
        assert_eq!(sheets.raw_table("Full").unwrap()[0][0], json!("ID"));

        client.ensure_table("Short", &h).await.unwrap();
        assert_eq!(sheets.raw_table("Short").unwrap()[0].len(), 2);
        assert_eq!(sheets.call_count(MemoryOp::WriteHeader), 1);
    }

    #[tokio::test]
    async fn read_table_keys_rows_by_header_and_skips_blanks() {
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_table(
            "Withdraw",
            vec![
                vec![json!("id"), json!("Amount")],
                vec![json!("wd_1"), json!(500)],
                vec![json!(""), json!("")],
                vec![json!("wd_2")],
            ],
        );
        let table = client(&sheets).read_table("Withdraw").await.unwrap();
        assert_eq!(table.headers, headers(&["id", "Amount"]));
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].get("amount"), Some(&json!("500")));
        assert_eq!(table.rows[1].get("amount"), None);
    }

    #[tokio::test]
    async fn replace_table_writes_header_then_rows() {
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_table("T", vec![vec![json!("old")], vec![json!("stale")], vec![json!("x")]]);
        let client = client(&sheets);
        client
            .replace_table("T", &headers(&["id"]), vec![vec![json!("a")]])
            .await
            .unwrap();
        assert_eq!(
            sheets.raw_table("T").unwrap(),
            vec![vec![json!("id")], vec![json!("a")]]
        );
    }

    #[tokio::test]
    async fn failed_replace_write_keeps_previous_rows() {
        let sheets = Arc::new(MemorySheets::new());
        let before = vec![vec![json!("id")], vec![json!("a")], vec![json!("b")]];
        sheets.set_table("T", before.clone());
        let client = client(&sheets);

        sheets.fail_next(MemoryOp::WriteRows, 1);
        let err = client
            .replace_table("T", &headers(&["id"]), vec![vec![json!("c")]])
            .await;
        assert!(err.is_err());
        assert_eq!(sheets.raw_table("T").unwrap(), before);
        assert_eq!(sheets.call_count(MemoryOp::Clear), 0);
    }

    #[tokio::test]
    async fn failed_replace_clear_keeps_header_and_new_rows() {
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_table("T", vec![vec![json!("id")], vec![json!("a")], vec![json!("b")]]);
        let client = client(&sheets);

        sheets.fail_next(MemoryOp::Clear, 1);
        assert!(
            client
                .replace_table("T", &headers(&["id"]), vec![vec![json!("c")]])
                .await
                .is_err()
        );
        let rows = sheets.raw_table("T").unwrap();
        assert_eq!(rows[0], vec![json!("id")]);
        assert_eq!(rows[1], vec![json!("c")]);
    }

    #[tokio::test]
    async fn status_reports_unreachable_service() {
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_offline(true);
        let status = client(&sheets).status().await;
        assert!(status.enabled);
        assert!(!status.reachable);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn failed_read_forgets_cached_table() {
        let sheets = Arc::new(MemorySheets::new());
        let client = client(&sheets);
        let h = headers(&["id"]);
        client.ensure_table("T", &h).await.unwrap();
        sheets.fail_next(MemoryOp::ReadRows, 1);
        assert!(client.read_table("T").await.is_err());
        client.ensure_table("T", &h).await.unwrap();
        assert_eq!(sheets.call_count(MemoryOp::ListTables), 2);
    }
}
