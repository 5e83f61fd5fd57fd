//! Append-only JSON-lines ledger, one file per record kind.
//!
//! Layout: `<data_dir>/ledger/<kind>.jsonl`, one serialized [`Record`] per
//! line. Appends are serialized per kind and only ever add bytes to the end
//! of a file. Reads tolerate a torn final line (crash mid-append) and any
//! other unparseable line by skipping it. Whole-file rewrites go through a
//! temporary file and an atomic rename.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::record::{Record, RecordKind};

type StoreResult<T> = std::result::Result<T, StoreError>;

/// Directory under the data dir that holds ledger files.
pub const LEDGER_DIR: &str = "ledger";

/// Durable local source of truth.
#[derive(Debug)]
pub struct LedgerStore {
    root: PathBuf,
    locks: [Mutex<()>; RecordKind::COUNT],
}

impl LedgerStore {
    /// Open (creating if needed) the ledger directory under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> StoreResult<Self> {
        let root = data_dir.as_ref().join(LEDGER_DIR);
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            locks: std::array::from_fn(|_| Mutex::new(())),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        self.root.join(format!("{}.jsonl", kind.as_str()))
    }

    /// Take the per-kind write lock. Appends and rewrites of `kind` wait
    /// until the returned guard is dropped.
    pub async fn lock(&self, kind: RecordKind) -> LedgerWriteGuard<'_> {
        let guard = self.locks[kind.index()].lock().await;
        LedgerWriteGuard {
            store: self,
            kind,
            _guard: guard,
        }
    }

    /// Append one record as a single line.
    pub async fn append(&self, record: &Record) -> StoreResult<()> {
        self.lock(record.kind()).await.append(record).await
    }

    /// Every parseable record of `kind`, in file order.
    ///
    /// Does not take the write lock: a concurrent append is either fully
    /// visible or shows up as a skipped partial line.
    pub async fn read_all(&self, kind: RecordKind) -> StoreResult<Vec<Record>> {
        read_ledger(&self.path_for(kind), kind).await
    }

    /// Records of `kind` booked on business day `date` (`YYYY-MM-DD`).
    pub async fn read_day(&self, kind: RecordKind, date: &str) -> StoreResult<Vec<Record>> {
        let mut records = self.read_all(kind).await?;
        records.retain(|r| r.date == date);
        Ok(records)
    }

    /// Record count per kind, for status reporting.
    pub async fn counts(&self) -> StoreResult<Vec<(RecordKind, usize)>> {
        let mut counts = Vec::with_capacity(RecordKind::COUNT);
        for kind in RecordKind::ALL {
            counts.push((kind, self.read_all(kind).await?.len()));
        }
        Ok(counts)
    }
}

/// Exclusive write access to one kind's ledger file.
pub struct LedgerWriteGuard<'a> {
    store: &'a LedgerStore,
    kind: RecordKind,
    _guard: MutexGuard<'a, ()>,
}

impl LedgerWriteGuard<'_> {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub async fn read_all(&self) -> StoreResult<Vec<Record>> {
        self.store.read_all(self.kind).await
    }

    pub async fn append(&mut self, record: &Record) -> StoreResult<()> {
        if record.kind() != self.kind {
            return Err(StoreError::InvalidRecord(format!(
                "{} record {} cannot go into the {} ledger",
                record.kind(),
                record.id,
                self.kind
            )));
        }
        let path = self.store.path_for(self.kind);
        let mut line = serde_json::to_vec(record).map_err(|source| StoreError::Encode {
            id: record.id.clone(),
            source,
        })?;
        line.push(b'\n');
        if ends_without_newline(&path).await? {
            // Seal a torn tail so the new record starts on its own line.
            line.insert(0, b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        file.flush().await.map_err(|e| StoreError::io(&path, e))?;
        file.sync_data().await.map_err(|e| StoreError::io(&path, e))?;
        debug!(kind = %self.kind, id = %record.id, "ledger append");
        Ok(())
    }

    /// Replace the whole ledger with `records`.
    ///
    /// Written to `<kind>.jsonl.tmp` then renamed over the original, so a
    /// crash leaves either the old file or the new one.
    pub async fn rewrite(&mut self, records: &[Record]) -> StoreResult<()> {
        let path = self.store.path_for(self.kind);
        let tmp_path = path.with_extension("jsonl.tmp");

        let mut buf = Vec::with_capacity(records.len() * 256);
        for record in records {
            serde_json::to_writer(&mut buf, record).map_err(|source| StoreError::Encode {
                id: record.id.clone(),
                source,
            })?;
            buf.push(b'\n');
        }

        let mut file = File::create(&tmp_path)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.write_all(&buf)
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&tmp_path, e))?;
        drop(file);
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        debug!(kind = %self.kind, records = records.len(), "ledger rewritten");
        Ok(())
    }
}

async fn read_ledger(path: &Path, kind: RecordKind) -> StoreResult<Vec<Record>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let text = String::from_utf8_lossy(&bytes);

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(record) if record.kind() == kind => records.push(record),
            Ok(record) => {
                skipped += 1;
                debug!(line = lineno + 1, found = %record.kind(), "record of another kind skipped");
            }
            Err(err) => {
                skipped += 1;
                debug!(line = lineno + 1, error = %err, "unparseable ledger line skipped");
            }
        }
    }
    if skipped > 0 {
        warn!(path = %path.display(), skipped, "ledger contains unreadable lines");
    }
    Ok(records)
}

async fn ends_without_newline(path: &Path) -> StoreResult<bool> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| StoreError::io(path, e))?
        .len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))
        .await
        .map_err(|e| StoreError::io(path, e))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)
        .await
        .map_err(|e| StoreError::io(path, e))?;
    Ok(last[0] != b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Expense, Payload, Sale};
    use chrono::{DateTime, Utc};
    use std::io::Write;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn sale(amount: f64, date: &str) -> Record {
        Record::new(
            Payload::Sale(Sale {
                amount,
                ..Sale::default()
            }),
            date,
            ts("2024-01-31T10:00:00Z"),
        )
    }

    #[tokio::test]
    async fn append_then_read_preserves_order() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let a = sale(10.0, "2024-01-31");
        let b = sale(20.0, "2024-02-01");
        store.append(&a).await.unwrap();
        store.append(&b).await.unwrap();

        let all = store.read_all(RecordKind::Sale).await.unwrap();
        assert_eq!(all, vec![a, b.clone()]);
        assert_eq!(store.read_day(RecordKind::Sale, "2024-02-01").await.unwrap(), vec![b]);
        assert!(store.read_all(RecordKind::Expense).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn torn_tail_is_skipped_and_sealed_by_next_append() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let first = sale(10.0, "2024-01-31");
        store.append(&first).await.unwrap();

        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(store.path_for(RecordKind::Sale))
                .unwrap();
            file.write_all(b"{\"id\":\"sale_torn\",\"dateI").unwrap();
        }
        assert_eq!(store.read_all(RecordKind::Sale).await.unwrap(), vec![first.clone()]);

        let second = sale(30.0, "2024-01-31");
        store.append(&second).await.unwrap();
        assert_eq!(
            store.read_all(RecordKind::Sale).await.unwrap(),
            vec![first, second]
        );
    }

    #[tokio::test]
    async fn rewrite_replaces_contents_atomically() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.append(&sale(1.0, "2024-01-01")).await.unwrap();
        let replacement = vec![sale(2.0, "2024-01-02"), sale(3.0, "2024-01-03")];

        let mut guard = store.lock(RecordKind::Sale).await;
        guard.rewrite(&replacement).await.unwrap();
        assert_eq!(guard.read_all().await.unwrap(), replacement);
        drop(guard);

        let tmp = store.path_for(RecordKind::Sale).with_extension("jsonl.tmp");
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn guard_rejects_foreign_kind() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        let expense = Record::new(
            Payload::Expense(Expense::default()),
            "2024-01-01",
            ts("2024-01-01T00:00:00Z"),
        );
        let mut guard = store.lock(RecordKind::Sale).await;
        let err = guard.append(&expense).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[tokio::test]
    async fn concurrent_appends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(LedgerStore::open(dir.path()).unwrap());
        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&sale(f64::from(i), "2024-01-31")).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.read_all(RecordKind::Sale).await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn counts_cover_every_kind() {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path()).unwrap();
        store.append(&sale(1.0, "2024-01-01")).await.unwrap();
        let counts = store.counts().await.unwrap();
        assert_eq!(counts.len(), RecordKind::COUNT);
        assert_eq!(counts[0], (RecordKind::Sale, 1));
    }
}
