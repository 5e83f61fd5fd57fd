//! Write path: persist locally first, mirror in the background.
//!
//! [`Ledger::append_record`] returns as soon as the record is durable in the
//! local ledger. The remote append is queued as a [`MirrorJob`] and drained
//! by a worker task; a failed remote append is logged and counted, and the
//! next sync pass pushes the record instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{self, BusinessClock};
use crate::error::Result;
use crate::mirror::MirrorClient;
use crate::record::{Payload, Record};
use crate::scheduler::PassLocks;
use crate::schema;
use crate::store::LedgerStore;

/// What happened to an append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// Stored (and queued for the mirror when enabled).
    Appended(Record),
    /// Dropped as a double submission of this earlier record.
    Deduplicated(Record),
}

impl AppendOutcome {
    #[must_use]
    pub fn record(&self) -> &Record {
        match self {
            Self::Appended(record) | Self::Deduplicated(record) => record,
        }
    }

    #[must_use]
    pub fn is_deduplicated(&self) -> bool {
        matches!(self, Self::Deduplicated(_))
    }
}

/// A record waiting to be appended to its mirror table.
#[derive(Debug, Clone)]
pub struct MirrorJob {
    pub record: Record,
}

#[derive(Debug, Default)]
struct QueueCounters {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of the mirror append queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            queued: self.queued.load(Ordering::SeqCst),
            delivered: self.delivered.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// Handle to the mirror append worker. The worker exits once every
/// [`Ledger`] holding its queue has been dropped and the queue is drained.
pub struct MirrorWorkerHandle {
    task: JoinHandle<()>,
    counters: Arc<QueueCounters>,
}

impl MirrorWorkerHandle {
    /// Wait for the queue to drain and return the final counts.
    pub async fn join(self) -> QueueStats {
        if let Err(e) = self.task.await {
            warn!(error = %e, "mirror append worker ended abnormally");
        }
        self.counters.snapshot()
    }
}

/// Entry point for new bookkeeping facts.
#[derive(Debug)]
pub struct Ledger {
    store: Arc<LedgerStore>,
    clock: BusinessClock,
    queue: Option<UnboundedSender<MirrorJob>>,
    counters: Arc<QueueCounters>,
}

impl Ledger {
    /// Ledger without a mirror; appends are local only.
    #[must_use]
    pub fn local_only(store: Arc<LedgerStore>, clock: BusinessClock) -> Self {
        Self {
            store,
            clock,
            queue: None,
            counters: Arc::new(QueueCounters::default()),
        }
    }

    /// Ledger that mirrors every append. Spawns the worker on the current
    /// tokio runtime; a disabled mirror yields a local-only ledger and no
    /// worker.
    #[must_use]
    pub fn with_mirror(
        store: Arc<LedgerStore>,
        clock: BusinessClock,
        mirror: Arc<MirrorClient>,
        locks: Arc<PassLocks>,
    ) -> (Self, Option<MirrorWorkerHandle>) {
        let mut ledger = Self::local_only(store, clock);
        if !mirror.is_enabled() {
            return (ledger, None);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_mirror_worker(
            rx,
            mirror,
            locks,
            Arc::clone(&ledger.counters),
        ));
        ledger.queue = Some(tx);
        let counters = Arc::clone(&ledger.counters);
        (ledger, Some(MirrorWorkerHandle { task, counters }))
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &BusinessClock {
        &self.clock
    }

    /// New record stamped now, with `date` normalized (blank means today).
    #[must_use]
    pub fn draft(&self, payload: Payload, date: &Value) -> Record {
        Record::new(payload, codec::parse_date(date, &self.clock), codec::now_ms())
    }

    /// [`Ledger::draft`] followed by [`Ledger::append_record`].
    pub async fn append(&self, payload: Payload, date: &Value) -> Result<AppendOutcome> {
        self.append_record(self.draft(payload, date)).await
    }

    /// Normalize, persist, then queue for the mirror.
    ///
    /// A sale matching the previous sale's amount, method and note within
    /// 1.5 s is treated as a double submission and not stored.
    pub async fn append_record(&self, mut record: Record) -> Result<AppendOutcome> {
        record.prepare(&self.clock);
        let kind = record.kind();

        let mut guard = self.store.lock(kind).await;
        if matches!(record.payload, Payload::Sale(_)) {
            let existing = guard.read_all().await?;
            if let Some(previous) = existing.last() {
                if record.is_duplicate_submission_of(previous) {
                    info!(%kind, id = %previous.id, "duplicate sale submission dropped");
                    return Ok(AppendOutcome::Deduplicated(previous.clone()));
                }
            }
        }
        guard.append(&record).await?;
        drop(guard);

        if let Some(queue) = &self.queue {
            self.counters.queued.fetch_add(1, Ordering::SeqCst);
            if queue
                .send(MirrorJob {
                    record: record.clone(),
                })
                .is_err()
            {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(%kind, id = %record.id, "mirror worker gone; record will sync on next pass");
            }
        }
        Ok(AppendOutcome::Appended(record))
    }

    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

async fn run_mirror_worker(
    mut rx: UnboundedReceiver<MirrorJob>,
    mirror: Arc<MirrorClient>,
    locks: Arc<PassLocks>,
    counters: Arc<QueueCounters>,
) {
    debug!("mirror append worker started");
    while let Some(job) = rx.recv().await {
        let kind = job.record.kind();
        let table_schema = schema::schema_for(kind);
        let _pass = locks.acquire(kind).await;
        match mirror
            .append_row(
                table_schema.table,
                &table_schema.header_row(),
                schema::to_row(&job.record),
            )
            .await
        {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::SeqCst);
                debug!(%kind, id = %job.record.id, "mirrored append");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    %kind,
                    id = %job.record.id,
                    error = %e,
                    "mirror append failed; next sync pass will push it"
                );
            }
        }
    }
    debug!("mirror append worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::{MemoryOp, MemorySheets};
    use crate::record::{RecordKind, Sale, Withdraw};
    use crate::retry::RetryPolicy;
    use chrono::{DateTime, Duration, NaiveDate, Utc};
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn clock() -> BusinessClock {
        BusinessClock::pinned(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap())
    }

    fn sale_at(amount: f64, at: DateTime<Utc>) -> Record {
        Record::new(
            Payload::Sale(Sale {
                amount,
                ..Sale::default()
            }),
            "2024-05-06",
            at,
        )
    }

    fn mirrored(dir: &std::path::Path, sheets: &Arc<MemorySheets>) -> (Ledger, MirrorWorkerHandle) {
        let store = Arc::new(LedgerStore::open(dir).unwrap());
        let mirror =
            Arc::new(MirrorClient::new(sheets.clone()).with_retry_policy(RetryPolicy::no_retry()));
        let (ledger, worker) =
            Ledger::with_mirror(store, clock(), mirror, Arc::new(PassLocks::new()));
        (ledger, worker.unwrap())
    }

    #[tokio::test]
    async fn draft_uses_business_clock_for_blank_date() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::local_only(Arc::new(LedgerStore::open(dir.path()).unwrap()), clock());
        let record = ledger.draft(Payload::Withdraw(Withdraw::default()), &json!(""));
        assert_eq!(record.date, "2024-05-06");
        let record = ledger.draft(Payload::Withdraw(Withdraw::default()), &json!("31/01/2024"));
        assert_eq!(record.date, "2024-01-31");
    }

    #[tokio::test]
    async fn local_only_append_persists_without_queue() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let ledger = Ledger::local_only(store.clone(), clock());
        let outcome = ledger
            .append(Payload::Withdraw(Withdraw { amount: 500.0, note: String::new() }), &json!(""))
            .await
            .unwrap();
        assert!(!outcome.is_deduplicated());
        assert_eq!(store.read_all(RecordKind::Withdraw).await.unwrap().len(), 1);
        assert_eq!(ledger.queue_stats(), QueueStats::default());
    }

    #[tokio::test]
    async fn rapid_identical_sales_are_deduplicated() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let ledger = Ledger::local_only(store.clone(), clock());
        let t0 = ts("2024-05-06T10:00:00Z");

        let first = ledger.append_record(sale_at(100.0, t0)).await.unwrap();
        let again = ledger
            .append_record(sale_at(100.0, t0 + Duration::milliseconds(800)))
            .await
            .unwrap();
        assert!(again.is_deduplicated());
        assert_eq!(again.record().id, first.record().id);

        let later = ledger
            .append_record(sale_at(100.0, t0 + Duration::seconds(3)))
            .await
            .unwrap();
        assert!(!later.is_deduplicated());
        assert_eq!(store.read_all(RecordKind::Sale).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn appends_reach_the_mirror_in_the_background() {
        let dir = tempdir().unwrap();
        let sheets = Arc::new(MemorySheets::new());
        let (ledger, worker) = mirrored(dir.path(), &sheets);
        let outcome = ledger
            .append(Payload::Withdraw(Withdraw { amount: 250.0, note: "float".into() }), &json!(""))
            .await
            .unwrap();
        let stats_before_drain = ledger.queue_stats();
        assert_eq!(stats_before_drain.queued, 1);

        drop(ledger);
        let stats = worker.join().await;

        let rows = sheets.raw_table("Withdraw").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1][0], json!(outcome.record().id));
        assert_eq!(stats, QueueStats { queued: 1, delivered: 1, failed: 0 });
    }

    #[tokio::test]
    async fn remote_failure_keeps_local_record() {
        let dir = tempdir().unwrap();
        let sheets = Arc::new(MemorySheets::new());
        sheets.set_offline(true);
        let (ledger, worker) = mirrored(dir.path(), &sheets);
        ledger
            .append(Payload::Withdraw(Withdraw::default()), &json!(""))
            .await
            .unwrap();
        let store = Arc::clone(ledger.store());
        drop(ledger);
        let stats = worker.join().await;

        assert_eq!(store.read_all(RecordKind::Withdraw).await.unwrap().len(), 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(sheets.call_count(MemoryOp::AppendRows), 0);
    }

    #[tokio::test]
    async fn disabled_mirror_spawns_no_worker() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let (ledger, worker) = Ledger::with_mirror(
            store,
            clock(),
            Arc::new(MirrorClient::disabled()),
            Arc::new(PassLocks::new()),
        );
        assert!(worker.is_none());
        ledger
            .append(Payload::Withdraw(Withdraw::default()), &json!(""))
            .await
            .unwrap();
        assert_eq!(ledger.queue_stats().queued, 0);
    }
}
