//! End-to-end reconciliation against the in-memory spreadsheet.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Value, json};
use tempfile::{TempDir, tempdir};

use tillsync_core::codec::{self, BusinessClock};
use tillsync_core::mirror::{MemoryOp, MemorySheets, MirrorClient};
use tillsync_core::record::{Payload, Withdraw};
use tillsync_core::retry::RetryPolicy;
use tillsync_core::scheduler::KindOutcome;
use tillsync_core::{LedgerStore, Record, RecordKind, SyncEngine, SyncMode, SyncOptions};

const TABLE: &str = "Withdraw";
const AMOUNT_COL: usize = 4;
const UPDATED_COL: usize = 3;

struct Harness {
    _dir: TempDir,
    sheets: Arc<MemorySheets>,
    engine: SyncEngine,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let sheets = Arc::new(MemorySheets::new());
        let store = Arc::new(LedgerStore::open(dir.path()).unwrap());
        let mirror = Arc::new(
            MirrorClient::new(sheets.clone()).with_retry_policy(RetryPolicy::no_retry()),
        );
        let engine = SyncEngine::new(store, mirror, BusinessClock::utc());
        Self {
            _dir: dir,
            sheets,
            engine,
        }
    }

    fn store(&self) -> &LedgerStore {
        self.engine.store()
    }

    async fn sync(&self, mode: SyncMode, allow_delete: bool) -> tillsync_core::SyncSummary {
        self.engine
            .sync_kind(RecordKind::Withdraw, SyncOptions { mode, allow_delete })
            .await
            .unwrap()
    }

    async fn local(&self) -> Vec<Record> {
        self.store().read_all(RecordKind::Withdraw).await.unwrap()
    }

    /// Data rows of the mirror table, header excluded.
    fn remote_rows(&self) -> Vec<Vec<Value>> {
        self.sheets
            .raw_table(TABLE)
            .unwrap_or_default()
            .into_iter()
            .skip(1)
            .collect()
    }

    fn edit_remote(&self, edit: impl FnOnce(&mut Vec<Vec<Value>>)) {
        let mut rows = self.sheets.raw_table(TABLE).unwrap();
        edit(&mut rows);
        self.sheets.set_table(TABLE, rows);
    }
}

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

fn withdrawal(amount: f64, note: &str, at: DateTime<Utc>) -> Record {
    Record::new(
        Payload::Withdraw(Withdraw {
            amount,
            note: note.to_string(),
        }),
        "2024-01-31",
        at,
    )
}

fn amount_of(record: &Record) -> f64 {
    match &record.payload {
        Payload::Withdraw(w) => w.amount,
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let h = Harness::new();
    h.store()
        .append(&withdrawal(200.0, "float", ts("2024-01-31T08:00:00Z")))
        .await
        .unwrap();
    h.store()
        .append(&withdrawal(75.5, "", ts("2024-01-31T09:30:00.250Z")))
        .await
        .unwrap();

    let first = h.sync(SyncMode::Both, false).await;
    assert_eq!(first.pushed, 2);
    assert!(first.remote_written);
    assert!(!first.local_written);
    assert_eq!(h.remote_rows().len(), 2);

    let writes = h.sheets.write_count();
    let before = h.local().await;
    let second = h.sync(SyncMode::Both, false).await;
    assert_eq!(second.updated + second.pulled + second.pushed, 0);
    assert!(!second.local_written);
    assert!(!second.remote_written);
    assert_eq!(h.sheets.write_count(), writes);
    assert_eq!(h.local().await, before);
}

#[tokio::test]
async fn newer_remote_edit_replaces_local() {
    let h = Harness::new();
    let record = withdrawal(100.0, "", ts("2024-01-31T08:00:00Z"));
    h.store().append(&record).await.unwrap();
    h.sync(SyncMode::Both, false).await;

    h.edit_remote(|rows| {
        rows[1][AMOUNT_COL] = json!("450");
        rows[1][UPDATED_COL] = json!("2024-01-31T12:00:00.000Z");
    });
    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.updated, 1);
    assert!(summary.local_written);

    let local = h.local().await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, record.id);
    assert!((amount_of(&local[0]) - 450.0).abs() < f64::EPSILON);
    assert_eq!(local[0].updated_at, ts("2024-01-31T12:00:00Z"));
    assert_eq!(local[0].created_at, record.created_at);
}

#[tokio::test]
async fn newer_local_edit_replaces_remote() {
    let h = Harness::new();
    let record = withdrawal(100.0, "", ts("2024-01-31T08:00:00Z"));
    h.store().append(&record).await.unwrap();
    h.sync(SyncMode::Both, false).await;

    let mut edited = record.clone();
    edited.payload = Payload::Withdraw(Withdraw {
        amount: 120.0,
        note: "corrected".into(),
    });
    edited.updated_at = ts("2024-01-31T10:00:00Z");
    {
        let mut guard = h.store().lock(RecordKind::Withdraw).await;
        guard.rewrite(&[edited.clone()]).await.unwrap();
    }

    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.updated, 1);
    assert!(summary.remote_written);
    assert!(!summary.local_written);

    let rows = h.remote_rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(codec::parse_amount(&rows[0][AMOUNT_COL]), 120.0);
    assert_eq!(rows[0][5], json!("corrected"));
}

#[tokio::test]
async fn pull_never_writes_the_mirror() {
    let h = Harness::new();
    h.store()
        .append(&withdrawal(10.0, "", ts("2024-01-31T08:00:00Z")))
        .await
        .unwrap();
    let summary = h.sync(SyncMode::Pull, false).await;
    assert!(!summary.remote_written);
    assert_eq!(h.sheets.call_count(MemoryOp::WriteRows), 0);
    assert_eq!(h.local().await.len(), 1);
}

#[tokio::test]
async fn hand_typed_row_without_id_is_adopted_and_stamped() {
    let h = Harness::new();
    h.sheets.set_table(
        TABLE,
        vec![
            ["id", "business_date", "created_at", "updated_at", "amount", "note"]
                .map(Value::from)
                .to_vec(),
            vec![json!(""), json!("01/02/2024"), json!(""), json!(""), json!("250"), json!("petty")],
        ],
    );

    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.pulled, 1);
    assert!(summary.local_written);
    assert!(summary.remote_written);

    let local = h.local().await;
    assert_eq!(local.len(), 1);
    assert!(local[0].id.starts_with("wd_r"), "id was {}", local[0].id);
    assert_eq!(local[0].date, "2024-02-01");
    assert!((amount_of(&local[0]) - 250.0).abs() < f64::EPSILON);

    let rows = h.remote_rows();
    assert_eq!(rows[0][0], json!(local[0].id));

    // The stamped id is stable across passes.
    let again = h.sync(SyncMode::Both, false).await;
    assert_eq!(again.pulled, 0);
    assert!(!again.remote_written);
    assert_eq!(h.local().await[0].id, local[0].id);
}

fn header_row() -> Vec<Value> {
    ["id", "business_date", "created_at", "updated_at", "amount", "note"]
        .map(Value::from)
        .to_vec()
}

#[tokio::test]
async fn deletion_requires_explicit_permission() {
    let h = Harness::new();
    let keep = withdrawal(60.0, "", ts("2024-01-31T08:00:00Z"));
    let gone = withdrawal(80.0, "", ts("2024-01-31T09:00:00Z"));
    h.store().append(&keep).await.unwrap();
    h.store().append(&gone).await.unwrap();
    h.sync(SyncMode::Both, false).await;
    h.edit_remote(|rows| {
        rows.retain(|row| row[0] != json!(gone.id));
    });

    let kept = h.sync(SyncMode::Pull, false).await;
    assert_eq!(kept.deleted, 0);
    assert_eq!(h.local().await.len(), 2);

    let dropped = h.sync(SyncMode::Pull, true).await;
    assert_eq!(dropped.deleted, 1);
    let local = h.local().await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, keep.id);
}

#[tokio::test]
async fn emptied_mirror_table_never_deletes_the_ledger() {
    let h = Harness::new();
    h.store()
        .append(&withdrawal(60.0, "", ts("2024-01-31T08:00:00Z")))
        .await
        .unwrap();
    h.sync(SyncMode::Both, false).await;

    h.edit_remote(|rows| rows.truncate(1));
    let header_only = h.sync(SyncMode::Pull, true).await;
    assert_eq!(header_only.deleted, 0);
    assert_eq!(h.local().await.len(), 1);

    h.sheets.set_table(TABLE, Vec::new());
    let blank = h.sync(SyncMode::Both, true).await;
    assert_eq!(blank.deleted, 0);
    assert_eq!(blank.pushed, 1);
    assert_eq!(h.local().await.len(), 1);
    assert_eq!(h.remote_rows().len(), 1);
}

#[tokio::test]
async fn failed_remote_write_never_empties_the_ledger() {
    let h = Harness::new();
    for (i, amount) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        let at = ts("2024-01-31T08:00:00Z") + Duration::minutes(i as i64);
        h.store().append(&withdrawal(amount, "", at)).await.unwrap();
    }

    h.sheets.fail_next(MemoryOp::WriteRows, 1);
    let failed = h
        .engine
        .sync_kind(RecordKind::Withdraw, SyncOptions::default())
        .await;
    assert!(failed.is_err());
    assert_eq!(h.sheets.raw_table(TABLE).unwrap(), vec![header_row()]);

    let pulled = h.sync(SyncMode::Pull, true).await;
    assert_eq!(pulled.deleted, 0);
    assert_eq!(h.local().await.len(), 3);

    let pushed = h.sync(SyncMode::Both, false).await;
    assert_eq!(pushed.pushed, 3);
    assert_eq!(h.remote_rows().len(), 3);
}

#[tokio::test]
async fn remote_write_failure_after_local_merge_is_reported_per_kind() {
    let h = Harness::new();
    let local_only = withdrawal(15.0, "", ts("2024-01-31T07:00:00Z"));
    h.store().append(&local_only).await.unwrap();
    let hand_typed = vec![json!(""), json!("2024-01-31"), json!(""), json!(""), json!("90"), json!("")];
    h.sheets.set_table(TABLE, vec![header_row(), hand_typed.clone()]);

    h.sheets.fail_next(MemoryOp::WriteRows, 1);
    let results = h
        .engine
        .sync_many(&[RecordKind::Withdraw], SyncOptions::default())
        .await;
    assert_eq!(results.len(), 1);
    let KindOutcome::Failed { error } = &results[0].outcome else {
        panic!("expected a failure, got {:?}", results[0].outcome);
    };
    assert!(error.contains("injected"), "{error}");

    // The local merge already landed; the mirror still holds what staff typed.
    let local = h.local().await;
    assert_eq!(local.len(), 2);
    assert!(local.iter().any(|r| r.id == local_only.id));
    assert!(local.iter().any(|r| r.id.starts_with("wd_r")));
    assert_eq!(h.sheets.raw_table(TABLE).unwrap(), vec![header_row(), hand_typed]);

    let retried = h.sync(SyncMode::Both, false).await;
    assert_eq!(retried.pulled, 0);
    assert_eq!(retried.pushed, 1);
    assert!(retried.remote_written);
    assert!(!retried.local_written);
    let remote_ids: Vec<Value> = h.remote_rows().into_iter().map(|row| row[0].clone()).collect();
    let local_ids: Vec<Value> = h.local().await.iter().map(|r| json!(r.id)).collect();
    assert_eq!(remote_ids, local_ids);
}

#[tokio::test]
async fn identical_hand_typed_rows_are_all_kept() {
    let h = Harness::new();
    let bread = vec![json!(""), json!("2024-01-31"), json!(""), json!(""), json!("50"), json!("bread")];
    h.sheets
        .set_table(TABLE, vec![header_row(), bread.clone(), bread]);

    let summary = h.sync(SyncMode::Pull, false).await;
    assert_eq!(summary.pulled, 2);
    assert_eq!(summary.conflicts, 0);
    assert_eq!(summary.synthesized, 2);
    let local = h.local().await;
    assert_eq!(local.len(), 2);
    assert_ne!(local[0].id, local[1].id);

    // Re-reading the untouched sheet maps both rows onto the same records.
    let again = h.sync(SyncMode::Pull, false).await;
    assert_eq!(again.pulled, 0);
    assert!(!again.local_written);

    let stamped = h.sync(SyncMode::Both, false).await;
    assert!(stamped.remote_written);
    assert_eq!(h.remote_rows().len(), 2);
}

#[tokio::test]
async fn pull_only_adoption_leaves_ids_out_of_the_mirror() {
    let h = Harness::new();
    let row = vec![json!(""), json!("2024-01-31"), json!(""), json!(""), json!("70"), json!("")];
    h.sheets.set_table(TABLE, vec![header_row(), row]);

    let pulled = h.sync(SyncMode::Pull, false).await;
    assert_eq!(pulled.synthesized, 1);
    assert!(!pulled.remote_written);
    assert_eq!(h.remote_rows()[0][0], json!(""));

    let both = h.sync(SyncMode::Both, false).await;
    assert_eq!(both.synthesized, 1);
    assert!(both.remote_written);
    assert_eq!(h.remote_rows()[0][0], json!(h.local().await[0].id));

    let quiet = h.sync(SyncMode::Pull, false).await;
    assert_eq!(quiet.synthesized, 0);
}

#[tokio::test]
async fn push_restores_rows_removed_remotely_unless_deleting() {
    let h = Harness::new();
    h.store()
        .append(&withdrawal(60.0, "", ts("2024-01-31T08:00:00Z")))
        .await
        .unwrap();
    h.sync(SyncMode::Both, false).await;
    h.edit_remote(|rows| rows.truncate(1));

    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.pushed, 1);
    assert_eq!(h.remote_rows().len(), 1);
}

#[tokio::test]
async fn failed_mirror_read_leaves_ledger_untouched() {
    let h = Harness::new();
    h.store()
        .append(&withdrawal(30.0, "", ts("2024-01-31T08:00:00Z")))
        .await
        .unwrap();
    let path = h.store().path_for(RecordKind::Withdraw);
    let before = std::fs::read(&path).unwrap();

    h.sheets.fail_next(MemoryOp::ReadRows, 1);
    let err = h
        .engine
        .sync_kind(RecordKind::Withdraw, SyncOptions::default())
        .await;
    assert!(err.is_err());
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert!(h.sheets.raw_table(TABLE).is_none_or(|rows| rows.len() <= 1));
}

#[tokio::test]
async fn manual_edit_with_same_stamp_is_adopted() {
    let h = Harness::new();
    let record = withdrawal(100.0, "", ts("2024-01-31T08:00:00Z"));
    h.store().append(&record).await.unwrap();
    h.sync(SyncMode::Both, false).await;

    h.edit_remote(|rows| rows[1][AMOUNT_COL] = json!("1,100"));
    let started = Utc::now() - Duration::seconds(1);
    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.updated, 1);
    assert!(summary.local_written);
    assert!(summary.remote_written);

    let local = h.local().await;
    assert!((amount_of(&local[0]) - 1100.0).abs() < f64::EPSILON);
    assert_eq!(local[0].created_at, record.created_at);
    assert!(local[0].updated_at > started);

    // The adopted stamp went back to the mirror, so the next pass is quiet.
    let quiet = h.sync(SyncMode::Both, false).await;
    assert_eq!(quiet.updated, 0);
    assert!(!quiet.local_written && !quiet.remote_written);
}

#[tokio::test]
async fn manual_edit_loses_to_push() {
    let h = Harness::new();
    let record = withdrawal(100.0, "", ts("2024-01-31T08:00:00Z"));
    h.store().append(&record).await.unwrap();
    h.sync(SyncMode::Both, false).await;

    h.edit_remote(|rows| rows[1][AMOUNT_COL] = json!("999"));
    let summary = h.sync(SyncMode::Push, false).await;
    assert!(summary.remote_written);
    assert!(!summary.local_written);
    assert_eq!(codec::parse_amount(&h.remote_rows()[0][AMOUNT_COL]), 100.0);
    assert!((amount_of(&h.local().await[0]) - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn torn_tail_line_does_not_block_sync() {
    let h = Harness::new();
    let record = withdrawal(40.0, "", ts("2024-01-31T08:00:00Z"));
    h.store().append(&record).await.unwrap();
    let path = h.store().path_for(RecordKind::Withdraw);
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(br#"{"id":"wd_torn","dateISO":"2024-01-3"#);
    std::fs::write(&path, bytes).unwrap();

    let summary = h.sync(SyncMode::Both, false).await;
    assert_eq!(summary.total, 1);
    assert_eq!(h.remote_rows().len(), 1);
    assert_eq!(h.local().await[0].id, record.id);
}
