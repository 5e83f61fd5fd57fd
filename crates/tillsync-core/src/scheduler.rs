//! Sync passes: manual triggers over many kinds, and a background poller.
//!
//! Passes for the same kind never overlap. Manual passes wait for the kind's
//! pass lock; poller ticks skip kinds that are busy. Different kinds run
//! concurrently.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::codec::BusinessClock;
use crate::error::Result;
use crate::mirror::MirrorClient;
use crate::reconcile::{SyncMode, SyncSummary, reconcile_kind};
use crate::record::RecordKind;
use crate::store::LedgerStore;

/// One lock per record kind, held for the duration of a pass (and of each
/// write-path mirror append).
#[derive(Debug)]
pub struct PassLocks {
    locks: [Mutex<()>; RecordKind::COUNT],
}

impl Default for PassLocks {
    fn default() -> Self {
        Self {
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }
}

impl PassLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, kind: RecordKind) -> MutexGuard<'_, ()> {
        self.locks[kind.index()].lock().await
    }

    /// `None` when a pass for `kind` is already running.
    #[must_use]
    pub fn try_acquire(&self, kind: RecordKind) -> Option<MutexGuard<'_, ()>> {
        self.locks[kind.index()].try_lock().ok()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub allow_delete: bool,
}

impl SyncOptions {
    /// Background default: pull only.
    #[must_use]
    pub fn poll(allow_delete: bool) -> Self {
        Self {
            mode: SyncMode::Pull,
            allow_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KindOutcome {
    Synced { summary: SyncSummary },
    /// Another pass held the kind's lock.
    Skipped,
    Failed { error: String },
}

/// Result of one kind within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSyncResult {
    pub kind: RecordKind,
    #[serde(flatten)]
    pub outcome: KindOutcome,
}

impl KindSyncResult {
    fn from_result(kind: RecordKind, result: Result<SyncSummary>) -> Self {
        let outcome = match result {
            Ok(summary) => KindOutcome::Synced { summary },
            Err(e) => {
                warn!(%kind, error = %e, "sync pass failed");
                KindOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        Self { kind, outcome }
    }

    #[must_use]
    pub fn summary(&self) -> Option<&SyncSummary> {
        match &self.outcome {
            KindOutcome::Synced { summary } => Some(summary),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, KindOutcome::Failed { .. })
    }
}

/// Runs reconciliation passes against shared store and mirror handles.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    store: Arc<LedgerStore>,
    mirror: Arc<MirrorClient>,
    locks: Arc<PassLocks>,
    clock: BusinessClock,
}

impl SyncEngine {
    #[must_use]
    pub fn new(store: Arc<LedgerStore>, mirror: Arc<MirrorClient>, clock: BusinessClock) -> Self {
        Self {
            store,
            mirror,
            locks: Arc::new(PassLocks::new()),
            clock,
        }
    }

    /// Pass locks, shared with the write-path mirror worker.
    #[must_use]
    pub fn pass_locks(&self) -> Arc<PassLocks> {
        Arc::clone(&self.locks)
    }

    #[must_use]
    pub fn mirror(&self) -> &Arc<MirrorClient> {
        &self.mirror
    }

    #[must_use]
    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// One kind, waiting for any running pass on it to finish.
    pub async fn sync_kind(&self, kind: RecordKind, options: SyncOptions) -> Result<SyncSummary> {
        let _pass = self.locks.acquire(kind).await;
        self.run_pass(kind, options).await
    }

    /// Every kind in `kinds` concurrently. Failures are reported per kind and
    /// never stop the others.
    pub async fn sync_many(&self, kinds: &[RecordKind], options: SyncOptions) -> Vec<KindSyncResult> {
        let passes = kinds.iter().map(|&kind| async move {
            KindSyncResult::from_result(kind, self.sync_kind(kind, options).await)
        });
        join_all(passes).await
    }

    /// Poller tick: pull every kind that is not already being synced.
    pub async fn poll_once(&self, allow_delete: bool) -> Vec<KindSyncResult> {
        let options = SyncOptions::poll(allow_delete);
        let passes = RecordKind::ALL.iter().map(|&kind| async move {
            let Some(_pass) = self.locks.try_acquire(kind) else {
                debug!(%kind, "pass already running; skipping tick");
                return KindSyncResult {
                    kind,
                    outcome: KindOutcome::Skipped,
                };
            };
            KindSyncResult::from_result(kind, self.run_pass(kind, options).await)
        });
        join_all(passes).await
    }

    async fn run_pass(&self, kind: RecordKind, options: SyncOptions) -> Result<SyncSummary> {
        reconcile_kind(
            &self.store,
            &self.mirror,
            &self.clock,
            kind,
            options.mode,
            options.allow_delete,
        )
        .await
    }
}

/// Handle to the background poller task.
pub struct PollerHandle {
    task: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollerHandle {
    /// Ask the poller to stop after the current tick.
    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Wait for the poller task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }

    /// Signal and wait.
    pub async fn shutdown(self) {
        self.signal_shutdown();
        self.join().await;
    }
}

/// Start the background poller: a pull pass over every kind each
/// `interval`, first one after a full interval. A zero interval means no
/// poller.
#[must_use]
pub fn spawn_poller(
    engine: Arc<SyncEngine>,
    interval: Duration,
    allow_delete: bool,
) -> Option<PollerHandle> {
    if interval.is_zero() {
        return None;
    }
    if !engine.mirror().is_enabled() {
        info!("mirror disabled; background sync not started");
        return None;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let flag = Arc::clone(&shutdown);
    let notified = Arc::clone(&wake);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = interval.as_secs(), allow_delete, "background sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = notified.notified() => {}
            }
            if flag.load(Ordering::SeqCst) {
                info!("background sync shutting down");
                break;
            }
            let results = engine.poll_once(allow_delete).await;
            let failed = results.iter().filter(|r| r.is_failed()).count();
            let pulled: usize = results
                .iter()
                .filter_map(KindSyncResult::summary)
                .map(|s| s.pulled + s.updated)
                .sum();
            debug!(failed, pulled, "background sync tick");
        }
    });

    Some(PollerHandle {
        task,
        shutdown,
        wake,
    })
}
