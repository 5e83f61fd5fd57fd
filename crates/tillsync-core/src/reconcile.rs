//! Two-way reconciliation of one record kind.
//!
//! [`plan_merge`] is the pure decision step: given the local ledger and the
//! decoded mirror rows it produces the merged record set, counters, and which
//! sides need writing. [`reconcile_kind`] wraps it with I/O: read remote,
//! read local under the store write lock, rewrite local, replace remote.
//!
//! Conflict rule is last-write-wins on `updated_at`. A row whose stamps equal
//! the local copy but whose business fields differ was edited by hand in the
//! spreadsheet; outside push-only passes that edit is adopted and re-stamped.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{self, BusinessClock};
use crate::error::Result;
use crate::mirror::{MirrorClient, Table};
use crate::record::{Record, RecordKind};
use crate::schema::{self, RowRecord};
use crate::store::LedgerStore;

/// Direction of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Remote into local; the mirror is not written.
    Pull,
    /// Local into remote; the ledger is not written.
    Push,
    #[default]
    Both,
}

impl SyncMode {
    #[must_use]
    pub fn writes_local(self) -> bool {
        self != Self::Push
    }

    #[must_use]
    pub fn writes_remote(self) -> bool {
        self != Self::Pull
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pull" => Ok(Self::Pull),
            "push" => Ok(Self::Push),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown sync mode: {other} (expected pull, push or both)")),
        }
    }
}

/// Counters for one reconciled kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub kind: Option<RecordKind>,
    /// Remote-only records adopted locally.
    pub pulled: usize,
    /// Local-only records sent to the mirror.
    pub pushed: usize,
    /// Records present on both sides where one side replaced the other.
    pub updated: usize,
    /// Records dropped because the other side no longer has them.
    pub deleted: usize,
    /// Remote rows that collided on an explicit id.
    pub conflicts: usize,
    /// Remote rows that arrived without an id.
    pub synthesized: usize,
    /// Records in the merged set.
    pub total: usize,
    /// The local ledger was rewritten.
    pub local_written: bool,
    /// The mirror table was replaced.
    pub remote_written: bool,
}

/// Outcome of [`plan_merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    /// Merged set, sorted by `(date, created_at, id)`.
    pub records: Vec<Record>,
    pub summary: SyncSummary,
    /// Local ledger differs from `records`.
    pub local_dirty: bool,
    /// Mirror table differs from `records`.
    pub remote_dirty: bool,
}

/// Merge `local` and `remote` for one kind. Pure; `now` stamps adopted
/// manual edits.
#[must_use]
pub fn plan_merge(
    kind: RecordKind,
    local: Vec<Record>,
    remote: Vec<RowRecord>,
    mode: SyncMode,
    allow_delete: bool,
    now: DateTime<Utc>,
) -> MergePlan {
    let mut summary = SyncSummary {
        kind: Some(kind),
        ..SyncSummary::default()
    };
    let mut local_dirty = false;
    let mut remote_dirty = false;

    let remote_len = remote.len();
    let mut remote_by_id: BTreeMap<String, Record> = BTreeMap::new();
    for row in remote {
        if row.synthesized_id {
            // The mirror should learn the id we assigned.
            summary.synthesized += 1;
            remote_dirty = true;
        }
        match remote_by_id.entry(row.record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(row.record);
            }
            Entry::Occupied(mut slot) => {
                summary.conflicts += 1;
                remote_dirty = true;
                warn!(%kind, id = %row.record.id, "remote rows share an id; keeping the newest");
                if row.record.updated_at > slot.get().updated_at {
                    slot.insert(row.record);
                }
            }
        }
    }

    let mut local_by_id: BTreeMap<String, Record> = BTreeMap::new();
    for record in local {
        match local_by_id.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                local_dirty = true;
                if record.updated_at >= slot.get().updated_at {
                    slot.insert(record);
                }
            }
        }
    }

    let ids: BTreeSet<String> = remote_by_id
        .keys()
        .chain(local_by_id.keys())
        .cloned()
        .collect();

    let mut merged = Vec::with_capacity(ids.len());
    for id in ids {
        match (local_by_id.remove(&id), remote_by_id.remove(&id)) {
            (Some(local), Some(remote)) => {
                if remote.updated_at > local.updated_at {
                    if mode.writes_local() {
                        summary.updated += 1;
                        local_dirty = true;
                    }
                    merged.push(remote);
                } else if local.updated_at > remote.updated_at {
                    if mode.writes_remote() {
                        summary.updated += 1;
                        remote_dirty = true;
                    }
                    merged.push(local);
                } else if local.business_eq(&remote) && local.created_at == remote.created_at {
                    merged.push(local);
                } else if mode == SyncMode::Push {
                    summary.updated += 1;
                    remote_dirty = true;
                    merged.push(local);
                } else {
                    debug!(%kind, %id, "adopting manual remote edit");
                    let mut adopted = remote;
                    adopted.created_at = local.created_at;
                    adopted.updated_at = now.max(local.updated_at).max(adopted.created_at);
                    summary.updated += 1;
                    local_dirty = true;
                    remote_dirty = true;
                    merged.push(adopted);
                }
            }
            (None, Some(remote)) => match mode {
                SyncMode::Push if allow_delete => {
                    summary.deleted += 1;
                    remote_dirty = true;
                }
                SyncMode::Push => merged.push(remote),
                SyncMode::Pull | SyncMode::Both => {
                    summary.pulled += 1;
                    local_dirty = true;
                    merged.push(remote);
                }
            },
            (Some(local), None) => match mode {
                SyncMode::Pull if !allow_delete => merged.push(local),
                SyncMode::Pull | SyncMode::Both if allow_delete => {
                    summary.deleted += 1;
                    local_dirty = true;
                }
                SyncMode::Pull | SyncMode::Both | SyncMode::Push => {
                    summary.pushed += 1;
                    remote_dirty = true;
                    merged.push(local);
                }
            },
            (None, None) => {}
        }
    }

    merged.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then(a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    if merged.len() != remote_len && mode.writes_remote() {
        remote_dirty = true;
    }
    summary.total = merged.len();

    MergePlan {
        records: merged,
        summary,
        local_dirty,
        remote_dirty,
    }
}

/// Whether a mirror read is trustworthy enough to delete local records over.
///
/// A table with no `id` column or no data rows looks the same as one whose
/// last replace never landed; deleting against it would empty the ledger.
#[must_use]
pub fn deletions_safe_against(table: &Table) -> bool {
    table.headers.iter().any(|h| schema::header_key(h) == "id") && !table.rows.is_empty()
}

/// Reconcile one kind between the ledger and the mirror.
///
/// Nothing local is touched unless the mirror read succeeded, and nothing
/// local is deleted against an empty or headerless table. The store write
/// lock is held from the local read through the local rewrite, so an append
/// arriving mid-pass lands either before the snapshot or after the rewrite.
pub async fn reconcile_kind(
    store: &LedgerStore,
    mirror: &MirrorClient,
    clock: &BusinessClock,
    kind: RecordKind,
    mode: SyncMode,
    allow_delete: bool,
) -> Result<SyncSummary> {
    let table_schema = schema::schema_for(kind);
    let headers = table_schema.header_row();

    mirror.ensure_table(table_schema.table, &headers).await?;
    let table = mirror.read_table(table_schema.table).await?;
    let remote = schema::from_rows(kind, &table.rows, clock);

    let allow_delete = if allow_delete && mode.writes_local() && !deletions_safe_against(&table) {
        warn!(
            %kind,
            table = table_schema.table,
            "mirror table is empty or has no id column; not deleting local records this pass"
        );
        false
    } else {
        allow_delete
    };

    let mut guard = store.lock(kind).await;
    let local = guard.read_all().await?;
    let plan = plan_merge(kind, local, remote, mode, allow_delete, codec::now_ms());
    let mut summary = plan.summary;

    if mode.writes_local() && plan.local_dirty {
        guard.rewrite(&plan.records).await?;
        summary.local_written = true;
    }
    drop(guard);

    if !mode.writes_remote() && summary.synthesized > 0 {
        warn!(
            %kind,
            rows = summary.synthesized,
            "adopted rows without ids in a pull-only pass; run a two-way pass to store their ids in the mirror"
        );
    }

    if mode.writes_remote() && plan.remote_dirty {
        let rows = plan.records.iter().map(schema::to_row).collect();
        if let Err(e) = mirror
            .replace_table(table_schema.table, &headers, rows)
            .await
        {
            warn!(
                %kind,
                local_written = summary.local_written,
                pulled = summary.pulled,
                updated = summary.updated,
                deleted = summary.deleted,
                "mirror replace failed after the local merge; next pass retries it"
            );
            return Err(e);
        }
        summary.remote_written = true;
    }

    info!(
        %kind,
        %mode,
        pulled = summary.pulled,
        pushed = summary.pushed,
        updated = summary.updated,
        deleted = summary.deleted,
        conflicts = summary.conflicts,
        synthesized = summary.synthesized,
        total = summary.total,
        "reconciled"
    );
    Ok(summary)
}
