//! tillsync-core: Core library for tillsync
//!
//! Keeps a bakery's bookkeeping records (sales, expenses, credit, orders,
//! cash counts, mobile money) in a local append-only ledger and mirrors them
//! to a spreadsheet that staff may also edit by hand.
//!
//! # Architecture
//!
//! ```text
//! write path ──► Ledger ──► LedgerStore (jsonl per kind)
//!                   │
//!                   └─► MirrorJob queue ──► MirrorClient.append_row
//!
//! SyncEngine (manual / poller) ──► reconcile_kind
//!        read mirror ─► plan_merge ─► rewrite ledger ─► replace mirror table
//! ```
//!
//! # Modules
//!
//! - `codec`: lenient date, amount and timestamp parsing
//! - `record`: record kinds, typed payloads, id generation
//! - `schema`: per-kind table layout, record <-> row mapping
//! - `store`: JSON-lines ledger with per-kind write locks
//! - `mirror`: spreadsheet transport trait, HTTP and in-memory transports
//! - `reconcile`: last-write-wins merge of one kind
//! - `scheduler`: concurrent sync passes and the background poller
//! - `ledger`: write path with background mirroring
//! - `config`: `tillsync.toml` + environment overrides
//! - `logging`: tracing subscriber setup
//! - `retry`: backoff for transient mirror failures
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod mirror;
pub mod reconcile;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use error::{Error, MirrorError, Result, StoreError};
pub use ledger::{AppendOutcome, Ledger};
pub use reconcile::{SyncMode, SyncSummary};
pub use record::{Payload, Record, RecordKind};
pub use scheduler::{KindSyncResult, SyncEngine, SyncOptions};
pub use store::LedgerStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
