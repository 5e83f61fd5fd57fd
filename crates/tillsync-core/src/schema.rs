//! Per-kind table layout and the record <-> row mapping.
//!
//! Every mirror table starts with the same four columns
//! (`id, business_date, created_at, updated_at`) followed by the kind's own
//! columns. Rows read back from the mirror are keyed by lower-cased header
//! name so hand-reordered columns still decode.
//!
//! Rows typed into the sheet without an id get one derived from their
//! content and their position among identical id-less rows. Until a pass
//! that writes the mirror stores that id in the row, a hand edit to the row
//! changes the derived id; a pull-only pass then sees a new record next to
//! the old one.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::codec::{self, BusinessClock};
use crate::record::{
    CashCount, CashSession, CreditPayment, CreditPurchase, Expense, MobileLedgerEntry, Order,
    OrderPayment, OrderStatusEvent, Payload, PaymentMethod, Record, RecordKind, Sale, Withdraw,
    ORDER_STATUS_PENDING,
};

/// A decoded mirror row: lower-cased header -> cell.
pub type Row = BTreeMap<String, Value>;

/// Columns shared by every table, in order.
pub const COMMON_HEADERS: [&str; 4] = ["id", "business_date", "created_at", "updated_at"];

/// Table name and column order for one record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub kind: RecordKind,
    pub table: &'static str,
    pub headers: &'static [&'static str],
}

impl TableSchema {
    /// Owned header row, ready to send to the mirror.
    #[must_use]
    pub fn header_row(&self) -> Vec<String> {
        self.headers.iter().map(|h| (*h).to_string()).collect()
    }
}

static SCHEMAS: [TableSchema; RecordKind::COUNT] = [
    TableSchema {
        kind: RecordKind::Sale,
        table: "Sales",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "amount", "method", "note",
            "product", "quantity", "unit_price", "till_number", "created_by",
        ],
    },
    TableSchema {
        kind: RecordKind::Expense,
        table: "Expenses",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "amount", "category", "method",
            "note", "item",
        ],
    },
    TableSchema {
        kind: RecordKind::Credit,
        table: "Credit",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "customer", "amount", "note",
            "product", "quantity", "price",
        ],
    },
    TableSchema {
        kind: RecordKind::CreditPayment,
        table: "CreditPayments",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "customer", "amount", "method",
            "note",
        ],
    },
    TableSchema {
        kind: RecordKind::Order,
        table: "Orders",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "customer", "phone", "items",
            "total", "status", "note",
        ],
    },
    TableSchema {
        kind: RecordKind::OrderStatus,
        table: "OrderStatus",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "order_id", "status", "note",
        ],
    },
    TableSchema {
        kind: RecordKind::OrderPayment,
        table: "OrderPayments",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "order_id", "amount", "method",
            "note",
        ],
    },
    TableSchema {
        kind: RecordKind::CashCount,
        table: "CashCount",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "session", "cash_total",
            "denominations_json", "note",
        ],
    },
    TableSchema {
        kind: RecordKind::Withdraw,
        table: "Withdraw",
        headers: &["id", "business_date", "created_at", "updated_at", "amount", "note"],
    },
    TableSchema {
        kind: RecordKind::MobileLedger,
        table: "MobileLedger",
        headers: &[
            "id", "business_date", "created_at", "updated_at", "channel", "opening_balance",
            "outflow_withdrawn", "closing_balance_actual", "note",
        ],
    },
];

/// Schema for a kind.
#[must_use]
pub fn schema_for(kind: RecordKind) -> &'static TableSchema {
    &SCHEMAS[kind.index()]
}

/// Encode a record into cells matching its table's header order.
#[must_use]
pub fn to_row(record: &Record) -> Vec<Value> {
    let mut row = vec![
        Value::String(record.id.clone()),
        Value::String(record.date.clone()),
        Value::String(codec::format_timestamp(&record.created_at)),
        Value::String(codec::format_timestamp(&record.updated_at)),
    ];
    let tail = match &record.payload {
        Payload::Sale(s) => vec![
            num(s.amount),
            method(s.method),
            text(&s.note),
            text(&s.product),
            num(s.quantity),
            num(s.unit_price),
            text(&s.till_number),
            text(&s.created_by),
        ],
        Payload::Expense(e) => vec![
            num(e.amount),
            text(&e.category),
            method(e.method),
            text(&e.note),
            text(&e.item),
        ],
        Payload::Credit(c) => vec![
            text(&c.customer),
            num(c.amount),
            text(&c.note),
            text(&c.product),
            num(c.quantity),
            num(c.price),
        ],
        Payload::CreditPayment(p) => vec![
            text(&p.customer),
            num(p.amount),
            method(p.method),
            text(&p.note),
        ],
        Payload::Order(o) => vec![
            text(&o.customer),
            text(&o.phone),
            text(&o.items),
            num(o.total),
            text(&o.status),
            text(&o.note),
        ],
        Payload::OrderStatus(s) => vec![text(&s.order_id), text(&s.status), text(&s.note)],
        Payload::OrderPayment(p) => vec![
            text(&p.order_id),
            num(p.amount),
            method(p.method),
            text(&p.note),
        ],
        Payload::CashCount(c) => vec![
            text(c.session.as_str()),
            num(c.cash_total),
            Value::String(serde_json::to_string(&c.denominations).unwrap_or_default()),
            text(&c.note),
        ],
        Payload::Withdraw(w) => vec![num(w.amount), text(&w.note)],
        Payload::MobileLedger(m) => vec![
            text(&m.channel),
            num(m.opening_balance),
            num(m.outflow_withdrawn),
            m.closing_balance_actual.map_or_else(|| text(""), num),
            text(&m.note),
        ],
    };
    row.extend(tail);
    row
}

/// Zip a header row with a value row into a [`Row`].
///
/// Blank header cells are skipped; missing trailing values are left out so
/// lookups fall back to defaults.
#[must_use]
pub fn row_from_cells(headers: &[String], cells: &[Value]) -> Row {
    headers
        .iter()
        .zip(cells.iter())
        .filter_map(|(header, cell)| {
            let key = header_key(header);
            (!key.is_empty()).then(|| (key, cell.clone()))
        })
        .collect()
}

/// Normalized lookup key for a header cell.
#[must_use]
pub fn header_key(header: &str) -> String {
    header.trim().to_lowercase()
}

/// A record decoded from the mirror.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub record: Record,
    /// The row had no id; one was derived from its content.
    pub synthesized_id: bool,
}

/// Decode every row of a table.
///
/// Identical id-less rows are separate entries, so each gets its own id:
/// the n-th copy mixes `n` into the digest.
#[must_use]
pub fn from_rows(kind: RecordKind, rows: &[Row], clock: &BusinessClock) -> Vec<RowRecord> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    rows.iter()
        .map(|row| {
            let mut decoded = from_row(kind, row, clock);
            if decoded.synthesized_id {
                let copies = seen.entry(decoded.record.id.clone()).or_insert(0);
                if *copies > 0 {
                    decoded.record.id = synthesize_id(kind, row, *copies);
                }
                *copies += 1;
            }
            decoded
        })
        .collect()
}

/// Decode a mirror row into a canonical record.
///
/// Missing values take defaults: today for the business date, midnight of the
/// business date for `created_at`, `created_at` for `updated_at`. A row
/// without an id gets a deterministic one derived from its content, so
/// repeated reads of the same untouched row agree.
#[must_use]
pub fn from_row(kind: RecordKind, row: &Row, clock: &BusinessClock) -> RowRecord {
    let raw_created = codec::parse_timestamp(cell(row, "created_at"));
    let raw_updated = codec::parse_timestamp(cell(row, "updated_at"));

    let date_cell = cell(row, "business_date");
    let date = match (codec::cell_text(date_cell).is_empty(), raw_created) {
        (true, Some(created)) => created.date_naive().format("%Y-%m-%d").to_string(),
        _ => codec::parse_date(date_cell, clock),
    };

    let created_at = raw_created.or(raw_updated).unwrap_or_else(|| midnight_of(&date));
    let updated_at = raw_updated.unwrap_or(created_at).max(created_at);

    let id_text = codec::cell_text(cell(row, "id"));
    let synthesized_id = id_text.is_empty();
    let id = if synthesized_id {
        synthesize_id(kind, row, 0)
    } else {
        id_text
    };

    RowRecord {
        record: Record {
            id,
            date,
            created_at,
            updated_at,
            payload: payload_from_row(kind, row),
        },
        synthesized_id,
    }
}

/// Decode only the kind-specific columns.
///
/// Also used by the CLI to build payloads from loosely typed JSON objects,
/// which is why amounts accept grouping separators and localized digits.
#[must_use]
pub fn payload_from_row(kind: RecordKind, row: &Row) -> Payload {
    match kind {
        RecordKind::Sale => Payload::Sale(Sale {
            amount: amount(row, "amount"),
            method: method_of(row),
            note: string(row, "note"),
            product: string(row, "product"),
            quantity: quantity(row, "quantity"),
            unit_price: amount(row, "unit_price"),
            till_number: codec::cell_text(cell(row, "till_number")),
            created_by: string(row, "created_by"),
        }),
        RecordKind::Expense => Payload::Expense(Expense {
            amount: amount(row, "amount"),
            category: string(row, "category"),
            method: method_of(row),
            note: string(row, "note"),
            item: string(row, "item"),
        }),
        RecordKind::Credit => Payload::Credit(CreditPurchase {
            customer: string(row, "customer"),
            amount: amount(row, "amount"),
            note: string(row, "note"),
            product: string(row, "product"),
            quantity: quantity(row, "quantity"),
            price: amount(row, "price"),
        }),
        RecordKind::CreditPayment => Payload::CreditPayment(CreditPayment {
            customer: string(row, "customer"),
            amount: amount(row, "amount"),
            method: method_of(row),
            note: string(row, "note"),
        }),
        RecordKind::Order => Payload::Order(Order {
            customer: string(row, "customer"),
            phone: codec::cell_text(cell(row, "phone")),
            items: string(row, "items"),
            total: amount(row, "total"),
            status: status(row),
            note: string(row, "note"),
        }),
        RecordKind::OrderStatus => Payload::OrderStatus(OrderStatusEvent {
            order_id: codec::cell_text(cell(row, "order_id")),
            status: status(row),
            note: string(row, "note"),
        }),
        RecordKind::OrderPayment => Payload::OrderPayment(OrderPayment {
            order_id: codec::cell_text(cell(row, "order_id")),
            amount: amount(row, "amount"),
            method: method_of(row),
            note: string(row, "note"),
        }),
        RecordKind::CashCount => Payload::CashCount(CashCount {
            session: CashSession::from(codec::cell_text(cell(row, "session"))),
            denominations: denominations(row),
            cash_total: amount(row, "cash_total"),
            note: string(row, "note"),
        }),
        RecordKind::Withdraw => Payload::Withdraw(Withdraw {
            amount: amount(row, "amount"),
            note: string(row, "note"),
        }),
        RecordKind::MobileLedger => Payload::MobileLedger(MobileLedgerEntry {
            channel: codec::cell_text(cell(row, "channel")),
            opening_balance: amount(row, "opening_balance"),
            outflow_withdrawn: amount(row, "outflow_withdrawn"),
            closing_balance_actual: optional_amount(row, "closing_balance_actual"),
            note: string(row, "note"),
        }),
    }
}

/// `<prefix>_r<12 hex>` from a SHA-256 over the kind and the row's cells,
/// excluding the (empty) id column. `copy` is 0 for the first of several
/// identical rows.
fn synthesize_id(kind: RecordKind, row: &Row, copy: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    for (key, value) in row {
        if key == "id" {
            continue;
        }
        hasher.update(b"\x1f");
        hasher.update(key.as_bytes());
        hasher.update(b"\x1e");
        hasher.update(codec::cell_text(value).as_bytes());
    }
    if copy > 0 {
        hasher.update(b"\x1d");
        hasher.update(copy.to_string().as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}_r{}", kind.id_prefix(), &digest[..12])
}

fn midnight_of(date: &str) -> DateTime<Utc> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map_or(DateTime::UNIX_EPOCH, |naive| naive.and_utc())
}

fn cell<'a>(row: &'a Row, key: &str) -> &'a Value {
    row.get(key).unwrap_or(&Value::Null)
}

/// Free text is kept verbatim, including surrounding whitespace.
fn string(row: &Row, key: &str) -> String {
    match cell(row, key) {
        Value::String(s) => s.clone(),
        other => codec::cell_text(other),
    }
}

fn amount(row: &Row, key: &str) -> f64 {
    codec::parse_amount(cell(row, key))
}

fn optional_amount(row: &Row, key: &str) -> Option<f64> {
    let value = cell(row, key);
    (!codec::cell_text(value).is_empty()).then(|| codec::parse_amount(value))
}

/// Quantities default to 1 when the cell is blank.
fn quantity(row: &Row, key: &str) -> f64 {
    optional_amount(row, key).unwrap_or(1.0)
}

fn method_of(row: &Row) -> PaymentMethod {
    PaymentMethod::normalize(&codec::cell_text(cell(row, "method")))
}

fn status(row: &Row) -> String {
    let status = codec::cell_text(cell(row, "status"));
    if status.is_empty() {
        ORDER_STATUS_PENDING.to_string()
    } else {
        status
    }
}

/// Denominations arrive as a JSON object or as the JSON text of one.
fn denominations(row: &Row) -> BTreeMap<String, f64> {
    let parsed = match row.get("denominations_json").or_else(|| row.get("denominations")) {
        Some(Value::String(text)) if !text.trim().is_empty() => {
            serde_json::from_str::<Value>(text).unwrap_or(Value::Null)
        }
        Some(value) => value.clone(),
        None => Value::Null,
    };
    match parsed {
        Value::Object(map) => map
            .iter()
            .map(|(note, count)| (note.clone(), codec::parse_amount(count)))
            .collect(),
        _ => BTreeMap::new(),
    }
}

fn num(value: f64) -> Value {
    Value::from(value)
}

fn text(value: &str) -> Value {
    Value::String(value.to_string())
}

fn method(value: PaymentMethod) -> Value {
    text(value.as_str())
}
