//! Canonical ledger records.
//!
//! A [`Record`] is the unit of synchronization: a handful of common fields
//! (id, business date, creation and update stamps) plus a [`Payload`] whose
//! variant decides the record kind. Records serialize to one JSON object per
//! ledger line with the payload flattened next to the common fields.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::codec::{self, BusinessClock};

/// Duplicate sales submitted within this window are dropped.
pub const DUPLICATE_SALE_WINDOW_MS: i64 = 1_500;

/// Category of bookkeeping fact. Each kind owns one ledger file and one
/// mirror table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Sale,
    Expense,
    Credit,
    CreditPayment,
    Order,
    OrderStatus,
    OrderPayment,
    CashCount,
    Withdraw,
    MobileLedger,
}

impl RecordKind {
    pub const COUNT: usize = 10;

    pub const ALL: [Self; Self::COUNT] = [
        Self::Sale,
        Self::Expense,
        Self::Credit,
        Self::CreditPayment,
        Self::Order,
        Self::OrderStatus,
        Self::OrderPayment,
        Self::CashCount,
        Self::Withdraw,
        Self::MobileLedger,
    ];

    /// Stable snake_case name, also used for ledger file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Expense => "expense",
            Self::Credit => "credit",
            Self::CreditPayment => "credit_payment",
            Self::Order => "order",
            Self::OrderStatus => "order_status",
            Self::OrderPayment => "order_payment",
            Self::CashCount => "cash_count",
            Self::Withdraw => "withdraw",
            Self::MobileLedger => "mobile_ledger",
        }
    }

    /// Prefix for locally generated ids.
    #[must_use]
    pub fn id_prefix(self) -> &'static str {
        match self {
            Self::Sale => "sale",
            Self::Expense => "exp",
            Self::Credit => "cr",
            Self::CreditPayment => "crp",
            Self::Order => "ord",
            Self::OrderStatus => "ost",
            Self::OrderPayment => "opy",
            Self::CashCount => "cc",
            Self::Withdraw => "wd",
            Self::MobileLedger => "led",
        }
    }

    /// Position in [`RecordKind::ALL`]; used to index per-kind lock tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown record kind: {s}. Expected one of: {}", names.join(", "))
            })
    }
}

/// Accepted payment channels. Anything unrecognized is booked as cash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentMethod {
    #[default]
    Cash,
    WithdrawCash,
    BuyGoods,
    SendMoney,
    TillNo,
}

impl PaymentMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "Cash",
            Self::WithdrawCash => "Withdraw Cash",
            Self::BuyGoods => "Buy Goods",
            Self::SendMoney => "Send Money",
            Self::TillNo => "Till No",
        }
    }

    /// Case- and spacing-insensitive lookup; unknown values become `Cash`.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let key: String = raw
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "withdrawcash" => Self::WithdrawCash,
            "buygoods" => Self::BuyGoods,
            "sendmoney" => Self::SendMoney,
            "tillno" => Self::TillNo,
            _ => Self::Cash,
        }
    }
}

impl From<String> for PaymentMethod {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl From<PaymentMethod> for String {
    fn from(value: PaymentMethod) -> Self {
        value.as_str().to_string()
    }
}

/// Cash drawer count session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CashSession {
    #[default]
    Morning,
    Evening,
}

impl CashSession {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Morning => "Morning",
            Self::Evening => "Evening",
        }
    }
}

impl From<String> for CashSession {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("evening") {
            Self::Evening
        } else {
            Self::Morning
        }
    }
}

impl From<CashSession> for String {
    fn from(value: CashSession) -> Self {
        value.as_str().to_string()
    }
}

/// Default status for orders that have not progressed yet.
pub const ORDER_STATUS_PENDING: &str = "Pending";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sale {
    pub amount: f64,
    pub method: PaymentMethod,
    pub note: String,
    pub product: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub till_number: String,
    pub created_by: String,
}

impl Default for Sale {
    fn default() -> Self {
        Self {
            amount: 0.0,
            method: PaymentMethod::Cash,
            note: String::new(),
            product: String::new(),
            quantity: 1.0,
            unit_price: 0.0,
            till_number: String::new(),
            created_by: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Expense {
    pub amount: f64,
    pub category: String,
    pub method: PaymentMethod,
    pub note: String,
    pub item: String,
}

/// Goods taken on credit by a customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditPurchase {
    pub customer: String,
    pub amount: f64,
    pub note: String,
    pub product: String,
    pub quantity: f64,
    pub price: f64,
}

impl Default for CreditPurchase {
    fn default() -> Self {
        Self {
            customer: String::new(),
            amount: 0.0,
            note: String::new(),
            product: String::new(),
            quantity: 1.0,
            price: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditPayment {
    pub customer: String,
    pub amount: f64,
    pub method: PaymentMethod,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub customer: String,
    pub phone: String,
    pub items: String,
    pub total: f64,
    pub status: String,
    pub note: String,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            customer: String::new(),
            phone: String::new(),
            items: String::new(),
            total: 0.0,
            status: ORDER_STATUS_PENDING.to_string(),
            note: String::new(),
        }
    }
}

/// A status transition for an order (`Ready`, `Delivered`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderStatusEvent {
    pub order_id: String,
    pub status: String,
    pub note: String,
}

impl Default for OrderStatusEvent {
    fn default() -> Self {
        Self {
            order_id: String::new(),
            status: ORDER_STATUS_PENDING.to_string(),
            note: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderPayment {
    pub order_id: String,
    pub amount: f64,
    pub method: PaymentMethod,
    pub note: String,
}

/// Drawer count keyed by denomination (`"1000" -> 3`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CashCount {
    pub session: CashSession,
    pub denominations: BTreeMap<String, f64>,
    pub cash_total: f64,
    pub note: String,
}

impl CashCount {
    /// Σ denomination × count; keys that are not numbers count as zero.
    #[must_use]
    pub fn denomination_total(&self) -> f64 {
        self.denominations
            .iter()
            .map(|(note, count)| codec::parse_amount_str(note) * count)
            .sum()
    }
}

/// Mobile money moved into the cash drawer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Withdraw {
    pub amount: f64,
    pub note: String,
}

/// Per-channel mobile money balances entered at close of day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MobileLedgerEntry {
    pub channel: String,
    pub opening_balance: f64,
    pub outflow_withdrawn: f64,
    pub closing_balance_actual: Option<f64>,
    pub note: String,
}

/// Kind-specific record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Sale(Sale),
    Expense(Expense),
    Credit(CreditPurchase),
    CreditPayment(CreditPayment),
    Order(Order),
    OrderStatus(OrderStatusEvent),
    OrderPayment(OrderPayment),
    CashCount(CashCount),
    Withdraw(Withdraw),
    MobileLedger(MobileLedgerEntry),
}

impl Payload {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Sale(_) => RecordKind::Sale,
            Self::Expense(_) => RecordKind::Expense,
            Self::Credit(_) => RecordKind::Credit,
            Self::CreditPayment(_) => RecordKind::CreditPayment,
            Self::Order(_) => RecordKind::Order,
            Self::OrderStatus(_) => RecordKind::OrderStatus,
            Self::OrderPayment(_) => RecordKind::OrderPayment,
            Self::CashCount(_) => RecordKind::CashCount,
            Self::Withdraw(_) => RecordKind::Withdraw,
            Self::MobileLedger(_) => RecordKind::MobileLedger,
        }
    }

    /// Fill derived fields the way the write path always has: sale gross from
    /// quantity × unit price, unit price from gross, cash totals from
    /// denominations, blank statuses back to `Pending`.
    pub fn normalize(&mut self) {
        match self {
            Self::Sale(sale) => {
                if sale.quantity <= 0.0 {
                    sale.quantity = 1.0;
                }
                if sale.amount == 0.0 && sale.unit_price != 0.0 {
                    sale.amount = sale.quantity * sale.unit_price;
                } else if sale.unit_price == 0.0 {
                    sale.unit_price = sale.amount / sale.quantity;
                }
            }
            Self::Credit(purchase) => {
                if purchase.quantity <= 0.0 {
                    purchase.quantity = 1.0;
                }
                if purchase.price == 0.0 {
                    purchase.price = purchase.amount;
                }
            }
            Self::Order(order) if order.status.trim().is_empty() => {
                order.status = ORDER_STATUS_PENDING.to_string();
            }
            Self::OrderStatus(event) if event.status.trim().is_empty() => {
                event.status = ORDER_STATUS_PENDING.to_string();
            }
            Self::CashCount(count) if count.cash_total == 0.0 => {
                count.cash_total = count.denomination_total();
            }
            _ => {}
        }
    }
}

/// One synchronized bookkeeping fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// Business day (`YYYY-MM-DD`), distinct from the timestamps.
    #[serde(rename = "dateISO")]
    pub date: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Record {
    /// Fresh local-origin record stamped at `now`.
    #[must_use]
    pub fn new(payload: Payload, date: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now = codec::truncate_ms(now);
        Self {
            id: generate_id(payload.kind(), now),
            date: date.into(),
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    #[must_use]
    pub fn kind(&self) -> RecordKind {
        self.payload.kind()
    }

    /// Same business day and payload, ignoring id and timestamps.
    #[must_use]
    pub fn business_eq(&self, other: &Self) -> bool {
        self.date == other.date && self.payload == other.payload
    }

    /// Make the record safe to persist: id present, ISO business date,
    /// millisecond stamps with `updated_at >= created_at`, derived payload
    /// fields filled.
    pub fn prepare(&mut self, clock: &BusinessClock) {
        if self.id.trim().is_empty() {
            self.id = generate_id(self.kind(), self.created_at);
        }
        if NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err() {
            self.date = codec::parse_date_str(&self.date, clock);
        }
        self.created_at = codec::truncate_ms(self.created_at);
        self.updated_at = codec::truncate_ms(self.updated_at.max(self.created_at));
        self.payload.normalize();
    }

    /// Whether `self` repeats `previous` closely enough to be a double submit.
    #[must_use]
    pub fn is_duplicate_submission_of(&self, previous: &Self) -> bool {
        let (Payload::Sale(current), Payload::Sale(prior)) = (&self.payload, &previous.payload)
        else {
            return false;
        };
        let gap_ms = (self.created_at - previous.created_at).num_milliseconds().abs();
        gap_ms < DUPLICATE_SALE_WINDOW_MS
            && current.amount == prior.amount
            && current.method == prior.method
            && current.note == prior.note
    }
}

/// `<prefix>_<7 random base36 chars>_<base36 millis>`.
#[must_use]
pub fn generate_id(kind: RecordKind, at: DateTime<Utc>) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let random: String = (0..7)
        .map(|_| char::from(ALPHABET[rng.random_range(0..ALPHABET.len())]))
        .collect();
    let millis = u64::try_from(at.timestamp_millis()).unwrap_or_default();
    format!("{}_{random}_{}", kind.id_prefix(), to_base36(millis))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
