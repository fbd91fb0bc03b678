//! Core domain model for fundex: identifiers, raw attribute bags, normalized
//! records and per-identifier run outcomes.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

mod catalog;
mod error;

pub use catalog::{
    decimal_max_magnitude, field_for_key, FieldKind, FieldSpec, FIELDS, PRICE, RATIO, SYMBOL_KEY,
};
pub use error::{ConfigError, FetchError, IdentifierError, NormalizeError, PersistError};

pub const CRATE_NAME: &str = "fundex-core";

/// Longest symbol accepted as an identifier.
pub const MAX_TICKER_LEN: usize = 16;

/// Case-normalized security symbol; the key of every ingestion operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(IdentifierError::EmbeddedWhitespace(trimmed.to_string()));
        }
        if trimmed.chars().count() > MAX_TICKER_LEN {
            return Err(IdentifierError::TooLong(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Ticker {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Ticker {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Ticker> for String {
    fn from(value: Ticker) -> Self {
        value.0
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Ticker {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One attribute value exactly as the market-data API delivered it.
///
/// Unlike `serde_json::Value` this keeps non-finite floats, which some
/// upstream payloads do produce and which must never reach storage.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Unavailable,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<RawValue>),
    Map(BTreeMap<String, RawValue>),
}

impl RawValue {
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => RawValue::Unavailable,
            JsonValue::Bool(b) => RawValue::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => RawValue::Int(i),
                None => RawValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => RawValue::Text(s),
            JsonValue::Array(items) => {
                RawValue::List(items.into_iter().map(RawValue::from_json).collect())
            }
            JsonValue::Object(map) => RawValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering; non-finite floats become `null` since JSON cannot carry them.
    pub fn to_json(&self) -> JsonValue {
        match self {
            RawValue::Unavailable => JsonValue::Null,
            RawValue::Bool(b) => JsonValue::Bool(*b),
            RawValue::Int(i) => JsonValue::from(*i),
            RawValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            RawValue::Text(s) => JsonValue::String(s.clone()),
            RawValue::List(items) => JsonValue::Array(items.iter().map(RawValue::to_json).collect()),
            RawValue::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, RawValue::Unavailable)
    }
}

impl From<JsonValue> for RawValue {
    fn from(value: JsonValue) -> Self {
        RawValue::from_json(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

/// Unvalidated attribute set for one identifier. Transient: lives only between fetch and normalize.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttributeBag {
    pub fetched_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, RawValue>,
}

impl RawAttributeBag {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            fetched_at,
            attributes: BTreeMap::new(),
        }
    }

    pub fn from_attributes(
        fetched_at: DateTime<Utc>,
        attributes: impl IntoIterator<Item = (String, RawValue)>,
    ) -> Self {
        Self {
            fetched_at,
            attributes: attributes.into_iter().collect(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<RawValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&RawValue> {
        self.attributes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Symbol the remote service says this bag describes, if it said so.
    pub fn reported_symbol(&self) -> Option<&RawValue> {
        self.attributes.get(SYMBOL_KEY)
    }
}

/// Typed, storage-safe column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Text(String),
    Decimal(Decimal),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// Infinity or NaN.
    NonFinite,
    /// Finite but not representable by the destination column.
    OutOfRange,
    /// Value present but could not be coerced to the column type.
    Unparseable,
    /// Value had a shape (list, map) the column cannot hold.
    WrongShape,
    /// Text was cut to the column's maximum length; the value is kept.
    Truncated,
    /// NUL characters were removed; the rest of the value is kept.
    ControlCharacters,
}

/// Diagnostic attached to a record when a field was nulled or altered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub column: String,
    pub kind: IssueKind,
    pub detail: String,
}

/// Distinct columns named by `issues`.
pub fn flagged_columns(issues: &[FieldIssue]) -> usize {
    let mut columns: Vec<&str> = issues.iter().map(|i| i.column.as_str()).collect();
    columns.sort_unstable();
    columns.dedup();
    columns.len()
}

/// Validated, bounded, typed row ready for persistence.
///
/// Every catalog column is present in `values`, `ColumnValue::Null` when the
/// source had nothing usable for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedRecord {
    pub ticker: Ticker,
    pub ingested_at: DateTime<Utc>,
    pub values: BTreeMap<&'static str, ColumnValue>,
    pub extra: BTreeMap<String, JsonValue>,
    pub issues: Vec<FieldIssue>,
}

impl NormalizedRecord {
    pub fn value(&self, column: &str) -> Option<&ColumnValue> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        match self.value(column) {
            Some(ColumnValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn decimal(&self, column: &str) -> Option<Decimal> {
        match self.value(column) {
            Some(ColumnValue::Decimal(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn integer(&self, column: &str) -> Option<i64> {
        match self.value(column) {
            Some(ColumnValue::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn boolean(&self, column: &str) -> Option<bool> {
        match self.value(column) {
            Some(ColumnValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn timestamp(&self, column: &str) -> Option<DateTime<Utc>> {
        match self.value(column) {
            Some(ColumnValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    pub fn json(&self, column: &str) -> Option<&JsonValue> {
        match self.value(column) {
            Some(ColumnValue::Json(v)) => Some(v),
            _ => None,
        }
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        self.ingested_at.date_naive()
    }

    pub fn populated_fields(&self) -> usize {
        self.values.values().filter(|v| !v.is_null()).count()
    }

    /// Number of distinct columns that carry at least one diagnostic.
    pub fn flagged_fields(&self) -> usize {
        flagged_columns(&self.issues)
    }

    pub fn has_issue(&self, column: &str, kind: IssueKind) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.column == column && issue.kind == kind)
    }

    /// Re-serializes the record into a bag keyed by storage column names.
    pub fn to_bag(&self) -> RawAttributeBag {
        let mut bag = RawAttributeBag::new(self.ingested_at).with(SYMBOL_KEY, self.ticker.as_str());
        for (column, value) in &self.values {
            let raw = match value {
                ColumnValue::Null => continue,
                ColumnValue::Text(s) => RawValue::Text(s.clone()),
                ColumnValue::Decimal(d) => RawValue::Text(d.to_string()),
                ColumnValue::Integer(i) => RawValue::Int(*i),
                ColumnValue::Boolean(b) => RawValue::Bool(*b),
                ColumnValue::Timestamp(ts) => RawValue::Int(ts.timestamp()),
                ColumnValue::Json(v) => RawValue::from_json(v.clone()),
            };
            bag.insert(*column, raw);
        }
        for (key, value) in &self.extra {
            bag.insert(key.clone(), RawValue::from_json(value.clone()));
        }
        bag
    }
}

/// Per-identifier result of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Stored { flagged_fields: usize },
    SkippedFresh { last_ingested: DateTime<Utc> },
    FetchFailed { error: FetchError },
    NormalizeFailed { error: NormalizeError },
    PersistFailed { error: PersistError },
    Cancelled,
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Stored { .. } => "fetched-and-stored",
            RunOutcome::SkippedFresh { .. } => "skipped-fresh",
            RunOutcome::FetchFailed { .. } => "fetch-failed",
            RunOutcome::NormalizeFailed { .. } => "normalize-failed",
            RunOutcome::PersistFailed { .. } => "persist-failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            RunOutcome::FetchFailed { error } => Some(error.to_string()),
            RunOutcome::NormalizeFailed { error } => Some(error.to_string()),
            RunOutcome::PersistFailed { error } => Some(error.to_string()),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_reason().is_some()
    }
}

/// Cooperative run-level cancellation, checked between fetch groups.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
