//! Raw attribute bags to bounded, typed snapshot rows.
//!
//! Per-field problems never fail a record: the field becomes null (or is
//! truncated) and a [`FieldIssue`] is attached. Only a bag that is empty or
//! structurally wrong at the top level is rejected.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use fundex_core::{
    decimal_max_magnitude, field_for_key, ColumnValue, FieldIssue, FieldKind, FieldSpec, IssueKind,
    NormalizeError, NormalizedRecord, RawAttributeBag, RawValue, Ticker, FIELDS, SYMBOL_KEY,
};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value as JsonValue;

/// Tokens the market-data API uses for "no value" in numeric and flag positions.
const UNAVAILABLE_TOKENS: &[&str] = &[
    "", "N/A", "n/a", "NA", "na", "nan", "NaN", "None", "null", "--", "-",
];

/// Narrower set for text columns, where `NA` or `-` can be real values.
const TEXT_UNAVAILABLE_TOKENS: &[&str] = &["", "N/A", "n/a", "None", "null"];

const INFINITE_TOKENS: &[&str] = &["inf", "+inf", "-inf", "infinity", "+infinity", "-infinity"];

const TRUE_TOKENS: &[&str] = &["true", "t", "yes", "y", "1"];
const FALSE_TOKENS: &[&str] = &["false", "f", "no", "n", "0"];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Normalizer {
    max_magnitude: Option<Decimal>,
}

/// Coercion result for a single column.
enum Coerced {
    Clean(ColumnValue),
    Flagged(ColumnValue, IssueKind, String),
}

fn rejected(kind: IssueKind, detail: impl Into<String>) -> Coerced {
    Coerced::Flagged(ColumnValue::Null, kind, detail.into())
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional cap applied to every numeric column on top of its storage bound.
    pub fn with_max_magnitude(mut self, max_magnitude: Decimal) -> Self {
        self.max_magnitude = Some(max_magnitude.abs());
        self
    }

    pub fn max_magnitude(&self) -> Option<Decimal> {
        self.max_magnitude
    }

    pub fn normalize(
        &self,
        ticker: &Ticker,
        bag: &RawAttributeBag,
    ) -> Result<NormalizedRecord, NormalizeError> {
        check_structure(ticker, bag)?;

        let mut values = BTreeMap::new();
        let mut issues = Vec::new();
        for spec in FIELDS {
            let value = match pick(bag, spec) {
                None => ColumnValue::Null,
                Some(raw) => match self.coerce(spec.kind, raw) {
                    Coerced::Clean(value) => value,
                    Coerced::Flagged(value, kind, detail) => {
                        issues.push(FieldIssue {
                            column: spec.column.to_string(),
                            kind,
                            detail,
                        });
                        value
                    }
                },
            };
            values.insert(spec.column, value);
        }

        let mut extra = BTreeMap::new();
        for (key, raw) in &bag.attributes {
            if key.as_str() == SYMBOL_KEY || field_for_key(key).is_some() {
                continue;
            }
            let mut json = raw.to_json();
            if json.is_null() {
                continue;
            }
            let (key, key_had_nul) = strip_nul(key);
            if strip_nul_json(&mut json) || key_had_nul {
                issues.push(FieldIssue {
                    column: key.clone(),
                    kind: IssueKind::ControlCharacters,
                    detail: "NUL characters removed from extra attribute".into(),
                });
            }
            extra.insert(key, json);
        }

        Ok(NormalizedRecord {
            ticker: ticker.clone(),
            ingested_at: bag.fetched_at,
            values,
            extra,
            issues,
        })
    }

    fn coerce(&self, kind: FieldKind, raw: &RawValue) -> Coerced {
        match kind {
            FieldKind::Text { max_chars } => coerce_text(raw, max_chars),
            FieldKind::Decimal { precision, scale } => self.coerce_decimal(raw, precision, scale),
            FieldKind::Integer => self.coerce_integer(raw),
            FieldKind::Boolean => coerce_boolean(raw),
            FieldKind::Timestamp => coerce_timestamp(raw),
            FieldKind::Json => coerce_json(raw),
        }
    }

    fn bound(&self, storage_bound: Decimal) -> Decimal {
        match self.max_magnitude {
            Some(max) => max.min(storage_bound),
            None => storage_bound,
        }
    }

    fn coerce_decimal(&self, raw: &RawValue, precision: u32, scale: u32) -> Coerced {
        let value = match numeric(raw) {
            Ok(Some(value)) => value,
            Ok(None) => return Coerced::Clean(ColumnValue::Null),
            Err(rejection) => return rejection,
        };
        let rounded = value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
        let bound = self.bound(decimal_max_magnitude(precision, scale));
        if rounded.abs() > bound {
            return rejected(IssueKind::OutOfRange, format!("{value} exceeds ±{bound}"));
        }
        Coerced::Clean(ColumnValue::Decimal(rounded))
    }

    fn coerce_integer(&self, raw: &RawValue) -> Coerced {
        let value = match numeric(raw) {
            Ok(Some(value)) => value,
            Ok(None) => return Coerced::Clean(ColumnValue::Null),
            Err(rejection) => return rejection,
        };
        let rounded = value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
        let within_cap = self.max_magnitude.map_or(true, |max| rounded.abs() <= max);
        match rounded.to_i64() {
            Some(int) if within_cap => Coerced::Clean(ColumnValue::Integer(int)),
            _ => rejected(
                IssueKind::OutOfRange,
                format!("{value} does not fit a bounded 64-bit integer"),
            ),
        }
    }
}

/// Rejects bags that are empty, carry a foreign or malformed symbol, or have unnamed attributes.
fn check_structure(ticker: &Ticker, bag: &RawAttributeBag) -> Result<(), NormalizeError> {
    if bag
        .attributes
        .iter()
        .all(|(key, value)| key == SYMBOL_KEY || value.is_unavailable())
    {
        return Err(NormalizeError::EmptyBag);
    }
    if bag.attributes.keys().any(|key| key.trim().is_empty()) {
        return Err(NormalizeError::MalformedBag(
            "attribute with an empty name".into(),
        ));
    }
    match bag.reported_symbol() {
        None | Some(RawValue::Unavailable) => Ok(()),
        Some(RawValue::Text(symbol)) => {
            let reported = Ticker::parse(symbol).map_err(NormalizeError::InvalidIdentifier)?;
            if &reported != ticker {
                return Err(NormalizeError::IdentifierMismatch {
                    expected: ticker.to_string(),
                    found: reported.to_string(),
                });
            }
            Ok(())
        }
        Some(_) => Err(NormalizeError::MalformedBag(format!(
            "`{SYMBOL_KEY}` is not text"
        ))),
    }
}

/// First available value among the column name and its API aliases.
fn pick<'a>(bag: &'a RawAttributeBag, spec: &FieldSpec) -> Option<&'a RawValue> {
    std::iter::once(spec.column)
        .chain(spec.aliases.iter().copied())
        .filter_map(|key| bag.get(key))
        .find(|value| !value.is_unavailable())
}

/// `Ok(None)` is "unavailable"; `Err` carries the flagged null for the column.
fn numeric(raw: &RawValue) -> Result<Option<Decimal>, Coerced> {
    match raw {
        RawValue::Unavailable => Ok(None),
        RawValue::Int(int) => Ok(Some(Decimal::from(*int))),
        RawValue::Float(float) => float_to_decimal(*float).map(Some),
        RawValue::Text(text) => parse_numeric_text(text),
        RawValue::Bool(_) => Err(rejected(IssueKind::Unparseable, "boolean in numeric column")),
        RawValue::List(_) | RawValue::Map(_) => {
            Err(rejected(IssueKind::WrongShape, "structured value in numeric column"))
        }
    }
}

fn float_to_decimal(float: f64) -> Result<Decimal, Coerced> {
    if !float.is_finite() {
        return Err(rejected(IssueKind::NonFinite, format!("{float}")));
    }
    Decimal::from_f64(float)
        .ok_or_else(|| rejected(IssueKind::OutOfRange, format!("{float:e} is not representable")))
}

fn parse_numeric_text(text: &str) -> Result<Option<Decimal>, Coerced> {
    let trimmed = text.trim();
    if UNAVAILABLE_TOKENS.contains(&trimmed) {
        return Ok(None);
    }
    if INFINITE_TOKENS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return Err(rejected(IssueKind::NonFinite, trimmed));
    }

    let mut body: String = trimmed.chars().filter(|c| *c != '$' && *c != ',').collect();
    let mut percent = false;
    let mut multiplier = Decimal::ONE;
    if let Some(stripped) = body.strip_suffix('%') {
        percent = true;
        body = stripped.trim_end().to_string();
    } else if let Some(factor) = body.chars().last().and_then(suffix_multiplier) {
        body.pop();
        multiplier = factor;
    }

    let unparseable = || rejected(IssueKind::Unparseable, format!("`{trimmed}` is not numeric"));
    let body = body.trim();
    let value = match Decimal::from_str(body).or_else(|_| Decimal::from_scientific(body)) {
        Ok(value) => value,
        Err(_) => match body.parse::<f64>() {
            Ok(float) if float.is_nan() => return Err(unparseable()),
            Ok(float) if float.is_infinite() => {
                return Err(rejected(IssueKind::OutOfRange, format!("`{trimmed}` overflows")))
            }
            Ok(float) => float_to_decimal(float)?,
            Err(_) => return Err(unparseable()),
        },
    };

    let scaled = value
        .checked_mul(multiplier)
        .ok_or_else(|| rejected(IssueKind::OutOfRange, format!("`{trimmed}` overflows")))?;
    if percent {
        return Ok(Some(scaled / Decimal::ONE_HUNDRED));
    }
    Ok(Some(scaled))
}

fn suffix_multiplier(suffix: char) -> Option<Decimal> {
    let factor: i64 = match suffix.to_ascii_uppercase() {
        'K' => 1_000,
        'M' => 1_000_000,
        'B' => 1_000_000_000,
        'T' => 1_000_000_000_000,
        _ => return None,
    };
    Some(Decimal::from(factor))
}

fn coerce_text(raw: &RawValue, max_chars: usize) -> Coerced {
    let mut stripped = false;
    let text = match raw {
        RawValue::Unavailable => return Coerced::Clean(ColumnValue::Null),
        RawValue::Text(text) => {
            let (cleaned, had_nul) = strip_nul(text);
            stripped = had_nul;
            let trimmed = cleaned.trim();
            if TEXT_UNAVAILABLE_TOKENS.contains(&trimmed) {
                return Coerced::Clean(ColumnValue::Null);
            }
            trimmed.to_string()
        }
        RawValue::Int(int) => int.to_string(),
        RawValue::Float(float) if float.is_finite() => float.to_string(),
        RawValue::Float(float) => return rejected(IssueKind::NonFinite, format!("{float}")),
        RawValue::Bool(flag) => flag.to_string(),
        RawValue::List(_) | RawValue::Map(_) => {
            return rejected(IssueKind::WrongShape, "structured value in text column")
        }
    };

    let length = text.chars().count();
    if length <= max_chars {
        if stripped {
            return Coerced::Flagged(
                ColumnValue::Text(text),
                IssueKind::ControlCharacters,
                "NUL characters removed".into(),
            );
        }
        return Coerced::Clean(ColumnValue::Text(text));
    }
    let cut: String = text.chars().take(max_chars).collect();
    Coerced::Flagged(
        ColumnValue::Text(cut.trim_end().to_string()),
        IssueKind::Truncated,
        format!("{length} characters cut to {max_chars}"),
    )
}

fn coerce_boolean(raw: &RawValue) -> Coerced {
    let unrecognized = |what: String| rejected(IssueKind::Unparseable, format!("`{what}` is not a flag"));
    match raw {
        RawValue::Unavailable => Coerced::Clean(ColumnValue::Null),
        RawValue::Bool(flag) => Coerced::Clean(ColumnValue::Boolean(*flag)),
        RawValue::Int(0) => Coerced::Clean(ColumnValue::Boolean(false)),
        RawValue::Int(1) => Coerced::Clean(ColumnValue::Boolean(true)),
        RawValue::Int(other) => unrecognized(other.to_string()),
        RawValue::Float(float) if *float == 0.0 => Coerced::Clean(ColumnValue::Boolean(false)),
        RawValue::Float(float) if *float == 1.0 => Coerced::Clean(ColumnValue::Boolean(true)),
        RawValue::Float(float) => unrecognized(float.to_string()),
        RawValue::Text(text) => {
            let token = text.trim();
            if UNAVAILABLE_TOKENS.contains(&token) {
                return Coerced::Clean(ColumnValue::Null);
            }
            let lower = token.to_ascii_lowercase();
            if TRUE_TOKENS.contains(&lower.as_str()) {
                Coerced::Clean(ColumnValue::Boolean(true))
            } else if FALSE_TOKENS.contains(&lower.as_str()) {
                Coerced::Clean(ColumnValue::Boolean(false))
            } else {
                unrecognized(token.to_string())
            }
        }
        RawValue::List(_) | RawValue::Map(_) => {
            rejected(IssueKind::WrongShape, "structured value in flag column")
        }
    }
}

/// Epoch seconds, RFC 3339 or `YYYY-MM-DD`; sub-second precision is dropped.
fn coerce_timestamp(raw: &RawValue) -> Coerced {
    if let RawValue::Text(text) = raw {
        let trimmed = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return epoch_to_timestamp(Decimal::from(parsed.timestamp()));
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return match date.and_hms_opt(0, 0, 0).map(|midnight| midnight.and_utc()) {
                Some(ts) if storable(&ts) => Coerced::Clean(ColumnValue::Timestamp(ts)),
                _ => rejected(
                    IssueKind::OutOfRange,
                    format!("{trimmed} is outside the storable range"),
                ),
            };
        }
    }
    match numeric(raw) {
        Ok(Some(seconds)) => epoch_to_timestamp(seconds),
        Ok(None) => Coerced::Clean(ColumnValue::Null),
        Err(rejection) => rejection,
    }
}

fn epoch_to_timestamp(seconds: Decimal) -> Coerced {
    seconds
        .trunc()
        .to_i64()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .filter(storable)
        .map(|ts| Coerced::Clean(ColumnValue::Timestamp(ts)))
        .unwrap_or_else(|| {
            rejected(
                IssueKind::OutOfRange,
                format!("{seconds} is not a representable epoch time"),
            )
        })
}

/// Earliest instant a Postgres `timestamptz` holds (4714-11-24 BC); chrono's own upper limit is
/// already below the Postgres one.
fn storable(ts: &DateTime<Utc>) -> bool {
    NaiveDate::from_ymd_opt(-4713, 11, 24).is_some_and(|earliest| ts.date_naive() >= earliest)
}

/// Postgres text and jsonb reject U+0000.
fn strip_nul(text: &str) -> (String, bool) {
    if text.contains('\0') {
        (text.replace('\0', ""), true)
    } else {
        (text.to_string(), false)
    }
}

/// Strips NUL from every string and key; returns whether anything was removed.
fn strip_nul_json(json: &mut JsonValue) -> bool {
    match json {
        JsonValue::String(text) => {
            let (cleaned, had_nul) = strip_nul(text);
            *text = cleaned;
            had_nul
        }
        JsonValue::Array(items) => items
            .iter_mut()
            .fold(false, |acc, item| strip_nul_json(item) | acc),
        JsonValue::Object(map) => {
            let mut changed = false;
            let entries = std::mem::take(map);
            for (key, mut value) in entries {
                let (key, key_had_nul) = strip_nul(&key);
                changed |= key_had_nul | strip_nul_json(&mut value);
                map.insert(key, value);
            }
            changed
        }
        _ => false,
    }
}

fn coerce_json(raw: &RawValue) -> Coerced {
    match raw {
        RawValue::Unavailable => Coerced::Clean(ColumnValue::Null),
        RawValue::Text(text) if TEXT_UNAVAILABLE_TOKENS.contains(&text.trim()) => {
            Coerced::Clean(ColumnValue::Null)
        }
        other => match other.to_json() {
            JsonValue::Null => rejected(IssueKind::NonFinite, "value has no JSON representation"),
            mut json => {
                if strip_nul_json(&mut json) {
                    Coerced::Flagged(
                        ColumnValue::Json(json),
                        IssueKind::ControlCharacters,
                        "NUL characters removed".into(),
                    )
                } else {
                    Coerced::Clean(ColumnValue::Json(json))
                }
            }
        },
    }
}
