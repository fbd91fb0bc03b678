//! Market-data source contracts, the Yahoo quote implementation, offline
//! fixtures, ticker list loading and the batch fetcher.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fundex_core::{FetchError, IdentifierError, RawAttributeBag, RawValue, Ticker, SYMBOL_KEY};
use fundex_storage::HttpFetcher;
use reqwest::Url;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

mod batch;

pub use batch::{BatchFetchReport, BatchFetcher, FetchPolicy, FetchResult, GroupFetch};

pub const CRATE_NAME: &str = "fundex-adapters";

pub const DEFAULT_QUOTE_BASE_URL: &str = "https://query1.finance.yahoo.com";

const SUMMARY_MODULES: &str =
    "assetProfile,summaryDetail,defaultKeyStatistics,financialData,price,calendarEvents";

/// Remote market-data collaborator.
///
/// `fetch_many` may return fewer bags than requested; identifiers missing from
/// the map are the caller's to account for.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_one(&self, ticker: &Ticker) -> Result<RawAttributeBag, FetchError>;

    async fn fetch_many(
        &self,
        tickers: &[Ticker],
    ) -> Result<BTreeMap<Ticker, RawAttributeBag>, FetchError>;
}

#[derive(Debug)]
pub struct YahooQuoteSource {
    http: Arc<HttpFetcher>,
    base_url: Url,
}

impl YahooQuoteSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: &str) -> Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("parsing quote base url `{base_url}`"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|err| FetchError::Network(format!("invalid endpoint `{path}`: {err}")))
    }

    pub fn quote_url(&self, tickers: &[Ticker]) -> Result<Url, FetchError> {
        let mut url = self.endpoint("v7/finance/quote")?;
        let symbols = tickers.iter().map(Ticker::as_str).collect::<Vec<_>>().join(",");
        url.query_pairs_mut().append_pair("symbols", &symbols);
        Ok(url)
    }

    pub fn summary_url(&self, ticker: &Ticker) -> Result<Url, FetchError> {
        let mut url = self.endpoint(&format!("v10/finance/quoteSummary/{}", ticker.as_str()))?;
        url.query_pairs_mut().append_pair("modules", SUMMARY_MODULES);
        Ok(url)
    }
}

#[async_trait]
impl MarketDataSource for YahooQuoteSource {
    fn source_id(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch_one(&self, ticker: &Ticker) -> Result<RawAttributeBag, FetchError> {
        let url = self.summary_url(ticker)?;
        let body = self.http.get_json(url).await?;
        decode_quote_summary(body, ticker, Utc::now())
    }

    async fn fetch_many(
        &self,
        tickers: &[Ticker],
    ) -> Result<BTreeMap<Ticker, RawAttributeBag>, FetchError> {
        let url = self.quote_url(tickers)?;
        let body = self.http.get_json(url).await?;
        decode_quote_response(body, Utc::now())
    }
}

fn service_error(envelope: &JsonValue) -> Option<(String, String)> {
    let error = envelope.get("error").filter(|e| !e.is_null())?;
    let code = error
        .get("code")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown")
        .to_string();
    let description = error
        .get("description")
        .and_then(JsonValue::as_str)
        .unwrap_or("")
        .to_string();
    Some((code, description))
}

/// Decodes a multi-symbol quote reply into one bag per symbol it contains.
pub fn decode_quote_response(
    body: JsonValue,
    fetched_at: DateTime<Utc>,
) -> Result<BTreeMap<Ticker, RawAttributeBag>, FetchError> {
    let envelope = body
        .get("quoteResponse")
        .ok_or_else(|| FetchError::Decode("missing `quoteResponse`".into()))?;
    if let Some((code, description)) = service_error(envelope) {
        return Err(FetchError::Decode(format!("service error {code}: {description}")));
    }
    let results = envelope
        .get("result")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::Decode("`quoteResponse.result` is not a list".into()))?;

    let mut out = BTreeMap::new();
    for item in results {
        let Some(object) = item.as_object() else {
            debug!("skipping non-object quote entry");
            continue;
        };
        let Some(ticker) = object
            .get(SYMBOL_KEY)
            .and_then(JsonValue::as_str)
            .and_then(|s| Ticker::parse(s).ok())
        else {
            debug!("skipping quote entry without a usable symbol");
            continue;
        };
        let attributes = object
            .iter()
            .map(|(k, v)| (k.clone(), RawValue::from_json(v.clone())));
        out.insert(ticker, RawAttributeBag::from_attributes(fetched_at, attributes));
    }
    Ok(out)
}

/// Decodes a single-symbol quote-summary reply, flattening its modules into one bag.
pub fn decode_quote_summary(
    body: JsonValue,
    ticker: &Ticker,
    fetched_at: DateTime<Utc>,
) -> Result<RawAttributeBag, FetchError> {
    let envelope = body
        .get("quoteSummary")
        .ok_or_else(|| FetchError::Decode("missing `quoteSummary`".into()))?;
    if let Some((code, description)) = service_error(envelope) {
        if code.eq_ignore_ascii_case("not found") {
            return Err(FetchError::NotFound);
        }
        return Err(FetchError::Decode(format!("service error {code}: {description}")));
    }
    let modules = envelope
        .get("result")
        .and_then(JsonValue::as_array)
        .and_then(|results| results.first())
        .and_then(JsonValue::as_object)
        .ok_or(FetchError::NotFound)?;

    let mut bag = RawAttributeBag::new(fetched_at);
    for (module_name, module) in modules {
        let Some(fields) = module.as_object() else {
            debug!(module = %module_name, "skipping non-object module");
            continue;
        };
        for (key, value) in fields {
            if !bag.attributes.contains_key(key) {
                bag.insert(key.clone(), RawValue::from_json(unwrap_raw(value.clone())));
            }
        }
    }
    if bag.is_empty() {
        return Err(FetchError::NotFound);
    }
    if bag.reported_symbol().is_none() {
        bag.insert(SYMBOL_KEY, ticker.as_str());
    }
    Ok(bag)
}

/// `{"raw": 1.5, "fmt": "1.50"}` becomes `1.5`; `{}` becomes null.
fn unwrap_raw(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(mut map) => {
            if let Some(raw) = map.remove("raw") {
                return raw;
            }
            if map.is_empty() {
                return JsonValue::Null;
            }
            JsonValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k, unwrap_raw(v)))
                    .collect::<JsonMap<_, _>>(),
            )
        }
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(unwrap_raw).collect()),
        other => other,
    }
}

/// Offline source backed by a JSON document of `{ "TICKER": { attributes } }`.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    entries: BTreeMap<Ticker, JsonMap<String, JsonValue>>,
}

impl FixtureSource {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let value: JsonValue =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Self::from_value(value).with_context(|| format!("loading fixtures from {}", path.display()))
    }

    pub fn from_value(value: JsonValue) -> Result<Self> {
        let JsonValue::Object(root) = value else {
            anyhow::bail!("fixture document must be an object keyed by ticker");
        };
        let mut entries = BTreeMap::new();
        for (symbol, attributes) in root {
            let ticker = Ticker::parse(&symbol)
                .with_context(|| format!("fixture key `{symbol}` is not a valid ticker"))?;
            let JsonValue::Object(attributes) = attributes else {
                anyhow::bail!("fixture entry `{symbol}` must be an object");
            };
            entries.insert(ticker, attributes);
        }
        Ok(Self { entries })
    }

    pub fn tickers(&self) -> impl Iterator<Item = &Ticker> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bag_for(&self, ticker: &Ticker, fetched_at: DateTime<Utc>) -> Option<RawAttributeBag> {
        let attributes = self.entries.get(ticker)?;
        let mut bag = RawAttributeBag::from_attributes(
            fetched_at,
            attributes
                .iter()
                .map(|(k, v)| (k.clone(), RawValue::from_json(v.clone()))),
        );
        if bag.reported_symbol().is_none() {
            bag.insert(SYMBOL_KEY, ticker.as_str());
        }
        Some(bag)
    }
}

#[async_trait]
impl MarketDataSource for FixtureSource {
    fn source_id(&self) -> &'static str {
        "fixtures"
    }

    async fn fetch_one(&self, ticker: &Ticker) -> Result<RawAttributeBag, FetchError> {
        self.bag_for(ticker, Utc::now()).ok_or(FetchError::NotFound)
    }

    async fn fetch_many(
        &self,
        tickers: &[Ticker],
    ) -> Result<BTreeMap<Ticker, RawAttributeBag>, FetchError> {
        let fetched_at = Utc::now();
        Ok(tickers
            .iter()
            .filter_map(|t| self.bag_for(t, fetched_at).map(|bag| (t.clone(), bag)))
            .collect())
    }
}

/// Parsed ticker list plus the entries that were not valid identifiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickerList {
    pub tickers: Vec<Ticker>,
    pub rejected: Vec<RejectedTicker>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedTicker {
    pub input: String,
    pub error: IdentifierError,
}

impl TickerList {
    /// Sorted, de-duplicated list, truncated to `limit` after filtering.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a str>, limit: Option<usize>) -> Self {
        let mut list = TickerList::default();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            match Ticker::parse(entry) {
                Ok(ticker) => list.tickers.push(ticker),
                Err(error) => list.rejected.push(RejectedTicker {
                    input: entry.to_string(),
                    error,
                }),
            }
        }
        list.tickers.sort();
        list.tickers.dedup();
        if let Some(limit) = limit {
            list.tickers.truncate(limit);
        }
        list
    }

    pub fn from_csv(csv: &str, limit: Option<usize>) -> Self {
        Self::from_entries(csv.split(','), limit)
    }

    /// One ticker per line; `#` lines and blank lines are skipped.
    pub fn from_file(path: impl AsRef<Path>, limit: Option<usize>) -> Result<Self> {
        let path = path.as_ref();
        let data =
            fs::read_to_string(path).with_context(|| format!("reading ticker file {}", path.display()))?;
        Ok(Self::from_entries(data.lines(), limit))
    }
}
