//! Ingestion orchestration: freshness filter, batch fetch, normalization and
//! persistence, aggregated into a per-run summary.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fundex_adapters::{BatchFetcher, FetchPolicy, FetchResult, MarketDataSource, DEFAULT_QUOTE_BASE_URL};
use fundex_core::{CancellationFlag, ConfigError, RunOutcome, Ticker};
use fundex_storage::{HttpClientConfig, RecordStore, TokenBucketConfig};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod freshness;
pub mod normalize;
mod report;

pub use freshness::{partition_stale, select_stale, FreshnessSplit};
pub use normalize::Normalizer;
pub use report::{render_brief, write_run_reports};

pub const CRATE_NAME: &str = "fundex-sync";

/// Process environment settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub quote_base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub reports_dir: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            quote_base_url: lookup("FUNDEX_QUOTE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_QUOTE_BASE_URL.to_string()),
            user_agent: lookup("FUNDEX_USER_AGENT")
                .unwrap_or_else(|| concat!("fundex/", env!("CARGO_PKG_VERSION")).to_string()),
            http_timeout_secs: lookup("FUNDEX_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            request_delay_ms: lookup("FUNDEX_REQUEST_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            reports_dir: lookup("FUNDEX_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            token_bucket: Some(TokenBucketConfig {
                capacity: 5,
                refill_every: Duration::from_millis(self.request_delay_ms.max(1)),
            }),
            ..Default::default()
        }
    }
}

/// Optional YAML file of ingest defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestFileConfig {
    pub batch_size: Option<usize>,
    pub skip_existing: Option<bool>,
    pub window_hours: Option<f64>,
    pub request_delay_ms: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub max_magnitude: Option<f64>,
    pub limit: Option<usize>,
}

impl IngestFileConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing ingest config yaml")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&data).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub skip_existing: bool,
    /// Only consulted when `skip_existing` is set.
    pub window_hours: f64,
    pub request_delay: Duration,
    pub request_timeout: Duration,
    pub max_magnitude: Option<f64>,
    /// Caps identifiers fetched per run, counted after the freshness filter.
    pub limit: Option<usize>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 15,
            skip_existing: false,
            window_hours: 24.0,
            request_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(20),
            max_magnitude: None,
            limit: None,
        }
    }
}

impl IngestOptions {
    /// Defaults with the environment's request pacing and timeout applied.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            request_delay: Duration::from_millis(config.request_delay_ms),
            request_timeout: Duration::from_secs(config.http_timeout_secs),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, file: &IngestFileConfig) -> Self {
        if let Some(batch_size) = file.batch_size {
            self.batch_size = batch_size;
        }
        if let Some(skip_existing) = file.skip_existing {
            self.skip_existing = skip_existing;
        }
        if let Some(window_hours) = file.window_hours {
            self.window_hours = window_hours;
        }
        if let Some(delay_ms) = file.request_delay_ms {
            self.request_delay = Duration::from_millis(delay_ms);
        }
        if let Some(timeout_secs) = file.request_timeout_secs {
            self.request_timeout = Duration::from_secs(timeout_secs);
        }
        if file.max_magnitude.is_some() {
            self.max_magnitude = file.max_magnitude;
        }
        if file.limit.is_some() {
            self.limit = file.limit;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(self.batch_size));
        }
        if !self.window_hours.is_finite() || self.window_hours < 0.0 {
            return Err(ConfigError::InvalidWindow(self.window_hours));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        self.normalizer().map(|_| ())
    }

    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            batch_size: self.batch_size,
            request_delay: self.request_delay,
            request_timeout: self.request_timeout,
        }
    }

    pub fn normalizer(&self) -> Result<Normalizer, ConfigError> {
        let Some(max) = self.max_magnitude else {
            return Ok(Normalizer::new());
        };
        match Decimal::from_f64(max) {
            Some(max) if max > Decimal::ZERO => Ok(Normalizer::new().with_max_magnitude(max)),
            _ => Err(ConfigError::InvalidMagnitude(max.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("market data service unreachable: all {attempted} fetches failed, e.g. {sample}")]
    Unreachable { attempted: usize, sample: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub stored: usize,
    pub skipped_fresh: usize,
    pub fetch_failed: usize,
    pub normalize_failed: usize,
    pub persist_failed: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &RunOutcome) {
        let slot = match outcome {
            RunOutcome::Stored { .. } => &mut self.stored,
            RunOutcome::SkippedFresh { .. } => &mut self.skipped_fresh,
            RunOutcome::FetchFailed { .. } => &mut self.fetch_failed,
            RunOutcome::NormalizeFailed { .. } => &mut self.normalize_failed,
            RunOutcome::PersistFailed { .. } => &mut self.persist_failed,
            RunOutcome::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    pub fn failed(&self) -> usize {
        self.fetch_failed + self.normalize_failed + self.persist_failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedIdentifier {
    pub ticker: Ticker,
    pub stage: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentifierOutcome {
    pub ticker: Ticker,
    #[serde(flatten)]
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub requested: usize,
    pub fetch_requests: usize,
    pub fallback_groups: usize,
    pub counts: OutcomeCounts,
    pub failures: Vec<FailedIdentifier>,
    pub outcomes: Vec<IdentifierOutcome>,
}

impl RunSummary {
    pub fn outcome_for(&self, ticker: &str) -> Option<&RunOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.ticker.as_str() == ticker)
            .map(|o| &o.outcome)
    }

    pub fn was_cancelled(&self) -> bool {
        self.counts.cancelled > 0
    }
}

/// Tracks whether every fetch attempted so far failed on connectivity.
#[derive(Debug)]
struct Reachability {
    attempted: usize,
    all_connectivity: bool,
    sample: String,
}

impl Default for Reachability {
    fn default() -> Self {
        Self {
            attempted: 0,
            all_connectivity: true,
            sample: String::new(),
        }
    }
}

impl Reachability {
    fn observe(&mut self, result: &FetchResult) {
        self.attempted += 1;
        match result {
            Err(err) if err.is_connectivity() => {
                if self.sample.is_empty() {
                    self.sample = err.to_string();
                }
            }
            _ => self.all_connectivity = false,
        }
    }

    fn is_total_failure(&self) -> bool {
        self.attempted > 0 && self.all_connectivity
    }
}

/// End-to-end run over one market-data source and one store.
pub struct IngestPipeline {
    source: Arc<dyn MarketDataSource>,
    store: Arc<dyn RecordStore>,
    options: IngestOptions,
    cancel: CancellationFlag,
}

impl IngestPipeline {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Arc<dyn RecordStore>,
        options: IngestOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, tickers: &[Ticker]) -> Result<RunSummary, IngestError> {
        self.run_at(tickers, Utc::now()).await
    }

    /// Runs with `now` as the reference time for freshness decisions.
    pub async fn run_at(
        &self,
        tickers: &[Ticker],
        now: DateTime<Utc>,
    ) -> Result<RunSummary, IngestError> {
        self.options.validate()?;
        let normalizer = self.options.normalizer()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id, source = self.source.source_id());
        self.execute(run_id, tickers, now, normalizer)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        tickers: &[Ticker],
        now: DateTime<Utc>,
        normalizer: Normalizer,
    ) -> Result<RunSummary, IngestError> {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();

        let mut seen = HashSet::new();
        let candidates: Vec<Ticker> = tickers
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .cloned()
            .collect();
        info!(
            requested = candidates.len(),
            batch_size = self.options.batch_size,
            skip_existing = self.options.skip_existing,
            "ingest run starting"
        );

        let mut outcomes: HashMap<Ticker, RunOutcome> = HashMap::with_capacity(candidates.len());
        let mut to_fetch = if self.options.skip_existing {
            let split = self.split_fresh(&candidates, now).await;
            info!(
                stale = split.stale.len(),
                fresh = split.fresh.len(),
                window_hours = self.options.window_hours,
                "freshness filter applied"
            );
            for (ticker, last_ingested) in split.fresh {
                outcomes.insert(ticker, RunOutcome::SkippedFresh { last_ingested });
            }
            split.stale
        } else {
            candidates.clone()
        };
        if let Some(limit) = self.options.limit {
            if to_fetch.len() > limit {
                info!(limit, deferred = to_fetch.len() - limit, "limiting identifiers fetched this run");
                to_fetch.truncate(limit);
            }
        }

        let mut fetcher = BatchFetcher::new(self.source.as_ref(), self.options.fetch_policy());
        let mut reach = Reachability::default();
        let mut fetch_requests = 0;
        let mut fallback_groups = 0;
        let group_size = fetcher.group_size();
        for (index, group) in to_fetch.chunks(group_size).enumerate() {
            if self.cancel.is_cancelled() {
                let remaining = &to_fetch[index * group_size..];
                info!(remaining = remaining.len(), "cancelled; skipping remaining groups");
                for ticker in remaining {
                    outcomes.insert(ticker.clone(), RunOutcome::Cancelled);
                }
                break;
            }
            let fetched = fetcher.fetch_group(index, group).await;
            fetch_requests += fetched.requests;
            if fetched.fell_back {
                fallback_groups += 1;
            }
            for (ticker, result) in fetched.results {
                reach.observe(&result);
                let outcome = self.settle(&normalizer, &ticker, result).await;
                outcomes.insert(ticker, outcome);
            }
        }
        if reach.is_total_failure() {
            warn!(attempted = reach.attempted, error = %reach.sample, "every fetch failed on connectivity");
            return Err(IngestError::Unreachable {
                attempted: reach.attempted,
                sample: reach.sample,
            });
        }

        let mut counts = OutcomeCounts::default();
        let mut failures = Vec::new();
        let mut ordered = Vec::with_capacity(candidates.len());
        for ticker in candidates {
            // Identifiers deferred by the limit have no outcome this run.
            let Some(outcome) = outcomes.remove(&ticker) else {
                continue;
            };
            counts.record(&outcome);
            if let Some(reason) = outcome.failure_reason() {
                failures.push(FailedIdentifier {
                    ticker: ticker.clone(),
                    stage: outcome.label(),
                    reason,
                });
            }
            ordered.push(IdentifierOutcome { ticker, outcome });
        }

        let summary = RunSummary {
            run_id,
            source: self.source.source_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            elapsed_ms: clock.elapsed().as_millis() as u64,
            requested: ordered.len(),
            fetch_requests,
            fallback_groups,
            counts,
            failures,
            outcomes: ordered,
        };
        info!(
            stored = summary.counts.stored,
            skipped = summary.counts.skipped_fresh,
            failed = summary.counts.failed(),
            cancelled = summary.counts.cancelled,
            elapsed_ms = summary.elapsed_ms,
            "ingest run finished"
        );
        Ok(summary)
    }

    /// Normalizes and persists one fetched identifier.
    async fn settle(&self, normalizer: &Normalizer, ticker: &Ticker, fetched: FetchResult) -> RunOutcome {
        let bag = match fetched {
            Ok(bag) => bag,
            Err(error) => return RunOutcome::FetchFailed { error },
        };
        let record = match normalizer.normalize(ticker, &bag) {
            Ok(record) => record,
            Err(error) => {
                warn!(ticker = %ticker, %error, "normalization failed");
                return RunOutcome::NormalizeFailed { error };
            }
        };
        match self.store.upsert(&record).await {
            Ok(()) => {
                debug!(ticker = %ticker, populated = record.populated_fields(), "stored");
                RunOutcome::Stored {
                    flagged_fields: record.flagged_fields(),
                }
            }
            Err(error) => {
                warn!(ticker = %ticker, %error, "persist failed");
                RunOutcome::PersistFailed { error }
            }
        }
    }

    async fn split_fresh(&self, candidates: &[Ticker], now: DateTime<Utc>) -> FreshnessSplit {
        let last_seen = match self.store.last_ingested_many(candidates).await {
            Ok(map) => map,
            Err(error) => {
                warn!(%error, "freshness lookup failed; treating every identifier as stale");
                HashMap::new()
            }
        };
        partition_stale(candidates, self.options.window_hours, now, |t| {
            last_seen.get(t).copied()
        })
    }
}
