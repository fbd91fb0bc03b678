use std::future::Future;
use std::time::Duration;

use fundex_core::{CancellationFlag, FetchError, RawAttributeBag, Ticker};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::MarketDataSource;

pub type FetchResult = Result<RawAttributeBag, FetchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Upper bound on identifiers per multi-identifier request.
    pub batch_size: usize,
    /// Pause between consecutive outbound requests; zero disables pacing.
    pub request_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            batch_size: 15,
            request_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(20),
        }
    }
}

/// Results of one group, in group order.
#[derive(Debug, Default)]
pub struct GroupFetch {
    pub results: Vec<(Ticker, FetchResult)>,
    pub requests: usize,
    /// The group request failed and members were fetched one by one.
    pub fell_back: bool,
}

/// Per-identifier fetch results in input order.
#[derive(Debug, Default)]
pub struct BatchFetchReport {
    pub results: Vec<(Ticker, FetchResult)>,
    /// Identifiers never attempted because the run was cancelled.
    pub cancelled: Vec<Ticker>,
    pub requests: usize,
    pub fallback_groups: usize,
}

impl BatchFetchReport {
    pub fn absorb(&mut self, group: GroupFetch) {
        self.requests += group.requests;
        if group.fell_back {
            self.fallback_groups += 1;
        }
        self.results.extend(group.results);
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    /// True when something was attempted and every attempt failed on connectivity.
    pub fn is_total_connectivity_failure(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|(_, r)| matches!(r, Err(err) if err.is_connectivity()))
    }
}

struct Pacer {
    delay: Duration,
    sent_any: bool,
}

impl Pacer {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            sent_any: false,
        }
    }

    async fn before_request(&mut self) {
        if self.sent_any && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.sent_any = true;
    }
}

/// Fetches identifiers in contiguous groups. Pacing carries over between
/// groups, so one fetcher should serve a whole run.
pub struct BatchFetcher<'a> {
    source: &'a dyn MarketDataSource,
    policy: FetchPolicy,
    pacer: Pacer,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(source: &'a dyn MarketDataSource, policy: FetchPolicy) -> Self {
        Self {
            source,
            policy,
            pacer: Pacer::new(policy.request_delay),
        }
    }

    pub fn group_size(&self) -> usize {
        self.policy.batch_size.max(1)
    }

    /// Fetches all of `tickers`, stopping between groups once `cancel` is set.
    pub async fn fetch_batch(&mut self, tickers: &[Ticker], cancel: &CancellationFlag) -> BatchFetchReport {
        let batch_size = self.group_size();
        let mut report = BatchFetchReport::default();

        for (index, group) in tickers.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                let remaining = &tickers[index * batch_size..];
                info!(remaining = remaining.len(), "cancelled; skipping remaining groups");
                report.cancelled.extend(remaining.iter().cloned());
                break;
            }
            let group = self.fetch_group(index, group).await;
            report.absorb(group);
        }

        debug!(
            requests = report.requests,
            succeeded = report.succeeded(),
            fallback_groups = report.fallback_groups,
            "batch fetch finished"
        );
        report
    }

    /// One multi-identifier request for `group`, falling back to single
    /// requests when it fails.
    pub async fn fetch_group(&mut self, index: usize, group: &[Ticker]) -> GroupFetch {
        let span = info_span!("fetch_group", source = self.source.source_id(), group = index, size = group.len());
        self.fetch_group_inner(group).instrument(span).await
    }

    async fn fetch_group_inner(&mut self, group: &[Ticker]) -> GroupFetch {
        let mut out = GroupFetch::default();
        self.pacer.before_request().await;
        out.requests += 1;

        match self.bounded(self.source.fetch_many(group)).await {
            Ok(mut bags) => {
                for ticker in group {
                    let result = bags.remove(ticker).ok_or(FetchError::MissingFromResponse);
                    if result.is_err() {
                        warn!(ticker = %ticker, "identifier absent from batch response");
                    }
                    out.results.push((ticker.clone(), result));
                }
                if !bags.is_empty() {
                    debug!(unrequested = bags.len(), "ignoring bags for identifiers not in the group");
                }
            }
            Err(err) => {
                warn!(error = %err, "group request failed; fetching members individually");
                out.fell_back = true;
                for ticker in group {
                    self.pacer.before_request().await;
                    out.requests += 1;
                    let result = self.bounded(self.source.fetch_one(ticker)).await;
                    if let Err(err) = &result {
                        warn!(ticker = %ticker, error = %err, "single fetch failed");
                    }
                    out.results.push((ticker.clone(), result));
                }
            }
        }
        out
    }

    async fn bounded<T>(&self, request: impl Future<Output = Result<T, FetchError>>) -> Result<T, FetchError> {
        let limit = self.policy.request_timeout;
        match tokio::time::timeout(limit, request).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(limit.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Many(Vec<String>),
        One(String),
    }

    #[derive(Default)]
    struct ScriptedSource {
        batch_error: Option<FetchError>,
        omitted: BTreeSet<String>,
        slow: BTreeSet<String>,
        single_errors: BTreeMap<String, FetchError>,
        cancel_after_first_call: Option<CancellationFlag>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedSource {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
            if let Some(flag) = &self.cancel_after_first_call {
                flag.cancel();
            }
        }
    }

    fn bag(ticker: &Ticker) -> RawAttributeBag {
        RawAttributeBag::new(Utc::now())
            .with("symbol", ticker.as_str())
            .with("currentPrice", 10.0)
    }

    #[async_trait]
    impl MarketDataSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_one(&self, ticker: &Ticker) -> Result<RawAttributeBag, FetchError> {
            self.record(Call::One(ticker.to_string()));
            if self.slow.contains(ticker.as_str()) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            match self.single_errors.get(ticker.as_str()) {
                Some(err) => Err(err.clone()),
                None => Ok(bag(ticker)),
            }
        }

        async fn fetch_many(
            &self,
            tickers: &[Ticker],
        ) -> Result<BTreeMap<Ticker, RawAttributeBag>, FetchError> {
            self.record(Call::Many(tickers.iter().map(Ticker::to_string).collect()));
            if let Some(err) = &self.batch_error {
                return Err(err.clone());
            }
            Ok(tickers
                .iter()
                .filter(|t| !self.omitted.contains(t.as_str()))
                .map(|t| (t.clone(), bag(t)))
                .collect())
        }
    }

    fn tickers(symbols: &[&str]) -> Vec<Ticker> {
        symbols.iter().map(|s| Ticker::parse(s).unwrap()).collect()
    }

    fn policy(batch_size: usize) -> FetchPolicy {
        FetchPolicy {
            batch_size,
            request_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn groups_are_contiguous_and_bounded() {
        let source = ScriptedSource::default();
        let mut fetcher = BatchFetcher::new(&source, policy(2));
        let report = fetcher
            .fetch_batch(&tickers(&["A", "B", "C", "D", "E"]), &CancellationFlag::new())
            .await;

        assert_eq!(
            source.calls(),
            vec![
                Call::Many(vec!["A".into(), "B".into()]),
                Call::Many(vec!["C".into(), "D".into()]),
                Call::Many(vec!["E".into()]),
            ]
        );
        let order: Vec<_> = report.results.iter().map(|(t, _)| t.to_string()).collect();
        assert_eq!(order, ["A", "B", "C", "D", "E"]);
        assert_eq!(report.succeeded(), 5);
        assert_eq!(report.requests, 3);
    }

    #[tokio::test]
    async fn identifier_absent_from_reply_fails_without_retry() {
        let source = ScriptedSource {
            omitted: BTreeSet::from(["B".to_string()]),
            ..Default::default()
        };
        let mut fetcher = BatchFetcher::new(&source, policy(3));
        let report = fetcher
            .fetch_batch(&tickers(&["A", "B", "C"]), &CancellationFlag::new())
            .await;

        assert_eq!(source.calls().len(), 1);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.results[1].1, Err(FetchError::MissingFromResponse));
        assert_eq!(report.fallback_groups, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_group_falls_back_to_single_fetches() {
        let source = ScriptedSource {
            batch_error: Some(FetchError::RateLimited),
            slow: BTreeSet::from(["Z".to_string()]),
            ..Default::default()
        };
        let mut fetcher = BatchFetcher::new(&source, policy(3));
        let report = fetcher
            .fetch_batch(&tickers(&["X", "Y", "Z"]), &CancellationFlag::new())
            .await;

        assert_eq!(
            source.calls(),
            vec![
                Call::Many(vec!["X".into(), "Y".into(), "Z".into()]),
                Call::One("X".into()),
                Call::One("Y".into()),
                Call::One("Z".into()),
            ]
        );
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.results[2].1, Err(FetchError::Timeout(5_000)));
        assert_eq!(report.fallback_groups, 1);
        assert_eq!(report.requests, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_separates_every_outbound_request() {
        let source = ScriptedSource {
            batch_error: Some(FetchError::HttpStatus(500)),
            ..Default::default()
        };
        let mut fetcher = BatchFetcher::new(
            &source,
            FetchPolicy {
                request_delay: Duration::from_millis(100),
                ..policy(2)
            },
        );
        let started = Instant::now();
        let report = fetcher
            .fetch_batch(&tickers(&["A", "B", "C"]), &CancellationFlag::new())
            .await;

        // 2 group requests + 3 single requests, paced after the first.
        assert_eq!(report.requests, 5);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn cancellation_skips_later_groups() {
        let cancel = CancellationFlag::new();
        let source = ScriptedSource {
            cancel_after_first_call: Some(cancel.clone()),
            ..Default::default()
        };
        let mut fetcher = BatchFetcher::new(&source, policy(2));
        let report = fetcher
            .fetch_batch(&tickers(&["A", "B", "C", "D", "E"]), &cancel)
            .await;

        assert_eq!(source.calls().len(), 1);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.cancelled, tickers(&["C", "D", "E"]));
    }

    #[tokio::test(start_paused = true)]
    async fn group_at_a_time_fetching_keeps_pacing_across_groups() {
        let source = ScriptedSource::default();
        let mut fetcher = BatchFetcher::new(
            &source,
            FetchPolicy {
                request_delay: Duration::from_millis(250),
                ..policy(2)
            },
        );
        let all = tickers(&["A", "B", "C"]);
        let started = Instant::now();
        let mut report = BatchFetchReport::default();
        for (index, group) in all.chunks(fetcher.group_size()).enumerate() {
            let fetched = fetcher.fetch_group(index, group).await;
            assert_eq!(fetched.results.len(), group.len());
            assert!(!fetched.fell_back);
            report.absorb(fetched);
        }

        assert_eq!(report.requests, 2);
        assert_eq!(report.succeeded(), 3);
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn connectivity_failure_is_total_only_when_every_attempt_fails() {
        let down = ScriptedSource {
            batch_error: Some(FetchError::Network("connection refused".into())),
            single_errors: BTreeMap::from([
                ("A".to_string(), FetchError::Network("connection refused".into())),
                ("B".to_string(), FetchError::Unauthorized(401)),
            ]),
            ..Default::default()
        };
        let report = BatchFetcher::new(&down, policy(2))
            .fetch_batch(&tickers(&["A", "B"]), &CancellationFlag::new())
            .await;
        assert!(report.is_total_connectivity_failure());

        let partial = ScriptedSource {
            batch_error: Some(FetchError::Network("reset".into())),
            single_errors: BTreeMap::from([("A".to_string(), FetchError::Network("reset".into()))]),
            ..Default::default()
        };
        let report = BatchFetcher::new(&partial, policy(2))
            .fetch_batch(&tickers(&["A", "B"]), &CancellationFlag::new())
            .await;
        assert!(!report.is_total_connectivity_failure());
        assert!(!BatchFetchReport::default().is_total_connectivity_failure());
    }
}
