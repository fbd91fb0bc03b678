//! Staleness policy over last-ingestion timestamps. Performs no I/O.

use chrono::{DateTime, Duration, Utc};
use fundex_core::Ticker;

/// Stable split of a candidate list into identifiers to fetch and identifiers to skip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FreshnessSplit {
    pub stale: Vec<Ticker>,
    pub fresh: Vec<(Ticker, DateTime<Utc>)>,
}

pub fn window(window_hours: f64) -> Duration {
    let millis = (window_hours * 3_600_000.0).round();
    if millis >= i64::MAX as f64 {
        Duration::MAX
    } else if millis <= -(i64::MAX as f64) {
        Duration::MIN
    } else {
        Duration::milliseconds(millis as i64)
    }
}

/// Stale iff never ingested or `now - last_ingested >= window`.
pub fn is_stale(last_ingested: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    match last_ingested {
        None => true,
        Some(last) => now.signed_duration_since(last) >= window,
    }
}

pub fn partition_stale<F>(
    tickers: &[Ticker],
    window_hours: f64,
    now: DateTime<Utc>,
    mut lookup: F,
) -> FreshnessSplit
where
    F: FnMut(&Ticker) -> Option<DateTime<Utc>>,
{
    let window = window(window_hours);
    let mut split = FreshnessSplit::default();
    for ticker in tickers {
        let last = lookup(ticker);
        match last {
            Some(last) if !is_stale(Some(last), window, now) => {
                split.fresh.push((ticker.clone(), last))
            }
            _ => split.stale.push(ticker.clone()),
        }
    }
    split
}

/// Identifiers needing a refresh, in input order.
pub fn select_stale<F>(
    tickers: &[Ticker],
    window_hours: f64,
    now: DateTime<Utc>,
    lookup: F,
) -> Vec<Ticker>
where
    F: FnMut(&Ticker) -> Option<DateTime<Utc>>,
{
    partition_stale(tickers, window_hours, now, lookup).stale
}
