use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fundex_adapters::{FixtureSource, TickerList};
use fundex_core::{FetchError, IssueKind, RunOutcome, Ticker};
use fundex_storage::MemoryStore;
use fundex_sync::{write_run_reports, IngestOptions, IngestPipeline};
use rust_decimal_macros::dec;

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn options() -> IngestOptions {
    IngestOptions {
        batch_size: 2,
        request_delay: Duration::ZERO,
        ..IngestOptions::default()
    }
}

#[tokio::test]
async fn bundled_fixtures_ingest_end_to_end() {
    let list = TickerList::from_file(fixtures_dir().join("tickers.txt"), None).unwrap();
    assert_eq!(list.tickers.len(), 6);
    let source = Arc::new(FixtureSource::from_path(fixtures_dir().join("quotes.json")).unwrap());
    let store = Arc::new(MemoryStore::new());

    let summary = IngestPipeline::new(source, store.clone(), options())
        .run(&list.tickers)
        .await
        .unwrap();

    assert_eq!(summary.requested, 6);
    assert_eq!(summary.fetch_requests, 3);
    assert_eq!(summary.counts.stored, 5);
    assert_eq!(summary.counts.fetch_failed, 1);
    assert_eq!(
        summary.outcome_for("ZZZZ"),
        Some(&RunOutcome::FetchFailed {
            error: FetchError::MissingFromResponse
        })
    );

    let msft = store.latest(&Ticker::parse("MSFT").unwrap()).await.unwrap();
    assert_eq!(msft.integer("market_cap"), Some(3_130_000_000_000));
    assert_eq!(msft.decimal("current_price"), Some(dec!(421.53)));
    assert!(msft.value("trailing_pe").is_none());
    assert!(msft.has_issue("trailing_pe", IssueKind::NonFinite));
    assert!(msft.value("forward_pe").is_none());
    assert!(!msft.has_issue("forward_pe", IssueKind::Unparseable));

    let aapl = store.latest(&Ticker::parse("AAPL").unwrap()).await.unwrap();
    assert_eq!(aapl.boolean("esg_populated"), Some(false));
    assert_eq!(
        aapl.timestamp("ex_dividend_date"),
        Utc.with_ymd_and_hms(2024, 8, 12, 0, 0, 0).single()
    );
    assert!(aapl.json("company_officers").is_some());
    assert!(aapl.extra.contains_key("maxAge"));
}

#[tokio::test]
async fn second_run_inside_window_skips_everything_stored() {
    let list = TickerList::from_file(fixtures_dir().join("tickers.txt"), None).unwrap();
    let source = Arc::new(FixtureSource::from_path(fixtures_dir().join("quotes.json")).unwrap());
    let store = Arc::new(MemoryStore::new());
    let pipeline = IngestPipeline::new(
        source,
        store.clone(),
        IngestOptions {
            skip_existing: true,
            ..options()
        },
    );

    let first = pipeline.run(&list.tickers).await.unwrap();
    assert_eq!(first.counts.stored, 5);

    let second = pipeline.run(&list.tickers).await.unwrap();
    assert_eq!(second.counts.skipped_fresh, 5);
    assert_eq!(second.counts.fetch_failed, 1);
    assert_eq!(second.fetch_requests, 1);
    assert_eq!(store.len().await, 5);
}

#[tokio::test]
async fn run_reports_land_in_run_directory() {
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(FixtureSource::from_path(fixtures_dir().join("quotes.json")).unwrap());
    let store = Arc::new(MemoryStore::new());
    let tickers = vec![Ticker::parse("KO").unwrap()];

    let summary = IngestPipeline::new(source, store, options())
        .run(&tickers)
        .await
        .unwrap();
    let run_dir = write_run_reports(dir.path(), &summary).await.unwrap();

    assert!(run_dir.join("run_summary.json").is_file());
    assert!(run_dir.join("run_brief.md").is_file());
}
