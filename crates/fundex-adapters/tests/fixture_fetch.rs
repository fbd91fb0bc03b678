use std::fs;
use std::time::Duration;

use fundex_adapters::{BatchFetcher, FetchPolicy, FixtureSource, TickerList};
use fundex_core::{CancellationFlag, FetchError, RawValue};

#[tokio::test]
async fn ticker_file_and_fixture_document_drive_a_batch_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let tickers_path = dir.path().join("tickers.txt");
    fs::write(&tickers_path, "# watchlist\nmsft\nAAPL\n\nnvda\naapl\n").unwrap();
    let fixtures_path = dir.path().join("quotes.json");
    fs::write(
        &fixtures_path,
        r#"{
            "AAPL": {"shortName": "Apple Inc.", "currentPrice": 227.18},
            "MSFT": {"shortName": "Microsoft Corporation", "trailingPE": "Infinity"}
        }"#,
    )
    .unwrap();

    let list = TickerList::from_file(&tickers_path, None).unwrap();
    assert_eq!(list.tickers.len(), 3);
    assert!(list.rejected.is_empty());

    let source = FixtureSource::from_path(&fixtures_path).unwrap();
    let mut fetcher = BatchFetcher::new(
        &source,
        FetchPolicy {
            batch_size: 2,
            request_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(1),
        },
    );
    let report = fetcher.fetch_batch(&list.tickers, &CancellationFlag::new()).await;

    assert_eq!(report.requests, 2);
    assert_eq!(report.succeeded(), 2);
    let (aapl, first) = &report.results[0];
    assert_eq!(aapl.as_str(), "AAPL");
    assert_eq!(
        first.as_ref().unwrap().get("shortName"),
        Some(&RawValue::Text("Apple Inc.".into()))
    );
    let (nvda, last) = &report.results[2];
    assert_eq!(nvda.as_str(), "NVDA");
    assert_eq!(last, &Err(FetchError::MissingFromResponse));
}

#[test]
fn missing_ticker_file_is_reported_with_its_path() {
    let err = TickerList::from_file("/nonexistent/tickers.txt", None).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/tickers.txt"));
}
