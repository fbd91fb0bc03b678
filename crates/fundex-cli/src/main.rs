use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use fundex_adapters::{FixtureSource, MarketDataSource, TickerList, YahooQuoteSource};
use fundex_core::{CancellationFlag, Ticker};
use fundex_storage::{HttpFetcher, MemoryStore, PgStore, RecordStore};
use fundex_sync::{
    write_run_reports, IngestFileConfig, IngestOptions, IngestPipeline, RunSummary, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fundex")]
#[command(about = "Incremental ingestion of per-security financial attributes")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// YAML file with ingest defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and store attributes for a ticker list (default).
    Sync(SyncArgs),
    /// Apply pending database migrations.
    Migrate,
    /// Show the latest stored snapshots for one ticker.
    History {
        ticker: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Delete snapshots older than the given number of days.
    Prune {
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i64::from(i32::MAX)))]
        days: u32,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct SyncArgs {
    #[arg(short = 'b', long)]
    batch_size: Option<usize>,

    /// Skip tickers ingested within the hours window.
    #[arg(short = 's', long)]
    skip_existing: bool,

    /// Freshness window in hours (also accepted as `-hw`).
    #[arg(long)]
    hours_window: Option<f64>,

    /// Ticker file, one symbol per line.
    #[arg(short = 'f', long = "file", conflicts_with = "tickers")]
    ticker_file: Option<PathBuf>,

    /// Comma-separated ticker list.
    #[arg(long)]
    tickers: Option<String>,

    /// Fetch at most this many identifiers, counted after the freshness filter.
    #[arg(short = 'c', long)]
    count: Option<usize>,

    /// Serve attributes from a JSON fixture document instead of the remote API.
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Keep records in memory instead of Postgres.
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

/// Rewrites the two-letter `-hw` flag, which clap cannot express as a short option.
fn expand_aliases(args: impl IntoIterator<Item = String>) -> Vec<String> {
    args.into_iter()
        .map(|arg| {
            if arg == "-hw" {
                "--hours-window".to_string()
            } else if let Some(value) = arg.strip_prefix("-hw=") {
                format!("--hours-window={value}")
            } else {
                arg
            }
        })
        .collect()
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("FUNDEX_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_from(expand_aliases(std::env::args()));
    init_tracing()?;
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(cli.sync)) {
        Commands::Sync(args) => run_sync(&config, cli.config.as_deref(), args).await?,
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::History { ticker, limit } => {
            let ticker = Ticker::parse(&ticker).with_context(|| format!("invalid ticker `{ticker}`"))?;
            let store = connect(&config).await?;
            let rows = store.history(&ticker, limit).await?;
            if rows.is_empty() {
                println!("no snapshots stored for {ticker}");
            }
            for row in rows {
                println!(
                    "{} {} ingested={} price={} market_cap={} fields={} flagged={}",
                    row.ticker,
                    row.snapshot_date,
                    row.ingested_at.to_rfc3339(),
                    row.current_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    row.market_cap.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                    row.populated_fields,
                    row.flagged_fields,
                );
            }
        }
        Commands::Prune { days } => {
            let store = connect(&config).await?;
            let removed = store.prune_older_than(days).await?;
            println!("pruned {removed} snapshots older than {days} days");
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL is not set (use --dry-run to run without a database)");
    };
    PgStore::connect(url).await
}

fn resolve_options(
    config: &SyncConfig,
    config_file: Option<&Path>,
    args: &SyncArgs,
) -> Result<IngestOptions> {
    let mut options = IngestOptions::from_config(config);
    if let Some(path) = config_file {
        options = options.with_file(&IngestFileConfig::load(path)?);
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if args.skip_existing {
        options.skip_existing = true;
    }
    if let Some(hours) = args.hours_window {
        options.window_hours = hours;
    }
    if args.count.is_some() {
        options.limit = args.count;
    }
    options.validate()?;
    Ok(options)
}

fn resolve_tickers(args: &SyncArgs, fixtures: Option<&FixtureSource>) -> Result<Vec<Ticker>> {
    let list = if let Some(path) = &args.ticker_file {
        TickerList::from_file(path, None)?
    } else if let Some(csv) = &args.tickers {
        TickerList::from_csv(csv, None)
    } else if let Some(fixtures) = fixtures {
        TickerList::from_entries(fixtures.tickers().map(Ticker::as_str), None)
    } else {
        bail!("no tickers given: pass --file or --tickers");
    };
    for rejected in &list.rejected {
        warn!(input = %rejected.input, error = %rejected.error, "skipping invalid ticker");
    }
    if list.tickers.is_empty() {
        bail!("ticker list is empty after filtering");
    }
    Ok(list.tickers)
}

async fn run_sync(config: &SyncConfig, config_file: Option<&Path>, args: SyncArgs) -> Result<()> {
    let options = resolve_options(config, config_file, &args)?;

    let fixtures = args
        .fixtures
        .as_deref()
        .map(FixtureSource::from_path)
        .transpose()?;
    let tickers = resolve_tickers(&args, fixtures.as_ref())?;

    let source: Arc<dyn MarketDataSource> = match fixtures {
        Some(fixtures) => Arc::new(fixtures),
        None => {
            let http = HttpFetcher::new(config.http_client_config())?;
            Arc::new(YahooQuoteSource::new(Arc::new(http), &config.quote_base_url)?)
        }
    };
    let store: Arc<dyn RecordStore> = if args.dry_run {
        info!("dry run: records are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect(config).await?)
    };

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current group");
            on_signal.cancel();
        }
    });

    let summary = IngestPipeline::new(source, store, options)
        .with_cancellation(cancel)
        .run(&tickers)
        .await?;
    let reports_dir = args.reports_dir.unwrap_or_else(|| config.reports_dir.clone());
    let reports = match write_reports(&reports_dir, &summary).await {
        Some(run_dir) => run_dir.display().to_string(),
        None => "not written".to_string(),
    };

    println!(
        "sync complete: run_id={} requested={} stored={} skipped={} failed={} cancelled={} elapsed_ms={} reports={}",
        summary.run_id,
        summary.requested,
        summary.counts.stored,
        summary.counts.skipped_fresh,
        summary.counts.failed(),
        summary.counts.cancelled,
        summary.elapsed_ms,
        reports
    );
    Ok(())
}

/// Report failures are logged, never returned.
async fn write_reports(reports_dir: &Path, summary: &RunSummary) -> Option<PathBuf> {
    match write_run_reports(reports_dir, summary).await {
        Ok(run_dir) => Some(run_dir),
        Err(error) => {
            warn!(error = %format!("{error:#}"), dir = %reports_dir.display(), "could not write run reports");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(expand_aliases(args.iter().map(|a| a.to_string()))).unwrap()
    }

    #[test]
    fn bare_invocation_defaults_to_sync_flags() {
        let cli = parse(&["fundex", "-b", "5", "-s", "-hw", "6.5", "--tickers", "AAPL,MSFT"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.sync.batch_size, Some(5));
        assert!(cli.sync.skip_existing);
        assert_eq!(cli.sync.hours_window, Some(6.5));
        assert_eq!(cli.sync.tickers.as_deref(), Some("AAPL,MSFT"));
    }

    #[test]
    fn sync_subcommand_accepts_the_same_flags() {
        let cli = parse(&[
            "fundex", "sync", "--config", "fundex.yaml", "-hw=12", "-f", "tickers.txt", "--dry-run",
        ]);
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync subcommand");
        };
        assert_eq!(cli.config, Some(PathBuf::from("fundex.yaml")));
        assert_eq!(args.hours_window, Some(12.0));
        assert_eq!(args.ticker_file, Some(PathBuf::from("tickers.txt")));
        assert!(args.dry_run);
    }

    #[test]
    fn prune_days_must_fit_an_interval() {
        let cli = Cli::try_parse_from(["fundex", "prune", "--days", "30"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Prune { days: 30 })));
        assert!(Cli::try_parse_from(["fundex", "prune", "--days", "0"]).is_err());
        assert!(Cli::try_parse_from(["fundex", "prune", "--days", "4294967295"]).is_err());
    }

    #[test]
    fn file_and_ticker_list_are_mutually_exclusive() {
        let args = expand_aliases(["fundex", "-f", "a.txt", "--tickers", "A"].map(String::from));
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn cli_flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fundex.yaml");
        std::fs::write(&path, "batch_size: 40\nwindow_hours: 2\n").unwrap();
        let config = SyncConfig::from_lookup(|_| None);
        let args = SyncArgs {
            batch_size: Some(7),
            ..SyncArgs::default()
        };

        let options = resolve_options(&config, Some(&path), &args).unwrap();
        assert_eq!(options.batch_size, 7);
        assert_eq!(options.window_hours, 2.0);
    }

    #[test]
    fn zero_batch_size_is_a_configuration_error() {
        let config = SyncConfig::from_lookup(|_| None);
        let args = SyncArgs {
            batch_size: Some(0),
            ..SyncArgs::default()
        };
        let err = resolve_options(&config, None, &args).unwrap_err();
        assert!(err.to_string().contains("batch size"));
    }

    #[tokio::test]
    async fn unwritable_reports_dir_does_not_fail_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = dir.path().join("quotes.json");
        std::fs::write(&fixtures, r#"{"KO": {"currentPrice": 70.95}}"#).unwrap();
        let source = Arc::new(FixtureSource::from_path(&fixtures).unwrap());
        let options = IngestOptions {
            request_delay: std::time::Duration::ZERO,
            ..IngestOptions::default()
        };
        let summary = IngestPipeline::new(source, Arc::new(MemoryStore::new()), options)
            .run(&[Ticker::parse("KO").unwrap()])
            .await
            .unwrap();

        // A regular file where the reports directory should be.
        let blocked = dir.path().join("reports");
        std::fs::write(&blocked, "").unwrap();
        assert!(write_reports(&blocked, &summary).await.is_none());
        assert!(write_reports(&dir.path().join("ok"), &summary).await.is_some());
    }

    #[test]
    fn ticker_list_requires_a_source() {
        let err = resolve_tickers(&SyncArgs::default(), None).unwrap_err();
        assert!(err.to_string().contains("no tickers given"));
    }

    #[test]
    fn count_caps_the_run_rather_than_the_ticker_list() {
        let args = SyncArgs {
            tickers: Some("msft, aapl ,nvda".into()),
            skip_existing: true,
            count: Some(2),
            ..SyncArgs::default()
        };
        let tickers = resolve_tickers(&args, None).unwrap();
        let symbols: Vec<&str> = tickers.iter().map(Ticker::as_str).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT", "NVDA"]);

        let options = resolve_options(&SyncConfig::from_lookup(|_| None), None, &args).unwrap();
        assert_eq!(options.limit, Some(2));
        assert!(options.skip_existing);
    }
}
