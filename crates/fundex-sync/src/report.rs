use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

use crate::RunSummary;

/// Writes `run_summary.json` and `run_brief.md` under `<reports_dir>/<run_id>/`.
pub async fn write_run_reports(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    fs::write(run_dir.join("run_brief.md"), render_brief(summary))
        .await
        .context("writing run_brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let counts = &summary.counts;
    let mut brief = format!(
        "# Fundex Ingest Brief\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n- Elapsed: {} ms\n- Requested: {}\n- Fetch requests: {} ({} fell back to single fetches)\n\n## Outcomes\n- stored: {}\n- skipped (fresh): {}\n- fetch failed: {}\n- normalize failed: {}\n- persist failed: {}\n- cancelled: {}\n",
        summary.run_id,
        summary.source,
        summary.started_at,
        summary.finished_at,
        summary.elapsed_ms,
        summary.requested,
        summary.fetch_requests,
        summary.fallback_groups,
        counts.stored,
        counts.skipped_fresh,
        counts.fetch_failed,
        counts.normalize_failed,
        counts.persist_failed,
        counts.cancelled,
    );

    if !summary.failures.is_empty() {
        brief.push_str("\n## Failures\n");
        for failure in &summary.failures {
            brief.push_str(&format!(
                "- {} ({}): {}\n",
                failure.ticker, failure.stage, failure.reason
            ));
        }
    }
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FailedIdentifier, IdentifierOutcome, OutcomeCounts};
    use chrono::{TimeZone, Utc};
    use fundex_core::{FetchError, RunOutcome, Ticker};
    use uuid::Uuid;

    fn summary() -> RunSummary {
        let started_at = Utc.with_ymd_and_hms(2025, 8, 13, 12, 0, 0).single().unwrap();
        let ticker = Ticker::parse("ZZZZ").unwrap();
        let error = FetchError::NotFound;
        RunSummary {
            run_id: Uuid::new_v4(),
            source: "fixture".into(),
            started_at,
            finished_at: started_at + chrono::Duration::seconds(3),
            elapsed_ms: 3_000,
            requested: 2,
            fetch_requests: 2,
            fallback_groups: 1,
            counts: OutcomeCounts {
                stored: 1,
                fetch_failed: 1,
                ..OutcomeCounts::default()
            },
            failures: vec![FailedIdentifier {
                ticker: ticker.clone(),
                stage: "fetch-failed",
                reason: error.to_string(),
            }],
            outcomes: vec![
                IdentifierOutcome {
                    ticker: Ticker::parse("AAPL").unwrap(),
                    outcome: RunOutcome::Stored { flagged_fields: 0 },
                },
                IdentifierOutcome {
                    ticker,
                    outcome: RunOutcome::FetchFailed { error },
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_summary_and_brief_under_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();

        let run_dir = write_run_reports(dir.path(), &summary).await.unwrap();
        assert_eq!(run_dir, dir.path().join(summary.run_id.to_string()));

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(run_dir.join("run_summary.json")).unwrap())
                .unwrap();
        assert_eq!(json["counts"]["stored"], 1);
        assert_eq!(json["outcomes"][0]["ticker"], "AAPL");
        assert_eq!(json["outcomes"][0]["outcome"], "stored");
        assert_eq!(json["outcomes"][1]["error"]["kind"], "not_found");

        let brief = std::fs::read_to_string(run_dir.join("run_brief.md")).unwrap();
        assert!(brief.contains("- stored: 1"));
        assert!(brief.contains("- ZZZZ (fetch-failed): identifier not found by remote service"));
    }

    #[test]
    fn brief_omits_failure_section_for_clean_runs() {
        let mut summary = summary();
        summary.failures.clear();
        assert!(!render_brief(&summary).contains("## Failures"));
    }
}
