use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fundex_core::{
    flagged_columns, ColumnValue, FieldIssue, FieldKind, NormalizedRecord, PersistError, Ticker,
    FIELDS,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::store::RecordStore;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

const TABLE: &str = "security_snapshots";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub ticker: String,
    pub snapshot_date: NaiveDate,
    pub ingested_at: DateTime<Utc>,
    pub current_price: Option<Decimal>,
    pub market_cap: Option<i64>,
    pub populated_fields: usize,
    /// Distinct columns with diagnostics, as in `NormalizedRecord::flagged_fields`.
    pub flagged_fields: usize,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        info!("database migrations applied");
        Ok(())
    }

    /// Latest snapshots for one ticker, newest first.
    pub async fn history(&self, ticker: &Ticker, limit: i64) -> anyhow::Result<Vec<SnapshotSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT ticker, snapshot_date, ingested_at, current_price, market_cap,
                   field_issues,
                   to_jsonb(s) AS row_json
              FROM security_snapshots s
             WHERE ticker = $1
             ORDER BY ingested_at DESC
             LIMIT $2
            "#,
        )
        .bind(ticker.as_str())
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading history for {ticker}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let row_json: JsonValue = row.try_get("row_json")?;
            let populated_fields = FIELDS
                .iter()
                .filter(|spec| {
                    row_json
                        .get(spec.column)
                        .is_some_and(|value| !value.is_null())
                })
                .count();
            let issues: JsonValue = row.try_get("field_issues")?;
            out.push(SnapshotSummary {
                ticker: row.try_get("ticker")?,
                snapshot_date: row.try_get("snapshot_date")?,
                ingested_at: row.try_get("ingested_at")?,
                current_price: row.try_get("current_price")?,
                market_cap: row.try_get("market_cap")?,
                populated_fields,
                flagged_fields: stored_flagged_fields(issues),
            });
        }
        Ok(out)
    }

    /// Deletes snapshots ingested more than `days` days ago; returns the number of rows removed.
    pub async fn prune_older_than(&self, days: u32) -> anyhow::Result<u64> {
        let interval_days = prune_interval_days(days)?;
        let result = sqlx::query(
            "DELETE FROM security_snapshots WHERE ingested_at < NOW() - make_interval(days => $1)",
        )
        .bind(interval_days)
        .execute(&self.pool)
        .await
        .context("pruning old snapshots")?;
        info!(days, removed = result.rows_affected(), "pruned old snapshots");
        Ok(result.rows_affected())
    }
}

fn prune_interval_days(days: u32) -> anyhow::Result<i32> {
    i32::try_from(days).with_context(|| format!("prune window of {days} days is out of range"))
}

fn stored_flagged_fields(issues: JsonValue) -> usize {
    let issues: Vec<FieldIssue> = serde_json::from_value(issues).unwrap_or_default();
    flagged_columns(&issues)
}

fn map_sqlx_error(err: sqlx::Error) -> PersistError {
    match err {
        sqlx::Error::Database(db) => PersistError::Rejected(db.to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            PersistError::Unavailable(err.to_string())
        }
        other => PersistError::Rejected(other.to_string()),
    }
}

fn upsert_builder(record: &NormalizedRecord) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {TABLE} (ticker, snapshot_date, ingested_at, "
    ));
    for spec in FIELDS {
        qb.push(spec.column);
        qb.push(", ");
    }
    qb.push("extra_attributes, field_issues) VALUES (");

    let mut values = qb.separated(", ");
    values.push_bind(record.ticker.as_str().to_string());
    values.push_bind(record.snapshot_date());
    values.push_bind(record.ingested_at);
    for spec in FIELDS {
        bind_column(&mut values, spec.kind, record.values.get(spec.column));
    }
    values.push_bind(serde_json::to_value(&record.extra).unwrap_or(JsonValue::Null));
    values.push_bind(serde_json::to_value(&record.issues).unwrap_or(JsonValue::Null));

    qb.push(") ON CONFLICT (ticker, snapshot_date) DO UPDATE SET ingested_at = EXCLUDED.ingested_at");
    for spec in FIELDS {
        qb.push(format!(", {0} = EXCLUDED.{0}", spec.column));
    }
    qb.push(", extra_attributes = EXCLUDED.extra_attributes, field_issues = EXCLUDED.field_issues");
    qb
}

fn bind_column(
    values: &mut Separated<'_, 'static, Postgres, &'static str>,
    kind: FieldKind,
    value: Option<&ColumnValue>,
) {
    match (kind, value) {
        (FieldKind::Text { .. }, Some(ColumnValue::Text(s))) => {
            values.push_bind(Some(s.clone()));
        }
        (FieldKind::Text { .. }, _) => {
            values.push_bind(None::<String>);
        }
        (FieldKind::Decimal { .. }, Some(ColumnValue::Decimal(d))) => {
            values.push_bind(Some(*d));
        }
        (FieldKind::Decimal { .. }, _) => {
            values.push_bind(None::<Decimal>);
        }
        (FieldKind::Integer, Some(ColumnValue::Integer(i))) => {
            values.push_bind(Some(*i));
        }
        (FieldKind::Integer, _) => {
            values.push_bind(None::<i64>);
        }
        (FieldKind::Boolean, Some(ColumnValue::Boolean(b))) => {
            values.push_bind(Some(*b));
        }
        (FieldKind::Boolean, _) => {
            values.push_bind(None::<bool>);
        }
        (FieldKind::Timestamp, Some(ColumnValue::Timestamp(ts))) => {
            values.push_bind(Some(*ts));
        }
        (FieldKind::Timestamp, _) => {
            values.push_bind(None::<DateTime<Utc>>);
        }
        (FieldKind::Json, Some(ColumnValue::Json(v))) => {
            values.push_bind(Some(v.clone()));
        }
        (FieldKind::Json, _) => {
            values.push_bind(None::<JsonValue>);
        }
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        let mut qb = upsert_builder(record);
        qb.build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(ticker = %record.ticker, date = %record.snapshot_date(), "snapshot upserted");
        Ok(())
    }

    async fn last_ingested(&self, ticker: &Ticker) -> Result<Option<DateTime<Utc>>, PersistError> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(ingested_at) FROM security_snapshots WHERE ticker = $1",
        )
        .bind(ticker.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)
    }

    async fn last_ingested_many(
        &self,
        tickers: &[Ticker],
    ) -> Result<HashMap<Ticker, DateTime<Utc>>, PersistError> {
        let names: Vec<String> = tickers.iter().map(|t| t.as_str().to_string()).collect();
        let rows = sqlx::query(
            r#"
            SELECT ticker, MAX(ingested_at) AS last_ingested
              FROM security_snapshots
             WHERE ticker = ANY($1)
             GROUP BY ticker
            "#,
        )
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("ticker").map_err(map_sqlx_error)?;
            let ts: DateTime<Utc> = row.try_get("last_ingested").map_err(map_sqlx_error)?;
            if let Ok(ticker) = Ticker::parse(&name) {
                out.insert(ticker, ts);
            }
        }
        Ok(out)
    }
}
