use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fundex_core::{NormalizedRecord, PersistError, Ticker};
use tokio::sync::Mutex;

/// Persistence collaborator consumed by the ingestion core.
///
/// Implementations must tolerate concurrent `upsert` calls for distinct tickers.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), PersistError>;

    /// Timestamp of the latest successful ingestion, `None` if never ingested.
    async fn last_ingested(&self, ticker: &Ticker) -> Result<Option<DateTime<Utc>>, PersistError>;

    /// Bulk form of [`RecordStore::last_ingested`]; tickers never ingested are absent from the map.
    async fn last_ingested_many(
        &self,
        tickers: &[Ticker],
    ) -> Result<HashMap<Ticker, DateTime<Utc>>, PersistError> {
        let mut out = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            if let Some(ts) = self.last_ingested(ticker).await? {
                out.insert(ticker.clone(), ts);
            }
        }
        Ok(out)
    }
}

/// Process-local store keyed like the Postgres table: one snapshot per ticker per day.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<BTreeMap<(Ticker, NaiveDate), NormalizedRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an ingestion at `at` without any attribute data.
    pub async fn mark_ingested(&self, ticker: Ticker, at: DateTime<Utc>) {
        let record = NormalizedRecord {
            ticker,
            ingested_at: at,
            values: BTreeMap::new(),
            extra: BTreeMap::new(),
            issues: Vec::new(),
        };
        let key = (record.ticker.clone(), record.snapshot_date());
        self.snapshots.lock().await.insert(key, record);
    }

    pub async fn latest(&self, ticker: &Ticker) -> Option<NormalizedRecord> {
        self.snapshots
            .lock()
            .await
            .iter()
            .filter(|((t, _), _)| t == ticker)
            .map(|(_, record)| record)
            .max_by_key(|record| record.ingested_at)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.lock().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(&self, record: &NormalizedRecord) -> Result<(), PersistError> {
        let key = (record.ticker.clone(), record.snapshot_date());
        self.snapshots.lock().await.insert(key, record.clone());
        Ok(())
    }

    async fn last_ingested(&self, ticker: &Ticker) -> Result<Option<DateTime<Utc>>, PersistError> {
        Ok(self
            .snapshots
            .lock()
            .await
            .iter()
            .filter(|((t, _), _)| t == ticker)
            .map(|(_, record)| record.ingested_at)
            .max())
    }
}
