use crate::db::models::{IndexOperation, IndexReport, StationFailure, StationReading};
use crate::db::ReadingStore;
use crate::error::{AppError, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Result of fetching and joining one station upstream of the indexer.
pub type StationOutcome = std::result::Result<Vec<StationReading>, StationFailure>;

pub struct Indexer {
    store: Arc<dyn ReadingStore>,
    chunk_size: usize,
}

impl Indexer {
    pub fn new(store: Arc<dyn ReadingStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Upsert every reading from the successful stations.
    ///
    /// Failed stations are recorded in the report and skipped. A failed bulk
    /// submission fails the whole call with `StoreWrite`; nothing from the
    /// batch should be assumed stored, and resubmitting it is safe.
    pub async fn index(&self, outcomes: Vec<StationOutcome>) -> Result<IndexReport> {
        let mut failures = Vec::new();
        let mut operations = Vec::new();

        for outcome in outcomes {
            match outcome {
                Ok(readings) => operations.extend(readings.into_iter().map(IndexOperation::from)),
                Err(failure) => {
                    warn!(
                        "Excluding station {} from batch: {}",
                        failure.station_key, failure.error
                    );
                    failures.push(failure);
                }
            }
        }

        let operations = IndexOperation::dedup_last(operations);
        let total_chunks = operations.len().div_ceil(self.chunk_size);

        for (chunk_idx, chunk) in operations.chunks(self.chunk_size).enumerate() {
            debug!(
                "Submitting bulk chunk {}/{} ({} operations)",
                chunk_idx + 1,
                total_chunks,
                chunk.len()
            );

            self.store.bulk_upsert(chunk).await.map_err(|e| match e {
                AppError::StoreWrite(_) => e,
                other => AppError::StoreWrite(other.to_string()),
            })?;
        }

        info!(
            "Indexed {} readings ({} stations failed)",
            operations.len(),
            failures.len()
        );

        Ok(IndexReport {
            indexed_count: operations.len(),
            failures,
        })
    }

    pub async fn index_readings(&self, readings: Vec<StationReading>) -> Result<IndexReport> {
        self.index(vec![Ok(readings)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{document_id, GeoPoint, SearchPage, SearchRequest};
    use crate::db::MemoryStore;
    use async_trait::async_trait;

    fn reading(key: &str, ts: i64) -> StationReading {
        StationReading {
            station_key: key.to_string(),
            station_name: format!("Station {}", key),
            owner: "SMHI".to_string(),
            location: GeoPoint {
                longitude: 14.0,
                latitude: 57.0,
            },
            timestamp: ts,
            temperature: Some(0.5),
            wind_speed: Some(2.0),
            wind_direction: None,
        }
    }

    struct UnreachableStore;

    #[async_trait]
    impl ReadingStore for UnreachableStore {
        async fn bulk_upsert(&self, _operations: &[IndexOperation]) -> Result<usize> {
            Err(AppError::InvalidData("connection refused".to_string()))
        }

        async fn search(&self, _request: &SearchRequest) -> Result<SearchPage> {
            Err(AppError::StoreQuery("connection refused".to_string()))
        }

        async fn count(&self) -> Result<u64> {
            Ok(0)
        }

        fn max_page_size(&self) -> usize {
            10
        }
    }

    #[tokio::test]
    async fn test_indexing_twice_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let indexer = Indexer::new(store.clone());
        let batch = || {
            vec![
                Ok(vec![reading("A", 1000), reading("A", 2000)]),
                Ok(vec![reading("B", 1000)]),
            ]
        };

        let first = indexer.index(batch()).await.unwrap();
        let before = store.snapshot().await;
        let second = indexer.index(batch()).await.unwrap();

        assert_eq!(first.indexed_count, 3);
        assert_eq!(second.indexed_count, 3);
        assert_eq!(store.count().await.unwrap(), 3);
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn test_failed_station_is_isolated() {
        let store = Arc::new(MemoryStore::new());
        let indexer = Indexer::new(store.clone()).with_chunk_size(1);

        let report = indexer
            .index(vec![
                Ok(vec![reading("S1", 1000)]),
                Err(StationFailure {
                    station_key: "S2".to_string(),
                    error: "HTTP 500".to_string(),
                }),
                Ok(vec![reading("S3", 1000)]),
            ])
            .await
            .unwrap();

        assert_eq!(report.indexed_count, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].station_key, "S2");
        assert!(store.get(&document_id("S1", 1000)).await.is_some());
        assert!(store.get(&document_id("S3", 1000)).await.is_some());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_identity_in_batch_counts_once() {
        let store = Arc::new(MemoryStore::new());
        let indexer = Indexer::new(store.clone());
        let report = indexer
            .index_readings(vec![reading("A", 1000), reading("A", 1000)])
            .await
            .unwrap();
        assert_eq!(report.indexed_count, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bulk_failure_is_run_level_store_write() {
        let indexer = Indexer::new(Arc::new(UnreachableStore));
        let result = indexer.index_readings(vec![reading("A", 1000)]).await;

        match result {
            Err(AppError::StoreWrite(msg)) => assert!(msg.contains("connection refused")),
            other => panic!("Expected StoreWrite error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let indexer = Indexer::new(Arc::new(UnreachableStore));
        let report = indexer.index(vec![]).await.unwrap();
        assert_eq!(report.indexed_count, 0);
        assert!(report.failures.is_empty());
    }
}
