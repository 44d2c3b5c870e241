use crate::db::models::{Field, Filter, SearchRequest, SortSpec, StationReading};
use crate::db::ReadingStore;
use crate::error::{AppError, Result};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lower bound of "måttlig vind" (moderate wind) in m/s.
pub const MODERATE_WIND_SPEED: f64 = 3.4;

/// A range scan that stopped early. `partial` holds every document gathered
/// before the failure, in scan order.
#[derive(Error, Debug)]
#[error("range query stopped after {} documents: {source}", .partial.len())]
pub struct PartialScan {
    pub partial: Vec<StationReading>,
    #[source]
    pub source: AppError,
}

/// Sort used by range scans. Timestamp alone is not a total order since many
/// stations report on the same instant, so the document id breaks ties.
pub fn range_sort() -> Vec<SortSpec> {
    vec![SortSpec::asc(Field::Timestamp), SortSpec::asc(Field::DocId)]
}

/// Every reading with `from <= timestamp <= to`, ascending by timestamp.
///
/// Pages through the store with a cursor until a short or empty page. When
/// `shutdown` flips to `true` the scan stops before requesting the next page.
pub async fn range_query(
    store: &dyn ReadingStore,
    from: i64,
    to: i64,
    page_size: usize,
    shutdown: Option<&watch::Receiver<bool>>,
) -> std::result::Result<Vec<StationReading>, PartialScan> {
    let mut accumulated: Vec<StationReading> = Vec::new();

    if page_size == 0 {
        return Err(PartialScan {
            partial: accumulated,
            source: AppError::InvalidData("page size must be at least 1".to_string()),
        });
    }
    if from > to {
        return Ok(accumulated);
    }

    let size = page_size.min(store.max_page_size());
    let mut request = SearchRequest {
        sort: range_sort(),
        filters: vec![Filter::Range {
            field: Field::Timestamp,
            gte: Some(from as f64),
            lte: Some(to as f64),
        }],
        size,
        search_after: None,
    };
    let mut pages = 0usize;

    loop {
        if shutdown.is_some_and(|rx| *rx.borrow()) {
            warn!(
                "Range query cancelled after {} pages ({} documents)",
                pages,
                accumulated.len()
            );
            return Err(PartialScan {
                partial: accumulated,
                source: AppError::Cancelled,
            });
        }

        let page = match store.search(&request).await {
            Ok(page) => page,
            Err(e) => {
                return Err(PartialScan {
                    partial: accumulated,
                    source: e,
                })
            }
        };
        pages += 1;

        let returned = page.documents.len();
        let next_cursor = page
            .documents
            .last()
            .and_then(|doc| doc.cursor_for(&request.sort));
        accumulated.extend(page.documents);

        debug!("Range page {}: {} documents", pages, returned);

        if returned < size {
            break;
        }

        match next_cursor {
            Some(cursor) => request.search_after = Some(cursor),
            None => {
                return Err(PartialScan {
                    partial: accumulated,
                    source: AppError::InvalidData(
                        "last document of page has no sort values".to_string(),
                    ),
                })
            }
        }
    }

    info!(
        "Range query [{}, {}] returned {} documents in {} pages",
        from,
        to,
        accumulated.len(),
        pages
    );
    Ok(accumulated)
}

/// Sort for ranking views: the field descending, document id to keep equal
/// values in a stable order.
fn ranking_sort(field: Field) -> Vec<SortSpec> {
    vec![SortSpec::desc(field), SortSpec::asc(Field::DocId)]
}

fn require_numeric(field: Field) -> Result<()> {
    if field.is_numeric() {
        Ok(())
    } else {
        Err(AppError::InvalidData(format!("{} is not a numeric field", field)))
    }
}

async fn single_page(
    store: &dyn ReadingStore,
    request: SearchRequest,
) -> Result<Vec<StationReading>> {
    if request.size == 0 {
        return Ok(Vec::new());
    }
    let request = SearchRequest {
        size: request.size.min(store.max_page_size()),
        ..request
    };
    Ok(store.search(&request).await?.documents)
}

/// Top `n` readings by `field`, descending. Readings without a value are skipped.
pub async fn top_by_value(
    store: &dyn ReadingStore,
    field: Field,
    n: usize,
) -> Result<Vec<StationReading>> {
    require_numeric(field)?;
    single_page(
        store,
        SearchRequest {
            sort: ranking_sort(field),
            filters: vec![Filter::Exists(field)],
            size: n,
            search_after: None,
        },
    )
    .await
}

/// Readings with `field >= min_value`, highest first, at most `max_results`.
///
/// This is a top slice: when more readings qualify the rest are dropped
/// without notice. Use `range_query` when every document is needed.
pub async fn threshold_query(
    store: &dyn ReadingStore,
    field: Field,
    min_value: f64,
    max_results: usize,
) -> Result<Vec<StationReading>> {
    require_numeric(field)?;
    single_page(
        store,
        SearchRequest {
            sort: ranking_sort(field),
            filters: vec![Filter::Range {
                field,
                gte: Some(min_value),
                lte: None,
            }],
            size: max_results,
            search_after: None,
        },
    )
    .await
}

pub async fn highest_wind_speed(store: &dyn ReadingStore) -> Result<Option<StationReading>> {
    Ok(top_by_value(store, Field::WindSpeed, 1).await?.into_iter().next())
}

pub async fn moderate_wind_stations(
    store: &dyn ReadingStore,
    max_results: usize,
) -> Result<Vec<StationReading>> {
    threshold_query(store, Field::WindSpeed, MODERATE_WIND_SPEED, max_results).await
}

/// Most recent reading stored for one station.
pub async fn latest_for_station(
    store: &dyn ReadingStore,
    station_key: &str,
) -> Result<Option<StationReading>> {
    let documents = single_page(
        store,
        SearchRequest {
            sort: vec![SortSpec::desc(Field::Timestamp)],
            filters: vec![Filter::StationKey(station_key.to_string())],
            size: 1,
            search_after: None,
        },
    )
    .await?;
    Ok(documents.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{GeoPoint, IndexOperation};
    use crate::db::MemoryStore;

    fn reading(key: &str, ts: i64, wind_speed: Option<f64>) -> StationReading {
        StationReading {
            station_key: key.to_string(),
            station_name: format!("Station {}", key),
            owner: "SMHI".to_string(),
            location: GeoPoint {
                longitude: 12.0,
                latitude: 56.0,
            },
            timestamp: ts,
            temperature: Some(4.0),
            wind_speed,
            wind_direction: Some(90.0),
        }
    }

    async fn seeded(docs: Vec<StationReading>) -> MemoryStore {
        let store = MemoryStore::new();
        let ops: Vec<IndexOperation> = docs.into_iter().map(IndexOperation::from).collect();
        store.bulk_upsert(&ops).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_range_query_inclusive_bounds() {
        let store = seeded(vec![
            reading("A", 999, None),
            reading("A", 1000, None),
            reading("A", 2000, None),
            reading("A", 2001, None),
        ])
        .await;

        let docs = range_query(&store, 1000, 2000, 10, None).await.unwrap();
        let ts: Vec<i64> = docs.iter().map(|d| d.timestamp).collect();
        assert_eq!(ts, vec![1000, 2000]);
    }

    #[tokio::test]
    async fn test_range_query_inverted_interval_is_empty() {
        let store = seeded(vec![reading("A", 1000, None)]).await;
        assert!(range_query(&store, 2000, 1000, 10, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_range_query_zero_page_size_is_invalid() {
        let store = MemoryStore::new();
        let err = range_query(&store, 0, 10, 0, None).await.unwrap_err();
        assert!(matches!(err.source, AppError::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_range_query_stops_when_cancelled() {
        let store = seeded(vec![reading("A", 1000, None)]).await;
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let err = range_query(&store, 0, 5000, 10, Some(&rx)).await.unwrap_err();
        assert!(matches!(err.source, AppError::Cancelled));
        assert!(err.partial.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_and_top_skip_missing_values() {
        let store = seeded(vec![
            reading("A", 1000, Some(4.0)),
            reading("B", 1000, None),
            reading("C", 1000, Some(3.4)),
            reading("D", 1000, Some(1.0)),
        ])
        .await;

        let moderate = moderate_wind_stations(&store, 100).await.unwrap();
        let keys: Vec<&str> = moderate.iter().map(|d| d.station_key.as_str()).collect();
        assert_eq!(keys, vec!["A", "C"]);

        let top = highest_wind_speed(&store).await.unwrap().unwrap();
        assert_eq!(top.station_key, "A");

        assert!(top_by_value(&store, Field::WindSpeed, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_truncates_to_max_results() {
        let store = seeded(
            (0..20)
                .map(|i| reading(&format!("S{:02}", i), 1000, Some(10.0 + i as f64)))
                .collect(),
        )
        .await;

        let docs = threshold_query(&store, Field::WindSpeed, 0.0, 5).await.unwrap();
        assert_eq!(docs.len(), 5);
        assert_eq!(docs[0].wind_speed, Some(29.0));
        assert_eq!(docs[4].wind_speed, Some(25.0));
    }

    #[tokio::test]
    async fn test_ranking_rejects_doc_id_field() {
        let store = seeded(vec![reading("A", 1000, Some(5.0))]).await;

        let threshold = threshold_query(&store, Field::DocId, 0.0, 10).await;
        assert!(matches!(threshold, Err(AppError::InvalidData(_))));

        let top = top_by_value(&store, Field::DocId, 1).await;
        assert!(matches!(top, Err(AppError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_latest_for_station() {
        let store = seeded(vec![
            reading("A", 1000, Some(1.0)),
            reading("A", 3000, Some(3.0)),
            reading("B", 5000, Some(5.0)),
        ])
        .await;

        let latest = latest_for_station(&store, "A").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 3000);
        assert!(latest_for_station(&store, "Z").await.unwrap().is_none());
    }
}
