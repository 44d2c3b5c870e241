use crate::db::models::{
    Cursor, Filter, IndexOperation, SearchPage, SearchRequest, SortOrder, SortSpec, StationReading,
};
use crate::db::ReadingStore;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_MAX_PAGE_SIZE: usize = 10_000;

/// In-process `ReadingStore` with the same upsert and paging contract as the
/// PostgreSQL repository. Used for dry runs and tests.
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, StationReading>>,
    max_page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_page_size(DEFAULT_MAX_PAGE_SIZE)
    }

    pub fn with_max_page_size(max_page_size: usize) -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            max_page_size,
        }
    }

    pub async fn get(&self, id: &str) -> Option<StationReading> {
        self.documents.read().await.get(id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<(String, StationReading)> {
        self.documents
            .read()
            .await
            .iter()
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect()
    }
}

/// Order two documents by the sort specs, nulls last in either direction.
fn compare_documents(a: &StationReading, b: &StationReading, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let ord = match (a.sort_value(spec.field), b.sort_value(spec.field)) {
            (Some(x), Some(y)) => match spec.order {
                SortOrder::Asc => x.compare(&y),
                SortOrder::Desc => y.compare(&x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// True when `doc` sorts strictly after the cursor position.
fn is_after(doc: &StationReading, cursor: &Cursor, sort: &[SortSpec]) -> bool {
    for (spec, after) in sort.iter().zip(cursor.0.iter()) {
        let Some(value) = doc.sort_value(spec.field) else {
            return false;
        };
        let ord = match spec.order {
            SortOrder::Asc => value.compare(after),
            SortOrder::Desc => after.compare(&value),
        };
        match ord {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => continue,
        }
    }
    false
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn bulk_upsert(&self, operations: &[IndexOperation]) -> Result<usize> {
        let mut documents = self.documents.write().await;
        for op in operations {
            documents.insert(op.id.clone(), op.document.clone());
        }
        debug!("Upserted {} documents into memory store", operations.len());
        Ok(operations.len())
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        if request.size > self.max_page_size {
            return Err(AppError::StoreQuery(format!(
                "Requested page size {} exceeds maximum {}",
                request.size, self.max_page_size
            )));
        }
        for filter in &request.filters {
            if let Filter::Range { field, .. } = filter {
                if !field.is_numeric() {
                    return Err(AppError::InvalidData(format!(
                        "Range filter is not supported on {}",
                        field
                    )));
                }
            }
        }
        if let Some(cursor) = &request.search_after {
            if cursor.0.len() != request.sort.len() {
                return Err(AppError::StoreQuery(format!(
                    "Cursor has {} values but sort has {} fields",
                    cursor.0.len(),
                    request.sort.len()
                )));
            }
        }

        let documents = self.documents.read().await;
        let mut hits: Vec<&StationReading> = documents
            .values()
            .filter(|doc| request.filters.iter().all(|f| f.matches(doc)))
            .filter(|doc| {
                request
                    .search_after
                    .as_ref()
                    .map_or(true, |cursor| is_after(doc, cursor, &request.sort))
            })
            .collect();

        hits.sort_by(|a, b| compare_documents(a, b, &request.sort));
        hits.truncate(request.size);

        let documents: Vec<StationReading> = hits.into_iter().cloned().collect();
        let next_cursor_hint = if request.size > 0 && documents.len() == request.size {
            documents.last().and_then(|d| d.cursor_for(&request.sort))
        } else {
            None
        };

        Ok(SearchPage {
            documents,
            next_cursor_hint,
        })
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.documents.read().await.len() as u64)
    }

    fn max_page_size(&self) -> usize {
        self.max_page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{document_id, Field, Filter, GeoPoint};

    fn reading(key: &str, ts: i64, wind_speed: Option<f64>) -> StationReading {
        StationReading {
            station_key: key.to_string(),
            station_name: format!("Station {}", key),
            owner: "SMHI".to_string(),
            location: GeoPoint {
                longitude: 15.0,
                latitude: 60.0,
            },
            timestamp: ts,
            temperature: None,
            wind_speed,
            wind_direction: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_id() {
        let store = MemoryStore::new();
        store
            .bulk_upsert(&[reading("A", 1, Some(1.0)).into()])
            .await
            .unwrap();
        store
            .bulk_upsert(&[reading("A", 1, Some(2.0)).into()])
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(&document_id("A", 1)).await.unwrap().wind_speed, Some(2.0));
    }

    #[tokio::test]
    async fn test_desc_sort_puts_nulls_last() {
        let store = MemoryStore::new();
        let ops: Vec<IndexOperation> = vec![
            reading("A", 1, None).into(),
            reading("B", 1, Some(3.0)).into(),
            reading("C", 1, Some(7.5)).into(),
        ];
        store.bulk_upsert(&ops).await.unwrap();

        let page = store
            .search(&SearchRequest {
                sort: vec![SortSpec::desc(Field::WindSpeed)],
                filters: vec![],
                size: 10,
                search_after: None,
            })
            .await
            .unwrap();

        let keys: Vec<&str> = page.documents.iter().map(|d| d.station_key.as_str()).collect();
        assert_eq!(keys, vec!["C", "B", "A"]);
        assert!(page.next_cursor_hint.is_none());
    }

    #[tokio::test]
    async fn test_search_after_resumes_past_cursor() {
        let store = MemoryStore::new();
        let ops: Vec<IndexOperation> = ["A", "B", "C"]
            .iter()
            .map(|k| IndexOperation::from(reading(k, 100, None)))
            .collect();
        store.bulk_upsert(&ops).await.unwrap();

        let sort = vec![SortSpec::asc(Field::Timestamp), SortSpec::asc(Field::DocId)];
        let first = store
            .search(&SearchRequest {
                sort: sort.clone(),
                filters: vec![Filter::Exists(Field::Timestamp)],
                size: 2,
                search_after: None,
            })
            .await
            .unwrap();
        assert_eq!(first.documents.len(), 2);

        let second = store
            .search(&SearchRequest {
                sort,
                filters: vec![],
                size: 2,
                search_after: first.next_cursor_hint,
            })
            .await
            .unwrap();
        assert_eq!(second.documents.len(), 1);
        assert_eq!(second.documents[0].station_key, "C");
    }

    #[tokio::test]
    async fn test_rejects_range_on_doc_id() {
        let store = MemoryStore::new();
        let result = store
            .search(&SearchRequest {
                sort: vec![],
                filters: vec![Filter::Range {
                    field: Field::DocId,
                    gte: Some(0.0),
                    lte: None,
                }],
                size: 1,
                search_after: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_rejects_oversized_page() {
        let store = MemoryStore::with_max_page_size(5);
        let result = store
            .search(&SearchRequest {
                sort: vec![],
                filters: vec![],
                size: 6,
                search_after: None,
            })
            .await;
        assert!(matches!(result, Err(AppError::StoreQuery(_))));
    }
}
