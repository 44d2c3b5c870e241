use crate::db::models::{
    Field, Filter, IndexOperation, ReadingRow, SearchPage, SearchRequest, SortOrder, SortValue,
    StationReading,
};
use crate::db::ReadingStore;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

/// Rows per INSERT statement; 10 binds per row keeps us well under the
/// 65535 parameter limit.
const BATCH_SIZE: usize = 1000;

const SELECT_COLUMNS: &str = "SELECT doc_id, station_key, station_name, owner, longitude, latitude, \
     observed_ms, temperature, wind_speed, wind_direction, indexed_at FROM station_readings";

pub struct Repository {
    pool: PgPool,
    max_page_size: usize,
}

fn column(field: Field) -> &'static str {
    match field {
        Field::Timestamp => "observed_ms",
        Field::Temperature => "temperature",
        Field::WindSpeed => "wind_speed",
        Field::WindDirection => "wind_direction",
        Field::DocId => "doc_id",
    }
}

fn push_sort_value(qb: &mut QueryBuilder<'_, Postgres>, value: &SortValue) {
    match value {
        SortValue::Int(v) => qb.push_bind(*v),
        SortValue::Float(v) => qb.push_bind(*v),
        SortValue::Text(v) => qb.push_bind(v.clone()),
    };
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self::with_max_page_size(pool, crate::db::memory::DEFAULT_MAX_PAGE_SIZE)
    }

    pub fn with_max_page_size(pool: PgPool, max_page_size: usize) -> Self {
        Self {
            pool,
            max_page_size,
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn get_reading(&self, doc_id: &str) -> Result<Option<StationReading>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        qb.push(" WHERE doc_id = ").push_bind(doc_id.to_string());

        let row = qb
            .build_query_as::<ReadingRow>()
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(StationReading::from))
    }

    fn build_search<'a>(&self, request: &'a SearchRequest) -> Result<QueryBuilder<'a, Postgres>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_COLUMNS);
        qb.push(" WHERE TRUE");

        for filter in &request.filters {
            match filter {
                Filter::Range { field, gte, lte } => {
                    if !field.is_numeric() {
                        return Err(AppError::InvalidData(format!(
                            "Range filter is not supported on {}",
                            field
                        )));
                    }
                    let col = column(*field);
                    qb.push(format!(" AND {} IS NOT NULL", col));
                    if let Some(min) = gte {
                        qb.push(format!(" AND {} >= ", col)).push_bind(*min);
                    }
                    if let Some(max) = lte {
                        qb.push(format!(" AND {} <= ", col)).push_bind(*max);
                    }
                }
                Filter::Exists(field) => {
                    qb.push(format!(" AND {} IS NOT NULL", column(*field)));
                }
                Filter::StationKey(key) => {
                    qb.push(" AND station_key = ").push_bind(key.clone());
                }
            }
        }

        // Keyset condition: (a > x) OR (a = x AND b > y) OR ...
        if let Some(cursor) = &request.search_after {
            if cursor.0.len() != request.sort.len() {
                return Err(AppError::StoreQuery(format!(
                    "Cursor has {} values but sort has {} fields",
                    cursor.0.len(),
                    request.sort.len()
                )));
            }

            qb.push(" AND (");
            for (i, spec) in request.sort.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("(");
                for (prev, value) in request.sort[..i].iter().zip(&cursor.0) {
                    qb.push(format!("{} = ", column(prev.field)));
                    push_sort_value(&mut qb, value);
                    qb.push(" AND ");
                }
                let op = match spec.order {
                    SortOrder::Asc => ">",
                    SortOrder::Desc => "<",
                };
                qb.push(format!("{} {} ", column(spec.field), op));
                push_sort_value(&mut qb, &cursor.0[i]);
                qb.push(")");
            }
            qb.push(")");
        }

        if request.sort.is_empty() {
            qb.push(" ORDER BY doc_id");
        } else {
            let order_by: Vec<String> = request
                .sort
                .iter()
                .map(|s| {
                    let dir = match s.order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    format!("{} {} NULLS LAST", column(s.field), dir)
                })
                .collect();
            qb.push(format!(" ORDER BY {}", order_by.join(", ")));
        }

        qb.push(" LIMIT ").push_bind(request.size as i64);

        Ok(qb)
    }
}

#[async_trait]
impl ReadingStore for Repository {
    /// Upsert documents keyed by `doc_id`.
    ///
    /// All chunks run inside one transaction, so a failure leaves the table
    /// as it was before the call.
    async fn bulk_upsert(&self, operations: &[IndexOperation]) -> Result<usize> {
        if operations.is_empty() {
            return Ok(0);
        }

        // ON CONFLICT cannot touch the same row twice in one statement
        let operations = IndexOperation::dedup_last(operations.to_vec());

        let write_err = |e: sqlx::Error| AppError::StoreWrite(e.to_string());
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        let mut total_rows_affected = 0;

        for (batch_idx, chunk) in operations.chunks(BATCH_SIZE).enumerate() {
            debug!(
                "Upserting batch {}/{} ({} readings)",
                batch_idx + 1,
                operations.len().div_ceil(BATCH_SIZE),
                chunk.len()
            );

            let mut query_builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO station_readings (
                    doc_id, station_key, station_name, owner, longitude, latitude,
                    observed_ms, temperature, wind_speed, wind_direction
                ) ",
            );

            query_builder.push_values(chunk, |mut b, op| {
                let doc = &op.document;
                b.push_bind(&op.id)
                    .push_bind(&doc.station_key)
                    .push_bind(&doc.station_name)
                    .push_bind(&doc.owner)
                    .push_bind(doc.location.longitude)
                    .push_bind(doc.location.latitude)
                    .push_bind(doc.timestamp)
                    .push_bind(doc.temperature)
                    .push_bind(doc.wind_speed)
                    .push_bind(doc.wind_direction);
            });

            query_builder.push(
                " ON CONFLICT (doc_id) DO UPDATE SET \
                station_key = EXCLUDED.station_key, \
                station_name = EXCLUDED.station_name, \
                owner = EXCLUDED.owner, \
                longitude = EXCLUDED.longitude, \
                latitude = EXCLUDED.latitude, \
                observed_ms = EXCLUDED.observed_ms, \
                temperature = EXCLUDED.temperature, \
                wind_speed = EXCLUDED.wind_speed, \
                wind_direction = EXCLUDED.wind_direction, \
                indexed_at = NOW()",
            );

            let result = query_builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;

            total_rows_affected += result.rows_affected() as usize;
        }

        tx.commit().await.map_err(write_err)?;

        Ok(total_rows_affected)
    }

    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        if request.size > self.max_page_size {
            return Err(AppError::StoreQuery(format!(
                "Requested page size {} exceeds maximum {}",
                request.size, self.max_page_size
            )));
        }

        let mut qb = self.build_search(request)?;
        let rows = qb
            .build_query_as::<ReadingRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::StoreQuery(e.to_string()))?;

        let documents: Vec<StationReading> = rows.into_iter().map(StationReading::from).collect();
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
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM station_readings")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::StoreQuery(e.to_string()))?;

        Ok(count as u64)
    }

    fn max_page_size(&self) -> usize {
        self.max_page_size
    }
}
