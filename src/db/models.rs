use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

/// One observation window for one station, joined from the three parameter series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationReading {
    pub station_key: String,
    pub station_name: String,
    pub owner: String,
    pub location: GeoPoint,
    /// Epoch milliseconds, UTC
    pub timestamp: i64,

    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
}

/// Storage identity of a reading. Stable across runs so a re-ingest overwrites.
///
/// The timestamp is rendered at a fixed width of 20 characters (sign
/// included), so the key is always everything before the last 21 characters
/// and no two identities share an id.
pub fn document_id(station_key: &str, timestamp: i64) -> String {
    format!("{}-{:020}", station_key, timestamp)
}

impl StationReading {
    pub fn doc_id(&self) -> String {
        document_id(&self.station_key, self.timestamp)
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp).single()
    }

    /// Numeric value of a field, `None` when not reported or not numeric.
    pub fn value(&self, field: Field) -> Option<f64> {
        match field {
            Field::Timestamp => Some(self.timestamp as f64),
            Field::Temperature => self.temperature,
            Field::WindSpeed => self.wind_speed,
            Field::WindDirection => self.wind_direction,
            Field::DocId => None,
        }
    }

    pub fn sort_value(&self, field: Field) -> Option<SortValue> {
        match field {
            Field::Timestamp => Some(SortValue::Int(self.timestamp)),
            Field::DocId => Some(SortValue::Text(self.doc_id())),
            other => self.value(other).map(SortValue::Float),
        }
    }

    /// Cursor positioned on this document for the given sort.
    ///
    /// Returns `None` when any sort field is null on this document, since a
    /// null cannot be resumed from.
    pub fn cursor_for(&self, sort: &[SortSpec]) -> Option<Cursor> {
        sort.iter()
            .map(|s| self.sort_value(s.field))
            .collect::<Option<Vec<_>>>()
            .map(Cursor)
    }
}

/// Row shape of the `station_readings` table.
#[derive(Debug, Clone, FromRow)]
pub struct ReadingRow {
    pub doc_id: String,
    pub station_key: String,
    pub station_name: String,
    pub owner: String,
    pub longitude: f64,
    pub latitude: f64,
    pub observed_ms: i64,
    pub temperature: Option<f64>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub indexed_at: DateTime<Utc>,
}

impl From<ReadingRow> for StationReading {
    fn from(row: ReadingRow) -> Self {
        Self {
            station_key: row.station_key,
            station_name: row.station_name,
            owner: row.owner,
            location: GeoPoint {
                longitude: row.longitude,
                latitude: row.latitude,
            },
            timestamp: row.observed_ms,
            temperature: row.temperature,
            wind_speed: row.wind_speed,
            wind_direction: row.wind_direction,
        }
    }
}

/// Upsert of one document under a deterministic id.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOperation {
    pub id: String,
    pub document: StationReading,
}

impl From<StationReading> for IndexOperation {
    fn from(document: StationReading) -> Self {
        Self {
            id: document.doc_id(),
            document,
        }
    }
}

impl IndexOperation {
    /// Collapse operations sharing an id, keeping the last one in input order.
    pub fn dedup_last(operations: Vec<IndexOperation>) -> Vec<IndexOperation> {
        let mut positions: HashMap<String, usize> = HashMap::with_capacity(operations.len());
        let mut unique: Vec<IndexOperation> = Vec::with_capacity(operations.len());
        for op in operations {
            match positions.get(&op.id) {
                Some(&idx) => unique[idx] = op,
                None => {
                    positions.insert(op.id.clone(), unique.len());
                    unique.push(op);
                }
            }
        }
        unique
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationFailure {
    pub station_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub indexed_count: usize,
    pub failures: Vec<StationFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Timestamp,
    Temperature,
    WindSpeed,
    WindDirection,
    DocId,
}

impl Field {
    /// Fields holding a number that can be ranked or compared to a threshold.
    pub fn is_numeric(&self) -> bool {
        !matches!(self, Field::DocId)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Field::Timestamp => "timestamp",
            Field::Temperature => "temperature",
            Field::WindSpeed => "windSpeed",
            Field::WindDirection => "windDirection",
            Field::DocId => "docId",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Field {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp" => Ok(Field::Timestamp),
            "temperature" => Ok(Field::Temperature),
            "windSpeed" => Ok(Field::WindSpeed),
            "windDirection" => Ok(Field::WindDirection),
            "docId" => Ok(Field::DocId),
            other => Err(AppError::InvalidData(format!("Unknown field '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: Field,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn asc(field: Field) -> Self {
        Self {
            field,
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: Field) -> Self {
        Self {
            field,
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Inclusive bounds; a missing value never matches.
    Range {
        field: Field,
        gte: Option<f64>,
        lte: Option<f64>,
    },
    Exists(Field),
    StationKey(String),
}

impl Filter {
    pub fn matches(&self, reading: &StationReading) -> bool {
        match self {
            Filter::Range { field, gte, lte } => match reading.value(*field) {
                Some(v) => gte.map_or(true, |min| v >= min) && lte.map_or(true, |max| v <= max),
                None => false,
            },
            Filter::Exists(field) => reading.sort_value(*field).is_some(),
            Filter::StationKey(key) => reading.station_key == *key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl SortValue {
    pub fn compare(&self, other: &SortValue) -> Ordering {
        match (self, other) {
            (SortValue::Int(a), SortValue::Int(b)) => a.cmp(b),
            (SortValue::Text(a), SortValue::Text(b)) => a.cmp(b),
            (SortValue::Float(a), SortValue::Float(b)) => a.total_cmp(b),
            (SortValue::Int(a), SortValue::Float(b)) => (*a as f64).total_cmp(b),
            (SortValue::Float(a), SortValue::Int(b)) => a.total_cmp(&(*b as f64)),
            // Mixed text/number never happens for a single field; order numbers first
            (SortValue::Text(_), _) => Ordering::Greater,
            (_, SortValue::Text(_)) => Ordering::Less,
        }
    }
}

/// Sort values of the last document on a page, used to resume a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor(pub Vec<SortValue>);

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub sort: Vec<SortSpec>,
    pub filters: Vec<Filter>,
    pub size: usize,
    pub search_after: Option<Cursor>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub documents: Vec<StationReading>,
    /// Set when the page came back full and more documents may follow.
    pub next_cursor_hint: Option<Cursor>,
}
