use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Fetch failed for station {station_key}: {reason}")]
    StationFetch { station_key: String, reason: String },

    #[error("Store write failed: {0}")]
    StoreWrite(String),

    #[error("Store query failed: {0}")]
    StoreQuery(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl AppError {
    pub fn station_fetch(station_key: &str, err: impl std::fmt::Display) -> Self {
        AppError::StationFetch {
            station_key: station_key.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
