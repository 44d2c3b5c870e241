use crate::error::{AppError, Result};
use crate::fetcher::{Period, StationInfo};
use serde::{Deserialize, Deserializer};
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub stations: StationFilter,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_db_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_port() -> u16 {
    5432
}

fn default_max_connections() -> u32 {
    5
}

/// Custom deserializer that handles port as both number and string
///
/// Accepts:
/// - `port: 5432` (number)
/// - `port: "5432"` (string that parses to number)
/// - `port: ${DB_PORT}` (env var substituted to either)
fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        String(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => Ok(n),
        PortValue::String(s) => s
            .parse::<u16>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid port number: '{}'", s))),
    }
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    pub interval_minutes: u64,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_seconds: u64,
}

fn default_initial_delay() -> u64 {
    10
}

/// Which SMHI endpoints an ingestion run reads.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Full series per station for the configured period
    Stations,
    /// Latest value for all stations from the station-set endpoints
    Snapshot,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_period")]
    pub period: Period,
    #[serde(default = "default_mode")]
    pub mode: IngestMode,
    #[serde(default = "default_max_concurrent_stations")]
    pub max_concurrent_stations: usize,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_period() -> Period {
    Period::LatestMonths
}

fn default_mode() -> IngestMode {
    IngestMode::Stations
}

fn default_max_concurrent_stations() -> usize {
    4
}

fn default_request_delay_ms() -> u64 {
    100
}

const MAX_RETRIES: u32 = 10;

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_bulk_chunk_size")]
    pub bulk_chunk_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            bulk_chunk_size: default_bulk_chunk_size(),
        }
    }
}

fn default_bulk_chunk_size() -> usize {
    crate::indexer::DEFAULT_CHUNK_SIZE
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_max_page_size() -> usize {
    crate::db::memory::DEFAULT_MAX_PAGE_SIZE
}

/// Restricts ingestion to a subset of stations. Empty means all stations.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct StationFilter {
    #[serde(default)]
    pub keys: Vec<String>,
    /// Glob patterns matched against the station name
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl StationFilter {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty()
    }

    pub fn matches(&self, station: &StationInfo) -> bool {
        if self.is_empty() {
            return true;
        }

        if self.keys.iter().any(|k| *k == station.key) {
            return true;
        }

        self.patterns.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches(&station.name))
                .unwrap_or(false)
        })
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        // Substitute environment variables
        let expanded = expand_env_vars(&content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty database fields and sane pool size
    /// - Positive intervals, concurrency and page sizes
    /// - An HTTPS source URL
    /// - Well-formed station name patterns
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("DB_HOST", &self.database.host),
            ("DB_NAME", &self.database.name),
            ("DB_USER", &self.database.user),
            ("DB_PASSWORD", &self.database.password),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} environment variable is not set. \
                     Please set it or create a .env file. \
                     See .env.example for required variables.",
                    field_name
                )));
            }
        }

        if self.database.host.is_empty() {
            return Err(AppError::Config(
                "Database host cannot be empty".to_string(),
            ));
        }

        if self.database.name.is_empty() {
            return Err(AppError::Config(
                "Database name cannot be empty".to_string(),
            ));
        }

        if self.database.user.is_empty() {
            return Err(AppError::Config(
                "Database user cannot be empty".to_string(),
            ));
        }

        if self.database.port == 0 {
            return Err(AppError::Config("Database port cannot be 0".to_string()));
        }

        if self.database.max_connections == 0 {
            return Err(AppError::Config(
                "Database max_connections must be at least 1".to_string(),
            ));
        }

        if self.database.max_connections > 100 {
            return Err(AppError::Config(format!(
                "Database max_connections {} seems too high, maximum recommended is 100",
                self.database.max_connections
            )));
        }

        if self.scheduler.interval_minutes == 0 {
            return Err(AppError::Config(
                "Scheduler interval_minutes must be greater than 0".to_string(),
            ));
        }

        // SMHI refreshes latest-hour data hourly
        if self.scheduler.interval_minutes < 10 {
            tracing::warn!(
                "Scheduler interval of {} minutes is very short, consider using at least 10 minutes",
                self.scheduler.interval_minutes
            );
        }

        match url::Url::parse(&self.source.base_url) {
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Invalid source base_url '{}': {}",
                    self.source.base_url, e
                )));
            }
            Ok(parsed) if parsed.scheme() != "https" => {
                return Err(AppError::Config(format!(
                    "Source base_url must use HTTPS, got: {}",
                    parsed.scheme()
                )));
            }
            Ok(_) => {}
        }

        if self.source.max_concurrent_stations == 0 || self.source.max_concurrent_stations > 64 {
            return Err(AppError::Config(format!(
                "Source max_concurrent_stations must be between 1 and 64, got {}",
                self.source.max_concurrent_stations
            )));
        }

        if self.source.max_retries > MAX_RETRIES {
            return Err(AppError::Config(format!(
                "Source max_retries must be at most {}, got {}",
                MAX_RETRIES, self.source.max_retries
            )));
        }

        if self.index.bulk_chunk_size == 0 {
            return Err(AppError::Config(
                "Index bulk_chunk_size must be at least 1".to_string(),
            ));
        }

        if self.query.max_page_size == 0 {
            return Err(AppError::Config(
                "Query max_page_size must be at least 1".to_string(),
            ));
        }

        for pattern in &self.stations.patterns {
            if let Err(e) = glob::Pattern::new(pattern) {
                return Err(AppError::Config(format!(
                    "Invalid station pattern '{}': {}",
                    pattern, e
                )));
            }
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid env var pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file in the project root (copy .env.example)\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(key: &str, name: &str) -> StationInfo {
        StationInfo {
            key: key.to_string(),
            name: name.to_string(),
            owner: "SMHI".to_string(),
            longitude: 18.0,
            latitude: 59.0,
        }
    }

    #[test]
    fn test_station_filter_by_key_and_pattern() {
        let filter = StationFilter {
            keys: vec!["98210".to_string()],
            patterns: vec!["Göteborg*".to_string()],
        };

        assert!(filter.matches(&station("98210", "Stockholm-Observatoriekullen A")));
        assert!(filter.matches(&station("71420", "Göteborg A")));
        assert!(!filter.matches(&station("159880", "Arvidsjaur A")));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = StationFilter::default();
        assert!(filter.is_empty());
        assert!(filter.matches(&station("1", "Anywhere")));
    }

    #[test]
    fn test_source_defaults() {
        let yaml = r#"
base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.period, Period::LatestMonths);
        assert_eq!(source.mode, IngestMode::Stations);
        assert_eq!(source.max_concurrent_stations, 4);
        assert_eq!(source.max_retries, 3);
    }

    #[test]
    fn test_source_period_and_mode() {
        let yaml = r#"
base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
period: latest-day
mode: snapshot
"#;
        let source: SourceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(source.period, Period::LatestDay);
        assert_eq!(source.mode, IngestMode::Snapshot);
    }

    #[test]
    fn test_port_deserialize_from_number() {
        let yaml = r#"
host: localhost
port: 5432
name: test
user: test
password: test
"#;
        let config: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 5432);
    }

    #[test]
    fn test_port_deserialize_from_string() {
        let yaml = r#"
host: localhost
port: "5432"
name: test
user: test
password: test
"#;
        let config: DatabaseConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 5432);
    }

    #[test]
    fn test_port_deserialize_invalid_string() {
        let yaml = r#"
host: localhost
port: "not_a_number"
name: test
user: test
password: test
"#;
        let result: std::result::Result<DatabaseConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("Invalid port number") || err_msg.contains("not_a_number"));
    }

    #[test]
    fn test_expand_env_vars_reports_missing() {
        let err = expand_env_vars("password: ${SMHI_INGEST_SURELY_UNSET_VAR}").unwrap_err();
        assert!(err.to_string().contains("SMHI_INGEST_SURELY_UNSET_VAR"));
    }
}
