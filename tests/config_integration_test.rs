use smhi_ingest::config::{Config, IngestMode};
use smhi_ingest::error::AppError;
use smhi_ingest::fetcher::Period;
use std::io::Write;
use tempfile::NamedTempFile;

const DATABASE: &str = r#"
database:
  host: localhost
  port: "5432"
  name: smhi
  user: smhi
  password: secret
scheduler:
  interval_minutes: 60
"#;

fn write_config(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(DATABASE.as_bytes()).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn expect_config_error(body: &str, needle: &str) {
    let file = write_config(body);
    match Config::load(file.path()) {
        Err(AppError::Config(msg)) => assert!(msg.contains(needle), "unexpected message: {}", msg),
        other => panic!("Expected Config error, got: {:?}", other),
    }
}

/// Optional sections fall back to their defaults
#[test]
fn test_load_minimal_config() {
    let file = write_config(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
"#,
    );

    let config = Config::load(file.path()).expect("Config should load");

    assert_eq!(config.database.port, 5432);
    assert_eq!(config.scheduler.initial_delay_seconds, 10);
    assert_eq!(config.source.period, Period::LatestMonths);
    assert_eq!(config.source.mode, IngestMode::Stations);
    assert_eq!(config.index.bulk_chunk_size, 1000);
    assert_eq!(config.query.max_page_size, 10_000);
    assert!(config.stations.is_empty());
}

#[test]
fn test_load_full_source_section() {
    let file = write_config(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
  period: latest-hour
  mode: snapshot
  max_concurrent_stations: 8
  request_delay_ms: 0
  max_retries: 1
index:
  bulk_chunk_size: 250
query:
  max_page_size: 500
stations:
  keys: ["98210"]
  patterns: ["Kiruna*"]
"#,
    );

    let config = Config::load(file.path()).expect("Config should load");

    assert_eq!(config.source.period, Period::LatestHour);
    assert_eq!(config.source.mode, IngestMode::Snapshot);
    assert_eq!(config.source.max_concurrent_stations, 8);
    assert_eq!(config.index.bulk_chunk_size, 250);
    assert_eq!(config.query.max_page_size, 500);
    assert_eq!(config.stations.keys, vec!["98210".to_string()]);
}

#[test]
fn test_rejects_plain_http_source() {
    expect_config_error(
        r#"
source:
  base_url: http://opendata-download-metobs.smhi.se/api/version/1.0
"#,
        "HTTPS",
    );
}

#[test]
fn test_rejects_zero_concurrency() {
    expect_config_error(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
  max_concurrent_stations: 0
"#,
        "max_concurrent_stations",
    );
}

#[test]
fn test_rejects_unbounded_retries() {
    expect_config_error(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
  max_retries: 40
"#,
        "max_retries",
    );
}

#[test]
fn test_rejects_zero_page_size() {
    expect_config_error(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
query:
  max_page_size: 0
"#,
        "max_page_size",
    );
}

#[test]
fn test_rejects_malformed_station_pattern() {
    expect_config_error(
        r#"
source:
  base_url: https://opendata-download-metobs.smhi.se/api/version/1.0
stations:
  patterns: ["Kiruna[A"]
"#,
        "Invalid station pattern",
    );
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(dir.path().join("missing.yaml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}
