use crate::error::{AppError, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_OWNER: &str = "SMHI";

/// SMHI metobs parameter ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    Temperature,
    WindDirection,
    WindSpeed,
}

impl Parameter {
    pub fn id(&self) -> u32 {
        match self {
            Parameter::Temperature => 1,
            Parameter::WindDirection => 3,
            Parameter::WindSpeed => 4,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parameter::Temperature => "temperature",
            Parameter::WindDirection => "wind direction",
            Parameter::WindSpeed => "wind speed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Period {
    #[serde(rename = "latest-hour")]
    LatestHour,
    #[serde(rename = "latest-day")]
    LatestDay,
    #[serde(rename = "latest-months")]
    LatestMonths,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::LatestHour => "latest-hour",
            Period::LatestDay => "latest-day",
            Period::LatestMonths => "latest-months",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationInfo {
    pub key: String,
    pub name: String,
    pub owner: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// One `(timestamp, value)` sample; `value` is `None` when the source sent
/// nothing usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeriesPoint {
    pub timestamp: i64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationSeries {
    pub station: StationInfo,
    pub points: Vec<SeriesPoint>,
}

// Wire shapes. Only the fields the pipeline depends on are declared.

#[derive(Debug, Deserialize)]
struct StationSetResponse {
    #[serde(default)]
    station: Vec<WireStation>,
}

#[derive(Debug, Deserialize)]
struct WireStation {
    #[serde(deserialize_with = "deserialize_key")]
    key: String,
    name: String,
    #[serde(default)]
    owner: Option<String>,
    longitude: f64,
    latitude: f64,
    #[serde(default)]
    value: Option<Vec<WireValue>>,
}

#[derive(Debug, Deserialize)]
struct StationDataResponse {
    #[serde(default)]
    value: Option<Vec<WireValue>>,
}

#[derive(Debug, Deserialize)]
struct WireValue {
    date: i64,
    #[serde(default, deserialize_with = "deserialize_measurement")]
    value: Option<f64>,
}

/// Station keys arrive as strings from SMHI, but accept plain numbers too.
fn deserialize_key<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum KeyValue {
        Number(i64),
        String(String),
    }

    match KeyValue::deserialize(deserializer)? {
        KeyValue::Number(n) => Ok(n.to_string()),
        KeyValue::String(s) => Ok(s),
    }
}

/// Measurement values come as `"1.2"` or `1.2`. Anything unparseable is
/// treated as not reported.
fn deserialize_measurement<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Measurement {
        Number(f64),
        String(String),
    }

    Ok(match Option::<Measurement>::deserialize(deserializer)? {
        Some(Measurement::Number(n)) => Some(n),
        Some(Measurement::String(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    }
    .filter(|v| v.is_finite()))
}

fn to_points(values: Option<Vec<WireValue>>) -> Vec<SeriesPoint> {
    let mut points: Vec<SeriesPoint> = values
        .unwrap_or_default()
        .into_iter()
        .map(|v| SeriesPoint {
            timestamp: v.date,
            value: v.value,
        })
        .collect();
    points.sort_by_key(|p| p.timestamp);
    points
}

impl WireStation {
    fn into_series(self) -> StationSeries {
        let points = to_points(self.value);
        StationSeries {
            station: StationInfo {
                key: self.key,
                name: self.name,
                owner: self.owner.unwrap_or_else(|| DEFAULT_OWNER.to_string()),
                longitude: self.longitude,
                latitude: self.latitude,
            },
            points,
        }
    }
}

pub struct Fetcher {
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl Fetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent("smhi-ingest/0.1.0")
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
        })
    }

    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    pub fn station_series_url(
        &self,
        parameter: Parameter,
        station_key: &str,
        period: Period,
    ) -> String {
        format!(
            "{}/parameter/{}/station/{}/period/{}/data.json",
            self.base_url,
            parameter.id(),
            station_key,
            period
        )
    }

    pub fn station_set_url(&self, parameter: Parameter) -> String {
        format!(
            "{}/parameter/{}/station-set/all/period/latest-hour/data.json",
            self.base_url,
            parameter.id()
        )
    }

    /// List every station currently reporting temperature.
    ///
    /// Any failure here is fatal for an ingestion run.
    pub async fn list_stations(&self) -> Result<Vec<StationInfo>> {
        let url = self.station_set_url(Parameter::Temperature);
        debug!("Fetching station list from {}", url);

        let response: StationSetResponse = self
            .get_json(&url)
            .await
            .and_then(|body| {
                body.ok_or_else(|| AppError::InvalidData("station list not found (404)".to_string()))
            })
            .map_err(|e| AppError::SourceUnavailable(e.to_string()))?;

        let stations: Vec<StationInfo> = response
            .station
            .into_iter()
            .map(|s| s.into_series().station)
            .collect();

        info!("Found {} reporting stations", stations.len());
        Ok(stations)
    }

    /// Fetch one parameter series for one station.
    ///
    /// A 404 means the station does not report this parameter, which yields
    /// an empty series rather than an error.
    pub async fn fetch_station_series(
        &self,
        parameter: Parameter,
        station_key: &str,
        period: Period,
    ) -> Result<Vec<SeriesPoint>> {
        let url = self.station_series_url(parameter, station_key, period);
        debug!("Fetching {} for station {} from {}", parameter, station_key, url);

        let response: Option<StationDataResponse> = self
            .get_json(&url)
            .await
            .map_err(|e| AppError::station_fetch(station_key, format!("{}: {}", parameter, e)))?;

        match response {
            Some(data) => Ok(to_points(data.value)),
            None => {
                debug!("Station {} does not report {}", station_key, parameter);
                Ok(Vec::new())
            }
        }
    }

    /// Latest value of one parameter for all stations.
    ///
    /// The temperature set doubles as the station list, so a missing one is
    /// `SourceUnavailable`. A missing wind set is an empty result.
    pub async fn fetch_latest_all(&self, parameter: Parameter) -> Result<Vec<StationSeries>> {
        let url = self.station_set_url(parameter);
        debug!("Fetching latest {} for all stations from {}", parameter, url);

        let response: StationSetResponse = match self
            .get_json(&url)
            .await
            .map_err(|e| AppError::SourceUnavailable(format!("{}: {}", parameter, e)))?
        {
            Some(response) => response,
            None if parameter == Parameter::Temperature => {
                return Err(AppError::SourceUnavailable(format!(
                    "{} station set not found (404)",
                    parameter
                )));
            }
            None => {
                debug!("No {} station set published", parameter);
                StationSetResponse {
                    station: Vec::new(),
                }
            }
        };

        Ok(response
            .station
            .into_iter()
            .map(WireStation::into_series)
            .collect())
    }

    /// GET and decode JSON, `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>> {
        retry_with_backoff(self.max_retries, self.retry_base_delay, || async {
            let response = self.client.get(url).send().await?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            let body = response.error_for_status()?.json::<T>().await?;
            Ok(Some(body))
        })
        .await
    }
}

/// Upper bound on a single backoff sleep.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped at `MAX_RETRY_DELAY`.
fn backoff_delay(base_delay: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Retry a future with exponential backoff
async fn retry_with_backoff<F, Fut, T>(max_retries: u32, base_delay: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                retries += 1;

                if retries > max_retries {
                    return Err(e);
                }

                // Check if error is transient (retryable)
                let should_retry = match &e {
                    AppError::Http(reqwest_err) => {
                        // Retry on connection errors, timeouts, server errors (5xx)
                        reqwest_err.is_timeout()
                            || reqwest_err.is_connect()
                            || reqwest_err
                                .status()
                                .map(|s| s.is_server_error())
                                .unwrap_or(false)
                    }
                    AppError::Io(_) => true,
                    _ => false,
                };

                if !should_retry {
                    return Err(e);
                }

                let delay = backoff_delay(base_delay, retries);
                warn!(
                    "Request failed (attempt {}/{}): {}. Retrying in {:?}...",
                    retries, max_retries, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
