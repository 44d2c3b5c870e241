use crate::config::{Config, IngestMode, SourceConfig, StationFilter};
use crate::db::models::{IndexReport, StationFailure};
use crate::db::ReadingStore;
use crate::error::Result;
use crate::fetcher::{Fetcher, Parameter, Period, StationInfo, StationSeries};
use crate::indexer::{Indexer, StationOutcome};
use crate::join::Joiner;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

pub struct Scheduler {
    config: Config,
    store: Arc<dyn ReadingStore>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn ReadingStore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            store,
            shutdown_rx,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        let initial_delay = Duration::from_secs(self.config.scheduler.initial_delay_seconds);
        let poll_interval = Duration::from_secs(self.config.scheduler.interval_minutes * 60);

        info!(
            "Scheduler starting with {}s initial delay, {}m interval",
            self.config.scheduler.initial_delay_seconds, self.config.scheduler.interval_minutes
        );

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {},
            _ = self.shutdown_rx.changed() => {
                info!("Shutdown received during initial delay");
                return Ok(());
            }
        }

        // Run immediately, then on interval
        if let Err(e) = self.run_ingestion().await {
            error!("Ingestion error: {}", e);
        }

        let mut ticker = interval(poll_interval);
        ticker.tick().await; // First tick is immediate, skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_ingestion().await {
                        error!("Ingestion error: {}", e);
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, stopping scheduler");
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn run_ingestion(&self) -> Result<IndexReport> {
        info!("Starting ingestion run ({:?} mode)", self.config.source.mode);

        let source = &self.config.source;
        let fetcher = Fetcher::new(&source.base_url)?
            .with_retry(source.max_retries, Duration::from_secs(1));
        let indexer =
            Indexer::new(self.store.clone()).with_chunk_size(self.config.index.bulk_chunk_size);

        let report = match source.mode {
            IngestMode::Stations => {
                ingest_stations(&fetcher, &indexer, source, &self.config.stations).await?
            }
            IngestMode::Snapshot => {
                ingest_snapshot(&fetcher, &indexer, &self.config.stations).await?
            }
        };

        for failure in &report.failures {
            warn!("Station {} skipped: {}", failure.station_key, failure.error);
        }
        info!(
            "Ingestion run completed: {} readings indexed, {} stations failed",
            report.indexed_count,
            report.failures.len()
        );

        Ok(report)
    }
}

/// Fetch the three parameter series for one station and join them.
async fn fetch_and_join(
    fetcher: &Fetcher,
    station: &StationInfo,
    period: Period,
) -> StationOutcome {
    let fetched = tokio::try_join!(
        fetcher.fetch_station_series(Parameter::Temperature, &station.key, period),
        fetcher.fetch_station_series(Parameter::WindSpeed, &station.key, period),
        fetcher.fetch_station_series(Parameter::WindDirection, &station.key, period),
    );

    let (temperature, wind_speed, wind_direction) = fetched.map_err(|e| StationFailure {
        station_key: station.key.clone(),
        error: e.to_string(),
    })?;

    let (readings, stats) =
        Joiner::join_station(station, &temperature, &wind_speed, &wind_direction);
    debug!(
        "Joined station {}: {} readings ({} wind speed gaps, {} wind direction gaps)",
        station.key, stats.readings, stats.wind_speed_gaps, stats.wind_direction_gaps
    );

    Ok(readings)
}

/// Per-station ingestion: list stations, then fetch and join each station's
/// series with bounded concurrency, then index the batch.
///
/// Only a failed station listing fails the run. Individual station failures
/// end up in the report.
pub async fn ingest_stations(
    fetcher: &Fetcher,
    indexer: &Indexer,
    source: &SourceConfig,
    filter: &StationFilter,
) -> Result<IndexReport> {
    let stations: Vec<StationInfo> = fetcher
        .list_stations()
        .await?
        .into_iter()
        .filter(|s| filter.matches(s))
        .collect();

    info!(
        "Fetching {} series for {} stations ({} concurrent)",
        source.period,
        stations.len(),
        source.max_concurrent_stations
    );

    let period = source.period;
    let delay = Duration::from_millis(source.request_delay_ms);

    let outcomes: Vec<StationOutcome> = stream::iter(stations.iter())
        .map(|station| async move {
            let outcome = fetch_and_join(fetcher, station, period).await;
            // Rate limiting: pace requests per worker slot
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        })
        .buffer_unordered(source.max_concurrent_stations.max(1))
        .collect()
        .await;

    indexer.index(outcomes).await
}

/// Snapshot ingestion: latest value for every station from the three
/// station-set endpoints. Any endpoint failing fails the run.
pub async fn ingest_snapshot(
    fetcher: &Fetcher,
    indexer: &Indexer,
    filter: &StationFilter,
) -> Result<IndexReport> {
    let (temperature, wind_speed, wind_direction) = tokio::try_join!(
        fetcher.fetch_latest_all(Parameter::Temperature),
        fetcher.fetch_latest_all(Parameter::WindSpeed),
        fetcher.fetch_latest_all(Parameter::WindDirection),
    )?;

    let temperature: Vec<StationSeries> = temperature
        .into_iter()
        .filter(|s| filter.matches(&s.station))
        .collect();

    let (readings, stats) = Joiner::join_snapshot(&temperature, &wind_speed, &wind_direction);
    info!(
        "Joined snapshot of {} stations into {} readings ({} wind speed gaps, {} wind direction gaps)",
        temperature.len(),
        stats.readings,
        stats.wind_speed_gaps,
        stats.wind_direction_gaps
    );

    indexer.index_readings(readings).await
}
