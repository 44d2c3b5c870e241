use crate::db::models::{GeoPoint, StationReading};
use crate::fetcher::{SeriesPoint, StationInfo, StationSeries};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinStats {
    pub anchor_points: usize,
    pub readings: usize,
    pub wind_speed_gaps: usize,
    pub wind_direction_gaps: usize,
}

impl JoinStats {
    pub fn merge(&mut self, other: &JoinStats) {
        self.anchor_points += other.anchor_points;
        self.readings += other.readings;
        self.wind_speed_gaps += other.wind_speed_gaps;
        self.wind_direction_gaps += other.wind_direction_gaps;
    }
}

/// Joins the temperature, wind speed and wind direction series into readings.
///
/// Temperature is the backbone: every temperature timestamp yields exactly one
/// reading, and the wind values are matched on exact timestamp equality. A
/// wind timestamp that is missing leaves that field null.
pub struct Joiner;

fn lookup(series: &[SeriesPoint]) -> HashMap<i64, Option<f64>> {
    series.iter().map(|p| (p.timestamp, p.value)).collect()
}

impl Joiner {
    pub fn join_station(
        station: &StationInfo,
        temperature: &[SeriesPoint],
        wind_speed: &[SeriesPoint],
        wind_direction: &[SeriesPoint],
    ) -> (Vec<StationReading>, JoinStats) {
        let speed_by_ts = lookup(wind_speed);
        let direction_by_ts = lookup(wind_direction);

        let mut stats = JoinStats {
            anchor_points: temperature.len(),
            ..JoinStats::default()
        };

        // One record per identity key; a repeated anchor timestamp keeps the last value
        let mut position: HashMap<i64, usize> = HashMap::with_capacity(temperature.len());
        let mut readings: Vec<StationReading> = Vec::with_capacity(temperature.len());

        for point in temperature {
            let wind_speed = match speed_by_ts.get(&point.timestamp) {
                Some(v) => *v,
                None => {
                    stats.wind_speed_gaps += 1;
                    None
                }
            };
            let wind_direction = match direction_by_ts.get(&point.timestamp) {
                Some(v) => *v,
                None => {
                    stats.wind_direction_gaps += 1;
                    None
                }
            };

            let reading = StationReading {
                station_key: station.key.clone(),
                station_name: station.name.clone(),
                owner: station.owner.clone(),
                location: GeoPoint {
                    longitude: station.longitude,
                    latitude: station.latitude,
                },
                timestamp: point.timestamp,
                temperature: point.value,
                wind_speed,
                wind_direction,
            };

            match position.get(&point.timestamp) {
                Some(&idx) => readings[idx] = reading,
                None => {
                    position.insert(point.timestamp, readings.len());
                    readings.push(reading);
                }
            }
        }

        stats.readings = readings.len();
        (readings, stats)
    }

    /// Joins the all-station latest-value sets, matching wind series to the
    /// temperature station set by station key first.
    pub fn join_snapshot(
        temperature: &[StationSeries],
        wind_speed: &[StationSeries],
        wind_direction: &[StationSeries],
    ) -> (Vec<StationReading>, JoinStats) {
        let by_key = |sets: &[StationSeries]| -> HashMap<String, Vec<SeriesPoint>> {
            sets.iter()
                .map(|s| (s.station.key.clone(), s.points.clone()))
                .collect()
        };
        let speed_by_station = by_key(wind_speed);
        let direction_by_station = by_key(wind_direction);

        let mut readings = Vec::with_capacity(temperature.len());
        let mut stats = JoinStats::default();

        for series in temperature {
            let key = &series.station.key;
            let (station_readings, station_stats) = Self::join_station(
                &series.station,
                &series.points,
                speed_by_station.get(key).map(Vec::as_slice).unwrap_or(&[]),
                direction_by_station.get(key).map(Vec::as_slice).unwrap_or(&[]),
            );
            readings.extend(station_readings);
            stats.merge(&station_stats);
        }

        (readings, stats)
    }
}
