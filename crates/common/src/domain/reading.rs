use crate::domain::result::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Longest source identifier the `sensor_data.uid` column accepts.
pub const MAX_SOURCE_ID_LEN: usize = 64;

/// Payload keys of every numeric measurement, in column order.
pub const MEASUREMENT_KEYS: [&str; 14] = [
    "co",
    "no",
    "no2",
    "o3",
    "so2",
    "pm25",
    "pm10",
    "tvoc",
    "rh",
    "temp",
    "noise",
    "windSpeed",
    "windDir",
    "wind_speed_kmh",
];

/// Payload key of the free-text wind descriptor.
pub const WIND_TEXT_KEY: &str = "wind_txt";

/// Numeric measurements reported by a station.
///
/// Every field is independently optional: `None` means the station did not
/// report it, which is different from reporting zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub co: Option<f64>,
    pub no: Option<f64>,
    pub no2: Option<f64>,
    pub o3: Option<f64>,
    pub so2: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
    pub tvoc: Option<f64>,
    pub rh: Option<f64>,
    pub temp: Option<f64>,
    pub noise: Option<f64>,
    #[serde(rename = "windSpeed")]
    pub wind_speed: Option<f64>,
    #[serde(rename = "windDir")]
    pub wind_dir: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
}

impl Measurements {
    /// Mutable slot for the measurement stored under payload key `key`.
    ///
    /// Returns `None` for keys that are not one of [`MEASUREMENT_KEYS`].
    pub fn slot_mut(&mut self, key: &str) -> Option<&mut Option<f64>> {
        let slot = match key {
            "co" => &mut self.co,
            "no" => &mut self.no,
            "no2" => &mut self.no2,
            "o3" => &mut self.o3,
            "so2" => &mut self.so2,
            "pm25" => &mut self.pm25,
            "pm10" => &mut self.pm10,
            "tvoc" => &mut self.tvoc,
            "rh" => &mut self.rh,
            "temp" => &mut self.temp,
            "noise" => &mut self.noise,
            "windSpeed" => &mut self.wind_speed,
            "windDir" => &mut self.wind_dir,
            "wind_speed_kmh" => &mut self.wind_speed_kmh,
            _ => return None,
        };
        Some(slot)
    }

    /// Number of measurements that were actually reported.
    pub fn reported_count(&self) -> usize {
        [
            self.co,
            self.no,
            self.no2,
            self.o3,
            self.so2,
            self.pm25,
            self.pm10,
            self.tvoc,
            self.rh,
            self.temp,
            self.noise,
            self.wind_speed,
            self.wind_dir,
            self.wind_speed_kmh,
        ]
        .iter()
        .filter(|v| v.is_some())
        .count()
    }
}

/// One normalized sensor observation.
///
/// Readings are immutable once built. A correction is stored as a new reading,
/// never as an edit of an existing one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    source_id: String,
    observed_at: DateTime<Utc>,
    measurements: Measurements,
    wind_txt: Option<String>,
    raw_payload: Map<String, Value>,
}

impl SensorReading {
    /// Build a reading, rejecting an empty or oversized source identifier.
    pub fn new(
        source_id: String,
        observed_at: DateTime<Utc>,
        measurements: Measurements,
        wind_txt: Option<String>,
        raw_payload: Map<String, Value>,
    ) -> DomainResult<Self> {
        if source_id.trim().is_empty() {
            return Err(DomainError::InvalidSourceId(
                "source ID cannot be empty".to_string(),
            ));
        }
        if source_id.chars().count() > MAX_SOURCE_ID_LEN {
            return Err(DomainError::InvalidSourceId(format!(
                "source ID '{}' exceeds {} characters",
                source_id, MAX_SOURCE_ID_LEN
            )));
        }

        Ok(Self {
            source_id,
            observed_at,
            measurements,
            wind_txt,
            raw_payload,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn measurements(&self) -> &Measurements {
        &self.measurements
    }

    pub fn wind_txt(&self) -> Option<&str> {
        self.wind_txt.as_deref()
    }

    /// The decoded payload object this reading was built from, including any
    /// keys filled in during normalization.
    pub fn raw_payload(&self) -> &Map<String, Value> {
        &self.raw_payload
    }
}
