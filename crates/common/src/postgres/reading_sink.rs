use crate::domain::{DomainError, DomainResult, ReadingSink, SensorReading, StoreReadingsInput};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS sensor_data (
    id BIGSERIAL PRIMARY KEY,
    uid VARCHAR(64) NOT NULL,
    ts TIMESTAMPTZ NOT NULL,
    co DOUBLE PRECISION,
    no DOUBLE PRECISION,
    no2 DOUBLE PRECISION,
    o3 DOUBLE PRECISION,
    so2 DOUBLE PRECISION,
    pm25 DOUBLE PRECISION,
    pm10 DOUBLE PRECISION,
    tvoc DOUBLE PRECISION,
    rh DOUBLE PRECISION,
    temp DOUBLE PRECISION,
    noise DOUBLE PRECISION,
    wind_speed DOUBLE PRECISION,
    wind_dir DOUBLE PRECISION,
    wind_speed_kmh DOUBLE PRECISION,
    wind_txt TEXT,
    raw JSONB NOT NULL,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS ix_sensor_uid_ts ON sensor_data (uid, ts);
";

const INSERT_READING_SQL: &str = "
INSERT INTO sensor_data (
    uid, ts, co, no, no2, o3, so2, pm25, pm10, tvoc, rh, temp, noise,
    wind_speed, wind_dir, wind_speed_kmh, wind_txt, raw
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18
)";

/// Sensor reading row for PostgreSQL storage
#[derive(Debug, Clone)]
pub struct SensorReadingRow {
    pub uid: String,
    pub ts: DateTime<Utc>,
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
    pub wind_speed: Option<f64>,
    pub wind_dir: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
    pub wind_txt: Option<String>,
    pub raw: serde_json::Value,
}

/// Convert domain SensorReading to database SensorReadingRow
impl From<&SensorReading> for SensorReadingRow {
    fn from(reading: &SensorReading) -> Self {
        let m = reading.measurements();

        SensorReadingRow {
            uid: reading.source_id().to_string(),
            ts: reading.observed_at(),
            co: m.co,
            no: m.no,
            no2: m.no2,
            o3: m.o3,
            so2: m.so2,
            pm25: m.pm25,
            pm10: m.pm10,
            tvoc: m.tvoc,
            rh: m.rh,
            temp: m.temp,
            noise: m.noise,
            wind_speed: m.wind_speed,
            wind_dir: m.wind_dir,
            wind_speed_kmh: m.wind_speed_kmh,
            wind_txt: reading.wind_txt().map(str::to_string),
            raw: serde_json::Value::Object(reading.raw_payload().clone()),
        }
    }
}

/// PostgreSQL implementation of ReadingSink
///
/// Each batch is written inside one transaction, so a failure part way
/// through leaves nothing behind.
#[derive(Clone)]
pub struct PostgresReadingSink {
    client: PostgresClient,
}

impl PostgresReadingSink {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }

    /// Create the `sensor_data` table and its index when missing
    pub async fn ensure_schema(&self) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        conn.batch_execute(CREATE_SCHEMA_SQL)
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        info!("sensor_data schema ready");
        Ok(())
    }
}

#[async_trait]
impl ReadingSink for PostgresReadingSink {
    async fn store_batch(&self, input: StoreReadingsInput) -> DomainResult<()> {
        if input.readings.is_empty() {
            debug!("no readings to store, skipping");
            return Ok(());
        }

        let rows: Vec<SensorReadingRow> = input.readings.iter().map(|r| r.into()).collect();

        let mut conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let tx = conn
            .transaction()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        let statement = tx.prepare_cached(INSERT_READING_SQL).await.map_err(|e| {
            error!("failed to prepare sensor_data insert: {}", e);
            DomainError::RepositoryError(e.into())
        })?;

        for row in &rows {
            tx.execute(
                &statement,
                &[
                    &row.uid,
                    &row.ts,
                    &row.co,
                    &row.no,
                    &row.no2,
                    &row.o3,
                    &row.so2,
                    &row.pm25,
                    &row.pm10,
                    &row.tvoc,
                    &row.rh,
                    &row.temp,
                    &row.noise,
                    &row.wind_speed,
                    &row.wind_dir,
                    &row.wind_speed_kmh,
                    &row.wind_txt,
                    &row.raw,
                ],
            )
            .await
            .map_err(|e| {
                error!(uid = %row.uid, "failed to insert sensor reading: {}", e);
                DomainError::RepositoryError(e.into())
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!(rows_inserted = rows.len(), "stored sensor reading batch");
        Ok(())
    }
}
