//! Sensor value store
//!
//! Latest known value per `(device, sensor)`, read by the condition evaluator
//! for every sensor other than the one that triggered the pass. Sensor ids are
//! local to a device: `temperature` on `gh-1` and on `gh-2` are unrelated.
//!
//! Implementations:
//! - `SqliteSensorStore`: `sensor_latest` table, written by the ingestion path
//! - `MemorySensorStore`: in-memory backend for tests and embedding

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{Row, SqlitePool};

use crate::error::{Result, RuleError};
use crate::types::Reading;

/// Read access to the most recent value of a sensor
#[async_trait]
pub trait SensorValueStore: Send + Sync + 'static {
    /// Latest value, or `None` if the sensor never reported on that device
    async fn latest_value(&self, device_id: &str, sensor_id: &str) -> Result<Option<f64>>;
}

/// SQLite-backed sensor store
#[derive(Clone)]
pub struct SqliteSensorStore {
    pool: SqlitePool,
}

impl SqliteSensorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Upsert the latest value of a sensor
    ///
    /// A reading older than the stored one leaves the stored value untouched.
    pub async fn record_reading(&self, reading: &Reading) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_latest (device_id, sensor_id, value, recorded_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(device_id, sensor_id) DO UPDATE SET
                value = excluded.value,
                recorded_at = excluded.recorded_at
            WHERE excluded.recorded_at >= sensor_latest.recorded_at
            "#,
        )
        .bind(&reading.device_id)
        .bind(&reading.sensor_id)
        .bind(reading.value)
        .bind(reading.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Latest value together with its timestamp
    pub async fn latest(
        &self,
        device_id: &str,
        sensor_id: &str,
    ) -> Result<Option<(f64, DateTime<Utc>)>> {
        let row = sqlx::query(
            "SELECT value, recorded_at FROM sensor_latest WHERE device_id = ? AND sensor_id = ?",
        )
        .bind(device_id)
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let value: f64 = row.try_get("value")?;
                let at: i64 = row.try_get("recorded_at")?;
                let at = DateTime::<Utc>::from_timestamp_millis(at).ok_or_else(|| {
                    RuleError::SensorStoreError(format!(
                        "bad timestamp for '{}/{}'",
                        device_id, sensor_id
                    ))
                })?;
                Ok(Some((value, at)))
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SensorValueStore for SqliteSensorStore {
    async fn latest_value(&self, device_id: &str, sensor_id: &str) -> Result<Option<f64>> {
        Ok(self
            .latest(device_id, sensor_id)
            .await?
            .map(|(value, _)| value))
    }
}

/// In-memory sensor store
#[derive(Default)]
pub struct MemorySensorStore {
    values: DashMap<(String, String), f64>,
}

impl MemorySensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, device_id: impl Into<String>, sensor_id: impl Into<String>, value: f64) {
        self.values.insert((device_id.into(), sensor_id.into()), value);
    }

    pub fn remove(&self, device_id: &str, sensor_id: &str) {
        self.values
            .remove(&(device_id.to_string(), sensor_id.to_string()));
    }
}

#[async_trait]
impl SensorValueStore for MemorySensorStore {
    async fn latest_value(&self, device_id: &str, sensor_id: &str) -> Result<Option<f64>> {
        Ok(self
            .values
            .get(&(device_id.to_string(), sensor_id.to_string()))
            .map(|v| *v))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::schema::init_schema;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn test_sqlite_store_keeps_newest_value() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        let store = SqliteSensorStore::new(pool);

        assert_eq!(store.latest_value("gh-1", "temperature").await.unwrap(), None);

        let now = Utc::now();
        store
            .record_reading(&Reading::new("gh-1", "temperature", 21.5, now))
            .await
            .unwrap();
        store
            .record_reading(&Reading::new(
                "gh-1",
                "temperature",
                99.0,
                now - Duration::seconds(30),
            ))
            .await
            .unwrap();
        assert_eq!(store.latest_value("gh-1", "temperature").await.unwrap(), Some(21.5));

        store
            .record_reading(&Reading::new(
                "gh-1",
                "temperature",
                22.0,
                now + Duration::seconds(30),
            ))
            .await
            .unwrap();
        assert_eq!(store.latest_value("gh-1", "temperature").await.unwrap(), Some(22.0));
    }

    #[tokio::test]
    async fn test_sqlite_store_keys_on_device() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        let store = SqliteSensorStore::new(pool);
        let now = Utc::now();

        store
            .record_reading(&Reading::new("gh-2", "humidity", 40.0, now))
            .await
            .unwrap();
        store
            .record_reading(&Reading::new(
                "gh-1",
                "humidity",
                75.0,
                now - Duration::seconds(30),
            ))
            .await
            .unwrap();

        // Older reading on gh-1 is not held back by gh-2's newer one
        assert_eq!(store.latest_value("gh-1", "humidity").await.unwrap(), Some(75.0));
        assert_eq!(store.latest_value("gh-2", "humidity").await.unwrap(), Some(40.0));
        assert_eq!(store.latest_value("gh-3", "humidity").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySensorStore::new();
        store.set("gh-1", "humidity", 55.0);
        assert_eq!(
            store.latest_value("gh-1", "humidity").await.unwrap(),
            Some(55.0)
        );
        assert_eq!(store.latest_value("gh-2", "humidity").await.unwrap(), None);
        store.remove("gh-1", "humidity");
        assert_eq!(store.latest_value("gh-1", "humidity").await.unwrap(), None);
    }
}
