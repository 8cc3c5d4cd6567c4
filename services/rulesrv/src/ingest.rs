//! Reading ingestion
//!
//! Drops exact duplicates (same device, sensor and timestamp as the last accepted
//! reading), records the latest value, then runs the evaluation pass.
//!
//! The deduplicator tracks at most `max_tracked` sensors. Past that, marks older
//! than the window are evicted; a duplicate arriving after eviction is still
//! held back by the engine's cooldown.

use chrono::{DateTime, Duration, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use greenhouse_rules::{PassReport, Reading, Result, RuleError};
use tracing::{debug, warn};

use crate::app::AppState;

/// Default number of `(device, sensor)` marks kept
pub const DEFAULT_MAX_TRACKED: usize = 10_000;
/// Default age after which a mark may be evicted (seconds)
pub const DEFAULT_DEDUP_WINDOW_SECS: i64 = 600;

/// Last accepted timestamp per `(device, sensor)`
pub struct ReadingDeduplicator {
    last_seen: DashMap<(String, String), DateTime<Utc>>,
    max_tracked: usize,
    window: Duration,
}

impl Default for ReadingDeduplicator {
    fn default() -> Self {
        Self::with_limits(
            DEFAULT_MAX_TRACKED,
            Duration::seconds(DEFAULT_DEDUP_WINDOW_SECS),
        )
    }
}

impl ReadingDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_tracked: usize, window: Duration) -> Self {
        Self {
            last_seen: DashMap::new(),
            max_tracked: max_tracked.max(1),
            window,
        }
    }

    /// Number of tracked `(device, sensor)` marks
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Returns false for an exact duplicate
    pub fn accept(&self, reading: &Reading) -> bool {
        let key = (reading.device_id.clone(), reading.sensor_id.clone());
        let accepted = match self.last_seen.entry(key.clone()) {
            Entry::Occupied(mut seen) => {
                if *seen.get() == reading.timestamp {
                    return false;
                }
                if reading.timestamp > *seen.get() {
                    seen.insert(reading.timestamp);
                }
                true
            },
            Entry::Vacant(slot) => {
                slot.insert(reading.timestamp);
                true
            },
        };

        if self.last_seen.len() > self.max_tracked {
            self.evict(&key, reading.timestamp);
        }
        accepted
    }

    fn evict(&self, keep: &(String, String), now: DateTime<Utc>) {
        let horizon = now - self.window;
        self.last_seen.retain(|_, seen| *seen >= horizon);

        if self.last_seen.len() > self.max_tracked {
            warn!(
                "Dedup marks over limit ({}), keeping only the latest",
                self.max_tracked
            );
            self.last_seen.retain(|k, _| k == keep);
        }
    }

    /// Let a redelivery of `reading` through again (its pass failed)
    pub fn forget(&self, reading: &Reading) {
        let key = (reading.device_id.clone(), reading.sensor_id.clone());
        self.last_seen
            .remove_if(&key, |_, seen| *seen == reading.timestamp);
    }
}

/// Ingest one reading; `None` means it was a duplicate
pub async fn ingest_reading(state: &AppState, reading: Reading) -> Result<Option<PassReport>> {
    if reading.device_id.trim().is_empty() || reading.sensor_id.trim().is_empty() {
        return Err(RuleError::InvalidFormat(
            "device_id and sensor_id are required".to_string(),
        ));
    }
    if !reading.value.is_finite() {
        return Err(RuleError::InvalidFormat(format!(
            "value for {} must be finite",
            reading.sensor_id
        )));
    }

    if !state.dedup.accept(&reading) {
        debug!(
            device_id = %reading.device_id,
            "Duplicate {}@{} dropped",
            reading.sensor_id,
            reading.timestamp
        );
        return Ok(None);
    }

    let result = async {
        state.sensors.record_reading(&reading).await?;
        state.engine.on_reading(&reading).await
    }
    .await;

    match result {
        Ok(report) => Ok(Some(report)),
        Err(e) => {
            state.dedup.forget(&reading);
            Err(e)
        },
    }
}
