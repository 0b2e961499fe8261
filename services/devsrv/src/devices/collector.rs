//! Periodic temperature collection
//!
//! Only `Ok` channels are published as readings. Fault states are skipped and
//! reported once per transition on `sensor.channel_state`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sensor::{read_temperatures, ReadingStatus, TemperatureReading};
use crate::collaborators::events::{EventPublisher, SENSOR_CHANNEL_STATE, SENSOR_TEMPERATURE};
use crate::collaborators::inventory::{SensorId, SensorTarget};
use crate::error::Result;
use crate::protocols::modbus::SessionFactory;
use crate::retry::{retry, PollPolicy};

/// Counters for one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    pub sensors_read: usize,
    pub sensors_failed: usize,
    pub readings_published: usize,
    pub readings_skipped: usize,
}

pub struct TemperatureCollector {
    factory: Arc<dyn SessionFactory>,
    sensors: Vec<SensorTarget>,
    publisher: Arc<dyn EventPublisher>,
    interval: Duration,
    connect_policy: PollPolicy,
    /// Last seen status per (sensor, channel); unseen channels count as `Ok`
    channel_states: HashMap<(SensorId, u8), ReadingStatus>,
}

impl TemperatureCollector {
    pub fn new(
        factory: Arc<dyn SessionFactory>,
        sensors: Vec<SensorTarget>,
        publisher: Arc<dyn EventPublisher>,
        interval: Duration,
        connect_policy: PollPolicy,
    ) -> Self {
        Self {
            factory,
            sensors,
            publisher,
            interval,
            connect_policy,
            channel_states: HashMap::new(),
        }
    }

    /// Collect until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Temperature collector started: {} sensors every {:?}",
            self.sensors.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Temperature collector stopped");
                    break;
                },
                _ = ticker.tick() => {
                    let summary = self.collect_once().await;
                    debug!("Collection pass: {:?}", summary);
                },
            }
        }
    }

    /// Read every sensor once
    pub async fn collect_once(&mut self) -> CollectionSummary {
        let mut summary = CollectionSummary::default();

        for sensor in &self.sensors {
            let readings =
                match read_sensor(self.factory.as_ref(), sensor, self.connect_policy).await {
                    Ok(readings) => readings,
                    Err(e) => {
                        warn!("Sensor {} ({}) unavailable: {}", sensor.id, sensor.name, e);
                        summary.sensors_failed += 1;
                        continue;
                    },
                };
            summary.sensors_read += 1;

            for reading in &readings {
                let key = (sensor.id, reading.channel);
                let previous = self
                    .channel_states
                    .insert(key, reading.status)
                    .unwrap_or(ReadingStatus::Ok);
                if previous != reading.status {
                    info!(
                        "Sensor {} channel {}: {:?} -> {:?}",
                        sensor.id, reading.channel, previous, reading.status
                    );
                    self.publisher.publish(
                        SENSOR_CHANNEL_STATE,
                        json!({
                            "sensor_id": sensor.id,
                            "channel": reading.channel,
                            "previous": previous,
                            "status": reading.status,
                            "raw_value": reading.raw_value,
                        }),
                    );
                }
            }

            let valid: Vec<&TemperatureReading> = readings.iter().filter(|r| r.is_ok()).collect();
            summary.readings_skipped += readings.len() - valid.len();
            if valid.is_empty() {
                continue;
            }
            summary.readings_published += valid.len();

            let channels: Vec<_> = valid
                .iter()
                .map(|r| json!({"channel": r.channel, "value": r.value}))
                .collect();
            self.publisher.publish(
                SENSOR_TEMPERATURE,
                json!({
                    "sensor_id": sensor.id,
                    "name": sensor.name,
                    "readings": channels,
                    "timestamp": Utc::now(),
                }),
            );
        }

        summary
    }
}

async fn read_sensor(
    factory: &dyn SessionFactory,
    sensor: &SensorTarget,
    policy: PollPolicy,
) -> Result<Vec<TemperatureReading>> {
    let what = format!("connect to sensor {}", sensor.id);
    let mut client = retry(policy, &what, || factory.open(&sensor.endpoint)).await?;
    read_temperatures(client.as_mut()).await
}
