//! Downstream sinks for aggregated measurements

use log::{error, info, warn};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::database::store_measurement;
use crate::models::{Measurement, Quantity};
use crate::utils::format_datetime;

/// Receiver of smoothed readings.
///
/// Each call stands alone; the result only says whether the sink accepted the
/// value, not whether it reached its final destination.
pub trait Publisher {
    fn send_temperature(&mut self, value: f32) -> bool;
    fn send_humidity(&mut self, value: f32) -> bool;
}

// about five minutes of measurements
const MEASUREMENT_QUEUE_CAPACITY: usize = 60;

/// Writes measurements to the log only.
pub struct LogPublisher {
    device: String,
}

impl LogPublisher {
    pub fn new(device: String) -> Self {
        LogPublisher { device }
    }
}

impl Publisher for LogPublisher {
    fn send_temperature(&mut self, value: f32) -> bool {
        info!("{}: temperature {:.1} C", self.device, value);
        true
    }

    fn send_humidity(&mut self, value: f32) -> bool {
        info!("{}: humidity {:.1} %", self.device, value);
        true
    }
}

/// Hands measurements to an async writer task that stores them in Postgres.
///
/// Sending never blocks the acquisition thread. While the writer is stuck
/// retrying, at most `MEASUREMENT_QUEUE_CAPACITY` measurements wait for it and
/// newer ones are rejected.
pub struct DatabasePublisher {
    sender: mpsc::Sender<Measurement>,
    device: String,
}

impl DatabasePublisher {
    pub fn new(sender: mpsc::Sender<Measurement>, device: String) -> Self {
        DatabasePublisher { sender, device }
    }

    /// Start the writer task. It finishes once the publisher is dropped and
    /// every queued measurement was handled.
    pub fn spawn(database_url: String, device: String) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MEASUREMENT_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_measurements(receiver, database_url));
        (Self::new(sender, device), writer)
    }

    fn send(&self, quantity: Quantity, value: f32) -> bool {
        let measurement = Measurement {
            quantity,
            value,
            time: OffsetDateTime::now_utc(),
            device: self.device.clone(),
        };
        match self.sender.try_send(measurement) {
            Ok(()) => true,
            Err(TrySendError::Full(measurement)) => {
                warn!(
                    "Measurement queue full, dropping {} {}",
                    measurement.quantity.as_str(),
                    measurement.value
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                error!("Database writer has stopped");
                false
            }
        }
    }
}

impl Publisher for DatabasePublisher {
    fn send_temperature(&mut self, value: f32) -> bool {
        self.send(Quantity::Temperature, value)
    }

    fn send_humidity(&mut self, value: f32) -> bool {
        self.send(Quantity::Humidity, value)
    }
}

async fn write_measurements(
    mut receiver: mpsc::Receiver<Measurement>,
    database_url: String,
) {
    while let Some(measurement) = receiver.recv().await {
        match store_measurement(&measurement, &database_url).await {
            Ok(()) => info!(
                "Stored {} {:?} for {} at {}",
                measurement.quantity.as_str(),
                measurement.stored_value(),
                measurement.device,
                format_datetime(&measurement.time)
            ),
            Err(e) => error!(
                "Failed to store {} for {}: {}",
                measurement.quantity.as_str(),
                measurement.device,
                e
            ),
        }
    }
}
