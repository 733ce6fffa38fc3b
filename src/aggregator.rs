//! Batching of raw readings into periodic smoothed measurements

use log::{debug, info, warn};

use crate::publisher::Publisher;
use crate::utils::rounded_average;

/// Samples per emitted measurement. At least 3, since the highest and lowest
/// are discarded.
pub const SAMPLES_PER_MEASUREMENT: usize = 5;
const _: () = assert!(SAMPLES_PER_MEASUREMENT >= 3);

#[derive(Debug, Clone, Copy)]
pub struct Aggregate {
    pub temperature: f32,
    pub humidity: f32,
}

pub struct SampleAggregator<P: Publisher> {
    publisher: P,
    temperature: [f32; SAMPLES_PER_MEASUREMENT],
    humidity: [f32; SAMPLES_PER_MEASUREMENT],
    sample_count: usize,
    overall_nan_count: u64,
}

impl<P: Publisher> SampleAggregator<P> {
    pub fn new(publisher: P) -> Self {
        SampleAggregator {
            publisher,
            temperature: [f32::NAN; SAMPLES_PER_MEASUREMENT],
            humidity: [f32::NAN; SAMPLES_PER_MEASUREMENT],
            sample_count: 0,
            overall_nan_count: 0,
        }
    }

    /// Drop any partially filled batch.
    pub fn begin(&mut self) {
        self.sample_count = 0;
    }

    /// Add one raw pair; every `SAMPLES_PER_MEASUREMENT` samples the smoothed
    /// values are published and returned.
    pub fn process_sample(&mut self, temperature: f32, humidity: f32) -> Option<Aggregate> {
        self.temperature[self.sample_count] = temperature;
        self.humidity[self.sample_count] = humidity;
        self.sample_count += 1;
        let nans = u64::from(temperature.is_nan()) + u64::from(humidity.is_nan());
        if nans > 0 {
            self.overall_nan_count += nans;
            debug!("NaN count: {}", self.overall_nan_count);
        }

        if self.sample_count < SAMPLES_PER_MEASUREMENT {
            return None;
        }
        self.sample_count = 0;

        debug!("Temperatures: {:?}", self.temperature);
        let aggregate = Aggregate {
            temperature: rounded_average(&self.temperature),
            humidity: rounded_average(&self.humidity),
        };
        if !self.publisher.send_temperature(aggregate.temperature) {
            warn!("Publisher rejected temperature {}", aggregate.temperature);
        }
        debug!("Humidities: {:?}", self.humidity);
        if !self.publisher.send_humidity(aggregate.humidity) {
            warn!("Publisher rejected humidity {}", aggregate.humidity);
        }
        info!(
            "Measurement: temperature {:.1} C, humidity {:.1} %",
            aggregate.temperature, aggregate.humidity
        );
        Some(aggregate)
    }

    /// NaN samples seen over the aggregator's lifetime.
    pub fn overall_nan_count(&self) -> u64 {
        self.overall_nan_count
    }

    #[cfg(test)]
    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}
