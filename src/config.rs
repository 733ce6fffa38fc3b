use std::collections::HashMap;
use std::env;
use std::str::FromStr;

use log::info;

use crate::error::DhtError;
use crate::sensor::scheduler::DEFAULT_MAX_CONSECUTIVE_FAILURES;
use crate::sensor::Pins;

const DEFAULT_GPIO_CHIP: &str = "/dev/gpiochip0";
const DEFAULT_DEVICE_NAME: &str = "dht22";

/// Key lookup with typed fallback to a default.
pub trait ConfigSource {
    fn entry(&self, key: &str) -> Option<String>;

    /// Parsed value for `key`, or `default` when the key is absent.
    fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, DhtError> {
        match self.entry(key) {
            None => Ok(default),
            Some(value) => value.trim().parse().map_err(|_| DhtError::Config {
                key: key.to_string(),
                value,
            }),
        }
    }
}

/// Process environment, after `.env` has been loaded into it.
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn entry(&self, key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }
}

impl ConfigSource for HashMap<String, String> {
    fn entry(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub pins: Pins,
    pub gpio_chip: String,
    pub max_consecutive_failures: u32,
    pub device_name: String,
    pub database_url: Option<String>,
}

impl SensorConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        match env::var("DHT_CONFIG") {
            Ok(path) => {
                dotenv::from_path(&path)?;
                info!("Loaded configuration from {}", path);
            }
            Err(_) => {
                dotenv::dotenv().ok();
            }
        }

        Ok(Self::from_source(&EnvSource)?)
    }

    pub fn from_source(source: &impl ConfigSource) -> Result<Self, DhtError> {
        let defaults = Pins::default();
        let pins = Pins {
            data: source.get_or("DHT_DATA_PIN", defaults.data)?,
            power: source.get_or("DHT_POWER_PIN", defaults.power)?,
        };
        let config = SensorConfig {
            pins,
            gpio_chip: source.get_or("DHT_GPIO_CHIP", DEFAULT_GPIO_CHIP.to_string())?,
            max_consecutive_failures: source.get_or(
                "DHT_MAX_CONSECUTIVE_FAILURES",
                DEFAULT_MAX_CONSECUTIVE_FAILURES,
            )?,
            device_name: source.get_or("DEVICE_NAME", DEFAULT_DEVICE_NAME.to_string())?,
            database_url: source.entry("DATABASE_URL"),
        };

        info!(
            "Device '{}': data pin {}, power pin {} on {}",
            config.device_name, config.pins.data, config.pins.power, config.gpio_chip
        );
        if config.database_url.is_none() {
            info!("DATABASE_URL not set, measurements will only be logged");
        }
        Ok(config)
    }
}
