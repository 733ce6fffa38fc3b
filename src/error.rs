use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("could not initialise GPIO: {0}")]
    GpioInit(String),

    #[error("GPIO is not initialised")]
    GpioDown,

    #[error("GPIO operation on pin {pin} failed: {source}")]
    Gpio {
        pin: u8,
        #[source]
        source: gpiocdev::Error,
    },

    #[error("could not start edge watcher for pin {pin}: {source}")]
    Watcher {
        pin: u8,
        #[source]
        source: io::Error,
    },

    #[error("invalid value '{value}' for configuration key {key}")]
    Config { key: String, value: String },
}

impl DhtError {
    pub fn gpio(pin: u8, source: gpiocdev::Error) -> Self {
        DhtError::Gpio { pin, source }
    }
}
