pub mod cdev;
pub mod decoder;
#[cfg(test)]
pub mod fake;
pub mod gpio;
pub mod scheduler;

pub use cdev::CdevGpio;
pub use gpio::GpioDriver;
pub use scheduler::{AcquisitionScheduler, Pins};
