//! Acquisition scheduling, start handshake and failure recovery for the DHT22
//!
//! The sensor refuses to answer more often than every two seconds, so reads
//! inside that window are served from the previous result. Repeated failed
//! conversions power-cycle the sensor.

use log::{debug, error, info, warn};

use crate::error::DhtError;
use crate::models::{EdgeLevel, Reading, SensorState};
use crate::sensor::decoder::{EdgeDecoder, EDGES};
use crate::sensor::gpio::{edge_channel, EdgeFeed, EdgeQueue, GpioDriver, Pull};
use crate::shutdown::KeepGoing;

// the sensor can't be read more often than every 2 seconds
pub const MIN_INTERVAL_MICROS: u32 = 2_000_000;
// transmission takes at most 7.5 ms, plus 2.5 ms margin
const READ_TIMEOUT_MILLIS: u32 = 10;
// 40 bits take at least 40 * 75 us
const MINIMUM_READ_TIME_MICROS: u32 = 3_000;
const WAIT_INTERVAL_MICROS: u32 = 500;
// upper bound for a read if the driver never reports a terminal edge
const READ_LIMIT_MICROS: u32 = 100_000;
// sensor needs at least 50 ms without power to reset
const SHUTDOWN_TIME_MICROS: u32 = 50_000;
const PULL_UP_MICROS: u32 = 1_000;
// at least 1 ms low is a start request
const START_PULSE_MICROS: u32 = 1_100;
const MAX_SCHEDULE_SLICE_MICROS: u32 = 100_000;
const RECALIBRATION_THRESHOLD_MICROS: i32 = 10_000;
const EDGE_QUEUE_CAPACITY: usize = 2 * EDGES;

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pins {
    pub data: u8,
    pub power: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Pins { data: 17, power: 4 }
    }
}

/// Counters kept across reads for troubleshooting.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub last_state: Option<SensorState>,
    pub consecutive_failures: u32,
    pub total_failures: u32,
    pub resets: u32,
    pub overruns: u32,
    pub anomalies: u32,
    pub dropped_edges: u32,
}

pub struct AcquisitionScheduler<G: GpioDriver> {
    gpio: G,
    pins: Pins,
    max_consecutive_failures: u32,
    decoder: EdgeDecoder,
    initialised: bool,
    startup_time: u32,
    last_read_time: u32,
    next_scheduled_read: u32,
    reading: Reading,
    diagnostics: Diagnostics,
}

impl<G: GpioDriver> AcquisitionScheduler<G> {
    pub fn new(gpio: G, pins: Pins, max_consecutive_failures: u32) -> Self {
        AcquisitionScheduler {
            gpio,
            pins,
            max_consecutive_failures,
            decoder: EdgeDecoder::new(),
            initialised: false,
            startup_time: 0,
            last_read_time: 0,
            next_scheduled_read: 0,
            reading: Reading::NONE,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Bring up the GPIO subsystem and power the sensor.
    ///
    /// Fails only if the GPIO layer cannot be initialised, even after one
    /// terminate-and-retry.
    pub fn begin(&mut self) -> Result<(), DhtError> {
        if let Err(e) = self.gpio.initialise() {
            warn!("Could not initialise GPIO ({}). Terminating and retrying", e);
            self.gpio.terminate();
            self.gpio.initialise()?;
        }
        self.gpio.set_output(self.pins.power, true)?;

        self.startup_time = self.gpio.tick();
        self.last_read_time = self.startup_time.wrapping_sub(MIN_INTERVAL_MICROS);
        self.next_scheduled_read = self.startup_time.wrapping_add(MIN_INTERVAL_MICROS);
        self.diagnostics.consecutive_failures = 0;
        self.initialised = true;
        info!(
            "{}: sensor powered on (data pin {}, power pin {})",
            self.startup_time, self.pins.data, self.pins.power
        );
        Ok(())
    }

    /// Power the sensor off and release the GPIO subsystem.
    pub fn shutdown(&mut self) {
        if !self.initialised {
            return;
        }
        info!("{}: shutting down sensor", self.gpio.tick());
        // an unpowered sensor must not be fed through the data line pull-up
        if let Err(e) = self.gpio.set_input(self.pins.data, Pull::Off) {
            warn!("Failed to release data line: {}", e);
        }
        if let Err(e) = self.gpio.write(self.pins.power, false) {
            warn!("Failed to power off sensor: {}", e);
        }
        self.gpio.terminate();
        self.initialised = false;
    }

    /// Power-cycle the sensor.
    pub fn reset(&mut self) {
        self.shutdown();
        self.gpio.delay(SHUTDOWN_TIME_MICROS);
        if let Err(e) = self.begin() {
            error!("Failed to restart sensor after reset: {}", e);
            return;
        }
        // a freshly powered sensor can't be read right away; serve the cache
        self.last_read_time = self.startup_time;
        self.diagnostics.resets += 1;
    }

    /// Block until the next scheduled read is due.
    ///
    /// Returns false if the GPIO layer is down or `keep_going` was cleared.
    pub fn wait_for_next_measurement(&mut self, keep_going: &KeepGoing) -> bool {
        if !self.initialised {
            return false;
        }
        let started = self.gpio.tick();
        let mut wait = self.micros_until_next_read();
        while wait > 0 && keep_going.is_set() {
            self.gpio.delay((wait as u32).min(MAX_SCHEDULE_SLICE_MICROS));
            wait = self.micros_until_next_read();
        }
        if !keep_going.is_set() {
            return false;
        }
        debug!(
            "Waited {} us for next measurement",
            self.gpio.tick().wrapping_sub(started)
        );
        if wait < -RECALIBRATION_THRESHOLD_MICROS {
            // running behind, e.g. after a long stall elsewhere; don't catch up
            self.next_scheduled_read = self.gpio.tick();
            info!(
                "Recalibrating. Next scheduled read was {} us ago, new is {}",
                wait.unsigned_abs(),
                self.next_scheduled_read
            );
        }
        true
    }

    fn micros_until_next_read(&self) -> i32 {
        self.next_scheduled_read.wrapping_sub(self.gpio.tick()) as i32
    }

    pub fn read_humidity(&mut self, keep_going: &KeepGoing) -> f32 {
        let reading = self.read(keep_going);
        if reading.ok {
            reading.humidity
        } else {
            f32::NAN
        }
    }

    pub fn read_temperature(&mut self, keep_going: &KeepGoing) -> f32 {
        let reading = self.read(keep_going);
        if reading.ok {
            reading.temperature
        } else {
            f32::NAN
        }
    }

    /// Latest reading; hardware is only touched when the cached one expired.
    pub fn read(&mut self, keep_going: &KeepGoing) -> Reading {
        if !self.initialised {
            warn!("Sensor read requested while GPIO is down");
            return Reading::NONE;
        }

        let now = self.gpio.tick();
        let since_last = now.wrapping_sub(self.last_read_time) as i32;
        let until_next = now.wrapping_sub(self.next_scheduled_read) as i32;
        if since_last < MIN_INTERVAL_MICROS as i32 && until_next < 0 {
            debug!(
                "Using cache: now={} last={} next={} ok={}",
                now, self.last_read_time, self.next_scheduled_read, self.reading.ok
            );
            return self.reading;
        }

        self.last_read_time = now;
        self.next_scheduled_read = self.next_scheduled_read.wrapping_add(MIN_INTERVAL_MICROS);
        debug!(
            "Reading (last={}, next={})",
            self.last_read_time, self.next_scheduled_read
        );

        match self.acquire(keep_going) {
            Ok(true) => {
                self.reading = Reading {
                    humidity: self.decoder.humidity(),
                    temperature: self.decoder.temperature(),
                    ok: self.decoder.is_done(),
                };
                self.record_session();
                self.report_result(self.reading.ok);
            }
            Ok(false) => {
                info!("Sensor read cancelled");
                self.reading = Reading::NONE;
                self.record_session();
            }
            Err(e) => {
                warn!("GPIO failure during sensor read: {}", e);
                self.reading = Reading::NONE;
                self.record_session();
                self.report_result(false);
            }
        }
        self.reading
    }

    /// Run one handshake and decode session. Returns false when cancelled.
    fn acquire(&mut self, keep_going: &KeepGoing) -> Result<bool, DhtError> {
        let (feed, queue) = edge_channel(EDGE_QUEUE_CAPACITY);
        let outcome = self
            .start_session(feed)
            .map(|()| self.wait_for_session(&queue, keep_going));

        let data = self.pins.data;
        let watchdog = self.gpio.set_watchdog(data, 0);
        let callback = self.gpio.set_edge_callback(data, None);
        // anything still queued arrived after the session ended
        queue.drain_into(&mut self.decoder);
        let dropped = queue.dropped();
        if dropped > 0 {
            warn!("{} edges dropped by the callback handoff", dropped);
            self.diagnostics.dropped_edges += dropped;
        }

        let completed = outcome?;
        watchdog.and(callback)?;
        Ok(completed)
    }

    /// Send the start pulse and hand the line to the sensor.
    ///
    /// The callback is armed while the line is still held low, since the
    /// sensor answers within 40 us of the release. Drivers only report edges
    /// the sensor drives, so the release itself is recorded here as the
    /// first handshake edge.
    fn start_session(&mut self, feed: EdgeFeed) -> Result<(), DhtError> {
        let data = self.pins.data;
        self.gpio.set_input(data, Pull::Up)?;
        self.gpio.delay(PULL_UP_MICROS);
        self.gpio.set_output(data, false)?;
        self.decoder.init_read(self.gpio.tick());
        self.gpio.set_edge_callback(data, Some(feed.into_callback()))?;
        self.gpio.set_watchdog(data, READ_TIMEOUT_MILLIS)?;
        self.gpio.delay(START_PULSE_MICROS);

        let released = self.gpio.tick();
        self.gpio.set_input(data, Pull::Up)?;
        self.decoder.add_edge(EdgeLevel::Low, released);
        Ok(())
    }

    fn wait_for_session(&mut self, queue: &EdgeQueue, keep_going: &KeepGoing) -> bool {
        let started = self.gpio.tick();
        self.gpio.delay(MINIMUM_READ_TIME_MICROS);
        let completed = loop {
            queue.drain_into(&mut self.decoder);
            if self.decoder.is_terminal() {
                break true;
            }
            if !keep_going.is_set() {
                break false;
            }
            let now = self.gpio.tick();
            if now.wrapping_sub(started) >= READ_LIMIT_MICROS {
                warn!("No response from driver after {} us; forcing timeout", READ_LIMIT_MICROS);
                self.decoder.add_edge(EdgeLevel::Timeout, now);
                break true;
            }
            self.gpio.delay(WAIT_INTERVAL_MICROS);
        };
        debug!(
            "Waited {} us for data, {} edges decoded",
            self.gpio.tick().wrapping_sub(started),
            self.decoder.edge_index()
        );
        completed
    }

    fn record_session(&mut self) {
        self.diagnostics.last_state = Some(self.decoder.state());
        self.diagnostics.overruns += self.decoder.overruns();
        self.diagnostics.anomalies += self.decoder.anomalies();
    }

    fn report_result(&mut self, success: bool) {
        if success {
            self.diagnostics.consecutive_failures = 0;
            return;
        }
        self.diagnostics.consecutive_failures += 1;
        self.diagnostics.total_failures += 1;
        warn!(
            "Failed to get sensor value ({:?}, {} consecutive failures)",
            self.decoder.state(),
            self.diagnostics.consecutive_failures
        );
        if self.diagnostics.consecutive_failures > self.max_consecutive_failures {
            info!("Too many consecutive failures. Resetting sensor");
            self.reset();
        }
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    #[cfg(test)]
    pub fn gpio(&self) -> &G {
        &self.gpio
    }

    #[cfg(test)]
    pub fn gpio_mut(&mut self) -> &mut G {
        &mut self.gpio
    }

    #[cfg(test)]
    pub fn next_scheduled_read(&self) -> u32 {
        self.next_scheduled_read
    }
}

impl<G: GpioDriver> Drop for AcquisitionScheduler<G> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
