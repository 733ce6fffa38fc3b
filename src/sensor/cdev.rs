//! Linux GPIO character device driver (`/dev/gpiochipN`) built on `gpiocdev`
//!
//! Each pin is held by one line request for as long as the chip is open and
//! is switched between input and output by reconfiguring that request. While
//! an edge callback is registered, the line has edge detection enabled whenever
//! it is an input, and a watcher thread forwards kernel-timestamped edges to
//! the callback. The watchdog is the watcher's wait timeout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpiocdev::line::{Bias, EdgeDetection, EdgeKind, Value};
use gpiocdev::request::Request;
use gpiocdev::Chip;
use log::{debug, warn};

use crate::error::DhtError;
use crate::models::EdgeLevel;
use crate::sensor::gpio::{EdgeCallback, GpioDriver, Pull};

const CONSUMER: &str = "dht22";

// how often an idle watcher checks whether it should stop
const IDLE_WAIT_MILLIS: u32 = 10;

/// Microseconds on CLOCK_MONOTONIC, the clock edge events are stamped with.
fn monotonic_micros() -> u32 {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on Linux
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    (now.tv_sec as u64 * 1_000_000 + now.tv_nsec as u64 / 1_000) as u32
}

fn bias(pull: Pull) -> Bias {
    match pull {
        Pull::Off => Bias::Disabled,
        Pull::Up => Bias::PullUp,
    }
}

fn value(high: bool) -> Value {
    if high {
        Value::Active
    } else {
        Value::Inactive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Input(Pull),
    Output,
}

/// Level to report for a kernel edge event, or `None` if the event is the
/// host's own release of the line.
fn forward(kind: EdgeKind, awaiting_release: &AtomicBool) -> Option<EdgeLevel> {
    let rising = kind == EdgeKind::Rising;
    // a released line can only rise first if that rise is the release itself
    if awaiting_release.swap(false, Ordering::AcqRel) && rising {
        return None;
    }
    Some(EdgeLevel::from_line(rising))
}

struct Line {
    request: Arc<Request>,
    mode: Mode,
}

struct EdgeWatcher {
    pin: u8,
    stop: Arc<AtomicBool>,
    watchdog_millis: Arc<AtomicU32>,
    awaiting_release: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl EdgeWatcher {
    fn spawn(pin: u8, request: Arc<Request>, mut callback: EdgeCallback) -> Result<Self, DhtError> {
        let stop = Arc::new(AtomicBool::new(false));
        let watchdog_millis = Arc::new(AtomicU32::new(0));
        let awaiting_release = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            let watchdog_millis = watchdog_millis.clone();
            let awaiting_release = awaiting_release.clone();
            thread::Builder::new()
                .name(format!("gpio{pin}-edges"))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        let watchdog = watchdog_millis.load(Ordering::Acquire);
                        let timeout = if watchdog > 0 { watchdog } else { IDLE_WAIT_MILLIS };
                        let event = request
                            .wait_edge_event(Duration::from_millis(u64::from(timeout)))
                            .and_then(|ready| ready.then(|| request.read_edge_event()).transpose());
                        match event {
                            Ok(Some(event)) => {
                                if let Some(level) = forward(event.kind, &awaiting_release) {
                                    callback(level, (event.timestamp_ns / 1_000) as u32);
                                }
                            }
                            Ok(None) if watchdog > 0 => {
                                callback(EdgeLevel::Timeout, monotonic_micros())
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("Edge watcher for pin {} stopped: {}", pin, e);
                                break;
                            }
                        }
                    }
                })
                .map_err(|source| DhtError::Watcher { pin, source })?
        };
        Ok(EdgeWatcher {
            pin,
            stop,
            watchdog_millis,
            awaiting_release,
            thread,
        })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.thread.join().is_err() {
            warn!("Edge watcher for pin {} panicked", self.pin);
        }
    }
}

pub struct CdevGpio {
    chip_path: PathBuf,
    chip: Option<Chip>,
    lines: HashMap<u8, Line>,
    watcher: Option<EdgeWatcher>,
}

impl CdevGpio {
    pub fn new(chip_path: impl Into<PathBuf>) -> Self {
        CdevGpio {
            chip_path: chip_path.into(),
            chip: None,
            lines: HashMap::new(),
            watcher: None,
        }
    }

    fn is_watched(&self, pin: u8) -> bool {
        self.watcher.as_ref().map_or(false, |watcher| watcher.pin == pin)
    }

    fn mode(&self, pin: u8) -> Option<Mode> {
        self.lines.get(&pin).map(|line| line.mode)
    }

    /// Put `pin` into input or output mode, requesting the line on first use
    /// and reconfiguring the held request afterwards.
    fn apply(&mut self, pin: u8, mode: Mode, high: bool) -> Result<(), DhtError> {
        if self.chip.is_none() {
            return Err(DhtError::GpioDown);
        }
        let offset = u32::from(pin);
        let edges = match mode {
            Mode::Input(_) if self.is_watched(pin) => Some(EdgeDetection::BothEdges),
            _ => None,
        };

        if let Some(line) = self.lines.get_mut(&pin) {
            let mut config = line.request.config();
            config.with_line(offset);
            match mode {
                Mode::Input(pull) => config.as_input().with_bias(bias(pull)),
                Mode::Output => config.as_output(value(high)),
            };
            config.with_edge_detection(edges);
            line.request
                .reconfigure(&config)
                .map_err(|e| DhtError::gpio(pin, e))?;
            line.mode = mode;
            return Ok(());
        }

        let mut builder = Request::builder();
        builder
            .on_chip(self.chip_path.clone())
            .with_consumer(CONSUMER)
            .with_line(offset);
        match mode {
            Mode::Input(pull) => builder.as_input().with_bias(bias(pull)),
            Mode::Output => builder.as_output(value(high)),
        };
        builder.with_edge_detection(edges);
        let request = builder.request().map_err(|e| DhtError::gpio(pin, e))?;
        self.lines.insert(
            pin,
            Line {
                request: Arc::new(request),
                mode,
            },
        );
        Ok(())
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop();
        }
    }
}

impl GpioDriver for CdevGpio {
    fn initialise(&mut self) -> Result<(), DhtError> {
        let chip = Chip::from_path(&self.chip_path)
            .map_err(|e| DhtError::GpioInit(format!("{}: {}", self.chip_path.display(), e)))?;
        debug!("Opened GPIO chip {}", self.chip_path.display());
        self.chip = Some(chip);
        Ok(())
    }

    fn terminate(&mut self) {
        self.stop_watcher();
        self.lines.clear();
        self.chip = None;
    }

    fn set_input(&mut self, pin: u8, pull: Pull) -> Result<(), DhtError> {
        if self.mode(pin) == Some(Mode::Output) {
            if let Some(watcher) = self.watcher.as_ref().filter(|w| w.pin == pin) {
                watcher.awaiting_release.store(true, Ordering::Release);
            }
        }
        self.apply(pin, Mode::Input(pull), false)
    }

    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), DhtError> {
        self.apply(pin, Mode::Output, high)
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), DhtError> {
        if self.mode(pin) != Some(Mode::Output) {
            return self.set_output(pin, high);
        }
        match self.lines.get(&pin) {
            Some(line) => line
                .request
                .set_value(u32::from(pin), value(high))
                .map_err(|e| DhtError::gpio(pin, e)),
            None => Err(DhtError::GpioDown),
        }
    }

    fn tick(&self) -> u32 {
        monotonic_micros()
    }

    fn set_edge_callback(
        &mut self,
        pin: u8,
        callback: Option<EdgeCallback>,
    ) -> Result<(), DhtError> {
        self.stop_watcher();
        let Some(callback) = callback else {
            // drop edge detection from an input line
            return match self.mode(pin) {
                Some(Mode::Input(pull)) => self.apply(pin, Mode::Input(pull), false),
                _ => Ok(()),
            };
        };

        if self.mode(pin).is_none() {
            self.apply(pin, Mode::Input(Pull::Up), false)?;
        }
        let request = match self.lines.get(&pin) {
            Some(line) => line.request.clone(),
            None => return Err(DhtError::GpioDown),
        };
        self.watcher = Some(EdgeWatcher::spawn(pin, request, callback)?);
        // an output line starts reporting once it is released
        match self.mode(pin) {
            Some(Mode::Input(pull)) => self.apply(pin, Mode::Input(pull), false),
            _ => Ok(()),
        }
    }

    fn set_watchdog(&mut self, pin: u8, timeout_millis: u32) -> Result<(), DhtError> {
        match &self.watcher {
            Some(watcher) if watcher.pin == pin => {
                watcher
                    .watchdog_millis
                    .store(timeout_millis, Ordering::Release);
            }
            _ => debug!("No edge watcher on pin {}; watchdog ignored", pin),
        }
        Ok(())
    }

    fn delay(&mut self, micros: u32) {
        thread::sleep(Duration::from_micros(u64::from(micros)));
    }
}

impl Drop for CdevGpio {
    fn drop(&mut self) {
        self.terminate();
    }
}
