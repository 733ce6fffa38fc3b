//! Scripted in-memory GPIO driver for exercising the scheduler without hardware.
//!
//! Time is virtual: it only moves when the code under test calls `delay` or a
//! test calls `advance`. Releasing the data line after a start pulse consumes
//! one scripted response: the line transitions the sensor drives from then on.
//! Like a kernel driver, the fake reports those transitions (never the host's
//! own release) through the registered callback as the clock passes them, and
//! loses any that come due while no callback is registered.

use std::collections::VecDeque;

use crate::error::DhtError;
use crate::models::EdgeLevel;
use crate::sensor::decoder::BYTES;
use crate::sensor::gpio::{EdgeCallback, GpioDriver, Pull};
use crate::shutdown::KeepGoing;

// sensor timings in us, within the DHT22 datasheet ranges
const RESPONSE_DELAY: u32 = 30;
const ACK_LOW: u32 = 80;
const ACK_HIGH: u32 = 80;
const BIT_LOW: u32 = 50;
const ZERO_HIGH: u32 = 27;
const ONE_HIGH: u32 = 70;
const END_LOW: u32 = 50;
const CHATTER_LOW: u32 = 10;
const CHATTER_HIGH: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioOp {
    Initialise,
    Terminate,
    Input(u8, Pull),
    Output(u8, bool),
    Write(u8, bool),
    Callback(u8, bool),
    Watchdog(u8, u32),
}

#[derive(Debug, Clone, Copy)]
pub enum Response {
    /// A complete transmission of `bytes`.
    Frame([u8; BYTES]),
    /// The falling edge acknowledging the start request goes unseen.
    MissingAck([u8; BYTES]),
    /// The driver also reports the rise caused by the host releasing the line.
    ReleaseEcho([u8; BYTES]),
    /// The rising edge that starts data bit `n` goes unseen.
    MissingRise([u8; BYTES], usize),
    /// `n` noise transitions in quick succession, short lows and longer highs.
    Chatter(usize),
    Silent,
    /// Never answers and never reports a watchdog timeout.
    Hung,
}

/// Transitions (`true` for rising) the sensor drives to send `bytes`, as
/// offsets from the moment the host releases the line.
pub fn transmission(bytes: [u8; BYTES]) -> Vec<(bool, u32)> {
    let mut offset = RESPONSE_DELAY;
    let mut transitions = vec![(false, offset)];
    offset += ACK_LOW;
    transitions.push((true, offset));
    offset += ACK_HIGH;
    transitions.push((false, offset));
    for byte in bytes {
        for bit in (0..8).rev() {
            offset += BIT_LOW;
            transitions.push((true, offset));
            offset += if byte & (1 << bit) != 0 {
                ONE_HIGH
            } else {
                ZERO_HIGH
            };
            transitions.push((false, offset));
        }
    }
    // the sensor lets the line go after a final low
    offset += END_LOW;
    transitions.push((true, offset));
    transitions
}

fn chatter(count: usize) -> Vec<(bool, u32)> {
    let mut offset = CHATTER_LOW;
    let mut transitions = Vec::with_capacity(count);
    for i in 0..count {
        let rising = i % 2 == 1;
        transitions.push((rising, offset));
        offset += if rising { CHATTER_HIGH } else { CHATTER_LOW };
    }
    transitions
}

impl Response {
    fn transitions(self) -> Vec<(bool, u32)> {
        match self {
            Response::Frame(bytes) => transmission(bytes),
            Response::MissingAck(bytes) => {
                let mut transitions = transmission(bytes);
                transitions.remove(0);
                transitions
            }
            Response::ReleaseEcho(bytes) => {
                let mut transitions = transmission(bytes);
                transitions.insert(0, (true, 2));
                transitions
            }
            Response::MissingRise(bytes, bit) => {
                let mut transitions = transmission(bytes);
                transitions.remove(3 + 2 * bit);
                transitions
            }
            Response::Chatter(count) => chatter(count),
            Response::Silent | Response::Hung => Vec::new(),
        }
    }
}

pub struct FakeGpio {
    now: u32,
    ops: Vec<GpioOp>,
    callback: Option<EdgeCallback>,
    held_low: Option<u8>,
    pending: VecDeque<(EdgeLevel, u32)>,
    // (last activity, timeout in ms)
    watchdog: Option<(u32, u32)>,
    watchdog_works: bool,
    responses: VecDeque<Response>,
    failing_initialisations: u32,
    stop_at: Option<(u32, KeepGoing)>,
    longest_delay: u32,
}

impl FakeGpio {
    pub fn new(start: u32) -> Self {
        FakeGpio {
            now: start,
            ops: Vec::new(),
            callback: None,
            held_low: None,
            pending: VecDeque::new(),
            watchdog: None,
            watchdog_works: true,
            responses: VecDeque::new(),
            failing_initialisations: 0,
            stop_at: None,
            longest_delay: 0,
        }
    }

    pub fn respond(&mut self, response: Response) {
        self.responses.push_back(response);
    }

    pub fn respond_with(&mut self, bytes: [u8; BYTES]) {
        self.respond(Response::Frame(bytes));
    }

    pub fn fail_initialisations(&mut self, count: u32) {
        self.failing_initialisations = count;
    }

    /// Clear `keep_going` once the virtual clock reaches `tick`.
    pub fn stop_at(&mut self, tick: u32, keep_going: KeepGoing) {
        self.stop_at = Some((tick, keep_going));
    }

    pub fn advance(&mut self, micros: u32) {
        self.now = self.now.wrapping_add(micros);
    }

    pub fn ops(&self) -> &[GpioOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Number of start pulses (data line driven low) issued on `pin`.
    pub fn start_pulses(&self, pin: u8) -> usize {
        self.ops
            .iter()
            .filter(|op| **op == GpioOp::Output(pin, false))
            .count()
    }

    pub fn longest_delay(&self) -> u32 {
        self.longest_delay
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    fn is_due(&self, tick: u32) -> bool {
        self.now.wrapping_sub(tick) as i32 >= 0
    }

    /// The host let go of a line it held low: the sensor starts talking.
    fn release(&mut self) {
        let response = self.responses.pop_front().unwrap_or(Response::Silent);
        self.watchdog_works = !matches!(response, Response::Hung);
        let released = self.now;
        self.pending = response
            .transitions()
            .into_iter()
            .map(|(rising, offset)| {
                (
                    EdgeLevel::from_line(rising),
                    released.wrapping_add(offset),
                )
            })
            .collect();
    }

    fn deliver(&mut self) {
        while let Some(&(level, tick)) = self.pending.front() {
            if !self.is_due(tick) {
                // not yet on the wire
                break;
            }
            self.pending.pop_front();
            if let Some(callback) = self.callback.as_mut() {
                callback(level, tick);
                if let Some((_, millis)) = self.watchdog {
                    self.watchdog = Some((tick, millis));
                }
            }
        }
        if let Some((last, millis)) = self.watchdog {
            if self.watchdog_works && self.now.wrapping_sub(last) >= millis * 1000 {
                if let Some(callback) = self.callback.as_mut() {
                    callback(EdgeLevel::Timeout, self.now);
                }
                self.watchdog = Some((self.now, millis));
            }
        }
    }
}

impl GpioDriver for FakeGpio {
    fn initialise(&mut self) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Initialise);
        if self.failing_initialisations > 0 {
            self.failing_initialisations -= 1;
            return Err(DhtError::GpioInit("simulated failure".to_string()));
        }
        Ok(())
    }

    fn terminate(&mut self) {
        self.ops.push(GpioOp::Terminate);
    }

    fn set_input(&mut self, pin: u8, pull: Pull) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Input(pin, pull));
        if self.held_low == Some(pin) {
            self.held_low = None;
            self.release();
        }
        Ok(())
    }

    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Output(pin, high));
        if !high {
            self.held_low = Some(pin);
        } else if self.held_low == Some(pin) {
            self.held_low = None;
        }
        Ok(())
    }

    fn write(&mut self, pin: u8, high: bool) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Write(pin, high));
        Ok(())
    }

    fn tick(&self) -> u32 {
        self.now
    }

    fn set_edge_callback(
        &mut self,
        pin: u8,
        callback: Option<EdgeCallback>,
    ) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Callback(pin, callback.is_some()));
        self.callback = callback;
        Ok(())
    }

    fn set_watchdog(&mut self, pin: u8, timeout_millis: u32) -> Result<(), DhtError> {
        self.ops.push(GpioOp::Watchdog(pin, timeout_millis));
        self.watchdog = (timeout_millis > 0).then_some((self.now, timeout_millis));
        Ok(())
    }

    fn delay(&mut self, micros: u32) {
        self.longest_delay = self.longest_delay.max(micros);
        self.advance(micros);
        self.deliver();
        if let Some((tick, keep_going)) = &self.stop_at {
            if self.is_due(*tick) {
                keep_going.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_has_one_transition_per_edge_of_the_line() {
        let transitions = transmission([0x02, 0x8C, 0x01, 0x5F, 0xEE]);

        // acknowledgement (3), 40 bits (80), final release (1)
        assert_eq!(transitions.len(), 84);
        assert_eq!(transitions[0], (false, RESPONSE_DELAY));
        assert!(transitions
            .windows(2)
            .all(|pair| pair[0].0 != pair[1].0 && pair[0].1 < pair[1].1));
        assert_eq!(transitions.last(), Some(&(true, 4051)));
    }

    #[test]
    fn edges_due_without_a_callback_are_lost() {
        let mut gpio = FakeGpio::new(0);
        gpio.respond_with([0; BYTES]);
        gpio.set_output(17, false).unwrap();
        gpio.set_input(17, Pull::Up).unwrap();
        gpio.delay(10_000);

        assert!(gpio.pending.is_empty());
    }
}
