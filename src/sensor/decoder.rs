//! Edge-timed bitstream decoding for the DHT22 single-wire protocol
//!
//! A frame opens with 4 handshake edges: the host releasing the line after its
//! start pulse, then the sensor's acknowledgement. 40 data bits follow, each sent as a low reference pulse and a high data pulse. A high
//! pulse longer than the reference low pulse before it encodes a 1. The fifth
//! byte is a checksum over the first four.

use crate::models::{EdgeLevel, SensorState};

/// Total edges in a complete frame, handshake included.
pub const EDGES: usize = 84;
/// Payload bytes: humidity (2), temperature (2), checksum (1).
pub const BYTES: usize = 5;
/// Index of the first edge carrying data.
pub const START_EDGE: usize = 4;

const EDGES_PER_BYTE: usize = 16;
const SIGN_BIT: u16 = 0x8000;

#[derive(Debug, Clone)]
pub struct EdgeDecoder {
    edge_index: usize,
    previous_tick: u32,
    reference_duration: u32,
    data: [u8; BYTES],
    state: SensorState,
    overruns: u32,
    anomalies: u32,
}

impl Default for EdgeDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeDecoder {
    pub fn new() -> Self {
        EdgeDecoder {
            edge_index: 0,
            previous_tick: 0,
            reference_duration: 0,
            data: [0; BYTES],
            state: SensorState::Idle,
            overruns: 0,
            anomalies: 0,
        }
    }

    /// Start a new session at `tick`, when the start pulse begins. The release
    /// that ends the pulse is the session's first edge.
    pub fn init_read(&mut self, tick: u32) {
        self.previous_tick = tick;
        self.edge_index = 0;
        self.reference_duration = 0;
        self.data = [0; BYTES];
        self.overruns = 0;
        self.anomalies = 0;
        self.state = SensorState::Reading;
    }

    /// Consume one edge. Never allocates or blocks.
    pub fn add_edge(&mut self, level: EdgeLevel, tick: u32) {
        if !self.is_reading() {
            self.overruns += 1;
            return;
        }

        let duration = tick.wrapping_sub(self.previous_tick);

        match level {
            EdgeLevel::Low => self.reference_duration = duration,
            EdgeLevel::High => {
                if self.reference_duration == 0 {
                    // no reference pulse to compare against; the edge does not
                    // take a data slot
                    self.anomalies += 1;
                    self.previous_tick = tick;
                    return;
                }
                if self.edge_index >= START_EDGE {
                    let byte = (self.edge_index - START_EDGE) / EDGES_PER_BYTE;
                    self.data[byte] <<= 1;
                    if duration > self.reference_duration {
                        self.data[byte] |= 1;
                    }
                }
                self.reference_duration = 0;
            }
            EdgeLevel::Timeout => {
                self.state = SensorState::Timeout;
                return;
            }
        }

        self.previous_tick = tick;
        self.edge_index += 1;

        if self.edge_index >= EDGES {
            self.state = if self.checksum() == self.data[4] {
                SensorState::Done
            } else {
                SensorState::ReadError
            };
        }
    }

    fn checksum(&self) -> u8 {
        self.data[..4]
            .iter()
            .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
    }

    pub fn state(&self) -> SensorState {
        self.state
    }

    pub fn is_reading(&self) -> bool {
        self.state == SensorState::Reading
    }

    pub fn is_done(&self) -> bool {
        self.state == SensorState::Done
    }

    /// Whether the session reached `Done`, `Timeout` or `ReadError`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            SensorState::Done | SensorState::Timeout | SensorState::ReadError
        )
    }

    pub fn edge_index(&self) -> usize {
        self.edge_index
    }

    /// Edges received while no session was reading.
    pub fn overruns(&self) -> u32 {
        self.overruns
    }

    /// Data edges that arrived without a preceding reference edge.
    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    pub fn word_at(&self, index: usize) -> u16 {
        u16::from_be_bytes([self.data[index], self.data[index + 1]])
    }

    /// Relative humidity in percent, NaN unless the frame decoded cleanly.
    pub fn humidity(&self) -> f32 {
        if !self.is_done() {
            return f32::NAN;
        }
        f32::from(self.word_at(0)) / 10.0
    }

    /// Temperature in degrees Celsius, NaN unless the frame decoded cleanly.
    ///
    /// Bit 15 is a sign flag, not two's complement.
    pub fn temperature(&self) -> f32 {
        if !self.is_done() {
            return f32::NAN;
        }
        let word = self.word_at(2);
        let magnitude = f32::from(word & !SIGN_BIT) / 10.0;
        if word & SIGN_BIT != 0 {
            -magnitude
        } else {
            magnitude
        }
    }
}
