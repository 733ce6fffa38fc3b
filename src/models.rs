use time::OffsetDateTime;

/// Kind of pulse an edge terminates, as seen by the decoder.
///
/// `Low` marks the end of a low reference pulse (the line rose), `High` marks
/// the end of a high data pulse (the line fell). `Timeout` is reported by the
/// driver's watchdog when no edge arrived in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeLevel {
    Low,
    High,
    Timeout,
}

impl EdgeLevel {
    /// Map the line level an edge transitioned *to* onto the pulse it ended.
    pub fn from_line(rose_to_high: bool) -> Self {
        if rose_to_high {
            EdgeLevel::Low
        } else {
            EdgeLevel::High
        }
    }
}

/// A single timestamped transition delivered by the GPIO driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub level: EdgeLevel,
    pub tick: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorState {
    /// No session has been started yet.
    Idle,
    Reading,
    Timeout,
    ReadError,
    Done,
}

/// Result of one acquisition cycle. Values are NaN unless `ok` is set.
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub humidity: f32,
    pub temperature: f32,
    pub ok: bool,
}

impl Reading {
    pub const NONE: Reading = Reading {
        humidity: f32::NAN,
        temperature: f32::NAN,
        ok: false,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Temperature,
    Humidity,
}

impl Quantity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantity::Temperature => "temperature",
            Quantity::Humidity => "humidity",
        }
    }
}

/// An aggregated value on its way to storage.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub quantity: Quantity,
    pub value: f32,
    pub time: OffsetDateTime,
    pub device: String,
}

impl Measurement {
    /// Value as stored: NaN means "no data this period" and maps to NULL.
    pub fn stored_value(&self) -> Option<f32> {
        if self.value.is_nan() {
            None
        } else {
            Some(self.value)
        }
    }
}
