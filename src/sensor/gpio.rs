//! GPIO driver boundary and the edge handoff out of callback context

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use crate::error::DhtError;
use crate::models::{EdgeEvent, EdgeLevel};
use crate::sensor::decoder::EdgeDecoder;

/// Bias applied to a pin while it is an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Off,
    Up,
}

/// Callback invoked by the driver for every edge on a watched pin.
pub type EdgeCallback = Box<dyn FnMut(EdgeLevel, u32) + Send + 'static>;

/// Operations the acquisition scheduler needs from the host's GPIO layer.
///
/// Ticks are a monotonic microsecond counter that wraps at `u32::MAX`. Edge
/// callbacks may run on a driver-owned thread; watchdog expiry is reported
/// through the same callback as `EdgeLevel::Timeout`.
///
/// A callback may be registered while the pin is an output. Edges are then
/// reported from the moment the pin is switched back to input, excluding the
/// transition caused by that switch: only edges driven by the remote device
/// reach the callback.
pub trait GpioDriver {
    fn initialise(&mut self) -> Result<(), DhtError>;
    fn terminate(&mut self);
    fn set_input(&mut self, pin: u8, pull: Pull) -> Result<(), DhtError>;
    fn set_output(&mut self, pin: u8, high: bool) -> Result<(), DhtError>;
    fn write(&mut self, pin: u8, high: bool) -> Result<(), DhtError>;
    fn tick(&self) -> u32;
    /// Register (`Some`) or remove (`None`) the edge callback for `pin`.
    fn set_edge_callback(&mut self, pin: u8, callback: Option<EdgeCallback>)
        -> Result<(), DhtError>;
    /// Arm the watchdog for `pin`; zero disarms it.
    fn set_watchdog(&mut self, pin: u8, timeout_millis: u32) -> Result<(), DhtError>;
    fn delay(&mut self, micros: u32);
}

/// Producer half of the edge handoff, owned by the driver callback.
///
/// Pushing never blocks or allocates: the queue is preallocated and a full
/// queue drops the edge and counts it.
pub struct EdgeFeed {
    sender: SyncSender<EdgeEvent>,
    dropped: Arc<AtomicU32>,
}

/// Consumer half of the edge handoff, drained by the scheduler.
pub struct EdgeQueue {
    receiver: Receiver<EdgeEvent>,
    dropped: Arc<AtomicU32>,
}

pub fn edge_channel(capacity: usize) -> (EdgeFeed, EdgeQueue) {
    let (sender, receiver) = sync_channel(capacity);
    let dropped = Arc::new(AtomicU32::new(0));
    (
        EdgeFeed {
            sender,
            dropped: dropped.clone(),
        },
        EdgeQueue { receiver, dropped },
    )
}

impl EdgeFeed {
    pub fn push(&self, level: EdgeLevel, tick: u32) {
        if self.sender.try_send(EdgeEvent { level, tick }).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn into_callback(self) -> EdgeCallback {
        Box::new(move |level, tick| self.push(level, tick))
    }
}

impl EdgeQueue {
    /// Feed every queued edge into `decoder`, in delivery order.
    pub fn drain_into(&self, decoder: &mut EdgeDecoder) -> usize {
        let mut count = 0;
        while let Ok(event) = self.receiver.try_recv() {
            decoder.add_edge(event.level, event.tick);
            count += 1;
        }
        count
    }

    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
