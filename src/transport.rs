//! Transport sink boundary
//!
//! Wire transmission (MIDI clock, OSC transport messages) lives outside
//! this crate; the loop only ever emits through this capability set.

use tracing::debug;

pub trait TransportSink: Send {
    fn send_start(&mut self);
    fn send_stop(&mut self);
    fn send_clock(&mut self, tick: u64);
    fn send_reset(&mut self);
}

/// Discards everything. The default when no sender is attached.
pub struct NullSink;

impl TransportSink for NullSink {
    fn send_start(&mut self) {}
    fn send_stop(&mut self) {}
    fn send_clock(&mut self, _tick: u64) {}
    fn send_reset(&mut self) {}
}

/// Traces transport messages instead of sending them.
pub struct LogSink;

impl TransportSink for LogSink {
    fn send_start(&mut self) {
        debug!("transport start");
    }

    fn send_stop(&mut self) {
        debug!("transport stop");
    }

    fn send_clock(&mut self, tick: u64) {
        debug!(tick, "transport clock");
    }

    fn send_reset(&mut self) {
        debug!("transport reset");
    }
}
