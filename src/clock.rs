//! Clock trait and shared musical-time state
//!
//! Two interchangeable clock variants implement one capability set: the
//! free-running [`FreeClock`](crate::free_clock::FreeClock) and the
//! peer-synchronized [`PeerClock`](crate::peer_clock::PeerClock). The
//! scheduler loop drives whichever it was given through this trait and
//! publishes the resulting [`ClockState`] snapshot once per iteration.

use std::time::{Duration, Instant};

/// Transport state machine: STOPPED -> PLAYING -> PAUSED -> PLAYING;
/// STOPPED is reachable from PAUSED as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// Edge events produced by clock transitions. Peer isPlaying edges are
/// relayed through these exactly once per edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Started,
    Stopped,
    Paused,
    Resumed,
}

/// Snapshot of musical time, refreshed once per loop iteration.
///
/// Invariants: `phase` stays in `[0, beat_duration)`; `tick` never
/// decreases while playing.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockState {
    pub bpm: f64,
    pub ppqn: u32,
    pub beats_per_bar: u32,
    pub tick: u64,
    pub beat: f64,
    /// Seconds into the current beat.
    pub phase: f64,
    pub elapsed_bars: u64,
    pub playing: bool,
    /// Peer mode only: locked to the peer timeline.
    pub synced: bool,
    pub transport: TransportState,
}

impl ClockState {
    pub fn new(bpm: f64, ppqn: u32, beats_per_bar: u32) -> Self {
        Self {
            bpm,
            ppqn,
            beats_per_bar,
            tick: 0,
            beat: 0.0,
            phase: 0.0,
            elapsed_bars: 0,
            playing: false,
            synced: false,
            transport: TransportState::Stopped,
        }
    }

    /// Duration of one beat in seconds.
    pub fn beat_duration(&self) -> f64 {
        60.0 / self.bpm
    }

    /// Duration of one tick in seconds.
    pub fn tick_duration(&self) -> f64 {
        self.beat_duration() / self.ppqn as f64
    }

    pub fn ticks_per_bar(&self) -> u64 {
        self.ppqn as u64 * self.beats_per_bar as u64
    }

    /// Fold a continuous beat position into the snapshot, keeping the tick
    /// counter monotonic.
    pub(crate) fn apply_beats(&mut self, beats: f64) {
        let beats = beats.max(0.0);
        let tick = (beats * self.ppqn as f64).floor() as u64;
        self.tick = self.tick.max(tick);
        self.beat = beats;
        self.phase = beats.fract() * self.beat_duration();
        self.elapsed_bars = (beats / self.beats_per_bar as f64).floor() as u64;
    }
}

/// The capability set shared by both clock variants.
///
/// All operations take the caller's `now` so transitions and conversions
/// stay pure and testable with synthetic instants.
pub trait Clock: Send {
    /// One step of the clock loop. Returns edge events to relay.
    fn advance(&mut self, now: Instant) -> Vec<TransportEvent>;

    fn state(&self) -> &ClockState;

    /// Accepted only for 1 < bpm < 800; anything else is a silent no-op.
    /// Never retroactively alters already-elapsed ticks.
    fn set_tempo(&mut self, bpm: f64, now: Instant);

    /// Beat position at `t` seconds on the clock timeline (pure).
    fn beat_at_time(&self, t: f64) -> f64;

    /// Inverse of [`Clock::beat_at_time`] (pure).
    fn time_at_beat(&self, beat: f64) -> f64;

    fn start(&mut self, now: Instant);
    fn stop(&mut self, now: Instant);
    fn pause(&mut self, now: Instant);
    fn resume(&mut self, now: Instant);

    /// Time until the next tick boundary, measured from `now`. The loop
    /// uses this to sleep just long enough, so a late wakeup shortens the
    /// next sleep instead of accumulating drift.
    fn next_tick_in(&self, now: Instant) -> Duration;

    fn bpm(&self) -> f64 {
        self.state().bpm
    }

    fn tick(&self) -> u64 {
        self.state().tick
    }
}
