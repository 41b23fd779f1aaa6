//! Free-running clock with drift correction
//!
//! The tick count is derived from the absolute origin instant on every
//! iteration rather than incremented per wakeup, so measured lateness
//! feeds straight back into the next sleep. A constant-duration sleep
//! would let jitter accumulate; this variant cannot.

use crate::clock::{Clock, ClockState, TransportEvent, TransportState};
use crate::config::{tempo_in_range, EngineConfig};
use std::time::{Duration, Instant};

pub struct FreeClock {
    state: ClockState,
    /// Instant where the beat counter equals `beat_anchor`. `None` while
    /// stopped or paused.
    origin: Option<Instant>,
    /// Beats accumulated up to `origin`. Tempo changes re-anchor here so
    /// elapsed ticks are never recomputed under the new tempo.
    beat_anchor: f64,
}

impl FreeClock {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: ClockState::new(config.bpm, config.ppqn, config.beats_per_bar),
            origin: None,
            beat_anchor: 0.0,
        }
    }

    fn beats_at(&self, now: Instant) -> f64 {
        match self.origin {
            Some(origin) => {
                self.beat_anchor
                    + now.duration_since(origin).as_secs_f64() * self.state.bpm / 60.0
            }
            None => self.beat_anchor,
        }
    }

    /// Move the anchor to `now` without losing musical position.
    fn re_anchor(&mut self, now: Instant) {
        self.beat_anchor = self.beats_at(now);
        if self.origin.is_some() {
            self.origin = Some(now);
        }
    }
}

impl Clock for FreeClock {
    fn advance(&mut self, now: Instant) -> Vec<TransportEvent> {
        if self.state.playing {
            let beats = self.beats_at(now);
            self.state.apply_beats(beats);
        }
        Vec::new()
    }

    fn state(&self) -> &ClockState {
        &self.state
    }

    fn set_tempo(&mut self, bpm: f64, now: Instant) {
        if !tempo_in_range(bpm) {
            return;
        }
        self.re_anchor(now);
        self.state.bpm = bpm;
    }

    fn beat_at_time(&self, t: f64) -> f64 {
        self.beat_anchor + t * self.state.bpm / 60.0
    }

    fn time_at_beat(&self, beat: f64) -> f64 {
        (beat - self.beat_anchor) * 60.0 / self.state.bpm
    }

    fn start(&mut self, now: Instant) {
        if self.state.transport == TransportState::Playing {
            return;
        }
        self.origin = Some(now);
        self.beat_anchor = 0.0;
        self.state.tick = 0;
        self.state.apply_beats(0.0);
        self.state.playing = true;
        self.state.transport = TransportState::Playing;
    }

    fn stop(&mut self, _now: Instant) {
        self.origin = None;
        self.beat_anchor = 0.0;
        self.state.tick = 0;
        self.state.apply_beats(0.0);
        self.state.playing = false;
        self.state.transport = TransportState::Stopped;
    }

    fn pause(&mut self, now: Instant) {
        if self.state.transport != TransportState::Playing {
            return;
        }
        // Capture the instantaneous phase in the anchor; resume continues
        // from exactly here.
        self.beat_anchor = self.beats_at(now);
        self.origin = None;
        self.state.playing = false;
        self.state.transport = TransportState::Paused;
    }

    fn resume(&mut self, now: Instant) {
        if self.state.transport != TransportState::Paused {
            return;
        }
        self.origin = Some(now);
        self.state.playing = true;
        self.state.transport = TransportState::Playing;
    }

    fn next_tick_in(&self, now: Instant) -> Duration {
        if !self.state.playing {
            return Duration::from_secs_f64(self.state.tick_duration());
        }
        let beats = self.beats_at(now);
        let next_tick = (beats * self.state.ppqn as f64).floor() + 1.0;
        let dt = (next_tick / self.state.ppqn as f64 - beats) * 60.0 / self.state.bpm;
        Duration::from_secs_f64(dt.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn clock() -> (FreeClock, Instant) {
        let mut c = FreeClock::new(&EngineConfig::default());
        let t0 = Instant::now();
        c.start(t0);
        (c, t0)
    }

    #[test]
    fn test_tempo_bounds() {
        let (mut c, t0) = clock();
        c.set_tempo(140.0, t0);
        assert_eq!(c.bpm(), 140.0);
        // out of range is a silent no-op, value unchanged
        c.set_tempo(0.5, t0);
        assert_eq!(c.bpm(), 140.0);
        c.set_tempo(1.0, t0);
        assert_eq!(c.bpm(), 140.0);
        c.set_tempo(800.0, t0);
        assert_eq!(c.bpm(), 140.0);
        c.set_tempo(f64::NAN, t0);
        assert_eq!(c.bpm(), 140.0);
        c.set_tempo(799.0, t0);
        assert_eq!(c.bpm(), 799.0);
    }

    #[test]
    fn test_ticks_advance_monotonically() {
        let (mut c, t0) = clock();
        let mut last = 0;
        for i in 1..=200 {
            c.advance(t0 + Duration::from_millis(i * 10));
            assert!(c.tick() >= last);
            last = c.tick();
        }
        // 2 seconds at 120 bpm, 24 ppqn = 96 ticks
        assert_eq!(last, 96);
    }

    #[test]
    fn test_phase_stays_under_beat_duration() {
        let (mut c, t0) = clock();
        for i in 1..=500 {
            c.advance(t0 + Duration::from_millis(i * 7));
            let s = c.state();
            assert!(s.phase >= 0.0 && s.phase < s.beat_duration());
        }
    }

    #[test]
    fn test_drift_corrected_against_jittery_wakeups() {
        // Irregular wakeups must not shift where tick boundaries fall:
        // the boundary count depends only on total elapsed time.
        let (mut c, t0) = clock();
        let jitter = [3u64, 19, 7, 31, 2, 11, 23, 5, 13, 17];
        let mut elapsed = 0u64;
        for i in 0..400 {
            elapsed += jitter[i % jitter.len()];
            c.advance(t0 + Duration::from_millis(elapsed));
        }
        let expected = (elapsed as f64 / 1000.0 / c.state().tick_duration()).floor() as u64;
        assert_eq!(c.tick(), expected);
    }

    #[test]
    fn test_pause_resume_preserves_phase() {
        let (mut c, t0) = clock();
        let t_pause = t0 + Duration::from_millis(1234);
        c.advance(t_pause);
        c.pause(t_pause);
        let beat_at_pause = c.state().beat;

        // a long pause changes nothing
        let t_resume = t_pause + Duration::from_secs(60);
        c.resume(t_resume);
        c.advance(t_resume);
        assert!((c.state().beat - beat_at_pause).abs() < 1e-9);

        // and time keeps accruing from the resume point
        c.advance(t_resume + Duration::from_millis(500));
        assert!((c.state().beat - (beat_at_pause + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_stop_resets() {
        let (mut c, t0) = clock();
        c.advance(t0 + Duration::from_secs(2));
        assert!(c.tick() > 0);
        c.stop(t0 + Duration::from_secs(2));
        assert_eq!(c.tick(), 0);
        assert_eq!(c.state().transport, TransportState::Stopped);
    }

    #[test]
    fn test_tempo_change_is_prospective() {
        let (mut c, t0) = clock();
        let t1 = t0 + Duration::from_secs(1);
        c.advance(t1);
        let beat_before = c.state().beat; // 2.0 at 120 bpm
        c.set_tempo(60.0, t1);
        c.advance(t1);
        assert!((c.state().beat - beat_before).abs() < 1e-9);
        // one more second now adds one beat instead of two
        c.advance(t1 + Duration::from_secs(1));
        assert!((c.state().beat - (beat_before + 1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_beat_time_conversions_invert() {
        let (mut c, t0) = clock();
        c.advance(t0 + Duration::from_millis(321));
        for beat in [0.0, 1.5, 7.25, 128.0] {
            let t = c.time_at_beat(beat);
            assert!((c.beat_at_time(t) - beat).abs() < 1e-9);
        }
    }
}
