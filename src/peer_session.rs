//! Peer transport session boundary
//!
//! The networked peer protocol is an external collaborator: the clock
//! only ever talks to it through [`PeerSession`], capturing a
//! [`SessionState`] at the peer's microsecond clock each loop iteration
//! and committing modified state back. [`LoopbackSession`] is the
//! in-process implementation backing tests and offline use.

use std::time::Instant;

/// Opaque handle to a shared peer transport.
pub trait PeerSession: Send {
    /// The peer's monotonic microsecond clock.
    fn clock_micros(&self) -> i64;

    /// Capture the current shared session state. `None` means the peer is
    /// unreachable; the caller degrades to free-running.
    fn capture_session_state(&mut self) -> Option<SessionState>;

    /// Commit a locally modified state back to the session.
    fn commit_session_state(&mut self, state: SessionState);
}

/// A snapshot of the shared timeline: tempo, a beat/time anchor, and the
/// transport flag. All queries are pure functions of the anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    tempo: f64,
    anchor_beat: f64,
    anchor_micros: i64,
    playing: bool,
}

impl SessionState {
    pub fn new(tempo: f64, anchor_beat: f64, anchor_micros: i64, playing: bool) -> Self {
        Self {
            tempo,
            anchor_beat,
            anchor_micros,
            playing,
        }
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    /// Beat position at the given session time. Frozen while paused.
    pub fn beat_at_time(&self, micros: i64, _quantum: f64) -> f64 {
        if !self.playing {
            return self.anchor_beat;
        }
        self.anchor_beat + (micros - self.anchor_micros) as f64 * 1e-6 * self.tempo / 60.0
    }

    /// Phase within the quantum at the given session time, in beats.
    pub fn phase_at_time(&self, micros: i64, quantum: f64) -> f64 {
        if quantum <= 0.0 {
            return 0.0;
        }
        self.beat_at_time(micros, quantum).rem_euclid(quantum)
    }

    /// Session time at which the given beat occurs.
    pub fn time_at_beat(&self, beat: f64, _quantum: f64) -> i64 {
        self.anchor_micros + ((beat - self.anchor_beat) * 60.0 / self.tempo * 1e6) as i64
    }

    /// Change tempo at a session time. Re-anchors first so elapsed beats
    /// keep their position.
    pub fn set_tempo(&mut self, bpm: f64, at_micros: i64) {
        self.anchor_beat = self.beat_at_time(at_micros, 1.0);
        self.anchor_micros = at_micros;
        self.tempo = bpm;
    }

    /// Toggle the transport at a session time, freezing or thawing the
    /// beat counter at that instant.
    pub fn set_is_playing(&mut self, playing: bool, at_micros: i64) {
        self.anchor_beat = self.beat_at_time(at_micros, 1.0);
        self.anchor_micros = at_micros;
        self.playing = playing;
    }

    /// Ask for `beat` to fall at `micros`. The mapping is quantized so the
    /// session beat never moves backward: if the requested beat lies in
    /// the past it is shifted up by whole quanta, which preserves its
    /// phase.
    pub fn request_beat_at_time(&mut self, beat: f64, micros: i64, quantum: f64) {
        let current = self.beat_at_time(micros, quantum);
        let target = if beat >= current {
            beat
        } else {
            let q = quantum.max(f64::EPSILON);
            beat + ((current - beat) / q).ceil() * q
        };
        self.anchor_beat = target;
        self.anchor_micros = micros;
    }
}

/// How a loopback session keeps time.
enum LoopbackClock {
    Wall { epoch: Instant },
    Manual { micros: i64 },
}

/// In-process peer session: one participant, always in agreement with
/// itself. The manual variant lets tests move session time by hand.
pub struct LoopbackSession {
    state: SessionState,
    clock: LoopbackClock,
    reachable: bool,
}

impl LoopbackSession {
    pub fn new(tempo: f64) -> Self {
        Self {
            state: SessionState::new(tempo, 0.0, 0, true),
            clock: LoopbackClock::Wall {
                epoch: Instant::now(),
            },
            reachable: true,
        }
    }

    /// A session whose clock only moves via [`LoopbackSession::advance_micros`].
    pub fn manual(tempo: f64) -> Self {
        Self {
            state: SessionState::new(tempo, 0.0, 0, true),
            clock: LoopbackClock::Manual { micros: 0 },
            reachable: true,
        }
    }

    pub fn advance_micros(&mut self, dt: i64) {
        if let LoopbackClock::Manual { micros } = &mut self.clock {
            *micros += dt;
        }
    }

    /// Simulate the peer dropping off the network.
    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }
}

impl PeerSession for LoopbackSession {
    fn clock_micros(&self) -> i64 {
        match &self.clock {
            LoopbackClock::Wall { epoch } => epoch.elapsed().as_micros() as i64,
            LoopbackClock::Manual { micros } => *micros,
        }
    }

    fn capture_session_state(&mut self) -> Option<SessionState> {
        self.reachable.then(|| self.state.clone())
    }

    fn commit_session_state(&mut self, state: SessionState) {
        if self.reachable {
            self.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beat_advances_with_session_time() {
        let s = SessionState::new(120.0, 0.0, 0, true);
        assert!((s.beat_at_time(0, 4.0) - 0.0).abs() < 1e-9);
        assert!((s.beat_at_time(1_000_000, 4.0) - 2.0).abs() < 1e-9);
        assert!((s.phase_at_time(2_500_000, 4.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_beat_frozen_while_paused() {
        let mut s = SessionState::new(120.0, 0.0, 0, true);
        s.set_is_playing(false, 1_000_000);
        assert!((s.beat_at_time(5_000_000, 4.0) - 2.0).abs() < 1e-9);
        s.set_is_playing(true, 5_000_000);
        assert!((s.beat_at_time(5_500_000, 4.0) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_time_at_beat_inverts() {
        let s = SessionState::new(90.0, 3.0, 2_000_000, true);
        for beat in [3.0, 4.5, 10.0] {
            let t = s.time_at_beat(beat, 4.0);
            assert!((s.beat_at_time(t, 4.0) - beat).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tempo_change_reanchors() {
        let mut s = SessionState::new(120.0, 0.0, 0, true);
        s.set_tempo(60.0, 1_000_000);
        // 2 beats accrued at 120, then 1 beat per second
        assert!((s.beat_at_time(3_000_000, 4.0) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_request_beat_never_moves_backward() {
        let mut s = SessionState::new(120.0, 0.0, 0, true);
        // at t=4s the session sits at beat 8
        let current = s.beat_at_time(4_000_000, 4.0);
        assert!((current - 8.0).abs() < 1e-9);
        // requesting beat 1.5 maps it forward, phase preserved mod 4
        s.request_beat_at_time(1.5, 4_000_000, 4.0);
        let mapped = s.beat_at_time(4_000_000, 4.0);
        assert!(mapped >= current);
        assert!((mapped.rem_euclid(4.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_unreachable_session_captures_none() {
        let mut session = LoopbackSession::manual(120.0);
        assert!(session.capture_session_state().is_some());
        session.set_reachable(false);
        assert!(session.capture_session_state().is_none());
    }
}
