//! Peer-synchronized clock
//!
//! Each loop iteration captures the shared session state at the peer's
//! microsecond clock and converts the peer beat into local tick/phase.
//! During the startup window the local origin is not latched, so phase 0
//! only becomes well-defined once the session has settled. Peer
//! `isPlaying` flips are edge-triggered: each edge is relayed as exactly
//! one local pause/resume event. A vanished peer degrades the clock to
//! free-running on the last known tempo instead of taking the process
//! down.

use crate::clock::{Clock, ClockState, TransportEvent, TransportState};
use crate::config::{tempo_in_range, EngineConfig};
use crate::peer_session::PeerSession;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub struct PeerClock {
    state: ClockState,
    session: Box<dyn PeerSession>,
    startup: Duration,
    connected_at: Option<Instant>,
    origin_latched: bool,
    /// Previous peer isPlaying value, for edge detection.
    prev_peer_playing: Option<bool>,
    degraded: bool,
    /// Last observed (session micros, beat) pair. Doubles as the
    /// free-running anchor while the peer is unreachable.
    anchor_micros: i64,
    anchor_beat: f64,
    paused_beat: f64,
}

impl PeerClock {
    pub fn new(config: &EngineConfig, session: Box<dyn PeerSession>) -> Self {
        Self {
            state: ClockState::new(config.bpm, config.ppqn, config.beats_per_bar),
            session,
            startup: config.startup_window(),
            connected_at: None,
            origin_latched: false,
            prev_peer_playing: None,
            degraded: false,
            anchor_micros: 0,
            anchor_beat: 0.0,
            paused_beat: 0.0,
        }
    }

    /// One bar of the shared timeline, in beats.
    fn quantum(&self) -> f64 {
        self.state.beats_per_bar as f64
    }

    fn free_run(&mut self, micros: i64) {
        if self.state.playing {
            let beats = self.anchor_beat
                + (micros - self.anchor_micros) as f64 * 1e-6 * self.state.bpm / 60.0;
            self.state.apply_beats(beats);
        }
    }
}

impl Clock for PeerClock {
    fn advance(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        let micros = self.session.clock_micros();

        let Some(session_state) = self.session.capture_session_state() else {
            if !self.degraded {
                warn!("peer session unreachable, clock degraded to free-running");
                self.degraded = true;
            }
            self.state.synced = false;
            self.free_run(micros);
            return events;
        };

        if self.degraded {
            info!("peer session reachable again");
            self.degraded = false;
        }

        let tempo = session_state.tempo();
        if tempo_in_range(tempo) {
            self.state.bpm = tempo;
        }

        // Relay peer transport flips exactly once per edge.
        let peer_playing = session_state.is_playing();
        if let Some(prev) = self.prev_peer_playing {
            if prev != peer_playing {
                self.state.playing = peer_playing;
                self.state.transport = if peer_playing {
                    TransportState::Playing
                } else {
                    TransportState::Paused
                };
                events.push(if peer_playing {
                    TransportEvent::Resumed
                } else {
                    TransportEvent::Paused
                });
            }
        }
        self.prev_peer_playing = Some(peer_playing);

        let beat = session_state.beat_at_time(micros, self.quantum());
        self.anchor_micros = micros;
        self.anchor_beat = beat;

        // The origin freezes only after the startup window; until then the
        // session is still converging and phase 0 is not trustworthy.
        if let Some(connected) = self.connected_at {
            if now.duration_since(connected) < self.startup {
                self.state.synced = false;
            } else {
                if !self.origin_latched {
                    self.origin_latched = true;
                    info!(beat, "peer clock origin latched");
                }
                self.state.synced = true;
            }
        }

        if self.state.playing {
            self.state.apply_beats(beat);
        }
        events
    }

    fn state(&self) -> &ClockState {
        &self.state
    }

    fn set_tempo(&mut self, bpm: f64, _now: Instant) {
        if !tempo_in_range(bpm) {
            return;
        }
        let micros = self.session.clock_micros();
        if let Some(mut session_state) = self.session.capture_session_state() {
            session_state.set_tempo(bpm, micros);
            self.session.commit_session_state(session_state);
        }
        self.state.bpm = bpm;
    }

    fn beat_at_time(&self, t: f64) -> f64 {
        self.anchor_beat + (t - self.anchor_micros as f64 * 1e-6) * self.state.bpm / 60.0
    }

    fn time_at_beat(&self, beat: f64) -> f64 {
        self.anchor_micros as f64 * 1e-6 + (beat - self.anchor_beat) * 60.0 / self.state.bpm
    }

    fn start(&mut self, now: Instant) {
        if self.state.transport == TransportState::Playing {
            return;
        }
        let micros = self.session.clock_micros();
        if let Some(mut session_state) = self.session.capture_session_state() {
            session_state.set_is_playing(true, micros);
            session_state.request_beat_at_time(0.0, micros, self.quantum());
            self.session.commit_session_state(session_state);
        }
        self.connected_at = Some(now);
        self.origin_latched = false;
        self.prev_peer_playing = Some(true);
        self.state.playing = true;
        self.state.transport = TransportState::Playing;
    }

    fn stop(&mut self, _now: Instant) {
        let micros = self.session.clock_micros();
        if let Some(mut session_state) = self.session.capture_session_state() {
            session_state.set_is_playing(false, micros);
            self.session.commit_session_state(session_state);
        }
        self.prev_peer_playing = Some(false);
        self.state.playing = false;
        self.state.transport = TransportState::Stopped;
        self.state.tick = 0;
        self.state.apply_beats(0.0);
        self.anchor_beat = 0.0;
        self.anchor_micros = micros;
    }

    fn pause(&mut self, _now: Instant) {
        if self.state.transport != TransportState::Playing {
            return;
        }
        let micros = self.session.clock_micros();
        self.paused_beat = self.state.beat;
        if let Some(mut session_state) = self.session.capture_session_state() {
            session_state.set_is_playing(false, micros);
            self.session.commit_session_state(session_state);
        }
        self.prev_peer_playing = Some(false);
        self.state.playing = false;
        self.state.transport = TransportState::Paused;
    }

    fn resume(&mut self, _now: Instant) {
        if self.state.transport != TransportState::Paused {
            return;
        }
        let micros = self.session.clock_micros();
        if let Some(mut session_state) = self.session.capture_session_state() {
            session_state.set_is_playing(true, micros);
            // Realign so the perceived phase never jumps backward relative
            // to the peer timeline.
            session_state.request_beat_at_time(self.paused_beat, micros, self.quantum());
            self.session.commit_session_state(session_state);
        }
        self.prev_peer_playing = Some(true);
        self.state.playing = true;
        self.state.transport = TransportState::Playing;
    }

    fn next_tick_in(&self, _now: Instant) -> Duration {
        if !self.state.playing {
            return Duration::from_secs_f64(self.state.tick_duration());
        }
        let beats = self.state.beat;
        let next_tick = (beats * self.state.ppqn as f64).floor() + 1.0;
        let dt = (next_tick / self.state.ppqn as f64 - beats) * 60.0 / self.state.bpm;
        Duration::from_secs_f64(dt.clamp(0.0, self.state.tick_duration()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_session::LoopbackSession;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    /// A manual session shared with the clock through a thin handle so
    /// tests can steer session time and transport from outside.
    struct SharedSession(std::sync::Arc<std::sync::Mutex<LoopbackSession>>);

    impl PeerSession for SharedSession {
        fn clock_micros(&self) -> i64 {
            self.0.lock().unwrap().clock_micros()
        }
        fn capture_session_state(&mut self) -> Option<crate::peer_session::SessionState> {
            self.0.lock().unwrap().capture_session_state()
        }
        fn commit_session_state(&mut self, state: crate::peer_session::SessionState) {
            self.0.lock().unwrap().commit_session_state(state)
        }
    }

    fn shared_clock() -> (
        PeerClock,
        std::sync::Arc<std::sync::Mutex<LoopbackSession>>,
        Instant,
    ) {
        let shared = std::sync::Arc::new(std::sync::Mutex::new(LoopbackSession::manual(120.0)));
        let clock = PeerClock::new(&config(), Box::new(SharedSession(shared.clone())));
        (clock, shared, Instant::now())
    }

    #[test]
    fn test_follows_peer_beat() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);
        session.lock().unwrap().advance_micros(1_000_000);
        clock.advance(t0 + Duration::from_secs(1));
        // 1 second at 120 bpm = 2 beats = 48 ticks
        assert_eq!(clock.tick(), 48);
    }

    #[test]
    fn test_startup_window_gates_sync() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);
        clock.advance(t0 + Duration::from_millis(100));
        assert!(!clock.state().synced);
        session.lock().unwrap().advance_micros(3_100_000);
        clock.advance(t0 + Duration::from_millis(3100));
        assert!(clock.state().synced);
    }

    #[test]
    fn test_peer_edges_relayed_exactly_once() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);
        clock.advance(t0);

        // peer pauses: one Paused event, then silence on repeat advances
        {
            let mut s = session.lock().unwrap();
            let micros = s.clock_micros();
            let mut state = s.capture_session_state().unwrap();
            state.set_is_playing(false, micros);
            s.commit_session_state(state);
        }
        let events = clock.advance(t0 + Duration::from_millis(10));
        assert_eq!(events, vec![TransportEvent::Paused]);
        assert!(clock.advance(t0 + Duration::from_millis(20)).is_empty());
        assert!(clock.advance(t0 + Duration::from_millis(30)).is_empty());

        // peer resumes: exactly one Resumed event
        {
            let mut s = session.lock().unwrap();
            let micros = s.clock_micros();
            let mut state = s.capture_session_state().unwrap();
            state.set_is_playing(true, micros);
            s.commit_session_state(state);
        }
        let events = clock.advance(t0 + Duration::from_millis(40));
        assert_eq!(events, vec![TransportEvent::Resumed]);
        assert!(clock.advance(t0 + Duration::from_millis(50)).is_empty());
    }

    #[test]
    fn test_pause_resume_preserves_phase() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);

        // get past the startup window first
        session.lock().unwrap().advance_micros(4_000_000);
        clock.advance(t0 + Duration::from_secs(4));
        assert!(clock.state().synced);
        let tick_tolerance = clock.state().tick_duration();

        session.lock().unwrap().advance_micros(250_000);
        let t1 = t0 + Duration::from_millis(4250);
        clock.advance(t1);
        let phase_at_pause = clock.state().phase;
        clock.pause(t1);

        // session time passes while paused
        session.lock().unwrap().advance_micros(2_000_000);
        let t2 = t1 + Duration::from_secs(2);
        clock.resume(t2);
        clock.advance(t2);

        let drift = (clock.state().phase - phase_at_pause).abs();
        assert!(
            drift < tick_tolerance,
            "phase drifted {}s across pause/resume",
            drift
        );
    }

    #[test]
    fn test_unreachable_peer_degrades_to_free_running() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);
        session.lock().unwrap().advance_micros(1_000_000);
        clock.advance(t0 + Duration::from_secs(1));
        let tick_before = clock.tick();

        session.lock().unwrap().set_reachable(false);
        session.lock().unwrap().advance_micros(1_000_000);
        let events = clock.advance(t0 + Duration::from_secs(2));
        assert!(events.is_empty());
        assert!(!clock.state().synced);
        // still ticking on the last known tempo
        assert_eq!(clock.tick(), tick_before + 48);
    }

    #[test]
    fn test_out_of_range_peer_tempo_ignored() {
        let (mut clock, session, t0) = shared_clock();
        clock.start(t0);
        {
            let mut s = session.lock().unwrap();
            let micros = s.clock_micros();
            let mut state = s.capture_session_state().unwrap();
            state.set_tempo(5000.0, micros);
            s.commit_session_state(state);
        }
        clock.advance(t0 + Duration::from_millis(10));
        assert_eq!(clock.bpm(), 120.0);
    }
}
