//! Engine configuration
//!
//! JSON on disk, serde in memory. Every field has a default so a partial
//! file (or none at all) still yields a playable engine.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tempo below this is indistinguishable from stopped.
pub const MIN_BPM: f64 = 1.0;
/// Tempo above this outruns any usable tick loop.
pub const MAX_BPM: f64 = 800.0;

/// Exclusive on both ends: 1.0 and 800.0 themselves are rejected.
pub fn tempo_in_range(bpm: f64) -> bool {
    bpm.is_finite() && bpm > MIN_BPM && bpm < MAX_BPM
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Beats per minute.
    pub bpm: f64,
    /// Pulses (ticks) per quarter note.
    pub ppqn: u32,
    pub beats_per_bar: u32,
    /// Upper bound on how long the loop sleeps between iterations.
    pub loop_interval_ms: u64,
    /// How long a peer-synced clock waits for its session before running
    /// free.
    pub peer_startup_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            ppqn: 24,
            beats_per_bar: 4,
            loop_interval_ms: 10,
            peer_startup_secs: 3.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !tempo_in_range(self.bpm) {
            return Err(ConfigError::InvalidTempo(self.bpm));
        }
        if self.ppqn == 0 {
            return Err(ConfigError::InvalidPpqn);
        }
        if self.beats_per_bar == 0 {
            return Err(ConfigError::InvalidBeatsPerBar);
        }
        if self.loop_interval_ms == 0 {
            return Err(ConfigError::InvalidLoopInterval);
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        let config: EngineConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        fs::write(path, text).map_err(|e| ConfigError::Read(e.to_string()))?;
        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn startup_window(&self) -> Duration {
        Duration::from_secs_f64(self.peer_startup_secs.max(0.0))
    }

    pub fn ticks_per_bar(&self) -> u64 {
        self.ppqn as u64 * self.beats_per_bar as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ticks_per_bar(), 96);
        assert_eq!(config.loop_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_tempo_range_is_exclusive() {
        assert!(!tempo_in_range(1.0));
        assert!(!tempo_in_range(800.0));
        assert!(!tempo_in_range(f64::NAN));
        assert!(!tempo_in_range(f64::INFINITY));
        assert!(tempo_in_range(1.01));
        assert!(tempo_in_range(799.99));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = EngineConfig::default();
        config.bpm = 0.0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTempo(0.0)));

        let mut config = EngineConfig::default();
        config.ppqn = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPpqn));

        let mut config = EngineConfig::default();
        config.loop_interval_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidLoopInterval));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        let mut config = EngineConfig::default();
        config.bpm = 133.0;
        config.ppqn = 48;
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.bpm, 133.0);
        assert_eq!(loaded.ppqn, 48);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "bpm": 90.0 }"#).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.bpm, 90.0);
        assert_eq!(loaded.ppqn, 24);
        assert_eq!(loaded.peer_startup_secs, 3.0);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{ "bpm": 5000.0 }"#).unwrap();
        assert!(matches!(
            EngineConfig::load(&path),
            Err(ConfigError::InvalidTempo(_))
        ));
    }
}
