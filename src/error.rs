//! Error types shared across the engine
//!
//! Each concern has its own small enum; `Box<dyn Error>` only appears at
//! the binary boundary where everything converges.

use std::error::Error;
use std::fmt;

/// Configuration that cannot produce a usable engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidTempo(f64),
    InvalidPpqn,
    InvalidBeatsPerBar,
    InvalidLoopInterval,
    Read(String),
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidTempo(bpm) => {
                write!(f, "tempo {} bpm is outside the usable range", bpm)
            }
            ConfigError::InvalidPpqn => write!(f, "ppqn must be at least 1"),
            ConfigError::InvalidBeatsPerBar => write!(f, "beats per bar must be at least 1"),
            ConfigError::InvalidLoopInterval => write!(f, "loop interval must be at least 1 ms"),
            ConfigError::Read(msg) => write!(f, "failed to read config: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse config: {}", msg),
        }
    }
}

impl Error for ConfigError {}

/// A mini-notation source the compiler rejects.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub offending: String,
    pub message: String,
}

impl ParseError {
    pub fn new(offending: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            offending: offending.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at '{}': {}", self.offending, self.message)
    }
}

impl Error for ParseError {}

/// Why one scheduled task stopped. Never fatal to the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    Failed(String),
    Cancelled,
    Panicked,
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TaskError::Failed(msg.into())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(msg) => write!(f, "task failed: {}", msg),
            TaskError::Cancelled => write!(f, "task cancelled"),
            TaskError::Panicked => write!(f, "task panicked"),
        }
    }
}

impl Error for TaskError {}

impl From<ParseError> for TaskError {
    fn from(err: ParseError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Peer session trouble. The clock degrades instead of propagating these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    PeerUnreachable,
    WindowElapsed,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::PeerUnreachable => write!(f, "peer session is unreachable"),
            SyncError::WindowElapsed => write!(f, "startup window elapsed without a peer"),
        }
    }
}

impl Error for SyncError {}
