//! Ondine - a temporal engine for live coding
//!
//! Three layers:
//! - a musical clock (free-running with drift correction, or slaved to a
//!   shared peer session) that publishes tick/beat/phase snapshots,
//! - a cooperative scheduler of "swimming" tasks that re-arm themselves
//!   each iteration and can be replaced or removed mid-performance,
//! - a mini-notation compiler that turns pattern strings like
//!   `"c5 e5|g5 0:7 r!2"` into concrete values, one draw per evaluation.
//!
//! The scheduler runs on a single-threaded tokio runtime inside a
//! `LocalSet`; everything outside talks to it through a
//! [`SchedulerHandle`](scheduler::SchedulerHandle).

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod free_clock;
pub mod loop_policy;
pub mod mini_notation;
pub mod pattern;
pub mod peer_clock;
pub mod peer_session;
pub mod scheduler;
pub mod time_handle;
pub mod transport;

pub use clock::{Clock, ClockState, TransportEvent, TransportState};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ConfigError, ParseError, SyncError, TaskError};
pub use free_clock::FreeClock;
pub use mini_notation::parse_pattern;
pub use pattern::{compile_pattern, PatternCompiler, Value};
pub use peer_clock::PeerClock;
pub use peer_session::{LoopbackSession, PeerSession, SessionState};
pub use scheduler::{task_fn, ReArm, Scheduler, SchedulerHandle, TaskContext};
pub use transport::{LogSink, NullSink, TransportSink};
