//! Engine context - assembles clock, scheduler and runtime
//!
//! One `Engine` per process. It owns the cooperative runtime and the
//! scheduler; callers interact through a cloneable [`SchedulerHandle`]
//! obtained before `run()` takes the thread.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::free_clock::FreeClock;
use crate::loop_policy::EventLoopPolicy;
use crate::peer_clock::PeerClock;
use crate::peer_session::PeerSession;
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::transport::{NullSink, TransportSink};
use std::error::Error;
use tokio::runtime::Runtime;
use tokio::task::LocalSet;
use tracing::info;

pub struct Engine {
    runtime: Runtime,
    scheduler: Scheduler,
    handle: SchedulerHandle,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    /// Free-running engine with no transport output.
    pub fn new(config: &EngineConfig) -> Result<Self, Box<dyn Error>> {
        let clock = Box::new(FreeClock::new(config));
        Self::with_parts(config, clock, Box::new(NullSink))
    }

    /// Engine whose clock follows a shared peer session.
    pub fn with_peer(
        config: &EngineConfig,
        session: Box<dyn PeerSession>,
    ) -> Result<Self, Box<dyn Error>> {
        let clock = Box::new(PeerClock::new(config, session));
        Self::with_parts(config, clock, Box::new(NullSink))
    }

    pub fn with_parts(
        config: &EngineConfig,
        clock: Box<dyn Clock>,
        sink: Box<dyn TransportSink>,
    ) -> Result<Self, Box<dyn Error>> {
        config.validate()?;
        let policy = EventLoopPolicy::detect();
        let runtime = policy.build_runtime()?;
        let scheduler = Scheduler::new(clock, config, sink, policy.sleeper());
        let handle = scheduler.handle();
        info!(bpm = config.bpm, ppqn = config.ppqn, ?policy, "engine ready");
        Ok(Self {
            runtime,
            scheduler,
            handle,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Take over the calling thread until shutdown or Ctrl-C.
    pub fn run(self) {
        let Engine {
            runtime,
            mut scheduler,
            handle: _,
        } = self;
        let local = LocalSet::new();
        runtime.block_on(local.run_until(async move {
            tokio::select! {
                _ = scheduler.run() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("interrupt received, shutting down");
                    }
                }
            }
        }));
    }
}
