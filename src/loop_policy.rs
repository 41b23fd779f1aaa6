//! Event loop policy - runtime and sleep backend selection
//!
//! The scheduler runs on a single-threaded cooperative runtime; what
//! varies across hosts is how precisely short sleeps land. The policy
//! probes the host timer once and picks the lowest-jitter sleeper
//! available: a hybrid that sleeps coarsely and yield-spins the final
//! stretch, or a plain timer sleep where the host clock is already
//! coarse and spinning would buy nothing.

use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// How long before a deadline the hybrid sleeper switches from the timer
/// to cooperative yield-spinning.
const SPIN_TAIL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventLoopPolicy {
    /// High-resolution host clock: hybrid sleep with a spin tail.
    Precise,
    /// Coarse host clock: timer sleep only.
    Relaxed,
}

impl EventLoopPolicy {
    /// Probe the host timer granularity and pick a policy.
    pub fn detect() -> Self {
        let mut finest = Duration::from_secs(1);
        for _ in 0..64 {
            let a = Instant::now();
            let mut b = Instant::now();
            while b == a {
                b = Instant::now();
            }
            finest = finest.min(b - a);
        }
        let policy = if finest < Duration::from_micros(100) {
            EventLoopPolicy::Precise
        } else {
            EventLoopPolicy::Relaxed
        };
        debug!(?finest, ?policy, "event loop policy detected");
        policy
    }

    /// Build the cooperative runtime the engine loop runs on.
    pub fn build_runtime(self) -> std::io::Result<Runtime> {
        Builder::new_current_thread().enable_all().build()
    }

    pub fn sleeper(self) -> Sleeper {
        match self {
            EventLoopPolicy::Precise => Sleeper::Hybrid { tail: SPIN_TAIL },
            EventLoopPolicy::Relaxed => Sleeper::Coarse,
        }
    }
}

/// Sleep backend used between loop iterations.
#[derive(Debug, Clone, Copy)]
pub enum Sleeper {
    Hybrid { tail: Duration },
    Coarse,
}

impl Sleeper {
    pub async fn sleep(&self, duration: Duration) {
        match self {
            Sleeper::Coarse => tokio::time::sleep(duration).await,
            Sleeper::Hybrid { tail } => {
                let target = Instant::now() + duration;
                if duration > *tail {
                    tokio::time::sleep(duration - *tail).await;
                }
                // Yield-spin the tail: stays cooperative, so spawned
                // tasks keep making progress while we wait.
                while Instant::now() < target {
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_returns_a_policy() {
        // Either answer is valid; the probe must simply terminate.
        let _ = EventLoopPolicy::detect();
    }

    #[test]
    fn test_runtime_builds() {
        let runtime = EventLoopPolicy::Relaxed.build_runtime().unwrap();
        runtime.block_on(async {});
    }

    #[tokio::test]
    async fn test_hybrid_sleeper_does_not_undershoot() {
        let sleeper = Sleeper::Hybrid {
            tail: Duration::from_millis(1),
        };
        let start = Instant::now();
        sleeper.sleep(Duration::from_millis(5)).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
