//! Swimming-function scheduler
//!
//! One cooperative loop drives the clock and every active task; there is
//! no per-task OS thread. A task runs one iteration, then re-arms itself
//! by returning a [`ReArm`] request (next tick, next args) that the
//! scheduler turns into a fresh [`TimeHandle`](crate::time_handle::TimeHandle).
//! Registering under an existing name atomically replaces the pending
//! instance: the swap takes effect at the task's next tick boundary,
//! never mid-execution.
//!
//! Failure isolation: an error or panic inside a body removes that task
//! alone, with a log line; the loop and all other tasks continue.

use crate::clock::{Clock, ClockState, TransportEvent};
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::loop_policy::Sleeper;
use crate::pattern::Value;
use crate::time_handle::WaitQueue;
use crate::transport::TransportSink;
use arc_swap::ArcSwap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The future one task iteration evaluates to.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<Option<ReArm>, TaskError>>>>;

/// A task body: invoked once per iteration with a fresh context, yields
/// `Some(ReArm)` to keep swimming or `None` to finish.
pub type TaskBody = Box<dyn FnMut(TaskContext) -> TaskFuture + Send>;

/// Wrap a plain async closure into a [`TaskBody`].
pub fn task_fn<F, Fut>(mut f: F) -> TaskBody
where
    F: FnMut(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<ReArm>, TaskError>> + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// A task's request for its next iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReArm {
    pub tick: u64,
    pub args: Vec<Value>,
}

impl ReArm {
    pub fn at(tick: u64) -> Self {
        Self {
            tick,
            args: Vec::new(),
        }
    }

    pub fn with_args(tick: u64, args: Vec<Value>) -> Self {
        Self { tick, args }
    }
}

/// Read-only view of the latest published clock snapshot. Cheap to clone
/// and safe to read from any thread; only the loop writes.
#[derive(Clone)]
pub struct ClockView {
    inner: Arc<ArcSwap<ClockState>>,
}

impl ClockView {
    fn new(state: ClockState) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(state)),
        }
    }

    fn publish(&self, state: &ClockState) {
        self.inner.store(Arc::new(state.clone()));
    }

    pub fn snapshot(&self) -> Arc<ClockState> {
        self.inner.load_full()
    }

    pub fn tick(&self) -> u64 {
        self.inner.load().tick
    }

    pub fn beat(&self) -> f64 {
        self.inner.load().beat
    }

    pub fn phase(&self) -> f64 {
        self.inner.load().phase
    }

    pub fn bpm(&self) -> f64 {
        self.inner.load().bpm
    }

    pub fn playing(&self) -> bool {
        self.inner.load().playing
    }
}

/// Per-iteration context handed to a task body.
pub struct TaskContext {
    pub name: String,
    pub iteration: u64,
    pub args: Vec<Value>,
    clock: ClockView,
    waits: Rc<RefCell<WaitQueue>>,
    task_seq: u64,
}

impl TaskContext {
    pub fn clock(&self) -> Arc<ClockState> {
        self.clock.snapshot()
    }

    pub fn tick(&self) -> u64 {
        self.clock.tick()
    }

    pub fn beat(&self) -> f64 {
        self.clock.beat()
    }

    pub fn phase(&self) -> f64 {
        self.clock.phase()
    }

    pub fn bpm(&self) -> f64 {
        self.clock.bpm()
    }

    /// Suspend until `clock.tick >= tick`. Polled by the loop at its
    /// configured interval; resolves with `Cancelled` if the task is
    /// removed while suspended.
    pub async fn wait_until(&self, tick: u64) -> Result<(), TaskError> {
        while self.clock.tick() < tick {
            let handle = self.waits.borrow_mut().arm(tick, self.task_seq);
            handle.wait().await?;
        }
        Ok(())
    }

    /// Suspend for a number of ticks from the current position.
    pub async fn sleep_ticks(&self, ticks: u64) -> Result<(), TaskError> {
        let target = self.clock.tick() + ticks;
        self.wait_until(target).await
    }

    /// Suspend until the next bar boundary.
    pub async fn next_bar(&self) -> Result<(), TaskError> {
        let snapshot = self.clock.snapshot();
        let ticks_per_bar = snapshot.ticks_per_bar();
        let target = (snapshot.tick / ticks_per_bar + 1) * ticks_per_bar;
        self.wait_until(target).await
    }

    /// Tick of the next beat boundary, for the common re-arm case.
    pub fn next_beat_tick(&self) -> u64 {
        let snapshot = self.clock.snapshot();
        let ppqn = snapshot.ppqn as u64;
        (snapshot.tick / ppqn + 1) * ppqn
    }
}

enum Command {
    Schedule {
        name: String,
        body: TaskBody,
        args: Vec<Value>,
    },
    Unschedule {
        name: String,
    },
    SetTempo(f64),
    Start,
    Stop,
    Pause,
    Resume,
    Shutdown,
}

/// Cloneable, Send command surface. Secondary threads (peer polling,
/// MIDI input) talk to the loop exclusively through this.
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    clock: ClockView,
}

impl SchedulerHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("scheduler loop is gone, command dropped");
        }
    }

    /// Register a task and run its first iteration at the current tick.
    /// An existing task under the same name is replaced atomically.
    pub fn schedule(&self, name: impl Into<String>, args: Vec<Value>, body: TaskBody) {
        self.send(Command::Schedule {
            name: name.into(),
            body,
            args,
        });
    }

    /// Remove a task and cancel its pending deadline. Unknown names are a
    /// no-op, not an error.
    pub fn unschedule(&self, name: impl Into<String>) {
        self.send(Command::Unschedule { name: name.into() });
    }

    pub fn set_tempo(&self, bpm: f64) {
        self.send(Command::SetTempo(bpm));
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn get_tick(&self) -> u64 {
        self.clock.tick()
    }

    pub fn get_phase(&self) -> f64 {
        self.clock.phase()
    }

    pub fn get_bpm(&self) -> f64 {
        self.clock.bpm()
    }

    pub fn clock(&self) -> ClockView {
        self.clock.clone()
    }
}

struct Completion {
    name: String,
    seq: u64,
    outcome: Result<Option<ReArm>, TaskError>,
}

struct TaskEntry {
    body: Rc<RefCell<TaskBody>>,
    /// Registration sequence number: identity of this instance and the
    /// FIFO key for same-tick firing.
    seq: u64,
    iteration: u64,
}

/// Owns the task registry and drives everything against the clock.
pub struct Scheduler {
    clock: Box<dyn Clock>,
    view: ClockView,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_tx: mpsc::UnboundedSender<Command>,
    tasks: HashMap<String, TaskEntry>,
    next_seq: u64,
    waits: Rc<RefCell<WaitQueue>>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    sink: Box<dyn TransportSink>,
    interval: Duration,
    sleeper: Sleeper,
    last_tick: u64,
    running: bool,
}

impl Scheduler {
    pub fn new(
        clock: Box<dyn Clock>,
        config: &EngineConfig,
        sink: Box<dyn TransportSink>,
        sleeper: Sleeper,
    ) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let view = ClockView::new(clock.state().clone());
        Self {
            clock,
            view,
            commands,
            commands_tx,
            tasks: HashMap::new(),
            next_seq: 0,
            waits: Rc::new(RefCell::new(WaitQueue::new())),
            completions,
            completions_tx,
            sink,
            interval: config.loop_interval(),
            sleeper,
            last_tick: 0,
            running: true,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            commands: self.commands_tx.clone(),
            clock: self.view.clone(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Arm a deadline for a task instance and spawn the wrapper that runs
    /// one body iteration when it fires.
    fn launch(&mut self, name: String, at_tick: u64, args: Vec<Value>) {
        let Some(entry) = self.tasks.get(&name) else {
            return;
        };
        let seq = entry.seq;
        let iteration = entry.iteration;
        let body = entry.body.clone();
        let handle = self.waits.borrow_mut().arm(at_tick, seq);
        let ctx = TaskContext {
            name: name.clone(),
            iteration,
            args,
            clock: self.view.clone(),
            waits: self.waits.clone(),
            task_seq: seq,
        };
        let completions = self.completions_tx.clone();

        tokio::task::spawn_local(async move {
            if handle.wait().await.is_err() {
                // Unscheduled or replaced before this deadline fired.
                let _ = completions.send(Completion {
                    name,
                    seq,
                    outcome: Err(TaskError::Cancelled),
                });
                return;
            }
            let future = {
                let mut body = body.borrow_mut();
                (*body)(ctx)
            };
            // spawn_local again so a panic inside the body is contained
            // in a JoinError instead of unwinding the wrapper.
            let outcome = match tokio::task::spawn_local(future).await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => Err(TaskError::Panicked),
                Err(_) => Err(TaskError::Cancelled),
            };
            let _ = completions.send(Completion { name, seq, outcome });
        });
    }

    fn remove_task(&mut self, name: &str) {
        if let Some(entry) = self.tasks.remove(name) {
            self.waits.borrow_mut().cancel_task(entry.seq);
        }
    }

    fn process_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Schedule { name, body, args } => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let entry = TaskEntry {
                    body: Rc::new(RefCell::new(body)),
                    seq,
                    iteration: 0,
                };
                if let Some(old) = self.tasks.insert(name.clone(), entry) {
                    // Replacement: the old pending deadline dies here, the
                    // in-flight iteration (if any) finishes and its
                    // completion is discarded by the seq check.
                    self.waits.borrow_mut().cancel_task(old.seq);
                    debug!(task = %name, "replaced running task");
                } else {
                    debug!(task = %name, "scheduled task");
                }
                let tick = self.clock.tick();
                self.launch(name, tick, args);
            }
            Command::Unschedule { name } => {
                if self.tasks.contains_key(&name) {
                    self.remove_task(&name);
                    info!(task = %name, "unscheduled task");
                } else {
                    debug!(task = %name, "unschedule for unknown task ignored");
                }
            }
            Command::SetTempo(bpm) => {
                // Out-of-range values are silently ignored by the clock.
                self.clock.set_tempo(bpm, now);
            }
            Command::Start => {
                self.clock.start(now);
                self.sink.send_start();
            }
            Command::Stop => {
                self.clock.stop(now);
                self.sink.send_stop();
                self.sink.send_reset();
                self.last_tick = 0;
            }
            Command::Pause => {
                self.clock.pause(now);
                self.sink.send_stop();
            }
            Command::Resume => {
                self.clock.resume(now);
                self.sink.send_start();
            }
            Command::Shutdown => {
                self.running = false;
            }
        }
    }

    fn process_completion(&mut self, completion: Completion) {
        let current_seq = match self.tasks.get(&completion.name) {
            Some(entry) => entry.seq,
            None => return,
        };
        if current_seq != completion.seq {
            // Stale completion from a replaced instance.
            return;
        }
        match completion.outcome {
            Ok(Some(rearm)) => {
                if let Some(entry) = self.tasks.get_mut(&completion.name) {
                    entry.iteration += 1;
                }
                self.launch(completion.name, rearm.tick, rearm.args);
            }
            Ok(None) => {
                info!(task = %completion.name, "task finished");
                self.remove_task(&completion.name);
            }
            Err(TaskError::Cancelled) => {
                // Removal already happened; nothing left to clean up.
                self.remove_task(&completion.name);
            }
            Err(err) => {
                error!(task = %completion.name, %err, "task failed, removing it");
                self.remove_task(&completion.name);
            }
        }
    }

    /// The cooperative loop. Must run inside a `LocalSet`.
    pub async fn run(&mut self) {
        info!("scheduler loop starting");
        let now = Instant::now();
        self.clock.start(now);
        self.sink.send_start();
        self.view.publish(self.clock.state());

        while self.running {
            let now = Instant::now();

            while let Ok(command) = self.commands.try_recv() {
                self.process_command(command, now);
            }
            while let Ok(completion) = self.completions.try_recv() {
                self.process_completion(completion);
            }

            let events = self.clock.advance(now);
            self.view.publish(self.clock.state());
            for event in events {
                match event {
                    TransportEvent::Started | TransportEvent::Resumed => {
                        info!(?event, "peer transport edge");
                        self.sink.send_start();
                    }
                    TransportEvent::Stopped | TransportEvent::Paused => {
                        info!(?event, "peer transport edge");
                        self.sink.send_stop();
                    }
                }
            }

            let tick = self.clock.tick();
            if tick > self.last_tick {
                for t in (self.last_tick + 1)..=tick {
                    self.sink.send_clock(t);
                }
                self.last_tick = tick;
            }
            self.waits.borrow_mut().fire_due(tick);

            // Sleeping is what lets the spawned task futures run.
            let until_tick = self.clock.next_tick_in(Instant::now());
            let nap = until_tick.min(self.interval).max(Duration::from_micros(100));
            self.sleeper.sleep(nap).await;
        }

        info!("scheduler loop stopped");
    }
}
