//! Cancellable, awaitable tick deadlines
//!
//! A [`TimeHandle`] is armed for an absolute tick and completes exactly
//! once, when the clock loop observes that tick, or with a cancellation
//! if its owning task is removed first. Handles live in a [`WaitQueue`]
//! keyed by (deadline, task registration order, arm order), which is what
//! makes same-tick firing deterministic.

use crate::error::TaskError;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::oneshot;

/// One armed deadline. Owned solely by the task awaiting it.
pub struct TimeHandle {
    deadline: u64,
    rx: oneshot::Receiver<()>,
}

impl TimeHandle {
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Resolves when the clock reaches the deadline tick. A dropped
    /// sender means the owning task was unscheduled.
    pub async fn wait(self) -> Result<(), TaskError> {
        self.rx.await.map_err(|_| TaskError::Cancelled)
    }
}

struct WaitEntry {
    tick: u64,
    task_seq: u64,
    arm_seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for WaitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.arm_seq == other.arm_seq
    }
}

impl Eq for WaitEntry {}

impl PartialOrd for WaitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitEntry {
    /// Reversed so the BinaryHeap pops the earliest (tick, task, arm)
    /// first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.tick, other.task_seq, other.arm_seq).cmp(&(self.tick, self.task_seq, self.arm_seq))
    }
}

/// Pending deadlines, fired in deterministic order by the clock loop.
pub struct WaitQueue {
    entries: BinaryHeap<WaitEntry>,
    next_arm_seq: u64,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            entries: BinaryHeap::new(),
            next_arm_seq: 0,
        }
    }

    /// Arm a handle for an absolute tick on behalf of a task.
    pub fn arm(&mut self, tick: u64, task_seq: u64) -> TimeHandle {
        let (tx, rx) = oneshot::channel();
        let arm_seq = self.next_arm_seq;
        self.next_arm_seq += 1;
        self.entries.push(WaitEntry {
            tick,
            task_seq,
            arm_seq,
            tx,
        });
        TimeHandle { deadline: tick, rx }
    }

    /// Complete every handle due at or before `tick`, in (tick, task
    /// registration, arm) order. Returns how many fired.
    pub fn fire_due(&mut self, tick: u64) -> usize {
        let mut fired = 0;
        while let Some(head) = self.entries.peek() {
            if head.tick > tick {
                break;
            }
            let entry = self.entries.pop().unwrap();
            // A closed receiver just means the awaiting future is gone.
            let _ = entry.tx.send(());
            fired += 1;
        }
        fired
    }

    /// Drop every pending handle owned by a task; their receivers resolve
    /// as cancelled immediately.
    pub fn cancel_task(&mut self, task_seq: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.task_seq != task_seq);
        before - self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
