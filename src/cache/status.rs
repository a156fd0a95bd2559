//! Sweep/cleanup status gate.
//!
//! At most one sweep or cleanup pass may run at a time per gate. Waiters
//! block on a completion signal instead of polling the status flag.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::time::timeout;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::status";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    InProgress,
}

/// Mutual exclusion for the sweep/cleanup critical section.
pub struct SweepGate {
    status: Mutex<TaskStatus>,
    done: Notify,
}

impl SweepGate {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(TaskStatus::Idle),
            done: Notify::new(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        *mutex_lock(&self.status, SOURCE, "status")
    }

    /// Enter the critical section. Returns `None` when a pass is already in
    /// flight; the permit restores `Idle` and signals waiters on drop, even
    /// if the holding task panics.
    pub fn try_begin(&self) -> Option<SweepPermit<'_>> {
        let mut status = mutex_lock(&self.status, SOURCE, "try_begin");
        match *status {
            TaskStatus::InProgress => None,
            TaskStatus::Idle => {
                *status = TaskStatus::InProgress;
                Some(SweepPermit { gate: self })
            }
        }
    }

    /// Wait until the in-flight pass has actually finished, never returning
    /// early. Returns `false` when `limit` elapsed first.
    pub async fn join(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.done.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag so a completion between
            // the check and the await is not missed.
            notified.as_mut().enable();

            if self.status() == TaskStatus::Idle {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            if timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for SweepGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SweepPermit<'a> {
    gate: &'a SweepGate,
}

impl Drop for SweepPermit<'_> {
    fn drop(&mut self) {
        *mutex_lock(&self.gate.status, SOURCE, "release") = TaskStatus::Idle;
        self.gate.done.notify_waiters();
    }
}
