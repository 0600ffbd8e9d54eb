//! Cooperative periodic task table
//!
//! Tasks run to completion in registration order on a single thread of
//! control. The current time is sampled once per entry, so a slow task
//! (a medium recovery, say) pushes every later entry back but never causes
//! one to be skipped twice in a row.

use heapless::Vec;
use thiserror::Error;

use crate::clock::{elapsed_ms, Clock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum SchedulerError {
    #[error("task table full")]
    TableFull,
}

/// One periodic entry. `run` receives the shared context by `&mut`, so
/// whatever it touches is owned by exactly one running task at a time.
pub struct Task<Ctx> {
    pub name: &'static str,
    pub run: fn(&mut Ctx),
    pub period_ms: u32,
    last_run_ms: u32,
}

impl<Ctx> Task<Ctx> {
    pub const fn new(name: &'static str, period_ms: u32, run: fn(&mut Ctx)) -> Self {
        Self {
            name,
            run,
            period_ms,
            last_run_ms: 0,
        }
    }

    fn is_due(&self, now_ms: u32) -> bool {
        elapsed_ms(now_ms, self.last_run_ms) >= self.period_ms
    }
}

pub struct Scheduler<Ctx, const N: usize> {
    tasks: Vec<Task<Ctx>, N>,
}

impl<Ctx, const N: usize> Default for Scheduler<Ctx, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Ctx, const N: usize> Scheduler<Ctx, N> {
    pub const fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    pub fn add(&mut self, task: Task<Ctx>) -> Result<(), SchedulerError> {
        let name = task.name;
        self.tasks.push(task).map_err(|_| {
            error!("cannot register task {}: table full", name);
            SchedulerError::TableFull
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run every due task once. Returns how many ran.
    pub fn run_pass<K: Clock>(&mut self, clock: &K, ctx: &mut Ctx) -> usize {
        let mut ran = 0;
        for task in self.tasks.iter_mut() {
            let now = clock.monotonic_ms();
            if !task.is_due(now) {
                continue;
            }
            task.last_run_ms = now;
            trace!("run task {}", task.name);
            (task.run)(ctx);
            ran += 1;
        }
        ran
    }
}
