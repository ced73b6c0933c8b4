//! One-shot and periodic tasks on virtual time, with owner-scoped bulk
//! cancellation.
//!
//! The [`Scheduler`] never reads a clock of its own. The host moves it with
//! [`Scheduler::set_now`] and then pumps it once per tick. Each pump:
//!
//! 1. Collects the tasks whose due time is at or before `now`, in the order
//!    they were scheduled (the `order` sequence, not the lookup table, is the
//!    source of that guarantee), capped at `max_runs_per_pump`.
//! 2. Runs each one. A one-shot task is removed before it fires. A periodic
//!    task has its due time moved forward by the smallest whole number of
//!    intervals that puts it strictly after `now`, so a task that fell behind
//!    fires once, not once per missed interval.
//! 3. Compacts the order sequence once enough dead ids have piled up.
//!
//! Tasks scheduled while a pump is running become eligible on the next pump.
//! A task cancelled while a pump is running, even by a task that ran earlier
//! in the same pump, does not run.
//!
//! Callbacks receive a mutable context `C`. When the scheduler lives inside
//! that context (as it does in the kernel), use [`Scheduler::pump_within`] so
//! callbacks can schedule and cancel while the pump is in progress.
//!
//! # Example
//!
//! ```
//! use plexus_core::scheduler::{EveryOptions, Scheduler, SchedulerConfig};
//!
//! let mut scheduler: Scheduler<u32> = Scheduler::new(SchedulerConfig::default());
//! let mut beats = 0u32;
//!
//! scheduler
//!     .every(100.0, |beats: &mut u32| { *beats += 1; Ok(()) }, EveryOptions::default())
//!     .unwrap();
//!
//! scheduler.set_now(350.0);
//! scheduler.pump(&mut beats);
//!
//! // Three intervals elapsed, one catch-up run.
//! assert_eq!(beats, 1);
//! assert_eq!(scheduler.next_due(), Some(400.0));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::CoreError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Limits that keep a single pump bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum task executions per pump. Due tasks beyond the cap wait for
    /// the next pump.
    pub max_runs_per_pump: usize,
    /// Maximum live tasks. Scheduling beyond it fails.
    pub max_tasks: usize,
    /// Number of dead ids tolerated in the order sequence before it is
    /// compacted.
    pub compact_after: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_runs_per_pump: 1000,
            max_tasks: 10_000,
            compact_after: 64,
        }
    }
}

// ---------------------------------------------------------------------------
// Task types
// ---------------------------------------------------------------------------

/// Identifier of a scheduled task. Never reused by the same scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Once,
    Every,
}

/// A task callback.
pub type TaskFn<C> = Box<dyn FnMut(&mut C) -> anyhow::Result<()>>;

/// Options for [`Scheduler::every`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EveryOptions {
    /// Fire on the next pump instead of one interval from now.
    pub immediate: bool,
    /// Owner tag for [`Scheduler::cancel_owner`].
    pub owner: Option<String>,
}

impl EveryOptions {
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            owner: None,
        }
    }

    pub fn owned_by(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_owned());
        self
    }
}

/// What a pump did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Callbacks executed.
    pub ran: usize,
    /// Callbacks that returned an error.
    pub failed: usize,
    /// Due tasks left for the next pump because of `max_runs_per_pump`.
    pub deferred: usize,
}

struct Task<C> {
    kind: TaskKind,
    due_at: f64,
    interval: Option<f64>,
    owner: Option<String>,
    /// `None` while the callback is executing.
    callback: Option<TaskFn<C>>,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Task table over virtual time. `C` is the context handed to callbacks.
pub struct Scheduler<C> {
    config: SchedulerConfig,
    now: f64,
    next_id: u64,
    tasks: HashMap<TaskId, Task<C>>,
    /// Insertion order of every id, live or dead.
    order: Vec<TaskId>,
    owners: BTreeMap<String, BTreeSet<TaskId>>,
    /// Ids in `order` whose task is gone.
    dead: usize,
}

impl<C> Scheduler<C> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            now: 0.0,
            next_id: 0,
            tasks: HashMap::new(),
            order: Vec::new(),
            owners: BTreeMap::new(),
            dead: 0,
        }
    }

    /// Move the scheduler's notion of "now".
    pub fn set_now(&mut self, now: f64) {
        self.now = now;
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -- scheduling ---------------------------------------------------------

    /// Run `callback` once, `delay` ms from now. Negative delays count as 0.
    ///
    /// # Errors
    ///
    /// [`CoreError::TaskLimitExceeded`] when the live-task ceiling is reached.
    pub fn after<F>(&mut self, delay: f64, callback: F, owner: Option<&str>) -> Result<TaskId, CoreError>
    where
        F: FnMut(&mut C) -> anyhow::Result<()> + 'static,
    {
        let delay = if delay.is_finite() { delay.max(0.0) } else { 0.0 };
        self.insert(
            TaskKind::Once,
            self.now + delay,
            None,
            owner.map(str::to_owned),
            Box::new(callback),
        )
    }

    /// Run `callback` every `interval` ms.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidInterval`] for a non-positive or non-finite
    /// interval, [`CoreError::TaskLimitExceeded`] when the live-task ceiling
    /// is reached.
    pub fn every<F>(&mut self, interval: f64, callback: F, options: EveryOptions) -> Result<TaskId, CoreError>
    where
        F: FnMut(&mut C) -> anyhow::Result<()> + 'static,
    {
        if !(interval > 0.0 && interval.is_finite()) {
            return Err(CoreError::InvalidInterval { interval });
        }
        let due_at = if options.immediate {
            self.now
        } else {
            self.now + interval
        };
        self.insert(
            TaskKind::Every,
            due_at,
            Some(interval),
            options.owner,
            Box::new(callback),
        )
    }

    fn insert(
        &mut self,
        kind: TaskKind,
        due_at: f64,
        interval: Option<f64>,
        owner: Option<String>,
        callback: TaskFn<C>,
    ) -> Result<TaskId, CoreError> {
        if self.tasks.len() >= self.config.max_tasks {
            return Err(CoreError::TaskLimitExceeded {
                limit: self.config.max_tasks,
            });
        }
        let id = TaskId(self.next_id);
        self.next_id += 1;

        if let Some(owner) = &owner {
            self.owners.entry(owner.clone()).or_default().insert(id);
        }
        self.tasks.insert(
            id,
            Task {
                kind,
                due_at,
                interval,
                owner,
                callback: Some(callback),
            },
        );
        self.order.push(id);
        tracing::trace!(task = %id, ?kind, due_at, "task scheduled");
        Ok(id)
    }

    // -- cancellation -------------------------------------------------------

    /// Cancel one task. Returns whether it was still scheduled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        let removed = self.remove(id);
        self.maybe_compact();
        removed
    }

    /// Cancel every task tagged with `owner`. Idempotent.
    pub fn cancel_owner(&mut self, owner: &str) -> usize {
        let Some(ids) = self.owners.remove(owner) else {
            return 0;
        };
        let mut cancelled = 0;
        for id in ids {
            if self.remove(id) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(owner, cancelled, "owner tasks cancelled");
        }
        self.maybe_compact();
        cancelled
    }

    /// Drop every task.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.order.clear();
        self.owners.clear();
        self.dead = 0;
    }

    fn remove(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.remove(&id) else {
            return false;
        };
        if let Some(owner) = task.owner {
            if let Some(ids) = self.owners.get_mut(&owner) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.owners.remove(&owner);
                }
            }
        }
        self.dead += 1;
        true
    }

    fn maybe_compact(&mut self) {
        if self.dead < self.config.compact_after {
            return;
        }
        let tasks = &self.tasks;
        self.order.retain(|id| tasks.contains_key(id));
        self.dead = 0;
    }

    // -- pumping ------------------------------------------------------------

    /// Run due tasks with a context the scheduler is not part of.
    pub fn pump(&mut self, ctx: &mut C) -> PumpReport {
        let now = self.now;
        let (due, deferred) = self.due_batch();
        let mut report = PumpReport {
            deferred,
            ..Default::default()
        };
        for id in due {
            let Some(mut callback) = self.begin_run(id, now) else {
                continue;
            };
            run_task(id, &mut callback, ctx, &mut report);
            self.end_run(id, callback);
        }
        self.maybe_compact();
        report
    }

    /// Run due tasks of the scheduler reached through `access(ctx)`.
    ///
    /// The scheduler is borrowed only between callbacks, so a callback may
    /// schedule or cancel tasks on it.
    pub fn pump_within(ctx: &mut C, access: fn(&mut C) -> &mut Scheduler<C>) -> PumpReport {
        let scheduler = access(ctx);
        let now = scheduler.now;
        let (due, deferred) = scheduler.due_batch();
        let mut report = PumpReport {
            deferred,
            ..Default::default()
        };
        for id in due {
            let Some(mut callback) = access(ctx).begin_run(id, now) else {
                continue;
            };
            run_task(id, &mut callback, ctx, &mut report);
            access(ctx).end_run(id, callback);
        }
        access(ctx).maybe_compact();
        report
    }

    fn due_batch(&self) -> (Vec<TaskId>, usize) {
        let cap = self.config.max_runs_per_pump;
        let mut due = Vec::new();
        let mut deferred = 0;
        for id in &self.order {
            let Some(task) = self.tasks.get(id) else {
                continue;
            };
            if task.due_at <= self.now {
                if due.len() < cap {
                    due.push(*id);
                } else {
                    deferred += 1;
                }
            }
        }
        if deferred > 0 {
            tracing::debug!(deferred, cap, "pump cap reached, deferring due tasks");
        }
        (due, deferred)
    }

    /// Detach the callback of a due task and settle its bookkeeping.
    fn begin_run(&mut self, id: TaskId, now: f64) -> Option<TaskFn<C>> {
        let task = self.tasks.get_mut(&id)?;
        if task.due_at > now {
            return None;
        }
        match task.kind {
            TaskKind::Once => {
                let callback = task.callback.take();
                self.remove(id);
                callback
            }
            TaskKind::Every => {
                let interval = task.interval?;
                task.due_at = next_due_after(task.due_at, interval, now);
                task.callback.take()
            }
        }
    }

    fn end_run(&mut self, id: TaskId, callback: TaskFn<C>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.kind == TaskKind::Every && task.callback.is_none() {
                task.callback = Some(callback);
            }
        }
    }

    // -- inspection ---------------------------------------------------------

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_scheduled(&self, id: TaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    /// Due time of `id`, if it is still scheduled.
    pub fn due_at(&self, id: TaskId) -> Option<f64> {
        self.tasks.get(&id).map(|t| t.due_at)
    }

    /// Earliest due time among live tasks.
    pub fn next_due(&self) -> Option<f64> {
        self.tasks.values().map(|t| t.due_at).reduce(f64::min)
    }

    /// Live tasks tagged with `owner`.
    pub fn owner_task_count(&self, owner: &str) -> usize {
        self.owners.get(owner).map_or(0, BTreeSet::len)
    }

    /// Length of the order sequence including dead ids.
    pub fn order_len(&self) -> usize {
        self.order.len()
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl<C> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now)
            .field("live", &self.tasks.len())
            .field("order_len", &self.order.len())
            .field("owners", &self.owners.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn run_task<C>(id: TaskId, callback: &mut TaskFn<C>, ctx: &mut C, report: &mut PumpReport) {
    report.ran += 1;
    if let Err(e) = callback(ctx) {
        report.failed += 1;
        tracing::warn!(task = %id, error = %e, "scheduled task failed");
    }
}

/// Smallest `due + k * interval` (k ≥ 1) strictly greater than `now`.
fn next_due_after(due: f64, interval: f64, now: f64) -> f64 {
    let missed = ((now - due) / interval).floor().max(0.0) + 1.0;
    let mut next = due + missed * interval;
    while next <= now {
        next += interval;
    }
    next
}
