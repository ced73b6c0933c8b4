//! The composed runtime.
//!
//! A [`Kernel`] owns one instance of every subsystem plus the plugin
//! registry. There is no global state: tests and hosts may run as many
//! kernels side by side as they like.
//!
//! Each [`tick`](Kernel::tick):
//!
//! 1. advances the clock by the host's delta (or the fixed step),
//! 2. pumps the scheduler at the new time,
//! 3. emits [`topics::TICK`].
//!
//! Plugin lifecycle:
//!
//! - [`start`](Kernel::start) resolves the dependency order, runs every
//!   `init` in that order, then every `start`.
//! - [`stop`](Kernel::stop) runs `stop` in reverse of the actual start order.
//!   A failing `stop` is logged and the rest still stop.
//! - [`dispose`](Kernel::dispose) stops if needed, runs `dispose` in reverse
//!   order, releases every plugin's owned tasks and listeners, and clears
//!   the registries.
//!
//! Fatal lifecycle errors are returned to the caller and also broadcast on
//! [`topics::ERROR`].
//!
//! Listeners added with [`on`](Kernel::on) only see the event. Listeners
//! added with [`react`](Kernel::react) also get `&mut Kernel`; they are
//! queued by the bus and run, in emission order, before the kernel call that
//! caused the emission returns.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use plexus_core::clock::Clock;
use plexus_core::commands::{
    Command, CommandBus, CommandLogEntry, DispatchContext, Middleware, Next,
};
use plexus_core::events::{Event, EventBus, ListenerId};
use plexus_core::rng::{RngService, Seed};
use plexus_core::scheduler::{EveryOptions, PumpReport, Scheduler, TaskId};
use plexus_core::services::ServiceRegistry;
use plexus_core::state::{StateAccess, StateStore, WriteReason};
use plexus_state::migration::MigrationRegistry;
use plexus_state::snapshot::{LoadOptions, LoadReport, Snapshot, SnapshotManager, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::KernelConfig;
use crate::plugin::{Descriptor, Plugin, PluginState};
use crate::{resolver, topics, KernelError};

// ---------------------------------------------------------------------------
// TickReport
// ---------------------------------------------------------------------------

/// What a single [`Kernel::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Virtual milliseconds actually applied to the clock.
    pub dt: f64,
    /// Clock time after the advance.
    pub now: f64,
    /// Ticks so far, including this one.
    pub ticks: u64,
    pub pump: PumpReport,
}

// ---------------------------------------------------------------------------
// Plugin bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Phase {
    Init,
    Start,
    Stop,
    Dispose,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Start => "start",
            Phase::Stop => "stop",
            Phase::Dispose => "dispose",
        }
    }
}

struct PluginEntry {
    /// `None` while one of the plugin's own hooks is running.
    plugin: Option<Box<dyn Plugin>>,
    state: PluginState,
}

fn scheduler_of(kernel: &mut Kernel) -> &mut Scheduler<Kernel> {
    &mut kernel.scheduler
}

// ---------------------------------------------------------------------------
// Reactions
// ---------------------------------------------------------------------------

/// Reactions run per drain before the rest wait for the next kernel call.
const MAX_REACTIONS_PER_DRAIN: usize = 1024;

type ReactionFn = Box<dyn FnMut(&mut Kernel, &Event) -> anyhow::Result<()>>;

/// Events delivered by the bus, waiting for their reaction to run.
type Inbox = Rc<RefCell<VecDeque<(ListenerId, Event)>>>;

struct Reactions {
    /// `None` while the reaction itself is running.
    funcs: HashMap<ListenerId, Option<ReactionFn>>,
    inbox: Inbox,
    draining: bool,
}

impl Reactions {
    fn new() -> Self {
        Self {
            funcs: HashMap::new(),
            inbox: Rc::new(RefCell::new(VecDeque::new())),
            draining: false,
        }
    }

    fn clear(&mut self) {
        self.funcs.clear();
        self.inbox.borrow_mut().clear();
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// Owns the subsystems and drives the plugin lifecycle.
pub struct Kernel {
    config: KernelConfig,
    clock: Clock,
    rng: RngService,
    events: EventBus,
    services: ServiceRegistry,
    scheduler: Scheduler<Kernel>,
    commands: CommandBus,
    migrations: MigrationRegistry,
    snapshots: SnapshotManager,
    state: StateStore,
    reactions: Reactions,

    /// Registration order. `descriptors[i]` describes `plugins[i]`.
    plugins: Vec<PluginEntry>,
    descriptors: Vec<Descriptor>,
    index: HashMap<String, usize>,
    /// Cached resolution; `None` when a registration invalidated it.
    resolved: Option<Vec<usize>>,
    /// Indices in the order their `start` hook succeeded.
    start_order: Vec<usize>,
    started: bool,
}

impl Kernel {
    /// Create a kernel with no plugins.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid: a clock time scale or fixed
    /// step that is not positive and finite, or a zero scheduler ceiling or
    /// migration step budget.
    pub fn new(config: KernelConfig) -> Self {
        config.assert_valid();
        let seed = config.rng_seed.clone().unwrap_or_else(Seed::from_wall_clock);
        tracing::debug!(seed = seed.to_root(), version = %config.state_version, "kernel created");
        Self {
            clock: Clock::new(config.clock.clone()),
            rng: RngService::new(Some(seed)),
            events: EventBus::new(config.event_trace_capacity),
            services: ServiceRegistry::new(),
            scheduler: Scheduler::new(config.scheduler.clone()),
            commands: CommandBus::new(config.command_log_capacity),
            migrations: MigrationRegistry::new(config.migration_max_steps),
            snapshots: SnapshotManager::new(config.checksum_algorithm),
            state: StateStore::new(&config.state_version),
            reactions: Reactions::new(),
            plugins: Vec::new(),
            descriptors: Vec::new(),
            index: HashMap::new(),
            resolved: None,
            start_order: Vec::new(),
            started: false,
            config,
        }
    }

    // -- registration -------------------------------------------------------

    /// Register a plugin.
    ///
    /// Before [`start`](Self::start) the plugin only joins the registry.
    /// Once the kernel is started, every hard dependency must already be
    /// running, and the plugin is initialized and started immediately. If
    /// either hook fails the plugin is disposed (when it got initialized),
    /// its owned listeners and tasks are released, and it leaves the
    /// registry, so the same id can be registered again.
    ///
    /// # Errors
    ///
    /// `missing-id`, `duplicate-id`, `late-registration-missing-dependency`,
    /// and for late registration `init-failed` / `start-failed`.
    pub fn register<P: Plugin + 'static>(&mut self, plugin: P) -> Result<(), KernelError> {
        self.register_boxed(Box::new(plugin))
    }

    /// [`register`](Self::register) for an already boxed plugin.
    pub fn register_boxed(&mut self, plugin: Box<dyn Plugin>) -> Result<(), KernelError> {
        self.try_register(plugin).map_err(|e| self.fail(e))
    }

    /// Register the plugin produced by `factory`.
    ///
    /// # Errors
    ///
    /// `factory-failed` if the factory returns an error, otherwise as
    /// [`register`](Self::register).
    pub fn register_factory<F>(&mut self, factory: F) -> Result<(), KernelError>
    where
        F: FnOnce() -> anyhow::Result<Box<dyn Plugin>>,
    {
        match factory() {
            Ok(plugin) => self.register_boxed(plugin),
            Err(e) => Err(self.fail(KernelError::FactoryFailed { source: e.into() })),
        }
    }

    fn try_register(&mut self, plugin: Box<dyn Plugin>) -> Result<(), KernelError> {
        let descriptor = Descriptor::of(&*plugin).ok_or(KernelError::MissingId)?;
        if self.index.contains_key(&descriptor.id) {
            return Err(KernelError::DuplicateId { id: descriptor.id });
        }
        if self.started {
            for dependency in &descriptor.requires {
                let running = self
                    .index
                    .get(dependency)
                    .is_some_and(|&i| self.plugins[i].state == PluginState::Started);
                if !running {
                    return Err(KernelError::LateRegistrationMissingDependency {
                        plugin: descriptor.id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        let index = self.plugins.len();
        tracing::debug!(plugin = %descriptor.id, late = self.started, "plugin registered");
        self.index.insert(descriptor.id.clone(), index);
        self.descriptors.push(descriptor);
        self.plugins.push(PluginEntry {
            plugin: Some(plugin),
            state: PluginState::Registered,
        });
        self.resolved = None;

        if self.started {
            let late = self
                .init_plugin(index)
                .and_then(|()| self.start_plugin(index));
            if let Err(e) = late {
                self.roll_back(index);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Undo a late registration whose `init` or `start` failed: dispose the
    /// plugin if it got initialized, release what it owns and free its id.
    fn roll_back(&mut self, index: usize) {
        let id = self.id_at(index);
        if id.is_empty() || self.index.get(&id) != Some(&index) {
            return;
        }
        if self.state_at(index).is_some_and(PluginState::is_initialized) {
            if let Err(e) = self.run_hook(index, Phase::Dispose) {
                tracing::warn!(plugin = %id, error = %e, "plugin dispose failed");
            }
        }
        self.release_owner(&id);

        self.plugins.remove(index);
        self.descriptors.remove(index);
        self.index = self
            .descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        self.start_order.retain(|&i| i != index);
        for i in &mut self.start_order {
            if *i > index {
                *i -= 1;
            }
        }
        self.resolved = None;
        tracing::debug!(plugin = %id, "late registration rolled back");
    }

    // -- resolution ---------------------------------------------------------

    /// Plugin ids with every dependency before its dependents.
    ///
    /// # Errors
    ///
    /// `missing-dependency` or `dependency-cycle`.
    pub fn resolve_order(&mut self) -> Result<Vec<String>, KernelError> {
        let order = self.resolve_indices().map_err(|e| self.fail(e))?;
        Ok(self.ids_of(&order))
    }

    fn resolve_indices(&mut self) -> Result<Vec<usize>, KernelError> {
        if let Some(order) = &self.resolved {
            return Ok(order.clone());
        }
        let order = resolver::resolve(&self.descriptors, &self.index)?;
        self.resolved = Some(order.clone());
        Ok(order)
    }

    fn ids_of(&self, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .filter_map(|&i| self.descriptors.get(i))
            .map(|d| d.id.clone())
            .collect()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Initialize then start every registered plugin in dependency order.
    ///
    /// Plugins registered by a hook during `start` are picked up before it
    /// returns. Calling `start` on a started kernel does nothing; calling it
    /// after [`stop`](Self::stop) starts the plugins again without
    /// re-running `init`.
    ///
    /// # Errors
    ///
    /// `missing-dependency`, `dependency-cycle`, `init-failed` or
    /// `start-failed`. Plugins started before the failure stay started;
    /// [`stop`](Self::stop) tears them down.
    pub fn start(&mut self) -> Result<(), KernelError> {
        if self.started {
            return Ok(());
        }
        loop {
            let order = self.resolve_indices().map_err(|e| self.fail(e))?;
            let pending: Vec<usize> = order
                .into_iter()
                .filter(|&i| self.state_at(i) != Some(PluginState::Started))
                .collect();
            if pending.is_empty() {
                break;
            }
            for &index in &pending {
                self.init_plugin(index).map_err(|e| self.fail(e))?;
            }
            for &index in &pending {
                self.start_plugin(index).map_err(|e| self.fail(e))?;
            }
        }

        self.started = true;
        let order = self.ids_of(&self.start_order);
        tracing::debug!(plugins = order.len(), "kernel started");
        self.broadcast(topics::STARTED, json!({ "order": order }));
        Ok(())
    }

    /// Stop every started plugin in reverse start order.
    ///
    /// A failing `stop` hook is logged and does not prevent the remaining
    /// plugins from stopping. Returns the number of failed hooks.
    pub fn stop(&mut self) -> usize {
        if !self.started && self.start_order.is_empty() {
            return 0;
        }
        let order = std::mem::take(&mut self.start_order);
        let mut failures = 0;
        for &index in order.iter().rev() {
            if self.state_at(index) != Some(PluginState::Started) {
                continue;
            }
            if let Err(e) = self.run_hook(index, Phase::Stop) {
                failures += 1;
                tracing::warn!(plugin = %self.id_at(index), error = %e, "plugin stop failed");
            }
            self.set_plugin_state(index, PluginState::Stopped);
        }
        self.started = false;

        let stopped: Vec<String> = self.ids_of(&order).into_iter().rev().collect();
        tracing::debug!(plugins = stopped.len(), failures, "kernel stopped");
        self.broadcast(topics::STOPPED, json!({ "order": stopped, "failures": failures }));
        failures
    }

    /// Stop if running, dispose every initialized plugin in reverse order,
    /// release every plugin's owned resources, and clear all registries.
    ///
    /// Clock, RNG and state survive disposal. Returns the number of failed
    /// `stop`/`dispose` hooks.
    pub fn dispose(&mut self) -> usize {
        let mut failures = self.stop();

        let order = self.resolve_indices().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "dependency order unavailable, disposing in reverse registration order");
            (0..self.plugins.len()).collect()
        });
        for &index in order.iter().rev() {
            if !self.state_at(index).is_some_and(PluginState::is_initialized) {
                continue;
            }
            if let Err(e) = self.run_hook(index, Phase::Dispose) {
                failures += 1;
                tracing::warn!(plugin = %self.id_at(index), error = %e, "plugin dispose failed");
            }
            self.set_plugin_state(index, PluginState::Disposed);
        }

        let ids: Vec<String> = self.descriptors.iter().map(|d| d.id.clone()).collect();
        for id in &ids {
            self.release_owner(id);
        }
        self.broadcast(topics::DISPOSED, json!({ "plugins": ids, "failures": failures }));

        self.scheduler.clear();
        self.events.clear();
        self.reactions.clear();
        self.services.clear();
        self.commands.clear();
        self.migrations.clear();
        self.plugins.clear();
        self.descriptors.clear();
        self.index.clear();
        self.resolved = None;
        self.start_order.clear();
        self.started = false;
        tracing::debug!(plugins = ids.len(), failures, "kernel disposed");
        failures
    }

    fn init_plugin(&mut self, index: usize) -> Result<(), KernelError> {
        if self.state_at(index).map_or(true, PluginState::is_initialized) {
            return Ok(());
        }
        if let Err(e) = self.run_hook(index, Phase::Init) {
            return Err(KernelError::InitFailed {
                plugin: self.id_at(index),
                source: e.into(),
            });
        }
        self.set_plugin_state(index, PluginState::Initialized);
        tracing::debug!(plugin = %self.id_at(index), "plugin initialized");
        Ok(())
    }

    fn start_plugin(&mut self, index: usize) -> Result<(), KernelError> {
        if self.state_at(index).map_or(true, |s| s == PluginState::Started) {
            return Ok(());
        }
        if let Err(e) = self.run_hook(index, Phase::Start) {
            return Err(KernelError::StartFailed {
                plugin: self.id_at(index),
                source: e.into(),
            });
        }
        self.set_plugin_state(index, PluginState::Started);
        self.start_order.push(index);
        tracing::debug!(plugin = %self.id_at(index), "plugin started");
        Ok(())
    }

    /// Run one hook with the plugin detached from the registry.
    fn run_hook(&mut self, index: usize, phase: Phase) -> anyhow::Result<()> {
        let Some(mut plugin) = self.plugins.get_mut(index).and_then(|e| e.plugin.take()) else {
            return Ok(());
        };
        let result = match phase {
            Phase::Init => plugin.init(self),
            Phase::Start => plugin.start(self),
            Phase::Stop => plugin.stop(self),
            Phase::Dispose => plugin.dispose(self),
        };
        match self.plugins.get_mut(index) {
            Some(entry) if entry.plugin.is_none() => entry.plugin = Some(plugin),
            _ => tracing::debug!(phase = phase.name(), "plugin registry cleared during hook"),
        }
        result
    }

    fn state_at(&self, index: usize) -> Option<PluginState> {
        self.plugins.get(index).map(|e| e.state)
    }

    fn set_plugin_state(&mut self, index: usize, state: PluginState) {
        if let Some(entry) = self.plugins.get_mut(index) {
            entry.state = state;
        }
    }

    fn id_at(&self, index: usize) -> String {
        self.descriptors
            .get(index)
            .map(|d| d.id.clone())
            .unwrap_or_default()
    }

    /// Log and broadcast a fatal error, then hand it back.
    fn fail(&mut self, error: KernelError) -> KernelError {
        tracing::error!(code = error.code(), error = %error, "kernel error");
        self.broadcast(topics::ERROR, error.to_event_payload());
        error
    }

    // -- plugin inspection --------------------------------------------------

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn plugin_state(&self, id: &str) -> Option<PluginState> {
        self.index.get(id.trim()).and_then(|&i| self.state_at(i))
    }

    /// Registered ids in registration order.
    pub fn plugin_ids(&self) -> Vec<&str> {
        self.descriptors.iter().map(|d| d.id.as_str()).collect()
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    // -- time ---------------------------------------------------------------

    /// Advance the clock, pump the scheduler, emit [`topics::TICK`].
    pub fn tick(&mut self, dt: f64) -> TickReport {
        let applied = self.clock.advance(dt);
        self.scheduler.set_now(self.clock.now());
        let pump = Scheduler::pump_within(self, scheduler_of);

        let report = TickReport {
            dt: applied,
            now: self.clock.now(),
            ticks: self.clock.ticks(),
            pump,
        };
        self.broadcast(
            topics::TICK,
            json!({
                "dt": report.dt,
                "now": report.now,
                "ticks": report.ticks,
                "ran": pump.ran,
                "failed": pump.failed,
            }),
        );
        report
    }

    /// Run `count` ticks of `dt` each.
    pub fn run_ticks(&mut self, count: u64, dt: f64) -> PumpReport {
        let mut total = PumpReport::default();
        for _ in 0..count {
            let pump = self.tick(dt).pump;
            total.ran += pump.ran;
            total.failed += pump.failed;
            total.deferred = pump.deferred;
        }
        total
    }

    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    // -- owners -------------------------------------------------------------

    /// Cancel every task and remove every listener tagged with `owner`.
    /// Returns how many were released; releasing twice is harmless.
    pub fn release_owner(&mut self, owner: &str) -> usize {
        let tasks = self.scheduler.cancel_owner(owner);
        let listeners = self.events.off_owner(owner);
        self.prune_reactions();
        if tasks + listeners > 0 {
            tracing::debug!(owner, tasks, listeners, "owner released");
        }
        tasks + listeners
    }

    // -- events -------------------------------------------------------------

    pub fn on<F>(&mut self, topic: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Event) -> anyhow::Result<()> + 'static,
    {
        self.events.on(topic, listener)
    }

    /// Subscribe on behalf of `owner`; see [`release_owner`](Self::release_owner).
    pub fn on_owned<F>(&mut self, topic: &str, owner: &str, listener: F) -> ListenerId
    where
        F: FnMut(&Event) -> anyhow::Result<()> + 'static,
    {
        self.events.on_owned(topic, owner, listener)
    }

    pub fn off(&mut self, topic: &str, id: Option<ListenerId>) -> usize {
        let removed = self.events.off(topic, id);
        self.prune_reactions();
        removed
    }

    /// Fire-and-forget. Returns how many plain listeners failed; failing
    /// reactions are logged.
    pub fn emit(&mut self, topic: &str, payload: Value) -> usize {
        self.broadcast(topic, payload)
    }

    /// Subscribe a listener that can act on the kernel.
    ///
    /// The reaction runs after the emitting call's plain listeners, before
    /// the kernel method that caused the emission returns. Remove it with
    /// [`off`](Self::off) like any other listener.
    pub fn react<F>(&mut self, topic: &str, reaction: F) -> ListenerId
    where
        F: FnMut(&mut Kernel, &Event) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_reaction(topic, None, Box::new(reaction))
    }

    /// [`react`](Self::react) on behalf of `owner`; see
    /// [`release_owner`](Self::release_owner).
    pub fn react_owned<F>(&mut self, topic: &str, owner: &str, reaction: F) -> ListenerId
    where
        F: FnMut(&mut Kernel, &Event) -> anyhow::Result<()> + 'static,
    {
        self.subscribe_reaction(topic, Some(owner), Box::new(reaction))
    }

    /// Put a forwarding listener on the bus that queues each event for
    /// `reaction`.
    fn subscribe_reaction(
        &mut self,
        topic: &str,
        owner: Option<&str>,
        reaction: ReactionFn,
    ) -> ListenerId {
        let inbox = self.reactions.inbox.clone();
        let slot = Rc::new(Cell::new(None::<ListenerId>));
        let own_id = slot.clone();
        let forward = move |event: &Event| {
            if let Some(id) = own_id.get() {
                inbox.borrow_mut().push_back((id, event.clone()));
            }
            anyhow::Ok(())
        };
        let id = match owner {
            Some(owner) => self.events.on_owned(topic, owner, forward),
            None => self.events.on(topic, forward),
        };
        slot.set(Some(id));
        self.reactions.funcs.insert(id, Some(reaction));
        id
    }

    fn prune_reactions(&mut self) {
        let events = &self.events;
        self.reactions
            .funcs
            .retain(|id, _| events.is_subscribed(*id));
    }

    /// Emit on the bus, then run any reactions it queued.
    fn broadcast(&mut self, topic: &str, payload: Value) -> usize {
        let failures = self.events.emit(topic, payload);
        self.drain_reactions();
        failures
    }

    /// Run queued reactions in emission order. Reactions that emit queue
    /// more work onto the same drain instead of recursing.
    fn drain_reactions(&mut self) {
        if self.reactions.draining {
            return;
        }
        self.reactions.draining = true;
        let mut ran = 0;
        while ran < MAX_REACTIONS_PER_DRAIN {
            let Some((id, event)) = self.reactions.inbox.borrow_mut().pop_front() else {
                break;
            };
            if !self.events.is_subscribed(id) {
                self.reactions.funcs.remove(&id);
                continue;
            }
            let Some(mut reaction) = self.reactions.funcs.get_mut(&id).and_then(Option::take)
            else {
                continue;
            };
            ran += 1;
            if let Err(e) = reaction(self, &event) {
                tracing::warn!(topic = %event.topic, listener = %id, error = %e, "reaction failed");
            }
            if self.events.is_subscribed(id) {
                if let Some(slot) = self.reactions.funcs.get_mut(&id) {
                    *slot = Some(reaction);
                }
            } else {
                self.reactions.funcs.remove(&id);
            }
        }
        let pending = self.reactions.inbox.borrow().len();
        if pending > 0 {
            tracing::warn!(pending, "reaction limit reached, deferring the rest");
        }
        self.reactions.draining = false;
    }

    // -- services -----------------------------------------------------------

    /// # Errors
    ///
    /// `reserved-service` for a core name without `allow_override`.
    pub fn register_service<T: Any>(
        &mut self,
        name: &str,
        value: T,
        allow_override: bool,
    ) -> Result<(), KernelError> {
        Ok(self.services.register(name, value, allow_override)?)
    }

    pub fn service<T: Any>(&self, name: &str) -> Option<&T> {
        self.services.get(name)
    }

    pub fn service_mut<T: Any>(&mut self, name: &str) -> Option<&mut T> {
        self.services.get_mut(name)
    }

    // -- scheduling ---------------------------------------------------------

    /// # Errors
    ///
    /// `task-limit-exceeded`.
    pub fn after<F>(&mut self, delay: f64, callback: F, owner: Option<&str>) -> Result<TaskId, KernelError>
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        Ok(self.scheduler.after(delay, callback, owner)?)
    }

    /// # Errors
    ///
    /// `invalid-interval` or `task-limit-exceeded`.
    pub fn every<F>(&mut self, interval: f64, callback: F, options: EveryOptions) -> Result<TaskId, KernelError>
    where
        F: FnMut(&mut Kernel) -> anyhow::Result<()> + 'static,
    {
        Ok(self.scheduler.every(interval, callback, options)?)
    }

    pub fn cancel(&mut self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn cancel_owner(&mut self, owner: &str) -> usize {
        self.scheduler.cancel_owner(owner)
    }

    // -- commands -----------------------------------------------------------

    /// Append a middleware to the command chain.
    pub fn use_middleware<F>(&mut self, middleware: F)
    where
        F: FnMut(&Command, &mut CommandLogEntry, &mut DispatchContext<'_>, Next<'_>) -> anyhow::Result<()>
            + 'static,
    {
        self.commands.use_middleware(middleware);
    }

    pub fn use_boxed_middleware(&mut self, middleware: Box<dyn Middleware>) {
        self.commands.use_boxed(middleware);
    }

    /// Dispatch against the kernel's state at the current clock time.
    pub fn dispatch(&mut self, command: Command) -> CommandLogEntry {
        let now = self.clock.now();
        let entry = self
            .commands
            .dispatch(command, &mut self.state, &mut self.events, now);
        self.drain_reactions();
        entry
    }

    /// Replay `entries`, or the current command log when `None`.
    pub fn replay(&mut self, entries: Option<Vec<CommandLogEntry>>) -> Vec<CommandLogEntry> {
        let now = self.clock.now();
        let replayed = self
            .commands
            .replay(entries, &mut self.state, &mut self.events, now);
        self.drain_reactions();
        replayed
    }

    // -- state, snapshots, migrations ---------------------------------------

    pub fn state(&self) -> &Value {
        self.state.read_state()
    }

    pub fn state_version(&self) -> &str {
        self.state.state_version()
    }

    /// Replace the state directly, tagged `host:<label>`.
    pub fn set_state(&mut self, next: Value, label: &str) {
        self.state
            .write_state(next, WriteReason::Host(label.to_owned()));
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn register_migration<F>(&mut self, from: &str, to: &str, transform: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + 'static,
    {
        self.migrations.register(from, to, transform);
    }

    /// # Errors
    ///
    /// `no-migration-path` or `migration-failed`.
    pub fn migrate_state(&self, state: Value, from: &str, to: &str) -> Result<Value, KernelError> {
        Ok(self.migrations.migrate_state(state, from, to)?)
    }

    /// Snapshot the current state, stamped now.
    pub fn save(&self, meta: Value) -> Snapshot {
        self.snapshots.save(&self.state, meta)
    }

    pub fn validate(&self, snapshot: &Snapshot) -> Validation {
        self.snapshots.validate(snapshot)
    }

    pub fn validate_value(&self, value: &Value) -> Validation {
        self.snapshots.validate_value(value)
    }

    /// Validate, migrate if needed, then commit `snapshot`.
    ///
    /// # Errors
    ///
    /// `invalid-snapshot`, `version-mismatch`, `no-migration-path` or
    /// `migration-failed`; the state is unchanged on every error.
    pub fn load(&mut self, snapshot: &Snapshot, options: LoadOptions) -> Result<LoadReport, KernelError> {
        Ok(self
            .snapshots
            .load(&mut self.state, &self.migrations, snapshot, options)?)
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut Clock {
        &mut self.clock
    }

    pub fn rng(&self) -> &RngService {
        &self.rng
    }

    pub fn rng_mut(&mut self) -> &mut RngService {
        &mut self.rng
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler<Kernel> {
        &self.scheduler
    }

    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn migrations(&self) -> &MigrationRegistry {
        &self.migrations
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new(KernelConfig::default())
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("plugins", &self.plugin_ids())
            .field("started", &self.started)
            .field("now", &self.clock.now())
            .field("tasks", &self.scheduler.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginBuilder;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Journal = Rc<RefCell<Vec<String>>>;

    fn kernel() -> Kernel {
        Kernel::new(KernelConfig::default().with_seed(7u64))
    }

    fn traced(id: &str, journal: &Journal) -> PluginBuilder {
        let (j1, j2, j3, j4) = (
            journal.clone(),
            journal.clone(),
            journal.clone(),
            journal.clone(),
        );
        let (i1, i2, i3, i4) = (
            format!("init:{id}"),
            format!("start:{id}"),
            format!("stop:{id}"),
            format!("dispose:{id}"),
        );
        PluginBuilder::new(id)
            .on_init(move |_| {
                j1.borrow_mut().push(i1.clone());
                Ok(())
            })
            .on_start(move |_| {
                j2.borrow_mut().push(i2.clone());
                Ok(())
            })
            .on_stop(move |_| {
                j3.borrow_mut().push(i3.clone());
                Ok(())
            })
            .on_dispose(move |_| {
                j4.borrow_mut().push(i4.clone());
                Ok(())
            })
    }

    fn capture(kernel: &mut Kernel, topic: &str) -> Rc<RefCell<Vec<Value>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        kernel.on(topic, move |event: &Event| {
            sink.borrow_mut().push(event.payload.clone());
            Ok(())
        });
        seen
    }

    // -- 1. registration ----------------------------------------------------

    #[test]
    fn duplicate_id_is_rejected() {
        let mut kernel = kernel();
        kernel.register(PluginBuilder::new("core").build()).unwrap();
        let err = kernel
            .register(PluginBuilder::new(" core ").build())
            .unwrap_err();
        assert_eq!(err.code(), "duplicate-id");
        assert_eq!(kernel.plugin_count(), 1);
    }

    #[test]
    fn blank_id_is_rejected_and_broadcast() {
        let mut kernel = kernel();
        let errors = capture(&mut kernel, topics::ERROR);
        let err = kernel.register(PluginBuilder::new("").build()).unwrap_err();
        assert_eq!(err.code(), "missing-id");
        assert_eq!(errors.borrow()[0]["code"], "missing-id");
    }

    #[test]
    fn failing_factory() {
        let mut kernel = kernel();
        let err = kernel
            .register_factory(|| Err(anyhow::anyhow!("no config")))
            .unwrap_err();
        assert_eq!(err.code(), "factory-failed");

        kernel
            .register_factory(|| Ok(Box::new(PluginBuilder::new("made").build())))
            .unwrap();
        assert_eq!(kernel.plugin_ids(), vec!["made"]);
    }

    // -- 2. lifecycle order -------------------------------------------------

    #[test]
    fn init_all_then_start_all_then_reverse_stop() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel
            .register(traced("ui", &journal).requires(&["core"]).build())
            .unwrap();
        kernel.register(traced("core", &journal).build()).unwrap();

        kernel.start().unwrap();
        assert!(kernel.is_started());
        assert_eq!(
            *journal.borrow(),
            vec!["init:core", "init:ui", "start:core", "start:ui"]
        );

        journal.borrow_mut().clear();
        assert_eq!(kernel.stop(), 0);
        assert_eq!(*journal.borrow(), vec!["stop:ui", "stop:core"]);
        assert_eq!(kernel.plugin_state("ui"), Some(PluginState::Stopped));
    }

    #[test]
    fn restart_skips_init() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel.register(traced("core", &journal).build()).unwrap();
        kernel.start().unwrap();
        kernel.stop();
        journal.borrow_mut().clear();

        kernel.start().unwrap();
        assert_eq!(*journal.borrow(), vec!["start:core"]);
    }

    #[test]
    fn init_failure_stops_start() {
        let mut kernel = kernel();
        kernel
            .register(
                PluginBuilder::new("db")
                    .on_init(|_| Err(anyhow::anyhow!("disk full")))
                    .build(),
            )
            .unwrap();
        let err = kernel.start().unwrap_err();
        assert_eq!(err.code(), "init-failed");
        assert!(err.to_string().contains("disk full"));
        assert!(!kernel.is_started());
        assert_eq!(kernel.plugin_state("db"), Some(PluginState::Registered));
    }

    #[test]
    fn stop_failure_does_not_block_others() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel.register(traced("a", &journal).build()).unwrap();
        kernel
            .register(
                PluginBuilder::new("b")
                    .requires(&["a"])
                    .on_stop(|_| Err(anyhow::anyhow!("stuck")))
                    .build(),
            )
            .unwrap();
        kernel.start().unwrap();

        assert_eq!(kernel.stop(), 1);
        assert!(journal.borrow().contains(&"stop:a".to_owned()));
        assert_eq!(kernel.plugin_state("a"), Some(PluginState::Stopped));
        assert_eq!(kernel.plugin_state("b"), Some(PluginState::Stopped));
    }

    #[test]
    fn started_event_lists_order() {
        let mut kernel = kernel();
        let started = capture(&mut kernel, topics::STARTED);
        kernel
            .register(PluginBuilder::new("b").requires(&["a"]).build())
            .unwrap();
        kernel.register(PluginBuilder::new("a").build()).unwrap();
        kernel.start().unwrap();
        assert_eq!(started.borrow()[0], json!({ "order": ["a", "b"] }));
    }

    // -- 3. late registration -----------------------------------------------

    #[test]
    fn late_plugin_starts_immediately() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel.register(traced("core", &journal).build()).unwrap();
        kernel.start().unwrap();
        journal.borrow_mut().clear();

        kernel
            .register(traced("late", &journal).requires(&["core"]).build())
            .unwrap();
        assert_eq!(*journal.borrow(), vec!["init:late", "start:late"]);
        assert_eq!(kernel.plugin_state("late"), Some(PluginState::Started));

        journal.borrow_mut().clear();
        kernel.stop();
        assert_eq!(*journal.borrow(), vec!["stop:late", "stop:core"]);
    }

    #[test]
    fn late_plugin_needs_started_dependencies() {
        let mut kernel = kernel();
        kernel.start().unwrap();
        let err = kernel
            .register(PluginBuilder::new("late").requires(&["ghost"]).build())
            .unwrap_err();
        assert_eq!(err.code(), "late-registration-missing-dependency");
        assert_eq!(
            err.details(),
            json!({ "plugin": "late", "dependency": "ghost" })
        );
        assert_eq!(kernel.plugin_count(), 0);
    }

    #[test]
    fn plugin_registered_from_a_start_hook_is_started() {
        let mut kernel = kernel();
        kernel
            .register(
                PluginBuilder::new("loader")
                    .on_start(|k| {
                        k.register(PluginBuilder::new("child").build())?;
                        Ok(())
                    })
                    .build(),
            )
            .unwrap();
        kernel.start().unwrap();
        assert_eq!(kernel.plugin_state("child"), Some(PluginState::Started));
    }

    #[test]
    fn failed_late_plugin_is_rolled_back_and_can_retry() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel.register(traced("core", &journal).build()).unwrap();
        kernel.start().unwrap();
        journal.borrow_mut().clear();

        let err = kernel
            .register(
                traced("flaky", &journal)
                    .requires(&["core"])
                    .on_start(|k| {
                        let owned = EveryOptions::default().owned_by("flaky");
                        k.every(10.0, |_k: &mut Kernel| Ok(()), owned)?;
                        k.on_owned("input", "flaky", |_e: &Event| Ok(()));
                        Err(anyhow::anyhow!("no device"))
                    })
                    .build(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "start-failed");
        assert_eq!(*journal.borrow(), vec!["init:flaky", "dispose:flaky"]);
        assert_eq!(kernel.plugin_state("flaky"), None);
        assert_eq!(kernel.plugin_count(), 1);
        assert_eq!(kernel.scheduler().owner_task_count("flaky"), 0);
        assert_eq!(kernel.events().listener_count("input"), 0);

        kernel
            .register(traced("flaky", &journal).requires(&["core"]).build())
            .unwrap();
        assert_eq!(kernel.plugin_state("flaky"), Some(PluginState::Started));
        assert_eq!(kernel.resolve_order().unwrap(), vec!["core", "flaky"]);

        journal.borrow_mut().clear();
        kernel.stop();
        assert_eq!(*journal.borrow(), vec!["stop:flaky", "stop:core"]);
    }

    // -- 4. dispose and owners ----------------------------------------------

    #[test]
    fn dispose_releases_owned_resources_and_clears() {
        let journal = Journal::default();
        let mut kernel = kernel();
        kernel
            .register(
                traced("clock-ui", &journal)
                    .on_start(|k| {
                        let owned = EveryOptions::default().owned_by("clock-ui");
                        k.every(10.0, |_k: &mut Kernel| Ok(()), owned)?;
                        k.on_owned("input", "clock-ui", |_e: &Event| Ok(()));
                        Ok(())
                    })
                    .build(),
            )
            .unwrap();
        kernel.start().unwrap();
        assert_eq!(kernel.scheduler().owner_task_count("clock-ui"), 1);
        assert_eq!(kernel.events().listener_count("input"), 1);

        journal.borrow_mut().clear();
        assert_eq!(kernel.dispose(), 0);
        assert_eq!(*journal.borrow(), vec!["stop:clock-ui", "dispose:clock-ui"]);
        assert!(kernel.scheduler().is_empty());
        assert_eq!(kernel.events().listener_count("input"), 0);
        assert_eq!(kernel.plugin_count(), 0);
        assert!(!kernel.is_started());
    }

    #[test]
    fn release_owner_is_idempotent() {
        let mut kernel = kernel();
        kernel.after(5.0, |_k: &mut Kernel| Ok(()), Some("modal")).unwrap();
        kernel.on_owned("key", "modal", |_e: &Event| Ok(()));
        assert_eq!(kernel.release_owner("modal"), 2);
        assert_eq!(kernel.release_owner("modal"), 0);
        assert_eq!(kernel.release_owner("never-used"), 0);
    }

    // -- 5. tick ------------------------------------------------------------

    #[test]
    fn tick_advances_then_pumps_then_emits() {
        let mut kernel = kernel();
        let ticks = capture(&mut kernel, topics::TICK);
        kernel
            .after(
                30.0,
                |k: &mut Kernel| {
                    let now = k.now();
                    k.set_state(json!({ "fired_at": now }), "timer");
                    Ok(())
                },
                None,
            )
            .unwrap();

        kernel.tick(16.0);
        assert_eq!(kernel.state(), &json!({}));
        let report = kernel.tick(16.0);
        assert_eq!(report.pump.ran, 1);
        assert_eq!(kernel.state()["fired_at"], 32.0);
        assert_eq!(ticks.borrow().len(), 2);
        assert_eq!(ticks.borrow()[1]["ran"], 1);
    }

    #[test]
    fn tasks_can_schedule_more_tasks() {
        let mut kernel = kernel();
        kernel
            .after(
                0.0,
                |k: &mut Kernel| {
                    k.after(
                        10.0,
                        |k: &mut Kernel| {
                            k.emit("chained", json!(null));
                            Ok(())
                        },
                        None,
                    )?;
                    Ok(())
                },
                None,
            )
            .unwrap();
        let chained = capture(&mut kernel, "chained");
        kernel.tick(1.0);
        assert!(chained.borrow().is_empty());
        kernel.tick(10.0);
        assert_eq!(chained.borrow().len(), 1);
    }

    // -- 6. services, commands, snapshots -----------------------------------

    #[test]
    fn core_service_names_are_reserved() {
        let mut kernel = kernel();
        let err = kernel.register_service("scheduler", 1u8, false).unwrap_err();
        assert_eq!(err.code(), "reserved-service");
        kernel.register_service("inventory", vec![1u32], false).unwrap();
        assert_eq!(kernel.service::<Vec<u32>>("inventory"), Some(&vec![1]));
    }

    #[test]
    fn dispatch_writes_state_at_clock_time() {
        let mut kernel = kernel();
        kernel.use_middleware(|cmd, entry, ctx, next| {
            let mut state = ctx.state().clone();
            state["last"] = json!(cmd.kind);
            ctx.set_state(state);
            next.run(cmd, entry, ctx)
        });
        kernel.tick(5.0);
        let entry = kernel.dispatch(Command::new("move", json!({ "dx": 1 })));
        assert_eq!(entry.at, 5.0);
        assert_eq!(kernel.state()["last"], "move");
        assert_eq!(kernel.commands().log().len(), 1);

        let replayed = kernel.replay(None);
        assert_eq!(replayed.len(), 1);
        assert!(replayed[0].to_command().is_replay());
    }

    #[test]
    fn snapshot_round_trip_through_kernel() {
        let mut kernel = kernel();
        kernel.set_state(json!({ "level": 3 }), "test");
        let snapshot = kernel.save(json!({ "slot": "a" }));
        assert!(kernel.validate(&snapshot).ok);

        kernel.set_state(json!({ "level": 9 }), "test");
        let report = kernel.load(&snapshot, LoadOptions::default()).unwrap();
        assert!(!report.migrated);
        assert_eq!(kernel.state()["level"], 3);
    }

    #[test]
    fn kernels_are_independent() {
        let mut a = kernel();
        let mut b = kernel();
        a.register(PluginBuilder::new("only-a").build()).unwrap();
        a.tick(100.0);
        assert_eq!(b.plugin_count(), 0);
        assert_eq!(b.now(), 0.0);
        assert_eq!(a.rng_mut().stream("loot").float(), b.rng_mut().stream("loot").float());
    }

    #[test]
    #[should_panic(expected = "max_tasks must be positive")]
    fn zero_task_ceiling_panics() {
        let mut config = KernelConfig::default();
        config.scheduler.max_tasks = 0;
        let _ = Kernel::new(config);
    }

    // -- 7. reactions -------------------------------------------------------

    #[test]
    fn reaction_dispatches_before_emit_returns() {
        let mut kernel = kernel();
        kernel.react("door:opened", |k, event| {
            k.dispatch(Command::new("log-door", event.payload.clone()));
            Ok(())
        });

        kernel.emit("door:opened", json!({ "door": 3 }));
        let log = kernel.commands().log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].kind, "log-door");
        assert_eq!(log[0].payload, json!({ "door": 3 }));
    }

    #[test]
    fn chained_reactions_run_in_emission_order() {
        let mut kernel = kernel();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
        kernel.react("ping", move |k, _e| {
            a.borrow_mut().push("ping");
            k.emit("pong", json!(null));
            a.borrow_mut().push("ping-done");
            Ok(())
        });
        kernel.react("pong", move |_k, _e| {
            b.borrow_mut().push("pong");
            Ok(())
        });
        kernel.on("ping", move |_e: &Event| {
            c.borrow_mut().push("plain");
            Ok(())
        });

        kernel.emit("ping", json!(null));
        assert_eq!(*seen.borrow(), vec!["plain", "ping", "ping-done", "pong"]);
    }

    #[test]
    fn reactions_see_middleware_and_tick_events() {
        let mut kernel = kernel();
        let scheduled = Rc::new(RefCell::new(0u32));
        let fired = scheduled.clone();
        kernel.react("command:dispatched", move |k, _e| {
            let fired = fired.clone();
            k.after(
                10.0,
                move |_k: &mut Kernel| {
                    *fired.borrow_mut() += 1;
                    Ok(())
                },
                None,
            )?;
            Ok(())
        });

        kernel.dispatch(Command::new("noop", json!({})));
        assert_eq!(kernel.scheduler().len(), 1);
        kernel.tick(10.0);
        assert_eq!(*scheduled.borrow(), 1);
    }

    #[test]
    fn owned_reactions_are_released_and_failures_isolated() {
        let mut kernel = kernel();
        let count = Rc::new(RefCell::new(0u32));
        let counter = count.clone();
        kernel.react_owned("hit", "hud", |_k, _e| Err(anyhow::anyhow!("broken")));
        kernel.react_owned("hit", "hud", move |_k, _e| {
            *counter.borrow_mut() += 1;
            Ok(())
        });

        kernel.emit("hit", json!(1));
        assert_eq!(*count.borrow(), 1);

        assert_eq!(kernel.release_owner("hud"), 2);
        kernel.emit("hit", json!(2));
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn removed_reaction_skips_queued_events() {
        let mut kernel = kernel();
        let count = Rc::new(RefCell::new(0u32));
        let counter = count.clone();
        let slot = Rc::new(Cell::new(None::<ListenerId>));
        let target = slot.clone();
        kernel.react("hit", move |k, _e| {
            if let Some(id) = target.get() {
                k.off("hit", Some(id));
            }
            Ok(())
        });
        let id = kernel.react("hit", move |_k, _e| {
            *counter.borrow_mut() += 1;
            Ok(())
        });
        slot.set(Some(id));

        kernel.emit("hit", json!(null));
        assert_eq!(*count.borrow(), 0);
        assert_eq!(kernel.events().listener_count("hit"), 1);
    }

    #[test]
    fn self_feeding_reaction_is_bounded_per_call() {
        let mut kernel = kernel();
        let count = Rc::new(RefCell::new(0usize));
        let counter = count.clone();
        kernel.react("echo", move |k, _e| {
            *counter.borrow_mut() += 1;
            k.emit("echo", json!(null));
            Ok(())
        });

        kernel.emit("echo", json!(null));
        assert_eq!(*count.borrow(), MAX_REACTIONS_PER_DRAIN);
    }
}
