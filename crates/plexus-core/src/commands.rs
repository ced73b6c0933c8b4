//! Middleware-chained command dispatch with a bounded replay log.
//!
//! A [`Command`] travels through every registered [`Middleware`] in
//! registration order. Composition is onion-style: each middleware receives a
//! [`Next`] continuation and decides whether, and when, to call it. A
//! middleware that never calls `next.run(..)` ends the chain there.
//!
//! Whatever the chain does, including failing, the attempt is appended to the
//! log exactly once and [`DISPATCHED_TOPIC`] is emitted afterwards.
//!
//! # Example
//!
//! ```
//! use plexus_core::prelude::*;
//! use serde_json::json;
//!
//! let mut bus = CommandBus::new(16);
//! let mut state = StateStore::new("1");
//! let mut events = EventBus::default();
//!
//! bus.use_middleware(|cmd, entry, ctx, next| {
//!     if cmd.kind == "gold:add" {
//!         let gold = ctx.state()["gold"].as_i64().unwrap_or(0);
//!         let add = cmd.payload.as_i64().unwrap_or(0);
//!         ctx.set_state(json!({ "gold": gold + add }));
//!     }
//!     next.run(cmd, entry, ctx)
//! });
//!
//! bus.dispatch(Command::new("gold:add", json!(5)), &mut state, &mut events, 0.0);
//! assert_eq!(state.read_state()["gold"], 5);
//! assert_eq!(bus.log().len(), 1);
//! ```

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::EventBus;
use crate::state::{StateAccess, WriteReason};

/// Type given to commands dispatched without one.
pub const UNKNOWN_COMMAND: &str = "unknown";

/// Topic emitted after every dispatch, with the log entry as payload.
pub const DISPATCHED_TOPIC: &str = "command:dispatched";

/// Metadata key marking a replayed command.
pub const REPLAY_KEY: &str = "replay";

// ---------------------------------------------------------------------------
// Command + log entry
// ---------------------------------------------------------------------------

/// A command as dispatched by domain code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Command {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            payload,
            metadata: Map::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }

    /// Whether this command is a replay of a logged one.
    pub fn is_replay(&self) -> bool {
        self.metadata.get(REPLAY_KEY) == Some(&Value::Bool(true))
    }

    fn normalized(mut self) -> Self {
        let trimmed = self.kind.trim();
        self.kind = if trimmed.is_empty() {
            UNKNOWN_COMMAND.to_owned()
        } else {
            trimmed.to_owned()
        };
        self
    }
}

/// One dispatched command as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandLogEntry {
    /// Virtual time of the dispatch.
    pub at: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub metadata: Map<String, Value>,
    /// Error of the middleware chain, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandLogEntry {
    fn new(at: f64, command: &Command) -> Self {
        Self {
            at,
            kind: command.kind.clone(),
            payload: command.payload.clone(),
            metadata: command.metadata.clone(),
            error: None,
        }
    }

    /// Rebuild the command this entry recorded.
    pub fn to_command(&self) -> Command {
        Command {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware plumbing
// ---------------------------------------------------------------------------

/// State and event access bound to one dispatch.
pub struct DispatchContext<'a> {
    state: &'a mut dyn StateAccess,
    events: &'a mut EventBus,
    now: f64,
    kind: String,
}

impl DispatchContext<'_> {
    pub fn state(&self) -> &Value {
        self.state.read_state()
    }

    pub fn state_version(&self) -> &str {
        self.state.state_version()
    }

    /// Replace the shared state; provenance is the command type.
    pub fn set_state(&mut self, next: Value) {
        self.state
            .write_state(next, WriteReason::Command(self.kind.clone()));
    }

    /// Emit an event. Returns the number of failing listeners.
    pub fn emit(&mut self, topic: &str, payload: Value) -> usize {
        self.events.emit(topic, payload)
    }

    pub fn now(&self) -> f64 {
        self.now
    }
}

/// A link in the dispatch chain.
pub trait Middleware {
    fn handle(
        &mut self,
        command: &Command,
        entry: &mut CommandLogEntry,
        ctx: &mut DispatchContext<'_>,
        next: Next<'_>,
    ) -> anyhow::Result<()>;
}

impl<F> Middleware for F
where
    F: FnMut(&Command, &mut CommandLogEntry, &mut DispatchContext<'_>, Next<'_>) -> anyhow::Result<()>,
{
    fn handle(
        &mut self,
        command: &Command,
        entry: &mut CommandLogEntry,
        ctx: &mut DispatchContext<'_>,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        self(command, entry, ctx, next)
    }
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    rest: &'a mut [Box<dyn Middleware>],
}

impl Next<'_> {
    /// Hand the command to the next middleware. A no-op at the end of the
    /// chain.
    pub fn run(
        self,
        command: &Command,
        entry: &mut CommandLogEntry,
        ctx: &mut DispatchContext<'_>,
    ) -> anyhow::Result<()> {
        match self.rest.split_first_mut() {
            Some((head, tail)) => head.handle(command, entry, ctx, Next { rest: tail }),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// CommandBus
// ---------------------------------------------------------------------------

/// Middleware chain plus bounded command log.
pub struct CommandBus {
    middleware: Vec<Box<dyn Middleware>>,
    log: VecDeque<CommandLogEntry>,
    capacity: usize,
}

impl CommandBus {
    /// Create a bus whose log keeps the last `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            middleware: Vec::new(),
            log: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a closure middleware to the chain.
    pub fn use_middleware<F>(&mut self, middleware: F)
    where
        F: FnMut(&Command, &mut CommandLogEntry, &mut DispatchContext<'_>, Next<'_>) -> anyhow::Result<()>
            + 'static,
    {
        self.middleware.push(Box::new(middleware));
    }

    /// Append a boxed middleware to the chain.
    pub fn use_boxed(&mut self, middleware: Box<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn middleware_count(&self) -> usize {
        self.middleware.len()
    }

    /// Run `command` through the chain, log it, and emit
    /// [`DISPATCHED_TOPIC`]. Returns the logged entry.
    pub fn dispatch(
        &mut self,
        command: Command,
        state: &mut dyn StateAccess,
        events: &mut EventBus,
        now: f64,
    ) -> CommandLogEntry {
        let command = command.normalized();
        let mut entry = CommandLogEntry::new(now, &command);

        let mut ctx = DispatchContext {
            state,
            events: &mut *events,
            now,
            kind: command.kind.clone(),
        };
        let chain = Next {
            rest: &mut self.middleware,
        };
        if let Err(e) = chain.run(&command, &mut entry, &mut ctx) {
            tracing::warn!(command = %command.kind, error = %e, "command middleware failed");
            entry.error = Some(format!("{e:#}"));
        }

        self.append(entry.clone());
        let payload = serde_json::to_value(&entry).unwrap_or(Value::Null);
        events.emit(DISPATCHED_TOPIC, payload);
        entry
    }

    /// Re-dispatch `entries`, or a copy of the current log when `None`,
    /// marking each command with `"replay": true`.
    pub fn replay(
        &mut self,
        entries: Option<Vec<CommandLogEntry>>,
        state: &mut dyn StateAccess,
        events: &mut EventBus,
        now: f64,
    ) -> Vec<CommandLogEntry> {
        let entries = entries.unwrap_or_else(|| self.log.iter().cloned().collect());
        tracing::debug!(count = entries.len(), "replaying commands");
        entries
            .iter()
            .map(|entry| {
                let command = entry.to_command().with_meta(REPLAY_KEY, Value::Bool(true));
                self.dispatch(command, &mut *state, &mut *events, now)
            })
            .collect()
    }

    fn append(&mut self, entry: CommandLogEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(entry);
    }

    /// Logged entries, oldest first.
    pub fn log(&self) -> &VecDeque<CommandLogEntry> {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    /// Drop every middleware and the log.
    pub fn clear(&mut self) {
        self.middleware.clear();
        self.log.clear();
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus")
            .field("middleware", &self.middleware.len())
            .field("log_len", &self.log.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
