//! Plexus Kernel -- plugin lifecycle and the composed runtime.
//!
//! This crate ties [`plexus_core`] and [`plexus_state`] together into a single
//! owned [`Kernel`](kernel::Kernel): plugins declare hard and soft
//! dependencies, the kernel resolves a start order with a depth-first walk,
//! and every subsystem (clock, scheduler, event bus, command bus, services,
//! RNG streams, snapshots, migrations) is reachable from plugin hooks through
//! `&mut Kernel`.
//!
//! # Quick Start
//!
//! ```
//! use plexus_kernel::prelude::*;
//!
//! let mut kernel = Kernel::new(KernelConfig::default());
//!
//! kernel
//!     .register(PluginBuilder::new("ui").requires(&["core"]).build())
//!     .unwrap();
//! kernel.register(PluginBuilder::new("core").build()).unwrap();
//!
//! kernel.start().unwrap();
//! assert_eq!(kernel.resolve_order().unwrap(), vec!["core", "ui"]);
//!
//! kernel.tick(16.0);
//! kernel.dispose();
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod kernel;
pub mod plugin;
mod resolver;

use plexus_core::CoreError;
use plexus_state::StateError;
use serde_json::{json, Value};

/// Re-export the core crate for convenience.
pub use plexus_core;

/// Re-export the state crate for convenience.
pub use plexus_state;

/// Topics the kernel itself emits.
pub mod topics {
    /// After every plugin has been initialized and started.
    pub const STARTED: &str = "kernel:started";
    /// After every started plugin has been stopped.
    pub const STOPPED: &str = "kernel:stopped";
    /// Just before the registries are cleared by `dispose`.
    pub const DISPOSED: &str = "kernel:disposed";
    /// A fatal lifecycle error, with `{code, message, details}`.
    pub const ERROR: &str = "kernel:error";
    /// After each `tick`, with `{dt, now, ticks, ran, failed}`.
    pub const TICK: &str = "kernel:tick";
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the kernel and its plugin lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// A plugin reported an empty id.
    #[error("plugin id must not be empty")]
    MissingId,

    /// A plugin with this id is already registered.
    #[error("plugin '{id}' is already registered")]
    DuplicateId { id: String },

    /// The dependency graph contains a cycle. `path` starts and ends with
    /// the same id.
    #[error("dependency cycle: {}", path.join(" -> "))]
    DependencyCycle { path: Vec<String> },

    /// A hard dependency is not registered.
    #[error("plugin '{plugin}' requires '{dependency}', which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    /// A plugin registered after `start` needs a dependency that is not
    /// running.
    #[error("plugin '{plugin}' registered late but its dependency '{dependency}' is not started")]
    LateRegistrationMissingDependency { plugin: String, dependency: String },

    /// A plugin's `init` hook failed.
    #[error("plugin '{plugin}' failed to initialize: {source}")]
    InitFailed { plugin: String, source: BoxedSource },

    /// A plugin's `start` hook failed.
    #[error("plugin '{plugin}' failed to start: {source}")]
    StartFailed { plugin: String, source: BoxedSource },

    /// A plugin factory failed to produce a plugin.
    #[error("plugin factory failed: {source}")]
    FactoryFailed { source: BoxedSource },

    /// The configuration document could not be parsed.
    #[error("invalid kernel configuration: {0}")]
    InvalidConfig(#[source] serde_json::Error),

    /// The configuration parsed but a value is out of range.
    #[error("invalid kernel configuration: {field} {reason}")]
    ConfigOutOfRange { field: &'static str, reason: String },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl KernelError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            KernelError::MissingId => "missing-id",
            KernelError::DuplicateId { .. } => "duplicate-id",
            KernelError::DependencyCycle { .. } => "dependency-cycle",
            KernelError::MissingDependency { .. } => "missing-dependency",
            KernelError::LateRegistrationMissingDependency { .. } => {
                "late-registration-missing-dependency"
            }
            KernelError::InitFailed { .. } => "init-failed",
            KernelError::StartFailed { .. } => "start-failed",
            KernelError::FactoryFailed { .. } => "factory-failed",
            KernelError::InvalidConfig(_) | KernelError::ConfigOutOfRange { .. } => {
                "invalid-config"
            }
            KernelError::Core(e) => e.code(),
            KernelError::State(e) => e.code(),
        }
    }

    /// Structured details as a JSON object.
    pub fn details(&self) -> Value {
        match self {
            KernelError::DuplicateId { id } => json!({ "id": id }),
            KernelError::DependencyCycle { path } => json!({ "path": path }),
            KernelError::MissingDependency { plugin, dependency }
            | KernelError::LateRegistrationMissingDependency { plugin, dependency } => {
                json!({ "plugin": plugin, "dependency": dependency })
            }
            KernelError::InitFailed { plugin, source }
            | KernelError::StartFailed { plugin, source } => {
                json!({ "plugin": plugin, "cause": source.to_string() })
            }
            KernelError::FactoryFailed { source } => json!({ "cause": source.to_string() }),
            KernelError::ConfigOutOfRange { field, reason } => {
                json!({ "field": field, "reason": reason })
            }
            KernelError::State(StateError::NoMigrationPath { from, to }) => {
                json!({ "fromVersion": from, "toVersion": to })
            }
            _ => json!({}),
        }
    }

    /// The payload broadcast on [`topics::ERROR`].
    pub fn to_event_payload(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "details": self.details(),
        })
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common kernel usage.
pub mod prelude {
    pub use plexus_core::prelude::*;
    pub use plexus_state::prelude::*;

    pub use crate::config::KernelConfig;
    pub use crate::kernel::{Kernel, TickReport};
    pub use crate::plugin::{ClosurePlugin, Plugin, PluginBuilder, PluginState};
    pub use crate::topics;
    pub use crate::KernelError;
}
