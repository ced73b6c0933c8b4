//! Plexus Core -- leaf services of the Plexus runtime kernel.
//!
//! This crate holds the building blocks every plugin talks to: a virtual
//! [`Clock`](clock::Clock), a seeded [`RngService`](rng::RngService) with
//! independent named streams, a synchronous [`EventBus`](events::EventBus), a
//! [`ServiceRegistry`](services::ServiceRegistry), a catch-up-aware
//! [`Scheduler`](scheduler::Scheduler), and a middleware-chained
//! [`CommandBus`](commands::CommandBus) operating on a
//! [`StateAccess`](state::StateAccess) implementation.
//!
//! Nothing in here is global: every service is an owned value, so several
//! kernels can live side by side in the same process.
//!
//! # Quick Start
//!
//! ```
//! use plexus_core::prelude::*;
//!
//! let mut clock = Clock::new(ClockConfig::default());
//! let mut rng = RngService::new(Some(Seed::from(42u64)));
//!
//! clock.advance(16.0);
//! let roll = rng.stream("loot").int(1, 6);
//!
//! assert_eq!(clock.now(), 16.0);
//! assert!((1..=6).contains(&roll));
//! ```

#![deny(unsafe_code)]

pub mod clock;
pub mod commands;
pub mod events;
pub mod hash;
pub mod rng;
pub mod scheduler;
pub mod services;
pub mod state;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the core services.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A periodic task was scheduled with an interval that is not positive
    /// and finite.
    #[error("invalid interval {interval}: periodic tasks need a positive, finite interval")]
    InvalidInterval { interval: f64 },

    /// Scheduling would exceed the configured live-task ceiling.
    #[error("scheduler task limit of {limit} live tasks exceeded")]
    TaskLimitExceeded { limit: usize },

    /// A reserved (core) service name was registered without override.
    #[error("service '{name}' is reserved by the kernel; pass allow_override to replace it")]
    ReservedService { name: String },

    /// The clock was given a time scale that is not positive and finite.
    #[error("invalid time scale {scale}: must be positive and finite")]
    InvalidTimeScale { scale: f64 },
}

impl CoreError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInterval { .. } => "invalid-interval",
            CoreError::TaskLimitExceeded { .. } => "task-limit-exceeded",
            CoreError::ReservedService { .. } => "reserved-service",
            CoreError::InvalidTimeScale { .. } => "invalid-time-scale",
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::clock::{Clock, ClockConfig};
    pub use crate::commands::{
        Command, CommandBus, CommandLogEntry, DispatchContext, Middleware, Next, UNKNOWN_COMMAND,
    };
    pub use crate::events::{Event, EventBus, EventTraceEntry, ListenerId};
    pub use crate::hash::{hash32, hash32_hex};
    pub use crate::rng::{RngService, RngStream, Seed};
    pub use crate::scheduler::{
        EveryOptions, PumpReport, Scheduler, SchedulerConfig, TaskId, TaskKind,
    };
    pub use crate::services::{ServiceRegistry, CORE_SERVICES};
    pub use crate::state::{StateAccess, StateStore, WriteReason};
    pub use crate::CoreError;
}
