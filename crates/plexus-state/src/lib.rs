//! Plexus State -- checksummed snapshots and version migration.
//!
//! This crate turns the kernel's shared state into a portable [`Snapshot`]
//! document and back:
//!
//! - [`canonical`] renders JSON with recursively sorted keys and computes
//!   fixed-width checksums over that exact text.
//! - [`migration`] stores version→version transforms as a graph and finds a
//!   path between two versions with a bounded breadth-first search.
//! - [`snapshot`] saves, validates and loads snapshots, validating before any
//!   state is touched and migrating before anything is committed.
//!
//! # Quick Start
//!
//! ```
//! use plexus_core::state::{StateAccess, StateStore};
//! use plexus_state::prelude::*;
//! use serde_json::json;
//!
//! let mut store = StateStore::with_state("1", json!({ "hp": 10 }));
//! let manager = SnapshotManager::default();
//!
//! let snapshot = manager.save(&store, json!({ "slot": 1 }));
//! assert!(manager.validate(&snapshot).ok);
//!
//! store.write_state(json!({ "hp": 0 }), plexus_core::state::WriteReason::Host("test".into()));
//! manager
//!     .load(&mut store, &MigrationRegistry::default(), &snapshot, LoadOptions::default())
//!     .unwrap();
//! assert_eq!(store.read_state(), &json!({ "hp": 10 }));
//! ```

#![deny(unsafe_code)]

pub mod canonical;
pub mod migration;
pub mod snapshot;

use snapshot::ValidationReason;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by snapshot and migration operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// No chain of registered migrations leads from `from` to `to`.
    #[error("no migration path from version '{from}' to '{to}'")]
    NoMigrationPath { from: String, to: String },

    /// A migration transform returned an error.
    #[error("migration '{from}' -> '{to}' failed: {source}")]
    TransformFailed {
        from: String,
        to: String,
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The snapshot failed validation; nothing was loaded.
    #[error("invalid snapshot ({reason})")]
    InvalidSnapshot {
        reason: ValidationReason,
        expected: Option<String>,
    },

    /// The snapshot's version differs from the live version and migration
    /// was not allowed.
    #[error("snapshot version '{snapshot}' differs from live version '{live}' and migration is disabled")]
    VersionMismatch { snapshot: String, live: String },

    /// JSON (de)serialization failed.
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StateError::NoMigrationPath { .. } => "no-migration-path",
            StateError::TransformFailed { .. } => "migration-failed",
            StateError::InvalidSnapshot { .. } => "invalid-snapshot",
            StateError::VersionMismatch { .. } => "version-mismatch",
            StateError::Serialization(_) => "serialization-failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::canonical::{canonical_json, ChecksumAlgorithm};
    pub use crate::migration::{MigrationRegistry, MigrationStep};
    pub use crate::snapshot::{
        LoadOptions, LoadReport, Snapshot, SnapshotManager, Validation, ValidationReason,
    };
    pub use crate::StateError;
}
