//! Checksummed, versioned snapshots of the shared state.
//!
//! A snapshot's checksum covers the canonical text of exactly four fields:
//! `version`, `state`, `meta` and `savedAt`. Changing any of them after
//! [`SnapshotManager::save`] is detected by [`SnapshotManager::validate`].
//!
//! [`SnapshotManager::load`] validates first, migrates second and commits
//! last. A snapshot that fails validation or migration leaves the target
//! store untouched.

use std::fmt;

use plexus_core::state::{StateAccess, WriteReason};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_json, ChecksumAlgorithm};
use crate::migration::{MigrationRegistry, MigrationStep};
use crate::StateError;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// A serializable snapshot document.
///
/// `checksum_algorithm` stays a plain string so that documents written by
/// newer hosts still parse and fail validation with
/// [`ValidationReason::UnknownAlgorithm`] instead of a decode error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    pub state: Value,
    pub meta: Value,
    pub saved_at: String,
    pub checksum: String,
    pub checksum_algorithm: String,
}

impl Snapshot {
    /// The checksummed subset of fields in canonical form.
    pub fn canonical_payload(&self) -> String {
        payload_text(&self.version, &self.state, &self.meta, &self.saved_at)
    }

    /// Serialize as a JSON string.
    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON string. Structure is checked here; integrity is checked
    /// by [`SnapshotManager::validate`].
    pub fn from_json(text: &str) -> Result<Self, StateError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn payload_text(version: &str, state: &Value, meta: &Value, saved_at: &str) -> String {
    canonical_json(&json!({
        "version": version,
        "state": state,
        "meta": meta,
        "savedAt": saved_at,
    }))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Why a snapshot failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    /// Missing fields, wrong field types, or a checksum of the wrong shape.
    Malformed,
    /// `checksumAlgorithm` names an algorithm this build does not know.
    UnknownAlgorithm,
    /// The recomputed checksum differs from the stored one.
    ChecksumMismatch,
}

impl ValidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationReason::Malformed => "malformed",
            ValidationReason::UnknownAlgorithm => "unknown_algorithm",
            ValidationReason::ChecksumMismatch => "checksum_mismatch",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ValidationReason>,
    /// The recomputed checksum, present on a mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl Validation {
    fn passed() -> Self {
        Self {
            ok: true,
            reason: None,
            expected: None,
        }
    }

    fn failed(reason: ValidationReason, expected: Option<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            expected,
        }
    }

    /// Convert a failed validation into [`StateError::InvalidSnapshot`].
    pub fn into_result(self) -> Result<(), StateError> {
        match self.reason {
            Some(reason) if !self.ok => Err(StateError::InvalidSnapshot {
                reason,
                expected: self.expected,
            }),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Options for [`SnapshotManager::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Migrate a snapshot whose version differs from the live version.
    pub allow_migrate: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            allow_migrate: true,
        }
    }
}

/// What a successful load did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub from_version: String,
    pub to_version: String,
    pub migrated: bool,
    pub steps: Vec<MigrationStep>,
}

// ---------------------------------------------------------------------------
// SnapshotManager
// ---------------------------------------------------------------------------

/// Produces, validates and loads [`Snapshot`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotManager {
    algorithm: ChecksumAlgorithm,
}

impl SnapshotManager {
    /// A manager that writes checksums with `algorithm`.
    ///
    /// Validation always uses the algorithm a snapshot declares.
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Snapshot the store's current state, stamped with the current UTC time.
    pub fn save(&self, store: &dyn StateAccess, meta: Value) -> Snapshot {
        let saved_at = chrono::Utc::now().to_rfc3339();
        self.save_at(store, meta, &saved_at)
    }

    /// Snapshot the store's current state with an explicit timestamp.
    ///
    /// A `null` meta is stored as an empty object.
    pub fn save_at(&self, store: &dyn StateAccess, meta: Value, saved_at: &str) -> Snapshot {
        let meta = if meta.is_null() { json!({}) } else { meta };
        let version = store.state_version().to_owned();
        let state = store.read_state().clone();
        let checksum = self
            .algorithm
            .digest(&payload_text(&version, &state, &meta, saved_at));

        tracing::debug!(%version, %checksum, algorithm = %self.algorithm, "snapshot saved");

        Snapshot {
            version,
            state,
            meta,
            saved_at: saved_at.to_owned(),
            checksum,
            checksum_algorithm: self.algorithm.as_str().to_owned(),
        }
    }

    /// Recompute the checksum and compare it with the stored one.
    pub fn validate(&self, snapshot: &Snapshot) -> Validation {
        let Ok(algorithm) = snapshot.checksum_algorithm.parse::<ChecksumAlgorithm>() else {
            return Validation::failed(ValidationReason::UnknownAlgorithm, None);
        };
        if snapshot.checksum.len() != algorithm.hex_len()
            || !snapshot.checksum.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Validation::failed(ValidationReason::Malformed, None);
        }

        let expected = algorithm.digest(&snapshot.canonical_payload());
        if expected.eq_ignore_ascii_case(&snapshot.checksum) {
            Validation::passed()
        } else {
            Validation::failed(ValidationReason::ChecksumMismatch, Some(expected))
        }
    }

    /// Validate an arbitrary JSON document as a snapshot.
    ///
    /// Anything that does not decode as a [`Snapshot`] is
    /// [`ValidationReason::Malformed`].
    pub fn validate_value(&self, value: &Value) -> Validation {
        match Snapshot::deserialize(value) {
            Ok(snapshot) => self.validate(&snapshot),
            Err(e) => {
                tracing::debug!(error = %e, "snapshot document malformed");
                Validation::failed(ValidationReason::Malformed, None)
            }
        }
    }

    /// Restore `snapshot` into `store`.
    ///
    /// # Errors
    ///
    /// - [`StateError::InvalidSnapshot`] if validation fails.
    /// - [`StateError::VersionMismatch`] if the versions differ and
    ///   `options.allow_migrate` is false.
    /// - [`StateError::NoMigrationPath`] / [`StateError::TransformFailed`]
    ///   from migration.
    ///
    /// The store is written only after every check and transform succeeded.
    pub fn load(
        &self,
        store: &mut dyn StateAccess,
        registry: &MigrationRegistry,
        snapshot: &Snapshot,
        options: LoadOptions,
    ) -> Result<LoadReport, StateError> {
        let validation = self.validate(snapshot);
        if !validation.ok {
            tracing::warn!(
                reason = ?validation.reason,
                stored = %snapshot.checksum,
                "snapshot rejected"
            );
            validation.into_result()?;
        }

        let from_version = snapshot.version.clone();
        let to_version = store.state_version().to_owned();

        let (next, steps) = if from_version == to_version {
            (snapshot.state.clone(), Vec::new())
        } else if options.allow_migrate {
            let steps = registry.find_path(&from_version, &to_version)?;
            let next = registry.migrate_state(snapshot.state.clone(), &from_version, &to_version)?;
            (next, steps)
        } else {
            return Err(StateError::VersionMismatch {
                snapshot: from_version,
                live: to_version,
            });
        };

        let migrated = !steps.is_empty();
        store.write_state(
            next,
            WriteReason::Loaded {
                from_version: from_version.clone(),
                to_version: to_version.clone(),
            },
        );
        tracing::debug!(from = %from_version, to = %to_version, migrated, "snapshot loaded");

        Ok(LoadReport {
            from_version,
            to_version,
            migrated,
            steps,
        })
    }
}
