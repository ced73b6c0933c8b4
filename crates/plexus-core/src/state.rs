//! Accessors for the shared application state.
//!
//! The command bus and the snapshot manager never own state: they read and
//! write it through [`StateAccess`], and every write carries a
//! [`WriteReason`] describing where it came from.

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Provenance attached to a state write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteReason {
    /// Written by middleware while handling a command of this type.
    Command(String),
    /// Committed by a snapshot load, after migration if one was needed.
    Loaded {
        from_version: String,
        to_version: String,
    },
    /// Written directly by the host.
    Host(String),
}

impl WriteReason {
    /// Short reason tag: `command:<type>`, `save:loaded`, or `host:<label>`.
    pub fn tag(&self) -> String {
        match self {
            WriteReason::Command(kind) => format!("command:{kind}"),
            WriteReason::Loaded { .. } => "save:loaded".to_owned(),
            WriteReason::Host(label) => format!("host:{label}"),
        }
    }

    /// Provenance metadata as a JSON object.
    pub fn to_meta(&self) -> serde_json::Value {
        match self {
            WriteReason::Loaded {
                from_version,
                to_version,
            } => json!({
                "reason": self.tag(),
                "fromVersion": from_version,
                "toVersion": to_version,
            }),
            _ => json!({ "reason": self.tag() }),
        }
    }
}

/// Read/write access to versioned shared state.
pub trait StateAccess {
    /// The current state document.
    fn read_state(&self) -> &serde_json::Value;

    /// The live state schema version.
    fn state_version(&self) -> &str;

    /// Replace the state document.
    fn write_state(&mut self, next: serde_json::Value, reason: WriteReason);
}

/// In-memory [`StateAccess`] implementation.
#[derive(Debug, Clone)]
pub struct StateStore {
    state: serde_json::Value,
    version: String,
    revision: u64,
    last_write: Option<WriteReason>,
}

impl StateStore {
    /// A store holding an empty object at `version`.
    pub fn new(version: &str) -> Self {
        Self::with_state(version, json!({}))
    }

    pub fn with_state(version: &str, state: serde_json::Value) -> Self {
        Self {
            state,
            version: version.to_owned(),
            revision: 0,
            last_write: None,
        }
    }

    /// Number of writes so far.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn last_write(&self) -> Option<&WriteReason> {
        self.last_write.as_ref()
    }

    /// Change the live schema version, e.g. after the host upgrades its
    /// data model.
    pub fn set_version(&mut self, version: &str) {
        self.version = version.to_owned();
    }
}

impl StateAccess for StateStore {
    fn read_state(&self) -> &serde_json::Value {
        &self.state
    }

    fn state_version(&self) -> &str {
        &self.version
    }

    fn write_state(&mut self, next: serde_json::Value, reason: WriteReason) {
        tracing::trace!(reason = %reason.tag(), revision = self.revision + 1, "state written");
        self.state = next;
        self.revision += 1;
        self.last_write = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_track_revision_and_reason() {
        let mut store = StateStore::new("2");
        assert_eq!(store.read_state(), &json!({}));

        store.write_state(json!({"gold": 5}), WriteReason::Command("loot".into()));
        assert_eq!(store.revision(), 1);
        assert_eq!(store.read_state()["gold"], 5);
        assert_eq!(store.last_write().unwrap().tag(), "command:loot");
    }

    #[test]
    fn loaded_meta_carries_versions() {
        let reason = WriteReason::Loaded {
            from_version: "1".into(),
            to_version: "3".into(),
        };
        assert_eq!(
            reason.to_meta(),
            json!({"reason": "save:loaded", "fromVersion": "1", "toVersion": "3"})
        );
    }
}
