//! Kernel configuration.

use plexus_core::clock::ClockConfig;
use plexus_core::rng::Seed;
use plexus_core::scheduler::SchedulerConfig;
use plexus_state::canonical::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};

use crate::KernelError;

/// Configuration for [`Kernel`](crate::kernel::Kernel).
///
/// Every field has a default, so a host document only needs the fields it
/// changes:
///
/// ```
/// use plexus_kernel::config::KernelConfig;
///
/// let config = KernelConfig::from_json_str(r#"{ "rng_seed": 42, "state_version": "3" }"#).unwrap();
/// assert_eq!(config.state_version, "3");
/// assert_eq!(config.command_log_capacity, 256);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub clock: ClockConfig,
    pub scheduler: SchedulerConfig,
    /// Entries kept in the command log ring.
    pub command_log_capacity: usize,
    /// Entries kept in the event trace ring.
    pub event_trace_capacity: usize,
    /// Root RNG seed. `None` seeds from the wall clock.
    pub rng_seed: Option<Seed>,
    /// Live state schema version.
    pub state_version: String,
    /// Algorithm used for new snapshots.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// Node expansions allowed during migration path search.
    pub migration_max_steps: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            scheduler: SchedulerConfig::default(),
            command_log_capacity: 256,
            event_trace_capacity: 128,
            rng_seed: None,
            state_version: "1".to_owned(),
            checksum_algorithm: ChecksumAlgorithm::default(),
            migration_max_steps: 64,
        }
    }
}

impl KernelConfig {
    /// Parse and [`validate`](Self::validate) a JSON configuration document.
    ///
    /// # Errors
    ///
    /// `invalid-config` if the document does not parse or a value is out of
    /// range.
    pub fn from_json_str(text: &str) -> Result<Self, KernelError> {
        let config: Self = serde_json::from_str(text).map_err(KernelError::InvalidConfig)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value [`Kernel::new`](crate::kernel::Kernel::new) asserts.
    ///
    /// # Errors
    ///
    /// [`KernelError::ConfigOutOfRange`] naming the first offending field.
    pub fn validate(&self) -> Result<(), KernelError> {
        let out_of_range = |field: &'static str, reason: String| {
            Err(KernelError::ConfigOutOfRange { field, reason })
        };
        if !is_positive_finite(self.clock.time_scale) {
            return out_of_range(
                "clock.time_scale",
                format!("must be positive and finite, got {}", self.clock.time_scale),
            );
        }
        if let Some(step) = self.clock.fixed_step_ms {
            if !is_positive_finite(step) {
                return out_of_range(
                    "clock.fixed_step_ms",
                    format!("must be positive and finite, got {step}"),
                );
            }
        }
        if self.scheduler.max_runs_per_pump == 0 {
            return out_of_range("scheduler.max_runs_per_pump", "must be positive".into());
        }
        if self.scheduler.max_tasks == 0 {
            return out_of_range("scheduler.max_tasks", "must be positive".into());
        }
        if self.migration_max_steps == 0 {
            return out_of_range("migration_max_steps", "must be positive".into());
        }
        Ok(())
    }

    /// Builder-style seed override.
    pub fn with_seed(mut self, seed: impl Into<Seed>) -> Self {
        self.rng_seed = Some(seed.into());
        self
    }

    /// Assert the values [`Kernel::new`](crate::kernel::Kernel::new) relies on.
    ///
    /// # Panics
    ///
    /// Panics on any value [`validate`](Self::validate) rejects.
    pub(crate) fn assert_valid(&self) {
        if let Err(e) = self.validate() {
            panic!("{e}");
        }
    }
}

fn is_positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = KernelConfig::default();
        assert_eq!(config.scheduler.max_runs_per_pump, 1000);
        assert_eq!(config.scheduler.max_tasks, 10_000);
        assert_eq!(config.event_trace_capacity, 128);
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Fnv1a32);
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn nested_sections_parse() {
        let config = KernelConfig::from_json_str(
            r#"{
                "clock": { "time_scale": 2.0, "fixed_step_ms": 16.0 },
                "scheduler": { "max_tasks": 5 },
                "rng_seed": "campaign-7",
                "checksum_algorithm": "blake3"
            }"#,
        )
        .unwrap();
        assert_eq!(config.clock.time_scale, 2.0);
        assert_eq!(config.clock.fixed_step_ms, Some(16.0));
        assert_eq!(config.scheduler.max_tasks, 5);
        assert_eq!(config.scheduler.max_runs_per_pump, 1000);
        assert_eq!(config.rng_seed, Some(Seed::Text("campaign-7".into())));
        assert_eq!(config.checksum_algorithm, ChecksumAlgorithm::Blake3);
    }

    #[test]
    fn bad_document_is_an_error() {
        let err = KernelConfig::from_json_str(r#"{ "command_log_capacity": "lots" }"#).unwrap_err();
        assert_eq!(err.code(), "invalid-config");
    }

    #[test]
    fn out_of_range_values_are_rejected_at_parse() {
        for (text, field) in [
            (r#"{ "scheduler": { "max_tasks": 0 } }"#, "scheduler.max_tasks"),
            (r#"{ "scheduler": { "max_runs_per_pump": 0 } }"#, "scheduler.max_runs_per_pump"),
            (r#"{ "clock": { "time_scale": 0 } }"#, "clock.time_scale"),
            (r#"{ "clock": { "fixed_step_ms": -16.0 } }"#, "clock.fixed_step_ms"),
            (r#"{ "migration_max_steps": 0 }"#, "migration_max_steps"),
        ] {
            let err = KernelConfig::from_json_str(text).unwrap_err();
            assert_eq!(err.code(), "invalid-config", "{text}");
            assert_eq!(err.details()["field"], field, "{text}");
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(KernelConfig::default().validate().is_ok());
    }
}
