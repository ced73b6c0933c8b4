//! Virtual clock with a time-scale factor and an optional fixed step.
//!
//! The clock only moves when [`Clock::advance`] is called. Time is measured in
//! milliseconds as `f64`, matching the delta a host frame loop usually hands
//! in.

use serde::{Deserialize, Serialize};

use crate::CoreError;

// ---------------------------------------------------------------------------
// ClockConfig
// ---------------------------------------------------------------------------

/// Configuration for [`Clock`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Multiplier applied to every advance. Must be positive and finite.
    pub time_scale: f64,
    /// When set, every advance uses this step instead of the caller's delta.
    pub fixed_step_ms: Option<f64>,
}

impl Default for ClockConfig {
    /// Real-time scale, variable step.
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            fixed_step_ms: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Holds virtual time and advances it on demand.
#[derive(Debug, Clone)]
pub struct Clock {
    now: f64,
    time_scale: f64,
    fixed_step_ms: Option<f64>,
    ticks: u64,
}

impl Clock {
    /// Create a clock at time zero.
    ///
    /// # Panics
    ///
    /// Panics if `time_scale` or `fixed_step_ms` is not positive and finite.
    pub fn new(config: ClockConfig) -> Self {
        assert!(
            is_positive_finite(config.time_scale),
            "time_scale must be positive and finite, got {}",
            config.time_scale
        );
        if let Some(step) = config.fixed_step_ms {
            assert!(
                is_positive_finite(step),
                "fixed_step_ms must be positive and finite, got {step}"
            );
        }
        Self {
            now: 0.0,
            time_scale: config.time_scale,
            fixed_step_ms: config.fixed_step_ms,
            ticks: 0,
        }
    }

    /// Advance virtual time and return the delta actually applied.
    ///
    /// The fixed step, if configured, replaces `dt`. The result is scaled by
    /// the time scale. Negative or non-finite input applies nothing.
    pub fn advance(&mut self, dt: f64) -> f64 {
        let raw = self.fixed_step_ms.unwrap_or(dt);
        let applied = if raw.is_finite() && raw > 0.0 {
            raw * self.time_scale
        } else {
            0.0
        };
        self.now += applied;
        self.ticks += 1;
        applied
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> f64 {
        self.now
    }

    /// Number of calls to [`advance`](Self::advance) so far.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn time_scale(&self) -> f64 {
        self.time_scale
    }

    /// Change the time scale.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidTimeScale`] if `scale` is not positive and
    /// finite; the previous scale is kept.
    pub fn set_time_scale(&mut self, scale: f64) -> Result<(), CoreError> {
        if !is_positive_finite(scale) {
            return Err(CoreError::InvalidTimeScale { scale });
        }
        self.time_scale = scale;
        Ok(())
    }

    pub fn fixed_step_ms(&self) -> Option<f64> {
        self.fixed_step_ms
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(ClockConfig::default())
    }
}

fn is_positive_finite(value: f64) -> bool {
    value > 0.0 && value.is_finite()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_applies_caller_delta() {
        let mut clock = Clock::default();
        assert_eq!(clock.advance(16.0), 16.0);
        assert_eq!(clock.advance(4.0), 4.0);
        assert_eq!(clock.now(), 20.0);
        assert_eq!(clock.ticks(), 2);
    }

    #[test]
    fn time_scale_multiplies_delta() {
        let mut clock = Clock::new(ClockConfig {
            time_scale: 0.5,
            ..Default::default()
        });
        assert_eq!(clock.advance(100.0), 50.0);
        clock.set_time_scale(2.0).unwrap();
        assert_eq!(clock.advance(100.0), 200.0);
        assert_eq!(clock.now(), 250.0);
    }

    #[test]
    fn fixed_step_overrides_delta() {
        let mut clock = Clock::new(ClockConfig {
            time_scale: 2.0,
            fixed_step_ms: Some(10.0),
        });
        assert_eq!(clock.advance(999.0), 20.0);
        assert_eq!(clock.now(), 20.0);
    }

    #[test]
    fn negative_and_nan_deltas_apply_nothing() {
        let mut clock = Clock::default();
        assert_eq!(clock.advance(-5.0), 0.0);
        assert_eq!(clock.advance(f64::NAN), 0.0);
        assert_eq!(clock.now(), 0.0);
    }

    #[test]
    fn rejects_bad_time_scale() {
        let mut clock = Clock::default();
        assert!(matches!(
            clock.set_time_scale(0.0),
            Err(CoreError::InvalidTimeScale { .. })
        ));
        assert!(clock.set_time_scale(f64::INFINITY).is_err());
        assert_eq!(clock.time_scale(), 1.0);
    }

    #[test]
    #[should_panic(expected = "time_scale must be positive")]
    fn zero_scale_config_panics() {
        let _clock = Clock::new(ClockConfig {
            time_scale: 0.0,
            ..Default::default()
        });
    }
}
