//! Run configuration
//!
//! Every section falls back to the reference run
//! (81920 pendulums, 3 ms steps, one step every 15 ms), so a TOML file only
//! needs the values it changes.

use crate::{EngineError, EngineResult};
use pendulum_physics::{GRAVITY, INSTANCE_COUNT, TIME_STEP, WORKGROUP_SIZE};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub engine: EngineConfig,
    pub pacer: PacerConfig,
    pub driver: DriverConfig,
}

/// Construction parameters of the engine, fixed for the process lifetime
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instance_count: u32,
    pub workgroup_size: u32,
    /// Integration time step Δt (seconds)
    pub time_step: f32,
    /// Gravitational acceleration g (m/s²)
    pub gravity: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_count: INSTANCE_COUNT as u32,
            workgroup_size: WORKGROUP_SIZE,
            time_step: TIME_STEP,
            gravity: GRAVITY,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.instance_count == 0 {
            return Err(EngineError::InvalidConfig(
                "instance_count must be positive".into(),
            ));
        }
        if self.workgroup_size == 0 {
            return Err(EngineError::InvalidConfig(
                "workgroup_size must be positive".into(),
            ));
        }
        if self.instance_count % self.workgroup_size != 0 {
            return Err(EngineError::InvalidWorkRange {
                total_work: self.instance_count,
                group_size: self.workgroup_size,
            });
        }
        if !self.time_step.is_finite() || self.time_step < 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "time_step must be finite and non-negative, got {}",
                self.time_step
            )));
        }
        if !self.gravity.is_finite() {
            return Err(EngineError::InvalidConfig(format!(
                "gravity must be finite, got {}",
                self.gravity
            )));
        }
        Ok(())
    }
}

/// Tunables of the adaptive catch-up loop.
///
/// These are heuristics, not derived control constants.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PacerConfig {
    /// Per-step time budget
    pub target_step_nanos: u64,
    /// Consecutive on-time steps before one unit of correction is released
    pub relax_after: u64,
    /// Sleep reduction per unit of correction
    pub correction_unit_nanos: u64,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_step_nanos: 15_000_000,
            relax_after: 50_000,
            correction_unit_nanos: 1_000_000,
        }
    }
}

impl PacerConfig {
    pub fn target_step(&self) -> Duration {
        Duration::from_nanos(self.target_step_nanos)
    }

    pub fn correction_unit(&self) -> Duration {
        Duration::from_nanos(self.correction_unit_nanos)
    }
}

/// Settings of the headless driver binary
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Stop after this many seconds; 0 runs until the process is killed
    pub run_for_secs: u64,
    /// Interval between state read-backs by the consumer
    pub sync_interval_ms: u64,
    /// Interval between status reports
    pub status_interval_secs: u64,
    /// Half-width of the uniform jitter applied to the initial angles
    pub initial_jitter: f32,
    /// Number of instances sampled by the consumer on each read-back
    pub sample_count: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            run_for_secs: 60,
            sync_interval_ms: 16,
            status_interval_secs: 10,
            initial_jitter: 0.05,
            sample_count: 64,
        }
    }
}

impl SimulationConfig {
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| EngineError::InvalidConfig(e.to_string()))?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }
}
