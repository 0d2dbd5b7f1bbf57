//! Physical and run constants for the pendulum ensemble
//!
//! Defaults used when no configuration overrides them.

/// Standard gravity (m/s²)
pub const GRAVITY: f32 = 9.80665;

/// Fixed integration time step (seconds)
pub const TIME_STEP: f32 = 0.003;

/// Number of simulated double pendulums
pub const INSTANCE_COUNT: usize = 81920;

/// Work-items per work-group.
/// 256 is the default `max_compute_invocations_per_workgroup` in wgpu, and
/// divides `INSTANCE_COUNT` evenly.
pub const WORKGROUP_SIZE: u32 = 256;

/// Rod length (metres) used for the default initial conditions
pub const DEFAULT_LENGTH: f32 = 1.0;

/// Bob mass (kg) used for the default initial conditions
pub const DEFAULT_MASS: f32 = 2.0;
