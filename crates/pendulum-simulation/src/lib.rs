//! # Pendulum Simulation Engine
//!
//! GPU-based double pendulum ensemble: device selection, buffer and kernel
//! management, stepping, read-back and adaptive step pacing.

pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod pacer;
pub mod params;

pub use context::ComputeContext;
pub use device::{select_best_device, DeviceInfo, SelectedDevice};
pub use engine::*;
pub use error::*;
pub use pacer::*;
pub use params::*;
