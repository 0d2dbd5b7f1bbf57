//! # Pendulum Physics
//!
//! Host-side data model for an ensemble of independent double pendulums:
//! physical constants, the column-oriented state store and a CPU reference
//! of the integration scheme run by the compute kernel.

pub mod constants;
pub mod integrator;
pub mod state;

pub use constants::*;
pub use integrator::*;
pub use state::*;
