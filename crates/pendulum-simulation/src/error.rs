//! Engine error taxonomy

use pendulum_physics::{Field, SizeMismatch};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no compute device available that supports the pendulum kernel")]
    NoDeviceAvailable,

    #[error("failed to create device context: {0}")]
    Context(String),

    #[error("failed to allocate buffer {label}: {reason}")]
    Allocation { label: String, reason: String },

    #[error("kernel compilation failed:\n{0}")]
    Compile(String),

    #[error("transfer of {field} failed: {reason}")]
    Transfer { field: Field, reason: String },

    #[error("kernel launch failed: {0}")]
    Launch(String),

    #[error("device failure: {0}")]
    Device(String),

    #[error("invalid work range: {total_work} work-items in groups of {group_size}")]
    InvalidWorkRange { total_work: u32, group_size: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(#[from] SizeMismatch),

    #[error("engine has been closed")]
    Closed,
}
