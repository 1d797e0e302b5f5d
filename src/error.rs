//! Error types for the stress run.
//!
//! `VramfragError` is what the dispatcher and `main` see; `GpuError` is what an
//! accelerator backend reports.

use crate::config::ElementType;
use thiserror::Error;

/// Unified error type for vramfrag operations.
#[derive(Error, Debug)]
pub enum VramfragError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested device index is out of range.
    #[error("Invalid GPU id {index} ({available} device(s) available)")]
    InvalidDevice { index: usize, available: usize },

    /// Device-level failure.
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// A per-device worker thread panicked.
    #[error("Worker for GPU {0} panicked")]
    WorkerPanicked(usize),
}

/// GPU-specific errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// No GPU adapter found.
    #[error("No GPU adapter found")]
    NoAdapter,

    /// Specified GPU adapter not found.
    #[error("GPU adapter {index} not found (available: {available:?})")]
    AdapterNotFound {
        index: usize,
        available: Vec<String>,
    },

    /// Failed to request GPU device.
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),

    /// The device could not satisfy an allocation.
    #[error("Out of device memory: requested {requested} bytes")]
    OutOfMemory { requested: u64 },

    /// Allocation exceeds the largest buffer the device accepts.
    #[error("Buffer of {requested} bytes exceeds device limit of {max} bytes")]
    BufferTooLarge { requested: u64, max: u64 },

    /// Element type not supported by this device.
    #[error("Element type {0} is not supported by this device")]
    UnsupportedElementType(ElementType),

    /// Buffer mapping failed.
    #[error("Buffer mapping failed: {0}")]
    BufferMapping(String),

    /// GPU operation timed out.
    #[error("GPU operation timed out after {0} seconds")]
    Timeout(u64),

    /// GPU device lost during the run.
    #[error("GPU device lost during stress run (possible driver crash or timeout)")]
    DeviceLost,

    /// Validation error raised by the GPU runtime.
    #[error("GPU validation error: {0}")]
    Validation(String),
}

impl GpuError {
    /// Returns true for failures the fragmenter recovers from by shrinking
    /// its block sizes.
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            GpuError::OutOfMemory { .. } | GpuError::BufferTooLarge { .. }
        )
    }
}
