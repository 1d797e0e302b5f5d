//! Core traits for the accelerator runtime.
//!
//! The fragmenter and compute driver only talk to a device through
//! `Accelerator`, and the dispatcher only discovers devices through
//! `Platform`. The wgpu backend implements both; tests use a fake.

use crate::config::ElementType;
use crate::error::GpuError;
use rand::Rng;
use std::fmt;

/// Identity and capacity of an opened device, queried once at start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Index in the platform's device list.
    pub index: usize,
    /// Display name (e.g., "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Total memory capacity in bytes.
    pub total_memory: u64,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} ({})",
            self.index,
            self.name,
            bytesize::ByteSize::b(self.total_memory)
        )
    }
}

/// A device-resident buffer.
pub trait DeviceBuffer {
    /// Size of the buffer in bytes.
    fn size_bytes(&self) -> u64;

    /// Element type stored in the buffer.
    fn element_type(&self) -> ElementType;
}

/// Operations the stress loop needs from one device.
///
/// Compute operations are queued; only `synchronize` is guaranteed to wait
/// for them.
pub trait Accelerator {
    type Buffer: DeviceBuffer;

    /// Returns information about this device.
    fn info(&self) -> &DeviceInfo;

    /// Allocates a buffer of `bytes` rounded down to whole elements.
    ///
    /// # Errors
    ///
    /// Returns `GpuError::OutOfMemory` or `GpuError::BufferTooLarge` when the
    /// device cannot hold the buffer.
    fn allocate(&mut self, bytes: u64, element_type: ElementType)
        -> Result<Self::Buffer, GpuError>;

    /// Releases a buffer.
    fn free(&mut self, buffer: Self::Buffer);

    /// Allocates a `dim` x `dim` f32 matrix filled uniformly from `[0, 1)`.
    fn random_matrix<R: Rng + ?Sized>(
        &mut self,
        dim: usize,
        rng: &mut R,
    ) -> Result<Self::Buffer, GpuError>;

    /// Adds `value` to every element in place.
    fn add_scalar(&mut self, buffer: &Self::Buffer, value: f32) -> Result<(), GpuError>;

    /// Multiplies every element by `value` in place.
    fn mul_scalar(&mut self, buffer: &Self::Buffer, value: f32) -> Result<(), GpuError>;

    /// Replaces every element with its sine.
    fn sin(&mut self, buffer: &Self::Buffer) -> Result<(), GpuError>;

    /// Writes `a * b` into `out`; all three are `dim` x `dim` f32 matrices.
    fn matmul(
        &mut self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        out: &Self::Buffer,
        dim: usize,
    ) -> Result<(), GpuError>;

    /// Reduces every element of `buffer` to a single sum on the device.
    fn sum(&mut self, buffer: &Self::Buffer) -> Result<(), GpuError>;

    /// Blocks until all queued work has completed.
    fn synchronize(&mut self) -> Result<(), GpuError>;

    /// Highest number of bytes allocated at once since the device was opened.
    fn peak_allocated(&self) -> u64;

    /// Largest buffer a single kernel can bind.
    fn max_binding_bytes(&self) -> u64 {
        u64::MAX
    }
}

/// Enumerates devices and opens them for exclusive use by one worker.
pub trait Platform: Sync {
    type Device: Accelerator;

    /// Number of devices available.
    fn device_count(&self) -> usize;

    /// Opens the device at `index`.
    fn open(&self, index: usize) -> Result<Self::Device, GpuError>;
}
