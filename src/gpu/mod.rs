//! wgpu backend for the accelerator runtime.
//!
//! Works across Vulkan, Metal and DX12. Stress kernels are WGSL compute
//! shaders; device memory is probed by allocation since wgpu does not report
//! VRAM capacity.

pub mod accelerator;
pub mod buffers;
pub mod device;
pub mod shaders;

pub use accelerator::{WgpuDevice, WgpuPlatform};
pub use device::{enumerate_gpus, GpuInfo};
