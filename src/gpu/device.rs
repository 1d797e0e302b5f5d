//! GPU device enumeration and memory probing.
//!
//! This module lists the adapters a stress run can target and estimates how
//! much memory each one can hold, since wgpu does not report VRAM size.

use crate::config::{GIB, MIB};
use crate::gpu::buffers::create_storage_buffer;
use wgpu::{Adapter, Backend, Backends, Device, DeviceType, Instance, InstanceDescriptor};

/// Largest single probe allocation.
const PROBE_CHUNK: u64 = GIB;

/// Smallest probe allocation tried after a failure.
const PROBE_MIN_CHUNK: u64 = 64 * MIB;

/// Probing stops at this total even if allocations keep succeeding.
const PROBE_CAP: u64 = 256 * GIB;

/// Information about an available GPU.
#[derive(Debug, Clone)]
pub struct GpuInfo {
    /// Index in the enumerated list.
    pub index: usize,
    /// GPU name (e.g., "NVIDIA GeForce RTX 4090").
    pub name: String,
    /// Vendor name (e.g., "NVIDIA").
    pub vendor: String,
    /// Graphics API backend (Vulkan, Metal, DX12, etc.).
    pub backend: Backend,
    /// Device type (discrete, integrated, virtual, etc.).
    pub device_type: DeviceType,
    /// Driver version string.
    pub driver: String,
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {} ({:?}, {:?}, driver {})",
            self.index, self.vendor, self.name, self.backend, self.device_type, self.driver
        )
    }
}

impl GpuInfo {
    pub(crate) fn from_adapter(index: usize, adapter: &Adapter) -> Self {
        let info = adapter.get_info();
        GpuInfo {
            index,
            name: info.name,
            vendor: vendor_name(info.vendor),
            backend: info.backend,
            device_type: info.device_type,
            driver: info.driver,
        }
    }
}

/// Adapters a stress run can target, in index order.
///
/// Only primary backends are considered so that one physical GPU is not
/// listed once per API, and software rasterizers are skipped.
pub fn stress_adapters() -> Vec<Adapter> {
    let instance = Instance::new(&InstanceDescriptor::default());
    instance
        .enumerate_adapters(Backends::PRIMARY)
        .into_iter()
        .filter(|adapter| adapter.get_info().device_type != DeviceType::Cpu)
        .collect()
}

/// Enumerate all GPUs a stress run can target.
///
/// Returns a list of `GpuInfo` structs describing each one.
/// The list may be empty if no GPUs are available.
pub fn enumerate_gpus() -> Vec<GpuInfo> {
    stress_adapters()
        .iter()
        .enumerate()
        .map(|(index, adapter)| GpuInfo::from_adapter(index, adapter))
        .collect()
}

/// Estimates device memory by allocating buffers until one fails.
///
/// Chunks start at `min(1 GiB, max_buffer_size)` and are halved after each
/// failure down to 64 MiB. Every probe buffer is destroyed before returning.
pub fn probe_total_memory(device: &Device) -> u64 {
    let mut chunk = PROBE_CHUNK.min(device.limits().max_buffer_size);
    let mut probes = Vec::new();
    let mut total = 0u64;

    while total < PROBE_CAP {
        match create_storage_buffer(device, "memory_probe", chunk) {
            Ok(buffer) => {
                total += chunk;
                probes.push(buffer);
            }
            Err(_) if chunk / 2 >= PROBE_MIN_CHUNK => chunk /= 2,
            Err(_) => break,
        }
    }

    for buffer in probes {
        buffer.destroy();
    }
    log::debug!("Probed {} bytes of device memory", total);
    total
}

/// Convert vendor ID to human-readable name.
fn vendor_name(vendor_id: u32) -> String {
    match vendor_id {
        0x1002 => "AMD".to_string(),
        0x1010 => "ImgTec".to_string(),
        0x10DE => "NVIDIA".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        _ => format!("Unknown (0x{:04X})", vendor_id),
    }
}
