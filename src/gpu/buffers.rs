//! GPU buffer allocation and kernel parameter layouts.
//!
//! Allocations are wrapped in wgpu error scopes so that running out of VRAM
//! surfaces as `GpuError::OutOfMemory` instead of an uncaptured error.

use crate::config::ElementType;
use crate::error::GpuError;
use crate::gpu::shaders::WORKGROUP_SIZE;
use crate::traits::DeviceBuffer;
use pollster::block_on;
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Device};

/// Parameters for the elementwise shaders.
/// Must match the Params struct in elementwise.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ElementwiseParams {
    /// Scalar operand (ignored by sin).
    pub value: f32,
    /// Number of elements in the bound range.
    pub len: u32,
    /// Invocations per dispatch row.
    pub row_width: u32,
    /// Padding for 16-byte alignment.
    pub _padding: u32,
}

/// Must match the Dims struct in matmul.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatmulDims {
    pub n: u32,
    pub _padding: [u32; 3],
}

/// Must match the Params struct in reduce.wgsl.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ReduceParams {
    pub len: u32,
    pub row_width: u32,
    pub _padding: [u32; 2],
}

/// A device-resident storage buffer.
#[derive(Debug)]
pub struct GpuBuffer {
    buffer: Buffer,
    size: u64,
    element_type: ElementType,
}

impl GpuBuffer {
    pub fn new(buffer: Buffer, size: u64, element_type: ElementType) -> Self {
        Self {
            buffer,
            size,
            element_type,
        }
    }

    /// Returns a reference to the underlying wgpu buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Number of elements in the buffer.
    pub fn element_count(&self) -> u64 {
        self.size / self.element_type.size_bytes()
    }

    /// Releases the device memory immediately.
    pub fn destroy(self) {
        self.buffer.destroy();
    }
}

impl DeviceBuffer for GpuBuffer {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }
}

/// Storage buffers are bound in multiples of 4 bytes.
pub fn padded_size(bytes: u64) -> u64 {
    bytes.div_ceil(4) * 4
}

/// Creates a storage buffer, reporting allocation failure as an error.
///
/// # Errors
///
/// Returns `GpuError::BufferTooLarge` when `size` exceeds the device's
/// `max_buffer_size`, and `GpuError::OutOfMemory` when the driver cannot
/// back the buffer.
pub fn create_storage_buffer(device: &Device, label: &str, size: u64) -> Result<Buffer, GpuError> {
    let size = padded_size(size);
    check_buffer_size(device, size)?;
    capture_allocation(device, size, || {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    })
}

/// Creates a storage buffer holding `contents`.
pub fn create_storage_buffer_init(
    device: &Device,
    label: &str,
    contents: &[u8],
) -> Result<Buffer, GpuError> {
    let size = contents.len() as u64;
    check_buffer_size(device, size)?;
    capture_allocation(device, size, || {
        device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
        })
    })
}

/// Creates a small uniform buffer holding `params`.
pub fn create_uniform<T: bytemuck::Pod>(device: &Device, label: &str, params: &T) -> Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents: bytemuck::bytes_of(params),
        usage: BufferUsages::UNIFORM,
    })
}

/// Creates a CPU-readable staging buffer of `size` bytes.
pub fn create_staging_buffer(device: &Device, label: &str, size: u64) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn check_buffer_size(device: &Device, size: u64) -> Result<(), GpuError> {
    let max = device.limits().max_buffer_size;
    if size > max {
        return Err(GpuError::BufferTooLarge {
            requested: size,
            max,
        });
    }
    Ok(())
}

fn capture_allocation(
    device: &Device,
    size: u64,
    create: impl FnOnce() -> Buffer,
) -> Result<Buffer, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let buffer = create();
    let oom = block_on(device.pop_error_scope());
    let validation = block_on(device.pop_error_scope());

    if oom.is_some() {
        buffer.destroy();
        return Err(GpuError::OutOfMemory { requested: size });
    }
    if let Some(err) = validation {
        buffer.destroy();
        return Err(GpuError::Validation(err.to_string()));
    }
    Ok(buffer)
}

/// Workgroup grid covering `invocations`, split across two dimensions when
/// one would exceed `max_per_dim` workgroups.
///
/// Returns `(x, y, row_width)` where `row_width` is the number of
/// invocations in one row of the grid.
pub fn dispatch_grid(invocations: u64, max_per_dim: u32) -> (u32, u32, u32) {
    let groups = invocations.div_ceil(WORKGROUP_SIZE as u64).max(1);
    let x = groups.min(max_per_dim as u64);
    let y = groups.div_ceil(x);
    (x as u32, y as u32, x as u32 * WORKGROUP_SIZE)
}

/// Byte ranges covering a buffer of `size` bytes, each at most `max_binding`
/// long and starting at a multiple of `alignment`.
pub fn binding_chunks(size: u64, max_binding: u64, alignment: u64) -> Vec<(u64, u64)> {
    let step = (max_binding / alignment * alignment).max(alignment);
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < size {
        let len = step.min(size - offset);
        chunks.push((offset, len));
        offset += len;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::gpu::device::stress_adapters;

    fn setup_device() -> Option<Device> {
        let adapter = stress_adapters().into_iter().next()?;

        let (device, _queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("test device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .ok()?;

        Some(device)
    }

    #[test]
    fn test_params_sizes() {
        // Uniforms must be 16 bytes for GPU alignment
        assert_eq!(std::mem::size_of::<ElementwiseParams>(), 16);
        assert_eq!(std::mem::size_of::<MatmulDims>(), 16);
        assert_eq!(std::mem::size_of::<ReduceParams>(), 16);
    }

    #[test]
    fn test_padded_size() {
        assert_eq!(padded_size(0), 0);
        assert_eq!(padded_size(2), 4);
        assert_eq!(padded_size(8), 8);
    }

    #[test]
    fn test_dispatch_grid_single_row() {
        let (x, y, row_width) = dispatch_grid(1000, 65535);
        assert_eq!((x, y), (4, 1));
        assert_eq!(row_width, 1024);
    }

    #[test]
    fn test_dispatch_grid_wraps_rows() {
        let invocations = 65535u64 * 256 * 2 + 1;
        let (x, y, row_width) = dispatch_grid(invocations, 65535);
        assert_eq!(x, 65535);
        assert_eq!(y, 3);
        assert!(x as u64 * y as u64 * 256 >= invocations);
        assert_eq!(row_width, 65535 * 256);
    }

    #[test]
    fn test_binding_chunks_cover_buffer() {
        let chunks = binding_chunks(300 * MIB, 128 * MIB, 256);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], (0, 128 * MIB));
        assert_eq!(chunks[2], (256 * MIB, 44 * MIB));
        assert_eq!(chunks.iter().map(|(_, len)| len).sum::<u64>(), 300 * MIB);
        assert!(chunks.iter().all(|(offset, _)| offset % 256 == 0));
    }

    #[test]
    fn test_binding_chunks_small_buffer() {
        assert_eq!(binding_chunks(1024, 128 * MIB, 256), vec![(0, 1024)]);
        assert!(binding_chunks(0, 128 * MIB, 256).is_empty());
    }

    #[test]
    fn test_create_storage_buffer() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping storage buffer test");
            return;
        };

        let buffer = create_storage_buffer(&device, "test", 16 * MIB).unwrap();
        assert_eq!(buffer.size(), 16 * MIB);
        buffer.destroy();
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        let Some(device) = setup_device() else {
            println!("No GPU available, skipping oversized buffer test");
            return;
        };

        let too_big = device.limits().max_buffer_size + 4;
        let result = create_storage_buffer(&device, "too_big", too_big);
        assert!(matches!(result, Err(GpuError::BufferTooLarge { .. })));
    }
}
