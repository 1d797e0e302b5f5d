//! WGSL shader management for the stress kernels.
//!
//! This module compiles the elementwise, matmul and reduction shaders and
//! builds their compute pipelines.

use wgpu::{BindGroupLayout, ComputePipeline, Device};

/// WGSL source for the f32 elementwise kernels.
pub const ELEMENTWISE_WGSL: &str = include_str!("../shaders/elementwise.wgsl");

/// WGSL source for the f16 block touch kernels.
pub const ELEMENTWISE_F16_WGSL: &str = include_str!("../shaders/elementwise_f16.wgsl");

/// WGSL source for the tiled matmul kernel.
pub const MATMUL_WGSL: &str = include_str!("../shaders/matmul.wgsl");

/// WGSL source for one tree-reduction pass.
pub const REDUCE_WGSL: &str = include_str!("../shaders/reduce.wgsl");

/// Workgroup size used by the elementwise and reduction shaders.
/// Must match the @workgroup_size in those WGSL files.
pub const WORKGROUP_SIZE: u32 = 256;

/// Edge of the square matmul tile. Must match TILE in matmul.wgsl.
pub const MATMUL_TILE: u32 = 16;

/// Elementwise kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
    Add,
    Mul,
    Sin,
}

impl ElementwiseOp {
    fn entry_point(&self) -> &'static str {
        match self {
            Self::Add => "add_scalar",
            Self::Mul => "mul_scalar",
            Self::Sin => "sin_inplace",
        }
    }
}

struct ElementwisePipelines {
    add: ComputePipeline,
    mul: ComputePipeline,
    sin: Option<ComputePipeline>,
}

impl ElementwisePipelines {
    fn get(&self, op: ElementwiseOp) -> Option<&ComputePipeline> {
        match op {
            ElementwiseOp::Add => Some(&self.add),
            ElementwiseOp::Mul => Some(&self.mul),
            ElementwiseOp::Sin => self.sin.as_ref(),
        }
    }
}

/// Manages shader modules and compute pipelines for the stress loop.
pub struct ShaderManager {
    elementwise_layout: BindGroupLayout,
    matmul_layout: BindGroupLayout,
    reduce_layout: BindGroupLayout,
    elementwise_f32: ElementwisePipelines,
    /// Only present when the device has `SHADER_F16`.
    elementwise_f16: Option<ElementwisePipelines>,
    matmul: ComputePipeline,
    reduce: ComputePipeline,
}

impl ShaderManager {
    /// Compiles every shader and builds its pipeline.
    ///
    /// The f16 kernels are only compiled when `with_f16` is set, since their
    /// module does not validate on devices without `SHADER_F16`.
    pub fn new(device: &Device, with_f16: bool) -> Self {
        // @binding(0) uniform params, @binding(1) read_write data
        let elementwise_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("elementwise_bind_group_layout"),
            entries: &[uniform_entry(0), storage_entry(1, false)],
        });

        // @binding(0) uniform dims, @binding(1..2) read a/b, @binding(3) read_write product
        let matmul_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("matmul_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });

        // @binding(0) uniform params, @binding(1) read values, @binding(2) read_write partials
        let reduce_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("reduce_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, false),
            ],
        });

        let elementwise = |module: &wgpu::ShaderModule, op: ElementwiseOp| {
            create_pipeline(device, &elementwise_layout, module, op.entry_point())
        };

        let elementwise_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("elementwise"),
            source: wgpu::ShaderSource::Wgsl(ELEMENTWISE_WGSL.into()),
        });
        let elementwise_f32 = ElementwisePipelines {
            add: elementwise(&elementwise_module, ElementwiseOp::Add),
            mul: elementwise(&elementwise_module, ElementwiseOp::Mul),
            sin: Some(elementwise(&elementwise_module, ElementwiseOp::Sin)),
        };

        let elementwise_f16 = with_f16.then(|| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("elementwise_f16"),
                source: wgpu::ShaderSource::Wgsl(ELEMENTWISE_F16_WGSL.into()),
            });
            ElementwisePipelines {
                add: elementwise(&module, ElementwiseOp::Add),
                mul: elementwise(&module, ElementwiseOp::Mul),
                sin: None,
            }
        });

        let matmul_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("matmul"),
            source: wgpu::ShaderSource::Wgsl(MATMUL_WGSL.into()),
        });
        let matmul = create_pipeline(device, &matmul_layout, &matmul_module, "matmul");

        let reduce_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("reduce"),
            source: wgpu::ShaderSource::Wgsl(REDUCE_WGSL.into()),
        });
        let reduce = create_pipeline(device, &reduce_layout, &reduce_module, "reduce_sum");

        Self {
            elementwise_layout,
            matmul_layout,
            reduce_layout,
            elementwise_f32,
            elementwise_f16,
            matmul,
            reduce,
        }
    }

    /// Pipeline for `op` on f32 data, or on f16 data when `half` is set.
    ///
    /// Returns `None` for combinations the device cannot run.
    pub fn elementwise(&self, op: ElementwiseOp, half: bool) -> Option<&ComputePipeline> {
        if half {
            self.elementwise_f16.as_ref()?.get(op)
        } else {
            self.elementwise_f32.get(op)
        }
    }

    /// Returns true if f16 kernels were compiled.
    pub fn supports_f16(&self) -> bool {
        self.elementwise_f16.is_some()
    }

    pub fn matmul_pipeline(&self) -> &ComputePipeline {
        &self.matmul
    }

    pub fn reduce_pipeline(&self) -> &ComputePipeline {
        &self.reduce
    }

    pub fn elementwise_layout(&self) -> &BindGroupLayout {
        &self.elementwise_layout
    }

    pub fn matmul_layout(&self) -> &BindGroupLayout {
        &self.matmul_layout
    }

    pub fn reduce_layout(&self) -> &BindGroupLayout {
        &self.reduce_layout
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn create_pipeline(
    device: &Device,
    layout: &BindGroupLayout,
    module: &wgpu::ShaderModule,
    entry_point: &str,
) -> ComputePipeline {
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(entry_point),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(entry_point),
        layout: Some(&pipeline_layout),
        module,
        entry_point: Some(entry_point),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::device::stress_adapters;
    use pollster::block_on;

    fn setup_device() -> Option<(wgpu::Device, wgpu::Queue)> {
        let adapter = stress_adapters().into_iter().next()?;

        let (device, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("test device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .ok()?;

        Some((device, queue))
    }

    #[test]
    fn test_workgroup_size_constant() {
        assert_eq!(WORKGROUP_SIZE, 256);
        assert!(ELEMENTWISE_WGSL.contains("@workgroup_size(256)"));
        assert!(REDUCE_WGSL.contains("@workgroup_size(256)"));
    }

    #[test]
    fn test_matmul_tile_matches_shader() {
        assert_eq!(MATMUL_TILE, 16);
        assert!(MATMUL_WGSL.contains("const TILE: u32 = 16u;"));
    }

    #[test]
    fn test_reduce_store_bounded_by_partials() {
        assert!(REDUCE_WGSL.contains("slot < arrayLength(&partials)"));
    }

    #[test]
    fn test_entry_points_present() {
        for op in [ElementwiseOp::Add, ElementwiseOp::Mul, ElementwiseOp::Sin] {
            assert!(ELEMENTWISE_WGSL.contains(op.entry_point()));
        }
        assert!(ELEMENTWISE_F16_WGSL.contains("enable f16;"));
    }

    #[test]
    fn test_shader_manager_creation() {
        let Some((device, _queue)) = setup_device() else {
            println!("No GPU available, skipping shader manager test");
            return;
        };

        let manager = ShaderManager::new(&device, false);
        assert!(!manager.supports_f16());
        assert!(manager.elementwise(ElementwiseOp::Add, false).is_some());
        assert!(manager.elementwise(ElementwiseOp::Sin, false).is_some());
        assert!(manager.elementwise(ElementwiseOp::Add, true).is_none());
        let _ = manager.matmul_pipeline();
        let _ = manager.reduce_pipeline();
    }
}
