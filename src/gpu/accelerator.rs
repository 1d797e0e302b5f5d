//! wgpu implementation of the accelerator runtime.
//!
//! Kernels are recorded into a pending command encoder and submitted at each
//! reduction and at synchronization points. Validation errors raised between
//! two synchronization points are captured in an error scope and reported by
//! `synchronize`.

use crate::config::ElementType;
use crate::error::GpuError;
use crate::gpu::buffers::{
    binding_chunks, create_staging_buffer, create_storage_buffer, create_storage_buffer_init,
    create_uniform, dispatch_grid, padded_size, ElementwiseParams, GpuBuffer, MatmulDims,
    ReduceParams,
};
use crate::gpu::device::{probe_total_memory, stress_adapters, GpuInfo};
use crate::gpu::shaders::{ElementwiseOp, ShaderManager, MATMUL_TILE, WORKGROUP_SIZE};
use crate::traits::{Accelerator, DeviceBuffer, DeviceInfo, Platform};
use pollster::block_on;
use rand::Rng;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wgpu::{Adapter, BindGroup, CommandEncoder, ComputePipeline, Device, Queue};

/// Size of the f32 reduction result.
const SUM_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// Every adapter a stress run can target.
pub struct WgpuPlatform {
    adapters: Vec<Adapter>,
    gpus: Vec<GpuInfo>,
    memory_override: Option<u64>,
    timeout: Duration,
}

impl WgpuPlatform {
    /// Enumerates adapters.
    ///
    /// `memory_override` replaces probing of device memory; `timeout_secs`
    /// bounds each synchronization.
    pub fn new(memory_override: Option<u64>, timeout_secs: u64) -> Self {
        let adapters = stress_adapters();
        let gpus = adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| GpuInfo::from_adapter(index, adapter))
            .collect();
        Self {
            adapters,
            gpus,
            memory_override,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl Platform for WgpuPlatform {
    type Device = WgpuDevice;

    fn device_count(&self) -> usize {
        self.adapters.len()
    }

    fn open(&self, index: usize) -> Result<WgpuDevice, GpuError> {
        let adapter = self.adapters.get(index).ok_or_else(|| GpuError::AdapterNotFound {
            index,
            available: self.gpus.iter().map(|g| g.name.clone()).collect(),
        })?;
        WgpuDevice::new(
            adapter,
            &self.gpus[index],
            self.memory_override,
            self.timeout,
        )
    }
}

/// Ping-pong buffers for the multi-pass sum.
struct ReduceScratch {
    len: u64,
    ping: wgpu::Buffer,
    pong: wgpu::Buffer,
}

/// One opened GPU.
pub struct WgpuDevice {
    device: Device,
    queue: Queue,
    info: DeviceInfo,
    shaders: ShaderManager,
    pending: Option<CommandEncoder>,
    reduce_scratch: Option<ReduceScratch>,
    /// Latest reduction result, copied out at synchronization.
    sum_result: wgpu::Buffer,
    sum_staging: wgpu::Buffer,
    validation_scope_open: bool,
    /// Sum read back at the latest synchronization.
    last_checksum: f32,
    lost: Arc<AtomicBool>,
    allocated: u64,
    peak: u64,
    max_binding: u64,
    binding_alignment: u64,
    max_workgroups: u32,
    timeout: Duration,
}

impl WgpuDevice {
    /// Requests a device with the adapter's full limits.
    ///
    /// # Errors
    ///
    /// Returns `GpuError::DeviceRequest` if device creation fails.
    pub fn new(
        adapter: &Adapter,
        gpu: &GpuInfo,
        memory_override: Option<u64>,
        timeout: Duration,
    ) -> Result<Self, GpuError> {
        let with_f16 = adapter.features().contains(wgpu::Features::SHADER_F16);
        let required_features = if with_f16 {
            wgpu::Features::SHADER_F16
        } else {
            wgpu::Features::empty()
        };

        let (device, queue) = block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("vramfrag"),
            required_features,
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::disabled(),
        }))
        .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        let index = gpu.index;
        device.set_device_lost_callback(move |reason, message| {
            log::error!("GPU {}: device lost ({:?}): {}", index, reason, message);
            lost_flag.store(true, Ordering::SeqCst);
        });

        let total_memory = match memory_override {
            Some(bytes) => bytes,
            None => probe_total_memory(&device),
        };
        let limits = device.limits();
        let shaders = ShaderManager::new(&device, with_f16);
        let sum_result = create_storage_buffer(&device, "sum_result", SUM_BYTES)?;
        let sum_staging = create_staging_buffer(&device, "sum_staging", SUM_BYTES);

        log::info!(
            "GPU {}: {} ({:?}), {} memory, f16 {}",
            gpu.index,
            gpu.name,
            gpu.backend,
            bytesize::ByteSize::b(total_memory),
            if with_f16 { "available" } else { "unavailable" }
        );

        Ok(Self {
            info: DeviceInfo {
                index: gpu.index,
                name: gpu.name.clone(),
                total_memory,
            },
            shaders,
            pending: None,
            reduce_scratch: None,
            sum_result,
            sum_staging,
            validation_scope_open: false,
            last_checksum: 0.0,
            lost,
            allocated: 0,
            peak: 0,
            max_binding: limits.max_storage_buffer_binding_size as u64,
            binding_alignment: limits.min_storage_buffer_offset_alignment as u64,
            max_workgroups: limits.max_compute_workgroups_per_dimension,
            timeout,
            device,
            queue,
        })
    }

    fn track_alloc(&mut self, bytes: u64) {
        self.allocated += bytes;
        self.peak = self.peak.max(self.allocated);
    }

    /// Opens a validation scope covering the work queued until the next sync.
    fn begin_work(&mut self) {
        if !self.validation_scope_open {
            self.device.push_error_scope(wgpu::ErrorFilter::Validation);
            self.validation_scope_open = true;
        }
    }

    fn encoder(&mut self) -> &mut CommandEncoder {
        self.begin_work();
        let device = &self.device;
        self.pending.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("stress_encoder"),
            })
        })
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.pending.take() {
            self.queue.submit(Some(encoder.finish()));
        }
    }

    fn record_pass(
        &mut self,
        label: &str,
        pipeline: &ComputePipeline,
        bind_group: &BindGroup,
        grid: (u32, u32),
    ) {
        let encoder = self.encoder();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(grid.0, grid.1, 1);
    }

    fn elementwise(
        &mut self,
        op: ElementwiseOp,
        buffer: &GpuBuffer,
        value: f32,
    ) -> Result<(), GpuError> {
        let element_type = buffer.element_type();
        let pipeline = self
            .shaders
            .elementwise(op, element_type == ElementType::F16)
            .ok_or(GpuError::UnsupportedElementType(element_type))?
            .clone();
        let element_size = element_type.size_bytes();
        let physical = padded_size(buffer.size_bytes());

        for (offset, len) in binding_chunks(physical, self.max_binding, self.binding_alignment) {
            let elements = (buffer.size_bytes().saturating_sub(offset)).min(len) / element_size;
            if elements == 0 {
                continue;
            }
            let (x, y, row_width) = dispatch_grid(elements, self.max_workgroups);
            let params = create_uniform(
                &self.device,
                "elementwise_params",
                &ElementwiseParams {
                    value,
                    len: elements as u32,
                    row_width,
                    _padding: 0,
                },
            );
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("elementwise_bind_group"),
                layout: self.shaders.elementwise_layout(),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: buffer.buffer(),
                            offset,
                            size: NonZeroU64::new(len),
                        }),
                    },
                ],
            });
            self.record_pass("elementwise_pass", &pipeline, &bind_group, (x, y));
        }
        Ok(())
    }

    fn check_lost(&self) -> Result<(), GpuError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(GpuError::DeviceLost);
        }
        Ok(())
    }

    fn check_binding(&self, buffer: &GpuBuffer) -> Result<(), GpuError> {
        let size = padded_size(buffer.size_bytes());
        if size > self.max_binding {
            return Err(GpuError::BufferTooLarge {
                requested: size,
                max: self.max_binding,
            });
        }
        Ok(())
    }

    /// Returns the ping/pong partial buffers for reducing `len` elements.
    fn scratch_for(&mut self, len: u64) -> Result<(wgpu::Buffer, wgpu::Buffer), GpuError> {
        if let Some(scratch) = self.reduce_scratch.as_ref().filter(|s| s.len == len) {
            return Ok((scratch.ping.clone(), scratch.pong.clone()));
        }
        let first = len.div_ceil(WORKGROUP_SIZE as u64);
        let second = first.div_ceil(WORKGROUP_SIZE as u64).max(1);
        let scratch = ReduceScratch {
            len,
            ping: create_storage_buffer(&self.device, "reduce_ping", first * 4)?,
            pong: create_storage_buffer(&self.device, "reduce_pong", second * 4)?,
        };
        let buffers = (scratch.ping.clone(), scratch.pong.clone());
        if let Some(previous) = self.reduce_scratch.replace(scratch) {
            previous.ping.destroy();
            previous.pong.destroy();
        }
        Ok(buffers)
    }

    fn read_sum_with_timeout(&self) -> Result<f32, GpuError> {
        let slice = self.sum_staging.slice(..);

        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });

        let start = Instant::now();
        loop {
            let _ = self.device.poll(wgpu::PollType::Poll);

            if let Ok(result) = rx.try_recv() {
                result.map_err(|e| GpuError::BufferMapping(e.to_string()))?;
                break;
            }

            self.check_lost()?;
            if start.elapsed() > self.timeout {
                return Err(GpuError::Timeout(self.timeout.as_secs()));
            }

            std::thread::sleep(Duration::from_millis(1));
        }

        let data = slice.get_mapped_range();
        let sum: f32 = *bytemuck::from_bytes(&data);
        drop(data);
        self.sum_staging.unmap();

        Ok(sum)
    }
}

impl Accelerator for WgpuDevice {
    type Buffer = GpuBuffer;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&mut self, bytes: u64, element_type: ElementType) -> Result<GpuBuffer, GpuError> {
        self.check_lost()?;
        if element_type == ElementType::F16 && !self.shaders.supports_f16() {
            return Err(GpuError::UnsupportedElementType(element_type));
        }
        let size = element_type.elements_for(bytes) * element_type.size_bytes();
        let buffer = create_storage_buffer(&self.device, "fragment_block", size)?;
        self.track_alloc(size);
        Ok(GpuBuffer::new(buffer, size, element_type))
    }

    fn free(&mut self, buffer: GpuBuffer) {
        self.allocated = self.allocated.saturating_sub(buffer.size_bytes());
        buffer.destroy();
    }

    fn random_matrix<R: Rng + ?Sized>(
        &mut self,
        dim: usize,
        rng: &mut R,
    ) -> Result<GpuBuffer, GpuError> {
        let data: Vec<f32> = (0..dim * dim).map(|_| rng.gen::<f32>()).collect();
        let buffer =
            create_storage_buffer_init(&self.device, "dense_matrix", bytemuck::cast_slice(&data))?;
        let size = (data.len() * 4) as u64;
        self.track_alloc(size);
        Ok(GpuBuffer::new(buffer, size, ElementType::F32))
    }

    fn add_scalar(&mut self, buffer: &GpuBuffer, value: f32) -> Result<(), GpuError> {
        self.elementwise(ElementwiseOp::Add, buffer, value)
    }

    fn mul_scalar(&mut self, buffer: &GpuBuffer, value: f32) -> Result<(), GpuError> {
        self.elementwise(ElementwiseOp::Mul, buffer, value)
    }

    fn sin(&mut self, buffer: &GpuBuffer) -> Result<(), GpuError> {
        self.elementwise(ElementwiseOp::Sin, buffer, 0.0)
    }

    fn matmul(
        &mut self,
        a: &GpuBuffer,
        b: &GpuBuffer,
        out: &GpuBuffer,
        dim: usize,
    ) -> Result<(), GpuError> {
        for buffer in [a, b, out] {
            self.check_binding(buffer)?;
        }
        let dims = create_uniform(
            &self.device,
            "matmul_dims",
            &MatmulDims {
                n: dim as u32,
                _padding: [0; 3],
            },
        );
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("matmul_bind_group"),
            layout: self.shaders.matmul_layout(),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: dims.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: a.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: b.buffer().as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out.buffer().as_entire_binding(),
                },
            ],
        });
        let tiles = (dim as u32).div_ceil(MATMUL_TILE);
        let pipeline = self.shaders.matmul_pipeline().clone();
        self.record_pass("matmul_pass", &pipeline, &bind_group, (tiles, tiles));
        Ok(())
    }

    fn sum(&mut self, buffer: &GpuBuffer) -> Result<(), GpuError> {
        self.check_binding(buffer)?;
        let total = buffer.element_count();
        let (ping, pong) = self.scratch_for(total)?;
        let pipeline = self.shaders.reduce_pipeline().clone();

        let mut len = total;
        let mut pass_index = 0;
        let mut last: Option<wgpu::Buffer> = None;
        while pass_index == 0 || len > 1 {
            let source = last.clone().unwrap_or_else(|| buffer.buffer().clone());
            let target = if pass_index % 2 == 0 {
                ping.clone()
            } else {
                pong.clone()
            };

            let (x, y, row_width) = dispatch_grid(len, self.max_workgroups);
            let params = create_uniform(
                &self.device,
                "reduce_params",
                &ReduceParams {
                    len: len as u32,
                    row_width,
                    _padding: [0; 2],
                },
            );
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("reduce_bind_group"),
                layout: self.shaders.reduce_layout(),
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: params.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: source.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: target.as_entire_binding(),
                    },
                ],
            });
            self.record_pass("reduce_pass", &pipeline, &bind_group, (x, y));

            len = len.div_ceil(WORKGROUP_SIZE as u64);
            last = Some(target);
            pass_index += 1;
        }

        if let Some(result) = last {
            let sum_result = self.sum_result.clone();
            self.encoder()
                .copy_buffer_to_buffer(&result, 0, &sum_result, 0, SUM_BYTES);
        }
        self.flush();
        let _ = self.device.poll(wgpu::PollType::Poll);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), GpuError> {
        self.check_lost()?;
        let sum_result = self.sum_result.clone();
        let sum_staging = self.sum_staging.clone();
        self.encoder()
            .copy_buffer_to_buffer(&sum_result, 0, &sum_staging, 0, SUM_BYTES);
        self.flush();

        self.last_checksum = self.read_sum_with_timeout()?;
        log::trace!("GPU {}: checksum {}", self.info.index, self.last_checksum);

        if self.validation_scope_open {
            self.validation_scope_open = false;
            if let Some(err) = block_on(self.device.pop_error_scope()) {
                return Err(GpuError::Validation(err.to_string()));
            }
        }
        Ok(())
    }

    fn peak_allocated(&self) -> u64 {
        self.peak
    }

    fn max_binding_bytes(&self) -> u64 {
        self.max_binding
    }
}
