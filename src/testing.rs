//! In-memory fake accelerator for unit tests.
//!
//! Buffers carry only a size; compute operations are counted, not executed.

use crate::config::ElementType;
use crate::error::GpuError;
use crate::traits::{Accelerator, DeviceBuffer, DeviceInfo, Platform};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::ThreadId;

#[derive(Debug, PartialEq, Eq)]
pub struct FakeBuffer {
    pub id: u64,
    pub size: u64,
    pub element_type: ElementType,
}

impl DeviceBuffer for FakeBuffer {
    fn size_bytes(&self) -> u64 {
        self.size
    }

    fn element_type(&self) -> ElementType {
        self.element_type
    }
}

/// Counts of operations issued against a `FakeDevice`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OpCounts {
    pub allocations: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub adds: u64,
    pub muls: u64,
    pub sins: u64,
    pub matmuls: u64,
    pub sums: u64,
    pub syncs: u64,
}

pub struct FakeDevice {
    info: DeviceInfo,
    used: u64,
    peak: u64,
    next_id: u64,
    /// Allocations larger than this fail with `OutOfMemory`.
    pub fail_above: Option<u64>,
    /// Every allocation fails with this error when set.
    pub fail_with_device_lost: bool,
    /// Accept allocations past total memory, like an overcommitting driver.
    pub overcommit: bool,
    pub max_binding: u64,
    pub ops: OpCounts,
    /// Bytes in use after every allocation and free.
    pub usage_history: Vec<u64>,
}

impl FakeDevice {
    pub fn new(index: usize, total_memory: u64) -> Self {
        Self {
            info: DeviceInfo {
                index,
                name: format!("Fake GPU {}", index),
                total_memory,
            },
            used: 0,
            peak: 0,
            next_id: 0,
            fail_above: None,
            fail_with_device_lost: false,
            overcommit: false,
            max_binding: u64::MAX,
            ops: OpCounts::default(),
            usage_history: Vec::new(),
        }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn record(&mut self, size: u64, element_type: ElementType) -> Result<FakeBuffer, GpuError> {
        if self.fail_with_device_lost {
            return Err(GpuError::DeviceLost);
        }
        let over_limit = self.fail_above.is_some_and(|limit| size > limit);
        let over_capacity = !self.overcommit && self.used + size > self.info.total_memory;
        if over_limit || over_capacity {
            self.ops.failed_allocations += 1;
            return Err(GpuError::OutOfMemory { requested: size });
        }
        self.used += size;
        self.peak = self.peak.max(self.used);
        self.usage_history.push(self.used);
        self.ops.allocations += 1;
        self.next_id += 1;
        Ok(FakeBuffer {
            id: self.next_id,
            size,
            element_type,
        })
    }
}

impl Accelerator for FakeDevice {
    type Buffer = FakeBuffer;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn allocate(&mut self, bytes: u64, element_type: ElementType) -> Result<FakeBuffer, GpuError> {
        let size = element_type.elements_for(bytes) * element_type.size_bytes();
        self.record(size, element_type)
    }

    fn free(&mut self, buffer: FakeBuffer) {
        self.used -= buffer.size;
        self.usage_history.push(self.used);
        self.ops.frees += 1;
    }

    fn random_matrix<R: Rng + ?Sized>(
        &mut self,
        dim: usize,
        rng: &mut R,
    ) -> Result<FakeBuffer, GpuError> {
        let _: f32 = rng.gen();
        self.record((dim * dim * 4) as u64, ElementType::F32)
    }

    fn add_scalar(&mut self, _buffer: &FakeBuffer, _value: f32) -> Result<(), GpuError> {
        self.ops.adds += 1;
        Ok(())
    }

    fn mul_scalar(&mut self, _buffer: &FakeBuffer, _value: f32) -> Result<(), GpuError> {
        self.ops.muls += 1;
        Ok(())
    }

    fn sin(&mut self, _buffer: &FakeBuffer) -> Result<(), GpuError> {
        self.ops.sins += 1;
        Ok(())
    }

    fn matmul(
        &mut self,
        _a: &FakeBuffer,
        _b: &FakeBuffer,
        _out: &FakeBuffer,
        _dim: usize,
    ) -> Result<(), GpuError> {
        self.ops.matmuls += 1;
        Ok(())
    }

    fn sum(&mut self, _buffer: &FakeBuffer) -> Result<(), GpuError> {
        self.ops.sums += 1;
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), GpuError> {
        self.ops.syncs += 1;
        Ok(())
    }

    fn peak_allocated(&self) -> u64 {
        self.peak
    }

    fn max_binding_bytes(&self) -> u64 {
        self.max_binding
    }
}

/// Platform of fake devices that records which threads opened them.
pub struct FakePlatform {
    memories: Vec<u64>,
    failing: Option<usize>,
    pub opened: AtomicUsize,
    pub threads: Mutex<Vec<ThreadId>>,
}

impl FakePlatform {
    pub fn new(memories: Vec<u64>) -> Self {
        Self {
            memories,
            failing: None,
            opened: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Device `index` reports `DeviceLost` on its first allocation.
    pub fn with_failing_device(mut self, index: usize) -> Self {
        self.failing = Some(index);
        self
    }
}

impl Platform for FakePlatform {
    type Device = FakeDevice;

    fn device_count(&self) -> usize {
        self.memories.len()
    }

    fn open(&self, index: usize) -> Result<FakeDevice, GpuError> {
        let total = *self.memories.get(index).ok_or(GpuError::AdapterNotFound {
            index,
            available: Vec::new(),
        })?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.threads
            .lock()
            .expect("thread list poisoned")
            .push(std::thread::current().id());
        let mut device = FakeDevice::new(index, total);
        device.fail_with_device_lost = self.failing == Some(index);
        Ok(device)
    }
}
