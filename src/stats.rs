//! Per-device statistics for a stress run.
//!
//! Each worker fills its own report; nothing here is shared across threads.

use crate::traits::DeviceInfo;
use bytesize::ByteSize;
use std::time::Duration;

/// Outcome of the fragmentation phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentStats {
    /// Total device memory in bytes.
    pub total_memory: u64,
    /// Bytes the fragmenter aimed to keep allocated.
    pub target_bytes: u64,
    /// Bytes held by live blocks when the phase ended.
    pub allocated_bytes: u64,
    /// Successful allocations.
    pub allocations: u64,
    /// Blocks freed to create gaps.
    pub frees: u64,
    /// Times the candidate sizes were halved after an allocation failure.
    pub oom_fallbacks: u64,
    /// Blocks alive when the phase ended.
    pub live_blocks: usize,
}

impl FragmentStats {
    /// True when the target was met.
    pub fn reached_target(&self) -> bool {
        self.allocated_bytes >= self.target_bytes
    }
}

/// Outcome of the compute phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputeStats {
    /// Loop iterations completed.
    pub iterations: u64,
    /// Wall-clock time at the last synchronization point.
    pub elapsed: Duration,
    /// Dense matrix dimension used.
    pub matrix_dim: usize,
    /// Peak device memory observed at the last synchronization point.
    pub peak_allocated: u64,
}

/// Everything one worker reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub device: DeviceInfo,
    pub fragment: FragmentStats,
    pub compute: ComputeStats,
}

impl DeviceReport {
    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "GPU {} ({}): {} in {} blocks ({} allocs, {} frees, {} fallbacks), {} iterations in {}, peak {}",
            self.device.index,
            self.device.name,
            ByteSize::b(self.fragment.allocated_bytes),
            self.fragment.live_blocks,
            self.fragment.allocations,
            self.fragment.frees,
            self.fragment.oom_fallbacks,
            self.compute.iterations,
            humantime::format_duration(Duration::from_secs(self.compute.elapsed.as_secs())),
            ByteSize::b(self.compute.peak_allocated)
        )
    }
}
