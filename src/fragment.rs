//! VRAM fragmentation phase.
//!
//! Allocates blocks of randomly chosen sizes until a fraction of device
//! memory is in use, freeing random live blocks along the way so that the
//! survivors are separated by gaps.

use crate::config::{FragmentConfig, GIB};
use crate::error::GpuError;
use crate::progress::DeviceProgress;
use crate::stats::FragmentStats;
use crate::traits::{Accelerator, DeviceBuffer};
use rand::Rng;

/// Live blocks left behind by the fragmenter, in allocation order.
pub struct Fragmentation<B> {
    pub blocks: Vec<B>,
    pub stats: FragmentStats,
}

/// Allocates and randomly frees blocks to fragment device memory.
pub struct Fragmenter<'a> {
    config: &'a FragmentConfig,
}

impl<'a> Fragmenter<'a> {
    pub fn new(config: &'a FragmentConfig) -> Self {
        Self { config }
    }

    /// Fragments `device` memory up to the configured target.
    ///
    /// Allocation failures shrink every candidate size by half; running out of
    /// candidates ends the phase early with whatever was allocated. Any other
    /// device error is returned.
    pub fn fragment<A, R>(
        &self,
        device: &mut A,
        rng: &mut R,
        progress: &DeviceProgress,
    ) -> Result<Fragmentation<A::Buffer>, GpuError>
    where
        A: Accelerator,
        R: Rng + ?Sized,
    {
        let total = device.info().total_memory;
        let target = (total as f64 * self.config.target_mem_ratio) as u64;
        let min_block = self.config.min_block_bytes();
        let mut candidates = self.config.block_sizes_bytes();
        let mut blocks: Vec<A::Buffer> = Vec::new();
        let mut stats = FragmentStats {
            total_memory: total,
            target_bytes: target,
            ..Default::default()
        };
        let mut allocated = 0u64;

        progress.line(format!(
            "Fragmenting up to {:.2} GiB ({:.0}% of {:.2} GiB)",
            target as f64 / GIB as f64,
            self.config.target_mem_ratio * 100.0,
            total as f64 / GIB as f64
        ));

        while allocated < target && !candidates.is_empty() {
            let pick = rng.gen_range(0..candidates.len());
            let size = candidates[pick];
            if size < min_block {
                candidates.remove(pick);
                continue;
            }

            let result = if allocated.saturating_add(size) > total {
                Err(GpuError::OutOfMemory { requested: size })
            } else {
                device.allocate(size, self.config.element_type)
            };

            let block = match result {
                Ok(block) => block,
                Err(e) if e.is_allocation_failure() => {
                    candidates = halve_candidates(&candidates, min_block);
                    stats.oom_fallbacks += 1;
                    log::debug!(
                        "GPU {}: {}; {} candidate size(s) remain after halving",
                        device.info().index,
                        e,
                        candidates.len()
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };

            allocated += block.size_bytes();
            blocks.push(block);
            stats.allocations += 1;

            if rng.gen::<f64>() < self.config.random_free_ratio {
                let victim = blocks.remove(rng.gen_range(0..blocks.len()));
                allocated -= victim.size_bytes();
                device.free(victim);
                stats.frees += 1;
            }

            if stats.allocations % 64 == 0 {
                progress.status(format!(
                    "fragmenting {:.2}/{:.2} GiB",
                    allocated as f64 / GIB as f64,
                    target as f64 / GIB as f64
                ));
            }
        }

        stats.allocated_bytes = allocated;
        stats.live_blocks = blocks.len();

        if !stats.reached_target() {
            log::warn!(
                "GPU {}: no viable block size left, stopping at {:.2} of {:.2} GiB",
                device.info().index,
                allocated as f64 / GIB as f64,
                target as f64 / GIB as f64
            );
        }
        progress.line(format!(
            "Allocated ~{:.2} GiB across {} blocks",
            allocated as f64 / GIB as f64,
            blocks.len()
        ));

        Ok(Fragmentation { blocks, stats })
    }
}

/// Halves every candidate size, dropping those that fall below `min_block`.
fn halve_candidates(candidates: &[u64], min_block: u64) -> Vec<u64> {
    candidates
        .iter()
        .map(|size| size / 2)
        .filter(|size| *size >= min_block)
        .collect()
}
