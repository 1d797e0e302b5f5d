//! Run configuration for the fragmentation and compute phases.

use crate::error::VramfragError;
use clap::ValueEnum;
use std::fmt;

/// Bytes per mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Bytes per gibibyte.
pub const GIB: u64 = 1024 * MIB;

/// Default candidate block sizes in MiB, largest first.
pub const DEFAULT_BLOCK_SIZES_MIB: [u64; 10] = [512, 256, 128, 64, 32, 16, 8, 4, 2, 1];

/// Element type stored in fragmented blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, ValueEnum)]
pub enum ElementType {
    #[default]
    F32,
    F16,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
        }
    }

    /// Number of elements that fit in `bytes`, never less than one.
    pub fn elements_for(&self, bytes: u64) -> u64 {
        (bytes / self.size_bytes()).max(1)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
        }
    }
}

/// Configuration for the fragmentation workload.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentConfig {
    /// Fraction of device memory to occupy, in `[0, 1]`.
    pub target_mem_ratio: f64,
    /// Candidate block sizes in MiB, non-increasing.
    pub block_sizes_mib: Vec<u64>,
    /// Smallest block size allowed after fallback halving.
    pub min_block_mib: u64,
    /// Element type of allocated blocks.
    pub element_type: ElementType,
    /// Probability of freeing a random live block after each allocation,
    /// in `[0, 1)`.
    pub random_free_ratio: f64,
}

impl Default for FragmentConfig {
    fn default() -> Self {
        Self {
            target_mem_ratio: 0.95,
            block_sizes_mib: DEFAULT_BLOCK_SIZES_MIB.to_vec(),
            min_block_mib: 1,
            element_type: ElementType::F32,
            random_free_ratio: 0.15,
        }
    }
}

impl FragmentConfig {
    /// Candidate block sizes converted to bytes.
    pub fn block_sizes_bytes(&self) -> Vec<u64> {
        self.block_sizes_mib
            .iter()
            .map(|mib| mib.saturating_mul(MIB))
            .collect()
    }

    /// Minimum block size in bytes.
    pub fn min_block_bytes(&self) -> u64 {
        self.min_block_mib.saturating_mul(MIB)
    }

    /// Checks ratios, block size ordering and that every size fits in bytes.
    ///
    /// A minimum larger than every candidate is accepted: fragmentation then
    /// ends immediately with nothing allocated.
    pub fn validate(&self) -> Result<(), VramfragError> {
        if !(0.0..=1.0).contains(&self.target_mem_ratio) {
            return Err(VramfragError::Config(format!(
                "target memory ratio must be within [0, 1], got {}",
                self.target_mem_ratio
            )));
        }
        // A ratio of 1 frees every block as soon as it is allocated.
        if !(0.0..1.0).contains(&self.random_free_ratio) {
            return Err(VramfragError::Config(format!(
                "free ratio must be within [0, 1), got {}",
                self.random_free_ratio
            )));
        }
        if self.min_block_mib == 0 {
            return Err(VramfragError::Config(
                "minimum block size must be at least 1 MiB".to_string(),
            ));
        }
        mib_to_bytes(self.min_block_mib, "minimum block size")?;
        for mib in &self.block_sizes_mib {
            mib_to_bytes(*mib, "block size")?;
        }
        if self.block_sizes_mib.is_empty() {
            return Err(VramfragError::Config(
                "at least one block size is required".to_string(),
            ));
        }
        if self.block_sizes_mib.windows(2).any(|w| w[0] < w[1]) {
            return Err(VramfragError::Config(format!(
                "block sizes must be non-increasing, got {:?}",
                self.block_sizes_mib
            )));
        }
        if let Some(largest) = self.block_sizes_mib.first() {
            if self.min_block_mib > *largest {
                log::warn!(
                    "minimum block size {} MiB exceeds largest candidate {} MiB; nothing will be allocated",
                    self.min_block_mib,
                    largest
                );
            }
        }
        Ok(())
    }
}

/// Converts a MiB count to bytes, rejecting values that overflow `u64`.
pub fn mib_to_bytes(mib: u64, what: &str) -> Result<u64, VramfragError> {
    mib.checked_mul(MIB).ok_or_else(|| {
        VramfragError::Config(format!("{} of {} MiB is too large", what, mib))
    })
}

/// Configuration for the timed compute phase.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeConfig {
    /// Matrix dimension on devices at or above `large_memory_threshold`.
    pub large_matrix_dim: usize,
    /// Matrix dimension on smaller devices.
    pub small_matrix_dim: usize,
    /// Device memory at which the large dimension is used.
    pub large_memory_threshold: u64,
    /// Forces a matrix dimension regardless of device memory.
    pub matrix_dim_override: Option<usize>,
    /// Matmul bursts per iteration.
    pub burst_reps: u32,
    /// Iterations between synchronization points.
    pub sync_interval: u64,
    /// Added to every element of every block.
    pub touch_add: f32,
    /// Multiplies every element of every block, after the add.
    pub touch_mul: f32,
    /// Added to each matmul result before the sine.
    pub burst_bias: f32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            large_matrix_dim: 6144,
            small_matrix_dim: 4096,
            large_memory_threshold: 20 * GIB,
            matrix_dim_override: None,
            burst_reps: 3,
            sync_interval: 8,
            touch_add: 0.5,
            touch_mul: 1.1,
            burst_bias: 0.125,
        }
    }
}

impl ComputeConfig {
    /// Picks the square matrix dimension for a device with `total_memory` bytes.
    pub fn matrix_dim(&self, total_memory: u64) -> usize {
        if let Some(dim) = self.matrix_dim_override {
            return dim;
        }
        if total_memory >= self.large_memory_threshold {
            self.large_matrix_dim
        } else {
            self.small_matrix_dim
        }
    }

    pub fn validate(&self) -> Result<(), VramfragError> {
        if self.matrix_dim_override == Some(0) {
            return Err(VramfragError::Config(
                "matrix dimension must be positive".to_string(),
            ));
        }
        if self.sync_interval == 0 {
            return Err(VramfragError::Config(
                "sync interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
