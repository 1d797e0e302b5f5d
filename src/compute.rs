//! Timed compute phase.
//!
//! Keeps every fragmented block resident by touching it each iteration, and
//! drives arithmetic units with dense matmul bursts until the requested
//! duration has passed.

use crate::config::{ComputeConfig, ElementType, GIB};
use crate::error::GpuError;
use crate::progress::DeviceProgress;
use crate::stats::ComputeStats;
use crate::traits::Accelerator;
use rand::Rng;
use std::time::{Duration, Instant};

/// Matrix dimensions are kept a multiple of the matmul tile.
const MATRIX_TILE: usize = 16;

/// Runs the compute loop over fragmented blocks and dense matrices.
pub struct ComputeDriver<'a> {
    config: &'a ComputeConfig,
}

impl<'a> ComputeDriver<'a> {
    pub fn new(config: &'a ComputeConfig) -> Self {
        Self { config }
    }

    /// Square matrix dimension for `device`, shrunk so one matrix fits in a
    /// single binding.
    pub fn matrix_dim<A: Accelerator>(&self, device: &A) -> usize {
        let dim = self.config.matrix_dim(device.info().total_memory);
        let max_elements = device.max_binding_bytes() / 4;
        if (dim as u64) * (dim as u64) <= max_elements {
            return dim;
        }
        let side = (max_elements as f64).sqrt() as usize;
        let fitted = (side / MATRIX_TILE * MATRIX_TILE).max(MATRIX_TILE);
        log::warn!(
            "GPU {}: matrix dimension {} exceeds binding limit, using {}",
            device.info().index,
            dim,
            fitted
        );
        fitted
    }

    /// Runs until `hours` have elapsed, checking only every
    /// `sync_interval` iterations.
    ///
    /// # Errors
    ///
    /// Any device error, including failing to allocate the dense matrices.
    pub fn run<A, R>(
        &self,
        device: &mut A,
        blocks: &[A::Buffer],
        hours: f64,
        rng: &mut R,
        progress: &DeviceProgress,
    ) -> Result<ComputeStats, GpuError>
    where
        A: Accelerator,
        R: Rng + ?Sized,
    {
        let dim = self.matrix_dim(device);
        log::info!(
            "GPU {}: {}x{} dense matrices, {} fragmented blocks",
            device.info().index,
            dim,
            dim,
            blocks.len()
        );

        let x = device.random_matrix(dim, rng)?;
        let y = device.random_matrix(dim, rng)?;
        let z = device.allocate((dim * dim * 4) as u64, ElementType::F32)?;

        let result = self.stress_loop(device, blocks, &x, &y, &z, dim, hours, progress);

        device.free(z);
        device.free(y);
        device.free(x);

        let stats = result?;
        progress.line(format!("Completed {:.2}h stress test", hours));
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn stress_loop<A: Accelerator>(
        &self,
        device: &mut A,
        blocks: &[A::Buffer],
        x: &A::Buffer,
        y: &A::Buffer,
        z: &A::Buffer,
        dim: usize,
        hours: f64,
        progress: &DeviceProgress,
    ) -> Result<ComputeStats, GpuError> {
        let target = Duration::from_secs_f64(hours.max(0.0) * 3600.0);
        let start = Instant::now();
        let mut stats = ComputeStats {
            matrix_dim: dim,
            ..Default::default()
        };

        loop {
            for block in blocks {
                device.add_scalar(block, self.config.touch_add)?;
                device.mul_scalar(block, self.config.touch_mul)?;
            }

            for _ in 0..self.config.burst_reps {
                device.matmul(x, y, z, dim)?;
                device.add_scalar(z, self.config.burst_bias)?;
                device.sin(z)?;
                device.sum(z)?;
            }

            stats.iterations += 1;
            if stats.iterations % self.config.sync_interval != 0 {
                continue;
            }

            device.synchronize()?;
            stats.elapsed = start.elapsed();
            stats.peak_allocated = device.peak_allocated();
            progress.line(format!(
                "Elapsed {:.2}h, iteration {}, max allocated {:.2} GiB",
                stats.elapsed.as_secs_f64() / 3600.0,
                stats.iterations,
                stats.peak_allocated as f64 / GIB as f64
            ));
            progress.status(format!(
                "iteration {} | {}",
                stats.iterations,
                humantime::format_duration(Duration::from_secs(stats.elapsed.as_secs()))
            ));
            if stats.elapsed >= target {
                return Ok(stats);
            }
        }
    }
}
