//! Per-device worker dispatch.
//!
//! A worker runs the fragmenter and then the compute driver on one device.
//! `run_all` starts one scoped thread per device; workers share nothing
//! mutable and a failure in one never stops the others.

use crate::compute::ComputeDriver;
use crate::config::{ComputeConfig, FragmentConfig};
use crate::error::VramfragError;
use crate::fragment::Fragmenter;
use crate::progress::DeviceProgress;
use crate::stats::DeviceReport;
use crate::traits::{Accelerator, Platform};
use indicatif::MultiProgress;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Settings shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Stress duration per device.
    pub hours: f64,
    pub fragment: FragmentConfig,
    pub compute: ComputeConfig,
    /// Base seed; each worker adds its device index.
    pub seed: Option<u64>,
}

impl RunPlan {
    fn rng_for(&self, device: usize) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(device as u64)),
            None => StdRng::from_entropy(),
        }
    }
}

/// Fragments and stresses a single device, blocking until done.
///
/// # Errors
///
/// Returns `VramfragError::InvalidDevice` before any work if `device_id` is
/// out of range, and any device error raised during either phase.
pub fn run_single<P: Platform>(
    platform: &P,
    device_id: usize,
    plan: &RunPlan,
    progress: &DeviceProgress,
) -> Result<DeviceReport, VramfragError> {
    let available = platform.device_count();
    if device_id >= available {
        return Err(VramfragError::InvalidDevice {
            index: device_id,
            available,
        });
    }

    let mut device = platform.open(device_id)?;
    let info = device.info().clone();
    progress.line(format!("Starting stress test on {}", info.name));
    let mut rng = plan.rng_for(device_id);

    progress.status("fragmenting");
    let fragmentation =
        Fragmenter::new(&plan.fragment).fragment(&mut device, &mut rng, progress)?;

    progress.status("computing");
    let compute = ComputeDriver::new(&plan.compute).run(
        &mut device,
        &fragmentation.blocks,
        plan.hours,
        &mut rng,
        progress,
    );

    for block in fragmentation.blocks {
        device.free(block);
    }
    let compute = compute?;

    progress.finish("complete");
    Ok(DeviceReport {
        device: info,
        fragment: fragmentation.stats,
        compute,
    })
}

/// Stresses every device concurrently, one worker thread each, and waits
/// for all of them.
///
/// Returns one result per device in index order.
pub fn run_all<P: Platform>(
    platform: &P,
    plan: &RunPlan,
    multi: &MultiProgress,
) -> Vec<(usize, Result<DeviceReport, VramfragError>)> {
    let count = platform.device_count();
    log::info!("Starting {} worker(s)", count);

    let scoped = crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..count)
            .map(|device_id| {
                let progress = DeviceProgress::new(multi, device_id);
                let handle = scope.spawn(move |_| {
                    let result = run_single(platform, device_id, plan, &progress);
                    if let Err(e) = &result {
                        progress.finish(format!("failed: {}", e));
                    }
                    result
                });
                (device_id, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(device_id, handle)| {
                let result = handle
                    .join()
                    .unwrap_or(Err(VramfragError::WorkerPanicked(device_id)));
                (device_id, result)
            })
            .collect::<Vec<_>>()
    });

    // Every handle is joined above, so the scope itself cannot report a panic.
    scoped.unwrap_or_default()
}
