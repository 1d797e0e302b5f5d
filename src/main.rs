mod compute;
mod config;
mod dispatch;
mod error;
mod fragment;
#[cfg(feature = "gpu")]
mod gpu;
mod progress;
mod stats;
#[cfg(test)]
mod testing;
mod traits;

use clap::Parser;
use config::{mib_to_bytes, ComputeConfig, ElementType, FragmentConfig};
use dispatch::RunPlan;
use error::VramfragError;

#[cfg(feature = "gpu")]
use dispatch::{run_all, run_single};
#[cfg(feature = "gpu")]
use error::GpuError;
#[cfg(feature = "gpu")]
use indicatif::MultiProgress;
#[cfg(feature = "gpu")]
use progress::DeviceProgress;
#[cfg(feature = "gpu")]
use stats::DeviceReport;
#[cfg(feature = "gpu")]
use traits::Platform;

const DEFAULT_GPU_TIMEOUT_SECS: u64 = 120;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fragments GPU memory and keeps the device under sustained compute load",
    long_about = None
)]
struct Args {
    /// Stress duration per device, in hours
    #[arg(long, required_unless_present = "list_gpus")]
    hours: Option<f64>,

    /// Restrict the run to one device index (default: every device)
    #[arg(long)]
    device: Option<usize>,

    /// Fraction of device memory to occupy with fragmented blocks
    #[arg(long, default_value_t = 0.95)]
    target_mem_ratio: f64,

    /// Probability of freeing a random live block after each allocation
    #[arg(long, default_value_t = 0.15)]
    free_ratio: f64,

    /// Smallest allocation the fragmenter will attempt, in MiB
    #[arg(long, default_value_t = 1)]
    min_block_mib: u64,

    /// Element type of the fragmented blocks
    #[arg(long, value_enum, default_value_t = ElementType::F32)]
    dtype: ElementType,

    /// Seed for reproducible runs; each device adds its index
    #[arg(long)]
    seed: Option<u64>,

    /// Override the dense matrix dimension used by the compute phase
    #[arg(long)]
    matrix_dim: Option<usize>,

    /// Override the detected device memory, in MiB
    #[arg(long)]
    vram_mib: Option<u64>,

    /// Timeout per GPU synchronization in seconds
    #[arg(long, default_value_t = DEFAULT_GPU_TIMEOUT_SECS)]
    gpu_timeout: u64,

    /// List available GPUs and exit
    #[arg(long, default_value_t = false)]
    list_gpus: bool,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Args {
    /// `--vram-mib` in bytes.
    fn memory_override(&self) -> Result<Option<u64>, VramfragError> {
        self.vram_mib
            .map(|mib| mib_to_bytes(mib, "--vram-mib"))
            .transpose()
    }

    fn plan(&self) -> Result<RunPlan, VramfragError> {
        let hours = self.hours.unwrap_or(0.0);
        if !hours.is_finite() || hours < 0.0 {
            return Err(VramfragError::Config(format!(
                "hours must be a non-negative number, got {}",
                hours
            )));
        }

        let fragment = FragmentConfig {
            target_mem_ratio: self.target_mem_ratio,
            min_block_mib: self.min_block_mib,
            element_type: self.dtype,
            random_free_ratio: self.free_ratio,
            ..Default::default()
        };
        fragment.validate()?;

        let compute = ComputeConfig {
            matrix_dim_override: self.matrix_dim,
            ..Default::default()
        };
        compute.validate()?;

        Ok(RunPlan {
            hours,
            fragment,
            compute,
            seed: self.seed,
        })
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_secs()
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    // Handle --list-gpus early
    if args.list_gpus {
        #[cfg(feature = "gpu")]
        {
            let gpus = gpu::enumerate_gpus();
            if gpus.is_empty() {
                println!("No GPUs found.");
            } else {
                println!("Available GPUs:");
                for gpu_info in &gpus {
                    println!("  {}", gpu_info);
                }
                println!();
                println!("Use --device N to stress a single GPU");
            }
        }
        #[cfg(not(feature = "gpu"))]
        {
            println!("GPU support not compiled. Build with: cargo build --features gpu");
        }
        std::process::exit(0);
    }

    let setup = args
        .plan()
        .and_then(|plan| args.memory_override().map(|memory| (plan, memory)));
    let (plan, memory_override) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    #[cfg(feature = "gpu")]
    {
        let platform = gpu::WgpuPlatform::new(memory_override, args.gpu_timeout);
        std::process::exit(run(&platform, args.device, &plan));
    }

    #[cfg(not(feature = "gpu"))]
    {
        let _ = (plan, memory_override);
        eprintln!("Error: GPU support not compiled.");
        eprintln!("Build with: cargo build --features gpu");
        std::process::exit(1);
    }
}

/// Runs the plan on one device or on all of them and returns the exit status.
#[cfg(feature = "gpu")]
fn run<P: Platform>(platform: &P, device: Option<usize>, plan: &RunPlan) -> i32 {
    let available = platform.device_count();
    if available == 0 {
        eprintln!("Error: {}", VramfragError::Gpu(GpuError::NoAdapter));
        return 1;
    }
    if let Some(index) = device {
        if index >= available {
            eprintln!("Error: {}", VramfragError::InvalidDevice { index, available });
            return 1;
        }
    }

    println!("VRAM Fragmentation Stress Test");
    println!("==============================");
    println!(
        "Duration: {}",
        humantime::format_duration(std::time::Duration::from_secs_f64(plan.hours * 3600.0))
    );
    println!(
        "Target: {:.0}% of device memory, {} blocks, free ratio {}",
        plan.fragment.target_mem_ratio * 100.0,
        plan.fragment.element_type,
        plan.fragment.random_free_ratio
    );
    println!();

    let results = match device {
        Some(index) => {
            let multi = MultiProgress::new();
            let progress = DeviceProgress::new(&multi, index);
            let result = run_single(platform, index, plan, &progress);
            if let Err(e) = &result {
                progress.finish(format!("failed: {}", e));
            }
            vec![(index, result)]
        }
        None => run_all(platform, plan, &MultiProgress::new()),
    };

    report(&results)
}

#[cfg(feature = "gpu")]
fn report(results: &[(usize, Result<DeviceReport, VramfragError>)]) -> i32 {
    println!();
    println!("Run Complete");
    println!("============");

    let mut failures = 0;
    for (device_id, result) in results {
        match result {
            Ok(report) => println!("{}", report.summary()),
            Err(e) => {
                failures += 1;
                println!("GPU {}: FAILED: {}", device_id, e);
            }
        }
    }

    if failures == 0 {
        println!();
        println!("SUCCESS: all {} device(s) completed", results.len());
        0
    } else {
        eprintln!();
        eprintln!("{} of {} device(s) failed", failures, results.len());
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::parse_from(["vramfrag", "--hours", "0.5"]);
        assert_eq!(args.hours, Some(0.5));
        assert_eq!(args.device, None);
        assert_eq!(args.target_mem_ratio, 0.95);
        assert_eq!(args.free_ratio, 0.15);
        assert_eq!(args.min_block_mib, 1);
        assert_eq!(args.dtype, ElementType::F32);
        assert_eq!(args.gpu_timeout, DEFAULT_GPU_TIMEOUT_SECS);
        assert!(!args.verbose);
    }

    #[test]
    fn test_hours_required() {
        assert!(Args::try_parse_from(["vramfrag"]).is_err());
    }

    #[test]
    fn test_list_gpus_without_hours() {
        let args = Args::parse_from(["vramfrag", "--list-gpus"]);
        assert!(args.list_gpus);
        assert_eq!(args.hours, None);
    }

    #[test]
    fn test_parse_device_and_dtype() {
        let args = Args::parse_from([
            "vramfrag", "--hours", "1", "--device", "2", "--dtype", "f16", "--seed", "7",
        ]);
        assert_eq!(args.device, Some(2));
        assert_eq!(args.dtype, ElementType::F16);
        assert_eq!(args.seed, Some(7));
    }

    #[test]
    fn test_invalid_dtype_rejected() {
        assert!(Args::try_parse_from(["vramfrag", "--hours", "1", "--dtype", "f64"]).is_err());
    }

    #[test]
    fn test_plan_from_args() {
        let args = Args::parse_from([
            "vramfrag",
            "--hours",
            "2",
            "--target-mem-ratio",
            "0.5",
            "--free-ratio",
            "0",
            "--min-block-mib",
            "16",
            "--matrix-dim",
            "1024",
        ]);
        let plan = args.plan().unwrap();
        assert_eq!(plan.hours, 2.0);
        assert_eq!(plan.fragment.target_mem_ratio, 0.5);
        assert_eq!(plan.fragment.random_free_ratio, 0.0);
        assert_eq!(plan.fragment.min_block_mib, 16);
        assert_eq!(plan.compute.matrix_dim_override, Some(1024));
    }

    #[test]
    fn test_plan_rejects_bad_ratio() {
        let args = Args::parse_from(["vramfrag", "--hours", "1", "--target-mem-ratio", "1.5"]);
        assert!(matches!(args.plan(), Err(VramfragError::Config(_))));
    }

    #[test]
    fn test_plan_rejects_free_ratio_one() {
        let args = Args::parse_from(["vramfrag", "--hours", "1", "--free-ratio", "1"]);
        assert!(matches!(args.plan(), Err(VramfragError::Config(_))));
    }

    #[test]
    fn test_plan_rejects_zero_min_block() {
        let args = Args::parse_from(["vramfrag", "--hours", "1", "--min-block-mib", "0"]);
        assert!(matches!(args.plan(), Err(VramfragError::Config(_))));
    }

    #[test]
    fn test_memory_override_in_bytes() {
        let args = Args::parse_from(["vramfrag", "--hours", "1", "--vram-mib", "2048"]);
        assert_eq!(args.memory_override().unwrap(), Some(2048 * config::MIB));

        let args = Args::parse_from(["vramfrag", "--hours", "1"]);
        assert_eq!(args.memory_override().unwrap(), None);
    }

    #[test]
    fn test_memory_override_overflow_rejected() {
        let max = u64::MAX.to_string();
        let args = Args::parse_from(["vramfrag", "--hours", "1", "--vram-mib", max.as_str()]);
        assert!(matches!(
            args.memory_override(),
            Err(VramfragError::Config(_))
        ));
    }

    #[test]
    fn test_plan_rejects_negative_hours() {
        let args = Args::parse_from(["vramfrag", "--hours=-1"]);
        assert!(matches!(args.plan(), Err(VramfragError::Config(_))));
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn test_run_rejects_invalid_device_before_work() {
        use crate::testing::FakePlatform;
        use std::sync::atomic::Ordering;

        let platform = FakePlatform::new(vec![64 * config::MIB]);
        let args = Args::parse_from(["vramfrag", "--hours", "0"]);

        assert_eq!(run(&platform, Some(3), &args.plan().unwrap()), 1);
        assert_eq!(platform.opened.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn test_run_without_devices_fails() {
        use crate::testing::FakePlatform;

        let platform = FakePlatform::new(Vec::new());
        let args = Args::parse_from(["vramfrag", "--hours", "0"]);

        assert_eq!(run(&platform, None, &args.plan().unwrap()), 1);
    }
}
