use anyhow::Result;
use clap::Parser;
use log::error;
use log::info;
use log::warn;
use nodeiso_utils::accel;
use nodeiso_utils::accel::MatmulDevice;
use nodeiso_utils::probe;
use nodeiso_utils::LoadGenerator;
use nodeiso_utils::LoadSpec;
use std::time::Duration;

/// isostress: sustained CPU (and optionally GPU) load for observing
/// partition isolation.
///
/// Spawns one pinned worker per allowed CPU (or an explicit count) and
/// busy-loops them to a shared wall-clock deadline; with --gpu it drives a
/// dense matrix self-multiplication loop on the accelerator at the same
/// time. Watch mpstat / sar / nvidia-smi from outside the partition to
/// confirm that only the granted cores and slice light up.
///
/// The run cannot be cut short: the deadline is the only terminator.
#[derive(Debug, Parser)]
struct Opts {
    /// Duration to run, in seconds (minimum 5).
    #[clap(short = 's', long, default_value = "180")]
    seconds: u64,

    /// Number of CPU workers. 0 means one per allowed CPU.
    #[clap(short = 't', long, default_value = "0")]
    threads: usize,

    /// Square matrix dimension for the GPU matmul loop.
    #[clap(short = 'm', long, default_value = "4096")]
    matrix: usize,

    /// Drive the GPU matmul loop concurrently with the CPU workers.
    #[clap(short = 'g', long, action = clap::ArgAction::SetTrue)]
    gpu: bool,

    /// CUDA device ordinal to prefer. Under a MIG launcher, ordinal 0 is
    /// the granted slice.
    #[clap(short = 'd', long, default_value = "0")]
    device: usize,

    /// Treat an absent accelerator runtime or device as a fatal setup
    /// error instead of skipping the GPU loop.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    require_gpu: bool,

    /// Synchronize the device every this many matmul iterations.
    #[clap(long, default_value_t = accel::DEFAULT_SYNC_INTERVAL)]
    sync_every: u64,

    /// Grace period when joining workers past the deadline, in
    /// milliseconds.
    #[clap(long, default_value = "1000")]
    grace_ms: u64,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

#[cfg(feature = "cuda")]
fn open_gpu_device(opts: &Opts) -> Result<Option<Box<dyn MatmulDevice>>> {
    use anyhow::Context;

    match accel::cuda::CublasMatmul::new(opts.device) {
        Ok(dev) => Ok(Some(Box::new(dev))),
        Err(e) if opts.require_gpu => {
            Err(e).context("GPU loop required but no usable CUDA device")
        }
        Err(e) => {
            warn!("skipping GPU loop, no usable CUDA device: {e:#}");
            Ok(None)
        }
    }
}

#[cfg(not(feature = "cuda"))]
fn open_gpu_device(opts: &Opts) -> Result<Option<Box<dyn MatmulDevice>>> {
    use anyhow::bail;

    if opts.require_gpu {
        bail!("GPU loop required but this build has no CUDA support (rebuild with --features cuda)");
    }
    warn!("GPU loop requested but this build has no CUDA support, skipping");
    Ok(None)
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    println!("=== Stress setup ===");
    let report = probe();
    print!("{report}");
    println!("====================");
    println!();

    // Resolve the accelerator before spawning anything: a mandatory GPU
    // that is absent must fail before any work starts.
    let gpu_dev = if opts.gpu { open_gpu_device(&opts)? } else { None };

    let duration = Duration::from_secs(opts.seconds.max(5));
    let spec = LoadSpec {
        duration,
        cpus: report.cpus.clone(),
        workers: (opts.threads > 0).then_some(opts.threads),
        grace: Duration::from_millis(opts.grace_ms),
    };

    let generator = LoadGenerator::start(&spec)?;
    info!(
        "launched {} CPU workers for {}s",
        generator.worker_count(),
        duration.as_secs()
    );

    // The GPU loop shares the workers' deadline and runs on the main
    // thread; its faults end it early without touching the CPU side.
    if let Some(mut dev) = gpu_dev {
        if let Err(e) =
            accel::run_matmul_loop(dev.as_mut(), opts.matrix, generator.deadline(), opts.sync_every)
        {
            error!("GPU loop failed: {e:#}");
        }
    }

    let summary = generator.join();
    println!();
    for worker in &summary.workers {
        println!(
            "worker {:>3}: CPU {:>4}  pinned={:<5}  work_units={:<12}  completed={}",
            worker.index, worker.cpu, worker.pinned, worker.work_units, worker.completed
        );
    }
    println!(
        "Total: {} work units across {} workers in {:.1}s",
        summary.total_work_units,
        summary.workers.len(),
        summary.elapsed.as_secs_f64()
    );
    println!("Done. Check mpstat or sar logs to confirm only the allowed CPUs were busy.");

    Ok(())
}
