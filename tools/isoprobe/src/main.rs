use anyhow::Result;
use clap::Parser;
use log::info;
use nodeiso_utils::affinity;
use nodeiso_utils::current_cpu;
use nodeiso_utils::format_cpulist;
use nodeiso_utils::probe;
use std::thread::sleep;
use std::time::Duration;

/// isoprobe: report the resource bindings of the current process.
///
/// Reads the scheduler affinity, the /proc/self/status allowed lists, the
/// cgroup v2 cpuset attributes and the GPU visibility variable, and prints
/// a human-readable report. Run it inside a systemd slice or through the
/// MIG launcher wrapper to confirm which partition the process actually
/// landed in.
///
/// All reads are best-effort: a kernel file that is absent or unreadable
/// only blanks out the affected field, and the exit status stays 0.
#[derive(Debug, Parser)]
struct Opts {
    /// After the report, keep logging the affinity and the CPU currently
    /// running this process for this many seconds. 0 disables.
    #[clap(short = 'w', long, default_value = "0")]
    watch: u64,

    /// Watch logging interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

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

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(opts.verbose)?;

    let report = probe();
    println!("{}", "=".repeat(60));
    println!("CPU / memory / GPU partitioning probe");
    println!("{}", "=".repeat(60));
    print!("{report}");

    #[cfg(feature = "gpu-topology")]
    print_gpus();

    if opts.watch > 0 {
        let interval = Duration::from_secs_f64(opts.interval.max(0.1));
        let ticks = (opts.watch as f64 / interval.as_secs_f64()).ceil() as u64;
        for tick in 0..ticks {
            let affinity = match affinity::current_affinity() {
                Ok(cpus) => format_cpulist(&cpus),
                Err(_) => "n/a".to_string(),
            };
            let running = match current_cpu() {
                Some(cpu) => cpu.to_string(),
                None => "n/a".to_string(),
            };
            info!("tick {tick:02}: affinity {affinity} running on CPU {running}");
            sleep(interval);
        }
    }

    Ok(())
}

#[cfg(feature = "gpu-topology")]
fn print_gpus() {
    let gpus = nodeiso_utils::gpu::enumerate_gpus();
    if gpus.is_empty() {
        println!("NVML devices: none");
        return;
    }
    println!("NVML devices:");
    for gpu in &gpus {
        println!(
            "  [{}] {}  uuid={}  mem={} MiB  numa={}",
            gpu.index,
            gpu.name,
            gpu.uuid,
            gpu.memory >> 20,
            gpu.node_id
        );
    }
}
