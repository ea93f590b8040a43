use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use nodeiso_utils::format_cpulist;
use nodeiso_utils::probe;
use log::debug;
use nodeiso_utils::ring;
use nodeiso_utils::ring::RingConfig;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// Environment variable marking a spawned participant and carrying its
/// rank. Launcher-internal; not meant to be set by hand.
const RANK_ENV: &str = "ISORING_RANK";

/// isoring: ring message exchange across isolated processes.
///
/// Spawns one copy of itself per rank. Each rank sends a fixed payload to
/// its right neighbor over a Unix socket, verifies the payload received
/// from its left neighbor element-wise, and synchronizes on a barrier
/// before exiting, the same closed exchange an MPI ring test performs,
/// without an MPI runtime. Each rank also prints its own CPU affinity,
/// cgroup and GPU visibility, so launching the ranks through the MIG
/// wrapper shows messages crossing partition boundaries while bindings
/// stay put.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of ring participants.
    #[clap(short = 'n', long, default_value = "4")]
    procs: usize,

    /// Elements in each exchanged payload.
    #[clap(short = 'l', long, default_value = "8")]
    payload_len: usize,

    /// Directory for the per-rank sockets. A fresh directory under the
    /// system temp dir by default.
    #[clap(long)]
    sock_dir: Option<PathBuf>,

    /// Per-rank bound on the whole exchange, in seconds.
    #[clap(long, default_value = "30")]
    timeout_secs: u64,

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

    match env::var(RANK_ENV) {
        Ok(rank) => participant(rank.parse().context("bad rank in ISORING_RANK")?, &opts),
        Err(_) => launcher(&opts),
    }
}

fn participant(rank: usize, opts: &Opts) -> Result<()> {
    let dir = opts
        .sock_dir
        .clone()
        .context("participant started without --sock-dir")?;

    // Per-rank binding info first, like every rank of an MPI job reports
    // its own placement before the exchange.
    let report = probe();
    println!("[rank {rank}] Host: {}  PID: {}", report.hostname, report.pid);
    println!(
        "[rank {rank}]   CPU affinity: {}",
        format_cpulist(&report.cpus)
    );
    println!(
        "[rank {rank}]   Cgroup: {}",
        report.cgroup.as_deref().unwrap_or("<absent>")
    );
    println!(
        "[rank {rank}]   CUDA_VISIBLE_DEVICES: {}",
        report.gpu_visibility.as_deref().unwrap_or("<unset>")
    );

    let cfg = RingConfig {
        rank,
        size: opts.procs.max(1),
        payload_len: opts.payload_len,
        dir,
        timeout: Duration::from_secs(opts.timeout_secs),
    };
    let outcome = ring::run_participant(&cfg)?;

    println!(
        "[rank {rank}] Received from rank {}: {:?} -> OK={}",
        outcome.src, outcome.received, outcome.ok
    );
    if !outcome.ok {
        bail!("rank {rank}: payload verification failed");
    }
    Ok(())
}

fn launcher(opts: &Opts) -> Result<()> {
    let procs = opts.procs.max(1);
    let exe = env::current_exe().context("Failed to resolve own executable")?;

    let (dir, cleanup) = match &opts.sock_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create socket dir {dir:?}"))?;
            (dir.clone(), false)
        }
        None => {
            let dir = env::temp_dir().join(format!("isoring-{}", std::process::id()));
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create socket dir {dir:?}"))?;
            (dir, true)
        }
    };

    println!("{}", "=".repeat(60));
    println!("Ring exchange across {procs} processes");
    println!("{}", "=".repeat(60));

    let mut children = vec![];
    for rank in 0..procs {
        let mut cmd = Command::new(&exe);
        cmd.arg("--procs")
            .arg(procs.to_string())
            .arg("--payload-len")
            .arg(opts.payload_len.to_string())
            .arg("--sock-dir")
            .arg(&dir)
            .arg("--timeout-secs")
            .arg(opts.timeout_secs.to_string())
            .env(RANK_ENV, rank.to_string());
        for _ in 0..opts.verbose {
            cmd.arg("-v");
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn rank {rank}"))?;
        debug!("spawned rank {rank} as pid {}", child.id());
        children.push((rank, child));
    }

    let mut failed = vec![];
    for (rank, mut child) in children {
        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for rank {rank}"))?;
        if !status.success() {
            failed.push(rank);
        }
    }

    if cleanup {
        let _ = fs::remove_dir_all(&dir);
    }

    println!();
    if failed.is_empty() {
        println!("All {procs} ranks completed the ring exchange.");
        Ok(())
    } else {
        bail!("ranks {failed:?} failed the ring exchange");
    }
}
