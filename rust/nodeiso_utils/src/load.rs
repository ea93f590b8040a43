// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Deadline-bounded CPU load generation.
//!
//! One worker thread per assigned CPU, each pinned to its CPU and spinning
//! on bounded integer work until a shared wall-clock deadline. The deadline
//! is computed once at start and is the only thing the workers share, so
//! there is nothing to lock. Work-unit counters are relaxed atomics the
//! caller reads after the join.
//!
//! The lifecycle is strictly linear: configure, spawn, run to deadline,
//! join, report. There is no cancellation distinct from deadline expiry.

use crate::affinity;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::warn;
use std::hint::black_box;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

/// Iterations of the inner summing loop per work unit. Small enough that
/// the deadline check between units bounds overshoot well under a
/// millisecond.
const WORK_UNIT_LEN: u64 = 10_000;

/// Join poll granularity.
const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct LoadSpec {
    /// How long the workers run. The absolute deadline is `now + duration`
    /// at spawn time.
    pub duration: Duration,
    /// CPUs to pin workers onto, normally the probed allowed set.
    pub cpus: Vec<usize>,
    /// Explicit worker count. `None` means one worker per CPU in `cpus`;
    /// an explicit count takes a prefix of `cpus` or cycles it round-robin
    /// when larger.
    pub workers: Option<usize>,
    /// How long past the deadline the join waits before abandoning a
    /// straggler.
    pub grace: Duration,
}

#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub index: usize,
    /// The CPU this worker was asked to pin to.
    pub cpu: usize,
    /// Whether the pin actually took. A failed pin degrades the run but
    /// never aborts it.
    pub pinned: bool,
    pub work_units: u64,
    /// False for workers still running when the grace timeout expired.
    pub completed: bool,
}

#[derive(Debug)]
pub struct LoadSummary {
    pub workers: Vec<WorkerReport>,
    pub total_work_units: u64,
    /// Wall time from spawn to join completion.
    pub elapsed: Duration,
}

struct Worker {
    index: usize,
    cpu: usize,
    pinned: Arc<AtomicBool>,
    work_units: Arc<AtomicU64>,
    handle: thread::JoinHandle<()>,
}

/// A running set of load workers. Acquire with [`LoadGenerator::start`],
/// settle with [`LoadGenerator::join`].
pub struct LoadGenerator {
    deadline: Instant,
    started: Instant,
    grace: Duration,
    workers: Vec<Worker>,
}

impl LoadGenerator {
    /// Compute the deadline and spawn all workers. Pinning failures are
    /// logged and carried in the final report; only thread spawn itself
    /// can fail here.
    pub fn start(spec: &LoadSpec) -> Result<Self> {
        let started = Instant::now();
        let deadline = started + spec.duration;
        let assignment = assign_cpus(&spec.cpus, spec.workers);

        let mut workers = Vec::with_capacity(assignment.len());
        for (index, &cpu) in assignment.iter().enumerate() {
            let pinned = Arc::new(AtomicBool::new(false));
            let work_units = Arc::new(AtomicU64::new(0));

            let pinned_w = pinned.clone();
            let work_units_w = work_units.clone();
            let handle = thread::Builder::new()
                .name(format!("burner-{index}"))
                .spawn(move || burner(index, cpu, deadline, &pinned_w, &work_units_w))
                .with_context(|| format!("Failed to spawn worker {index}"))?;

            workers.push(Worker {
                index,
                cpu,
                pinned,
                work_units,
                handle,
            });
        }

        Ok(Self {
            deadline,
            started,
            grace: spec.grace,
            workers,
        })
    }

    /// The absolute deadline every worker polls against.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to observe the deadline and exit, bounded by
    /// the grace timeout. A worker that fails to exit promptly is logged
    /// and abandoned rather than allowed to block process termination.
    pub fn join(self) -> LoadSummary {
        let grace_deadline = self.deadline + self.grace;
        let mut reports = Vec::with_capacity(self.workers.len());

        for worker in self.workers {
            let completed = loop {
                if worker.handle.is_finished() {
                    // Can only panic if the worker panicked; burner doesn't.
                    let _ = worker.handle.join();
                    break true;
                }
                if Instant::now() >= grace_deadline {
                    warn!(
                        "worker {} (CPU {}) still running {}ms past deadline, abandoning",
                        worker.index,
                        worker.cpu,
                        self.grace.as_millis()
                    );
                    break false;
                }
                thread::sleep(JOIN_POLL);
            };

            reports.push(WorkerReport {
                index: worker.index,
                cpu: worker.cpu,
                pinned: worker.pinned.load(Ordering::Relaxed),
                work_units: worker.work_units.load(Ordering::Relaxed),
                completed,
            });
        }

        let total_work_units = reports.iter().map(|r| r.work_units).sum();
        LoadSummary {
            workers: reports,
            total_work_units,
            elapsed: self.started.elapsed(),
        }
    }
}

fn assign_cpus(cpus: &[usize], workers: Option<usize>) -> Vec<usize> {
    match workers {
        None => cpus.to_vec(),
        Some(n) => cpus.iter().copied().cycle().take(n).collect(),
    }
}

fn burner(index: usize, cpu: usize, deadline: Instant, pinned: &AtomicBool, work_units: &AtomicU64) {
    match affinity::pin_current_thread(cpu) {
        Ok(()) => pinned.store(true, Ordering::Relaxed),
        Err(e) => warn!("worker {index}: running unpinned, CPU {cpu} pin failed: {e:#}"),
    }

    while Instant::now() < deadline {
        black_box(work_unit());
        work_units.fetch_add(1, Ordering::Relaxed);
    }
    debug!("worker {index} (CPU {cpu}) reached deadline");
}

// Bounded, side-effect-free arithmetic. The exact computation carries no
// meaning; black_box at the call site keeps it from being elided.
fn work_unit() -> u64 {
    let mut acc = 0u64;
    for i in 0..WORK_UNIT_LEN {
        acc = acc.wrapping_add(i);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cpus() -> Vec<usize> {
        crate::affinity::current_affinity().unwrap_or_else(|_| vec![0])
    }

    fn run(spec: &LoadSpec) -> Result<LoadSummary> {
        Ok(LoadGenerator::start(spec)?.join())
    }

    #[test]
    fn test_one_worker_per_cpu() {
        let cpus = test_cpus();
        let spec = LoadSpec {
            duration: Duration::from_millis(100),
            cpus: cpus.clone(),
            workers: None,
            grace: Duration::from_millis(500),
        };
        let summary = run(&spec).unwrap();
        assert_eq!(summary.workers.len(), cpus.len());
        for report in &summary.workers {
            assert!(report.completed);
            assert!(report.work_units > 0);
        }
        assert!(summary.total_work_units > 0);
    }

    #[test]
    fn test_explicit_worker_count_cycles_cpus() {
        let first = test_cpus()[0];
        let spec = LoadSpec {
            duration: Duration::from_millis(50),
            cpus: vec![first],
            workers: Some(3),
            grace: Duration::from_millis(500),
        };
        let summary = run(&spec).unwrap();
        assert_eq!(summary.workers.len(), 3);
        assert!(summary.workers.iter().all(|r| r.cpu == first));
    }

    #[test]
    fn test_duration_bounds() {
        let duration = Duration::from_millis(300);
        let grace = Duration::from_millis(700);
        let spec = LoadSpec {
            duration,
            cpus: test_cpus().into_iter().take(2).collect(),
            workers: None,
            grace,
        };
        let summary = run(&spec).unwrap();
        assert!(summary.elapsed >= duration);
        assert!(summary.elapsed < duration + grace);
    }

    #[test]
    fn test_assign_cpus() {
        assert_eq!(assign_cpus(&[0, 2, 4], None), vec![0, 2, 4]);
        assert_eq!(assign_cpus(&[0, 2, 4], Some(2)), vec![0, 2]);
        assert_eq!(assign_cpus(&[0, 2], Some(5)), vec![0, 2, 0, 2, 0]);
        assert_eq!(assign_cpus(&[], Some(3)), Vec::<usize>::new());
    }
}
