// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Scheduler affinity of the calling thread.
//!
//! Thin wrappers around `sched_getaffinity(2)` / `sched_setaffinity(2)`.
//! Everything operates on the calling thread (pid 0), which is what both
//! the prober and the per-CPU load workers need. On non-Linux targets the
//! calls report "not available" and callers degrade as they see fit.

use anyhow::Result;

#[cfg(target_os = "linux")]
mod imp {
    use anyhow::Context;
    use anyhow::Result;
    use nix::sched::sched_getaffinity;
    use nix::sched::sched_setaffinity;
    use nix::sched::CpuSet;
    use nix::unistd::Pid;

    pub fn current_affinity() -> Result<Vec<usize>> {
        let set = sched_getaffinity(Pid::from_raw(0))
            .context("sched_getaffinity failed for the current thread")?;

        let mut cpus = vec![];
        for cpu in 0..CpuSet::count() {
            if set.is_set(cpu).unwrap_or(false) {
                cpus.push(cpu);
            }
        }
        Ok(cpus)
    }

    pub fn set_current_affinity(cpus: &[usize]) -> Result<()> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)
                .with_context(|| format!("CPU {cpu} does not fit in cpu_set_t"))?;
        }
        sched_setaffinity(Pid::from_raw(0), &set)
            .with_context(|| format!("sched_setaffinity({}) failed", crate::format_cpulist(cpus)))
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use anyhow::bail;
    use anyhow::Result;

    pub fn current_affinity() -> Result<Vec<usize>> {
        bail!("scheduler affinity is not available on this platform");
    }

    pub fn set_current_affinity(_cpus: &[usize]) -> Result<()> {
        bail!("scheduler affinity is not available on this platform");
    }
}

/// The set of CPUs the calling thread is allowed to run on.
pub fn current_affinity() -> Result<Vec<usize>> {
    imp::current_affinity()
}

/// Restrict the calling thread to the given CPUs.
pub fn set_current_affinity(cpus: &[usize]) -> Result<()> {
    imp::set_current_affinity(cpus)
}

/// Pin the calling thread to a single CPU.
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    set_current_affinity(&[cpu])
}

#[cfg(test)]
#[cfg(target_os = "linux")]
mod tests {
    use super::*;

    #[test]
    fn test_current_affinity_nonempty() {
        let cpus = current_affinity().unwrap();
        assert!(!cpus.is_empty());
    }

    #[test]
    fn test_pin_and_restore() {
        let original = current_affinity().unwrap();
        let target = original[0];

        pin_current_thread(target).unwrap();
        assert_eq!(current_affinity().unwrap(), vec![target]);

        set_current_affinity(&original).unwrap();
        assert_eq!(current_affinity().unwrap(), original);
    }
}
