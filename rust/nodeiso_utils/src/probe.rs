// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! One-shot snapshot of the process's resource bindings.
//!
//! Everything here reads kernel-exposed state exactly once per call and
//! never caches: if an external controller rewrites the cgroup between two
//! probes, the two reports legitimately differ. Each probed fact is either
//! present or absent; a failed read of a pseudo-file is the current truth
//! of this host, not an error to propagate.

use crate::affinity;
use crate::format_cpulist;
use crate::misc::read_optional_file;
use log::debug;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

const PROC_STATUS: &str = "/proc/self/status";
const PROC_CGROUP: &str = "/proc/self/cgroup";
const PROC_STAT: &str = "/proc/self/stat";
const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

/// The environment variable the MIG launcher uses to expose a slice.
/// Opaque to us; typically a device ordinal or a MIG UUID.
pub const GPU_VISIBILITY_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Snapshot of the process's resource bindings at probe time.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub pid: u32,
    pub hostname: String,
    /// CPUs the process may be scheduled onto. Never empty: if the
    /// affinity read fails this falls back to all cores visible to the
    /// runtime and `cpus_approximate` is set.
    pub cpus: Vec<usize>,
    pub cpus_approximate: bool,
    /// `Cpus_allowed_list` from `/proc/self/status`.
    pub cpus_allowed: Option<String>,
    /// `Mems_allowed_list` from `/proc/self/status`.
    pub mems_allowed: Option<String>,
    /// cgroup v2 path from `/proc/self/cgroup`.
    pub cgroup: Option<String>,
    /// The cgroup's `cpuset.cpus` attribute.
    pub cgroup_cpuset: Option<String>,
    /// The cgroup's `cpuset.mems` attribute.
    pub cgroup_mems: Option<String>,
    /// [`GPU_VISIBILITY_ENV`], verbatim.
    pub gpu_visibility: Option<String>,
}

/// Probe the current process. Cannot fail; unavailable facts come back
/// absent and the CPU list degrades to the runtime-visible range.
pub fn probe() -> ProbeReport {
    let (cpus, cpus_approximate) = match affinity::current_affinity() {
        Ok(cpus) if !cpus.is_empty() => (cpus, false),
        Ok(_) => (runtime_visible_cpus(), true),
        Err(e) => {
            debug!("affinity read failed, falling back to visible cores: {e:#}");
            (runtime_visible_cpus(), true)
        }
    };

    let status = fs::read_to_string(PROC_STATUS).ok();
    let cpus_allowed = status
        .as_deref()
        .and_then(|s| status_field(s, "Cpus_allowed_list"));
    let mems_allowed = status
        .as_deref()
        .and_then(|s| status_field(s, "Mems_allowed_list"));

    let cgroup = fs::read_to_string(PROC_CGROUP)
        .ok()
        .and_then(|s| cgroup_v2_path(&s));
    let (cgroup_cpuset, cgroup_mems) = match &cgroup {
        Some(path) => {
            let base = Path::new(CGROUP_FS_ROOT).join(path.trim_start_matches('/'));
            (
                read_optional_file(&base.join("cpuset.cpus")),
                read_optional_file(&base.join("cpuset.mems")),
            )
        }
        None => (None, None),
    };

    ProbeReport {
        pid: std::process::id(),
        hostname: hostname(),
        cpus,
        cpus_approximate,
        cpus_allowed,
        mems_allowed,
        cgroup,
        cgroup_cpuset,
        cgroup_mems,
        gpu_visibility: env::var(GPU_VISIBILITY_ENV).ok(),
    }
}

/// The CPU the calling thread last ran on, from `/proc/self/stat`.
pub fn current_cpu() -> Option<usize> {
    let stat = fs::read_to_string(PROC_STAT).ok()?;
    // comm may contain spaces; fields are only well-defined past the ')'.
    // "processor" is field 39, i.e. the 37th after state.
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(36)?.parse().ok()
}

fn runtime_visible_cpus() -> Vec<usize> {
    let nr = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..nr).collect()
}

fn status_field(status: &str, key: &str) -> Option<String> {
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix(key) {
            if let Some(val) = rest.strip_prefix(':') {
                return Some(val.trim().to_string());
            }
        }
    }
    None
}

fn cgroup_v2_path(cgroup: &str) -> Option<String> {
    for line in cgroup.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return Some(path.trim().to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(not(target_os = "linux"))]
fn hostname() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let absent = |v: &Option<String>| -> String {
            v.clone().unwrap_or_else(|| "<absent>".to_string())
        };

        writeln!(f, "Host: {}  PID: {}", self.hostname, self.pid)?;
        writeln!(
            f,
            "Allowed CPUs (affinity): {} ({} CPUs){}",
            format_cpulist(&self.cpus),
            self.cpus.len(),
            if self.cpus_approximate {
                "  [approximate: affinity read unavailable]"
            } else {
                ""
            }
        )?;
        writeln!(f, "Cpus_allowed_list: {}", absent(&self.cpus_allowed))?;
        writeln!(f, "Mems_allowed_list: {}", absent(&self.mems_allowed))?;
        writeln!(f, "Cgroup (v2): {}", absent(&self.cgroup))?;
        writeln!(f, "Cgroup cpuset.cpus: {}", absent(&self.cgroup_cpuset))?;
        writeln!(f, "Cgroup cpuset.mems: {}", absent(&self.cgroup_mems))?;
        writeln!(
            f,
            "{}: {}",
            GPU_VISIBILITY_ENV,
            self.gpu_visibility.as_deref().unwrap_or("<unset>")
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_STATUS: &str = "\
Name:\tisoprobe
Umask:\t0022
Cpus_allowed:\tff
Cpus_allowed_list:\t0-7
Mems_allowed_list:\t0
Seccomp:\t0
";

    #[test]
    fn test_status_field() {
        assert_eq!(
            status_field(SAMPLE_STATUS, "Cpus_allowed_list").as_deref(),
            Some("0-7")
        );
        assert_eq!(
            status_field(SAMPLE_STATUS, "Mems_allowed_list").as_deref(),
            Some("0")
        );
        assert_eq!(status_field(SAMPLE_STATUS, "Cpus_allowed_lis"), None);
        assert_eq!(status_field("", "Cpus_allowed_list"), None);
    }

    #[test]
    fn test_cgroup_v2_path() {
        assert_eq!(
            cgroup_v2_path("0::/mig/mig0\n").as_deref(),
            Some("/mig/mig0")
        );
        // v1 lines don't count
        assert_eq!(cgroup_v2_path("4:cpuset:/mig/mig0\n"), None);
        assert_eq!(
            cgroup_v2_path("4:cpuset:/legacy\n0::/system.slice/a.service\n").as_deref(),
            Some("/system.slice/a.service")
        );
    }

    #[test]
    fn test_probe_never_empty() {
        let report = probe();
        assert!(!report.cpus.is_empty());
        assert_eq!(report.pid, std::process::id());
    }

    #[test]
    fn test_fallback_cpus_nonempty() {
        assert!(!runtime_visible_cpus().is_empty());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_current_cpu() {
        let cpu = current_cpu().unwrap();
        assert!(cpu < 4096);
    }

    #[test]
    fn test_report_renders_absent_fields() {
        let report = ProbeReport {
            pid: 1,
            hostname: "node0".to_string(),
            cpus: vec![0, 1, 2, 3],
            cpus_approximate: true,
            cpus_allowed: None,
            mems_allowed: None,
            cgroup: None,
            cgroup_cpuset: None,
            cgroup_mems: None,
            gpu_visibility: None,
        };
        let text = report.to_string();
        assert!(text.contains("0-3 (4 CPUs)"));
        assert!(text.contains("[approximate"));
        assert!(text.contains("Cgroup (v2): <absent>"));
        assert!(text.contains("CUDA_VISIBLE_DEVICES: <unset>"));
    }
}
