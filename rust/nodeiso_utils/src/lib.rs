// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utility collection for the nodeiso diagnostics
//!
//! nodeiso is a set of standalone tools for checking that a compute node's
//! CPU cores, NUMA memory nodes, and GPU partitions (NVIDIA MIG slices)
//! have been isolated the way the orchestration layer (systemd slices,
//! cgroups, a MIG launcher wrapper) intended.
//!
//! This crate holds the logic shared by the tools:
//!
//! - reading the process's allowed CPUs, NUMA nodes, and cgroup attributes,
//! - pinning worker threads and driving a deadline-bounded busy loop,
//! - an accelerator matmul loop behind a minimal device interface,
//! - the Unix-socket ring exchange used by the multi-process check.
//!
//! Everything here is a one-shot snapshot or a single bounded run. None of
//! it keeps state across invocations.

mod misc;

mod cpulist;
pub use cpulist::format_cpulist;
pub use cpulist::parse_cpulist;

pub mod affinity;

mod probe;
pub use probe::probe;
pub use probe::current_cpu;
pub use probe::ProbeReport;

mod load;
pub use load::LoadGenerator;
pub use load::LoadSpec;
pub use load::LoadSummary;
pub use load::WorkerReport;

pub mod accel;

pub mod ring;

#[cfg(feature = "gpu-topology")]
pub mod gpu;
