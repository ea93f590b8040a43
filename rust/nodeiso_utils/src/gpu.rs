// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! NVML inventory of the GPUs visible to this process.
//!
//! With MIG enabled, each granted slice shows up as its own device and the
//! launcher's CUDA_VISIBLE_DEVICES carries its UUID; listing what NVML can
//! see next to that variable is how an operator confirms the partition
//! took. A host without the NVIDIA runtime yields an empty inventory,
//! never an error.

use crate::misc::read_optional_file;
use nvml_wrapper::bitmasks::InitFlags;
use nvml_wrapper::Nvml;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Gpu {
    pub index: u32,
    pub name: String,
    pub uuid: String,
    /// Total device memory in bytes.
    pub memory: u64,
    /// NUMA node the device is attached to, from the PCI bus id.
    pub node_id: usize,
}

/// Enumerate the NVIDIA devices NVML exposes to this process.
pub fn enumerate_gpus() -> Vec<Gpu> {
    let mut gpus = vec![];

    // Don't fail if the system has no NVIDIA GPUs.
    let Ok(nvml) = Nvml::init_with_flags(InitFlags::NO_GPUS) else {
        return gpus;
    };
    let Ok(count) = nvml.device_count() else {
        return gpus;
    };

    for i in 0..count {
        let Ok(device) = nvml.device_by_index(i) else {
            continue;
        };
        let Ok(index) = device.index() else {
            continue;
        };
        let Ok(memory_info) = device.memory_info() else {
            continue;
        };
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let uuid = device.uuid().unwrap_or_else(|_| "unknown".to_string());
        let node_id = device
            .pci_info()
            .ok()
            .map(|pci| pci_numa_node(&pci.bus_id))
            .unwrap_or(0);

        gpus.push(Gpu {
            index,
            name,
            uuid,
            memory: memory_info.total,
            node_id,
        });
    }

    gpus
}

// NVML reports an uppercase PCIe bus id with four extra leading zeros;
// sysfs wants neither.
fn pci_numa_node(bus_id: &str) -> usize {
    let bus_id = bus_id.to_lowercase();
    let fixed_bus_id = bus_id.strip_prefix("0000").unwrap_or("");
    let numa_path = format!("/sys/bus/pci/devices/{fixed_bus_id}/numa_node");
    let node = read_optional_file(Path::new(&numa_path)).and_then(|v| v.parse::<i64>().ok());
    match node {
        // single-node hosts report -1
        Some(node) if node >= 0 => node as usize,
        _ => 0,
    }
}
