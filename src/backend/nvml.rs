use super::{unknown_device, BackendKind, DeviceHandle, GpuBackend, RawProcess, RawReading};
use crate::data::{ClockDomain, ClockMetrics, DomainClocks, WorkloadType};
use crate::error::Result;
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::struct_wrappers::device::ProcessInfo as NvmlProcess;
use nvml_wrapper::{Device, Nvml};
use std::collections::HashMap;
use tracing::{debug, warn};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Everything one NVML pass could read for a device. Units are NVML's own
/// (bytes, milliwatts); the snapshot builder converts them.
#[derive(Clone, Debug, Default)]
pub struct NvmlReading {
    // identity
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub driver_version: Option<String>,
    pub vbios_version: Option<String>,
    pub brand: Option<u32>,
    pub compute_capability: Option<(i32, i32)>,
    pub serial: Option<String>,
    // performance
    pub utilization_gpu: Option<u32>,
    pub utilization_memory: Option<u32>,
    pub performance_state: Option<u32>,
    pub compute_mode: Option<u32>,
    // memory
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub memory_free_bytes: Option<u64>,
    pub bar1_used_bytes: Option<u64>,
    pub bar1_total_bytes: Option<u64>,
    // power and thermal
    pub temperature: Option<u32>,
    pub power_usage_mw: Option<u32>,
    pub power_limit_mw: Option<u32>,
    pub power_min_limit_mw: Option<u32>,
    pub power_max_limit_mw: Option<u32>,
    pub fan_speed: Option<u32>,
    pub throttle_reasons: Option<u64>,
    // clocks
    pub clocks: ClockMetrics,
    // connectivity
    pub pcie_gen_current: Option<u32>,
    pub pcie_gen_max: Option<u32>,
    pub pcie_width_current: Option<u32>,
    pub pcie_width_max: Option<u32>,
    pub bus_id: Option<String>,
}

pub struct NvmlBackend {
    nvml: Nvml,
}

impl NvmlBackend {
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init()?;
        // Fail early if the driver loads but reports nothing usable
        let count = nvml.device_count()?;
        debug!(count, "NVML reports devices");
        Ok(Self { nvml })
    }

    fn device(&self, handle: &DeviceHandle) -> Result<Device<'_>> {
        self.nvml
            .device_by_index(handle.index)
            .map_err(|_| unknown_device(handle))
    }
}

/// Turns a failed NVML call into an absent metric.
fn soft<T>(metric: &'static str, result: std::result::Result<T, NvmlError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(metric, error = %e, "NVML metric unavailable");
            None
        }
    }
}

fn nvml_clock(domain: ClockDomain) -> Clock {
    match domain {
        ClockDomain::Graphics => Clock::Graphics,
        ClockDomain::StreamingMultiprocessor => Clock::SM,
        ClockDomain::Memory => Clock::Memory,
        ClockDomain::Video => Clock::Video,
    }
}

fn read_clocks(device: &Device<'_>) -> ClockMetrics {
    let mut clocks = ClockMetrics::default();
    for domain in ClockDomain::ALL {
        let clock = nvml_clock(domain);
        *clocks.domain_mut(domain) = DomainClocks {
            current_mhz: soft("clock", device.clock_info(clock.clone())),
            max_mhz: soft("max_clock", device.max_clock_info(clock.clone())),
            application_mhz: soft("applications_clock", device.applications_clock(clock.clone())),
            default_application_mhz: soft(
                "default_applications_clock",
                device.default_applications_clock(clock),
            ),
        };
    }
    clocks
}

// Unattributed memory is reported as 0.0 MiB, see `ProcessInfo::memory_mib`
fn used_mib(memory: &UsedGpuMemory) -> f64 {
    match memory {
        UsedGpuMemory::Used(bytes) => *bytes as f64 / BYTES_PER_MIB,
        UsedGpuMemory::Unavailable => 0.0,
    }
}

impl GpuBackend for NvmlBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nvml
    }

    fn list_devices(&self) -> Vec<DeviceHandle> {
        match self.nvml.device_count() {
            Ok(count) => (0..count).map(DeviceHandle::from_index).collect(),
            Err(e) => {
                warn!(error = %e, "NVML device enumeration failed");
                Vec::new()
            }
        }
    }

    fn read_raw(&self, handle: &DeviceHandle) -> Result<RawReading> {
        let device = self.device(handle)?;
        let mut raw = NvmlReading::default();

        raw.name = soft("name", device.name());
        raw.uuid = soft("uuid", device.uuid());
        raw.driver_version = soft("driver_version", self.nvml.sys_driver_version());
        raw.vbios_version = soft("vbios_version", device.vbios_version());
        raw.brand = soft("brand", device.brand()).map(|b| b.as_c() as u32);
        raw.compute_capability =
            soft("compute_capability", device.cuda_compute_capability()).map(|c| (c.major, c.minor));
        raw.serial = soft("serial", device.serial());

        if let Some(util) = soft("utilization", device.utilization_rates()) {
            raw.utilization_gpu = Some(util.gpu);
            raw.utilization_memory = Some(util.memory);
        }
        raw.performance_state = soft("performance_state", device.performance_state())
            .map(|p| p.as_c() as u32)
            .filter(|p| *p <= 15);
        raw.compute_mode = soft("compute_mode", device.compute_mode()).map(|m| m.as_c() as u32);

        if let Some(mem) = soft("memory_info", device.memory_info()) {
            raw.memory_used_bytes = Some(mem.used);
            raw.memory_total_bytes = Some(mem.total);
            raw.memory_free_bytes = Some(mem.free);
        }
        if let Some(bar1) = soft("bar1_memory_info", device.bar1_memory_info()) {
            raw.bar1_used_bytes = Some(bar1.used);
            raw.bar1_total_bytes = Some(bar1.total);
        }

        raw.temperature = soft("temperature", device.temperature(TemperatureSensor::Gpu));
        raw.power_usage_mw = soft("power_usage", device.power_usage());
        raw.power_limit_mw = soft("power_limit", device.power_management_limit());
        if let Some(constraints) = soft(
            "power_limit_constraints",
            device.power_management_limit_constraints(),
        ) {
            raw.power_min_limit_mw = Some(constraints.min_limit);
            raw.power_max_limit_mw = Some(constraints.max_limit);
        }
        raw.fan_speed = soft("fan_speed", device.fan_speed(0));
        raw.throttle_reasons =
            soft("throttle_reasons", device.current_throttle_reasons()).map(|r| r.bits());

        raw.clocks = read_clocks(&device);

        raw.pcie_gen_current = soft("pcie_gen", device.current_pcie_link_gen());
        raw.pcie_gen_max = soft("pcie_gen_max", device.max_pcie_link_gen());
        raw.pcie_width_current = soft("pcie_width", device.current_pcie_link_width());
        raw.pcie_width_max = soft("pcie_width_max", device.max_pcie_link_width());
        raw.bus_id = soft("pci_info", device.pci_info()).map(|pci| pci.bus_id);

        Ok(RawReading::Nvml(raw))
    }

    fn list_processes(&self) -> Vec<RawProcess> {
        let mut processes = Vec::new();
        for handle in self.list_devices() {
            let Ok(device) = self.device(&handle) else {
                continue;
            };
            let Some(uuid) = soft("uuid", device.uuid()) else {
                continue;
            };

            let sm_util: HashMap<u32, f64> =
                soft("process_utilization", device.process_utilization_stats(None::<u64>))
                    .unwrap_or_default()
                    .into_iter()
                    .map(|sample| (sample.pid, sample.sm_util as f64))
                    .collect();

            let mut push = |list: Vec<NvmlProcess>, workload: WorkloadType| {
                for proc in list {
                    // A pid doing graphics and compute shows up in both lists
                    if processes
                        .iter()
                        .any(|p: &RawProcess| p.pid == proc.pid && p.device_uuid == uuid)
                    {
                        continue;
                    }
                    processes.push(RawProcess {
                        device_uuid: uuid.clone(),
                        pid: proc.pid,
                        memory_mib: used_mib(&proc.used_gpu_memory),
                        name: None,
                        workload,
                        gpu_utilization: sm_util.get(&proc.pid).copied(),
                    });
                }
            };

            if let Some(list) = soft("compute_processes", device.running_compute_processes()) {
                push(list, WorkloadType::Compute);
            }
            if let Some(list) = soft("graphics_processes", device.running_graphics_processes()) {
                push(list, WorkloadType::Graphics);
            }
        }
        processes
    }

    fn shutdown(self) {
        if let Err(e) = self.nvml.shutdown() {
            warn!(error = %e, "NVML shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_memory_in_mib() {
        assert_eq!(used_mib(&UsedGpuMemory::Used(512 * 1024 * 1024)), 512.0);
        assert_eq!(used_mib(&UsedGpuMemory::Unavailable), 0.0);
    }
}
