//! Normalizes a backend's raw reading into a [`GpuSnapshot`].
//!
//! Groups are filled in a fixed order (identity, performance, memory,
//! power/thermal, clocks, connectivity), each from whatever the raw reading
//! holds, so a missing group never blocks the others. The builder reads the
//! history store but never writes to it.

use crate::backend::{NvmlReading, RawReading, SmiRecord};
use crate::data::{
    Brand, ClockMetrics, ComputeCapability, ComputeMode, ConnectivityMetrics, DeviceIdentity,
    DomainClocks, GpuSnapshot, MemoryMetrics, PerformanceMetrics, PowerThermalMetrics,
    ProcessCounts, ThrottleReason,
};
use crate::derived;
use crate::history::SampleHistory;
use crate::reference::architecture_for;
use chrono::{DateTime, Utc};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

pub struct SnapshotBuilder<'a> {
    history: &'a SampleHistory,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(history: &'a SampleHistory) -> Self {
        Self { history }
    }

    /// Builds a complete snapshot, derived metrics included.
    pub fn build(&self, device_id: &str, raw: &RawReading, captured_at: DateTime<Utc>) -> GpuSnapshot {
        let mut snapshot = match raw {
            RawReading::Nvml(r) => from_nvml(device_id, r, captured_at),
            RawReading::Smi(r) => from_smi(device_id, r, captured_at),
        };
        let previous = self.history.get(device_id);
        snapshot.derived = derived::compute(&snapshot, previous.as_ref());
        snapshot
    }
}

fn empty_snapshot(device_id: &str, captured_at: DateTime<Utc>) -> GpuSnapshot {
    GpuSnapshot {
        device_id: device_id.to_string(),
        identity: DeviceIdentity::default(),
        performance: PerformanceMetrics::default(),
        memory: MemoryMetrics::default(),
        power_thermal: PowerThermalMetrics::default(),
        clocks: ClockMetrics::default(),
        connectivity: ConnectivityMetrics::default(),
        derived: Default::default(),
        processes: ProcessCounts::default(),
        captured_at,
    }
}

fn mib(bytes: Option<u64>) -> Option<f64> {
    bytes.map(|b| b as f64 / BYTES_PER_MIB)
}

fn watts(milliwatts: Option<u32>) -> Option<f64> {
    milliwatts.map(|mw| mw as f64 / 1000.0)
}

fn with_architecture(mut identity: DeviceIdentity) -> DeviceIdentity {
    identity.architecture = identity
        .name
        .as_deref()
        .map(|name| architecture_for(name).to_string());
    identity
}

fn from_nvml(device_id: &str, raw: &NvmlReading, captured_at: DateTime<Utc>) -> GpuSnapshot {
    let mut snapshot = empty_snapshot(device_id, captured_at);

    snapshot.identity = with_architecture(DeviceIdentity {
        name: raw.name.clone(),
        uuid: raw.uuid.clone(),
        driver_version: raw.driver_version.clone(),
        vbios_version: raw.vbios_version.clone(),
        brand: raw.brand.map(Brand::from_raw),
        architecture: None,
        compute_capability: raw.compute_capability.and_then(|(major, minor)| {
            Some(ComputeCapability {
                major: u32::try_from(major).ok()?,
                minor: u32::try_from(minor).ok()?,
            })
        }),
        serial: raw.serial.clone(),
    });

    snapshot.performance = PerformanceMetrics {
        utilization_gpu: raw.utilization_gpu.map(f64::from),
        utilization_memory: raw.utilization_memory.map(f64::from),
        performance_state: raw.performance_state,
        compute_mode: raw.compute_mode.map(ComputeMode::from_raw),
    };

    snapshot.memory = MemoryMetrics {
        used_mib: mib(raw.memory_used_bytes),
        total_mib: mib(raw.memory_total_bytes),
        free_mib: mib(raw.memory_free_bytes),
        bar1_used_mib: mib(raw.bar1_used_bytes),
        bar1_total_mib: mib(raw.bar1_total_bytes),
    };

    snapshot.power_thermal = PowerThermalMetrics {
        temperature_c: raw.temperature.map(f64::from),
        power_draw_w: watts(raw.power_usage_mw),
        power_limit_w: watts(raw.power_limit_mw),
        power_min_limit_w: watts(raw.power_min_limit_mw),
        power_max_limit_w: watts(raw.power_max_limit_mw),
        fan_speed_pct: raw.fan_speed.map(f64::from),
        throttle_reasons: raw.throttle_reasons.map(ThrottleReason::decode),
    };

    snapshot.clocks = raw.clocks.clone();

    snapshot.connectivity = ConnectivityMetrics {
        pcie_gen_current: raw.pcie_gen_current,
        pcie_gen_max: raw.pcie_gen_max,
        pcie_width_current: raw.pcie_width_current,
        pcie_width_max: raw.pcie_width_max,
        bus_id: raw.bus_id.clone(),
    };

    snapshot
}

fn owned(record: &SmiRecord, field: &str) -> Option<String> {
    record.text(field).map(str::to_string)
}

fn from_smi(device_id: &str, raw: &SmiRecord, captured_at: DateTime<Utc>) -> GpuSnapshot {
    let mut snapshot = empty_snapshot(device_id, captured_at);

    snapshot.identity = with_architecture(DeviceIdentity {
        name: owned(raw, "name"),
        uuid: owned(raw, "uuid"),
        driver_version: owned(raw, "driver_version"),
        vbios_version: owned(raw, "vbios_version"),
        brand: None,
        architecture: None,
        compute_capability: None,
        serial: owned(raw, "serial"),
    });

    snapshot.performance = PerformanceMetrics {
        utilization_gpu: raw.number("utilization.gpu"),
        utilization_memory: raw.number("utilization.memory"),
        performance_state: raw
            .text("pstate")
            .and_then(|p| p.trim_start_matches(['P', 'p']).parse().ok()),
        compute_mode: raw.text("compute_mode").and_then(ComputeMode::from_smi),
    };

    snapshot.memory = MemoryMetrics {
        used_mib: raw.number("memory.used"),
        total_mib: raw.number("memory.total"),
        free_mib: raw.number("memory.free"),
        bar1_used_mib: None,
        bar1_total_mib: None,
    };

    snapshot.power_thermal = PowerThermalMetrics {
        temperature_c: raw.number("temperature.gpu"),
        power_draw_w: raw.number("power.draw"),
        power_limit_w: raw.number("power.limit"),
        power_min_limit_w: raw.number("power.min_limit"),
        power_max_limit_w: raw.number("power.max_limit"),
        fan_speed_pct: raw.number("fan.speed"),
        throttle_reasons: raw
            .bitmask("clocks_throttle_reasons.active")
            .map(ThrottleReason::decode),
    };

    snapshot.clocks = ClockMetrics {
        graphics: DomainClocks {
            current_mhz: raw.integer("clocks.gr"),
            max_mhz: raw.integer("clocks.max.gr"),
            application_mhz: raw.integer("clocks.applications.gr"),
            default_application_mhz: raw.integer("clocks.default_applications.gr"),
        },
        sm: DomainClocks {
            current_mhz: raw.integer("clocks.sm"),
            max_mhz: raw.integer("clocks.max.sm"),
            ..DomainClocks::default()
        },
        memory: DomainClocks {
            current_mhz: raw.integer("clocks.mem"),
            max_mhz: raw.integer("clocks.max.mem"),
            application_mhz: raw.integer("clocks.applications.mem"),
            default_application_mhz: raw.integer("clocks.default_applications.mem"),
        },
        video: DomainClocks {
            current_mhz: raw.integer("clocks.video"),
            ..DomainClocks::default()
        },
    };

    snapshot.connectivity = ConnectivityMetrics {
        pcie_gen_current: raw.integer("pcie.link.gen.current"),
        pcie_gen_max: raw.integer("pcie.link.gen.max"),
        pcie_width_current: raw.integer("pcie.link.width.current"),
        pcie_width_max: raw.integer("pcie.link.width.max"),
        bus_id: owned(raw, "pci.bus_id"),
    };

    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::GPU_QUERY_FIELDS;
    use crate::data::ClockDomain;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn rtx_4090() -> NvmlReading {
        let mut raw = NvmlReading {
            name: Some("NVIDIA GeForce RTX 4090".to_string()),
            uuid: Some("GPU-4090".to_string()),
            brand: Some(5),
            compute_capability: Some((8, 9)),
            utilization_gpu: Some(80),
            utilization_memory: Some(30),
            performance_state: Some(2),
            compute_mode: Some(0),
            memory_used_bytes: Some(4096 * 1024 * 1024),
            memory_total_bytes: Some(24564 * 1024 * 1024),
            power_usage_mw: Some(350_500),
            throttle_reasons: Some(0x4),
            pcie_gen_current: Some(4),
            ..NvmlReading::default()
        };
        raw.clocks.domain_mut(ClockDomain::StreamingMultiprocessor).current_mhz = Some(2500);
        raw.clocks.domain_mut(ClockDomain::StreamingMultiprocessor).max_mhz = Some(2520);
        raw
    }

    #[test]
    fn test_nvml_scenario_rtx_4090() {
        let history = SampleHistory::new();
        let snap = SnapshotBuilder::new(&history).build("0", &RawReading::Nvml(rtx_4090()), t0());

        assert_eq!(snap.identity.architecture.as_deref(), Some("Ada Lovelace"));
        assert_eq!(snap.identity.brand, Some(Brand::GeForce));
        assert_eq!(
            snap.identity.compute_capability,
            Some(ComputeCapability { major: 8, minor: 9 })
        );
        assert_eq!(snap.memory.used_mib, Some(4096.0));
        assert_eq!(snap.power_thermal.power_draw_w, Some(350.5));
        assert_eq!(
            snap.power_thermal.throttle_reasons,
            Some(vec![ThrottleReason::SwPowerCap])
        );
        assert_eq!(snap.performance.compute_mode, Some(ComputeMode::Default));
        assert_eq!(snap.derived.peak_tflops, 82.6);
        let expected = (2500.0 / 2520.0) * 0.80 * 100.0;
        assert!((snap.derived.mfu_percent - expected).abs() < 1e-9);
        assert_eq!(snap.derived.memory_change_rate_mib_s, None);
        // Fields the reading did not carry stay absent
        assert_eq!(snap.power_thermal.temperature_c, None);
        assert_eq!(snap.connectivity.bus_id, None);
    }

    #[test]
    fn test_no_name_means_no_architecture() {
        let history = SampleHistory::new();
        let raw = NvmlReading {
            utilization_gpu: Some(10),
            ..NvmlReading::default()
        };
        let snap = SnapshotBuilder::new(&history).build("3", &RawReading::Nvml(raw), t0());
        assert_eq!(snap.identity.architecture, None);
        assert_eq!(snap.derived.peak_tflops, 0.0);
        assert_eq!(snap.derived.mfu_percent, 0.0);
    }

    #[test]
    fn test_rate_uses_history_without_mutating_it() {
        let history = SampleHistory::new();
        history.commit("0", Some(2048.0), t0());

        let builder = SnapshotBuilder::new(&history);
        let snap = builder.build(
            "0",
            &RawReading::Nvml(rtx_4090()),
            t0() + Duration::seconds(4),
        );
        assert_eq!(snap.derived.memory_change_rate_mib_s, Some(512.0));
        assert_eq!(history.get("0").map(|h| h.used_memory_mib), Some(2048.0));
    }

    #[test]
    fn test_same_reading_twice_is_stable() {
        let history = SampleHistory::new();
        let builder = SnapshotBuilder::new(&history);
        let raw = RawReading::Nvml(rtx_4090());
        let a = builder.build("0", &raw, t0());
        let b = builder.build("0", &raw, t0());
        assert_eq!(a, b);
    }

    fn smi_line(values: &[(&str, &str)]) -> String {
        GPU_QUERY_FIELDS
            .iter()
            .map(|f| {
                values
                    .iter()
                    .find(|(name, _)| name == f)
                    .map(|(_, v)| *v)
                    .unwrap_or("[N/A]")
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[test]
    fn test_smi_scenario_v100_without_clocks() {
        let line = smi_line(&[
            ("index", "0"),
            ("uuid", "GPU-v100"),
            ("name", "Tesla V100 32GB"),
            ("pstate", "P0"),
            ("compute_mode", "Exclusive_Process"),
            ("utilization.gpu", "50"),
            ("memory.used", "1024"),
        ]);
        let history = SampleHistory::new();
        let raw = RawReading::Smi(SmiRecord::from_line(&line));
        let snap = SnapshotBuilder::new(&history).build("0", &raw, t0());

        assert_eq!(snap.identity.architecture.as_deref(), Some("Volta"));
        assert_eq!(snap.identity.serial, None);
        assert_eq!(snap.performance.performance_state, Some(0));
        assert_eq!(
            snap.performance.compute_mode,
            Some(ComputeMode::ExclusiveProcess)
        );
        // Not-applicable numerics fall back to zero
        assert_eq!(snap.power_thermal.temperature_c, Some(0.0));
        assert_eq!(snap.clocks.sm.current_mhz, Some(0));
        assert_eq!(snap.power_thermal.throttle_reasons, Some(Vec::new()));
        assert_eq!(snap.derived.peak_tflops, 15.7);
        assert!((snap.derived.mfu_percent - 50.0).abs() < 1e-9);
    }
}
