//! Normalized telemetry types.
//!
//! Every metric is an `Option`: `None` means the backend could not supply
//! the value this cycle, which is distinct from a measured zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Product brand as reported by the driver
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Brand {
    Unknown,
    Quadro,
    Tesla,
    Nvs,
    Grid,
    GeForce,
    Titan,
    VApps,
    Vpc,
    Vcs,
    Vws,
    VGaming,
    Other(u32),
}

impl Brand {
    /// Maps the driver's numeric brand code.
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => Brand::Unknown,
            1 => Brand::Quadro,
            2 => Brand::Tesla,
            3 => Brand::Nvs,
            4 => Brand::Grid,
            5 => Brand::GeForce,
            6 => Brand::Titan,
            7 => Brand::VApps,
            8 => Brand::Vpc,
            9 => Brand::Vcs,
            10 => Brand::Vws,
            11 => Brand::VGaming,
            other => Brand::Other(other),
        }
    }
}

impl fmt::Display for Brand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Brand::Unknown => write!(f, "Unknown"),
            Brand::Quadro => write!(f, "Quadro"),
            Brand::Tesla => write!(f, "Tesla"),
            Brand::Nvs => write!(f, "NVS"),
            Brand::Grid => write!(f, "GRID"),
            Brand::GeForce => write!(f, "GeForce"),
            Brand::Titan => write!(f, "Titan"),
            Brand::VApps => write!(f, "vApps"),
            Brand::Vpc => write!(f, "VPC"),
            Brand::Vcs => write!(f, "VCS"),
            Brand::Vws => write!(f, "VWS"),
            Brand::VGaming => write!(f, "vGaming"),
            Brand::Other(code) => write!(f, "Brand({code})"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComputeMode {
    Default,
    ExclusiveThread,
    Prohibited,
    ExclusiveProcess,
    Other(u32),
}

impl ComputeMode {
    pub fn from_raw(code: u32) -> Self {
        match code {
            0 => ComputeMode::Default,
            1 => ComputeMode::ExclusiveThread,
            2 => ComputeMode::Prohibited,
            3 => ComputeMode::ExclusiveProcess,
            other => ComputeMode::Other(other),
        }
    }

    /// Parses nvidia-smi's `compute_mode` column ("Default", "Exclusive_Process", ...).
    pub fn from_smi(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().replace(' ', "_").as_str() {
            "default" => Some(ComputeMode::Default),
            "exclusive_thread" => Some(ComputeMode::ExclusiveThread),
            "prohibited" => Some(ComputeMode::Prohibited),
            "exclusive_process" => Some(ComputeMode::ExclusiveProcess),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// Static device information
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: Option<String>,
    pub uuid: Option<String>,
    pub driver_version: Option<String>,
    pub vbios_version: Option<String>,
    pub brand: Option<Brand>,
    pub architecture: Option<String>,
    pub compute_capability: Option<ComputeCapability>,
    pub serial: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub utilization_gpu: Option<f64>,
    pub utilization_memory: Option<f64>,
    /// P-level, 0 (maximum performance) through 15.
    pub performance_state: Option<u32>,
    pub compute_mode: Option<ComputeMode>,
}

// Memory figures in MiB
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub used_mib: Option<f64>,
    pub total_mib: Option<f64>,
    pub free_mib: Option<f64>,
    pub bar1_used_mib: Option<f64>,
    pub bar1_total_mib: Option<f64>,
}

/// Reasons the driver is currently holding clocks down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleReason {
    GpuIdle,
    ApplicationsClocksSetting,
    SwPowerCap,
    HwSlowdown,
    SyncBoost,
    SwThermalSlowdown,
    HwThermalSlowdown,
    HwPowerBrakeSlowdown,
    DisplayClockSetting,
    Unknown(u64),
}

const THROTTLE_BITS: &[(u64, ThrottleReason)] = &[
    (0x0001, ThrottleReason::GpuIdle),
    (0x0002, ThrottleReason::ApplicationsClocksSetting),
    (0x0004, ThrottleReason::SwPowerCap),
    (0x0008, ThrottleReason::HwSlowdown),
    (0x0010, ThrottleReason::SyncBoost),
    (0x0020, ThrottleReason::SwThermalSlowdown),
    (0x0040, ThrottleReason::HwThermalSlowdown),
    (0x0080, ThrottleReason::HwPowerBrakeSlowdown),
    (0x0100, ThrottleReason::DisplayClockSetting),
];

impl ThrottleReason {
    /// Splits a driver bitmask into named reasons. Bits without a name are
    /// kept together as a single `Unknown` entry.
    pub fn decode(bits: u64) -> Vec<ThrottleReason> {
        let mut reasons: Vec<ThrottleReason> = THROTTLE_BITS
            .iter()
            .filter(|(mask, _)| bits & mask != 0)
            .map(|(_, reason)| *reason)
            .collect();
        let known = THROTTLE_BITS.iter().fold(0u64, |acc, (mask, _)| acc | mask);
        if bits & !known != 0 {
            reasons.push(ThrottleReason::Unknown(bits & !known));
        }
        reasons
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerThermalMetrics {
    pub temperature_c: Option<f64>,
    pub power_draw_w: Option<f64>,
    pub power_limit_w: Option<f64>,
    pub power_min_limit_w: Option<f64>,
    pub power_max_limit_w: Option<f64>,
    pub fan_speed_pct: Option<f64>,
    pub throttle_reasons: Option<Vec<ThrottleReason>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClockDomain {
    Graphics,
    StreamingMultiprocessor,
    Memory,
    Video,
}

impl ClockDomain {
    pub const ALL: [ClockDomain; 4] = [
        ClockDomain::Graphics,
        ClockDomain::StreamingMultiprocessor,
        ClockDomain::Memory,
        ClockDomain::Video,
    ];
}

// Clock readings for one domain, MHz
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainClocks {
    pub current_mhz: Option<u32>,
    pub max_mhz: Option<u32>,
    pub application_mhz: Option<u32>,
    pub default_application_mhz: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClockMetrics {
    pub graphics: DomainClocks,
    pub sm: DomainClocks,
    pub memory: DomainClocks,
    pub video: DomainClocks,
}

impl ClockMetrics {
    pub fn domain_mut(&mut self, domain: ClockDomain) -> &mut DomainClocks {
        match domain {
            ClockDomain::Graphics => &mut self.graphics,
            ClockDomain::StreamingMultiprocessor => &mut self.sm,
            ClockDomain::Memory => &mut self.memory,
            ClockDomain::Video => &mut self.video,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectivityMetrics {
    pub pcie_gen_current: Option<u32>,
    pub pcie_gen_max: Option<u32>,
    pub pcie_width_current: Option<u32>,
    pub pcie_width_max: Option<u32>,
    pub bus_id: Option<String>,
}

/// Point-in-time analytics derived from a snapshot.
///
/// `peak_tflops`, `achieved_tflops` and `mfu_percent` are all zero when the
/// device model is not in the peak-throughput table: that means
/// "unmeasurable", not "idle". The MFU figure is a clock/utilization
/// heuristic, not a FLOP count.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub memory_change_rate_mib_s: Option<f64>,
    pub achieved_tflops: f64,
    pub peak_tflops: f64,
    pub mfu_percent: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCounts {
    pub compute: u32,
    pub graphics: u32,
}

/// One normalized reading of one device, built fresh every poll.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpuSnapshot {
    /// Stable per-device key (the device index as a string).
    pub device_id: String,
    pub identity: DeviceIdentity,
    pub performance: PerformanceMetrics,
    pub memory: MemoryMetrics,
    pub power_thermal: PowerThermalMetrics,
    pub clocks: ClockMetrics,
    pub connectivity: ConnectivityMetrics,
    pub derived: DerivedMetrics,
    pub processes: ProcessCounts,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    Compute,
    Graphics,
}

// Process information, correlated back to its owning device
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command_line: Option<String>,
    pub cpu_percent: Option<f32>,
    pub device_uuid: String,
    pub device_id: String,
    /// Memory footprint in MiB. `0.0` when the driver cannot attribute memory
    /// to the process (NVML `Unavailable`, nvidia-smi `[N/A]`, e.g. under
    /// Windows WDDM), not a measured zero.
    pub memory_mib: f64,
    pub workload: WorkloadType,
    /// SM utilization for this process. nvidia-smi cannot report it and
    /// always yields `Some(0.0)`.
    pub gpu_utilization: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_brand_codes() {
        assert_eq!(Brand::from_raw(5), Brand::GeForce);
        assert_eq!(Brand::from_raw(11), Brand::VGaming);
        assert_eq!(Brand::from_raw(42), Brand::Other(42));
        assert_eq!(Brand::VApps.to_string(), "vApps");
    }

    #[test]
    fn test_compute_mode_from_smi() {
        assert_eq!(ComputeMode::from_smi("Default"), Some(ComputeMode::Default));
        assert_eq!(
            ComputeMode::from_smi("Exclusive_Process"),
            Some(ComputeMode::ExclusiveProcess)
        );
        assert_eq!(ComputeMode::from_smi("[N/A]"), None);
        assert_eq!(ComputeMode::from_raw(7), ComputeMode::Other(7));
    }

    #[test]
    fn test_throttle_decode() {
        assert!(ThrottleReason::decode(0).is_empty());
        assert_eq!(
            ThrottleReason::decode(0x0001 | 0x0004),
            vec![ThrottleReason::GpuIdle, ThrottleReason::SwPowerCap]
        );
        assert_eq!(
            ThrottleReason::decode(0x1000 | 0x0040),
            vec![
                ThrottleReason::HwThermalSlowdown,
                ThrottleReason::Unknown(0x1000)
            ]
        );
    }

    #[test]
    fn test_workload_serializes_lowercase() {
        let json = serde_json::to_string(&WorkloadType::Compute).unwrap();
        assert_eq!(json, "\"compute\"");
    }
}
