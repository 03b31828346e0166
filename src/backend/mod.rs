//! Device access backends.
//!
//! A [`Backend`] is chosen once at start-up and stays fixed: NVML where the
//! native library loads, `nvidia-smi` where only the CLI exists, or
//! [`UnavailableBackend`] when the host has no GPU telemetry at all.

mod nvml;
mod smi;
mod unavailable;

pub use nvml::{NvmlBackend, NvmlReading};
pub use smi::{parse_compute_apps, parse_gpu_query, SmiBackend, SmiRecord, GPU_QUERY_FIELDS};
pub use unavailable::UnavailableBackend;

use crate::config::{BackendPreference, MonitorConfig};
use crate::data::WorkloadType;
use crate::error::{MonitorError, Result};
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BackendKind {
    Nvml,
    Smi,
    Unavailable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Nvml => write!(f, "NVML"),
            BackendKind::Smi => write!(f, "nvidia-smi"),
            BackendKind::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A device as enumerated by a backend. `id` is the stable key used across
/// snapshots, the history store and process correlation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub id: String,
    pub index: u32,
}

impl DeviceHandle {
    pub fn from_index(index: u32) -> Self {
        Self {
            id: index.to_string(),
            index,
        }
    }
}

/// Backend-specific raw reading, normalized by the snapshot builder.
#[derive(Clone, Debug)]
pub enum RawReading {
    Nvml(NvmlReading),
    Smi(SmiRecord),
}

/// A GPU-using process as reported by a backend, before correlation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawProcess {
    pub device_uuid: String,
    pub pid: u32,
    /// `0.0` when the driver reports no per-process figure.
    pub memory_mib: f64,
    pub name: Option<String>,
    pub workload: WorkloadType,
    pub gpu_utilization: Option<f64>,
}

pub trait GpuBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enumerates devices in index order. Failures yield an empty list.
    fn list_devices(&self) -> Vec<DeviceHandle>;

    /// Reads every metric the backend can supply for one device. Individual
    /// metrics fail soft; only an unreachable device is an error.
    fn read_raw(&self, handle: &DeviceHandle) -> Result<RawReading>;

    /// Lists GPU-using processes across all devices. Failures yield an
    /// empty list.
    fn list_processes(&self) -> Vec<RawProcess>;

    /// Set when telemetry is structurally disabled on this host.
    fn disabled_reason(&self) -> Option<String> {
        None
    }

    fn shutdown(self)
    where
        Self: Sized,
    {
    }
}

pub enum Backend {
    Nvml(NvmlBackend),
    Smi(SmiBackend),
    Unavailable(UnavailableBackend),
}

impl Backend {
    /// Picks the access path for this host.
    ///
    /// With [`BackendPreference::Auto`] this never fails: if nothing works the
    /// result is [`Backend::Unavailable`]. Forcing a backend turns its start-up
    /// failure into an error.
    pub fn select(config: &MonitorConfig) -> Result<Backend> {
        match config.backend {
            BackendPreference::Nvml => Ok(Backend::Nvml(NvmlBackend::new()?)),
            BackendPreference::Smi => Ok(Backend::Smi(SmiBackend::probe(
                &config.smi_program,
                config.smi_timeout(),
            )?)),
            BackendPreference::Disabled => Ok(Backend::Unavailable(UnavailableBackend::new(
                "GPU telemetry disabled by configuration",
            ))),
            BackendPreference::Auto => Ok(Self::auto_detect(config)),
        }
    }

    fn auto_detect(config: &MonitorConfig) -> Backend {
        if cfg!(target_os = "linux") {
            match NvmlBackend::new() {
                Ok(backend) => {
                    info!("NVML backend initialized");
                    return Backend::Nvml(backend);
                }
                Err(e) => warn!(error = %e, "NVML unavailable, trying nvidia-smi"),
            }
        }

        if cfg!(any(target_os = "linux", target_os = "windows")) {
            match SmiBackend::probe(&config.smi_program, config.smi_timeout()) {
                Ok(backend) => {
                    info!(program = %config.smi_program, "nvidia-smi backend initialized");
                    return Backend::Smi(backend);
                }
                Err(e) => warn!(error = %e, "nvidia-smi unavailable"),
            }
        }

        info!("No GPU access path on this host, telemetry disabled");
        Backend::Unavailable(UnavailableBackend::new(
            "no NVIDIA management library or nvidia-smi found",
        ))
    }
}

impl GpuBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Nvml(b) => b.kind(),
            Backend::Smi(b) => b.kind(),
            Backend::Unavailable(b) => b.kind(),
        }
    }

    fn list_devices(&self) -> Vec<DeviceHandle> {
        match self {
            Backend::Nvml(b) => b.list_devices(),
            Backend::Smi(b) => b.list_devices(),
            Backend::Unavailable(b) => b.list_devices(),
        }
    }

    fn read_raw(&self, handle: &DeviceHandle) -> Result<RawReading> {
        match self {
            Backend::Nvml(b) => b.read_raw(handle),
            Backend::Smi(b) => b.read_raw(handle),
            Backend::Unavailable(b) => b.read_raw(handle),
        }
    }

    fn list_processes(&self) -> Vec<RawProcess> {
        match self {
            Backend::Nvml(b) => b.list_processes(),
            Backend::Smi(b) => b.list_processes(),
            Backend::Unavailable(b) => b.list_processes(),
        }
    }

    fn disabled_reason(&self) -> Option<String> {
        match self {
            Backend::Unavailable(b) => b.disabled_reason(),
            _ => None,
        }
    }

    fn shutdown(self) {
        match self {
            Backend::Nvml(b) => b.shutdown(),
            Backend::Smi(b) => b.shutdown(),
            Backend::Unavailable(b) => b.shutdown(),
        }
    }
}

pub(crate) fn unknown_device(handle: &DeviceHandle) -> MonitorError {
    MonitorError::UnknownDevice(handle.id.clone())
}
