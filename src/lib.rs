//! GPU telemetry core.
//!
//! Collects per-device readings through whichever access path the host has
//! (NVML, `nvidia-smi`, or none), normalizes them into [`GpuSnapshot`]s,
//! derives memory change rates and an MFU estimate, and correlates GPU
//! processes back to their devices.
//!
//! ```no_run
//! use rgm::{Monitor, MonitorConfig};
//!
//! let monitor = Monitor::initialize(&MonitorConfig::from_env())?;
//! for snapshot in monitor.poll() {
//!     println!("{} {:?}", snapshot.device_id, snapshot.identity.name);
//! }
//! let processes = monitor.collect_all_processes();
//! println!("{} GPU processes", processes.len());
//! monitor.shutdown();
//! # Ok::<(), rgm::MonitorError>(())
//! ```

pub mod backend;
pub mod config;
pub mod correlate;
pub mod data;
pub mod derived;
pub mod error;
pub mod history;
pub mod logging;
pub mod monitor;
pub mod reference;
pub mod snapshot;

pub use backend::{Backend, BackendKind, DeviceHandle, GpuBackend, RawProcess, RawReading};
pub use config::{BackendPreference, MonitorConfig};
pub use data::{GpuSnapshot, ProcessInfo, WorkloadType};
pub use error::{MonitorError, Result};
pub use monitor::{Monitor, TelemetryStatus};
