use crate::backend::{Backend, BackendKind, DeviceHandle, GpuBackend};
use crate::config::MonitorConfig;
use crate::correlate::{apply_counts, correlate, ProcessMetadata, SysinfoMetadata};
use crate::data::{GpuSnapshot, ProcessInfo};
use crate::error::{MonitorError, Result};
use crate::history::SampleHistory;
use crate::snapshot::SnapshotBuilder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Whether this host can produce GPU telemetry at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TelemetryStatus {
    Available(BackendKind),
    Disabled(String),
}

/// Caller-driven collector. Nothing here runs on its own; a poller calls
/// [`Monitor::poll`] (or [`Monitor::collect_snapshot`] per device) and then
/// [`Monitor::collect_all_processes`].
///
/// The latest-snapshot map and the history store are safe to read from other
/// threads while a poll is running.
pub struct Monitor<B: GpuBackend = Backend> {
    backend: RwLock<Option<B>>,
    status: TelemetryStatus,
    history: SampleHistory,
    latest: RwLock<HashMap<String, GpuSnapshot>>,
    metadata: Option<Box<dyn ProcessMetadata>>,
}

impl Monitor<Backend> {
    /// Selects and starts the backend for this host.
    pub fn initialize(config: &MonitorConfig) -> Result<Self> {
        config.validate()?;
        let backend = Backend::select(config)?;
        let metadata: Option<Box<dyn ProcessMetadata>> = if config.enrich_processes {
            Some(Box::new(SysinfoMetadata::new()))
        } else {
            None
        };
        Ok(Self::with_backend(backend, metadata))
    }
}

impl<B: GpuBackend> Monitor<B> {
    pub fn with_backend(backend: B, metadata: Option<Box<dyn ProcessMetadata>>) -> Self {
        let status = match backend.disabled_reason() {
            Some(reason) => TelemetryStatus::Disabled(reason),
            None => TelemetryStatus::Available(backend.kind()),
        };
        info!(?status, "GPU monitor ready");
        Self {
            backend: RwLock::new(Some(backend)),
            status,
            history: SampleHistory::new(),
            latest: RwLock::new(HashMap::new()),
            metadata,
        }
    }

    pub fn telemetry_status(&self) -> &TelemetryStatus {
        &self.status
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, TelemetryStatus::Available(_))
    }

    pub fn history(&self) -> &SampleHistory {
        &self.history
    }

    /// Runs `f` against the live backend, or returns `None` once shut down
    /// or when telemetry is structurally disabled.
    fn with_live_backend<T>(&self, f: impl FnOnce(&B) -> T) -> Option<T> {
        if !self.is_available() {
            return None;
        }
        let guard = self.backend.read().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.with_live_backend(|b| b.list_devices().into_iter().map(|h| h.id).collect())
            .unwrap_or_default()
    }

    /// Builds one device's snapshot and publishes it.
    ///
    /// Partial metric unavailability never fails the call; only a device id
    /// the backend does not know is an error.
    pub fn collect_snapshot(&self, device_id: &str) -> Result<GpuSnapshot> {
        let mut built = self
            .with_live_backend(|backend| {
                let handle = backend
                    .list_devices()
                    .into_iter()
                    .find(|h| h.id == device_id)
                    .ok_or_else(|| MonitorError::UnknownDevice(device_id.to_string()))?;
                self.build(backend, &handle)
            })
            .unwrap_or_else(|| Err(MonitorError::UnknownDevice(device_id.to_string())))?;

        {
            let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = latest.get(&built.device_id) {
                built.processes = previous.processes;
            }
            latest.insert(built.device_id.clone(), built.clone());
        }
        self.commit(&built);
        Ok(built)
    }

    /// Collects every device in one cycle and swaps the whole set in at once,
    /// so readers see either the previous cycle or this one.
    pub fn poll(&self) -> Vec<GpuSnapshot> {
        let Some(mut snapshots) = self.with_live_backend(|backend| {
            backend
                .list_devices()
                .iter()
                .filter_map(|handle| match self.build(backend, handle) {
                    Ok(snapshot) => Some(snapshot),
                    Err(e) => {
                        warn!(device = %handle.id, error = %e, "skipping device this cycle");
                        None
                    }
                })
                .collect::<Vec<_>>()
        }) else {
            return Vec::new();
        };

        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        // Process counts stay from the previous cycle until the next
        // process collection replaces them
        for snapshot in &mut snapshots {
            if let Some(previous) = latest.get(&snapshot.device_id) {
                snapshot.processes = previous.processes;
            }
        }
        *latest = snapshots
            .iter()
            .map(|s| (s.device_id.clone(), s.clone()))
            .collect();
        drop(latest);

        for snapshot in &snapshots {
            self.commit(snapshot);
        }
        debug!(devices = snapshots.len(), "poll cycle complete");
        snapshots
    }

    fn build(&self, backend: &B, handle: &DeviceHandle) -> Result<GpuSnapshot> {
        let captured_at: DateTime<Utc> = Utc::now();
        let raw = backend.read_raw(handle)?;
        Ok(SnapshotBuilder::new(&self.history).build(&handle.id, &raw, captured_at))
    }

    // Always the last step, after the snapshot is complete and published
    fn commit(&self, snapshot: &GpuSnapshot) {
        self.history.commit(
            &snapshot.device_id,
            snapshot.memory.used_mib,
            snapshot.captured_at,
        );
    }

    /// Lists GPU processes and writes per-device counts into the current
    /// snapshots. An empty list is a normal result.
    pub fn collect_all_processes(&self) -> Vec<ProcessInfo> {
        let Some(raw) = self.with_live_backend(|b| b.list_processes()) else {
            return Vec::new();
        };

        let correlation = {
            let latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
            correlate(raw, latest.values(), self.metadata.as_deref())
        };

        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        apply_counts(latest.values_mut(), &correlation.counts);
        drop(latest);

        let mut processes = correlation.processes;
        processes.sort_by(|a, b| {
            b.memory_mib
                .total_cmp(&a.memory_mib)
                .then_with(|| a.pid.cmp(&b.pid))
        });
        processes
    }

    /// Current snapshots ordered by device index.
    pub fn latest(&self) -> Vec<GpuSnapshot> {
        let mut snapshots: Vec<GpuSnapshot> = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        snapshots.sort_by_key(|s| s.device_id.parse::<u32>().unwrap_or(u32::MAX));
        snapshots
    }

    pub fn latest_snapshot(&self, device_id: &str) -> Option<GpuSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
    }

    /// Releases the backend. Safe to call more than once; afterwards every
    /// collection call returns an empty result.
    pub fn shutdown(&self) {
        let backend = self
            .backend
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(backend) = backend {
            backend.shutdown();
            self.history.clear();
            info!("GPU backend released");
        }
    }
}

impl<B: GpuBackend> Drop for Monitor<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
