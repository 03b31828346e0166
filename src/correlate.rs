//! Maps backend process records to devices and tallies per-device counts.

use crate::backend::RawProcess;
use crate::data::{GpuSnapshot, ProcessCounts, ProcessInfo, WorkloadType};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, System};
use tracing::debug;

/// OS-level details for one process. Every field is best-effort.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OsDetails {
    pub name: Option<String>,
    pub command_line: Option<String>,
    pub cpu_percent: Option<f32>,
}

pub trait ProcessMetadata: Send + Sync {
    /// Details for whichever of `pids` can be resolved. Missing pids are
    /// simply left out.
    fn lookup(&self, pids: &[u32]) -> HashMap<u32, OsDetails>;
}

/// `sysinfo`-backed metadata. The `System` is kept across calls so CPU
/// usage is measured between consecutive lookups.
pub struct SysinfoMetadata {
    state: Mutex<SysinfoState>,
}

struct SysinfoState {
    system: System,
    // Pids present at the previous refresh; only these have a CPU baseline
    seen: HashSet<u32>,
}

impl SysinfoMetadata {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SysinfoState {
                system: System::new(),
                seen: HashSet::new(),
            }),
        }
    }
}

impl Default for SysinfoMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetadata for SysinfoMetadata {
    fn lookup(&self, pids: &[u32]) -> HashMap<u32, OsDetails> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let SysinfoState { system, seen } = &mut *state;
        system.refresh_processes();

        let details = pids
            .iter()
            .filter_map(|&pid| {
                let process = system.process(Pid::from_u32(pid))?;
                let cmd = process.cmd().join(" ");
                Some((
                    pid,
                    OsDetails {
                        name: Some(process.name().to_string()),
                        command_line: (!cmd.is_empty()).then_some(cmd),
                        cpu_percent: seen.contains(&pid).then(|| process.cpu_usage()),
                    },
                ))
            })
            .collect();

        *seen = system.processes().keys().map(|pid| pid.as_u32()).collect();
        details
    }
}

fn proc_comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Correlation {
    pub processes: Vec<ProcessInfo>,
    /// Per device id. Devices with no processes are present with zero counts.
    pub counts: HashMap<String, ProcessCounts>,
}

/// Resolves each record's device by exact UUID match against `snapshots`.
/// Records whose UUID matches no current device are dropped.
pub fn correlate<'a>(
    raw: Vec<RawProcess>,
    snapshots: impl IntoIterator<Item = &'a GpuSnapshot>,
    metadata: Option<&dyn ProcessMetadata>,
) -> Correlation {
    let mut counts = HashMap::new();
    let mut by_uuid = HashMap::new();
    for snapshot in snapshots {
        counts.insert(snapshot.device_id.clone(), ProcessCounts::default());
        if let Some(uuid) = &snapshot.identity.uuid {
            by_uuid.insert(uuid.clone(), snapshot.device_id.clone());
        }
    }

    let resolved: Vec<(RawProcess, String)> = raw
        .into_iter()
        .filter_map(|record| match by_uuid.get(&record.device_uuid) {
            Some(device_id) => Some((record, device_id.clone())),
            None => {
                debug!(pid = record.pid, uuid = %record.device_uuid, "dropping process on unknown device");
                None
            }
        })
        .collect();

    let details = match metadata {
        Some(metadata) if !resolved.is_empty() => {
            let pids: Vec<u32> = resolved.iter().map(|(r, _)| r.pid).collect();
            metadata.lookup(&pids)
        }
        _ => HashMap::new(),
    };

    let mut processes = Vec::with_capacity(resolved.len());
    for (record, device_id) in resolved {
        let os = details.get(&record.pid).cloned().unwrap_or_default();
        if let Some(tally) = counts.get_mut(&device_id) {
            match record.workload {
                WorkloadType::Compute => tally.compute += 1,
                WorkloadType::Graphics => tally.graphics += 1,
            }
        }
        let name = record
            .name
            .or(os.name)
            .or_else(|| proc_comm(record.pid))
            .unwrap_or_else(|| "unknown".to_string());
        processes.push(ProcessInfo {
            pid: record.pid,
            name,
            command_line: os.command_line,
            cpu_percent: os.cpu_percent,
            device_uuid: record.device_uuid,
            device_id,
            memory_mib: record.memory_mib,
            workload: record.workload,
            gpu_utilization: record.gpu_utilization,
        });
    }

    Correlation { processes, counts }
}

/// Writes tallied counts into the matching snapshots.
pub fn apply_counts<'a>(
    snapshots: impl IntoIterator<Item = &'a mut GpuSnapshot>,
    counts: &HashMap<String, ProcessCounts>,
) {
    for snapshot in snapshots {
        if let Some(tally) = counts.get(&snapshot.device_id) {
            snapshot.processes = *tally;
        }
    }
}
