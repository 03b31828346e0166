//! `nvidia-smi` backend: one CSV query per poll, parsed into per-device
//! records.

use super::{BackendKind, DeviceHandle, GpuBackend, RawProcess, RawReading};
use crate::data::WorkloadType;
use crate::error::{MonitorError, Result};
use crossbeam_channel::bounded;
use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{PoisonError, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Columns requested from `--query-gpu`, in order.
pub const GPU_QUERY_FIELDS: &[&str] = &[
    "index",
    "uuid",
    "name",
    "driver_version",
    "vbios_version",
    "serial",
    "pstate",
    "compute_mode",
    "utilization.gpu",
    "utilization.memory",
    "memory.used",
    "memory.total",
    "memory.free",
    "temperature.gpu",
    "power.draw",
    "power.limit",
    "power.min_limit",
    "power.max_limit",
    "fan.speed",
    "clocks.gr",
    "clocks.sm",
    "clocks.mem",
    "clocks.video",
    "clocks.max.gr",
    "clocks.max.sm",
    "clocks.max.mem",
    "clocks.applications.gr",
    "clocks.applications.mem",
    "clocks.default_applications.gr",
    "clocks.default_applications.mem",
    "pcie.link.gen.current",
    "pcie.link.gen.max",
    "pcie.link.width.current",
    "pcie.link.width.max",
    "pci.bus_id",
    "clocks_throttle_reasons.active",
];

const COMPUTE_APPS_FIELDS: &str = "gpu_uuid,pid,used_memory,process_name";

/// nvidia-smi prints these instead of a value when a field does not apply.
fn is_sentinel(value: &str) -> bool {
    let v = value.trim();
    v.is_empty()
        || v.eq_ignore_ascii_case("N/A")
        || (v.starts_with('[') && v.ends_with(']'))
}

/// One CSV row of `--query-gpu` output, keyed by column name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmiRecord {
    fields: HashMap<&'static str, String>,
}

impl SmiRecord {
    pub fn from_line(line: &str) -> Self {
        let values: Vec<&str> = line.split(',').map(str::trim).collect();
        if values.len() != GPU_QUERY_FIELDS.len() {
            debug!(
                expected = GPU_QUERY_FIELDS.len(),
                got = values.len(),
                "nvidia-smi row has unexpected column count"
            );
        }
        let fields = GPU_QUERY_FIELDS
            .iter()
            .zip(values)
            .map(|(name, value)| (*name, value.to_string()))
            .collect();
        Self { fields }
    }

    /// Text value, or `None` if the column is missing or not applicable.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields
            .get(field)
            .map(String::as_str)
            .filter(|v| !is_sentinel(v))
    }

    /// Numeric value. A missing column is `None`; a not-applicable or
    /// malformed value becomes `0.0`.
    pub fn number(&self, field: &str) -> Option<f64> {
        let raw = self.fields.get(field)?;
        if is_sentinel(raw) {
            debug!(field, value = %raw, "nvidia-smi field not applicable, using 0");
            return Some(0.0);
        }
        match raw.trim().parse::<f64>() {
            Ok(v) => Some(v),
            Err(_) => {
                debug!(field, value = %raw, "nvidia-smi field not numeric, using 0");
                Some(0.0)
            }
        }
    }

    pub fn integer(&self, field: &str) -> Option<u32> {
        self.number(field).map(|v| v.max(0.0).round() as u32)
    }

    /// Hexadecimal bitmask such as `0x0000000000000004`, with the same
    /// zero fallback as [`SmiRecord::number`].
    pub fn bitmask(&self, field: &str) -> Option<u64> {
        let raw = self.fields.get(field)?;
        let digits = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
        match u64::from_str_radix(digits, 16) {
            Ok(bits) => Some(bits),
            Err(_) => {
                debug!(field, value = %raw, "nvidia-smi bitmask not parseable, using 0");
                Some(0)
            }
        }
    }

    fn handle(&self) -> Option<DeviceHandle> {
        let index = self.text("index")?.parse::<u32>().ok()?;
        Some(DeviceHandle::from_index(index))
    }
}

/// Parses `--query-gpu ... --format=csv,noheader,nounits` output.
pub fn parse_gpu_query(output: &str) -> Vec<SmiRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(SmiRecord::from_line)
        .collect()
}

/// Parses `--query-compute-apps=gpu_uuid,pid,used_memory,process_name`
/// output. The process name is last so commas inside it survive.
pub fn parse_compute_apps(output: &str) -> Vec<RawProcess> {
    let mut processes = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let parts: Vec<&str> = line.splitn(4, ',').map(str::trim).collect();
        if parts.len() < 3 {
            debug!(line, "skipping short compute-apps row");
            continue;
        }
        let Ok(pid) = parts[1].parse::<u32>() else {
            debug!(line, "skipping compute-apps row without pid");
            continue;
        };
        let memory_mib = if is_sentinel(parts[2]) {
            0.0
        } else {
            parts[2].parse::<f64>().unwrap_or(0.0)
        };
        processes.push(RawProcess {
            device_uuid: parts[0].to_string(),
            pid,
            memory_mib,
            name: parts
                .get(3)
                .filter(|n| !is_sentinel(n))
                .map(|n| n.to_string()),
            workload: WorkloadType::Compute,
            // nvidia-smi has no per-process utilization in this query
            gpu_utilization: Some(0.0),
        });
    }
    processes
}

pub struct SmiBackend {
    program: String,
    timeout: Duration,
    records: RwLock<Vec<SmiRecord>>,
}

impl SmiBackend {
    /// Checks that the program runs and answers a minimal query.
    pub fn probe(program: &str, timeout: Duration) -> Result<Self> {
        let backend = Self::new(program, timeout);
        backend.run(&["--query-gpu=index", "--format=csv,noheader"])?;
        Ok(backend)
    }

    pub fn new(program: &str, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            timeout,
            records: RwLock::new(Vec::new()),
        }
    }

    /// Runs the program and returns its stdout. The child is killed if it
    /// outlives the timeout.
    fn run(&self, args: &[&str]) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| MonitorError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().ok_or_else(|| {
            MonitorError::Io(std::io::Error::other("child stdout not captured"))
        })?;
        let (sender, receiver) = bounded(1);
        thread::spawn(move || {
            let mut buf = String::new();
            let result = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = sender.send(result);
        });

        let output = match receiver.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(MonitorError::Timeout {
                    program: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let status = child.wait()?;
        if !status.success() {
            return Err(MonitorError::CommandFailed {
                program: self.program.clone(),
                status: status.to_string(),
            });
        }
        Ok(output)
    }

    fn query_gpus(&self) -> Result<Vec<SmiRecord>> {
        let query = format!("--query-gpu={}", GPU_QUERY_FIELDS.join(","));
        let output = self.run(&[query.as_str(), "--format=csv,noheader,nounits"])?;
        Ok(parse_gpu_query(&output))
    }
}

impl GpuBackend for SmiBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Smi
    }

    /// Runs the GPU query once and caches the rows for `read_raw`.
    fn list_devices(&self) -> Vec<DeviceHandle> {
        let records = match self.query_gpus() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "nvidia-smi GPU query failed");
                Vec::new()
            }
        };
        let handles = records.iter().filter_map(SmiRecord::handle).collect();
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records;
        handles
    }

    fn read_raw(&self, handle: &DeviceHandle) -> Result<RawReading> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.handle().as_ref() == Some(handle))
            .cloned()
            .map(RawReading::Smi)
            .ok_or_else(|| super::unknown_device(handle))
    }

    fn list_processes(&self) -> Vec<RawProcess> {
        let query = format!("--query-compute-apps={COMPUTE_APPS_FIELDS}");
        match self.run(&[query.as_str(), "--format=csv,noheader,nounits"]) {
            Ok(output) => parse_compute_apps(&output),
            Err(e) => {
                // Some drivers exit non-zero when no compute process exists
                debug!(error = %e, "nvidia-smi compute-apps query returned nothing");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Monitor;

    fn row(overrides: &[(&str, &str)]) -> String {
        GPU_QUERY_FIELDS
            .iter()
            .map(|field| {
                overrides
                    .iter()
                    .find(|(name, _)| name == field)
                    .map(|(_, v)| v.to_string())
                    .unwrap_or_else(|| "1".to_string())
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    #[test]
    fn test_na_temperature_is_zero() {
        let record = SmiRecord::from_line(&row(&[("temperature.gpu", "[N/A]")]));
        assert_eq!(record.number("temperature.gpu"), Some(0.0));
    }

    #[test]
    fn test_malformed_number_is_zero() {
        let record = SmiRecord::from_line(&row(&[("power.draw", "12.5W?")]));
        assert_eq!(record.number("power.draw"), Some(0.0));
        assert_eq!(record.number("memory.used"), Some(1.0));
    }

    #[test]
    fn test_sentinel_text_is_absent() {
        let record = SmiRecord::from_line(&row(&[
            ("serial", "[Not Supported]"),
            ("name", "NVIDIA GeForce RTX 3060"),
        ]));
        assert_eq!(record.text("serial"), None);
        assert_eq!(record.text("name"), Some("NVIDIA GeForce RTX 3060"));
    }

    #[test]
    fn test_missing_column_is_absent() {
        let record = SmiRecord::from_line("0, GPU-abc, Tesla T4");
        assert_eq!(record.text("name"), Some("Tesla T4"));
        assert_eq!(record.number("temperature.gpu"), None);
    }

    #[test]
    fn test_bitmask_parsing() {
        let record = SmiRecord::from_line(&row(&[(
            "clocks_throttle_reasons.active",
            "0x0000000000000005",
        )]));
        assert_eq!(record.bitmask("clocks_throttle_reasons.active"), Some(5));
        let na = SmiRecord::from_line(&row(&[("clocks_throttle_reasons.active", "[N/A]")]));
        assert_eq!(na.bitmask("clocks_throttle_reasons.active"), Some(0));
    }

    #[test]
    fn test_parse_gpu_query_rows() {
        let output = format!(
            "{}\n{}\n\n",
            row(&[("index", "0")]),
            row(&[("index", "1")])
        );
        let records = parse_gpu_query(&output);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].handle(), Some(DeviceHandle::from_index(1)));
    }

    #[test]
    fn test_parse_compute_apps() {
        let output = "GPU-aaa, 1234, 2048, /usr/bin/python3\n\
                      GPU-bbb, 99, [N/A], C:\\Program Files\\app, v2.exe\n\
                      GPU-ccc, notapid, 1, x\n";
        let procs = parse_compute_apps(output);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 1234);
        assert_eq!(procs[0].memory_mib, 2048.0);
        assert_eq!(procs[0].gpu_utilization, Some(0.0));
        assert_eq!(procs[1].memory_mib, 0.0);
        assert_eq!(procs[1].name.as_deref(), Some("C:\\Program Files\\app, v2.exe"));
    }

    #[test]
    fn test_spawn_failure_is_error() {
        let backend = SmiBackend::new("rgm-test-no-such-program", Duration::from_secs(1));
        assert!(matches!(
            backend.run(&["--help"]),
            Err(MonitorError::Spawn { .. })
        ));
        assert!(backend.list_devices().is_empty());
        assert!(backend.list_processes().is_empty());
    }

    #[cfg(unix)]
    fn script(dir: &tempfile::TempDir, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("nvidia-smi");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_program_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let program = script(&dir, "exec sleep 5");
        let backend = SmiBackend::new(&program, Duration::from_millis(100));

        let started = std::time::Instant::now();
        assert!(matches!(
            backend.run(&["--query-gpu=index"]),
            Err(MonitorError::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(backend.list_devices().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_poll_reads_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let rows = [
            row(&[("index", "0"), ("uuid", "GPU-0"), ("name", "Tesla T4")]),
            row(&[("index", "1"), ("uuid", "GPU-1"), ("name", "Tesla T4")]),
        ];
        let program = script(&dir, &format!("cat <<'EOF'\n{}\n{}\nEOF", rows[0], rows[1]));
        let monitor = Monitor::with_backend(
            SmiBackend::new(&program, Duration::from_secs(5)),
            None,
        );

        let snapshots = monitor.poll();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].device_id, "0");
        assert_eq!(snapshots[1].device_id, "1");
        assert_eq!(snapshots[1].identity.uuid.as_deref(), Some("GPU-1"));
        assert_eq!(snapshots[0].identity.architecture.as_deref(), Some("Turing"));
    }
}
