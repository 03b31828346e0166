use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    #[default]
    Auto,
    Nvml,
    Smi,
    Disabled,
}

impl FromStr for BackendPreference {
    type Err = MonitorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "nvml" => Ok(BackendPreference::Nvml),
            "smi" | "nvidia-smi" => Ok(BackendPreference::Smi),
            "disabled" | "none" | "off" => Ok(BackendPreference::Disabled),
            other => Err(MonitorError::Config(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub backend: BackendPreference,
    /// Program invoked by the nvidia-smi backend.
    pub smi_program: String,
    pub smi_timeout_ms: u64,
    /// Look up command line and CPU usage for GPU processes.
    pub enrich_processes: bool,
    /// Cadence suggested to pollers. The core itself never schedules.
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::Auto,
            smi_program: "nvidia-smi".to_string(),
            smi_timeout_ms: 5_000,
            enrich_processes: true,
            poll_interval_ms: 1_000,
        }
    }
}

impl MonitorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading config from: {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        let config: MonitorConfig = serde_json::from_str(&contents)
            .map_err(|e| MonitorError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `RGM_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`. Malformed values are logged and
    /// skipped.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(v) = lookup("RGM_BACKEND") {
            match v.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => warn!("Ignoring RGM_BACKEND: {}", e),
            }
        }
        if let Some(v) = lookup("RGM_NVIDIA_SMI") {
            if !v.trim().is_empty() {
                self.smi_program = v;
            }
        }
        if let Some(v) = lookup("RGM_SMI_TIMEOUT_MS") {
            match v.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.smi_timeout_ms = ms,
                _ => warn!("Ignoring RGM_SMI_TIMEOUT_MS={:?}", v),
            }
        }
        if let Some(v) = lookup("RGM_POLL_INTERVAL_MS") {
            match v.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.poll_interval_ms = ms,
                _ => warn!("Ignoring RGM_POLL_INTERVAL_MS={:?}", v),
            }
        }
        if let Some(v) = lookup("RGM_ENRICH_PROCESSES") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.enrich_processes = true,
                "0" | "false" | "no" | "off" => self.enrich_processes = false,
                _ => warn!("Ignoring RGM_ENRICH_PROCESSES={:?}", v),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.smi_program.trim().is_empty() {
            return Err(MonitorError::Config("smi_program is empty".to_string()));
        }
        if self.smi_timeout_ms == 0 {
            return Err(MonitorError::Config("smi_timeout_ms must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(MonitorError::Config("poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn smi_timeout(&self) -> Duration {
        Duration::from_millis(self.smi_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.backend, BackendPreference::Auto);
        assert_eq!(config.smi_program, "nvidia-smi");
        assert_eq!(config.smi_timeout(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MonitorConfig =
            serde_json::from_str(r#"{"backend": "smi", "smi_timeout_ms": 250}"#).unwrap();
        assert_eq!(config.backend, BackendPreference::Smi);
        assert_eq!(config.smi_timeout_ms, 250);
        assert_eq!(config.poll_interval_ms, 1_000);
        assert!(config.enrich_processes);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RGM_BACKEND", "disabled"),
            ("RGM_NVIDIA_SMI", "/opt/nvidia/bin/nvidia-smi"),
            ("RGM_SMI_TIMEOUT_MS", "not-a-number"),
            ("RGM_ENRICH_PROCESSES", "off"),
        ]
        .into_iter()
        .collect();
        let config =
            MonitorConfig::default().with_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.backend, BackendPreference::Disabled);
        assert_eq!(config.smi_program, "/opt/nvidia/bin/nvidia-smi");
        assert_eq!(config.smi_timeout_ms, 5_000);
        assert!(!config.enrich_processes);
    }

    #[test]
    fn test_backend_preference_parse() {
        assert_eq!("NVML".parse::<BackendPreference>().unwrap(), BackendPreference::Nvml);
        assert_eq!(
            "nvidia-smi".parse::<BackendPreference>().unwrap(),
            BackendPreference::Smi
        );
        assert!("rocm".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = MonitorConfig {
            smi_timeout_ms: 0,
            ..MonitorConfig::default()
        };
        assert!(matches!(config.validate(), Err(MonitorError::Config(_))));
    }
}
