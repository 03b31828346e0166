use super::{unknown_device, BackendKind, DeviceHandle, GpuBackend, RawProcess, RawReading};
use crate::error::Result;

/// Stand-in for hosts without any GPU management path. Every call returns
/// an empty result without touching the system.
#[derive(Clone, Debug)]
pub struct UnavailableBackend {
    reason: String,
}

impl UnavailableBackend {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl GpuBackend for UnavailableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Unavailable
    }

    fn list_devices(&self) -> Vec<DeviceHandle> {
        Vec::new()
    }

    fn read_raw(&self, handle: &DeviceHandle) -> Result<RawReading> {
        Err(unknown_device(handle))
    }

    fn list_processes(&self) -> Vec<RawProcess> {
        Vec::new()
    }

    fn disabled_reason(&self) -> Option<String> {
        Some(self.reason.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_is_empty() {
        let backend = UnavailableBackend::new("no driver");
        assert_eq!(backend.kind(), BackendKind::Unavailable);
        assert!(backend.list_devices().is_empty());
        assert!(backend.list_processes().is_empty());
        assert!(backend.read_raw(&DeviceHandle::from_index(0)).is_err());
        assert_eq!(backend.disabled_reason().as_deref(), Some("no driver"));
    }
}
