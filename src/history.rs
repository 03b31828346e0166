use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// The part of a finalized snapshot that outlives its poll cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistorySample {
    pub used_memory_mib: f64,
    pub captured_at: DateTime<Utc>,
}

/// Single-slot, per-device cache of the previous sample. Each commit
/// replaces the prior entry for that device.
#[derive(Debug, Default)]
pub struct SampleHistory {
    entries: RwLock<HashMap<String, HistorySample>>,
}

impl SampleHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<HistorySample> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .copied()
    }

    /// Records the latest sample. Without a used-memory reading the prior
    /// entry is dropped so no rate spans the gap.
    pub fn commit(&self, device_id: &str, used_memory_mib: Option<f64>, captured_at: DateTime<Utc>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match used_memory_mib {
            Some(used_memory_mib) => {
                entries.insert(
                    device_id.to_string(),
                    HistorySample {
                        used_memory_mib,
                        captured_at,
                    },
                );
            }
            None => {
                entries.remove(device_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_commit_overwrites() {
        let history = SampleHistory::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();

        history.commit("0", Some(100.0), t0);
        history.commit("0", Some(150.0), t1);
        history.commit("1", Some(10.0), t0);

        assert_eq!(history.len(), 2);
        assert_eq!(
            history.get("0"),
            Some(HistorySample {
                used_memory_mib: 150.0,
                captured_at: t1
            })
        );
    }

    #[test]
    fn test_commit_without_memory_clears_entry() {
        let history = SampleHistory::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        history.commit("0", Some(100.0), t0);
        history.commit("0", None, t0);
        assert!(history.get("0").is_none());
        assert!(history.is_empty());
    }
}
