//! Derived analytics: memory change rate and the MFU estimate.

use crate::data::{DerivedMetrics, GpuSnapshot};
use crate::history::HistorySample;
use crate::reference::peak_tflops_for;
use chrono::{DateTime, Utc};

/// MiB/s between the previous sample and now. `None` without a previous
/// sample or when the clock did not move forward.
pub fn memory_change_rate(
    previous: Option<&HistorySample>,
    used_memory_mib: Option<f64>,
    captured_at: DateTime<Utc>,
) -> Option<f64> {
    let previous = previous?;
    let used = used_memory_mib?;
    let elapsed = captured_at
        .signed_duration_since(previous.captured_at)
        .num_microseconds()? as f64
        / 1_000_000.0;
    if elapsed <= 0.0 {
        return None;
    }
    Some((used - previous.used_memory_mib) / elapsed)
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Efficiency {
    pub achieved_tflops: f64,
    pub peak_tflops: f64,
    pub mfu_percent: f64,
}

/// Estimates achieved throughput from clock ratio and utilization.
///
/// With both SM clocks known the clock ratio scales utilization; with only
/// utilization the ratio is taken as 1. An unknown model (no peak) yields
/// all zeros.
pub fn estimate_efficiency(
    peak_tflops: Option<f64>,
    sm_clock_mhz: Option<u32>,
    sm_max_clock_mhz: Option<u32>,
    utilization_pct: Option<f64>,
) -> Efficiency {
    let Some(peak) = peak_tflops.filter(|p| *p > 0.0) else {
        return Efficiency::default();
    };
    let Some(utilization) = utilization_pct else {
        return Efficiency {
            peak_tflops: peak,
            ..Efficiency::default()
        };
    };
    let fraction = utilization / 100.0;

    let achieved = match (sm_clock_mhz, sm_max_clock_mhz) {
        (Some(clock), Some(max)) if clock > 0 && max > 0 => {
            (clock as f64 / max as f64) * fraction * peak
        }
        _ => fraction * peak,
    };

    Efficiency {
        achieved_tflops: achieved,
        peak_tflops: peak,
        mfu_percent: achieved / peak * 100.0,
    }
}

/// Fills every derived field for a built snapshot.
pub fn compute(snapshot: &GpuSnapshot, previous: Option<&HistorySample>) -> DerivedMetrics {
    let efficiency = estimate_efficiency(
        snapshot.identity.name.as_deref().and_then(peak_tflops_for),
        snapshot.clocks.sm.current_mhz,
        snapshot.clocks.sm.max_mhz,
        snapshot.performance.utilization_gpu,
    );

    DerivedMetrics {
        memory_change_rate_mib_s: memory_change_rate(
            previous,
            snapshot.memory.used_mib,
            snapshot.captured_at,
        ),
        achieved_tflops: efficiency.achieved_tflops,
        peak_tflops: efficiency.peak_tflops,
        mfu_percent: efficiency.mfu_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_rate_is_delta_over_elapsed() {
        let prev = HistorySample {
            used_memory_mib: 1000.0,
            captured_at: t0(),
        };
        let rate = memory_change_rate(Some(&prev), Some(1500.0), t0() + Duration::seconds(2));
        assert_eq!(rate, Some(250.0));

        let rate = memory_change_rate(
            Some(&prev),
            Some(900.0),
            t0() + Duration::milliseconds(500),
        );
        assert_eq!(rate, Some(-200.0));
    }

    #[test]
    fn test_rate_absent_without_history() {
        assert_eq!(memory_change_rate(None, Some(4096.0), t0()), None);
    }

    #[test]
    fn test_rate_absent_for_non_positive_elapsed() {
        let prev = HistorySample {
            used_memory_mib: 1000.0,
            captured_at: t0(),
        };
        assert_eq!(memory_change_rate(Some(&prev), Some(1200.0), t0()), None);
        assert_eq!(
            memory_change_rate(Some(&prev), Some(1200.0), t0() - Duration::seconds(1)),
            None
        );
    }

    #[test]
    fn test_mfu_with_clocks() {
        let e = estimate_efficiency(Some(82.6), Some(2500), Some(2520), Some(80.0));
        let expected = (2500.0 / 2520.0) * 0.80 * 100.0;
        assert!((e.mfu_percent - expected).abs() < 1e-9);
        assert!((e.mfu_percent - 79.365).abs() < 0.01);
        assert!((e.achieved_tflops - expected / 100.0 * 82.6).abs() < 1e-9);
        assert_eq!(e.peak_tflops, 82.6);
    }

    #[test]
    fn test_mfu_utilization_only() {
        let e = estimate_efficiency(Some(15.7), None, None, Some(50.0));
        assert!((e.mfu_percent - 50.0).abs() < 1e-9);
        assert!((e.achieved_tflops - 7.85).abs() < 1e-9);

        // A zero max clock is not a usable ratio
        let e = estimate_efficiency(Some(15.7), Some(1200), Some(0), Some(50.0));
        assert!((e.mfu_percent - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_all_zero() {
        let e = estimate_efficiency(None, Some(1500), Some(1800), Some(99.0));
        assert_eq!(e, Efficiency::default());
        assert_eq!(e.peak_tflops, 0.0);
        assert_eq!(e.achieved_tflops, 0.0);
        assert_eq!(e.mfu_percent, 0.0);
    }

    #[test]
    fn test_known_model_without_utilization() {
        let e = estimate_efficiency(Some(30.3), Some(1500), Some(2000), None);
        assert_eq!(e.peak_tflops, 30.3);
        assert_eq!(e.mfu_percent, 0.0);
    }
}
