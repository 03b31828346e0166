//! Static lookup tables keyed on upper-cased device-name substrings.
//!
//! These are approximations that drift as new hardware ships; review them as
//! data, independently of the code that reads them. Entries are ordered
//! most-specific-first and the first match wins, so a variant like
//! "RTX 4070 TI SUPER" must come before "RTX 4070 TI" and "RTX 4070".
//! Overlapping patterns (e.g. "A10G" and "A10") are resolved purely by that
//! order.

/// Architecture family by name pattern. First match in table order wins.
pub const ARCHITECTURES: &[(&str, &str)] = &[
    // Names that contain a shorter pattern from another family
    ("QUADRO RTX", "Turing"),
    ("TITAN RTX", "Turing"),
    (" ADA", "Ada Lovelace"),
    ("GTX 75", "Maxwell"),
    // Ada Lovelace
    ("RTX 40", "Ada Lovelace"),
    ("L40", "Ada Lovelace"),
    ("L4", "Ada Lovelace"),
    // Hopper
    ("GH200", "Hopper"),
    ("H100", "Hopper"),
    ("H200", "Hopper"),
    ("H800", "Hopper"),
    // Ampere
    ("RTX 30", "Ampere"),
    ("RTX A", "Ampere"),
    ("A100", "Ampere"),
    ("A800", "Ampere"),
    ("A40", "Ampere"),
    ("A30", "Ampere"),
    ("A16", "Ampere"),
    ("A10", "Ampere"),
    // Turing
    ("RTX 20", "Turing"),
    ("GTX 16", "Turing"),
    ("T4", "Turing"),
    // Pascal
    ("GTX 10", "Pascal"),
    ("TITAN XP", "Pascal"),
    ("P100", "Pascal"),
    ("P40", "Pascal"),
    ("P4", "Pascal"),
    // Maxwell
    ("GTX 9", "Maxwell"),
    ("GTX TITAN X", "Maxwell"),
    ("M60", "Maxwell"),
    ("M40", "Maxwell"),
    // Kepler
    ("GTX 7", "Kepler"),
    ("K80", "Kepler"),
    ("K40", "Kepler"),
    ("K20", "Kepler"),
    // Volta
    ("V100", "Volta"),
    ("TITAN V", "Volta"),
];

pub const UNKNOWN_ARCHITECTURE: &str = "Unknown";

/// A peak FP32 throughput entry. When `pattern` matches, `variants` are
/// searched (recursively, in order) before falling back to `tflops`.
#[derive(Debug)]
pub struct PeakEntry {
    pub pattern: &'static str,
    pub tflops: f64,
    pub variants: &'static [PeakEntry],
}

const fn peak(pattern: &'static str, tflops: f64) -> PeakEntry {
    PeakEntry {
        pattern,
        tflops,
        variants: &[],
    }
}

const fn family(pattern: &'static str, tflops: f64, variants: &'static [PeakEntry]) -> PeakEntry {
    PeakEntry {
        pattern,
        tflops,
        variants,
    }
}

/// Peak single-precision TFLOPs by name pattern.
pub const PEAK_TFLOPS: &[PeakEntry] = &[
    // Workstation parts whose names overlap with datacenter patterns below
    peak("RTX 6000 ADA", 91.1),
    peak("RTX 5000 ADA", 65.3),
    peak("RTX 4000 ADA", 26.7),
    peak("RTX A6000", 38.7),
    peak("RTX A5000", 27.8),
    peak("RTX A4000", 19.2),
    // GeForce 40
    family("RTX 4090", 82.6, &[peak("4090 D", 73.5)]),
    family("RTX 4080", 48.7, &[peak("SUPER", 52.2)]),
    family(
        "RTX 4070",
        29.1,
        &[
            peak("TI SUPER", 44.1),
            peak("TI", 40.1),
            peak("SUPER", 35.5),
        ],
    ),
    family("RTX 4060", 15.1, &[peak("TI", 22.1)]),
    // GeForce 30
    family("RTX 3090", 35.6, &[peak("TI", 40.0)]),
    family("RTX 3080", 29.8, &[peak("TI", 34.1), peak("12GB", 30.6)]),
    family("RTX 3070", 20.3, &[peak("TI", 21.7)]),
    family("RTX 3060", 12.7, &[peak("TI", 16.2)]),
    // GeForce 20
    family("RTX 2080", 10.1, &[peak("TI", 13.4), peak("SUPER", 11.2)]),
    family("RTX 2070", 7.5, &[peak("SUPER", 9.1)]),
    family("RTX 2060", 6.5, &[peak("SUPER", 7.2)]),
    // Datacenter
    family(
        "H100",
        51.2,
        &[peak("SXM", 66.9), peak("NVL", 60.0), peak("PCIE", 51.2)],
    ),
    peak("H200", 66.9),
    peak("A100", 19.5),
    peak("A10G", 31.2),
    peak("A10", 31.2),
    peak("A40", 37.4),
    peak("A30", 10.3),
    peak("L40S", 91.6),
    peak("L40", 90.5),
    peak("L4", 30.3),
    peak("T4", 8.1),
    family("V100", 15.7, &[peak("SXM2", 15.7), peak("PCIE", 14.0)]),
    family("P100", 9.3, &[peak("SXM2", 10.6)]),
    peak("P40", 11.8),
    peak("P4", 5.5),
    peak("K80", 8.7),
];

/// Architecture family for a device name, or `"Unknown"`.
pub fn architecture_for(name: &str) -> &'static str {
    let upper = name.to_uppercase();
    ARCHITECTURES
        .iter()
        .find(|(pattern, _)| upper.contains(pattern))
        .map(|(_, family)| *family)
        .unwrap_or(UNKNOWN_ARCHITECTURE)
}

/// Peak FP32 TFLOPs for a device name, or `None` if the model is not listed.
pub fn peak_tflops_for(name: &str) -> Option<f64> {
    let upper = name.to_uppercase();
    lookup(PEAK_TFLOPS, &upper)
}

fn lookup(entries: &[PeakEntry], upper: &str) -> Option<f64> {
    let entry = entries.iter().find(|e| upper.contains(e.pattern))?;
    Some(lookup(entry.variants, upper).unwrap_or(entry.tflops))
}
