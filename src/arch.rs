//! CPU architecture detection.
//!
//! The ETM protocol variant the decode engine must speak depends on which
//! generation of trace hardware the CPU carries. We classify the running CPU
//! once, from `/proc/cpuinfo`, into one of three generations.

use crate::errors::CsTracerError;
use libc::c_int;
use std::fs::read_to_string;

const CPUINFO_PATH: &str = "/proc/cpuinfo";

/// CPU part numbers of cores known to implement ETE (the Armv9 trace
/// extension). Matched case-sensitively against the `CPU part` field.
///
/// Armv9 cores report `CPU architecture : 8` just like Armv8 ones, so the
/// part number is the only way to tell the two generations apart.
const ETE_CPU_PARTS: [&str; 8] = [
    "0xd46", // Cortex-A510
    "0xd47", // Cortex-A710
    "0xd48", // Cortex-X2
    "0xd49", // Neoverse N2
    "0xd4d", // Cortex-A715
    "0xd4e", // Cortex-X3
    "0xd80", // Cortex-A520
    "0xd81", // Cortex-A720
];

/// The generation of ETM trace hardware on this CPU, which determines the
/// protocol variant the decode engine is configured for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EtmArch {
    /// ETMv3: Armv7-era trace units.
    Etmv3,
    /// ETMv4: Armv8.
    Etmv4,
    /// ETE: Armv9.
    Ete,
}

impl EtmArch {
    /// The protocol version number handed to the native decode engine.
    #[cfg_attr(not(opencsd), allow(dead_code))]
    pub(crate) fn arch_version(&self) -> c_int {
        match self {
            Self::Etmv3 => 3,
            Self::Etmv4 => 4,
            Self::Ete => 5,
        }
    }
}

/// Classify the running CPU by parsing `/proc/cpuinfo`.
///
/// A failure to read the file isn't itself an error: it parses like an empty
/// file, which then fails with "could not determine".
pub fn detect() -> Result<EtmArch, CsTracerError> {
    let cpuinfo = read_to_string(CPUINFO_PATH).unwrap_or_default();
    detect_from_cpuinfo(&cpuinfo)
}

/// Returns `true` if this looks like a trace-capable ARM CPU.
///
/// Never surfaces the underlying detection error.
pub fn is_arm() -> bool {
    detect().is_ok()
}

/// Find the value of the first `key : value` line for `field`.
///
/// `/proc/cpuinfo` repeats its fields once per core; the first match wins.
fn first_field<'a>(cpuinfo: &'a str, field: &str) -> Option<&'a str> {
    cpuinfo.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        (key.trim() == field).then(|| value.trim())
    })
}

/// The parsing behind [detect].
pub(crate) fn detect_from_cpuinfo(cpuinfo: &str) -> Result<EtmArch, CsTracerError> {
    if let Some(arch) = first_field(cpuinfo, "CPU architecture") {
        return match arch {
            "7" => Ok(EtmArch::Etmv3),
            // Armv8 and Armv9 both report "8" (or "AArch64" on some older
            // kernels); disambiguate via the part number.
            "8" | "AArch64" => match first_field(cpuinfo, "CPU part") {
                Some(part) if ETE_CPU_PARTS.contains(&part) => Ok(EtmArch::Ete),
                _ => Ok(EtmArch::Etmv4),
            },
            other => Err(CsTracerError::ArchDetect(format!(
                "unrecognised 'CPU architecture' value {other:?} in {CPUINFO_PATH}"
            ))),
        };
    }

    // No "CPU architecture" field at all. Fall back to the "Processor" line,
    // e.g. "ARMv7 Processor rev 2 (v7l)" or "AArch64 Processor rev 4".
    if let Some(proc_) = first_field(cpuinfo, "Processor") {
        let proc_ = proc_.to_lowercase();
        if proc_.starts_with("armv7") {
            return Ok(EtmArch::Etmv3);
        } else if proc_.starts_with("aarch64") {
            return Ok(EtmArch::Etmv4);
        }
    }

    Err(CsTracerError::ArchDetect(format!(
        "no usable 'CPU architecture' or 'Processor' field in {CPUINFO_PATH}"
    )))
}

#[cfg(test)]
mod tests {
    use super::{detect_from_cpuinfo, EtmArch};
    use crate::errors::CsTracerError;

    #[test]
    fn armv7() {
        let cpuinfo = "processor : 0\nCPU architecture : 7\nCPU part : 0xc09\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Etmv3);
    }

    #[test]
    fn armv9_part_number() {
        let cpuinfo = "CPU architecture : 8\nCPU part : 0xd47\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Ete);
    }

    #[test]
    fn unknown_part_number_is_v8() {
        let cpuinfo = "CPU architecture : 8\nCPU part : 0x999\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Etmv4);
    }

    #[test]
    fn no_part_number_is_v8() {
        let cpuinfo = "CPU architecture : 8\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Etmv4);
    }

    #[test]
    fn first_core_wins() {
        // A big.LITTLE-style cpuinfo with differing part numbers: the first
        // match decides.
        let cpuinfo = "CPU architecture : 8\nCPU part : 0xd47\n\
                       CPU architecture : 8\nCPU part : 0xd05\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Ete);
    }

    #[test]
    fn aarch64_literal() {
        let cpuinfo = "CPU architecture : AArch64\nCPU part : 0xd49\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Ete);
    }

    #[test]
    fn processor_fallback() {
        let cpuinfo = "Processor : ARMv7 Processor rev 2 (v7l)\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Etmv3);
        let cpuinfo = "Processor : AArch64 Processor rev 4 (aarch64)\n";
        assert_eq!(detect_from_cpuinfo(cpuinfo).unwrap(), EtmArch::Etmv4);
    }

    #[test]
    fn unrecognised_architecture() {
        let cpuinfo = "CPU architecture : 6\n";
        match detect_from_cpuinfo(cpuinfo) {
            Err(CsTracerError::ArchDetect(msg)) => assert!(msg.contains("\"6\"")),
            _ => panic!(),
        }
    }

    #[test]
    fn empty_cpuinfo() {
        assert!(matches!(
            detect_from_cpuinfo(""),
            Err(CsTracerError::ArchDetect(_))
        ));
    }
}
