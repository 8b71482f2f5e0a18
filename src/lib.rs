//! Hardware instruction-trace acquisition and decoding.
//!
//! This crate wraps the kernel's view of on-chip tracing hardware: it
//! discovers the CoreSight component topology under sysfs, picks a trace
//! sink, builds the argument set for the external `perf` capture process
//! and decodes the raw trace bytes that capture produces into a typed
//! event stream via a native decode engine (OpenCSD, when available at
//! build time).
//!
//! The usual flow is: [choose_collection_mode] to pick an acquisition
//! strategy, then for the ARM path a [session::SessionBuilder] to scan
//! the topology and wire up one decoder per trace source.
//!
//! Whether a native decode engine was linked is a build-time property;
//! [decode::Decoder::new] reports its absence at runtime as
//! [errors::CsTracerError::EngineUnavailable].

pub mod arch;
pub mod decode;
pub mod errors;
pub mod image;
pub mod perf_args;
pub mod session;
pub mod sysfs;

pub use decode::{Decoder, Event, EventKind};
pub use errors::CsTracerError;
pub use image::{code_sections, ImageSection};
pub use perf_args::{
    parse_extra_events, AddrFilter, CaptureConfig, ExtraEventKind, SampledEvent, TraceScope,
};
pub use session::{Session, SessionBuilder, SessionSource};

use std::path::Path;

/// Where the kernel exposes the Intel PT PMU when the CPU has it.
const INTEL_PT_PMU_PATH: &str = "/sys/bus/event_source/devices/intel_pt";

/// One of the three mutually exclusive acquisition strategies.
///
/// Chosen once per run by [choose_collection_mode]; never changes
/// afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionMode {
    /// Intel PT hardware trace, optionally augmented with extra sampled
    /// events interleaved into the same perf session.
    IntelPt { extra_events: Vec<SampledEvent> },
    /// ARM CoreSight ETM hardware trace. The sink is resolved later, when
    /// the session scans the topology.
    CoresightEtm { preferred_sink: Option<String> },
    /// Statistical sampling fallback for hardware with neither trace unit.
    Sampling { extra_events: Vec<SampledEvent> },
}

/// Pick the acquisition strategy from the user's flags and the hardware
/// actually present on this machine.
///
/// `use_arm` and `use_sampling` are explicit user requests and win over
/// any probe, ARM first. With neither set, Intel PT is preferred when its
/// PMU exists, then CoreSight, then sampling. `extra_events` never reaches
/// the ARM path: ETM capture can't interleave sampled events.
pub fn choose_collection_mode(
    use_arm: bool,
    use_sampling: bool,
    extra_events: Vec<SampledEvent>,
) -> CollectionMode {
    choose_with_probes(
        use_arm,
        use_sampling,
        extra_events,
        Path::new(INTEL_PT_PMU_PATH).exists(),
        sysfs::supports_trace_tooling(),
    )
}

fn choose_with_probes(
    use_arm: bool,
    use_sampling: bool,
    extra_events: Vec<SampledEvent>,
    pt_present: bool,
    etm_present: bool,
) -> CollectionMode {
    if use_arm {
        return CollectionMode::CoresightEtm {
            preferred_sink: None,
        };
    }
    if use_sampling {
        return CollectionMode::Sampling { extra_events };
    }
    if pt_present {
        return CollectionMode::IntelPt { extra_events };
    }
    if etm_present {
        log::info!("no Intel PT support; using ARM CoreSight hardware trace");
        return CollectionMode::CoresightEtm {
            preferred_sink: None,
        };
    }
    log::info!("no hardware trace support detected; falling back to sampling");
    CollectionMode::Sampling { extra_events }
}

#[cfg(test)]
mod tests {
    use super::{choose_with_probes, CollectionMode};
    use crate::perf_args::{ExtraEventKind, SampledEvent};

    fn evs() -> Vec<SampledEvent> {
        vec![SampledEvent::new(ExtraEventKind::CacheMisses)]
    }

    #[test]
    fn no_flags_prefers_intel_pt() {
        assert_eq!(
            choose_with_probes(false, false, evs(), true, true),
            CollectionMode::IntelPt { extra_events: evs() }
        );
    }

    #[test]
    fn no_flags_falls_back_to_coresight() {
        assert_eq!(
            choose_with_probes(false, false, evs(), false, true),
            CollectionMode::CoresightEtm {
                preferred_sink: None
            }
        );
    }

    #[test]
    fn no_flags_no_hardware_samples() {
        assert_eq!(
            choose_with_probes(false, false, evs(), false, false),
            CollectionMode::Sampling { extra_events: evs() }
        );
    }

    #[test]
    fn arm_flag_wins_over_probes() {
        // Even with PT present and no ETM namespace.
        assert_eq!(
            choose_with_probes(true, false, evs(), true, false),
            CollectionMode::CoresightEtm {
                preferred_sink: None
            }
        );
    }

    #[test]
    fn arm_flag_beats_sampling_flag() {
        assert_eq!(
            choose_with_probes(true, true, vec![], true, true),
            CollectionMode::CoresightEtm {
                preferred_sink: None
            }
        );
    }

    #[test]
    fn sampling_flag_wins_over_pt() {
        assert_eq!(
            choose_with_probes(false, true, evs(), true, true),
            CollectionMode::Sampling { extra_events: evs() }
        );
    }
}
