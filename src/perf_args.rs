//! Building the argument list for the external capture tool.
//!
//! We never spawn `perf` ourselves; the launcher does. This module is pure
//! value construction: turning a scope/sink/filter selection into the exact
//! flags `perf record` and `perf script` need.

use crate::{
    errors::CsTracerError,
    sysfs::{self, Topology},
};
use std::path::{Path, PathBuf};

/// The perf event namespace registered by the CoreSight ETM driver.
const CS_ETM_EVENT_NS: &str = "cs_etm";

/// Which privilege levels to trace.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceScope {
    User,
    Kernel,
    Both,
}

impl TraceScope {
    /// The perf event modifier for this scope.
    fn code(&self) -> &'static str {
        match self {
            Self::User => "u",
            Self::Kernel => "k",
            Self::Both => "uk",
        }
    }
}

/// An address-range filter restricting what the hardware traces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddrFilter {
    pub start: u64,
    pub size: u64,
}

impl AddrFilter {
    fn to_perf_filter(self) -> String {
        format!("filter {:#x}/{:#x}", self.start, self.size)
    }
}

/// Everything needed to launch the capture subprocess.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// The sink device the hardware routes trace bytes to.
    pub sink: String,
    pub scope: TraceScope,
    pub filters: Vec<AddrFilter>,
    /// `--per-cpu` when true, `--per-thread` otherwise.
    pub per_cpu: bool,
    /// Capture-tool override. The CLI layer reads this from the environment
    /// and threads it through here; nothing in this crate consults the
    /// environment directly.
    pub perf_binary: Option<PathBuf>,
}

impl CaptureConfig {
    pub fn new(sink: &str, scope: TraceScope, filters: Vec<AddrFilter>, per_cpu: bool) -> Self {
        Self {
            sink: sink.to_owned(),
            scope,
            filters,
            per_cpu,
            perf_binary: None,
        }
    }

    /// The capture tool to invoke.
    pub fn perf_binary(&self) -> &Path {
        self.perf_binary.as_deref().unwrap_or(Path::new("perf"))
    }

    /// The `-e`/`--event` token: `cs_etm/@<sink>/<scope>`.
    pub fn event_string(&self) -> String {
        format!("{}/@{}/{}", CS_ETM_EVENT_NS, self.sink, self.scope.code())
    }

    /// The argument list for `perf record`, in fixed order.
    pub fn to_capture_args(&self) -> Vec<String> {
        let mut args = vec!["--event".to_owned(), self.event_string()];
        if self.per_cpu {
            args.push("--per-cpu".to_owned());
        } else {
            args.push("--per-thread".to_owned());
        }
        if !self.filters.is_empty() {
            let joined = self
                .filters
                .iter()
                .map(|f| f.to_perf_filter())
                .collect::<Vec<_>>()
                .join(" ");
            args.push("--filter".to_owned());
            args.push(joined);
        }
        args
    }

    /// The argument list for `perf script` when replaying the capture:
    /// branch events, big-endian frame handling left to the tool.
    pub fn to_decode_args(&self) -> Vec<String> {
        vec!["--itrace=be".to_owned()]
    }
}

/// Scan the topology, pick a sink and build a [CaptureConfig] in one step,
/// propagating the first failure.
pub fn auto_config(
    scope: TraceScope,
    preferred_sink: Option<&str>,
    filters: Vec<AddrFilter>,
    per_cpu: bool,
) -> Result<CaptureConfig, CsTracerError> {
    let topo = sysfs::scan()?;
    config_for_topology(&topo, scope, preferred_sink, filters, per_cpu)
}

pub(crate) fn config_for_topology(
    topo: &Topology,
    scope: TraceScope,
    preferred_sink: Option<&str>,
    filters: Vec<AddrFilter>,
    per_cpu: bool,
) -> Result<CaptureConfig, CsTracerError> {
    let sink = sysfs::select_sink(preferred_sink, topo)?;
    Ok(CaptureConfig::new(&sink.name, scope, filters, per_cpu))
}

/// The sampled event kinds the non-ETM collection modes can add. The ARM
/// hardware-trace path ignores these entirely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExtraEventKind {
    CacheMisses,
    BranchMisses,
}

impl ExtraEventKind {
    fn perf_name(&self) -> &'static str {
        match self {
            Self::CacheMisses => "cache-misses",
            Self::BranchMisses => "branch-misses",
        }
    }

    /// The default sampling period for this event kind.
    fn default_period(&self) -> u64 {
        match self {
            Self::CacheMisses => 10007,
            Self::BranchMisses => 100003,
        }
    }
}

/// One sampled event with its period (defaulted per kind, or overridden).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SampledEvent {
    pub kind: ExtraEventKind,
    pub period: u64,
}

impl SampledEvent {
    pub fn new(kind: ExtraEventKind) -> Self {
        Self {
            kind,
            period: kind.default_period(),
        }
    }

    /// The perf event token, always maximally precise (`/P`).
    pub fn to_perf_event_arg(&self) -> String {
        format!("{}/period={}/P", self.kind.perf_name(), self.period)
    }
}

/// Parse the comma-separated extra-events flag: each element is an event name
/// (`cache-misses` or `branch-misses`), optionally `name:period`.
pub fn parse_extra_events(flag: &str) -> Result<Vec<SampledEvent>, CsTracerError> {
    let mut events = Vec::new();
    for item in flag.split(',').filter(|s| !s.is_empty()) {
        let (name, period) = match item.split_once(':') {
            Some((name, period)) => {
                let period = period.parse::<u64>().map_err(|_| {
                    CsTracerError::ConfigError(format!(
                        "bad sampling period {period:?} in extra event {item:?}"
                    ))
                })?;
                (name, Some(period))
            }
            None => (item, None),
        };
        let kind = match name {
            "cache-misses" => ExtraEventKind::CacheMisses,
            "branch-misses" => ExtraEventKind::BranchMisses,
            other => {
                return Err(CsTracerError::ConfigError(format!(
                    "unknown extra event {other:?}: expected cache-misses or branch-misses"
                )));
            }
        };
        let mut ev = SampledEvent::new(kind);
        if let Some(period) = period {
            ev.period = period;
        }
        events.push(ev);
    }
    Ok(events)
}
