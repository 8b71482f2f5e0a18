//! CoreSight topology discovery.
//!
//! The kernel exposes every CoreSight component as a directory under a fixed
//! sysfs namespace. We classify each device by its name, associate trace
//! sources with the CPU core they instrument, and rank candidate sinks.
//!
//! A scan always reflects the kernel's current view: results are never cached
//! across calls.

use crate::errors::CsTracerError;
use std::{
    fs::{read_dir, read_to_string},
    path::{Path, PathBuf},
};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Where the kernel exposes CoreSight devices.
pub const CORESIGHT_DEVICES_PATH: &str = "/sys/bus/coresight/devices";

/// The perf event source registered by the CoreSight ETM driver.
const CS_ETM_EVENT_TYPE_PATH: &str = "/sys/bus/event_source/devices/cs_etm/type";

/// The kinds of sink, best first.
///
/// An ETR drains to system RAM and so has effectively unbounded capacity; ETF
/// and ETB are small dedicated FIFOs/buffers and overflow easily. Variant
/// order is the selection priority.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd, EnumIter)]
pub enum SinkKind {
    /// Trace Memory Controller in Embedded Trace Router configuration.
    Etr,
    /// TMC in Embedded Trace FIFO configuration.
    Etf,
    /// Embedded Trace Buffer.
    Etb,
}

impl SinkKind {
    /// The device-name prefix the kernel gives this kind of sink.
    fn prefix(&self) -> &'static str {
        match self {
            Self::Etr => "tmc_etr",
            Self::Etf => "tmc_etf",
            Self::Etb => "tmc_etb",
        }
    }

    /// Selection priority: lower is better.
    pub fn priority(&self) -> u8 {
        *self as u8
    }
}

/// What a CoreSight device is, judged from its name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    /// An ETM/ETE trace source instrumenting one CPU core.
    Source,
    /// A trace sink.
    Sink(SinkKind),
    /// A funnel merging several trace streams into one.
    Funnel,
    /// A replicator duplicating one trace stream to several sinks.
    Replicator,
    /// Anything else (CTIs, STMs, ...), recorded by name.
    Unknown(String),
}

/// Classify a device by its sysfs directory name. The most specific prefix
/// wins (`tmc_etr` before `etm`).
pub(crate) fn classify(name: &str) -> DeviceKind {
    for sink in SinkKind::iter() {
        if name.starts_with(sink.prefix()) {
            return DeviceKind::Sink(sink);
        }
    }
    if name.starts_with("etm") {
        DeviceKind::Source
    } else if name.starts_with("funnel") {
        DeviceKind::Funnel
    } else if name.starts_with("replicator") {
        DeviceKind::Replicator
    } else {
        DeviceKind::Unknown(name.to_owned())
    }
}

/// One CoreSight device, as discovered by a scan.
#[derive(Clone, Debug)]
pub struct Device {
    /// The device name, unique within a scan.
    pub name: String,
    pub kind: DeviceKind,
    /// The device's sysfs directory.
    pub path: PathBuf,
    /// For sources, the index of the CPU core this device instruments (from
    /// the per-device `cpu` attribute). `None` if absent or unparseable.
    pub cpu: Option<u32>,
}

impl Device {
    /// The hardware trace ID for a source, from the per-device `trctraceidr`
    /// attribute (`0x`-prefixed hex or bare decimal). `None` if the attribute
    /// is missing or unparseable, which is an ordinary condition on older
    /// kernels.
    pub fn trace_id(&self) -> Option<u8> {
        parse_sysfs_int(&read_attr(&self.path, "trctraceidr")?).and_then(|v| u8::try_from(v).ok())
    }

    /// For sinks, the buffer size in bytes from the `mem_size` attribute.
    /// Diagnostics only.
    pub fn mem_size(&self) -> Option<u64> {
        parse_sysfs_int(&read_attr(&self.path, "mem_size")?)
    }
}

/// Read a per-device attribute file, trimmed. `None` on any failure.
fn read_attr(dev_path: &Path, attr: &str) -> Option<String> {
    read_to_string(dev_path.join(attr))
        .ok()
        .map(|s| s.trim().to_owned())
}

/// Parse a sysfs integer attribute: `0x`-prefixed hex or bare decimal.
fn parse_sysfs_int(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// The result of one topology scan.
#[derive(Debug)]
pub struct Topology {
    /// Every device found, in name order.
    pub devices: Vec<Device>,
}

impl Topology {
    /// The trace sources, ordered by owning-core index ascending (sources
    /// with an unknown core first, otherwise in scan order).
    pub fn sources(&self) -> Vec<&Device> {
        let mut srcs = self
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Source)
            .collect::<Vec<_>>();
        srcs.sort_by_key(|d| d.cpu);
        srcs
    }

    /// The sinks paired with their selection priority, best first.
    pub fn sinks(&self) -> Vec<(&Device, u8)> {
        let mut sinks = self
            .devices
            .iter()
            .filter_map(|d| match d.kind {
                DeviceKind::Sink(kind) => Some((d, kind.priority())),
                _ => None,
            })
            .collect::<Vec<_>>();
        sinks.sort_by_key(|(_, prio)| *prio);
        sinks
    }
}

/// Scan the CoreSight device namespace.
///
/// Fails only if the namespace itself is absent or unreadable. A topology
/// with no sources (or no sinks) is a valid scan result; it's the caller's
/// decision whether that is fatal.
pub fn scan() -> Result<Topology, CsTracerError> {
    scan_path(Path::new(CORESIGHT_DEVICES_PATH))
}

pub(crate) fn scan_path(dir: &Path) -> Result<Topology, CsTracerError> {
    if !dir.exists() {
        return Err(CsTracerError::Scan(format!(
            "device namespace {} does not exist: no CoreSight hardware, or the \
             coresight drivers aren't loaded",
            dir.display()
        )));
    }

    let mut names = Vec::new();
    let entries = read_dir(dir)
        .map_err(|e| CsTracerError::Scan(format!("cannot list {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| CsTracerError::Scan(format!("cannot list {}: {e}", dir.display())))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    // read_dir order is arbitrary; sort for a stable device sequence.
    names.sort();

    let mut devices = Vec::new();
    for name in names {
        let path = dir.join(&name);
        let kind = classify(&name);
        let cpu = if kind == DeviceKind::Source {
            read_attr(&path, "cpu").and_then(|s| s.parse().ok())
        } else {
            None
        };
        let dev = Device {
            name,
            kind,
            path,
            cpu,
        };
        if let DeviceKind::Sink(kind) = dev.kind {
            log::debug!(
                "found {:?} sink {} (buffer size: {:?})",
                kind,
                dev.name,
                dev.mem_size()
            );
        }
        devices.push(dev);
    }

    Ok(Topology { devices })
}

/// Pick a sink from a scanned topology.
///
/// With `preferred` the whole device list is searched by exact name (the
/// operator may legitimately name a non-sink device the kernel can route
/// to); otherwise the best-priority sink wins.
pub fn select_sink<'t>(
    preferred: Option<&str>,
    topo: &'t Topology,
) -> Result<&'t Device, CsTracerError> {
    match preferred {
        Some(name) => topo.devices.iter().find(|d| d.name == name).ok_or_else(|| {
            let avail = topo
                .devices
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            CsTracerError::SinkSelect(format!(
                "no device named {name:?}; available devices: [{avail}]"
            ))
        }),
        None => topo.sinks().first().map(|(d, _)| *d).ok_or_else(|| {
            let kinds = SinkKind::iter()
                .map(|s| s.prefix())
                .collect::<Vec<_>>()
                .join(", ");
            CsTracerError::SinkSelect(format!(
                "no trace sink found (searched for {kinds} under {CORESIGHT_DEVICES_PATH})"
            ))
        }),
    }
}

/// Returns `true` if the capture tool can drive the ETM: the coresight perf
/// event source must be registered. Pure heuristic; `false` on any failure.
pub fn supports_trace_tooling() -> bool {
    read_to_string(CS_ETM_EVENT_TYPE_PATH)
        .map(|s| s.trim().parse::<u32>().is_ok())
        .unwrap_or(false)
}


#[cfg(test)]
mod tests {
    use super::{classify, scan_path, select_sink, test_helpers::mk_device, DeviceKind, SinkKind};
    use crate::errors::CsTracerError;
    use tempfile::tempdir;

    #[test]
    fn classification() {
        assert_eq!(classify("etm0"), DeviceKind::Source);
        assert_eq!(classify("tmc_etr0"), DeviceKind::Sink(SinkKind::Etr));
        assert_eq!(classify("tmc_etf1"), DeviceKind::Sink(SinkKind::Etf));
        assert_eq!(classify("tmc_etb0"), DeviceKind::Sink(SinkKind::Etb));
        assert_eq!(classify("funnel0"), DeviceKind::Funnel);
        assert_eq!(classify("replicator0"), DeviceKind::Replicator);
        assert_eq!(classify("stm0"), DeviceKind::Unknown("stm0".to_owned()));
    }

    #[test]
    fn scan_missing_namespace() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("no-such-dir");
        match scan_path(&bogus) {
            Err(CsTracerError::Scan(msg)) => {
                assert!(msg.contains(bogus.to_str().unwrap()));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn scan_orders_sources_by_cpu() {
        let dir = tempdir().unwrap();
        // Created out of order on purpose; names sort as etm0, etm1, etm2.
        mk_device(dir.path(), "etm1", &[("cpu", "1")]);
        mk_device(dir.path(), "etm0", &[("cpu", "2")]);
        mk_device(dir.path(), "etm2", &[]); // no cpu attribute
        let topo = scan_path(dir.path()).unwrap();
        let srcs = topo.sources();
        // Unknown core sorts first, then ascending core index.
        let names = srcs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["etm2", "etm1", "etm0"]);
        assert_eq!(srcs[1].cpu, Some(1));
        assert_eq!(srcs[2].cpu, Some(2));
    }

    #[test]
    fn sources_and_sinks_are_disjoint_and_exhaustive() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "etm0", &[("cpu", "0")]);
        mk_device(dir.path(), "etm1", &[("cpu", "1")]);
        mk_device(dir.path(), "tmc_etr0", &[]);
        mk_device(dir.path(), "tmc_etf0", &[]);
        mk_device(dir.path(), "funnel0", &[]);
        let topo = scan_path(dir.path()).unwrap();
        assert_eq!(topo.devices.len(), 5);
        assert_eq!(topo.sources().len(), 2);
        assert_eq!(topo.sinks().len(), 2);
        for (sink, _) in topo.sinks() {
            assert!(!topo.sources().iter().any(|s| s.name == sink.name));
        }
    }

    #[test]
    fn sink_priority_is_stable() {
        let dir = tempdir().unwrap();
        // Name order puts the ETB and ETF before the ETR; priority must win
        // regardless of listing order.
        mk_device(dir.path(), "tmc_etb0", &[]);
        mk_device(dir.path(), "tmc_etf0", &[]);
        mk_device(dir.path(), "tmc_etr0", &[]);
        let topo = scan_path(dir.path()).unwrap();
        let sinks = topo.sinks();
        assert_eq!(sinks[0].0.name, "tmc_etr0");
        assert_eq!(sinks[0].1, 0);
        assert_eq!(select_sink(None, &topo).unwrap().name, "tmc_etr0");
    }

    #[test]
    fn select_named_device_of_any_kind() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "tmc_etr0", &[]);
        mk_device(dir.path(), "funnel0", &[]);
        let topo = scan_path(dir.path()).unwrap();
        // Even a non-sink device can be named explicitly.
        assert_eq!(select_sink(Some("funnel0"), &topo).unwrap().name, "funnel0");
    }

    #[test]
    fn select_unknown_name_lists_devices() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "tmc_etr0", &[]);
        mk_device(dir.path(), "etm0", &[("cpu", "0")]);
        let topo = scan_path(dir.path()).unwrap();
        match select_sink(Some("tmc_etr9"), &topo) {
            Err(CsTracerError::SinkSelect(msg)) => {
                assert!(msg.contains("tmc_etr9"));
                assert!(msg.contains("etm0"));
                assert!(msg.contains("tmc_etr0"));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn select_with_no_sinks() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "etm0", &[("cpu", "0")]);
        let topo = scan_path(dir.path()).unwrap();
        match select_sink(None, &topo) {
            Err(CsTracerError::SinkSelect(msg)) => {
                assert!(msg.contains("tmc_etr"));
                assert!(msg.contains("tmc_etf"));
                assert!(msg.contains("tmc_etb"));
            }
            _ => panic!(),
        }
    }

    #[test]
    fn trace_id_attribute() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "etm0", &[("cpu", "0"), ("trctraceidr", "0x10")]);
        mk_device(dir.path(), "etm1", &[("cpu", "1"), ("trctraceidr", "12")]);
        mk_device(dir.path(), "etm2", &[("cpu", "2")]);
        let topo = scan_path(dir.path()).unwrap();
        let srcs = topo.sources();
        assert_eq!(srcs[0].trace_id(), Some(0x10));
        assert_eq!(srcs[1].trace_id(), Some(12));
        assert_eq!(srcs[2].trace_id(), None);
    }

    #[test]
    fn lenient_cpu_attribute() {
        let dir = tempdir().unwrap();
        mk_device(dir.path(), "etm0", &[("cpu", "junk")]);
        let topo = scan_path(dir.path()).unwrap();
        assert_eq!(topo.sources()[0].cpu, None);
    }
}
