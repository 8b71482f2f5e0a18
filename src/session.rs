//! Multi-source decode sessions.
//!
//! The capture tool drains one sink, but the byte stream it records
//! interleaves frames from every source routed to that sink, each tagged
//! with a hardware trace ID. A session owns one decoder per discovered
//! source and routes inbound chunks to the decoder matching their tag.

use crate::{
    arch::{self, EtmArch},
    decode::{Decoder, Event},
    errors::CsTracerError,
    image::ImageSection,
    perf_args::{self, AddrFilter, CaptureConfig, TraceScope},
    sysfs::{self, Device, Topology},
};
use std::collections::HashMap;

/// Describes the trace source behind one session entry.
#[derive(Clone, Debug)]
pub struct SessionSource {
    pub device_name: String,
    pub trace_id: u8,
    pub cpu: Option<u32>,
}

/// Configures and creates a [Session].
pub struct SessionBuilder {
    scope: TraceScope,
    preferred_sink: Option<String>,
    images: Vec<ImageSection>,
    filters: Vec<AddrFilter>,
    per_cpu: bool,
    trace_id_overrides: HashMap<String, u8>,
}

impl SessionBuilder {
    pub fn new(scope: TraceScope) -> Self {
        Self {
            scope,
            preferred_sink: None,
            images: Vec::new(),
            filters: Vec::new(),
            // A session decodes every core's source, so capture per-cpu.
            per_cpu: true,
            trace_id_overrides: HashMap::new(),
        }
    }

    /// Use the named sink instead of the best-priority one.
    pub fn preferred_sink(mut self, name: &str) -> Self {
        self.preferred_sink = Some(name.to_owned());
        self
    }

    /// Register these binary regions with every decoder in the session.
    pub fn images(mut self, sections: Vec<ImageSection>) -> Self {
        self.images = sections;
        self
    }

    pub fn filters(mut self, filters: Vec<AddrFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn per_cpu(mut self, per_cpu: bool) -> Self {
        self.per_cpu = per_cpu;
        self
    }

    /// Force the trace ID for a named source device.
    ///
    /// The usual ID comes from the device's `trctraceidr` attribute; when
    /// that is absent we guess `core index + 1`, which mirrors the kernel
    /// default but isn't guaranteed on all hardware. This override is the
    /// escape hatch.
    pub fn trace_id_override(mut self, device_name: &str, trace_id: u8) -> Self {
        self.trace_id_overrides
            .insert(device_name.to_owned(), trace_id);
        self
    }

    /// Detect the CPU generation, scan the topology and build the session.
    pub fn build(self) -> Result<Session, CsTracerError> {
        let generation = arch::detect()?;
        let topo = sysfs::scan()?;
        self.build_with(generation, &topo)
    }

    pub(crate) fn build_with(
        self,
        generation: EtmArch,
        topo: &Topology,
    ) -> Result<Session, CsTracerError> {
        let sources = topo.sources();
        if sources.is_empty() {
            return Err(CsTracerError::Scan(format!(
                "no trace sources (etm*) found under {}: cannot build a decode session",
                sysfs::CORESIGHT_DEVICES_PATH
            )));
        }

        let config = perf_args::config_for_topology(
            topo,
            self.scope,
            self.preferred_sink.as_deref(),
            self.filters.clone(),
            self.per_cpu,
        )?;

        let mut entries: Vec<(SessionSource, Decoder)> = Vec::with_capacity(sources.len());
        for dev in sources {
            let trace_id = self.resolve_trace_id(dev);
            // Entries are keyed by trace ID; a clash means the routing would
            // be ambiguous.
            if let Some((clash, _)) = entries.iter().find(|(s, _)| s.trace_id == trace_id) {
                return Err(CsTracerError::ConfigError(format!(
                    "devices {} and {} both resolve to trace ID {trace_id}",
                    clash.device_name, dev.name
                )));
            }
            let mut decoder = Decoder::new(trace_id, generation)?;
            for sec in &self.images {
                decoder.add_image(&sec.path, sec.load_address, sec.file_offset, sec.size)?;
            }
            entries.push((
                SessionSource {
                    device_name: dev.name.clone(),
                    trace_id,
                    cpu: dev.cpu,
                },
                decoder,
            ));
        }

        Ok(Session { entries, config })
    }

    fn resolve_trace_id(&self, dev: &Device) -> u8 {
        if let Some(&id) = self.trace_id_overrides.get(&dev.name) {
            return id;
        }
        dev.trace_id().unwrap_or_else(|| fallback_trace_id(dev.cpu))
    }
}

/// The trace ID to assume when a source doesn't expose `trctraceidr`.
fn fallback_trace_id(cpu: Option<u32>) -> u8 {
    match cpu {
        Some(c) => u8::try_from(c + 1).unwrap_or(1),
        None => 1,
    }
}

/// One decoder per discovered trace source, keyed by trace ID.
///
/// The entry set is fixed at construction.
pub struct Session {
    entries: Vec<(SessionSource, Decoder)>,
    config: CaptureConfig,
}

impl Session {
    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<(SessionSource, Decoder)>, config: CaptureConfig) -> Self {
        Self { entries, config }
    }

    /// The capture configuration the session was built against.
    pub fn capture_config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn sources(&self) -> impl Iterator<Item = &SessionSource> {
        self.entries.iter().map(|(src, _)| src)
    }

    /// Route a chunk of raw trace bytes to the decoder for `trace_id`.
    ///
    /// A trace ID with no matching entry is accepted as a 0-byte no-op:
    /// kernel-level streams routinely carry sources (e.g. STMs) that the
    /// session didn't configure.
    pub fn decode_chunk(
        &mut self,
        trace_id: u8,
        data: &[u8],
        data_index: u64,
    ) -> Result<usize, CsTracerError> {
        match self.entries.iter_mut().find(|(s, _)| s.trace_id == trace_id) {
            Some((_, decoder)) => decoder.decode(data, data_index),
            None => Ok(0),
        }
    }

    /// Flush every decoder, stopping at the first failure.
    pub fn flush(&mut self) -> Result<(), CsTracerError> {
        for (_, decoder) in &mut self.entries {
            decoder.flush()?;
        }
        Ok(())
    }

    /// Drain every decoder's events, concatenated in session entry order.
    ///
    /// Events are *not* globally time-sorted; callers needing chronological
    /// order must sort by timestamp themselves.
    pub fn drain_all_events(&mut self) -> Vec<Event> {
        let mut evs = Vec::new();
        for (_, decoder) in &mut self.entries {
            evs.extend(decoder.drain_events());
        }
        evs
    }
}
