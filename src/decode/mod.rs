//! Trace decoding.
//!
//! The bit-level ETM packet grammar is delegated to a native decode engine
//! (OpenCSD); this module owns everything around it: the typed event model,
//! the per-handle event queue, the sticky error state and the engine seam.

use crate::{arch::EtmArch, errors::CsTracerError};
use std::{collections::VecDeque, path::Path};
use strum_macros::Display;

#[cfg(opencsd)]
mod opencsd;

/// Initial capacity of a decoder's event queue, in events. The queue doubles
/// whenever the engine outpaces the drain.
const EVENT_QUEUE_START_CAP: usize = 256;

/// What kind of execution event a decoded trace element describes.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum EventKind {
    /// A run of sequentially executed instructions.
    InstructionRange,
    /// An instruction range terminated by a direct branch.
    Call,
    /// An instruction range terminated by an indirect branch.
    Return,
    /// Tracing was (re-)enabled at an address.
    TraceOn,
    /// Tracing was disabled.
    TraceOff,
    /// The core took an exception.
    Exception,
    /// The core returned from an exception.
    ExceptionReturn,
}

/// One decoded execution event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    /// Nanosecond timestamp; 0 if the hardware didn't provide one.
    pub timestamp: u64,
    pub from_addr: u64,
    /// Meaningful for InstructionRange/Call/Return only.
    pub to_addr: u64,
    /// Source CPU; -1 if unknown.
    pub cpu: i32,
    /// Meaningful for Exception only.
    pub exception_number: u32,
}

/// How the terminating instruction of a decoded range branched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BranchClass {
    /// Fell through, or no branch at all.
    NotABranch,
    Direct,
    Indirect,
}

/// A decoded element as reported across the native engine boundary, already
/// flattened out of the engine's own representation.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TraceElement {
    InstrRange {
        start: u64,
        end: u64,
        last_branch: BranchClass,
        cpu: i32,
        timestamp: u64,
    },
    TraceOn {
        addr: u64,
        timestamp: u64,
    },
    TraceOff {
        addr: u64,
        timestamp: u64,
    },
    Exception {
        addr: u64,
        number: u32,
        timestamp: u64,
    },
    ExceptionReturn {
        addr: u64,
        timestamp: u64,
    },
    /// Any element kind we don't track (PE context, timestamp-only
    /// markers, ...).
    Other,
}

/// Turn a native element into an event, or `None` for element kinds we
/// intentionally filter out (that is not an omission: unrelated element kinds
/// are expected in every stream).
pub(crate) fn classify(elem: &TraceElement) -> Option<Event> {
    let ev = match *elem {
        TraceElement::InstrRange {
            start,
            end,
            last_branch,
            cpu,
            timestamp,
        } => {
            let kind = match last_branch {
                // An indirect terminating branch is how a return manifests.
                BranchClass::Indirect => EventKind::Return,
                BranchClass::Direct => EventKind::Call,
                BranchClass::NotABranch => EventKind::InstructionRange,
            };
            Event {
                kind,
                timestamp,
                from_addr: start,
                to_addr: end,
                cpu,
                exception_number: 0,
            }
        }
        TraceElement::TraceOn { addr, timestamp } => Event {
            kind: EventKind::TraceOn,
            timestamp,
            from_addr: addr,
            to_addr: 0,
            cpu: -1,
            exception_number: 0,
        },
        TraceElement::TraceOff { addr, timestamp } => Event {
            kind: EventKind::TraceOff,
            timestamp,
            from_addr: addr,
            to_addr: 0,
            cpu: -1,
            exception_number: 0,
        },
        TraceElement::Exception {
            addr,
            number,
            timestamp,
        } => Event {
            kind: EventKind::Exception,
            timestamp,
            from_addr: addr,
            to_addr: 0,
            cpu: -1,
            exception_number: number,
        },
        TraceElement::ExceptionReturn { addr, timestamp } => Event {
            kind: EventKind::ExceptionReturn,
            timestamp,
            from_addr: addr,
            to_addr: 0,
            cpu: -1,
            exception_number: 0,
        },
        TraceElement::Other => return None,
    };
    Some(ev)
}

/// An error from the engine seam.
#[derive(Debug)]
pub(crate) enum EngineError {
    /// The engine rejected the stream.
    Fatal(String),
    /// The event queue (or an engine-internal buffer) couldn't grow.
    Alloc(String),
}

/// A FIFO of decoded events with explicit, fallible growth.
///
/// Growth doubles the capacity and preserves unread entries in order;
/// allocation failure surfaces as a decode error rather than aborting the
/// process.
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(EVENT_QUEUE_START_CAP),
        }
    }

    pub(crate) fn push(&mut self, ev: Event) -> Result<(), EngineError> {
        if self.events.len() == self.events.capacity() {
            // Reserving len-many extra slots doubles the capacity. After
            // this, the push below cannot allocate (and thus cannot panic).
            let cap = self.events.capacity();
            self.events
                .try_reserve_exact(cap)
                .map_err(|e| EngineError::Alloc(format!("event queue growth failed: {e}")))?;
        }
        self.events.push_back(ev);
        Ok(())
    }

    fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// Where an engine deposits decoded elements during a feed or flush call.
///
/// Borrowed for the duration of one engine call only; an engine must not
/// retain it (or the input bytes) past the call's return.
pub(crate) struct ElementSink<'a> {
    queue: &'a mut EventQueue,
}

impl ElementSink<'_> {
    pub(crate) fn element(&mut self, elem: TraceElement) -> Result<(), EngineError> {
        match classify(&elem) {
            Some(ev) => self.queue.push(ev),
            None => Ok(()),
        }
    }
}

/// The seam to the native decode engine.
///
/// One engine instance decodes one source's byte stream. "Unsupported packet"
/// conditions are tolerated inside implementations and never surface here.
pub(crate) trait DecodeEngine {
    /// Register a binary region so the engine can read instruction bytes
    /// when resolving indirect branch targets.
    fn add_image(
        &mut self,
        filename: &Path,
        load_address: u64,
        file_offset: u64,
        size: u64,
    ) -> Result<(), String>;

    /// Feed raw trace bytes, emitting decoded elements into `sink`. Returns
    /// the number of bytes consumed. `data_index` is the byte offset of
    /// `data` within the overall stream, for error reporting.
    fn process(
        &mut self,
        data: &[u8],
        data_index: u64,
        sink: &mut ElementSink<'_>,
    ) -> Result<usize, EngineError>;

    /// Signal end-of-stream so the engine emits anything it was withholding
    /// pending lookahead.
    fn flush(&mut self, sink: &mut ElementSink<'_>) -> Result<(), EngineError>;
}

/// A decoder for one trace source's byte stream.
///
/// Exclusively owns a native engine instance and the queue of events it has
/// produced. Once a decode error occurs the handle is poisoned: every
/// subsequent decode or flush fails until the handle is discarded. Dropping
/// the decoder releases the native resources exactly once.
pub struct Decoder {
    trace_id: u8,
    engine: Box<dyn DecodeEngine>,
    queue: EventQueue,
    /// Sticky error message; never cleared once set.
    err: Option<String>,
}

impl Decoder {
    /// Create a decoder for the source tagged `trace_id`, speaking the
    /// protocol variant implied by `arch`.
    pub fn new(trace_id: u8, arch: EtmArch) -> Result<Self, CsTracerError> {
        #[cfg(opencsd)]
        {
            let engine = opencsd::OpenCsdEngine::new(trace_id, arch)?;
            Ok(Self::with_engine(trace_id, Box::new(engine)))
        }
        #[cfg(not(opencsd))]
        {
            let _ = arch;
            Err(CsTracerError::EngineUnavailable(format!(
                "OpenCSD support was not compiled in (libopencsd wasn't found \
                 at build time), so trace ID {trace_id} cannot be decoded"
            )))
        }
    }

    pub(crate) fn with_engine(trace_id: u8, engine: Box<dyn DecodeEngine>) -> Self {
        Self {
            trace_id,
            engine,
            queue: EventQueue::new(),
            err: None,
        }
    }

    pub fn trace_id(&self) -> u8 {
        self.trace_id
    }

    /// Register a binary image region with the engine. May be called any
    /// number of times before decoding starts.
    pub fn add_image(
        &mut self,
        filename: &Path,
        load_address: u64,
        file_offset: u64,
        size: u64,
    ) -> Result<(), CsTracerError> {
        self.engine
            .add_image(filename, load_address, file_offset, size)
            .map_err(|msg| CsTracerError::ImageRegistration {
                filename: filename.display().to_string(),
                msg,
            })
    }

    /// Feed raw trace bytes. Returns the number of bytes consumed.
    ///
    /// Feeding an empty slice is a no-op returning `Ok(0)`.
    pub fn decode(&mut self, data: &[u8], data_index: u64) -> Result<usize, CsTracerError> {
        if let Some(msg) = &self.err {
            return Err(CsTracerError::Decode {
                msg: msg.clone(),
                data_index,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }
        let mut sink = ElementSink {
            queue: &mut self.queue,
        };
        match self.engine.process(data, data_index, &mut sink) {
            Ok(consumed) => Ok(consumed),
            Err(e) => Err(self.poison(e, data_index)),
        }
    }

    /// Signal end-of-stream. Call exactly once, after all feeds.
    pub fn flush(&mut self) -> Result<(), CsTracerError> {
        if let Some(msg) = &self.err {
            return Err(CsTracerError::Decode {
                msg: msg.clone(),
                data_index: 0,
            });
        }
        let mut sink = ElementSink {
            queue: &mut self.queue,
        };
        match self.engine.flush(&mut sink) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.poison(e, 0)),
        }
    }

    /// Record a sticky error and build the corresponding crate error.
    fn poison(&mut self, e: EngineError, data_index: u64) -> CsTracerError {
        match e {
            EngineError::Fatal(msg) => {
                self.err = Some(msg.clone());
                CsTracerError::Decode { msg, data_index }
            }
            EngineError::Alloc(msg) => {
                self.err = Some(msg.clone());
                CsTracerError::Allocation(msg)
            }
        }
    }

    /// Pop the oldest undrained event, if any. Each event is handed out at
    /// most once.
    pub fn next_event(&mut self) -> Option<Event> {
        self.queue.pop()
    }

    /// Drain every buffered event, oldest first. Never blocks, never fails.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut evs = Vec::with_capacity(self.queue.len());
        while let Some(ev) = self.queue.pop() {
            evs.push(ev);
        }
        evs
    }

    pub fn has_error(&self) -> bool {
        self.err.is_some()
    }

    pub fn error_msg(&self) -> Option<&str> {
        self.err.as_deref()
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
pub(crate) mod test_engine {
    use super::{BranchClass, DecodeEngine, ElementSink, EngineError, TraceElement};
    use std::path::Path;

    /// An engine that emits one instruction-range element per input byte,
    /// with `from_addr` counting up from 1 so tests can check ordering.
    pub(crate) struct CountingEngine {
        emitted: u64,
        pub(crate) images: Vec<String>,
    }

    impl CountingEngine {
        pub(crate) fn new() -> Self {
            Self {
                emitted: 0,
                images: Vec::new(),
            }
        }
    }

    impl DecodeEngine for CountingEngine {
        fn add_image(
            &mut self,
            filename: &Path,
            _load_address: u64,
            _file_offset: u64,
            _size: u64,
        ) -> Result<(), String> {
            self.images.push(filename.display().to_string());
            Ok(())
        }

        fn process(
            &mut self,
            data: &[u8],
            _data_index: u64,
            sink: &mut ElementSink<'_>,
        ) -> Result<usize, EngineError> {
            for _ in data {
                self.emitted += 1;
                sink.element(TraceElement::InstrRange {
                    start: self.emitted,
                    end: self.emitted + 4,
                    last_branch: BranchClass::NotABranch,
                    cpu: 0,
                    timestamp: 0,
                })?;
            }
            Ok(data.len())
        }

        fn flush(&mut self, sink: &mut ElementSink<'_>) -> Result<(), EngineError> {
            // Model an engine holding back a final element until end-of-stream.
            sink.element(TraceElement::TraceOff {
                addr: self.emitted,
                timestamp: 0,
            })
        }
    }

    /// An engine whose feed and flush always fail.
    pub(crate) struct FailingEngine;

    impl DecodeEngine for FailingEngine {
        fn add_image(
            &mut self,
            _filename: &Path,
            _load_address: u64,
            _file_offset: u64,
            _size: u64,
        ) -> Result<(), String> {
            Err("bad image".to_owned())
        }

        fn process(
            &mut self,
            _data: &[u8],
            _data_index: u64,
            _sink: &mut ElementSink<'_>,
        ) -> Result<usize, EngineError> {
            Err(EngineError::Fatal("scripted decode failure".to_owned()))
        }

        fn flush(&mut self, _sink: &mut ElementSink<'_>) -> Result<(), EngineError> {
            Err(EngineError::Fatal("scripted flush failure".to_owned()))
        }
    }
}
