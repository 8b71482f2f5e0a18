//! The OpenCSD decode engine.
//!
//! Rust side of the glue over libopencsd's C API (see `opencsd_shim.c`). The
//! shim flattens each generic trace element into `cst_csd_elem_t` and hands
//! it to a callback for the duration of one feed/flush call; nothing borrowed
//! is retained past that call's return.

use super::{BranchClass, DecodeEngine, ElementSink, EngineError, TraceElement};
use crate::{arch::EtmArch, errors::CsTracerError};
use libc::{c_char, c_int, c_void};
use std::{ffi::{CStr, CString}, path::Path};

const CSD_ERR_MSG_LEN: usize = 256;

// Element kinds reported by the shim. Must stay in sync with
// `cst_csd_elem_kind_t` in opencsd_shim.c.
const CSD_ELEM_INSTR_RANGE: c_int = 0;
const CSD_ELEM_TRACE_ON: c_int = 1;
const CSD_ELEM_TRACE_OFF: c_int = 2;
const CSD_ELEM_EXCEPTION: c_int = 3;
const CSD_ELEM_EXCEPTION_RET: c_int = 4;

// Terminating-branch classes. Must stay in sync with `cst_csd_branch_t`.
const CSD_BRANCH_NONE: c_int = 0;
const CSD_BRANCH_DIRECT: c_int = 1;
const CSD_BRANCH_INDIRECT: c_int = 2;

/// A decoded element, as flattened by the shim.
///
// Must stay in sync with the C struct `cst_csd_elem_t`.
#[repr(C)]
struct CsdElem {
    kind: c_int,
    last_branch: c_int,
    timestamp: u64,
    start_addr: u64,
    end_addr: u64,
    cpu: i32,
    exception_number: u32,
}

impl CsdElem {
    fn to_trace_element(&self) -> TraceElement {
        match self.kind {
            CSD_ELEM_INSTR_RANGE => TraceElement::InstrRange {
                start: self.start_addr,
                end: self.end_addr,
                last_branch: match self.last_branch {
                    CSD_BRANCH_INDIRECT => BranchClass::Indirect,
                    CSD_BRANCH_DIRECT => BranchClass::Direct,
                    CSD_BRANCH_NONE | _ => BranchClass::NotABranch,
                },
                cpu: self.cpu,
                timestamp: self.timestamp,
            },
            CSD_ELEM_TRACE_ON => TraceElement::TraceOn {
                addr: self.start_addr,
                timestamp: self.timestamp,
            },
            CSD_ELEM_TRACE_OFF => TraceElement::TraceOff {
                addr: self.start_addr,
                timestamp: self.timestamp,
            },
            CSD_ELEM_EXCEPTION => TraceElement::Exception {
                addr: self.start_addr,
                number: self.exception_number,
                timestamp: self.timestamp,
            },
            CSD_ELEM_EXCEPTION_RET => TraceElement::ExceptionReturn {
                addr: self.start_addr,
                timestamp: self.timestamp,
            },
            _ => TraceElement::Other,
        }
    }
}

/// An error message filled in by C on failure.
///
// Must stay in sync with `cst_csd_err_t`.
#[repr(C)]
struct CsdCError {
    msg: [c_char; CSD_ERR_MSG_LEN],
}

impl CsdCError {
    fn new() -> Self {
        Self {
            msg: [0; CSD_ERR_MSG_LEN],
        }
    }

    fn message(&self) -> String {
        unsafe { CStr::from_ptr(self.msg.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

type CsdElemCb = extern "C" fn(ctx: *mut c_void, elem: *const CsdElem) -> c_int;

extern "C" {
    fn cst_csd_create(trace_id: u8, arch_version: c_int, err: *mut CsdCError) -> *mut c_void;
    fn cst_csd_destroy(dec: *mut c_void);
    fn cst_csd_add_image(
        dec: *mut c_void,
        filename: *const c_char,
        load_address: u64,
        file_offset: u64,
        size: u64,
        err: *mut CsdCError,
    ) -> c_int;
    fn cst_csd_decode(
        dec: *mut c_void,
        data: *const u8,
        len: u32,
        data_index: u64,
        cb: CsdElemCb,
        ctx: *mut c_void,
        err: *mut CsdCError,
    ) -> i64;
    fn cst_csd_flush(
        dec: *mut c_void,
        cb: CsdElemCb,
        ctx: *mut c_void,
        err: *mut CsdCError,
    ) -> c_int;
}

/// Callback context for one feed/flush call.
struct CallbackState<'a, 'q> {
    sink: &'a mut ElementSink<'q>,
    /// Set when the sink failed (queue growth); takes precedence over the
    /// shim's own error report.
    failure: Option<EngineError>,
}

extern "C" fn elem_cb(ctx: *mut c_void, elem: *const CsdElem) -> c_int {
    let state = unsafe { &mut *(ctx as *mut CallbackState) };
    let elem = unsafe { &*elem };
    match state.sink.element(elem.to_trace_element()) {
        Ok(()) => 0,
        Err(e) => {
            state.failure = Some(e);
            -1
        }
    }
}

/// One OpenCSD decode tree, configured for a single trace ID and protocol
/// variant. Owned exclusively; dropping releases the native handle exactly
/// once.
pub(super) struct OpenCsdEngine {
    dec: *mut c_void,
}

impl OpenCsdEngine {
    pub(super) fn new(trace_id: u8, arch: EtmArch) -> Result<Self, CsTracerError> {
        let mut cerr = CsdCError::new();
        let dec = unsafe { cst_csd_create(trace_id, arch.arch_version(), &mut cerr) };
        if dec.is_null() {
            return Err(CsTracerError::Allocation(cerr.message()));
        }
        Ok(Self { dec })
    }
}

impl DecodeEngine for OpenCsdEngine {
    fn add_image(
        &mut self,
        filename: &Path,
        load_address: u64,
        file_offset: u64,
        size: u64,
    ) -> Result<(), String> {
        let c_filename = CString::new(filename.display().to_string())
            .map_err(|e| format!("bad image path: {e}"))?;
        let mut cerr = CsdCError::new();
        let rc = unsafe {
            cst_csd_add_image(
                self.dec,
                c_filename.as_ptr(),
                load_address,
                file_offset,
                size,
                &mut cerr,
            )
        };
        if rc != 0 {
            return Err(cerr.message());
        }
        Ok(())
    }

    fn process(
        &mut self,
        data: &[u8],
        data_index: u64,
        sink: &mut ElementSink<'_>,
    ) -> Result<usize, EngineError> {
        let mut state = CallbackState {
            sink,
            failure: None,
        };
        let mut cerr = CsdCError::new();
        let consumed = unsafe {
            cst_csd_decode(
                self.dec,
                data.as_ptr(),
                u32::try_from(data.len()).map_err(|_| {
                    EngineError::Fatal(format!("trace chunk too large: {} bytes", data.len()))
                })?,
                data_index,
                elem_cb,
                &mut state as *mut CallbackState as *mut c_void,
                &mut cerr,
            )
        };
        if let Some(failure) = state.failure {
            return Err(failure);
        }
        if consumed < 0 {
            return Err(EngineError::Fatal(cerr.message()));
        }
        Ok(usize::try_from(consumed).unwrap_or(0))
    }

    fn flush(&mut self, sink: &mut ElementSink<'_>) -> Result<(), EngineError> {
        let mut state = CallbackState {
            sink,
            failure: None,
        };
        let mut cerr = CsdCError::new();
        let rc = unsafe {
            cst_csd_flush(
                self.dec,
                elem_cb,
                &mut state as *mut CallbackState as *mut c_void,
                &mut cerr,
            )
        };
        if let Some(failure) = state.failure {
            return Err(failure);
        }
        if rc != 0 {
            return Err(EngineError::Fatal(cerr.message()));
        }
        Ok(())
    }
}

impl Drop for OpenCsdEngine {
    fn drop(&mut self) {
        unsafe { cst_csd_destroy(self.dec) };
    }
}
