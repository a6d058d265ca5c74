//! Heap limit protection for V8 isolates.
//!
//! V8 calls `FatalProcessOutOfMemory` when its heap runs into the configured
//! limit, which kills the whole host. The near-heap-limit callback installed
//! here turns that into a terminated context instead.
//!
//! ## How it works
//!
//! The engine heap is capped at the budget's soft limit. When V8 approaches it:
//! 1. First call: raise the limit by 10%, capped at the hard limit, to give GC room
//! 2. Subsequent calls (or no room left): terminate the context, and double
//!    the limit so the engine can unwind without aborting
//!
//! For allocations outside V8's managed heap an OOM error handler logs the
//! failure location before V8 aborts.

use std::ffi::{c_char, c_void};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::termination::TerminationHandle;

/// State passed to the near-heap-limit callback.
///
/// Heap-allocated and handed to V8 as a raw pointer; it must be kept alive
/// for the lifetime of the isolate.
pub struct HeapLimitState {
    termination: TerminationHandle,
    memory_limit_hit: Arc<AtomicBool>,
    invocation_count: AtomicU32,
    /// Absolute ceiling the heap may be grown to
    max_heap_bytes: usize,
}

impl HeapLimitState {
    pub fn new(
        termination: TerminationHandle,
        memory_limit_hit: Arc<AtomicBool>,
        max_heap_bytes: usize,
    ) -> Self {
        Self {
            termination,
            memory_limit_hit,
            invocation_count: AtomicU32::new(0),
            max_heap_bytes,
        }
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocation_count.load(Ordering::SeqCst)
    }

    /// Decide the next heap limit. Terminates the context when no more room
    /// can be given.
    fn next_limit(&self, current_heap_limit: usize) -> usize {
        let count = self.invocation_count.fetch_add(1, Ordering::SeqCst);

        tracing::warn!(
            "Near heap limit (count: {}, current: {} MB, max: {} MB)",
            count + 1,
            current_heap_limit / (1024 * 1024),
            self.max_heap_bytes / (1024 * 1024)
        );

        if count == 0 {
            let extra = current_heap_limit / 10;
            let new_limit = (current_heap_limit + extra).min(self.max_heap_bytes);

            if new_limit > current_heap_limit {
                tracing::warn!(
                    "Increasing heap limit to {} MB to allow GC",
                    new_limit / (1024 * 1024)
                );
                return new_limit;
            }
        }

        tracing::error!(
            "Heap limit exhausted after {} callbacks, terminating execution",
            count + 1
        );

        self.memory_limit_hit.store(true, Ordering::SeqCst);
        self.termination.terminate();

        // Headroom for the unwind; the context never runs script again
        current_heap_limit.saturating_mul(2)
    }
}

/// Near-heap-limit callback for V8.
///
/// # Safety
///
/// `data` must point to a `HeapLimitState` that outlives the isolate.
pub unsafe extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: data is the HeapLimitState registered by install_heap_limit_callback
    let state = unsafe { &*(data as *const HeapLimitState) };
    state.next_limit(current_heap_limit)
}

/// Logs V8 OOM failures. Cannot prevent the abort that follows.
unsafe extern "C" fn oom_error_handler(location: *const c_char, details: &v8::OomDetails) {
    let location_str = if location.is_null() {
        "unknown"
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { std::ffi::CStr::from_ptr(location) }
            .to_str()
            .unwrap_or("invalid utf8")
    };

    let detail_str = if details.detail.is_null() {
        ""
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { std::ffi::CStr::from_ptr(details.detail as *const c_char) }
            .to_str()
            .unwrap_or("")
    };

    let oom_type = if details.is_heap_oom {
        "JavaScript heap"
    } else {
        "process/external memory"
    };

    tracing::error!(
        "V8 OOM at {}: {} out of memory{}{}",
        location_str,
        oom_type,
        if detail_str.is_empty() { "" } else { ": " },
        detail_str
    );
}

/// Install heap limit protection on an isolate.
///
/// Must be called before any JavaScript runs. The returned box must outlive
/// the isolate.
pub fn install_heap_limit_callback(
    isolate: &mut v8::Isolate,
    termination: TerminationHandle,
    memory_limit_hit: Arc<AtomicBool>,
    max_heap_bytes: usize,
) -> Box<HeapLimitState> {
    let state = Box::new(HeapLimitState::new(
        termination,
        memory_limit_hit,
        max_heap_bytes,
    ));

    let state_ptr = &*state as *const HeapLimitState as *mut c_void;

    isolate.add_near_heap_limit_callback(near_heap_limit_callback, state_ptr);
    isolate.set_oom_error_handler(oom_error_handler);

    state
}
