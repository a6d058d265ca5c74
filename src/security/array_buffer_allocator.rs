//! Budget-enforcing V8 ArrayBuffer allocator.
//!
//! V8's heap limits (`CreateParams::heap_limits`) only cover the JavaScript heap,
//! NOT ArrayBuffer allocations (Uint8Array, Buffer, etc.). This allocator charges
//! every buffer allocation against a hard ceiling that also includes the engine's
//! own heap size.
//!
//! ## How it works
//!
//! 1. V8 calls `allocate()` when JS does `new ArrayBuffer(n)` or `new Uint8Array(n)`
//! 2. The projected total is `engine heap + allocated + n`
//! 3. Once the projected total crosses the probe threshold, the engine heap size is
//!    re-read and the threshold moves to `total + 1 MiB`
//! 4. Over the limit, the engine gets one low-memory notification and is probed again
//! 5. Still over: return NULL → V8 throws `RangeError: Array buffer allocation failed`
//! 6. On `free()`, `allocated` and the probe threshold drop by the freed size
//!
//! Allocations of 64 bytes or less are always granted. V8 keeps tiny typed arrays
//! on its own heap and only materializes their buffer when a pointer is needed;
//! refusing that allocation crashes the process instead of throwing.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use v8::{RustAllocatorVtable, UniqueRef};

use crate::config::MIB;

/// Cached engine heap size before the first probe.
pub const INITIAL_ENGINE_HEAP: usize = 4 * MIB;
/// First probe threshold.
pub const INITIAL_PROBE_THRESHOLD: usize = MIB;
/// Distance between a probe and the next one.
pub const PROBE_INTERVAL: usize = MIB;
/// Allocations up to this size are granted even when over budget.
pub const SMALL_ALLOCATION_LIMIT: usize = 64;

/// Source of the engine's own heap usage.
pub trait HeapProbe: Send + Sync {
    /// Total engine heap size in bytes, or `None` when it cannot be read.
    fn total_heap_size(&self) -> Option<usize>;

    /// Ask the engine to release as much memory as it can.
    fn low_memory_notification(&self);
}

/// Probes the isolate bound to the calling thread by the execution lock.
///
/// Reading heap statistics from inside an allocation callback is not
/// sanctioned by V8, but only reads counters and is tolerated in practice.
pub struct EngineHeapProbe;

impl HeapProbe for EngineHeapProbe {
    fn total_heap_size(&self) -> Option<usize> {
        crate::gc::with_current_isolate(|isolate| isolate.get_heap_statistics().total_heap_size())
    }

    fn low_memory_notification(&self) {
        crate::gc::with_current_isolate(|isolate| isolate.low_memory_notification());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("allocation of {requested} bytes denied ({allocated} of {limit} bytes in use)")]
pub struct AllocationDenied {
    pub requested: usize,
    pub allocated: usize,
    pub limit: usize,
}

/// ArrayBuffer allocator enforcing one context's hard memory limit.
///
/// # Example
///
/// ```rust,ignore
/// let budget = MemoryBudget::new(128 * 1024 * 1024);
///
/// let params = v8::CreateParams::default()
///     .array_buffer_allocator(budget.clone().into_v8_allocator());
/// let isolate = v8::Isolate::new(params);
///
/// // After execution, check how often the budget said no
/// println!("denied allocations: {}", budget.failure_count());
/// ```
pub struct MemoryBudget {
    /// Hard ceiling in bytes
    limit: usize,
    /// Bytes currently attributed to this context (atomic for thread-safety)
    allocated: AtomicUsize,
    /// Engine heap size as of the last probe
    engine_heap: AtomicUsize,
    /// Projected total at which the engine heap is probed again
    next_check: AtomicUsize,
    /// Requests that failed the budget check, granted or not
    failures: AtomicUsize,
    probe: Box<dyn HeapProbe>,
}

impl MemoryBudget {
    /// Create a budget that probes the engine through the execution lock.
    pub fn new(limit: usize) -> Arc<Self> {
        Self::with_probe(limit, Box::new(EngineHeapProbe))
    }

    pub fn with_probe(limit: usize, probe: Box<dyn HeapProbe>) -> Arc<Self> {
        Arc::new(Self {
            limit,
            allocated: AtomicUsize::new(0),
            engine_heap: AtomicUsize::new(INITIAL_ENGINE_HEAP),
            next_check: AtomicUsize::new(INITIAL_PROBE_THRESHOLD),
            failures: AtomicUsize::new(0),
            probe,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes currently charged to this budget.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Number of requests that exceeded the budget, including the small ones
    /// that were granted anyway.
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Allocate `len` zeroed bytes.
    pub fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocationDenied> {
        self.allocate_inner(len, true)
    }

    /// Allocate `len` bytes without initializing them.
    pub fn allocate_uninitialized(&self, len: usize) -> Result<NonNull<u8>, AllocationDenied> {
        self.allocate_inner(len, false)
    }

    /// Return memory obtained from [`allocate`](Self::allocate) or
    /// [`allocate_uninitialized`](Self::allocate_uninitialized).
    ///
    /// # Safety
    ///
    /// `ptr` must come from this budget with the same `len`, and must not be
    /// used afterwards.
    pub unsafe fn release(&self, ptr: NonNull<u8>, len: usize) {
        self.uncharge(len);
        // SAFETY: forwarded from the caller
        unsafe { raw_free(ptr, len) };
    }

    /// Charge (positive) or uncharge (negative) memory whose ownership moved
    /// across the boundary without going through allocate/release.
    pub fn adjust_external(&self, delta: isize) {
        if delta >= 0 {
            self.allocated.fetch_add(delta.unsigned_abs(), Ordering::SeqCst);
        } else {
            self.uncharge(delta.unsigned_abs());
        }
    }

    /// Convert to V8 allocator for use in `CreateParams`.
    pub fn into_v8_allocator(self: Arc<Self>) -> UniqueRef<v8::Allocator> {
        let vtable: &'static RustAllocatorVtable<MemoryBudget> = &RustAllocatorVtable {
            allocate,
            allocate_uninitialized,
            free,
            drop,
        };

        unsafe { v8::new_rust_allocator(Arc::into_raw(self), vtable) }
    }

    fn allocate_inner(&self, len: usize, zeroed: bool) -> Result<NonNull<u8>, AllocationDenied> {
        if !self.check(len) {
            self.failures.fetch_add(1, Ordering::SeqCst);

            if len > SMALL_ALLOCATION_LIMIT {
                let denied = AllocationDenied {
                    requested: len,
                    allocated: self.allocated(),
                    limit: self.limit,
                };
                tracing::warn!("ArrayBuffer {}", denied);
                return Err(denied);
            }

            tracing::debug!(
                "Granting {} byte allocation over budget (small allocation)",
                len
            );
        }

        let Some(ptr) = raw_alloc(len, zeroed) else {
            return Err(AllocationDenied {
                requested: len,
                allocated: self.allocated(),
                limit: self.limit,
            });
        };

        self.allocated.fetch_add(len, Ordering::SeqCst);
        Ok(ptr)
    }

    fn check(&self, len: usize) -> bool {
        let allocated = self.allocated.load(Ordering::SeqCst);
        let mut heap = self.engine_heap.load(Ordering::Relaxed);

        if heap + allocated + len > self.next_check.load(Ordering::Relaxed) {
            heap = self.probe_heap(heap);

            if heap + allocated + len > self.limit {
                self.probe.low_memory_notification();
                heap = self.probe_heap(heap);

                if heap + allocated + len > self.limit {
                    return false;
                }
            }

            self.next_check
                .store(heap + allocated + len + PROBE_INTERVAL, Ordering::Relaxed);
        }

        heap + allocated + len <= self.limit
    }

    fn probe_heap(&self, cached: usize) -> usize {
        let heap = self.probe.total_heap_size().unwrap_or(cached);
        self.engine_heap.store(heap, Ordering::Relaxed);
        heap
    }

    fn uncharge(&self, len: usize) {
        let _ = self
            .allocated
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(len))
            });
        let _ = self
            .next_check
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(len))
            });
    }
}

fn raw_alloc(len: usize, zeroed: bool) -> Option<NonNull<u8>> {
    if len == 0 {
        return Some(NonNull::dangling());
    }

    let layout = std::alloc::Layout::array::<u8>(len).ok()?;
    // SAFETY: layout has a non-zero size
    let ptr = unsafe {
        if zeroed {
            std::alloc::alloc_zeroed(layout)
        } else {
            std::alloc::alloc(layout)
        }
    };

    NonNull::new(ptr)
}

/// # Safety
///
/// `ptr` must come from `raw_alloc(len, _)`.
unsafe fn raw_free(ptr: NonNull<u8>, len: usize) {
    if len == 0 {
        return;
    }

    if let Ok(layout) = std::alloc::Layout::array::<u8>(len) {
        // SAFETY: same layout as the allocation
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

/// Called by V8 when JS code does `new ArrayBuffer(n)` or `new Uint8Array(n)`.
/// Returns a pointer to zeroed memory, or NULL if the budget is exhausted.
unsafe extern "C" fn allocate(budget: &MemoryBudget, n: usize) -> *mut c_void {
    match budget.allocate(n) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Called by V8 for uninitialized allocation (performance optimization).
unsafe extern "C" fn allocate_uninitialized(budget: &MemoryBudget, n: usize) -> *mut c_void {
    match budget.allocate_uninitialized(n) {
        Ok(ptr) => ptr.as_ptr().cast(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Called by V8 when a backing store is released.
unsafe extern "C" fn free(budget: &MemoryBudget, data: *mut c_void, n: usize) {
    if let Some(ptr) = NonNull::new(data.cast::<u8>()) {
        // SAFETY: data was handed out by allocate/allocate_uninitialized with size n
        unsafe { budget.release(ptr, n) };
    }
}

/// Called when the allocator itself is dropped (isolate destroyed).
unsafe extern "C" fn drop(budget: *const MemoryBudget) {
    // SAFETY: budget was created via Arc::into_raw in into_v8_allocator
    let _ = unsafe { Arc::from_raw(budget) };
}
