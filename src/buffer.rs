//! Buffer ownership transfer across the boundary.
//!
//! - [`import`]: host buffer → script `Uint8Array`. Buffers carrying a host
//!   allocation are wrapped zero-copy; others are copied into memory charged
//!   to the context's budget.
//! - [`export`]: script view → [`ScriptBuffer`]. The backing store is handed
//!   to the host and the script-side buffer is detached.
//! - [`reimport`]: [`ScriptBuffer`] → script `Uint8Array`, always a copy.
//!
//! In sandbox mode V8 refuses foreign memory, so every import copies.

#[cfg(not(feature = "sandbox"))]
use std::ffi::c_void;
#[cfg(not(feature = "sandbox"))]
use std::ptr::NonNull;
use std::sync::Arc;

#[cfg(not(feature = "sandbox"))]
use crate::gc::ExternalMemoryGuard;
use crate::gc::ExternalMemoryLedger;
use crate::security::MemoryBudget;
use crate::value::{HostBuffer, ScriptBuffer};

/// Message of the RangeError thrown when the budget denies an import.
pub const ALLOCATION_FAILED: &str = "ArrayBuffer allocation failed.";

/// Host allocation kept alive by a zero-copy backing store.
#[cfg(not(feature = "sandbox"))]
struct HostLease {
    _allocation: Box<[u8]>,
    budget: Arc<MemoryBudget>,
    external: ExternalMemoryGuard,
}

#[cfg(not(feature = "sandbox"))]
impl Drop for HostLease {
    fn drop(&mut self) {
        let len = self.external.amount();
        self.budget.adjust_external(-(len as isize));
    }
}

/// Deleter for zero-copy backing stores. May run on any thread.
#[cfg(not(feature = "sandbox"))]
unsafe extern "C" fn drop_host_lease(_data: *mut c_void, _len: usize, lease: *mut c_void) {
    // SAFETY: lease was produced by Box::into_raw in wrap_allocation
    drop(unsafe { Box::from_raw(lease as *mut HostLease) });
}

/// Deleter for copies made from budget memory.
#[cfg(not(feature = "sandbox"))]
unsafe extern "C" fn release_to_budget(data: *mut c_void, len: usize, budget: *mut c_void) {
    // SAFETY: budget was produced by Arc::into_raw in copy_into_budget
    let budget = unsafe { Arc::from_raw(budget as *const MemoryBudget) };

    if let Some(ptr) = NonNull::new(data.cast::<u8>()) {
        // SAFETY: data was allocated by this budget with this length
        unsafe { budget.release(ptr, len) };
    }
}

/// Hand a host buffer to the script as a `Uint8Array`.
///
/// Throws `RangeError: ArrayBuffer allocation failed.` inside the context and
/// returns `None` when the budget refuses the copy.
pub fn import<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    budget: &Arc<MemoryBudget>,
    ledger: &ExternalMemoryLedger,
    buffer: HostBuffer,
) -> Option<v8::Local<'s, v8::Uint8Array>> {
    #[cfg(not(feature = "sandbox"))]
    let buffer = match buffer.into_allocation() {
        Ok((allocation, offset, len)) => {
            let ab = wrap_allocation(scope, budget, ledger, allocation);
            return v8::Uint8Array::new(scope, ab, offset, len);
        }
        Err(buffer) => buffer,
    };

    #[cfg(feature = "sandbox")]
    let _ = ledger;

    let bytes = buffer.as_bytes();
    let ab = copy_into_budget(scope, budget, bytes)?;
    v8::Uint8Array::new(scope, ab, 0, bytes.len())
}

/// Hand externalized bytes back to the script as a fresh copy.
///
/// The host may still hold the [`ScriptBuffer`] (or clones of it), so the
/// script never gets a view on its backing store again. The copy is charged
/// to the budget like any other import.
pub fn reimport<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    budget: &Arc<MemoryBudget>,
    buffer: &ScriptBuffer,
) -> Option<v8::Local<'s, v8::Uint8Array>> {
    let bytes = buffer.as_bytes();
    let ab = copy_into_budget(scope, budget, bytes)?;
    v8::Uint8Array::new(scope, ab, 0, bytes.len())
}

/// Take ownership of the bytes behind a script view and detach it.
///
/// Returns `None` only if the engine cannot materialize the view's buffer.
pub fn export(
    scope: &mut v8::PinScope<'_, '_>,
    view: v8::Local<'_, v8::ArrayBufferView>,
) -> Option<ScriptBuffer> {
    let offset = view.byte_offset();
    let len = view.byte_length();
    let buffer = view.buffer(scope)?;

    Some(externalize(buffer, offset, len))
}

/// Same as [`export`] for a bare `ArrayBuffer`.
pub fn export_array_buffer(buffer: v8::Local<'_, v8::ArrayBuffer>) -> ScriptBuffer {
    let len = buffer.byte_length();
    externalize(buffer, 0, len)
}

fn externalize(buffer: v8::Local<'_, v8::ArrayBuffer>, offset: usize, len: usize) -> ScriptBuffer {
    let store = buffer.get_backing_store();

    if buffer.is_detachable() {
        buffer.detach(None);
    } else {
        tracing::warn!(
            "Exported buffer of {} bytes is not detachable; script keeps a live view",
            len
        );
    }

    ScriptBuffer::new(store, offset, len)
}

#[cfg(not(feature = "sandbox"))]
fn wrap_allocation<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    budget: &Arc<MemoryBudget>,
    ledger: &ExternalMemoryLedger,
    mut allocation: Box<[u8]>,
) -> v8::Local<'s, v8::ArrayBuffer> {
    let len = allocation.len();

    if len == 0 {
        return v8::ArrayBuffer::new(scope, 0);
    }

    let data = allocation.as_mut_ptr() as *mut c_void;
    budget.adjust_external(len as isize);

    let lease = Box::new(HostLease {
        _allocation: allocation,
        budget: budget.clone(),
        external: ExternalMemoryGuard::new(scope, ledger.clone(), len as i64),
    });

    // SAFETY: the boxed slice does not move when the Box is moved into the
    // lease, and the lease is freed only by the store's deleter
    let store = unsafe {
        v8::ArrayBuffer::new_backing_store_from_ptr(
            data,
            len,
            drop_host_lease,
            Box::into_raw(lease) as *mut c_void,
        )
    }
    .make_shared();

    v8::ArrayBuffer::with_backing_store(scope, &store)
}

#[cfg(not(feature = "sandbox"))]
fn copy_into_budget<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    budget: &Arc<MemoryBudget>,
    bytes: &[u8],
) -> Option<v8::Local<'s, v8::ArrayBuffer>> {
    if bytes.is_empty() {
        return Some(v8::ArrayBuffer::new(scope, 0));
    }

    let Ok(ptr) = budget.allocate_uninitialized(bytes.len()) else {
        throw_allocation_failed(scope);
        return None;
    };

    // SAFETY: ptr was just allocated with bytes.len() bytes
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };

    // SAFETY: the deleter releases exactly this allocation back to the budget
    let store = unsafe {
        v8::ArrayBuffer::new_backing_store_from_ptr(
            ptr.as_ptr() as *mut c_void,
            bytes.len(),
            release_to_budget,
            Arc::into_raw(budget.clone()) as *mut c_void,
        )
    }
    .make_shared();

    Some(v8::ArrayBuffer::with_backing_store(scope, &store))
}

#[cfg(feature = "sandbox")]
fn copy_into_budget<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    budget: &Arc<MemoryBudget>,
    bytes: &[u8],
) -> Option<v8::Local<'s, v8::ArrayBuffer>> {
    if bytes.is_empty() {
        return Some(v8::ArrayBuffer::new(scope, 0));
    }

    // A failed engine-side allocation is fatal, so ask the budget first and
    // hand the room back for V8 to allocate through the same allocator.
    let Ok(ptr) = budget.allocate_uninitialized(bytes.len()) else {
        throw_allocation_failed(scope);
        return None;
    };
    // SAFETY: ptr was just allocated with bytes.len() bytes
    unsafe { budget.release(ptr, bytes.len()) };

    let ab = v8::ArrayBuffer::new(scope, bytes.len());
    if let Some(dest) = ab.get_backing_store().data() {
        // SAFETY: fresh buffer of bytes.len() bytes, not yet visible to scripts
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dest.as_ptr() as *mut u8, bytes.len())
        };
    }

    Some(ab)
}

fn throw_allocation_failed(scope: &mut v8::PinScope<'_, '_>) {
    if let Some(message) = v8::String::new(scope, ALLOCATION_FAILED) {
        let exception = v8::Exception::range_error(scope, message);
        scope.throw_exception(exception);
    }
}
