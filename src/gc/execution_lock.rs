//! ExecutionLock - RAII binding of an isolate to the calling thread.
//!
//! Every operation that touches a context takes this lock first. While it is
//! held, the isolate is reachable through [`with_current_isolate`], which is
//! how the budget allocator probes the engine heap from inside an allocation
//! callback.

use std::cell::Cell;
use std::marker::PhantomData;

use super::external_memory::ExternalMemoryLedger;
use crate::error::{Error, Result};
use crate::termination::TerminationHandle;

thread_local! {
    /// Isolate currently executing on this thread (if any).
    static CURRENT_ISOLATE: Cell<Option<*mut v8::Isolate>> = const { Cell::new(None) };
}

/// Run `f` against the isolate bound to this thread by an [`ExecutionLock`].
///
/// Returns `None` when no lock is held on this thread.
pub(crate) fn with_current_isolate<R>(f: impl FnOnce(&mut v8::Isolate) -> R) -> Option<R> {
    let ptr = CURRENT_ISOLATE.with(|c| c.get())?;
    // SAFETY: the pointer is only published while an ExecutionLock for that
    // isolate is alive on this thread, and the isolate outlives the lock.
    Some(f(unsafe { &mut *ptr }))
}

/// RAII guard marking an isolate as the current one on this thread.
///
/// Taken under the engine's `v8::Locker`, which enters the isolate; the
/// guard adds the embedder-side bookkeeping.
///
/// On construction:
/// - Fails with [`Error::Terminated`] once the context was terminated
/// - Applies external memory adjustments deferred while unlocked
/// - Registers the isolate for [`with_current_isolate`]
///
/// On drop:
/// - Restores the previously current isolate (locks nest across contexts)
///
/// The guard is `!Send`: the isolate stays bound to the thread that locked it.
pub struct ExecutionLock {
    previous: Option<*mut v8::Isolate>,
    _thread_bound: PhantomData<*mut ()>,
}

impl ExecutionLock {
    pub(crate) fn acquire(
        isolate: &mut v8::Isolate,
        termination: &TerminationHandle,
        ledger: &ExternalMemoryLedger,
    ) -> Result<Self> {
        if termination.is_terminated() {
            return Err(Error::Terminated);
        }

        let pending = ledger.take_pending();

        if pending != 0 {
            isolate.adjust_amount_of_external_allocated_memory(pending);
            log::trace!(
                "Applied deferred external memory adjustment: {} bytes",
                pending
            );
        }

        let isolate_ptr = isolate as *mut v8::Isolate;
        let previous = CURRENT_ISOLATE.with(|c| c.replace(Some(isolate_ptr)));

        Ok(Self {
            previous,
            _thread_bound: PhantomData,
        })
    }
}

impl Drop for ExecutionLock {
    fn drop(&mut self) {
        CURRENT_ISOLATE.with(|c| c.set(self.previous));
    }
}

#[cfg(test)]
pub(crate) fn has_current_isolate() -> bool {
    CURRENT_ISOLATE.with(|c| c.get().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_publishes_and_restores_isolate() {
        crate::platform::get_platform();

        let mut isolate = v8::Isolate::new(Default::default());
        let termination = TerminationHandle::new(isolate.thread_safe_handle());
        let ledger = ExternalMemoryLedger::new();

        assert!(!has_current_isolate());

        {
            let _lock = ExecutionLock::acquire(&mut isolate, &termination, &ledger).unwrap();
            assert!(has_current_isolate());
            assert_eq!(with_current_isolate(|_| 7), Some(7));
        }

        assert!(!has_current_isolate());
        assert_eq!(with_current_isolate(|_| 7), None);
    }

    #[test]
    fn test_lock_applies_deferred_external_memory() {
        crate::platform::get_platform();

        let mut isolate = v8::Isolate::new(Default::default());
        let termination = TerminationHandle::new(isolate.thread_safe_handle());
        let ledger = ExternalMemoryLedger::new();

        ledger.defer(4096);
        ledger.defer(-1024);
        assert_eq!(ledger.pending(), 3072);

        let _lock = ExecutionLock::acquire(&mut isolate, &termination, &ledger).unwrap();
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_terminated_context_cannot_be_locked() {
        crate::platform::get_platform();

        let mut isolate = v8::Isolate::new(Default::default());
        let termination = TerminationHandle::new(isolate.thread_safe_handle());
        let ledger = ExternalMemoryLedger::new();

        assert!(termination.terminate());
        assert!(!termination.terminate());

        let result = ExecutionLock::acquire(&mut isolate, &termination, &ledger);
        assert!(matches!(result, Err(Error::Terminated)));
        assert!(!has_current_isolate());
    }
}
