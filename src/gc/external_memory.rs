//! External memory tracking for V8 GC.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-context ledger of external memory changes that could not be reported
/// to the engine immediately.
///
/// Host buffers wrapped zero-copy are released by the engine's backing-store
/// deleter, which may run on any thread and never holds the execution lock.
/// Their deltas accumulate here and are applied when the next
/// [`ExecutionLock`](super::ExecutionLock) is acquired.
#[derive(Clone, Default)]
pub struct ExternalMemoryLedger {
    pending: Arc<AtomicI64>,
}

impl ExternalMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `delta` bytes for the next lock acquisition.
    pub fn defer(&self, delta: i64) {
        if delta != 0 {
            self.pending.fetch_add(delta, Ordering::SeqCst);
            log::trace!("Deferred external memory adjustment: {} bytes", delta);
        }
    }

    /// Pending delta, not yet applied.
    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub(crate) fn take_pending(&self) -> i64 {
        self.pending.swap(0, Ordering::SeqCst)
    }
}

/// RAII guard that keeps `amount` bytes reported to V8 as external memory.
///
/// Created under the execution lock, so the increase is applied immediately.
/// The decrease on drop always goes through the ledger.
pub struct ExternalMemoryGuard {
    amount: i64,
    ledger: ExternalMemoryLedger,
}

impl ExternalMemoryGuard {
    pub fn new(isolate: &mut v8::Isolate, ledger: ExternalMemoryLedger, amount: i64) -> Self {
        if amount != 0 {
            isolate.adjust_amount_of_external_allocated_memory(amount);
            log::trace!("Adjusted external memory: {} bytes", amount);
        }

        Self { amount, ledger }
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }
}

impl Drop for ExternalMemoryGuard {
    fn drop(&mut self) {
        self.ledger.defer(-self.amount);
    }
}

impl std::fmt::Debug for ExternalMemoryGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalMemoryGuard")
            .field("amount", &self.amount)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_accumulates_and_drains() {
        let ledger = ExternalMemoryLedger::new();
        ledger.defer(1024);
        ledger.defer(-256);
        ledger.defer(0);

        assert_eq!(ledger.pending(), 768);
        assert_eq!(ledger.take_pending(), 768);
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn test_ledger_clones_share_state() {
        let ledger = ExternalMemoryLedger::new();
        let other = ledger.clone();
        other.defer(-4096);

        assert_eq!(ledger.pending(), -4096);
    }
}
