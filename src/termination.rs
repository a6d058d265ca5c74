//! Cross-thread termination of an execution context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Thread-safe handle that stops a context, usable from a control thread.
///
/// Terminating aborts whatever script is running, and the context's execution
/// lock can never be acquired again. Handler registrations are released by the
/// owning thread once the interrupted call unwinds.
#[derive(Clone)]
pub struct TerminationHandle {
    isolate: v8::IsolateHandle,
    terminated: Arc<AtomicBool>,
}

impl TerminationHandle {
    pub(crate) fn new(isolate: v8::IsolateHandle) -> Self {
        Self {
            isolate,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Terminate the context. Returns `false` if it was already terminated.
    pub fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::warn!("Terminating execution context");
        self.isolate.terminate_execution();
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TerminationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminationHandle")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
