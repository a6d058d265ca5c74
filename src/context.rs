//! Execution contexts: one isolate, one global namespace, one memory budget.

use std::any::Any;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::{self, CallFrame, MessageHandler};
use crate::config::Budget;
use crate::error::{Error, Result};
use crate::gc::ExecutionLock;
use crate::platform;
use crate::script;
use crate::security::{HeapLimitState, MemoryBudget, install_heap_limit_callback};
use crate::snapshot::SnapshotBlob;
use crate::state::{ContextState, Phase};
use crate::termination::TerminationHandle;
use crate::value::{HostBuffer, Message, TaggedValue};

/// Engine heap counters plus the context's budget accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatistics {
    pub total_heap_size: usize,
    pub used_heap_size: usize,
    pub heap_size_limit: usize,
    /// Bytes charged to the budget by buffer allocations.
    pub allocated_bytes: usize,
    pub malloced_memory: usize,
    pub native_context_count: usize,
    pub detached_context_count: usize,
    pub does_zap_garbage: bool,
    pub external_memory: usize,
    /// Allocations granted over budget by the small-allocation carve-out.
    pub failure_count: usize,
}

/// Builder for [`ExecutionContext`].
#[derive(Default)]
pub struct ExecutionContextBuilder {
    snapshot: Option<SnapshotBlob>,
    budget: Budget,
    user_data: Option<Box<dyn Any>>,
    handler: Option<Rc<dyn MessageHandler>>,
}

impl ExecutionContextBuilder {
    /// Warm-start from a blob produced by [`crate::snapshot::create_snapshot`].
    pub fn snapshot(mut self, blob: SnapshotBlob) -> Self {
        self.snapshot = Some(blob);
        self
    }

    pub fn budget(mut self, budget: Budget) -> Self {
        self.budget = budget;
        self
    }

    /// Opaque host data, returned by [`ExecutionContext::user_data`] and
    /// [`CallFrame::user_data`].
    pub fn user_data<T: 'static>(mut self, data: T) -> Self {
        self.user_data = Some(Box::new(data));
        self
    }

    /// Receiver for script `send` calls.
    pub fn handler<F>(self, handler: F) -> Self
    where
        F: Fn(&mut CallFrame<'_, '_, '_>, Message) -> TaggedValue + 'static,
    {
        self.message_handler(handler)
    }

    pub fn message_handler(mut self, handler: impl MessageHandler) -> Self {
        self.handler = Some(Rc::new(handler));
        self
    }

    pub fn build(self) -> Result<ExecutionContext> {
        self.budget.validate()?;
        platform::get_platform();

        let budget = MemoryBudget::new(self.budget.hard_limit_bytes);

        let mut params = v8::CreateParams::default()
            .heap_limits(0, self.budget.soft_limit_bytes)
            .array_buffer_allocator(budget.clone().into_v8_allocator())
            .external_references(channel::external_references());

        let from_snapshot = self.snapshot.is_some();
        if let Some(blob) = self.snapshot {
            params = params.snapshot_blob(blob.as_bytes().into());
        }

        // Unentered: the isolate is only entered while a Locker is held, so
        // contexts can be dropped in any order
        let mut isolate = v8::Isolate::new_unentered(params);
        let mut locker = v8::Locker::new(&mut isolate);

        locker.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

        let termination = TerminationHandle::new(locker.thread_safe_handle());
        let memory_limit_hit = Arc::new(AtomicBool::new(false));
        let heap_limit = install_heap_limit_callback(
            &mut locker,
            termination.clone(),
            memory_limit_hit.clone(),
            self.budget.hard_limit_bytes,
        );

        let state = Rc::new(ContextState::new(
            budget,
            termination,
            self.handler,
            self.user_data,
        ));
        locker.set_slot(state.clone());

        let context = {
            let _lock = ExecutionLock::acquire(&mut locker, &state.termination, &state.external)?;

            let scope = pin!(v8::HandleScope::new(&mut *locker));
            let mut scope = scope.init();
            let context = v8::Context::new(&scope, Default::default());
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            if from_snapshot {
                channel::restore_handlers(scope, &state);
            } else {
                channel::install(scope);
            }

            v8::Global::new(scope, context)
        };

        drop(locker);

        tracing::debug!(
            "Execution context created (soft: {} bytes, hard: {} bytes, snapshot: {})",
            self.budget.soft_limit_bytes,
            self.budget.hard_limit_bytes,
            from_snapshot
        );

        Ok(ExecutionContext {
            context: Some(context),
            state,
            memory_limit_hit,
            isolate,
            heap_limit,
        })
    }
}

/// An isolated script execution environment.
///
/// Every operation binds the isolate to the calling thread for its duration
/// (see [`ExecutionLock`]). Calls from a host [`MessageHandler`] back into the
/// same context go through its [`CallFrame`].
pub struct ExecutionContext {
    // Field order is drop order: the isolate before the heap limit callback
    // state. Handles are released under the locker in Drop.
    context: Option<v8::Global<v8::Context>>,
    state: Rc<ContextState>,
    memory_limit_hit: Arc<AtomicBool>,
    isolate: v8::UnenteredIsolate,
    heap_limit: Box<HeapLimitState>,
}

impl ExecutionContext {
    pub fn builder() -> ExecutionContextBuilder {
        ExecutionContextBuilder::default()
    }

    /// Compile and run `source` as a classic script named `name`.
    ///
    /// Returns `false` on any uncaught exception. Unless the script's global
    /// error handler took it, the diagnostic is then in [`last_exception`].
    ///
    /// [`last_exception`]: ExecutionContext::last_exception
    pub fn compile_and_run(&mut self, name: &str, source: &str) -> bool {
        let result = self.with_scope(|scope, state| script::run(scope, state, name, source, 0, false));

        match result {
            Ok(completion) => completion.is_some(),
            Err(Error::Script(_)) => false,
            Err(err) => {
                self.state.set_last_exception(err.to_string());
                false
            }
        }
    }

    /// Run `source` as a function body and convert what it returns.
    ///
    /// An exception taken by the script's global error handler yields
    /// `Absent`; any other yields [`Error::Script`] with its diagnostic.
    pub fn evaluate(&mut self, name: &str, source: &str) -> Result<TaggedValue> {
        let wrapped = format!("(function () {{\n{}\n}})()", source);

        self.with_scope(|scope, state| script::run(scope, state, name, &wrapped, -1, true))
            .map(Option::unwrap_or_default)
    }

    pub fn last_exception(&self) -> Option<String> {
        self.state.last_exception()
    }

    /// Call the script's `recv` handler with `(value, kind)`.
    ///
    /// Yields `Absent` when no handler is registered yet.
    pub fn dispatch(&mut self, kind: i32, value: TaggedValue) -> Result<TaggedValue> {
        self.with_scope(|scope, state| channel::dispatch_in_scope(scope, state, kind, value, None))
    }

    /// Call the script's `recv` handler with `(value, kind, raw)`.
    pub fn dispatch_with_buffer(
        &mut self,
        kind: i32,
        value: TaggedValue,
        raw: HostBuffer,
    ) -> Result<TaggedValue> {
        self.with_scope(|scope, state| {
            channel::dispatch_in_scope(scope, state, kind, value, Some(raw))
        })
    }

    pub fn heap_statistics(&mut self) -> Result<HeapStatistics> {
        let mut locker = v8::Locker::new(&mut self.isolate);
        let _lock = Self::lock(&mut locker, &self.state)?;

        let stats = locker.get_heap_statistics();

        Ok(HeapStatistics {
            total_heap_size: stats.total_heap_size(),
            used_heap_size: stats.used_heap_size(),
            heap_size_limit: stats.heap_size_limit(),
            allocated_bytes: self.state.budget.allocated(),
            malloced_memory: stats.malloced_memory(),
            native_context_count: stats.number_of_native_contexts(),
            detached_context_count: stats.number_of_detached_contexts(),
            does_zap_garbage: stats.does_zap_garbage(),
            external_memory: stats.external_memory(),
            failure_count: self.state.budget.failure_count(),
        })
    }

    /// Abort any running script and refuse further calls.
    pub fn terminate(&mut self) {
        self.state.termination.terminate();

        let _locker = v8::Locker::new(&mut self.isolate);
        self.state.enter_terminated();
    }

    /// Handle for terminating this context from another thread.
    pub fn termination_handle(&self) -> TerminationHandle {
        self.state.termination.clone()
    }

    pub fn user_data<T: 'static>(&self) -> Option<&T> {
        self.state.user_data::<T>()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Whether the engine heap ran into the budget and the context was
    /// terminated for it.
    pub fn memory_limit_hit(&self) -> bool {
        self.memory_limit_hit.load(Ordering::SeqCst)
    }

    /// Over-budget allocations granted by the allocator so far.
    pub fn failure_count(&self) -> usize {
        self.state.budget.failure_count()
    }

    /// Number of times the engine reported its heap near the limit.
    pub fn heap_limit_callbacks(&self) -> u32 {
        self.heap_limit.invocation_count()
    }

    fn with_scope<R>(
        &mut self,
        f: impl FnOnce(&mut v8::PinScope<'_, '_>, &ContextState) -> Result<R>,
    ) -> Result<R> {
        let Some(context) = self.context.as_ref() else {
            return Err(Error::Terminated);
        };

        let mut locker = v8::Locker::new(&mut self.isolate);
        let _lock = Self::lock(&mut locker, &self.state)?;

        let result = {
            let scope = pin!(v8::HandleScope::new(&mut *locker));
            let mut scope = scope.init();
            let context = v8::Local::new(&scope, context);
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            f(scope, &self.state)
        };

        if self.state.termination.is_terminated() {
            self.state.enter_terminated();
        }

        result
    }

    /// Take the execution lock on an isolate held by a `v8::Locker`. A context
    /// terminated while idle releases its handlers here, the first time it is
    /// touched.
    fn lock(isolate: &mut v8::Isolate, state: &ContextState) -> Result<ExecutionLock> {
        ExecutionLock::acquire(isolate, &state.termination, &state.external).inspect_err(|_| {
            state.enter_terminated();
        })
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let mut locker = v8::Locker::new(&mut self.isolate);

        self.state.release_handlers();
        self.context = None;
        locker.remove_slot::<Rc<ContextState>>();
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("phase", &self.phase())
            .field("allocated", &self.state.budget.allocated())
            .field("limit", &self.state.budget.limit())
            .finish()
    }
}
