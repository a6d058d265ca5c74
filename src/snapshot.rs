//! Startup snapshots.
//!
//! A snapshot captures a context's heap right after an initialization script
//! ran, including the `send`/`recv` bindings and any handlers the script
//! registered. Contexts built from it skip the initialization entirely.
//!
//! Blobs are only valid for the engine build that produced them.

use std::path::Path;
use std::pin::pin;
use std::rc::Rc;

use crate::channel;
use crate::config::Budget;
use crate::error::{Error, Result};
use crate::exception;
use crate::gc::ExecutionLock;
use crate::platform;
use crate::script;
use crate::security::MemoryBudget;
use crate::state::ContextState;
use crate::termination::TerminationHandle;

/// Serialized context state, consumed when building an execution context.
///
/// The engine keeps reading the blob for the lifetime of every isolate
/// created from it, so the bytes are leaked and live for the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotBlob {
    bytes: &'static [u8],
}

impl SnapshotBlob {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Box::leak(bytes.into_boxed_slice()),
        }
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;

        if bytes.is_empty() {
            return Err(Error::Snapshot("snapshot file is empty".to_string()));
        }

        Ok(Self::from_vec(bytes))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.bytes)?;
        Ok(())
    }
}

/// Run `source` in a fresh context and serialize the result.
///
/// Snapshot creation is an offline build step: any failure aborts the
/// process. See [`try_create_snapshot`] for the fallible form.
pub fn create_snapshot(name: &str, source: &str) -> SnapshotBlob {
    match try_create_snapshot(name, source) {
        Ok(blob) => blob,
        Err(err) => exception::fatal(&format!("snapshot creation failed: {}", err)),
    }
}

/// Run `source` in a fresh context and serialize the result.
///
/// Only one snapshot creator may exist in the process at a time.
pub fn try_create_snapshot(name: &str, source: &str) -> Result<SnapshotBlob> {
    platform::get_platform();

    let budget = Budget::default();
    let allocator = MemoryBudget::new(budget.hard_limit_bytes);

    let params = v8::CreateParams::default()
        .heap_limits(0, budget.soft_limit_bytes)
        .array_buffer_allocator(allocator.clone().into_v8_allocator());

    let mut creator =
        v8::Isolate::snapshot_creator(Some(channel::external_references()), Some(params));
    creator.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

    let termination = TerminationHandle::new(creator.thread_safe_handle());
    let state = Rc::new(ContextState::new(allocator, termination, None, None));
    creator.set_slot(state.clone());

    let outcome = {
        let _lock = ExecutionLock::acquire(&mut creator, &state.termination, &state.external)?;

        let scope = pin!(v8::HandleScope::new(&mut creator));
        let mut scope = scope.init();
        let context = v8::Context::new(&scope, Default::default());
        let scope = &mut v8::ContextScope::new(&mut scope, context);

        channel::install(scope);

        let outcome = script::run(scope, &state, name, source, 0, false);
        if matches!(outcome, Ok(Some(_))) {
            channel::persist_handlers(scope, &state);
        }

        scope.set_default_context(context);
        outcome
    };

    // Persistent handles cannot be serialized
    state.release_handlers();
    creator.remove_slot::<Rc<ContextState>>();
    drop(state);

    let blob = creator.create_blob(v8::FunctionCodeHandling::Clear);

    match outcome {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Err(Error::Snapshot(format!(
                "{} threw during initialization",
                name
            )));
        }
        Err(err) => return Err(Error::Snapshot(err.to_string())),
    }

    let blob = blob.ok_or_else(|| Error::Snapshot("engine produced no blob".to_string()))?;

    tracing::debug!("Snapshot created from {} ({} bytes)", name, blob.len());

    Ok(SnapshotBlob::from_vec(blob.to_vec()))
}
