//! Per-context state shared by the host API and the native bindings.
//!
//! One `Rc<ContextState>` lives in the isolate slot (each context owns its
//! isolate), so binding callbacks reach it from any scope. Isolate slots are
//! not serialized, which keeps snapshot creation free of embedder pointers.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::channel::MessageHandler;
use crate::gc::ExternalMemoryLedger;
use crate::security::MemoryBudget;
use crate::termination::TerminationHandle;
use crate::value::TaggedValue;

/// Lifecycle of a context's message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No script handler registered yet.
    Uninitialized,
    /// `recv` was called.
    HandlerRegistered,
    /// At least one call crossed the boundary.
    Active,
    /// No further calls are accepted.
    Terminated,
}

pub(crate) struct ContextState {
    phase: Cell<Phase>,
    recv: RefCell<Option<v8::Global<v8::Function>>>,
    error_handler: RefCell<Option<v8::Global<v8::Function>>>,
    host_handler: RefCell<Option<Rc<dyn MessageHandler>>>,
    last_exception: RefCell<Option<String>>,
    /// Return-value slots of the `send` calls in flight, innermost last
    frames: RefCell<Vec<Option<TaggedValue>>>,
    user_data: Option<Box<dyn Any>>,
    pub(crate) budget: Arc<MemoryBudget>,
    pub(crate) external: ExternalMemoryLedger,
    pub(crate) termination: TerminationHandle,
}

impl ContextState {
    pub(crate) fn new(
        budget: Arc<MemoryBudget>,
        termination: TerminationHandle,
        host_handler: Option<Rc<dyn MessageHandler>>,
        user_data: Option<Box<dyn Any>>,
    ) -> Self {
        Self {
            phase: Cell::new(Phase::Uninitialized),
            recv: RefCell::new(None),
            error_handler: RefCell::new(None),
            host_handler: RefCell::new(host_handler),
            last_exception: RefCell::new(None),
            frames: RefCell::new(Vec::new()),
            user_data,
            budget,
            external: ExternalMemoryLedger::new(),
            termination,
        }
    }

    /// State of the isolate behind `isolate` (any scope derefs to it).
    pub(crate) fn get(isolate: &v8::Isolate) -> Option<Rc<ContextState>> {
        isolate.get_slot::<Rc<ContextState>>().cloned()
    }

    pub(crate) fn phase(&self) -> Phase {
        if self.termination.is_terminated() {
            return Phase::Terminated;
        }
        self.phase.get()
    }

    pub(crate) fn mark_active(&self) {
        if self.phase.get() == Phase::HandlerRegistered {
            self.phase.set(Phase::Active);
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.phase() == Phase::Terminated
    }

    /// Register the script's receive handler. Fails if one is already set.
    pub(crate) fn register_recv(&self, handler: v8::Global<v8::Function>) -> bool {
        let mut recv = self.recv.borrow_mut();

        if recv.is_some() {
            return false;
        }

        *recv = Some(handler);
        if self.phase.get() == Phase::Uninitialized {
            self.phase.set(Phase::HandlerRegistered);
        }
        true
    }

    pub(crate) fn recv_handler(&self) -> Option<v8::Global<v8::Function>> {
        self.recv.borrow().clone()
    }

    pub(crate) fn register_error_handler(&self, handler: v8::Global<v8::Function>) -> bool {
        let mut slot = self.error_handler.borrow_mut();

        if slot.is_some() {
            return false;
        }

        *slot = Some(handler);
        true
    }

    pub(crate) fn error_handler(&self) -> Option<v8::Global<v8::Function>> {
        self.error_handler.borrow().clone()
    }

    pub(crate) fn host_handler(&self) -> Option<Rc<dyn MessageHandler>> {
        self.host_handler.borrow().clone()
    }

    pub(crate) fn set_last_exception(&self, diagnostic: String) {
        *self.last_exception.borrow_mut() = Some(diagnostic);
    }

    pub(crate) fn last_exception(&self) -> Option<String> {
        self.last_exception.borrow().clone()
    }

    pub(crate) fn user_data<T: 'static>(&self) -> Option<&T> {
        self.user_data.as_ref()?.downcast_ref::<T>()
    }

    pub(crate) fn push_frame(&self) {
        self.frames.borrow_mut().push(None);
    }

    pub(crate) fn pop_frame(&self) -> Option<TaggedValue> {
        self.frames.borrow_mut().pop().flatten()
    }

    /// Set the return value of the innermost `send` in flight.
    pub(crate) fn set_call_return_value(&self, value: TaggedValue) {
        match self.frames.borrow_mut().last_mut() {
            Some(slot) => *slot = Some(value),
            None => tracing::debug!("Return value set with no send in flight"),
        }
    }

    /// Drop every handler registration. Called on the owning thread once the
    /// context is terminated or dropped.
    pub(crate) fn release_handlers(&self) {
        self.recv.borrow_mut().take();
        self.error_handler.borrow_mut().take();
        self.host_handler.borrow_mut().take();
        self.frames.borrow_mut().clear();
    }

    pub(crate) fn enter_terminated(&self) {
        if self.phase.get() != Phase::Terminated {
            tracing::debug!("Context terminated, releasing handler registrations");
            self.phase.set(Phase::Terminated);
            self.release_handlers();
        }
    }
}
