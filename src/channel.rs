//! Message channel between the host and script code.
//!
//! Three functions are installed on the context's global object:
//!
//! - `send(message, raw?)`: script → host. `message` is
//!   `{ id, kind, payload, sync }`; the optional `raw` byte view is exported
//!   alongside it. Runs the host's [`MessageHandler`] synchronously and
//!   returns its converted result.
//! - `recv(fn)`: registers the script's handler for host calls, invoked as
//!   `fn(payload, kind, raw?)`. Exactly once per context.
//! - `setGlobalErrorHandler(fn)`: registers the uncaught exception handler.
//!   Exactly once per context.
//!
//! Host → script calls go through [`ExecutionContext::dispatch`] or, from
//! inside a host handler, [`CallFrame::dispatch`], which reuses the scope of
//! the `send` in flight instead of locking the context a second time.
//!
//! [`ExecutionContext::dispatch`]: crate::ExecutionContext::dispatch

use std::borrow::Cow;
use std::pin::pin;
use std::rc::Rc;
use std::sync::OnceLock;

use v8::MapFnTo;

use crate::buffer;
use crate::codec;
use crate::error::{Error, Result};
use crate::exception;
use crate::state::ContextState;
use crate::termination::TerminationHandle;
use crate::value::{HostBuffer, Message, TaggedValue};

const SEND: &str = "send";
const RECV: &str = "recv";
const SET_GLOBAL_ERROR_HANDLER: &str = "setGlobalErrorHandler";

/// Private keys carrying handler registrations through a snapshot.
const RECV_KEY: &str = "v8_bridge.recv";
const ERROR_HANDLER_KEY: &str = "v8_bridge.global_error_handler";

/// Host-side receiver of script `send` calls.
///
/// Implemented for any `Fn(&mut CallFrame, Message) -> TaggedValue`.
pub trait MessageHandler: 'static {
    /// Handle one message. The returned value becomes `send`'s result unless
    /// [`CallFrame::set_return_value`] was called.
    fn on_message(&self, frame: &mut CallFrame<'_, '_, '_>, message: Message) -> TaggedValue;
}

impl<F> MessageHandler for F
where
    F: Fn(&mut CallFrame<'_, '_, '_>, Message) -> TaggedValue + 'static,
{
    fn on_message(&self, frame: &mut CallFrame<'_, '_, '_>, message: Message) -> TaggedValue {
        self(frame, message)
    }
}

/// The `send` call in flight, as seen by the host handler.
pub struct CallFrame<'a, 's, 'i> {
    scope: &'a mut v8::PinScope<'s, 'i>,
    state: Rc<ContextState>,
}

impl CallFrame<'_, '_, '_> {
    /// Set the value `send` returns to the script, overriding whatever the
    /// handler returns.
    pub fn set_return_value(&mut self, value: TaggedValue) {
        self.state.set_call_return_value(value);
    }

    /// Call the script's `recv` handler from inside this `send`.
    pub fn dispatch(&mut self, kind: i32, value: TaggedValue) -> Result<TaggedValue> {
        dispatch_in_scope(self.scope, &self.state, kind, value, None)
    }

    /// Same as [`CallFrame::dispatch`] with a raw buffer as third argument.
    pub fn dispatch_with_buffer(
        &mut self,
        kind: i32,
        value: TaggedValue,
        raw: HostBuffer,
    ) -> Result<TaggedValue> {
        dispatch_in_scope(self.scope, &self.state, kind, value, Some(raw))
    }

    /// User data supplied when the context was built.
    pub fn user_data<T: 'static>(&self) -> Option<&T> {
        self.state.user_data::<T>()
    }

    pub fn termination_handle(&self) -> TerminationHandle {
        self.state.termination.clone()
    }
}

/// Install `send`, `recv` and `setGlobalErrorHandler` on the current context's
/// global object.
pub(crate) fn install(scope: &mut v8::PinScope<'_, '_>) {
    let global = scope.get_current_context().global(scope);

    register(scope, global, SEND, send);
    register(scope, global, RECV, recv);
    register(scope, global, SET_GLOBAL_ERROR_HANDLER, set_global_error_handler);
}

fn register(
    scope: &mut v8::PinScope<'_, '_>,
    global: v8::Local<'_, v8::Object>,
    name: &str,
    callback: impl MapFnTo<v8::FunctionCallback>,
) {
    let Some(function) = v8::Function::new(scope, callback) else {
        tracing::error!("Failed to create native binding {}", name);
        return;
    };
    let Some(key) = v8::String::new(scope, name) else {
        return;
    };

    global.set(scope, key.into(), function.into());
}

struct References(Vec<v8::ExternalReference>);

// SAFETY: the table only holds addresses of the static callbacks below
unsafe impl Send for References {}
unsafe impl Sync for References {}

static REFERENCES: OnceLock<References> = OnceLock::new();

/// Native callbacks reachable from a snapshot. Must be identical for the
/// isolate creating a snapshot and every isolate restored from it.
pub(crate) fn external_references() -> Cow<'static, [v8::ExternalReference]> {
    let references = REFERENCES.get_or_init(|| {
        References(vec![
            v8::ExternalReference {
                function: send.map_fn_to(),
            },
            v8::ExternalReference {
                function: recv.map_fn_to(),
            },
            v8::ExternalReference {
                function: set_global_error_handler.map_fn_to(),
            },
        ])
    });

    Cow::Borrowed(references.0.as_slice())
}

fn context_state(scope: &v8::Isolate) -> Rc<ContextState> {
    match ContextState::get(scope) {
        Some(state) => state,
        None => exception::fatal("native binding called on an isolate without context state"),
    }
}

fn send(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let state = context_state(scope);

    if state.is_terminated() {
        return;
    }

    let Some(message) = read_message(scope, &args) else {
        return;
    };

    let Some(handler) = state.host_handler() else {
        tracing::debug!(
            "send(id = {}, kind = {}) with no host handler installed",
            message.id,
            message.kind
        );
        return;
    };

    state.mark_active();
    state.push_frame();

    let returned = {
        let mut frame = CallFrame {
            scope: &mut *scope,
            state: state.clone(),
        };
        handler.on_message(&mut frame, message)
    };

    let value = state.pop_frame().unwrap_or(returned);

    if state.is_terminated() {
        return;
    }

    let value = codec::to_script(scope, value);
    rv.set(value);
}

/// Decompose `send`'s arguments. Throws a `TypeError` and returns `None`
/// when the first argument is not an object.
fn read_message(
    scope: &mut v8::PinScope<'_, '_>,
    args: &v8::FunctionCallbackArguments,
) -> Option<Message> {
    let Ok(object) = v8::Local::<v8::Object>::try_from(args.get(0)) else {
        throw_type_error(scope, "send expects a message object");
        return None;
    };

    let id = read_i32(scope, object, "id")? as u32;
    let kind = read_i32(scope, object, "kind")?;

    let key = v8::String::new(scope, "sync")?;
    let sync = object.get(scope, key.into())?;
    let synchronous = sync.is_undefined() || sync.boolean_value(scope);

    let key = v8::String::new(scope, "payload")?;
    let payload = object.get(scope, key.into())?;
    let value = codec::to_native(scope, payload);

    let raw = match v8::Local::<v8::ArrayBufferView>::try_from(args.get(1)) {
        Ok(view) => buffer::export(scope, view),
        Err(_) => None,
    };

    Some(Message {
        id,
        synchronous,
        kind,
        value,
        raw,
    })
}

/// Missing fields read as 0. `None` only if a getter threw.
fn read_i32(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
    name: &str,
) -> Option<i32> {
    let key = v8::String::new(scope, name)?;
    let value = object.get(scope, key.into())?;

    if value.is_undefined() {
        return Some(0);
    }

    value.int32_value(scope)
}

fn recv(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let state = context_state(scope);

    let Ok(handler) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw_type_error(scope, "recv expects a function");
        return;
    };

    let handler = v8::Global::new(scope, handler);
    if !state.register_recv(handler) {
        throw_error(scope, "recv handler is already registered");
    }
}

fn set_global_error_handler(
    scope: &mut v8::PinScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let state = context_state(scope);

    let Ok(handler) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw_type_error(scope, "setGlobalErrorHandler expects a function");
        return;
    };

    let handler = v8::Global::new(scope, handler);
    if !state.register_error_handler(handler) {
        throw_error(scope, "global error handler is already registered");
    }
}

fn throw_type_error(scope: &mut v8::PinScope<'_, '_>, text: &str) {
    if let Some(message) = v8::String::new(scope, text) {
        let exception = v8::Exception::type_error(scope, message);
        scope.throw_exception(exception);
    }
}

fn throw_error(scope: &mut v8::PinScope<'_, '_>, text: &str) {
    if let Some(message) = v8::String::new(scope, text) {
        let exception = v8::Exception::error(scope, message);
        scope.throw_exception(exception);
    }
}

/// Call the script's `recv` handler as `handler(payload, kind, raw?)`.
///
/// With no handler registered this is not an error: the call yields `Absent`.
/// An exception escaping the handler is reported; if the script's global error
/// handler took it the call yields `Absent`, otherwise [`Error::Script`].
pub(crate) fn dispatch_in_scope(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    kind: i32,
    value: TaggedValue,
    raw: Option<HostBuffer>,
) -> Result<TaggedValue> {
    if state.is_terminated() {
        return Err(Error::Terminated);
    }

    let Some(handler) = state.recv_handler() else {
        tracing::debug!("dispatch(kind = {}) with no recv handler registered", kind);
        return Ok(TaggedValue::Absent);
    };

    state.mark_active();

    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    let handler = v8::Local::new(&tc, &handler);
    let mut args = vec![
        codec::to_script(&mut tc, value),
        v8::Integer::new(&tc, kind).into(),
    ];
    if let Some(raw) = raw {
        args.push(codec::to_script(&mut tc, TaggedValue::HostBuffer(raw)));
    }

    // Argument conversion may have thrown (budget denial)
    let result = if tc.has_caught() {
        None
    } else {
        let receiver = tc.get_current_context().global(&tc).into();
        handler.call(&tc, receiver, &args)
    };

    if tc.has_terminated() || state.termination.is_terminated() {
        return Err(Error::Terminated);
    }

    match result {
        Some(returned) => Ok(codec::to_native(&mut tc, returned)),
        None => {
            let message = tc.message();
            let Some(exception) = tc.exception() else {
                return Err(Error::Script(format!("recv handler for kind {} failed", kind)));
            };

            match exception::report(&mut tc, state, exception, message) {
                Some(diagnostic) => Err(Error::Script(diagnostic)),
                None => Ok(TaggedValue::Absent),
            }
        }
    }
}

fn private_key<'s>(scope: &mut v8::PinScope<'s, '_>, name: &str) -> Option<v8::Local<'s, v8::Private>> {
    let name = v8::String::new(scope, name)?;
    Some(v8::Private::for_api(scope, Some(name)))
}

/// Store the registered handlers on the global object so they survive
/// snapshot serialization, which cannot carry embedder state.
pub(crate) fn persist_handlers(scope: &mut v8::PinScope<'_, '_>, state: &ContextState) {
    let global = scope.get_current_context().global(scope);

    for (name, handler) in [
        (RECV_KEY, state.recv_handler()),
        (ERROR_HANDLER_KEY, state.error_handler()),
    ] {
        let (Some(handler), Some(key)) = (handler, private_key(scope, name)) else {
            continue;
        };

        let handler = v8::Local::new(scope, &handler);
        global.set_private(scope, key, handler.into());
    }
}

/// Re-register handlers persisted by [`persist_handlers`] in a context
/// restored from a snapshot.
pub(crate) fn restore_handlers(scope: &mut v8::PinScope<'_, '_>, state: &ContextState) {
    let global = scope.get_current_context().global(scope);

    for name in [RECV_KEY, ERROR_HANDLER_KEY] {
        let Some(key) = private_key(scope, name) else {
            continue;
        };

        let handler = global
            .get_private(scope, key)
            .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok());

        if let Some(handler) = handler {
            let handler = v8::Global::new(scope, handler);

            let registered = if name == RECV_KEY {
                state.register_recv(handler)
            } else {
                state.register_error_handler(handler)
            };

            if registered {
                tracing::debug!("Restored {} from snapshot", name);
            }
        }

        global.delete_private(scope, key);
    }
}
