//! Uncaught exception reporting.
//!
//! An exception that escapes script code is either handed to the handler the
//! script registered with `setGlobalErrorHandler(fn)`, called as
//! `fn(message, source, line, column, error)`, or formatted into a diagnostic
//! stored as the context's last exception.

use std::pin::pin;

use crate::state::ContextState;

/// Report an uncaught exception.
///
/// `message` is the one captured by the `TryCatch` that caught `exception`,
/// when available; compile errors only carry their location there.
///
/// Returns `None` when the script's global error handler took it, otherwise
/// the diagnostic that was stored as the context's last exception.
pub(crate) fn report(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    exception: v8::Local<'_, v8::Value>,
    message: Option<v8::Local<'_, v8::Message>>,
) -> Option<String> {
    let message = message.unwrap_or_else(|| v8::Exception::create_message(scope, exception));

    if let Some(handler) = state.error_handler() {
        if call_error_handler(scope, handler, message, exception) {
            return None;
        }
        tracing::warn!("Global error handler threw, storing the original exception");
    }

    let diagnostic = format_diagnostic(scope, message, exception);
    tracing::warn!("Uncaught exception: {}", diagnostic.trim_end());
    state.set_last_exception(diagnostic.clone());

    Some(diagnostic)
}

/// Returns `false` if the handler itself threw.
fn call_error_handler(
    scope: &mut v8::PinScope<'_, '_>,
    handler: v8::Global<v8::Function>,
    message: v8::Local<'_, v8::Message>,
    exception: v8::Local<'_, v8::Value>,
) -> bool {
    let handler = v8::Local::new(scope, &handler);

    let text: v8::Local<v8::Value> = match exception.to_string(scope) {
        Some(text) => text.into(),
        None => v8::undefined(scope).into(),
    };
    let source = message
        .get_script_resource_name(scope)
        .unwrap_or_else(|| v8::undefined(scope).into());
    let line = v8::Integer::new(scope, message.get_line_number(scope).unwrap_or(0) as i32);
    let column = v8::Integer::new(scope, message.get_start_column() as i32);

    let args = [text, source, line.into(), column.into(), exception];

    let tc = pin!(v8::TryCatch::new(scope));
    let tc = tc.init();

    let receiver = tc.get_current_context().global(&tc).into();
    handler.call(&tc, receiver, &args).is_some() || tc.has_terminated()
}

/// Exception text followed by one `name line:column` line per stack frame,
/// or by the throw location when no stack trace was captured.
pub(crate) fn format_diagnostic(
    scope: &mut v8::PinScope<'_, '_>,
    message: v8::Local<'_, v8::Message>,
    exception: v8::Local<'_, v8::Value>,
) -> String {
    let mut out = exception.to_rust_string_lossy(scope);
    out.push('\n');

    let frames = message
        .get_stack_trace(scope)
        .filter(|trace| trace.get_frame_count() > 0);

    match frames {
        Some(trace) => {
            for i in 0..trace.get_frame_count() {
                let Some(frame) = trace.get_frame(scope, i) else {
                    continue;
                };

                let name = frame
                    .get_script_name(scope)
                    .map(|name| name.to_rust_string_lossy(scope))
                    .unwrap_or_else(|| "<anonymous>".to_string());

                out.push_str(&format!(
                    "{} {}:{}\n",
                    name,
                    frame.get_line_number(),
                    frame.get_column()
                ));
            }
        }
        None => {
            let name = message
                .get_script_resource_name(scope)
                .map(|name| name.to_rust_string_lossy(scope))
                .unwrap_or_else(|| "<anonymous>".to_string());

            out.push_str(&format!(
                "{} {}:{}\n",
                name,
                message.get_line_number(scope).unwrap_or(0),
                message.get_start_column()
            ));
        }
    }

    out
}

/// Failure with no context to report through. Logs and exits the process.
pub fn fatal(message: &str) -> ! {
    tracing::error!("Fatal: {}", message);
    eprintln!("fatal: {}", message);
    std::process::exit(1)
}
