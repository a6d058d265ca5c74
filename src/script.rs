//! Compile and run classic scripts inside an entered context.

use std::pin::pin;

use crate::codec;
use crate::error::{Error, Result};
use crate::exception;
use crate::state::ContextState;
use crate::value::TaggedValue;

/// Compile and run `source` under the script name `name`.
///
/// - `Ok(Some(value))`: completed; `value` is the converted completion value
///   when `convert` is set, `Absent` otherwise
/// - `Ok(None)`: threw, and the script's global error handler took it
/// - `Err(Error::Script(diagnostic))`: threw, diagnostic stored as the last
///   exception
/// - `Err(Error::Terminated)`: the context was terminated while running
pub(crate) fn run(
    scope: &mut v8::PinScope<'_, '_>,
    state: &ContextState,
    name: &str,
    source: &str,
    line_offset: i32,
    convert: bool,
) -> Result<Option<TaggedValue>> {
    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    let (Some(code), Some(resource)) = (v8::String::new(&tc, source), v8::String::new(&tc, name))
    else {
        let diagnostic = format!("{}: source is too large", name);
        state.set_last_exception(diagnostic.clone());
        return Err(Error::Script(diagnostic));
    };

    let origin = v8::ScriptOrigin::new(
        &tc,
        resource.into(),
        line_offset,
        0,
        false,
        0,
        None,
        false,
        false,
        false,
        None,
    );

    let completion = v8::Script::compile(&tc, code, Some(&origin)).and_then(|script| script.run(&tc));

    if tc.has_terminated() || state.termination.is_terminated() {
        return Err(Error::Terminated);
    }

    if let Some(value) = completion {
        if !convert {
            return Ok(Some(TaggedValue::Absent));
        }
        return Ok(Some(codec::to_native(&mut tc, value)));
    }

    let message = tc.message();
    let Some(exception) = tc.exception() else {
        let diagnostic = format!("{}: execution failed without an exception", name);
        state.set_last_exception(diagnostic.clone());
        return Err(Error::Script(diagnostic));
    };

    match exception::report(&mut tc, state, exception, message) {
        Some(diagnostic) => Err(Error::Script(diagnostic)),
        None => Ok(None),
    }
}
