//! Translation between script values and [`TaggedValue`].
//!
//! Both directions are total: shapes without a [`TaggedValue`] variant and
//! anything nested deeper than [`MAX_DEPTH`] become `Absent` / `undefined`.
//! Numbers are converted with the engine's ToInt32, so `2**32 + 1` arrives
//! as `1` and `3.9` as `3`.

use std::pin::pin;

use crate::buffer;
use crate::state::ContextState;
use crate::value::TaggedValue;

/// Nesting limit for arrays and objects. Also bounds cyclic structures.
pub const MAX_DEPTH: usize = 64;

/// Convert a script value to its host representation.
///
/// Byte views found anywhere in `value` are exported, which detaches them on
/// the script side. Exceptions thrown by getters while walking objects are
/// swallowed and the offending property becomes `Absent`.
pub fn to_native(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> TaggedValue {
    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    native_at(&mut tc, value, 0)
}

fn native_at(
    scope: &mut v8::PinScope<'_, '_>,
    value: v8::Local<'_, v8::Value>,
    depth: usize,
) -> TaggedValue {
    if depth > MAX_DEPTH {
        return TaggedValue::Absent;
    }

    if value.is_number() {
        return value
            .int32_value(scope)
            .map(TaggedValue::Int32)
            .unwrap_or_default();
    }

    if value.is_string() {
        return TaggedValue::String(value.to_rust_string_lossy(scope));
    }

    if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
        return buffer::export(scope, view)
            .map(TaggedValue::ScriptBuffer)
            .unwrap_or_default();
    }

    if let Ok(ab) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
        return TaggedValue::ScriptBuffer(buffer::export_array_buffer(ab));
    }

    if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
        let mut items = Vec::with_capacity(array.length() as usize);

        for i in 0..array.length() {
            let item = match array.get_index(scope, i) {
                Some(item) => native_at(scope, item, depth + 1),
                None => TaggedValue::Absent,
            };
            items.push(item);
        }

        return TaggedValue::Array(items);
    }

    if value.is_function() {
        return TaggedValue::Absent;
    }

    if let Ok(object) = v8::Local::<v8::Object>::try_from(value) {
        return native_object(scope, object, depth);
    }

    TaggedValue::Absent
}

fn native_object(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
    depth: usize,
) -> TaggedValue {
    let args = v8::GetPropertyNamesArgs {
        key_conversion: v8::KeyConversionMode::ConvertToString,
        ..Default::default()
    };

    let Some(names) = object.get_own_property_names(scope, args) else {
        return TaggedValue::Object(Vec::new());
    };

    let mut pairs = Vec::with_capacity(names.length() as usize);

    for i in 0..names.length() {
        let Some(key) = names.get_index(scope, i) else {
            continue;
        };

        let name = key.to_rust_string_lossy(scope);
        let value = match object.get(scope, key) {
            Some(value) => native_at(scope, value, depth + 1),
            None => TaggedValue::Absent,
        };

        pairs.push((name, value));
    }

    TaggedValue::Object(pairs)
}

/// Convert a host value into a new script value.
///
/// Host buffers are imported through the context's memory budget, and script
/// buffers handed back are copied through it. When the budget refuses a copy a `RangeError` is left pending in `scope` and the
/// buffer converts to `undefined`.
pub fn to_script<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    value: TaggedValue,
) -> v8::Local<'s, v8::Value> {
    script_at(scope, value, 0)
}

fn script_at<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    value: TaggedValue,
    depth: usize,
) -> v8::Local<'s, v8::Value> {
    if depth > MAX_DEPTH {
        return v8::undefined(scope).into();
    }

    let converted: Option<v8::Local<'s, v8::Value>> = match value {
        TaggedValue::Absent => None,
        TaggedValue::Int32(v) => Some(v8::Integer::new(scope, v).into()),
        TaggedValue::String(s) => v8::String::new(scope, &s).map(Into::into),
        TaggedValue::Array(items) => {
            let array = v8::Array::new(scope, items.len() as i32);

            for (i, item) in items.into_iter().enumerate() {
                let item = script_at(scope, item, depth + 1);
                array.set_index(scope, i as u32, item);
            }

            Some(array.into())
        }
        TaggedValue::Object(pairs) => {
            let object = v8::Object::new(scope);

            // Data properties, so "__proto__" stays a plain key
            for (key, item) in pairs {
                let Some(key) = v8::String::new(scope, &key) else {
                    continue;
                };
                let item = script_at(scope, item, depth + 1);
                object.create_data_property(scope, key.into(), item);
            }

            Some(object.into())
        }
        TaggedValue::HostBuffer(host) => match ContextState::get(scope) {
            Some(state) => {
                buffer::import(scope, &state.budget, &state.external, host).map(Into::into)
            }
            None => {
                tracing::warn!("Host buffer dropped: no execution context state");
                None
            }
        },
        TaggedValue::ScriptBuffer(script) => match ContextState::get(scope) {
            Some(state) => buffer::reimport(scope, &state.budget, &script).map(Into::into),
            None => {
                tracing::warn!("Script buffer dropped: no execution context state");
                None
            }
        },
    };

    converted.unwrap_or_else(|| v8::undefined(scope).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;

    #[test]
    fn test_numbers_truncate_to_int32() {
        let mut ctx = ExecutionContext::builder().build().unwrap();

        let value = ctx.evaluate("numbers.js", "return [3.9, -1.5, 4294967297, NaN];").unwrap();

        assert_eq!(
            value,
            TaggedValue::Array(vec![3.into(), (-1).into(), 1.into(), 0.into()])
        );
    }

    #[test]
    fn test_unsupported_shapes_become_absent() {
        let mut ctx = ExecutionContext::builder().build().unwrap();

        let value = ctx
            .evaluate(
                "shapes.js",
                "return { t: true, n: null, f: function () {}, s: Symbol('x') };",
            )
            .unwrap();

        assert_eq!(
            value,
            TaggedValue::object([
                ("t", TaggedValue::Absent),
                ("n", TaggedValue::Absent),
                ("f", TaggedValue::Absent),
                ("s", TaggedValue::Absent),
            ])
        );
    }

    #[test]
    fn test_cyclic_object_is_bounded() {
        let mut ctx = ExecutionContext::builder().build().unwrap();

        let value = ctx
            .evaluate("cycle.js", "const o = { n: 1 }; o.self = o; return o;")
            .unwrap();

        let mut cursor = &value;
        let mut levels = 0;
        while let Some(next) = cursor.get("self") {
            cursor = next;
            levels += 1;
        }

        // MAX_DEPTH nested objects, then the cut-off marker
        assert_eq!(levels, MAX_DEPTH + 1);
        assert!(cursor.is_absent());
    }

    #[test]
    fn test_throwing_getter_degrades_to_absent() {
        let mut ctx = ExecutionContext::builder().build().unwrap();

        let value = ctx
            .evaluate(
                "getter.js",
                "return { ok: 1, get bad() { throw new Error('nope'); } };",
            )
            .unwrap();

        assert_eq!(value.get("ok"), Some(&TaggedValue::Int32(1)));
        assert_eq!(value.get("bad"), Some(&TaggedValue::Absent));
        assert!(ctx.last_exception().is_none());
    }
}
