mod common;

use v8_bridge::{Error, ExecutionContext, TaggedValue};

#[test]
fn test_uncaught_exception_is_stored_with_stack() {
    let mut ctx = ExecutionContext::builder().build().unwrap();

    let ok = ctx.compile_and_run(
        "boom.js",
        "function fail() { throw new Error('boom'); }\nfail();",
    );

    assert!(!ok);

    let diagnostic = ctx.last_exception().unwrap();
    let lines: Vec<&str> = diagnostic.lines().collect();

    assert_eq!(lines[0], "Error: boom");
    assert!(lines[1].starts_with("boom.js 1:"), "{}", diagnostic);
    assert_eq!(lines[2], "boom.js 2:1");
}

#[test]
fn test_syntax_error_reports_location() {
    let mut ctx = ExecutionContext::builder().build().unwrap();

    assert!(!ctx.compile_and_run("syntax.js", "let = ;"));

    let diagnostic = ctx.last_exception().unwrap();
    assert!(diagnostic.starts_with("SyntaxError:"), "{}", diagnostic);
    assert!(diagnostic.contains("syntax.js 1:"), "{}", diagnostic);
}

#[test]
fn test_evaluate_reports_source_lines() {
    let mut ctx = ExecutionContext::builder().build().unwrap();

    let err = ctx
        .evaluate("eval.js", "const a = 1;\nthrow new TypeError('bad ' + a);")
        .unwrap_err();

    let Error::Script(diagnostic) = err else {
        panic!("expected a script error");
    };

    assert!(diagnostic.starts_with("TypeError: bad 1\n"));
    assert!(diagnostic.contains("eval.js 2:"), "{}", diagnostic);
}

#[test]
fn test_global_error_handler_takes_exception() {
    let mut ctx = common::context_with(
        r#"
            globalThis.reported = null;
            setGlobalErrorHandler((message, source, line, column, error) => {
                globalThis.reported = { message, source, line, error: error.message };
            });
        "#,
    );

    assert!(!ctx.compile_and_run("fail.js", "throw new Error('handled');"));
    assert!(ctx.last_exception().is_none());

    let reported = ctx.evaluate("check.js", "return reported;").unwrap();
    assert_eq!(
        reported,
        TaggedValue::object([
            ("message", TaggedValue::from("Error: handled")),
            ("source", TaggedValue::from("fail.js")),
            ("line", TaggedValue::Int32(1)),
            ("error", TaggedValue::from("handled")),
        ])
    );
}

#[test]
fn test_dispatch_exception_without_handler_is_an_error() {
    let mut ctx = common::context_with("recv(() => { throw new RangeError('out'); });");

    let err = ctx.dispatch(0, TaggedValue::Absent).unwrap_err();

    let Error::Script(diagnostic) = err else {
        panic!("expected a script error");
    };
    assert!(diagnostic.starts_with("RangeError: out"));
    assert_eq!(ctx.last_exception(), Some(diagnostic));
}

#[test]
fn test_dispatch_exception_with_handler_yields_absent() {
    let mut ctx = common::context_with(
        r#"
            globalThis.caught = 0;
            setGlobalErrorHandler(() => { caught++; });
            recv(() => { throw new Error('inside recv'); });
        "#,
    );

    assert!(ctx.dispatch(0, TaggedValue::Absent).unwrap().is_absent());
    assert!(ctx.last_exception().is_none());
    assert_eq!(ctx.evaluate("check.js", "return caught;").unwrap(), TaggedValue::Int32(1));
}

#[test]
fn test_throwing_error_handler_falls_back_to_last_exception() {
    let mut ctx = common::context_with("setGlobalErrorHandler(() => { throw new Error('again'); });");

    assert!(!ctx.compile_and_run("fail.js", "throw new Error('first');"));

    let diagnostic = ctx.last_exception().unwrap();
    assert!(diagnostic.starts_with("Error: first"));
}

#[test]
fn test_second_error_handler_registration_throws() {
    let mut ctx = common::context_with(
        r#"
            setGlobalErrorHandler(() => {});
            globalThis.second = null;
            try {
                setGlobalErrorHandler(() => {});
            } catch (e) {
                second = String(e);
            }
        "#,
    );

    assert_eq!(
        ctx.evaluate("check.js", "return second;").unwrap(),
        TaggedValue::from("Error: global error handler is already registered")
    );
}

#[test]
fn test_error_handler_rejects_non_function() {
    let mut ctx = ExecutionContext::builder().build().unwrap();

    assert!(!ctx.compile_and_run("bad.js", "setGlobalErrorHandler('nope');"));
    assert!(
        ctx.last_exception()
            .unwrap()
            .starts_with("TypeError: setGlobalErrorHandler expects a function")
    );
}
