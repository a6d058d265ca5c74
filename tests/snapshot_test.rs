use v8_bridge::{
    Error, ExecutionContext, Message, Phase, SnapshotBlob, TaggedValue, create_snapshot,
    try_create_snapshot,
};

// Snapshot creators must not run concurrently, so every scenario lives in one
// test function.
#[test]
fn test_snapshot_lifecycle() {
    globals_survive_snapshot();
    handlers_survive_snapshot();
    failing_initialization_is_an_error();
    blob_round_trips_through_file();
}

fn globals_survive_snapshot() {
    let blob = create_snapshot("init.js", "globalThis.x = 7; function twice(n) { return n * 2; }");
    assert!(!blob.is_empty());

    let mut ctx = ExecutionContext::builder().snapshot(blob).build().unwrap();

    assert_eq!(ctx.evaluate("check.js", "return x;").unwrap(), TaggedValue::Int32(7));
    assert_eq!(
        ctx.evaluate("check.js", "return twice(x);").unwrap(),
        TaggedValue::Int32(14)
    );
    assert_eq!(ctx.phase(), Phase::Uninitialized);

    // Each context gets its own copy of the heap
    let mut other = ExecutionContext::builder().snapshot(blob).build().unwrap();
    ctx.evaluate("mutate.js", "x = 1; return x;").unwrap();
    assert_eq!(other.evaluate("check.js", "return x;").unwrap(), TaggedValue::Int32(7));
}

fn handlers_survive_snapshot() {
    let blob = create_snapshot(
        "init.js",
        r#"
            globalThis.errors = 0;
            setGlobalErrorHandler(() => { errors++; });
            recv((payload, kind) => {
                if (kind === 1) throw new Error('nope');
                return send({ id: 1, kind: 2, payload: payload + 1 });
            });
        "#,
    );

    let mut ctx = ExecutionContext::builder()
        .snapshot(blob)
        .handler(|_frame, message: Message| match message.value {
            TaggedValue::Int32(n) => TaggedValue::Int32(n * 10),
            _ => TaggedValue::Absent,
        })
        .build()
        .unwrap();

    assert_eq!(ctx.phase(), Phase::HandlerRegistered);

    // recv restored, send bound to this context's host handler
    assert_eq!(ctx.dispatch(0, TaggedValue::Int32(4)).unwrap(), TaggedValue::Int32(50));

    // Global error handler restored
    assert!(ctx.dispatch(1, TaggedValue::Absent).unwrap().is_absent());
    assert!(ctx.last_exception().is_none());
    assert_eq!(ctx.evaluate("check.js", "return errors;").unwrap(), TaggedValue::Int32(1));

    // The private keys are gone and the bindings are still exclusive
    let second = ctx
        .evaluate(
            "check.js",
            "try { recv(() => 0); return 'registered'; } catch (e) { return String(e); }",
        )
        .unwrap();
    assert_eq!(second, TaggedValue::from("Error: recv handler is already registered"));
}

fn failing_initialization_is_an_error() {
    let err = try_create_snapshot("broken.js", "throw new Error('init failed');").unwrap_err();

    let Error::Snapshot(reason) = err else {
        panic!("expected a snapshot error");
    };
    assert!(reason.contains("init failed"), "{}", reason);

    let err = try_create_snapshot("syntax.js", "let = ;").unwrap_err();
    assert!(matches!(err, Error::Snapshot(_)));
}

fn blob_round_trips_through_file() {
    let blob = create_snapshot("init.js", "globalThis.greeting = 'hello';");

    let path = std::env::temp_dir().join(format!("v8-bridge-{}.bin", std::process::id()));
    blob.write(&path).unwrap();
    let restored = SnapshotBlob::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(restored.as_bytes(), blob.as_bytes());

    let mut ctx = ExecutionContext::builder().snapshot(restored).build().unwrap();
    assert_eq!(
        ctx.evaluate("check.js", "return greeting;").unwrap(),
        TaggedValue::from("hello")
    );

    // Embedded blobs, as produced by include_bytes!
    let embedded = SnapshotBlob::from_static(blob.as_bytes());
    assert_eq!(embedded.len(), blob.len());

    let mut ctx = ExecutionContext::builder().snapshot(embedded).build().unwrap();
    assert_eq!(
        ctx.evaluate("check.js", "return greeting + '!';").unwrap(),
        TaggedValue::from("hello!")
    );
}
