mod common;

use v8_bridge::config::MIB;
use v8_bridge::{Budget, Error, ExecutionContext, HostBuffer, Phase, TaggedValue};

#[test]
fn test_arraybuffer_over_budget_throws_range_error() {
    let mut ctx = ExecutionContext::builder()
        .budget(Budget::new(16 * MIB, 32 * MIB))
        .build()
        .unwrap();

    let result = ctx
        .evaluate(
            "alloc.js",
            r#"
                try {
                    new ArrayBuffer(64 * 1024 * 1024);
                    return 'allocated';
                } catch (e) {
                    return e.name;
                }
            "#,
        )
        .unwrap();

    assert_eq!(result, TaggedValue::from("RangeError"));
    assert!(ctx.failure_count() >= 1);
    // The context survives a denied allocation
    assert_eq!(ctx.evaluate("after.js", "return 1 + 1;").unwrap(), TaggedValue::Int32(2));
}

#[test]
fn test_small_allocations_pass_within_budget() {
    let mut ctx = ExecutionContext::builder()
        .budget(Budget::new(16 * MIB, 32 * MIB))
        .build()
        .unwrap();

    let result = ctx
        .evaluate(
            "alloc.js",
            r#"
                const kept = [];
                for (let i = 0; i < 8; i++) kept.push(new ArrayBuffer(1024 * 1024));
                globalThis.kept = kept;
                return kept.length;
            "#,
        )
        .unwrap();

    assert_eq!(result, TaggedValue::Int32(8));
    assert_eq!(ctx.failure_count(), 0);
    assert!(ctx.heap_statistics().unwrap().allocated_bytes >= 8 * MIB);
}

#[test]
fn test_copied_host_buffer_over_budget_raises_in_context() {
    let mut ctx = common::context_with_budget(
        Budget::new(16 * MIB, 32 * MIB),
        "recv((p) => p.byteLength);",
    );

    let buffer = HostBuffer::copied(vec![0u8; 48 * MIB]);
    let err = ctx.dispatch(0, TaggedValue::HostBuffer(buffer)).unwrap_err();

    let Error::Script(diagnostic) = err else {
        panic!("expected a script error, got {:?}", err);
    };
    assert!(diagnostic.starts_with("RangeError: ArrayBuffer allocation failed."));
    assert_eq!(ctx.last_exception(), Some(diagnostic));
}

#[test]
fn test_heap_statistics() {
    let mut ctx = common::context_with("globalThis.blob = new ArrayBuffer(2 * 1024 * 1024);");

    let stats = ctx.heap_statistics().unwrap();

    assert!(stats.total_heap_size > 0);
    assert!(stats.used_heap_size > 0);
    assert!(stats.used_heap_size <= stats.total_heap_size);
    assert!(stats.heap_size_limit > 0);
    assert!(stats.native_context_count >= 1);
    assert!(stats.allocated_bytes >= 2 * MIB);
    assert_eq!(stats.failure_count, 0);

    // Engine build flag, stable for the isolate's lifetime
    let again = ctx.heap_statistics().unwrap();
    assert_eq!(again.does_zap_garbage, stats.does_zap_garbage);
}

#[test]
fn test_invalid_budget_is_rejected() {
    let err = ExecutionContext::builder()
        .budget(Budget::new(64 * MIB, 32 * MIB))
        .build()
        .unwrap_err();

    assert!(matches!(err, Error::InvalidBudget(_)));
}

#[test]
fn test_heap_exhaustion_terminates_context() {
    let mut ctx = common::context_with_budget(
        Budget::new(16 * MIB, 32 * MIB),
        r#"
            recv(() => {
                const hog = [];
                for (;;) hog.push(new Array(100000).fill(1.5));
            });
        "#,
    );

    let result = ctx.dispatch(0, TaggedValue::Absent);

    assert!(matches!(result, Err(Error::Terminated)));
    assert!(ctx.memory_limit_hit());
    assert!(ctx.heap_limit_callbacks() >= 1);
    assert_eq!(ctx.phase(), Phase::Terminated);
}
