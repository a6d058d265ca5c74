mod common;

use std::rc::Rc;

use v8_bridge::{Error, ExecutionContext, Message, Phase, TaggedValue};

#[test]
fn test_contexts_drop_in_creation_order() {
    let mut first = common::context_with("globalThis.name = 'first';");
    let mut second = common::context_with("globalThis.name = 'second';");

    // Touch the older context while the newer one is alive
    assert_eq!(
        first.evaluate("name.js", "return name;").unwrap(),
        TaggedValue::from("first")
    );

    drop(first);

    assert_eq!(
        second.evaluate("name.js", "return name;").unwrap(),
        TaggedValue::from("second")
    );

    drop(second);
}

#[test]
fn test_contexts_interleave_and_drop_out_of_order() {
    let mut contexts: Vec<ExecutionContext> = (0..4)
        .map(|i| common::context_with(&format!("recv((n) => n + {});", i * 100)))
        .collect();

    for round in 0..3 {
        for (i, ctx) in contexts.iter_mut().enumerate().rev() {
            let result = ctx.dispatch(0, TaggedValue::Int32(round)).unwrap();
            assert_eq!(result, TaggedValue::Int32(i as i32 * 100 + round));
        }
    }

    let middle = contexts.remove(1);
    drop(middle);

    assert_eq!(
        contexts[1].dispatch(0, TaggedValue::Int32(1)).unwrap(),
        TaggedValue::Int32(201)
    );

    // Vec drops front to back
    drop(contexts);

    let mut fresh = ExecutionContext::builder().build().unwrap();
    assert_eq!(fresh.evaluate("ok.js", "return 1;").unwrap(), TaggedValue::Int32(1));
}

#[test]
fn test_idle_termination_releases_handlers_on_next_call() {
    let tracker = Rc::new(());
    let held = tracker.clone();

    let mut ctx = ExecutionContext::builder()
        .handler(move |_frame, _message: Message| {
            let _ = Rc::strong_count(&held);
            TaggedValue::Absent
        })
        .build()
        .unwrap();
    common::run(&mut ctx, "recv((n) => n);");

    assert_eq!(Rc::strong_count(&tracker), 2);

    // Terminated from a control thread while no call is running
    let handle = ctx.termination_handle();
    std::thread::spawn(move || handle.terminate()).join().unwrap();

    assert!(matches!(
        ctx.dispatch(0, TaggedValue::Int32(1)),
        Err(Error::Terminated)
    ));
    assert_eq!(ctx.phase(), Phase::Terminated);
    assert_eq!(Rc::strong_count(&tracker), 1);
}
