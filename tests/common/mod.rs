#![allow(dead_code)]

use v8_bridge::{Budget, ExecutionContext};

/// Build a context with default settings and run `source` in it.
pub fn context_with(source: &str) -> ExecutionContext {
    let mut ctx = ExecutionContext::builder().build().unwrap();
    run(&mut ctx, source);
    ctx
}

/// Build a context with the given budget and run `source` in it.
pub fn context_with_budget(budget: Budget, source: &str) -> ExecutionContext {
    let mut ctx = ExecutionContext::builder().budget(budget).build().unwrap();
    run(&mut ctx, source);
    ctx
}

pub fn run(ctx: &mut ExecutionContext, source: &str) {
    assert!(
        ctx.compile_and_run("test.js", source),
        "script failed: {:?}",
        ctx.last_exception()
    );
}
