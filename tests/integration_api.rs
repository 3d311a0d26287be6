/// Integration tests for the public API surface and engine lifecycle.
///
/// These tests verify:
///   • parse → run → call round trips and completion values
///   • exception marking, unwrapping, and the abort flavour
///   • native handlers that throw into script
///   • the halt callback aborting a runaway loop, context staying usable
///   • reference counting conservation across copy/free
///   • GC soundness for externally pinned values
///   • snapshot save / exec / merge
use jjs::parser::ParseOptions;
use jjs::{Context, ErrorKind, Value};
use std::rc::Rc;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn ctx() -> Context {
    Context::new(Default::default()).unwrap()
}

fn eval(c: &mut Context, src: &str) -> Value {
    let script = c.parse(src, &ParseOptions::default());
    assert!(
        !c.value_is_exception(script),
        "parse failed for: {}",
        src
    );
    let result = c.run(script);
    c.value_free(script);
    result
}

fn eval_number(c: &mut Context, src: &str) -> f64 {
    let v = eval(c, src);
    assert!(!c.value_is_exception(v), "eval threw for: {}", src);
    let n = c.value_as_number(v);
    c.value_free(v);
    n
}

fn eval_string(c: &mut Context, src: &str) -> String {
    let v = eval(c, src);
    assert!(!c.value_is_exception(v), "eval threw for: {}", src);
    let s = c.value_as_string_utf8(v);
    c.value_free(v);
    s
}

// ─── parse / run / call ───────────────────────────────────────────────────────

#[test]
fn parse_run_call_round_trip() {
    // parse("function f(a,b){return a+b}"); run(); call("f",[4,2]) → 6
    let mut c = ctx();
    let script = c.parse("function f(a,b){return a+b}", &ParseOptions::default());
    assert!(!c.value_is_exception(script));
    let r = c.run(script);
    assert!(!c.value_is_exception(r));
    c.value_free(r);
    c.value_free(script);

    let four = c.value_number(4.0);
    let two = c.value_number(2.0);
    let sum = c.call("f", &[four, two]);
    assert!(!c.value_is_exception(sum));
    assert_eq!(c.value_as_number(sum), 6.0);
    c.value_free(sum);
    c.value_free(four);
    c.value_free(two);
}

#[test]
fn script_completion_value_is_last_expression() {
    let mut c = ctx();
    assert_eq!(eval_number(&mut c, "1 + 2; 40 + 2;"), 42.0);
}

#[test]
fn scripts_are_reusable() {
    let mut c = ctx();
    let script = c.parse("globalThis.n = (globalThis.n || 0) + 1; globalThis.n;", &ParseOptions::default());
    let a = c.run(script);
    let b = c.run(script);
    assert_eq!(c.value_as_number(a), 1.0);
    assert_eq!(c.value_as_number(b), 2.0);
    c.value_free(a);
    c.value_free(b);
    c.value_free(script);
}

// ─── exceptions ───────────────────────────────────────────────────────────────

#[test]
fn thrown_number_round_trips_through_the_boundary() {
    // parse("throw -5.6") then run() → error-marked value with payload -5.6
    let mut c = ctx();
    let v = eval(&mut c, "throw -5.6");
    assert!(c.value_is_exception(v));
    assert!(!c.value_is_abort(v));
    let payload = c.exception_value(v, true);
    assert_eq!(c.value_as_number(payload), -5.6);
    c.value_free(payload);
}

#[test]
fn every_api_failure_is_error_marked() {
    let mut c = ctx();
    // unknown global function
    let r = c.call("no_such_function", &[]);
    assert!(c.value_is_exception(r));
    c.value_free(r);
    // running a non-script
    let n = c.value_number(1.0);
    let r = c.run(n);
    assert!(c.value_is_exception(r));
    c.value_free(r);
    c.value_free(n);
}

#[test]
fn native_handler_throw_lands_in_js_catch() {
    // Handler returns throw_sz(TypeError, "oops"); JS catch reads e.message.
    let mut c = ctx();
    let f = c.create_native_function(Rc::new(|ctx: &mut Context, _this, _args| {
        Ok(ctx.throw_sz(ErrorKind::TypeError, "oops"))
    }));
    let ok = c.global_set("poison", f);
    c.value_free(ok);
    c.value_free(f);
    assert_eq!(
        eval_string(
            &mut c,
            "(function(){ try { poison(); } catch (e) { return e.message; } })()"
        ),
        "oops"
    );
}

#[test]
fn native_handler_receives_arguments() {
    let mut c = ctx();
    let f = c.create_native_function(Rc::new(|ctx: &mut Context, _this, args| {
        let a = ctx.value_as_number(args[0]);
        let b = ctx.value_as_number(args[1]);
        Ok(ctx.value_number(a * b))
    }));
    let ok = c.global_set("mul", f);
    c.value_free(ok);
    c.value_free(f);
    assert_eq!(eval_number(&mut c, "mul(6, 7)"), 42.0);
}

#[test]
fn engine_error_carries_message_and_stack() {
    let mut c = ctx();
    let v = eval(&mut c, "null.x");
    assert!(c.value_is_exception(v));
    let err = c.exception_value(v, true);
    let msg = c.object_get(err, "message");
    assert!(!c.value_as_string_utf8(msg).is_empty());
    let stack = c.object_get(err, "stack");
    assert!(c.value_is_string(stack));
    c.value_free(msg);
    c.value_free(stack);
    c.value_free(err);
}

// ─── halt callback / aborts ───────────────────────────────────────────────────

#[test]
fn halt_callback_aborts_runaway_loop() {
    // parse("while(true);"), install halt callback returning "stop", run →
    // abort-marked value carrying "stop"; subsequent API calls succeed.
    let mut c = ctx();
    c.halt_callback_set(16, Rc::new(|ctx: &mut Context| ctx.value_string("stop")));
    let v = eval(&mut c, "while(true);");
    assert!(c.value_is_exception(v));
    assert!(c.value_is_abort(v));
    let payload = c.exception_value(v, true);
    assert_eq!(c.value_as_string_utf8(payload), "stop");
    c.value_free(payload);

    c.halt_callback_clear();
    assert_eq!(eval_number(&mut c, "1 + 1"), 2.0);
}

#[test]
fn abort_is_not_catchable_by_script() {
    let mut c = ctx();
    c.halt_callback_set(16, Rc::new(|ctx: &mut Context| ctx.value_string("stop")));
    let v = eval(&mut c, "try { while(true); } catch (e) { 'caught'; } 'after';");
    assert!(c.value_is_abort(v));
    c.value_free(v);
    c.halt_callback_clear();
}

#[test]
fn throw_callback_fires_once_per_exception() {
    use std::cell::Cell;
    let mut c = ctx();
    let hits = Rc::new(Cell::new(0u32));
    let hits2 = Rc::clone(&hits);
    c.throw_callback_set(Rc::new(move |_ctx: &mut Context, _v: Value| {
        hits2.set(hits2.get() + 1);
    }));
    let v = eval(&mut c, "try { throw 1; } catch (e) { } 'done';");
    assert!(!c.value_is_exception(v));
    c.value_free(v);
    assert_eq!(hits.get(), 1);
    assert!(c.vm_throw_captured());
    c.vm_throw_capture_clear();
    assert!(!c.vm_throw_captured());
}

// ─── reference counting / GC ──────────────────────────────────────────────────

#[test]
fn value_copy_then_free_is_a_no_op() {
    let mut c = ctx();
    let v = eval(&mut c, "({answer: 42})");
    let before = c.heap.get(jjs::heap::Idx(v.heap_cp())).refs;
    let copy = c.value_copy(v);
    c.value_free(copy);
    let after = c.heap.get(jjs::heap::Idx(v.heap_cp())).refs;
    assert_eq!(before, after);
    c.value_free(v);
}

#[test]
fn pinned_value_survives_high_pressure_gc() {
    let mut c = ctx();
    let v = eval(&mut c, "({a: 1, b: 'two', c: [3, 4, 5]})");
    assert!(!c.value_is_exception(v));
    c.heap_gc(jjs::gc::Pressure::High);
    // Transitively reachable fields read the same after collection.
    let b = c.object_get(v, "b");
    assert_eq!(c.value_as_string_utf8(b), "two");
    let arr = c.object_get(v, "c");
    let elem = c.object_get_index(arr, 2);
    assert_eq!(c.value_as_number(elem), 5.0);
    c.value_free(elem);
    c.value_free(arr);
    c.value_free(b);
    c.value_free(v);
}

#[test]
fn garbage_is_reclaimed() {
    let mut c = ctx();
    let v = eval(&mut c, "for (var i = 0; i < 200; i++) { var t = {n: i}; } 0;");
    c.value_free(v);
    let before = c.heap_used_bytes();
    c.heap_gc(jjs::gc::Pressure::High);
    assert!(c.heap_used_bytes() <= before);
}

// ─── snapshots ────────────────────────────────────────────────────────────────

#[test]
fn snapshot_round_trip_executes() {
    let mut c = ctx();
    let script = c.parse("function sq(x){ return x * x } sq(9);", &ParseOptions::default());
    let snap = c.snapshot_save(script, false).unwrap();
    c.value_free(script);

    // Load into a fresh context: snapshots are position independent.
    let mut c2 = ctx();
    let loaded = c2.snapshot_exec(&snap, false);
    assert!(!c2.value_is_exception(loaded));
    let r = c2.run(loaded);
    assert_eq!(c2.value_as_number(r), 81.0);
    c2.value_free(r);
    c2.value_free(loaded);
}

#[test]
fn merged_snapshot_parts_execute_independently() {
    let mut c = ctx();
    let s1 = c.parse("11;", &ParseOptions::default());
    let s2 = c.parse("22;", &ParseOptions::default());
    let b1 = c.snapshot_save(s1, false).unwrap();
    let b2 = c.snapshot_save(s2, false).unwrap();
    c.value_free(s1);
    c.value_free(s2);
    let merged = jjs::snapshot::merge(&[&b1, &b2]).unwrap();

    let p2 = c.snapshot_exec_at(&merged, 1, false);
    let r = c.run(p2);
    assert_eq!(c.value_as_number(r), 22.0);
    c.value_free(r);
    c.value_free(p2);
}

#[test]
fn source_name_and_user_value_are_retained() {
    let mut c = ctx();
    let cookie = c.value_string("cookie");
    let opts = ParseOptions {
        source_name: Some("boot.js".to_string()),
        user_value: cookie,
        ..Default::default()
    };
    let script = c.parse("1;", &opts);
    assert!(!c.value_is_exception(script));
    let name = c.source_name(script);
    assert_eq!(c.value_as_string_utf8(name), "boot.js");
    let back = c.source_user_value(script);
    assert_eq!(c.value_as_string_utf8(back), "cookie");
    c.value_free(back);
    c.value_free(name);
    c.value_free(script);
    c.value_free(cookie);
}

#[test]
fn microtask_ordering_is_fifo() {
    let mut c = ctx();
    let v = eval(
        &mut c,
        "globalThis.order = ''; \
         queueMicrotask(function(){ order = order + 'a'; }); \
         queueMicrotask(function(){ order = order + 'b'; }); \
         queueMicrotask(function(){ order = order + 'c'; }); 0;",
    );
    c.value_free(v);
    let r = c.run_jobs();
    assert!(!c.value_is_exception(r));
    c.value_free(r);
    assert_eq!(eval_string(&mut c, "order"), "abc");
}
