/// Integration tests for language semantics through the bytecode pipeline.
///
/// These tests verify:
///   • arithmetic, comparison, logical and string operators
///   • closures capturing across nested environments
///   • fast arrays staying fast under index growth, and escaping correctly
///   • try/catch/finally ordering, including return-through-finally
///   • let/const scoping, TDZ and constant assignment errors
///   • generators, async/await lowering, optional chaining, templates
///   • built-in objects: Object, Array, String, Math, Function, Error, Proxy
use jjs::parser::ParseOptions;
use jjs::{Context, Value};

fn ctx() -> Context {
    Context::new(Default::default()).unwrap()
}

fn eval(c: &mut Context, src: &str) -> Value {
    let script = c.parse(src, &ParseOptions::default());
    assert!(!c.value_is_exception(script), "parse failed for: {}", src);
    let result = c.run(script);
    c.value_free(script);
    result
}

fn num(c: &mut Context, src: &str) -> f64 {
    let v = eval(c, src);
    assert!(!c.value_is_exception(v), "eval threw for: {}", src);
    let n = c.value_as_number(v);
    c.value_free(v);
    n
}

fn text(c: &mut Context, src: &str) -> String {
    let v = eval(c, src);
    assert!(!c.value_is_exception(v), "eval threw for: {}", src);
    let s = c.value_as_string_utf8(v);
    c.value_free(v);
    s
}

fn boolean(c: &mut Context, src: &str) -> bool {
    let v = eval(c, src);
    assert!(!c.value_is_exception(v), "eval threw for: {}", src);
    assert!(c.value_is_bool(v), "not a boolean: {}", src);
    let b = c.value_as_bool(v);
    c.value_free(v);
    b
}

// ─── operators ────────────────────────────────────────────────────────────────

#[test]
fn arithmetic_and_precedence() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "1 + 2 * 3"), 7.0);
    assert_eq!(num(&mut c, "(1 + 2) * 3"), 9.0);
    assert_eq!(num(&mut c, "2 ** 10"), 1024.0);
    assert_eq!(num(&mut c, "2 ** 3 ** 2"), 512.0); // right associative
    assert_eq!(num(&mut c, "7 % 3"), 1.0);
    assert_eq!(num(&mut c, "-(5)"), -5.0);
    assert_eq!(num(&mut c, "10 / 4"), 2.5);
    assert_eq!(num(&mut c, "1e3 + 0x10 + 0b1 + 0o7"), 1024.0);
}

#[test]
fn bitwise_and_shifts() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "0xF0 & 0x1F"), 16.0);
    assert_eq!(num(&mut c, "1 | 6"), 7.0);
    assert_eq!(num(&mut c, "5 ^ 3"), 6.0);
    assert_eq!(num(&mut c, "~0"), -1.0);
    assert_eq!(num(&mut c, "1 << 8"), 256.0);
    assert_eq!(num(&mut c, "-8 >> 1"), -4.0);
    assert_eq!(num(&mut c, "-1 >>> 28"), 15.0);
}

#[test]
fn comparison_and_equality() {
    let mut c = ctx();
    assert!(boolean(&mut c, "1 < 2"));
    assert!(boolean(&mut c, "'a' < 'b'"));
    assert!(boolean(&mut c, "2 >= 2"));
    assert!(boolean(&mut c, "1 == '1'"));
    assert!(!boolean(&mut c, "1 === '1'"));
    assert!(boolean(&mut c, "null == undefined"));
    assert!(!boolean(&mut c, "null === undefined"));
    assert!(boolean(&mut c, "NaN !== NaN"));
}

#[test]
fn logical_short_circuit_and_nullish() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "0 || 5"), 5.0);
    assert_eq!(num(&mut c, "3 && 4"), 4.0);
    assert_eq!(num(&mut c, "0 ?? 5"), 0.0);
    assert_eq!(num(&mut c, "null ?? 5"), 5.0);
    assert_eq!(
        num(&mut c, "var hit = 0; function f(){ hit = 1; return 2; } var r = 1 || f(); hit;"),
        0.0
    );
    assert_eq!(num(&mut c, "var x; x ??= 9; x"), 9.0);
    assert_eq!(num(&mut c, "var y = 1; y ??= 9; y"), 1.0);
}

#[test]
fn string_concat_and_templates() {
    let mut c = ctx();
    assert_eq!(text(&mut c, "'foo' + 'bar'"), "foobar");
    assert_eq!(text(&mut c, "'n=' + 42"), "n=42");
    assert_eq!(text(&mut c, "`a${1 + 1}b${'c'}`"), "a2bc");
    assert_eq!(text(&mut c, "`${1}${2}${3}`"), "123");
    assert_eq!(text(&mut c, "typeof `x`"), "string");
}

#[test]
fn typeof_void_delete() {
    let mut c = ctx();
    assert_eq!(text(&mut c, "typeof 1"), "number");
    assert_eq!(text(&mut c, "typeof 'x'"), "string");
    assert_eq!(text(&mut c, "typeof undefined"), "undefined");
    assert_eq!(text(&mut c, "typeof missing_name"), "undefined");
    assert_eq!(text(&mut c, "typeof {}"), "object");
    assert_eq!(text(&mut c, "typeof function(){}"), "function");
    assert_eq!(text(&mut c, "typeof null"), "object");
    assert!(boolean(&mut c, "void 0 === undefined"));
    assert!(boolean(
        &mut c,
        "var o = {k: 1}; delete o.k; o.k === undefined"
    ));
}

#[test]
fn increments_prefix_and_postfix() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "var i = 5; i++"), 5.0);
    assert_eq!(num(&mut c, "var i = 5; ++i"), 6.0);
    assert_eq!(num(&mut c, "var i = 5; i--; i"), 4.0);
    assert_eq!(num(&mut c, "var o = {n: 1}; o.n++; o.n"), 2.0);
    assert_eq!(num(&mut c, "var a = [7]; a[0]++; a[0]"), 8.0);
}

// ─── control flow ─────────────────────────────────────────────────────────────

#[test]
fn loops_and_break_continue() {
    let mut c = ctx();
    assert_eq!(
        num(&mut c, "var s = 0; for (var i = 1; i <= 10; i++) s = s + i; s"),
        55.0
    );
    assert_eq!(
        num(&mut c, "var s = 0; var i = 0; while (i < 5) { i++; if (i === 3) continue; s = s + i; } s"),
        12.0
    );
    assert_eq!(
        num(&mut c, "var i = 0; do { i++; } while (i < 7); i"),
        7.0
    );
    assert_eq!(
        num(&mut c, "var n = 0; while (true) { n++; if (n === 4) break; } n"),
        4.0
    );
}

#[test]
fn fibonacci_iterative() {
    let mut c = ctx();
    let src = "function fib(n) { \
                 if (n <= 1) return n; \
                 var a = 0, b = 1; \
                 for (var i = 2; i <= n; i++) { var t = a + b; a = b; b = t; } \
                 return b; \
               } fib(20);";
    assert_eq!(num(&mut c, src), 6765.0);
}

#[test]
fn recursion_depth_is_bounded_by_range_error() {
    let mut c = ctx();
    let v = eval(&mut c, "function boom(){ return boom(); } boom();");
    assert!(c.value_is_exception(v));
    let err = c.exception_value(v, true);
    let name = c.object_get(err, "name");
    assert_eq!(c.value_as_string_utf8(name), "RangeError");
    c.value_free(name);
    c.value_free(err);
}

// ─── closures ─────────────────────────────────────────────────────────────────

#[test]
fn closure_captures_outer_variable() {
    let mut c = ctx();
    let src = "function make_adder(x) { \
                 return function (y) { return x + y; }; \
               } \
               var add5 = make_adder(5); add5(10);";
    assert_eq!(num(&mut c, src), 15.0);
}

#[test]
fn multiple_closures_are_independent() {
    let mut c = ctx();
    let src = "function make_adder(x) { return function (y) { return x + y; }; } \
               var a = make_adder(5); var b = make_adder(10); a(3) + b(7);";
    assert_eq!(num(&mut c, src), 25.0);
}

#[test]
fn three_level_closure() {
    let mut c = ctx();
    let src = "function outer(a) { \
                 return function (b) { return function (c) { return a + b + c; }; }; \
               } outer(1)(2)(3);";
    assert_eq!(num(&mut c, src), 6.0);
}

#[test]
fn arrow_functions_and_lexical_this() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "var f = (a, b) => a + b; f(4, 2)"), 6.0);
    assert_eq!(num(&mut c, "var g = x => x * 2; g(21)"), 42.0);
    assert_eq!(
        num(&mut c, "var o = { n: 7, get_n: function(){ var f = () => this.n; return f(); } }; o.get_n()"),
        7.0
    );
}

// ─── scoping ──────────────────────────────────────────────────────────────────

#[test]
fn let_is_block_scoped() {
    let mut c = ctx();
    assert_eq!(
        num(&mut c, "let x = 1; { let x = 2; } x"),
        1.0
    );
    assert_eq!(num(&mut c, "var x = 1; { var x = 2; } x"), 2.0);
}

#[test]
fn const_assignment_is_a_type_error() {
    let mut c = ctx();
    assert!(boolean(
        &mut c,
        "function t(){ const k = 1; try { k = 2; } catch (e) { return e instanceof TypeError; } return false; } t()"
    ));
}

#[test]
fn use_before_let_declaration_is_a_reference_error() {
    let mut c = ctx();
    assert!(boolean(
        &mut c,
        "function t(){ try { probe; } catch (e) { return e instanceof ReferenceError; } return false; } t()"
    ));
}

#[test]
fn strict_mode_rejects_undeclared_assignment() {
    let mut c = ctx();
    let v = eval(&mut c, "'use strict'; phantom_global = 1;");
    assert!(c.value_is_exception(v));
    let err = c.exception_value(v, true);
    let name = c.object_get(err, "name");
    assert_eq!(c.value_as_string_utf8(name), "ReferenceError");
    c.value_free(name);
    c.value_free(err);
}

// ─── exceptions ───────────────────────────────────────────────────────────────

#[test]
fn try_catch_finally_ordering() {
    let mut c = ctx();
    let src = "var x = 0; \
               try { x = 1; throw 'boom'; x = 99; } \
               catch (e) { x = x + 10; } \
               finally { x = x + 100; } \
               x;";
    assert_eq!(num(&mut c, src), 111.0);
}

#[test]
fn return_runs_finally_first() {
    let mut c = ctx();
    let src = "var log = ''; \
               function f() { try { return 'ret'; } finally { log = log + 'fin'; } } \
               f() + log;";
    assert_eq!(text(&mut c, src), "retfin");
}

#[test]
fn finally_rethrows_pending_exception() {
    let mut c = ctx();
    let src = "var seen = ''; \
               function f() { try { throw 'inner'; } finally { seen = 'ran'; } } \
               try { f(); } catch (e) { seen = seen + ':' + e; } \
               seen;";
    assert_eq!(text(&mut c, src), "ran:inner");
}

#[test]
fn catch_binding_is_scoped_to_the_catch_block() {
    let mut c = ctx();
    assert_eq!(
        text(&mut c, "try { throw 'x' } catch (e) { } typeof e"),
        "undefined"
    );
}

#[test]
fn nested_try_picks_innermost_handler() {
    let mut c = ctx();
    let src = "var who = ''; \
               try { try { throw 1; } catch (e) { who = 'inner'; } } \
               catch (e) { who = 'outer'; } \
               who;";
    assert_eq!(text(&mut c, src), "inner");
}

// ─── arrays ───────────────────────────────────────────────────────────────────

#[test]
fn fast_array_grows_and_reports_length() {
    // var a=[];for(let i=0;i<1e4;i++)a[i]=i;a.length → 10000, still fast
    let mut c = ctx();
    let v = eval(&mut c, "var a = []; for (let i = 0; i < 1e4; i++) a[i] = i; a.length");
    assert!(!c.value_is_exception(v));
    assert_eq!(c.value_as_number(v), 10000.0);
    c.value_free(v);

    let arr = c.global_get("a");
    assert!(c.value_is_array(arr));
    assert!(jjs::object::array_is_fast(
        &c,
        jjs::heap::Idx(arr.heap_cp())
    ));
    c.value_free(arr);
}

#[test]
fn escaped_array_reads_identically() {
    let mut c = ctx();
    // A named own property forces the generic encoding; reads are the same.
    let src = "var a = [10, 20, 30]; a.tag = true; a[0] + a[1] + a[2];";
    assert_eq!(num(&mut c, src), 60.0);
    let arr = c.global_get("a");
    assert!(!jjs::object::array_is_fast(
        &c,
        jjs::heap::Idx(arr.heap_cp())
    ));
    c.value_free(arr);
}

#[test]
fn array_builtin_methods() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "[1, 2, 3].indexOf(2)"), 1.0);
    assert_eq!(num(&mut c, "[1, 2, 3].indexOf(9)"), -1.0);
    assert_eq!(text(&mut c, "[1, 2, 3].join('-')"), "1-2-3");
    assert_eq!(num(&mut c, "var a = [1]; a.push(2, 3); a.length"), 3.0);
    assert_eq!(num(&mut c, "var a = [1, 2]; a.pop() + a.length"), 3.0);
    assert_eq!(text(&mut c, "[1, 2, 3, 4].slice(1, 3).join('')"), "23");
    assert_eq!(
        num(&mut c, "var s = 0; [1, 2, 3].forEach(function(v){ s = s + v; }); s"),
        6.0
    );
    assert_eq!(
        text(&mut c, "[1, 2, 3].map(function(v){ return v * 2; }).join(',')"),
        "2,4,6"
    );
    assert!(boolean(&mut c, "[1, 2].every(function(v){ return v > 0; })"));
    assert!(boolean(&mut c, "[1, -2].some(function(v){ return v < 0; })"));
    assert!(boolean(&mut c, "Array.isArray([])"));
    assert!(!boolean(&mut c, "Array.isArray({})"));
    assert_eq!(num(&mut c, "new Array(5).length"), 5.0);
}

#[test]
fn array_holes_are_undefined() {
    let mut c = ctx();
    assert!(boolean(&mut c, "var a = [1, , 3]; a[1] === undefined"));
    assert_eq!(num(&mut c, "[1, , 3].length"), 3.0);
}

// ─── objects ──────────────────────────────────────────────────────────────────

#[test]
fn object_literals_and_member_access() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "({a: 1, b: 2}).b"), 2.0);
    assert_eq!(num(&mut c, "var k = 'dyn'; var o = {[k]: 5}; o.dyn"), 5.0);
    assert_eq!(num(&mut c, "var n = 3; ({n}).n"), 3.0);
    assert_eq!(num(&mut c, "({m: function(){ return 4; }}).m()"), 4.0);
    assert_eq!(num(&mut c, "({m(){ return 8; }}).m()"), 8.0);
    assert_eq!(num(&mut c, "var o = {}; o['x'] = 9; o.x"), 9.0);
}

#[test]
fn prototypes_and_new() {
    let mut c = ctx();
    let src = "function Point(x, y) { this.x = x; this.y = y; } \
               Point.prototype.norm2 = function () { return this.x * this.x + this.y * this.y; }; \
               new Point(3, 4).norm2();";
    assert_eq!(num(&mut c, src), 25.0);
    assert!(boolean(
        &mut c,
        "function A(){}; var a = new A(); a instanceof A"
    ));
}

#[test]
fn object_builtin_routines() {
    let mut c = ctx();
    assert_eq!(text(&mut c, "Object.keys({a: 1, b: 2}).join(',')"), "a,b");
    assert!(boolean(
        &mut c,
        "var o = {}; Object.getPrototypeOf(o) === Object.prototype"
    ));
    assert!(boolean(&mut c, "({x: 1}).hasOwnProperty('x')"));
    assert!(!boolean(&mut c, "({x: 1}).hasOwnProperty('y')"));
    assert!(boolean(
        &mut c,
        "Object.getPrototypeOf(Object.create(null)) === null"
    ));
    assert_eq!(
        num(&mut c, "var o = {}; Object.defineProperty(o, 'g', {get: function(){ return 5; }}); o.g"),
        5.0
    );
    assert!(boolean(
        &mut c,
        "var o = Object.freeze({k: 1}); o.k = 2; o.k === 1"
    ));
}

#[test]
fn accessors_through_define_property() {
    let mut c = ctx();
    let src = "var store = 0; var o = {}; \
               Object.defineProperty(o, 'v', { \
                 get: function () { return store; }, \
                 set: function (x) { store = x * 2; } \
               }); \
               o.v = 21; o.v;";
    assert_eq!(num(&mut c, src), 42.0);
}

#[test]
fn function_call_apply_bind() {
    let mut c = ctx();
    assert_eq!(
        num(&mut c, "function add(a, b){ return a + b; } add.call(null, 1, 2)"),
        3.0
    );
    assert_eq!(
        num(&mut c, "function add(a, b){ return a + b; } add.apply(null, [3, 4])"),
        7.0
    );
    assert_eq!(
        num(&mut c, "function add(a, b){ return a + b; } add.bind(null, 10)(5)"),
        15.0
    );
}

// ─── strings ──────────────────────────────────────────────────────────────────

#[test]
fn string_builtin_methods() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "'hello'.length"), 5.0);
    assert_eq!(text(&mut c, "'hello'.charAt(1)"), "e");
    assert_eq!(num(&mut c, "'abc'.charCodeAt(0)"), 97.0);
    assert_eq!(num(&mut c, "'hello world'.indexOf('world')"), 6.0);
    assert_eq!(text(&mut c, "'hello'.toUpperCase()"), "HELLO");
    assert_eq!(text(&mut c, "'HELLO'.toLowerCase()"), "hello");
    assert_eq!(text(&mut c, "'a,b,c'.split(',').join('|')"), "a|b|c");
    assert_eq!(text(&mut c, "'  pad  '.trim()"), "pad");
    assert_eq!(text(&mut c, "'abcdef'.slice(1, 3)"), "bc");
    assert_eq!(text(&mut c, "'x'[0]"), "x");
    assert_eq!(text(&mut c, "String(42)"), "42");
    assert_eq!(text(&mut c, "String.fromCharCode(74, 83)"), "JS");
}

#[test]
fn math_builtin_routines() {
    let mut c = ctx();
    assert_eq!(num(&mut c, "Math.abs(-4)"), 4.0);
    assert_eq!(num(&mut c, "Math.floor(2.9)"), 2.0);
    assert_eq!(num(&mut c, "Math.ceil(2.1)"), 3.0);
    assert_eq!(num(&mut c, "Math.round(2.5)"), 3.0);
    assert_eq!(num(&mut c, "Math.sqrt(81)"), 9.0);
    assert_eq!(num(&mut c, "Math.pow(2, 8)"), 256.0);
    assert_eq!(num(&mut c, "Math.min(3, 1, 2)"), 1.0);
    assert_eq!(num(&mut c, "Math.max(3, 1, 2)"), 3.0);
    assert!(boolean(&mut c, "Math.random() >= 0 && Math.random() < 1"));
    assert!(boolean(&mut c, "Date.now() > 0"));
}

// ─── optional chaining ────────────────────────────────────────────────────────

#[test]
fn optional_chaining_short_circuits() {
    let mut c = ctx();
    assert!(boolean(&mut c, "var o = null; o?.a === undefined"));
    assert!(boolean(&mut c, "var o = null; o?.a.b.c === undefined"));
    assert_eq!(num(&mut c, "var o = {a: {b: 5}}; o?.a.b"), 5.0);
    assert!(boolean(&mut c, "var o = {}; o.missing?.[0] === undefined"));
}

// ─── generators / async ───────────────────────────────────────────────────────

#[test]
fn generator_yields_in_sequence() {
    let mut c = ctx();
    let src = "function* gen() { yield 1; yield 2; } \
               var g = gen(); \
               var a = g.next(); var b = g.next(); var d = g.next(); \
               '' + a.value + a.done + b.value + b.done + d.done;";
    assert_eq!(text(&mut c, src), "1false2falsetrue");
}

#[test]
fn generator_receives_sent_values() {
    let mut c = ctx();
    let src = "function* echo() { var got = yield 'first'; yield got; } \
               var g = echo(); g.next(); g.next('sent').value;";
    assert_eq!(text(&mut c, src), "sent");
}

#[test]
fn async_function_resolves_through_jobs() {
    // (async()=>{await 1; return 7})() then run_jobs() → fulfilled with 7
    let mut c = ctx();
    let v = eval(&mut c, "(async () => { await 1; return 7; })()");
    assert!(c.value_is_promise(v));
    let jobs_result = c.run_jobs();
    assert!(!c.value_is_exception(jobs_result));
    c.value_free(jobs_result);
    let (state, result) = c.promise_state(v).unwrap();
    assert_eq!(state, jjs::object::PromiseState::Fulfilled);
    assert_eq!(c.value_as_number(result), 7.0);
    c.value_free(v);
}

#[test]
fn async_rejection_is_captured_by_the_promise() {
    let mut c = ctx();
    let v = eval(&mut c, "(async () => { throw 'bad'; })()");
    assert!(c.value_is_promise(v));
    let r = c.run_jobs();
    assert!(!c.value_is_exception(r));
    c.value_free(r);
    let (state, reason) = c.promise_state(v).unwrap();
    assert_eq!(state, jjs::object::PromiseState::Rejected);
    assert_eq!(c.value_as_string_utf8(reason), "bad");
    c.value_free(v);
}

#[test]
fn promise_then_chains() {
    let mut c = ctx();
    let v = eval(
        &mut c,
        "globalThis.out = 0; \
         Promise.resolve(5).then(function (v) { return v * 2; }) \
           .then(function (v) { out = v; }); 0;",
    );
    c.value_free(v);
    let r = c.run_jobs();
    assert!(!c.value_is_exception(r));
    c.value_free(r);
    assert_eq!(num(&mut c, "out"), 10.0);
}

#[test]
fn promise_all_collects_in_order() {
    let mut c = ctx();
    let v = eval(
        &mut c,
        "globalThis.out = ''; \
         Promise.all([Promise.resolve('a'), 'b', Promise.resolve('c')]) \
           .then(function (vs) { out = vs.join(''); }); 0;",
    );
    c.value_free(v);
    let r = c.run_jobs();
    assert!(!c.value_is_exception(r));
    c.value_free(r);
    assert_eq!(text(&mut c, "out"), "abc");
}

// ─── errors ───────────────────────────────────────────────────────────────────

#[test]
fn error_hierarchy_and_instanceof() {
    let mut c = ctx();
    assert!(boolean(&mut c, "new TypeError('t') instanceof TypeError"));
    assert!(boolean(&mut c, "new TypeError('t') instanceof Error"));
    assert!(!boolean(&mut c, "new TypeError('t') instanceof RangeError"));
    assert_eq!(text(&mut c, "new RangeError('r').message"), "r");
    assert_eq!(text(&mut c, "new Error('m') + ''"), "Error: m");
    assert_eq!(
        text(&mut c, "try { null.x } catch (e) { e.name }"),
        "TypeError"
    );
}

// ─── proxies ──────────────────────────────────────────────────────────────────

#[test]
fn proxy_default_behavior_is_transparent() {
    let mut c = ctx();
    let src = "var t = {x: 1}; var p = new Proxy(t, {}); \
               p.x + ('x' in p ? 10 : 0) + ((p.x = 5) === 5 && t.x === 5 ? 100 : 0);";
    assert_eq!(num(&mut c, src), 111.0);
}

#[test]
fn proxy_get_trap_intercepts() {
    let mut c = ctx();
    let src = "var p = new Proxy({}, {get: function (t, k) { return 'got:' + k; }}); p.thing;";
    assert_eq!(text(&mut c, src), "got:thing");
}

#[test]
fn revoked_proxy_throws() {
    let mut c = ctx();
    let src = "var r = Proxy.revocable({k: 1}, {}); \
               var before = r.proxy.k; \
               r.revoke(); \
               var after; \
               try { after = r.proxy.k; } catch (e) { after = 'threw'; } \
               '' + before + ':' + after;";
    assert_eq!(text(&mut c, src), "1:threw");
}
