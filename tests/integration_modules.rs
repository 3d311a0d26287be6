/// Integration tests for the module loaders.
///
/// These tests verify:
///   • ESM parse → link → evaluate with an embedder resolver
///   • synthetic modules: declared exports, set_export before evaluation
///   • namespace imports
///   • CommonJS require through the port, caching, module.exports swap
///   • pmap redirection and the vmod registry
use jjs::parser::ParseOptions;
use jjs::{Context, Value};
use std::rc::Rc;

fn ctx() -> Context {
    Context::new(Default::default()).unwrap()
}

fn module_opts() -> ParseOptions {
    ParseOptions {
        module: true,
        ..Default::default()
    }
}

// ─── ESM + synthetic ──────────────────────────────────────────────────────────

#[test]
fn import_from_synthetic_module() {
    // parse(A, module) → link → evaluate where A imports a synthetic module
    // exporting five=5; body "import {five} from 'synthetic'; five" → 5
    let mut c = ctx();
    let synthetic = c.synthetic_module(&["five"], None);
    let five = c.value_number(5.0);
    let ok = c.synthetic_module_set_export(synthetic, "five", five);
    assert!(!c.value_is_exception(ok));
    c.value_free(ok);
    c.value_free(five);

    let synthetic_for_resolver = c.value_copy(synthetic);
    c.module_resolver_set(Rc::new(move |ctx: &mut Context, specifier, _referrer| {
        assert_eq!(specifier, "synthetic");
        Ok(ctx.value_copy(synthetic_for_resolver))
    }));

    let module = c.parse("import { five } from 'synthetic'; five;", &module_opts());
    assert!(!c.value_is_exception(module));
    let linked = c.module_link(module);
    assert!(!c.value_is_exception(linked));
    c.value_free(linked);
    let result = c.module_evaluate(module);
    assert!(!c.value_is_exception(result));
    assert_eq!(c.value_as_number(result), 5.0);
    c.value_free(result);
    c.value_free(module);
    c.value_free(synthetic);
}

#[test]
fn module_exports_are_visible_to_importers() {
    let mut c = ctx();
    let dep = c.parse(
        "export const ten = 10; export function double(x) { return x * 2; }",
        &module_opts(),
    );
    assert!(!c.value_is_exception(dep));
    let dep_for_resolver = c.value_copy(dep);
    c.module_resolver_set(Rc::new(move |ctx: &mut Context, _spec, _ref| {
        Ok(ctx.value_copy(dep_for_resolver))
    }));

    let main = c.parse(
        "import { ten, double } from 'dep'; double(ten) + 1;",
        &module_opts(),
    );
    assert!(!c.value_is_exception(main));
    let linked = c.module_link(main);
    assert!(!c.value_is_exception(linked));
    c.value_free(linked);
    let result = c.module_evaluate(main);
    assert!(!c.value_is_exception(result));
    assert_eq!(c.value_as_number(result), 21.0);
    c.value_free(result);
    c.value_free(main);
    c.value_free(dep);
}

#[test]
fn namespace_import_exposes_exports() {
    let mut c = ctx();
    let synthetic = c.synthetic_module(&["a", "b"], None);
    for (name, n) in [("a", 1.0), ("b", 2.0)] {
        let v = c.value_number(n);
        let ok = c.synthetic_module_set_export(synthetic, name, v);
        c.value_free(ok);
        c.value_free(v);
    }
    let synthetic_for_resolver = c.value_copy(synthetic);
    c.module_resolver_set(Rc::new(move |ctx: &mut Context, _spec, _ref| {
        Ok(ctx.value_copy(synthetic_for_resolver))
    }));

    let main = c.parse("import * as ns from 'm'; ns.a + ns.b;", &module_opts());
    assert!(!c.value_is_exception(main));
    let linked = c.module_link(main);
    c.value_free(linked);
    let result = c.module_evaluate(main);
    assert!(!c.value_is_exception(result));
    assert_eq!(c.value_as_number(result), 3.0);
    c.value_free(result);
    c.value_free(main);
    c.value_free(synthetic);
}

#[test]
fn default_export_round_trip() {
    let mut c = ctx();
    let dep = c.parse("export default 99;", &module_opts());
    let dep_for_resolver = c.value_copy(dep);
    c.module_resolver_set(Rc::new(move |ctx: &mut Context, _spec, _ref| {
        Ok(ctx.value_copy(dep_for_resolver))
    }));
    let main = c.parse("import d from 'dep'; d;", &module_opts());
    let linked = c.module_link(main);
    c.value_free(linked);
    let result = c.module_evaluate(main);
    assert!(!c.value_is_exception(result));
    assert_eq!(c.value_as_number(result), 99.0);
    c.value_free(result);
    c.value_free(main);
    c.value_free(dep);
}

#[test]
fn synthetic_evaluate_callback_runs_once() {
    use std::cell::Cell;
    let mut c = ctx();
    let runs = Rc::new(Cell::new(0u32));
    let runs2 = Rc::clone(&runs);
    let m = c.synthetic_module(
        &[],
        Some(Rc::new(move |_ctx: &mut Context, _module: Value| {
            runs2.set(runs2.get() + 1);
            Ok(Value::UNDEFINED)
        })),
    );
    let linked = c.module_link(m);
    c.value_free(linked);
    let a = c.module_evaluate(m);
    let b = c.module_evaluate(m);
    c.value_free(a);
    c.value_free(b);
    assert_eq!(runs.get(), 1);
    c.value_free(m);
}

// ─── CommonJS ─────────────────────────────────────────────────────────────────

fn write_temp_module(name: &str, source: &str) -> String {
    let dir = std::env::temp_dir().join("jjs-tests");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, source).unwrap();
    path.into_os_string().into_string().unwrap()
}

#[test]
fn require_loads_and_caches() {
    let mut c = ctx();
    let path = write_temp_module(
        "cjs_basic.js",
        "module.exports = { five: 5, stamp: Math.random() };",
    );
    let a = c.require(&path);
    assert!(!c.value_is_exception(a));
    let five = c.object_get(a, "five");
    assert_eq!(c.value_as_number(five), 5.0);
    c.value_free(five);

    // Second require resolves to the same cached exports object.
    let b = c.require(&path);
    let s1 = c.object_get(a, "stamp");
    let s2 = c.object_get(b, "stamp");
    assert_eq!(c.value_as_number(s1), c.value_as_number(s2));
    c.value_free(s1);
    c.value_free(s2);
    c.value_free(a);
    c.value_free(b);
}

#[test]
fn require_exposes_filename_and_exports_object() {
    let mut c = ctx();
    let path = write_temp_module(
        "cjs_meta.js",
        "exports.file = __filename; exports.dir = __dirname;",
    );
    let m = c.require(&path);
    assert!(!c.value_is_exception(m));
    let file = c.object_get(m, "file");
    assert!(c.value_as_string_utf8(file).ends_with("cjs_meta.js"));
    c.value_free(file);
    let dir = c.object_get(m, "dir");
    assert!(!c.value_as_string_utf8(dir).is_empty());
    c.value_free(dir);
    c.value_free(m);
}

#[test]
fn require_propagates_module_errors() {
    let mut c = ctx();
    let path = write_temp_module("cjs_throws.js", "throw new TypeError('broken module');");
    let r = c.require(&path);
    assert!(c.value_is_exception(r));
    let err = c.exception_value(r, true);
    let msg = c.object_get(err, "message");
    assert_eq!(c.value_as_string_utf8(msg), "broken module");
    c.value_free(msg);
    c.value_free(err);
}

#[test]
fn require_missing_module_is_a_type_error() {
    let mut c = ctx();
    let r = c.require("/no/such/module/anywhere.js");
    assert!(c.value_is_exception(r));
    c.value_free(r);
}

// ─── pmap / vmod ──────────────────────────────────────────────────────────────

#[test]
fn pmap_redirects_bare_specifiers() {
    let mut c = ctx();
    let path = write_temp_module("pmap_target.js", "module.exports = { tag: 'from-pmap' };");
    let dir = std::path::Path::new(&path)
        .parent()
        .unwrap()
        .to_string_lossy()
        .into_owned();
    let json = r#"{"packages": {"widgets": "pmap_target.js"}}"#;
    let ok = c.pmap_from_json(json, &dir);
    assert!(!c.value_is_exception(ok));
    c.value_free(ok);

    let m = c.require("widgets");
    assert!(!c.value_is_exception(m));
    let tag = c.object_get(m, "tag");
    assert_eq!(c.value_as_string_utf8(tag), "from-pmap");
    c.value_free(tag);
    c.value_free(m);
}

#[test]
fn bad_pmap_shape_is_rejected() {
    let mut c = ctx();
    let bad = c.pmap_from_json(r#"{"packages": [1, 2]}"#, "");
    assert!(c.value_is_exception(bad));
    c.value_free(bad);
}

#[test]
fn vmod_claims_specifier_for_require() {
    use std::cell::Cell;
    let mut c = ctx();
    let builds = Rc::new(Cell::new(0u32));
    let builds2 = Rc::clone(&builds);
    c.vmod(
        "native:info",
        Rc::new(move |ctx: &mut Context| {
            builds2.set(builds2.get() + 1);
            let exports = ctx.value_object();
            let version = ctx.value_number(3.0);
            let ok = ctx.object_set(exports, "version", version);
            ctx.value_free(ok);
            ctx.value_free(version);
            Ok(exports)
        }),
    );
    assert!(c.vmod_exists("native:info"));

    let a = c.require("native:info");
    let b = c.require("native:info");
    assert!(!c.value_is_exception(a));
    let v = c.object_get(a, "version");
    assert_eq!(c.value_as_number(v), 3.0);
    c.value_free(v);
    assert_eq!(builds.get(), 1, "vmod callback runs once and is cached");
    c.value_free(a);
    c.value_free(b);

    c.vmod_remove("native:info");
    assert!(!c.vmod_exists("native:info"));
}

#[test]
fn require_is_reachable_from_script() {
    let mut c = ctx();
    c.vmod(
        "cfg",
        Rc::new(|ctx: &mut Context| {
            let exports = ctx.value_object();
            let n = ctx.value_number(12.0);
            let ok = ctx.object_set(exports, "n", n);
            ctx.value_free(ok);
            ctx.value_free(n);
            Ok(exports)
        }),
    );
    let script = c.parse("require('cfg').n * 2;", &ParseOptions::default());
    assert!(!c.value_is_exception(script));
    let r = c.run(script);
    assert!(!c.value_is_exception(r));
    assert_eq!(c.value_as_number(r), 24.0);
    c.value_free(r);
    c.value_free(script);
}
