/// Module Loaders
///
/// Three ways code enters a context besides `parse`:
///   ESM        — module records created per parsed module; `link` resolves
///                the import graph (delegating unknown specifiers to the
///                embedder's resolver callback), `evaluate` runs bodies in
///                dependency order
///   synthetic  — a module whose body is a native callback with a declared
///                export-name set; exports are set before evaluation
///   CommonJS   — `require` resolves through the port (cwd, realpath,
///                read-file), wraps the source in the usual function shell,
///                caches by canonical path and returns `module.exports`
///
/// A pmap (package map) JSON file redirects bare specifiers to files for
/// both loaders, and the vmod registry lets native code claim a specifier
/// outright.
use crate::builtins;
use crate::context::Context;
use crate::errors::ErrorKind;
use crate::heap::{Idx, OptIdx};
use crate::object::{self, ObjectExtra, PropName, PropValue, PROP_ENUMERABLE};
use crate::parser::{self, ParseOptions};
use crate::strings::{self, Magic};
use crate::value::{HeapKind, Value};
use crate::vm;
use serde::Deserialize;
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unlinked,
    Linking,
    Linked,
    Evaluating,
    Evaluated,
    Error,
}

pub type SyntheticEvaluate = dyn Fn(&mut Context, Value) -> Result<Value, Value>;

pub struct SyntheticData {
    pub export_names: Vec<Value>,
    pub exports: Vec<(Value, Value)>,
    pub evaluate: Option<Rc<SyntheticEvaluate>>,
}

pub struct ModuleRecord {
    pub state: ModuleState,
    pub bytecode: OptIdx,
    pub requests: Vec<Value>,
    /// Record index per request, filled during link.
    pub resolved: Vec<Option<u32>>,
    /// (local name, exported name) of a source module.
    pub exports: Vec<(Value, Value)>,
    /// Module environment, set when evaluation starts.
    pub env: OptIdx,
    pub namespace: OptIdx,
    pub synthetic: Option<SyntheticData>,
    pub evaluation_result: Value,
    pub source_path: Value,
}

/// specifier × referrer → module object. The embedder owns resolution
/// policy; the default loader below is used when no callback is installed.
pub type ModuleResolver = dyn Fn(&mut Context, &str, Value) -> Result<Value, Value>;

pub type VmodCallback = dyn Fn(&mut Context) -> Result<Value, Value>;

struct VmodEntry {
    callback: Option<Rc<VmodCallback>>,
    cached: Option<Value>,
}

#[derive(Default)]
pub struct ModuleRegistry {
    pub records: Vec<ModuleRecord>,
    pub resolver: Option<Rc<ModuleResolver>>,
    cjs_cache: HashMap<String, Value>,
    pmap: Option<PackageMap>,
    vmods: HashMap<String, VmodEntry>,
}

impl ModuleRegistry {
    pub fn collect_roots(&self, out: &mut Vec<Idx>) {
        fn push(out: &mut Vec<Idx>, v: Value) {
            if v.is_heap() {
                out.push(Idx(v.heap_cp()));
            } else if v.is_exception() {
                out.push(Idx(v.error_cp()));
            }
        }
        for r in &self.records {
            if let Some(bc) = r.bytecode.get() {
                out.push(bc);
            }
            if let Some(e) = r.env.get() {
                out.push(e);
            }
            if let Some(n) = r.namespace.get() {
                out.push(n);
            }
            for v in &r.requests {
                push(out, *v);
            }
            for (l, e) in &r.exports {
                push(out, *l);
                push(out, *e);
            }
            if let Some(s) = &r.synthetic {
                for v in &s.export_names {
                    push(out, *v);
                }
                for (n, v) in &s.exports {
                    push(out, *n);
                    push(out, *v);
                }
            }
            push(out, r.evaluation_result);
            push(out, r.source_path);
        }
        for v in self.cjs_cache.values() {
            push(out, *v);
        }
        for e in self.vmods.values() {
            if let Some(v) = e.cached {
                push(out, v);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Wrap compiled module bytecode in a module object + record.
pub fn module_from_bytecode(ctx: &mut Context, bc_idx: Idx, source_path: Value) -> Value {
    let bc = ctx.heap.bytecode(bc_idx);
    let (requests, exports) = match &bc.module {
        Some(m) => (m.requests.to_vec(), m.exports.to_vec()),
        None => (Vec::new(), Vec::new()),
    };
    let resolved = vec![None; requests.len()];
    let record = ModuleRecord {
        state: ModuleState::Unlinked,
        bytecode: bc_idx.some(),
        requests,
        resolved,
        exports,
        env: OptIdx::NONE,
        namespace: OptIdx::NONE,
        synthetic: None,
        evaluation_result: Value::UNDEFINED,
        source_path,
    };
    ctx.modules.records.push(record);
    let record_idx = (ctx.modules.records.len() - 1) as u32;
    let proto = ctx.realm.object_prototype;
    object::alloc_object_value(ctx, proto, ObjectExtra::Module { record: record_idx })
}

/// A module whose body is a native callback; exports must come from the
/// declared name set.
pub fn synthetic_module(
    ctx: &mut Context,
    export_names: &[&str],
    evaluate: Option<Rc<SyntheticEvaluate>>,
) -> Value {
    let names: Vec<Value> = export_names
        .iter()
        .map(|n| strings::intern_utf8(ctx, n))
        .collect();
    let record = ModuleRecord {
        state: ModuleState::Linked,
        bytecode: OptIdx::NONE,
        requests: Vec::new(),
        resolved: Vec::new(),
        exports: Vec::new(),
        env: OptIdx::NONE,
        namespace: OptIdx::NONE,
        synthetic: Some(SyntheticData {
            export_names: names,
            exports: Vec::new(),
            evaluate,
        }),
        evaluation_result: Value::UNDEFINED,
        source_path: strings::magic_value(Magic::Anonymous),
    };
    ctx.modules.records.push(record);
    let record_idx = (ctx.modules.records.len() - 1) as u32;
    let proto = ctx.realm.object_prototype;
    object::alloc_object_value(ctx, proto, ObjectExtra::Module { record: record_idx })
}

pub fn module_record_of(ctx: &Context, v: Value) -> Option<u32> {
    if !v.is_object_ref() {
        return None;
    }
    match ctx.heap.object(Idx(v.heap_cp())).extra {
        ObjectExtra::Module { record } => Some(record),
        _ => None,
    }
}

pub fn module_state(ctx: &Context, v: Value) -> Option<ModuleState> {
    module_record_of(ctx, v).map(|r| ctx.modules.records[r as usize].state)
}

/// Pre-evaluation export injection for synthetic modules.
pub fn synthetic_module_set_export(
    ctx: &mut Context,
    module: Value,
    name: &str,
    value: Value,
) -> Result<(), Value> {
    let Some(record) = module_record_of(ctx, module) else {
        return Err(builtins::make_error(ctx, ErrorKind::TypeError, "not a module"));
    };
    let name_v = strings::intern_utf8(ctx, name);
    let rec = &mut ctx.modules.records[record as usize];
    if matches!(rec.state, ModuleState::Evaluating | ModuleState::Evaluated) {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "module has already been evaluated",
        ));
    }
    let Some(synth) = &mut rec.synthetic else {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "not a synthetic module",
        ));
    };
    if !synth.export_names.contains(&name_v) {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::ReferenceError,
            "export name was not declared",
        ));
    }
    if let Some(slot) = synth.exports.iter_mut().find(|(n, _)| *n == name_v) {
        slot.1 = value;
    } else {
        synth.exports.push((name_v, value));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Link & evaluate
// ---------------------------------------------------------------------------

fn module_error(ctx: &mut Context, msg: &str) -> Value {
    builtins::make_error(ctx, ErrorKind::SyntaxError, msg)
}

/// Resolve every import request of the graph rooted at `module`.
pub fn link(ctx: &mut Context, module: Value) -> Result<(), Value> {
    let Some(record) = module_record_of(ctx, module) else {
        return Err(builtins::make_error(ctx, ErrorKind::TypeError, "not a module"));
    };
    link_record(ctx, record, module)
}

fn link_record(ctx: &mut Context, record: u32, module: Value) -> Result<(), Value> {
    match ctx.modules.records[record as usize].state {
        ModuleState::Unlinked => {}
        // Linking: a cycle back-edge; linked and beyond need no work.
        _ => return Ok(()),
    }
    ctx.modules.records[record as usize].state = ModuleState::Linking;

    let requests: Vec<Value> = ctx.modules.records[record as usize].requests.clone();
    for (i, request) in requests.iter().enumerate() {
        let specifier = strings::to_rust_string(ctx, *request);
        let dep = resolve_specifier(ctx, &specifier, module)?;
        let Some(dep_record) = module_record_of(ctx, dep) else {
            return Err(module_error(ctx, "resolver did not return a module"));
        };
        ctx.modules.records[record as usize].resolved[i] = Some(dep_record);
        link_record(ctx, dep_record, dep)?;
    }
    ctx.modules.records[record as usize].state = ModuleState::Linked;
    Ok(())
}

/// Specifier → module object: vmod claim, embedder resolver, then the
/// default port-backed file loader with pmap redirection.
fn resolve_specifier(ctx: &mut Context, specifier: &str, referrer: Value) -> Result<Value, Value> {
    if let Some(resolver) = ctx.modules.resolver.clone() {
        return resolver(ctx, specifier, referrer);
    }
    let path = match pmap_lookup(ctx, specifier) {
        Some(p) => p,
        None => specifier.to_string(),
    };
    let real = ctx
        .port()
        .path_realpath(&path)
        .unwrap_or_else(|| path.clone());
    let Some(bytes) = ctx.port().fs_read_file(&real) else {
        let msg = format!("module not found: {}", specifier);
        return Err(module_error(ctx, &msg));
    };
    let source = String::from_utf8_lossy(&bytes).into_owned();
    let opts = ParseOptions {
        module: true,
        source_name: Some(real.clone()),
        ..Default::default()
    };
    let bc = parser::parse_source(ctx, &source, &opts).map_err(|e| {
        let msg = format!("{}", e);
        builtins::make_error(ctx, ErrorKind::SyntaxError, &msg)
    })?;
    let mark = ctx.roots_mark();
    ctx.root(bc.value(HeapKind::ByteCode));
    let path_v = strings::intern_utf8(ctx, &real);
    let module = module_from_bytecode(ctx, bc, path_v);
    ctx.roots_release(mark);
    Ok(module)
}

/// Run module bodies in dependency order; returns the root body's
/// completion value.
pub fn evaluate(ctx: &mut Context, module: Value) -> Result<Value, Value> {
    let Some(record) = module_record_of(ctx, module) else {
        return Err(builtins::make_error(ctx, ErrorKind::TypeError, "not a module"));
    };
    evaluate_record(ctx, record, module)
}

fn evaluate_record(ctx: &mut Context, record: u32, module: Value) -> Result<Value, Value> {
    match ctx.modules.records[record as usize].state {
        ModuleState::Linked => {}
        ModuleState::Evaluated => {
            return Ok(ctx.modules.records[record as usize].evaluation_result)
        }
        ModuleState::Evaluating => return Ok(Value::UNDEFINED), // cycle back-edge
        ModuleState::Error => {
            return Err(ctx.modules.records[record as usize].evaluation_result)
        }
        _ => {
            return Err(builtins::make_error(
                ctx,
                ErrorKind::TypeError,
                "module must be linked before evaluation",
            ))
        }
    }
    ctx.modules.records[record as usize].state = ModuleState::Evaluating;

    // dependencies first
    let resolved: Vec<Option<u32>> = ctx.modules.records[record as usize].resolved.clone();
    for dep in resolved.into_iter().flatten() {
        // The dep's own module object is not needed for evaluation.
        let dep_module = Value::UNDEFINED;
        if let Err(e) = evaluate_record(ctx, dep, dep_module) {
            ctx.modules.records[record as usize].state = ModuleState::Error;
            ctx.modules.records[record as usize].evaluation_result = e;
            return Err(e);
        }
    }

    let result = match ctx.modules.records[record as usize].bytecode.get() {
        Some(bc) => vm::run_program(ctx, bc, Value::UNDEFINED, Some(record)),
        None => {
            // synthetic body
            let cb = ctx.modules.records[record as usize]
                .synthetic
                .as_ref()
                .and_then(|s| s.evaluate.clone());
            match cb {
                Some(cb) => cb(ctx, module),
                None => Ok(Value::UNDEFINED),
            }
        }
    };
    match result {
        Ok(v) => {
            let rec = &mut ctx.modules.records[record as usize];
            rec.state = ModuleState::Evaluated;
            rec.evaluation_result = v;
            Ok(v)
        }
        Err(e) => {
            let rec = &mut ctx.modules.records[record as usize];
            rec.state = ModuleState::Error;
            rec.evaluation_result = e;
            Err(e)
        }
    }
}

/// Called from the VM prologue so import bindings can find the module's
/// environment.
pub fn set_module_env(ctx: &mut Context, record: u32, env: Idx) {
    ctx.modules.records[record as usize].env = env.some();
}

/// Value of one import: looks through the request to the peer module's
/// export bindings.
pub fn get_import_value(
    ctx: &mut Context,
    record: u32,
    request: u8,
    export_name: Value,
) -> Result<Value, Value> {
    let peer = ctx.modules.records[record as usize]
        .resolved
        .get(request as usize)
        .copied()
        .flatten();
    let Some(peer) = peer else {
        return Err(module_error(ctx, "unresolved module request"));
    };
    export_value(ctx, peer, export_name)
}

fn export_value(ctx: &mut Context, record: u32, export_name: Value) -> Result<Value, Value> {
    // synthetic exports
    let synth_hit = ctx.modules.records[record as usize]
        .synthetic
        .as_ref()
        .and_then(|s| {
            s.exports
                .iter()
                .find(|(n, _)| *n == export_name)
                .map(|(_, v)| *v)
        });
    if let Some(v) = synth_hit {
        return Ok(v);
    }
    if ctx.modules.records[record as usize].synthetic.is_some() {
        let name = strings::to_rust_string(ctx, export_name);
        let msg = format!("module does not provide an export named '{}'", name);
        return Err(module_error(ctx, &msg));
    }

    // source module: exported name → local binding in the module env
    let local = ctx.modules.records[record as usize]
        .exports
        .iter()
        .find(|(_, exported)| *exported == export_name)
        .map(|(local, _)| *local);
    let Some(local) = local else {
        let name = strings::to_rust_string(ctx, export_name);
        let msg = format!("module does not provide an export named '{}'", name);
        return Err(module_error(ctx, &msg));
    };
    let Some(env) = ctx.modules.records[record as usize].env.get() else {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::ReferenceError,
            "cannot access module binding before evaluation",
        ));
    };
    match crate::env::resolve(ctx, env.some(), local) {
        Some((e, pos)) if pos != usize::MAX => {
            let b = crate::env::read_binding(ctx, e, pos);
            if !b.initialized {
                return Err(builtins::make_error(
                    ctx,
                    ErrorKind::ReferenceError,
                    "module binding is not initialized",
                ));
            }
            Ok(b.value)
        }
        _ => Err(builtins::make_error(
            ctx,
            ErrorKind::ReferenceError,
            "module binding not found",
        )),
    }
}

/// Namespace exotic object of the peer behind a request, built on demand.
pub fn get_namespace_value(ctx: &mut Context, record: u32, request: u8) -> Result<Value, Value> {
    let peer = ctx.modules.records[record as usize]
        .resolved
        .get(request as usize)
        .copied()
        .flatten();
    let Some(peer) = peer else {
        return Err(module_error(ctx, "unresolved module request"));
    };
    if let Some(ns) = ctx.modules.records[peer as usize].namespace.get() {
        return Ok(ns.value(HeapKind::Object));
    }
    let export_names: Vec<Value> = match &ctx.modules.records[peer as usize].synthetic {
        Some(s) => s.export_names.clone(),
        None => ctx.modules.records[peer as usize]
            .exports
            .iter()
            .map(|(_, exported)| *exported)
            .collect(),
    };
    let ns = object::alloc_object(
        ctx,
        OptIdx::NONE,
        ObjectExtra::Namespace { record: peer },
    );
    ctx.modules.records[peer as usize].namespace = ns.some();
    for name in export_names {
        let v = export_value(ctx, peer, name)?;
        let bytes = strings::bytes_of(ctx, name);
        let pname = object::prop_name_from_bytes(ctx, &bytes);
        object::add_own(ctx, ns, pname, PROP_ENUMERABLE, PropValue::Data(v));
    }
    Ok(ns.value(HeapKind::Object))
}

// ---------------------------------------------------------------------------
// pmap
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PmapFile {
    packages: HashMap<String, PmapTarget>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PmapTarget {
    Path(String),
    Object { main: String },
}

#[derive(Debug, Default)]
pub struct PackageMap {
    root: String,
    packages: HashMap<String, String>,
}

/// Install a package map from JSON text. `root` prefixes relative targets.
pub fn pmap_from_json(ctx: &mut Context, json: &str, root: &str) -> Result<(), Value> {
    let parsed: PmapFile = serde_json::from_str(json).map_err(|e| {
        let msg = format!("invalid pmap: {}", e);
        builtins::make_error(ctx, ErrorKind::TypeError, &msg)
    })?;
    let mut packages = HashMap::new();
    for (name, target) in parsed.packages {
        let path = match target {
            PmapTarget::Path(p) => p,
            PmapTarget::Object { main } => main,
        };
        packages.insert(name, path);
    }
    ctx.modules.pmap = Some(PackageMap {
        root: root.to_string(),
        packages,
    });
    Ok(())
}

/// Load a package map file through the port.
pub fn pmap_load(ctx: &mut Context, path: &str) -> Result<(), Value> {
    let Some(bytes) = ctx.port().fs_read_file(path) else {
        let msg = format!("cannot read pmap file: {}", path);
        return Err(builtins::make_error(ctx, ErrorKind::TypeError, &msg));
    };
    let json = String::from_utf8_lossy(&bytes).into_owned();
    let root = match path.rfind('/') {
        Some(i) => path[..i].to_string(),
        None => String::new(),
    };
    pmap_from_json(ctx, &json, &root)
}

fn pmap_lookup(ctx: &Context, specifier: &str) -> Option<String> {
    let pmap = ctx.modules.pmap.as_ref()?;
    let target = pmap.packages.get(specifier)?;
    if pmap.root.is_empty() || target.starts_with('/') {
        Some(target.clone())
    } else {
        Some(format!("{}/{}", pmap.root, target))
    }
}

// ---------------------------------------------------------------------------
// vmod
// ---------------------------------------------------------------------------

/// Claim a specifier with a native callback producing the exports object.
/// The callback runs at most once per context; the result is cached.
pub fn vmod_register(ctx: &mut Context, name: &str, callback: Rc<VmodCallback>) {
    ctx.modules.vmods.insert(
        name.to_string(),
        VmodEntry {
            callback: Some(callback),
            cached: None,
        },
    );
}

pub fn vmod_exists(ctx: &Context, name: &str) -> bool {
    ctx.modules.vmods.contains_key(name)
}

pub fn vmod_remove(ctx: &mut Context, name: &str) {
    ctx.modules.vmods.remove(name);
}

fn vmod_exports(ctx: &mut Context, name: &str) -> Option<Result<Value, Value>> {
    let entry = ctx.modules.vmods.get(name)?;
    if let Some(v) = entry.cached {
        return Some(Ok(v));
    }
    let cb = entry.callback.clone()?;
    let result = cb(ctx);
    if let Ok(v) = result {
        if let Some(entry) = ctx.modules.vmods.get_mut(name) {
            entry.cached = Some(v);
        }
        return Some(Ok(v));
    }
    Some(result)
}

// ---------------------------------------------------------------------------
// CommonJS
// ---------------------------------------------------------------------------

/// `require(specifier)` relative to `referrer_dir` (current working
/// directory when absent).
pub fn cjs_require(
    ctx: &mut Context,
    specifier: &str,
    referrer_dir: Option<&str>,
) -> Result<Value, Value> {
    // vmod claims win outright
    if vmod_exists(ctx, specifier) {
        if let Some(result) = vmod_exports(ctx, specifier) {
            return result;
        }
    }

    let mapped = pmap_lookup(ctx, specifier);
    let path = match mapped {
        Some(p) => p,
        None => {
            if specifier.starts_with("./") || specifier.starts_with("../") {
                let base = match referrer_dir {
                    Some(d) => d.to_string(),
                    None => ctx.port().cwd().unwrap_or_default(),
                };
                if base.is_empty() {
                    specifier.to_string()
                } else {
                    format!("{}/{}", base, specifier)
                }
            } else {
                specifier.to_string()
            }
        }
    };
    let real = ctx
        .port()
        .path_realpath(&path)
        .unwrap_or_else(|| path.clone());

    if let Some(cached) = ctx.modules.cjs_cache.get(&real).copied() {
        return Ok(cached);
    }

    let Some(bytes) = ctx.port().fs_read_file(&real) else {
        let msg = format!("cannot find module '{}'", specifier);
        return Err(builtins::make_error(ctx, ErrorKind::TypeError, &msg));
    };
    let source = String::from_utf8_lossy(&bytes).into_owned();

    // The usual CommonJS shell; the script's completion value is the shell
    // function itself.
    let wrapped = format!(
        "(function (module, exports, require, __filename, __dirname) {{\n{}\n}})",
        source
    );
    let opts = ParseOptions {
        source_name: Some(real.clone()),
        ..Default::default()
    };
    let bc = parser::parse_source(ctx, &wrapped, &opts).map_err(|e| {
        let msg = format!("{}", e);
        builtins::make_error(ctx, ErrorKind::SyntaxError, &msg)
    })?;
    let shell = vm::run_program(ctx, bc, Value::UNDEFINED, None)?;

    let mark = ctx.roots_mark();
    ctx.root(shell);

    // module object with a fresh exports object
    let obj_proto = ctx.realm.object_prototype;
    let exports = object::alloc_object_value(ctx, obj_proto, ObjectExtra::None);
    ctx.root(exports);
    let module_obj = object::alloc_object_value(ctx, obj_proto, ObjectExtra::None);
    ctx.root(module_obj);
    object::add_own(
        ctx,
        Idx(module_obj.heap_cp()),
        PropName::Magic(Magic::Exports as u16),
        object::PROP_FLAGS_DEFAULT,
        PropValue::Data(exports),
    );

    // Cache before running the body so require cycles see the partial
    // exports.
    ctx.modules.cjs_cache.insert(real.clone(), exports);

    let dir = match real.rfind('/') {
        Some(i) => real[..i].to_string(),
        None => String::new(),
    };
    let require_fn = make_require_fn(ctx, &dir);
    ctx.root(require_fn);
    let filename = strings::alloc_utf8(ctx, &real);
    ctx.root(filename);
    let dirname = strings::alloc_utf8(ctx, &dir);
    ctx.root(dirname);

    let run = vm::call_function(
        ctx,
        shell,
        Value::UNDEFINED,
        &[module_obj, exports, require_fn, filename, dirname],
    );
    if let Err(e) = run {
        ctx.modules.cjs_cache.remove(&real);
        ctx.roots_release(mark);
        return Err(e);
    }

    // module.exports may have been replaced
    let final_exports = builtins::op_get_property_name(
        ctx,
        module_obj,
        PropName::Magic(Magic::Exports as u16),
    )?;
    let final_exports = if final_exports.is_not_found() {
        exports
    } else {
        final_exports
    };
    ctx.modules.cjs_cache.insert(real, final_exports);
    ctx.roots_release(mark);
    Ok(final_exports)
}

/// The `require` function value handed to CJS module shells; carries its
/// directory as a bound argument.
pub fn make_require_fn(ctx: &mut Context, dir: &str) -> Value {
    let routine = object::alloc_routine(
        ctx,
        crate::builtins::BuiltinId::Global,
        crate::builtins::routine_ids::global::REQUIRE,
    );
    let mark = ctx.roots_mark();
    ctx.root(routine);
    let dir_v = strings::alloc_utf8(ctx, dir);
    ctx.root(dir_v);
    let proto = ctx.realm.function_prototype;
    let bound = object::alloc_object_value(
        ctx,
        proto,
        ObjectExtra::Bound {
            target: routine,
            this_value: Value::UNDEFINED,
            args: vec![dir_v].into_boxed_slice(),
        },
    );
    ctx.roots_release(mark);
    bound
}

/// Routine body behind `require`: bound form receives (dir, specifier),
/// the global form just (specifier).
pub fn require_routine(ctx: &mut Context, args: &[Value]) -> Result<Value, Value> {
    let (dir, spec_v) = if args.len() >= 2 && args[0].is_string() {
        (Some(args[0]), args[1])
    } else {
        (None, args.first().copied().unwrap_or(Value::UNDEFINED))
    };
    if !spec_v.is_string() {
        return Err(builtins::make_error(
            ctx,
            ErrorKind::TypeError,
            "require expects a specifier string",
        ));
    }
    let specifier = strings::to_rust_string(ctx, spec_v);
    let dir_string = dir.map(|d| strings::to_rust_string(ctx, d));
    cjs_require(ctx, &specifier, dir_string.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_module_exports_flow() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let m = synthetic_module(&mut ctx, &["five"], None);
        synthetic_module_set_export(&mut ctx, m, "five", Value::from_i30(5)).unwrap();
        // undeclared names are rejected
        assert!(synthetic_module_set_export(&mut ctx, m, "six", Value::from_i30(6)).is_err());
        link(&mut ctx, m).unwrap();
        evaluate(&mut ctx, m).unwrap();
        let record = module_record_of(&ctx, m).unwrap();
        let name = strings::intern_utf8(&mut ctx, "five");
        let v = export_value(&mut ctx, record, name).unwrap();
        assert_eq!(v, Value::from_i30(5));
    }

    #[test]
    fn set_export_after_evaluation_fails() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let m = synthetic_module(&mut ctx, &["x"], None);
        link(&mut ctx, m).unwrap();
        evaluate(&mut ctx, m).unwrap();
        assert!(synthetic_module_set_export(&mut ctx, m, "x", Value::TRUE).is_err());
    }

    #[test]
    fn pmap_shapes() {
        let mut ctx = Context::new(Default::default()).unwrap();
        pmap_from_json(
            &mut ctx,
            r#"{"packages": {"a": "./a.js", "b": {"main": "lib/b.js"}}}"#,
            "/proj",
        )
        .unwrap();
        assert_eq!(pmap_lookup(&ctx, "a"), Some("/proj/./a.js".to_string()));
        assert_eq!(pmap_lookup(&ctx, "b"), Some("/proj/lib/b.js".to_string()));
        assert_eq!(pmap_lookup(&ctx, "c"), None);
        // bad shape is a TypeError value
        assert!(pmap_from_json(&mut ctx, r#"{"packages": 3}"#, "").is_err());
    }

    #[test]
    fn vmod_claims_and_caches() {
        use std::cell::Cell;
        let mut ctx = Context::new(Default::default()).unwrap();
        let calls = Rc::new(Cell::new(0));
        let calls2 = Rc::clone(&calls);
        vmod_register(
            &mut ctx,
            "native:config",
            Rc::new(move |ctx: &mut Context| {
                calls2.set(calls2.get() + 1);
                let proto = ctx.realm.object_prototype;
                Ok(object::alloc_object_value(ctx, proto, ObjectExtra::None))
            }),
        );
        assert!(vmod_exists(&ctx, "native:config"));
        let a = cjs_require(&mut ctx, "native:config", None).unwrap();
        let b = cjs_require(&mut ctx, "native:config", None).unwrap();
        assert_eq!(a, b);
        assert_eq!(calls.get(), 1);
        vmod_remove(&mut ctx, "native:config");
        assert!(!vmod_exists(&ctx, "native:config"));
    }

    #[test]
    fn evaluating_unlinked_module_fails() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let opts = ParseOptions {
            module: true,
            ..Default::default()
        };
        let bc = parser::parse_source(&mut ctx, "export const x = 1;", &opts).unwrap();
        let name = strings::magic_value(Magic::Anonymous);
        let m = module_from_bytecode(&mut ctx, bc, name);
        assert!(evaluate(&mut ctx, m).is_err());
        link(&mut ctx, m).unwrap();
        evaluate(&mut ctx, m).unwrap();
        assert_eq!(module_state(&ctx, m), Some(ModuleState::Evaluated));
    }
}
