/// Public API — Handles & Ownership
///
/// API values are the same 32-bit words the engine uses internally, but
/// every value returned across this boundary carries an owning reference:
/// the embedder calls `value_free` exactly once per returned handle (or
/// `value_copy` to take another). Failure never surfaces as a Rust error:
/// any API call that can fail returns an error-marked value wrapping the
/// thrown value; `value_is_exception` queries, `exception_value` unwraps,
/// `throw_value`/`throw_abort` wrap. Aborts are uncatchable by script and
/// propagate to the outermost call; the context stays usable afterwards.
use crate::builtins;
use crate::context::{Context, NativeCallback};
use crate::errors::ErrorKind;
use crate::gc::{self, Pressure};
use crate::heap::{self, CellData, ErrorRefCell, Idx, OptIdx};
use crate::jobs;
use crate::module::{self, ModuleResolver, SyntheticEvaluate, VmodCallback};
use crate::object::{self, ObjectExtra, PromiseState};
use crate::parser::{self, ParseOptions};
use crate::snapshot;
use crate::strings;
use crate::value::{HeapKind, Value};
use crate::vm::{self, HaltCallback, ThrowCallback};
use std::rc::Rc;

impl Context {
    // -----------------------------------------------------------------------
    // Handle ownership
    // -----------------------------------------------------------------------

    /// Pin a value about to cross the API boundary.
    fn acquire(&mut self, v: Value) -> Value {
        let idx = if v.is_heap() {
            Some(Idx(v.heap_cp()))
        } else if v.is_exception() {
            Some(Idx(v.error_cp()))
        } else {
            None
        };
        if let Some(idx) = idx {
            if self.heap.ref_inc(idx).is_err() {
                let port = self.port();
                port.fatal(crate::errors::FatalCode::RefCountLimit);
            }
        }
        v
    }

    /// Release one owning reference.
    pub fn value_free(&mut self, v: Value) {
        if v.is_heap() {
            self.heap.ref_dec(Idx(v.heap_cp()));
        } else if v.is_exception() {
            self.heap.ref_dec(Idx(v.error_cp()));
        }
    }

    /// Take an additional owning reference.
    pub fn value_copy(&mut self, v: Value) -> Value {
        self.acquire(v)
    }

    /// Wrap an internal result for the boundary: `Err` becomes an
    /// error-marked value, aborts keep their flavour.
    fn boundary(&mut self, result: Result<Value, Value>) -> Value {
        match result {
            Ok(v) => self.acquire(v),
            Err(thrown) => {
                let abort = self.vm.abort_in_flight;
                self.vm.abort_in_flight = false;
                let marked = self.exception_from(thrown, abort);
                self.acquire(marked)
            }
        }
    }

    fn exception_from(&mut self, thrown: Value, abort: bool) -> Value {
        // The thrown value has no other root while the wrapper cell is
        // allocated.
        let mark = self.roots_mark();
        self.root(thrown);
        let idx = heap::alloc(
            self,
            CellData::ErrorRef(ErrorRefCell {
                value: thrown,
                abort,
                hook_seen: false,
            }),
        );
        self.roots_release(mark);
        Value::error_ref(idx.0)
    }

    // -----------------------------------------------------------------------
    // Exceptions
    // -----------------------------------------------------------------------

    pub fn value_is_exception(&self, v: Value) -> bool {
        v.is_exception()
    }

    pub fn value_is_abort(&self, v: Value) -> bool {
        v.is_exception() && self.heap.error_ref(Idx(v.error_cp())).abort
    }

    /// Unwrap the thrown value behind an error-marked value. With `take`,
    /// the exception handle is released in the same call.
    pub fn exception_value(&mut self, v: Value, take: bool) -> Value {
        if !v.is_exception() {
            return self.acquire(v);
        }
        let inner = self.heap.error_ref(Idx(v.error_cp())).value;
        let out = self.acquire(inner);
        if take {
            self.value_free(v);
        }
        out
    }

    /// Mark any value as thrown.
    pub fn throw_value(&mut self, v: Value) -> Value {
        let marked = self.exception_from(v, false);
        self.acquire(marked)
    }

    /// Mark any value as an uncatchable abort.
    pub fn throw_abort(&mut self, v: Value) -> Value {
        let marked = self.exception_from(v, true);
        self.acquire(marked)
    }

    /// Build a standard error and return it error-marked.
    pub fn throw_sz(&mut self, kind: ErrorKind, message: &str) -> Value {
        let err = builtins::make_error(self, kind, message);
        let marked = self.exception_from(err, false);
        self.acquire(marked)
    }

    // -----------------------------------------------------------------------
    // Parse / run / call
    // -----------------------------------------------------------------------

    /// Compile source text. Returns a reusable script (or module) value, or
    /// an error-marked SyntaxError.
    pub fn parse(&mut self, source: &str, options: &ParseOptions) -> Value {
        let result = parser::parse_source(self, source, options);
        match result {
            Ok(bc_idx) => {
                // Nothing owns the fresh bytecode cell until it is wrapped.
                let mark = self.roots_mark();
                self.root(bc_idx.value(crate::value::HeapKind::ByteCode));
                let out = if options.module {
                    let path = match &options.source_name {
                        Some(n) => strings::intern_utf8(self, n),
                        None => strings::magic_value(strings::Magic::Anonymous),
                    };
                    let m = module::module_from_bytecode(self, bc_idx, path);
                    self.acquire(m)
                } else {
                    let script =
                        object::alloc_function(self, bc_idx, OptIdx::NONE, Value::UNDEFINED);
                    self.acquire(script)
                };
                self.roots_release(mark);
                out
            }
            Err(parse_error) => {
                let msg = format!("{}", parse_error);
                let err = builtins::make_error(self, ErrorKind::SyntaxError, &msg);
                let marked = self.exception_from(err, false);
                self.acquire(marked)
            }
        }
    }

    /// Execute a compiled script; returns its completion value.
    pub fn run(&mut self, script: Value) -> Value {
        if script.is_exception() {
            return self.acquire(script);
        }
        let bc_idx = if script.is_object_ref() {
            match &self.heap.object(Idx(script.heap_cp())).extra {
                ObjectExtra::Function { bytecode, .. } => Some(*bytecode),
                _ => None,
            }
        } else {
            None
        };
        let Some(bc_idx) = bc_idx else {
            return self.throw_sz(ErrorKind::TypeError, "value is not a compiled script");
        };
        let result = vm::run_program(self, bc_idx, Value::UNDEFINED, None);
        self.boundary(result)
    }

    /// Invoke any callable value.
    pub fn call_value(&mut self, func: Value, this: Value, args: &[Value]) -> Value {
        if func.is_exception() {
            return self.acquire(func);
        }
        let result = vm::call_function(self, func, this, args);
        self.boundary(result)
    }

    /// Invoke a function found on the global object.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Value {
        let func = {
            let global = self.realm.global_object.get().expect("realm");
            let pname = object::prop_name_from_bytes(self, name.as_bytes());
            let gv = global.value(HeapKind::Object);
            match builtins::op_get_property_name(self, gv, pname) {
                Ok(v) if !v.is_not_found() => v,
                Ok(_) => {
                    return self.throw_sz(
                        ErrorKind::ReferenceError,
                        &format!("{} is not defined", name),
                    )
                }
                Err(e) => return self.boundary(Err(e)),
            }
        };
        self.call_value(func, Value::UNDEFINED, args)
    }

    /// Drain the microtask queue.
    pub fn run_jobs(&mut self) -> Value {
        let result = jobs::run_jobs(self);
        self.boundary(result)
    }

    pub fn job_queue_len(&self) -> usize {
        self.jobs.len()
    }

    // -----------------------------------------------------------------------
    // Value constructors & inspectors
    // -----------------------------------------------------------------------

    pub fn value_undefined(&self) -> Value {
        Value::UNDEFINED
    }

    pub fn value_null(&self) -> Value {
        Value::NULL
    }

    pub fn value_bool(&self, b: bool) -> Value {
        Value::bool_val(b)
    }

    pub fn value_number(&mut self, n: f64) -> Value {
        let v = builtins::make_number(self, n);
        self.acquire(v)
    }

    pub fn value_string(&mut self, s: &str) -> Value {
        let v = strings::alloc_utf8(self, s);
        self.acquire(v)
    }

    /// Embedder-provided bytes with a free hook fired when the cell dies.
    pub fn value_external_string(
        &mut self,
        bytes: Rc<[u8]>,
        on_free: strings::ExternalFree,
    ) -> Value {
        let cell = strings::StringCell::external(bytes, on_free);
        let idx = heap::alloc(self, CellData::String(cell));
        self.acquire(idx.value(HeapKind::String))
    }

    pub fn value_array(&mut self, elements: &[Value]) -> Value {
        let v = object::alloc_array(self, elements.to_vec());
        self.acquire(v)
    }

    pub fn value_object(&mut self) -> Value {
        let proto = self.realm.object_prototype;
        let v = object::alloc_object_value(self, proto, ObjectExtra::None);
        self.acquire(v)
    }

    pub fn value_is_undefined(&self, v: Value) -> bool {
        v.is_undefined()
    }

    pub fn value_is_null(&self, v: Value) -> bool {
        v.is_null()
    }

    pub fn value_is_bool(&self, v: Value) -> bool {
        v.is_bool()
    }

    pub fn value_is_number(&self, v: Value) -> bool {
        v.is_number()
    }

    pub fn value_is_string(&self, v: Value) -> bool {
        v.is_string()
    }

    pub fn value_is_object(&self, v: Value) -> bool {
        v.is_object_ref()
    }

    pub fn value_is_function(&self, v: Value) -> bool {
        object::is_callable(self, v)
    }

    pub fn value_is_array(&self, v: Value) -> bool {
        v.is_object_ref()
            && matches!(
                self.heap.object(Idx(v.heap_cp())).extra,
                ObjectExtra::Array(_)
            )
    }

    pub fn value_is_promise(&self, v: Value) -> bool {
        jobs::is_promise(self, v)
    }

    /// Numeric payload; NaN when the value is not a number.
    pub fn value_as_number(&self, v: Value) -> f64 {
        if v.is_number() {
            object::number_of(self, v)
        } else {
            f64::NAN
        }
    }

    pub fn value_as_bool(&self, v: Value) -> bool {
        builtins::to_boolean(self, v)
    }

    /// Strict UTF-8 copy of a string value; empty for non-strings.
    pub fn value_as_string_utf8(&self, v: Value) -> String {
        if v.is_string() {
            strings::to_rust_string(self, v)
        } else {
            String::new()
        }
    }

    /// UTF-16 code units of a string value.
    pub fn value_as_string_utf16(&self, v: Value) -> Vec<u16> {
        if !v.is_string() {
            return Vec::new();
        }
        let bytes = strings::bytes_of(self, v);
        strings::Units::new(&bytes).collect()
    }

    /// ECMA ToString; may run script (valueOf/toString) and thus fail.
    pub fn value_to_string(&mut self, v: Value) -> Value {
        let result = builtins::to_string_value(self, v);
        self.boundary(result)
    }

    /// Settled state of a promise value.
    pub fn promise_state(&self, v: Value) -> Option<(PromiseState, Value)> {
        jobs::promise_state(self, v)
    }

    /// Source name recorded on a compiled script or function value.
    pub fn source_name(&mut self, v: Value) -> Value {
        match object::function_bytecode(self, v) {
            Some(bc) => self.acquire(bc.source_name),
            None => Value::UNDEFINED,
        }
    }

    /// Embedder cookie attached at parse time.
    pub fn source_user_value(&mut self, v: Value) -> Value {
        match object::function_bytecode(self, v) {
            Some(bc) => self.acquire(bc.user_value),
            None => Value::UNDEFINED,
        }
    }

    // -----------------------------------------------------------------------
    // Property access
    // -----------------------------------------------------------------------

    pub fn object_get(&mut self, obj: Value, name: &str) -> Value {
        let pname = object::prop_name_from_bytes(self, name.as_bytes());
        let result = builtins::op_get_property_name(self, obj, pname).map(|v| {
            if v.is_not_found() {
                Value::UNDEFINED
            } else {
                v
            }
        });
        self.boundary(result)
    }

    pub fn object_set(&mut self, obj: Value, name: &str, value: Value) -> Value {
        let key = strings::intern_utf8(self, name);
        let result = builtins::op_set_property(self, obj, key, value, false).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn object_get_index(&mut self, obj: Value, index: u32) -> Value {
        let result = builtins::op_get_property_name(self, obj, object::PropName::Index(index))
            .map(|v| if v.is_not_found() { Value::UNDEFINED } else { v });
        self.boundary(result)
    }

    pub fn object_set_index(&mut self, obj: Value, index: u32, value: Value) -> Value {
        let key = builtins::make_number(self, index as f64);
        let result = builtins::op_set_property(self, obj, key, value, false).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn global_get(&mut self, name: &str) -> Value {
        let global = self.realm.global_object.get().expect("realm");
        let gv = global.value(HeapKind::Object);
        self.object_get(gv, name)
    }

    pub fn global_set(&mut self, name: &str, value: Value) -> Value {
        let global = self.realm.global_object.get().expect("realm");
        let gv = global.value(HeapKind::Object);
        self.object_set(gv, name, value)
    }

    /// Register a native handler and wrap it as a callable value.
    pub fn create_native_function(&mut self, callback: Rc<NativeCallback>) -> Value {
        let handler = self.register_native(callback);
        let proto = self.realm.function_prototype;
        let v = object::alloc_object_value(self, proto, ObjectExtra::Native { handler });
        self.acquire(v)
    }

    /// Attach a native pointer + finalizer to an object; the finalizer runs
    /// during sweep or at context teardown.
    pub fn object_set_native_info(
        &mut self,
        obj: Value,
        data: *mut std::ffi::c_void,
        free_cb: Option<fn(*mut std::ffi::c_void)>,
    ) {
        if obj.is_object_ref() {
            self.heap.object_mut(Idx(obj.heap_cp())).native_info =
                Some(object::NativeInfo { data, free_cb });
        }
    }

    // -----------------------------------------------------------------------
    // Execution hooks
    // -----------------------------------------------------------------------

    /// Install the halt callback, polled every `interval` dispatched
    /// opcodes. A non-undefined return raises an uncatchable abort carrying
    /// that value.
    pub fn halt_callback_set(&mut self, interval: u32, cb: Rc<HaltCallback>) {
        self.vm.halt_cb = Some(cb);
        self.vm.halt_interval = interval.max(1);
    }

    pub fn halt_callback_clear(&mut self) {
        self.vm.halt_cb = None;
        self.vm.halt_interval = crate::config::VM_EXEC_STOP_INTERVAL;
    }

    /// Install the throw callback, invoked the first time a value becomes
    /// an in-flight exception.
    pub fn throw_callback_set(&mut self, cb: Rc<ThrowCallback>) {
        self.vm.throw_cb = Some(cb);
        self.vm.exception_captured = false;
    }

    pub fn throw_callback_clear(&mut self) {
        self.vm.throw_cb = None;
    }

    /// Whether the throw callback has observed an exception since the last
    /// clear.
    pub fn vm_throw_captured(&self) -> bool {
        self.vm.exception_captured
    }

    pub fn vm_throw_capture_clear(&mut self) {
        self.vm.exception_captured = false;
        self.vm.last_hook_value = Value::EMPTY;
    }

    /// Post-construction decorator for engine-made error objects.
    pub fn error_decorator_set(&mut self, cb: Rc<crate::context::ErrorDecorator>) {
        self.error_decorator = Some(cb);
    }

    /// Force a collection.
    pub fn heap_gc(&mut self, pressure: Pressure) {
        gc::collect(self, pressure);
    }

    pub fn heap_used_bytes(&self) -> usize {
        self.heap.bytes_used()
    }

    // -----------------------------------------------------------------------
    // Modules
    // -----------------------------------------------------------------------

    pub fn module_resolver_set(&mut self, resolver: Rc<ModuleResolver>) {
        self.modules.resolver = Some(resolver);
    }

    pub fn module_link(&mut self, m: Value) -> Value {
        let result = module::link(self, m).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn module_evaluate(&mut self, m: Value) -> Value {
        let result = module::evaluate(self, m);
        self.boundary(result)
    }

    pub fn module_state(&self, m: Value) -> Option<module::ModuleState> {
        module::module_state(self, m)
    }

    pub fn synthetic_module(
        &mut self,
        export_names: &[&str],
        evaluate: Option<Rc<SyntheticEvaluate>>,
    ) -> Value {
        let m = module::synthetic_module(self, export_names, evaluate);
        self.acquire(m)
    }

    pub fn synthetic_module_set_export(&mut self, m: Value, name: &str, value: Value) -> Value {
        let result = module::synthetic_module_set_export(self, m, name, value).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn pmap_load(&mut self, path: &str) -> Value {
        let result = module::pmap_load(self, path).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn pmap_from_json(&mut self, json: &str, root: &str) -> Value {
        let result = module::pmap_from_json(self, json, root).map(|_| Value::TRUE);
        self.boundary(result)
    }

    pub fn vmod(&mut self, name: &str, callback: Rc<VmodCallback>) {
        module::vmod_register(self, name, callback);
    }

    pub fn vmod_exists(&self, name: &str) -> bool {
        module::vmod_exists(self, name)
    }

    pub fn vmod_remove(&mut self, name: &str) {
        module::vmod_remove(self, name);
    }

    pub fn require(&mut self, specifier: &str) -> Value {
        let result = module::cjs_require(self, specifier, None);
        self.boundary(result)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Serialize a compiled script/function/module value.
    pub fn snapshot_save(&mut self, script: Value, static_flag: bool) -> Result<Vec<u8>, Value> {
        let bc = match object::function_bytecode(self, script) {
            Some(bc) => bc,
            None => match module::module_record_of(self, script) {
                Some(record) => {
                    match self.modules.records[record as usize].bytecode.get() {
                        Some(idx) => self.heap.bytecode(idx),
                        None => {
                            return Err(
                                self.throw_sz(ErrorKind::TypeError, "module has no bytecode")
                            )
                        }
                    }
                }
                None => {
                    return Err(
                        self.throw_sz(ErrorKind::TypeError, "value is not a compiled script")
                    )
                }
            },
        };
        snapshot::save(self, &bc, static_flag).map_err(|e| {
            let err = snapshot::snapshot_error_value(self, e);
            let marked = self.exception_from(err, false);
            self.acquire(marked)
        })
    }

    /// Load a snapshot into a runnable script (or module) value.
    pub fn snapshot_exec(&mut self, buffer: &[u8], allow_static: bool) -> Value {
        match snapshot::load(self, buffer, allow_static) {
            Ok((bc_idx, flags)) => {
                let mark = self.roots_mark();
                self.root(bc_idx.value(crate::value::HeapKind::ByteCode));
                let out = if flags & snapshot::FLAG_MODULE != 0 {
                    let name = strings::magic_value(strings::Magic::Anonymous);
                    let m = module::module_from_bytecode(self, bc_idx, name);
                    self.acquire(m)
                } else {
                    let script =
                        object::alloc_function(self, bc_idx, OptIdx::NONE, Value::UNDEFINED);
                    self.acquire(script)
                };
                self.roots_release(mark);
                out
            }
            Err(e) => {
                let err = snapshot::snapshot_error_value(self, e);
                let marked = self.exception_from(err, false);
                self.acquire(marked)
            }
        }
    }

    /// Extract one part of a merged snapshot and load it.
    pub fn snapshot_exec_at(&mut self, buffer: &[u8], index: usize, allow_static: bool) -> Value {
        match snapshot::merged_part(buffer, index) {
            Ok(part) => {
                let part = part.to_vec();
                self.snapshot_exec(&part, allow_static)
            }
            Err(e) => {
                let err = snapshot::snapshot_error_value(self, e);
                let marked = self.exception_from(err, false);
                self.acquire(marked)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new(Default::default()).unwrap()
    }

    #[test]
    fn refcount_copy_free_is_balanced() {
        let mut c = ctx();
        let v = c.value_string("handle");
        let idx = Idx(v.heap_cp());
        assert_eq!(c.heap.get(idx).refs, 1);
        let v2 = c.value_copy(v);
        assert_eq!(c.heap.get(idx).refs, 2);
        c.value_free(v2);
        assert_eq!(c.heap.get(idx).refs, 1);
        c.value_free(v);
        assert_eq!(c.heap.get(idx).refs, 0);
    }

    #[test]
    fn parse_error_is_marked_syntax_error() {
        let mut c = ctx();
        let v = c.parse("var = ;", &ParseOptions::default());
        assert!(c.value_is_exception(v));
        assert!(!c.value_is_abort(v));
        let err = c.exception_value(v, true);
        let name = c.object_get(err, "name");
        assert_eq!(c.value_as_string_utf8(name), "SyntaxError");
        c.value_free(name);
        c.value_free(err);
    }

    #[test]
    fn throw_and_unwrap_round_trip() {
        let mut c = ctx();
        let payload = c.value_number(-5.5);
        let marked = c.throw_value(payload);
        assert!(c.value_is_exception(marked));
        let back = c.exception_value(marked, true);
        assert_eq!(c.value_as_number(back), -5.5);
        c.value_free(back);
        c.value_free(payload);
    }

    #[test]
    fn abort_flavor_is_distinct() {
        let mut c = ctx();
        let v = c.value_string("stop");
        let abort = c.throw_abort(v);
        assert!(c.value_is_exception(abort));
        assert!(c.value_is_abort(abort));
        let plain = c.throw_value(v);
        assert!(!c.value_is_abort(plain));
        c.value_free(abort);
        c.value_free(plain);
        c.value_free(v);
    }

    #[test]
    fn global_roundtrip() {
        let mut c = ctx();
        let n = c.value_number(42.0);
        let ok = c.global_set("answer", n);
        assert!(!c.value_is_exception(ok));
        let got = c.global_get("answer");
        assert_eq!(c.value_as_number(got), 42.0);
        c.value_free(got);
        c.value_free(ok);
        c.value_free(n);
    }
}
