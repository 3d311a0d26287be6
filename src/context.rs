/// Engine Context
///
/// One fully isolated engine instance: managed heap, realm, intern set,
/// lookup cache, VM state, job queue, module registry and native-callback
/// tables. There is no global state anywhere in the crate; every internal
/// operation takes the context as an explicit parameter, and values are
/// meaningless outside the context whose heap they index.
use crate::builtins;
use crate::config::ContextOptions;
use crate::gc::GcStats;
use crate::heap::{Heap, Idx, OptIdx};
use crate::jobs::JobQueue;
use crate::module::ModuleRegistry;
use crate::platform::Port;
use crate::property_cache::LookupCache;
use crate::strings::InternSet;
use crate::value::Value;
use crate::vm::VmState;
use std::rc::Rc;

/// Native function handler registered by the embedder. Receives the calling
/// context, the `this` value and the argument slice; returns an ECMA value
/// or a thrown value.
pub type NativeCallback = dyn Fn(&mut Context, Value, &[Value]) -> Result<Value, Value>;

/// Hook invoked after the engine constructs an error object, so the embedder
/// can decorate it with extra fields.
pub type ErrorDecorator = dyn Fn(&mut Context, Value);

/// Per-realm built-in wiring. Populated once at context init.
#[derive(Default)]
pub struct Realm {
    pub global_object: OptIdx,
    /// Object environment fronting the global object; root of every scope
    /// chain.
    pub global_env: OptIdx,
    pub object_prototype: OptIdx,
    pub function_prototype: OptIdx,
    pub array_prototype: OptIdx,
    pub string_prototype: OptIdx,
    pub number_prototype: OptIdx,
    pub boolean_prototype: OptIdx,
    pub symbol_prototype: OptIdx,
    pub promise_prototype: OptIdx,
    pub generator_prototype: OptIdx,
    /// Indexed by `ErrorKind as usize`.
    pub error_prototypes: [OptIdx; 8],
}

impl Realm {
    pub fn collect_roots(&self, out: &mut Vec<Idx>) {
        let all = [
            self.global_object,
            self.global_env,
            self.object_prototype,
            self.function_prototype,
            self.array_prototype,
            self.string_prototype,
            self.number_prototype,
            self.boolean_prototype,
            self.symbol_prototype,
            self.promise_prototype,
            self.generator_prototype,
        ];
        for o in all.into_iter().chain(self.error_prototypes) {
            if let Some(idx) = o.get() {
                out.push(idx);
            }
        }
    }
}

pub struct Context {
    pub heap: Heap,
    pub realm: Realm,
    pub interner: InternSet,
    /// Embedder extension of the magic-string table; ids start past the
    /// compile-time table.
    pub magic_ext: Vec<Rc<[u8]>>,
    pub lookup_cache: LookupCache,
    pub vm: VmState,
    pub jobs: JobQueue,
    pub modules: ModuleRegistry,
    pub native_fns: Vec<Rc<NativeCallback>>,
    pub error_decorator: Option<Rc<ErrorDecorator>>,
    pub gc_stats: GcStats,
    pub gc_debug: bool,
    /// Transient GC roots covering values held in Rust locals across
    /// allocations (parser literals, call arguments, job payloads).
    pub temp_roots: Vec<Value>,
    /// Math.random state (xorshift), seeded from the monotonic clock.
    pub rand_state: u64,
    port: Rc<dyn Port>,
}

impl Context {
    pub fn new(mut options: ContextOptions) -> Result<Context, &'static str> {
        options.validate()?;
        let heap_limit = options.effective_heap_limit();
        let on_destroy = options
            .external_heap
            .take()
            .and_then(|mut ext| ext.on_free.take());
        let port = Rc::clone(&options.port);
        let seed = port.time_hrtime() | 1;
        let mut ctx = Context {
            heap: Heap::new(heap_limit, options.gc_before_each_alloc, on_destroy),
            realm: Realm::default(),
            interner: InternSet::default(),
            magic_ext: Vec::new(),
            lookup_cache: LookupCache::default(),
            vm: VmState::new(options.vm_stack_limit),
            jobs: JobQueue::default(),
            modules: ModuleRegistry::default(),
            native_fns: Vec::new(),
            error_decorator: None,
            gc_stats: GcStats::default(),
            gc_debug: options.gc_debug,
            temp_roots: Vec::new(),
            rand_state: seed,
            port,
        };
        builtins::init_realm(&mut ctx);
        Ok(ctx)
    }

    #[inline(always)]
    pub fn port(&self) -> Rc<dyn Port> {
        Rc::clone(&self.port)
    }

    /// Register additional magic strings. Returns the id of the first one.
    /// Only meaningful right after context creation, before any of the
    /// strings may have been interned as heap cells.
    pub fn register_magic_strings(&mut self, extra: &[&str]) -> u16 {
        let first = (crate::strings::MAGIC_STRINGS.len() + self.magic_ext.len()) as u16;
        for s in extra {
            self.magic_ext.push(Rc::from(s.as_bytes()));
        }
        first
    }

    /// Register a native callback; returns its registry index for function
    /// object creation.
    pub fn register_native(&mut self, f: Rc<NativeCallback>) -> u32 {
        self.native_fns.push(f);
        (self.native_fns.len() - 1) as u32
    }

    // -- transient rooting --------------------------------------------------

    #[inline(always)]
    pub fn root(&mut self, v: Value) {
        self.temp_roots.push(v);
    }

    #[inline(always)]
    pub fn roots_mark(&self) -> usize {
        self.temp_roots.len()
    }

    #[inline(always)]
    pub fn roots_release(&mut self, mark: usize) {
        self.temp_roots.truncate(mark);
    }

    /// Pseudo-random f64 in [0, 1) for Math.random.
    pub fn next_random(&mut self) -> f64 {
        let mut x = self.rand_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rand_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Native-pointer finalizers run at teardown exactly as they would in
        // a final sweep; the external heap hook fires when the heap drops.
        let indices: Vec<Idx> = self.heap.used_indices().collect();
        for idx in indices {
            if let crate::heap::CellData::Object(o) = &mut self.heap.get_mut(idx).data {
                if let Some(info) = o.native_info.take() {
                    if let Some(cb) = info.free_cb {
                        cb(info.data);
                    }
                }
            }
        }
        self.port.io_flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextOptions, ExternalHeap};

    #[test]
    fn contexts_are_isolated() {
        let a = Context::new(Default::default()).unwrap();
        let b = Context::new(Default::default()).unwrap();
        assert!(a.realm.global_object.get().is_some());
        assert!(b.realm.global_object.get().is_some());
        // Independent heaps: cell counts may match but the stores do not
        // alias; mutating one is invisible to the other.
        assert!(a.heap.bytes_used() > 0);
        assert!(b.heap.bytes_used() > 0);
    }

    #[test]
    fn external_heap_free_fires_on_destroy() {
        use std::cell::Cell;
        use std::rc::Rc;
        let fired = Rc::new(Cell::new(false));
        let fired2 = Rc::clone(&fired);
        let opts = ContextOptions {
            external_heap: Some(ExternalHeap {
                capacity: 256 * 1024,
                on_free: Some(Box::new(move || fired2.set(true))),
            }),
            ..Default::default()
        };
        let ctx = Context::new(opts).unwrap();
        assert!(!fired.get());
        drop(ctx);
        assert!(fired.get());
    }

    #[test]
    fn magic_extension_ids_are_stable() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let first = ctx.register_magic_strings(&["appHook", "appToken"]);
        let v = crate::strings::intern_utf8(&mut ctx, "appToken");
        assert!(v.is_magic_string());
        assert_eq!(v.magic_id(), first + 1);
    }

    #[test]
    fn random_is_in_unit_interval() {
        let mut ctx = Context::new(Default::default()).unwrap();
        for _ in 0..100 {
            let r = ctx.next_random();
            assert!((0.0..1.0).contains(&r));
        }
    }
}
