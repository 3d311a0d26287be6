/// Garbage Collector — Stop-the-World Mark & Sweep
///
/// Roots: the realm, the VM stack and frame chain, the microtask queue, the
/// intern set, module records, and every cell pinned by an external
/// reference (refs > 0). Marking recurses directly up to `GC_MARK_LIMIT`
/// frames; deeper chains go through an explicit worklist so native stack use
/// stays O(1) on any object graph.
///
/// Pressure:
///   LOW   — runs only when allocations since the previous collection exceed
///           1/32 of the heap budget
///   HIGH  — runs unconditionally and also returns trailing free slots to
///           the allocator
///
/// Sweep runs native-pointer finalizers (which must not allocate) and fires
/// external string free hooks. The lookup cache is invalidated wholesale:
/// freed slots may be reused immediately after.
use crate::config::{GC_MARK_LIMIT, GC_NEW_OBJECTS_FRACTION};
use crate::context::Context;
use crate::env::EnvKind;
use crate::heap::{CellData, Heap, Idx};
use crate::object::{ObjectExtra, PropName, PropValue, ReactionHandler};
use crate::platform::LogLevel;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    Low,
    High,
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub collections: u64,
    pub last_marked: usize,
    pub last_freed: usize,
    pub last_pause_ns: u64,
    pub total_pause_ns: u64,
}

/// Root index behind a value word, if any.
#[inline]
fn value_root(v: Value) -> Option<Idx> {
    if v.is_heap() {
        Some(Idx(v.heap_cp()))
    } else if v.is_exception() {
        Some(Idx(v.error_cp()))
    } else {
        None
    }
}

fn push_value(out: &mut Vec<Idx>, v: Value) {
    if let Some(idx) = value_root(v) {
        out.push(idx);
    }
}

/// Successor cells of one cell.
fn trace_cell(heap: &Heap, idx: Idx, out: &mut Vec<Idx>) {
    match &heap.get(idx).data {
        CellData::Number(_) | CellData::String(_) => {}
        CellData::Symbol(s) => push_value(out, s.description),
        CellData::ErrorRef(e) => push_value(out, e.value),
        CellData::Pair(pair) => {
            for slot in &pair.slots {
                match slot.name {
                    Some(PropName::Interned(i)) | Some(PropName::Symbol(i)) => out.push(i),
                    _ => {}
                }
                match slot.value {
                    PropValue::Data(v) => push_value(out, v),
                    PropValue::Accessor { get, set } => {
                        push_value(out, get);
                        push_value(out, set);
                    }
                }
            }
            if let Some(next) = pair.next.get() {
                out.push(next);
            }
        }
        CellData::Hashmap(hm) => {
            for (pair, _) in hm.map.values() {
                out.push(*pair);
            }
        }
        CellData::Env(env) => {
            if let Some(p) = env.parent.get() {
                out.push(p);
            }
            match &env.kind {
                EnvKind::Declarative { bindings } => {
                    for (name, b) in bindings {
                        push_value(out, *name);
                        push_value(out, b.value);
                    }
                }
                EnvKind::Object { object } => out.push(*object),
            }
        }
        CellData::ByteCode(bc) => {
            for lit in bc.literals.iter() {
                push_value(out, *lit);
            }
            for v in bc.arg_names.iter().chain(bc.var_names.iter()) {
                push_value(out, *v);
            }
            for (name, _) in bc.func_decls.iter() {
                push_value(out, *name);
            }
            if let Some(m) = &bc.module {
                for r in m.requests.iter() {
                    push_value(out, *r);
                }
                for (l, e) in m.exports.iter() {
                    push_value(out, *l);
                    push_value(out, *e);
                }
            }
            push_value(out, bc.name);
            push_value(out, bc.source_name);
            push_value(out, bc.user_value);
        }
        CellData::Coroutine(c) => {
            out.push(c.bytecode);
            if let Some(e) = c.env.get() {
                out.push(e);
            }
            push_value(out, c.this_value);
            push_value(out, c.function);
            for v in c.stack.iter() {
                push_value(out, *v);
            }
        }
        CellData::Object(o) => {
            if let Some(p) = o.prototype.get() {
                out.push(p);
            }
            if let Some(p) = o.props.get() {
                out.push(p);
            }
            if let Some(h) = o.hashmap.get() {
                out.push(h);
            }
            match &o.extra {
                ObjectExtra::None
                | ObjectExtra::Error { .. }
                | ObjectExtra::Native { .. }
                | ObjectExtra::Routine { .. }
                | ObjectExtra::Module { .. }
                | ObjectExtra::Namespace { .. } => {}
                ObjectExtra::Array(a) => {
                    for v in &a.elements {
                        push_value(out, *v);
                    }
                }
                ObjectExtra::Function {
                    bytecode,
                    env,
                    arrow_this,
                } => {
                    out.push(*bytecode);
                    if let Some(e) = env.get() {
                        out.push(e);
                    }
                    push_value(out, *arrow_this);
                }
                ObjectExtra::Bound {
                    target,
                    this_value,
                    args,
                } => {
                    push_value(out, *target);
                    push_value(out, *this_value);
                    for v in args.iter() {
                        push_value(out, *v);
                    }
                }
                ObjectExtra::Proxy {
                    target, handler, ..
                } => {
                    push_value(out, *target);
                    push_value(out, *handler);
                }
                ObjectExtra::Promise(p) => {
                    push_value(out, p.result);
                    for r in p.fulfill_reactions.iter().chain(p.reject_reactions.iter()) {
                        if let Some(cap) = r.capability {
                            push_value(out, cap);
                        }
                        match &r.handler {
                            ReactionHandler::Fulfill(v) | ReactionHandler::Reject(v) => {
                                push_value(out, *v)
                            }
                            ReactionHandler::AsyncResume { generator }
                            | ReactionHandler::AsyncThrow { generator } => {
                                push_value(out, *generator)
                            }
                        }
                    }
                }
                ObjectExtra::Generator {
                    coroutine, promise, ..
                } => {
                    if let Some(c) = coroutine.get() {
                        out.push(c);
                    }
                    push_value(out, *promise);
                }
            }
        }
    }
}

fn mark(heap: &mut Heap, idx: Idx, depth: u32, worklist: &mut Vec<Idx>) {
    if heap.get(idx).marked {
        return;
    }
    heap.get_mut(idx).marked = true;
    let mut succ = Vec::new();
    trace_cell(heap, idx, &mut succ);
    for s in succ {
        if depth >= GC_MARK_LIMIT {
            worklist.push(s);
        } else {
            mark(heap, s, depth + 1, worklist);
        }
    }
}

/// Run a collection at the given pressure.
pub fn collect(ctx: &mut Context, pressure: Pressure) {
    if pressure == Pressure::Low
        && ctx.heap.alloc_since_gc <= ctx.heap.bytes_limit() / GC_NEW_OBJECTS_FRACTION
    {
        return;
    }
    let start = ctx.port().time_hrtime();

    // ---- roots ------------------------------------------------------------
    let mut roots: Vec<Idx> = Vec::new();
    ctx.realm.collect_roots(&mut roots);
    roots.extend(ctx.interner.indices());
    ctx.vm.collect_roots(&mut roots);
    ctx.jobs.collect_roots(&mut roots);
    ctx.modules.collect_roots(&mut roots);
    for v in &ctx.temp_roots {
        if let Some(idx) = value_root(*v) {
            roots.push(idx);
        }
    }
    for idx in ctx.heap.used_indices() {
        if ctx.heap.get(idx).refs > 0 {
            roots.push(idx);
        }
    }

    // ---- mark -------------------------------------------------------------
    let mut worklist: Vec<Idx> = Vec::new();
    for r in roots {
        mark(&mut ctx.heap, r, 0, &mut worklist);
    }
    while let Some(idx) = worklist.pop() {
        // depth restarts at 0: each worklist entry gets its own bounded
        // recursion budget
        let mut wl2 = Vec::new();
        mark(&mut ctx.heap, idx, 0, &mut wl2);
        worklist.extend(wl2);
    }

    // ---- sweep ------------------------------------------------------------
    let mut marked = 0usize;
    let mut freed = 0usize;
    let dead: Vec<Idx> = ctx
        .heap
        .used_indices()
        .filter(|idx| !ctx.heap.get(*idx).marked)
        .collect();
    for idx in dead {
        // Finalizers run during sweep and must not allocate.
        if let CellData::Object(o) = &mut ctx.heap.get_mut(idx).data {
            if let Some(info) = o.native_info.take() {
                if let Some(cb) = info.free_cb {
                    cb(info.data);
                }
            }
        }
        ctx.heap.free(idx);
        freed += 1;
    }
    for idx in ctx.heap.used_indices().collect::<Vec<_>>() {
        let cell = ctx.heap.get_mut(idx);
        if cell.marked {
            cell.marked = false;
            marked += 1;
        }
    }

    if pressure == Pressure::High {
        ctx.heap.shrink();
    }

    // Cache entries may name freed slots; drop them all.
    ctx.lookup_cache.invalidate();
    ctx.heap.alloc_since_gc = 0;

    let pause = ctx.port().time_hrtime().saturating_sub(start);
    ctx.gc_stats.collections += 1;
    ctx.gc_stats.last_marked = marked;
    ctx.gc_stats.last_freed = freed;
    ctx.gc_stats.last_pause_ns = pause;
    ctx.gc_stats.total_pause_ns += pause;

    if ctx.gc_debug {
        let msg = format!(
            "gc #{}: {:?} marked={} freed={} pause={}us heap={}B",
            ctx.gc_stats.collections,
            pressure,
            marked,
            freed,
            pause / 1000,
            ctx.heap.bytes_used()
        );
        ctx.port().io_log(LogLevel::Debug, &msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{self, CellData};
    use crate::object::{self, ObjectExtra, PropName, PropValue, PROP_FLAGS_DEFAULT};
    use crate::heap::OptIdx;

    #[test]
    fn unreferenced_cell_is_collected() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let idx = heap::alloc(&mut ctx, CellData::Number(1.5));
        assert!(ctx.heap.is_used(idx));
        collect(&mut ctx, Pressure::High);
        assert!(!ctx.heap.is_used(idx));
    }

    #[test]
    fn pinned_cell_survives() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let idx = heap::alloc(&mut ctx, CellData::Number(2.5));
        ctx.heap.ref_inc(idx).unwrap();
        collect(&mut ctx, Pressure::High);
        assert!(ctx.heap.is_used(idx));
        assert_eq!(ctx.heap.number(idx), 2.5);
        ctx.heap.ref_dec(idx);
        collect(&mut ctx, Pressure::High);
        assert!(!ctx.heap.is_used(idx));
    }

    #[test]
    fn reachable_graph_survives_through_pinned_root() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let obj = object::alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        let payload = heap::alloc(&mut ctx, CellData::Number(7.0));
        let name = object::prop_name_from_bytes(&mut ctx, b"n");
        object::add_own(
            &mut ctx,
            obj,
            name,
            PROP_FLAGS_DEFAULT,
            PropValue::Data(payload.value(crate::value::HeapKind::Number)),
        );
        ctx.heap.ref_inc(obj).unwrap();
        collect(&mut ctx, Pressure::High);
        // Transitively reachable fields read back the same bytes.
        assert!(ctx.heap.is_used(payload));
        assert_eq!(ctx.heap.number(payload), 7.0);
        let slot = object::own_slot(&mut ctx, obj, name).unwrap();
        assert!(matches!(slot.value, PropValue::Data(v) if v.heap_cp() == payload.0));
    }

    #[test]
    fn deep_chain_marks_fully() {
        // Chain far deeper than GC_MARK_LIMIT exercises the worklist path.
        let mut ctx = Context::new(Default::default()).unwrap();
        let mut prev = object::alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        let head = prev;
        for _ in 0..200 {
            let next = object::alloc_object(&mut ctx, prev.some(), ObjectExtra::None);
            prev = next;
        }
        ctx.heap.ref_inc(prev).unwrap();
        collect(&mut ctx, Pressure::High);
        assert!(ctx.heap.is_used(head));
    }

    #[test]
    fn low_pressure_respects_threshold() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let idx = heap::alloc(&mut ctx, CellData::Number(3.0));
        // Fresh context: almost nothing allocated since the last collection,
        // so LOW declines to run and the garbage stays.
        ctx.heap.alloc_since_gc = 0;
        collect(&mut ctx, Pressure::Low);
        assert!(ctx.heap.is_used(idx));
        collect(&mut ctx, Pressure::High);
        assert!(!ctx.heap.is_used(idx));
    }

    #[test]
    fn interned_strings_are_roots() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let v = crate::strings::intern_utf8(&mut ctx, "survives-collection");
        let idx = Idx(v.heap_cp());
        collect(&mut ctx, Pressure::High);
        assert!(ctx.heap.is_used(idx));
    }
}
