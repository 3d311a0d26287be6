/// Managed Heap — Slot Arena + Compressed Pointers
///
/// ARCHITECTURE:
///   One contiguous arena of cells per context. A compressed pointer is the
///   cell's slot index (`Idx`); durable heap→heap links store indices, never
///   native addresses. `OptIdx::NONE` is the distinguished NULL index and is
///   never handed out by the allocator.
///
///   Two allocation tiers share the arena:
///     • pool tier  — freed slots chained on a singly-linked free list,
///       reused in O(1)
///     • byte budget — every cell is booked against the context's heap
///       limit with its payload size, so a 512 KiB configuration behaves
///       like a 512 KiB heap even though Rust owns the actual memory
///
///   Allocation contract: reuse a free slot or grow; if the byte budget is
///   exhausted the caller (`alloc` in this module) runs a HIGH-pressure GC
///   and retries once, then reports out-of-memory through the port's fatal
///   hook.
use crate::bytecode::ByteCode;
use crate::config::CP_BITS;
use crate::context::Context;
use crate::env::EnvCell;
use crate::errors::FatalCode;
use crate::gc;
use crate::object::{ObjectCell, PropHashmap, PropertyPair};
use crate::strings::StringCell;
use crate::value::{HeapKind, Value};
use crate::vm::CoroutineCell;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Compressed pointers
// ---------------------------------------------------------------------------

/// The NULL compressed pointer. All 27 usable bits set.
pub const NULL_CP: u32 = (1 << CP_BITS) - 1;

/// A valid compressed pointer: index of a used arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Idx(pub u32);

impl Idx {
    #[inline(always)]
    pub fn value(self, kind: HeapKind) -> Value {
        Value::heap(kind, self.0)
    }

    #[inline(always)]
    pub fn some(self) -> OptIdx {
        OptIdx(self.0)
    }
}

/// A compressed pointer that may be NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct OptIdx(u32);

impl OptIdx {
    pub const NONE: OptIdx = OptIdx(NULL_CP);

    #[inline(always)]
    pub fn is_none(self) -> bool {
        self.0 == NULL_CP
    }

    #[inline(always)]
    pub fn get(self) -> Option<Idx> {
        if self.is_none() {
            None
        } else {
            Some(Idx(self.0))
        }
    }
}

impl From<Idx> for OptIdx {
    fn from(idx: Idx) -> OptIdx {
        idx.some()
    }
}

impl Default for OptIdx {
    fn default() -> OptIdx {
        OptIdx::NONE
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// Unique identity + optional description of a symbol.
#[derive(Debug)]
pub struct SymbolCell {
    pub description: Value,
}

/// Wrapper that marks a value as thrown. `abort` flags the uncatchable
/// flavour; `hook_seen` records that the vm-throw callback already fired for
/// this exception.
#[derive(Debug)]
pub struct ErrorRefCell {
    pub value: Value,
    pub abort: bool,
    pub hook_seen: bool,
}

#[derive(Debug)]
pub enum CellData {
    Number(f64),
    String(StringCell),
    Symbol(SymbolCell),
    Object(Box<ObjectCell>),
    Pair(Box<PropertyPair>),
    Hashmap(Box<PropHashmap>),
    Env(Box<EnvCell>),
    ByteCode(Rc<ByteCode>),
    ErrorRef(ErrorRefCell),
    Coroutine(Box<CoroutineCell>),
}

impl CellData {
    pub fn kind_name(&self) -> &'static str {
        match self {
            CellData::Number(_) => "number",
            CellData::String(_) => "string",
            CellData::Symbol(_) => "symbol",
            CellData::Object(_) => "object",
            CellData::Pair(_) => "property-pair",
            CellData::Hashmap(_) => "hashmap",
            CellData::Env(_) => "environment",
            CellData::ByteCode(_) => "bytecode",
            CellData::ErrorRef(_) => "error-ref",
            CellData::Coroutine(_) => "coroutine",
        }
    }

    /// Bytes booked against the heap budget for this cell.
    pub fn booked_size(&self) -> usize {
        let base = std::mem::size_of::<Cell>();
        let extra = match self {
            CellData::Number(_) | CellData::Symbol(_) | CellData::ErrorRef(_) => 0,
            CellData::String(s) => s.bytes.len(),
            CellData::Object(o) => o.booked_extra(),
            CellData::Pair(_) => std::mem::size_of::<PropertyPair>(),
            CellData::Hashmap(h) => h.booked_extra(),
            CellData::Env(e) => e.booked_extra(),
            CellData::ByteCode(bc) => bc.booked_extra(),
            CellData::Coroutine(c) => c.booked_extra(),
        };
        base + extra
    }
}

/// A used arena slot: GC header + payload.
pub struct Cell {
    /// External references (API handles). Objects with `refs > 0` are GC
    /// roots.
    pub refs: u32,
    /// Mark bit, valid during collection.
    pub marked: bool,
    /// Traversal bit for cycle detection on prototype/proxy walks.
    pub visited: bool,
    pub data: CellData,
}

enum Slot {
    Free { next: OptIdx },
    Used(Cell),
}

// ---------------------------------------------------------------------------
// The heap
// ---------------------------------------------------------------------------

pub struct Heap {
    slots: Vec<Slot>,
    free_head: OptIdx,
    bytes_used: usize,
    bytes_limit: usize,
    /// Bytes allocated since the last collection; drives LOW-pressure GC.
    pub alloc_since_gc: usize,
    /// Debug: collect before every allocation.
    pub gc_before_each_alloc: bool,
    on_destroy: Option<Box<dyn FnOnce()>>,
}

impl Heap {
    pub fn new(
        bytes_limit: usize,
        gc_before_each_alloc: bool,
        on_destroy: Option<Box<dyn FnOnce()>>,
    ) -> Heap {
        Heap {
            slots: Vec::new(),
            free_head: OptIdx::NONE,
            bytes_used: 0,
            bytes_limit,
            alloc_since_gc: 0,
            gc_before_each_alloc,
            on_destroy,
        }
    }

    #[inline(always)]
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    #[inline(always)]
    pub fn bytes_limit(&self) -> usize {
        self.bytes_limit
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Place a cell without any GC interaction. On exhaustion the cell data
    /// is handed back so `alloc` can retry it after a collection.
    pub fn try_alloc(&mut self, data: CellData) -> Result<Idx, CellData> {
        let size = data.booked_size();
        if self.bytes_used + size > self.bytes_limit {
            return Err(data);
        }
        let cell = Cell {
            refs: 0,
            marked: false,
            visited: false,
            data,
        };
        let idx = match self.free_head.get() {
            Some(idx) => {
                let next = match &self.slots[idx.0 as usize] {
                    Slot::Free { next } => *next,
                    Slot::Used(_) => unreachable!("free list points at a used slot"),
                };
                self.free_head = next;
                self.slots[idx.0 as usize] = Slot::Used(cell);
                idx
            }
            None => {
                let raw = self.slots.len() as u32;
                // The budget caps the arena well below this, but a slot must
                // never alias the NULL sentinel.
                assert!(raw < NULL_CP, "heap slot index collides with NULL");
                self.slots.push(Slot::Used(cell));
                Idx(raw)
            }
        };
        self.bytes_used += size;
        self.alloc_since_gc += size;
        Ok(idx)
    }

    /// Release one cell back to the free list. Caller (the GC sweep or the
    /// context teardown) guarantees nothing references it.
    pub fn free(&mut self, idx: Idx) {
        let slot = &mut self.slots[idx.0 as usize];
        match slot {
            Slot::Used(cell) => {
                let size = cell.data.booked_size();
                if let CellData::String(s) = &mut cell.data {
                    s.run_free_hook();
                }
                self.bytes_used -= size.min(self.bytes_used);
                *slot = Slot::Free {
                    next: self.free_head,
                };
                self.free_head = idx.some();
            }
            Slot::Free { .. } => unreachable!("double free of heap slot"),
        }
    }

    #[inline(always)]
    pub fn get(&self, idx: Idx) -> &Cell {
        match &self.slots[idx.0 as usize] {
            Slot::Used(cell) => cell,
            Slot::Free { .. } => unreachable!("dereference of freed heap slot"),
        }
    }

    #[inline(always)]
    pub fn get_mut(&mut self, idx: Idx) -> &mut Cell {
        match &mut self.slots[idx.0 as usize] {
            Slot::Used(cell) => cell,
            Slot::Free { .. } => unreachable!("dereference of freed heap slot"),
        }
    }

    pub fn is_used(&self, idx: Idx) -> bool {
        matches!(self.slots.get(idx.0 as usize), Some(Slot::Used(_)))
    }

    /// Iterate indices of all used slots.
    pub fn used_indices(&self) -> impl Iterator<Item = Idx> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| match s {
            Slot::Used(_) => Some(Idx(i as u32)),
            Slot::Free { .. } => None,
        })
    }

    // -- typed accessors ----------------------------------------------------

    pub fn object(&self, idx: Idx) -> &ObjectCell {
        match &self.get(idx).data {
            CellData::Object(o) => o,
            other => unreachable!("expected object cell, found {}", other.kind_name()),
        }
    }

    pub fn object_mut(&mut self, idx: Idx) -> &mut ObjectCell {
        match &mut self.get_mut(idx).data {
            CellData::Object(o) => o,
            other => unreachable!("expected object cell, found {}", other.kind_name()),
        }
    }

    pub fn string(&self, idx: Idx) -> &StringCell {
        match &self.get(idx).data {
            CellData::String(s) => s,
            other => unreachable!("expected string cell, found {}", other.kind_name()),
        }
    }

    pub fn number(&self, idx: Idx) -> f64 {
        match &self.get(idx).data {
            CellData::Number(n) => *n,
            other => unreachable!("expected number cell, found {}", other.kind_name()),
        }
    }

    pub fn pair(&self, idx: Idx) -> &PropertyPair {
        match &self.get(idx).data {
            CellData::Pair(p) => p,
            other => unreachable!("expected pair cell, found {}", other.kind_name()),
        }
    }

    pub fn pair_mut(&mut self, idx: Idx) -> &mut PropertyPair {
        match &mut self.get_mut(idx).data {
            CellData::Pair(p) => p,
            other => unreachable!("expected pair cell, found {}", other.kind_name()),
        }
    }

    pub fn hashmap(&self, idx: Idx) -> &PropHashmap {
        match &self.get(idx).data {
            CellData::Hashmap(h) => h,
            other => unreachable!("expected hashmap cell, found {}", other.kind_name()),
        }
    }

    pub fn hashmap_mut(&mut self, idx: Idx) -> &mut PropHashmap {
        match &mut self.get_mut(idx).data {
            CellData::Hashmap(h) => h,
            other => unreachable!("expected hashmap cell, found {}", other.kind_name()),
        }
    }

    pub fn env(&self, idx: Idx) -> &EnvCell {
        match &self.get(idx).data {
            CellData::Env(e) => e,
            other => unreachable!("expected env cell, found {}", other.kind_name()),
        }
    }

    pub fn env_mut(&mut self, idx: Idx) -> &mut EnvCell {
        match &mut self.get_mut(idx).data {
            CellData::Env(e) => e,
            other => unreachable!("expected env cell, found {}", other.kind_name()),
        }
    }

    pub fn bytecode(&self, idx: Idx) -> Rc<ByteCode> {
        match &self.get(idx).data {
            CellData::ByteCode(bc) => Rc::clone(bc),
            other => unreachable!("expected bytecode cell, found {}", other.kind_name()),
        }
    }

    pub fn error_ref(&self, idx: Idx) -> &ErrorRefCell {
        match &self.get(idx).data {
            CellData::ErrorRef(e) => e,
            other => unreachable!("expected error-ref cell, found {}", other.kind_name()),
        }
    }

    pub fn error_ref_mut(&mut self, idx: Idx) -> &mut ErrorRefCell {
        match &mut self.get_mut(idx).data {
            CellData::ErrorRef(e) => e,
            other => unreachable!("expected error-ref cell, found {}", other.kind_name()),
        }
    }

    pub fn coroutine_mut(&mut self, idx: Idx) -> &mut CoroutineCell {
        match &mut self.get_mut(idx).data {
            CellData::Coroutine(c) => c,
            other => unreachable!("expected coroutine cell, found {}", other.kind_name()),
        }
    }

    pub fn coroutine(&self, idx: Idx) -> &CoroutineCell {
        match &self.get(idx).data {
            CellData::Coroutine(c) => c,
            other => unreachable!("expected coroutine cell, found {}", other.kind_name()),
        }
    }

    /// Return trailing free slots to the allocator and relink the free list
    /// by address. HIGH-pressure collections call this.
    pub fn shrink(&mut self) {
        while matches!(self.slots.last(), Some(Slot::Free { .. })) {
            self.slots.pop();
        }
        self.free_head = OptIdx::NONE;
        for i in (0..self.slots.len()).rev() {
            if matches!(self.slots[i], Slot::Free { .. }) {
                self.slots[i] = Slot::Free {
                    next: self.free_head,
                };
                self.free_head = Idx(i as u32).some();
            }
        }
        self.slots.shrink_to_fit();
    }

    // -- reference counting -------------------------------------------------

    pub fn ref_inc(&mut self, idx: Idx) -> Result<(), FatalCode> {
        let cell = self.get_mut(idx);
        cell.refs = cell
            .refs
            .checked_add(1)
            .ok_or(FatalCode::RefCountLimit)?;
        Ok(())
    }

    pub fn ref_dec(&mut self, idx: Idx) {
        let cell = self.get_mut(idx);
        // The cell stays in place at refs == 0; the next collection that
        // cannot reach it frees it.
        cell.refs = cell.refs.saturating_sub(1);
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for slot in &mut self.slots {
            if let Slot::Used(cell) = slot {
                if let CellData::String(s) = &mut cell.data {
                    s.run_free_hook();
                }
            }
        }
        if let Some(hook) = self.on_destroy.take() {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// Allocation entry points (gc-aware)
// ---------------------------------------------------------------------------

/// Allocate a cell, collecting and retrying once on exhaustion. Reports
/// out-of-memory through the port and does not return in that case.
pub fn alloc(ctx: &mut Context, data: CellData) -> Idx {
    if ctx.heap.gc_before_each_alloc {
        gc::collect(ctx, gc::Pressure::High);
    } else if ctx.heap.alloc_since_gc
        > ctx.heap.bytes_limit() / crate::config::GC_NEW_OBJECTS_FRACTION
    {
        gc::collect(ctx, gc::Pressure::Low);
    }
    match ctx.heap.try_alloc(data) {
        Ok(idx) => idx,
        Err(data) => {
            gc::collect(ctx, gc::Pressure::High);
            match ctx.heap.try_alloc(data) {
                Ok(idx) => idx,
                Err(_) => ctx.port().fatal(FatalCode::OutOfMemory),
            }
        }
    }
}

/// Allocate a boxed f64 number cell.
pub fn alloc_number(ctx: &mut Context, n: f64) -> Idx {
    alloc(ctx, CellData::Number(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::StringCell;

    fn tiny_heap() -> Heap {
        Heap::new(4096, false, None)
    }

    #[test]
    fn alloc_and_read_back() {
        let mut heap = tiny_heap();
        let idx = heap.try_alloc(CellData::Number(2.5)).unwrap();
        assert_eq!(heap.number(idx), 2.5);
        assert!(heap.bytes_used() > 0);
    }

    #[test]
    fn free_reuses_slot() {
        let mut heap = tiny_heap();
        let a = heap.try_alloc(CellData::Number(1.0)).unwrap();
        heap.free(a);
        let b = heap.try_alloc(CellData::Number(2.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(heap.number(b), 2.0);
    }

    #[test]
    fn budget_is_enforced() {
        let mut heap = Heap::new(96, false, None);
        let mut allocated = 0;
        while heap.try_alloc(CellData::Number(0.0)).is_ok() {
            allocated += 1;
            assert!(allocated < 1000, "budget never exhausted");
        }
        assert!(allocated >= 1);
    }

    #[test]
    fn string_bytes_are_booked() {
        let mut heap = tiny_heap();
        let before = heap.bytes_used();
        let s = StringCell::from_utf8("hello world".as_bytes().to_vec());
        heap.try_alloc(CellData::String(s)).unwrap();
        assert!(heap.bytes_used() >= before + 11);
    }

    #[test]
    fn refcount_saturates_at_zero() {
        let mut heap = tiny_heap();
        let idx = heap.try_alloc(CellData::Number(1.0)).unwrap();
        heap.ref_dec(idx);
        assert_eq!(heap.get(idx).refs, 0);
        heap.ref_inc(idx).unwrap();
        assert_eq!(heap.get(idx).refs, 1);
    }

    #[test]
    fn destroy_hook_runs_once() {
        use std::cell::Cell as StdCell;
        use std::rc::Rc;
        let fired = Rc::new(StdCell::new(0));
        let fired2 = Rc::clone(&fired);
        let heap = Heap::new(1024, false, Some(Box::new(move || fired2.set(fired2.get() + 1))));
        drop(heap);
        assert_eq!(fired.get(), 1);
    }
}
