/// Object & Property Model
///
/// Objects are heap cells: a small header (flags, prototype cp, property
/// list cp, optional hashmap cp) plus a type-specific payload. Property
/// storage is a chain of two-slot pairs; chains past a threshold get an
/// open-addressed hashmap index attached. Arrays start on a fast path with
/// contiguous element storage and escape to generic property storage the
/// moment the fast invariants break.
///
/// Property names are canonical: an ordinal index below 2^32-1 is the
/// `Index` form, magic-table text is the `Magic` form, and everything else
/// is an interned heap string, so name equality is word equality.
use crate::builtins::BuiltinId;
use crate::config::{CONFIG, FAST_ARRAY_MAX_GAP, PROP_HASHMAP_THRESHOLD};
use crate::context::Context;
use crate::errors::ErrorKind;
use crate::heap::{self, CellData, Idx, OptIdx};
use crate::strings::{self, Magic};
use crate::value::{HeapKind, Value};
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Property names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropName {
    /// Canonical numeric form of an array index below 2^32 - 1.
    Index(u32),
    /// Compile-time magic string id.
    Magic(u16),
    /// Interned heap string.
    Interned(Idx),
    /// Symbol cell.
    Symbol(Idx),
}

impl PropName {
    /// Stable mixing key for the lookup cache and the hashmap.
    pub fn key(self) -> u64 {
        match self {
            PropName::Index(i) => (1u64 << 32) | i as u64,
            PropName::Magic(m) => (2u64 << 32) | m as u64,
            PropName::Interned(idx) => (3u64 << 32) | idx.0 as u64,
            PropName::Symbol(idx) => (4u64 << 32) | idx.0 as u64,
        }
    }
}

/// Canonicalize CESU-8 bytes into a property name.
pub fn prop_name_from_bytes(ctx: &mut Context, bytes: &[u8]) -> PropName {
    if let Some(i) = strings::parse_array_index(bytes) {
        return PropName::Index(i);
    }
    let v = match std::str::from_utf8(bytes) {
        Ok(s) => strings::intern_utf8(ctx, s),
        Err(_) => strings::intern_cesu8(ctx, bytes.to_vec()),
    };
    if v.is_magic_string() {
        PropName::Magic(v.magic_id())
    } else {
        PropName::Interned(Idx(v.heap_cp()))
    }
}

/// ToPropertyKey on an already-primitive value.
pub fn prop_name_from_value(ctx: &mut Context, key: Value) -> PropName {
    if key.is_int() {
        let n = key.as_i30();
        if n >= 0 {
            return PropName::Index(n as u32);
        }
    }
    if key.is_symbol() {
        return PropName::Symbol(Idx(key.heap_cp()));
    }
    if key.is_string() {
        let bytes = strings::bytes_of(ctx, key);
        return prop_name_from_bytes(ctx, &bytes);
    }
    if key.is_heap_kind(HeapKind::Number) {
        let n = ctx.heap.number(Idx(key.heap_cp()));
        let s = strings::number_to_string(n);
        return prop_name_from_bytes(ctx, s.as_bytes());
    }
    // booleans / null / undefined
    let s = if key.is_undefined() {
        "undefined"
    } else if key.is_null() {
        "null"
    } else if key.is_true() {
        "true"
    } else {
        "false"
    };
    prop_name_from_bytes(ctx, s.as_bytes())
}

/// The string/symbol value form of a property name (for traps and errors).
pub fn prop_name_to_value(ctx: &mut Context, name: PropName) -> Value {
    match name {
        PropName::Index(i) => {
            let s = strings::number_to_string(i as f64);
            strings::intern_cesu8(ctx, s.into_bytes())
        }
        PropName::Magic(m) => Value::magic(m),
        PropName::Interned(idx) => idx.value(HeapKind::String),
        PropName::Symbol(idx) => idx.value(HeapKind::Symbol),
    }
}

// ---------------------------------------------------------------------------
// Property slots
// ---------------------------------------------------------------------------

pub const PROP_WRITABLE: u8 = 0x01;
pub const PROP_ENUMERABLE: u8 = 0x02;
pub const PROP_CONFIGURABLE: u8 = 0x04;

pub const PROP_FLAGS_DEFAULT: u8 = PROP_WRITABLE | PROP_ENUMERABLE | PROP_CONFIGURABLE;
pub const PROP_FLAGS_NONE: u8 = 0;

#[derive(Debug, Clone, Copy)]
pub enum PropValue {
    Data(Value),
    Accessor { get: Value, set: Value },
}

#[derive(Debug, Clone, Copy)]
pub struct PropSlot {
    pub name: Option<PropName>,
    pub flags: u8,
    pub value: PropValue,
}

impl PropSlot {
    pub const EMPTY: PropSlot = PropSlot {
        name: None,
        flags: 0,
        value: PropValue::Data(Value::UNDEFINED),
    };

    pub fn is_data(&self) -> bool {
        matches!(self.value, PropValue::Data(_))
    }
}

/// Unit of property storage: always a full pair, the second slot may be
/// empty.
#[derive(Debug)]
pub struct PropertyPair {
    pub next: OptIdx,
    pub slots: [PropSlot; 2],
}

/// Index attached to long chains: name key → (pair cp, slot).
#[derive(Debug, Default)]
pub struct PropHashmap {
    pub map: HashMap<u64, (Idx, u8)>,
}

impl PropHashmap {
    pub fn booked_extra(&self) -> usize {
        self.map.len() * 16
    }
}

// ---------------------------------------------------------------------------
// Object cells
// ---------------------------------------------------------------------------

pub const OBJ_EXTENSIBLE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// One promise reaction: the derived capability and what to run.
#[derive(Debug)]
pub struct Reaction {
    /// Derived promise resolved with the handler result, when present.
    pub capability: Option<Value>,
    pub handler: ReactionHandler,
}

#[derive(Debug)]
pub enum ReactionHandler {
    /// Callable, or identity when undefined.
    Fulfill(Value),
    /// Callable, or rethrow when undefined.
    Reject(Value),
    /// Resume an awaiting coroutine with the settled value.
    AsyncResume { generator: Value },
    /// Resume an awaiting coroutine by throwing the settled value into it.
    AsyncThrow { generator: Value },
}

#[derive(Debug)]
pub struct PromiseData {
    pub state: PromiseState,
    pub result: Value,
    pub fulfill_reactions: Vec<Reaction>,
    pub reject_reactions: Vec<Reaction>,
}

impl PromiseData {
    pub fn new() -> PromiseData {
        PromiseData {
            state: PromiseState::Pending,
            result: Value::UNDEFINED,
            fulfill_reactions: Vec::new(),
            reject_reactions: Vec::new(),
        }
    }
}

impl Default for PromiseData {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoroutineKind {
    Generator,
    Async,
}

/// Element storage of an array object.
#[derive(Debug)]
pub struct ArrayData {
    /// Fast path: contiguous values, `elements.len() == length`, holes are
    /// `Value::HOLE` sentinels and counted.
    pub elements: Vec<Value>,
    pub hole_count: u32,
    pub fast: bool,
    /// Authoritative for the sparse-generic encoding; mirrors
    /// `elements.len()` while fast.
    pub length: u32,
    pub length_writable: bool,
}

impl ArrayData {
    pub fn new_fast() -> ArrayData {
        ArrayData {
            elements: Vec::new(),
            hole_count: 0,
            fast: true,
            length: 0,
            length_writable: true,
        }
    }
}

#[derive(Debug)]
pub enum ObjectExtra {
    None,
    Array(ArrayData),
    /// Scripted function: compiled body + captured lexical environment.
    /// Arrows also capture the creating frame's `this`.
    Function {
        bytecode: Idx,
        env: OptIdx,
        arrow_this: Value,
    },
    /// Embedder-registered handler, indexed into the context registry.
    Native {
        handler: u32,
    },
    /// Built-in routine address: compact (builtin-id, routine-id) pair.
    Routine {
        builtin: BuiltinId,
        routine: u16,
    },
    Bound {
        target: Value,
        this_value: Value,
        args: Box<[Value]>,
    },
    Proxy {
        target: Value,
        handler: Value,
        revoked: bool,
    },
    Error {
        kind: ErrorKind,
    },
    Promise(Box<PromiseData>),
    Generator {
        coroutine: OptIdx,
        kind: CoroutineKind,
        done: bool,
        /// The result promise driven by this coroutine (async functions).
        promise: Value,
    },
    /// ESM record behind this module object.
    Module {
        record: u32,
    },
    /// Module namespace exotic object.
    Namespace {
        record: u32,
    },
}

#[derive(Debug)]
pub struct ObjectCell {
    pub flags: u8,
    pub prototype: OptIdx,
    pub props: OptIdx,
    pub hashmap: OptIdx,
    pub extra: ObjectExtra,
    /// Native pointer finalizer cookie; invoked during sweep.
    pub native_info: Option<NativeInfo>,
}

#[derive(Debug)]
pub struct NativeInfo {
    pub data: *mut std::ffi::c_void,
    pub free_cb: Option<fn(*mut std::ffi::c_void)>,
}

impl ObjectCell {
    pub fn new(prototype: OptIdx, extra: ObjectExtra) -> ObjectCell {
        ObjectCell {
            flags: OBJ_EXTENSIBLE,
            prototype,
            props: OptIdx::NONE,
            hashmap: OptIdx::NONE,
            extra,
            native_info: None,
        }
    }

    pub fn is_extensible(&self) -> bool {
        self.flags & OBJ_EXTENSIBLE != 0
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self.extra,
            ObjectExtra::Function { .. }
                | ObjectExtra::Native { .. }
                | ObjectExtra::Routine { .. }
                | ObjectExtra::Bound { .. }
        )
    }

    pub fn booked_extra(&self) -> usize {
        match &self.extra {
            ObjectExtra::Array(a) => a.elements.capacity() * std::mem::size_of::<Value>(),
            ObjectExtra::Bound { args, .. } => args.len() * std::mem::size_of::<Value>(),
            ObjectExtra::Promise(p) => {
                (p.fulfill_reactions.len() + p.reject_reactions.len()) * 24 + 32
            }
            _ => 0,
        }
    }
}

/// Allocate an object cell and return its index.
pub fn alloc_object(ctx: &mut Context, prototype: OptIdx, extra: ObjectExtra) -> Idx {
    heap::alloc(ctx, CellData::Object(Box::new(ObjectCell::new(prototype, extra))))
}

pub fn alloc_object_value(ctx: &mut Context, prototype: OptIdx, extra: ObjectExtra) -> Value {
    alloc_object(ctx, prototype, extra).value(HeapKind::Object)
}

pub fn is_callable(ctx: &Context, v: Value) -> bool {
    v.is_object_ref() && ctx.heap.object(Idx(v.heap_cp())).is_callable()
}

// ---------------------------------------------------------------------------
// Own property lookup
// ---------------------------------------------------------------------------

/// Locate an own property slot: (pair cp, slot index). Consults the lookup
/// cache, then the hashmap index, then walks the chain.
pub fn find_own(ctx: &mut Context, obj: Idx, name: PropName) -> Option<(Idx, u8)> {
    if CONFIG.lookup_cache {
        if let Some(hit) = ctx.lookup_cache.probe(obj, name) {
            return Some(hit);
        }
    }
    let found = find_own_uncached(ctx, obj, name);
    if CONFIG.lookup_cache {
        if let Some((pair, slot)) = found {
            ctx.lookup_cache.insert(obj, name, pair, slot);
        }
    }
    found
}

fn find_own_uncached(ctx: &Context, obj: Idx, name: PropName) -> Option<(Idx, u8)> {
    let cell = ctx.heap.object(obj);
    if let Some(hm) = cell.hashmap.get() {
        return ctx.heap.hashmap(hm).map.get(&name.key()).copied();
    }
    let mut cursor = cell.props;
    while let Some(pair_idx) = cursor.get() {
        let pair = ctx.heap.pair(pair_idx);
        for slot in 0..2u8 {
            if pair.slots[slot as usize].name == Some(name) {
                return Some((pair_idx, slot));
            }
        }
        cursor = pair.next;
    }
    None
}

/// Copy out an own property slot.
pub fn own_slot(ctx: &mut Context, obj: Idx, name: PropName) -> Option<PropSlot> {
    find_own(ctx, obj, name).map(|(pair, slot)| ctx.heap.pair(pair).slots[slot as usize])
}

/// Number of own properties in the chain.
fn chain_len(ctx: &Context, obj: Idx) -> usize {
    let mut n = 0;
    let mut cursor = ctx.heap.object(obj).props;
    while let Some(pair_idx) = cursor.get() {
        let pair = ctx.heap.pair(pair_idx);
        n += pair.slots.iter().filter(|s| s.name.is_some()).count();
        cursor = pair.next;
    }
    n
}

/// Insert a new own property. Caller guarantees the name is not present.
pub fn add_own(ctx: &mut Context, obj: Idx, name: PropName, flags: u8, value: PropValue) {
    ctx.lookup_cache.invalidate();
    let slot = PropSlot {
        name: Some(name),
        flags,
        value,
    };

    // Reuse the first empty slot, remembering the chain tail: insertion
    // order is preserved by appending pairs at the tail.
    let mut cursor = ctx.heap.object(obj).props;
    let mut tail: Option<Idx> = None;
    let mut empty: Option<(Idx, u8)> = None;
    while let Some(pair_idx) = cursor.get() {
        let pair = ctx.heap.pair(pair_idx);
        if empty.is_none() {
            for s in 0..2u8 {
                if pair.slots[s as usize].name.is_none() {
                    empty = Some((pair_idx, s));
                    break;
                }
            }
        }
        tail = Some(pair_idx);
        cursor = pair.next;
    }

    let (pair_idx, slot_no) = match empty {
        Some((pair_idx, s)) => {
            ctx.heap.pair_mut(pair_idx).slots[s as usize] = slot;
            (pair_idx, s)
        }
        None => {
            let pair = PropertyPair {
                next: OptIdx::NONE,
                slots: [slot, PropSlot::EMPTY],
            };
            let new_idx = heap::alloc(ctx, CellData::Pair(Box::new(pair)));
            match tail {
                Some(t) => ctx.heap.pair_mut(t).next = new_idx.some(),
                None => ctx.heap.object_mut(obj).props = new_idx.some(),
            }
            (new_idx, 0)
        }
    };

    if CONFIG.property_hashmap {
        if let Some(hm) = ctx.heap.object(obj).hashmap.get() {
            ctx.heap
                .hashmap_mut(hm)
                .map
                .insert(name.key(), (pair_idx, slot_no));
        } else if chain_len(ctx, obj) > PROP_HASHMAP_THRESHOLD {
            attach_hashmap(ctx, obj);
        }
    }
}

/// Build and attach the hashmap index by rescanning the chain. One lookup
/// per key; keys already present are simply overwritten.
fn attach_hashmap(ctx: &mut Context, obj: Idx) {
    let mut map = HashMap::new();
    let mut cursor = ctx.heap.object(obj).props;
    while let Some(pair_idx) = cursor.get() {
        let pair = ctx.heap.pair(pair_idx);
        for s in 0..2u8 {
            if let Some(name) = pair.slots[s as usize].name {
                map.insert(name.key(), (pair_idx, s));
            }
        }
        cursor = pair.next;
    }
    let hm = heap::alloc(ctx, CellData::Hashmap(Box::new(PropHashmap { map })));
    ctx.heap.object_mut(obj).hashmap = hm.some();
}

/// Remove an own property. Returns whether it existed.
pub fn delete_own(ctx: &mut Context, obj: Idx, name: PropName) -> bool {
    let found = find_own(ctx, obj, name);
    let Some((pair_idx, slot)) = found else {
        return false;
    };
    ctx.lookup_cache.invalidate();
    ctx.heap.pair_mut(pair_idx).slots[slot as usize] = PropSlot::EMPTY;
    if let Some(hm) = ctx.heap.object(obj).hashmap.get() {
        ctx.heap.hashmap_mut(hm).map.remove(&name.key());
    }
    true
}

/// Overwrite the value of an existing data slot.
pub fn write_slot_value(ctx: &mut Context, pair: Idx, slot: u8, value: Value) {
    ctx.lookup_cache.invalidate();
    ctx.heap.pair_mut(pair).slots[slot as usize].value = PropValue::Data(value);
}

/// Own property names in spec order: integer indices ascending, then string
/// keys in insertion order, then symbols.
pub fn own_property_names(ctx: &Context, obj: Idx) -> Vec<PropName> {
    let mut indices: Vec<u32> = Vec::new();
    let mut strings_in_order: Vec<PropName> = Vec::new();
    let mut symbols: Vec<PropName> = Vec::new();

    if let ObjectExtra::Array(a) = &ctx.heap.object(obj).extra {
        if a.fast {
            for (i, v) in a.elements.iter().enumerate() {
                if !v.is_hole() {
                    indices.push(i as u32);
                }
            }
        }
    }

    let mut cursor = ctx.heap.object(obj).props;
    while let Some(pair_idx) = cursor.get() {
        let pair = ctx.heap.pair(pair_idx);
        for s in 0..2 {
            match pair.slots[s].name {
                Some(PropName::Index(i)) => indices.push(i),
                Some(n @ (PropName::Magic(_) | PropName::Interned(_))) => {
                    strings_in_order.push(n)
                }
                Some(n @ PropName::Symbol(_)) => symbols.push(n),
                None => {}
            }
        }
        cursor = pair.next;
    }

    indices.sort_unstable();
    let mut out: Vec<PropName> = indices.into_iter().map(PropName::Index).collect();
    out.extend(strings_in_order);
    out.extend(symbols);
    out
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// A partially-filled property descriptor, the argument shape of
/// `define_own_property`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PropDescriptor {
    pub value: Option<Value>,
    pub get: Option<Value>,
    pub set: Option<Value>,
    pub writable: Option<bool>,
    pub enumerable: Option<bool>,
    pub configurable: Option<bool>,
}

impl PropDescriptor {
    pub fn data(value: Value, flags: u8) -> PropDescriptor {
        PropDescriptor {
            value: Some(value),
            writable: Some(flags & PROP_WRITABLE != 0),
            enumerable: Some(flags & PROP_ENUMERABLE != 0),
            configurable: Some(flags & PROP_CONFIGURABLE != 0),
            ..Default::default()
        }
    }

    pub fn is_accessor(&self) -> bool {
        self.get.is_some() || self.set.is_some()
    }

    pub fn is_data(&self) -> bool {
        self.value.is_some() || self.writable.is_some()
    }

    fn flags(&self, current: u8) -> u8 {
        let mut f = current;
        if let Some(w) = self.writable {
            f = if w { f | PROP_WRITABLE } else { f & !PROP_WRITABLE };
        }
        if let Some(e) = self.enumerable {
            f = if e { f | PROP_ENUMERABLE } else { f & !PROP_ENUMERABLE };
        }
        if let Some(c) = self.configurable {
            f = if c {
                f | PROP_CONFIGURABLE
            } else {
                f & !PROP_CONFIGURABLE
            };
        }
        f
    }
}

/// OrdinaryDefineOwnProperty, including the reject matrix for incompatible
/// redefinition. Returns `Ok(false)` instead of throwing; callers that need
/// the throwing flavour wrap it.
pub fn define_own_property(
    ctx: &mut Context,
    obj: Idx,
    name: PropName,
    desc: &PropDescriptor,
) -> Result<bool, Value> {
    // Arrays funnel through their own path first to keep the fast encoding
    // honest.
    if let ObjectExtra::Array(_) = &ctx.heap.object(obj).extra {
        if let PropName::Index(i) = name {
            return array_define_index(ctx, obj, i, desc);
        }
        if name == PropName::Magic(Magic::Length as u16) {
            return array_define_length(ctx, obj, desc);
        }
        // Named property on an array breaks the fast path.
        array_escape_fast(ctx, obj);
    }

    define_own_property_ordinary(ctx, obj, name, desc)
}

fn define_own_property_ordinary(
    ctx: &mut Context,
    obj: Idx,
    name: PropName,
    desc: &PropDescriptor,
) -> Result<bool, Value> {
    let current = own_slot(ctx, obj, name);

    let Some(current) = current else {
        if !ctx.heap.object(obj).is_extensible() {
            return Ok(false);
        }
        let flags = desc.flags(PROP_FLAGS_NONE);
        let value = if desc.is_accessor() {
            PropValue::Accessor {
                get: desc.get.unwrap_or(Value::UNDEFINED),
                set: desc.set.unwrap_or(Value::UNDEFINED),
            }
        } else {
            PropValue::Data(desc.value.unwrap_or(Value::UNDEFINED))
        };
        add_own(ctx, obj, name, flags, value);
        return Ok(true);
    };

    let cfg = current.flags & PROP_CONFIGURABLE != 0;
    let writable = current.flags & PROP_WRITABLE != 0;

    // Re-defining with an empty descriptor always succeeds.
    let wants_change = desc.value.is_some()
        || desc.get.is_some()
        || desc.set.is_some()
        || desc.writable.is_some()
        || desc.enumerable.is_some()
        || desc.configurable.is_some();
    if !wants_change {
        return Ok(true);
    }

    if !cfg {
        if desc.configurable == Some(true) {
            return Ok(false);
        }
        if let Some(e) = desc.enumerable {
            if e != (current.flags & PROP_ENUMERABLE != 0) {
                return Ok(false);
            }
        }
        // Kind flips are rejected on non-configurable slots.
        if desc.is_accessor() && current.is_data() {
            return Ok(false);
        }
        if desc.is_data() && !current.is_data() {
            return Ok(false);
        }
        match current.value {
            PropValue::Data(cur_v) => {
                if !writable {
                    if desc.writable == Some(true) {
                        return Ok(false);
                    }
                    if let Some(new_v) = desc.value {
                        if !same_value(ctx, cur_v, new_v) {
                            return Ok(false);
                        }
                    }
                }
            }
            PropValue::Accessor { get, set } => {
                if let Some(new_get) = desc.get {
                    if new_get != get {
                        return Ok(false);
                    }
                }
                if let Some(new_set) = desc.set {
                    if new_set != set {
                        return Ok(false);
                    }
                }
            }
        }
    }

    // Apply.
    let (pair, slot) = find_own(ctx, obj, name).expect("slot vanished during define");
    ctx.lookup_cache.invalidate();
    let slot_ref = &mut ctx.heap.pair_mut(pair).slots[slot as usize];
    slot_ref.flags = desc.flags(current.flags);
    if desc.is_accessor() {
        let (old_get, old_set) = match current.value {
            PropValue::Accessor { get, set } => (get, set),
            PropValue::Data(_) => (Value::UNDEFINED, Value::UNDEFINED),
        };
        slot_ref.value = PropValue::Accessor {
            get: desc.get.unwrap_or(old_get),
            set: desc.set.unwrap_or(old_set),
        };
    } else if let Some(v) = desc.value {
        slot_ref.value = PropValue::Data(v);
    } else if desc.is_data() && !current.is_data() {
        slot_ref.value = PropValue::Data(Value::UNDEFINED);
    }
    Ok(true)
}

/// SameValue, with the heap on hand for boxed numbers and strings.
pub fn same_value(ctx: &Context, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    if a.is_number() && b.is_number() {
        let x = number_of(ctx, a);
        let y = number_of(ctx, b);
        if x.is_nan() && y.is_nan() {
            return true;
        }
        return x == y && x.is_sign_positive() == y.is_sign_positive();
    }
    if a.is_string() && b.is_string() {
        return strings::string_eq(ctx, a, b);
    }
    false
}

/// f64 view of any number value.
pub fn number_of(ctx: &Context, v: Value) -> f64 {
    if v.is_int() {
        v.as_i30() as f64
    } else {
        ctx.heap.number(Idx(v.heap_cp()))
    }
}

// ---------------------------------------------------------------------------
// Prototype chain
// ---------------------------------------------------------------------------

pub fn get_prototype_of(ctx: &Context, obj: Idx) -> OptIdx {
    ctx.heap.object(obj).prototype
}

/// OrdinarySetPrototypeOf with cycle rejection.
pub fn set_prototype_of(ctx: &mut Context, obj: Idx, proto: OptIdx) -> bool {
    if ctx.heap.object(obj).prototype == proto {
        return true;
    }
    if !ctx.heap.object(obj).is_extensible() {
        return false;
    }
    // Walk the would-be chain; meeting `obj` again means a cycle.
    let mut cursor = proto;
    while let Some(p) = cursor.get() {
        if p == obj {
            return false;
        }
        // Proxies stop the walk per OrdinarySetPrototypeOf.
        if matches!(ctx.heap.object(p).extra, ObjectExtra::Proxy { .. }) {
            break;
        }
        cursor = ctx.heap.object(p).prototype;
    }
    ctx.lookup_cache.invalidate();
    ctx.heap.object_mut(obj).prototype = proto;
    true
}

// ---------------------------------------------------------------------------
// Fast arrays
// ---------------------------------------------------------------------------

pub fn alloc_array(ctx: &mut Context, elements: Vec<Value>) -> Value {
    let proto = ctx.realm.array_prototype;
    let len = elements.len() as u32;
    let mut data = ArrayData::new_fast();
    data.elements = elements;
    data.length = len;
    alloc_object_value(ctx, proto, ObjectExtra::Array(data))
}

pub fn array_data(ctx: &Context, obj: Idx) -> &ArrayData {
    match &ctx.heap.object(obj).extra {
        ObjectExtra::Array(a) => a,
        _ => unreachable!("expected array object"),
    }
}

pub fn array_data_mut(ctx: &mut Context, obj: Idx) -> &mut ArrayData {
    match &mut ctx.heap.object_mut(obj).extra {
        ObjectExtra::Array(a) => a,
        _ => unreachable!("expected array object"),
    }
}

/// Convert fast element storage into generic indexed properties. After this
/// the property machinery serves reads; values are identical to what the
/// fast path produced.
pub fn array_escape_fast(ctx: &mut Context, obj: Idx) {
    let (elements, was_fast) = {
        let a = array_data_mut(ctx, obj);
        if !a.fast {
            return;
        }
        a.fast = false;
        a.hole_count = 0;
        (std::mem::take(&mut a.elements), true)
    };
    debug_assert!(was_fast);
    for (i, v) in elements.into_iter().enumerate() {
        if !v.is_hole() {
            add_own(ctx, obj, PropName::Index(i as u32), PROP_FLAGS_DEFAULT, PropValue::Data(v));
        }
    }
}

/// Fast-path element read. `NOT_FOUND` falls through to the generic walk.
pub fn array_fast_get(ctx: &Context, obj: Idx, index: u32) -> Value {
    let a = array_data(ctx, obj);
    if !a.fast {
        return Value::NOT_FOUND;
    }
    match a.elements.get(index as usize) {
        Some(v) if !v.is_hole() => *v,
        _ => Value::NOT_FOUND,
    }
}

/// Fast-path element write; keeps `length == capacity`. Returns false when
/// the write must take the generic path.
pub fn array_fast_set(ctx: &mut Context, obj: Idx, index: u32, value: Value) -> bool {
    let a = array_data_mut(ctx, obj);
    if !a.fast {
        return false;
    }
    let len = a.elements.len() as u32;
    if index < len {
        let slot = &mut a.elements[index as usize];
        if slot.is_hole() {
            a.hole_count -= 1;
        }
        *slot = value;
        return true;
    }
    if index == len {
        a.elements.push(value);
        a.length = len + 1;
        return true;
    }
    if index - len <= FAST_ARRAY_MAX_GAP {
        for _ in len..index {
            a.elements.push(Value::HOLE);
            a.hole_count += 1;
        }
        a.elements.push(value);
        a.length = index + 1;
        return true;
    }
    // Distant write: leave the fast encoding.
    array_escape_fast(ctx, obj);
    false
}

fn array_define_index(
    ctx: &mut Context,
    obj: Idx,
    index: u32,
    desc: &PropDescriptor,
) -> Result<bool, Value> {
    let plain_data = !desc.is_accessor()
        && desc.writable != Some(false)
        && desc.enumerable != Some(false)
        && desc.configurable != Some(false);
    if array_data(ctx, obj).fast {
        if plain_data {
            if array_fast_set(ctx, obj, index, desc.value.unwrap_or(Value::UNDEFINED)) {
                return Ok(true);
            }
        } else {
            // Accessor or restricted attribute on an element: escape.
            array_escape_fast(ctx, obj);
        }
    }
    let res = define_own_property_ordinary(ctx, obj, PropName::Index(index), desc)?;
    if res {
        let a = array_data_mut(ctx, obj);
        if index >= a.length {
            a.length = index + 1;
        }
    }
    Ok(res)
}

fn array_define_length(ctx: &mut Context, obj: Idx, desc: &PropDescriptor) -> Result<bool, Value> {
    let Some(new_len_value) = desc.value else {
        if desc.writable == Some(false) {
            array_data_mut(ctx, obj).length_writable = false;
        }
        return Ok(true);
    };
    let n = number_of(ctx, new_len_value);
    let new_len = n as u32;
    if new_len as f64 != n {
        return Err(crate::builtins::make_error(
            ctx,
            ErrorKind::RangeError,
            "invalid array length",
        ));
    }
    if !array_data(ctx, obj).length_writable {
        return Ok(false);
    }
    set_array_length(ctx, obj, new_len);
    if desc.writable == Some(false) {
        array_data_mut(ctx, obj).length_writable = false;
    }
    Ok(true)
}

/// Truncate or grow. On the generic encoding a shrink deletes configurable
/// indexed properties above the new length and stops at the first one that
/// refuses.
pub fn set_array_length(ctx: &mut Context, obj: Idx, new_len: u32) {
    let fast = array_data(ctx, obj).fast;
    if fast {
        let a = array_data_mut(ctx, obj);
        let old = a.elements.len() as u32;
        if new_len < old {
            for v in a.elements.drain(new_len as usize..) {
                if v.is_hole() {
                    a.hole_count -= 1;
                }
            }
        } else {
            let gap = new_len - old;
            if gap > FAST_ARRAY_MAX_GAP {
                a.length = new_len;
                array_escape_fast(ctx, obj);
                return;
            }
            for _ in old..new_len {
                a.elements.push(Value::HOLE);
                a.hole_count += 1;
            }
        }
        a.length = new_len;
        return;
    }

    let old = array_data(ctx, obj).length;
    if new_len < old {
        let names = own_property_names(ctx, obj);
        let mut floor = new_len;
        for name in names.into_iter().rev() {
            if let PropName::Index(i) = name {
                if i >= new_len {
                    if let Some(slot) = own_slot(ctx, obj, name) {
                        if slot.flags & PROP_CONFIGURABLE == 0 {
                            // A non-configurable element pins length just
                            // above itself.
                            floor = floor.max(i + 1);
                            continue;
                        }
                    }
                    delete_own(ctx, obj, name);
                }
            }
        }
        array_data_mut(ctx, obj).length = floor;
    } else {
        array_data_mut(ctx, obj).length = new_len;
    }
}

/// The §3 fast-array invariant, as a checkable predicate.
pub fn array_is_fast(ctx: &Context, obj: Idx) -> bool {
    let a = array_data(ctx, obj);
    a.fast && a.elements.len() as u32 == a.length
}

// ---------------------------------------------------------------------------
// Symbols
// ---------------------------------------------------------------------------

pub fn alloc_symbol(ctx: &mut Context, description: Value) -> Value {
    let idx = heap::alloc(
        ctx,
        CellData::Symbol(crate::heap::SymbolCell { description }),
    );
    idx.value(HeapKind::Symbol)
}

// ---------------------------------------------------------------------------
// Proxy helpers (trap resolution lives in builtins; state here)
// ---------------------------------------------------------------------------

pub fn alloc_proxy(ctx: &mut Context, target: Value, handler: Value) -> Value {
    alloc_object_value(
        ctx,
        OptIdx::NONE,
        ObjectExtra::Proxy {
            target,
            handler,
            revoked: false,
        },
    )
}

/// Clear both slots; later operations throw.
pub fn proxy_revoke(ctx: &mut Context, obj: Idx) {
    if let ObjectExtra::Proxy {
        target,
        handler,
        revoked,
    } = &mut ctx.heap.object_mut(obj).extra
    {
        *target = Value::NULL;
        *handler = Value::NULL;
        *revoked = true;
    }
}

pub fn proxy_parts(ctx: &Context, obj: Idx) -> Option<(Value, Value, bool)> {
    match &ctx.heap.object(obj).extra {
        ObjectExtra::Proxy {
            target,
            handler,
            revoked,
        } => Some((*target, *handler, *revoked)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Function objects
// ---------------------------------------------------------------------------

pub fn alloc_function(
    ctx: &mut Context,
    bytecode: Idx,
    env: OptIdx,
    arrow_this: Value,
) -> Value {
    let proto = ctx.realm.function_prototype;
    alloc_object_value(
        ctx,
        proto,
        ObjectExtra::Function {
            bytecode,
            env,
            arrow_this,
        },
    )
}

pub fn alloc_routine(ctx: &mut Context, builtin: BuiltinId, routine: u16) -> Value {
    let proto = ctx.realm.function_prototype;
    alloc_object_value(ctx, proto, ObjectExtra::Routine { builtin, routine })
}

/// Bytecode behind a scripted function value, if any.
pub fn function_bytecode(ctx: &Context, v: Value) -> Option<Rc<crate::bytecode::ByteCode>> {
    if !v.is_object_ref() {
        return None;
    }
    match &ctx.heap.object(Idx(v.heap_cp())).extra {
        ObjectExtra::Function { bytecode, .. } => Some(ctx.heap.bytecode(*bytecode)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn prop_name_canonical_forms() {
        let mut ctx = Context::new(Default::default()).unwrap();
        assert_eq!(prop_name_from_bytes(&mut ctx, b"0"), PropName::Index(0));
        assert_eq!(prop_name_from_bytes(&mut ctx, b"42"), PropName::Index(42));
        assert_eq!(
            prop_name_from_bytes(&mut ctx, b"length"),
            PropName::Magic(Magic::Length as u16)
        );
        // leading zero is not canonical
        assert!(matches!(
            prop_name_from_bytes(&mut ctx, b"01"),
            PropName::Interned(_)
        ));
        // the same text interns to the same name
        let a = prop_name_from_bytes(&mut ctx, b"payload");
        let b = prop_name_from_bytes(&mut ctx, b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn add_find_delete_round_trip() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let obj = alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        let name = prop_name_from_bytes(&mut ctx, b"answer");
        assert!(own_slot(&mut ctx, obj, name).is_none());
        add_own(
            &mut ctx,
            obj,
            name,
            PROP_FLAGS_DEFAULT,
            PropValue::Data(Value::from_i30(42)),
        );
        let slot = own_slot(&mut ctx, obj, name).unwrap();
        assert!(matches!(slot.value, PropValue::Data(v) if v == Value::from_i30(42)));
        assert!(delete_own(&mut ctx, obj, name));
        assert!(own_slot(&mut ctx, obj, name).is_none());
    }

    #[test]
    fn hashmap_attaches_past_threshold() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let obj = alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        for i in 0..(PROP_HASHMAP_THRESHOLD + 4) {
            let name = prop_name_from_bytes(&mut ctx, format!("k{}", i).as_bytes());
            add_own(
                &mut ctx,
                obj,
                name,
                PROP_FLAGS_DEFAULT,
                PropValue::Data(Value::from_i30(i as i32)),
            );
        }
        assert!(ctx.heap.object(obj).hashmap.get().is_some());
        let name = prop_name_from_bytes(&mut ctx, b"k7");
        let slot = own_slot(&mut ctx, obj, name).unwrap();
        assert!(matches!(slot.value, PropValue::Data(v) if v == Value::from_i30(7)));
    }

    #[test]
    fn define_rejects_incompatible_redefinition() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let obj = alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        let name = prop_name_from_bytes(&mut ctx, b"fixed");
        let desc = PropDescriptor {
            value: Some(Value::from_i30(1)),
            writable: Some(false),
            enumerable: Some(false),
            configurable: Some(false),
            ..Default::default()
        };
        assert_eq!(define_own_property(&mut ctx, obj, name, &desc), Ok(true));
        // value change on non-writable non-configurable → reject
        let change = PropDescriptor {
            value: Some(Value::from_i30(2)),
            ..Default::default()
        };
        assert_eq!(define_own_property(&mut ctx, obj, name, &change), Ok(false));
        // same value → accept
        let same = PropDescriptor {
            value: Some(Value::from_i30(1)),
            ..Default::default()
        };
        assert_eq!(define_own_property(&mut ctx, obj, name, &same), Ok(true));
        // flip to accessor → reject
        let acc = PropDescriptor {
            get: Some(Value::UNDEFINED),
            ..Default::default()
        };
        assert_eq!(define_own_property(&mut ctx, obj, name, &acc), Ok(false));
    }

    #[test]
    fn prototype_cycle_rejected() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let a = alloc_object(&mut ctx, OptIdx::NONE, ObjectExtra::None);
        let b = alloc_object(&mut ctx, a.some(), ObjectExtra::None);
        assert!(!set_prototype_of(&mut ctx, a, b.some()));
        assert!(set_prototype_of(&mut ctx, a, OptIdx::NONE));
    }

    #[test]
    fn fast_array_append_and_gap() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let arr = alloc_array(&mut ctx, vec![]);
        let obj = Idx(arr.heap_cp());
        for i in 0..100u32 {
            assert!(array_fast_set(&mut ctx, obj, i, Value::from_i30(i as i32)));
        }
        assert!(array_is_fast(&ctx, obj));
        assert_eq!(array_data(&ctx, obj).length, 100);
        assert_eq!(array_fast_get(&ctx, obj, 7), Value::from_i30(7));

        // Distant write escapes the fast encoding.
        assert!(!array_fast_set(&mut ctx, obj, 10_000, Value::TRUE));
        assert!(!array_data(&ctx, obj).fast);
        // Generic reads still see the fast-era values.
        let name = PropName::Index(7);
        let slot = own_slot(&mut ctx, obj, name).unwrap();
        assert!(matches!(slot.value, PropValue::Data(v) if v == Value::from_i30(7)));
    }

    #[test]
    fn named_prop_escapes_fast_array() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let arr = alloc_array(&mut ctx, vec![Value::from_i30(1), Value::from_i30(2)]);
        let obj = Idx(arr.heap_cp());
        assert!(array_is_fast(&ctx, obj));
        let name = prop_name_from_bytes(&mut ctx, b"tag");
        define_own_property(
            &mut ctx,
            obj,
            name,
            &PropDescriptor::data(Value::TRUE, PROP_FLAGS_DEFAULT),
        )
        .unwrap();
        assert!(!array_data(&ctx, obj).fast);
        let slot = own_slot(&mut ctx, obj, PropName::Index(1)).unwrap();
        assert!(matches!(slot.value, PropValue::Data(v) if v == Value::from_i30(2)));
    }
}
