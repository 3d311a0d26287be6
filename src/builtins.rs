/// Built-ins — Abstract Operations & Routine Dispatcher
///
/// Every built-in function object stores a compact (builtin-id, routine-id)
/// pair; the call path resolves the pair through `dispatch_routine` to one
/// handler, so a built-in invocation costs a single indirect dispatch and
/// related routines (`forEach`/`every`/`some`) share their implementation.
///
/// The first half of this file is the ECMA abstract-operation layer the VM
/// leans on: conversions, equality, relational compare, and the full
/// property access paths (primitives, arrays, accessors, prototype chains,
/// proxy traps). The second half wires the realm and implements the routine
/// tables.
use crate::config::CONFIG;
use crate::context::Context;
use crate::errors::ErrorKind;
use crate::gc;
use crate::heap::{Idx, OptIdx};
use crate::jobs;
use crate::object::{
    self, ObjectExtra, PropDescriptor, PropName, PropValue, PROP_CONFIGURABLE, PROP_ENUMERABLE,
    PROP_FLAGS_DEFAULT, PROP_WRITABLE,
};
use crate::platform::LogLevel;
use crate::strings::{self, Magic, StringBuilder};
use crate::value::{HeapKind, Value};
use crate::vm;

// ---------------------------------------------------------------------------
// Builtin ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinId {
    Global,
    Console,
    ObjectCtor,
    ObjectProto,
    FunctionProto,
    ArrayCtor,
    ArrayProto,
    StringCtor,
    StringProto,
    NumberCtor,
    NumberProto,
    BooleanCtor,
    BooleanProto,
    SymbolCtor,
    MathObj,
    DateObj,
    ErrorCtor,
    ErrorProto,
    PromiseCtor,
    PromiseProto,
    GeneratorProto,
    ProxyCtor,
}

// ---------------------------------------------------------------------------
// Error construction
// ---------------------------------------------------------------------------

/// Build a standard error object: prototype from the realm, `message` when
/// error messages are compiled in, `stack` from the live frames when line
/// info is on, then the embedder decorator.
pub fn make_error(ctx: &mut Context, kind: ErrorKind, message: &str) -> Value {
    let proto = ctx.realm.error_prototypes[kind as usize];
    let err = object::alloc_object_value(ctx, proto, ObjectExtra::Error { kind });
    let mark = ctx.roots_mark();
    ctx.root(err);
    let obj = Idx(err.heap_cp());
    if CONFIG.error_messages && !message.is_empty() {
        let msg = strings::alloc_utf8(ctx, message);
        object::add_own(
            ctx,
            obj,
            PropName::Magic(Magic::Message as u16),
            PROP_WRITABLE | PROP_CONFIGURABLE,
            PropValue::Data(msg),
        );
    }
    if CONFIG.line_info {
        let trace = vm::capture_backtrace(ctx);
        let stack = strings::alloc_utf8(ctx, &trace);
        object::add_own(
            ctx,
            obj,
            PropName::Magic(Magic::Stack as u16),
            PROP_WRITABLE | PROP_CONFIGURABLE,
            PropValue::Data(stack),
        );
    }
    if let Some(decorator) = ctx.error_decorator.clone() {
        decorator(ctx, err);
    }
    ctx.roots_release(mark);
    err
}

pub fn make_regexp_object(ctx: &mut Context, pattern: Value, flags: Value) -> Value {
    let proto = ctx.realm.object_prototype;
    let obj = object::alloc_object_value(ctx, proto, ObjectExtra::None);
    let mark = ctx.roots_mark();
    ctx.root(obj);
    let idx = Idx(obj.heap_cp());
    let source_name = object::prop_name_from_bytes(ctx, b"source");
    object::add_own(ctx, idx, source_name, PROP_CONFIGURABLE, PropValue::Data(pattern));
    let flags_name = object::prop_name_from_bytes(ctx, b"flags");
    object::add_own(ctx, idx, flags_name, PROP_CONFIGURABLE, PropValue::Data(flags));
    let li = object::prop_name_from_bytes(ctx, b"lastIndex");
    object::add_own(ctx, idx, li, PROP_WRITABLE, PropValue::Data(Value::from_i30(0)));
    ctx.roots_release(mark);
    obj
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

pub fn make_number(ctx: &mut Context, n: f64) -> Value {
    let as_int = n as i32;
    if as_int as f64 == n && Value::fits_i30(as_int) && !(n == 0.0 && n.is_sign_negative()) {
        Value::from_i30(as_int)
    } else {
        crate::heap::alloc_number(ctx, n).value(HeapKind::Number)
    }
}

pub fn to_boolean(ctx: &Context, v: Value) -> bool {
    if v.is_undefined() || v.is_null() || v == Value::FALSE {
        return false;
    }
    if v == Value::TRUE {
        return true;
    }
    if v.is_int() {
        return v.as_i30() != 0;
    }
    if v.is_heap_kind(HeapKind::Number) {
        let n = ctx.heap.number(Idx(v.heap_cp()));
        return n != 0.0 && !n.is_nan();
    }
    if v.is_string() {
        return !strings::bytes_of(ctx, v).is_empty();
    }
    true
}

/// OrdinaryToPrimitive. `number_hint` selects the valueOf-first order.
pub fn to_primitive(ctx: &mut Context, v: Value, number_hint: bool) -> Result<Value, Value> {
    if !v.is_object_ref() {
        return Ok(v);
    }
    let methods: [Magic; 2] = if number_hint {
        [Magic::ValueOf, Magic::ToString]
    } else {
        [Magic::ToString, Magic::ValueOf]
    };
    for m in methods {
        let f = op_get_property_name(ctx, v, PropName::Magic(m as u16))?;
        if object::is_callable(ctx, f) {
            let r = vm::call_function(ctx, f, v, &[])?;
            if !r.is_object_ref() {
                return Ok(r);
            }
        }
    }
    Err(make_error(
        ctx,
        ErrorKind::TypeError,
        "cannot convert object to primitive value",
    ))
}

pub fn to_number(ctx: &mut Context, v: Value) -> Result<f64, Value> {
    if v.is_int() {
        return Ok(v.as_i30() as f64);
    }
    if v.is_heap_kind(HeapKind::Number) {
        return Ok(ctx.heap.number(Idx(v.heap_cp())));
    }
    if v.is_undefined() {
        return Ok(f64::NAN);
    }
    if v.is_null() {
        return Ok(0.0);
    }
    if v.is_bool() {
        return Ok(if v.as_bool() { 1.0 } else { 0.0 });
    }
    if v.is_string() {
        let s = strings::to_rust_string(ctx, v);
        return Ok(strings::string_to_number(&s));
    }
    if v.is_symbol() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "cannot convert a Symbol to a number",
        ));
    }
    let prim = to_primitive(ctx, v, true)?;
    to_number(ctx, prim)
}

pub fn to_int32(ctx: &mut Context, v: Value) -> Result<i32, Value> {
    let n = to_number(ctx, v)?;
    if !n.is_finite() {
        return Ok(0);
    }
    Ok(n as i64 as i32)
}

pub fn to_uint32(ctx: &mut Context, v: Value) -> Result<u32, Value> {
    Ok(to_int32(ctx, v)? as u32)
}

/// ToString producing an engine string value.
pub fn to_string_value(ctx: &mut Context, v: Value) -> Result<Value, Value> {
    if v.is_string() {
        return Ok(v);
    }
    if v.is_undefined() {
        return Ok(strings::magic_value(Magic::Undefined));
    }
    if v.is_null() {
        return Ok(strings::magic_value(Magic::Null));
    }
    if v.is_bool() {
        return Ok(strings::magic_value(if v.as_bool() {
            Magic::True
        } else {
            Magic::False
        }));
    }
    if v.is_number() {
        let n = object::number_of(ctx, v);
        let s = strings::number_to_string(n);
        return Ok(strings::alloc_utf8(ctx, &s));
    }
    if v.is_symbol() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "cannot convert a Symbol to a string",
        ));
    }
    let prim = to_primitive(ctx, v, false)?;
    to_string_value(ctx, prim)
}

/// Rust-string rendition for diagnostics and host logging; does not run
/// user code (objects render by tag).
pub fn to_display_string(ctx: &Context, v: Value) -> String {
    if v.is_string() {
        return strings::to_rust_string(ctx, v);
    }
    if v.is_undefined() {
        return "undefined".to_string();
    }
    if v.is_null() {
        return "null".to_string();
    }
    if v.is_bool() {
        return if v.as_bool() { "true" } else { "false" }.to_string();
    }
    if v.is_number() {
        return strings::number_to_string(object::number_of(ctx, v));
    }
    if v.is_symbol() {
        return "Symbol(...)".to_string();
    }
    if v.is_exception() {
        return "<exception>".to_string();
    }
    match &ctx.heap.object(Idx(v.heap_cp())).extra {
        ObjectExtra::Array(_) => "[object Array]".to_string(),
        ObjectExtra::Error { kind } => format!("[object {}]", kind.constructor_name()),
        o if matches!(
            o,
            ObjectExtra::Function { .. }
                | ObjectExtra::Native { .. }
                | ObjectExtra::Routine { .. }
                | ObjectExtra::Bound { .. }
        ) =>
        {
            "[object Function]".to_string()
        }
        _ => "[object Object]".to_string(),
    }
}

pub fn to_property_key(ctx: &mut Context, key: Value) -> Result<PropName, Value> {
    if key.is_object_ref() {
        let prim = to_primitive(ctx, key, false)?;
        return Ok(object::prop_name_from_value(ctx, prim));
    }
    Ok(object::prop_name_from_value(ctx, key))
}

pub fn typeof_value(ctx: &mut Context, v: Value) -> Value {
    let s: &str = if v.is_undefined() {
        "undefined"
    } else if v.is_null() {
        "object"
    } else if v.is_bool() {
        "boolean"
    } else if v.is_number() {
        "number"
    } else if v.is_string() {
        "string"
    } else if v.is_symbol() {
        "symbol"
    } else if object::is_callable(ctx, v) {
        "function"
    } else {
        "object"
    };
    strings::intern_utf8(ctx, s)
}

// ---------------------------------------------------------------------------
// Equality and relational
// ---------------------------------------------------------------------------

pub fn strict_eq(ctx: &Context, a: Value, b: Value) -> bool {
    if a == b {
        // NaN !== NaN even for the identical boxed cell.
        if a.is_heap_kind(HeapKind::Number) {
            return !ctx.heap.number(Idx(a.heap_cp())).is_nan();
        }
        return true;
    }
    if a.is_number() && b.is_number() {
        return object::number_of(ctx, a) == object::number_of(ctx, b);
    }
    if a.is_string() && b.is_string() {
        return strings::string_eq(ctx, a, b);
    }
    false
}

pub fn loose_eq(ctx: &mut Context, a: Value, b: Value) -> Result<bool, Value> {
    if strict_eq(ctx, a, b) {
        return Ok(true);
    }
    if a.is_nullish() && b.is_nullish() {
        return Ok(true);
    }
    if a.is_nullish() || b.is_nullish() {
        return Ok(false);
    }
    // bool → number
    if a.is_bool() {
        let an = make_number(ctx, if a.as_bool() { 1.0 } else { 0.0 });
        return loose_eq(ctx, an, b);
    }
    if b.is_bool() {
        let bn = make_number(ctx, if b.as_bool() { 1.0 } else { 0.0 });
        return loose_eq(ctx, a, bn);
    }
    if a.is_number() && b.is_string() {
        let bn = to_number(ctx, b)?;
        return Ok(object::number_of(ctx, a) == bn);
    }
    if a.is_string() && b.is_number() {
        let an = to_number(ctx, a)?;
        return Ok(an == object::number_of(ctx, b));
    }
    if a.is_object_ref() && !b.is_object_ref() && !b.is_symbol() {
        let ap = to_primitive(ctx, a, true)?;
        return loose_eq(ctx, ap, b);
    }
    if b.is_object_ref() && !a.is_object_ref() && !a.is_symbol() {
        let bp = to_primitive(ctx, b, true)?;
        return loose_eq(ctx, a, bp);
    }
    Ok(false)
}

pub fn op_relational(
    ctx: &mut Context,
    a: Value,
    b: Value,
    op: crate::bytecode::Op,
) -> Result<Value, Value> {
    use crate::bytecode::Op;
    let pa = to_primitive(ctx, a, true)?;
    let pb = to_primitive(ctx, b, true)?;
    if pa.is_string() && pb.is_string() {
        let ba = strings::bytes_of(ctx, pa);
        let bb = strings::bytes_of(ctx, pb);
        let ord = ba.as_ref().cmp(bb.as_ref());
        let r = match op {
            Op::Lt => ord.is_lt(),
            Op::Le => ord.is_le(),
            Op::Gt => ord.is_gt(),
            _ => ord.is_ge(),
        };
        return Ok(Value::bool_val(r));
    }
    let x = to_number(ctx, pa)?;
    let y = to_number(ctx, pb)?;
    if x.is_nan() || y.is_nan() {
        return Ok(Value::FALSE);
    }
    let r = match op {
        Op::Lt => x < y,
        Op::Le => x <= y,
        Op::Gt => x > y,
        _ => x >= y,
    };
    Ok(Value::bool_val(r))
}

pub fn op_add(ctx: &mut Context, a: Value, b: Value) -> Result<Value, Value> {
    // small-int fast path
    if a.is_int() && b.is_int() {
        let r = a.as_i30() as i64 + b.as_i30() as i64;
        if r >= crate::value::INT_MIN as i64 && r <= crate::value::INT_MAX as i64 {
            return Ok(Value::from_i30(r as i32));
        }
        return Ok(make_number(ctx, r as f64));
    }
    let pa = to_primitive(ctx, a, true)?;
    let pb = to_primitive(ctx, b, true)?;
    if pa.is_string() || pb.is_string() {
        let sa = to_string_value(ctx, pa)?;
        let mark = ctx.roots_mark();
        ctx.root(sa);
        let sb = to_string_value(ctx, pb)?;
        ctx.root(sb);
        let mut builder = StringBuilder::new();
        builder.append_string_value(ctx, sa);
        builder.append_string_value(ctx, sb);
        let out = builder.finish(ctx);
        ctx.roots_release(mark);
        return Ok(out);
    }
    let x = to_number(ctx, pa)?;
    let y = to_number(ctx, pb)?;
    Ok(make_number(ctx, x + y))
}

pub fn op_instanceof(ctx: &mut Context, v: Value, target: Value) -> Result<bool, Value> {
    if !object::is_callable(ctx, target) {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "right-hand side of 'instanceof' is not callable",
        ));
    }
    let proto = op_get_property_name(ctx, target, PropName::Magic(Magic::Prototype as u16))?;
    if !proto.is_object_ref() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "prototype is not an object",
        ));
    }
    if !v.is_object_ref() {
        return Ok(false);
    }
    let target_proto = Idx(proto.heap_cp());
    let mut cur = object::get_prototype_of(ctx, Idx(v.heap_cp()));
    let mut hops = 0;
    while let Some(p) = cur.get() {
        if p == target_proto {
            return Ok(true);
        }
        cur = object::get_prototype_of(ctx, p);
        hops += 1;
        if hops > 10_000 {
            break;
        }
    }
    Ok(false)
}

pub fn op_in(ctx: &mut Context, key: Value, obj: Value) -> Result<bool, Value> {
    if !obj.is_object_ref() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "cannot use 'in' operator on a non-object",
        ));
    }
    let name = to_property_key(ctx, key)?;
    op_has_property(ctx, Idx(obj.heap_cp()), name)
}

// ---------------------------------------------------------------------------
// Property access
// ---------------------------------------------------------------------------

fn nullish_access_error(ctx: &mut Context, reading: bool) -> Value {
    make_error(
        ctx,
        ErrorKind::TypeError,
        if reading {
            "cannot read properties of undefined or null"
        } else {
            "cannot set properties of undefined or null"
        },
    )
}

/// [[Get]] by key value; missing properties read as undefined.
pub fn op_get_property(ctx: &mut Context, base: Value, key: Value) -> Result<Value, Value> {
    let name = to_property_key(ctx, key)?;
    let v = op_get_property_name(ctx, base, name)?;
    Ok(if v.is_not_found() { Value::UNDEFINED } else { v })
}

/// [[Get]] by canonical name; `NOT_FOUND` when absent so callers can
/// distinguish (identifier resolution needs to).
pub fn op_get_property_name(
    ctx: &mut Context,
    base: Value,
    name: PropName,
) -> Result<Value, Value> {
    if base.is_nullish() {
        return Err(nullish_access_error(ctx, true));
    }

    // primitive receivers
    let start: OptIdx = if base.is_object_ref() {
        Idx(base.heap_cp()).some()
    } else if base.is_string() {
        if name == PropName::Magic(Magic::Length as u16) {
            return Ok(Value::from_i30(strings::units_of(ctx, base) as i32));
        }
        if let PropName::Index(i) = name {
            let bytes = strings::bytes_of(ctx, base);
            match strings::Units::new(&bytes).nth(i as usize) {
                Some(unit) => {
                    let cesu = strings::utf16_to_cesu8(&[unit]);
                    return Ok(strings::intern_cesu8(ctx, cesu));
                }
                None => return Ok(Value::NOT_FOUND),
            }
        }
        ctx.realm.string_prototype
    } else if base.is_number() {
        ctx.realm.number_prototype
    } else if base.is_bool() {
        ctx.realm.boolean_prototype
    } else if base.is_symbol() {
        ctx.realm.symbol_prototype
    } else {
        return Ok(Value::NOT_FOUND);
    };

    let mut cur = start;
    let mut hops = 0u32;
    while let Some(o) = cur.get() {
        if let Some((target, handler, revoked)) = object::proxy_parts(ctx, o) {
            return proxy_get(ctx, target, handler, revoked, name, base);
        }
        match &ctx.heap.object(o).extra {
            ObjectExtra::Array(_) => {
                if name == PropName::Magic(Magic::Length as u16) {
                    let len = object::array_data(ctx, o).length;
                    return Ok(make_number(ctx, len as f64));
                }
                if let PropName::Index(i) = name {
                    let fast = object::array_fast_get(ctx, o, i);
                    if !fast.is_not_found() {
                        return Ok(fast);
                    }
                    if object::array_data(ctx, o).fast {
                        // fast array with a hole or out of range: only the
                        // prototype chain remains
                        cur = object::get_prototype_of(ctx, o);
                        hops += 1;
                        continue;
                    }
                }
            }
            _ => {}
        }
        if let Some(slot) = object::own_slot(ctx, o, name) {
            return match slot.value {
                PropValue::Data(v) => Ok(v),
                PropValue::Accessor { get, .. } => {
                    if get.is_undefined() {
                        Ok(Value::UNDEFINED)
                    } else {
                        vm::call_function(ctx, get, base, &[])
                    }
                }
            };
        }
        cur = object::get_prototype_of(ctx, o);
        hops += 1;
        if hops > 100_000 {
            return Err(make_error(
                ctx,
                ErrorKind::RangeError,
                "prototype chain too long",
            ));
        }
    }
    Ok(Value::NOT_FOUND)
}

pub fn op_has_property(ctx: &mut Context, obj: Idx, name: PropName) -> Result<bool, Value> {
    let mut cur = obj.some();
    while let Some(o) = cur.get() {
        if let Some((target, handler, revoked)) = object::proxy_parts(ctx, o) {
            return proxy_has(ctx, target, handler, revoked, name);
        }
        if let ObjectExtra::Array(_) = &ctx.heap.object(o).extra {
            if name == PropName::Magic(Magic::Length as u16) {
                return Ok(true);
            }
            if let PropName::Index(i) = name {
                if !object::array_fast_get(ctx, o, i).is_not_found() {
                    return Ok(true);
                }
            }
        }
        if object::own_slot(ctx, o, name).is_some() {
            return Ok(true);
        }
        cur = object::get_prototype_of(ctx, o);
    }
    Ok(false)
}

/// [[Set]] with receiver == base.
pub fn op_set_property(
    ctx: &mut Context,
    base: Value,
    key: Value,
    value: Value,
    strict: bool,
) -> Result<(), Value> {
    if base.is_nullish() {
        return Err(nullish_access_error(ctx, false));
    }
    let name = to_property_key(ctx, key)?;
    if !base.is_object_ref() {
        // Property writes on primitives are silently dropped outside strict
        // mode.
        if strict {
            return Err(make_error(
                ctx,
                ErrorKind::TypeError,
                "cannot create property on a primitive value",
            ));
        }
        return Ok(());
    }
    let obj = Idx(base.heap_cp());

    if let Some((target, handler, revoked)) = object::proxy_parts(ctx, obj) {
        return proxy_set(ctx, target, handler, revoked, name, value, base, strict);
    }

    if let ObjectExtra::Array(_) = &ctx.heap.object(obj).extra {
        if name == PropName::Magic(Magic::Length as u16) {
            if !object::array_data(ctx, obj).length_writable {
                if strict {
                    return Err(make_error(
                        ctx,
                        ErrorKind::TypeError,
                        "cannot assign to read only property 'length'",
                    ));
                }
                return Ok(());
            }
            let n = to_number(ctx, value)?;
            let len = n as u32;
            if len as f64 != n {
                return Err(make_error(ctx, ErrorKind::RangeError, "invalid array length"));
            }
            object::set_array_length(ctx, obj, len);
            return Ok(());
        }
        if let PropName::Index(i) = name {
            if object::array_fast_set(ctx, obj, i, value) {
                return Ok(());
            }
            // left the fast encoding (or never was): go through define so
            // the length bookkeeping stays right
            let ok = object::define_own_property(
                ctx,
                obj,
                name,
                &PropDescriptor::data(value, PROP_FLAGS_DEFAULT),
            )?;
            if !ok && strict {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "cannot add property to array",
                ));
            }
            return Ok(());
        }
    }

    // own property?
    if let Some(slot) = object::own_slot(ctx, obj, name) {
        match slot.value {
            PropValue::Data(_) => {
                if slot.flags & PROP_WRITABLE == 0 {
                    if strict {
                        return Err(make_error(
                            ctx,
                            ErrorKind::TypeError,
                            "cannot assign to read only property",
                        ));
                    }
                    return Ok(());
                }
                let (pair, s) = object::find_own(ctx, obj, name).expect("slot exists");
                object::write_slot_value(ctx, pair, s, value);
                return Ok(());
            }
            PropValue::Accessor { set, .. } => {
                if set.is_undefined() {
                    if strict {
                        return Err(make_error(
                            ctx,
                            ErrorKind::TypeError,
                            "cannot set property with only a getter",
                        ));
                    }
                    return Ok(());
                }
                vm::call_function(ctx, set, base, &[value])?;
                return Ok(());
            }
        }
    }

    // prototype chain: setters and non-writable data properties intervene
    let mut cur = object::get_prototype_of(ctx, obj);
    while let Some(p) = cur.get() {
        if object::proxy_parts(ctx, p).is_some() {
            break;
        }
        if let Some(slot) = object::own_slot(ctx, p, name) {
            match slot.value {
                PropValue::Accessor { set, .. } => {
                    if set.is_undefined() {
                        if strict {
                            return Err(make_error(
                                ctx,
                                ErrorKind::TypeError,
                                "cannot set property with only a getter",
                            ));
                        }
                        return Ok(());
                    }
                    vm::call_function(ctx, set, base, &[value])?;
                    return Ok(());
                }
                PropValue::Data(_) => {
                    if slot.flags & PROP_WRITABLE == 0 {
                        if strict {
                            return Err(make_error(
                                ctx,
                                ErrorKind::TypeError,
                                "cannot assign to read only property",
                            ));
                        }
                        return Ok(());
                    }
                    break;
                }
            }
        }
        cur = object::get_prototype_of(ctx, p);
    }

    // create own
    if !ctx.heap.object(obj).is_extensible() {
        if strict {
            return Err(make_error(
                ctx,
                ErrorKind::TypeError,
                "cannot add property, object is not extensible",
            ));
        }
        return Ok(());
    }
    object::add_own(ctx, obj, name, PROP_FLAGS_DEFAULT, PropValue::Data(value));
    Ok(())
}

/// CreateDataPropertyOrThrow used by literal initializers.
pub fn op_define_own(
    ctx: &mut Context,
    obj: Value,
    key: Value,
    value: Value,
) -> Result<(), Value> {
    let name = to_property_key(ctx, key)?;
    let ok = object::define_own_property(
        ctx,
        Idx(obj.heap_cp()),
        name,
        &PropDescriptor::data(value, PROP_FLAGS_DEFAULT),
    )?;
    if !ok {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "cannot define property",
        ));
    }
    Ok(())
}

pub fn op_delete_property(
    ctx: &mut Context,
    base: Value,
    key: Value,
    strict: bool,
) -> Result<Value, Value> {
    if base.is_nullish() {
        return Err(nullish_access_error(ctx, true));
    }
    let name = to_property_key(ctx, key)?;
    if !base.is_object_ref() {
        return Ok(Value::TRUE);
    }
    let obj = Idx(base.heap_cp());
    if let Some((target, handler, revoked)) = object::proxy_parts(ctx, obj) {
        return proxy_delete(ctx, target, handler, revoked, name);
    }
    if let ObjectExtra::Array(_) = &ctx.heap.object(obj).extra {
        if let PropName::Index(i) = name {
            let a = object::array_data_mut(ctx, obj);
            if a.fast {
                if (i as usize) < a.elements.len() {
                    if !a.elements[i as usize].is_hole() {
                        a.elements[i as usize] = Value::HOLE;
                        a.hole_count += 1;
                    }
                }
                return Ok(Value::TRUE);
            }
        }
        if name == PropName::Magic(Magic::Length as u16) {
            if strict {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "cannot delete property 'length'",
                ));
            }
            return Ok(Value::FALSE);
        }
    }
    match object::own_slot(ctx, obj, name) {
        None => Ok(Value::TRUE),
        Some(slot) => {
            if slot.flags & PROP_CONFIGURABLE == 0 {
                if strict {
                    return Err(make_error(
                        ctx,
                        ErrorKind::TypeError,
                        "cannot delete non-configurable property",
                    ));
                }
                return Ok(Value::FALSE);
            }
            object::delete_own(ctx, obj, name);
            Ok(Value::TRUE)
        }
    }
}

// ---------------------------------------------------------------------------
// Proxy traps
// ---------------------------------------------------------------------------

fn revoked_error(ctx: &mut Context) -> Value {
    make_error(
        ctx,
        ErrorKind::TypeError,
        "cannot perform operation on a revoked proxy",
    )
}

fn proxy_trap(ctx: &mut Context, handler: Value, name: &str) -> Result<Value, Value> {
    let trap_name = object::prop_name_from_bytes(ctx, name.as_bytes());
    let trap = op_get_property_name(ctx, handler, trap_name)?;
    if trap.is_not_found() || trap.is_undefined() {
        return Ok(Value::UNDEFINED);
    }
    if !object::is_callable(ctx, trap) {
        return Err(make_error(ctx, ErrorKind::TypeError, "proxy trap is not callable"));
    }
    Ok(trap)
}

fn proxy_get(
    ctx: &mut Context,
    target: Value,
    handler: Value,
    revoked: bool,
    name: PropName,
    receiver: Value,
) -> Result<Value, Value> {
    if revoked {
        return Err(revoked_error(ctx));
    }
    let trap = proxy_trap(ctx, handler, "get")?;
    if trap.is_undefined() {
        return op_get_property_name(ctx, target, name);
    }
    let key = object::prop_name_to_value(ctx, name);
    vm::call_function(ctx, trap, handler, &[target, key, receiver])
}

#[allow(clippy::too_many_arguments)]
fn proxy_set(
    ctx: &mut Context,
    target: Value,
    handler: Value,
    revoked: bool,
    name: PropName,
    value: Value,
    receiver: Value,
    strict: bool,
) -> Result<(), Value> {
    if revoked {
        return Err(revoked_error(ctx));
    }
    let trap = proxy_trap(ctx, handler, "set")?;
    if trap.is_undefined() {
        let key = object::prop_name_to_value(ctx, name);
        return op_set_property(ctx, target, key, value, strict);
    }
    let key = object::prop_name_to_value(ctx, name);
    let ok = vm::call_function(ctx, trap, handler, &[target, key, value, receiver])?;
    if !to_boolean(ctx, ok) && strict {
        return Err(make_error(ctx, ErrorKind::TypeError, "proxy set trap returned false"));
    }
    Ok(())
}

fn proxy_has(
    ctx: &mut Context,
    target: Value,
    handler: Value,
    revoked: bool,
    name: PropName,
) -> Result<bool, Value> {
    if revoked {
        return Err(revoked_error(ctx));
    }
    let trap = proxy_trap(ctx, handler, "has")?;
    if trap.is_undefined() {
        return op_has_property(ctx, Idx(target.heap_cp()), name);
    }
    let key = object::prop_name_to_value(ctx, name);
    let r = vm::call_function(ctx, trap, handler, &[target, key])?;
    Ok(to_boolean(ctx, r))
}

fn proxy_delete(
    ctx: &mut Context,
    target: Value,
    handler: Value,
    revoked: bool,
    name: PropName,
) -> Result<Value, Value> {
    if revoked {
        return Err(revoked_error(ctx));
    }
    let trap = proxy_trap(ctx, handler, "deleteProperty")?;
    if trap.is_undefined() {
        let key = object::prop_name_to_value(ctx, name);
        return op_delete_property(ctx, target, key, false);
    }
    let key = object::prop_name_to_value(ctx, name);
    let r = vm::call_function(ctx, trap, handler, &[target, key])?;
    Ok(Value::bool_val(to_boolean(ctx, r)))
}

// ---------------------------------------------------------------------------
// Realm wiring
// ---------------------------------------------------------------------------

fn def(ctx: &mut Context, obj: Idx, name: &str, value: Value, flags: u8) {
    let pname = object::prop_name_from_bytes(ctx, name.as_bytes());
    match object::find_own(ctx, obj, pname) {
        Some((pair, slot)) => object::write_slot_value(ctx, pair, slot, value),
        None => object::add_own(ctx, obj, pname, flags, PropValue::Data(value)),
    }
}

fn def_routine(ctx: &mut Context, obj: Idx, name: &str, builtin: BuiltinId, routine: u16) {
    let f = object::alloc_routine(ctx, builtin, routine);
    // The routine object is unreachable until the property lands.
    let mark = ctx.roots_mark();
    ctx.root(f);
    def(ctx, obj, name, f, PROP_WRITABLE | PROP_CONFIGURABLE);
    ctx.roots_release(mark);
}

/// Create the global object and every built-in of the realm.
pub fn init_realm(ctx: &mut Context) {
    // Everything allocated below is rooted until the wiring completes; a
    // collection can fire on any allocation once the heap warms up.
    let init_mark = ctx.roots_mark();

    // Prototypes first; chains hang off Object.prototype.
    let object_proto = object::alloc_object(ctx, OptIdx::NONE, ObjectExtra::None);
    ctx.realm.object_prototype = object_proto.some();

    let function_proto = object::alloc_object(
        ctx,
        object_proto.some(),
        ObjectExtra::Routine {
            builtin: BuiltinId::FunctionProto,
            routine: routine_ids::function_proto::NOOP,
        },
    );
    ctx.realm.function_prototype = function_proto.some();

    let array_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.array_prototype = array_proto.some();
    let string_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.string_prototype = string_proto.some();
    let number_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.number_prototype = number_proto.some();
    let boolean_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.boolean_prototype = boolean_proto.some();
    let symbol_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.symbol_prototype = symbol_proto.some();
    let promise_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.promise_prototype = promise_proto.some();
    let generator_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.generator_prototype = generator_proto.some();

    // Error prototype hierarchy: each specialized prototype chains to the
    // base Error prototype.
    let error_proto = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.error_prototypes[ErrorKind::Error as usize] = error_proto.some();
    for kind in [
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
        ErrorKind::UriError,
        ErrorKind::EvalError,
        ErrorKind::AggregateError,
    ] {
        let proto = object::alloc_object(ctx, error_proto.some(), ObjectExtra::None);
        ctx.realm.error_prototypes[kind as usize] = proto.some();
    }

    // Global object + environment.
    let global = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.realm.global_object = global.some();
    let global_env = crate::env::alloc_object_env(ctx, OptIdx::NONE, global);
    ctx.realm.global_env = global_env.some();

    // globalThis + numeric constants
    let global_value = global.value(HeapKind::Object);
    def(ctx, global, "globalThis", global_value, PROP_WRITABLE | PROP_CONFIGURABLE);
    let nan = make_number(ctx, f64::NAN);
    ctx.root(nan);
    def(ctx, global, "NaN", nan, 0);
    let inf = make_number(ctx, f64::INFINITY);
    ctx.root(inf);
    def(ctx, global, "Infinity", inf, 0);
    def(ctx, global, "undefined", Value::UNDEFINED, 0);

    // Object
    let object_ctor = object::alloc_routine(ctx, BuiltinId::ObjectCtor, 0);
    ctx.root(object_ctor);
    {
        let ctor_idx = Idx(object_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", object_proto.value(HeapKind::Object), 0);
        def(ctx, object_proto, "constructor", object_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::object_ctor::*;
        def_routine(ctx, ctor_idx, "keys", BuiltinId::ObjectCtor, KEYS);
        def_routine(ctx, ctor_idx, "getPrototypeOf", BuiltinId::ObjectCtor, GET_PROTOTYPE_OF);
        def_routine(ctx, ctor_idx, "setPrototypeOf", BuiltinId::ObjectCtor, SET_PROTOTYPE_OF);
        def_routine(ctx, ctor_idx, "defineProperty", BuiltinId::ObjectCtor, DEFINE_PROPERTY);
        def_routine(
            ctx,
            ctor_idx,
            "getOwnPropertyDescriptor",
            BuiltinId::ObjectCtor,
            GET_OWN_PROPERTY_DESCRIPTOR,
        );
        def_routine(ctx, ctor_idx, "create", BuiltinId::ObjectCtor, CREATE);
        def_routine(ctx, ctor_idx, "freeze", BuiltinId::ObjectCtor, FREEZE);
        def(ctx, global, "Object", object_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
    }
    {
        use routine_ids::object_proto::*;
        def_routine(ctx, object_proto, "toString", BuiltinId::ObjectProto, TO_STRING);
        def_routine(ctx, object_proto, "valueOf", BuiltinId::ObjectProto, VALUE_OF);
        def_routine(ctx, object_proto, "hasOwnProperty", BuiltinId::ObjectProto, HAS_OWN_PROPERTY);
    }

    // Function.prototype
    {
        use routine_ids::function_proto::*;
        def_routine(ctx, function_proto, "call", BuiltinId::FunctionProto, CALL);
        def_routine(ctx, function_proto, "apply", BuiltinId::FunctionProto, APPLY);
        def_routine(ctx, function_proto, "bind", BuiltinId::FunctionProto, BIND);
        def_routine(ctx, function_proto, "toString", BuiltinId::FunctionProto, TO_STRING);
    }

    // Array
    let array_ctor = object::alloc_routine(ctx, BuiltinId::ArrayCtor, 0);
    ctx.root(array_ctor);
    {
        let ctor_idx = Idx(array_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", array_proto.value(HeapKind::Object), 0);
        def(ctx, array_proto, "constructor", array_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        def_routine(ctx, ctor_idx, "isArray", BuiltinId::ArrayCtor, routine_ids::array_ctor::IS_ARRAY);
        def(ctx, global, "Array", array_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::array_proto::*;
        def_routine(ctx, array_proto, "push", BuiltinId::ArrayProto, PUSH);
        def_routine(ctx, array_proto, "pop", BuiltinId::ArrayProto, POP);
        def_routine(ctx, array_proto, "join", BuiltinId::ArrayProto, JOIN);
        def_routine(ctx, array_proto, "indexOf", BuiltinId::ArrayProto, INDEX_OF);
        def_routine(ctx, array_proto, "slice", BuiltinId::ArrayProto, SLICE);
        def_routine(ctx, array_proto, "forEach", BuiltinId::ArrayProto, FOR_EACH);
        def_routine(ctx, array_proto, "every", BuiltinId::ArrayProto, EVERY);
        def_routine(ctx, array_proto, "some", BuiltinId::ArrayProto, SOME);
        def_routine(ctx, array_proto, "map", BuiltinId::ArrayProto, MAP);
        def_routine(ctx, array_proto, "toString", BuiltinId::ArrayProto, TO_STRING);
    }

    // String
    let string_ctor = object::alloc_routine(ctx, BuiltinId::StringCtor, 0);
    ctx.root(string_ctor);
    {
        let ctor_idx = Idx(string_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", string_proto.value(HeapKind::Object), 0);
        def(ctx, string_proto, "constructor", string_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        def_routine(
            ctx,
            ctor_idx,
            "fromCharCode",
            BuiltinId::StringCtor,
            routine_ids::string_ctor::FROM_CHAR_CODE,
        );
        def(ctx, global, "String", string_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::string_proto::*;
        def_routine(ctx, string_proto, "charAt", BuiltinId::StringProto, CHAR_AT);
        def_routine(ctx, string_proto, "charCodeAt", BuiltinId::StringProto, CHAR_CODE_AT);
        def_routine(ctx, string_proto, "indexOf", BuiltinId::StringProto, INDEX_OF);
        def_routine(ctx, string_proto, "slice", BuiltinId::StringProto, SLICE);
        def_routine(ctx, string_proto, "toUpperCase", BuiltinId::StringProto, TO_UPPER_CASE);
        def_routine(ctx, string_proto, "toLowerCase", BuiltinId::StringProto, TO_LOWER_CASE);
        def_routine(ctx, string_proto, "split", BuiltinId::StringProto, SPLIT);
        def_routine(ctx, string_proto, "trim", BuiltinId::StringProto, TRIM);
        def_routine(ctx, string_proto, "toString", BuiltinId::StringProto, TO_STRING);
        def_routine(ctx, string_proto, "valueOf", BuiltinId::StringProto, VALUE_OF);
    }

    // Number / Boolean
    let number_ctor = object::alloc_routine(ctx, BuiltinId::NumberCtor, 0);
    ctx.root(number_ctor);
    {
        let ctor_idx = Idx(number_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", number_proto.value(HeapKind::Object), 0);
        def(ctx, number_proto, "constructor", number_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        def_routine(
            ctx,
            ctor_idx,
            "isInteger",
            BuiltinId::NumberCtor,
            routine_ids::number_ctor::IS_INTEGER,
        );
        let nan = make_number(ctx, f64::NAN);
        def(ctx, ctor_idx, "NaN", nan, 0);
        def(ctx, global, "Number", number_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::number_proto::*;
        def_routine(ctx, number_proto, "toString", BuiltinId::NumberProto, TO_STRING);
        def_routine(ctx, number_proto, "valueOf", BuiltinId::NumberProto, VALUE_OF);
        def_routine(ctx, number_proto, "toFixed", BuiltinId::NumberProto, TO_FIXED);
    }
    let boolean_ctor = object::alloc_routine(ctx, BuiltinId::BooleanCtor, 0);
    ctx.root(boolean_ctor);
    {
        let ctor_idx = Idx(boolean_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", boolean_proto.value(HeapKind::Object), 0);
        def(ctx, boolean_proto, "constructor", boolean_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        def(ctx, global, "Boolean", boolean_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::boolean_proto::*;
        def_routine(ctx, boolean_proto, "toString", BuiltinId::BooleanProto, TO_STRING);
        def_routine(ctx, boolean_proto, "valueOf", BuiltinId::BooleanProto, VALUE_OF);
    }

    // Symbol
    let symbol_ctor = object::alloc_routine(ctx, BuiltinId::SymbolCtor, 0);
    ctx.root(symbol_ctor);
    {
        let ctor_idx = Idx(symbol_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", symbol_proto.value(HeapKind::Object), 0);
        def(ctx, global, "Symbol", symbol_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        def_routine(
            ctx,
            symbol_proto,
            "toString",
            BuiltinId::SymbolCtor,
            routine_ids::symbol_ctor::TO_STRING,
        );
    }

    // Math
    let math = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.root(math.value(HeapKind::Object));
    {
        use routine_ids::math::*;
        def_routine(ctx, math, "abs", BuiltinId::MathObj, ABS);
        def_routine(ctx, math, "floor", BuiltinId::MathObj, FLOOR);
        def_routine(ctx, math, "ceil", BuiltinId::MathObj, CEIL);
        def_routine(ctx, math, "round", BuiltinId::MathObj, ROUND);
        def_routine(ctx, math, "trunc", BuiltinId::MathObj, TRUNC);
        def_routine(ctx, math, "sqrt", BuiltinId::MathObj, SQRT);
        def_routine(ctx, math, "pow", BuiltinId::MathObj, POW);
        def_routine(ctx, math, "min", BuiltinId::MathObj, MIN);
        def_routine(ctx, math, "max", BuiltinId::MathObj, MAX);
        def_routine(ctx, math, "random", BuiltinId::MathObj, RANDOM);
        let pi = make_number(ctx, std::f64::consts::PI);
        def(ctx, math, "PI", pi, 0);
        def(ctx, global, "Math", math.value(HeapKind::Object), PROP_WRITABLE | PROP_CONFIGURABLE);
    }

    // Date (the engine slice: Date.now through the clock port)
    let date = object::alloc_routine(ctx, BuiltinId::DateObj, 0);
    ctx.root(date);
    {
        let date_idx = Idx(date.heap_cp());
        def_routine(ctx, date_idx, "now", BuiltinId::DateObj, routine_ids::date::NOW);
        def(ctx, global, "Date", date, PROP_WRITABLE | PROP_CONFIGURABLE);
    }

    // Error hierarchy
    for kind in [
        ErrorKind::Error,
        ErrorKind::TypeError,
        ErrorKind::RangeError,
        ErrorKind::ReferenceError,
        ErrorKind::SyntaxError,
        ErrorKind::UriError,
        ErrorKind::EvalError,
        ErrorKind::AggregateError,
    ] {
        let ctor = object::alloc_routine(ctx, BuiltinId::ErrorCtor, kind as u16);
        ctx.root(ctor);
        let ctor_idx = Idx(ctor.heap_cp());
        let proto = ctx.realm.error_prototypes[kind as usize].get().expect("proto");
        def(ctx, ctor_idx, "prototype", proto.value(HeapKind::Object), 0);
        def(ctx, proto, "constructor", ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        let name = strings::intern_utf8(ctx, kind.constructor_name());
        def(ctx, proto, "name", name, PROP_WRITABLE | PROP_CONFIGURABLE);
        def(
            ctx,
            global,
            kind.constructor_name(),
            ctor,
            PROP_WRITABLE | PROP_CONFIGURABLE,
        );
    }
    let base_error_proto = ctx.realm.error_prototypes[ErrorKind::Error as usize]
        .get()
        .expect("proto");
    def_routine(
        ctx,
        base_error_proto,
        "toString",
        BuiltinId::ErrorProto,
        routine_ids::error_proto::TO_STRING,
    );

    // Promise
    if CONFIG.promises {
        let promise_ctor = object::alloc_routine(ctx, BuiltinId::PromiseCtor, 0);
        ctx.root(promise_ctor);
        let ctor_idx = Idx(promise_ctor.heap_cp());
        def(ctx, ctor_idx, "prototype", promise_proto.value(HeapKind::Object), 0);
        def(ctx, promise_proto, "constructor", promise_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
        use routine_ids::promise::*;
        def_routine(ctx, ctor_idx, "resolve", BuiltinId::PromiseCtor, RESOLVE);
        def_routine(ctx, ctor_idx, "reject", BuiltinId::PromiseCtor, REJECT);
        def_routine(ctx, ctor_idx, "all", BuiltinId::PromiseCtor, ALL);
        def_routine(ctx, promise_proto, "then", BuiltinId::PromiseProto, THEN);
        def_routine(ctx, promise_proto, "catch", BuiltinId::PromiseProto, CATCH);
        def_routine(ctx, promise_proto, "finally", BuiltinId::PromiseProto, FINALLY);
        def(ctx, global, "Promise", promise_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
    }

    // Generator prototype methods
    {
        use routine_ids::generator::*;
        def_routine(ctx, generator_proto, "next", BuiltinId::GeneratorProto, NEXT);
        def_routine(ctx, generator_proto, "return", BuiltinId::GeneratorProto, RETURN);
        def_routine(ctx, generator_proto, "throw", BuiltinId::GeneratorProto, THROW);
    }

    // Proxy
    if CONFIG.proxy {
        let proxy_ctor = object::alloc_routine(ctx, BuiltinId::ProxyCtor, 0);
        ctx.root(proxy_ctor);
        let ctor_idx = Idx(proxy_ctor.heap_cp());
        def_routine(
            ctx,
            ctor_idx,
            "revocable",
            BuiltinId::ProxyCtor,
            routine_ids::proxy::REVOCABLE,
        );
        def(ctx, global, "Proxy", proxy_ctor, PROP_WRITABLE | PROP_CONFIGURABLE);
    }

    // Host hooks on the global object
    def_routine(ctx, global, "print", BuiltinId::Global, routine_ids::global::PRINT);
    if CONFIG.modules {
        def_routine(ctx, global, "require", BuiltinId::Global, routine_ids::global::REQUIRE);
    }
    def_routine(
        ctx,
        global,
        "queueMicrotask",
        BuiltinId::Global,
        routine_ids::global::QUEUE_MICROTASK,
    );
    let console = object::alloc_object(ctx, object_proto.some(), ObjectExtra::None);
    ctx.root(console.value(HeapKind::Object));
    def_routine(ctx, console, "log", BuiltinId::Console, routine_ids::console::LOG);
    def_routine(ctx, console, "error", BuiltinId::Console, routine_ids::console::ERROR);
    def(
        ctx,
        global,
        "console",
        console.value(HeapKind::Object),
        PROP_WRITABLE | PROP_CONFIGURABLE,
    );

    ctx.roots_release(init_mark);

    // The wiring allocated a fair amount; settle the heap once.
    gc::collect(ctx, gc::Pressure::Low);
}

// ---------------------------------------------------------------------------
// Routine id tables
// ---------------------------------------------------------------------------

pub mod routine_ids {
    pub mod global {
        pub const PRINT: u16 = 0;
        pub const QUEUE_MICROTASK: u16 = 1;
        pub const REQUIRE: u16 = 2;
    }
    pub mod console {
        pub const LOG: u16 = 0;
        pub const ERROR: u16 = 1;
    }
    pub mod object_ctor {
        pub const CONSTRUCT: u16 = 0;
        pub const KEYS: u16 = 1;
        pub const GET_PROTOTYPE_OF: u16 = 2;
        pub const SET_PROTOTYPE_OF: u16 = 3;
        pub const DEFINE_PROPERTY: u16 = 4;
        pub const GET_OWN_PROPERTY_DESCRIPTOR: u16 = 5;
        pub const CREATE: u16 = 6;
        pub const FREEZE: u16 = 7;
    }
    pub mod object_proto {
        pub const TO_STRING: u16 = 0;
        pub const VALUE_OF: u16 = 1;
        pub const HAS_OWN_PROPERTY: u16 = 2;
    }
    pub mod function_proto {
        pub const NOOP: u16 = 0;
        pub const CALL: u16 = 1;
        pub const APPLY: u16 = 2;
        pub const BIND: u16 = 3;
        pub const TO_STRING: u16 = 4;
    }
    pub mod array_ctor {
        pub const CONSTRUCT: u16 = 0;
        pub const IS_ARRAY: u16 = 1;
    }
    pub mod array_proto {
        pub const PUSH: u16 = 0;
        pub const POP: u16 = 1;
        pub const JOIN: u16 = 2;
        pub const INDEX_OF: u16 = 3;
        pub const SLICE: u16 = 4;
        pub const FOR_EACH: u16 = 5;
        pub const EVERY: u16 = 6;
        pub const SOME: u16 = 7;
        pub const MAP: u16 = 8;
        pub const TO_STRING: u16 = 9;
    }
    pub mod string_ctor {
        pub const CONSTRUCT: u16 = 0;
        pub const FROM_CHAR_CODE: u16 = 1;
    }
    pub mod string_proto {
        pub const CHAR_AT: u16 = 0;
        pub const CHAR_CODE_AT: u16 = 1;
        pub const INDEX_OF: u16 = 2;
        pub const SLICE: u16 = 3;
        pub const TO_UPPER_CASE: u16 = 4;
        pub const TO_LOWER_CASE: u16 = 5;
        pub const SPLIT: u16 = 6;
        pub const TRIM: u16 = 7;
        pub const TO_STRING: u16 = 8;
        pub const VALUE_OF: u16 = 9;
    }
    pub mod number_ctor {
        pub const CONSTRUCT: u16 = 0;
        pub const IS_INTEGER: u16 = 1;
    }
    pub mod number_proto {
        pub const TO_STRING: u16 = 0;
        pub const VALUE_OF: u16 = 1;
        pub const TO_FIXED: u16 = 2;
    }
    pub mod boolean_proto {
        pub const TO_STRING: u16 = 0;
        pub const VALUE_OF: u16 = 1;
    }
    pub mod symbol_ctor {
        pub const CONSTRUCT: u16 = 0;
        pub const TO_STRING: u16 = 1;
    }
    pub mod math {
        pub const ABS: u16 = 0;
        pub const FLOOR: u16 = 1;
        pub const CEIL: u16 = 2;
        pub const ROUND: u16 = 3;
        pub const TRUNC: u16 = 4;
        pub const SQRT: u16 = 5;
        pub const POW: u16 = 6;
        pub const MIN: u16 = 7;
        pub const MAX: u16 = 8;
        pub const RANDOM: u16 = 9;
    }
    pub mod date {
        pub const CONSTRUCT: u16 = 0;
        pub const NOW: u16 = 1;
    }
    pub mod error_proto {
        pub const TO_STRING: u16 = 0;
    }
    pub mod promise {
        pub const CONSTRUCT: u16 = 0;
        pub const RESOLVE: u16 = 1;
        pub const REJECT: u16 = 2;
        pub const ALL: u16 = 3;
        // internal helpers handed out as bound functions
        pub const RESOLVE_FN: u16 = 4;
        pub const REJECT_FN: u16 = 5;
        pub const ALL_FULFILL: u16 = 6;
        pub const ALL_REJECT: u16 = 7;
        pub const FINALLY_PASS: u16 = 8;
        pub const FINALLY_RETHROW: u16 = 9;
        // prototype routines
        pub const THEN: u16 = 0;
        pub const CATCH: u16 = 1;
        pub const FINALLY: u16 = 2;
    }
    pub mod generator {
        pub const NEXT: u16 = 0;
        pub const RETURN: u16 = 1;
        pub const THROW: u16 = 2;
    }
    pub mod proxy {
        pub const CONSTRUCT: u16 = 0;
        pub const REVOCABLE: u16 = 1;
        pub const REVOKE: u16 = 2;
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Resolve a (builtin-id, routine-id) pair to its handler and run it.
#[allow(clippy::too_many_arguments)]
pub fn dispatch_routine(
    ctx: &mut Context,
    builtin: BuiltinId,
    routine: u16,
    func: Value,
    this: Value,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    match builtin {
        BuiltinId::Global => global_routine(ctx, routine, args),
        BuiltinId::Console => console_routine(ctx, routine, args),
        BuiltinId::ObjectCtor => object_ctor_routine(ctx, routine, args),
        BuiltinId::ObjectProto => object_proto_routine(ctx, routine, this, args),
        BuiltinId::FunctionProto => function_proto_routine(ctx, routine, this, args),
        BuiltinId::ArrayCtor => array_ctor_routine(ctx, routine, args),
        BuiltinId::ArrayProto => array_proto_routine(ctx, routine, this, args),
        BuiltinId::StringCtor => string_ctor_routine(ctx, routine, args, is_construct),
        BuiltinId::StringProto => string_proto_routine(ctx, routine, this, args),
        BuiltinId::NumberCtor => number_ctor_routine(ctx, routine, args, is_construct),
        BuiltinId::NumberProto => number_proto_routine(ctx, routine, this, args),
        BuiltinId::BooleanCtor => boolean_ctor_routine(ctx, routine, args, is_construct),
        BuiltinId::BooleanProto => boolean_proto_routine(ctx, routine, this),
        BuiltinId::SymbolCtor => symbol_ctor_routine(ctx, routine, this, args, is_construct),
        BuiltinId::MathObj => math_routine(ctx, routine, args),
        BuiltinId::DateObj => date_routine(ctx, routine),
        BuiltinId::ErrorCtor => error_ctor_routine(ctx, routine, args),
        BuiltinId::ErrorProto => error_proto_routine(ctx, routine, this),
        BuiltinId::PromiseCtor => jobs::promise_ctor_routine(ctx, routine, args, is_construct),
        BuiltinId::PromiseProto => jobs::promise_proto_routine(ctx, routine, this, args),
        BuiltinId::GeneratorProto => generator_routine(ctx, routine, this, args),
        BuiltinId::ProxyCtor => proxy_routine(ctx, routine, func, args, is_construct),
    }
}

fn display_args(ctx: &Context, args: &[Value]) -> String {
    args.iter()
        .map(|a| to_display_string(ctx, *a))
        .collect::<Vec<_>>()
        .join(" ")
}

fn global_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::global::*;
    match routine {
        PRINT => {
            let line = display_args(ctx, args);
            ctx.port().io_log(LogLevel::Debug, &line);
            Ok(Value::UNDEFINED)
        }
        QUEUE_MICROTASK => {
            let f = args.first().copied().unwrap_or(Value::UNDEFINED);
            if !object::is_callable(ctx, f) {
                return Err(make_error(ctx, ErrorKind::TypeError, "callback is not callable"));
            }
            jobs::enqueue_call(ctx, f, Value::UNDEFINED, &[]);
            Ok(Value::UNDEFINED)
        }
        REQUIRE => {
            if !CONFIG.modules {
                return Err(make_error(ctx, ErrorKind::TypeError, "modules are disabled in this build"));
            }
            crate::module::require_routine(ctx, args)
        }
        _ => unknown_routine(ctx),
    }
}

fn console_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::console::*;
    let level = match routine {
        ERROR => LogLevel::Error,
        _ => LogLevel::Debug,
    };
    let line = display_args(ctx, args);
    ctx.port().io_log(level, &line);
    Ok(Value::UNDEFINED)
}

fn unknown_routine(ctx: &mut Context) -> Result<Value, Value> {
    Err(make_error(
        ctx,
        ErrorKind::TypeError,
        "unknown built-in routine",
    ))
}

fn require_object(ctx: &mut Context, v: Value) -> Result<Idx, Value> {
    if v.is_object_ref() {
        Ok(Idx(v.heap_cp()))
    } else {
        Err(make_error(ctx, ErrorKind::TypeError, "argument is not an object"))
    }
}

fn object_ctor_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::object_ctor::*;
    let arg0 = args.first().copied().unwrap_or(Value::UNDEFINED);
    match routine {
        CONSTRUCT => {
            if arg0.is_object_ref() {
                return Ok(arg0);
            }
            let proto = ctx.realm.object_prototype;
            Ok(object::alloc_object_value(ctx, proto, ObjectExtra::None))
        }
        KEYS => {
            let obj = require_object(ctx, arg0)?;
            let names = object::own_property_names(ctx, obj);
            let mark = ctx.roots_mark();
            let mut keys: Vec<Value> = Vec::new();
            for name in names {
                if let Some(slot) = object::own_slot(ctx, obj, name) {
                    if slot.flags & PROP_ENUMERABLE == 0 {
                        continue;
                    }
                } else if !matches!(name, PropName::Index(_)) {
                    continue;
                }
                if matches!(name, PropName::Symbol(_)) {
                    continue;
                }
                let key = object::prop_name_to_value(ctx, name);
                ctx.root(key);
                keys.push(key);
            }
            let arr = object::alloc_array(ctx, keys);
            ctx.roots_release(mark);
            Ok(arr)
        }
        GET_PROTOTYPE_OF => {
            let obj = require_object(ctx, arg0)?;
            Ok(match object::get_prototype_of(ctx, obj).get() {
                Some(p) => p.value(HeapKind::Object),
                None => Value::NULL,
            })
        }
        SET_PROTOTYPE_OF => {
            let obj = require_object(ctx, arg0)?;
            let proto = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let target = if proto.is_null() {
                OptIdx::NONE
            } else if proto.is_object_ref() {
                Idx(proto.heap_cp()).some()
            } else {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "prototype must be an object or null",
                ));
            };
            if !object::set_prototype_of(ctx, obj, target) {
                return Err(make_error(ctx, ErrorKind::TypeError, "cannot set prototype"));
            }
            Ok(arg0)
        }
        DEFINE_PROPERTY => {
            let obj = require_object(ctx, arg0)?;
            let key = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let desc_obj = args.get(2).copied().unwrap_or(Value::UNDEFINED);
            let name = to_property_key(ctx, key)?;
            let desc = to_prop_descriptor(ctx, desc_obj)?;
            let ok = object::define_own_property(ctx, obj, name, &desc)?;
            if !ok {
                return Err(make_error(ctx, ErrorKind::TypeError, "cannot redefine property"));
            }
            Ok(arg0)
        }
        GET_OWN_PROPERTY_DESCRIPTOR => {
            let obj = require_object(ctx, arg0)?;
            let key = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let name = to_property_key(ctx, key)?;
            match object::own_slot(ctx, obj, name) {
                None => Ok(Value::UNDEFINED),
                Some(slot) => Ok(from_prop_slot(ctx, &slot)),
            }
        }
        CREATE => {
            let proto = if arg0.is_null() {
                OptIdx::NONE
            } else if arg0.is_object_ref() {
                Idx(arg0.heap_cp()).some()
            } else {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "prototype must be an object or null",
                ));
            };
            Ok(object::alloc_object_value(ctx, proto, ObjectExtra::None))
        }
        FREEZE => {
            let obj = require_object(ctx, arg0)?;
            ctx.heap.object_mut(obj).flags &= !object::OBJ_EXTENSIBLE;
            let names = object::own_property_names(ctx, obj);
            for name in names {
                if let Some((pair, slot)) = object::find_own(ctx, obj, name) {
                    let s = &mut ctx.heap.pair_mut(pair).slots[slot as usize];
                    s.flags &= !(PROP_WRITABLE | PROP_CONFIGURABLE);
                }
            }
            ctx.lookup_cache.invalidate();
            Ok(arg0)
        }
        _ => unknown_routine(ctx),
    }
}

/// Read a descriptor object into the internal form.
fn to_prop_descriptor(ctx: &mut Context, desc: Value) -> Result<PropDescriptor, Value> {
    if !desc.is_object_ref() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "property descriptor must be an object",
        ));
    }
    let mut out = PropDescriptor::default();
    let fields: [(Magic, u8); 6] = [
        (Magic::Value, 0),
        (Magic::Get, 1),
        (Magic::Set, 2),
        (Magic::Writable, 3),
        (Magic::Enumerable, 4),
        (Magic::Configurable, 5),
    ];
    for (m, which) in fields {
        let name = PropName::Magic(m as u16);
        let has = op_has_property(ctx, Idx(desc.heap_cp()), name)?;
        if !has {
            continue;
        }
        let v = op_get_property_name(ctx, desc, name)?;
        let v = if v.is_not_found() { Value::UNDEFINED } else { v };
        match which {
            0 => out.value = Some(v),
            1 => out.get = Some(v),
            2 => out.set = Some(v),
            3 => out.writable = Some(to_boolean(ctx, v)),
            4 => out.enumerable = Some(to_boolean(ctx, v)),
            _ => out.configurable = Some(to_boolean(ctx, v)),
        }
    }
    if out.is_accessor() && out.is_data() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "descriptor cannot be both a data and an accessor descriptor",
        ));
    }
    Ok(out)
}

/// Build the descriptor object for getOwnPropertyDescriptor.
fn from_prop_slot(ctx: &mut Context, slot: &object::PropSlot) -> Value {
    let proto = ctx.realm.object_prototype;
    let out = object::alloc_object_value(ctx, proto, ObjectExtra::None);
    let mark = ctx.roots_mark();
    ctx.root(out);
    let idx = Idx(out.heap_cp());
    match slot.value {
        PropValue::Data(v) => {
            object::add_own(ctx, idx, PropName::Magic(Magic::Value as u16), PROP_FLAGS_DEFAULT, PropValue::Data(v));
            object::add_own(
                ctx,
                idx,
                PropName::Magic(Magic::Writable as u16),
                PROP_FLAGS_DEFAULT,
                PropValue::Data(Value::bool_val(slot.flags & PROP_WRITABLE != 0)),
            );
        }
        PropValue::Accessor { get, set } => {
            object::add_own(ctx, idx, PropName::Magic(Magic::Get as u16), PROP_FLAGS_DEFAULT, PropValue::Data(get));
            object::add_own(ctx, idx, PropName::Magic(Magic::Set as u16), PROP_FLAGS_DEFAULT, PropValue::Data(set));
        }
    }
    object::add_own(
        ctx,
        idx,
        PropName::Magic(Magic::Enumerable as u16),
        PROP_FLAGS_DEFAULT,
        PropValue::Data(Value::bool_val(slot.flags & PROP_ENUMERABLE != 0)),
    );
    object::add_own(
        ctx,
        idx,
        PropName::Magic(Magic::Configurable as u16),
        PROP_FLAGS_DEFAULT,
        PropValue::Data(Value::bool_val(slot.flags & PROP_CONFIGURABLE != 0)),
    );
    ctx.roots_release(mark);
    out
}

fn object_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::object_proto::*;
    match routine {
        TO_STRING => {
            let s = to_display_string(ctx, this);
            Ok(strings::alloc_utf8(ctx, &s))
        }
        VALUE_OF => Ok(this),
        HAS_OWN_PROPERTY => {
            let obj = require_object(ctx, this)?;
            let key = args.first().copied().unwrap_or(Value::UNDEFINED);
            let name = to_property_key(ctx, key)?;
            if let ObjectExtra::Array(_) = &ctx.heap.object(obj).extra {
                if let PropName::Index(i) = name {
                    if !object::array_fast_get(ctx, obj, i).is_not_found() {
                        return Ok(Value::TRUE);
                    }
                }
                if name == PropName::Magic(Magic::Length as u16) {
                    return Ok(Value::TRUE);
                }
            }
            Ok(Value::bool_val(object::own_slot(ctx, obj, name).is_some()))
        }
        _ => unknown_routine(ctx),
    }
}

fn function_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::function_proto::*;
    match routine {
        NOOP => Ok(Value::UNDEFINED),
        CALL => {
            let call_this = args.first().copied().unwrap_or(Value::UNDEFINED);
            let rest = if args.len() > 1 { &args[1..] } else { &[] };
            vm::call_function(ctx, this, call_this, rest)
        }
        APPLY => {
            let call_this = args.first().copied().unwrap_or(Value::UNDEFINED);
            let arg_array = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let mut call_args = Vec::new();
            if !arg_array.is_nullish() {
                let len_v = op_get_property_name(
                    ctx,
                    arg_array,
                    PropName::Magic(Magic::Length as u16),
                )?;
                let len = to_number(ctx, len_v)? as u32;
                let mark = ctx.roots_mark();
                for i in 0..len {
                    let v = op_get_property_name(ctx, arg_array, PropName::Index(i))?;
                    let v = if v.is_not_found() { Value::UNDEFINED } else { v };
                    ctx.root(v);
                    call_args.push(v);
                }
                let r = vm::call_function(ctx, this, call_this, &call_args);
                ctx.roots_release(mark);
                return r;
            }
            vm::call_function(ctx, this, call_this, &call_args)
        }
        BIND => {
            if !object::is_callable(ctx, this) {
                return Err(make_error(ctx, ErrorKind::TypeError, "bind target is not callable"));
            }
            let bound_this = args.first().copied().unwrap_or(Value::UNDEFINED);
            let head: Box<[Value]> = if args.len() > 1 {
                args[1..].to_vec().into_boxed_slice()
            } else {
                Box::new([])
            };
            let proto = ctx.realm.function_prototype;
            Ok(object::alloc_object_value(
                ctx,
                proto,
                ObjectExtra::Bound {
                    target: this,
                    this_value: bound_this,
                    args: head,
                },
            ))
        }
        TO_STRING => Ok(strings::alloc_utf8(ctx, "function () { [native code] }")),
        _ => unknown_routine(ctx),
    }
}

fn array_ctor_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::array_ctor::*;
    match routine {
        CONSTRUCT => {
            if args.len() == 1 && args[0].is_number() {
                let n = object::number_of(ctx, args[0]);
                let len = n as u32;
                if len as f64 != n {
                    return Err(make_error(ctx, ErrorKind::RangeError, "invalid array length"));
                }
                let arr = object::alloc_array(ctx, Vec::new());
                object::set_array_length(ctx, Idx(arr.heap_cp()), len);
                return Ok(arr);
            }
            Ok(object::alloc_array(ctx, args.to_vec()))
        }
        IS_ARRAY => {
            let v = args.first().copied().unwrap_or(Value::UNDEFINED);
            let is = v.is_object_ref()
                && matches!(
                    ctx.heap.object(Idx(v.heap_cp())).extra,
                    ObjectExtra::Array(_)
                );
            Ok(Value::bool_val(is))
        }
        _ => unknown_routine(ctx),
    }
}

fn require_array(ctx: &mut Context, v: Value) -> Result<Idx, Value> {
    let obj = require_object(ctx, v)?;
    match ctx.heap.object(obj).extra {
        ObjectExtra::Array(_) => Ok(obj),
        _ => Err(make_error(ctx, ErrorKind::TypeError, "receiver is not an array")),
    }
}

fn array_get(ctx: &mut Context, arr: Value, i: u32) -> Result<Value, Value> {
    let v = op_get_property_name(ctx, arr, PropName::Index(i))?;
    Ok(if v.is_not_found() { Value::UNDEFINED } else { v })
}

fn array_len(ctx: &mut Context, arr: Idx) -> u32 {
    object::array_data(ctx, arr).length
}

fn array_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::array_proto::*;
    match routine {
        PUSH => {
            let obj = require_array(ctx, this)?;
            for v in args {
                let len = array_len(ctx, obj);
                if !object::array_fast_set(ctx, obj, len, *v) {
                    object::define_own_property(
                        ctx,
                        obj,
                        PropName::Index(len),
                        &PropDescriptor::data(*v, PROP_FLAGS_DEFAULT),
                    )?;
                }
            }
            let len = array_len(ctx, obj);
            Ok(make_number(ctx, len as f64))
        }
        POP => {
            let obj = require_array(ctx, this)?;
            let len = array_len(ctx, obj);
            if len == 0 {
                return Ok(Value::UNDEFINED);
            }
            let last = array_get(ctx, this, len - 1)?;
            object::set_array_length(ctx, obj, len - 1);
            Ok(last)
        }
        JOIN | TO_STRING => {
            let obj = require_array(ctx, this)?;
            let sep = if routine == JOIN {
                match args.first() {
                    Some(s) if !s.is_undefined() => to_display_string_of(ctx, *s)?,
                    _ => ",".to_string(),
                }
            } else {
                ",".to_string()
            };
            let len = array_len(ctx, obj);
            let mut parts: Vec<String> = Vec::with_capacity(len as usize);
            for i in 0..len {
                let v = array_get(ctx, this, i)?;
                if v.is_nullish() {
                    parts.push(String::new());
                } else {
                    parts.push(to_display_string_of(ctx, v)?);
                }
            }
            Ok(strings::alloc_utf8(ctx, &parts.join(&sep)))
        }
        INDEX_OF => {
            let obj = require_array(ctx, this)?;
            let needle = args.first().copied().unwrap_or(Value::UNDEFINED);
            let len = array_len(ctx, obj);
            for i in 0..len {
                let v = array_get(ctx, this, i)?;
                if strict_eq(ctx, v, needle) {
                    return Ok(make_number(ctx, i as f64));
                }
            }
            Ok(Value::from_i30(-1))
        }
        SLICE => {
            let obj = require_array(ctx, this)?;
            let len = array_len(ctx, obj) as i64;
            let norm = |raw: f64, len: i64| -> i64 {
                let i = raw as i64;
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i.min(len)
                }
            };
            let start = match args.first() {
                Some(v) if !v.is_undefined() => norm(to_number(ctx, *v)?, len),
                _ => 0,
            };
            let end = match args.get(1) {
                Some(v) if !v.is_undefined() => norm(to_number(ctx, *v)?, len),
                _ => len,
            };
            let mark = ctx.roots_mark();
            let mut out = Vec::new();
            for i in start..end {
                let v = array_get(ctx, this, i as u32)?;
                ctx.root(v);
                out.push(v);
            }
            let arr = object::alloc_array(ctx, out);
            ctx.roots_release(mark);
            Ok(arr)
        }
        // forEach / every / some share their iteration: the routine id only
        // decides what the callback verdict means.
        FOR_EACH | EVERY | SOME => {
            let obj = require_array(ctx, this)?;
            let callback = args.first().copied().unwrap_or(Value::UNDEFINED);
            if !object::is_callable(ctx, callback) {
                return Err(make_error(ctx, ErrorKind::TypeError, "callback is not callable"));
            }
            let this_arg = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let len = array_len(ctx, obj);
            for i in 0..len {
                let v = array_get(ctx, this, i)?;
                let idx_v = make_number(ctx, i as f64);
                let verdict = vm::call_function(ctx, callback, this_arg, &[v, idx_v, this])?;
                let truthy = to_boolean(ctx, verdict);
                match routine {
                    EVERY if !truthy => return Ok(Value::FALSE),
                    SOME if truthy => return Ok(Value::TRUE),
                    _ => {}
                }
            }
            Ok(match routine {
                EVERY => Value::TRUE,
                SOME => Value::FALSE,
                _ => Value::UNDEFINED,
            })
        }
        MAP => {
            let obj = require_array(ctx, this)?;
            let callback = args.first().copied().unwrap_or(Value::UNDEFINED);
            if !object::is_callable(ctx, callback) {
                return Err(make_error(ctx, ErrorKind::TypeError, "callback is not callable"));
            }
            let this_arg = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            let len = array_len(ctx, obj);
            let mark = ctx.roots_mark();
            let mut out = Vec::with_capacity(len as usize);
            for i in 0..len {
                let v = array_get(ctx, this, i)?;
                let idx_v = make_number(ctx, i as f64);
                let mapped = vm::call_function(ctx, callback, this_arg, &[v, idx_v, this])?;
                ctx.root(mapped);
                out.push(mapped);
            }
            let arr = object::alloc_array(ctx, out);
            ctx.roots_release(mark);
            Ok(arr)
        }
        _ => unknown_routine(ctx),
    }
}

/// ToString through user code (may throw), as a Rust string.
fn to_display_string_of(ctx: &mut Context, v: Value) -> Result<String, Value> {
    let s = to_string_value(ctx, v)?;
    Ok(strings::to_rust_string(ctx, s))
}

fn string_ctor_routine(
    ctx: &mut Context,
    routine: u16,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    use routine_ids::string_ctor::*;
    match routine {
        CONSTRUCT => {
            if is_construct {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "wrapper object construction is not supported",
                ));
            }
            match args.first() {
                None => Ok(strings::magic_value(Magic::Empty)),
                Some(v) => to_string_value(ctx, *v),
            }
        }
        FROM_CHAR_CODE => {
            let mut units = Vec::with_capacity(args.len());
            for a in args {
                units.push(to_number(ctx, *a)? as u16);
            }
            let cesu = strings::utf16_to_cesu8(&units);
            let idx = crate::heap::alloc(
                ctx,
                crate::heap::CellData::String(strings::StringCell::from_cesu8(cesu)),
            );
            Ok(idx.value(HeapKind::String))
        }
        _ => unknown_routine(ctx),
    }
}

fn this_string(ctx: &mut Context, this: Value) -> Result<Value, Value> {
    if this.is_string() {
        Ok(this)
    } else {
        to_string_value(ctx, this)
    }
}

fn string_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::string_proto::*;
    let s = this_string(ctx, this)?;
    let mark = ctx.roots_mark();
    ctx.root(s);
    let result = (|| -> Result<Value, Value> {
        match routine {
            TO_STRING | VALUE_OF => Ok(s),
            CHAR_AT => {
                let i = match args.first() {
                    Some(v) => to_number(ctx, *v)? as i64,
                    None => 0,
                };
                let bytes = strings::bytes_of(ctx, s);
                if i < 0 {
                    return Ok(strings::magic_value(Magic::Empty));
                }
                match strings::Units::new(&bytes).nth(i as usize) {
                    Some(unit) => {
                        let cesu = strings::utf16_to_cesu8(&[unit]);
                        Ok(strings::intern_cesu8(ctx, cesu))
                    }
                    None => Ok(strings::magic_value(Magic::Empty)),
                }
            }
            CHAR_CODE_AT => {
                let i = match args.first() {
                    Some(v) => to_number(ctx, *v)? as i64,
                    None => 0,
                };
                let bytes = strings::bytes_of(ctx, s);
                if i < 0 {
                    return Ok(make_number(ctx, f64::NAN));
                }
                match strings::Units::new(&bytes).nth(i as usize) {
                    Some(unit) => Ok(make_number(ctx, unit as f64)),
                    None => Ok(make_number(ctx, f64::NAN)),
                }
            }
            INDEX_OF => {
                let needle = match args.first() {
                    Some(v) => to_display_string_of(ctx, *v)?,
                    None => "undefined".to_string(),
                };
                let hay = strings::to_rust_string(ctx, s);
                match hay.find(&needle) {
                    Some(byte_pos) => {
                        // unit index of the byte position
                        let units = hay[..byte_pos].encode_utf16().count();
                        Ok(make_number(ctx, units as f64))
                    }
                    None => Ok(Value::from_i30(-1)),
                }
            }
            SLICE => {
                let hay = strings::to_rust_string(ctx, s);
                let units: Vec<u16> = hay.encode_utf16().collect();
                let len = units.len() as i64;
                let norm = |raw: f64| -> i64 {
                    let i = raw as i64;
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i.min(len)
                    }
                };
                let start = match args.first() {
                    Some(v) if !v.is_undefined() => norm(to_number(ctx, *v)?),
                    _ => 0,
                };
                let end = match args.get(1) {
                    Some(v) if !v.is_undefined() => norm(to_number(ctx, *v)?),
                    _ => len,
                };
                if start >= end {
                    return Ok(strings::magic_value(Magic::Empty));
                }
                let cesu = strings::utf16_to_cesu8(&units[start as usize..end as usize]);
                let cell = strings::StringCell::from_cesu8(cesu);
                let idx = crate::heap::alloc(ctx, crate::heap::CellData::String(cell));
                Ok(idx.value(HeapKind::String))
            }
            TO_UPPER_CASE | TO_LOWER_CASE => {
                let hay = strings::to_rust_string(ctx, s);
                let out = if routine == TO_UPPER_CASE {
                    hay.to_uppercase()
                } else {
                    hay.to_lowercase()
                };
                Ok(strings::alloc_utf8(ctx, &out))
            }
            TRIM => {
                let hay = strings::to_rust_string(ctx, s);
                Ok(strings::alloc_utf8(ctx, hay.trim()))
            }
            SPLIT => {
                let hay = strings::to_rust_string(ctx, s);
                let mark2 = ctx.roots_mark();
                let mut parts: Vec<Value> = Vec::new();
                match args.first() {
                    None => {
                        let whole = strings::alloc_utf8(ctx, &hay);
                        ctx.root(whole);
                        parts.push(whole);
                    }
                    Some(sep_v) => {
                        let sep = to_display_string_of(ctx, *sep_v)?;
                        if sep.is_empty() {
                            for ch in hay.chars() {
                                let p = strings::alloc_utf8(ctx, &ch.to_string());
                                ctx.root(p);
                                parts.push(p);
                            }
                        } else {
                            for piece in hay.split(&sep) {
                                let p = strings::alloc_utf8(ctx, piece);
                                ctx.root(p);
                                parts.push(p);
                            }
                        }
                    }
                }
                let arr = object::alloc_array(ctx, parts);
                ctx.roots_release(mark2);
                Ok(arr)
            }
            _ => unknown_routine(ctx),
        }
    })();
    ctx.roots_release(mark);
    result
}

fn number_ctor_routine(
    ctx: &mut Context,
    routine: u16,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    use routine_ids::number_ctor::*;
    match routine {
        CONSTRUCT => {
            if is_construct {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "wrapper object construction is not supported",
                ));
            }
            let n = match args.first() {
                None => 0.0,
                Some(v) => to_number(ctx, *v)?,
            };
            Ok(make_number(ctx, n))
        }
        IS_INTEGER => {
            let v = args.first().copied().unwrap_or(Value::UNDEFINED);
            if !v.is_number() {
                return Ok(Value::FALSE);
            }
            let n = object::number_of(ctx, v);
            Ok(Value::bool_val(n.is_finite() && n.fract() == 0.0))
        }
        _ => unknown_routine(ctx),
    }
}

fn number_proto_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::number_proto::*;
    if !this.is_number() {
        return Err(make_error(
            ctx,
            ErrorKind::TypeError,
            "receiver is not a number",
        ));
    }
    let n = object::number_of(ctx, this);
    match routine {
        TO_STRING => Ok(strings::alloc_utf8(ctx, &strings::number_to_string(n))),
        VALUE_OF => Ok(this),
        TO_FIXED => {
            let digits = match args.first() {
                Some(v) => to_number(ctx, *v)? as usize,
                None => 0,
            };
            if digits > 100 {
                return Err(make_error(ctx, ErrorKind::RangeError, "toFixed() digits out of range"));
            }
            Ok(strings::alloc_utf8(ctx, &format!("{:.*}", digits, n)))
        }
        _ => unknown_routine(ctx),
    }
}

fn boolean_ctor_routine(
    ctx: &mut Context,
    routine: u16,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    match routine {
        0 => {
            if is_construct {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "wrapper object construction is not supported",
                ));
            }
            let v = args.first().copied().unwrap_or(Value::UNDEFINED);
            Ok(Value::bool_val(to_boolean(ctx, v)))
        }
        _ => unknown_routine(ctx),
    }
}

fn boolean_proto_routine(ctx: &mut Context, routine: u16, this: Value) -> Result<Value, Value> {
    use routine_ids::boolean_proto::*;
    if !this.is_bool() {
        return Err(make_error(ctx, ErrorKind::TypeError, "receiver is not a boolean"));
    }
    match routine {
        TO_STRING => Ok(strings::magic_value(if this.as_bool() {
            Magic::True
        } else {
            Magic::False
        })),
        VALUE_OF => Ok(this),
        _ => unknown_routine(ctx),
    }
}

fn symbol_ctor_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    use routine_ids::symbol_ctor::*;
    match routine {
        CONSTRUCT => {
            if is_construct {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Symbol is not a constructor",
                ));
            }
            let desc = match args.first() {
                None => Value::UNDEFINED,
                Some(v) if v.is_undefined() => Value::UNDEFINED,
                Some(v) => to_string_value(ctx, *v)?,
            };
            Ok(object::alloc_symbol(ctx, desc))
        }
        TO_STRING => {
            if !this.is_symbol() {
                return Err(make_error(ctx, ErrorKind::TypeError, "receiver is not a symbol"));
            }
            let desc = match &ctx.heap.get(Idx(this.heap_cp())).data {
                crate::heap::CellData::Symbol(s) => s.description,
                _ => Value::UNDEFINED,
            };
            let text = if desc.is_string() {
                format!("Symbol({})", strings::to_rust_string(ctx, desc))
            } else {
                "Symbol()".to_string()
            };
            Ok(strings::alloc_utf8(ctx, &text))
        }
        _ => unknown_routine(ctx),
    }
}

fn math_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    use routine_ids::math::*;
    let arg = |ctx: &mut Context, i: usize| -> Result<f64, Value> {
        match args.get(i) {
            Some(v) => to_number(ctx, *v),
            None => Ok(f64::NAN),
        }
    };
    let r = match routine {
        ABS => arg(ctx, 0)?.abs(),
        FLOOR => arg(ctx, 0)?.floor(),
        CEIL => arg(ctx, 0)?.ceil(),
        ROUND => {
            let x = arg(ctx, 0)?;
            (x + 0.5).floor()
        }
        TRUNC => arg(ctx, 0)?.trunc(),
        SQRT => arg(ctx, 0)?.sqrt(),
        POW => {
            let x = arg(ctx, 0)?;
            let y = arg(ctx, 1)?;
            x.powf(y)
        }
        MIN => {
            let mut best = f64::INFINITY;
            for a in args {
                let x = to_number(ctx, *a)?;
                if x.is_nan() {
                    best = f64::NAN;
                    break;
                }
                best = best.min(x);
            }
            best
        }
        MAX => {
            let mut best = f64::NEG_INFINITY;
            for a in args {
                let x = to_number(ctx, *a)?;
                if x.is_nan() {
                    best = f64::NAN;
                    break;
                }
                best = best.max(x);
            }
            best
        }
        RANDOM => ctx.next_random(),
        _ => return unknown_routine(ctx),
    };
    Ok(make_number(ctx, r))
}

fn date_routine(ctx: &mut Context, routine: u16) -> Result<Value, Value> {
    use routine_ids::date::*;
    match routine {
        CONSTRUCT | NOW => {
            let ms = ctx.port().time_now_ms();
            Ok(make_number(ctx, ms))
        }
        _ => unknown_routine(ctx),
    }
}

/// Error constructors; the routine id is the `ErrorKind`.
fn error_ctor_routine(ctx: &mut Context, routine: u16, args: &[Value]) -> Result<Value, Value> {
    let kind = match routine {
        x if x == ErrorKind::TypeError as u16 => ErrorKind::TypeError,
        x if x == ErrorKind::RangeError as u16 => ErrorKind::RangeError,
        x if x == ErrorKind::ReferenceError as u16 => ErrorKind::ReferenceError,
        x if x == ErrorKind::SyntaxError as u16 => ErrorKind::SyntaxError,
        x if x == ErrorKind::UriError as u16 => ErrorKind::UriError,
        x if x == ErrorKind::EvalError as u16 => ErrorKind::EvalError,
        x if x == ErrorKind::AggregateError as u16 => ErrorKind::AggregateError,
        _ => ErrorKind::Error,
    };
    // AggregateError(errors, message); the rest take (message, options).
    let (message_arg, options_arg) = if kind == ErrorKind::AggregateError {
        (args.get(1).copied(), args.get(2).copied())
    } else {
        (args.first().copied(), args.get(1).copied())
    };
    let message = match message_arg {
        Some(v) if !v.is_undefined() => to_display_string_of(ctx, v)?,
        _ => String::new(),
    };
    let err = make_error(ctx, kind, &message);
    let mark = ctx.roots_mark();
    ctx.root(err);
    let idx = Idx(err.heap_cp());
    if kind == ErrorKind::AggregateError {
        let errors = args.first().copied().unwrap_or(Value::UNDEFINED);
        object::add_own(
            ctx,
            idx,
            PropName::Magic(Magic::Errors as u16),
            PROP_WRITABLE | PROP_CONFIGURABLE,
            PropValue::Data(errors),
        );
    }
    if let Some(options) = options_arg {
        if options.is_object_ref() {
            let cause_name = PropName::Magic(Magic::Cause as u16);
            if op_has_property(ctx, Idx(options.heap_cp()), cause_name)? {
                let cause = op_get_property_name(ctx, options, cause_name)?;
                object::add_own(
                    ctx,
                    idx,
                    cause_name,
                    PROP_WRITABLE | PROP_CONFIGURABLE,
                    PropValue::Data(cause),
                );
            }
        }
    }
    ctx.roots_release(mark);
    Ok(err)
}

fn error_proto_routine(ctx: &mut Context, routine: u16, this: Value) -> Result<Value, Value> {
    use routine_ids::error_proto::*;
    match routine {
        TO_STRING => {
            let obj = require_object(ctx, this)?;
            let name = match object::own_slot(ctx, obj, PropName::Magic(Magic::Name as u16)) {
                Some(s) => match s.value {
                    PropValue::Data(v) => to_display_string_of(ctx, v)?,
                    _ => "Error".to_string(),
                },
                None => {
                    let v =
                        op_get_property_name(ctx, this, PropName::Magic(Magic::Name as u16))?;
                    if v.is_not_found() {
                        "Error".to_string()
                    } else {
                        to_display_string_of(ctx, v)?
                    }
                }
            };
            let msg = {
                let v = op_get_property_name(ctx, this, PropName::Magic(Magic::Message as u16))?;
                if v.is_not_found() || v.is_undefined() {
                    String::new()
                } else {
                    to_display_string_of(ctx, v)?
                }
            };
            let text = if msg.is_empty() {
                name
            } else {
                format!("{}: {}", name, msg)
            };
            Ok(strings::alloc_utf8(ctx, &text))
        }
        _ => unknown_routine(ctx),
    }
}

fn generator_routine(
    ctx: &mut Context,
    routine: u16,
    this: Value,
    args: &[Value],
) -> Result<Value, Value> {
    use routine_ids::generator::*;
    if !this.is_object_ref()
        || !matches!(
            ctx.heap.object(Idx(this.heap_cp())).extra,
            ObjectExtra::Generator { .. }
        )
    {
        return Err(make_error(ctx, ErrorKind::TypeError, "receiver is not a generator"));
    }
    let input = args.first().copied().unwrap_or(Value::UNDEFINED);
    match routine {
        NEXT => {
            let outcome = vm::resume_coroutine(ctx, this, input, false);
            iter_result_from(ctx, outcome)
        }
        RETURN => {
            let idx = Idx(this.heap_cp());
            let coroutine = match &mut ctx.heap.object_mut(idx).extra {
                ObjectExtra::Generator { coroutine, done, .. } => {
                    *done = true;
                    coroutine.get()
                }
                _ => None,
            };
            if let Some(c) = coroutine {
                ctx.heap.coroutine_mut(c).state = vm::CoroutineState::Done;
            }
            make_iter_result(ctx, input, true)
        }
        THROW => {
            let outcome = vm::resume_coroutine(ctx, this, input, true);
            iter_result_from(ctx, outcome)
        }
        _ => unknown_routine(ctx),
    }
}

fn iter_result_from(ctx: &mut Context, outcome: vm::ResumeOutcome) -> Result<Value, Value> {
    match outcome {
        vm::ResumeOutcome::Yielded(v) => make_iter_result(ctx, v, false),
        vm::ResumeOutcome::Done(v) => make_iter_result(ctx, v, true),
        vm::ResumeOutcome::Thrown(e) => Err(e),
    }
}

pub fn make_iter_result(ctx: &mut Context, value: Value, done: bool) -> Result<Value, Value> {
    let proto = ctx.realm.object_prototype;
    let mark = ctx.roots_mark();
    ctx.root(value);
    let obj = object::alloc_object_value(ctx, proto, ObjectExtra::None);
    ctx.root(obj);
    let idx = Idx(obj.heap_cp());
    object::add_own(
        ctx,
        idx,
        PropName::Magic(Magic::Value as u16),
        PROP_FLAGS_DEFAULT,
        PropValue::Data(value),
    );
    object::add_own(
        ctx,
        idx,
        PropName::Magic(Magic::Done as u16),
        PROP_FLAGS_DEFAULT,
        PropValue::Data(Value::bool_val(done)),
    );
    ctx.roots_release(mark);
    Ok(obj)
}

fn proxy_routine(
    ctx: &mut Context,
    routine: u16,
    _func: Value,
    args: &[Value],
    is_construct: bool,
) -> Result<Value, Value> {
    use routine_ids::proxy::*;
    if !CONFIG.proxy {
        return Err(make_error(ctx, ErrorKind::TypeError, "Proxy is disabled in this build"));
    }
    match routine {
        CONSTRUCT => {
            if !is_construct {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Proxy constructor requires 'new'",
                ));
            }
            let target = args.first().copied().unwrap_or(Value::UNDEFINED);
            let handler = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if !target.is_object_ref() || !handler.is_object_ref() {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Proxy target and handler must be objects",
                ));
            }
            Ok(object::alloc_proxy(ctx, target, handler))
        }
        REVOCABLE => {
            let target = args.first().copied().unwrap_or(Value::UNDEFINED);
            let handler = args.get(1).copied().unwrap_or(Value::UNDEFINED);
            if !target.is_object_ref() || !handler.is_object_ref() {
                return Err(make_error(
                    ctx,
                    ErrorKind::TypeError,
                    "Proxy target and handler must be objects",
                ));
            }
            let proxy = object::alloc_proxy(ctx, target, handler);
            let mark = ctx.roots_mark();
            ctx.root(proxy);
            // revoke: the REVOKE routine bound to its proxy
            let revoke_routine = object::alloc_routine(ctx, BuiltinId::ProxyCtor, REVOKE);
            ctx.root(revoke_routine);
            let fn_proto = ctx.realm.function_prototype;
            let revoke = object::alloc_object_value(
                ctx,
                fn_proto,
                ObjectExtra::Bound {
                    target: revoke_routine,
                    this_value: Value::UNDEFINED,
                    args: vec![proxy].into_boxed_slice(),
                },
            );
            ctx.root(revoke);
            let obj_proto = ctx.realm.object_prototype;
            let out = object::alloc_object_value(ctx, obj_proto, ObjectExtra::None);
            ctx.root(out);
            let out_idx = Idx(out.heap_cp());
            let proxy_name = object::prop_name_from_bytes(ctx, b"proxy");
            object::add_own(ctx, out_idx, proxy_name, PROP_FLAGS_DEFAULT, PropValue::Data(proxy));
            let revoke_name = object::prop_name_from_bytes(ctx, b"revoke");
            object::add_own(ctx, out_idx, revoke_name, PROP_FLAGS_DEFAULT, PropValue::Data(revoke));
            ctx.roots_release(mark);
            Ok(out)
        }
        REVOKE => {
            let proxy = args.first().copied().unwrap_or(Value::UNDEFINED);
            if proxy.is_object_ref() {
                object::proxy_revoke(ctx, Idx(proxy.heap_cp()));
            }
            Ok(Value::UNDEFINED)
        }
        _ => unknown_routine(ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn realm_has_global_wiring() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let global = ctx.realm.global_object.get().unwrap();
        let gv = global.value(HeapKind::Object);
        for name in ["Object", "Array", "String", "Math", "Promise", "TypeError", "print"] {
            let pname = object::prop_name_from_bytes(&mut ctx, name.as_bytes());
            let v = op_get_property_name(&mut ctx, gv, pname).unwrap();
            assert!(!v.is_not_found(), "global.{} missing", name);
        }
    }

    #[test]
    fn to_boolean_table() {
        let mut ctx = Context::new(Default::default()).unwrap();
        assert!(!to_boolean(&ctx, Value::UNDEFINED));
        assert!(!to_boolean(&ctx, Value::NULL));
        assert!(!to_boolean(&ctx, Value::FALSE));
        assert!(!to_boolean(&ctx, Value::from_i30(0)));
        assert!(to_boolean(&ctx, Value::from_i30(-1)));
        let nan = make_number(&mut ctx, f64::NAN);
        assert!(!to_boolean(&ctx, nan));
        let empty = strings::magic_value(Magic::Empty);
        assert!(!to_boolean(&ctx, empty));
        let s = strings::intern_utf8(&mut ctx, "x");
        assert!(to_boolean(&ctx, s));
    }

    #[test]
    fn loose_and_strict_equality() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let one = Value::from_i30(1);
        let one_boxed = crate::heap::alloc_number(&mut ctx, 1.0).value(HeapKind::Number);
        assert!(strict_eq(&ctx, one, one_boxed));
        let s1 = strings::intern_utf8(&mut ctx, "1");
        assert!(loose_eq(&mut ctx, one, s1).unwrap());
        assert!(!strict_eq(&ctx, one, s1));
        assert!(loose_eq(&mut ctx, Value::NULL, Value::UNDEFINED).unwrap());
        let nan = make_number(&mut ctx, f64::NAN);
        assert!(!strict_eq(&ctx, nan, nan));
    }

    #[test]
    fn add_concatenates_strings() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let a = strings::intern_utf8(&mut ctx, "foo");
        let b = Value::from_i30(7);
        let r = op_add(&mut ctx, a, b).unwrap();
        assert_eq!(strings::to_rust_string(&ctx, r), "foo7");
        let r2 = op_add(&mut ctx, Value::from_i30(4), Value::from_i30(2)).unwrap();
        assert_eq!(r2, Value::from_i30(6));
    }

    #[test]
    fn get_on_string_primitive() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let s = strings::intern_utf8(&mut ctx, "abc");
        let len =
            op_get_property_name(&mut ctx, s, PropName::Magic(Magic::Length as u16)).unwrap();
        assert_eq!(len, Value::from_i30(3));
        let c = op_get_property_name(&mut ctx, s, PropName::Index(1)).unwrap();
        assert_eq!(strings::to_rust_string(&ctx, c), "b");
    }

    #[test]
    fn nullish_access_throws() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let key = strings::intern_utf8(&mut ctx, "x");
        assert!(op_get_property(&mut ctx, Value::UNDEFINED, key).is_err());
        assert!(op_set_property(&mut ctx, Value::NULL, key, Value::TRUE, false).is_err());
    }

    #[test]
    fn error_has_message_and_stack() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let e = make_error(&mut ctx, ErrorKind::TypeError, "oops");
        let msg = op_get_property_name(&mut ctx, e, PropName::Magic(Magic::Message as u16)).unwrap();
        assert_eq!(strings::to_rust_string(&ctx, msg), "oops");
        let stack = op_get_property_name(&mut ctx, e, PropName::Magic(Magic::Stack as u16)).unwrap();
        assert!(stack.is_string());
    }

    #[test]
    fn error_decorator_runs() {
        use std::rc::Rc;
        let mut ctx = Context::new(Default::default()).unwrap();
        ctx.error_decorator = Some(Rc::new(|ctx: &mut Context, err: Value| {
            let name = object::prop_name_from_bytes(ctx, b"decorated");
            object::add_own(
                ctx,
                Idx(err.heap_cp()),
                name,
                PROP_FLAGS_DEFAULT,
                PropValue::Data(Value::TRUE),
            );
        }));
        let e = make_error(&mut ctx, ErrorKind::Error, "x");
        let name = object::prop_name_from_bytes(&mut ctx, b"decorated");
        let v = op_get_property_name(&mut ctx, e, name).unwrap();
        assert_eq!(v, Value::TRUE);
    }

    #[test]
    fn proxy_default_falls_through_to_target() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let proto = ctx.realm.object_prototype;
        let target = object::alloc_object_value(&mut ctx, proto, ObjectExtra::None);
        let name = object::prop_name_from_bytes(&mut ctx, b"k");
        object::add_own(
            &mut ctx,
            Idx(target.heap_cp()),
            name,
            PROP_FLAGS_DEFAULT,
            PropValue::Data(Value::from_i30(9)),
        );
        let handler = object::alloc_object_value(&mut ctx, proto, ObjectExtra::None);
        let proxy = object::alloc_proxy(&mut ctx, target, handler);
        let v = op_get_property_name(&mut ctx, proxy, name).unwrap();
        assert_eq!(v, Value::from_i30(9));
        // revocation makes further access throw
        object::proxy_revoke(&mut ctx, Idx(proxy.heap_cp()));
        assert!(op_get_property_name(&mut ctx, proxy, name).is_err());
    }
}
