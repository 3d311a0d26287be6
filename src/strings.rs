/// String Subsystem — CESU-8 Storage, Interning, Magic Table
///
/// Engine strings are immutable CESU-8 byte runs: BMP characters use their
/// UTF-8 encoding, supplementary characters are stored as a surrogate pair
/// with each surrogate encoded in 3 bytes. The public API converts to and
/// from strict UTF-8/UTF-16 at the boundary.
///
/// Identity tiers, cheapest first:
///   magic     — index into the compile-time table below (plus a per-context
///               extension registered at init); no heap cell at all
///   interned  — one heap cell per distinct byte run used as a literal or
///               property name, deduplicated through the context's intern set
///   plain     — result of concatenation/building; compared by bytes
use crate::context::Context;
use crate::heap::{self, CellData, Idx};
use crate::value::{HeapKind, Value};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::rc::Rc;

// ---------------------------------------------------------------------------
// Magic strings
// ---------------------------------------------------------------------------

/// Compile-time ids of the most frequent engine strings. Keep the variants
/// in the exact order of `MAGIC_STRINGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Magic {
    Empty = 0,
    Length,
    Prototype,
    Constructor,
    Name,
    Message,
    Stack,
    Value,
    Get,
    Set,
    Then,
    ToString,
    ValueOf,
    Undefined,
    Null,
    True,
    False,
    Boolean,
    Number,
    StringCap,
    ObjectCap,
    FunctionCap,
    Symbol,
    NaN,
    Infinity,
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    UriError,
    EvalError,
    AggregateError,
    Arguments,
    Caller,
    Callee,
    GlobalThis,
    Console,
    Log,
    Print,
    Math,
    Promise,
    Resolve,
    Reject,
    Default,
    Exports,
    Module,
    Require,
    Filename,
    Dirname,
    Anonymous,
    ProtoDunder,
    Configurable,
    Enumerable,
    Writable,
    Done,
    Next,
    Apply,
    Call,
    Bind,
    Push,
    Pop,
    Join,
    IndexOf,
    Slice,
    Cause,
    Errors,
    QueueMicrotask,
    DateCap,
    Now,
}

pub const MAGIC_STRINGS: &[&str] = &[
    "",
    "length",
    "prototype",
    "constructor",
    "name",
    "message",
    "stack",
    "value",
    "get",
    "set",
    "then",
    "toString",
    "valueOf",
    "undefined",
    "null",
    "true",
    "false",
    "Boolean",
    "Number",
    "String",
    "Object",
    "Function",
    "Symbol",
    "NaN",
    "Infinity",
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "URIError",
    "EvalError",
    "AggregateError",
    "arguments",
    "caller",
    "callee",
    "globalThis",
    "console",
    "log",
    "print",
    "Math",
    "Promise",
    "resolve",
    "reject",
    "default",
    "exports",
    "module",
    "require",
    "__filename",
    "__dirname",
    "<anonymous>",
    "__proto__",
    "configurable",
    "enumerable",
    "writable",
    "done",
    "next",
    "apply",
    "call",
    "bind",
    "push",
    "pop",
    "join",
    "indexOf",
    "slice",
    "cause",
    "errors",
    "queueMicrotask",
    "Date",
    "now",
];

static MAGIC_LOOKUP: Lazy<HashMap<&'static str, u16>> = Lazy::new(|| {
    MAGIC_STRINGS
        .iter()
        .enumerate()
        .map(|(i, s)| (*s, i as u16))
        .collect()
});

#[inline(always)]
pub fn magic_value(m: Magic) -> Value {
    Value::magic(m as u16)
}

/// Bytes of a magic string, including per-context extensions.
pub fn magic_bytes(ctx: &Context, id: u16) -> Rc<[u8]> {
    let base = MAGIC_STRINGS.len() as u16;
    if id < base {
        Rc::from(MAGIC_STRINGS[id as usize].as_bytes())
    } else {
        Rc::clone(&ctx.magic_ext[(id - base) as usize])
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// FNV-1a over the CESU-8 bytes; the intern set keys on (length, hash).
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

// ---------------------------------------------------------------------------
// CESU-8 codec
// ---------------------------------------------------------------------------

/// Encode strict UTF-8 into CESU-8.
pub fn utf8_to_cesu8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for ch in s.chars() {
        let cp = ch as u32;
        if cp < 0x10000 {
            let mut buf = [0u8; 4];
            out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        } else {
            let v = cp - 0x10000;
            let hi = 0xd800 + (v >> 10);
            let lo = 0xdc00 + (v & 0x3ff);
            push_unit(&mut out, hi as u16);
            push_unit(&mut out, lo as u16);
        }
    }
    out
}

/// Encode one UTF-16 code unit (BMP code point, surrogates included) as
/// CESU-8.
fn push_unit(out: &mut Vec<u8>, unit: u16) {
    let cp = unit as u32;
    if cp < 0x80 {
        out.push(cp as u8);
    } else if cp < 0x800 {
        out.push(0xc0 | (cp >> 6) as u8);
        out.push(0x80 | (cp & 0x3f) as u8);
    } else {
        out.push(0xe0 | (cp >> 12) as u8);
        out.push(0x80 | ((cp >> 6) & 0x3f) as u8);
        out.push(0x80 | (cp & 0x3f) as u8);
    }
}

/// Iterate CESU-8 as UTF-16 code units.
pub struct Units<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Units<'a> {
    pub fn new(bytes: &'a [u8]) -> Units<'a> {
        Units { bytes, pos: 0 }
    }
}

impl<'a> Iterator for Units<'a> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let b = *self.bytes.get(self.pos)?;
        if b < 0x80 {
            self.pos += 1;
            Some(b as u16)
        } else if b < 0xe0 {
            let b1 = self.bytes.get(self.pos + 1).copied().unwrap_or(0);
            self.pos += 2;
            Some((((b as u16) & 0x1f) << 6) | ((b1 as u16) & 0x3f))
        } else {
            let b1 = self.bytes.get(self.pos + 1).copied().unwrap_or(0);
            let b2 = self.bytes.get(self.pos + 2).copied().unwrap_or(0);
            self.pos += 3;
            Some((((b as u16) & 0x0f) << 12) | (((b1 as u16) & 0x3f) << 6) | ((b2 as u16) & 0x3f))
        }
    }
}

/// Code unit count of a CESU-8 run.
pub fn cesu8_units(bytes: &[u8]) -> u32 {
    Units::new(bytes).count() as u32
}

/// Decode CESU-8 to strict UTF-8, pairing surrogates; unpaired surrogates
/// become U+FFFD.
pub fn cesu8_to_utf8(bytes: &[u8]) -> String {
    let units: Vec<u16> = Units::new(bytes).collect();
    String::from_utf16_lossy(&units)
}

/// Encode UTF-16 code units into CESU-8.
pub fn utf16_to_cesu8(units: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(units.len());
    for &u in units {
        push_unit(&mut out, u);
    }
    out
}

// ---------------------------------------------------------------------------
// String cells
// ---------------------------------------------------------------------------

pub type ExternalFree = Box<dyn FnMut()>;

pub struct StringCell {
    /// CESU-8 payload.
    pub bytes: Rc<[u8]>,
    /// Length in UTF-16 code units; stored separately from the byte size.
    pub units: u32,
    pub hash: u32,
    /// Set for embedder-provided byte runs; fired exactly once when the cell
    /// is swept or the context is destroyed.
    on_free: Option<ExternalFree>,
}

impl std::fmt::Debug for StringCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StringCell({:?})", cesu8_to_utf8(&self.bytes))
    }
}

impl StringCell {
    pub fn from_cesu8(bytes: Vec<u8>) -> StringCell {
        let hash = hash_bytes(&bytes);
        let units = cesu8_units(&bytes);
        StringCell {
            bytes: Rc::from(bytes),
            units,
            hash,
            on_free: None,
        }
    }

    pub fn from_utf8(bytes: Vec<u8>) -> StringCell {
        match std::str::from_utf8(&bytes) {
            Ok(s) if s.is_ascii() => Self::from_cesu8(bytes),
            Ok(s) => Self::from_cesu8(utf8_to_cesu8(s)),
            Err(_) => Self::from_cesu8(utf8_to_cesu8(&String::from_utf8_lossy(&bytes))),
        }
    }

    pub fn external(bytes: Rc<[u8]>, on_free: ExternalFree) -> StringCell {
        let hash = hash_bytes(&bytes);
        let units = cesu8_units(&bytes);
        StringCell {
            bytes,
            units,
            hash,
            on_free: Some(on_free),
        }
    }

    pub fn run_free_hook(&mut self) {
        if let Some(mut hook) = self.on_free.take() {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// Intern set
// ---------------------------------------------------------------------------

/// One intern set per context. Every source literal and every property name
/// lands here; entries are GC roots for the life of the context.
#[derive(Default)]
pub struct InternSet {
    map: HashMap<Rc<[u8]>, Idx>,
}

impl InternSet {
    pub fn lookup(&self, bytes: &[u8]) -> Option<Idx> {
        self.map.get(bytes).copied()
    }

    pub fn insert(&mut self, bytes: Rc<[u8]>, idx: Idx) {
        self.map.insert(bytes, idx);
    }

    pub fn indices(&self) -> impl Iterator<Item = Idx> + '_ {
        self.map.values().copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Intern a UTF-8 string, preferring a magic id over a heap cell.
pub fn intern_utf8(ctx: &mut Context, s: &str) -> Value {
    if let Some(&id) = MAGIC_LOOKUP.get(s) {
        return Value::magic(id);
    }
    let base = MAGIC_STRINGS.len() as u16;
    for (i, ext) in ctx.magic_ext.iter().enumerate() {
        if ext.as_ref() == s.as_bytes() {
            return Value::magic(base + i as u16);
        }
    }
    let cesu = if s.is_ascii() {
        s.as_bytes().to_vec()
    } else {
        utf8_to_cesu8(s)
    };
    intern_cesu8(ctx, cesu)
}

/// Intern a CESU-8 byte run.
pub fn intern_cesu8(ctx: &mut Context, bytes: Vec<u8>) -> Value {
    if let Some(idx) = ctx.interner.lookup(&bytes) {
        return idx.value(HeapKind::String);
    }
    let cell = StringCell::from_cesu8(bytes);
    let shared = Rc::clone(&cell.bytes);
    let idx = heap::alloc(ctx, CellData::String(cell));
    ctx.interner.insert(shared, idx);
    idx.value(HeapKind::String)
}

/// Allocate a plain (non-interned) heap string from UTF-8.
pub fn alloc_utf8(ctx: &mut Context, s: &str) -> Value {
    let cesu = if s.is_ascii() {
        s.as_bytes().to_vec()
    } else {
        utf8_to_cesu8(s)
    };
    let idx = heap::alloc(ctx, CellData::String(StringCell::from_cesu8(cesu)));
    idx.value(HeapKind::String)
}

// ---------------------------------------------------------------------------
// Access helpers
// ---------------------------------------------------------------------------

/// CESU-8 bytes of any string value (magic or heap).
pub fn bytes_of(ctx: &Context, v: Value) -> Rc<[u8]> {
    debug_assert!(v.is_string());
    if v.is_magic_string() {
        magic_bytes(ctx, v.magic_id())
    } else {
        Rc::clone(&ctx.heap.string(Idx(v.heap_cp())).bytes)
    }
}

/// UTF-16 code unit length of a string value.
pub fn units_of(ctx: &Context, v: Value) -> u32 {
    if v.is_magic_string() {
        cesu8_units(&magic_bytes(ctx, v.magic_id()))
    } else {
        ctx.heap.string(Idx(v.heap_cp())).units
    }
}

/// Strict UTF-8 rendition of a string value.
pub fn to_rust_string(ctx: &Context, v: Value) -> String {
    cesu8_to_utf8(&bytes_of(ctx, v))
}

pub fn string_eq(ctx: &Context, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    bytes_of(ctx, a).as_ref() == bytes_of(ctx, b).as_ref()
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Append-only builder; grows geometrically (`Vec` semantics) and finalizes
/// into one contiguous string allocation.
#[derive(Default)]
pub struct StringBuilder {
    buf: Vec<u8>,
}

impl StringBuilder {
    pub fn new() -> StringBuilder {
        StringBuilder { buf: Vec::new() }
    }

    pub fn append_utf8(&mut self, s: &str) {
        if s.is_ascii() {
            self.buf.extend_from_slice(s.as_bytes());
        } else {
            self.buf.extend_from_slice(&utf8_to_cesu8(s));
        }
    }

    pub fn append_cesu8(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn append_string_value(&mut self, ctx: &Context, v: Value) {
        let bytes = bytes_of(ctx, v);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self, ctx: &mut Context) -> Value {
        if self.buf.is_empty() {
            return magic_value(Magic::Empty);
        }
        let idx = heap::alloc(ctx, CellData::String(StringCell::from_cesu8(self.buf)));
        idx.value(HeapKind::String)
    }
}

// ---------------------------------------------------------------------------
// Numeric conversions
// ---------------------------------------------------------------------------

/// Canonical array index: decimal digits with no leading zero, below
/// 2^32 - 1.
pub fn parse_array_index(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let mut n: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        n = n * 10 + (b - b'0') as u64;
    }
    if n < u32::MAX as u64 {
        Some(n as u32)
    } else {
        None
    }
}

/// ECMA ToString for numbers. Integers print plainly; non-integers use the
/// shortest round-tripping form; very large/small magnitudes switch to
/// exponent notation the way script expects.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    let abs = n.abs();
    if n.fract() == 0.0 && abs < 1e21 {
        return format!("{}", n as i64);
    }
    if (1e-6..1e21).contains(&abs) {
        return format!("{}", n);
    }
    // Exponent form: mantissa then e+NN / e-NN without leading zeros.
    let s = format!("{:e}", n);
    match s.split_once('e') {
        Some((mant, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{}e{}{}", mant, sign, exp.abs())
        }
        None => s,
    }
}

/// ECMA ToNumber for string input: optional whitespace, optional sign,
/// decimal / hex / octal / binary forms, Infinity; anything else is NaN.
pub fn string_to_number(s: &str) -> f64 {
    let t = s.trim_matches(|c: char| c.is_whitespace());
    if t.is_empty() {
        return 0.0;
    }
    let (sign, body) = match t.as_bytes()[0] {
        b'+' => (1.0, &t[1..]),
        b'-' => (-1.0, &t[1..]),
        _ => (1.0, t),
    };
    if body == "Infinity" {
        return sign * f64::INFINITY;
    }
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        if sign < 0.0 {
            return f64::NAN;
        }
        return u64::from_str_radix(hex, 16).map(|v| v as f64).unwrap_or(f64::NAN);
    }
    if let Some(oct) = body.strip_prefix("0o").or_else(|| body.strip_prefix("0O")) {
        if sign < 0.0 {
            return f64::NAN;
        }
        return u64::from_str_radix(oct, 8).map(|v| v as f64).unwrap_or(f64::NAN);
    }
    if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        if sign < 0.0 {
            return f64::NAN;
        }
        return u64::from_str_radix(bin, 2).map(|v| v as f64).unwrap_or(f64::NAN);
    }
    body.parse::<f64>().map(|v| sign * v).unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_table_in_sync() {
        assert_eq!(MAGIC_STRINGS[Magic::Length as usize], "length");
        assert_eq!(MAGIC_STRINGS[Magic::Prototype as usize], "prototype");
        assert_eq!(MAGIC_STRINGS[Magic::ProtoDunder as usize], "__proto__");
        assert_eq!(MAGIC_STRINGS[Magic::Now as usize], "now");
        assert_eq!(MAGIC_LOOKUP.get("length"), Some(&(Magic::Length as u16)));
        assert_eq!(MAGIC_STRINGS.len(), Magic::Now as usize + 1);
    }

    #[test]
    fn cesu8_bmp_round_trip() {
        let src = "hello wörld";
        let cesu = utf8_to_cesu8(src);
        assert_eq!(cesu8_to_utf8(&cesu), src);
        assert_eq!(cesu8_units(&cesu), src.chars().count() as u32);
    }

    #[test]
    fn cesu8_supplementary_is_six_bytes() {
        let src = "\u{1f600}"; // one supplementary code point
        let cesu = utf8_to_cesu8(src);
        assert_eq!(cesu.len(), 6);
        assert_eq!(cesu8_units(&cesu), 2);
        assert_eq!(cesu8_to_utf8(&cesu), src);
    }

    #[test]
    fn utf16_round_trip() {
        let src = "a\u{1f600}b";
        let units: Vec<u16> = src.encode_utf16().collect();
        let cesu = utf16_to_cesu8(&units);
        let back: Vec<u16> = Units::new(&cesu).collect();
        assert_eq!(units, back);
    }

    #[test]
    fn array_index_rules() {
        assert_eq!(parse_array_index(b"0"), Some(0));
        assert_eq!(parse_array_index(b"42"), Some(42));
        assert_eq!(parse_array_index(b"01"), None);
        assert_eq!(parse_array_index(b""), None);
        assert_eq!(parse_array_index(b"4294967295"), None); // 2^32-1 excluded
        assert_eq!(parse_array_index(b"4294967294"), Some(4294967294));
        assert_eq!(parse_array_index(b"1x"), None);
    }

    #[test]
    fn number_formatting() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(-5.6), "-5.6");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(1e-7), "1e-7");
    }

    #[test]
    fn string_to_number_forms() {
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("  12  "), 12.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("0b101"), 5.0);
        assert_eq!(string_to_number("0o17"), 15.0);
        assert_eq!(string_to_number("-3.5"), -3.5);
        assert!(string_to_number("12px").is_nan());
        assert_eq!(string_to_number("Infinity"), f64::INFINITY);
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_bytes(b"length"), hash_bytes(b"length"));
        assert_ne!(hash_bytes(b"length"), hash_bytes(b"lengtg"));
    }
}
