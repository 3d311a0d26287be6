/// Tagged Value — 32-bit Packed Word
///
/// Every engine value fits one 32-bit word. No heap allocation for small
/// integers, the simple constants, or magic strings.
///
///   31                                    2 1 0
///   [            payload : 30            ] TAG
///
/// Tag space (bits 1..0):
///   00 = direct      — sub-tag in bits 3..2:
///          00 simple constant  (code in bits 31..4)
///          01 magic string     (table index in bits 31..4)
///   01 = small int   — signed 30-bit payload in bits 31..2
///   10 = heap ref    — ref kind in bits 4..2, compressed pointer in bits 31..5
///   11 = error ref   — compressed pointer to an error-reference cell
///
/// The error tag is the value-level "thrown" marker: any value can be wrapped
/// into an error-reference cell and unwrapped later; the payload kind of the
/// wrapped value is untouched. Compressed pointers are heap-slot indices
/// (`heap::Idx`), so the word never holds a native address.
use std::fmt;

// ---------------------------------------------------------------------------
// Tag constants
// ---------------------------------------------------------------------------

const TAG_MASK: u32 = 0x3;
const TAG_DIRECT: u32 = 0x0;
const TAG_INT: u32 = 0x1;
const TAG_HEAP: u32 = 0x2;
const TAG_ERROR: u32 = 0x3;

const DIRECT_SUB_MASK: u32 = 0xC;
const DIRECT_SIMPLE: u32 = 0x0;
const DIRECT_MAGIC: u32 = 0x4;

const SIMPLE_SHIFT: u32 = 4;
const HEAP_KIND_SHIFT: u32 = 2;
const HEAP_KIND_MASK: u32 = 0x7;
const HEAP_CP_SHIFT: u32 = 5;
const ERROR_CP_SHIFT: u32 = 2;

/// Range of the direct small integer: signed 30 bits.
pub const INT_MIN: i32 = -(1 << 29);
pub const INT_MAX: i32 = (1 << 29) - 1;

// Simple constant codes
const SIMPLE_UNDEFINED: u32 = 0;
const SIMPLE_NULL: u32 = 1;
const SIMPLE_FALSE: u32 = 2;
const SIMPLE_TRUE: u32 = 3;
const SIMPLE_EMPTY: u32 = 4;
const SIMPLE_NOT_FOUND: u32 = 5;
const SIMPLE_HOLE: u32 = 6;
const SIMPLE_UNINITIALIZED: u32 = 7;

/// What a heap reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeapKind {
    String = 0,
    Number = 1,
    Object = 2,
    Symbol = 3,
    ByteCode = 4,
}

impl HeapKind {
    fn from_bits(bits: u32) -> HeapKind {
        match bits {
            0 => HeapKind::String,
            1 => HeapKind::Number,
            2 => HeapKind::Object,
            3 => HeapKind::Symbol,
            _ => HeapKind::ByteCode,
        }
    }
}

/// A packed engine value. `Copy`, context-relative, meaningless outside the
/// context whose heap its compressed pointers index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u32);

impl Value {
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    pub const UNDEFINED: Value = Value(SIMPLE_UNDEFINED << SIMPLE_SHIFT);
    pub const NULL: Value = Value((SIMPLE_NULL << SIMPLE_SHIFT) | TAG_DIRECT);
    pub const FALSE: Value = Value((SIMPLE_FALSE << SIMPLE_SHIFT) | TAG_DIRECT);
    pub const TRUE: Value = Value((SIMPLE_TRUE << SIMPLE_SHIFT) | TAG_DIRECT);
    /// Internal "no completion value" marker; never visible to script.
    pub const EMPTY: Value = Value((SIMPLE_EMPTY << SIMPLE_SHIFT) | TAG_DIRECT);
    /// Internal "property not found" marker; never visible to script.
    pub const NOT_FOUND: Value = Value((SIMPLE_NOT_FOUND << SIMPLE_SHIFT) | TAG_DIRECT);
    /// Array hole sentinel inside fast element storage.
    pub const HOLE: Value = Value((SIMPLE_HOLE << SIMPLE_SHIFT) | TAG_DIRECT);
    /// TDZ marker for let/const bindings.
    pub const UNINITIALIZED: Value = Value((SIMPLE_UNINITIALIZED << SIMPLE_SHIFT) | TAG_DIRECT);

    #[inline(always)]
    pub const fn bool_val(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Small integer. Caller guarantees `INT_MIN ..= INT_MAX`.
    #[inline(always)]
    pub fn from_i30(n: i32) -> Value {
        debug_assert!((INT_MIN..=INT_MAX).contains(&n));
        Value(((n as u32) << 2) | TAG_INT)
    }

    #[inline(always)]
    pub fn fits_i30(n: i32) -> bool {
        (INT_MIN..=INT_MAX).contains(&n)
    }

    #[inline(always)]
    pub fn magic(id: u16) -> Value {
        Value(((id as u32) << SIMPLE_SHIFT) | DIRECT_MAGIC | TAG_DIRECT)
    }

    #[inline(always)]
    pub fn heap(kind: HeapKind, cp: u32) -> Value {
        debug_assert!(cp < (1 << (32 - HEAP_CP_SHIFT)));
        Value((cp << HEAP_CP_SHIFT) | ((kind as u32) << HEAP_KIND_SHIFT) | TAG_HEAP)
    }

    #[inline(always)]
    pub fn error_ref(cp: u32) -> Value {
        Value((cp << ERROR_CP_SHIFT) | TAG_ERROR)
    }

    // -----------------------------------------------------------------------
    // Type checks
    // -----------------------------------------------------------------------

    #[inline(always)]
    pub fn is_undefined(self) -> bool {
        self == Value::UNDEFINED
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self == Value::NULL
    }

    #[inline(always)]
    pub fn is_nullish(self) -> bool {
        self.is_undefined() || self.is_null()
    }

    #[inline(always)]
    pub fn is_bool(self) -> bool {
        self == Value::TRUE || self == Value::FALSE
    }

    #[inline(always)]
    pub fn is_true(self) -> bool {
        self == Value::TRUE
    }

    #[inline(always)]
    pub fn is_empty(self) -> bool {
        self == Value::EMPTY
    }

    #[inline(always)]
    pub fn is_not_found(self) -> bool {
        self == Value::NOT_FOUND
    }

    #[inline(always)]
    pub fn is_hole(self) -> bool {
        self == Value::HOLE
    }

    #[inline(always)]
    pub fn is_uninitialized(self) -> bool {
        self == Value::UNINITIALIZED
    }

    #[inline(always)]
    pub fn is_int(self) -> bool {
        self.0 & TAG_MASK == TAG_INT
    }

    #[inline(always)]
    pub fn is_magic_string(self) -> bool {
        self.0 & (TAG_MASK | DIRECT_SUB_MASK) == (TAG_DIRECT | DIRECT_MAGIC)
    }

    #[inline(always)]
    pub fn is_heap(self) -> bool {
        self.0 & TAG_MASK == TAG_HEAP
    }

    #[inline(always)]
    pub fn is_heap_kind(self, kind: HeapKind) -> bool {
        self.is_heap() && self.heap_kind() == kind
    }

    /// Heap string or magic string.
    #[inline(always)]
    pub fn is_string(self) -> bool {
        self.is_magic_string() || self.is_heap_kind(HeapKind::String)
    }

    #[inline(always)]
    pub fn is_object_ref(self) -> bool {
        self.is_heap_kind(HeapKind::Object)
    }

    #[inline(always)]
    pub fn is_number(self) -> bool {
        self.is_int() || self.is_heap_kind(HeapKind::Number)
    }

    #[inline(always)]
    pub fn is_symbol(self) -> bool {
        self.is_heap_kind(HeapKind::Symbol)
    }

    #[inline(always)]
    pub fn is_exception(self) -> bool {
        self.0 & TAG_MASK == TAG_ERROR
    }

    // -----------------------------------------------------------------------
    // Extractors
    // -----------------------------------------------------------------------

    #[inline(always)]
    pub fn as_i30(self) -> i32 {
        debug_assert!(self.is_int());
        (self.0 as i32) >> 2
    }

    #[inline(always)]
    pub fn as_bool(self) -> bool {
        self == Value::TRUE
    }

    #[inline(always)]
    pub fn magic_id(self) -> u16 {
        debug_assert!(self.is_magic_string());
        (self.0 >> SIMPLE_SHIFT) as u16
    }

    #[inline(always)]
    pub fn heap_kind(self) -> HeapKind {
        debug_assert!(self.is_heap());
        HeapKind::from_bits((self.0 >> HEAP_KIND_SHIFT) & HEAP_KIND_MASK)
    }

    #[inline(always)]
    pub fn heap_cp(self) -> u32 {
        debug_assert!(self.is_heap());
        self.0 >> HEAP_CP_SHIFT
    }

    #[inline(always)]
    pub fn error_cp(self) -> u32 {
        debug_assert!(self.is_exception());
        self.0 >> ERROR_CP_SHIFT
    }

    #[inline(always)]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub fn from_raw(raw: u32) -> Value {
        Value(raw)
    }

    /// Name used by `typeof` for values whose kind the word alone decides.
    /// Objects need the heap to distinguish functions; the VM handles that.
    pub fn type_name(self) -> &'static str {
        if self.is_undefined() {
            "undefined"
        } else if self.is_null() {
            "object"
        } else if self.is_bool() {
            "boolean"
        } else if self.is_number() {
            "number"
        } else if self.is_string() {
            "string"
        } else if self.is_symbol() {
            "symbol"
        } else {
            "object"
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_undefined() {
            write!(f, "undefined")
        } else if self.is_null() {
            write!(f, "null")
        } else if self.is_bool() {
            write!(f, "{}", self.as_bool())
        } else if self.is_empty() {
            write!(f, "<empty>")
        } else if self.is_not_found() {
            write!(f, "<not-found>")
        } else if self.is_hole() {
            write!(f, "<hole>")
        } else if self.is_uninitialized() {
            write!(f, "<tdz>")
        } else if self.is_int() {
            write!(f, "{}i", self.as_i30())
        } else if self.is_magic_string() {
            write!(f, "magic#{}", self.magic_id())
        } else if self.is_exception() {
            write!(f, "error@{}", self.error_cp())
        } else {
            write!(f, "{:?}@{}", self.heap_kind(), self.heap_cp())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_constants_are_distinct() {
        let all = [
            Value::UNDEFINED,
            Value::NULL,
            Value::FALSE,
            Value::TRUE,
            Value::EMPTY,
            Value::NOT_FOUND,
            Value::HOLE,
            Value::UNINITIALIZED,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }

    #[test]
    fn int_round_trip() {
        for n in [0, 1, -1, 42, INT_MAX, INT_MIN] {
            let v = Value::from_i30(n);
            assert!(v.is_int());
            assert_eq!(v.as_i30(), n);
        }
    }

    #[test]
    fn int_range_check() {
        assert!(Value::fits_i30(0));
        assert!(Value::fits_i30(INT_MAX));
        assert!(Value::fits_i30(INT_MIN));
        assert!(!Value::fits_i30(INT_MAX + 1));
        assert!(!Value::fits_i30(INT_MIN - 1));
    }

    #[test]
    fn heap_ref_round_trip() {
        let v = Value::heap(HeapKind::Object, 12345);
        assert!(v.is_heap());
        assert!(v.is_object_ref());
        assert_eq!(v.heap_kind(), HeapKind::Object);
        assert_eq!(v.heap_cp(), 12345);
        assert!(!v.is_exception());
    }

    #[test]
    fn error_ref_round_trip() {
        let v = Value::error_ref(777);
        assert!(v.is_exception());
        assert_eq!(v.error_cp(), 777);
        assert!(!v.is_heap());
        assert!(!v.is_int());
    }

    #[test]
    fn magic_string_round_trip() {
        let v = Value::magic(31);
        assert!(v.is_magic_string());
        assert!(v.is_string());
        assert_eq!(v.magic_id(), 31);
    }

    #[test]
    fn exactly_one_kind_per_value() {
        // Value round-trip property: each creatable value answers true to
        // exactly one of the top-level kind predicates.
        let values = [
            Value::UNDEFINED,
            Value::NULL,
            Value::TRUE,
            Value::from_i30(-7),
            Value::magic(2),
            Value::heap(HeapKind::String, 9),
            Value::heap(HeapKind::Object, 9),
            Value::heap(HeapKind::Number, 9),
            Value::heap(HeapKind::Symbol, 9),
            Value::error_ref(4),
        ];
        for v in values {
            let kinds = [
                v.is_undefined(),
                v.is_null(),
                v.is_bool(),
                v.is_int() || v.is_heap_kind(HeapKind::Number),
                v.is_string(),
                v.is_symbol(),
                v.is_object_ref(),
                v.is_exception(),
            ];
            assert_eq!(kinds.iter().filter(|k| **k).count(), 1, "{:?}", v);
        }
    }
}
