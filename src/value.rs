//! Tagged value words.
//!
//! Every runtime datum is one 64-bit word. The low two bits pick the class:
//!
//!   Fixnum:    PPPP…PP00  (P = 62-bit signed integer, shifted left 2)
//!   Object:    IIII…II01  (I = arena index of a heap object)
//!   Index:     IIII…II10  (I = object-stream index; transient, only alive
//!                          between library read and fix-up)
//!   Immediate: SSSS…SS11  (bits 2..5 subtag: character / boolean / singleton)
//!
//! The tag bits never escape this module: everything else constructs values
//! through the constructors here and tests classes through the predicates.
//! Converting an object value to its arena index is a pure mask — the type
//! tag of the object itself is checked separately by the object model.

use std::fmt;

pub const TAG_MASK: u64 = 0b11;
pub const TAG_FIXNUM: u64 = 0b00;
pub const TAG_OBJECT: u64 = 0b01;
pub const TAG_INDEX: u64 = 0b10;
pub const TAG_IMMEDIATE: u64 = 0b11;

const SUBTAG_MASK: u64 = 0b111 << 2;
const SUBTAG_CHAR: u64 = 0b000 << 2;
const SUBTAG_BOOL: u64 = 0b001 << 2;
const SUBTAG_SINGLETON: u64 = 0b010 << 2;

const PAYLOAD_SHIFT: u32 = 5;

/// Smallest fixnum representable without promotion to the numeric tower.
pub const FIXNUM_MIN: i64 = -(1 << 61);
/// Largest fixnum representable without promotion to the numeric tower.
pub const FIXNUM_MAX: i64 = (1 << 61) - 1;

/// True when `n` fits the fixnum range. Arithmetic that leaves this range is
/// the signal to promote to the rational/bignum representation, which lives
/// outside this crate.
#[inline]
pub fn fixnum_in_range(n: i64) -> bool {
    (FIXNUM_MIN..=FIXNUM_MAX).contains(&n)
}

/// One tagged machine word.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    /// The empty list.
    pub const NIL: Value = Value::singleton(0);
    /// End-of-file object.
    pub const EOF: Value = Value::singleton(1);
    /// The unspecified value (result of effects like `set!`).
    pub const UNSPECIFIED: Value = Value::singleton(2);
    /// An unbound/undefined marker.
    pub const UNDEFINED: Value = Value::singleton(3);
    /// Bottom-of-stack sentinel terminating every frame chain.
    pub const BOTTOM: Value = Value::singleton(4);

    pub const TRUE: Value = Value(TAG_IMMEDIATE | SUBTAG_BOOL | (1 << PAYLOAD_SHIFT));
    pub const FALSE: Value = Value(TAG_IMMEDIATE | SUBTAG_BOOL);

    const fn singleton(id: u64) -> Value {
        Value(TAG_IMMEDIATE | SUBTAG_SINGLETON | (id << PAYLOAD_SHIFT))
    }

    // -- constructors (immediates never allocate) --

    #[inline]
    pub fn fixnum(n: i64) -> Value {
        debug_assert!(fixnum_in_range(n));
        Value((n as u64) << 2)
    }

    #[inline]
    pub fn char(c: char) -> Value {
        Value(TAG_IMMEDIATE | SUBTAG_CHAR | ((c as u64) << PAYLOAD_SHIFT))
    }

    #[inline]
    pub fn bool(b: bool) -> Value {
        if b {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    /// Reference to the heap object at arena index `idx`.
    #[inline]
    pub fn object(idx: usize) -> Value {
        Value(((idx as u64) << 2) | TAG_OBJECT)
    }

    /// Serialization-stream index. Only the library reader produces these;
    /// none survive fix-up.
    #[inline]
    pub fn stream_index(idx: usize) -> Value {
        Value(((idx as u64) << 2) | TAG_INDEX)
    }

    /// Rebuild a value from its raw word. Used by the library reader, whose
    /// stream stores immediate values as raw bits.
    #[inline]
    pub fn from_raw(bits: u64) -> Value {
        Value(bits)
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    // -- predicates (all O(1) bit tests) --

    #[inline]
    pub fn is_fixnum(self) -> bool {
        self.0 & TAG_MASK == TAG_FIXNUM
    }

    #[inline]
    pub fn is_object(self) -> bool {
        self.0 & TAG_MASK == TAG_OBJECT
    }

    #[inline]
    pub fn is_index(self) -> bool {
        self.0 & TAG_MASK == TAG_INDEX
    }

    #[inline]
    pub fn is_char(self) -> bool {
        self.0 & (TAG_MASK | SUBTAG_MASK) == (TAG_IMMEDIATE | SUBTAG_CHAR)
    }

    #[inline]
    pub fn is_bool(self) -> bool {
        self.0 & (TAG_MASK | SUBTAG_MASK) == (TAG_IMMEDIATE | SUBTAG_BOOL)
    }

    #[inline]
    pub fn is_nil(self) -> bool {
        self == Value::NIL
    }

    #[inline]
    pub fn is_bottom(self) -> bool {
        self == Value::BOTTOM
    }

    /// Everything except `#f` is truthy.
    #[inline]
    pub fn is_truthy(self) -> bool {
        self != Value::FALSE
    }

    // -- accessors --

    #[inline]
    pub fn as_fixnum(self) -> i64 {
        debug_assert!(self.is_fixnum());
        (self.0 as i64) >> 2
    }

    /// Arena index of a reference value. Pure mask, no validation.
    #[inline]
    pub fn object_index(self) -> usize {
        debug_assert!(self.is_object());
        (self.0 >> 2) as usize
    }

    #[inline]
    pub fn as_stream_index(self) -> usize {
        debug_assert!(self.is_index());
        (self.0 >> 2) as usize
    }

    #[inline]
    pub fn as_char(self) -> char {
        debug_assert!(self.is_char());
        char::from_u32((self.0 >> PAYLOAD_SHIFT) as u32).unwrap_or('\u{FFFD}')
    }

    #[inline]
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool());
        self.0 >> PAYLOAD_SHIFT != 0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fixnum() {
            write!(f, "{}", self.as_fixnum())
        } else if self.is_object() {
            write!(f, "#<obj {}>", self.object_index())
        } else if self.is_index() {
            write!(f, "#<index {}>", self.as_stream_index())
        } else if self.is_char() {
            write!(f, "#\\{}", self.as_char())
        } else if self.is_bool() {
            write!(f, "{}", if self.as_bool() { "#t" } else { "#f" })
        } else if *self == Value::NIL {
            write!(f, "()")
        } else if *self == Value::EOF {
            write!(f, "#<eof>")
        } else if *self == Value::UNSPECIFIED {
            write!(f, "#<unspecified>")
        } else if *self == Value::UNDEFINED {
            write!(f, "#<undefined>")
        } else if *self == Value::BOTTOM {
            write!(f, "#<bottom>")
        } else {
            write!(f, "#<immediate {:#x}>", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixnum_round_trip() {
        for n in [0i64, 1, -1, 42, -42, FIXNUM_MIN, FIXNUM_MAX] {
            let v = Value::fixnum(n);
            assert!(v.is_fixnum());
            assert_eq!(v.as_fixnum(), n);
        }
    }

    #[test]
    fn fixnum_range_predicate() {
        assert!(fixnum_in_range(0));
        assert!(fixnum_in_range(FIXNUM_MIN));
        assert!(fixnum_in_range(FIXNUM_MAX));
        assert!(!fixnum_in_range(FIXNUM_MAX + 1));
        assert!(!fixnum_in_range(FIXNUM_MIN - 1));
    }

    #[test]
    fn char_round_trip() {
        for c in ['a', 'λ', '\0', '\u{10FFFF}'] {
            let v = Value::char(c);
            assert!(v.is_char());
            assert!(!v.is_fixnum());
            assert_eq!(v.as_char(), c);
        }
    }

    #[test]
    fn booleans_are_distinct() {
        assert!(Value::TRUE.is_bool());
        assert!(Value::FALSE.is_bool());
        assert!(Value::TRUE.as_bool());
        assert!(!Value::FALSE.as_bool());
        assert_ne!(Value::TRUE, Value::FALSE);
    }

    #[test]
    fn only_false_is_falsy() {
        assert!(!Value::FALSE.is_truthy());
        assert!(Value::TRUE.is_truthy());
        assert!(Value::NIL.is_truthy());
        assert!(Value::fixnum(0).is_truthy());
    }

    #[test]
    fn object_index_is_pure_mask() {
        let v = Value::object(12345);
        assert!(v.is_object());
        assert!(!v.is_fixnum());
        assert!(!v.is_index());
        assert_eq!(v.object_index(), 12345);
    }

    #[test]
    fn stream_index_is_distinct_from_object() {
        let o = Value::object(7);
        let i = Value::stream_index(7);
        assert_ne!(o, i);
        assert!(i.is_index());
        assert_eq!(i.as_stream_index(), 7);
    }

    #[test]
    fn singletons_are_distinct() {
        let all = [
            Value::NIL,
            Value::EOF,
            Value::UNSPECIFIED,
            Value::UNDEFINED,
            Value::BOTTOM,
            Value::TRUE,
            Value::FALSE,
        ];
        for (i, a) in all.iter().enumerate() {
            for (j, b) in all.iter().enumerate() {
                assert_eq!(i == j, a == b);
            }
        }
    }

    #[test]
    fn raw_round_trip() {
        let v = Value::fixnum(-99);
        assert_eq!(Value::from_raw(v.raw()), v);
        let v = Value::char('x');
        assert_eq!(Value::from_raw(v.raw()), v);
    }
}
