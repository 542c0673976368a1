//! Heap object model: type tags, object bodies, and the per-tag ops table.
//!
//! Every collectable object carries an `ObjTag` from a closed enumeration.
//! The collector and the serializer never dispatch virtually: each tag has a
//! row in [`OBJ_OPS`], a fixed-size static table of function pointers
//! (`size_words`, `relocate`, `write`, `read`, `fixup`). The same row is used
//! on the GC hot copy path and by the library writer/reader, so the table is
//! verified once at startup — a tag whose row is out of place is a fatal
//! configuration error, caught before any collection can run.

use crate::heap::gc::{self, Collector};
use crate::library::{read, write, LibError};
use crate::value::Value;
use crate::vm::frame::StackFrame;

use std::io::{Read, Write};

/// Closed enumeration of heap object kinds.
///
/// The discriminants are the `type_tag: u16` of the library file format and
/// must stay bit-identical across producers and consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum ObjTag {
    Pair = 0,
    Vector = 1,
    Str = 2,
    Symbol = 3,
    Code = 4,
    Lambda = 5,
    Cps = 6,
    ArgFrame = 7,
    Frame = 8,
    Continuation = 9,
    Wind = 10,
    Condition = 11,
}

impl ObjTag {
    pub const COUNT: usize = 12;

    pub fn from_u16(v: u16) -> Option<ObjTag> {
        match v {
            0 => Some(ObjTag::Pair),
            1 => Some(ObjTag::Vector),
            2 => Some(ObjTag::Str),
            3 => Some(ObjTag::Symbol),
            4 => Some(ObjTag::Code),
            5 => Some(ObjTag::Lambda),
            6 => Some(ObjTag::Cps),
            7 => Some(ObjTag::ArgFrame),
            8 => Some(ObjTag::Frame),
            9 => Some(ObjTag::Continuation),
            10 => Some(ObjTag::Wind),
            11 => Some(ObjTag::Condition),
            _ => None,
        }
    }
}

/// Sentinel for a Cps wrapper whose native step has not been linked yet.
/// Only the library reader produces these; fix-up resolves them.
pub const NATIVE_UNLINKED: u16 = u16::MAX;

/// A heap object body. Fixed-length kinds (Pair, Lambda, Cps, Wind, Frame,
/// Continuation) have the same size for every instance; variable-length kinds
/// carry a trailing array whose size is fixed at allocation.
#[derive(Clone, Debug)]
pub enum ObjBody {
    Pair {
        car: Value,
        cdr: Value,
    },
    Vector(Vec<Value>),
    Str(String),
    Symbol(String),
    /// Instruction and inline operand words, intermixed. A program counter is
    /// an index into this array.
    Code(Vec<Value>),
    Lambda {
        code: Value,
        entry: usize,
        arity: usize,
        env: Value,
    },
    /// CPS wrapper: a native step paired with its symbol so built-ins are
    /// callable (and serializable) uniformly with closures.
    Cps {
        native: u16,
        name: Value,
    },
    /// Environment rib: argument slots plus the lexically enclosing rib.
    ArgFrame {
        slots: Vec<Value>,
        parent: Value,
    },
    /// A saved call frame. Immutable once allocated; the chain through `sfp`
    /// is shared by captured continuations.
    Frame(StackFrame),
    /// A captured copy of the active frame. Invoking it is a multi-shot jump.
    Continuation(StackFrame),
    /// One `dynamic-wind` extent threaded through the frame chain.
    Wind {
        before: Value,
        after: Value,
        prev: Value,
    },
    Condition {
        kind: Value,
        message: Value,
        irritants: Vec<Value>,
    },
}

impl ObjBody {
    pub fn tag(&self) -> ObjTag {
        match self {
            ObjBody::Pair { .. } => ObjTag::Pair,
            ObjBody::Vector(_) => ObjTag::Vector,
            ObjBody::Str(_) => ObjTag::Str,
            ObjBody::Symbol(_) => ObjTag::Symbol,
            ObjBody::Code(_) => ObjTag::Code,
            ObjBody::Lambda { .. } => ObjTag::Lambda,
            ObjBody::Cps { .. } => ObjTag::Cps,
            ObjBody::ArgFrame { .. } => ObjTag::ArgFrame,
            ObjBody::Frame(_) => ObjTag::Frame,
            ObjBody::Continuation(_) => ObjTag::Continuation,
            ObjBody::Wind { .. } => ObjTag::Wind,
            ObjBody::Condition { .. } => ObjTag::Condition,
        }
    }

    /// Visit every outgoing reference field (immediates included; the visitor
    /// filters). Used by the library writer's discovery worklist. The GC does
    /// not use this — it goes through the `relocate` rows of [`OBJ_OPS`].
    pub fn each_child(&self, f: &mut dyn FnMut(Value)) {
        match self {
            ObjBody::Pair { car, cdr } => {
                f(*car);
                f(*cdr);
            }
            ObjBody::Vector(slots) => slots.iter().for_each(|v| f(*v)),
            ObjBody::Str(_) | ObjBody::Symbol(_) => {}
            ObjBody::Code(words) => words.iter().for_each(|v| f(*v)),
            ObjBody::Lambda { code, env, .. } => {
                f(*code);
                f(*env);
            }
            ObjBody::Cps { name, .. } => f(*name),
            ObjBody::ArgFrame { slots, parent } => {
                slots.iter().for_each(|v| f(*v));
                f(*parent);
            }
            ObjBody::Frame(frame) | ObjBody::Continuation(frame) => frame.each_child(f),
            ObjBody::Wind {
                before,
                after,
                prev,
            } => {
                f(*before);
                f(*after);
                f(*prev);
            }
            ObjBody::Condition {
                kind,
                message,
                irritants,
            } => {
                f(*kind);
                f(*message);
                irritants.iter().for_each(|v| f(*v));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tag ops table
// ---------------------------------------------------------------------------

/// The operations registered for one object tag. Looked up by tag index,
/// never by virtual call, so the same row serves the collector's copy path
/// and the serializer.
pub struct ObjOps {
    /// Must equal the row position; checked by [`verify_ops_table`].
    pub tag: ObjTag,
    /// Allocation size in words: a constant for fixed-length kinds, header
    /// plus trailing array for variable-length kinds.
    pub size_words: fn(&ObjBody) -> usize,
    /// Rewrite every outgoing reference to its image in the destination
    /// space, copying referents on first contact.
    pub relocate: fn(&mut ObjBody, &mut Collector),
    /// Serialize the payload; references become stream indices.
    pub write: fn(&ObjBody, &mut dyn Write, &write::IndexTable) -> Result<(), LibError>,
    /// Deserialize a payload; references come back `Index`-tagged.
    pub read: fn(&mut dyn Read) -> Result<ObjBody, LibError>,
    /// Rewrite `Index`-tagged fields through the populated object table.
    pub fixup: fn(&mut ObjBody, &[Value]) -> Result<(), LibError>,
}

fn size_pair(_: &ObjBody) -> usize {
    2
}
fn size_vector(b: &ObjBody) -> usize {
    match b {
        ObjBody::Vector(s) => 1 + s.len(),
        _ => gc::invariant_violation("size_vector on non-vector"),
    }
}
fn size_str(b: &ObjBody) -> usize {
    match b {
        ObjBody::Str(s) | ObjBody::Symbol(s) => 1 + s.len().div_ceil(8),
        _ => gc::invariant_violation("size_str on non-string"),
    }
}
fn size_code(b: &ObjBody) -> usize {
    match b {
        ObjBody::Code(w) => 1 + w.len(),
        _ => gc::invariant_violation("size_code on non-code"),
    }
}
fn size_lambda(_: &ObjBody) -> usize {
    4
}
fn size_cps(_: &ObjBody) -> usize {
    2
}
fn size_argframe(b: &ObjBody) -> usize {
    match b {
        ObjBody::ArgFrame { slots, .. } => 2 + slots.len(),
        _ => gc::invariant_violation("size_argframe on non-argframe"),
    }
}
fn size_frame(_: &ObjBody) -> usize {
    8
}
fn size_wind(_: &ObjBody) -> usize {
    3
}
fn size_condition(b: &ObjBody) -> usize {
    match b {
        ObjBody::Condition { irritants, .. } => 3 + irritants.len(),
        _ => gc::invariant_violation("size_condition on non-condition"),
    }
}

/// Static ops table indexed by `ObjTag` discriminant.
pub static OBJ_OPS: [ObjOps; ObjTag::COUNT] = [
    ObjOps {
        tag: ObjTag::Pair,
        size_words: size_pair,
        relocate: gc::relocate_pair,
        write: write::write_pair,
        read: read::read_pair,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Vector,
        size_words: size_vector,
        relocate: gc::relocate_vector,
        write: write::write_vector,
        read: read::read_vector,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Str,
        size_words: size_str,
        relocate: gc::relocate_leaf,
        write: write::write_str,
        read: read::read_str,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Symbol,
        size_words: size_str,
        relocate: gc::relocate_leaf,
        write: write::write_symbol,
        read: read::read_symbol,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Code,
        size_words: size_code,
        relocate: gc::relocate_code,
        write: write::write_code,
        read: read::read_code,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Lambda,
        size_words: size_lambda,
        relocate: gc::relocate_lambda,
        write: write::write_lambda,
        read: read::read_lambda,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Cps,
        size_words: size_cps,
        relocate: gc::relocate_cps,
        write: write::write_cps,
        read: read::read_cps,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::ArgFrame,
        size_words: size_argframe,
        relocate: gc::relocate_argframe,
        write: write::write_argframe,
        read: read::read_argframe,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Frame,
        size_words: size_frame,
        relocate: gc::relocate_frame_obj,
        write: write::write_unserializable,
        read: read::read_unreadable,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Continuation,
        size_words: size_frame,
        relocate: gc::relocate_frame_obj,
        write: write::write_unserializable,
        read: read::read_unreadable,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Wind,
        size_words: size_wind,
        relocate: gc::relocate_wind,
        write: write::write_unserializable,
        read: read::read_unreadable,
        fixup: read::fixup_generic,
    },
    ObjOps {
        tag: ObjTag::Condition,
        size_words: size_condition,
        relocate: gc::relocate_condition,
        write: write::write_unserializable,
        read: read::read_unreadable,
        fixup: read::fixup_generic,
    },
];

/// Abort unless every tag's row sits at its own discriminant. Called once
/// from heap construction, so a miswired table dies before the first
/// collection rather than during one.
pub fn verify_ops_table() {
    for (i, ops) in OBJ_OPS.iter().enumerate() {
        if ops.tag as usize != i {
            gc::invariant_violation("object ops table row does not match its tag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for i in 0..ObjTag::COUNT as u16 {
            let tag = ObjTag::from_u16(i).expect("tag in range");
            assert_eq!(tag as u16, i);
        }
        assert_eq!(ObjTag::from_u16(ObjTag::COUNT as u16), None);
    }

    #[test]
    fn ops_table_is_aligned() {
        verify_ops_table();
    }

    #[test]
    fn size_is_fixed_for_fixed_kinds() {
        let a = ObjBody::Pair {
            car: Value::NIL,
            cdr: Value::NIL,
        };
        let b = ObjBody::Pair {
            car: Value::fixnum(1),
            cdr: Value::fixnum(2),
        };
        let size = OBJ_OPS[ObjTag::Pair as usize].size_words;
        assert_eq!(size(&a), size(&b));
    }

    #[test]
    fn size_tracks_trailing_array() {
        let size = OBJ_OPS[ObjTag::Vector as usize].size_words;
        let small = ObjBody::Vector(vec![Value::NIL; 2]);
        let large = ObjBody::Vector(vec![Value::NIL; 10]);
        assert_eq!(size(&small) + 8, size(&large));
    }

    #[test]
    fn each_child_visits_pair_fields() {
        let body = ObjBody::Pair {
            car: Value::object(3),
            cdr: Value::object(9),
        };
        let mut seen = Vec::new();
        body.each_child(&mut |v| seen.push(v));
        assert_eq!(seen, vec![Value::object(3), Value::object(9)]);
    }
}
