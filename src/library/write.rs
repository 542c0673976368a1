//! Library writer: discovery, index assignment, and payload encoding.
//!
//! Writing never allocates, so it runs over `&Heap` and cannot race a
//! collection. Discovery is a worklist seeded by the export values; every
//! reachable object gets a stable 0-based index in first-discovered order,
//! and that order is also the order entries appear in the stream.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Write;

use crate::heap::object::{ObjBody, OBJ_OPS};
use crate::heap::Heap;
use crate::value::Value;

use super::{LibError, Library, FORMAT_VERSION, MAGIC};

/// Object handle → stream index, fixed during discovery.
pub struct IndexTable {
    by_handle: HashMap<usize, usize>,
    order: Vec<Value>,
}

impl IndexTable {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Encode one value word for the wire: references become stream indices,
    /// everything else is its raw bits.
    pub fn encode(&self, v: Value) -> Result<u64, LibError> {
        if v.is_index() {
            // A stream index in the live heap means a reader leaked one past
            // fix-up; refuse to launder it.
            return Err(LibError::Malformed("stray index value in the heap"));
        }
        if !v.is_object() {
            return Ok(v.raw());
        }
        match self.by_handle.get(&v.object_index()) {
            Some(i) => Ok(Value::stream_index(*i).raw()),
            None => Err(LibError::Malformed("reference outside the written graph")),
        }
    }
}

/// Enumerate every object reachable from `roots`, exactly once, first
/// discovered first.
pub fn discover(heap: &Heap, roots: &[Value]) -> IndexTable {
    let mut table = IndexTable {
        by_handle: HashMap::new(),
        order: Vec::new(),
    };
    let mut queue: VecDeque<Value> = VecDeque::new();
    let mut visit = |table: &mut IndexTable, queue: &mut VecDeque<Value>, v: Value| {
        if v.is_object() && !table.by_handle.contains_key(&v.object_index()) {
            table.by_handle.insert(v.object_index(), table.order.len());
            table.order.push(v);
            queue.push_back(v);
        }
    };
    for root in roots {
        visit(&mut table, &mut queue, *root);
    }
    while let Some(v) = queue.pop_front() {
        heap.body(v).each_child(&mut |c| visit(&mut table, &mut queue, c));
    }
    table
}

/// Write a whole library file. On error the output is corrupt and the caller
/// should discard it.
pub fn write_library(heap: &Heap, lib: &Library, w: &mut dyn Write) -> Result<(), LibError> {
    let roots: Vec<Value> = lib.exports.iter().map(|(_, v)| *v).collect();
    let table = discover(heap, &roots);

    w.write_all(&MAGIC)?;
    put_u16(w, FORMAT_VERSION)?;
    put_u32(w, seq_len(lib.name.len())?)?;
    for part in &lib.name {
        put_str(w, part)?;
    }
    put_u32(w, seq_len(lib.version.len())?)?;
    for n in &lib.version {
        put_u32(w, *n)?;
    }
    put_u32(w, seq_len(lib.exports.len())?)?;
    for (name, v) in &lib.exports {
        put_str(w, name)?;
        put_u64(w, table.encode(*v)?)?;
    }
    put_u32(w, seq_len(lib.imports.len())?)?;
    for import in &lib.imports {
        put_u32(w, seq_len(import.name.len())?)?;
        for part in &import.name {
            put_str(w, part)?;
        }
        put_u32(w, seq_len(import.version.len())?)?;
        for n in &import.version {
            put_u32(w, *n)?;
        }
        put_u32(w, seq_len(import.bindings.len())?)?;
        for name in &import.bindings {
            put_str(w, name)?;
        }
    }

    for v in &table.order {
        let body = heap.body(*v);
        let tag = body.tag();
        put_u16(w, tag as u16)?;
        (OBJ_OPS[tag as usize].write)(body, w, &table)?;
    }
    Ok(())
}

fn seq_len(n: usize) -> Result<u32, LibError> {
    u32::try_from(n).map_err(|_| LibError::Malformed("sequence too long for the format"))
}

// ---------------------------------------------------------------------------
// Wire primitives (little endian throughout)
// ---------------------------------------------------------------------------

pub(super) fn put_u16(w: &mut dyn Write, n: u16) -> Result<(), LibError> {
    w.write_all(&n.to_le_bytes())?;
    Ok(())
}

pub(super) fn put_u32(w: &mut dyn Write, n: u32) -> Result<(), LibError> {
    w.write_all(&n.to_le_bytes())?;
    Ok(())
}

pub(super) fn put_u64(w: &mut dyn Write, n: u64) -> Result<(), LibError> {
    w.write_all(&n.to_le_bytes())?;
    Ok(())
}

pub(super) fn put_str(w: &mut dyn Write, s: &str) -> Result<(), LibError> {
    put_u32(w, seq_len(s.len())?)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn put_words(w: &mut dyn Write, words: &[Value], table: &IndexTable) -> Result<(), LibError> {
    put_u32(w, seq_len(words.len())?)?;
    for v in words {
        put_u64(w, table.encode(*v)?)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-tag payloads (rows in the object ops table)
// ---------------------------------------------------------------------------

pub fn write_pair(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Pair { car, cdr } => {
            put_u64(w, t.encode(*car)?)?;
            put_u64(w, t.encode(*cdr)?)
        }
        _ => Err(LibError::Malformed("pair writer on a non-pair")),
    }
}

pub fn write_vector(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Vector(slots) => put_words(w, slots, t),
        _ => Err(LibError::Malformed("vector writer on a non-vector")),
    }
}

pub fn write_str(body: &ObjBody, w: &mut dyn Write, _t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Str(s) => put_str(w, s),
        _ => Err(LibError::Malformed("string writer on a non-string")),
    }
}

pub fn write_symbol(body: &ObjBody, w: &mut dyn Write, _t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Symbol(s) => put_str(w, s),
        _ => Err(LibError::Malformed("symbol writer on a non-symbol")),
    }
}

pub fn write_code(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Code(words) => put_words(w, words, t),
        _ => Err(LibError::Malformed("code writer on a non-code object")),
    }
}

pub fn write_lambda(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Lambda {
            code,
            entry,
            arity,
            env,
        } => {
            put_u64(w, t.encode(*code)?)?;
            put_u32(w, seq_len(*entry)?)?;
            put_u32(w, seq_len(*arity)?)?;
            put_u64(w, t.encode(*env)?)
        }
        _ => Err(LibError::Malformed("lambda writer on a non-lambda")),
    }
}

/// A built-in serializes as its symbol only; the native step is re-linked by
/// name against the consumer's registry.
pub fn write_cps(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::Cps { name, .. } => put_u64(w, t.encode(*name)?),
        _ => Err(LibError::Malformed("builtin writer on a non-builtin")),
    }
}

pub fn write_argframe(body: &ObjBody, w: &mut dyn Write, t: &IndexTable) -> Result<(), LibError> {
    match body {
        ObjBody::ArgFrame { slots, parent } => {
            put_words(w, slots, t)?;
            put_u64(w, t.encode(*parent)?)
        }
        _ => Err(LibError::Malformed("environment writer on a non-environment")),
    }
}

/// Frames, continuations, wind markers, and conditions have no stable
/// serialized form; reaching one aborts the write.
pub fn write_unserializable(
    body: &ObjBody,
    _w: &mut dyn Write,
    _t: &IndexTable,
) -> Result<(), LibError> {
    Err(LibError::Unserializable(body.tag()))
}
