//! Library reader: construct in stored order, then fix references up.
//!
//! Payloads come off the wire with `Index`-tagged placeholder values standing
//! in for references (forward references included). Construction uses the
//! heap's push-only allocation path and the reader holds the heap mutably
//! end to end, so no collection can observe a placeholder: by the time the
//! heap is released every `Index` value has been rewritten through the
//! object table. Symbols are interned as they are read, so a symbol loaded
//! twice — or loaded and then mentioned by running code — is one object.

use std::io::Read;

use crate::heap::object::{ObjBody, ObjTag, NATIVE_UNLINKED, OBJ_OPS};
use crate::heap::Heap;
use crate::value::Value;
use crate::vm::natives::NativeRegistry;

use super::{Import, LibError, Library, FORMAT_VERSION, MAGIC};

/// Read a whole library file. The returned export values live in the heap
/// but are not rooted; park them somewhere a collection can see before
/// allocating again.
pub fn read_library(
    heap: &mut Heap,
    registry: &NativeRegistry,
    r: &mut dyn Read,
) -> Result<Library, LibError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(LibError::BadMagic);
    }
    let version = get_u16(r)?;
    if version != FORMAT_VERSION {
        return Err(LibError::UnsupportedVersion(version));
    }

    let name = get_strings(r)?;
    let lib_version = get_u32s(r)?;
    let export_count = get_u32(r)? as usize;
    let mut export_words = Vec::with_capacity(export_count.min(1 << 16));
    for _ in 0..export_count {
        let name = get_str(r)?;
        let word = get_u64(r)?;
        export_words.push((name, word));
    }
    let import_count = get_u32(r)? as usize;
    let mut imports = Vec::with_capacity(import_count.min(1 << 16));
    for _ in 0..import_count {
        imports.push(Import {
            name: get_strings(r)?,
            version: get_u32s(r)?,
            bindings: get_strings(r)?,
        });
    }

    // Object stream: construct every entry, remembering which table slots
    // need the fix-up pass (interned symbols resolve to settled objects).
    let mut table: Vec<Value> = Vec::new();
    loop {
        let tag = match get_u16_opt(r)? {
            Some(t) => t,
            None => break,
        };
        let tag = ObjTag::from_u16(tag).ok_or(LibError::BadTag(tag))?;
        let body = (OBJ_OPS[tag as usize].read)(r)?;
        let v = match body {
            ObjBody::Symbol(name) => heap.intern_pending(&name),
            body => heap.alloc_pending(body),
        };
        table.push(v);
    }

    // Fix-up: rewrite placeholder references through the table. An interned
    // symbol that pre-existed the read has no placeholders to rewrite, but
    // running its row is harmless.
    for v in &table {
        let tag = heap.tag(*v);
        let fixup = OBJ_OPS[tag as usize].fixup;
        fix_object(heap, *v, fixup, &table)?;
    }

    // Built-ins came in unlinked; resolve their native step by name.
    for v in &table {
        if heap.is_a(*v, ObjTag::Cps) {
            link_native(heap, registry, *v)?;
        }
    }

    let mut exports = Vec::with_capacity(export_words.len());
    for (name, word) in export_words {
        exports.push((name, decode_root(word, &table)?));
    }
    Ok(Library {
        name,
        version: lib_version,
        exports,
        imports,
        objects: table.len(),
    })
}

fn fix_object(
    heap: &mut Heap,
    v: Value,
    fixup: fn(&mut ObjBody, &[Value]) -> Result<(), LibError>,
    table: &[Value],
) -> Result<(), LibError> {
    fixup(heap.body_mut(v), table)
}

fn link_native(heap: &mut Heap, registry: &NativeRegistry, v: Value) -> Result<(), LibError> {
    let name = match heap.body(v) {
        ObjBody::Cps { native, name } => {
            if *native != NATIVE_UNLINKED {
                return Ok(());
            }
            heap.symbol_name(*name)
                .ok_or(LibError::Malformed("builtin name is not a symbol"))?
                .to_string()
        }
        _ => return Ok(()),
    };
    let id = registry
        .id_of(&name)
        .ok_or(LibError::UnknownNative(name))?;
    match heap.body_mut(v) {
        ObjBody::Cps { native, .. } => *native = id,
        _ => {}
    }
    Ok(())
}

/// Header export words reference the stream directly.
fn decode_root(word: u64, table: &[Value]) -> Result<Value, LibError> {
    let v = Value::from_raw(word);
    if v.is_index() {
        let i = v.as_stream_index();
        table.get(i).copied().ok_or(LibError::BadIndex(i))
    } else if v.is_object() {
        Err(LibError::Malformed("raw object reference in a file"))
    } else {
        Ok(v)
    }
}

/// Rewrite every `Index`-tagged field of a freshly read body through the
/// object table. One row serves every tag: the match is total over the
/// object kinds, including kinds the reader itself never produces.
pub fn fixup_generic(body: &mut ObjBody, table: &[Value]) -> Result<(), LibError> {
    fn fix(v: &mut Value, table: &[Value]) -> Result<(), LibError> {
        if v.is_index() {
            let i = v.as_stream_index();
            *v = *table.get(i).ok_or(LibError::BadIndex(i))?;
        }
        Ok(())
    }
    match body {
        ObjBody::Pair { car, cdr } => {
            fix(car, table)?;
            fix(cdr, table)
        }
        ObjBody::Vector(slots) | ObjBody::Code(slots) => {
            for s in slots {
                fix(s, table)?;
            }
            Ok(())
        }
        ObjBody::Str(_) | ObjBody::Symbol(_) => Ok(()),
        ObjBody::Lambda { code, env, .. } => {
            fix(code, table)?;
            fix(env, table)
        }
        ObjBody::Cps { name, .. } => fix(name, table),
        ObjBody::ArgFrame { slots, parent } => {
            for s in slots {
                fix(s, table)?;
            }
            fix(parent, table)
        }
        ObjBody::Frame(f) | ObjBody::Continuation(f) => {
            fix(&mut f.code, table)?;
            fix(&mut f.env, table)?;
            fix(&mut f.rib, table)?;
            fix(&mut f.sfp, table)?;
            fix(&mut f.wind, table)?;
            fix(&mut f.handler, table)
        }
        ObjBody::Wind {
            before,
            after,
            prev,
        } => {
            fix(before, table)?;
            fix(after, table)?;
            fix(prev, table)
        }
        ObjBody::Condition {
            kind,
            message,
            irritants,
        } => {
            fix(kind, table)?;
            fix(message, table)?;
            for s in irritants {
                fix(s, table)?;
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Wire primitives
// ---------------------------------------------------------------------------

/// A u16 or a clean end of stream. EOF at a tag boundary terminates the
/// object stream; EOF inside the record is truncation.
fn get_u16_opt(r: &mut dyn Read) -> Result<Option<u16>, LibError> {
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < 2 {
        let n = r.read(&mut buf[filled..]).map_err(LibError::from)?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(LibError::Truncated)
            };
        }
        filled += n;
    }
    Ok(Some(u16::from_le_bytes(buf)))
}

fn get_u16(r: &mut dyn Read) -> Result<u16, LibError> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn get_u32(r: &mut dyn Read) -> Result<u32, LibError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn get_u64(r: &mut dyn Read) -> Result<u64, LibError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn get_str(r: &mut dyn Read) -> Result<String, LibError> {
    let len = get_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| LibError::Malformed("string is not UTF-8"))
}

fn get_strings(r: &mut dyn Read) -> Result<Vec<String>, LibError> {
    let n = get_u32(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        out.push(get_str(r)?);
    }
    Ok(out)
}

fn get_u32s(r: &mut dyn Read) -> Result<Vec<u32>, LibError> {
    let n = get_u32(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        out.push(get_u32(r)?);
    }
    Ok(out)
}

/// A value word off the wire: immediates verbatim, references `Index`-tagged
/// until fix-up. Raw object bits in a file are malformed by construction.
fn get_word(r: &mut dyn Read) -> Result<Value, LibError> {
    let v = Value::from_raw(get_u64(r)?);
    if v.is_object() {
        Err(LibError::Malformed("raw object reference in a file"))
    } else {
        Ok(v)
    }
}

fn get_words(r: &mut dyn Read) -> Result<Vec<Value>, LibError> {
    let n = get_u32(r)? as usize;
    let mut out = Vec::with_capacity(n.min(1 << 16));
    for _ in 0..n {
        out.push(get_word(r)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Per-tag payloads (rows in the object ops table)
// ---------------------------------------------------------------------------

pub fn read_pair(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Pair {
        car: get_word(r)?,
        cdr: get_word(r)?,
    })
}

pub fn read_vector(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Vector(get_words(r)?))
}

pub fn read_str(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Str(get_str(r)?))
}

pub fn read_symbol(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Symbol(get_str(r)?))
}

pub fn read_code(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Code(get_words(r)?))
}

pub fn read_lambda(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    let code = get_word(r)?;
    let entry = get_u32(r)? as usize;
    let arity = get_u32(r)? as usize;
    let env = get_word(r)?;
    Ok(ObjBody::Lambda {
        code,
        entry,
        arity,
        env,
    })
}

pub fn read_cps(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Ok(ObjBody::Cps {
        native: NATIVE_UNLINKED,
        name: get_word(r)?,
    })
}

pub fn read_argframe(r: &mut dyn Read) -> Result<ObjBody, LibError> {
    let slots = get_words(r)?;
    let parent = get_word(r)?;
    Ok(ObjBody::ArgFrame { slots, parent })
}

/// Tags that the writer refuses to emit; one in a file means the file did
/// not come from a conforming writer.
pub fn read_unreadable(_r: &mut dyn Read) -> Result<ObjBody, LibError> {
    Err(LibError::Malformed("unserializable object kind in a file"))
}
