//! Compiled-library files.
//!
//! A library file carries a header (name, version, exports, imports) followed
//! by a flat object stream: every heap object reachable from the exported
//! bindings, exactly once, in first-discovered order. References inside
//! payloads are stream indices, not addresses, so a file is position
//! independent and the reader can rebuild the graph with a construct-then-fix
//! pass. The enumeration of type tags and each payload layout are part of the
//! interchange contract and must stay bit-identical across producers and
//! consumers.
//!
//! Layout, in order:
//!   1. magic `SQLB`, format version (u16)
//!   2. name components, version numbers, export table (name → encoded value
//!      word), import list (name, version, bound names)
//!   3. object entries `(type_tag: u16, payload)` until end of file
//!
//! A reference is encoded as `index << 2 | INDEX_TAG`; immediates and fixnums
//! are written as their raw bits.

pub mod read;
pub mod write;

use serde::Serialize;

use crate::heap::object::ObjTag;
use crate::heap::Heap;
use crate::value::Value;

use std::fmt;
use std::io;

pub const MAGIC: [u8; 4] = *b"SQLB";
pub const FORMAT_VERSION: u16 = 1;

/// An in-heap library: metadata plus the exported binding values. The values
/// are only as alive as whatever roots them; callers of `read` must park the
/// exports in a rooted place before allocating again.
#[derive(Debug)]
pub struct Library {
    pub name: Vec<String>,
    pub version: Vec<u32>,
    pub exports: Vec<(String, Value)>,
    pub imports: Vec<Import>,
    /// Entries in the object stream. Populated by the reader; ignored by the
    /// writer, which re-derives the count from discovery.
    pub objects: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: Vec<String>,
    pub version: Vec<u32>,
    pub bindings: Vec<String>,
}

impl Library {
    pub fn new(
        name: Vec<String>,
        version: Vec<u32>,
        exports: Vec<(String, Value)>,
        imports: Vec<Import>,
    ) -> Library {
        Library {
            name,
            version,
            exports,
            imports,
            objects: 0,
        }
    }

    pub fn name_string(&self) -> String {
        self.name.join(" ")
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a library write or read aborted. Partial output from a failed write
/// is corrupt; treat the whole file as invalid.
#[derive(Debug)]
pub enum LibError {
    Io(io::Error),
    /// The stream ended inside a record.
    Truncated,
    BadMagic,
    UnsupportedVersion(u16),
    /// A type tag outside the closed enumeration.
    BadTag(u16),
    /// A payload field that cannot be what the layout says it is.
    Malformed(&'static str),
    /// A reference index past the end of the object table.
    BadIndex(usize),
    /// The object kind has no stable serialized form.
    Unserializable(ObjTag),
    /// A serialized built-in whose name is not in the native registry.
    UnknownNative(String),
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibError::Io(e) => write!(f, "i/o error: {e}"),
            LibError::Truncated => write!(f, "library file is truncated"),
            LibError::BadMagic => write!(f, "not a library file (bad magic)"),
            LibError::UnsupportedVersion(v) => {
                write!(f, "unsupported library format version {v}")
            }
            LibError::BadTag(t) => write!(f, "unknown object type tag {t}"),
            LibError::Malformed(what) => write!(f, "malformed library payload: {what}"),
            LibError::BadIndex(i) => write!(f, "object reference {i} is out of range"),
            LibError::Unserializable(tag) => {
                write!(f, "object kind {tag:?} cannot be serialized")
            }
            LibError::UnknownNative(name) => {
                write!(f, "library refers to unknown built-in {name:?}")
            }
        }
    }
}

impl std::error::Error for LibError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LibError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LibError {
    fn from(e: io::Error) -> LibError {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            LibError::Truncated
        } else {
            LibError::Io(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Operator-facing summary
// ---------------------------------------------------------------------------

/// What `dump` shows: metadata plus rendered export values.
#[derive(Debug, Serialize)]
pub struct LibrarySummary {
    pub name: Vec<String>,
    pub version: Vec<u32>,
    pub exports: Vec<ExportSummary>,
    pub imports: Vec<ImportSummary>,
    pub object_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ExportSummary {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct ImportSummary {
    pub name: Vec<String>,
    pub version: Vec<u32>,
    pub bindings: Vec<String>,
}

impl LibrarySummary {
    pub fn of(heap: &Heap, lib: &Library) -> LibrarySummary {
        LibrarySummary {
            name: lib.name.clone(),
            version: lib.version.clone(),
            exports: lib
                .exports
                .iter()
                .map(|(name, v)| ExportSummary {
                    name: name.clone(),
                    value: heap.render(*v),
                })
                .collect(),
            imports: lib
                .imports
                .iter()
                .map(|i| ImportSummary {
                    name: i.name.clone(),
                    version: i.version.clone(),
                    bindings: i.bindings.clone(),
                })
                .collect(),
            object_count: lib.objects,
        }
    }
}
