//! squill: the execution core of a Scheme-family runtime.
//!
//! The pieces, bottom up:
//!
//! - [`value`]: 64-bit tagged values — fixnums, immediates, and handles into
//!   the heap arena.
//! - [`heap`]: the shared object heap, its copying collector, and the
//!   per-tag ops table both the collector and the serializer dispatch
//!   through.
//! - [`code`]: code objects, the instruction set, and a small assembler.
//! - [`vm`]: the register machine — frames, application, first-class
//!   multi-shot continuations, `dynamic-wind`, and condition raising as a
//!   control transfer.
//! - [`library`]: the binary compiled-library format (write by discovery,
//!   read by construct-then-fix).
//! - [`runtime`]: several machines as parallel tasks over one mutex-guarded
//!   heap.
//! - [`messages`]: the keyed condition-text catalog.

pub mod code;
pub mod heap;
pub mod library;
pub mod messages;
pub mod runtime;
pub mod value;
pub mod vm;

pub use heap::Heap;
pub use runtime::Runtime;
pub use value::Value;
pub use vm::{Machine, MachineState};
