//! Canned code objects installed at heap startup.
//!
//! Control operations that must run user thunks (dynamic-wind, continuation
//! unwinding, exception handling) never recurse into the host: they splice
//! frames whose code is one of these stubs into the frame chain and let the
//! ordinary instruction loop drive everything. Each stub is allocated once,
//! pinned on the heap's shared list, and addressed by position.

use crate::code::{CodeBuilder, Opcode};
use crate::heap::Heap;

/// Shared-list positions of the startup stubs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Stubs {
    /// Sequencer for `dynamic-wind`: before, wind on, thunk, wind off, after,
    /// return the thunk's value.
    pub wind_seq: usize,
    /// Tail-applies the thunk in env slot 0 with no arguments. Unwind and
    /// rewind chains are built from frames running this.
    pub apply_thunk: usize,
    /// Single `resume` instruction; env slot 0 is the continuation, slot 1
    /// the value to deliver.
    pub resume: usize,
    /// Tail-applies the handler in env slot 0 to the condition in slot 1.
    pub handle: usize,
    /// A single `return`. Continuations captured above the bottom sentinel
    /// resume into this, so delivering a value halts the machine with it.
    pub returner: usize,
}

impl Stubs {
    /// Placeholder used only while the heap itself is being constructed.
    pub fn unlinked() -> Stubs {
        Stubs {
            wind_seq: usize::MAX,
            apply_thunk: usize::MAX,
            resume: usize::MAX,
            handle: usize::MAX,
            returner: usize::MAX,
        }
    }
}

/// Build and pin the stubs. Runs during heap construction, before any machine
/// is registered, so allocation goes through the push-only path.
pub(crate) fn install(heap: &mut Heap) -> Stubs {
    Stubs {
        wind_seq: pin(heap, wind_seq()),
        apply_thunk: pin(heap, apply_thunk()),
        resume: pin(heap, resume()),
        handle: pin(heap, handle()),
        returner: pin(heap, returner()),
    }
}

fn pin(heap: &mut Heap, b: CodeBuilder) -> usize {
    let code = b.install_pending(heap);
    heap.share(code)
}

/// Runs with env = [before, thunk, after, result-slot].
fn wind_seq() -> CodeBuilder {
    let mut b = CodeBuilder::new();
    // (before)
    let ret1 = b.forward(Opcode::Frame);
    b.refer(0, 0);
    b.emit(Opcode::Apply);
    b.patch(ret1, b.here());
    b.emit(Opcode::PushWind);
    // (thunk)
    let ret2 = b.forward(Opcode::Frame);
    b.refer(0, 1);
    b.emit(Opcode::Apply);
    b.patch(ret2, b.here());
    b.assign(0, 3);
    b.emit(Opcode::PopWind);
    // (after), then the saved thunk value
    let ret3 = b.forward(Opcode::Frame);
    b.refer(0, 2);
    b.emit(Opcode::Apply);
    b.patch(ret3, b.here());
    b.refer(0, 3);
    b.emit(Opcode::Return);
    b
}

/// Runs with env = [thunk]; the thunk's return unwinds to this frame's sfp.
fn apply_thunk() -> CodeBuilder {
    let mut b = CodeBuilder::new();
    b.refer(0, 0);
    b.emit(Opcode::Apply);
    b
}

/// Runs with env = [continuation, value].
fn resume() -> CodeBuilder {
    let mut b = CodeBuilder::new();
    b.emit(Opcode::Resume);
    b
}

fn returner() -> CodeBuilder {
    let mut b = CodeBuilder::new();
    b.emit(Opcode::Return);
    b
}

/// Runs with env = [handler, condition].
fn handle() -> CodeBuilder {
    let mut b = CodeBuilder::new();
    b.refer(0, 1);
    b.emit(Opcode::Argument);
    b.refer(0, 0);
    b.emit(Opcode::Apply);
    b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::object::ObjTag;

    #[test]
    fn stubs_are_pinned_code() {
        let heap = Heap::new();
        for pos in [
            heap.stubs.wind_seq,
            heap.stubs.apply_thunk,
            heap.stubs.resume,
            heap.stubs.handle,
            heap.stubs.returner,
        ] {
            let code = heap.shared_value(pos);
            assert!(heap.is_a(code, ObjTag::Code));
        }
    }

    #[test]
    fn wind_seq_saves_result_before_after_thunk() {
        let words = wind_seq().build();
        let mut ops = Vec::new();
        let mut pc = 0;
        while pc < words.len() {
            let op = Opcode::from_word(words[pc]).unwrap();
            ops.push(op);
            pc += 1 + op.operand_count();
        }
        // The assign into the result slot must precede the wind pop.
        let assign_at = ops.iter().position(|o| *o == Opcode::Assign).unwrap();
        let pop_at = ops.iter().position(|o| *o == Opcode::PopWind).unwrap();
        assert!(assign_at < pop_at);
        assert_eq!(ops.iter().filter(|o| **o == Opcode::Apply).count(), 3);
    }
}
