//! Code objects: immutable word arrays the machine executes.
//!
//! A code object's trailing array intermixes instruction words and inline
//! operand words; both are plain tagged values (opcodes are fixnums, operands
//! are whatever the instruction needs, including heap references). A program
//! counter is an index into the array. There is no instruction-length table:
//! boundaries are implicit in the producer's encoding, and control transfers
//! trust the producer to land on them.

use crate::heap::object::ObjBody;
use crate::heap::Heap;
use crate::value::Value;
use crate::vm::frame::Registers;

/// Instruction set of the register machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// `acc` = inline operand word.
    Const = 0,
    /// `acc` = environment slot at (depth, index).
    Refer = 1,
    /// Environment slot at (depth, index) = `acc`; `acc` = unspecified.
    Assign = 2,
    /// `acc` = closure over the current code/environment; operands are the
    /// entry pc and the exact arity.
    Close = 3,
    /// Jump to the operand pc when `acc` is `#f`.
    Test = 4,
    /// Unconditional jump to the operand pc.
    Jump = 5,
    /// Save the active frame (resuming at the operand pc) onto the heap and
    /// start a fresh argument rib for a pending call.
    Frame = 6,
    /// Push `acc` onto the argument rib.
    Argument = 7,
    /// Reset the argument rib without saving a frame (tail-call entry).
    Rib = 8,
    /// Apply the procedure in `acc` to the argument rib.
    Apply = 9,
    /// Return `acc` to the saved parent frame; past the bottom sentinel the
    /// machine halts.
    Return = 10,
    /// Stop the machine; `acc` is its result.
    Halt = 11,
    /// Thread a wind marker (before = env slot 0, after = env slot 2) onto
    /// the active frame. Emitted only by the dynamic-wind stub.
    PushWind = 12,
    /// Unthread the innermost wind marker.
    PopWind = 13,
    /// Replace the active frame with the continuation in env slot 0 and put
    /// env slot 1 in `acc`. Emitted only by the unwind stubs.
    Resume = 14,
}

impl Opcode {
    pub fn from_word(word: Value) -> Option<Opcode> {
        if !word.is_fixnum() {
            return None;
        }
        match word.as_fixnum() {
            0 => Some(Opcode::Const),
            1 => Some(Opcode::Refer),
            2 => Some(Opcode::Assign),
            3 => Some(Opcode::Close),
            4 => Some(Opcode::Test),
            5 => Some(Opcode::Jump),
            6 => Some(Opcode::Frame),
            7 => Some(Opcode::Argument),
            8 => Some(Opcode::Rib),
            9 => Some(Opcode::Apply),
            10 => Some(Opcode::Return),
            11 => Some(Opcode::Halt),
            12 => Some(Opcode::PushWind),
            13 => Some(Opcode::PopWind),
            14 => Some(Opcode::Resume),
            _ => None,
        }
    }

    /// Inline operand words following the instruction word.
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Const | Opcode::Test | Opcode::Jump | Opcode::Frame => 1,
            Opcode::Refer | Opcode::Assign | Opcode::Close => 2,
            _ => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Const => "const",
            Opcode::Refer => "refer",
            Opcode::Assign => "assign",
            Opcode::Close => "close",
            Opcode::Test => "test",
            Opcode::Jump => "jump",
            Opcode::Frame => "frame",
            Opcode::Argument => "argument",
            Opcode::Rib => "rib",
            Opcode::Apply => "apply",
            Opcode::Return => "return",
            Opcode::Halt => "halt",
            Opcode::PushWind => "push-wind",
            Opcode::PopWind => "pop-wind",
            Opcode::Resume => "resume",
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles code objects. The compiler front-end that would normally drive
/// this lives outside the crate; in here it serves the canned stubs and the
/// test suites.
#[derive(Default)]
pub struct CodeBuilder {
    words: Vec<Value>,
}

impl CodeBuilder {
    pub fn new() -> CodeBuilder {
        CodeBuilder::default()
    }

    /// Next instruction boundary.
    pub fn here(&self) -> usize {
        self.words.len()
    }

    pub fn emit(&mut self, op: Opcode) -> usize {
        debug_assert_eq!(op.operand_count(), 0);
        let at = self.words.len();
        self.words.push(Value::fixnum(op as i64));
        at
    }

    pub fn emit1(&mut self, op: Opcode, operand: Value) -> usize {
        debug_assert_eq!(op.operand_count(), 1);
        let at = self.words.len();
        self.words.push(Value::fixnum(op as i64));
        self.words.push(operand);
        at
    }

    pub fn emit2(&mut self, op: Opcode, a: Value, b: Value) -> usize {
        debug_assert_eq!(op.operand_count(), 2);
        let at = self.words.len();
        self.words.push(Value::fixnum(op as i64));
        self.words.push(a);
        self.words.push(b);
        at
    }

    pub fn constant(&mut self, v: Value) -> usize {
        self.emit1(Opcode::Const, v)
    }

    pub fn refer(&mut self, depth: usize, index: usize) -> usize {
        self.emit2(
            Opcode::Refer,
            Value::fixnum(depth as i64),
            Value::fixnum(index as i64),
        )
    }

    pub fn assign(&mut self, depth: usize, index: usize) -> usize {
        self.emit2(
            Opcode::Assign,
            Value::fixnum(depth as i64),
            Value::fixnum(index as i64),
        )
    }

    pub fn close(&mut self, entry: usize, arity: usize) -> usize {
        self.emit2(
            Opcode::Close,
            Value::fixnum(entry as i64),
            Value::fixnum(arity as i64),
        )
    }

    /// Emit a jump-class instruction with a placeholder target; returns the
    /// operand position for [`CodeBuilder::patch`].
    pub fn forward(&mut self, op: Opcode) -> usize {
        self.emit1(op, Value::fixnum(0));
        self.words.len() - 1
    }

    /// Patch a previously emitted placeholder with an instruction boundary.
    pub fn patch(&mut self, operand_at: usize, target: usize) {
        debug_assert!(self.words[operand_at] == Value::fixnum(0));
        self.words[operand_at] = Value::fixnum(target as i64);
    }

    pub fn build(self) -> Vec<Value> {
        self.words
    }

    /// Allocate the finished code object.
    pub fn install(self, heap: &mut Heap, regs: &mut Registers) -> Value {
        heap.alloc(ObjBody::Code(self.words), regs)
    }

    /// Allocate through the push-only path (startup stubs).
    pub fn install_pending(self, heap: &mut Heap) -> Value {
        heap.alloc_pending(ObjBody::Code(self.words))
    }
}

// ---------------------------------------------------------------------------
// Disassembly
// ---------------------------------------------------------------------------

/// Render a code object one instruction per line. Operator-facing (`dump`)
/// and handy in failing tests.
pub fn disassemble(heap: &Heap, code: Value) -> String {
    use std::fmt::Write as _;
    let Some(len) = heap.code_len(code) else {
        return "#<not a code object>".to_string();
    };
    let mut out = String::new();
    let mut pc = 0;
    while pc < len {
        let Some(word) = heap.code_word(code, pc) else {
            break;
        };
        let Some(op) = Opcode::from_word(word) else {
            let _ = writeln!(out, "{pc:4}  ?? {word:?}");
            pc += 1;
            continue;
        };
        let _ = write!(out, "{pc:4}  {}", op.name());
        for i in 0..op.operand_count() {
            match heap.code_word(code, pc + 1 + i) {
                Some(w) if w.is_object() => {
                    let _ = write!(out, " {}", heap.render(w));
                }
                Some(w) => {
                    let _ = write!(out, " {w:?}");
                }
                None => {
                    let _ = write!(out, " <truncated>");
                }
            }
        }
        out.push('\n');
        pc += 1 + op.operand_count();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_word_round_trip() {
        for i in 0..15i64 {
            let op = Opcode::from_word(Value::fixnum(i)).expect("opcode");
            assert_eq!(op as i64, i);
        }
        assert_eq!(Opcode::from_word(Value::fixnum(15)), None);
        assert_eq!(Opcode::from_word(Value::NIL), None);
    }

    #[test]
    fn emit_intermixes_operands() {
        let mut b = CodeBuilder::new();
        b.constant(Value::fixnum(42));
        b.emit(Opcode::Halt);
        let words = b.build();
        assert_eq!(words.len(), 3);
        assert_eq!(Opcode::from_word(words[0]), Some(Opcode::Const));
        assert_eq!(words[1], Value::fixnum(42));
        assert_eq!(Opcode::from_word(words[2]), Some(Opcode::Halt));
    }

    #[test]
    fn forward_patch_lands_on_boundary() {
        let mut b = CodeBuilder::new();
        let hole = b.forward(Opcode::Jump);
        b.constant(Value::fixnum(1));
        let target = b.here();
        b.emit(Opcode::Halt);
        b.patch(hole, target);
        let words = b.build();
        assert_eq!(words[hole], Value::fixnum(target as i64));
    }

    #[test]
    fn disassemble_lists_instructions() {
        let mut heap = Heap::new();
        let mut regs = Registers::new();
        let mut b = CodeBuilder::new();
        b.constant(Value::fixnum(3));
        b.emit(Opcode::Halt);
        let code = b.install(&mut heap, &mut regs);
        let text = disassemble(&heap, code);
        assert!(text.contains("const"));
        assert!(text.contains("halt"));
    }
}
