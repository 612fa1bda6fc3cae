//! The intermediate representation.
//!
//! The IR is a linear sequence of predicated instructions over interned
//! operands, shared by the assembler back-end and the bytecode back-end.

mod insn;
mod opcode;
mod operand;

pub use self::insn::{Insts, Ir, IrArena, IrHandle, IrList};
pub use self::opcode::{AddrHints, Cond, EffectKind, InstrFlags, Opcode, OperandEffect};
pub use self::operand::{Operand, OperandData, OperandPool, Reloc, RelocKind};
