//! IR opcodes, condition predicates, flag bits and operand effects.

use bitflags::bitflags;
use std::fmt;

/// An IR opcode.
///
/// The enum mixes machine opcodes shared by both ISA generations with the
/// pseudo-opcodes used for data, sections and back-end bookkeeping. Adding a
/// variant forces a review of every emitter branch; there is deliberately no
/// wildcard arm in the serializers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Bookkeeping pseudo-ops.
    /// A source comment carried through to the listing.
    Comment,
    /// An instruction logically removed by a pass; emits nothing.
    Dummy,
    /// Marks a register dead past this point (optimizer contract only).
    Dead,
    /// A raw operand emitted verbatim.
    Literal,
    /// A label definition.
    Label,
    /// A CON-section constant definition.
    Const,

    // Data pseudo-ops.
    /// One or more bytes.
    Byte,
    /// One or more 16-bit words.
    Word,
    /// A word with the literal `1 |` prefix used in dispatch tables.
    Word1,
    /// One or more longs.
    Long,
    /// An inline string.
    String,
    /// Reserve cog longs (`res`).
    Reserve,
    /// Reserve hub longs (`long 0[n]`).
    ReserveH,
    /// A binary blob with relocations, introduced by a label.
    LabeledBlob,
    /// A `fit` guard for the cog image.
    Fit,
    /// An `org` directive.
    Org,
    /// Switch to hub placement (`orgh`); starts LMM mode on P1.
    HubMode,

    // Control flow.
    /// Unconditional or predicated jump.
    Jump,
    /// Call.
    Call,
    /// Decrement and jump if nonzero.
    Djnz,
    /// Return.
    Ret,
    /// Start of a hardware `rep` block.
    Repeat,
    /// End-of-repeat marker; emits nothing.
    RepeatEnd,
    /// Load a block of hub code into the fcache window.
    Fcache,

    // Machine ALU and move opcodes.
    /// Copy src to dst.
    Mov,
    /// Absolute value.
    Abs,
    /// Negate.
    Neg,
    /// Add.
    Add,
    /// Subtract.
    Sub,
    /// Unsigned compare (sets flags only).
    Cmp,
    /// Signed compare (sets flags only).
    Cmps,
    /// Bitwise and.
    And,
    /// Bitwise and-not.
    Andn,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
    /// Rotate left.
    Rol,
    /// Rotate right.
    Ror,
    /// Signed multiply.
    Muls,
    /// Unsigned multiply.
    Mulu,
    /// And-test (sets flags only).
    Test,
    /// Write carry into dst bits.
    Muxc,
    /// Write not-zero into dst bits.
    Muxnz,
    /// Read a byte from hub memory.
    Rdbyte,
    /// Read a word from hub memory.
    Rdword,
    /// Read a long from hub memory.
    Rdlong,
    /// Write a byte to hub memory.
    Wrbyte,
    /// Write a word to hub memory.
    Wrword,
    /// Write a long to hub memory.
    Wrlong,
}

impl Opcode {
    /// True for opcodes that define data or directives rather than
    /// executable instructions.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            Opcode::Byte
                | Opcode::Word
                | Opcode::Word1
                | Opcode::Long
                | Opcode::String
                | Opcode::Reserve
                | Opcode::ReserveH
                | Opcode::LabeledBlob
        )
    }

    /// True for branching opcodes whose destination is a code label.
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::Call | Opcode::Djnz)
    }
}

/// Condition predicate carried by every instruction.
///
/// The first seven mirror comparison results; `C`/`Nc` test the carry flag
/// directly. `Lt`/`Ge` and `C`/`Nc` share hardware encodings but are kept
/// distinct in the IR so the optimizer can reason about what was compared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Cond {
    /// Execute unconditionally.
    #[default]
    True,
    /// Z set.
    Eq,
    /// Z clear.
    Ne,
    /// Below (C set after an unsigned compare).
    Lt,
    /// Above or equal (C clear).
    Ge,
    /// Above (C clear and Z clear).
    Gt,
    /// Below or equal (C set or Z set).
    Le,
    /// Carry set.
    C,
    /// Carry clear.
    Nc,
}

impl Cond {
    /// The logical negation of this predicate. `True` has no negation and
    /// is returned unchanged; callers must not rely on inverting it.
    pub fn invert(self) -> Cond {
        match self {
            Cond::True => Cond::True,
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Lt => Cond::Ge,
            Cond::Ge => Cond::Lt,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::C => Cond::Nc,
            Cond::Nc => Cond::C,
        }
    }

    /// Decode a hardware condition field into a predicate. `0b1111` is the
    /// unconditional encoding; `0b0000` ("never", `_ret_` on P2) and the
    /// compound encodings with no IR equivalent return `None`.
    pub fn from_encoding(bits: u8) -> Option<Cond> {
        match bits & 0xf {
            0b1111 => Some(Cond::True),
            0b1010 => Some(Cond::Eq),
            0b0101 => Some(Cond::Ne),
            0b1100 => Some(Cond::C),
            0b0011 => Some(Cond::Nc),
            0b0001 => Some(Cond::Gt),
            0b1110 => Some(Cond::Le),
            _ => None,
        }
    }

    /// The textual mnemonic, or `""` for the unconditional predicate.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Cond::True => "",
            Cond::Eq => "if_e",
            Cond::Ne => "if_ne",
            Cond::Lt => "if_b",
            Cond::Ge => "if_ae",
            Cond::Gt => "if_a",
            Cond::Le => "if_be",
            Cond::C => "if_c",
            Cond::Nc => "if_nc",
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

bitflags! {
    /// Per-instruction flag effects and bookkeeping bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InstrFlags: u16 {
        /// Write the carry flag.
        const WC = 1 << 0;
        /// Write the zero flag.
        const WZ = 1 << 1;
        /// Write both flags with the P2 `wcz` spelling.
        const WCZ = 1 << 2;
        /// Suppress result writeback.
        const NR = 1 << 3;
        /// Force result writeback.
        const WR = 1 << 4;
        /// Never delete this instruction, even if it looks dead.
        const KEEP_INSTR = 1 << 5;
        /// This label is not a jump target (data or fcache bookkeeping).
        const LABEL_NOJUMP = 1 << 6;
    }
}

/// Pointer-update side effect on a single operand. Only hardware registers
/// on the P2 may carry one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EffectKind {
    /// No update.
    #[default]
    None,
    /// `++reg`.
    PreInc,
    /// `--reg`.
    PreDec,
    /// `reg++`.
    PostInc,
    /// `reg--`.
    PostDec,
}

bitflags! {
    /// Addressing hints attached to an operand reference.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AddrHints: u8 {
        /// Treat the operand as a hub address.
        const FORCE_HUB = 1 << 0;
        /// Force absolute addressing.
        const FORCE_ABS = 1 << 1;
        /// Suppress the immediate `#` marker.
        const NO_IMM = 1 << 2;
    }
}

/// The complete side-effect annotation for one operand slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperandEffect {
    /// Pointer update, if any.
    pub kind: EffectKind,
    /// Addressing hints.
    pub hints: AddrHints,
    /// Constant displacement for `ptra[k]`-style references.
    pub offset: i32,
}

impl OperandEffect {
    /// True when the annotation does nothing at all.
    pub fn is_none(&self) -> bool {
        self.kind == EffectKind::None && self.hints.is_empty() && self.offset == 0
    }

    /// True when the annotation requires P2 hardware-register support
    /// (a pointer update or a displacement).
    pub fn needs_hw_reg(&self) -> bool {
        self.kind != EffectKind::None || self.offset != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_round_trips() {
        for c in [
            Cond::Eq,
            Cond::Ne,
            Cond::Lt,
            Cond::Ge,
            Cond::Gt,
            Cond::Le,
            Cond::C,
            Cond::Nc,
        ] {
            assert_eq!(c.invert().invert(), c);
            assert_ne!(c.invert(), c);
        }
    }

    #[test]
    fn encoding_decode() {
        assert_eq!(Cond::from_encoding(0b1111), Some(Cond::True));
        assert_eq!(Cond::from_encoding(0b1010), Some(Cond::Eq));
        assert_eq!(Cond::from_encoding(0b0000), None);
        // compound "if_c_and_z" has no IR predicate
        assert_eq!(Cond::from_encoding(0b1000), None);
    }

    #[test]
    fn effect_classification() {
        let plain = OperandEffect::default();
        assert!(plain.is_none());
        assert!(!plain.needs_hw_reg());
        let inc = OperandEffect {
            kind: EffectKind::PostInc,
            ..Default::default()
        };
        assert!(inc.needs_hw_reg());
        let hint = OperandEffect {
            hints: AddrHints::NO_IMM,
            ..Default::default()
        };
        assert!(!hint.is_none());
        assert!(!hint.needs_hw_reg());
    }
}
