//! Operands and the operand pool.
//!
//! Operands are interned: `get` called twice with equal data returns the
//! same handle, so later passes compare operands by handle equality alone.
//! The pool is append-only and lives for the whole compilation.
//!
//! Handles are `u32` newtypes rather than references; a compact index keeps
//! the IR small and sidesteps ownership cycles between instructions that
//! reference each other's operands.

use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;

/// An opaque reference to an interned operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Operand(u32);

impl Operand {
    /// The index of this operand in the pool.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Relocation kinds understood by the data emitter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Patch a long-aligned long with the blob base label plus an addend.
    AbsoluteLong,
    /// Emit a source-line comment; consumes no data bytes.
    DebugLine(String),
}

/// A relocation request inside a binary blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reloc {
    /// What to patch.
    pub kind: RelocKind,
    /// Byte offset within the blob. Long-aligned for `AbsoluteLong`.
    pub offset: u32,
    /// Signed addend to the blob's base label.
    pub addend: i32,
}

/// The data carried by one operand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum OperandData {
    /// Integer literal. Values below 512 emit as `#value`; larger ones as
    /// `##value` on P2 or through a constant-pool register on P1.
    ImmInt(i32),
    /// A named integer constant; prints like `ImmInt` but by name.
    ImmNamed(String, i32),
    /// Label in cog memory.
    CogLabel(String),
    /// Label in hub memory.
    HubLabel(String),
    /// An inline string literal.
    ImmString(Vec<u8>),
    /// An embedded binary blob with its relocations, in offset order.
    ImmBinary {
        /// Raw bytes.
        data: Vec<u8>,
        /// Relocations sorted by offset.
        relocs: SmallVec<[Reloc; 4]>,
    },
    /// A named hardware register. The only variant that may carry a
    /// pointer-update effect, and only on P2.
    HwReg(String),
    /// A function-scoped register in cog memory.
    LocalReg(String),
    /// A compiler temporary in cog memory.
    TempReg(String),
    /// A register holding the hub address of another operand.
    HubPtr(Operand),
    /// A register holding the cog address of another operand.
    CogPtr(Operand),
    /// A typed memory dereference; must be lowered before emission.
    MemRef {
        /// Access size in bytes: 1, 2 or 4.
        size: u8,
        /// The address operand.
        addr: Operand,
    },
    /// A `$`/`$±k` operand inside inline assembly; resolved to a
    /// synthesized label before emission.
    PcRelative(i32),
}

impl OperandData {
    /// The printable name, for variants that have one.
    pub fn name(&self) -> Option<&str> {
        match self {
            OperandData::ImmNamed(name, _)
            | OperandData::CogLabel(name)
            | OperandData::HubLabel(name)
            | OperandData::HwReg(name)
            | OperandData::LocalReg(name)
            | OperandData::TempReg(name) => Some(name),
            _ => None,
        }
    }

    /// True for the operand kinds the emitter accepts. `MemRef` and
    /// `PcRelative` must be rewritten by earlier passes.
    pub fn legal_for_emit(&self) -> bool {
        !matches!(
            self,
            OperandData::MemRef { .. } | OperandData::PcRelative(_)
        )
    }

    /// True for labels placed in hub memory.
    pub fn is_hub_label(&self) -> bool {
        matches!(self, OperandData::HubLabel(_))
    }
}

impl fmt::Display for OperandData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OperandData::ImmInt(v) => write!(f, "#{}", v),
            OperandData::ImmNamed(name, _) => write!(f, "#{}", name),
            OperandData::CogLabel(name) | OperandData::HubLabel(name) => f.write_str(name),
            OperandData::ImmString(bytes) => {
                write!(f, "\"{}\"", String::from_utf8_lossy(bytes))
            }
            OperandData::ImmBinary { data, .. } => write!(f, "<blob {} bytes>", data.len()),
            OperandData::HwReg(name)
            | OperandData::LocalReg(name)
            | OperandData::TempReg(name) => f.write_str(name),
            OperandData::HubPtr(inner) => write!(f, "<hubptr {}>", inner.index()),
            OperandData::CogPtr(inner) => write!(f, "<cogptr {}>", inner.index()),
            OperandData::MemRef { size, addr } => {
                write!(f, "<mem{} {}>", size, addr.index())
            }
            OperandData::PcRelative(k) => {
                if *k >= 0 {
                    write!(f, "$+{}", k)
                } else {
                    write!(f, "$-{}", -k)
                }
            }
        }
    }
}

/// The interning pool for operands.
pub struct OperandPool {
    values: Vec<OperandData>,
    interned: HashMap<OperandData, Operand>,
}

impl OperandPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            interned: HashMap::new(),
        }
    }

    /// Intern `data`, returning the existing handle for equal data.
    pub fn get(&mut self, data: OperandData) -> Operand {
        if let Some(&op) = self.interned.get(&data) {
            return op;
        }
        let op = Operand(self.values.len() as u32);
        self.values.push(data.clone());
        self.interned.insert(data, op);
        op
    }

    /// Add a binary blob. Blobs are never deduplicated; every call returns
    /// a fresh handle.
    pub fn add_blob(&mut self, data: Vec<u8>, relocs: SmallVec<[Reloc; 4]>) -> Operand {
        let op = Operand(self.values.len() as u32);
        self.values.push(OperandData::ImmBinary { data, relocs });
        op
    }

    /// Shorthand for an integer immediate.
    pub fn imm(&mut self, value: i32) -> Operand {
        self.get(OperandData::ImmInt(value))
    }

    /// The data behind a handle.
    pub fn data(&self, op: Operand) -> &OperandData {
        &self.values[op.index()]
    }

    /// Iterate over all operands in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Operand, &OperandData)> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, d)| (Operand(i as u32), d))
    }

    /// Number of distinct operands in the pool.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if nothing has been interned yet.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl Default for OperandPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_shares_identity() {
        let mut pool = OperandPool::new();
        let a = pool.get(OperandData::LocalReg("count".to_string()));
        let b = pool.get(OperandData::LocalReg("count".to_string()));
        assert_eq!(a, b);
        let c = pool.get(OperandData::TempReg("count".to_string()));
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn immediates_intern_by_value() {
        let mut pool = OperandPool::new();
        assert_eq!(pool.imm(42), pool.imm(42));
        assert_ne!(pool.imm(42), pool.imm(43));
    }

    #[test]
    fn blobs_are_unique() {
        let mut pool = OperandPool::new();
        let a = pool.add_blob(vec![0, 1, 2, 3], SmallVec::new());
        let b = pool.add_blob(vec![0, 1, 2, 3], SmallVec::new());
        assert_ne!(a, b);
    }

    #[test]
    fn emit_legality() {
        let mut pool = OperandPool::new();
        let base = pool.get(OperandData::LocalReg("p".to_string()));
        let mem = OperandData::MemRef {
            size: 4,
            addr: base,
        };
        assert!(!mem.legal_for_emit());
        assert!(pool.data(base).legal_for_emit());
        assert!(!OperandData::PcRelative(2).legal_for_emit());
    }
}
