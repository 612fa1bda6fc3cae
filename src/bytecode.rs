//! The alternate stack-machine back end.
//!
//! An experimental interpreter target: instead of assembler text, the
//! module is emitted as a compact stack bytecode. Constant pushes come in
//! three widths chosen by value range; label operands are resolved to byte
//! addresses in a second pass once every instruction has a size.
//!
//! Per-opcode usage counters are kept during emission and can be sorted
//! into a most-to-least-used histogram, which drives the final opcode
//! numbering decisions for the interpreter.

use std::fmt;

/// A stack-machine opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum BcOp {
    Illegal,
    /// Push a sign-extended 8-bit constant.
    PushI8,
    /// Push a sign-extended 16-bit constant.
    PushI16,
    /// Push a full 32-bit constant.
    PushI32,
    /// Push the address of a label.
    PushAddr,
    /// A label definition; emits no bytes.
    Label,
    Dup,
    Drop,
    Swap,
    Add,
    Sub,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Ldb,
    Ldw,
    Ldl,
    Stb,
    Stw,
    Stl,
    Jmp,
    Jz,
    Jnz,
    Call,
    Ret,
    Halt,
}

impl BcOp {
    const ALL: &'static [BcOp] = &[
        BcOp::Illegal,
        BcOp::PushI8,
        BcOp::PushI16,
        BcOp::PushI32,
        BcOp::PushAddr,
        BcOp::Label,
        BcOp::Dup,
        BcOp::Drop,
        BcOp::Swap,
        BcOp::Add,
        BcOp::Sub,
        BcOp::Mul,
        BcOp::Div,
        BcOp::And,
        BcOp::Or,
        BcOp::Xor,
        BcOp::Shl,
        BcOp::Shr,
        BcOp::Sar,
        BcOp::Ldb,
        BcOp::Ldw,
        BcOp::Ldl,
        BcOp::Stb,
        BcOp::Stw,
        BcOp::Stl,
        BcOp::Jmp,
        BcOp::Jz,
        BcOp::Jnz,
        BcOp::Call,
        BcOp::Ret,
        BcOp::Halt,
    ];

    /// Encoded size in bytes, including operands.
    fn size(self) -> u32 {
        match self {
            BcOp::Label => 0,
            BcOp::PushI8 => 2,
            BcOp::PushI16 => 3,
            BcOp::PushI32 | BcOp::PushAddr | BcOp::Jmp | BcOp::Jz | BcOp::Jnz | BcOp::Call => 5,
            _ => 1,
        }
    }

    /// Look an opcode up by name, case-insensitively.
    pub fn by_name(name: &str) -> Option<BcOp> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| format!("{:?}", op).eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for BcOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = format!("{:?}", self).to_lowercase();
        f.write_str(&name)
    }
}

/// A label in the bytecode stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BcLabel(u32);

/// One emitted bytecode instruction.
#[derive(Clone, Debug)]
pub struct BcInst {
    /// The opcode.
    pub op: BcOp,
    /// Immediate value for the sized pushes.
    pub val: i32,
    /// Label operand for address pushes, branches and label markers.
    pub label: Option<BcLabel>,
}

/// The bytecode list for one compilation, with its usage counters.
pub struct BytecodeList {
    insts: Vec<BcInst>,
    label_addrs: Vec<Option<u32>>,
    usage: Vec<u32>,
}

impl BytecodeList {
    /// An empty list.
    pub fn new() -> Self {
        Self {
            insts: Vec::new(),
            label_addrs: Vec::new(),
            usage: vec![0; BcOp::ALL.len()],
        }
    }

    /// Mint a fresh label.
    pub fn create_label(&mut self) -> BcLabel {
        let l = BcLabel(self.label_addrs.len() as u32);
        self.label_addrs.push(None);
        l
    }

    /// Append an instruction with the given opcode.
    pub fn emit_op(&mut self, op: BcOp) -> &mut BcInst {
        self.usage[op as usize] += 1;
        self.insts.push(BcInst {
            op,
            val: 0,
            label: None,
        });
        self.insts.last_mut().expect("just pushed")
    }

    /// Append a constant push, sized to the value.
    pub fn emit_const(&mut self, val: i32) {
        let op = if (-128..=127).contains(&val) {
            BcOp::PushI8
        } else if (-32768..=32767).contains(&val) {
            BcOp::PushI16
        } else {
            BcOp::PushI32
        };
        self.emit_op(op).val = val;
    }

    /// Append an address push.
    pub fn emit_address(&mut self, label: BcLabel) {
        self.emit_op(BcOp::PushAddr).label = Some(label);
    }

    /// Define `label` at the current position.
    pub fn emit_label(&mut self, label: BcLabel) {
        self.emit_op(BcOp::Label).label = Some(label);
    }

    /// Append a branch to `label`.
    pub fn emit_branch(&mut self, op: BcOp, label: BcLabel) {
        debug_assert!(matches!(op, BcOp::Jmp | BcOp::Jz | BcOp::Jnz | BcOp::Call));
        self.emit_op(op).label = Some(label);
    }

    /// Append an opcode by name. Returns false for unknown names.
    pub fn emit_named(&mut self, name: &str) -> bool {
        match BcOp::by_name(name) {
            Some(op) => {
                self.emit_op(op);
                true
            }
            None => false,
        }
    }

    /// Second pass: assign a byte address to every label.
    pub fn assign_addresses(&mut self) {
        let mut addr = 0u32;
        for inst in &self.insts {
            if inst.op == BcOp::Label {
                if let Some(BcLabel(l)) = inst.label {
                    self.label_addrs[l as usize] = Some(addr);
                }
            }
            addr += inst.op.size();
        }
    }

    /// Encode the stream to bytes. Labels must have been resolved by
    /// [`BytecodeList::assign_addresses`]; unresolved references encode as
    /// zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for inst in &self.insts {
            match inst.op {
                BcOp::Label => {}
                BcOp::PushI8 => {
                    out.push(inst.op as u8);
                    out.push(inst.val as i8 as u8);
                }
                BcOp::PushI16 => {
                    out.push(inst.op as u8);
                    out.extend_from_slice(&(inst.val as i16).to_le_bytes());
                }
                BcOp::PushI32 => {
                    out.push(inst.op as u8);
                    out.extend_from_slice(&inst.val.to_le_bytes());
                }
                BcOp::PushAddr | BcOp::Jmp | BcOp::Jz | BcOp::Jnz | BcOp::Call => {
                    out.push(inst.op as u8);
                    let addr = inst
                        .label
                        .and_then(|BcLabel(l)| self.label_addrs[l as usize])
                        .unwrap_or(0);
                    out.extend_from_slice(&addr.to_le_bytes());
                }
                op => out.push(op as u8),
            }
        }
        out
    }

    /// The usage histogram, most-used first. Ties break on opcode order so
    /// the result is deterministic.
    pub fn usage_histogram(&self) -> Vec<(BcOp, u32)> {
        let mut hist: Vec<(BcOp, u32)> = BcOp::ALL
            .iter()
            .map(|&op| (op, self.usage[op as usize]))
            .collect();
        hist.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        hist
    }

    /// Number of instructions (including label markers).
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    /// True when nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

impl Default for BytecodeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_push_widths() {
        let mut bc = BytecodeList::new();
        bc.emit_const(127);
        bc.emit_const(-128);
        bc.emit_const(128);
        bc.emit_const(-32768);
        bc.emit_const(32768);
        let ops: Vec<BcOp> = bc.insts.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                BcOp::PushI8,
                BcOp::PushI8,
                BcOp::PushI16,
                BcOp::PushI16,
                BcOp::PushI32
            ]
        );
    }

    #[test]
    fn labels_resolve_in_second_pass() {
        let mut bc = BytecodeList::new();
        let top = bc.create_label();
        bc.emit_label(top);
        bc.emit_const(1); // 2 bytes
        bc.emit_op(BcOp::Add); // 1 byte
        bc.emit_branch(BcOp::Jmp, top); // 5 bytes
        bc.assign_addresses();
        let bytes = bc.encode();
        assert_eq!(bytes.len(), 8);
        // the branch target is address 0
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(bytes[3], BcOp::Jmp as u8);
    }

    #[test]
    fn forward_labels_work() {
        let mut bc = BytecodeList::new();
        let end = bc.create_label();
        bc.emit_branch(BcOp::Jz, end); // 5 bytes
        bc.emit_const(40000); // 5 bytes
        bc.emit_label(end);
        bc.emit_op(BcOp::Halt);
        bc.assign_addresses();
        let bytes = bc.encode();
        assert_eq!(&bytes[1..5], &10u32.to_le_bytes());
    }

    #[test]
    fn histogram_sorts_most_used_first() {
        let mut bc = BytecodeList::new();
        for _ in 0..3 {
            bc.emit_op(BcOp::Add);
        }
        bc.emit_op(BcOp::Mul);
        bc.emit_const(1);
        let hist = bc.usage_histogram();
        assert_eq!(hist[0], (BcOp::Add, 3));
        assert_eq!(hist[1].1, 1);
        // unused opcodes trail with zero counts
        assert_eq!(hist.last().unwrap().1, 0);
    }

    #[test]
    fn named_lookup_is_case_insensitive() {
        let mut bc = BytecodeList::new();
        assert!(bc.emit_named("ADD"));
        assert!(bc.emit_named("ldl"));
        assert!(!bc.emit_named("frobnicate"));
    }
}
