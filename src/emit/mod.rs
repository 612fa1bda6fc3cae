//! Serializing IR lists to assembler text.
//!
//! The emitter walks an IR list in order, lazily opening `CON`/`DAT`
//! sections and emitting an initial `org` before the first instruction.
//! On P1, code placed in hub memory cannot branch directly: calls, jumps,
//! `djnz` and returns are rewritten into LMM dispatcher sequences, except
//! that jumps with a resolved target within a conservative range become
//! direct adds or subtracts on the LMM program counter.
//!
//! In degraded output mode (for a downstream assembler without the
//! absolute-address operator) every absolute hub address emitted as data
//! becomes a link in a fixup chain that a runtime helper patches at
//! program start; see [`wrapper`].

pub mod blob;
pub mod image;
pub mod wrapper;

use crate::ast::Module;
use crate::context::{CompileContext, OutputMode};
use crate::ir::{
    Cond, EffectKind, InstrFlags, IrHandle, IrList, Opcode, Operand, OperandData, OperandEffect,
};
use crate::isa::{IsaKind, OperandShape, SMALL_IMM_LIMIT};
use std::collections::HashMap;
use std::fmt::Write;

/// LMM jumps within this many instructions of their target are emitted as
/// direct adjustments of the LMM pc. 127 would be the absolute maximum;
/// the value is deliberately conservative.
const MAX_REL_JUMP_OFFSET: i32 = 100;

/// Hub base address for P2 `orgh`.
const P2_HUB_BASE: u32 = 0x400;

/// Serialize `list` to assembler text. `module` supplies the wrapper-object
/// contents in degraded mode and may be `None` otherwise.
pub fn ir_assemble(ctx: &mut CompileContext, list: &IrList, module: Option<&Module>) -> String {
    assign_addresses(ctx, list);
    resolve_branch_targets(ctx, list);
    let mut st = EmitState {
        ctx,
        module,
        out: String::new(),
        in_con: false,
        in_dat: false,
        did_org: false,
        lmm_mode: false,
        did_pub: false,
        pending_fixup: 0,
    };
    st.run(list);
    st.out
}

/// Assign a running address to every instruction in `list`. Addresses are
/// instruction indices, not byte offsets; the LMM branch shortening only
/// needs relative distances.
pub fn assign_addresses(ctx: &mut CompileContext, list: &IrList) {
    let mut addr = 0u32;
    for h in ctx.arena.handles(list) {
        let ir = &mut ctx.arena[h];
        ir.addr = addr;
        if !ir.is_dummy() && ir.opc != Opcode::Label {
            addr += 1;
        }
    }
}

/// Point every branch's `aux` at the instruction carrying its target
/// label, where the label is defined in the same list.
pub fn resolve_branch_targets(ctx: &mut CompileContext, list: &IrList) {
    let mut labels: HashMap<Operand, IrHandle> = HashMap::new();
    for h in ctx.arena.iter(list) {
        let ir = &ctx.arena[h];
        if ir.opc == Opcode::Label {
            if let Some(dst) = ir.dst {
                labels.insert(dst, h);
            }
        }
    }
    for h in ctx.arena.handles(list) {
        let dest = ctx.arena[h].jump_dest();
        if let Some(dest) = dest {
            if let Some(&target) = labels.get(&dest) {
                ctx.arena[h].aux = Some(target);
            }
        }
    }
}

struct EmitState<'a> {
    ctx: &'a mut CompileContext,
    module: Option<&'a Module>,
    out: String,
    in_con: bool,
    in_dat: bool,
    did_org: bool,
    lmm_mode: bool,
    did_pub: bool,
    pending_fixup: u32,
}

impl<'a> EmitState<'a> {
    fn run(&mut self, list: &IrList) {
        if self.ctx.options.isa == IsaKind::P2
            && self.ctx.options.output != OutputMode::DegradedAsm
        {
            self.did_pub = true;
        }
        for h in self.ctx.arena.handles(list) {
            self.emit_ir(h);
            if self.ctx.options.output == OutputMode::DegradedAsm && self.pending_fixup != 0 {
                let n = self.pending_fixup;
                self.pending_fixup = 0;
                let _ = writeln!(self.out, "__fixup_{}", n);
            }
        }
        if self.ctx.options.output == OutputMode::DegradedAsm {
            self.out.push_str("__fixup_ptr\n\tlong\t");
            let last = self.ctx.last_fixup_number();
            if last > 0 {
                let _ = writeln!(self.out, "@__fixup_{} - 4", last);
            } else {
                self.out.push_str("0\n");
            }
        }
    }

    fn s(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn internal(&mut self, msg: &str) {
        self.ctx
            .diags
            .internal(crate::diag::SourceLoc::builtin(), msg.to_string());
    }

    // ---- operand rendering ---------------------------------------------

    fn operand_name(&self, op: Operand) -> String {
        match self.ctx.pool.data(op) {
            OperandData::HubPtr(inner) | OperandData::CogPtr(inner) => {
                self.operand_name(*inner)
            }
            data => data.name().map(str::to_string).unwrap_or_else(|| {
                if let OperandData::ImmInt(v) = data {
                    format!("{}", v)
                } else {
                    "???".to_string()
                }
            }),
        }
    }

    fn print_operand(&mut self, op: Operand, use_imm: bool, effect: OperandEffect) {
        if !effect.is_none() && effect.needs_hw_reg() {
            if self.ctx.options.isa.has_operand_effects() {
                if !matches!(self.ctx.pool.data(op), OperandData::HwReg(_)) {
                    self.internal("operand effect on wrong register");
                }
            } else {
                self.internal("illegal operand effect");
            }
        }
        let data = self.ctx.pool.data(op).clone();
        match data {
            OperandData::ImmInt(v) => {
                if (0..SMALL_IMM_LIMIT).contains(&v) {
                    let _ = write!(self.out, "#{}", v);
                } else if self.ctx.options.isa.has_big_immediates() {
                    let _ = write!(self.out, "##{}", v);
                } else {
                    self.internal("large immediate missed the constant pool");
                    let _ = write!(self.out, "#{}", v);
                }
            }
            OperandData::ImmNamed(name, v) => {
                if (0..SMALL_IMM_LIMIT).contains(&v) || !self.ctx.options.isa.has_big_immediates()
                {
                    let _ = write!(self.out, "#{}", name);
                } else {
                    let _ = write!(self.out, "##{}", name);
                }
            }
            OperandData::MemRef { .. } => {
                self.internal("tried to use memory directly");
            }
            OperandData::PcRelative(_) => {
                self.internal("unresolved pc-relative operand");
            }
            OperandData::ImmBinary { .. } => {
                self.internal("binary blob outside a labeled-blob directive");
            }
            OperandData::HubLabel(name) => {
                if self.ctx.options.isa == IsaKind::P2 && use_imm {
                    self.s("#@");
                }
                self.s(&name);
            }
            OperandData::CogLabel(name) => {
                if use_imm {
                    self.s("#");
                }
                self.s(&name);
            }
            OperandData::CogPtr(inner) => {
                let name = self.operand_name(inner);
                let _ = write!(self.out, "#{}", name);
            }
            OperandData::HubPtr(inner) => {
                let name = self.operand_name(inner);
                if self.ctx.options.isa == IsaKind::P2 {
                    let _ = write!(self.out, "#@{}", name);
                } else {
                    let _ = write!(self.out, "@{}", name);
                }
            }
            OperandData::ImmString(bytes) => {
                let _ = write!(self.out, "\"{}\"", String::from_utf8_lossy(&bytes));
            }
            OperandData::HwReg(name)
            | OperandData::LocalReg(name)
            | OperandData::TempReg(name) => {
                match effect.kind {
                    EffectKind::PreInc => self.s("++"),
                    EffectKind::PreDec => self.s("--"),
                    _ => {}
                }
                self.s(&name);
                match effect.kind {
                    EffectKind::PostInc => self.s("++"),
                    EffectKind::PostDec => self.s("--"),
                    _ => {}
                }
                if effect.offset != 0 {
                    let _ = write!(self.out, "[{}]", effect.offset);
                }
            }
        }
    }

    /// In degraded mode, plant the pending fixup marker label right away.
    /// Used inside blobs, where several relocations share one directive.
    fn flush_pending_fixup(&mut self) {
        if self.pending_fixup != 0 {
            let n = self.pending_fixup;
            self.pending_fixup = 0;
            let _ = writeln!(self.out, "__fixup_{}", n);
        }
    }

    /// The textual expression for the absolute hub address of `name`,
    /// honoring the output mode.
    fn hub_address_expr(&mut self, name: &str) -> String {
        match self.ctx.options.output {
            OutputMode::DegradedAsm => {
                let prev = self.ctx.last_fixup_number();
                let n = self.ctx.next_fixup_number();
                self.pending_fixup = n;
                if prev > 0 {
                    format!("( (@__fixup_{} - 4) << 16) + @{}", prev, name)
                } else {
                    format!("@{}", name)
                }
            }
            _ if self.ctx.options.isa == IsaKind::P2 => format!("@{}", name),
            _ => format!("@@@{}", name),
        }
    }

    fn print_operand_as_value(&mut self, op: Operand) {
        let data = self.ctx.pool.data(op).clone();
        match data {
            OperandData::ImmInt(v) | OperandData::ImmNamed(_, v) => {
                let _ = write!(self.out, "{}", v);
            }
            OperandData::HubLabel(name) => {
                let expr = self.hub_address_expr(&name);
                self.s(&expr);
            }
            OperandData::CogLabel(name) => self.s(&name),
            OperandData::ImmString(bytes) => {
                let _ = write!(self.out, "\"{}\"", String::from_utf8_lossy(&bytes));
            }
            OperandData::HubPtr(inner) | OperandData::CogPtr(inner) => {
                let name = self.operand_name(inner);
                self.s(&name);
            }
            _ => self.print_operand(op, false, OperandEffect::default()),
        }
    }

    fn print_cond(&mut self, cond: Cond) {
        if cond != Cond::True {
            self.s(" ");
            self.s(cond.mnemonic());
        }
        self.s("\t");
    }

    // ---- sections ------------------------------------------------------

    fn enter_dat(&mut self) {
        if self.in_dat {
            return;
        }
        if !self.did_pub {
            if let Some(module) = self.module {
                wrapper::emit_wrapper_object(
                    &mut self.out,
                    module,
                    self.ctx.options.isa == IsaKind::P2,
                    self.ctx.options.output == OutputMode::DegradedAsm,
                );
            }
            self.did_pub = true;
        }
        self.s("DAT\n");
        self.in_con = false;
        self.in_dat = true;
        if !self.did_org {
            self.s("\torg\t0\n");
            self.did_org = true;
        }
    }

    // ---- main dispatch -------------------------------------------------

    fn emit_ir(&mut self, h: IrHandle) {
        let ir = self.ctx.arena[h].clone();
        match ir.opc {
            Opcode::Comment => {
                let Some(dst) = ir.dst else { return };
                let OperandData::ImmString(bytes) = self.ctx.pool.data(dst).clone() else {
                    self.internal("comment is not a string");
                    return;
                };
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.s("' ");
                self.s(text.split('\n').next().unwrap_or(""));
                self.s("\n");
                return;
            }
            Opcode::Dummy | Opcode::RepeatEnd => return,
            Opcode::Const => {
                if !self.in_con {
                    self.s("CON\n");
                    self.in_con = true;
                    self.in_dat = false;
                }
                self.s("\t");
                if let Some(dst) = ir.dst {
                    let name = self.operand_name(dst);
                    self.s(&name);
                }
                self.s(" = ");
                if let Some(src) = ir.src {
                    self.print_operand_as_value(src);
                }
                self.s("\n");
                return;
            }
            _ => {}
        }
        self.enter_dat();

        if self.ctx.options.isa == IsaKind::P1 && self.emit_lmm(&ir) {
            return;
        }

        if let Some(desc) = ir.desc {
            self.print_cond(ir.cond);
            self.s(desc.name);
            match desc.shape {
                OperandShape::NoOperands => {}
                shape if shape.single_src() => {
                    self.s("\t");
                    if let Some(dst) = ir.dst {
                        self.check_emit_legal(dst);
                        self.print_operand(dst, true, OperandEffect::default());
                    }
                }
                _ => {
                    self.s("\t");
                    if let Some(dst) = ir.dst {
                        self.check_emit_legal(dst);
                        self.print_operand(dst, false, ir.dst_effect);
                    }
                    self.s(", ");
                    if let Some(src) = ir.src {
                        self.check_emit_legal(src);
                        self.print_operand(src, true, ir.src_effect);
                    }
                }
            }
            self.emit_flag_suffix(ir.flags);
            self.s("\n");
            return;
        }

        match ir.opc {
            Opcode::Dead => {
                self.s("\t.dead\t");
                if let Some(dst) = ir.dst {
                    let name = self.operand_name(dst);
                    self.s(&name);
                }
                self.s("\n");
            }
            Opcode::Literal => {
                if let Some(dst) = ir.dst {
                    self.print_operand(dst, false, OperandEffect::default());
                }
                self.s("\n");
            }
            Opcode::Label => {
                if let Some(dst) = ir.dst {
                    let name = self.operand_name(dst);
                    self.s(&name);
                }
                self.s("\n");
            }
            Opcode::Ret => {
                // non-LMM return
                self.print_cond(ir.cond);
                self.s("ret\n");
            }
            Opcode::Byte | Opcode::Word | Opcode::Word1 | Opcode::Long | Opcode::String => {
                self.s("\t");
                self.s(match ir.opc {
                    Opcode::Byte | Opcode::String => "byte",
                    Opcode::Word => "word",
                    Opcode::Word1 => "word 1 |",
                    _ => "long",
                });
                self.s("\t");
                if let Some(dst) = ir.dst {
                    self.print_operand_as_value(dst);
                }
                if let Some(src) = ir.src {
                    self.s("[");
                    self.print_operand_as_value(src);
                    self.s("]");
                }
                self.s("\n");
            }
            Opcode::Reserve => {
                self.s("\tres\t");
                if let Some(dst) = ir.dst {
                    self.print_operand_as_value(dst);
                }
                self.s("\n");
            }
            Opcode::ReserveH => {
                self.s("\tlong\t0[");
                if let Some(dst) = ir.dst {
                    self.print_operand_as_value(dst);
                }
                self.s("]\n");
            }
            Opcode::Fcache => {
                self.s("\tcall\t#LMM_FCACHE_LOAD\n\tlong\t(");
                if let Some(dst) = ir.dst {
                    self.print_operand_as_value(dst);
                }
                self.s(" - ");
                if let Some(src) = ir.src {
                    self.print_operand_as_value(src);
                }
                self.s(")\n");
            }
            Opcode::LabeledBlob => {
                if let (Some(dst), Some(src)) = (ir.dst, ir.src) {
                    blob::output_blob(self, dst, src);
                } else {
                    self.internal("labeled blob without label or data");
                }
            }
            Opcode::Fit => {
                self.s("\tfit\t");
                match ir.dst {
                    Some(dst) => self.print_operand_as_value(dst),
                    None => self.s("496"),
                }
                self.s("\n");
            }
            Opcode::Org => {
                self.s("\torg\t");
                if let Some(dst) = ir.dst {
                    self.print_operand_as_value(dst);
                }
                self.s("\n");
            }
            Opcode::HubMode => {
                if self.ctx.options.isa == IsaKind::P2 {
                    let _ = writeln!(self.out, "\torgh\t${:x}", P2_HUB_BASE);
                }
                self.lmm_mode = true;
            }
            Opcode::Repeat => {
                self.print_cond(ir.cond);
                self.s("rep\t@");
                if let Some(dst) = ir.dst {
                    self.print_operand(dst, false, OperandEffect::default());
                }
                if let Some(src) = ir.src {
                    self.s(", ");
                    self.print_operand(src, true, OperandEffect::default());
                }
                self.s("\n");
            }
            _ => {
                self.internal("unable to process IR opcode");
            }
        }
    }

    fn check_emit_legal(&mut self, op: Operand) {
        if !self.ctx.pool.data(op).legal_for_emit() {
            self.internal("operand kind must not reach the emitter");
        }
    }

    fn emit_flag_suffix(&mut self, flags: InstrFlags) {
        let relevant = flags
            & (InstrFlags::WC | InstrFlags::WZ | InstrFlags::WCZ | InstrFlags::NR | InstrFlags::WR);
        if relevant.is_empty() {
            return;
        }
        let mut sep = " ";
        let both = InstrFlags::WC | InstrFlags::WZ;
        if self.ctx.options.isa == IsaKind::P2
            && (relevant.contains(both) || relevant.contains(InstrFlags::WCZ))
        {
            let _ = write!(self.out, "{}wcz", sep);
            sep = ",";
        } else {
            if relevant.contains(InstrFlags::WC) || relevant.contains(InstrFlags::WCZ) {
                let _ = write!(self.out, "{}wc", sep);
                sep = ",";
            }
            if relevant.contains(InstrFlags::WZ) || relevant.contains(InstrFlags::WCZ) {
                let _ = write!(self.out, "{}wz", sep);
                sep = ",";
            }
        }
        if relevant.contains(InstrFlags::NR) {
            let _ = write!(self.out, "{}nr", sep);
        } else if relevant.contains(InstrFlags::WR) {
            let _ = write!(self.out, "{}wr", sep);
        }
    }

    // ---- LMM -----------------------------------------------------------

    fn is_hub_dest(&self, op: Option<Operand>) -> bool {
        op.map(|o| self.ctx.pool.data(o).is_hub_label())
            .unwrap_or(false)
    }

    /// Handle the P1 hub-code branch forms. Returns true when the
    /// instruction was fully emitted here.
    fn emit_lmm(&mut self, ir: &crate::ir::Ir) -> bool {
        match ir.opc {
            Opcode::Call => {
                if !self.is_hub_dest(ir.dst) {
                    return false;
                }
                if !self.lmm_mode {
                    // call into hub code from cog code
                    self.print_cond(ir.cond);
                    self.s("mov\tpc, $+2\n");
                    self.print_cond(ir.cond);
                    self.s("call\t#LMM_CALL_FROM_COG\n");
                } else {
                    self.print_cond(ir.cond);
                    self.s("jmp\t#LMM_CALL\n");
                }
                self.s("\tlong\t");
                let dst = ir.dst.expect("hub dest checked");
                self.print_operand_as_value(dst);
                self.s("\n");
                true
            }
            Opcode::Djnz => {
                if let Some(window) = ir.fcache {
                    self.print_cond(ir.cond);
                    self.s("djnz\t");
                    if let Some(dst) = ir.dst {
                        self.print_operand(dst, false, OperandEffect::default());
                    }
                    self.s(", #LMM_FCACHE_START + (");
                    if let Some(src) = ir.src {
                        self.print_operand(src, false, OperandEffect::default());
                    }
                    self.s(" - ");
                    self.print_operand(window, false, OperandEffect::default());
                    self.s(")\n");
                    return true;
                }
                if !self.is_hub_dest(ir.src) {
                    return false;
                }
                self.print_cond(ir.cond);
                self.s("djnz\t");
                if let Some(dst) = ir.dst {
                    self.print_operand(dst, false, OperandEffect::default());
                }
                self.s(", #LMM_JUMP\n\tlong\t");
                let src = ir.src.expect("hub dest checked");
                self.print_operand_as_value(src);
                self.s("\n");
                true
            }
            Opcode::Jump => {
                if let Some(window) = ir.fcache {
                    self.print_cond(ir.cond);
                    self.s("jmp\t#LMM_FCACHE_START + (");
                    if let Some(dst) = ir.dst {
                        self.print_operand(dst, false, OperandEffect::default());
                    }
                    self.s(" - ");
                    self.print_operand(window, false, OperandEffect::default());
                    self.s(")\n");
                    return true;
                }
                if !self.is_hub_dest(ir.dst) {
                    return false;
                }
                if !self.lmm_mode {
                    self.internal("jump from cog code to hub code");
                }
                self.print_cond(ir.cond);
                let dst = ir.dst.expect("hub dest checked");
                // a known nearby destination becomes pc arithmetic
                if let Some(aux) = ir.aux {
                    let offset = self.ctx.arena[aux].addr as i64 - ir.addr as i64;
                    if offset > 0 && offset < MAX_REL_JUMP_OFFSET as i64 {
                        self.s("add\tpc, #4*(");
                        self.print_operand(dst, false, OperandEffect::default());
                        self.s(" - ($+1))\n");
                        return true;
                    }
                    if offset < 0 && offset > -(MAX_REL_JUMP_OFFSET as i64) {
                        self.s("sub\tpc, #4*(($+1) - ");
                        self.print_operand(dst, false, OperandEffect::default());
                        self.s(")\n");
                        return true;
                    }
                }
                self.s("rdlong\tpc, pc\n\tlong\t");
                self.print_operand_as_value(dst);
                self.s("\n");
                true
            }
            Opcode::Ret => {
                if ir.fcache.is_some() {
                    self.internal("return from fcached code is not supported");
                    return true;
                }
                if self.lmm_mode {
                    self.print_cond(ir.cond);
                    self.s("jmp\t#LMM_RET\n");
                    return true;
                }
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Options;
    use crate::ir::{Ir, IrList};
    use crate::isa::find_instr_for_opc;

    fn ctx(isa: IsaKind) -> CompileContext {
        CompileContext::new(Options {
            isa,
            ..Options::default()
        })
    }

    fn op2(
        ctx: &mut CompileContext,
        list: &mut IrList,
        opc: Opcode,
        dst: Operand,
        src: Operand,
    ) -> IrHandle {
        let mut ir = Ir::new(opc);
        ir.desc = find_instr_for_opc(opc);
        ir.dst = Some(dst);
        ir.src = Some(src);
        ctx.arena.emit(list, ir)
    }

    fn label(ctx: &mut CompileContext, list: &mut IrList, op: Operand) {
        let mut ir = Ir::new(Opcode::Label);
        ir.dst = Some(op);
        ctx.arena.emit(list, ir);
    }

    #[test]
    fn straight_line_moves() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let y = ctx.pool.get(OperandData::LocalReg("y".into()));
        let one = ctx.pool.imm(1);
        let two = ctx.pool.imm(2);
        op2(&mut ctx, &mut list, Opcode::Mov, x, one);
        op2(&mut ctx, &mut list, Opcode::Mov, y, x);
        op2(&mut ctx, &mut list, Opcode::Add, y, two);
        let text = ir_assemble(&mut ctx, &list, None);
        assert_eq!(
            text,
            "DAT\n\torg\t0\n\tmov\tx, #1\n\tmov\ty, x\n\tadd\ty, #2\n"
        );
    }

    #[test]
    fn predicates_and_flags() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let zero = ctx.pool.imm(0);
        let h = op2(&mut ctx, &mut list, Opcode::Cmps, x, zero);
        ctx.arena[h].flags |= InstrFlags::WC | InstrFlags::WZ;
        let one = ctx.pool.imm(1);
        let h2 = op2(&mut ctx, &mut list, Opcode::Mov, x, one);
        ctx.arena[h2].cond = Cond::Eq;
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tcmps\tx, #0 wc,wz\n"));
        assert!(text.contains(" if_e\tmov\tx, #1\n"));
    }

    #[test]
    fn p2_wcz_fusion() {
        let mut ctx = ctx(IsaKind::P2);
        let mut list = IrList::new();
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let zero = ctx.pool.imm(0);
        let h = op2(&mut ctx, &mut list, Opcode::Cmp, x, zero);
        ctx.arena[h].flags |= InstrFlags::WC | InstrFlags::WZ;
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tcmp\tx, #0 wcz\n"));
    }

    #[test]
    fn immediate_forms_per_isa() {
        // small immediates use # everywhere; large ones need ## on P2
        let mut ctx = ctx(IsaKind::P2);
        let mut list = IrList::new();
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let small = ctx.pool.imm(0x1f0);
        let big = ctx.pool.imm(0x8000);
        op2(&mut ctx, &mut list, Opcode::Mov, x, small);
        op2(&mut ctx, &mut list, Opcode::Mov, x, big);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tmov\tx, #496\n"));
        assert!(text.contains("\tmov\tx, ##32768\n"));
    }

    #[test]
    fn lmm_call_and_ret_in_hub_code() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let hub_func = ctx.pool.get(OperandData::HubLabel("hub_func".into()));
        let mut call = Ir::new(Opcode::Call);
        call.desc = find_instr_for_opc(Opcode::Call);
        call.dst = Some(hub_func);
        ctx.arena.emit(&mut list, call);
        ctx.arena.emit(&mut list, Ir::new(Opcode::Ret));
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tjmp\t#LMM_CALL\n\tlong\t@@@hub_func\n"));
        assert!(text.contains("\tjmp\t#LMM_RET\n"));
    }

    #[test]
    fn lmm_call_from_cog_code() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        let hub_func = ctx.pool.get(OperandData::HubLabel("hub_func".into()));
        let mut call = Ir::new(Opcode::Call);
        call.desc = find_instr_for_opc(Opcode::Call);
        call.dst = Some(hub_func);
        ctx.arena.emit(&mut list, call);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tmov\tpc, $+2\n\tcall\t#LMM_CALL_FROM_COG\n\tlong\t@@@hub_func\n"));
    }

    #[test]
    fn nearby_hub_jump_shortens() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let target = ctx.pool.get(OperandData::HubLabel("loop_top".into()));
        label(&mut ctx, &mut list, target);
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let one = ctx.pool.imm(1);
        op2(&mut ctx, &mut list, Opcode::Add, x, one);
        let mut jmp = Ir::new(Opcode::Jump);
        jmp.desc = find_instr_for_opc(Opcode::Jump);
        jmp.dst = Some(target);
        ctx.arena.emit(&mut list, jmp);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(
            text.contains("\tsub\tpc, #4*(($+1) - loop_top)\n"),
            "got: {}",
            text
        );
    }

    #[test]
    fn distant_hub_jump_uses_dispatcher() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let target = ctx.pool.get(OperandData::HubLabel("far_away".into()));
        label(&mut ctx, &mut list, target);
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let one = ctx.pool.imm(1);
        for _ in 0..MAX_REL_JUMP_OFFSET {
            op2(&mut ctx, &mut list, Opcode::Add, x, one);
        }
        let mut jmp = Ir::new(Opcode::Jump);
        jmp.desc = find_instr_for_opc(Opcode::Jump);
        jmp.dst = Some(target);
        ctx.arena.emit(&mut list, jmp);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\trdlong\tpc, pc\n\tlong\t@@@far_away\n"));
    }

    #[test]
    fn p2_hub_branches_stay_direct() {
        let mut ctx = ctx(IsaKind::P2);
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let target = ctx.pool.get(OperandData::HubLabel("hub_func".into()));
        let mut call = Ir::new(Opcode::Call);
        call.desc = find_instr_for_opc(Opcode::Call);
        call.dst = Some(target);
        ctx.arena.emit(&mut list, call);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\torgh\t$400\n"));
        assert!(text.contains("\tcall\t#@hub_func\n"));
    }

    #[test]
    fn fcache_window_jumps() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let start = ctx.pool.get(OperandData::HubLabel("fc_start".into()));
        let end = ctx.pool.get(OperandData::HubLabel("fc_end".into()));
        let mut fc = Ir::new(Opcode::Fcache);
        fc.dst = Some(end);
        fc.src = Some(start);
        ctx.arena.emit(&mut list, fc);
        label(&mut ctx, &mut list, start);
        let inner = ctx.pool.get(OperandData::CogLabel("spin_wait".into()));
        label(&mut ctx, &mut list, inner);
        let mut jmp = Ir::new(Opcode::Jump);
        jmp.desc = find_instr_for_opc(Opcode::Jump);
        jmp.dst = Some(inner);
        jmp.fcache = Some(start);
        ctx.arena.emit(&mut list, jmp);
        label(&mut ctx, &mut list, end);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.contains("\tcall\t#LMM_FCACHE_LOAD\n"));
        assert!(text.contains("\tlong\t(@@@fc_end - @@@fc_start)\n"));
        assert!(text.contains("\tjmp\t#LMM_FCACHE_START + (spin_wait - fc_start)\n"));
    }

    #[test]
    fn con_section_switches() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        let name = ctx.pool.get(OperandData::ImmNamed("CLK_FREQ".into(), 0));
        let val = ctx.pool.imm(80_000_000);
        let mut c = Ir::new(Opcode::Const);
        c.dst = Some(name);
        c.src = Some(val);
        ctx.arena.emit(&mut list, c);
        let x = ctx.pool.get(OperandData::LocalReg("x".into()));
        let one = ctx.pool.imm(1);
        op2(&mut ctx, &mut list, Opcode::Mov, x, one);
        let text = ir_assemble(&mut ctx, &list, None);
        assert!(text.starts_with("CON\n\tCLK_FREQ = 80000000\nDAT\n\torg\t0\n"));
    }

    #[test]
    fn degraded_mode_builds_fixup_chain() {
        let mut ctx = CompileContext::new(Options {
            isa: IsaKind::P1,
            output: OutputMode::DegradedAsm,
            ..Options::default()
        });
        let mut list = IrList::new();
        ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        let a = ctx.pool.get(OperandData::HubLabel("table_a".into()));
        let b = ctx.pool.get(OperandData::HubLabel("table_b".into()));
        for op in [a, b] {
            let mut ir = Ir::new(Opcode::Long);
            ir.dst = Some(op);
            ctx.arena.emit(&mut list, ir);
        }
        let text = ir_assemble(&mut ctx, &list, None);
        // first fixup is a bare relative address followed by its marker
        assert!(text.contains("\tlong\t@table_a\n__fixup_1\n"));
        // the second chains to the first
        assert!(text.contains("\tlong\t( (@__fixup_1 - 4) << 16) + @table_b\n__fixup_2\n"));
        // terminal pointer references the last fixup
        assert!(text.ends_with("__fixup_ptr\n\tlong\t@__fixup_2 - 4\n"));
    }

    #[test]
    fn comments_carry_through() {
        let mut ctx = ctx(IsaKind::P1);
        let mut list = IrList::new();
        let c = ctx
            .pool
            .get(OperandData::ImmString(b"main loop".to_vec()));
        let mut ir = Ir::new(Opcode::Comment);
        ir.dst = Some(c);
        ctx.arena.emit(&mut list, ir);
        let text = ir_assemble(&mut ctx, &list, None);
        assert_eq!(text, "' main loop\n");
    }
}
