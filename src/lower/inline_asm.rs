//! The inline-assembly embedder.
//!
//! An `asm` block arrives as a list of pre-tokenized lines. The embedder
//! runs a label pre-pass (every identifier-only line becomes a local label
//! bound in the function's symbol table), then emits one IR instruction per
//! line, resolving operands against the surrounding function. Blocks inside
//! hub functions may request fcache placement, which wraps them between a
//! pair of window labels and a load pseudo-instruction.
//!
//! `$` and `$±k` operands are emitted as placeholders and resolved to
//! synthesized labels in a fixup walk once the whole block is in place.

use crate::ast::{AsmFlags, AsmInstr, AsmItem, CodePlacement, Expr, ImmMarker, Symbol, UnOp};
use crate::ir::{
    AddrHints, Cond, EffectKind, InstrFlags, Ir, IrHandle, Opcode, Operand, OperandData,
    OperandEffect,
};
use crate::isa::{immediate_fits, lookup_instr};
use crate::lower::{FuncState, ModuleLowering};
use crate::regalloc::{arg_reg, heap_ptr, object_ptr, result_reg, stack_ptr, LocalStorage};

/// Tracks whether the stack pointer register has been saved before the
/// block modifies it. The check is heuristic: a `mov` or `wrlong` reading
/// `ptra` counts as a save.
#[derive(Default)]
struct PtraTracker {
    saved: bool,
}

impl PtraTracker {
    fn note(&mut self, ml: &ModuleLowering, ir: &Ir) -> bool {
        let is_ptra = |op: Option<Operand>| {
            op.map(|o| matches!(ml.ctx.pool.data(o), OperandData::HwReg(n) if n == "ptra"))
                .unwrap_or(false)
        };
        if matches!(ir.opc, Opcode::Mov | Opcode::Wrlong) && is_ptra(ir.src) {
            self.saved = true;
        }
        !self.saved && is_ptra(ir.dst) && instr_modifies_dst(ir.opc)
    }
}

fn instr_modifies_dst(opc: Opcode) -> bool {
    !matches!(
        opc,
        Opcode::Cmp | Opcode::Cmps | Opcode::Test | Opcode::Wrbyte | Opcode::Wrword | Opcode::Wrlong
    )
}

/// Mint a label operand for an inline-asm local label, in the region the
/// surrounding code executes from.
fn label_operand(ml: &mut ModuleLowering, fs: &FuncState, in_fcache: bool) -> Operand {
    if in_fcache {
        ml.ctx.new_cog_label()
    } else if fs.placement == CodePlacement::Hub {
        ml.ctx.new_hub_label()
    } else {
        ml.ctx.new_cog_label()
    }
}

/// Compile one inline-assembly block into the function body.
pub(crate) fn compile_inline_asm(
    ml: &mut ModuleLowering,
    fs: &mut FuncState,
    items: &[AsmItem],
    flags: AsmFlags,
) {
    let mut want_fcache = flags.fcache;
    if fs.placement != CodePlacement::Hub {
        // cog code is already fast; never generate fcache bookkeeping
        want_fcache = false;
    }
    let mut in_fcache = false;
    if want_fcache {
        if ml.ctx.options.fcache_longs == 0 {
            ml.warning("fcache is disabled, asm will run from hub memory");
        } else {
            in_fcache = true;
        }
    }

    let end_label = ml.ctx.new_hub_label();
    let mut fcache_start = None;
    if in_fcache {
        let start_label = ml.ctx.new_hub_label();
        fcache_start = Some(start_label);
        let mut fc = Ir::new(Opcode::Fcache);
        fc.dst = Some(end_label);
        fc.src = Some(start_label);
        ml.ctx.arena.emit(&mut fs.body, fc);
        let mut start = Ir::new(Opcode::Label);
        start.dst = Some(start_label);
        start.flags |= InstrFlags::LABEL_NOJUMP;
        ml.ctx.arena.emit(&mut fs.body, start);
        if ml.isa() == crate::isa::IsaKind::P2 {
            // the cached window is assembled as if at cog address 0
            let zero = ml.ctx.pool.get(OperandData::ImmInt(0));
            let mut org = Ir::new(Opcode::Org);
            org.dst = Some(zero);
            ml.ctx.arena.emit(&mut fs.body, org);
        }
    }

    // label pre-pass: bind every identifier-only line
    for item in items {
        if let AsmItem::Label(name) = item {
            let op = label_operand(ml, fs, in_fcache);
            ml.bind_local_label(fs, name, op);
        }
    }

    let mut relpc = 0u32;
    let mut first: Option<IrHandle> = None;
    let mut need_end_label = in_fcache;
    let mut ptra = PtraTracker::default();

    for item in items {
        match item {
            AsmItem::Comment(text) => {
                let op = ml
                    .ctx
                    .pool
                    .get(OperandData::ImmString(text.clone().into_bytes()));
                let mut ir = Ir::new(Opcode::Comment);
                ir.dst = Some(op);
                ml.ctx.arena.emit(&mut fs.body, ir);
            }
            AsmItem::Label(name) => {
                let op = match fs.func.local_syms.lookup(name) {
                    Some(Symbol::LocalLabel { operand: Some(op) }) => *op,
                    _ => {
                        ml.error(format!("{} is not a label or is multiply defined", name));
                        break;
                    }
                };
                let mut ir = Ir::new(Opcode::Label);
                ir.dst = Some(op);
                ir.flags |= InstrFlags::KEEP_INSTR;
                ir.addr = relpc;
                let h = ml.ctx.arena.emit(&mut fs.body, ir);
                first.get_or_insert(h);
            }
            AsmItem::LongData(values) => {
                for v in values {
                    let Some(value) = v.const_value() else {
                        ml.error("data item is not constant");
                        continue;
                    };
                    let op = ml.ctx.pool.get(OperandData::ImmInt(value as i32));
                    let mut ir = Ir::new(Opcode::Long);
                    ir.dst = Some(op);
                    if flags.volatile_block {
                        ir.flags |= InstrFlags::KEEP_INSTR;
                    }
                    ml.ctx.arena.emit(&mut fs.body, ir);
                }
            }
            AsmItem::Instr(instr) => {
                let Some((mut ir, synth_ret)) = compile_instr(ml, fs, instr) else {
                    break;
                };
                if flags.volatile_block {
                    ir.flags |= InstrFlags::KEEP_INSTR;
                }
                ir.addr = relpc;
                let warn_ptra = ptra.note(ml, &ir);
                let converted_ret = ir.opc == Opcode::Ret;
                if converted_ret {
                    // a ret inside the block jumps to the end instead
                    ir.replace_opcode(Opcode::Jump, lookup_instr("jmp", ml.isa()));
                    ir.dst = Some(end_label);
                    need_end_label = true;
                }
                let h = ml.ctx.arena.emit(&mut fs.body, ir);
                first.get_or_insert(h);
                relpc += 1;
                if warn_ptra {
                    ml.warning("inline assembly modifies ptra");
                }
                if synth_ret {
                    let mut extra = Ir::new(Opcode::Jump);
                    extra.desc = lookup_instr("jmp", ml.isa());
                    extra.dst = Some(end_label);
                    ml.ctx.arena.emit(&mut fs.body, extra);
                    need_end_label = true;
                }
            }
        }
    }

    if in_fcache && relpc > ml.ctx.options.fcache_longs {
        ml.error("inline assembly too large to fit in fcache");
    }
    if need_end_label {
        let mut endl = Ir::new(Opcode::Label);
        endl.dst = Some(end_label);
        endl.flags |= InstrFlags::LABEL_NOJUMP;
        ml.ctx.arena.emit(&mut fs.body, endl);
        if in_fcache && ml.isa() == crate::isa::IsaKind::P2 {
            ml.ctx.arena.emit(&mut fs.body, Ir::new(Opcode::HubMode));
        }
    }

    // resolve $ / $±k operands against the block's own addresses
    if let Some(first) = first {
        fixup_pc_relative(ml, fs, first);
    }
    if let Some(start) = fcache_start {
        let mut cursor = first;
        while let Some(h) = cursor {
            ml.ctx.arena[h].fcache = Some(start);
            cursor = ml.ctx.arena.next(h);
        }
    }
}

fn fixup_pc_relative(ml: &mut ModuleLowering, fs: &mut FuncState, first: IrHandle) {
    let mut cursor = Some(first);
    while let Some(h) = cursor {
        cursor = ml.ctx.arena.next(h);
        if ml.ctx.arena[h].is_dummy() {
            continue;
        }
        let addr = ml.ctx.arena[h].addr;
        for slot in 0..2 {
            let op = if slot == 0 {
                ml.ctx.arena[h].dst
            } else {
                ml.ctx.arena[h].src
            };
            let Some(op) = op else { continue };
            let &OperandData::PcRelative(k) = ml.ctx.pool.data(op) else {
                continue;
            };
            let label = resolve_here_label(ml, fs, first, addr, k);
            if slot == 0 {
                ml.ctx.arena[h].dst = Some(label);
            } else {
                ml.ctx.arena[h].src = Some(label);
            }
        }
    }
}

/// Find the instruction at `addr + k` within the block and plant a fresh
/// label in front of it.
fn resolve_here_label(
    ml: &mut ModuleLowering,
    fs: &mut FuncState,
    first: IrHandle,
    addr: u32,
    k: i32,
) -> Operand {
    let target = addr as i64 + k as i64;
    if target >= 0 {
        let mut cursor = Some(first);
        while let Some(h) = cursor {
            if ml.ctx.arena[h].addr as i64 == target && !ml.ctx.arena[h].is_dummy() {
                let label = ml.ctx.new_cog_label();
                let mut lbl = Ir::new(Opcode::Label);
                lbl.dst = Some(label);
                lbl.addr = target as u32;
                let prev = ml.ctx.arena.prev(h);
                let lh = ml.ctx.arena.alloc(lbl);
                ml.ctx.arena.insert_after(&mut fs.body, prev, lh);
                return label;
            }
            cursor = ml.ctx.arena.next(h);
        }
    }
    if k < 0 {
        ml.error(format!(
            "pc relative address $ - {} in inline assembly is out of range",
            -k
        ));
    } else {
        ml.error(format!(
            "pc relative address $ + {} in inline assembly is out of range",
            k
        ));
    }
    ml.ctx.pool.get(OperandData::ImmInt(0))
}

/// Compile one instruction line. Returns the instruction and whether a
/// synthesized return must follow (`_ret_` condition encoding on P2).
fn compile_instr(
    ml: &mut ModuleLowering,
    fs: &mut FuncState,
    instr: &AsmInstr,
) -> Option<(Ir, bool)> {
    let isa = ml.isa();
    let Some(desc) = lookup_instr(&instr.mnemonic, isa) else {
        ml.error(format!("unknown instruction {}", instr.mnemonic));
        return None;
    };
    let mut ir = Ir::new(desc.opc);
    ir.desc = Some(desc);
    ir.flags = instr.flags;
    // split wcz into wc,wz so the optimizer sees individual flag writes
    if ir.flags.contains(InstrFlags::WCZ) {
        ir.flags.remove(InstrFlags::WCZ);
        ir.flags |= InstrFlags::WC | InstrFlags::WZ;
    }

    let cond_bits = ((instr.encoding >> isa.cond_shift()) & 0xf) as u8;
    let mut synth_ret = false;
    if cond_bits == 0 && isa == crate::isa::IsaKind::P2 {
        synth_ret = true;
    } else {
        match Cond::from_encoding(cond_bits) {
            Some(cond) => ir.cond = cond,
            None => {
                ml.error(format!(
                    "condition encoding {:04b} has no equivalent here",
                    cond_bits
                ));
            }
        }
    }

    for (i, asm_op) in instr.operands.iter().enumerate() {
        let mut effect = OperandEffect::default();
        let imm = asm_op.imm != ImmMarker::None;
        let op = compile_operand(ml, fs, &asm_op.expr, &mut effect, imm)?;
        if !imm && matches!(ml.ctx.pool.data(op), OperandData::CogLabel(_)) {
            effect.hints |= AddrHints::NO_IMM;
        }
        match i {
            0 => {
                ir.dst = Some(op);
                ir.dst_effect = effect;
            }
            1 => {
                ir.src = Some(op);
                ir.src_effect = effect;
            }
            2 => ir.src2 = Some(op),
            _ => {
                ml.error("too many operands to instruction");
                break;
            }
        }
        if let &OperandData::ImmInt(v) = ml.ctx.pool.data(op) {
            if !immediate_fits(v, desc.shape, isa, asm_op.imm == ImmMarker::Big) {
                ml.error(format!("immediate operand {} out of range", v));
            }
        }
    }
    Some((ir, synth_ret))
}

/// Compile one DAT-section instruction, outside any function.
pub(crate) fn build_dat_instr(ml: &mut ModuleLowering, instr: &AsmInstr) -> Option<Ir> {
    let isa = ml.isa();
    let Some(desc) = lookup_instr(&instr.mnemonic, isa) else {
        ml.error(format!("unknown instruction {}", instr.mnemonic));
        return None;
    };
    let mut ir = Ir::new(desc.opc);
    ir.desc = Some(desc);
    ir.flags = instr.flags;
    let cond_bits = ((instr.encoding >> isa.cond_shift()) & 0xf) as u8;
    if let Some(cond) = Cond::from_encoding(cond_bits) {
        ir.cond = cond;
    }
    for (i, asm_op) in instr.operands.iter().enumerate() {
        let op = match asm_op.expr.const_value() {
            Some(v) => ml.ctx.pool.get(OperandData::ImmInt(v as i32)),
            None => match &asm_op.expr {
                Expr::Ident(name) => match ml.module().symbols.lookup(name) {
                    Some(Symbol::DataLabel { operand }) => *operand,
                    _ => {
                        ml.error(format!("undefined symbol {}", name));
                        return None;
                    }
                },
                Expr::HwReg(name) => ml.ctx.pool.get(OperandData::HwReg(name.clone())),
                _ => {
                    ml.error("operand too complex for DAT instruction");
                    return None;
                }
            },
        };
        match i {
            0 => ir.dst = Some(op),
            1 => ir.src = Some(op),
            2 => ir.src2 = Some(op),
            _ => ml.error("too many operands to instruction"),
        }
    }
    Some(ir)
}

/// An integer reference in inline assembly: with `#` it is an immediate,
/// without it names the cog register at that numeric address.
fn immediate_ref(ml: &mut ModuleLowering, imm: bool, value: i64) -> Operand {
    if imm {
        ml.ctx.pool.get(OperandData::ImmInt(value as i32))
    } else {
        ml.ctx
            .pool
            .get(OperandData::HwReg(format!("{}", value as u32)))
    }
}

fn parse_window_index(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Compile an expression to an inline-asm operand.
fn compile_operand(
    ml: &mut ModuleLowering,
    fs: &mut FuncState,
    expr: &Expr,
    effect: &mut OperandEffect,
    imm: bool,
) -> Option<Operand> {
    // labels come in as zero-index array references; undo that
    if let Expr::ArrayRef(base, index) = expr {
        if index.const_value() == Some(0) {
            return compile_operand(ml, fs, base, effect, imm);
        }
    }

    match expr {
        Expr::Ident(_) | Expr::Result => {
            let name = match expr {
                Expr::Result => "result".to_string(),
                Expr::Ident(n) => n.clone(),
                _ => unreachable!(),
            };
            compile_identifier(ml, fs, &name, effect, imm)
        }
        Expr::Int(v) => Some(immediate_ref(ml, imm, *v)),
        Expr::AddrOf(inner) => {
            let r = compile_operand(ml, fs, inner, effect, imm)?;
            effect.hints |= AddrHints::FORCE_HUB;
            Some(r)
        }
        Expr::HwReg(name) => Some(ml.ctx.pool.get(OperandData::HwReg(name.clone()))),
        Expr::Catch(inner) => {
            let r = compile_operand(ml, fs, inner, effect, false)?;
            effect.hints |= AddrHints::FORCE_ABS;
            Some(r)
        }
        Expr::Here => Some(ml.ctx.pool.get(OperandData::PcRelative(0))),
        Expr::RangeRef(base, index) => {
            let Expr::HwReg(name) = base.as_ref() else {
                ml.error("bad ptra/ptrb expression");
                return Some(ml.ctx.pool.get(OperandData::ImmInt(0)));
            };
            match index.const_value() {
                Some(k) => effect.offset = k as i32,
                None => ml.error("ptra/ptrb offset must be constant"),
            }
            Some(ml.ctx.pool.get(OperandData::HwReg(name.clone())))
        }
        Expr::Unop(op, inner) => {
            let kind = match op {
                UnOp::PreInc => EffectKind::PreInc,
                UnOp::PreDec => EffectKind::PreDec,
                UnOp::PostInc => EffectKind::PostInc,
                UnOp::PostDec => EffectKind::PostDec,
                _ => {
                    if let Some(v) = expr.const_value() {
                        return Some(immediate_ref(ml, imm, v));
                    }
                    ml.error("operand too complex for inline assembly");
                    return None;
                }
            };
            if matches!(inner.as_ref(), Expr::HwReg(_)) {
                let r = compile_operand(ml, fs, inner, effect, false)?;
                effect.kind = kind;
                Some(r)
            } else {
                ml.error("pointer update requires a hardware register");
                None
            }
        }
        Expr::Binop(op, l, r) => {
            // $+k and $-k
            let sign = match op {
                crate::ast::Op::Add => 1,
                crate::ast::Op::Sub => -1,
                _ => 0,
            };
            if sign != 0 {
                if matches!(l.as_ref(), Expr::Here) {
                    if let Some(k) = r.const_value() {
                        return Some(
                            ml.ctx
                                .pool
                                .get(OperandData::PcRelative(sign * k as i32)),
                        );
                    }
                }
                if sign > 0 && matches!(r.as_ref(), Expr::Here) {
                    if let Some(k) = l.const_value() {
                        return Some(ml.ctx.pool.get(OperandData::PcRelative(k as i32)));
                    }
                }
            }
            if let Some(v) = expr.const_value() {
                return Some(immediate_ref(ml, imm, v));
            }
            ml.error("operand too complex for inline assembly");
            None
        }
        _ => {
            if let Some(v) = expr.const_value() {
                return Some(immediate_ref(ml, imm, v));
            }
            ml.error("operand too complex for inline assembly");
            None
        }
    }
}

fn compile_identifier(
    ml: &mut ModuleLowering,
    fs: &mut FuncState,
    name: &str,
    effect: &mut OperandEffect,
    imm: bool,
) -> Option<Operand> {
    let _ = effect;
    // local asm labels shadow everything
    if let Some(Symbol::LocalLabel { operand }) = fs.func.local_syms.lookup(name).cloned() {
        let op = match operand {
            Some(op) => op,
            None => {
                let op = label_operand(ml, fs, false);
                ml.bind_local_label(fs, name, op);
                op
            }
        };
        return Some(op);
    }

    let mut reg = None;
    match name {
        "objptr" => reg = Some(object_ptr(&mut ml.ctx.pool)),
        "sp" => reg = Some(stack_ptr(&mut ml.ctx.pool)),
        "__heap_ptr" => reg = Some(heap_ptr(&mut ml.ctx.pool)),
        _ => {}
    }
    if reg.is_none() {
        if let Some(rest) = name.strip_prefix("result") {
            if rest.len() == 1 {
                if let Some(n) = parse_window_index(rest) {
                    reg = Some(result_reg(&mut ml.ctx.pool, n));
                }
            }
        }
    }
    if reg.is_none() {
        if let Some(rest) = name.strip_prefix("arg") {
            if rest.len() == 2 {
                if let Some(n) = parse_window_index(rest) {
                    reg = Some(arg_reg(&mut ml.ctx.pool, n));
                }
            }
        }
    }
    if reg.is_none() && name.starts_with("builtin_") {
        return Some(ml.ctx.pool.get(OperandData::CogLabel(name.to_string())));
    }

    if reg.is_none() {
        if name == "result" {
            reg = Some(result_reg(&mut ml.ctx.pool, 0));
        } else if let Some(storage) = fs.frame.lookup(name).cloned() {
            match storage {
                LocalStorage::Register(r) => reg = Some(r),
                LocalStorage::Stack(_) => {
                    ml.error(format!(
                        "variable {} lives in memory and cannot be accessed in inline assembly",
                        name
                    ));
                    return Some(ml.ctx.pool.get(OperandData::ImmInt(0)));
                }
            }
        }
    }

    if reg.is_none() {
        match ml.module().symbols.lookup(name).cloned() {
            Some(Symbol::Constant(v)) => return Some(immediate_ref(ml, imm, v)),
            Some(Symbol::DataLabel { operand }) => {
                if !imm {
                    ml.error("must use an immediate with global labels in inline asm");
                }
                return Some(operand);
            }
            Some(Symbol::HwRegister(r)) => {
                return Some(ml.ctx.pool.get(OperandData::HwReg(r)));
            }
            Some(Symbol::Function(_)) => {
                if name == fs.func.name && fs.func.language == crate::ast::Language::Basic {
                    // BASIC names the function to mean its result
                    reg = Some(result_reg(&mut ml.ctx.pool, 0));
                } else {
                    ml.error(format!("symbol {} is not usable in inline asm", name));
                    return None;
                }
            }
            Some(_) => {
                ml.error(format!("symbol {} is not usable in inline asm", name));
                return None;
            }
            None => {
                ml.error(format!("undefined symbol {}", name));
                return Some(ml.ctx.pool.get(OperandData::ImmInt(0)));
            }
        }
    }

    let reg = reg.expect("register resolved above");
    if imm {
        ml.warning("using # on registers in inline assembly may confuse the optimizer");
        return Some(ml.ctx.pool.get(OperandData::CogPtr(reg)));
    }
    Some(reg)
}
