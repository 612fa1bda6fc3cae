//! Lowering from typed ASTs to the machine IR.
//!
//! One [`compile_module`] call turns a registered module into a single IR
//! list: the functions in parse order (cog-resident code first, then an
//! `orgh` switch and the hub-resident code), followed by the data section
//! (immediate pool, string literals, and the module's DAT block).
//!
//! Each function is lowered into header/body/epilogue sublists and spliced
//! into the module list; the body keeps its shape so the inliner can reuse
//! it. Code placement is decided before any body is lowered so that call
//! sites always know which region their callee lives in.

pub mod inline_asm;

use crate::ast::{
    CodePlacement, DatItem, Function, Module, ModuleId, Op, Stmt, Symbol, UnOp,
};
use crate::context::CompileContext;
use crate::diag::{CodegenError, CodegenResult, SourceLoc};
use crate::ir::{Cond, Ir, IrList, Opcode, Operand, OperandData};
use crate::isa::{find_instr_for_opc, IsaKind, SMALL_IMM_LIMIT};
use crate::regalloc::{
    arg_reg, assign_locals, call_convention, compute_preserved, decide_placement, pop_registers,
    push_registers, result_reg, CallConv, FrameLayout, LocalStorage, TempAlloc,
};
use crate::typecheck::{Helper, TypeCheck, TypeEnv, TypedExpr};
use crate::types::Type;
use smallvec::SmallVec;
use std::collections::HashMap;

/// The lowered form of one function.
pub struct LoweredFunction {
    /// Index into the module's function list.
    pub index: u32,
    /// Final code placement.
    pub placement: CodePlacement,
    /// Calling convention.
    pub convention: CallConv,
    /// Entry label.
    pub entry: Operand,
    /// Label the epilogue lives at.
    pub return_label: Operand,
    /// The function body, without the entry label and final return, so it
    /// is suitable for inlining.
    pub body: IrList,
    /// Registers the function must preserve for its caller.
    pub preserved: SmallVec<[Operand; 8]>,
    /// Hub stack bytes reserved for stack-resident locals.
    pub frame_size: u32,
    /// True when the inliner may substitute the body.
    pub inline_eligible: bool,
}

/// The lowered form of one module.
pub struct LoweredModule {
    /// The complete IR list: code then data.
    pub list: IrList,
    /// Per-function results, in parse order.
    pub functions: Vec<LoweredFunction>,
}

/// Rough size of a statement list in emitted longs, used for the placement
/// decision before any code exists. Deliberately conservative: every
/// statement costs a couple of longs plus one per nested statement.
fn estimate_longs(body: &[Stmt]) -> u32 {
    let mut n = 0;
    for s in body {
        n += 2;
        match s {
            Stmt::If {
                then_body,
                else_body,
                ..
            } => n += estimate_longs(then_body) + estimate_longs(else_body) + 2,
            Stmt::While { body, .. } => n += estimate_longs(body) + 2,
            Stmt::InlineAsm { items, .. } => n += items.len() as u32,
            _ => {}
        }
    }
    n
}

/// Per-function lowering state.
pub struct FuncState {
    /// The function being lowered (an owned copy; label bindings mutate
    /// its local symbol table).
    pub func: Function,
    /// Where its code goes.
    pub placement: CodePlacement,
    /// Its calling convention.
    pub convention: CallConv,
    /// Storage for parameters and locals.
    pub frame: FrameLayout,
    /// Temp-register window.
    pub temps: TempAlloc,
    /// The label the epilogue lives at.
    pub return_label: Operand,
    /// The body list under construction.
    pub body: IrList,
}

pub(crate) struct ModuleLowering<'a> {
    pub(crate) ctx: &'a mut CompileContext,
    module: Module,
    entries: HashMap<String, (Operand, CodePlacement)>,
    /// P1 immediate pool: value -> backing cog register.
    imm_pool: Vec<(Operand, i32)>,
    imm_pool_index: HashMap<i32, Operand>,
    /// String literals waiting for the data section.
    strings: Vec<(Operand, String)>,
    loc: SourceLoc,
}

/// Lower a registered module to IR. The returned list is ready for the
/// emitter; errors are counted in the context's diagnostics and reported
/// through the result.
pub fn compile_module(ctx: &mut CompileContext, id: ModuleId) -> CodegenResult<LoweredModule> {
    ctx.push_current(id);
    let module = ctx.module(id).clone();
    log::debug!("lowering module {}", module.basename);

    let mut ml = ModuleLowering {
        ctx,
        module,
        entries: HashMap::new(),
        imm_pool: Vec::new(),
        imm_pool_index: HashMap::new(),
        strings: Vec::new(),
        loc: SourceLoc::builtin(),
    };
    let lowered = ml.run();
    let errors = ml.ctx.diags.error_count();
    ml.ctx.pop_current();
    if errors > 0 {
        Err(CodegenError::Errors(errors))
    } else {
        Ok(lowered)
    }
}

impl<'a> ModuleLowering<'a> {
    fn run(&mut self) -> LoweredModule {
        // placement first, so every call site knows its callee's region
        let mut placements = Vec::new();
        for f in &self.module.functions {
            let est = estimate_longs(&f.body);
            let placement = decide_placement(
                f,
                est,
                self.module.default_placement,
                &self.ctx.options,
            );
            // degraded output publishes the wrapper stubs under the plain
            // names, so the code itself gets a pasm_ prefix
            let label_name =
                if self.ctx.options.output == crate::context::OutputMode::DegradedAsm {
                    format!("pasm_{}", f.name)
                } else {
                    f.name.clone()
                };
            let entry = match placement {
                CodePlacement::Cog => self.ctx.pool.get(OperandData::CogLabel(label_name)),
                CodePlacement::Hub => self.ctx.pool.get(OperandData::HubLabel(label_name)),
            };
            self.entries.insert(f.name.clone(), (entry, placement));
            placements.push((entry, placement));
        }

        let mut functions = Vec::new();
        let funcs: Vec<Function> = self.module.functions.clone();
        for (i, f) in funcs.into_iter().enumerate() {
            let (entry, placement) = placements[i];
            functions.push(self.lower_function(i as u32, f, entry, placement));
        }

        // assemble the module list: cog code, immediate pool, orgh, hub
        // code, then data
        let mut list = IrList::new();
        for lf in functions
            .iter()
            .filter(|lf| lf.placement == CodePlacement::Cog)
        {
            self.splice_function(&mut list, lf);
        }
        let imm_regs: std::collections::HashSet<Operand> =
            self.imm_pool.iter().map(|&(reg, _)| reg).collect();
        for (reg, value) in std::mem::take(&mut self.imm_pool) {
            let mut lbl = Ir::new(Opcode::Label);
            lbl.dst = Some(reg);
            self.ctx.arena.emit(&mut list, lbl);
            let mut data = Ir::new(Opcode::Long);
            data.dst = Some(self.ctx.pool.get(OperandData::ImmInt(value)));
            self.ctx.arena.emit(&mut list, data);
        }
        // every function-scoped register and temporary gets a cog long
        let regs: Vec<Operand> = self
            .ctx
            .pool
            .iter()
            .filter(|(op, data)| {
                !imm_regs.contains(op)
                    && matches!(data, OperandData::LocalReg(_) | OperandData::TempReg(_))
            })
            .map(|(op, _)| op)
            .collect();
        let zero = self.ctx.pool.get(OperandData::ImmInt(0));
        for reg in regs {
            let mut lbl = Ir::new(Opcode::Label);
            lbl.dst = Some(reg);
            self.ctx.arena.emit(&mut list, lbl);
            let mut data = Ir::new(Opcode::Long);
            data.dst = Some(zero);
            self.ctx.arena.emit(&mut list, data);
        }
        let have_hub = functions
            .iter()
            .any(|lf| lf.placement == CodePlacement::Hub);
        if have_hub || !self.module.dat_block.is_empty() || !self.strings.is_empty() {
            self.ctx.arena.emit(&mut list, Ir::new(Opcode::HubMode));
        }
        for lf in functions
            .iter()
            .filter(|lf| lf.placement == CodePlacement::Hub)
        {
            self.splice_function(&mut list, lf);
        }
        self.lower_data(&mut list);
        LoweredModule { list, functions }
    }

    fn splice_function(&mut self, list: &mut IrList, lf: &LoweredFunction) {
        let f = &self.module.functions[lf.index as usize];
        let mut comment = Ir::new(Opcode::Comment);
        comment.dst = Some(
            self.ctx
                .pool
                .get(OperandData::ImmString(f.name.clone().into_bytes())),
        );
        self.ctx.arena.emit(list, comment);
        let mut entry = Ir::new(Opcode::Label);
        entry.dst = Some(lf.entry);
        self.ctx.arena.emit(list, entry);
        self.ctx.arena.append_list(list, lf.body);
        let mut retlbl = Ir::new(Opcode::Label);
        retlbl.dst = Some(lf.return_label);
        self.ctx.arena.emit(list, retlbl);
        if lf.frame_size > 0 {
            // release the stack frame
            let sp = crate::regalloc::stack_ptr(&mut self.ctx.pool);
            let fp = crate::regalloc::frame_ptr(&mut self.ctx.pool);
            let mut tear = Ir::new(Opcode::Mov);
            tear.desc = find_instr_for_opc(Opcode::Mov);
            tear.dst = Some(sp);
            tear.src = Some(fp);
            self.ctx.arena.emit(list, tear);
        }
        self.ctx.arena.emit(list, Ir::new(Opcode::Ret));
    }

    fn lower_function(
        &mut self,
        index: u32,
        func: Function,
        entry: Operand,
        placement: CodePlacement,
    ) -> LoweredFunction {
        log::trace!("lowering function {}", func.name);
        let convention = call_convention(&func);
        let frame = assign_locals(&mut self.ctx.pool, &func, convention);
        let return_label = match placement {
            CodePlacement::Cog => self.ctx.new_cog_label(),
            CodePlacement::Hub => self.ctx.new_hub_label(),
        };
        let mut fs = FuncState {
            func,
            placement,
            convention,
            frame,
            temps: TempAlloc::new(),
            return_label,
            body: IrList::new(),
        };

        // stack-resident frames hang off fp; reserve the space up front
        let frame_size = fs.frame.frame_size;
        if frame_size > 0 {
            let fp = crate::regalloc::frame_ptr(&mut self.ctx.pool);
            let sp = crate::regalloc::stack_ptr(&mut self.ctx.pool);
            self.emit_op2(&mut fs, Opcode::Mov, fp, sp);
            let size = self.imm_operand(frame_size as i32);
            self.emit_op2(&mut fs, Opcode::Add, sp, size);
        }

        // parameters arrive in the argument window; move them home
        for (i, p) in fs.func.params.clone().iter().enumerate() {
            let src = arg_reg(&mut self.ctx.pool, i as u32);
            match fs.frame.lookup(&p.name).cloned() {
                Some(LocalStorage::Register(reg)) => {
                    self.emit_op2(&mut fs, Opcode::Mov, reg, src);
                }
                Some(LocalStorage::Stack(off)) => {
                    let addr = self.frame_slot_addr(&mut fs, off);
                    self.emit_op2(&mut fs, Opcode::Wrlong, src, addr);
                }
                None => {}
            }
        }

        let body = fs.func.body.clone();
        self.lower_stmts(&mut fs, &body);

        let preserved =
            compute_preserved(&self.ctx.arena, &fs.body, &self.ctx.pool, &fs.func.name);
        LoweredFunction {
            index,
            placement,
            convention,
            entry,
            return_label,
            body: fs.body,
            preserved,
            frame_size,
            inline_eligible: fs.func.inline_eligible,
        }
    }

    // ---- statements ----------------------------------------------------

    fn lower_stmts(&mut self, fs: &mut FuncState, stmts: &[Stmt]) {
        for s in stmts {
            self.lower_stmt(fs, s);
        }
    }

    fn lower_stmt(&mut self, fs: &mut FuncState, stmt: &Stmt) {
        let mark = fs.temps.mark();
        match stmt {
            Stmt::Comment(text) => {
                let op = self
                    .ctx
                    .pool
                    .get(OperandData::ImmString(text.clone().into_bytes()));
                let mut ir = Ir::new(Opcode::Comment);
                ir.dst = Some(op);
                self.ctx.arena.emit(&mut fs.body, ir);
            }
            Stmt::Expr(e) => {
                let te = self.check(fs, e);
                self.lower_expr(fs, &te);
            }
            Stmt::Assign(dst, src) => {
                let tdst = self.check(fs, dst);
                let tsrc = self.check(fs, src);
                let tsrc = {
                    let mut tc = TypeCheck::new(&mut self.ctx.diags, self.loc.clone());
                    tc.coerce_assign(&tdst, tsrc)
                };
                self.lower_assign(fs, &tdst, &tsrc);
            }
            Stmt::Return(values) => {
                for (i, v) in values.iter().enumerate() {
                    let tv = self.check(fs, v);
                    let val = self.lower_expr(fs, &tv);
                    let dst = result_reg(&mut self.ctx.pool, i as u32);
                    self.emit_op2(fs, Opcode::Mov, dst, val);
                }
                let ret = fs.return_label;
                self.emit_jump(fs, Cond::True, ret);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let tcond = self.check(fs, cond);
                let else_label = self.new_code_label(fs);
                self.branch_if_false(fs, &tcond, else_label);
                self.lower_stmts(fs, then_body);
                if else_body.is_empty() {
                    self.emit_label(fs, else_label);
                } else {
                    let end_label = self.new_code_label(fs);
                    self.emit_jump(fs, Cond::True, end_label);
                    self.emit_label(fs, else_label);
                    self.lower_stmts(fs, else_body);
                    self.emit_label(fs, end_label);
                }
            }
            Stmt::While { cond, body } => {
                let top = self.new_code_label(fs);
                let end = self.new_code_label(fs);
                self.emit_label(fs, top);
                let tcond = self.check(fs, cond);
                self.branch_if_false(fs, &tcond, end);
                self.lower_stmts(fs, body);
                self.emit_jump(fs, Cond::True, top);
                self.emit_label(fs, end);
            }
            Stmt::InlineAsm { items, flags } => {
                inline_asm::compile_inline_asm(self, fs, items, *flags);
            }
        }
        fs.temps.free_to(mark);
    }

    fn check(&mut self, fs: &FuncState, e: &crate::ast::Expr) -> TypedExpr {
        let env = TypeEnv {
            func: Some(&fs.func),
            module: &self.module,
        };
        let mut tc = TypeCheck::new(&mut self.ctx.diags, self.loc.clone());
        tc.check_expr(&env, e)
    }

    // ---- expression lowering -------------------------------------------

    /// Lower `e` to an operand, emitting whatever instructions it takes.
    pub(crate) fn lower_expr(&mut self, fs: &mut FuncState, e: &TypedExpr) -> Operand {
        match e {
            TypedExpr::Int { value, .. } => self.imm_operand(*value as i32),
            TypedExpr::Float { value, .. } => {
                // floats travel as their 32-bit bit pattern
                self.imm_operand((*value as f32).to_bits() as i32)
            }
            TypedExpr::Str { value } => self.string_literal(value),
            TypedExpr::HwReg { name } => self.ctx.pool.get(OperandData::HwReg(name.clone())),
            TypedExpr::Var { name, .. } => self.var_operand(fs, name),
            TypedExpr::Cast { to, inner } => self.lower_cast(fs, to, inner),
            TypedExpr::Binop { op, ty, lhs, rhs } => self.lower_binop(fs, *op, ty, lhs, rhs),
            TypedExpr::Unop { op, inner, .. } => self.lower_unop(fs, *op, inner),
            TypedExpr::Compare { op, unsigned, lhs, rhs } => {
                let cond = self.lower_condition(fs, *op, *unsigned, lhs, rhs);
                // materialize the flag result as 0/1
                let t = fs.temps.alloc(&mut self.ctx.pool);
                let zero = self.imm_operand(0);
                self.emit_op2(fs, Opcode::Mov, t, zero);
                let one = self.imm_operand(1);
                let h = self.emit_op2(fs, Opcode::Mov, t, one);
                self.ctx.arena[h].cond = cond;
                t
            }
            TypedExpr::Helper { helper, args, .. } => {
                let target = self
                    .ctx
                    .pool
                    .get(OperandData::CogLabel(helper.symbol().to_string()));
                self.lower_call_common(fs, target, args, false)
            }
            TypedExpr::Call { name, args, .. } => {
                let (target, _) = match self.entries.get(name) {
                    Some(&e) => e,
                    None => {
                        self.ctx.diags.error(
                            self.loc.clone(),
                            format!("call to unknown function {}", name),
                        );
                        return self.imm_operand(0);
                    }
                };
                let recursive = fs.func.is_recursive || name == &fs.func.name;
                self.lower_call_common(fs, target, args, recursive)
            }
            TypedExpr::AddrOf { inner, .. } => self.lower_addrof(fs, inner),
            TypedExpr::Deref { inner, ty } => {
                let addr = self.lower_expr(fs, inner);
                self.load_memory(fs, ty.size(), addr)
            }
            TypedExpr::Index { base, index, ty } => {
                let addr = self.element_addr(fs, base, index, ty.size());
                self.load_memory(fs, ty.size(), addr)
            }
        }
    }

    /// An integer immediate, taking the P1 immediate pool into account:
    /// values that do not fit the 9-bit field become labeled cog longs.
    pub(crate) fn imm_operand(&mut self, value: i32) -> Operand {
        if (0..SMALL_IMM_LIMIT).contains(&value) || self.ctx.options.isa.has_big_immediates() {
            return self.ctx.pool.get(OperandData::ImmInt(value));
        }
        if let Some(&reg) = self.imm_pool_index.get(&value) {
            return reg;
        }
        let name = if value < 0 {
            format!("imm_n{}_", (value as i64).unsigned_abs())
        } else {
            format!("imm_{}_", value)
        };
        let reg = self.ctx.pool.get(OperandData::LocalReg(name));
        self.imm_pool.push((reg, value));
        self.imm_pool_index.insert(value, reg);
        reg
    }

    fn string_literal(&mut self, value: &str) -> Operand {
        let label = self.ctx.new_hub_label();
        self.strings.push((label, value.to_string()));
        label
    }

    fn var_operand(&mut self, fs: &mut FuncState, name: &str) -> Operand {
        if name == "result" {
            return result_reg(&mut self.ctx.pool, 0);
        }
        match fs.frame.lookup(name).cloned() {
            Some(LocalStorage::Register(reg)) => reg,
            Some(LocalStorage::Stack(off)) => {
                let addr = self.frame_slot_addr(fs, off);
                self.load_memory(fs, 4, addr)
            }
            None => match self.module.symbols.lookup(name) {
                Some(Symbol::Constant(v)) => {
                    let v = *v as i32;
                    self.imm_operand(v)
                }
                Some(Symbol::DataLabel { operand }) => *operand,
                Some(Symbol::HwRegister(reg)) => {
                    self.ctx.pool.get(OperandData::HwReg(reg.clone()))
                }
                _ => {
                    // module variable: objptr-relative hub storage
                    self.module_var_addr(fs, name)
                }
            },
        }
    }

    fn module_var_addr(&mut self, fs: &mut FuncState, name: &str) -> Operand {
        let mut offset = 0u32;
        let mut found = None;
        for v in &self.module.var_block {
            if v.name == name {
                found = Some((offset, v.ty.size().min(4)));
                break;
            }
            offset += (v.ty.size() * v.count + 3) & !3;
        }
        let Some((offset, size)) = found else {
            self.ctx
                .diags
                .error(self.loc.clone(), format!("undefined symbol {}", name));
            return self.imm_operand(0);
        };
        let objptr = crate::regalloc::object_ptr(&mut self.ctx.pool);
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, objptr);
        if offset > 0 {
            let off = self.imm_operand(offset as i32);
            self.emit_op2(fs, Opcode::Add, t, off);
        }
        self.load_memory(fs, size, t)
    }

    fn frame_slot_addr(&mut self, fs: &mut FuncState, off: u32) -> Operand {
        let fp = crate::regalloc::frame_ptr(&mut self.ctx.pool);
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, fp);
        if off > 0 {
            let off = self.imm_operand(off as i32);
            self.emit_op2(fs, Opcode::Add, t, off);
        }
        t
    }

    fn load_memory(&mut self, fs: &mut FuncState, size: u32, addr: Operand) -> Operand {
        let opc = match size {
            1 => Opcode::Rdbyte,
            2 => Opcode::Rdword,
            _ => Opcode::Rdlong,
        };
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, opc, t, addr);
        t
    }

    fn store_memory(&mut self, fs: &mut FuncState, size: u32, value: Operand, addr: Operand) {
        let opc = match size {
            1 => Opcode::Wrbyte,
            2 => Opcode::Wrword,
            _ => Opcode::Wrlong,
        };
        self.emit_op2(fs, opc, value, addr);
    }

    fn lower_cast(&mut self, fs: &mut FuncState, to: &Type, inner: &TypedExpr) -> Operand {
        let from = inner.ty();
        let val = self.lower_expr(fs, inner);
        let to_size = to.size().min(4);
        let from_size = from.size().min(4);
        if to_size == from_size {
            return val;
        }
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, val);
        if to_size < from_size {
            // narrowing masks the low bytes
            let mask = if to_size == 1 { 0xff } else { 0xffff };
            let m = self.imm_operand(mask);
            self.emit_op2(fs, Opcode::And, t, m);
        } else {
            // widening: shift up then back down, arithmetically for
            // signed sources
            let bits = self.imm_operand((32 - from_size * 8) as i32);
            self.emit_op2(fs, Opcode::Shl, t, bits);
            let back = if from.is_unsigned() {
                Opcode::Shr
            } else {
                Opcode::Sar
            };
            self.emit_op2(fs, back, t, bits);
        }
        t
    }

    fn lower_binop(
        &mut self,
        fs: &mut FuncState,
        op: Op,
        ty: &Type,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
    ) -> Operand {
        // 32-bit division and modulus go through the cog division routine
        if op == Op::Div || op == Op::Mod {
            return self.lower_divide(fs, op, ty, lhs, rhs);
        }
        let l = self.lower_expr(fs, lhs);
        let r = self.lower_expr(fs, rhs);
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, l);
        let opc = match op {
            Op::Add => Opcode::Add,
            Op::Sub => Opcode::Sub,
            Op::Mul => {
                if ty.is_unsigned() {
                    Opcode::Mulu
                } else {
                    Opcode::Muls
                }
            }
            Op::And => Opcode::And,
            Op::Or => Opcode::Or,
            Op::Xor => Opcode::Xor,
            Op::Shl => Opcode::Shl,
            Op::Shr => Opcode::Shr,
            Op::Sar => Opcode::Sar,
            _ => {
                self.ctx.diags.internal(
                    self.loc.clone(),
                    format!("operator {:?} survived type checking", op),
                );
                Opcode::Add
            }
        };
        self.emit_op2(fs, opc, t, r);
        t
    }

    fn lower_divide(
        &mut self,
        fs: &mut FuncState,
        op: Op,
        ty: &Type,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
    ) -> Operand {
        let routine = if ty.is_unsigned() {
            "unsdivide_"
        } else {
            "divide_"
        };
        let target = self
            .ctx
            .pool
            .get(OperandData::CogLabel(routine.to_string()));
        let l = self.lower_expr(fs, lhs);
        let r = self.lower_expr(fs, rhs);
        let a0 = arg_reg(&mut self.ctx.pool, 0);
        let a1 = arg_reg(&mut self.ctx.pool, 1);
        self.emit_op2(fs, Opcode::Mov, a0, l);
        self.emit_op2(fs, Opcode::Mov, a1, r);
        self.emit_call(fs, target);
        // quotient in result0, remainder in result1
        let res = result_reg(&mut self.ctx.pool, if op == Op::Div { 0 } else { 1 });
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, res);
        t
    }

    fn lower_unop(&mut self, fs: &mut FuncState, op: UnOp, inner: &TypedExpr) -> Operand {
        let val = self.lower_expr(fs, inner);
        let t = fs.temps.alloc(&mut self.ctx.pool);
        match op {
            UnOp::Neg => {
                self.emit_op2(fs, Opcode::Neg, t, val);
            }
            UnOp::Abs => {
                self.emit_op2(fs, Opcode::Abs, t, val);
            }
            UnOp::BitNot => {
                self.emit_op2(fs, Opcode::Mov, t, val);
                let m1 = self.imm_operand(-1);
                self.emit_op2(fs, Opcode::Xor, t, m1);
            }
            UnOp::PreInc | UnOp::PostInc => {
                let one = self.imm_operand(1);
                self.emit_op2(fs, Opcode::Add, val, one);
                self.emit_op2(fs, Opcode::Mov, t, val);
            }
            UnOp::PreDec | UnOp::PostDec => {
                let one = self.imm_operand(1);
                self.emit_op2(fs, Opcode::Sub, val, one);
                self.emit_op2(fs, Opcode::Mov, t, val);
            }
            UnOp::Sqrt => {
                self.ctx.diags.internal(
                    self.loc.clone(),
                    "sqrt survived type checking as a machine op",
                );
            }
        }
        t
    }

    fn lower_addrof(&mut self, fs: &mut FuncState, inner: &TypedExpr) -> Operand {
        match inner {
            TypedExpr::Var { name, .. } => match fs.frame.lookup(name).cloned() {
                Some(LocalStorage::Register(reg)) => {
                    self.ctx.pool.get(OperandData::CogPtr(reg))
                }
                Some(LocalStorage::Stack(off)) => self.frame_slot_addr(fs, off),
                None => {
                    if let Some(Symbol::DataLabel { operand }) = self.module.symbols.lookup(name)
                    {
                        self.ctx.pool.get(OperandData::HubPtr(*operand))
                    } else {
                        self.ctx.diags.error(
                            self.loc.clone(),
                            format!("cannot take the address of {}", name),
                        );
                        self.imm_operand(0)
                    }
                }
            },
            TypedExpr::Str { value } => {
                let label = self.string_literal(value);
                self.ctx.pool.get(OperandData::HubPtr(label))
            }
            TypedExpr::Index { base, index, ty } => {
                self.element_addr(fs, base, index, ty.size())
            }
            other => {
                // fall back to evaluating and re-wrapping; this covers
                // AddrOf(Deref(p)) which is just p
                if let TypedExpr::Deref { inner, .. } = other {
                    return self.lower_expr(fs, inner);
                }
                self.ctx
                    .diags
                    .error(self.loc.clone(), "expression is not addressable");
                self.imm_operand(0)
            }
        }
    }

    fn element_addr(
        &mut self,
        fs: &mut FuncState,
        base: &TypedExpr,
        index: &TypedExpr,
        elem_size: u32,
    ) -> Operand {
        let base_op = match base {
            TypedExpr::Var { name, .. } => {
                if let Some(Symbol::DataLabel { operand }) = self.module.symbols.lookup(name) {
                    self.ctx.pool.get(OperandData::HubPtr(*operand))
                } else {
                    self.lower_expr(fs, base)
                }
            }
            _ => self.lower_expr(fs, base),
        };
        let idx = self.lower_expr(fs, index);
        let t = fs.temps.alloc(&mut self.ctx.pool);
        self.emit_op2(fs, Opcode::Mov, t, idx);
        if elem_size > 1 {
            if elem_size.is_power_of_two() {
                let sh = self.imm_operand(elem_size.trailing_zeros() as i32);
                self.emit_op2(fs, Opcode::Shl, t, sh);
            } else {
                let sz = self.imm_operand(elem_size as i32);
                self.emit_op2(fs, Opcode::Mulu, t, sz);
            }
        }
        self.emit_op2(fs, Opcode::Add, t, base_op);
        t
    }

    fn lower_assign(&mut self, fs: &mut FuncState, dst: &TypedExpr, src: &TypedExpr) {
        // aggregate assignment is a struct copy
        if dst.ty().passed_by_reference() {
            let d = self.lower_addrof(fs, dst);
            let s = self.lower_addrof(fs, src);
            let size = self.imm_operand(dst.ty().size() as i32);
            let target = self
                .ctx
                .pool
                .get(OperandData::CogLabel(Helper::StructCopy.symbol().to_string()));
            let a0 = arg_reg(&mut self.ctx.pool, 0);
            let a1 = arg_reg(&mut self.ctx.pool, 1);
            let a2 = arg_reg(&mut self.ctx.pool, 2);
            self.emit_op2(fs, Opcode::Mov, a0, d);
            self.emit_op2(fs, Opcode::Mov, a1, s);
            self.emit_op2(fs, Opcode::Mov, a2, size);
            self.emit_call(fs, target);
            return;
        }
        match dst {
            TypedExpr::Var { name, .. } => match fs.frame.lookup(name).cloned() {
                Some(LocalStorage::Register(reg)) => {
                    let val = self.lower_expr(fs, src);
                    self.emit_op2(fs, Opcode::Mov, reg, val);
                }
                Some(LocalStorage::Stack(off)) => {
                    let val = self.lower_expr(fs, src);
                    let addr = self.frame_slot_addr(fs, off);
                    self.store_memory(fs, 4, val, addr);
                }
                None => {
                    if name == "result" {
                        let val = self.lower_expr(fs, src);
                        let reg = result_reg(&mut self.ctx.pool, 0);
                        self.emit_op2(fs, Opcode::Mov, reg, val);
                    } else {
                        self.ctx.diags.error(
                            self.loc.clone(),
                            format!("cannot assign to {}", name),
                        );
                    }
                }
            },
            TypedExpr::HwReg { name } => {
                let val = self.lower_expr(fs, src);
                let reg = self.ctx.pool.get(OperandData::HwReg(name.clone()));
                self.emit_op2(fs, Opcode::Mov, reg, val);
            }
            TypedExpr::Deref { inner, ty } => {
                let val = self.lower_expr(fs, src);
                let addr = self.lower_expr(fs, inner);
                self.store_memory(fs, ty.size(), val, addr);
            }
            TypedExpr::Index { base, index, ty } => {
                let val = self.lower_expr(fs, src);
                let addr = self.element_addr(fs, base, index, ty.size());
                self.store_memory(fs, ty.size(), val, addr);
            }
            _ => {
                self.ctx
                    .diags
                    .error(self.loc.clone(), "destination is not assignable");
            }
        }
    }

    fn lower_call_common(
        &mut self,
        fs: &mut FuncState,
        target: Operand,
        args: &[TypedExpr],
        save_registers: bool,
    ) -> Operand {
        let mut values = Vec::with_capacity(args.len());
        for a in args {
            values.push(self.lower_expr(fs, a));
        }
        for (i, v) in values.into_iter().enumerate() {
            let dst = arg_reg(&mut self.ctx.pool, i as u32);
            self.emit_op2(fs, Opcode::Mov, dst, v);
        }
        let saved = if save_registers {
            compute_preserved(&self.ctx.arena, &fs.body, &self.ctx.pool, &fs.func.name)
        } else {
            SmallVec::new()
        };
        if !saved.is_empty() {
            push_registers(&mut self.ctx.arena, &mut fs.body, &mut self.ctx.pool, &saved);
        }
        self.emit_call(fs, target);
        if !saved.is_empty() {
            pop_registers(&mut self.ctx.arena, &mut fs.body, &mut self.ctx.pool, &saved);
        }
        result_reg(&mut self.ctx.pool, 0)
    }

    /// Lower a condition and return the predicate under which it holds.
    fn lower_condition(
        &mut self,
        fs: &mut FuncState,
        op: Op,
        unsigned: bool,
        lhs: &TypedExpr,
        rhs: &TypedExpr,
    ) -> Cond {
        let l = self.lower_expr(fs, lhs);
        let r = self.lower_expr(fs, rhs);
        // the left side must be a register for the compare
        let lreg = match self.ctx.pool.data(l) {
            OperandData::ImmInt(_) | OperandData::ImmNamed(..) => {
                let t = fs.temps.alloc(&mut self.ctx.pool);
                self.emit_op2(fs, Opcode::Mov, t, l);
                t
            }
            _ => l,
        };
        let opc = if unsigned { Opcode::Cmp } else { Opcode::Cmps };
        let h = self.emit_op2(fs, opc, lreg, r);
        self.ctx.arena[h].flags |= crate::ir::InstrFlags::WC | crate::ir::InstrFlags::WZ;
        match op {
            Op::Eq => Cond::Eq,
            Op::Ne => Cond::Ne,
            Op::Lt => Cond::Lt,
            Op::Le => Cond::Le,
            Op::Gt => Cond::Gt,
            Op::Ge => Cond::Ge,
            _ => Cond::True,
        }
    }

    fn branch_if_false(&mut self, fs: &mut FuncState, cond: &TypedExpr, target: Operand) {
        match cond {
            TypedExpr::Compare { op, unsigned, lhs, rhs } => {
                let c = self.lower_condition(fs, *op, *unsigned, lhs, rhs);
                self.emit_jump(fs, c.invert(), target);
            }
            other => {
                let val = self.lower_expr(fs, other);
                let lreg = match self.ctx.pool.data(val) {
                    OperandData::ImmInt(_) | OperandData::ImmNamed(..) => {
                        let t = fs.temps.alloc(&mut self.ctx.pool);
                        self.emit_op2(fs, Opcode::Mov, t, val);
                        t
                    }
                    _ => val,
                };
                let zero = self.imm_operand(0);
                let h = self.emit_op2(fs, Opcode::Cmp, lreg, zero);
                self.ctx.arena[h].flags |= crate::ir::InstrFlags::WZ;
                self.emit_jump(fs, Cond::Eq, target);
            }
        }
    }

    // ---- small emit helpers --------------------------------------------

    pub(crate) fn emit_op2(
        &mut self,
        fs: &mut FuncState,
        opc: Opcode,
        dst: Operand,
        src: Operand,
    ) -> crate::ir::IrHandle {
        let mut ir = Ir::new(opc);
        ir.desc = find_instr_for_opc(opc);
        ir.dst = Some(dst);
        ir.src = Some(src);
        self.ctx.arena.emit(&mut fs.body, ir)
    }

    pub(crate) fn emit_label(&mut self, fs: &mut FuncState, label: Operand) {
        let mut ir = Ir::new(Opcode::Label);
        ir.dst = Some(label);
        self.ctx.arena.emit(&mut fs.body, ir);
    }

    fn emit_jump(&mut self, fs: &mut FuncState, cond: Cond, target: Operand) {
        let mut ir = Ir::new(Opcode::Jump);
        ir.desc = find_instr_for_opc(Opcode::Jump);
        ir.cond = cond;
        ir.dst = Some(target);
        self.ctx.arena.emit(&mut fs.body, ir);
    }

    fn emit_call(&mut self, fs: &mut FuncState, target: Operand) {
        let mut ir = Ir::new(Opcode::Call);
        ir.desc = find_instr_for_opc(Opcode::Call);
        ir.dst = Some(target);
        self.ctx.arena.emit(&mut fs.body, ir);
    }

    fn new_code_label(&mut self, fs: &FuncState) -> Operand {
        match fs.placement {
            CodePlacement::Cog => self.ctx.new_cog_label(),
            CodePlacement::Hub => self.ctx.new_hub_label(),
        }
    }

    // ---- module data ---------------------------------------------------

    fn lower_data(&mut self, list: &mut IrList) {
        // string literals first, then the DAT block
        for (label, text) in std::mem::take(&mut self.strings) {
            let mut lbl = Ir::new(Opcode::Label);
            lbl.dst = Some(label);
            self.ctx.arena.emit(list, lbl);
            let op = self.ctx.pool.get(OperandData::ImmString(text.into_bytes()));
            let mut data = Ir::new(Opcode::String);
            data.dst = Some(op);
            self.ctx.arena.emit(list, data);
            // terminating NUL goes out as its own byte
            let zero = self.ctx.pool.get(OperandData::ImmInt(0));
            let mut term = Ir::new(Opcode::Byte);
            term.dst = Some(zero);
            self.ctx.arena.emit(list, term);
        }

        if self.module.dat_block.is_empty() {
            return;
        }
        let dat_label = match self.module.dat_label {
            Some(l) => l,
            None => {
                let name = format!("_dat_{}_", self.module.basename);
                self.ctx.pool.get(OperandData::HubLabel(name))
            }
        };
        let mut lbl = Ir::new(Opcode::Label);
        lbl.dst = Some(dat_label);
        self.ctx.arena.emit(list, lbl);

        let items = self.module.dat_block.clone();
        for item in &items {
            self.lower_dat_item(list, item);
        }
    }

    fn lower_dat_item(&mut self, list: &mut IrList, item: &DatItem) {
        match item {
            DatItem::Label(name) => {
                let op = self.ctx.pool.get(OperandData::HubLabel(name.clone()));
                let mut ir = Ir::new(Opcode::Label);
                ir.dst = Some(op);
                self.ctx.arena.emit(list, ir);
            }
            DatItem::Bytes(values) | DatItem::Words(values) | DatItem::Longs(values) => {
                let opc = match item {
                    DatItem::Bytes(_) => Opcode::Byte,
                    DatItem::Words(_) => Opcode::Word,
                    _ => Opcode::Long,
                };
                for v in values {
                    let value = v.const_value().unwrap_or_else(|| {
                        self.ctx
                            .diags
                            .error(self.loc.clone(), "data item is not constant");
                        0
                    });
                    let op = self.ctx.pool.get(OperandData::ImmInt(value as i32));
                    let mut ir = Ir::new(opc);
                    ir.dst = Some(op);
                    self.ctx.arena.emit(list, ir);
                }
            }
            DatItem::Instr(instr) => {
                if let Some(ir) = inline_asm::build_dat_instr(self, instr) {
                    self.ctx.arena.emit(list, ir);
                }
            }
            DatItem::File { data, relocs } => {
                let label = self.ctx.new_hub_label();
                let blob = self
                    .ctx
                    .pool
                    .add_blob(data.clone(), relocs.iter().cloned().collect());
                let mut ir = Ir::new(Opcode::LabeledBlob);
                ir.dst = Some(label);
                ir.src = Some(blob);
                self.ctx.arena.emit(list, ir);
            }
            DatItem::Org(addr) => {
                let op = self.ctx.pool.get(OperandData::ImmInt(addr.unwrap_or(0) as i32));
                let mut ir = Ir::new(Opcode::Org);
                ir.dst = Some(op);
                self.ctx.arena.emit(list, ir);
            }
            DatItem::Res(n) => {
                let op = self.ctx.pool.get(OperandData::ImmInt(*n as i32));
                let mut ir = Ir::new(Opcode::Reserve);
                ir.dst = Some(op);
                self.ctx.arena.emit(list, ir);
            }
            DatItem::Fit(n) => {
                let op = self.ctx.pool.get(OperandData::ImmInt(*n as i32));
                let mut ir = Ir::new(Opcode::Fit);
                ir.dst = Some(op);
                self.ctx.arena.emit(list, ir);
            }
        }
    }

    pub(crate) fn isa(&self) -> IsaKind {
        self.ctx.options.isa
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }

    pub(crate) fn bind_local_label(&mut self, fs: &mut FuncState, name: &str, op: Operand) {
        fs.func
            .local_syms
            .insert(name.to_string(), Symbol::LocalLabel { operand: Some(op) });
    }

    pub(crate) fn error(&mut self, msg: impl Into<String>) {
        self.ctx.diags.error(self.loc.clone(), msg.into());
    }

    pub(crate) fn warning(&mut self, msg: impl Into<String>) {
        self.ctx.diags.warning(self.loc.clone(), msg.into());
    }
}
