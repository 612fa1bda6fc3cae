//! Register and resource assignment.
//!
//! The fast register file dedicates a window of registers to arguments
//! (`arg00`, `arg01`, ...) and results (`result0`, `result1`, ...); locals
//! and compiler temporaries become per-function cog registers unless the
//! function is stack-resident (stack calling convention, or a local had its
//! address taken), in which case they live in a hub stack frame addressed
//! off `sp`.
//!
//! Preserved registers are computed per function as the intersection of its
//! write set with the callee-saved set of its convention; recursive
//! functions additionally push every preserved register around call sites.

use crate::ast::{CodePlacement, Function};
use crate::context::Options;
use crate::ir::{Ir, IrArena, IrList, Opcode, Operand, OperandData, OperandPool};
use crate::isa::find_instr_for_opc;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Number of argument registers in the window.
pub const MAX_ARG_REGS: u32 = 8;
/// Number of result registers in the window.
pub const MAX_RESULT_REGS: u32 = 4;

/// How a function receives arguments and returns results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallConv {
    /// Arguments and results in the register windows; native call.
    #[default]
    FastCall,
    /// Arguments and results on the hub stack.
    StackCall,
}

/// The `n`th argument register.
pub fn arg_reg(pool: &mut OperandPool, n: u32) -> Operand {
    debug_assert!(n < MAX_ARG_REGS);
    pool.get(OperandData::LocalReg(format!("arg{:02}", n)))
}

/// The `n`th result register.
pub fn result_reg(pool: &mut OperandPool, n: u32) -> Operand {
    debug_assert!(n < MAX_RESULT_REGS);
    pool.get(OperandData::LocalReg(format!("result{}", n)))
}

/// The software stack pointer.
pub fn stack_ptr(pool: &mut OperandPool) -> Operand {
    pool.get(OperandData::LocalReg("sp".to_string()))
}

/// The frame pointer for stack-resident functions.
pub fn frame_ptr(pool: &mut OperandPool) -> Operand {
    pool.get(OperandData::LocalReg("fp".to_string()))
}

/// The register holding the current object's data base.
pub fn object_ptr(pool: &mut OperandPool) -> Operand {
    pool.get(OperandData::LocalReg("objptr".to_string()))
}

/// The register holding the heap pointer.
pub fn heap_ptr(pool: &mut OperandPool) -> Operand {
    pool.get(OperandData::LocalReg("__heap_ptr".to_string()))
}

/// The cog register backing local variable `var` of function `func`.
pub fn local_reg(pool: &mut OperandPool, func: &str, var: &str) -> Operand {
    pool.get(OperandData::LocalReg(format!("_{}_{}", func, var)))
}

/// Allocation state for the temporary-register window of one function.
#[derive(Clone, Debug, Default)]
pub struct TempAlloc {
    cur: u32,
    max: u32,
}

impl TempAlloc {
    /// Fresh state with no temporaries live.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next free temporary register.
    pub fn alloc(&mut self, pool: &mut OperandPool) -> Operand {
        self.cur += 1;
        if self.cur > self.max {
            self.max = self.cur;
        }
        pool.get(OperandData::TempReg(format!("_tmp{:03}_", self.cur)))
    }

    /// Release temporaries back down to `mark` (a value previously
    /// returned by [`TempAlloc::mark`]).
    pub fn free_to(&mut self, mark: u32) {
        self.cur = mark;
    }

    /// Remember the current allocation level.
    pub fn mark(&self) -> u32 {
        self.cur
    }

    /// The high-water mark, for sizing the window.
    pub fn high_water(&self) -> u32 {
        self.max
    }
}

/// Where one local variable lives.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalStorage {
    /// A dedicated cog register.
    Register(Operand),
    /// A hub stack slot at this byte offset from the frame base.
    Stack(u32),
}

/// The storage map for one function's parameters and locals.
pub struct FrameLayout {
    slots: HashMap<String, LocalStorage>,
    /// Total hub stack bytes needed, rounded up to a long boundary.
    pub frame_size: u32,
    /// The convention in force.
    pub convention: CallConv,
}

impl FrameLayout {
    /// Where `name` lives, if it is a parameter or local.
    pub fn lookup(&self, name: &str) -> Option<&LocalStorage> {
        self.slots.get(name)
    }
}

/// Decide the calling convention for a function.
pub fn call_convention(func: &Function) -> CallConv {
    if func.is_recursive && func.local_address_taken {
        CallConv::StackCall
    } else {
        CallConv::FastCall
    }
}

/// Assign storage to every parameter and local of `func`.
///
/// Fast-call functions whose locals never escape keep everything in cog
/// registers; otherwise the frame goes onto the hub stack.
pub fn assign_locals(pool: &mut OperandPool, func: &Function, conv: CallConv) -> FrameLayout {
    let mut slots = HashMap::new();
    let stack_resident = conv == CallConv::StackCall || func.local_address_taken;
    let mut offset = 0u32;
    for p in func.params.iter().chain(func.locals.iter()) {
        if stack_resident {
            slots.insert(p.name.clone(), LocalStorage::Stack(offset));
            offset += (p.ty.size() + 3) & !3;
        } else {
            let reg = local_reg(pool, &func.name, &p.name);
            slots.insert(p.name.clone(), LocalStorage::Register(reg));
        }
    }
    FrameLayout {
        slots,
        frame_size: (offset + 3) & !3,
        convention: conv,
    }
}

/// Decide where a function's code goes: an explicit mark wins, then an
/// escaping local forces hub residency, then the cog budget.
pub fn decide_placement(
    func: &Function,
    body_longs: u32,
    default: CodePlacement,
    options: &Options,
) -> CodePlacement {
    if let Some(p) = func.explicit_placement {
        return p;
    }
    if func.local_address_taken {
        return CodePlacement::Hub;
    }
    if body_longs > options.cog_code_budget {
        return CodePlacement::Hub;
    }
    default
}

/// Compute the registers `func`'s body writes that belong to its
/// callee-saved set: its own locals, arguments, and temporaries. Result
/// registers are excluded; they carry values back to the caller. The
/// result is deduplicated and in first-write order, so output is
/// deterministic.
pub fn compute_preserved(
    arena: &IrArena,
    body: &IrList,
    pool: &OperandPool,
    func_name: &str,
) -> SmallVec<[Operand; 8]> {
    let prefix = format!("_{}_", func_name);
    let mut saved: SmallVec<[Operand; 8]> = SmallVec::new();
    for h in arena.iter(body) {
        let ir = &arena[h];
        let writes_dst = match ir.opc {
            Opcode::Cmp | Opcode::Cmps | Opcode::Test => false,
            op => find_instr_for_opc(op).is_some(),
        };
        if !writes_dst {
            continue;
        }
        let Some(dst) = ir.dst else { continue };
        let callee_saved = match pool.data(dst) {
            OperandData::LocalReg(name) => {
                name.starts_with(&prefix) || name.starts_with("arg")
            }
            OperandData::TempReg(_) => true,
            _ => false,
        };
        if callee_saved && !saved.contains(&dst) {
            saved.push(dst);
        }
    }
    saved
}

/// Emit pushes of `regs` to the software stack before a recursive call.
pub fn push_registers(
    arena: &mut IrArena,
    list: &mut IrList,
    pool: &mut OperandPool,
    regs: &[Operand],
) {
    let sp = stack_ptr(pool);
    for &reg in regs {
        let mut wr = Ir::new(Opcode::Wrlong);
        wr.desc = find_instr_for_opc(Opcode::Wrlong);
        wr.dst = Some(reg);
        wr.src = Some(sp);
        arena.emit(list, wr);
        let mut add = Ir::new(Opcode::Add);
        add.desc = find_instr_for_opc(Opcode::Add);
        add.dst = Some(sp);
        add.src = Some(pool.imm(4));
        arena.emit(list, add);
    }
}

/// Emit pops of `regs` (in reverse order) after a recursive call.
pub fn pop_registers(
    arena: &mut IrArena,
    list: &mut IrList,
    pool: &mut OperandPool,
    regs: &[Operand],
) {
    let sp = stack_ptr(pool);
    for &reg in regs.iter().rev() {
        let mut sub = Ir::new(Opcode::Sub);
        sub.desc = find_instr_for_opc(Opcode::Sub);
        sub.dst = Some(sp);
        sub.src = Some(pool.imm(4));
        arena.emit(list, sub);
        let mut rd = Ir::new(Opcode::Rdlong);
        rd.desc = find_instr_for_opc(Opcode::Rdlong);
        rd.dst = Some(reg);
        rd.src = Some(sp);
        arena.emit(list, rd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Language;
    use crate::types::Type;

    #[test]
    fn register_window_names() {
        let mut pool = OperandPool::new();
        let a = arg_reg(&mut pool, 0);
        assert_eq!(pool.data(a).name(), Some("arg00"));
        let r = result_reg(&mut pool, 1);
        assert_eq!(pool.data(r).name(), Some("result1"));
    }

    #[test]
    fn temp_window_reuses_after_free() {
        let mut pool = OperandPool::new();
        let mut temps = TempAlloc::new();
        let mark = temps.mark();
        let t1 = temps.alloc(&mut pool);
        let _t2 = temps.alloc(&mut pool);
        temps.free_to(mark);
        let t3 = temps.alloc(&mut pool);
        assert_eq!(t1, t3);
        assert_eq!(temps.high_water(), 2);
    }

    #[test]
    fn locals_go_to_registers_until_address_taken() {
        let mut pool = OperandPool::new();
        let mut f = crate::ast::Function::new("blink", Language::Spin);
        f.locals.push(crate::ast::Param {
            name: "n".to_string(),
            ty: Type::long(),
        });
        let layout = assign_locals(&mut pool, &f, CallConv::FastCall);
        assert!(matches!(
            layout.lookup("n"),
            Some(LocalStorage::Register(_))
        ));
        assert_eq!(layout.frame_size, 0);

        f.local_address_taken = true;
        let layout = assign_locals(&mut pool, &f, CallConv::FastCall);
        assert_eq!(layout.lookup("n"), Some(&LocalStorage::Stack(0)));
        assert_eq!(layout.frame_size, 4);
    }

    #[test]
    fn placement_decision_order() {
        let options = Options::default();
        let mut f = crate::ast::Function::new("f", Language::Spin);
        assert_eq!(
            decide_placement(&f, 10, CodePlacement::Cog, &options),
            CodePlacement::Cog
        );
        assert_eq!(
            decide_placement(&f, options.cog_code_budget + 1, CodePlacement::Cog, &options),
            CodePlacement::Hub
        );
        f.local_address_taken = true;
        assert_eq!(
            decide_placement(&f, 10, CodePlacement::Cog, &options),
            CodePlacement::Hub
        );
        f.explicit_placement = Some(CodePlacement::Cog);
        assert_eq!(
            decide_placement(&f, 10_000, CodePlacement::Hub, &options),
            CodePlacement::Cog
        );
    }

    #[test]
    fn preserved_set_is_write_set_of_own_registers() {
        let mut pool = OperandPool::new();
        let mut arena = IrArena::new();
        let mut body = IrList::new();
        let n = local_reg(&mut pool, "f", "n");
        let other = pool.get(OperandData::LocalReg("_g_m".to_string()));
        let hw = pool.get(OperandData::HwReg("outa".to_string()));
        for (opc, dst, src) in [
            (Opcode::Mov, n, pool.imm(1)),
            (Opcode::Add, n, pool.imm(2)),
            (Opcode::Mov, hw, n),
            (Opcode::Cmp, other, n),
        ] {
            let mut ir = Ir::new(opc);
            ir.desc = find_instr_for_opc(opc);
            ir.dst = Some(dst);
            ir.src = Some(src);
            arena.emit(&mut body, ir);
        }
        let saved = compute_preserved(&arena, &body, &pool, "f");
        // n written twice but saved once; hw regs and flag-only compares
        // are not callee-saved
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0], n);
    }

    #[test]
    fn push_pop_are_symmetric() {
        let mut pool = OperandPool::new();
        let mut arena = IrArena::new();
        let mut list = IrList::new();
        let n = local_reg(&mut pool, "f", "n");
        push_registers(&mut arena, &mut list, &mut pool, &[n]);
        pop_registers(&mut arena, &mut list, &mut pool, &[n]);
        let opcodes: Vec<Opcode> = arena.iter(&list).map(|h| arena[h].opc).collect();
        assert_eq!(
            opcodes,
            vec![Opcode::Wrlong, Opcode::Add, Opcode::Sub, Opcode::Rdlong]
        );
    }
}
