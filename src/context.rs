//! The compile context.
//!
//! Everything that would otherwise be a process-wide global lives here: the
//! module registry and the `current` module pointer, the diagnostics sink,
//! the operand pool, the IR arena, and the monotonic counters behind label
//! and fixup numbering. A single `CompileContext` is threaded through every
//! pass; compilation is single-threaded and no pass suspends.

use crate::ast::{Module, ModuleId};
use crate::diag::Diagnostics;
use crate::ir::{IrArena, Operand, OperandData, OperandPool};
use crate::isa::IsaKind;

/// How the back end should render the finished IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Assembler text for an assembler that understands the absolute-address
    /// operator `@@@`.
    Asm,
    /// Assembler text for a baseline assembler without `@@@`; absolute hub
    /// addresses are emitted as a fixup chain patched at program start, and
    /// a mailbox wrapper object is generated around the code.
    DegradedAsm,
    /// A raw machine image with the boot header.
    Image,
}

/// Compilation options fixed for the lifetime of a context.
#[derive(Clone, Debug)]
pub struct Options {
    /// Which ISA generation to target.
    pub isa: IsaKind,
    /// Output flavor.
    pub output: OutputMode,
    /// Size of the fcache window, in longs. Zero disables fcache.
    pub fcache_longs: u32,
    /// Budget, in instruction longs, above which a function defaulting to
    /// cog placement is moved to hub memory.
    pub cog_code_budget: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            isa: IsaKind::P1,
            output: OutputMode::Asm,
            fcache_longs: 64,
            cog_code_budget: 240,
        }
    }
}

/// Shared state for one compilation.
pub struct CompileContext {
    /// Compilation options.
    pub options: Options,
    /// Diagnostics sink.
    pub diags: Diagnostics,
    /// The interning pool for all operands.
    pub pool: OperandPool,
    /// The arena holding every IR instruction of the compilation.
    pub arena: IrArena,
    modules: Vec<Module>,
    current: Vec<ModuleId>,
    next_temp_label: u32,
    next_fixup: u32,
}

impl CompileContext {
    /// Create a fresh context.
    pub fn new(options: Options) -> Self {
        Self {
            options,
            diags: Diagnostics::new(),
            pool: OperandPool::new(),
            arena: IrArena::new(),
            modules: Vec::new(),
            current: Vec::new(),
            next_temp_label: 0,
            next_fixup: 0,
        }
    }

    /// Register a parsed module and return its id. If a module with the
    /// same basename is already registered, that one is returned instead,
    /// so parsing the same file twice is avoided.
    pub fn add_module(&mut self, module: Module) -> ModuleId {
        if let Some(id) = self.find_module(&module.basename) {
            return id;
        }
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(module);
        id
    }

    /// Look a module up by basename.
    pub fn find_module(&self, basename: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|m| m.basename == basename)
            .map(|i| ModuleId(i as u32))
    }

    /// The module currently being compiled.
    pub fn current(&self) -> Option<ModuleId> {
        self.current.last().copied()
    }

    /// Enter `id` as the current module. Every descent into a sub-module
    /// must be balanced with [`CompileContext::pop_current`].
    pub fn push_current(&mut self, id: ModuleId) {
        self.current.push(id);
    }

    /// Restore the previous current module.
    pub fn pop_current(&mut self) {
        self.current.pop();
    }

    /// Shared access to a module.
    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.0 as usize]
    }

    /// Mutable access to a module.
    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.0 as usize]
    }

    /// Mint a fresh temporary label name. The counter is monotonic for the
    /// whole compilation, so emitted text is deterministic.
    pub fn new_temp_label_name(&mut self) -> String {
        self.next_temp_label += 1;
        format!("LR__{:04}", self.next_temp_label)
    }

    /// Mint a new label operand in cog memory.
    pub fn new_cog_label(&mut self) -> Operand {
        let name = self.new_temp_label_name();
        self.pool.get(OperandData::CogLabel(name))
    }

    /// Mint a new label operand in hub memory.
    pub fn new_hub_label(&mut self) -> Operand {
        let name = self.new_temp_label_name();
        self.pool.get(OperandData::HubLabel(name))
    }

    /// Take the next fixup number for degraded-mode output.
    pub fn next_fixup_number(&mut self) -> u32 {
        self.next_fixup += 1;
        self.next_fixup
    }

    /// The fixup number most recently handed out, or 0 if none.
    pub fn last_fixup_number(&self) -> u32 {
        self.next_fixup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Language;

    #[test]
    fn module_registry_dedups_by_basename() {
        let mut ctx = CompileContext::new(Options::default());
        let a = ctx.add_module(Module::new("blinker", Language::Spin));
        let b = ctx.add_module(Module::new("blinker", Language::Spin));
        assert_eq!(a, b);
        let c = ctx.add_module(Module::new("serial", Language::Spin));
        assert_ne!(a, c);
    }

    #[test]
    fn current_module_nests() {
        let mut ctx = CompileContext::new(Options::default());
        let top = ctx.add_module(Module::new("top", Language::Spin));
        let sub = ctx.add_module(Module::new("sub", Language::Spin));
        ctx.push_current(top);
        ctx.push_current(sub);
        assert_eq!(ctx.current(), Some(sub));
        ctx.pop_current();
        assert_eq!(ctx.current(), Some(top));
    }

    #[test]
    fn temp_labels_are_monotonic() {
        let mut ctx = CompileContext::new(Options::default());
        assert_eq!(ctx.new_temp_label_name(), "LR__0001");
        assert_eq!(ctx.new_temp_label_name(), "LR__0002");
    }
}
