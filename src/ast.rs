//! The contract with the source-language front ends.
//!
//! The lexers and parsers live outside this crate; what they hand us is a
//! [`Module`] per source file: a symbol table, a DAT block, a VAR block, and
//! a list of functions whose bodies are statement trees over [`Expr`].
//! Inline assembly arrives pre-tokenized as [`AsmItem`] sequences with the
//! raw instruction encodings attached.

use crate::ir::{Operand, Reloc};
use crate::types::Type;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Source language of a module or function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Language {
    /// The Pascal-like object language.
    Spin,
    /// The BASIC dialect.
    Basic,
    /// The C subset.
    C,
}

/// An opaque reference to a registered module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u32);

/// Where a function's code is placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodePlacement {
    /// The small register-addressable execution memory. Direct branches.
    #[default]
    Cog,
    /// The shared memory; on P1 the code is streamed by the LMM dispatcher.
    Hub,
}

/// What a name resolves to.
#[derive(Clone, Debug)]
pub enum Symbol {
    /// A function parameter (0-based position).
    Parameter {
        /// Position in the argument window.
        index: u32,
        /// Declared type.
        ty: Type,
    },
    /// A named function result (0-based position).
    ResultVar {
        /// Position in the result window.
        index: u32,
        /// Declared type.
        ty: Type,
    },
    /// A function-local variable.
    Local {
        /// Declared type.
        ty: Type,
    },
    /// A compiler temporary.
    Temp {
        /// Inferred type.
        ty: Type,
    },
    /// A compile-time integer constant.
    Constant(i64),
    /// A local label inside inline assembly. The operand is minted on
    /// first use by the embedder.
    LocalLabel {
        /// The bound label operand, once minted.
        operand: Option<Operand>,
    },
    /// A global data label from the module's DAT block.
    DataLabel {
        /// The label operand.
        operand: Operand,
    },
    /// A hardware register.
    HwRegister(String),
    /// A function of the current module (index into `Module::functions`).
    Function(u32),
    /// A sub-object instance.
    Object(ModuleId),
}

/// A lexically scoped symbol table. Scopes chain through the module DAG;
/// the chain itself is walked by the lowering code.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    map: HashMap<String, Symbol>,
}

impl SymbolTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`, replacing any previous binding in this scope.
    pub fn insert(&mut self, name: impl Into<String>, sym: Symbol) {
        self.map.insert(name.into(), sym);
    }

    /// Look `name` up in this scope only.
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.map.get(name)
    }

    /// Mutable lookup, used to bind local-label operands in place.
    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Symbol> {
        self.map.get_mut(name)
    }
}

/// Binary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `//` or `%`
    Mod,
    /// `&`
    And,
    /// `|`
    Or,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// `>>` (logical)
    Shr,
    /// `~>` (arithmetic)
    Sar,
    /// `==`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Float exponentiation.
    Power,
}

impl Op {
    /// True for the six comparison operators.
    pub fn is_comparison(self) -> bool {
        matches!(self, Op::Eq | Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge)
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    BitNot,
    /// Absolute value.
    Abs,
    /// Square root.
    Sqrt,
    /// `++x`
    PreInc,
    /// `--x`
    PreDec,
    /// `x++`
    PostInc,
    /// `x--`
    PostDec,
}

/// An expression tree node.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// String literal.
    Str(String),
    /// An identifier, resolved against the scope chain.
    Ident(String),
    /// A hardware register reference.
    HwReg(String),
    /// The `result` pseudo-variable.
    Result,
    /// `$`, the current assembly address (inline asm only).
    Here,
    /// Binary operation.
    Binop(Op, Box<Expr>, Box<Expr>),
    /// Unary operation.
    Unop(UnOp, Box<Expr>),
    /// Function call.
    Call {
        /// Callee name.
        name: String,
        /// Argument expressions.
        args: Vec<Expr>,
    },
    /// Array subscript.
    ArrayRef(Box<Expr>, Box<Expr>),
    /// `@x`, address of.
    AddrOf(Box<Expr>),
    /// Pointer dereference.
    Deref(Box<Expr>),
    /// `\x`; in inline assembly this forces absolute addressing.
    Catch(Box<Expr>),
    /// `reg[k]` range reference, used for `ptra[4]`-style operands.
    RangeRef(Box<Expr>, Box<Expr>),
    /// Explicit source-level cast.
    Cast(Type, Box<Expr>),
}

impl Expr {
    /// Fold this expression to a constant if it is one.
    pub fn const_value(&self) -> Option<i64> {
        match self {
            Expr::Int(v) => Some(*v),
            Expr::Unop(UnOp::Neg, inner) => inner.const_value().map(|v| v.wrapping_neg()),
            Expr::Unop(UnOp::BitNot, inner) => inner.const_value().map(|v| !v),
            Expr::Binop(op, l, r) => {
                let (l, r) = (l.const_value()?, r.const_value()?);
                match op {
                    Op::Add => Some(l.wrapping_add(r)),
                    Op::Sub => Some(l.wrapping_sub(r)),
                    Op::Mul => Some(l.wrapping_mul(r)),
                    Op::Div if r != 0 => Some(l.wrapping_div(r)),
                    Op::Mod if r != 0 => Some(l.wrapping_rem(r)),
                    Op::And => Some(l & r),
                    Op::Or => Some(l | r),
                    Op::Xor => Some(l ^ r),
                    Op::Shl => Some(l.wrapping_shl(r as u32)),
                    Op::Shr => Some(((l as u64).wrapping_shr(r as u32)) as i64),
                    Op::Sar => Some(l.wrapping_shr(r as u32)),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// How an inline-asm operand spelled its immediate marker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ImmMarker {
    /// No marker; a register reference.
    #[default]
    None,
    /// `#x`, a 9-bit immediate.
    Small,
    /// `##x`, a long immediate (P2 only).
    Big,
}

/// One operand of an inline-asm instruction.
#[derive(Clone, Debug)]
pub struct AsmOperand {
    /// The operand expression.
    pub expr: Expr,
    /// Its immediate marker.
    pub imm: ImmMarker,
}

/// An inline-asm instruction as delivered by the parser: the mnemonic, the
/// raw encoding (whose condition field the embedder decodes), and the
/// written-out operands and flag suffixes.
#[derive(Clone, Debug)]
pub struct AsmInstr {
    /// Assembler mnemonic.
    pub mnemonic: String,
    /// The raw instruction encoding, condition field included.
    pub encoding: u32,
    /// Operands in source order.
    pub operands: SmallVec<[AsmOperand; 3]>,
    /// `wc`/`wz`/`wcz`/`nr`/`wr` suffixes, as IR flag bits.
    pub flags: crate::ir::InstrFlags,
}

/// One line of an inline-assembly block.
#[derive(Clone, Debug)]
pub enum AsmItem {
    /// An identifier alone on a line: a local label definition.
    Label(String),
    /// An instruction.
    Instr(AsmInstr),
    /// A `long` data list.
    LongData(Vec<Expr>),
    /// A comment carried through.
    Comment(String),
}

/// Options on an inline-assembly block.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsmFlags {
    /// `asm const`: instructions must survive optimization untouched.
    pub volatile_block: bool,
    /// Request fcache placement for the block.
    pub fcache: bool,
}

/// A statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// Evaluate for side effects.
    Expr(Expr),
    /// Assignment, with full coercion checking.
    Assign(Expr, Expr),
    /// Return zero or more results.
    Return(Vec<Expr>),
    /// Two-way branch.
    If {
        /// Condition.
        cond: Expr,
        /// Taken when nonzero.
        then_body: Vec<Stmt>,
        /// Taken when zero.
        else_body: Vec<Stmt>,
    },
    /// Pre-tested loop.
    While {
        /// Loop condition.
        cond: Expr,
        /// Loop body.
        body: Vec<Stmt>,
    },
    /// An embedded assembly block.
    InlineAsm {
        /// The block's lines.
        items: Vec<AsmItem>,
        /// Block options.
        flags: AsmFlags,
    },
    /// A source comment to carry into the listing.
    Comment(String),
}

/// A named, typed slot: parameter, result or local.
#[derive(Clone, Debug)]
pub struct Param {
    /// Name.
    pub name: String,
    /// Declared type.
    pub ty: Type,
}

/// A function definition.
#[derive(Clone, Debug)]
pub struct Function {
    /// Name.
    pub name: String,
    /// Parameters in order.
    pub params: Vec<Param>,
    /// Local variables.
    pub locals: Vec<Param>,
    /// Result types; empty for subroutines.
    pub results: Vec<Type>,
    /// Public visibility (exported from the object).
    pub is_public: bool,
    /// Source language.
    pub language: Language,
    /// Placement forced in source, if any.
    pub explicit_placement: Option<CodePlacement>,
    /// True when the address of a local has been taken; forces the locals
    /// onto the stack.
    pub local_address_taken: bool,
    /// True when the inliner may substitute the body at call sites.
    pub inline_eligible: bool,
    /// True for directly or mutually recursive functions.
    pub is_recursive: bool,
    /// The body.
    pub body: Vec<Stmt>,
    /// Function-scope symbols (parameters, locals, asm labels).
    pub local_syms: SymbolTable,
}

impl Function {
    /// A function with the given name and no contents, Spin visibility
    /// defaults.
    pub fn new(name: impl Into<String>, language: Language) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            locals: Vec::new(),
            results: Vec::new(),
            is_public: true,
            language,
            explicit_placement: None,
            local_address_taken: false,
            inline_eligible: false,
            is_recursive: false,
            body: Vec::new(),
            local_syms: SymbolTable::new(),
        }
    }
}

/// One item of a module's DAT block.
#[derive(Clone, Debug)]
pub enum DatItem {
    /// A label definition.
    Label(String),
    /// `byte` data.
    Bytes(Vec<Expr>),
    /// `word` data.
    Words(Vec<Expr>),
    /// `long` data.
    Longs(Vec<Expr>),
    /// A pre-encoded instruction held in the DAT section.
    Instr(AsmInstr),
    /// An included binary file with relocations.
    File {
        /// Raw contents.
        data: Vec<u8>,
        /// Relocations in offset order.
        relocs: Vec<Reloc>,
    },
    /// `org` directive.
    Org(Option<u32>),
    /// `res` directive.
    Res(u32),
    /// `fit` directive.
    Fit(u32),
}

/// A variable declared in the module's VAR block.
#[derive(Clone, Debug)]
pub struct VarDecl {
    /// Name.
    pub name: String,
    /// Element type.
    pub ty: Type,
    /// Element count (1 for scalars).
    pub count: u32,
}

/// A parsed module (one source object).
#[derive(Clone, Debug)]
pub struct Module {
    /// File basename, used to key the registry.
    pub basename: String,
    /// Source language.
    pub language: Language,
    /// Module-scope symbols.
    pub symbols: SymbolTable,
    /// The DAT block.
    pub dat_block: Vec<DatItem>,
    /// The VAR block.
    pub var_block: Vec<VarDecl>,
    /// Instantiated sub-objects.
    pub sub_objects: Vec<ModuleId>,
    /// The functions, in parse order.
    pub functions: Vec<Function>,
    /// Final size of the variable section, filled by offset assignment.
    pub varsize: u32,
    /// Default code placement for functions of this module.
    pub default_placement: CodePlacement,
    /// Back-end scratch: the label introducing this module's data.
    pub dat_label: Option<Operand>,
}

impl Module {
    /// An empty module.
    pub fn new(basename: impl Into<String>, language: Language) -> Self {
        Self {
            basename: basename.into(),
            language,
            symbols: SymbolTable::new(),
            dat_block: Vec::new(),
            var_block: Vec::new(),
            sub_objects: Vec::new(),
            functions: Vec::new(),
            varsize: 0,
            default_placement: CodePlacement::Cog,
            dat_label: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_folding() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Int(3)),
            Box::new(Expr::Binop(
                Op::Shl,
                Box::new(Expr::Int(1)),
                Box::new(Expr::Int(4)),
            )),
        );
        assert_eq!(e.const_value(), Some(19));
        let div0 = Expr::Binop(Op::Div, Box::new(Expr::Int(1)), Box::new(Expr::Int(0)));
        assert_eq!(div0.const_value(), None);
        assert_eq!(Expr::Ident("x".into()).const_value(), None);
    }

    #[test]
    fn symbol_scoping() {
        let mut t = SymbolTable::new();
        t.insert("n", Symbol::Constant(7));
        assert!(matches!(t.lookup("n"), Some(Symbol::Constant(7))));
        assert!(t.lookup("m").is_none());
    }
}
