//! The type engine.
//!
//! Every AST expression is resolved to a type and rewritten into a *typed*
//! expression layer that sits between the untyped AST and the machine IR.
//! Coercions are explicit [`TypedExpr::Cast`] nodes, and every operation the
//! target cannot execute in one instruction becomes an explicit call into
//! the runtime helper library ([`Helper`]), so the whole coercion contract
//! is auditable by walking the typed tree.
//!
//! The promotion rules, in brief: floats contaminate (integer operands are
//! converted via `fromint`/`fromuns`, narrower floats widen to wider ones);
//! integer operands meet at `max(left, right, 4)` bytes; a common width of
//! 8 turns the operator into an `int64_*` helper call; unsignedness of
//! either side selects the unsigned division, modulus and right-shift
//! variants.

use crate::ast::{Expr, Function, Module, Op, Symbol, UnOp};
use crate::diag::{Diagnostics, SourceLoc};
use crate::types::{Type, LONG_SIZE};

/// The runtime helper library: every primitive the type engine may call.
/// The names are a data contract with the runtime; see the library headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Helper {
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatNeg,
    FloatAbs,
    FloatSqrt,
    FloatCmp,
    FloatFromInt,
    FloatFromUns,
    FloatToInt,
    FloatToDouble,
    DoubleAdd,
    DoubleSub,
    DoubleMul,
    DoubleDiv,
    DoubleNeg,
    DoubleAbs,
    DoubleSqrt,
    DoubleCmp,
    DoubleFromInt,
    DoubleFromUns,
    DoubleToInt,
    Int64Add,
    Int64Sub,
    Int64Muls,
    Int64Mulu,
    Int64Divs,
    Int64Divu,
    Int64Mods,
    Int64Modu,
    Int64Neg,
    Int64Cmps,
    Int64Cmpu,
    Int64Shl,
    Int64Shr,
    Int64Sar,
    Int64And,
    Int64Or,
    Int64Xor,
    Int64Signx,
    Int64Zerox,
    StringCmp,
    StringConcat,
    StructCopy,
    GcAllocManaged,
    GcFree,
    FuncptrCmp,
}

impl Helper {
    /// The runtime symbol this helper resolves to.
    pub fn symbol(self) -> &'static str {
        match self {
            Helper::FloatAdd => "float_add",
            Helper::FloatSub => "float_sub",
            Helper::FloatMul => "float_mul",
            Helper::FloatDiv => "float_div",
            Helper::FloatNeg => "float_neg",
            Helper::FloatAbs => "float_abs",
            Helper::FloatSqrt => "float_sqrt",
            Helper::FloatCmp => "float_cmp",
            Helper::FloatFromInt => "float_fromint",
            Helper::FloatFromUns => "float_fromuns",
            Helper::FloatToInt => "float_toint",
            Helper::FloatToDouble => "float_todouble",
            Helper::DoubleAdd => "double_add",
            Helper::DoubleSub => "double_sub",
            Helper::DoubleMul => "double_mul",
            Helper::DoubleDiv => "double_div",
            Helper::DoubleNeg => "double_neg",
            Helper::DoubleAbs => "double_abs",
            Helper::DoubleSqrt => "double_sqrt",
            Helper::DoubleCmp => "double_cmp",
            Helper::DoubleFromInt => "double_fromint",
            Helper::DoubleFromUns => "double_fromuns",
            Helper::DoubleToInt => "double_toint",
            Helper::Int64Add => "int64_add",
            Helper::Int64Sub => "int64_sub",
            Helper::Int64Muls => "int64_muls",
            Helper::Int64Mulu => "int64_mulu",
            Helper::Int64Divs => "int64_divs",
            Helper::Int64Divu => "int64_divu",
            Helper::Int64Mods => "int64_mods",
            Helper::Int64Modu => "int64_modu",
            Helper::Int64Neg => "int64_neg",
            Helper::Int64Cmps => "int64_cmps",
            Helper::Int64Cmpu => "int64_cmpu",
            Helper::Int64Shl => "int64_shl",
            Helper::Int64Shr => "int64_shr",
            Helper::Int64Sar => "int64_sar",
            Helper::Int64And => "int64_and",
            Helper::Int64Or => "int64_or",
            Helper::Int64Xor => "int64_xor",
            Helper::Int64Signx => "int64_signx",
            Helper::Int64Zerox => "int64_zerox",
            Helper::StringCmp => "string_cmp",
            Helper::StringConcat => "string_concat",
            Helper::StructCopy => "struct_copy",
            Helper::GcAllocManaged => "gc_alloc_managed",
            Helper::GcFree => "gc_free",
            Helper::FuncptrCmp => "funcptr_cmp",
        }
    }
}

/// A type-annotated expression. Coercions appear as `Cast` nodes; rewritten
/// operators appear as `Helper` calls.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedExpr {
    /// Integer constant.
    Int {
        /// The value.
        value: i64,
        /// The type, `Generic` for untyped literals.
        ty: Type,
    },
    /// Float constant.
    Float {
        /// The value.
        value: f64,
        /// `float()` or `double()`.
        ty: Type,
    },
    /// String constant.
    Str {
        /// The bytes.
        value: String,
    },
    /// A resolved variable reference.
    Var {
        /// Name as the lowering pass will look it up.
        name: String,
        /// Resolved type.
        ty: Type,
    },
    /// A hardware register, typed as unsigned long.
    HwReg {
        /// Register name.
        name: String,
    },
    /// Width or representation change. The lowering pass turns integer
    /// widenings into sign/zero extension and narrowings into masking.
    Cast {
        /// Target type.
        to: Type,
        /// Operand.
        inner: Box<TypedExpr>,
    },
    /// A machine-executable binary operation on matching operand types.
    Binop {
        /// The operator; never a comparison.
        op: Op,
        /// Result type.
        ty: Type,
        /// Left operand.
        lhs: Box<TypedExpr>,
        /// Right operand.
        rhs: Box<TypedExpr>,
    },
    /// A machine-executable unary operation.
    Unop {
        /// The operator.
        op: UnOp,
        /// Result type.
        ty: Type,
        /// Operand.
        inner: Box<TypedExpr>,
    },
    /// A comparison producing a boolean integer.
    Compare {
        /// The comparison operator.
        op: Op,
        /// True when the unsigned compare instruction must be used.
        unsigned: bool,
        /// Left operand.
        lhs: Box<TypedExpr>,
        /// Right operand.
        rhs: Box<TypedExpr>,
    },
    /// A call into the runtime helper library.
    Helper {
        /// Which helper.
        helper: Helper,
        /// Arguments.
        args: Vec<TypedExpr>,
        /// Result type.
        ty: Type,
    },
    /// A call to a user function.
    Call {
        /// Callee name.
        name: String,
        /// Arguments, already coerced to the parameter types.
        args: Vec<TypedExpr>,
        /// Result type.
        ty: Type,
    },
    /// Address of an lvalue.
    AddrOf {
        /// The lvalue.
        inner: Box<TypedExpr>,
        /// Pointer type.
        ty: Type,
    },
    /// Pointer dereference.
    Deref {
        /// The pointer.
        inner: Box<TypedExpr>,
        /// Pointee type.
        ty: Type,
    },
    /// Array element access.
    Index {
        /// Base array or pointer.
        base: Box<TypedExpr>,
        /// Element index.
        index: Box<TypedExpr>,
        /// Element type.
        ty: Type,
    },
}

impl TypedExpr {
    /// The type of this expression.
    pub fn ty(&self) -> Type {
        match self {
            TypedExpr::Int { ty, .. }
            | TypedExpr::Float { ty, .. }
            | TypedExpr::Var { ty, .. }
            | TypedExpr::Binop { ty, .. }
            | TypedExpr::Unop { ty, .. }
            | TypedExpr::Helper { ty, .. }
            | TypedExpr::Call { ty, .. }
            | TypedExpr::AddrOf { ty, .. }
            | TypedExpr::Deref { ty, .. }
            | TypedExpr::Index { ty, .. } => ty.clone(),
            TypedExpr::Cast { to, .. } => to.clone(),
            TypedExpr::Str { .. } => Type::Str,
            TypedExpr::HwReg { .. } => Type::ulong(),
            TypedExpr::Compare { .. } => Type::long(),
        }
    }

    /// The constant integer value, if this is a constant.
    pub fn const_int(&self) -> Option<i64> {
        match self {
            TypedExpr::Int { value, .. } => Some(*value),
            TypedExpr::Cast { inner, .. } => inner.const_int(),
            _ => None,
        }
    }

    fn helper(helper: Helper, args: Vec<TypedExpr>, ty: Type) -> TypedExpr {
        TypedExpr::Helper { helper, args, ty }
    }
}

/// Name-resolution environment for one function body.
pub struct TypeEnv<'a> {
    /// The enclosing function, if inside one.
    pub func: Option<&'a Function>,
    /// The enclosing module.
    pub module: &'a Module,
}

impl<'a> TypeEnv<'a> {
    fn lookup_var(&self, name: &str) -> Option<Type> {
        if let Some(f) = self.func {
            if let Some(p) = f.params.iter().find(|p| p.name == name) {
                return Some(p.ty.clone());
            }
            if let Some(l) = f.locals.iter().find(|l| l.name == name) {
                return Some(l.ty.clone());
            }
        }
        match self.module.symbols.lookup(name) {
            Some(Symbol::Constant(_)) => Some(Type::long()),
            Some(Symbol::DataLabel { .. }) => Some(Type::Ptr(Box::new(Type::long()))),
            Some(Symbol::HwRegister(_)) => Some(Type::ulong()),
            _ => None,
        }
    }

    fn lookup_fn(&self, name: &str) -> Option<&'a Function> {
        match self.module.symbols.lookup(name) {
            Some(Symbol::Function(i)) => self.module.functions.get(*i as usize),
            _ => self.module.functions.iter().find(|f| f.name == name),
        }
    }
}

/// The type engine for one module; borrows the diagnostics sink.
pub struct TypeCheck<'a> {
    diags: &'a mut Diagnostics,
    loc: SourceLoc,
}

impl<'a> TypeCheck<'a> {
    /// Create an engine reporting against `loc`.
    pub fn new(diags: &'a mut Diagnostics, loc: SourceLoc) -> Self {
        Self { diags, loc }
    }

    /// Resolve `expr` to a typed expression, inserting coercions and helper
    /// calls as required.
    pub fn check_expr(&mut self, env: &TypeEnv, expr: &Expr) -> TypedExpr {
        match expr {
            Expr::Int(v) => TypedExpr::Int {
                value: *v,
                ty: Type::Generic,
            },
            Expr::Float(v) => TypedExpr::Float {
                value: *v,
                ty: Type::float(),
            },
            Expr::Str(s) => TypedExpr::Str { value: s.clone() },
            Expr::Result => {
                let ty = env
                    .func
                    .and_then(|f| f.results.first().cloned())
                    .unwrap_or(Type::long());
                TypedExpr::Var {
                    name: "result".to_string(),
                    ty,
                }
            }
            Expr::Ident(name) => match env.lookup_var(name) {
                Some(ty) => TypedExpr::Var {
                    name: name.clone(),
                    ty,
                },
                None => {
                    self.diags
                        .error(self.loc.clone(), format!("undefined symbol {}", name));
                    TypedExpr::Int {
                        value: 0,
                        ty: Type::long(),
                    }
                }
            },
            Expr::HwReg(name) => TypedExpr::HwReg { name: name.clone() },
            Expr::Binop(op, l, r) => {
                let lhs = self.check_expr(env, l);
                let rhs = self.check_expr(env, r);
                if op.is_comparison() {
                    self.compile_comparison(*op, lhs, rhs)
                } else {
                    self.handle_two_numerics(*op, lhs, rhs)
                }
            }
            Expr::Unop(op, inner) => {
                let inner = self.check_expr(env, inner);
                self.handle_unary(*op, inner)
            }
            Expr::Call { name, args } => self.check_call(env, name, args),
            Expr::ArrayRef(base, index) => {
                let base = self.check_expr(env, base);
                let index = self.check_expr(env, index);
                let elem = match base.ty().unqualified() {
                    Type::Array { elem, .. } => (**elem).clone(),
                    Type::Ptr(inner) => (**inner).clone(),
                    other => {
                        self.diags.error(
                            self.loc.clone(),
                            format!("cannot index a value of type {:?}", other),
                        );
                        Type::long()
                    }
                };
                let index = self.coerce_to_long(index);
                TypedExpr::Index {
                    base: Box::new(base),
                    index: Box::new(index),
                    ty: elem,
                }
            }
            Expr::AddrOf(inner) => {
                let inner = self.check_expr(env, inner);
                let ty = Type::Ptr(Box::new(inner.ty()));
                TypedExpr::AddrOf {
                    inner: Box::new(inner),
                    ty,
                }
            }
            Expr::Deref(inner) => {
                let inner = self.check_expr(env, inner);
                let ty = match inner.ty().unqualified() {
                    Type::Ptr(t) => (**t).clone(),
                    other => {
                        self.diags.error(
                            self.loc.clone(),
                            format!("cannot dereference a value of type {:?}", other),
                        );
                        Type::long()
                    }
                };
                TypedExpr::Deref {
                    inner: Box::new(inner),
                    ty,
                }
            }
            Expr::Catch(inner) | Expr::RangeRef(inner, _) => {
                // only meaningful inside inline assembly; type as the inner
                self.check_expr(env, inner)
            }
            Expr::Here => TypedExpr::Int {
                value: 0,
                ty: Type::ulong(),
            },
            Expr::Cast(to, inner) => {
                let inner = self.check_expr(env, inner);
                self.coerce(to.clone(), inner, "cast")
            }
        }
    }

    fn check_call(&mut self, env: &TypeEnv, name: &str, args: &[Expr]) -> TypedExpr {
        let mut targs = Vec::with_capacity(args.len());
        let Some(f) = env.lookup_fn(name) else {
            for a in args {
                targs.push(self.check_expr(env, a));
            }
            self.diags
                .error(self.loc.clone(), format!("undefined function {}", name));
            return TypedExpr::Call {
                name: name.to_string(),
                args: targs,
                ty: Type::long(),
            };
        };
        if args.len() != f.params.len() {
            self.diags.error(
                self.loc.clone(),
                format!(
                    "{} expects {} argument(s), got {}",
                    name,
                    f.params.len(),
                    args.len()
                ),
            );
        }
        let param_tys: Vec<Type> = f.params.iter().map(|p| p.ty.clone()).collect();
        let ty = match f.results.len() {
            0 => Type::Void,
            1 => f.results[0].clone(),
            _ => Type::Tuple(f.results.clone()),
        };
        for (i, a) in args.iter().enumerate() {
            let ta = self.check_expr(env, a);
            let ta = match param_tys.get(i) {
                Some(want) => self.coerce(want.clone(), ta, "argument"),
                None => ta,
            };
            targs.push(ta);
        }
        TypedExpr::Call {
            name: name.to_string(),
            args: targs,
            ty,
        }
    }

    // ---- promotion machinery -------------------------------------------

    /// Widen `expr` from its width to `dest_bytes`, extending by sign or by
    /// zero. Widening past 4 bytes goes through the int64 helpers.
    fn promote(&mut self, expr: TypedExpr, dest_bytes: u32) -> TypedExpr {
        let ty = expr.ty();
        let src_bytes = ty.size();
        if src_bytes == dest_bytes || (src_bytes == LONG_SIZE && dest_bytes < 8) {
            return expr;
        }
        let unsigned = ty.is_unsigned();
        let long = if unsigned { Type::ulong() } else { Type::long() };
        let widened = if src_bytes < LONG_SIZE {
            TypedExpr::Cast {
                to: long.clone(),
                inner: Box::new(expr),
            }
        } else {
            expr
        };
        if dest_bytes == 8 {
            let helper = if unsigned {
                Helper::Int64Zerox
            } else {
                Helper::Int64Signx
            };
            let ty64 = if unsigned {
                Type::ulong64()
            } else {
                Type::long64()
            };
            TypedExpr::helper(helper, vec![widened], ty64)
        } else {
            widened
        }
    }

    /// Narrow `expr` to `dest` bytes: widen to a full long first (taking
    /// the low long of an int64 pair), then mask down.
    fn narrow(&mut self, expr: TypedExpr, dest: Type) -> TypedExpr {
        let src = expr.ty();
        let low = if src.size() == 8 {
            TypedExpr::Cast {
                to: if src.is_unsigned() {
                    Type::ulong()
                } else {
                    Type::long()
                },
                inner: Box::new(expr),
            }
        } else {
            self.promote(expr, LONG_SIZE)
        };
        if dest.size() < LONG_SIZE {
            TypedExpr::Cast {
                to: dest,
                inner: Box::new(low),
            }
        } else {
            low
        }
    }

    fn coerce_to_long(&mut self, expr: TypedExpr) -> TypedExpr {
        let ty = expr.ty();
        if ty.is_integer() && ty.size() < LONG_SIZE {
            self.promote(expr, LONG_SIZE)
        } else {
            expr
        }
    }

    /// Convert an integer expression to a float of `bytes` width.
    fn make_float(&mut self, expr: TypedExpr, bytes: u32) -> TypedExpr {
        let ty = expr.ty();
        if ty.is_float() {
            if bytes == 8 && !ty.is_float64() {
                return TypedExpr::helper(Helper::FloatToDouble, vec![expr], Type::double());
            }
            return expr;
        }
        if !ty.is_integer() {
            self.diags
                .error(self.loc.clone(), "unable to convert this type to float");
            return expr;
        }
        let unsigned = ty.is_unsigned();
        let expr = self.promote(expr, LONG_SIZE);
        // constant integers fold straight to float literals
        if let Some(v) = expr.const_int() {
            let value = if unsigned { v as u32 as f64 } else { v as f64 };
            return TypedExpr::Float {
                value,
                ty: if bytes == 8 {
                    Type::double()
                } else {
                    Type::float()
                },
            };
        }
        let helper = match (bytes, unsigned) {
            (8, true) => Helper::DoubleFromUns,
            (8, false) => Helper::DoubleFromInt,
            (_, true) => Helper::FloatFromUns,
            (_, false) => Helper::FloatFromInt,
        };
        let ty = if bytes == 8 {
            Type::double()
        } else {
            Type::float()
        };
        TypedExpr::helper(helper, vec![expr], ty)
    }

    fn float_to_int(&mut self, expr: TypedExpr) -> TypedExpr {
        let helper = if expr.ty().is_float64() {
            Helper::DoubleToInt
        } else {
            Helper::FloatToInt
        };
        TypedExpr::helper(helper, vec![expr], Type::long())
    }

    // ---- binary operators ----------------------------------------------

    fn handle_two_numerics(&mut self, op: Op, lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
        let mut op = op;
        let mut lhs = lhs;
        let mut rhs = rhs;

        // modulus converts float operands to integer first
        if op == Op::Mod {
            if lhs.ty().is_float() {
                lhs = self.float_to_int(lhs);
            }
            if rhs.ty().is_float() {
                rhs = self.float_to_int(rhs);
            }
        }

        let lfloat = lhs.ty().is_float();
        let rfloat = rhs.ty().is_float();
        if lfloat || rfloat || op == Op::Power {
            let wide = lhs.ty().is_float64() || rhs.ty().is_float64();
            let bytes = if wide { 8 } else { 4 };
            lhs = self.make_float(lhs, bytes);
            rhs = self.make_float(rhs, bytes);
            // fold constant float expressions of matching width
            if let (TypedExpr::Float { value: a, .. }, TypedExpr::Float { value: b, .. }) =
                (&lhs, &rhs)
            {
                let folded = match op {
                    Op::Add => Some(a + b),
                    Op::Sub => Some(a - b),
                    Op::Mul => Some(a * b),
                    Op::Div if *b != 0.0 => Some(a / b),
                    _ => None,
                };
                if let Some(value) = folded {
                    return TypedExpr::Float {
                        value,
                        ty: if wide { Type::double() } else { Type::float() },
                    };
                }
            }
            let helper = match (op, wide) {
                (Op::Add, false) => Helper::FloatAdd,
                (Op::Sub, false) => Helper::FloatSub,
                (Op::Mul, false) => Helper::FloatMul,
                (Op::Div, false) => Helper::FloatDiv,
                (Op::Add, true) => Helper::DoubleAdd,
                (Op::Sub, true) => Helper::DoubleSub,
                (Op::Mul, true) => Helper::DoubleMul,
                (Op::Div, true) => Helper::DoubleDiv,
                (Op::Power, _) => {
                    self.diags
                        .error(self.loc.clone(), "exponentiation is not supported here");
                    Helper::FloatMul
                }
                _ => {
                    self.diags
                        .error(self.loc.clone(), "operator not defined on float operands");
                    Helper::FloatAdd
                }
            };
            let ty = if wide { Type::double() } else { Type::float() };
            return TypedExpr::helper(helper, vec![lhs, rhs], ty);
        }

        if !lhs.ty().is_integer() || !rhs.ty().is_integer() {
            self.diags.error(
                self.loc.clone(),
                format!("operator {:?} requires numeric operands", op),
            );
            return TypedExpr::Int {
                value: 0,
                ty: Type::long(),
            };
        }

        // fold constant integer expressions
        if let (Some(a), Some(b)) = (lhs.const_int(), rhs.const_int()) {
            if let Some(value) =
                Expr::Binop(op, Box::new(Expr::Int(a)), Box::new(Expr::Int(b))).const_value()
            {
                return TypedExpr::Int {
                    value,
                    ty: Type::Generic,
                };
            }
        }

        let width = lhs.ty().size().max(rhs.ty().size()).max(LONG_SIZE);
        let unsigned = lhs.ty().is_unsigned() || rhs.ty().is_unsigned();
        if unsigned && op == Op::Sar {
            op = Op::Shr;
        }

        if width == 8 {
            lhs = self.promote(lhs, 8);
            rhs = self.promote(rhs, 8);
            let helper = match (op, unsigned) {
                (Op::Add, _) => Helper::Int64Add,
                (Op::Sub, _) => Helper::Int64Sub,
                (Op::Mul, false) => Helper::Int64Muls,
                (Op::Mul, true) => Helper::Int64Mulu,
                (Op::Div, false) => Helper::Int64Divs,
                (Op::Div, true) => Helper::Int64Divu,
                (Op::Mod, false) => Helper::Int64Mods,
                (Op::Mod, true) => Helper::Int64Modu,
                (Op::And, _) => Helper::Int64And,
                (Op::Or, _) => Helper::Int64Or,
                (Op::Xor, _) => Helper::Int64Xor,
                (Op::Shl, _) => Helper::Int64Shl,
                (Op::Shr, _) => Helper::Int64Shr,
                (Op::Sar, _) => Helper::Int64Sar,
                _ => {
                    self.diags
                        .error(self.loc.clone(), "operator not defined on 64-bit operands");
                    Helper::Int64Add
                }
            };
            let ty = if unsigned {
                Type::ulong64()
            } else {
                Type::long64()
            };
            return TypedExpr::helper(helper, vec![lhs, rhs], ty);
        }

        lhs = self.promote(lhs, LONG_SIZE);
        rhs = self.promote(rhs, LONG_SIZE);
        let ty = if unsigned { Type::ulong() } else { Type::long() };
        TypedExpr::Binop {
            op,
            ty,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// The value a tri-valued float compare should yield for unordered
    /// operands so the original predicate comes out false.
    fn unordered_result(op: Op) -> i64 {
        match op {
            Op::Gt | Op::Ge => -1,
            _ => 1,
        }
    }

    fn compile_comparison(&mut self, op: Op, lhs: TypedExpr, rhs: TypedExpr) -> TypedExpr {
        let mut lhs = lhs;
        let mut rhs = rhs;

        if lhs.ty().is_float() || rhs.ty().is_float() {
            let wide = lhs.ty().is_float64() || rhs.ty().is_float64();
            let bytes = if wide { 8 } else { 4 };
            lhs = self.make_float(lhs, bytes);
            rhs = self.make_float(rhs, bytes);
            let helper = if wide {
                Helper::DoubleCmp
            } else {
                Helper::FloatCmp
            };
            let cmp = TypedExpr::helper(
                helper,
                vec![
                    lhs,
                    rhs,
                    TypedExpr::Int {
                        value: Self::unordered_result(op),
                        ty: Type::long(),
                    },
                ],
                Type::long(),
            );
            return TypedExpr::Compare {
                op,
                unsigned: false,
                lhs: Box::new(cmp),
                rhs: Box::new(TypedExpr::Int {
                    value: 0,
                    ty: Type::long(),
                }),
            };
        }

        if lhs.ty().is_string() || rhs.ty().is_string() {
            if !lhs.ty().compatible(&rhs.ty()) {
                self.diags
                    .error(self.loc.clone(), "illegal comparison with string");
            }
            let cmp = TypedExpr::helper(Helper::StringCmp, vec![lhs, rhs], Type::long());
            return TypedExpr::Compare {
                op,
                unsigned: false,
                lhs: Box::new(cmp),
                rhs: Box::new(TypedExpr::Int {
                    value: 0,
                    ty: Type::long(),
                }),
            };
        }

        if lhs.ty().is_function_pointer() || rhs.ty().is_function_pointer() {
            let cmp = TypedExpr::helper(Helper::FuncptrCmp, vec![lhs, rhs], Type::long());
            return TypedExpr::Compare {
                op,
                unsigned: false,
                lhs: Box::new(cmp),
                rhs: Box::new(TypedExpr::Int {
                    value: 0,
                    ty: Type::long(),
                }),
            };
        }

        if lhs.ty().is_pointer() || rhs.ty().is_pointer() {
            return TypedExpr::Compare {
                op,
                unsigned: true,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        if !lhs.ty().is_integer() || !rhs.ty().is_integer() {
            self.diags
                .error(self.loc.clone(), "comparison requires numeric operands");
            return TypedExpr::Compare {
                op,
                unsigned: false,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }

        let int64 = lhs.ty().is_int64() || rhs.ty().is_int64();
        if int64 {
            lhs = self.promote(lhs, 8);
            rhs = self.promote(rhs, 8);
            let unsigned = lhs.ty().is_unsigned() || rhs.ty().is_unsigned();
            let helper = if unsigned {
                Helper::Int64Cmpu
            } else {
                Helper::Int64Cmps
            };
            let cmp = TypedExpr::helper(helper, vec![lhs, rhs], Type::long());
            return TypedExpr::Compare {
                op,
                unsigned: false,
                lhs: Box::new(cmp),
                rhs: Box::new(TypedExpr::Int {
                    value: 0,
                    ty: Type::long(),
                }),
            };
        }

        let left_unsigned = lhs.ty().is_unsigned();
        let right_unsigned = rhs.ty().is_unsigned();
        lhs = self.promote(lhs, LONG_SIZE);
        rhs = self.promote(rhs, LONG_SIZE);

        let mut unsigned = false;
        if left_unsigned || right_unsigned {
            let lconst_ok = lhs.const_int().map(|v| v >= 0).unwrap_or(false);
            let rconst_ok = rhs.const_int().map(|v| v >= 0).unwrap_or(false);
            if (left_unsigned && (right_unsigned || rconst_ok))
                || (right_unsigned && lconst_ok)
            {
                unsigned = true;
            } else if op != Op::Eq && op != Op::Ne {
                self.diags.warning(
                    self.loc.clone(),
                    "signed/unsigned comparison may not work properly",
                );
            }
        }
        TypedExpr::Compare {
            op,
            unsigned,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    fn handle_unary(&mut self, op: UnOp, inner: TypedExpr) -> TypedExpr {
        let ty = inner.ty();
        if ty.is_float() {
            let wide = ty.is_float64();
            let helper = match op {
                UnOp::Neg => Some(if wide {
                    Helper::DoubleNeg
                } else {
                    Helper::FloatNeg
                }),
                UnOp::Abs => Some(if wide {
                    Helper::DoubleAbs
                } else {
                    Helper::FloatAbs
                }),
                UnOp::Sqrt => Some(if wide {
                    Helper::DoubleSqrt
                } else {
                    Helper::FloatSqrt
                }),
                _ => None,
            };
            if let Some(helper) = helper {
                return TypedExpr::helper(helper, vec![inner], ty);
            }
            self.diags
                .error(self.loc.clone(), "operator not defined on float operands");
            return inner;
        }
        match op {
            UnOp::Sqrt => {
                // integer sqrt goes through the float library
                let f = self.make_float(inner, 4);
                let r = TypedExpr::helper(Helper::FloatSqrt, vec![f], Type::float());
                self.float_to_int(r)
            }
            UnOp::Neg if ty.is_int64() => {
                TypedExpr::helper(Helper::Int64Neg, vec![inner], ty)
            }
            _ => {
                let inner = self.coerce_to_long(inner);
                let ty = inner.ty();
                TypedExpr::Unop {
                    op,
                    ty,
                    inner: Box::new(inner),
                }
            }
        }
    }

    // ---- assignment coercion -------------------------------------------

    /// Coerce `src` to `dest` for an assignment, argument or cast; `what`
    /// names the construct in diagnostics.
    pub fn coerce(&mut self, dest: Type, src: TypedExpr, what: &str) -> TypedExpr {
        let sty = src.ty();

        // reference parameters take the address of a value argument
        if let Type::Ref(inner) = dest.unqualified() {
            if sty.compatible(inner) {
                let ty = Type::Ptr(inner.clone());
                return TypedExpr::AddrOf {
                    inner: Box::new(src),
                    ty,
                };
            }
        }

        // pass-by-value of a large aggregate: allocate and copy
        if let Type::CopyRef(inner) = dest.unqualified() {
            let size = inner.size();
            let alloc = TypedExpr::helper(
                Helper::GcAllocManaged,
                vec![TypedExpr::Int {
                    value: size as i64,
                    ty: Type::long(),
                }],
                Type::Ptr(inner.clone()),
            );
            let src_addr = TypedExpr::AddrOf {
                ty: Type::Ptr(inner.clone()),
                inner: Box::new(src),
            };
            return TypedExpr::helper(
                Helper::StructCopy,
                vec![
                    alloc,
                    src_addr,
                    TypedExpr::Int {
                        value: size as i64,
                        ty: Type::long(),
                    },
                ],
                Type::Ptr(inner.clone()),
            );
        }

        if dest.unqualified() == sty.unqualified() {
            return src;
        }

        if sty.discards_const(&dest) {
            self.diags
                .warning(self.loc.clone(), format!("{} discards const qualifier", what));
        }

        if dest.is_float() && sty.is_integer() {
            return self.make_float(src, dest.size());
        }
        if dest.is_float() && sty.is_float() {
            if dest.is_float64() {
                return TypedExpr::helper(Helper::FloatToDouble, vec![src], Type::double());
            }
            // no double→float helper in the library; reject
            self.diags.error(
                self.loc.clone(),
                format!("cannot narrow double in {}", what),
            );
            return src;
        }
        if dest.is_integer() && sty.is_float() {
            return self.float_to_int(src);
        }

        if dest.is_integer() && sty.is_integer() {
            let dsize = dest.size();
            let ssize = sty.size();
            if dsize >= 8 && ssize < 8 {
                return self.promote(src, 8);
            }
            if dsize < ssize || (dsize < LONG_SIZE && ssize >= LONG_SIZE) {
                return self.narrow(src, dest);
            }
            if dsize == LONG_SIZE && ssize < LONG_SIZE {
                return self.promote(src, LONG_SIZE);
            }
            return src;
        }

        if !dest.compatible(&sty) {
            self.diags.error(
                self.loc.clone(),
                format!("type mismatch in {}: incompatible types", what),
            );
        }
        src
    }

    /// Coerce the right-hand side of an assignment, also checking the
    /// destination for const-ness.
    pub fn coerce_assign(&mut self, dest: &TypedExpr, src: TypedExpr) -> TypedExpr {
        let dty = dest.ty();
        if dty.is_const() {
            self.diags
                .warning(self.loc.clone(), "write to a const-qualified destination");
        }
        self.coerce(dty, src, "assignment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Language, Param};

    fn env_module() -> Module {
        Module::new("main", Language::Spin)
    }

    fn check(expr: &Expr) -> (TypedExpr, Diagnostics) {
        let module = env_module();
        let env = TypeEnv {
            func: None,
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let te = TypeCheck::new(&mut diags, SourceLoc::builtin()).check_expr(&env, expr);
        (te, diags)
    }

    fn var(name: &str, ty: Type) -> Param {
        Param {
            name: name.to_string(),
            ty,
        }
    }

    fn check_in_func(expr: &Expr, locals: Vec<Param>) -> (TypedExpr, Diagnostics) {
        let module = env_module();
        let mut f = Function::new("f", Language::Spin);
        f.locals = locals;
        let env = TypeEnv {
            func: Some(&f),
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let te = TypeCheck::new(&mut diags, SourceLoc::builtin()).check_expr(&env, expr);
        (te, diags)
    }

    #[test]
    fn long_addition_stays_native() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Ident("a".into())),
            Box::new(Expr::Ident("b".into())),
        );
        let (te, diags) = check_in_func(
            &e,
            vec![var("a", Type::long()), var("b", Type::long())],
        );
        assert!(!diags.has_errors());
        match te {
            TypedExpr::Binop { op: Op::Add, ty, .. } => assert_eq!(ty, Type::long()),
            other => panic!("expected native add, got {:?}", other),
        }
    }

    #[test]
    fn int64_addition_becomes_single_helper_call() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Ident("a".into())),
            Box::new(Expr::Ident("b".into())),
        );
        let (te, diags) = check_in_func(
            &e,
            vec![var("a", Type::long64()), var("b", Type::long64())],
        );
        assert!(!diags.has_errors());
        match te {
            TypedExpr::Helper {
                helper: Helper::Int64Add,
                args,
                ..
            } => {
                // the operands feed the helper directly; no nested add
                assert_eq!(args.len(), 2);
                assert!(matches!(args[0], TypedExpr::Var { .. }));
            }
            other => panic!("expected int64_add call, got {:?}", other),
        }
    }

    #[test]
    fn unsigned_operand_selects_unsigned_division() {
        let e = Expr::Binop(
            Op::Div,
            Box::new(Expr::Ident("a".into())),
            Box::new(Expr::Ident("b".into())),
        );
        let (te, _) = check_in_func(
            &e,
            vec![var("a", Type::ulong64()), var("b", Type::long64())],
        );
        assert!(matches!(
            te,
            TypedExpr::Helper {
                helper: Helper::Int64Divu,
                ..
            }
        ));
    }

    #[test]
    fn unsigned_shift_becomes_logical() {
        let e = Expr::Binop(
            Op::Sar,
            Box::new(Expr::Ident("a".into())),
            Box::new(Expr::Int(3)),
        );
        let (te, _) = check_in_func(&e, vec![var("a", Type::ulong())]);
        assert!(matches!(te, TypedExpr::Binop { op: Op::Shr, .. }));
    }

    #[test]
    fn narrow_operand_widens_before_use() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Ident("b".into())),
            Box::new(Expr::Ident("w".into())),
        );
        let (te, _) = check_in_func(
            &e,
            vec![
                var(
                    "b",
                    Type::Int {
                        bytes: 1,
                        signed: false,
                    },
                ),
                var(
                    "w",
                    Type::Int {
                        bytes: 2,
                        signed: true,
                    },
                ),
            ],
        );
        match te {
            TypedExpr::Binop { lhs, rhs, ty, .. } => {
                assert!(matches!(*lhs, TypedExpr::Cast { .. }));
                assert!(matches!(*rhs, TypedExpr::Cast { .. }));
                assert_eq!(ty, Type::ulong());
            }
            other => panic!("expected widened add, got {:?}", other),
        }
    }

    #[test]
    fn float_contaminates_integer_operand() {
        let e = Expr::Binop(
            Op::Mul,
            Box::new(Expr::Ident("x".into())),
            Box::new(Expr::Ident("n".into())),
        );
        let (te, _) = check_in_func(
            &e,
            vec![var("x", Type::float()), var("n", Type::long())],
        );
        match te {
            TypedExpr::Helper {
                helper: Helper::FloatMul,
                args,
                ..
            } => assert!(matches!(
                args[1],
                TypedExpr::Helper {
                    helper: Helper::FloatFromInt,
                    ..
                }
            )),
            other => panic!("expected float_mul, got {:?}", other),
        }
    }

    #[test]
    fn constant_float_expression_folds() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Float(1.5)),
            Box::new(Expr::Float(2.25)),
        );
        let (te, _) = check(&e);
        assert!(matches!(te, TypedExpr::Float { value, .. } if value == 3.75));
    }

    #[test]
    fn float_comparison_goes_tri_valued() {
        let e = Expr::Binop(
            Op::Lt,
            Box::new(Expr::Ident("x".into())),
            Box::new(Expr::Float(0.0)),
        );
        let (te, _) = check_in_func(&e, vec![var("x", Type::float())]);
        match te {
            TypedExpr::Compare { op: Op::Lt, lhs, rhs, .. } => {
                assert!(matches!(
                    *lhs,
                    TypedExpr::Helper {
                        helper: Helper::FloatCmp,
                        ..
                    }
                ));
                assert_eq!(rhs.const_int(), Some(0));
            }
            other => panic!("expected compare against zero, got {:?}", other),
        }
    }

    #[test]
    fn mixed_sign_comparison_with_constant_goes_unsigned() {
        let e = Expr::Binop(
            Op::Lt,
            Box::new(Expr::Ident("u".into())),
            Box::new(Expr::Int(10)),
        );
        let (te, diags) = check_in_func(&e, vec![var("u", Type::ulong())]);
        assert_eq!(diags.warning_count(), 0);
        assert!(matches!(te, TypedExpr::Compare { unsigned: true, .. }));
    }

    #[test]
    fn mixed_sign_comparison_without_constant_warns() {
        let e = Expr::Binop(
            Op::Lt,
            Box::new(Expr::Ident("u".into())),
            Box::new(Expr::Ident("s".into())),
        );
        let (te, diags) = check_in_func(
            &e,
            vec![var("u", Type::ulong()), var("s", Type::long())],
        );
        assert_eq!(diags.warning_count(), 1);
        assert!(matches!(te, TypedExpr::Compare { unsigned: false, .. }));
    }

    #[test]
    fn string_comparison_lowers_to_helper() {
        let e = Expr::Binop(
            Op::Eq,
            Box::new(Expr::Str("abc".into())),
            Box::new(Expr::Str("abd".into())),
        );
        let (te, _) = check(&e);
        match te {
            TypedExpr::Compare { lhs, .. } => assert!(matches!(
                *lhs,
                TypedExpr::Helper {
                    helper: Helper::StringCmp,
                    ..
                }
            )),
            other => panic!("expected string_cmp compare, got {:?}", other),
        }
    }

    #[test]
    fn reference_parameter_takes_address() {
        let module = env_module();
        let env = TypeEnv {
            func: None,
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let mut tc = TypeCheck::new(&mut diags, SourceLoc::builtin());
        let src = tc.check_expr(&env, &Expr::Int(5));
        let out = tc.coerce(Type::Ref(Box::new(Type::long())), src, "argument");
        assert!(matches!(out, TypedExpr::AddrOf { .. }));
    }

    #[test]
    fn copyref_allocates_and_copies() {
        let module = env_module();
        let env = TypeEnv {
            func: None,
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let mut tc = TypeCheck::new(&mut diags, SourceLoc::builtin());
        let src = tc.check_expr(&env, &Expr::Int(0));
        let big = Type::Object {
            class: "fifo".to_string(),
            size: 32,
        };
        let out = tc.coerce(Type::CopyRef(Box::new(big)), src, "argument");
        match out {
            TypedExpr::Helper {
                helper: Helper::StructCopy,
                args,
                ..
            } => assert!(matches!(
                args[0],
                TypedExpr::Helper {
                    helper: Helper::GcAllocManaged,
                    ..
                }
            )),
            other => panic!("expected struct_copy, got {:?}", other),
        }
    }

    #[test]
    fn narrowing_from_int64_takes_low_long_then_masks() {
        let module = env_module();
        let mut f = Function::new("f", Language::Spin);
        f.locals = vec![var("a", Type::long64())];
        let env = TypeEnv {
            func: Some(&f),
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let mut tc = TypeCheck::new(&mut diags, SourceLoc::builtin());
        let src = tc.check_expr(&env, &Expr::Ident("a".into()));
        let out = tc.coerce(
            Type::Int {
                bytes: 2,
                signed: false,
            },
            src,
            "assignment",
        );
        // outer mask cast to the 2-byte type, inner cast to a long
        match out {
            TypedExpr::Cast { to, inner } => {
                assert_eq!(to.size(), 2);
                assert!(matches!(*inner, TypedExpr::Cast { ref to, .. } if to.size() == 4));
            }
            other => panic!("expected nested casts, got {:?}", other),
        }
    }

    #[test]
    fn const_destination_warns() {
        let module = env_module();
        let env = TypeEnv {
            func: None,
            module: &module,
        };
        let mut diags = Diagnostics::new();
        let mut tc = TypeCheck::new(&mut diags, SourceLoc::builtin());
        let dst = TypedExpr::Var {
            name: "k".to_string(),
            ty: Type::Const(Box::new(Type::long())),
        };
        let src = tc.check_expr(&env, &Expr::Int(1));
        tc.coerce_assign(&dst, src);
        assert_eq!(diags.warning_count(), 1);
    }

    #[test]
    fn checking_is_deterministic() {
        let e = Expr::Binop(
            Op::Add,
            Box::new(Expr::Int(1)),
            Box::new(Expr::Ident("x".into())),
        );
        let a = check_in_func(&e, vec![var("x", Type::long())]).0;
        let b = check_in_func(&e, vec![var("x", Type::long())]).0;
        assert_eq!(a, b);
    }
}
