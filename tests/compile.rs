//! End-to-end tests: module ASTs through lowering to assembler text.

use pasm_codegen::ast::{
    AsmFlags, AsmInstr, AsmItem, AsmOperand, CodePlacement, Expr, Function, ImmMarker, Language,
    Module, Op, Param, Stmt,
};
use pasm_codegen::emit::ir_assemble;
use pasm_codegen::ir::InstrFlags;
use pasm_codegen::isa::IsaKind;
use pasm_codegen::lower::compile_module;
use pasm_codegen::types::Type;
use pasm_codegen::{CompileContext, Options, OutputMode};

fn options(isa: IsaKind) -> Options {
    Options {
        isa,
        ..Options::default()
    }
}

fn local(name: &str, ty: Type) -> Param {
    Param {
        name: name.to_string(),
        ty,
    }
}

fn assign(dst: &str, src: Expr) -> Stmt {
    Stmt::Assign(Expr::Ident(dst.to_string()), src)
}

fn compile_to_text(isa: IsaKind, module: Module) -> String {
    let mut ctx = CompileContext::new(options(isa));
    let id = ctx.add_module(module.clone());
    let lowered = compile_module(&mut ctx, id).expect("module should compile cleanly");
    ir_assemble(&mut ctx, &lowered.list, None)
}

/// An unconditional P1 instruction encoding (condition field all ones).
fn p1_instr(mnemonic: &str, operands: Vec<AsmOperand>) -> AsmInstr {
    AsmInstr {
        mnemonic: mnemonic.to_string(),
        encoding: 0xf << 18,
        operands: operands.into_iter().collect(),
        flags: InstrFlags::empty(),
    }
}

fn op_reg(name: &str) -> AsmOperand {
    AsmOperand {
        expr: Expr::Ident(name.to_string()),
        imm: ImmMarker::None,
    }
}

#[test]
fn two_statement_function_emits_straight_line_code() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("x", Type::long()), local("y", Type::long())];
    f.body = vec![
        assign("x", Expr::Int(1)),
        assign(
            "y",
            Expr::Binop(
                Op::Add,
                Box::new(Expr::Ident("x".to_string())),
                Box::new(Expr::Int(2)),
            ),
        ),
    ];
    m.functions.push(f);

    let text = compile_to_text(IsaKind::P1, m);
    assert!(text.contains("start\n"), "entry label missing: {}", text);
    assert!(text.contains("\tmov\t_start_x, #1\n"), "got: {}", text);
    assert!(text.contains("\tadd\t_tmp001_, #2\n"), "got: {}", text);
    assert!(text.contains("\tmov\t_start_y, _tmp001_\n"), "got: {}", text);
    assert!(text.contains("\tret\n"));
    // a cog-only module never opens hub mode
    assert!(!text.contains("orgh"));
}

#[test]
fn pc_relative_operand_becomes_synthesized_label() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("r0", Type::long()), local("x", Type::long())];
    f.body = vec![Stmt::InlineAsm {
        items: vec![
            AsmItem::Instr(p1_instr(
                "mov",
                vec![
                    op_reg("r0"),
                    AsmOperand {
                        expr: Expr::Binop(
                            Op::Add,
                            Box::new(Expr::Here),
                            Box::new(Expr::Int(2)),
                        ),
                        imm: ImmMarker::Small,
                    },
                ],
            )),
            AsmItem::Instr(p1_instr("jmp", vec![op_reg("r0")])),
            AsmItem::Instr(p1_instr(
                "add",
                vec![
                    op_reg("x"),
                    AsmOperand {
                        expr: Expr::Int(0),
                        imm: ImmMarker::Small,
                    },
                ],
            )),
        ],
        flags: AsmFlags::default(),
    }];
    m.functions.push(f);

    let text = compile_to_text(IsaKind::P1, m);
    // the $+2 reference resolves to a minted label...
    assert!(text.contains("\tmov\t_start_r0, #LR__"), "got: {}", text);
    // ...whose definition sits right before the target instruction
    let label_start = text.find("mov\t_start_r0, #LR__").unwrap() + "mov\t_start_r0, #".len();
    let label: String = text[label_start..]
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    assert!(
        text.contains(&format!("{}\n\tadd\t_start_x, #0\n", label)),
        "label {} not planted before target: {}",
        label,
        text
    );
}

#[test]
fn oversized_function_moves_to_hub_and_uses_lmm() {
    let mut m = Module::new("main", Language::Spin);

    // enough statements to blow the cog budget
    let mut big = Function::new("hub_func", Language::Spin);
    big.locals = vec![local("n", Type::long())];
    big.body = (0..200).map(|_| assign("n", Expr::Int(1))).collect();
    m.functions.push(big);

    let mut caller = Function::new("start", Language::Spin);
    caller.body = vec![Stmt::Expr(Expr::Call {
        name: "hub_func".to_string(),
        args: vec![],
    })];
    m.functions.push(caller);

    let text = compile_to_text(IsaKind::P1, m);
    // the hub function sits after the orgh switch and returns via LMM
    assert!(text.contains("hub_func\n"));
    assert!(text.contains("\tjmp\t#LMM_RET\n"), "got: {}", text);
    // calling hub code from cog code goes through the dispatcher
    assert!(
        text.contains("\tmov\tpc, $+2\n\tcall\t#LMM_CALL_FROM_COG\n\tlong\t@@@hub_func\n"),
        "got: {}",
        text
    );
}

#[test]
fn hub_to_hub_call_uses_lmm_call() {
    let mut m = Module::new("main", Language::Spin);
    let mut callee = Function::new("hub_func", Language::Spin);
    callee.explicit_placement = Some(CodePlacement::Hub);
    m.functions.push(callee);
    let mut caller = Function::new("hub_caller", Language::Spin);
    caller.explicit_placement = Some(CodePlacement::Hub);
    caller.body = vec![Stmt::Expr(Expr::Call {
        name: "hub_func".to_string(),
        args: vec![],
    })];
    m.functions.push(caller);

    let text = compile_to_text(IsaKind::P1, m);
    assert!(
        text.contains("\tjmp\t#LMM_CALL\n\tlong\t@@@hub_func\n"),
        "got: {}",
        text
    );
}

#[test]
fn int64_addition_calls_helper_not_add() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("a", Type::long64()), local("b", Type::long64())];
    f.body = vec![Stmt::Expr(Expr::Binop(
        Op::Add,
        Box::new(Expr::Ident("a".to_string())),
        Box::new(Expr::Ident("b".to_string())),
    ))];
    m.functions.push(f);

    let text = compile_to_text(IsaKind::P1, m);
    assert!(text.contains("\tcall\t#int64_add\n"), "got: {}", text);
    assert!(
        !text.contains("\tadd\t_start_a"),
        "int64 add must not lower to a machine add: {}",
        text
    );
}

#[test]
fn fcache_block_wraps_in_window() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("burst", Language::Spin);
    f.explicit_placement = Some(CodePlacement::Hub);
    f.locals = vec![local("x", Type::long())];
    f.body = vec![Stmt::InlineAsm {
        items: vec![
            AsmItem::Label("again".to_string()),
            AsmItem::Instr(p1_instr(
                "add",
                vec![
                    op_reg("x"),
                    AsmOperand {
                        expr: Expr::Int(1),
                        imm: ImmMarker::Small,
                    },
                ],
            )),
            AsmItem::Instr(p1_instr(
                "jmp",
                vec![AsmOperand {
                    expr: Expr::Ident("again".to_string()),
                    imm: ImmMarker::Small,
                }],
            )),
        ],
        flags: AsmFlags {
            volatile_block: false,
            fcache: true,
        },
    }];
    m.functions.push(f);

    let text = compile_to_text(IsaKind::P1, m);
    assert!(text.contains("\tcall\t#LMM_FCACHE_LOAD\n"), "got: {}", text);
    assert!(
        text.contains("\tjmp\t#LMM_FCACHE_START + ("),
        "window jump missing: {}",
        text
    );
}

#[test]
fn division_goes_through_cog_routine() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("a", Type::long()), local("q", Type::long())];
    f.body = vec![assign(
        "q",
        Expr::Binop(
            Op::Div,
            Box::new(Expr::Ident("a".to_string())),
            Box::new(Expr::Int(10)),
        ),
    )];
    m.functions.push(f);
    let text = compile_to_text(IsaKind::P1, m);
    assert!(text.contains("\tcall\t#divide_\n"), "got: {}", text);
    assert!(text.contains("\tmov\targ00, _start_a\n"), "got: {}", text);
}

#[test]
fn while_loop_shape() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("n", Type::long())];
    f.body = vec![Stmt::While {
        cond: Expr::Binop(
            Op::Gt,
            Box::new(Expr::Ident("n".to_string())),
            Box::new(Expr::Int(0)),
        ),
        body: vec![assign(
            "n",
            Expr::Binop(
                Op::Sub,
                Box::new(Expr::Ident("n".to_string())),
                Box::new(Expr::Int(1)),
            ),
        )],
    }];
    m.functions.push(f);
    let text = compile_to_text(IsaKind::P1, m);
    // signed compare with flags, inverted branch out of the loop
    assert!(text.contains("\tcmps\t_start_n, #0 wc,wz\n"), "got: {}", text);
    assert!(text.contains(" if_be\tjmp\t#LR__"), "got: {}", text);
}

#[test]
fn degraded_mode_emits_wrapper_and_prefixed_labels() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("blink", Language::Spin);
    f.params = vec![local("pin", Type::long())];
    f.body = vec![];
    m.functions.push(f);

    let mut ctx = CompileContext::new(Options {
        isa: IsaKind::P1,
        output: OutputMode::DegradedAsm,
        ..Options::default()
    });
    let id = ctx.add_module(m.clone());
    let lowered = compile_module(&mut ctx, id).expect("compiles");
    let text = ir_assemble(&mut ctx, &lowered.list, Some(&m));
    // the wrapper object precedes the DAT section
    assert!(text.contains("PUB __coginit(id)"), "got: {}", text);
    assert!(text.contains("PUB blink(pin)"));
    // the compiled function label carries the pasm_ prefix
    assert!(text.contains("pasm_blink\n"), "got: {}", text);
    // the fixup chain terminator always appears
    assert!(text.contains("__fixup_ptr\n"));
}

#[test]
fn output_is_deterministic() {
    let build = || {
        let mut m = Module::new("main", Language::Spin);
        let mut f = Function::new("start", Language::Spin);
        f.locals = vec![local("x", Type::long())];
        f.body = vec![
            assign("x", Expr::Int(600)),
            Stmt::If {
                cond: Expr::Binop(
                    Op::Eq,
                    Box::new(Expr::Ident("x".to_string())),
                    Box::new(Expr::Int(0)),
                ),
                then_body: vec![assign("x", Expr::Int(1))],
                else_body: vec![assign("x", Expr::Int(2))],
            },
        ];
        m.functions.push(f);
        compile_to_text(IsaKind::P1, m)
    };
    assert_eq!(build(), build());
}

#[test]
fn p1_big_immediate_is_pooled() {
    let mut m = Module::new("main", Language::Spin);
    let mut f = Function::new("start", Language::Spin);
    f.locals = vec![local("x", Type::long())];
    f.body = vec![assign("x", Expr::Int(0x8000))];
    m.functions.push(f);
    let text = compile_to_text(IsaKind::P1, m.clone());
    // value lives in a labeled cog long, referenced by name
    assert!(text.contains("\tmov\t_start_x, imm_32768_\n"), "got: {}", text);
    assert!(text.contains("imm_32768_\n\tlong\t32768\n"), "got: {}", text);

    // the same program on P2 uses a ## immediate instead
    let text2 = compile_to_text(IsaKind::P2, m);
    assert!(text2.contains("\tmov\t_start_x, ##32768\n"), "got: {}", text2);
    assert!(!text2.contains("imm_32768_"));
}

#[test]
fn small_immediates_match_on_both_isas() {
    for isa in [IsaKind::P1, IsaKind::P2] {
        let mut m = Module::new("main", Language::Spin);
        let mut f = Function::new("start", Language::Spin);
        f.locals = vec![local("x", Type::long())];
        f.body = vec![assign("x", Expr::Int(0x1f0))];
        m.functions.push(f);
        let text = compile_to_text(isa, m);
        assert!(text.contains("\tmov\t_start_x, #496\n"), "got: {}", text);
    }
}
