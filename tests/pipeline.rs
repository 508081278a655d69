//! End-to-end pipeline tests: functions built through the Expr /
//! CodeBlob API, compiled to assembly, and checked against the
//! canonical instruction sequences.

use enumset::EnumSet;

use tolkc::expr::ExprKind;
use tolkc::ir::VarKind;
use tolkc::{
    CodeBlob, CompilerConfig, CompilerContext, Expr, FnFlag, FunctionBody, OptimizationLevel,
    SrcLocation, TypeRef,
};

fn loc() -> SrcLocation {
    SrcLocation::default()
}

fn new_ctx() -> CompilerContext {
    CompilerContext::new(CompilerConfig::default())
}

fn compile(ctx: &mut CompilerContext) -> String {
    let mut buf = Vec::new();
    ctx.compile_to(&mut buf).expect("compilation failed");
    String::from_utf8(buf).expect("utf8 output")
}

/// The instruction lines of one PROC body, trimmed, brackets included.
fn proc_body(output: &str, name: &str) -> Vec<String> {
    let header = format!("{} PROC:<{{", name);
    let mut lines = output.lines();
    for line in lines.by_ref() {
        if line.trim() == header {
            break;
        }
    }
    let mut depth = 1usize;
    let mut body = Vec::new();
    for line in lines {
        let t = line.trim();
        if t.ends_with(":<{") {
            depth += 1;
        } else if t == "}>" {
            depth -= 1;
            if depth == 0 {
                return body;
            }
        }
        body.push(t.to_string());
    }
    panic!("unterminated body of {}", name);
}

fn define_simple(
    ctx: &mut CompilerContext,
    name: &str,
    params: Vec<TypeRef>,
    ret: TypeRef,
    build: impl FnOnce(&mut CompilerContext, &mut CodeBlob, Vec<usize>),
) {
    let param_tensor = ctx.types.new_tensor(params.clone());
    let fty = ctx.types.new_map(param_tensor, ret);
    let mut blob = CodeBlob::new(name, loc(), ret);
    let idxs = blob.import_params(params.into_iter().map(|t| (t, None, loc())).collect());
    build(ctx, &mut blob, idxs);
    ctx.define_function(name, fty, EnumSet::empty(), FunctionBody::Code(blob), loc())
        .unwrap();
}

#[test]
fn test_s1_identity_compiles_to_nothing() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "id", vec![int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0]]);
    });
    let out = compile(&mut ctx);
    assert!(proc_body(&out, "id").is_empty());
}

#[test]
fn test_s2_swap_reduces_to_single_swap() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    let pair = ctx.types.new_tensor(vec![int, int]);
    define_simple(&mut ctx, "swap2", vec![int, int], pair, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[1], xs[0]]);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "swap2"), vec!["SWAP"]);
}

#[test]
fn test_s3_add3_is_two_adds_without_fixups() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "add3", vec![int, int, int], int, |ctx, blob, xs| {
        let add = ctx.lookup_function("_+_").unwrap();
        let inner = Expr::apply(
            add,
            vec![Expr::var(xs[1], loc()), Expr::var(xs[2], loc())],
            loc(),
        );
        let mut e = Expr::apply(add, vec![Expr::var(xs[0], loc()), inner], loc());
        e.deduce_type(ctx, blob).unwrap();
        let vals = e.pre_compile(ctx, blob, None).unwrap();
        blob.emit_return(loc(), vals);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "add3"), vec!["ADD", "ADD"]);
}

#[test]
fn test_s4_dup_reduces_to_single_dup() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    let pair = ctx.types.new_tensor(vec![int, int]);
    define_simple(&mut ctx, "dup2x", vec![int], pair, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0], xs[0]]);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "dup2x"), vec!["DUP"]);
}

#[test]
fn test_s5_if_with_returning_branches_needs_no_merge_fixup() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "choose", vec![int], int, |_, blob, xs| {
        blob.emit_if(
            loc(),
            xs[0],
            |c| {
                let t = c.create_tmp_var(int, loc());
                c.push_op(
                    tolkc::Op::new(loc(), tolkc::OpKind::IntConst(1)).with_left(vec![t]),
                );
                c.emit_return(loc(), vec![t]);
            },
            |c| {
                let t = c.create_tmp_var(int, loc());
                c.push_op(
                    tolkc::Op::new(loc(), tolkc::OpKind::IntConst(2)).with_left(vec![t]),
                );
                c.emit_return(loc(), vec![t]);
            },
        );
    });
    let out = compile(&mut ctx);
    assert_eq!(
        proc_body(&out, "choose"),
        vec!["IFJMP:<{", "1 PUSHINT", "}>", "2 PUSHINT"]
    );
}

/// S6: the polymorphic `first` is compiled per instantiation; the
/// discarded component costs one drop per scalar.
#[test]
fn test_s6_first_instantiations_drop_split_components() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    let int2 = ctx.types.new_tensor(vec![int, int]);

    for (name, x_ty, y_ty) in [("first_ii", int, int), ("first_it", int, int2)] {
        let p_ty = ctx.types.new_tensor(vec![x_ty, y_ty]);
        define_simple(&mut ctx, name, vec![p_ty], x_ty, |ctx, blob, xs| {
            let a = blob.create_var(VarKind::Named.into(), x_ty, Some("a".into()), loc());
            let b = blob.create_var(VarKind::Named.into(), y_ty, Some("b".into()), loc());
            let mut e = Expr::new(
                ExprKind::Letop {
                    lhs: Box::new(Expr::tensor(
                        vec![Expr::var(a, loc()), Expr::var(b, loc())],
                        loc(),
                    )),
                    rhs: Box::new(Expr::var(xs[0], loc())),
                },
                loc(),
            );
            e.deduce_type(ctx, blob).unwrap();
            e.pre_compile(ctx, blob, None).unwrap();
            blob.emit_return(loc(), vec![a]);
        });
    }
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "first_ii"), vec!["DROP"]);
    assert_eq!(proc_body(&out, "first_it"), vec!["2DROP"]);
}

#[test]
fn test_if_merge_fixes_up_the_second_branch() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    // pick(c, a, b) = c ? a : b
    define_simple(&mut ctx, "pick", vec![int, int, int], int, |ctx, blob, xs| {
        let mut e = Expr::new(
            ExprKind::CondExpr {
                cond: Box::new(Expr::var(xs[0], loc())),
                then_expr: Box::new(Expr::var(xs[1], loc())),
                else_expr: Box::new(Expr::var(xs[2], loc())),
            },
            loc(),
        );
        e.deduce_type(ctx, blob).unwrap();
        let vals = e.pre_compile(ctx, blob, None).unwrap();
        blob.emit_return(loc(), vals);
    });
    let out = compile(&mut ctx);
    assert_eq!(
        proc_body(&out, "pick"),
        vec!["ROT", "IF:<{", "DROP", "}>ELSE<{", "NIP", "}>"]
    );
}

#[test]
fn test_try_catch_with_early_return_saves_c2() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "safe_div", vec![int, int], int, |ctx, blob, xs| {
        let div = ctx.lookup_function("_/_").unwrap();
        let q = blob.create_tmp_var(int, loc());
        let e = blob.create_tmp_var(int, loc());
        let n = blob.create_tmp_var(int, loc());
        let zero = blob.create_tmp_var(int, loc());
        let (a, b) = (xs[0], xs[1]);
        blob.emit_try_catch(
            loc(),
            &mut ctx.types,
            (e, n),
            |c| {
                c.push_op(
                    tolkc::Op::new(loc(), tolkc::OpKind::Call(div))
                        .with_left(vec![q])
                        .with_right(vec![a, b]),
                );
                c.emit_return(loc(), vec![q]);
            },
            |c| {
                c.push_op(
                    tolkc::Op::new(loc(), tolkc::OpKind::IntConst(0)).with_left(vec![zero]),
                );
                c.emit_return(loc(), vec![zero]);
            },
        );
    });
    let out = compile(&mut ctx);
    let body = proc_body(&out, "safe_div");
    assert_eq!(body[0], "c2 SAVE");
    assert_eq!(body[1], "SAMEALTSAVE");
    assert_eq!(body[2], "TRY:<{");
    assert!(body.contains(&"DIV".to_string()));
    assert!(body.contains(&"RETALT".to_string()));
    assert!(body.contains(&"}>CATCH<{".to_string()));
    assert!(body.contains(&"0 PUSHINT".to_string()));
}

#[test]
fn test_constant_folding_reaches_the_output() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "five", vec![], int, |ctx, blob, _| {
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(add, vec![Expr::int(2, loc()), Expr::int(3, loc())], loc());
        e.deduce_type(ctx, blob).unwrap();
        let vals = e.pre_compile(ctx, blob, None).unwrap();
        blob.emit_return(loc(), vals);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "five"), vec!["5 PUSHINT"]);
}

#[test]
fn test_while_loop_shape() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "count", vec![int], int, |ctx, blob, xs| {
        let x = xs[0];
        let lt = ctx.lookup_function("_<_").unwrap();
        let add = ctx.lookup_function("_+_").unwrap();

        blob.begin_block();
        let mut cond = Expr::apply(
            lt,
            vec![Expr::var(x, loc()), Expr::int(10, loc())],
            loc(),
        );
        cond.deduce_type(ctx, blob).unwrap();
        let cond_var = cond.pre_compile(ctx, blob, None).unwrap()[0];
        let cond_ops = blob.end_block();

        blob.begin_block();
        let mut step = Expr::new(
            ExprKind::Letop {
                lhs: Box::new(Expr::var(x, loc())),
                rhs: Box::new(Expr::apply(
                    add,
                    vec![Expr::var(x, loc()), Expr::int(1, loc())],
                    loc(),
                )),
            },
            loc(),
        );
        step.deduce_type(ctx, blob).unwrap();
        step.pre_compile(ctx, blob, None).unwrap();
        let body_ops = blob.end_block();

        blob.push_op(
            tolkc::Op::new(
                loc(),
                tolkc::OpKind::While {
                    cond: cond_ops,
                    body: body_ops,
                },
            )
            .with_right(vec![cond_var]),
        );
        blob.emit_return(loc(), vec![x]);
    });
    let out = compile(&mut ctx);
    assert_eq!(
        proc_body(&out, "count"),
        vec!["WHILE:<{", "DUP", "10 LESSINT", "}>DO<{", "INC", "}>"]
    );
}

#[test]
fn test_repeat_loop_shape() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "dbl", vec![int, int], int, |ctx, blob, xs| {
        let (x, n) = (xs[0], xs[1]);
        let mul = ctx.lookup_function("_*_").unwrap();
        blob.emit_repeat(loc(), n, |c| {
            let mut step = Expr::new(
                ExprKind::Letop {
                    lhs: Box::new(Expr::var(x, loc())),
                    rhs: Box::new(Expr::apply(
                        mul,
                        vec![Expr::var(x, loc()), Expr::int(2, loc())],
                        loc(),
                    )),
                },
                loc(),
            );
            step.deduce_type(ctx, c).unwrap();
            step.pre_compile(ctx, c, None).unwrap();
        });
        blob.emit_return(loc(), vec![x]);
    });
    let out = compile(&mut ctx);
    assert_eq!(
        proc_body(&out, "dbl"),
        vec!["REPEAT:<{", "1 LSHIFT#", "}>"]
    );
}

#[test]
fn test_throw_prunes_tail_and_declares_nothing_after() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "fail", vec![], int, |ctx, blob, _| {
        let throw = ctx.lookup_function("throw").unwrap();
        let mut e = Expr::apply(throw, vec![Expr::int(42, loc())], loc());
        e.deduce_type(ctx, blob).unwrap();
        e.pre_compile(ctx, blob, None).unwrap();
        // unreachable trailer the pruner must cut
        let t = blob.create_tmp_var(int, loc());
        blob.push_op(tolkc::Op::new(loc(), tolkc::OpKind::IntConst(0)).with_left(vec![t]));
        blob.emit_return(loc(), vec![t]);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "fail"), vec!["42 THROW"]);
}

#[test]
fn test_get_method_is_declared_with_method_id() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    let unit = ctx.types.new_unit();
    let fty = ctx.types.new_map(unit, int);
    let mut blob = CodeBlob::new("seqno", loc(), int);
    blob.import_params(vec![]);
    let t = blob.create_tmp_var(int, loc());
    blob.push_op(tolkc::Op::new(loc(), tolkc::OpKind::IntConst(7)).with_left(vec![t]));
    blob.emit_return(loc(), vec![t]);
    ctx.define_function(
        "seqno",
        fty,
        FnFlag::GetMethod.into(),
        FunctionBody::Code(blob),
        loc(),
    )
    .unwrap();

    let out = compile(&mut ctx);
    let expected_id = tolkc::context::method_id_for("seqno");
    assert!(out.contains(&format!("{} DECLMETHOD seqno", expected_id)));
    assert_eq!(proc_body(&out, "seqno"), vec!["7 PUSHINT"]);
}

#[test]
fn test_remove_unused_functions_pragma() {
    let mut ctx = new_ctx();
    ctx.config.pragmas.remove_unused_functions.enable();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "main", vec![int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0]]);
    });
    define_simple(&mut ctx, "orphan", vec![int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0]]);
    });
    let out = compile(&mut ctx);
    assert!(out.contains("main PROC:<{"));
    assert!(!out.contains("orphan"));
}

#[test]
fn test_inline_function_body_is_spliced() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    let i_i = ctx.types.new_map(int, int);

    // inc7 is inline: its body lands inside the caller
    let mut blob = CodeBlob::new("inc7", loc(), int);
    let xs = blob.import_params(vec![(int, None, loc())]);
    {
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(
            add,
            vec![Expr::var(xs[0], loc()), Expr::int(7, loc())],
            loc(),
        );
        let vals = {
            e.deduce_type(&mut ctx, &blob).unwrap();
            e.pre_compile(&mut ctx, &mut blob, None).unwrap()
        };
        blob.emit_return(loc(), vals);
    }
    let inc7 = ctx
        .define_function(
            "inc7",
            i_i,
            FnFlag::Inline.into(),
            FunctionBody::Code(blob),
            loc(),
        )
        .unwrap();

    define_simple(&mut ctx, "caller", vec![int], int, |ctx, blob, xs| {
        let mut e = Expr::apply(inc7, vec![Expr::var(xs[0], loc())], loc());
        e.deduce_type(ctx, blob).unwrap();
        let vals = e.pre_compile(ctx, blob, None).unwrap();
        blob.emit_return(loc(), vals);
    });

    let out = compile(&mut ctx);
    assert!(!out.contains("inc7 PROC"));
    assert!(!out.contains("CALLDICT"));
    assert_eq!(proc_body(&out, "caller"), vec!["7 ADDCONST"]);
}

#[test]
fn test_user_call_emits_calldict() {
    let mut ctx = new_ctx();
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "helper", vec![int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0]]);
    });
    let helper = ctx.lookup_function("helper").unwrap();
    define_simple(&mut ctx, "entry", vec![int], int, |ctx, blob, xs| {
        let mut e = Expr::apply(helper, vec![Expr::var(xs[0], loc())], loc());
        e.deduce_type(ctx, blob).unwrap();
        let vals = e.pre_compile(ctx, blob, None).unwrap();
        blob.emit_return(loc(), vals);
    });
    let out = compile(&mut ctx);
    assert_eq!(proc_body(&out, "entry"), vec!["helper CALLDICT"]);
}

#[test]
fn test_stack_comments_mode() {
    let mut ctx = CompilerContext::new(CompilerConfig::new().with_stack_comments(true));
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "swap2", vec![int, int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[1], xs[0]]);
    });
    let out = compile(&mut ctx);
    assert!(out.contains("// stack:"));
}

#[test]
fn test_program_wrapper_shape() {
    let mut ctx = CompilerContext::new(CompilerConfig::new().with_generated_from("demo.tolk"));
    let int = ctx.types.new_atomic(tolkc::Atomic::Int);
    define_simple(&mut ctx, "id", vec![int], int, |_, blob, xs| {
        blob.emit_return(loc(), vec![xs[0]]);
    });
    let out = compile(&mut ctx);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines[0], "\"Asm.fif\" include");
    assert_eq!(lines[1], "// automatically generated from demo.tolk");
    assert_eq!(lines[2], "PROGRAM{");
    assert!(lines.contains(&"  DECLPROC id"));
    assert_eq!(*lines.last().unwrap(), "}END>c");
}

#[test]
fn test_listing_round_trip_through_files() {
    use std::fs;
    use std::io::Write as _;

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("noise.fif");
    let mut f = fs::File::create(&input).unwrap();
    writeln!(f, "SWAP").unwrap();
    writeln!(f, "SWAP").unwrap();
    writeln!(f, "s0 s1 XCHG").unwrap();
    writeln!(f, "ADD").unwrap();
    drop(f);

    let source = fs::read_to_string(&input).unwrap();
    let optimized = tolkc::optimize_listing(&source, OptimizationLevel::O2);
    let output = dir.path().join("noise.opt.fif");
    fs::write(&output, &optimized).unwrap();
    assert_eq!(fs::read_to_string(&output).unwrap(), "SWAP\nADD\n");
}
