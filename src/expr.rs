//! Expression trees
//!
//! The front-end hands the core a tree of [`Expr`] nodes per statement.
//! `deduce_type` propagates types bottom-up, unifying against the
//! context's expectations and marking r/l-value status; `pre_compile`
//! then lowers the tree into IR ops appended to a [`CodeBlob`],
//! returning the virtual variables holding the result.
//!
//! Assignments to globals do not write directly: the lowered value
//! lands in a temporary and the caller receives `(global, tmp)` pairs
//! so it can emit the trailing `SetGlob`s itself (or the expression
//! emits them immediately when no side list is supplied).

use enumset::{EnumSet, EnumSetType};

use crate::context::{CompilerContext, FnFlag, FunId, GlobId};
use crate::ir::{CodeBlob, Op, OpKind, SrcLocation, VarIdx};
use crate::types::TypeRef;
use crate::unification::{instantiate, unify};
use crate::CompileError;

#[derive(EnumSetType, Debug)]
pub enum ExprFlag {
    IsType,
    IsRvalue,
    IsLvalue,
    IsImpure,
    IsInsideParenthesis,
}

#[derive(Debug)]
pub enum ExprKind {
    /// Direct application of a named function.
    Apply { fun: FunId, args: Vec<Expr> },
    /// Application of a first-class function value.
    VarApply { fun: Box<Expr>, args: Box<Expr> },
    /// Explicit coercion; width-checked, no runtime code.
    TypeApply { target: TypeRef, inner: Box<Expr> },
    MkTuple { inner: Box<Expr> },
    Tensor { items: Vec<Expr> },
    IntConst(i128),
    SliceConst(String),
    Var { idx: VarIdx },
    GlobFunc { fun: FunId },
    GlobVar { glob: GlobId },
    /// `lhs = rhs`; evaluates to the assigned value.
    Letop { lhs: Box<Expr>, rhs: Box<Expr> },
    /// `lhs` receives the leading components of `rhs`; the rest is the
    /// expression's value (modifying-method calls).
    LetFirst { lhs: Box<Expr>, rhs: Box<Expr> },
    CondExpr {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// The `_` discard pattern.
    Hole,
    /// A bare type in expression position.
    Type { ty: TypeRef },
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub flags: EnumSet<ExprFlag>,
    pub ty: Option<TypeRef>,
    pub loc: SrcLocation,
}

impl Expr {
    pub fn new(kind: ExprKind, loc: SrcLocation) -> Self {
        Expr {
            kind,
            flags: EnumSet::empty(),
            ty: None,
            loc,
        }
    }

    pub fn int(v: i128, loc: SrcLocation) -> Self {
        Expr::new(ExprKind::IntConst(v), loc)
    }

    pub fn var(idx: VarIdx, loc: SrcLocation) -> Self {
        Expr::new(ExprKind::Var { idx }, loc)
    }

    pub fn apply(fun: FunId, args: Vec<Expr>, loc: SrcLocation) -> Self {
        Expr::new(ExprKind::Apply { fun, args }, loc)
    }

    pub fn tensor(items: Vec<Expr>, loc: SrcLocation) -> Self {
        Expr::new(ExprKind::Tensor { items }, loc)
    }

    pub fn is_rvalue(&self) -> bool {
        self.flags.contains(ExprFlag::IsRvalue)
    }

    pub fn is_lvalue(&self) -> bool {
        self.flags.contains(ExprFlag::IsLvalue)
    }

    pub fn is_impure(&self) -> bool {
        self.flags.contains(ExprFlag::IsImpure)
    }

    fn typed(&self) -> Result<TypeRef, CompileError> {
        self.ty
            .ok_or_else(|| CompileError::internal("expression lowered before type deduction"))
    }

    pub fn chk_rvalue(&self) -> Result<(), CompileError> {
        if self.is_rvalue() {
            Ok(())
        } else {
            Err(CompileError::semantic(
                self.loc,
                "rvalue expected".to_string(),
            ))
        }
    }

    pub fn chk_lvalue(&self) -> Result<(), CompileError> {
        if self.is_lvalue() {
            Ok(())
        } else {
            Err(CompileError::semantic(
                self.loc,
                "lvalue expected".to_string(),
            ))
        }
    }

    /// Deduce and store the type of this expression bottom-up,
    /// unifying children against what the context requires.
    pub fn deduce_type(
        &mut self,
        ctx: &mut CompilerContext,
        code: &CodeBlob,
    ) -> Result<TypeRef, CompileError> {
        use crate::types::Atomic;
        let loc = self.loc;
        let ty = match &mut self.kind {
            ExprKind::IntConst(_) => {
                self.flags |= ExprFlag::IsRvalue;
                ctx.types.new_atomic(Atomic::Int)
            }
            ExprKind::SliceConst(_) => {
                self.flags |= ExprFlag::IsRvalue;
                ctx.types.new_atomic(Atomic::Slice)
            }
            ExprKind::Var { idx } => {
                self.flags |= ExprFlag::IsRvalue | ExprFlag::IsLvalue;
                code.vars[*idx].ty
            }
            ExprKind::Hole => {
                self.flags |= ExprFlag::IsLvalue;
                ctx.types.new_hole()
            }
            ExprKind::Type { ty } => {
                self.flags |= ExprFlag::IsType;
                *ty
            }
            ExprKind::GlobVar { glob } => {
                self.flags |= ExprFlag::IsRvalue | ExprFlag::IsLvalue | ExprFlag::IsImpure;
                ctx.glob(*glob).ty
            }
            ExprKind::GlobFunc { fun } => {
                self.flags |= ExprFlag::IsRvalue;
                let id = *fun;
                ctx.fun_mut(id).flags |= FnFlag::UsedAsNonCall;
                instantiate(&mut ctx.types, ctx.functions[id.0 as usize].ty)
            }
            ExprKind::Apply { fun, args } => {
                let fun = *fun;
                let mut arg_tys = Vec::with_capacity(args.len());
                for a in args.iter_mut() {
                    arg_tys.push(a.deduce_type(ctx, code)?);
                    a.chk_rvalue()?;
                }
                let f = ctx.fun(fun);
                if !f.is_pure() {
                    self.flags |= ExprFlag::IsImpure;
                }
                let fty = instantiate(&mut ctx.types, ctx.functions[fun.0 as usize].ty);
                let arg_tensor = ctx.types.new_tensor(arg_tys);
                let ret = ctx.types.new_hole();
                let expected = ctx.types.new_map(arg_tensor, ret);
                unify(&mut ctx.types, fty, expected)
                    .map_err(|e| CompileError::unify(loc, e))?;
                self.flags |= ExprFlag::IsRvalue;
                ret
            }
            ExprKind::VarApply { fun, args } => {
                let fun_ty = fun.deduce_type(ctx, code)?;
                fun.chk_rvalue()?;
                let arg_ty = args.deduce_type(ctx, code)?;
                args.chk_rvalue()?;
                let ret = ctx.types.new_hole();
                let expected = ctx.types.new_map(arg_ty, ret);
                unify(&mut ctx.types, fun_ty, expected)
                    .map_err(|e| CompileError::unify(loc, e))?;
                self.flags |= ExprFlag::IsRvalue | ExprFlag::IsImpure;
                ret
            }
            ExprKind::TypeApply { target, inner } => {
                let target = *target;
                let inner_ty = inner.deduce_type(ctx, code)?;
                let (imin, imax) = ctx.types.width_range(inner_ty);
                let (tmin, tmax) = ctx.types.width_range(target);
                if imin.max(tmin) > imax.min(tmax) {
                    return Err(CompileError::semantic(
                        loc,
                        format!(
                            "cannot cast {} to {}: incompatible widths",
                            ctx.types.show(inner_ty),
                            ctx.types.show(target)
                        ),
                    ));
                }
                self.flags |= inner.flags & (ExprFlag::IsRvalue | ExprFlag::IsLvalue);
                target
            }
            ExprKind::MkTuple { inner } => {
                let inner_ty = inner.deduce_type(ctx, code)?;
                inner.chk_rvalue()?;
                self.flags |= ExprFlag::IsRvalue;
                ctx.types.new_tuple(inner_ty)
            }
            ExprKind::Tensor { items } => {
                let mut tys = Vec::with_capacity(items.len());
                let mut rv = true;
                let mut lv = true;
                for it in items.iter_mut() {
                    tys.push(it.deduce_type(ctx, code)?);
                    rv &= it.is_rvalue();
                    lv &= it.is_lvalue();
                }
                if rv {
                    self.flags |= ExprFlag::IsRvalue;
                }
                if lv {
                    self.flags |= ExprFlag::IsLvalue;
                }
                ctx.types.new_tensor(tys)
            }
            ExprKind::Letop { lhs, rhs } => {
                let rhs_ty = rhs.deduce_type(ctx, code)?;
                rhs.chk_rvalue()?;
                let lhs_ty = lhs.deduce_type(ctx, code)?;
                lhs.chk_lvalue()?;
                unify(&mut ctx.types, lhs_ty, rhs_ty)
                    .map_err(|e| CompileError::unify(loc, e))?;
                self.flags |= ExprFlag::IsRvalue;
                lhs_ty
            }
            ExprKind::LetFirst { lhs, rhs } => {
                let rhs_ty = rhs.deduce_type(ctx, code)?;
                rhs.chk_rvalue()?;
                let lhs_ty = lhs.deduce_type(ctx, code)?;
                lhs.chk_lvalue()?;
                let rest = ctx.types.new_hole();
                let expected = ctx.types.new_tensor(vec![lhs_ty, rest]);
                unify(&mut ctx.types, rhs_ty, expected)
                    .map_err(|e| CompileError::unify(loc, e))?;
                self.flags |= ExprFlag::IsRvalue;
                rest
            }
            ExprKind::CondExpr {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond_ty = cond.deduce_type(ctx, code)?;
                cond.chk_rvalue()?;
                let int = ctx.types.new_atomic(Atomic::Int);
                unify(&mut ctx.types, cond_ty, int)
                    .map_err(|e| CompileError::unify(loc, e))?;
                let t0 = then_expr.deduce_type(ctx, code)?;
                then_expr.chk_rvalue()?;
                let t1 = else_expr.deduce_type(ctx, code)?;
                else_expr.chk_rvalue()?;
                unify(&mut ctx.types, t0, t1).map_err(|e| CompileError::unify(loc, e))?;
                self.flags |= ExprFlag::IsRvalue;
                t0
            }
        };
        self.ty = Some(ty);
        Ok(ty)
    }

    /// Lower this (typed) expression into ops appended to `code`,
    /// returning the variables holding its value.
    pub fn pre_compile(
        &self,
        ctx: &mut CompilerContext,
        code: &mut CodeBlob,
        mut lval_globs: Option<&mut Vec<(GlobId, VarIdx)>>,
    ) -> Result<Vec<VarIdx>, CompileError> {
        let loc = self.loc;
        match &self.kind {
            ExprKind::IntConst(v) => {
                let t = code.create_tmp_var(self.typed()?, loc);
                code.push_op(Op::new(loc, OpKind::IntConst(*v)).with_left(vec![t]));
                Ok(vec![t])
            }
            ExprKind::SliceConst(s) => {
                let t = code.create_tmp_var(self.typed()?, loc);
                code.push_op(Op::new(loc, OpKind::SliceConst(s.clone())).with_left(vec![t]));
                Ok(vec![t])
            }
            ExprKind::Var { idx } => Ok(vec![*idx]),
            ExprKind::GlobVar { glob } => {
                let t = code.create_tmp_var(self.typed()?, loc);
                let mut op = Op::new(loc, OpKind::GlobVar(*glob)).with_left(vec![t]);
                op.set_impure();
                code.push_op(op);
                Ok(vec![t])
            }
            ExprKind::GlobFunc { .. } => Err(CompileError::semantic(
                loc,
                "taking a function as a first-class value is not supported here".to_string(),
            )),
            ExprKind::Hole => Err(CompileError::semantic(
                loc,
                "`_` cannot be used as a value".to_string(),
            )),
            ExprKind::Type { .. } => Err(CompileError::semantic(
                loc,
                "a type cannot be used as a value".to_string(),
            )),
            ExprKind::Tensor { items } => {
                let mut out = Vec::new();
                for it in items {
                    out.extend(it.pre_compile(ctx, code, lval_globs.as_deref_mut())?);
                }
                Ok(out)
            }
            ExprKind::MkTuple { inner } => {
                let vals = inner.pre_compile(ctx, code, None)?;
                let t = code.create_tmp_var(self.typed()?, loc);
                code.push_op(
                    Op::new(loc, OpKind::Tuple)
                        .with_left(vec![t])
                        .with_right(vals),
                );
                Ok(vec![t])
            }
            ExprKind::Apply { fun, args } => {
                let mut right = Vec::new();
                for a in args {
                    right.extend(a.pre_compile(ctx, code, None)?);
                }
                let t = code.create_tmp_var(self.typed()?, loc);
                let mut op = Op::new(loc, OpKind::Call(*fun))
                    .with_left(vec![t])
                    .with_right(right);
                if self.is_impure() {
                    op.set_impure();
                }
                code.push_op(op);
                Ok(vec![t])
            }
            ExprKind::VarApply { fun, args } => {
                let mut right = args.pre_compile(ctx, code, None)?;
                let fun_var = fun.pre_compile(ctx, code, None)?;
                right.extend(fun_var);
                let t = code.create_tmp_var(self.typed()?, loc);
                let mut op = Op::new(loc, OpKind::CallInd)
                    .with_left(vec![t])
                    .with_right(right);
                op.set_impure();
                code.push_op(op);
                Ok(vec![t])
            }
            ExprKind::TypeApply { inner, .. } => {
                // a pure compile-time reinterpretation
                inner.pre_compile(ctx, code, lval_globs)
            }
            ExprKind::CondExpr {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond_vars = cond.pre_compile(ctx, code, None)?;
                let t = code.create_tmp_var(self.typed()?, loc);
                code.begin_block();
                let vals = then_expr.pre_compile(ctx, code, None)?;
                code.push_op(Op::new(loc, OpKind::Let).with_left(vec![t]).with_right(vals));
                let then_block = code.end_block();
                code.begin_block();
                let vals = else_expr.pre_compile(ctx, code, None)?;
                code.push_op(Op::new(loc, OpKind::Let).with_left(vec![t]).with_right(vals));
                let else_block = code.end_block();
                code.push_op(
                    Op::new(
                        loc,
                        OpKind::If {
                            then_block,
                            else_block,
                        },
                    )
                    .with_right(vec![cond_vars[0]]),
                );
                Ok(vec![t])
            }
            ExprKind::Letop { lhs, rhs } => {
                let vals = rhs.pre_compile(ctx, code, None)?;
                lhs.lower_lvalue(ctx, code, &vals, &mut lval_globs)?;
                Ok(vals)
            }
            ExprKind::LetFirst { lhs, rhs } => {
                let vals = rhs.pre_compile(ctx, code, None)?;
                let k = lhs.lvalue_slots();
                if vals.len() < k {
                    return Err(CompileError::internal(
                        "modifying call produced fewer values than the pattern needs",
                    ));
                }
                lhs.lower_lvalue(ctx, code, &vals[..k], &mut lval_globs)?;
                Ok(vals[k..].to_vec())
            }
        }
    }

    /// How many value slots this lvalue pattern consumes.
    fn lvalue_slots(&self) -> usize {
        match &self.kind {
            ExprKind::Tensor { items } => items.iter().map(Expr::lvalue_slots).sum(),
            ExprKind::TypeApply { inner, .. } => inner.lvalue_slots(),
            _ => 1,
        }
    }

    /// Flatten an lvalue pattern into one variable per leaf; `_` leaves
    /// get fresh (dead) temporaries.
    fn collect_lvalue_leaves(
        &self,
        code: &mut CodeBlob,
        out: &mut Vec<VarIdx>,
    ) -> Result<(), CompileError> {
        match &self.kind {
            ExprKind::Var { idx } => {
                out.push(*idx);
                Ok(())
            }
            ExprKind::Hole => {
                let ty = self.typed()?;
                out.push(code.create_tmp_var(ty, self.loc));
                Ok(())
            }
            ExprKind::Tensor { items } => {
                for it in items {
                    it.collect_lvalue_leaves(code, out)?;
                }
                Ok(())
            }
            ExprKind::TypeApply { inner, .. } => inner.collect_lvalue_leaves(code, out),
            _ => Err(CompileError::semantic(
                self.loc,
                "pattern too complex for a wide assignment".to_string(),
            )),
        }
    }

    /// Assign `vals` into this lvalue pattern.
    fn lower_lvalue(
        &self,
        ctx: &mut CompilerContext,
        code: &mut CodeBlob,
        vals: &[VarIdx],
        lval_globs: &mut Option<&mut Vec<(GlobId, VarIdx)>>,
    ) -> Result<(), CompileError> {
        let loc = self.loc;
        match &self.kind {
            ExprKind::Var { idx } => {
                if vals.len() != 1 {
                    return Err(CompileError::internal("lvalue arity mismatch"));
                }
                code.push_op(
                    Op::new(loc, OpKind::Let)
                        .with_left(vec![*idx])
                        .with_right(vals.to_vec()),
                );
                Ok(())
            }
            ExprKind::Hole => Ok(()),
            ExprKind::GlobVar { glob } => {
                if vals.len() != 1 {
                    return Err(CompileError::internal("lvalue arity mismatch"));
                }
                match lval_globs {
                    Some(list) => list.push((*glob, vals[0])),
                    None => {
                        let mut op =
                            Op::new(loc, OpKind::SetGlob(*glob)).with_right(vals.to_vec());
                        op.set_impure();
                        code.push_op(op);
                    }
                }
                Ok(())
            }
            ExprKind::Tensor { items } => {
                if self.lvalue_slots() != vals.len() {
                    // a wide value still held by one variable: bind the
                    // whole pattern with a single Let; variable
                    // splitting expands both sides consistently later
                    let mut leaves = Vec::new();
                    self.collect_lvalue_leaves(code, &mut leaves)?;
                    code.push_op(
                        Op::new(loc, OpKind::Let)
                            .with_left(leaves)
                            .with_right(vals.to_vec()),
                    );
                    return Ok(());
                }
                let mut off = 0;
                for it in items {
                    let k = it.lvalue_slots();
                    it.lower_lvalue(ctx, code, &vals[off..off + k], lval_globs)?;
                    off += k;
                }
                Ok(())
            }
            ExprKind::TypeApply { inner, .. } => inner.lower_lvalue(ctx, code, vals, lval_globs),
            _ => Err(CompileError::semantic(
                loc,
                "expression cannot be assigned to".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::types::Atomic;

    fn loc() -> SrcLocation {
        SrcLocation::default()
    }

    fn setup() -> (CompilerContext, TypeRef) {
        let mut ctx = CompilerContext::new(CompilerConfig::default());
        let int = ctx.types.new_atomic(Atomic::Int);
        (ctx, int)
    }

    #[test]
    fn test_apply_deduces_result_type() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc()), (int, None, loc())]);
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(
            add,
            vec![Expr::var(xs[0], loc()), Expr::var(xs[1], loc())],
            loc(),
        );
        let ty = e.deduce_type(&mut ctx, &code).unwrap();
        assert!(ctx.types.equals(ty, int));
        assert!(e.is_rvalue());
    }

    #[test]
    fn test_apply_wrong_arity_fails() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc())]);
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(add, vec![Expr::var(xs[0], loc())], loc());
        assert!(e.deduce_type(&mut ctx, &code).is_err());
    }

    #[test]
    fn test_apply_wrong_type_fails() {
        let (mut ctx, int) = setup();
        let cell = ctx.types.new_atomic(Atomic::Cell);
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(cell, None, loc()), (int, None, loc())]);
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(
            add,
            vec![Expr::var(xs[0], loc()), Expr::var(xs[1], loc())],
            loc(),
        );
        let err = e.deduce_type(&mut ctx, &code).unwrap_err();
        assert!(err.to_string().contains("cannot unify"));
    }

    #[test]
    fn test_polymorphic_builtin_instantiates_per_use() {
        let (mut ctx, int) = setup();
        let cell = ctx.types.new_atomic(Atomic::Cell);
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc()), (cell, None, loc())]);
        let isnull = ctx.lookup_function("null?").unwrap();
        let mut e1 = Expr::apply(isnull, vec![Expr::var(xs[0], loc())], loc());
        let mut e2 = Expr::apply(isnull, vec![Expr::var(xs[1], loc())], loc());
        let t1 = e1.deduce_type(&mut ctx, &code).unwrap();
        let t2 = e2.deduce_type(&mut ctx, &code).unwrap();
        assert!(ctx.types.equals(t1, int));
        assert!(ctx.types.equals(t2, int));
    }

    #[test]
    fn test_pre_compile_emits_call() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc()), (int, None, loc())]);
        let add = ctx.lookup_function("_+_").unwrap();
        let mut e = Expr::apply(
            add,
            vec![Expr::var(xs[0], loc()), Expr::var(xs[1], loc())],
            loc(),
        );
        e.deduce_type(&mut ctx, &code).unwrap();
        let out = e.pre_compile(&mut ctx, &mut code, None).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(code.ops.last().unwrap().kind, OpKind::Call(_)));
        assert_eq!(code.ops.last().unwrap().right, xs);
    }

    #[test]
    fn test_letop_assigns_and_returns_value() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc())]);
        let y = code.create_var(
            crate::ir::VarKind::Named.into(),
            int,
            Some("y".into()),
            loc(),
        );
        let mut e = Expr::new(
            ExprKind::Letop {
                lhs: Box::new(Expr::var(y, loc())),
                rhs: Box::new(Expr::var(xs[0], loc())),
            },
            loc(),
        );
        e.deduce_type(&mut ctx, &code).unwrap();
        let out = e.pre_compile(&mut ctx, &mut code, None).unwrap();
        assert_eq!(out, vec![xs[0]]);
        let last = code.ops.last().unwrap();
        assert!(matches!(last.kind, OpKind::Let));
        assert_eq!(last.left, vec![y]);
    }

    #[test]
    fn test_glob_assignment_goes_to_side_list() {
        let (mut ctx, int) = setup();
        let g = ctx.define_global("counter", int);
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc())]);
        let mut e = Expr::new(
            ExprKind::Letop {
                lhs: Box::new(Expr::new(ExprKind::GlobVar { glob: g }, loc())),
                rhs: Box::new(Expr::var(xs[0], loc())),
            },
            loc(),
        );
        e.deduce_type(&mut ctx, &code).unwrap();
        let mut globs = Vec::new();
        e.pre_compile(&mut ctx, &mut code, Some(&mut globs)).unwrap();
        assert_eq!(globs, vec![(g, xs[0])]);
        // nothing was written yet
        assert!(!code
            .ops
            .iter()
            .any(|op| matches!(op.kind, OpKind::SetGlob(_))));
    }

    #[test]
    fn test_cond_expr_lowers_to_if() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc())]);
        let mut e = Expr::new(
            ExprKind::CondExpr {
                cond: Box::new(Expr::var(xs[0], loc())),
                then_expr: Box::new(Expr::int(1, loc())),
                else_expr: Box::new(Expr::int(2, loc())),
            },
            loc(),
        );
        e.deduce_type(&mut ctx, &code).unwrap();
        let out = e.pre_compile(&mut ctx, &mut code, None).unwrap();
        assert_eq!(out.len(), 1);
        let OpKind::If {
            then_block,
            else_block,
        } = &code.ops.last().unwrap().kind
        else {
            panic!("expected If");
        };
        assert!(matches!(then_block.last().unwrap().kind, OpKind::Let));
        assert!(matches!(else_block.last().unwrap().kind, OpKind::Let));
    }

    #[test]
    fn test_tensor_lvalue_splits_values() {
        let (mut ctx, int) = setup();
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc()), (int, None, loc())]);
        let a = code.create_var(crate::ir::VarKind::Named.into(), int, Some("a".into()), loc());
        let b = code.create_var(crate::ir::VarKind::Named.into(), int, Some("b".into()), loc());
        let mut e = Expr::new(
            ExprKind::Letop {
                lhs: Box::new(Expr::tensor(
                    vec![Expr::var(a, loc()), Expr::var(b, loc())],
                    loc(),
                )),
                rhs: Box::new(Expr::tensor(
                    vec![Expr::var(xs[1], loc()), Expr::var(xs[0], loc())],
                    loc(),
                )),
            },
            loc(),
        );
        e.deduce_type(&mut ctx, &code).unwrap();
        e.pre_compile(&mut ctx, &mut code, None).unwrap();
        let lets: Vec<_> = code
            .ops
            .iter()
            .filter(|o| matches!(o.kind, OpKind::Let))
            .collect();
        assert_eq!(lets.len(), 2);
        assert_eq!(lets[0].left, vec![a]);
        assert_eq!(lets[0].right, vec![xs[1]]);
        assert_eq!(lets[1].left, vec![b]);
        assert_eq!(lets[1].right, vec![xs[0]]);
    }

    #[test]
    fn test_type_apply_checks_width() {
        let (mut ctx, int) = setup();
        let pair = {
            let i = int;
            ctx.types.new_tensor(vec![i, i])
        };
        let mut code = CodeBlob::new("t", loc(), int);
        let xs = code.import_params(vec![(int, None, loc())]);
        let mut bad = Expr::new(
            ExprKind::TypeApply {
                target: pair,
                inner: Box::new(Expr::var(xs[0], loc())),
            },
            loc(),
        );
        let err = bad.deduce_type(&mut ctx, &code).unwrap_err();
        assert!(err.to_string().contains("incompatible widths"));
    }
}
