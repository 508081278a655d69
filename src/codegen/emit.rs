//! Per-op code generation
//!
//! Walks the analyzed IR of one function and materializes it onto the
//! simulated value stack: operands are brought into position, the
//! instruction is emitted, the abstract stack is updated, and dead
//! values are dropped at control-flow points. Branches of an `If` are
//! reconciled by emitting fixups in the second branch; loop back edges
//! re-establish the loop head layout.
//!
//! Early returns from non-tail positions (inside loops, try blocks and
//! inline bodies) go through the alternate return continuation
//! (`RETALT`); the wrapper then saves c2 on entry.

use std::collections::HashMap;

use enumset::EnumSet;

use crate::codegen::asm::{AsmOp, AsmOpList};
use crate::codegen::error::CodegenError;
use crate::codegen::stack::{Stack, StackMode};
use crate::context::{BuiltinCompile, CompilerContext, FunId, FunctionBody};
use crate::descriptors::{VarDescr, VarDescrList};
use crate::ir::{CodeBlob, Op, OpKind};
use crate::optimizer::optimize_code;
use crate::CompileError;

/// Compile one analyzed blob into an optimized instruction list.
pub fn compile_blob(
    blob: &CodeBlob,
    ctx: &CompilerContext,
    inline_bodies: &HashMap<FunId, Vec<AsmOp>>,
    as_inline: bool,
) -> Result<AsmOpList, CompileError> {
    let mut mode: EnumSet<StackMode> = EnumSet::empty();
    if ctx.config.stack_layout_comments {
        mode |= StackMode::StkCmt;
    }
    if as_inline {
        mode |= StackMode::InlineFunc;
    }
    let names: Vec<String> = blob.vars.iter().map(|v| v.show()).collect();
    let mut out = AsmOpList::new();
    {
        let mut st = Stack::new(&mut out, mode, names);
        let gen = Gen { ctx, inline_bodies };
        let tail_live = VarDescrList::new();
        gen.block(&blob.ops, &mut st, true, &tail_live)
            .map_err(|e| CompileError::codegen(&blob.name, e))?;
        let callxargs = blob.require_callxargs.then_some(blob.in_var_cnt);
        st.apply_wrappers(callxargs);
    }
    optimize_code(&mut out, ctx.config.opt_level);
    Ok(out)
}

struct Gen<'a> {
    ctx: &'a CompilerContext,
    inline_bodies: &'a HashMap<FunId, Vec<AsmOp>>,
}

impl Gen<'_> {
    /// Generate a block of ops. `tail` means falling off the end of
    /// this block exits the function; `tail_live` is what must survive
    /// the block's end.
    fn block(
        &self,
        ops: &[Op],
        st: &mut Stack,
        tail: bool,
        tail_live: &VarDescrList,
    ) -> Result<(), CodegenError> {
        for (i, op) in ops.iter().enumerate() {
            if op.disabled() {
                continue;
            }
            st.opt_show();
            let live_after = ops.get(i + 1).map(|o| &o.var_info).unwrap_or(tail_live);
            let is_last = i + 1 == ops.len();
            self.op(op, st, tail && is_last, live_after)?;
        }
        Ok(())
    }

    fn op(
        &self,
        op: &Op,
        st: &mut Stack,
        tail: bool,
        live_after: &VarDescrList,
    ) -> Result<(), CodegenError> {
        match &op.kind {
            OpKind::Nop => Ok(()),
            OpKind::Import => {
                for &v in &op.left {
                    st.push_new_var(v);
                }
                Ok(())
            }
            OpKind::IntConst(v) => {
                if op.left_unused.first().copied().unwrap_or(false) {
                    return Ok(());
                }
                let cidx = st.o.register_const(*v);
                if let Some(j) = st.find_const(cidx) {
                    st.issue_push(j)?;
                    st.rename_top(op.left[0]);
                } else {
                    st.o.add(AsmOp::int_const(*v));
                    st.push_new_const(op.left[0], cidx);
                }
                Ok(())
            }
            OpKind::SliceConst(s) => {
                st.o.add(AsmOp::const_op(format!("x{{{}}} PUSHSLICE", s)));
                st.push_new_var(op.left[0]);
                Ok(())
            }
            OpKind::GlobVar(g) => {
                let name = &self.ctx.glob(*g).name;
                st.o.add(AsmOp::custom(format!("{} GETGLOB", name), 0, 1));
                if op.left.len() > 1 {
                    st.o.add(AsmOp::untuple(op.left.len()));
                }
                for &l in &op.left {
                    st.push_new_var(l);
                }
                self.drop_unused_outputs(op, st)
            }
            OpKind::SetGlob(g) => {
                let last: Vec<bool> = op.args.iter().map(|a| a.is_last()).collect();
                st.rearrange_top(&op.right, &last)?;
                if op.right.len() > 1 {
                    st.o.add(AsmOp::tuple(op.right.len()));
                }
                let name = &self.ctx.glob(*g).name;
                st.o.add(AsmOp::custom(format!("{} SETGLOB", name), 1, 0));
                st.consume(op.right.len());
                Ok(())
            }
            OpKind::Let => {
                for (i, (&l, &r)) in op.left.iter().zip(&op.right).enumerate() {
                    let unused = op.left_unused.get(i).copied().unwrap_or(false);
                    let last = op.args.get(i).map(|a| a.is_last()).unwrap_or(false);
                    if unused {
                        if last {
                            if let Some(j) = st.find(r, 0) {
                                st.issue_xchg(0, j)?;
                                st.issue_pop(0)?;
                            }
                        }
                        continue;
                    }
                    if last {
                        st.assign_var(l, r)?;
                    } else {
                        st.do_copy_var(l, r)?;
                    }
                }
                Ok(())
            }
            OpKind::Tuple => {
                let last: Vec<bool> = op.args.iter().map(|a| a.is_last()).collect();
                st.rearrange_top(&op.right, &last)?;
                st.o.add(AsmOp::tuple(op.right.len()));
                st.consume(op.right.len());
                st.push_new_var(op.left[0]);
                self.drop_unused_outputs(op, st)
            }
            OpKind::UnTuple => {
                let last: Vec<bool> = op.args.iter().map(|a| a.is_last()).collect();
                st.rearrange_top(&op.right, &last)?;
                st.o.add(AsmOp::untuple(op.left.len()));
                st.consume(1);
                for &l in &op.left {
                    st.push_new_var(l);
                }
                self.drop_unused_outputs(op, st)
            }
            OpKind::Call(fid) => self.call(op, *fid, st),
            OpKind::CallInd => {
                let last: Vec<bool> = op.args.iter().map(|a| a.is_last()).collect();
                st.rearrange_top(&op.right, &last)?;
                st.o.add(AsmOp::very_custom("EXECUTE"));
                st.consume(op.right.len());
                for &l in &op.left {
                    st.push_new_var(l);
                }
                self.drop_unused_outputs(op, st)
            }
            OpKind::Return => {
                st.enforce_state(&op.right, 0)?;
                if !tail {
                    st.o.add(AsmOp::very_custom("RETALT"));
                    st.o.retalt = true;
                }
                Ok(())
            }
            OpKind::If {
                then_block,
                else_block,
            } => self.cond(op, then_block, else_block, st, tail, live_after),
            OpKind::While { cond, body } => self.while_loop(op, cond, body, st),
            OpKind::Until { body } => self.until_loop(op, body, st),
            OpKind::Repeat { body } => self.repeat_loop(op, body, st),
            OpKind::Again { body } => self.again_loop(op, body, st),
            OpKind::TryCatch {
                try_block,
                catch_block,
            } => self.try_catch(op, try_block, catch_block, st, live_after),
        }
    }

    fn drop_unused_outputs(&self, op: &Op, st: &mut Stack) -> Result<(), CodegenError> {
        for (i, &l) in op.left.iter().enumerate() {
            if op.left_unused.get(i).copied().unwrap_or(false) {
                if let Some(j) = st.find(l, 0) {
                    if j == 0 {
                        st.issue_pop(0)?;
                    } else {
                        st.issue_pop(j)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn call(&self, op: &Op, fid: FunId, st: &mut Stack) -> Result<(), CodegenError> {
        let f = self.ctx.fun(fid);
        let mut right = op.right.clone();
        let mut args = op.args.clone();
        if args.len() != right.len() {
            args = right.iter().map(|&r| VarDescr::new(r)).collect();
        }
        if f.arg_order.len() == right.len() {
            right = f.arg_order.iter().map(|&i| op.right[i]).collect();
            args = f.arg_order.iter().map(|&i| args[i].clone()).collect();
        }

        // constant args the compile function absorbs into immediates
        // are not materialized
        let mut top = Vec::new();
        let mut last = Vec::new();
        for (&r, a) in right.iter().zip(&args) {
            if !a.is_unused() {
                top.push(r);
                last.push(a.is_last());
            }
        }
        st.rearrange_top(&top, &last)?;

        let mut ins = args;
        let mut outs: Vec<VarDescr> = op.left.iter().map(|&l| VarDescr::new(l)).collect();
        match &f.body {
            FunctionBody::Compiled(BuiltinCompile::Simple(func)) => {
                let asm = func(&mut outs, &mut ins, op.loc);
                st.consume(top.len());
                st.o.add(asm);
            }
            FunctionBody::Compiled(BuiltinCompile::Ext(func)) => {
                st.consume(top.len());
                func(st.o, &mut outs, &mut ins);
            }
            FunctionBody::AsmMacro(ops) => {
                st.consume(top.len());
                st.o.append(ops.clone());
            }
            FunctionBody::Code(_) => {
                st.consume(top.len());
                match self.inline_bodies.get(&fid) {
                    Some(body) if f.is_inline() => {
                        st.o.append(body.clone());
                    }
                    _ if f.is_inline_ref() => {
                        st.o.add(AsmOp::very_custom(format!("{} INLINECALLDICT", f.name)));
                    }
                    _ => {
                        st.o.add(AsmOp::very_custom(format!("{} CALLDICT", f.name)));
                    }
                }
            }
        }
        for &l in &op.left {
            st.push_new_var(l);
        }
        // remember constant outputs so equal constants can be copied
        for (i, o) in outs.iter().enumerate() {
            if let Some(v) = o.int_const {
                if o.is_int_const() {
                    let cidx = st.o.register_const(v);
                    st.set_const(op.left.len() - 1 - i, cidx);
                }
            }
        }
        self.drop_unused_outputs(op, st)
    }

    fn cond(
        &self,
        op: &Op,
        then_block: &[Op],
        else_block: &[Op],
        st: &mut Stack,
        tail: bool,
        live_after: &VarDescrList,
    ) -> Result<(), CodegenError> {
        let cond = op.right[0];
        let cond_last = op.args.first().map(|a| a.is_last()).unwrap_or(true);

        // a condition the analysis proved constant selects its branch
        // at compile time; the peephole erases the dead push
        if let Some(a) = op.args.first() {
            if a.always_true() || a.always_false() {
                st.rearrange_top(&[cond], &[cond_last])?;
                st.issue_pop(0)?;
                let taken = if a.always_true() {
                    then_block
                } else {
                    else_block
                };
                return self.block(taken, st, tail, live_after);
            }
        }

        st.rearrange_top(&[cond], &[cond_last])?;
        st.consume(1);

        let then_noreturn = block_noreturn(then_block);
        let else_noreturn = block_noreturn(else_block);

        if then_noreturn || else_noreturn {
            // the diverging branch goes into the bracket, the other
            // continues inline after it
            let (bracket_ops, inline_ops, positive) = if then_noreturn {
                (then_block, else_block, true)
            } else {
                (else_block, then_block, false)
            };
            let opcode = match (tail, positive) {
                (true, true) => "IFJMP:<{",
                (true, false) => "IFNOTJMP:<{",
                (false, true) => "IF:<{",
                (false, false) => "IFNOT:<{",
            };
            let snapshot = st.layout();
            st.o.add(AsmOp::very_custom(opcode));
            st.o.indent();
            self.block(bracket_ops, st, tail, live_after)?;
            st.o.undent();
            st.o.add(AsmOp::very_custom("}>"));
            st.set_layout(snapshot);
            return self.block(inline_ops, st, tail, live_after);
        }

        // neither branch diverges: structured IF with a merge
        let (first, second, positive) = if then_block.is_empty() {
            (else_block, then_block, false)
        } else {
            (then_block, else_block, true)
        };
        let snapshot = st.layout();
        let opcode = if positive { "IF:<{" } else { "IFNOT:<{" };
        st.o.add(AsmOp::very_custom(opcode));
        st.o.indent();
        self.block(first, st, false, live_after)?;
        st.drop_vars_except(live_after)?;
        let merged = st.layout();
        st.o.undent();

        // the fall-through side: fix it up to the same layout
        st.set_layout(snapshot);
        let needs_else = !second.is_empty()
            || st.var_layout() != merged.iter().map(|&(v, _)| v).collect::<Vec<_>>();
        if needs_else {
            st.o.add(AsmOp::very_custom("}>ELSE<{"));
            st.o.indent();
            self.block(second, st, false, live_after)?;
            st.drop_vars_except(live_after)?;
            let target: Vec<_> = merged.iter().map(|&(v, _)| v).collect();
            st.enforce_state(&target, 0)?;
            st.o.undent();
        }
        st.o.add(AsmOp::very_custom("}>"));
        st.merge_const(&merged);
        Ok(())
    }

    fn while_loop(
        &self,
        op: &Op,
        cond_ops: &[Op],
        body: &[Op],
        st: &mut Stack,
    ) -> Result<(), CodegenError> {
        let cond = op.right[0];
        st.drop_vars_except(&op.var_info)?;
        st.forget_const();
        let head: Vec<_> = st.var_layout();
        let mut cond_live = op.var_info.clone();
        cond_live.add(cond);

        st.o.add(AsmOp::very_custom("WHILE:<{"));
        st.o.indent();
        self.block(cond_ops, st, false, &cond_live)?;
        st.rearrange_top(&[cond], &[true])?;
        st.consume(1);
        let exit_layout = st.layout();
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>DO<{"));
        st.o.indent();
        self.block(body, st, false, &op.var_info)?;
        if !block_noreturn(body) {
            st.drop_vars_except(&op.var_info)?;
            st.enforce_state(&head, 0)?;
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>"));

        st.set_layout(exit_layout);
        st.forget_const();
        Ok(())
    }

    fn until_loop(&self, op: &Op, body: &[Op], st: &mut Stack) -> Result<(), CodegenError> {
        let cond = op.right[0];
        st.drop_vars_except(&op.var_info)?;
        st.forget_const();
        let head = st.var_layout();
        let mut body_live = op.var_info.clone();
        body_live.add(cond);

        st.o.add(AsmOp::very_custom("UNTIL:<{"));
        st.o.indent();
        self.block(body, st, false, &body_live)?;
        if !block_noreturn(body) {
            st.rearrange_top(&[cond], &[true])?;
            // the repeat edge re-enters with everything under the cond
            st.enforce_state(&head, 1)?;
            st.consume(1);
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>"));
        st.forget_const();
        Ok(())
    }

    fn repeat_loop(&self, op: &Op, body: &[Op], st: &mut Stack) -> Result<(), CodegenError> {
        let count = op.right[0];
        let count_last = op.args.first().map(|a| a.is_last()).unwrap_or(true);
        // dead values go first: the REPEAT instruction expects the
        // count on top of the real stack when it executes
        st.drop_vars_except(&op.var_info)?;
        st.forget_const();
        st.rearrange_top(&[count], &[count_last])?;
        st.consume(1);
        let head = st.var_layout();

        st.o.add(AsmOp::very_custom("REPEAT:<{"));
        st.o.indent();
        self.block(body, st, false, &op.var_info)?;
        if !block_noreturn(body) {
            st.drop_vars_except(&op.var_info)?;
            st.enforce_state(&head, 0)?;
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>"));
        st.forget_const();
        Ok(())
    }

    fn again_loop(&self, op: &Op, body: &[Op], st: &mut Stack) -> Result<(), CodegenError> {
        st.drop_vars_except(&op.var_info)?;
        st.forget_const();
        let head = st.var_layout();

        st.o.add(AsmOp::very_custom("AGAIN:<{"));
        st.o.indent();
        self.block(body, st, false, &op.var_info)?;
        if !block_noreturn(body) {
            st.drop_vars_except(&op.var_info)?;
            st.enforce_state(&head, 0)?;
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>"));
        Ok(())
    }

    fn try_catch(
        &self,
        op: &Op,
        try_block: &[Op],
        catch_block: &[Op],
        st: &mut Stack,
        live_after: &VarDescrList,
    ) -> Result<(), CodegenError> {
        st.drop_vars_except(&op.var_info)?;
        let snapshot = st.layout();
        let try_diverges = block_noreturn(try_block);
        let catch_diverges = block_noreturn(catch_block);

        st.o.add(AsmOp::very_custom("TRY:<{"));
        st.o.indent();
        self.block(try_block, st, false, live_after)?;
        let mut merged = None;
        if !try_diverges {
            st.drop_vars_except(live_after)?;
            merged = Some(st.layout());
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>CATCH<{"));
        st.o.indent();

        st.set_layout(snapshot);
        // the runtime delivers the exception argument and code on top
        st.push_new_var(op.left[0]);
        st.push_new_var(op.left[1]);
        self.block(catch_block, st, false, live_after)?;
        if !catch_diverges {
            st.drop_vars_except(live_after)?;
            match &merged {
                Some(m) => {
                    let target: Vec<_> = m.iter().map(|&(v, _)| v).collect();
                    st.enforce_state(&target, 0)?;
                }
                None => merged = Some(st.layout()),
            }
        }
        st.o.undent();
        st.o.add(AsmOp::very_custom("}>"));
        match merged {
            Some(m) if catch_diverges => st.set_layout(m),
            Some(m) => st.merge_const(&m),
            // both arms diverge; nothing follows
            None => st.set_layout(Vec::new()),
        }
        Ok(())
    }
}

/// Does control never fall off the end of this block?
pub fn block_noreturn(ops: &[Op]) -> bool {
    ops.last().map(|op| op.noreturn()).unwrap_or(false)
}
