//! IR analyses
//!
//! The passes over a constructed [`CodeBlob`], in pipeline order:
//!
//! 1. type simplification (indirection removal on variable types)
//! 2. variable splitting (wide tensors become scalars)
//! 3. unreachable-code pruning
//! 4. backward liveness, to a fixpoint across loops
//! 5. forward value-descriptor propagation
//! 6. a liveness re-run (constants absorbed into immediates by step 5
//!    kill their producing pushes)
//! 7. no-return marking
//!
//! Liveness writes each op's live-in set into `var_info`, `Last` flags
//! and `left_unused`; the forward pass imports value facts into the
//! same `args` descriptors, delegating per-call transfer to the
//! builtin's compile function.

use crate::codegen::asm::AsmOpList;
use crate::context::{BuiltinCompile, CompilerContext, FnFlag, FunctionBody};
use crate::descriptors::{VarDescr, VarDescrList, VarFlag};
use crate::ir::{CodeBlob, Op, OpKind, VarIdx};
use crate::CompileError;

pub fn analyze(blob: &mut CodeBlob, ctx: &CompilerContext) -> Result<(), CompileError> {
    simplify_var_types(blob, ctx);
    // pruning also runs ahead of splitting: the cleared outputs of
    // never-returning calls must not demand widths
    prune_unreachable(&mut blob.ops, ctx);
    split_vars(blob, ctx)?;
    prune_unreachable(&mut blob.ops, ctx);
    liveness(blob, ctx);
    fwd_analyze(blob, ctx);
    liveness(blob, ctx);
    mark_noreturn(&mut blob.ops, ctx);
    Ok(())
}

/// Replace every variable type by its principal representative.
pub fn simplify_var_types(blob: &mut CodeBlob, ctx: &CompilerContext) {
    for var in &mut blob.vars {
        var.ty = ctx.types.resolve_ref(var.ty);
    }
}

/// Split every variable of known width other than 1 into scalar
/// components and rewrite all op variable lists accordingly. Tuples
/// stay single variables; a variable whose width is still undetermined
/// is a type error at this stage.
pub fn split_vars(blob: &mut CodeBlob, ctx: &CompilerContext) -> Result<(), CompileError> {
    let n = blob.vars.len();
    let mut referenced = vec![false; n];
    mark_referenced(&blob.ops, &mut referenced);
    let mut mapping: Vec<Option<Vec<VarIdx>>> = vec![None; n];
    for idx in 0..n {
        if !referenced[idx] {
            continue;
        }
        let var = blob.vars[idx].clone();
        let Some(w) = ctx.types.get_width(var.ty) else {
            return Err(CompileError::semantic(
                var.loc,
                format!(
                    "cannot deduce the width of variable `{}` of type {}",
                    var.show(),
                    ctx.types.show(var.ty)
                ),
            ));
        };
        if w == 1 {
            continue;
        }
        let comps = ctx.types.extract_components(var.ty);
        if comps.len() as i32 != w {
            return Err(CompileError::semantic(
                var.loc,
                format!(
                    "cannot split variable `{}` of type {} into {} scalar components",
                    var.show(),
                    ctx.types.show(var.ty),
                    w
                ),
            ));
        }
        let mut parts = Vec::with_capacity(comps.len());
        for (k, &cty) in comps.iter().enumerate() {
            let name = var.name.as_ref().map(|n| format!("{}.{}", n, k));
            parts.push(blob.create_var(var.kind, cty, name, var.loc));
        }
        mapping[idx] = Some(parts);
    }
    if mapping.iter().all(Option::is_none) {
        return Ok(());
    }
    split_block(&mut blob.ops, &mapping);
    if let Some(import) = blob.ops.first() {
        if matches!(import.kind, OpKind::Import) {
            blob.in_var_cnt = import.left.len();
        }
    }
    Ok(())
}

fn mark_referenced(ops: &[Op], referenced: &mut [bool]) {
    for op in ops {
        for &v in op.left.iter().chain(&op.right) {
            referenced[v] = true;
        }
        for block in op.blocks() {
            mark_referenced(block, referenced);
        }
    }
}

fn split_block(ops: &mut [Op], mapping: &[Option<Vec<VarIdx>>]) {
    for op in ops {
        split_list(&mut op.left, mapping);
        split_list(&mut op.right, mapping);
        for block in op.blocks_mut() {
            split_block(block, mapping);
        }
    }
}

fn split_list(list: &mut Vec<VarIdx>, mapping: &[Option<Vec<VarIdx>>]) {
    if list
        .iter()
        .all(|&v| mapping.get(v).map(Option::is_none).unwrap_or(true))
    {
        return;
    }
    let mut out = Vec::with_capacity(list.len());
    for &v in list.iter() {
        match mapping.get(v).and_then(Option::as_ref) {
            Some(parts) => out.extend_from_slice(parts),
            None => out.push(v),
        }
    }
    *list = out;
}

/// Does control never proceed past this op?
fn diverges(op: &Op, ctx: &CompilerContext) -> bool {
    match &op.kind {
        OpKind::Return => true,
        OpKind::Again { .. } => true,
        OpKind::Call(f) => ctx.fun(*f).flags.contains(FnFlag::NeverReturns),
        OpKind::If {
            then_block,
            else_block,
        } => {
            block_diverges(then_block, ctx) && block_diverges(else_block, ctx)
        }
        OpKind::TryCatch {
            try_block,
            catch_block,
        } => {
            // the safe choice: only when both arms diverge
            block_diverges(try_block, ctx) && block_diverges(catch_block, ctx)
        }
        _ => false,
    }
}

fn block_diverges(ops: &[Op], ctx: &CompilerContext) -> bool {
    ops.iter().any(|op| diverges(op, ctx))
}

/// Drop everything after the first diverging op of every block. The
/// results of a never-returning call do not exist on any path, so its
/// output list is cleared as well.
pub fn prune_unreachable(ops: &mut Vec<Op>, ctx: &CompilerContext) {
    for op in ops.iter_mut() {
        for block in op.blocks_mut() {
            prune_unreachable(block, ctx);
        }
        if matches!(op.kind, OpKind::Call(_)) && diverges(op, ctx) {
            op.left.clear();
        }
    }
    if let Some(i) = ops.iter().position(|op| diverges(op, ctx)) {
        ops.truncate(i + 1);
    }
}

/// Backward liveness. Writes `var_info` (live-in), the `Last` flags on
/// `args` and the `left_unused` flags; pure calls whose every output is
/// dead are disabled outright.
pub fn liveness(blob: &mut CodeBlob, ctx: &CompilerContext) {
    let live_out = VarDescrList::new();
    live_block(&mut blob.ops, live_out, ctx);
}

fn live_block(ops: &mut [Op], live_out: VarDescrList, ctx: &CompilerContext) -> VarDescrList {
    let mut live = live_out;
    for op in ops.iter_mut().rev() {
        live = live_op(op, live, ctx);
    }
    live
}

/// Recompute the `Last` flags on the op's use descriptors. Value facts
/// and `Unused` marks from an earlier forward pass are preserved, so a
/// liveness re-run does not erase what the transfer functions learned.
fn use_args(op: &mut Op, live: &mut VarDescrList) {
    let mut prev: Vec<VarDescr> = if op.args.len() == op.right.len() {
        std::mem::take(&mut op.args)
    } else {
        op.right.iter().map(|&r| VarDescr::new(r)).collect()
    };
    for (i, &r) in op.right.iter().enumerate() {
        let d = &mut prev[i];
        d.idx = r;
        d.flags -= VarFlag::Last;
        if !d.is_unused() {
            if !live.contains(r) {
                d.flags |= VarFlag::Last;
            }
            live.add(r);
        }
    }
    op.args = prev;
}

fn def_left(op: &mut Op, live: &mut VarDescrList) {
    op.left_unused = op.left.iter().map(|&l| !live.contains(l)).collect();
    live.remove_vars(&op.left);
}

fn live_op(op: &mut Op, live_out: VarDescrList, ctx: &CompilerContext) -> VarDescrList {
    if op.disabled() {
        op.var_info = live_out.clone();
        return live_out;
    }
    match &mut op.kind {
        OpKind::Nop => {
            op.var_info = live_out.clone();
            live_out
        }
        OpKind::Return => {
            let mut live = VarDescrList::new();
            use_args(op, &mut live);
            op.var_info = live.clone();
            live
        }
        OpKind::Import
        | OpKind::IntConst(_)
        | OpKind::SliceConst(_)
        | OpKind::GlobVar(_) => {
            let mut live = live_out;
            def_left(op, &mut live);
            op.var_info = live.clone();
            live
        }
        OpKind::Let
        | OpKind::SetGlob(_)
        | OpKind::Tuple
        | OpKind::UnTuple
        | OpKind::CallInd => {
            let mut live = live_out;
            def_left(op, &mut live);
            use_args(op, &mut live);
            op.var_info = live.clone();
            live
        }
        OpKind::Call(fid) => {
            let f = ctx.fun(*fid);
            let mut live = live_out;
            def_left(op, &mut live);
            if op.left_unused.iter().all(|&u| u)
                && !op.left.is_empty()
                && f.is_pure()
                && !op.impure()
            {
                // a pure call computing only dead values vanishes
                op.set_disabled();
                op.var_info = live.clone();
                return live;
            }
            use_args(op, &mut live);
            op.var_info = live.clone();
            live
        }
        OpKind::If {
            then_block,
            else_block,
        } => {
            let l0 = live_block(then_block, live_out.clone(), ctx);
            let l1 = live_block(else_block, live_out, ctx);
            let mut live = l0;
            live.union_assign(&l1);
            use_args(op, &mut live);
            op.var_info = live.clone();
            live
        }
        OpKind::While { cond, body } => {
            let cond_var = op.right[0];
            let mut head = live_out.clone();
            loop {
                let body_in = live_block(body, head.clone(), ctx);
                let mut cond_out = live_out.clone();
                cond_out.union_assign(&body_in);
                cond_out.add(cond_var);
                let cond_in = live_block(cond, cond_out, ctx);
                let mut new_head = head.clone();
                new_head.union_assign(&cond_in);
                new_head.remove_var(cond_var);
                if new_head == head {
                    break;
                }
                head = new_head;
            }
            op.args = vec![{
                let mut d = VarDescr::new(cond_var);
                d.flags |= VarFlag::Last;
                d
            }];
            op.var_info = head.clone();
            head
        }
        OpKind::Until { body } => {
            let cond_var = op.right[0];
            let mut head = live_out.clone();
            loop {
                let mut body_out = live_out.clone();
                body_out.union_assign(&head);
                body_out.add(cond_var);
                let body_in = live_block(body, body_out, ctx);
                let mut new_head = live_out.clone();
                new_head.union_assign(&body_in);
                new_head.remove_var(cond_var);
                if new_head == head {
                    break;
                }
                head = new_head;
            }
            op.args = vec![{
                let mut d = VarDescr::new(cond_var);
                d.flags |= VarFlag::Last;
                d
            }];
            op.var_info = head.clone();
            head
        }
        OpKind::Repeat { body } => {
            let count = op.right[0];
            let mut head = live_out.clone();
            loop {
                let body_in = live_block(body, head.clone(), ctx);
                let mut new_head = head.clone();
                new_head.union_assign(&body_in);
                if new_head == head {
                    break;
                }
                head = new_head;
            }
            let mut live = head.clone();
            let mut d = VarDescr::new(count);
            if !live.contains(count) {
                d.flags |= VarFlag::Last;
            }
            live.add(count);
            op.args = vec![d];
            op.var_info = live.clone();
            live
        }
        OpKind::Again { body } => {
            let mut head = VarDescrList::new();
            loop {
                let body_in = live_block(body, head.clone(), ctx);
                let mut new_head = head.clone();
                new_head.union_assign(&body_in);
                if new_head == head {
                    break;
                }
                head = new_head;
            }
            op.var_info = head.clone();
            head
        }
        OpKind::TryCatch {
            try_block,
            catch_block,
        } => {
            let catch_in = live_block(catch_block, live_out.clone(), ctx);
            let try_in = live_block(try_block, live_out, ctx);
            let mut live = try_in;
            // anything the handler needs must stay alive for the whole
            // protected region
            live.union_assign(&catch_in);
            def_left_keep(op, &mut live);
            op.var_info = live.clone();
            live
        }
    }
}

/// Like `def_left`, for ops whose `left` are defined at block scope
/// (the catch delivery vars): compute `left_unused` and remove them
/// from the live set.
fn def_left_keep(op: &mut Op, live: &mut VarDescrList) {
    op.left_unused = op.left.iter().map(|&l| !live.contains(l)).collect();
    live.remove_vars(&op.left);
}

/// Forward value-descriptor propagation.
pub fn fwd_analyze(blob: &mut CodeBlob, ctx: &CompilerContext) {
    let vals = VarDescrList::new();
    fwd_block(&mut blob.ops, vals, ctx);
}

fn fwd_block(ops: &mut [Op], mut vals: VarDescrList, ctx: &CompilerContext) -> VarDescrList {
    for op in ops.iter_mut() {
        vals = fwd_op(op, vals, ctx);
    }
    vals
}

/// Import the current facts of the `right` operands into `op.args`,
/// keeping the flags liveness computed.
fn prepare_args(op: &mut Op, vals: &VarDescrList) {
    if op.args.len() != op.right.len() {
        op.args = op.right.iter().map(|&r| VarDescr::new(r)).collect();
    }
    for (i, &r) in op.right.iter().enumerate() {
        op.args[i].idx = r;
        if let Some(v) = vals.lookup(r) {
            op.args[i].import(v);
        }
    }
}

fn fwd_op(op: &mut Op, mut vals: VarDescrList, ctx: &CompilerContext) -> VarDescrList {
    if op.disabled() {
        return vals;
    }
    // import the operand facts up front, before the match borrows the
    // op's child blocks
    if !op.right.is_empty() {
        prepare_args(op, &vals);
    }
    match &mut op.kind {
        OpKind::Nop => vals,
        OpKind::Import | OpKind::GlobVar(_) => {
            for &l in &op.left {
                vals.add_newval(l);
            }
            vals
        }
        OpKind::IntConst(v) => {
            let v = *v;
            vals.add_newval(op.left[0]).set_const(v);
            vals
        }
        OpKind::SliceConst(s) => {
            let s = s.clone();
            vals.add_newval(op.left[0]).set_const_str(s);
            vals
        }
        OpKind::SetGlob(_) => {
            vals
        }
        OpKind::Let => {
            for (&l, &r) in op.left.iter().zip(&op.right) {
                let src = vals.lookup(r).cloned();
                let dst = vals.add_newval(l);
                if let Some(src) = src {
                    dst.import(&src);
                }
            }
            vals
        }
        OpKind::Tuple => {
            let d = vals.add_newval(op.left[0]);
            d.val |= crate::descriptors::ValFact::NotNull;
            vals
        }
        OpKind::UnTuple | OpKind::CallInd => {
            for &l in &op.left {
                vals.add_newval(l);
            }
            vals
        }
        OpKind::Call(fid) => {
            let f = ctx.fun(*fid);
            let mut outs: Vec<VarDescr> =
                op.left.iter().map(|&l| VarDescr::new(l)).collect();
            match &f.body {
                FunctionBody::Compiled(BuiltinCompile::Simple(func)) => {
                    let mut ins = op.args.clone();
                    let _ = func(&mut outs, &mut ins, op.loc);
                    op.args = ins;
                }
                FunctionBody::Compiled(BuiltinCompile::Ext(func)) => {
                    let mut ins = op.args.clone();
                    let mut scratch = AsmOpList::new();
                    let _ = func(&mut scratch, &mut outs, &mut ins);
                    op.args = ins;
                }
                // user calls are opaque: outputs unknown, inputs kept
                FunctionBody::AsmMacro(_) | FunctionBody::Code(_) => {}
            }
            for (i, &l) in op.left.iter().enumerate() {
                vals.add_newval(l).import(&outs[i]);
            }
            vals
        }
        OpKind::Return => {
            vals.set_unreachable();
            vals
        }
        OpKind::If {
            then_block,
            else_block,
        } => {
            let cond = op.args[0].clone();
            if cond.always_true() {
                return fwd_block(then_block, vals, ctx);
            }
            if cond.always_false() {
                return fwd_block(else_block, vals, ctx);
            }
            let mut v0 = fwd_block(then_block, vals.clone(), ctx);
            let v1 = fwd_block(else_block, vals, ctx);
            v0.meet_assign(&v1);
            v0
        }
        OpKind::While { cond, body } => {
            let mut entry = vals;
            loop {
                let after_cond = fwd_block(cond, entry.clone(), ctx);
                let after_body = fwd_block(body, after_cond, ctx);
                let mut merged = entry.clone();
                merged.union_assign(&after_body);
                if merged == entry {
                    break;
                }
                entry = merged;
            }
            fwd_block(cond, entry, ctx)
        }
        OpKind::Until { body } => {
            let mut entry = vals;
            loop {
                let after_body = fwd_block(body, entry.clone(), ctx);
                let mut merged = entry.clone();
                merged.union_assign(&after_body);
                if merged == entry {
                    break;
                }
                entry = merged;
            }
            fwd_block(body, entry, ctx)
        }
        OpKind::Repeat { body } => {
            let mut entry = vals;
            loop {
                let after_body = fwd_block(body, entry.clone(), ctx);
                let mut merged = entry.clone();
                merged.union_assign(&after_body);
                if merged == entry {
                    break;
                }
                entry = merged;
            }
            // the body may run zero times
            entry
        }
        OpKind::Again { body } => {
            let mut entry = vals;
            loop {
                let after_body = fwd_block(body, entry.clone(), ctx);
                let mut merged = entry.clone();
                merged.union_assign(&after_body);
                if merged == entry {
                    break;
                }
                entry = merged;
            }
            let mut dead = VarDescrList::new();
            dead.set_unreachable();
            dead
        }
        OpKind::TryCatch {
            try_block,
            catch_block,
        } => {
            let mut catch_entry = vals.clone();
            for &l in &op.left {
                catch_entry.add_newval(l);
            }
            let mut v_try = fwd_block(try_block, vals, ctx);
            let v_catch = fwd_block(catch_block, catch_entry, ctx);
            v_try.meet_assign(&v_catch);
            v_try
        }
    }
}

/// Transitive no-return marking, bottom up.
pub fn mark_noreturn(ops: &mut [Op], ctx: &CompilerContext) -> bool {
    let mut any = false;
    for op in ops.iter_mut() {
        let nr = match &mut op.kind {
            OpKind::Return | OpKind::Again { .. } => true,
            OpKind::Call(f) => ctx.fun(*f).flags.contains(FnFlag::NeverReturns),
            OpKind::If {
                then_block,
                else_block,
            } => {
                let t = mark_noreturn(then_block, ctx);
                let e = mark_noreturn(else_block, ctx);
                t && e
            }
            OpKind::TryCatch {
                try_block,
                catch_block,
            } => {
                let t = mark_noreturn(try_block, ctx);
                let c = mark_noreturn(catch_block, ctx);
                t && c
            }
            OpKind::While { cond, body } => {
                mark_noreturn(cond, ctx);
                mark_noreturn(body, ctx);
                false
            }
            OpKind::Until { body } | OpKind::Repeat { body } => {
                mark_noreturn(body, ctx);
                false
            }
            _ => false,
        };
        op.set_noreturn(nr);
        any = any || nr;
    }
    // after pruning, only the last op of a block can diverge
    ops.last().map(|op| op.noreturn()).unwrap_or(false)
}
