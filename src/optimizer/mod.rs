//! Peephole optimizer over stack operations
//!
//! The optimizer slides a window of up to [`OPTIMIZE_DEPTH`]
//! instructions over the emitted code, folds the window into a single
//! [`StackTransform`], and asks - largest window first - whether some
//! strictly shorter canonical sequence denotes the same transform. On a
//! match the window is replaced and scanning backs up so the new code
//! can combine with what precedes it.
//!
//! Instructions the transform algebra cannot model (continuation
//! brackets, arbitrary custom ops) act as barriers; a window never
//! crosses them. Comments inside a rewritten span are dropped, since
//! they describe a layout that no longer exists.

pub mod transform;

use tracing::trace;

use crate::codegen::asm::{AsmOp, AsmOpList};
use crate::config::OptimizationLevel;
use transform::{StackTransform, C_START};

/// Maximum number of instructions folded into one window.
pub const OPTIMIZE_DEPTH: usize = 20;

/// Model one instruction on a transform. Returns `false` for barriers.
pub fn apply_op(t: &mut StackTransform, op: &AsmOp) -> bool {
    if op.is_nop() || op.is_comment() {
        return true;
    }
    if let Some((i, j)) = op.is_xchg() {
        t.apply_xchg(i, j);
        return t.is_valid();
    }
    if let Some(i) = op.is_push() {
        t.apply_push(i);
        return t.is_valid();
    }
    if let Some(i) = op.is_pop() {
        t.apply_pop(i);
        return t.is_valid();
    }
    if op.is_gconst() {
        t.apply_push_newconst();
        return t.is_valid();
    }
    if op.is_custom() && !op.is_very_custom() {
        return apply_custom(t, &op.op) && t.is_valid();
    }
    false
}

/// Model the canonical compound stack instructions by name. Anything
/// unrecognized is a barrier.
fn apply_custom(t: &mut StackTransform, text: &str) -> bool {
    // the fixed-name idioms first
    match text {
        "ROT" => {
            t.apply_xchg(1, 2);
            t.apply_xchg(0, 1);
            return true;
        }
        "-ROT" => {
            t.apply_xchg(0, 1);
            t.apply_xchg(1, 2);
            return true;
        }
        "TUCK" => {
            t.apply_xchg(0, 1);
            t.apply_push(1);
            return true;
        }
        "2DUP" => {
            t.apply_push(1);
            t.apply_push(1);
            return true;
        }
        "2DROP" => {
            t.apply_pop(0);
            t.apply_pop(0);
            return true;
        }
        "2SWAP" => {
            t.apply(&StackTransform::blkswap(2, 2));
            return true;
        }
        "2OVER" => {
            t.apply_push(3);
            t.apply_push(3);
            return true;
        }
        _ => {}
    }
    let toks: Vec<&str> = text.split_whitespace().collect();
    let sreg = |t: &str| -> Option<i32> { t.strip_prefix('s')?.parse::<i32>().ok() };
    let num = |t: &str| -> Option<i32> { t.parse::<i32>().ok() };
    match toks.as_slice() {
        [n, "BLKDROP"] => {
            if let Some(i) = num(n) {
                for _ in 0..i {
                    t.apply_pop(0);
                }
                return true;
            }
        }
        [x, y, "BLKSWAP"] => {
            if let (Some(i), Some(j)) = (num(x), num(y)) {
                t.apply(&StackTransform::blkswap(i, j));
                return true;
            }
        }
        [x, y, "BLKPUSH"] => {
            if let (Some(i), Some(j)) = (num(x), num(y)) {
                for _ in 0..i {
                    t.apply_push(j);
                }
                return true;
            }
        }
        [x, y, "BLKDROP2"] => {
            if let (Some(i), Some(j)) = (num(x), num(y)) {
                t.apply(&StackTransform::blkdrop2(i, j));
                return true;
            }
        }
        [x, y, "REVERSE"] => {
            if let (Some(i), Some(j)) = (num(x), num(y)) {
                t.apply(&StackTransform::reverse(i, j));
                return true;
            }
        }
        // paired/triple forms, decoded from their printed operands
        [x, y, "XCHG2"] => {
            if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                t.apply_xchg(1, i);
                t.apply_xchg(0, j);
                return true;
            }
        }
        [x, y, "XCPU"] => {
            if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                t.apply_xchg(0, i);
                t.apply_push(j);
                return true;
            }
        }
        [x, y, "PUXC"] => {
            if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                t.apply_push(i);
                t.apply_xchg(0, 1);
                t.apply_xchg(0, j + 1);
                return true;
            }
        }
        [x, y, "PUSH2"] => {
            if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                t.apply_push(i);
                t.apply_push(j + 1);
                return true;
            }
        }
        [x, y, z, "XCHG3"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_xchg(2, i);
                t.apply_xchg(1, j);
                t.apply_xchg(0, k);
                return true;
            }
        }
        [x, y, z, "XC2PU"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_xchg(1, i);
                t.apply_xchg(0, j);
                t.apply_push(k);
                return true;
            }
        }
        [x, y, z, "XCPUXC"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_xchg(1, i);
                t.apply_push(j);
                t.apply_xchg(0, 1);
                t.apply_xchg(0, k + 1);
                return true;
            }
        }
        [x, y, z, "XCPU2"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_xchg(0, i);
                t.apply_push(j);
                t.apply_push(k + 1);
                return true;
            }
        }
        [x, y, z, "PUXC2"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_push(i);
                t.apply_xchg(0, 2);
                t.apply_xchg(1, j + 1);
                t.apply_xchg(0, k + 1);
                return true;
            }
        }
        [x, y, z, "PUXCPU"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_push(i);
                t.apply_xchg(0, 1);
                t.apply_xchg(0, j + 1);
                t.apply_push(k);
                return true;
            }
        }
        [x, y, z, "PU2XC"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_push(i);
                t.apply_xchg(0, 1);
                t.apply_push(j + 1);
                t.apply_xchg(0, 1);
                t.apply_xchg(0, k + 2);
                return true;
            }
        }
        [x, y, z, "PUSH3"] => {
            if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                t.apply_push(i);
                t.apply_push(j + 1);
                t.apply_push(k + 2);
                return true;
            }
        }
        _ => {}
    }
    false
}

/// Optimize a whole instruction list in place.
pub fn optimize_code(ops: &mut AsmOpList, level: OptimizationLevel) {
    optimize(&mut ops.list, level);
}

pub fn optimize(ops: &mut Vec<AsmOp>, level: OptimizationLevel) {
    if level == OptimizationLevel::O0 {
        return;
    }
    let mut pos = 0;
    while pos < ops.len() {
        match find_rewrite(&ops[pos..], level) {
            Some((span, replacement)) => {
                trace!(
                    from = %ops[pos..pos + span]
                        .iter()
                        .filter(|o| !o.is_comment())
                        .map(|o| o.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                    to = %replacement
                        .iter()
                        .map(|o| o.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                    "peephole rewrite"
                );
                let indent = ops[pos].indent;
                let mut repl = replacement;
                for op in &mut repl {
                    op.indent = indent;
                }
                ops.splice(pos..pos + span, repl);
                // back up so the new code can combine with what precedes
                pos = pos.saturating_sub(OPTIMIZE_DEPTH);
            }
            None => pos += 1,
        }
    }
    ops.retain(|op| !op.is_nop());
}

/// Find the largest matching window at the start of `window` and the
/// canonical replacement for it. Returns the number of source ops
/// consumed (comments included) and the replacement.
fn find_rewrite(window: &[AsmOp], level: OptimizationLevel) -> Option<(usize, Vec<AsmOp>)> {
    // prefix transforms over the modelable ops of the window
    let mut spans: Vec<usize> = Vec::new(); // source span per prefix
    let mut trs: Vec<StackTransform> = vec![StackTransform::id()];
    let mut real_ops: Vec<&AsmOp> = Vec::new();
    for (i, op) in window.iter().enumerate() {
        if real_ops.len() >= OPTIMIZE_DEPTH {
            break;
        }
        if op.is_nop() || op.is_comment() {
            continue;
        }
        let mut t = trs.last().cloned().unwrap_or_default();
        if !apply_op(&mut t, op) || !t.is_valid() {
            break;
        }
        real_ops.push(op);
        spans.push(i + 1);
        trs.push(t);
    }

    for p in (2..=real_ops.len()).rev() {
        let t = &trs[p];
        if let Some(repl) = match_pattern(t, &real_ops[..p], level) {
            if repl.len() < p {
                return Some((spans[p - 1], repl));
            }
        }
    }
    None
}

/// The `k`-th constant-pushing op among `ops`.
fn find_const_op(ops: &[&AsmOp], k: i32) -> Option<AsmOp> {
    ops.iter()
        .filter(|o| o.is_gconst())
        .nth(k as usize)
        .map(|o| (*o).clone())
}

/// Candidate operand values for parameter search, harvested from the
/// anomaly table. Any operand of a matching compound op must either
/// appear there or be one of the always-considered small depths.
fn candidates(t: &StackTransform) -> Vec<i32> {
    let mut s = vec![0, 1, 2, 3];
    for &(x, y) in t.anomalies() {
        s.push(x - t.shift_by());
        if y >= 0 {
            s.push(y);
        }
    }
    s.retain(|&v| (0..=15).contains(&v));
    s.sort_unstable();
    s.dedup();
    s
}

fn match_pattern(
    t: &StackTransform,
    ops: &[&AsmOp],
    level: OptimizationLevel,
) -> Option<Vec<AsmOp>> {
    let p = ops.len();
    if t.is_id() {
        return Some(Vec::new());
    }

    if t.has_marker() {
        if level != OptimizationLevel::O2 {
            return None;
        }
        return match_const_pattern(t, ops);
    }

    // --- single-instruction forms ---
    if let Some((i, j)) = t.is_xchg() {
        if i != j && j <= 255 {
            return Some(vec![AsmOp::xchg(i, j)]);
        }
    }
    if let Some(i) = t.is_push() {
        if i <= 255 {
            return Some(vec![AsmOp::push(i)]);
        }
    }
    if let Some(i) = t.is_pop() {
        if i <= 255 {
            return Some(vec![AsmOp::pop(i)]);
        }
    }
    if let Some(i) = t.is_blkdrop() {
        if i <= 15 {
            return Some(vec![AsmOp::blkdrop(i)]);
        }
    }
    if let Some((i, j)) = t.is_blkswap() {
        if i <= 16 && j <= 16 {
            return Some(vec![AsmOp::blkswap(i, j)]);
        }
    }
    if let Some((i, j)) = t.is_blkpush() {
        if i <= 15 && j <= 15 {
            return Some(vec![AsmOp::blkpush(i, j)]);
        }
    }
    if let Some((i, j)) = t.is_blkdrop2() {
        if i <= 15 && j <= 15 {
            return Some(vec![AsmOp::blkdrop2(i, j)]);
        }
    }
    if let Some((i, j)) = t.is_reverse() {
        if (2..=17).contains(&i) && j <= 15 {
            return Some(vec![AsmOp::blkreverse(i, j)]);
        }
    }
    if let Some(op) = match_compound_single(t) {
        return Some(vec![op]);
    }

    // --- two-instruction forms (need a window of at least 3) ---
    if p >= 3 {
        if let Some(repl) = match_pair(t) {
            return Some(repl);
        }
    }

    // --- three-instruction forms ---
    if p >= 4 {
        if let Some(repl) = match_triple(t) {
            return Some(repl);
        }
    }
    None
}

/// One compound stack instruction covering the whole window.
fn match_compound_single(t: &StackTransform) -> Option<AsmOp> {
    let cs = candidates(t);
    let d = t.shift_by();

    // TUCK = SWAP; OVER
    if d == -1 {
        let mut cand = StackTransform::id();
        cand.apply_xchg(0, 1);
        cand.apply_push(1);
        if cand.le(t) {
            return Some(AsmOp::custom("TUCK", 2, 3));
        }
    }

    match d {
        0 => {
            // XCHG2 i j = XCHG s1,s(i); XCHG s0,s(j)
            for &i in &cs {
                for &j in &cs {
                    let mut cand = StackTransform::id();
                    cand.apply_xchg(1, i);
                    cand.apply_xchg(0, j);
                    if cand.le(t) {
                        return Some(AsmOp::xchg2(i, j));
                    }
                }
            }
            // XCHG3 i j k = XCHG s2,s(i); XCHG s1,s(j); XCHG s0,s(k)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_xchg(2, i);
                        cand.apply_xchg(1, j);
                        cand.apply_xchg(0, k);
                        if cand.le(t) {
                            return Some(AsmOp::xchg3(i, j, k));
                        }
                    }
                }
            }
        }
        -1 => {
            // XCPU i j = XCHG s0,s(i); PUSH s(j)
            for &i in &cs {
                for &j in &cs {
                    let mut cand = StackTransform::id();
                    cand.apply_xchg(0, i);
                    cand.apply_push(j);
                    if cand.le(t) {
                        return Some(AsmOp::xcpu(i, j));
                    }
                }
            }
            // PUXC i j = PUSH s(i); SWAP; XCHG s0,s(j)
            for &i in &cs {
                for &j in &cs {
                    let mut cand = StackTransform::id();
                    cand.apply_push(i);
                    cand.apply_xchg(0, 1);
                    cand.apply_xchg(0, j);
                    if cand.le(t) {
                        return Some(AsmOp::puxc(i, j));
                    }
                }
            }
            // XC2PU i j k = XCHG2 i j; PUSH s(k)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_xchg(1, i);
                        cand.apply_xchg(0, j);
                        cand.apply_push(k);
                        if cand.le(t) {
                            return Some(AsmOp::xc2pu(i, j, k));
                        }
                    }
                }
            }
            // XCPUXC i j k = XCHG s1,s(i); PUSH s(j); SWAP; XCHG s0,s(k)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_xchg(1, i);
                        cand.apply_push(j);
                        cand.apply_xchg(0, 1);
                        cand.apply_xchg(0, k);
                        if cand.le(t) {
                            return Some(AsmOp::xcpuxc(i, j, k));
                        }
                    }
                }
            }
        }
        -2 => {
            // PUSH2 i j = PUSH s(i); PUSH s(j+1)
            for &i in &cs {
                for &j in &cs {
                    let mut cand = StackTransform::id();
                    cand.apply_push(i);
                    cand.apply_push(j + 1);
                    if cand.le(t) {
                        return Some(AsmOp::push2(i, j));
                    }
                }
            }
            // XCPU2 i j k = XCHG s0,s(i); PUSH s(j); PUSH s(k+1)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_xchg(0, i);
                        cand.apply_push(j);
                        cand.apply_push(k + 1);
                        if cand.le(t) {
                            return Some(AsmOp::xcpu2(i, j, k));
                        }
                    }
                }
            }
            // PUXC2 i j k = PUSH s(i); XCHG s0,s2; XCHG s1,s(j); XCHG s0,s(k)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_push(i);
                        cand.apply_xchg(0, 2);
                        cand.apply_xchg(1, j);
                        cand.apply_xchg(0, k);
                        if cand.le(t) {
                            return Some(AsmOp::puxc2(i, j, k));
                        }
                    }
                }
            }
            // PUXCPU i j k = PUXC i j; PUSH s(k)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_push(i);
                        cand.apply_xchg(0, 1);
                        cand.apply_xchg(0, j);
                        cand.apply_push(k);
                        if cand.le(t) {
                            return Some(AsmOp::puxcpu(i, j, k));
                        }
                    }
                }
            }
            // PU2XC i j k = PUSH s(i); SWAP; PUXC s(j),s(k-1)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_push(i);
                        cand.apply_xchg(0, 1);
                        cand.apply_push(j);
                        cand.apply_xchg(0, 1);
                        cand.apply_xchg(0, k);
                        if cand.le(t) {
                            return Some(AsmOp::pu2xc(i, j, k));
                        }
                    }
                }
            }
        }
        -3 => {
            // PUSH3 i j k = PUSH s(i); PUSH s(j+1); PUSH s(k+2)
            for &i in &cs {
                for &j in &cs {
                    for &k in &cs {
                        let mut cand = StackTransform::id();
                        cand.apply_push(i);
                        cand.apply_push(j + 1);
                        cand.apply_push(k + 2);
                        if cand.le(t) {
                            return Some(AsmOp::push3(i, j, k));
                        }
                    }
                }
            }
        }
        _ => {}
    }
    None
}

/// Two-instruction canonical forms.
fn match_pair(t: &StackTransform) -> Option<Vec<AsmOp>> {
    let cs = candidates(t);

    // XCHG; XCHG - any permutation that is a product of two
    // transpositions (a 3-cycle or two disjoint swaps)
    if t.shift_by() == 0 && t.is_permutation() && t.anomalies().len() <= 4 {
        let n = t.anomalies().len();
        if n == 3 {
            // 3-cycle (p q r): f(p)=q, f(q)=r, f(r)=p  =>  XCHG p,r; XCHG p,q
            let (p0, q) = {
                let &(x, y) = &t.anomalies()[0];
                (x, y)
            };
            let r = t.get(q);
            let mut cand = StackTransform::id();
            cand.apply_xchg(p0, r);
            cand.apply_xchg(p0, q);
            if cand.le(t) {
                return Some(vec![AsmOp::xchg(p0, r), AsmOp::xchg(p0, q)]);
            }
        }
        if n == 4 {
            let a = t.anomalies();
            let (i, j) = (a[0].0, a[0].1);
            // the other transposition is whatever remains
            let (k, l) = if a[1].0 == j {
                (a[2].0, a[2].1)
            } else {
                (a[1].0, a[1].1)
            };
            let mut cand = StackTransform::id();
            cand.apply_xchg(i, j);
            cand.apply_xchg(k, l);
            if cand.le(t) {
                return Some(vec![AsmOp::xchg(i, j), AsmOp::xchg(k, l)]);
            }
        }
    }

    // POP; POP
    if t.shift_by() == 2 {
        for &i in &cs {
            for &j in &cs {
                let mut cand = StackTransform::id();
                cand.apply_pop(i);
                cand.apply_pop(j);
                if cand.le(t) {
                    return Some(vec![AsmOp::pop(i), AsmOp::pop(j)]);
                }
            }
        }
    }

    // PUSH; XCHG
    if t.shift_by() == -1 {
        for &i in &cs {
            for &j in &cs {
                let mut cand = StackTransform::id();
                cand.apply_push(i);
                cand.apply_xchg(0, j);
                if cand.le(t) {
                    return Some(vec![AsmOp::push(i), AsmOp::xchg(0, j)]);
                }
            }
        }
    }

    // POP; BLKDROP
    if let Some((i, k)) = t.is_pop_blkdrop() {
        if i <= 255 && (2..=15).contains(&k) {
            return Some(vec![AsmOp::pop(i), AsmOp::blkdrop(k)]);
        }
    }
    None
}

/// Three-instruction canonical forms.
fn match_triple(t: &StackTransform) -> Option<Vec<AsmOp>> {
    // POP; POP; BLKDROP
    let d = t.shift_by();
    if d >= 4 {
        let k = d - 2;
        if (2..=15).contains(&k) {
            let cs = candidates(t);
            for &i in &cs {
                for &j in &cs {
                    let mut cand = StackTransform::id();
                    cand.apply_pop(i);
                    cand.apply_pop(j);
                    cand.apply(&StackTransform::blkdrop(k));
                    if cand.le(t) {
                        return Some(vec![AsmOp::pop(i), AsmOp::pop(j), AsmOp::blkdrop(k)]);
                    }
                }
            }
        }
    }
    None
}

/// Constant-aware forms: the window pushes exactly one constant that is
/// still visible in the result. The rewrite re-emits that same constant
/// op in a canonical position.
fn match_const_pattern(t: &StackTransform, ops: &[&AsmOp]) -> Option<Vec<AsmOp>> {
    let markers = t.markers();
    let [m] = markers.as_slice() else {
        return None;
    };
    let m = *m;
    let k = C_START - m;
    let const_op = find_const_op(ops, k)?;
    let d = t.shift_by();

    // const; XCHG s0,s(i)   (i = 0 is a plain re-push)
    if d == -1 {
        let pos = t
            .anomalies()
            .iter()
            .find(|&&(_, y)| y == m)
            .map(|&(x, _)| x - d)?;
        let mut cand = StackTransform::id();
        cand.apply_push_marker(m);
        cand.apply_xchg(0, pos);
        if cand.le(t) {
            return Some(if pos == 0 {
                vec![const_op]
            } else {
                vec![const_op, AsmOp::xchg(0, pos)]
            });
        }
        // const; ROT
        let mut cand = StackTransform::id();
        cand.apply_push_marker(m);
        cand.apply_xchg(1, 2);
        cand.apply_xchg(0, 1);
        if cand.le(t) {
            return Some(vec![const_op, AsmOp::custom("ROT", 3, 3)]);
        }
        // const; -ROT
        let mut cand = StackTransform::id();
        cand.apply_push_marker(m);
        cand.apply_xchg(0, 1);
        cand.apply_xchg(1, 2);
        if cand.le(t) {
            return Some(vec![const_op, AsmOp::custom("-ROT", 3, 3)]);
        }
    }

    // const; POP s(i) - the constant overwrites a stack entry
    if d == 0 {
        let pos = t
            .anomalies()
            .iter()
            .find(|&&(_, y)| y == m)
            .map(|&(x, _)| x - d)?;
        let i = pos + 1;
        let mut cand = StackTransform::id();
        cand.apply_push_marker(m);
        cand.apply_pop(i);
        if cand.le(t) && i <= 255 {
            return Some(vec![const_op, AsmOp::pop(i)]);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(src: &[&str]) -> Vec<String> {
        let mut ops: Vec<AsmOp> = src.iter().map(|s| AsmOp::parse(s)).collect();
        optimize(&mut ops, OptimizationLevel::O2);
        ops.iter()
            .filter(|o| !o.is_nop())
            .map(|o| o.to_string())
            .collect()
    }

    #[test]
    fn test_swap_swap_cancels() {
        assert!(opt(&["SWAP", "SWAP"]).is_empty());
    }

    #[test]
    fn test_push_drop_cancels() {
        assert!(opt(&["s3 PUSH", "DROP"]).is_empty());
        assert!(opt(&["42 PUSHINT", "DROP"]).is_empty());
    }

    #[test]
    fn test_push_sequence_to_swap() {
        // the copy-then-cleanup shape the code generator produces
        assert_eq!(opt(&["DUP", "s2 PUSH", "2 2 BLKDROP2"]), vec!["SWAP"]);
    }

    #[test]
    fn test_dup_recognition() {
        // the copy-then-consume shape dup compiles to
        assert_eq!(opt(&["DUP", "SWAP"]), vec!["DUP"]);
        // copying both values then dropping the originals is a no-op
        assert!(opt(&["DUP", "s1 PUSH", "2 1 BLKDROP2"]).is_empty());
    }

    #[test]
    fn test_adjacent_swaps_to_rot() {
        assert_eq!(opt(&["s1 s2 XCHG", "SWAP"]), vec!["ROT"]);
        assert_eq!(opt(&["SWAP", "s1 s2 XCHG"]), vec!["-ROT"]);
    }

    #[test]
    fn test_six_swaps_vanish() {
        assert!(opt(&["s1 s2 XCHG", "SWAP", "s1 s2 XCHG", "s1 s2 XCHG", "SWAP", "s1 s2 XCHG"])
            .is_empty());
    }

    #[test]
    fn test_xchg2_formation() {
        assert_eq!(opt(&["s1 s4 XCHG", "s0 s2 XCHG"]), vec!["s4 s2 XCHG2"]);
    }

    #[test]
    fn test_push2_formation() {
        assert_eq!(opt(&["s3 PUSH", "s1 PUSH"]), vec!["s3 s0 PUSH2"]);
    }

    #[test]
    fn test_double_push_is_blkpush_idiom() {
        assert_eq!(opt(&["s3 PUSH", "s3 PUSH"]), vec!["2OVER"]);
    }

    #[test]
    fn test_2dup_idiom() {
        assert_eq!(opt(&["OVER", "OVER"]), vec!["2DUP"]);
    }

    #[test]
    fn test_drop_sequence_to_blkdrop() {
        assert_eq!(opt(&["DROP", "DROP", "DROP"]), vec!["3 BLKDROP"]);
    }

    #[test]
    fn test_tuck_idiom() {
        assert_eq!(opt(&["SWAP", "OVER"]), vec!["TUCK"]);
    }

    #[test]
    fn test_const_commutes_past_rot() {
        // push 5, then rotate it below two values == ROT-free canonical
        assert_eq!(
            opt(&["5 PUSHINT", "SWAP", "s1 s2 XCHG"]),
            vec!["5 PUSHINT", "-ROT"]
        );
    }

    #[test]
    fn test_const_then_deep_drop() {
        // constant written over a dead slot
        assert_eq!(opt(&["7 PUSHINT", "s0 s3 XCHG", "DROP"]), vec!["7 PUSHINT", "s3 POP"]);
    }

    #[test]
    fn test_barrier_stops_window() {
        let out = opt(&["SWAP", "IF:<{", "SWAP", "SWAP", "}>"]);
        assert_eq!(out, vec!["SWAP", "IF:<{", "}>"]);
    }

    #[test]
    fn test_comments_dropped_inside_rewrite() {
        let out = opt(&["SWAP", "// stack: a b", "SWAP"]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let srcs: Vec<Vec<&str>> = vec![
            vec!["DUP", "s2 PUSH", "2 2 BLKDROP2"],
            vec!["s1 s2 XCHG", "SWAP"],
            vec!["s3 PUSH", "s3 PUSH"],
            vec!["DROP", "DROP", "DROP"],
            vec!["5 PUSHINT", "SWAP", "s1 s2 XCHG"],
        ];
        for src in srcs {
            let mut once: Vec<AsmOp> = src.iter().map(|s| AsmOp::parse(s)).collect();
            optimize(&mut once, OptimizationLevel::O2);
            let first: Vec<String> = once.iter().map(|o| o.to_string()).collect();
            optimize(&mut once, OptimizationLevel::O2);
            let second: Vec<String> = once.iter().map(|o| o.to_string()).collect();
            assert_eq!(first, second, "second pass changed {:?}", src);
        }
    }

    #[test]
    fn test_rewrite_preserves_transform() {
        // every rewrite the optimizer performs must preserve the
        // composed transform of the sequence
        let srcs: Vec<Vec<&str>> = vec![
            vec!["DUP", "s2 PUSH", "2 2 BLKDROP2"],
            vec!["s1 s3 XCHG", "s0 s2 XCHG"],
            vec!["SWAP", "OVER"],
            vec!["s2 PUSH", "s0 s3 XCHG", "DROP"],
        ];
        for src in srcs {
            let before: Vec<AsmOp> = src.iter().map(|s| AsmOp::parse(s)).collect();
            let mut t_before = StackTransform::id();
            for op in &before {
                assert!(apply_op(&mut t_before, op));
            }
            let mut after = before.clone();
            optimize(&mut after, OptimizationLevel::O2);
            let mut t_after = StackTransform::id();
            for op in &after {
                assert!(apply_op(&mut t_after, op), "unmodelable op {}", op);
            }
            assert!(
                t_after.almost_equal(&t_before),
                "transform changed for {:?}",
                src
            );
            assert!(t_after.depth_touched() <= t_before.depth_touched());
        }
    }

    #[test]
    fn test_window_cap() {
        // a long alternating sequence still terminates and shrinks
        let src: Vec<&str> = std::iter::repeat(["SWAP", "SWAP"])
            .take(30)
            .flatten()
            .collect();
        let out = opt(&src);
        assert!(out.is_empty());
    }

    #[test]
    fn test_o0_disables_rewriting() {
        let mut ops: Vec<AsmOp> = ["SWAP", "SWAP"].iter().map(|s| AsmOp::parse(s)).collect();
        optimize(&mut ops, OptimizationLevel::O0);
        assert_eq!(ops.len(), 2);
    }

    #[test]
    fn test_o1_still_cancels_pure_stack_noise() {
        let mut ops: Vec<AsmOp> = ["SWAP", "SWAP", "s2 PUSH", "DROP"]
            .iter()
            .map(|s| AsmOp::parse(s))
            .collect();
        optimize(&mut ops, OptimizationLevel::O1);
        assert!(ops.is_empty());
    }
}
