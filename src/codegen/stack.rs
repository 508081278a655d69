//! Value-stack simulation
//!
//! [`Stack`] mirrors what the runtime stack will contain at each point
//! of code generation: one `(variable, known-constant)` pair per cell,
//! depth 0 being the top. Every mutation both updates the model and
//! emits the corresponding instruction, so the emitted code and the
//! model can never drift apart.
//!
//! The generator is deliberately naive about instruction choice - a
//! consumed operand is pulled up with a single block rotation, copies
//! are plain pushes - because the peephole optimizer canonicalizes the
//! result afterwards.

use enumset::{EnumSet, EnumSetType};

use crate::codegen::asm::{AsmOp, AsmOpList, ConstIdx, NOT_CONST};
use crate::codegen::error::CodegenError;
use crate::descriptors::VarDescrList;
use crate::ir::VarIdx;

/// Codegen mode flags.
#[derive(EnumSetType, Debug)]
pub enum StackMode {
    /// Emit `// stack:` layout comments between ops.
    StkCmt,
    /// Skip the peephole pass (debug output).
    DisableOpt,
    /// Generating the body of an `inline` function.
    InlineFunc,
    /// Generating a nested inline continuation.
    InlineAny,
}

pub struct Stack<'o> {
    /// Bottom to top; the last entry is the top of the stack.
    s: Vec<(VarIdx, ConstIdx)>,
    pub o: &'o mut AsmOpList,
    pub mode: EnumSet<StackMode>,
    /// Display names for stack comments, indexed by variable.
    var_names: Vec<String>,
    shown: bool,
}

impl<'o> Stack<'o> {
    pub fn new(o: &'o mut AsmOpList, mode: EnumSet<StackMode>, var_names: Vec<String>) -> Self {
        Stack {
            s: Vec::new(),
            o,
            mode,
            var_names,
            shown: false,
        }
    }

    pub fn depth(&self) -> usize {
        self.s.len()
    }

    fn modified(&mut self) {
        self.shown = false;
    }

    /// Snapshot of the layout for branch merging.
    pub fn layout(&self) -> Vec<(VarIdx, ConstIdx)> {
        self.s.clone()
    }

    pub fn set_layout(&mut self, s: Vec<(VarIdx, ConstIdx)>) {
        self.s = s;
        self.modified();
    }

    /// The variables bottom to top.
    pub fn var_layout(&self) -> Vec<VarIdx> {
        self.s.iter().map(|&(v, _)| v).collect()
    }

    fn validate(&self, i: usize) -> Result<(), CodegenError> {
        if i > 255 {
            return Err(CodegenError::TooDeepStack);
        }
        if i >= self.depth() {
            return Err(CodegenError::Internal(format!(
                "stack reference s{} beyond depth {}",
                i,
                self.depth()
            )));
        }
        Ok(())
    }

    pub fn at(&self, i: usize) -> (VarIdx, ConstIdx) {
        self.s[self.depth() - 1 - i]
    }

    fn at_mut(&mut self, i: usize) -> &mut (VarIdx, ConstIdx) {
        let d = self.depth();
        &mut self.s[d - 1 - i]
    }

    /// Depth of the shallowest occurrence of `var` at depth >= `from`.
    pub fn find(&self, var: VarIdx, from: usize) -> Option<usize> {
        (from..self.depth()).find(|&i| self.at(i).0 == var)
    }

    /// Depth of the shallowest entry holding constant-pool slot `cidx`.
    pub fn find_const(&self, cidx: ConstIdx) -> Option<usize> {
        if cidx == NOT_CONST {
            return None;
        }
        (0..self.depth()).find(|&i| self.at(i).1 == cidx)
    }

    pub fn forget_const(&mut self) {
        for e in &mut self.s {
            e.1 = NOT_CONST;
        }
    }

    pub fn issue_xchg(&mut self, i: usize, j: usize) -> Result<(), CodegenError> {
        if i == j {
            return Ok(());
        }
        self.validate(i)?;
        self.validate(j)?;
        self.o.add(AsmOp::xchg(i as i32, j as i32));
        let d = self.depth();
        self.s.swap(d - 1 - i, d - 1 - j);
        self.modified();
        Ok(())
    }

    pub fn issue_push(&mut self, i: usize) -> Result<(), CodegenError> {
        self.validate(i)?;
        self.o.add(AsmOp::push(i as i32));
        let e = self.at(i);
        self.s.push(e);
        self.modified();
        Ok(())
    }

    pub fn issue_pop(&mut self, i: usize) -> Result<(), CodegenError> {
        self.validate(i)?;
        self.o.add(AsmOp::pop(i as i32));
        let top = self.s.pop().expect("pop from empty stack model");
        if i > 0 {
            *self.at_mut(i - 1) = top;
        }
        self.modified();
        Ok(())
    }

    /// Pull the entry at depth `j` to the top, preserving the relative
    /// order of everything above it.
    fn pull_to_top(&mut self, j: usize) -> Result<(), CodegenError> {
        if j == 0 {
            return Ok(());
        }
        self.validate(j)?;
        self.o.add(AsmOp::blkswap(1, j as i32));
        let d = self.depth();
        let e = self.s.remove(d - 1 - j);
        self.s.push(e);
        self.modified();
        Ok(())
    }

    pub fn push_new_var(&mut self, var: VarIdx) {
        self.s.push((var, NOT_CONST));
        self.modified();
    }

    pub fn push_new_const(&mut self, var: VarIdx, cidx: ConstIdx) {
        self.s.push((var, cidx));
        self.modified();
    }

    /// Rename every copy of `old` to `new` without emitting code.
    pub fn assign_var(&mut self, new: VarIdx, old: VarIdx) -> Result<(), CodegenError> {
        let mut found = false;
        for e in &mut self.s {
            if e.0 == old {
                e.0 = new;
                found = true;
            }
        }
        if !found {
            return Err(CodegenError::UnknownVariable(old));
        }
        self.modified();
        Ok(())
    }

    /// Copy `old` to the top and name the copy `new`.
    pub fn do_copy_var(&mut self, new: VarIdx, old: VarIdx) -> Result<(), CodegenError> {
        let j = self.find(old, 0).ok_or(CodegenError::UnknownVariable(old))?;
        self.issue_push(j)?;
        self.at_mut(0).0 = new;
        Ok(())
    }

    /// Rename only the top entry.
    pub fn rename_top(&mut self, var: VarIdx) {
        if !self.s.is_empty() {
            self.at_mut(0).0 = var;
        }
        self.modified();
    }

    /// Remove one entry at depth `j`, preferring the single-instruction
    /// POP form when something live sits on top.
    fn drop_entry(&mut self, j: usize) -> Result<(), CodegenError> {
        if j == 0 {
            self.issue_pop(0)
        } else {
            self.issue_pop(j)
        }
    }

    /// Pop every entry whose variable is not live in `info`. Returns
    /// the number of dropped entries.
    pub fn drop_vars_except(&mut self, info: &VarDescrList) -> Result<usize, CodegenError> {
        let mut dropped = 0;
        loop {
            let dead = (0..self.depth()).find(|&i| {
                let v = self.at(i).0;
                match info.lookup(v) {
                    None => true,
                    Some(d) => d.is_unused(),
                }
            });
            match dead {
                Some(j) => {
                    self.drop_entry(j)?;
                    dropped += 1;
                }
                None => break,
            }
        }
        Ok(dropped)
    }

    /// Arrange the stack so its top `top.len()` entries are exactly
    /// `top`, left to right from the deepest: `top[0]` ends at depth
    /// `top.len()-1`, the last element on top. An operand whose `last`
    /// flag is set is moved; otherwise a copy is pushed. A variable
    /// occurring several times is copied for all but its final
    /// occurrence.
    pub fn rearrange_top(&mut self, top: &[VarIdx], last: &[bool]) -> Result<(), CodegenError> {
        let k = top.len();
        let mut last = last.to_vec();
        last.resize(k, false);
        for i in 0..k {
            for j in i + 1..k {
                if top[i] == top[j] {
                    last[i] = false;
                }
            }
        }
        for i in 0..k {
            let x = top[i];
            if last[i] {
                // the original lives below the i placed entries
                let j = self
                    .find(x, i)
                    .ok_or(CodegenError::UnknownVariable(x))?;
                self.pull_to_top(j)?;
            } else {
                let j = self.find(x, 0).ok_or(CodegenError::UnknownVariable(x))?;
                self.issue_push(j)?;
            }
        }
        Ok(())
    }

    /// Pop the top `n` entries from the model (consumed by an emitted
    /// instruction).
    pub fn consume(&mut self, n: usize) {
        let d = self.depth();
        self.s.truncate(d - n);
        self.modified();
    }

    /// Force the stack into exactly `target` (bottom to top), emitting
    /// the necessary pops, pushes and exchanges. The top `skip_top`
    /// entries are left untouched and are not part of `target`.
    pub fn enforce_state(
        &mut self,
        target: &[VarIdx],
        skip_top: usize,
    ) -> Result<(), CodegenError> {
        let count_in = |list: &[VarIdx], v: VarIdx| list.iter().filter(|&&x| x == v).count();

        // drop surplus entries below the protected top
        loop {
            let dead = (skip_top..self.depth()).find(|&i| {
                let v = self.at(i).0;
                let have = self
                    .s
                    .iter()
                    .take(self.depth() - skip_top)
                    .filter(|&&(x, _)| x == v)
                    .count();
                have > count_in(target, v)
            });
            match dead {
                Some(j) => {
                    if skip_top > 0 {
                        // POP would consume the protected top; rotate
                        // the dead entry up instead
                        self.pull_to_top(j)?;
                        self.issue_pop(0)?;
                    } else {
                        self.drop_entry(j)?;
                    }
                }
                None => break,
            }
        }

        // push missing copies
        loop {
            let missing = target.iter().copied().find(|&v| {
                let have = self
                    .s
                    .iter()
                    .take(self.depth() - skip_top)
                    .filter(|&&(x, _)| x == v)
                    .count();
                have < count_in(target, v)
            });
            match missing {
                Some(v) => {
                    let j = self.find(v, 0).ok_or(CodegenError::UnknownVariable(v))?;
                    self.issue_push(j)?;
                    if skip_top > 0 {
                        // tuck the fresh copy under the protected top
                        self.o.add(AsmOp::blkswap(skip_top as i32, 1));
                        let e = self.s.pop().expect("copy just pushed");
                        let d = self.depth();
                        self.s.insert(d - skip_top, e);
                        self.modified();
                    }
                }
                None => break,
            }
        }

        if self.depth() != target.len() + skip_top {
            return Err(CodegenError::Internal(format!(
                "enforce_state: depth {} does not match target {} + {}",
                self.depth(),
                target.len(),
                skip_top
            )));
        }

        // selection sort, deepest position first
        let n = target.len();
        for pos in 0..n {
            let want = target[pos];
            let depth_t = n - 1 - pos + skip_top;
            if self.at(depth_t).0 == want {
                continue;
            }
            let j = (skip_top..depth_t)
                .find(|&j| self.at(j).0 == want)
                .ok_or(CodegenError::UnknownVariable(want))?;
            self.issue_xchg(depth_t, j)?;
        }
        Ok(())
    }

    /// Record that the entry at `depth` holds constant-pool slot `cidx`.
    pub fn set_const(&mut self, depth: usize, cidx: ConstIdx) {
        if depth < self.depth() {
            self.at_mut(depth).1 = cidx;
        }
    }

    /// Intersect constant knowledge with another layout of the same
    /// shape (used after merging two branches).
    pub fn merge_const(&mut self, other: &[(VarIdx, ConstIdx)]) {
        if other.len() != self.s.len() {
            self.forget_const();
            return;
        }
        for (e, o) in self.s.iter_mut().zip(other) {
            if e.1 != o.1 {
                e.1 = NOT_CONST;
            }
        }
    }

    /// Emit a `// stack:` comment if comments are enabled and the
    /// layout changed since the last one.
    pub fn opt_show(&mut self) {
        if !self.mode.contains(StackMode::StkCmt) || self.shown {
            return;
        }
        let mut text = String::from("stack:");
        for &(v, _) in &self.s {
            text.push(' ');
            match self.var_names.get(v) {
                Some(n) => text.push_str(n),
                None => text.push_str(&format!("_{}", v)),
            }
        }
        self.o.add(AsmOp::comment(text));
        self.shown = true;
    }

    /// Wrap the finished body according to the calling convention:
    /// `CONT:<{ ... }>` executed directly or via CALLXARGS, with the
    /// alternate-return save when an early RETALT was emitted.
    pub fn apply_wrappers(&mut self, callxargs_count: Option<usize>) {
        let is_inline = self.mode.contains(StackMode::InlineFunc);
        if self.o.retalt {
            self.o.insert(0, AsmOp::very_custom("SAMEALTSAVE"));
            self.o.insert(0, AsmOp::very_custom("c2 SAVE"));
        }
        if callxargs_count.is_some() || (is_inline && self.o.retalt) {
            self.o.indent_all();
            self.o.insert(0, AsmOp::very_custom("CONT:<{"));
            self.o.undent();
            self.o.add(AsmOp::very_custom("}>"));
            match callxargs_count {
                Some(n) if n <= 15 => {
                    self.o.add(AsmOp::very_custom(format!("{} -1 CALLXARGS", n)));
                }
                Some(n) => {
                    debug_assert!(n <= 254);
                    self.o.add(AsmOp::very_custom(format!(
                        "{} PUSHINT -1 PUSHINT CALLXVARARGS",
                        n
                    )));
                }
                None => {
                    self.o.add(AsmOp::very_custom("EXECUTE"));
                }
            }
        }
    }
}
