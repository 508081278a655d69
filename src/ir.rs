//! Abstract intermediate representation
//!
//! A function body is a [`CodeBlob`]: a dense table of virtual
//! variables plus a sequence of [`Op`]s. Control-flow ops own their
//! child blocks as plain vectors, so in-order traversal is a recursive
//! walk with O(1) block boundaries.
//!
//! The blob doubles as a builder: nested blocks are constructed through
//! a stack of "append here" cursors (`begin_block`/`end_block`), so the
//! front-end can lower arbitrarily nested control flow without
//! recursing through the host call stack itself.

use std::fmt::{self, Write as _};

use enumset::{EnumSet, EnumSetType};

use crate::context::{FunId, GlobId};
use crate::descriptors::{VarDescr, VarDescrList};
use crate::types::{TypeArena, TypeRef};

/// Index of a virtual variable within its code blob.
pub type VarIdx = usize;

/// A source position carried through for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SrcLocation {
    pub line: u32,
    pub col: u32,
}

impl SrcLocation {
    pub fn new(line: u32, col: u32) -> Self {
        SrcLocation { line, col }
    }
}

impl fmt::Display for SrcLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "?")
        } else {
            write!(f, "{}:{}", self.line, self.col)
        }
    }
}

/// Classification of a virtual variable.
#[derive(EnumSetType, Debug)]
pub enum VarKind {
    /// Function parameter.
    In,
    /// Carries a user-visible name.
    Named,
    /// Compiler temporary.
    Tmp,
    /// The name is unique within the blob.
    UniqueName,
}

/// One virtual variable of a code blob.
#[derive(Debug, Clone)]
pub struct TmpVar {
    pub idx: VarIdx,
    pub ty: TypeRef,
    pub kind: EnumSet<VarKind>,
    pub name: Option<String>,
    pub loc: SrcLocation,
}

impl TmpVar {
    pub fn show(&self) -> String {
        match &self.name {
            Some(n) => format!("'{}", n),
            None => format!("_{}", self.idx),
        }
    }
}

#[derive(EnumSetType, Debug)]
pub enum OpFlag {
    /// Skipped by codegen (its outputs were absorbed elsewhere).
    Disabled,
    /// Control never falls through this op.
    NoReturn,
    /// Has side effects; never optimized out even if outputs are dead.
    Impure,
}

/// The operation kinds. Control ops own their child blocks.
#[derive(Debug, Clone)]
pub enum OpKind {
    Nop,
    /// Parameters entering the stack at function start; `left` lists them.
    Import,
    IntConst(i128),
    SliceConst(String),
    /// Read a global; `left` receives its components.
    GlobVar(GlobId),
    /// Write a global from `right`.
    SetGlob(GlobId),
    /// `left := right`, componentwise.
    Let,
    /// Pack `right` into a single tuple value `left[0]`.
    Tuple,
    /// Unpack tuple `right[0]` into `left`.
    UnTuple,
    /// Direct call; `right` are arguments, `left` results.
    Call(FunId),
    /// Indirect call; `right = [args..., continuation]`.
    CallInd,
    /// Return `right` from the function.
    Return,
    If {
        then_block: Vec<Op>,
        else_block: Vec<Op>,
    },
    /// `right = [cond var]` computed by `cond` block before each pass.
    While {
        cond: Vec<Op>,
        body: Vec<Op>,
    },
    /// Body first, then `right = [cond var]` decides whether to exit.
    Until {
        body: Vec<Op>,
    },
    /// Run `body` exactly `right[0]` times.
    Repeat {
        body: Vec<Op>,
    },
    /// Infinite loop.
    Again {
        body: Vec<Op>,
    },
    /// `left` are the two catch-pattern delivery vars.
    TryCatch {
        try_block: Vec<Op>,
        catch_block: Vec<Op>,
    },
}

/// A single abstract instruction over virtual variables.
#[derive(Debug, Clone)]
pub struct Op {
    pub kind: OpKind,
    pub flags: EnumSet<OpFlag>,
    pub left: Vec<VarIdx>,
    pub right: Vec<VarIdx>,
    pub loc: SrcLocation,
    /// Variables live on entry to this op (filled by liveness).
    pub var_info: VarDescrList,
    /// Descriptors of the `right` operands: `Last` flags from liveness,
    /// value facts from the forward pass.
    pub args: Vec<VarDescr>,
    /// Whether each `left` output is dead (filled by liveness).
    pub left_unused: Vec<bool>,
}

impl Op {
    pub fn new(loc: SrcLocation, kind: OpKind) -> Self {
        Op {
            kind,
            flags: EnumSet::empty(),
            left: Vec::new(),
            right: Vec::new(),
            loc,
            var_info: VarDescrList::new(),
            args: Vec::new(),
            left_unused: Vec::new(),
        }
    }

    pub fn with_left(mut self, left: Vec<VarIdx>) -> Self {
        self.left = left;
        self
    }

    pub fn with_right(mut self, right: Vec<VarIdx>) -> Self {
        self.right = right;
        self
    }

    pub fn disabled(&self) -> bool {
        self.flags.contains(OpFlag::Disabled)
    }

    pub fn set_disabled(&mut self) {
        self.flags |= OpFlag::Disabled;
    }

    pub fn noreturn(&self) -> bool {
        self.flags.contains(OpFlag::NoReturn)
    }

    /// Returns whether the flag changed.
    pub fn set_noreturn(&mut self, flag: bool) -> bool {
        let old = self.noreturn();
        if flag {
            self.flags |= OpFlag::NoReturn;
        } else {
            self.flags -= OpFlag::NoReturn;
        }
        old != flag
    }

    pub fn impure(&self) -> bool {
        self.flags.contains(OpFlag::Impure)
    }

    pub fn set_impure(&mut self) {
        self.flags |= OpFlag::Impure;
    }

    /// Child blocks of this op, if any.
    pub fn blocks(&self) -> Vec<&Vec<Op>> {
        match &self.kind {
            OpKind::If {
                then_block,
                else_block,
            } => vec![then_block, else_block],
            OpKind::While { cond, body } => vec![cond, body],
            OpKind::Until { body } | OpKind::Repeat { body } | OpKind::Again { body } => {
                vec![body]
            }
            OpKind::TryCatch {
                try_block,
                catch_block,
            } => vec![try_block, catch_block],
            _ => Vec::new(),
        }
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut Vec<Op>> {
        match &mut self.kind {
            OpKind::If {
                then_block,
                else_block,
            } => vec![then_block, else_block],
            OpKind::While { cond, body } => vec![cond, body],
            OpKind::Until { body } | OpKind::Repeat { body } | OpKind::Again { body } => {
                vec![body]
            }
            OpKind::TryCatch {
                try_block,
                catch_block,
            } => vec![try_block, catch_block],
            _ => Vec::new(),
        }
    }
}

/// The IR of one function body plus its builder state.
#[derive(Debug)]
pub struct CodeBlob {
    pub name: String,
    pub loc: SrcLocation,
    pub ret_type: TypeRef,
    pub vars: Vec<TmpVar>,
    pub in_var_cnt: usize,
    pub ops: Vec<Op>,
    /// Stack of blocks under construction; ops append to the innermost.
    open_blocks: Vec<Vec<Op>>,
    pub require_callxargs: bool,
}

impl CodeBlob {
    pub fn new(name: impl Into<String>, loc: SrcLocation, ret_type: TypeRef) -> Self {
        CodeBlob {
            name: name.into(),
            loc,
            ret_type,
            vars: Vec::new(),
            in_var_cnt: 0,
            ops: Vec::new(),
            open_blocks: Vec::new(),
            require_callxargs: false,
        }
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn create_var(
        &mut self,
        kind: EnumSet<VarKind>,
        ty: TypeRef,
        name: Option<String>,
        loc: SrcLocation,
    ) -> VarIdx {
        let idx = self.vars.len();
        self.vars.push(TmpVar {
            idx,
            ty,
            kind,
            name,
            loc,
        });
        idx
    }

    pub fn create_tmp_var(&mut self, ty: TypeRef, loc: SrcLocation) -> VarIdx {
        self.create_var(VarKind::Tmp.into(), ty, None, loc)
    }

    /// Declare the parameters and emit the `Import` op that puts them
    /// on the stack. Returns their indices in declaration order.
    pub fn import_params(
        &mut self,
        params: Vec<(TypeRef, Option<String>, SrcLocation)>,
    ) -> Vec<VarIdx> {
        let mut idxs = Vec::with_capacity(params.len());
        for (ty, name, loc) in params {
            let mut kind: EnumSet<VarKind> = VarKind::In.into();
            if name.is_some() {
                kind |= VarKind::Named;
            }
            idxs.push(self.create_var(kind, ty, name, loc));
        }
        self.in_var_cnt = idxs.len();
        let op = Op::new(self.loc, OpKind::Import).with_left(idxs.clone());
        self.push_op(op);
        idxs
    }

    /// Append an op to the innermost open block.
    pub fn push_op(&mut self, op: Op) {
        match self.open_blocks.last_mut() {
            Some(block) => block.push(op),
            None => self.ops.push(op),
        }
    }

    pub fn begin_block(&mut self) {
        self.open_blocks.push(Vec::new());
    }

    pub fn end_block(&mut self) -> Vec<Op> {
        self.open_blocks
            .pop()
            .expect("end_block without begin_block")
    }

    /// `if cond { then } else { otherwise }`.
    pub fn emit_if(
        &mut self,
        loc: SrcLocation,
        cond: VarIdx,
        then_f: impl FnOnce(&mut Self),
        else_f: impl FnOnce(&mut Self),
    ) {
        self.begin_block();
        then_f(self);
        let then_block = self.end_block();
        self.begin_block();
        else_f(self);
        let else_block = self.end_block();
        let op = Op::new(
            loc,
            OpKind::If {
                then_block,
                else_block,
            },
        )
        .with_right(vec![cond]);
        self.push_op(op);
    }

    /// `while cond { body }`; the condition block must end by producing
    /// the condition variable it returns.
    pub fn emit_while(
        &mut self,
        loc: SrcLocation,
        cond_f: impl FnOnce(&mut Self) -> VarIdx,
        body_f: impl FnOnce(&mut Self),
    ) {
        self.begin_block();
        let cond = cond_f(self);
        let cond_block = self.end_block();
        self.begin_block();
        body_f(self);
        let body = self.end_block();
        let op = Op::new(
            loc,
            OpKind::While {
                cond: cond_block,
                body,
            },
        )
        .with_right(vec![cond]);
        self.push_op(op);
    }

    /// `do { body } until cond`; the body computes the exit condition.
    pub fn emit_until(&mut self, loc: SrcLocation, body_f: impl FnOnce(&mut Self) -> VarIdx) {
        self.begin_block();
        let cond = body_f(self);
        let body = self.end_block();
        let op = Op::new(loc, OpKind::Until { body }).with_right(vec![cond]);
        self.push_op(op);
    }

    /// `repeat count { body }`.
    pub fn emit_repeat(
        &mut self,
        loc: SrcLocation,
        count: VarIdx,
        body_f: impl FnOnce(&mut Self),
    ) {
        self.begin_block();
        body_f(self);
        let body = self.end_block();
        let op = Op::new(loc, OpKind::Repeat { body }).with_right(vec![count]);
        self.push_op(op);
    }

    /// Infinite loop.
    pub fn emit_again(&mut self, loc: SrcLocation, body_f: impl FnOnce(&mut Self)) {
        self.begin_block();
        body_f(self);
        let body = self.end_block();
        self.push_op(Op::new(loc, OpKind::Again { body }));
    }

    /// `try { A } catch (exc, code) { B }`. The runtime delivers the
    /// exception argument and code into two fresh delivery vars; a
    /// synthetic `Let` at the head of the catch block moves them into
    /// the user's pattern vars.
    pub fn emit_try_catch(
        &mut self,
        loc: SrcLocation,
        types: &mut TypeArena,
        catch_vars: (VarIdx, VarIdx),
        try_f: impl FnOnce(&mut Self),
        catch_f: impl FnOnce(&mut Self),
    ) {
        self.begin_block();
        try_f(self);
        let try_block = self.end_block();

        // the machine delivers one cell of exception argument plus the
        // integer exception code
        let arg_ty = types.new_hole_width(1);
        let code_ty = types.new_hole_width(1);
        let deliver_arg = self.create_tmp_var(arg_ty, loc);
        let deliver_code = self.create_tmp_var(code_ty, loc);

        self.begin_block();
        let bind = Op::new(loc, OpKind::Let)
            .with_left(vec![catch_vars.0, catch_vars.1])
            .with_right(vec![deliver_arg, deliver_code]);
        self.push_op(bind);
        catch_f(self);
        let catch_block = self.end_block();

        let op = Op::new(
            loc,
            OpKind::TryCatch {
                try_block,
                catch_block,
            },
        )
        .with_left(vec![deliver_arg, deliver_code]);
        self.push_op(op);
    }

    pub fn emit_return(&mut self, loc: SrcLocation, results: Vec<VarIdx>) {
        let op = Op::new(loc, OpKind::Return).with_right(results);
        self.push_op(op);
    }

    /// Human-readable dump of the IR, for verbose mode.
    pub fn show(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "fn {} ({} vars)", self.name, self.vars.len());
        Self::show_block(&mut out, &self.ops, &self.vars, 1);
        out
    }

    fn show_block(out: &mut String, ops: &[Op], vars: &[TmpVar], depth: usize) {
        let pad = "  ".repeat(depth);
        for op in ops {
            let lhs = Self::show_var_list(&op.left, vars);
            let rhs = Self::show_var_list(&op.right, vars);
            let _ = match &op.kind {
                OpKind::Nop => writeln!(out, "{}NOP", pad),
                OpKind::Import => writeln!(out, "{}IMPORT {}", pad, lhs),
                OpKind::IntConst(v) => writeln!(out, "{}{} = {}", pad, lhs, v),
                OpKind::SliceConst(s) => writeln!(out, "{}{} = slice\"{}\"", pad, lhs, s),
                OpKind::GlobVar(g) => writeln!(out, "{}{} = GLOB {:?}", pad, lhs, g),
                OpKind::SetGlob(g) => writeln!(out, "{}GLOB {:?} = {}", pad, g, rhs),
                OpKind::Let => writeln!(out, "{}{} = {}", pad, lhs, rhs),
                OpKind::Tuple => writeln!(out, "{}{} = TUPLE ({})", pad, lhs, rhs),
                OpKind::UnTuple => writeln!(out, "{}{} = UNTUPLE ({})", pad, lhs, rhs),
                OpKind::Call(f) => writeln!(out, "{}{} = CALL {:?} ({})", pad, lhs, f, rhs),
                OpKind::CallInd => writeln!(out, "{}{} = CALLIND ({})", pad, lhs, rhs),
                OpKind::Return => writeln!(out, "{}RETURN {}", pad, rhs),
                OpKind::If { .. } => writeln!(out, "{}IF {}", pad, rhs),
                OpKind::While { .. } => writeln!(out, "{}WHILE {}", pad, rhs),
                OpKind::Until { .. } => writeln!(out, "{}UNTIL {}", pad, rhs),
                OpKind::Repeat { .. } => writeln!(out, "{}REPEAT {}", pad, rhs),
                OpKind::Again { .. } => writeln!(out, "{}AGAIN", pad),
                OpKind::TryCatch { .. } => writeln!(out, "{}TRY {}", pad, lhs),
            };
            for block in op.blocks() {
                Self::show_block(out, block, vars, depth + 1);
            }
        }
    }

    fn show_var_list(idxs: &[VarIdx], vars: &[TmpVar]) -> String {
        idxs.iter()
            .map(|&i| {
                vars.get(i)
                    .map(|v| v.show())
                    .unwrap_or_else(|| format!("_{}", i))
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeArena;

    #[test]
    fn test_nested_block_builder() {
        let mut types = TypeArena::new();
        let int = types.new_atomic(crate::types::Atomic::Int);
        let mut code = CodeBlob::new("t", SrcLocation::default(), int);
        let x = code.import_params(vec![(int, Some("x".into()), SrcLocation::default())])[0];
        code.emit_if(
            SrcLocation::default(),
            x,
            |c| c.emit_return(SrcLocation::default(), vec![x]),
            |c| {
                let zero = c.create_tmp_var(int, SrcLocation::default());
                c.push_op(Op::new(SrcLocation::default(), OpKind::IntConst(0)).with_left(vec![zero]));
                c.emit_return(SrcLocation::default(), vec![zero]);
            },
        );
        assert_eq!(code.ops.len(), 2);
        let OpKind::If {
            then_block,
            else_block,
        } = &code.ops[1].kind
        else {
            panic!("expected If");
        };
        assert_eq!(then_block.len(), 1);
        assert_eq!(else_block.len(), 2);
    }

    #[test]
    fn test_try_catch_synthetic_let() {
        let mut types = TypeArena::new();
        let int = types.new_atomic(crate::types::Atomic::Int);
        let mut code = CodeBlob::new("t", SrcLocation::default(), int);
        let e = code.create_tmp_var(int, SrcLocation::default());
        let n = code.create_tmp_var(int, SrcLocation::default());
        code.emit_try_catch(
            SrcLocation::default(),
            &mut types,
            (e, n),
            |_| {},
            |_| {},
        );
        let OpKind::TryCatch { catch_block, .. } = &code.ops[0].kind else {
            panic!("expected TryCatch");
        };
        assert!(matches!(catch_block[0].kind, OpKind::Let));
        assert_eq!(catch_block[0].left, vec![e, n]);
        assert_eq!(code.ops[0].left.len(), 2);
    }
}
