//! Assembly instructions
//!
//! [`AsmOp`] is one output instruction. Canonical stack manipulations
//! (XCHG / PUSH / POP) carry numeric operands rather than rendered
//! text, so the peephole optimizer can model them; everything else is
//! either a constant push or a custom instruction string. A custom op
//! with `a >= 255` is "very custom" - an optimization barrier such as
//! a continuation bracket.
//!
//! [`AsmOpList`] accumulates the instructions of one function together
//! with its constant pool and indentation state.

use std::fmt;
use std::io::{self, Write};

/// Index into an [`AsmOpList`] constant pool.
pub type ConstIdx = i32;

/// Marker for "this stack entry holds no known constant".
pub const NOT_CONST: ConstIdx = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmOpKind {
    Nop,
    Comment,
    Xchg,
    Push,
    Pop,
    Const,
    Custom,
}

#[derive(Debug, Clone)]
pub struct AsmOp {
    pub kind: AsmOpKind,
    /// Xchg/Push/Pop: first stack operand. Custom: consumed values
    /// (255 = barrier).
    pub a: i32,
    /// Xchg: second stack operand. Custom: produced values.
    pub b: i32,
    /// Rendered text for comments, consts and customs.
    pub op: String,
    pub indent: usize,
    /// Custom op known to push one fresh constant (PUSHNULL, NEWC, ...).
    pub gconst: bool,
    /// The integer a Const op pushes, when known.
    pub origin: Option<i128>,
}

impl AsmOp {
    fn raw(kind: AsmOpKind, a: i32, b: i32, op: String) -> Self {
        AsmOp {
            kind,
            a,
            b,
            op,
            indent: 0,
            gconst: false,
            origin: None,
        }
    }

    pub fn nop() -> Self {
        AsmOp::raw(AsmOpKind::Nop, 0, 0, String::new())
    }

    pub fn comment(text: impl Into<String>) -> Self {
        AsmOp::raw(AsmOpKind::Comment, 0, 0, text.into())
    }

    /// `XCHG s(a), s(b)`; equal operands collapse to a nop.
    pub fn xchg(a: i32, b: i32) -> Self {
        if a == b {
            return AsmOp::nop();
        }
        let (a, b) = if a < b { (a, b) } else { (b, a) };
        AsmOp::raw(AsmOpKind::Xchg, a, b, String::new())
    }

    pub fn push(a: i32) -> Self {
        AsmOp::raw(AsmOpKind::Push, a, 0, String::new())
    }

    pub fn pop(a: i32) -> Self {
        AsmOp::raw(AsmOpKind::Pop, a, 0, String::new())
    }

    /// Push of an integer constant.
    pub fn int_const(v: i128) -> Self {
        let mut op = AsmOp::raw(AsmOpKind::Const, 0, 1, format!("{} PUSHINT", v));
        op.origin = Some(v);
        op
    }

    pub fn bool_const(f: bool) -> Self {
        AsmOp::int_const(if f { -1 } else { 0 })
    }

    /// Push of a constant via a dedicated instruction (`PUSHNULL`, a
    /// slice literal, ...).
    pub fn const_op(text: impl Into<String>) -> Self {
        AsmOp::raw(AsmOpKind::Const, 0, 1, text.into())
    }

    /// Custom instruction consuming `args` and producing `retv` values.
    pub fn custom(text: impl Into<String>, args: i32, retv: i32) -> Self {
        let mut op = AsmOp::raw(AsmOpKind::Custom, args, retv, text.into());
        op.compute_gconst();
        op
    }

    /// Custom instruction the optimizer must not look through.
    pub fn very_custom(text: impl Into<String>) -> Self {
        AsmOp::custom(text, 255, 255)
    }

    fn make_stk2(a: i32, b: i32, name: &str, delta: i32) -> Self {
        AsmOp::custom(format!("s{} s{} {}", a, b - delta, name), 2, 2)
    }

    fn make_stk3(a: i32, b: i32, c: i32, name: &str, d1: i32, d2: i32) -> Self {
        AsmOp::custom(format!("s{} s{} s{} {}", a, b - d1, c - d2, name), 3, 3)
    }

    pub fn xchg2(a: i32, b: i32) -> Self {
        AsmOp::make_stk2(a, b, "XCHG2", 0)
    }

    pub fn xcpu(a: i32, b: i32) -> Self {
        AsmOp::make_stk2(a, b, "XCPU", 0)
    }

    /// `b` is the semantic exchange depth; printed as `s(b-1)`.
    pub fn puxc(a: i32, b: i32) -> Self {
        AsmOp::make_stk2(a, b, "PUXC", 1)
    }

    pub fn push2(a: i32, b: i32) -> Self {
        AsmOp::make_stk2(a, b, "PUSH2", 0)
    }

    pub fn xchg3(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "XCHG3", 0, 0)
    }

    pub fn xc2pu(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "XC2PU", 0, 0)
    }

    pub fn xcpuxc(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "XCPUXC", 0, 1)
    }

    pub fn xcpu2(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "XCPU2", 0, 0)
    }

    pub fn puxc2(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "PUXC2", 1, 1)
    }

    pub fn puxcpu(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "PUXCPU", 1, 0)
    }

    pub fn pu2xc(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "PU2XC", 1, 2)
    }

    pub fn push3(a: i32, b: i32, c: i32) -> Self {
        AsmOp::make_stk3(a, b, c, "PUSH3", 0, 0)
    }

    pub fn blkswap(a: i32, b: i32) -> Self {
        match (a, b) {
            (1, 1) => AsmOp::xchg(0, 1),
            (1, 2) => AsmOp::custom("ROT", 3, 3),
            (2, 1) => AsmOp::custom("-ROT", 3, 3),
            (2, 2) => AsmOp::custom("2SWAP", 4, 4),
            _ => AsmOp::custom(format!("{} {} BLKSWAP", a, b), a + b, a + b),
        }
    }

    pub fn blkpush(a: i32, b: i32) -> Self {
        match (a, b) {
            (2, 1) => AsmOp::custom("2DUP", 2, 4),
            (2, 3) => AsmOp::custom("2OVER", 2, 4),
            _ => AsmOp::custom(format!("{} {} BLKPUSH", a, b), 0, a),
        }
    }

    pub fn blkdrop(a: i32) -> Self {
        if a == 2 {
            AsmOp::custom("2DROP", 2, 0)
        } else {
            AsmOp::custom(format!("{} BLKDROP", a), a, 0)
        }
    }

    pub fn blkdrop2(a: i32, b: i32) -> Self {
        AsmOp::custom(format!("{} {} BLKDROP2", a, b), a + b, b)
    }

    pub fn blkreverse(a: i32, b: i32) -> Self {
        AsmOp::custom(format!("{} {} REVERSE", a, b), a + b, a + b)
    }

    pub fn tuple(n: usize) -> Self {
        AsmOp::custom(format!("{} TUPLE", n), n as i32, 1)
    }

    pub fn untuple(n: usize) -> Self {
        AsmOp::custom(format!("{} UNTUPLE", n), 1, n as i32)
    }

    fn compute_gconst(&mut self) {
        if self.kind == AsmOpKind::Custom {
            self.gconst = matches!(
                self.op.as_str(),
                "PUSHNULL" | "NEWC" | "NEWB" | "TRUE" | "FALSE" | "NOW"
            );
            if self.gconst {
                self.a = 0;
                self.b = 1;
            }
        }
    }

    pub fn is_nop(&self) -> bool {
        self.kind == AsmOpKind::Nop
    }

    pub fn is_comment(&self) -> bool {
        self.kind == AsmOpKind::Comment
    }

    pub fn is_custom(&self) -> bool {
        self.kind == AsmOpKind::Custom
    }

    pub fn is_very_custom(&self) -> bool {
        self.is_custom() && self.a >= 255
    }

    pub fn is_push(&self) -> Option<i32> {
        (self.kind == AsmOpKind::Push).then_some(self.a)
    }

    pub fn is_pop(&self) -> Option<i32> {
        (self.kind == AsmOpKind::Pop).then_some(self.a)
    }

    pub fn is_xchg(&self) -> Option<(i32, i32)> {
        (self.kind == AsmOpKind::Xchg).then_some((self.a, self.b))
    }

    pub fn is_swap(&self) -> bool {
        self.is_xchg() == Some((0, 1))
    }

    pub fn is_const(&self) -> bool {
        self.kind == AsmOpKind::Const && self.a == 0 && self.b == 1
    }

    /// Pushes exactly one fresh constant.
    pub fn is_gconst(&self) -> bool {
        self.a == 0 && self.b == 1 && (self.kind == AsmOpKind::Const || self.gconst)
    }

    /// Classify one line of assembly text back into an op. Unknown
    /// instructions come back as barriers.
    pub fn parse(line: &str) -> Self {
        let s = line.trim();
        if s.is_empty() {
            return AsmOp::nop();
        }
        if let Some(text) = s.strip_prefix("//") {
            return AsmOp::comment(text.trim_start());
        }
        match s {
            "SWAP" => return AsmOp::xchg(0, 1),
            "DUP" => return AsmOp::push(0),
            "OVER" => return AsmOp::push(1),
            "DROP" => return AsmOp::pop(0),
            "NIP" => return AsmOp::pop(1),
            "ROT" | "-ROT" | "2SWAP" => return AsmOp::custom(s, 4, 4),
            "TUCK" | "2DUP" | "2OVER" => return AsmOp::custom(s, 2, 4),
            "2DROP" => return AsmOp::custom(s, 2, 0),
            _ => {}
        }
        let toks: Vec<&str> = s.split_whitespace().collect();
        let sreg = |t: &str| -> Option<i32> { t.strip_prefix('s')?.parse::<i32>().ok() };
        let num = |t: &str| -> Option<i32> { t.parse::<i32>().ok() };
        match toks.as_slice() {
            [x, y, "XCHG"] => {
                if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                    return AsmOp::xchg(i, j);
                }
            }
            [x, "PUSH"] => {
                if let Some(i) = sreg(x) {
                    return AsmOp::push(i);
                }
            }
            [x, "POP"] => {
                if let Some(i) = sreg(x) {
                    return AsmOp::pop(i);
                }
            }
            [n, "PUSHINT"] => {
                if let Ok(v) = n.parse::<i128>() {
                    return AsmOp::int_const(v);
                }
            }
            [n, "BLKDROP"] => {
                if let Some(i) = num(n) {
                    return AsmOp::blkdrop(i);
                }
            }
            [x, y, "BLKSWAP"] => {
                if let (Some(i), Some(j)) = (num(x), num(y)) {
                    return AsmOp::blkswap(i, j);
                }
            }
            [x, y, "BLKPUSH"] => {
                if let (Some(i), Some(j)) = (num(x), num(y)) {
                    return AsmOp::blkpush(i, j);
                }
            }
            [x, y, "BLKDROP2"] => {
                if let (Some(i), Some(j)) = (num(x), num(y)) {
                    return AsmOp::blkdrop2(i, j);
                }
            }
            [x, y, "REVERSE"] => {
                if let (Some(i), Some(j)) = (num(x), num(y)) {
                    return AsmOp::blkreverse(i, j);
                }
            }
            [n, "TUPLE"] => {
                if let Some(i) = num(n) {
                    return AsmOp::tuple(i as usize);
                }
            }
            [n, "UNTUPLE"] => {
                if let Some(i) = num(n) {
                    return AsmOp::untuple(i as usize);
                }
            }
            // printed operands of the paired/triple forms are shifted
            // by the same deltas the constructors apply
            [x, y, "XCHG2"] => {
                if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                    return AsmOp::xchg2(i, j);
                }
            }
            [x, y, "XCPU"] => {
                if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                    return AsmOp::xcpu(i, j);
                }
            }
            [x, y, "PUXC"] => {
                if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                    return AsmOp::puxc(i, j + 1);
                }
            }
            [x, y, "PUSH2"] => {
                if let (Some(i), Some(j)) = (sreg(x), sreg(y)) {
                    return AsmOp::push2(i, j);
                }
            }
            [x, y, z, "XCHG3"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::xchg3(i, j, k);
                }
            }
            [x, y, z, "XC2PU"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::xc2pu(i, j, k);
                }
            }
            [x, y, z, "XCPUXC"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::xcpuxc(i, j, k + 1);
                }
            }
            [x, y, z, "XCPU2"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::xcpu2(i, j, k);
                }
            }
            [x, y, z, "PUXC2"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::puxc2(i, j + 1, k + 1);
                }
            }
            [x, y, z, "PUXCPU"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::puxcpu(i, j + 1, k);
                }
            }
            [x, y, z, "PU2XC"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::pu2xc(i, j + 1, k + 2);
                }
            }
            [x, y, z, "PUSH3"] => {
                if let (Some(i), Some(j), Some(k)) = (sreg(x), sreg(y), sreg(z)) {
                    return AsmOp::push3(i, j, k);
                }
            }
            _ => {}
        }
        let mut op = AsmOp::custom(s, 255, 255);
        op.compute_gconst();
        op
    }
}

impl fmt::Display for AsmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            AsmOpKind::Nop => Ok(()),
            AsmOpKind::Comment => write!(f, "// {}", self.op),
            AsmOpKind::Xchg => match (self.a, self.b) {
                (0, 1) => write!(f, "SWAP"),
                (a, b) => write!(f, "s{} s{} XCHG", a, b),
            },
            AsmOpKind::Push => match self.a {
                0 => write!(f, "DUP"),
                1 => write!(f, "OVER"),
                a => write!(f, "s{} PUSH", a),
            },
            AsmOpKind::Pop => match self.a {
                0 => write!(f, "DROP"),
                1 => write!(f, "NIP"),
                a => write!(f, "s{} POP", a),
            },
            AsmOpKind::Const | AsmOpKind::Custom => write!(f, "{}", self.op),
        }
    }
}

/// The instruction list of one function.
#[derive(Default)]
pub struct AsmOpList {
    pub list: Vec<AsmOp>,
    indent: usize,
    constants: Vec<i128>,
    /// An early return through the alternate continuation was emitted;
    /// the wrapper must save c2.
    pub retalt: bool,
}

impl AsmOpList {
    pub fn new() -> Self {
        AsmOpList::default()
    }

    pub fn with_ops(list: Vec<AsmOp>) -> Self {
        AsmOpList {
            list,
            ..AsmOpList::default()
        }
    }

    pub fn add(&mut self, mut op: AsmOp) -> &mut Self {
        if op.is_nop() {
            return self;
        }
        op.indent = self.indent;
        self.list.push(op);
        self
    }

    pub fn append(&mut self, ops: Vec<AsmOp>) {
        for op in ops {
            self.add(op);
        }
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn undent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    pub fn indent_all(&mut self) {
        for op in &mut self.list {
            op.indent += 1;
        }
        self.indent += 1;
    }

    pub fn insert(&mut self, pos: usize, mut op: AsmOp) {
        op.indent = if pos == 0 {
            0
        } else {
            self.list[pos - 1].indent
        };
        self.list.insert(pos, op);
    }

    /// Intern an integer constant; equal constants share a slot.
    pub fn register_const(&mut self, v: i128) -> ConstIdx {
        match self.constants.iter().position(|&c| c == v) {
            Some(i) => i as ConstIdx,
            None => {
                self.constants.push(v);
                (self.constants.len() - 1) as ConstIdx
            }
        }
    }

    pub fn get_const(&self, idx: ConstIdx) -> Option<i128> {
        if idx < 0 {
            None
        } else {
            self.constants.get(idx as usize).copied()
        }
    }

    /// Write every instruction, one per line, indented under
    /// `base_indent` levels of two spaces.
    pub fn out(&self, w: &mut dyn Write, base_indent: usize) -> io::Result<()> {
        for op in &self.list {
            if op.is_nop() {
                continue;
            }
            let pad = "  ".repeat(base_indent + op.indent);
            writeln!(w, "{}{}", pad, op)?;
        }
        Ok(())
    }
}
