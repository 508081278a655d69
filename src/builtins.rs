//! Built-in operations
//!
//! The registry mapping builtin names to their types, flags and
//! compile functions. A compile function plays two roles: during the
//! forward analysis it acts as the value-descriptor transfer function
//! (filling the output facts, folding constants, and marking inputs it
//! absorbs into immediates as unused), and during code generation it
//! returns the instruction for the call site, specialized on the same
//! facts.
//!
//! An input marked unused is never materialized on the stack; its
//! producing push dies in the liveness re-run or is cancelled by the
//! peephole pass.

use enumset::{enum_set, EnumSet};

use crate::codegen::asm::AsmOp;
use crate::context::{BuiltinCompile, CompilerContext, FnFlag};
use crate::descriptors::{ValFact, VarDescr, CONST_TRUE, FINITE_INT, VAL_BOOL};
use crate::ir::SrcLocation;

/// `arg op`, the immediate-operand instruction form.
pub fn exec_arg_op(op: &str, arg: i128, args: i32, retv: i32) -> AsmOp {
    AsmOp::custom(format!("{} {}", arg, op), args, retv)
}

pub fn push_const(v: i128) -> AsmOp {
    AsmOp::int_const(v)
}

/// `Some(k)` when `v == 2^k`.
fn is_pos_pow2(v: i128) -> Option<u32> {
    (v > 0 && v & (v - 1) == 0).then(|| v.trailing_zeros())
}

fn fits_bits(v: i128, bits: u32) -> bool {
    let half = 1i128 << (bits - 1);
    (-half..half).contains(&v)
}

// --- fact transfer helpers ---

fn fact_add(x: &VarDescr, y: &VarDescr) -> EnumSet<ValFact> {
    let mut f = enum_set!(ValFact::Int);
    if x.always_finite() && y.always_finite() {
        f |= ValFact::Finite | ValFact::NotNull;
    }
    if (x.always_even() && y.always_even()) || (x.always_odd() && y.always_odd()) {
        f |= ValFact::Even;
    }
    if (x.always_even() && y.always_odd()) || (x.always_odd() && y.always_even()) {
        f |= ValFact::Odd;
    }
    if x.always_nonneg() && y.always_nonneg() {
        f |= ValFact::Pos;
        if x.always_pos() || y.always_pos() {
            f |= ValFact::NonZero;
        }
    }
    if x.always_nonpos() && y.always_nonpos() {
        f |= ValFact::Neg;
        if x.always_neg() || y.always_neg() {
            f |= ValFact::NonZero;
        }
    }
    f
}

fn negated(x: &VarDescr) -> VarDescr {
    let mut d = x.clone();
    let pos = d.val.contains(ValFact::Pos);
    let neg = d.val.contains(ValFact::Neg);
    d.val -= ValFact::Pos | ValFact::Neg;
    if pos {
        d.val |= ValFact::Neg;
    }
    if neg {
        d.val |= ValFact::Pos;
    }
    d.int_const = d.int_const.and_then(|v| v.checked_neg());
    d
}

fn fact_mul(x: &VarDescr, y: &VarDescr) -> EnumSet<ValFact> {
    let mut f = enum_set!(ValFact::Int);
    if x.always_finite() && y.always_finite() {
        f |= ValFact::Finite | ValFact::NotNull;
    }
    if x.always_even() || y.always_even() {
        f |= ValFact::Even;
    }
    if x.always_odd() && y.always_odd() {
        f |= ValFact::Odd;
    }
    if x.always_nonzero() && y.always_nonzero() {
        f |= ValFact::NonZero;
    }
    let same_sign = (x.always_nonneg() && y.always_nonneg())
        || (x.always_nonpos() && y.always_nonpos());
    let opp_sign = (x.always_nonneg() && y.always_nonpos())
        || (x.always_nonpos() && y.always_nonneg());
    if same_sign {
        f |= ValFact::Pos;
    }
    if opp_sign {
        f |= ValFact::Neg;
    }
    if x.always_zero() || y.always_zero() {
        f |= ValFact::Zero | ValFact::Pos | ValFact::Neg | ValFact::Even;
        f -= ValFact::NonZero | ValFact::Odd;
    }
    f
}

// --- arithmetic ---

fn compile_add(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("ADD", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        if let Some(v) = x.int_const.unwrap().checked_add(y.int_const.unwrap()) {
            r.set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
    }
    r.val = fact_add(x, y);
    if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
        if v == 0 {
            r.import(x);
            r.val |= fact_add(x, y);
            y.unused();
            return AsmOp::nop();
        }
        if v == 1 {
            y.unused();
            return AsmOp::custom("INC", 1, 1);
        }
        if v == -1 {
            y.unused();
            return AsmOp::custom("DEC", 1, 1);
        }
        if fits_bits(v, 8) {
            y.unused();
            return exec_arg_op("ADDCONST", v, 1, 1);
        }
    }
    if let Some(v) = x.int_const.filter(|_| x.is_int_const()) {
        if v == 0 {
            x.unused();
            return AsmOp::nop();
        }
        if fits_bits(v, 8) {
            x.unused();
            return exec_arg_op("ADDCONST", v, 1, 1);
        }
    }
    AsmOp::custom("ADD", 2, 1)
}

fn compile_sub(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("SUB", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        if let Some(v) = x.int_const.unwrap().checked_sub(y.int_const.unwrap()) {
            r.set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
    }
    r.val = fact_add(x, &negated(y));
    if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
        if v == 0 {
            y.unused();
            return AsmOp::nop();
        }
        if v == 1 {
            y.unused();
            return AsmOp::custom("DEC", 1, 1);
        }
        if let Some(nv) = v.checked_neg().filter(|&nv| fits_bits(nv, 8)) {
            y.unused();
            return exec_arg_op("ADDCONST", nv, 1, 1);
        }
    }
    if x.is_int_const() && x.int_const == Some(0) {
        x.unused();
        return AsmOp::custom("NEGATE", 1, 1);
    }
    AsmOp::custom("SUB", 2, 1)
}

fn compile_negate(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let x = &mut ins[0];
    let r = &mut out[0];
    if x.is_int_const() {
        if let Some(v) = x.int_const.unwrap().checked_neg() {
            r.set_const(v);
            x.unused();
            return push_const(v);
        }
    }
    *r = negated(x);
    AsmOp::custom("NEGATE", 1, 1)
}

fn compile_mul(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("MUL", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        if let Some(v) = x.int_const.unwrap().checked_mul(y.int_const.unwrap()) {
            r.set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
    }
    r.val = fact_mul(x, y);
    // multiplying a finite value by zero erases the whole computation
    if y.is_int_const() && y.int_const == Some(0) && x.always_finite() {
        x.unused();
        y.unused();
        r.set_const(0);
        return push_const(0);
    }
    if x.is_int_const() && x.int_const == Some(0) && y.always_finite() {
        x.unused();
        y.unused();
        r.set_const(0);
        return push_const(0);
    }
    if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
        if v == 1 {
            y.unused();
            return AsmOp::nop();
        }
        if v == -1 {
            y.unused();
            return AsmOp::custom("NEGATE", 1, 1);
        }
        if let Some(k) = is_pos_pow2(v) {
            y.unused();
            return exec_arg_op("LSHIFT#", k as i128, 1, 1);
        }
        if fits_bits(v, 8) {
            y.unused();
            return exec_arg_op("MULCONST", v, 1, 1);
        }
    }
    if let Some(v) = x.int_const.filter(|_| x.is_int_const()) {
        if v == 1 {
            x.unused();
            return AsmOp::nop();
        }
        if v == -1 {
            x.unused();
            return AsmOp::custom("NEGATE", 1, 1);
        }
        if let Some(k) = is_pos_pow2(v) {
            x.unused();
            return exec_arg_op("LSHIFT#", k as i128, 1, 1);
        }
    }
    AsmOp::custom("MUL", 2, 1)
}

fn compile_div(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("DIV", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        let a = x.int_const.unwrap();
        let b = y.int_const.unwrap();
        if b != 0 {
            let v = a.div_euclid(b.abs()) * b.signum();
            // floor division, matching the machine's DIV
            let v = if b < 0 && a.rem_euclid(b.abs()) != 0 {
                v - 1
            } else {
                v
            };
            r.set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
    }
    r.val = FINITE_INT & fact_mul(x, y) | ValFact::Int;
    if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
        if v == 1 {
            y.unused();
            return AsmOp::nop();
        }
        if v == -1 {
            y.unused();
            return AsmOp::custom("NEGATE", 1, 1);
        }
        if let Some(k) = is_pos_pow2(v) {
            y.unused();
            return exec_arg_op("RSHIFT#", k as i128, 1, 1);
        }
    }
    AsmOp::custom("DIV", 2, 1)
}

fn compile_mod(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("MOD", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() && y.int_const != Some(0) {
        let b = y.int_const.unwrap();
        // floored modulo: the result takes the divisor's sign
        let m = x.int_const.unwrap().rem_euclid(b.abs());
        let v = if b < 0 && m != 0 { m + b } else { m };
        r.set_const(v);
        x.unused();
        y.unused();
        return push_const(v);
    }
    if x.always_finite() && y.always_finite() {
        r.val = FINITE_INT;
    } else {
        r.val = enum_set!(ValFact::Int);
    }
    if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
        if let Some(k) = is_pos_pow2(v) {
            y.unused();
            let mut d = r.clone();
            d.val |= ValFact::Pos;
            *r = d;
            return exec_arg_op("MODPOW2#", k as i128, 1, 1);
        }
    }
    AsmOp::custom("MOD", 2, 1)
}

fn compile_lshift(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("LSHIFT", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        let k = y.int_const.unwrap();
        if (0..=255).contains(&k) {
            if let Some(v) = x.int_const.unwrap().checked_shl(k as u32) {
                r.set_const(v);
                x.unused();
                y.unused();
                return push_const(v);
            }
        }
    }
    r.val = enum_set!(ValFact::Int);
    if let Some(k) = y.int_const.filter(|_| y.is_int_const()) {
        if (0..=255).contains(&k) {
            y.unused();
            return exec_arg_op("LSHIFT#", k, 1, 1);
        }
    }
    AsmOp::custom("LSHIFT", 2, 1)
}

fn compile_rshift(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom("RSHIFT", 2, 1),
    };
    let r = &mut out[0];
    if x.is_int_const() && y.is_int_const() {
        let k = y.int_const.unwrap();
        if (0..=255).contains(&k) {
            let v = x.int_const.unwrap() >> k.min(127) as u32;
            r.set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
    }
    r.val = FINITE_INT;
    if let Some(k) = y.int_const.filter(|_| y.is_int_const()) {
        if (0..=255).contains(&k) {
            y.unused();
            return exec_arg_op("RSHIFT#", k, 1, 1);
        }
    }
    AsmOp::custom("RSHIFT", 2, 1)
}

fn compile_bit_and(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = x.int_const.unwrap() & y.int_const.unwrap();
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = FINITE_INT & (x.val | y.val) | ValFact::Int;
    }
    AsmOp::custom("AND", 2, 1)
}

fn compile_bit_or(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = x.int_const.unwrap() | y.int_const.unwrap();
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = enum_set!(ValFact::Int);
    }
    AsmOp::custom("OR", 2, 1)
}

fn compile_bit_xor(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = x.int_const.unwrap() ^ y.int_const.unwrap();
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = enum_set!(ValFact::Int);
    }
    AsmOp::custom("XOR", 2, 1)
}

fn compile_bit_not(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let x = &mut ins[0];
    if x.is_int_const() {
        let v = !x.int_const.unwrap();
        out[0].set_const(v);
        x.unused();
        return push_const(v);
    }
    out[0].val = enum_set!(ValFact::Int);
    AsmOp::custom("NOT", 1, 1)
}

// --- comparisons ---

#[derive(Clone, Copy)]
struct CmpSpec {
    name: &'static str,
    /// Immediate form `N <imm>`, when the right operand is a small const.
    imm: Option<&'static str>,
    eval: fn(i128, i128) -> bool,
}

fn compile_cmp_impl(
    out: &mut [VarDescr],
    ins: &mut [VarDescr],
    spec: CmpSpec,
) -> AsmOp {
    let (x, y) = match ins {
        [x, y] => (x, y),
        _ => return AsmOp::custom(spec.name, 2, 1),
    };
    let r = &mut out[0];
    r.val = VAL_BOOL;
    if x.is_int_const() && y.is_int_const() {
        let v = (spec.eval)(x.int_const.unwrap(), y.int_const.unwrap());
        x.unused();
        y.unused();
        if v {
            r.val = CONST_TRUE | ValFact::Const;
            r.int_const = Some(-1);
        } else {
            r.set_const(0);
        }
        return AsmOp::bool_const(v);
    }
    if let Some(imm) = spec.imm {
        if let Some(v) = y.int_const.filter(|_| y.is_int_const()) {
            if fits_bits(v, 8) {
                y.unused();
                return exec_arg_op(imm, v, 1, 1);
            }
        }
    }
    AsmOp::custom(spec.name, 2, 1)
}

fn compile_eq(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "EQUAL",
            imm: Some("EQINT"),
            eval: |a, b| a == b,
        },
    )
}

fn compile_neq(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "NEQ",
            imm: Some("NEQINT"),
            eval: |a, b| a != b,
        },
    )
}

fn compile_lt(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "LESS",
            imm: Some("LESSINT"),
            eval: |a, b| a < b,
        },
    )
}

fn compile_gt(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "GREATER",
            imm: Some("GTINT"),
            eval: |a, b| a > b,
        },
    )
}

fn compile_leq(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "LEQ",
            imm: None,
            eval: |a, b| a <= b,
        },
    )
}

fn compile_geq(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    compile_cmp_impl(
        out,
        ins,
        CmpSpec {
            name: "GEQ",
            imm: None,
            eval: |a, b| a >= b,
        },
    )
}

fn compile_spaceship(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = match x.int_const.unwrap().cmp(&y.int_const.unwrap()) {
                std::cmp::Ordering::Less => -1,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            };
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = FINITE_INT;
    }
    AsmOp::custom("CMP", 2, 1)
}

// --- null and exceptions ---

fn compile_is_null(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let x = &mut ins[0];
    let r = &mut out[0];
    r.val = VAL_BOOL;
    if x.always_null() {
        x.unused();
        r.val = CONST_TRUE | ValFact::Const;
        r.int_const = Some(-1);
        return AsmOp::bool_const(true);
    }
    if x.always_not_null() {
        x.unused();
        r.set_const(0);
        return AsmOp::bool_const(false);
    }
    AsmOp::custom("ISNULL", 1, 1)
}

fn compile_null(out: &mut [VarDescr], _ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let r = &mut out[0];
    r.val = ValFact::Const | ValFact::Null;
    AsmOp::custom("PUSHNULL", 0, 1)
}

fn compile_throw(_out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let x = &mut ins[0];
    if let Some(v) = x.int_const.filter(|_| x.is_int_const()) {
        if (0..2048).contains(&v) {
            x.unused();
            return exec_arg_op("THROW", v, 0, 0);
        }
    }
    AsmOp::custom("THROWANY", 1, 0)
}

fn compile_throw_if(_out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let [code, _cond] = ins else {
        return AsmOp::custom("THROWANYIF", 2, 0);
    };
    if let Some(v) = code.int_const.filter(|_| code.is_int_const()) {
        if (0..2048).contains(&v) {
            code.unused();
            return exec_arg_op("THROWIF", v, 1, 0);
        }
    }
    AsmOp::custom("THROWANYIF", 2, 0)
}

fn compile_throw_unless(_out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    let [code, _cond] = ins else {
        return AsmOp::custom("THROWANYIFNOT", 2, 0);
    };
    if let Some(v) = code.int_const.filter(|_| code.is_int_const()) {
        if (0..2048).contains(&v) {
            code.unused();
            return exec_arg_op("THROWIFNOT", v, 1, 0);
        }
    }
    AsmOp::custom("THROWANYIFNOT", 2, 0)
}

fn compile_min(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = x.int_const.unwrap().min(y.int_const.unwrap());
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = x.val & y.val & FINITE_INT | ValFact::Int;
    }
    AsmOp::custom("MIN", 2, 1)
}

fn compile_max(out: &mut [VarDescr], ins: &mut [VarDescr], _loc: SrcLocation) -> AsmOp {
    if let [x, y] = ins {
        if x.is_int_const() && y.is_int_const() {
            let v = x.int_const.unwrap().max(y.int_const.unwrap());
            out[0].set_const(v);
            x.unused();
            y.unused();
            return push_const(v);
        }
        out[0].val = x.val & y.val & FINITE_INT | ValFact::Int;
    }
    AsmOp::custom("MAX", 2, 1)
}

/// Register the builtin table into a fresh context.
pub fn define_builtins(ctx: &mut CompilerContext) {
    use crate::types::Atomic;

    let int = ctx.types.new_atomic(Atomic::Int);
    let int_pair = ctx.types.new_tensor(vec![int, int]);
    let ii_i = ctx.types.new_map(int_pair, int);
    let i_i = ctx.types.new_map(int, int);
    let unit = ctx.types.new_unit();

    let pure: EnumSet<FnFlag> = FnFlag::MarkedAsPure.into();

    let binops: [(&str, crate::context::SimpleCompileFn); 15] = [
        ("_+_", compile_add),
        ("_-_", compile_sub),
        ("_*_", compile_mul),
        ("_/_", compile_div),
        ("_%_", compile_mod),
        ("_<<_", compile_lshift),
        ("_>>_", compile_rshift),
        ("_&_", compile_bit_and),
        ("_|_", compile_bit_or),
        ("_^_", compile_bit_xor),
        ("_==_", compile_eq),
        ("_!=_", compile_neq),
        ("_<_", compile_lt),
        ("_>_", compile_gt),
        ("_<=>_", compile_spaceship),
    ];
    for (name, f) in binops {
        ctx.define_builtin(name, ii_i, pure, BuiltinCompile::Simple(f));
    }
    ctx.define_builtin("_<=_", ii_i, pure, BuiltinCompile::Simple(compile_leq));
    ctx.define_builtin("_>=_", ii_i, pure, BuiltinCompile::Simple(compile_geq));
    ctx.define_builtin("-_", i_i, pure, BuiltinCompile::Simple(compile_negate));
    ctx.define_builtin("~_", i_i, pure, BuiltinCompile::Simple(compile_bit_not));
    ctx.define_builtin("min", ii_i, pure, BuiltinCompile::Simple(compile_min));
    ctx.define_builtin("max", ii_i, pure, BuiltinCompile::Simple(compile_max));

    // forall X . X -> int
    let x1 = ctx.types.new_var();
    let isnull_t = ctx.types.new_map(x1, int);
    let isnull_t = ctx.types.new_forall(vec![x1], isnull_t);
    ctx.define_builtin("null?", isnull_t, pure, BuiltinCompile::Simple(compile_is_null));

    // forall X . () -> X
    let x2 = ctx.types.new_var();
    let null_t = ctx.types.new_map(unit, x2);
    let null_t = ctx.types.new_forall(vec![x2], null_t);
    ctx.define_builtin("null", null_t, pure, BuiltinCompile::Simple(compile_null));

    // forall X . int -> X, never returns
    let x3 = ctx.types.new_var();
    let throw_t = ctx.types.new_map(int, x3);
    let throw_t = ctx.types.new_forall(vec![x3], throw_t);
    ctx.define_builtin(
        "throw",
        throw_t,
        FnFlag::NeverReturns.into(),
        BuiltinCompile::Simple(compile_throw),
    );

    let cond_throw_t = ctx.types.new_map(int_pair, unit);
    ctx.define_builtin(
        "throw_if",
        cond_throw_t,
        EnumSet::empty(),
        BuiltinCompile::Simple(compile_throw_if),
    );
    ctx.define_builtin(
        "throw_unless",
        cond_throw_t,
        EnumSet::empty(),
        BuiltinCompile::Simple(compile_throw_unless),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descr(v: Option<i128>) -> VarDescr {
        let mut d = VarDescr::new(0);
        if let Some(v) = v {
            d.set_const(v);
        }
        d
    }

    fn loc() -> SrcLocation {
        SrcLocation::default()
    }

    #[test]
    fn test_add_folds_constants() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(Some(2)), descr(Some(3))];
        let op = compile_add(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "5 PUSHINT");
        assert_eq!(out[0].int_const, Some(5));
        assert!(ins[0].is_unused() && ins[1].is_unused());
    }

    #[test]
    fn test_add_zero_vanishes() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(Some(0))];
        let op = compile_add(&mut out, &mut ins, loc());
        assert!(op.is_nop());
        assert!(ins[1].is_unused());
        assert!(!ins[0].is_unused());
    }

    #[test]
    fn test_add_small_const_becomes_immediate() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(Some(7))];
        let op = compile_add(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "7 ADDCONST");
        let mut ins = vec![descr(None), descr(Some(1))];
        let op = compile_add(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "INC");
    }

    #[test]
    fn test_mul_pow2_becomes_shift() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(Some(8))];
        let op = compile_mul(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "3 LSHIFT#");
        assert!(ins[1].is_unused());
    }

    #[test]
    fn test_mul_keeps_plain_when_unknown() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(None)];
        let op = compile_mul(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "MUL");
        assert!(!ins[0].is_unused() && !ins[1].is_unused());
    }

    #[test]
    fn test_add_fact_transfer() {
        let mut out = vec![VarDescr::new(9)];
        let mut a = descr(None);
        a.val = FINITE_INT | ValFact::Pos | ValFact::Even | ValFact::NonZero;
        let mut b = descr(None);
        b.val = FINITE_INT | ValFact::Pos | ValFact::Even;
        let mut ins = vec![a, b];
        let _ = compile_add(&mut out, &mut ins, loc());
        let r = &out[0];
        assert!(r.always_pos() && r.always_even() && r.always_finite());
    }

    #[test]
    fn test_cmp_folds_and_produces_bool_facts() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(Some(2)), descr(Some(5))];
        let op = compile_lt(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "-1 PUSHINT");
        assert!(out[0].always_true());

        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(Some(5))];
        let op = compile_lt(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "5 LESSINT");
        assert_eq!(out[0].val, VAL_BOOL);
    }

    #[test]
    fn test_throw_immediate() {
        let mut out = vec![];
        let mut ins = vec![descr(Some(42))];
        let op = compile_throw(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "42 THROW");
        assert!(ins[0].is_unused());

        let mut ins = vec![descr(None)];
        let op = compile_throw(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "THROWANY");
    }

    #[test]
    fn test_div_pow2_is_arithmetic_shift() {
        let mut out = vec![VarDescr::new(9)];
        let mut ins = vec![descr(None), descr(Some(4))];
        let op = compile_div(&mut out, &mut ins, loc());
        assert_eq!(op.to_string(), "2 RSHIFT#");
    }
}
