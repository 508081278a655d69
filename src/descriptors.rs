//! Abstract value descriptors
//!
//! A [`VarDescr`] records what the analyses know about one virtual
//! variable at one program point: liveness flags plus a set of value
//! facts (sign, parity, const-ness, nullability). Facts are
//! *guarantees* - `Pos` means "always non-negative" - so merging two
//! control-flow paths intersects them.
//!
//! [`VarDescrList`] is an ordered map from variable index to descriptor
//! used both as the live-variable set of the backward pass and as the
//! fact environment of the forward pass.

use enumset::{enum_set, EnumSet, EnumSetType};

use crate::ir::VarIdx;

/// Liveness flags attached to one occurrence of a variable.
#[derive(EnumSetType, Debug)]
pub enum VarFlag {
    /// This use is the last one; the value may be consumed in place.
    Last,
    /// This definition is dead; the produced value may be dropped.
    Unused,
}

/// Value facts. Each fact is a guarantee that holds on every execution
/// reaching the program point.
#[derive(EnumSetType, Debug)]
pub enum ValFact {
    Const,
    Int,
    Zero,
    NonZero,
    /// Always non-negative.
    Pos,
    /// Always non-positive.
    Neg,
    Bool,
    Bit,
    Finite,
    Nan,
    Even,
    Odd,
    Null,
    NotNull,
}

/// Facts of the constant `0`.
pub const CONST_ZERO: EnumSet<ValFact> = enum_set!(
    ValFact::Int
        | ValFact::Zero
        | ValFact::Pos
        | ValFact::Neg
        | ValFact::Bool
        | ValFact::Bit
        | ValFact::Finite
        | ValFact::Even
        | ValFact::NotNull
);

/// Facts of the constant `1`.
pub const CONST_ONE: EnumSet<ValFact> = enum_set!(
    ValFact::Int
        | ValFact::NonZero
        | ValFact::Pos
        | ValFact::Bit
        | ValFact::Finite
        | ValFact::Odd
        | ValFact::NotNull
);

/// Facts of the constant `-1`, the machine's `true`.
pub const CONST_TRUE: EnumSet<ValFact> = enum_set!(
    ValFact::Int
        | ValFact::NonZero
        | ValFact::Neg
        | ValFact::Bool
        | ValFact::Finite
        | ValFact::Odd
        | ValFact::NotNull
);

/// A value that is either 0 or 1.
pub const VAL_BIT: EnumSet<ValFact> =
    enum_set!(ValFact::Int | ValFact::Finite | ValFact::Bit | ValFact::Pos | ValFact::NotNull);

/// A value that is either 0 or -1.
pub const VAL_BOOL: EnumSet<ValFact> =
    enum_set!(ValFact::Int | ValFact::Finite | ValFact::Bool | ValFact::Neg | ValFact::NotNull);

/// Any finite integer.
pub const FINITE_INT: EnumSet<ValFact> =
    enum_set!(ValFact::Int | ValFact::Finite | ValFact::NotNull);

/// Any finite non-negative integer.
pub const FINITE_UINT: EnumSet<ValFact> =
    enum_set!(ValFact::Int | ValFact::Finite | ValFact::NotNull | ValFact::Pos);

/// Everything the analyses know about one variable at one point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarDescr {
    pub idx: VarIdx,
    pub flags: EnumSet<VarFlag>,
    pub val: EnumSet<ValFact>,
    pub int_const: Option<i128>,
    pub str_const: Option<String>,
}

/// Fact set of a known integer constant.
pub fn const_facts(v: i128) -> EnumSet<ValFact> {
    match v {
        0 => CONST_ZERO | ValFact::Const,
        1 => CONST_ONE | ValFact::Const,
        -1 => CONST_TRUE | ValFact::Const,
        _ => {
            let mut f = FINITE_INT | ValFact::Const | ValFact::NonZero;
            f |= if v > 0 { ValFact::Pos } else { ValFact::Neg };
            f |= if v % 2 == 0 { ValFact::Even } else { ValFact::Odd };
            f
        }
    }
}

impl VarDescr {
    pub fn new(idx: VarIdx) -> Self {
        VarDescr {
            idx,
            ..VarDescr::default()
        }
    }

    pub fn is_last(&self) -> bool {
        self.flags.contains(VarFlag::Last)
    }

    pub fn is_unused(&self) -> bool {
        self.flags.contains(VarFlag::Unused)
    }

    pub fn unused(&mut self) {
        self.flags |= VarFlag::Unused;
    }

    pub fn set_const(&mut self, v: i128) {
        self.val = const_facts(v);
        self.int_const = Some(v);
        self.str_const = None;
    }

    pub fn set_const_nan(&mut self) {
        self.val = ValFact::Const | ValFact::Int | ValFact::Nan | ValFact::NotNull;
        self.int_const = None;
        self.str_const = None;
    }

    pub fn set_const_str(&mut self, s: impl Into<String>) {
        self.val = ValFact::Const | ValFact::NotNull;
        self.int_const = None;
        self.str_const = Some(s.into());
    }

    pub fn is_const(&self) -> bool {
        self.val.contains(ValFact::Const)
    }

    pub fn is_int_const(&self) -> bool {
        self.val.contains(ValFact::Const)
            && self.val.contains(ValFact::Int)
            && self.int_const.is_some()
    }

    pub fn always_true(&self) -> bool {
        self.always_nonzero()
    }

    pub fn always_false(&self) -> bool {
        self.always_zero()
    }

    pub fn always_zero(&self) -> bool {
        self.val.contains(ValFact::Zero)
    }

    pub fn always_nonzero(&self) -> bool {
        self.val.contains(ValFact::NonZero)
    }

    pub fn always_nonneg(&self) -> bool {
        self.val.contains(ValFact::Pos)
    }

    pub fn always_nonpos(&self) -> bool {
        self.val.contains(ValFact::Neg)
    }

    pub fn always_pos(&self) -> bool {
        self.val.is_superset(ValFact::Pos | ValFact::NonZero)
    }

    pub fn always_neg(&self) -> bool {
        self.val.is_superset(ValFact::Neg | ValFact::NonZero)
    }

    pub fn always_even(&self) -> bool {
        self.val.contains(ValFact::Even)
    }

    pub fn always_odd(&self) -> bool {
        self.val.contains(ValFact::Odd)
    }

    pub fn always_finite(&self) -> bool {
        self.val.contains(ValFact::Finite)
    }

    pub fn always_null(&self) -> bool {
        self.val.contains(ValFact::Null)
    }

    pub fn always_not_null(&self) -> bool {
        self.val.contains(ValFact::NotNull)
    }

    pub fn always_equal(&self, other: &VarDescr) -> bool {
        match (self.int_const, other.int_const) {
            (Some(x), Some(y)) if self.is_int_const() && other.is_int_const() => x == y,
            _ => false,
        }
    }

    pub fn always_less(&self, other: &VarDescr) -> bool {
        if let (Some(x), Some(y)) = (self.int_const, other.int_const) {
            if self.is_int_const() && other.is_int_const() {
                return x < y;
            }
        }
        self.always_neg() && other.always_nonneg()
    }

    pub fn always_leq(&self, other: &VarDescr) -> bool {
        self.always_less(other) || self.always_equal(other)
    }

    /// Intersect with facts from another control-flow path.
    pub fn meet(&mut self, other: &VarDescr) {
        self.val &= other.val;
        if self.int_const != other.int_const {
            self.int_const = None;
            self.val -= ValFact::Const;
        }
        if self.str_const != other.str_const {
            self.str_const = None;
        }
    }

    /// Overwrite the value facts with those of `other`, keeping flags.
    pub fn import(&mut self, other: &VarDescr) {
        self.val = other.val;
        self.int_const = other.int_const;
        self.str_const = other.str_const.clone();
    }

    pub fn clear_value(&mut self) {
        self.val = EnumSet::empty();
        self.int_const = None;
        self.str_const = None;
    }
}

/// Descriptors for a set of variables, kept sorted by index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarDescrList {
    list: Vec<VarDescr>,
    pub unreachable: bool,
}

impl VarDescrList {
    pub fn new() -> Self {
        VarDescrList::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VarDescr> {
        self.list.iter()
    }

    pub fn contains(&self, idx: VarIdx) -> bool {
        self.lookup(idx).is_some()
    }

    pub fn lookup(&self, idx: VarIdx) -> Option<&VarDescr> {
        self.list
            .binary_search_by_key(&idx, |d| d.idx)
            .ok()
            .map(|i| &self.list[i])
    }

    pub fn lookup_mut(&mut self, idx: VarIdx) -> Option<&mut VarDescr> {
        self.list
            .binary_search_by_key(&idx, |d| d.idx)
            .ok()
            .map(|i| &mut self.list[i])
    }

    /// Descriptor for `idx`, inserting a fresh one if absent.
    pub fn add(&mut self, idx: VarIdx) -> &mut VarDescr {
        match self.list.binary_search_by_key(&idx, |d| d.idx) {
            Ok(i) => &mut self.list[i],
            Err(i) => {
                self.list.insert(i, VarDescr::new(idx));
                &mut self.list[i]
            }
        }
    }

    /// Fresh descriptor for `idx`, discarding anything known before.
    pub fn add_newval(&mut self, idx: VarIdx) -> &mut VarDescr {
        let d = self.add(idx);
        *d = VarDescr::new(idx);
        d
    }

    pub fn add_var(&mut self, idx: VarIdx, unused: bool) -> &mut Self {
        let d = self.add(idx);
        if unused {
            d.flags |= VarFlag::Unused;
        }
        self
    }

    pub fn add_vars(&mut self, idxs: &[VarIdx]) -> &mut Self {
        for &i in idxs {
            self.add(i);
        }
        self
    }

    pub fn remove_var(&mut self, idx: VarIdx) -> &mut Self {
        if let Ok(i) = self.list.binary_search_by_key(&idx, |d| d.idx) {
            self.list.remove(i);
        }
        self
    }

    pub fn remove_vars(&mut self, idxs: &[VarIdx]) -> &mut Self {
        for &i in idxs {
            self.remove_var(i);
        }
        self
    }

    pub fn count_used(&self, idxs: &[VarIdx]) -> usize {
        idxs.iter()
            .filter(|&&i| self.lookup(i).is_some_and(|d| !d.is_unused()))
            .count()
    }

    pub fn clear_last(&mut self) -> &mut Self {
        for d in &mut self.list {
            d.flags -= VarFlag::Last;
        }
        self
    }

    pub fn set_unreachable(&mut self) {
        self.list.clear();
        self.unreachable = true;
    }

    /// Meet at a join point: a variable survives only if both paths
    /// carry it, and only with the facts both paths establish. An
    /// unreachable side imposes no constraint.
    pub fn meet_assign(&mut self, other: &VarDescrList) {
        if other.unreachable {
            return;
        }
        if self.unreachable {
            *self = other.clone();
            return;
        }
        self.list.retain(|d| other.contains(d.idx));
        for d in &mut self.list {
            if let Some(o) = other.lookup(d.idx) {
                d.meet(o);
            }
        }
    }

    /// Union at a loop head: every variable of either side is kept; a
    /// variable present on both keeps only the common facts.
    pub fn union_assign(&mut self, other: &VarDescrList) {
        if other.unreachable {
            return;
        }
        if self.unreachable {
            *self = other.clone();
            return;
        }
        for o in &other.list {
            match self.list.binary_search_by_key(&o.idx, |d| d.idx) {
                Ok(i) => self.list[i].meet(o),
                Err(i) => self.list.insert(i, o.clone()),
            }
        }
    }

    /// Overwrite facts of variables also present in `values`.
    pub fn import_values(&mut self, values: &VarDescrList) {
        for d in &mut self.list {
            if let Some(v) = values.lookup(d.idx) {
                d.import(v);
            }
        }
    }
}
