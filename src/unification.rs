//! Type unification for Tolk
//!
//! Hindley-Milner style unification over the arena of structural
//! types: holes unify with anything their width range admits, rigid
//! variables only with themselves, compound forms pairwise. A `ForAll`
//! scheme is instantiated with fresh holes before unifying.
//!
//! Binding a hole leaves an `Indirect` forwarding entry behind, so two
//! unified types share one principal representative afterwards.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::types::{TypeArena, TypeKind, TypeRef};

/// Why a unification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifyErrorKind {
    /// Width ranges of the two sides do not intersect.
    WidthMismatch,
    /// A rigid type variable met a different variable or a structure.
    RigidMismatch,
    /// Tensors of different arity.
    ArityMismatch,
    /// A hole would have to contain itself.
    Occurs,
    /// Plainly different type constructors.
    Mismatch,
}

/// Unification failure with both sides already pretty-printed, since
/// the arena is not available at report time.
#[derive(Debug, Clone)]
pub struct UnifyError {
    pub left: String,
    pub right: String,
    pub kind: UnifyErrorKind,
}

impl UnifyError {
    fn new(arena: &TypeArena, t1: TypeRef, t2: TypeRef, kind: UnifyErrorKind) -> Self {
        UnifyError {
            left: arena.show(t1),
            right: arena.show(t2),
            kind,
        }
    }
}

impl fmt::Display for UnifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self.kind {
            UnifyErrorKind::WidthMismatch => "incompatible widths",
            UnifyErrorKind::RigidMismatch => "rigid type variable mismatch",
            UnifyErrorKind::ArityMismatch => "different tensor arity",
            UnifyErrorKind::Occurs => "type would contain itself",
            UnifyErrorKind::Mismatch => "different type constructors",
        };
        write!(
            f,
            "cannot unify type {} with {}: {}",
            self.left, self.right, reason
        )
    }
}

impl Error for UnifyError {}

/// Unify two type expressions, narrowing holes on both sides.
pub fn unify(arena: &mut TypeArena, t1: TypeRef, t2: TypeRef) -> Result<(), UnifyError> {
    let a = arena.resolve(t1);
    let b = arena.resolve(t2);
    if a == b {
        return Ok(());
    }
    match (arena.kind(a).clone(), arena.kind(b).clone()) {
        (TypeKind::ForAll { .. }, _) => {
            let inst = instantiate(arena, a);
            unify(arena, inst, b)
        }
        (_, TypeKind::ForAll { .. }) => {
            let inst = instantiate(arena, b);
            unify(arena, a, inst)
        }
        (TypeKind::Unknown { id: ia }, TypeKind::Unknown { id: ib }) => {
            // retarget the younger hole at the elder
            let (elder, younger) = if ia <= ib { (a, b) } else { (b, a) };
            narrow(arena, a, b, elder)?;
            arena.node_mut(younger).kind = TypeKind::Indirect(elder);
            Ok(())
        }
        (TypeKind::Unknown { .. }, _) => bind_hole(arena, a, b),
        (_, TypeKind::Unknown { .. }) => bind_hole(arena, b, a),
        (TypeKind::Atomic(x), TypeKind::Atomic(y)) => {
            if x == y {
                Ok(())
            } else {
                Err(UnifyError::new(arena, a, b, UnifyErrorKind::Mismatch))
            }
        }
        (TypeKind::Tensor(xs), TypeKind::Tensor(ys)) => {
            if xs.len() != ys.len() {
                return Err(UnifyError::new(arena, a, b, UnifyErrorKind::ArityMismatch));
            }
            for (&x, &y) in xs.iter().zip(&ys) {
                unify(arena, x, y)?;
            }
            if !arena.recompute_width(a) || !arena.recompute_width(b) {
                return Err(UnifyError::new(arena, a, b, UnifyErrorKind::WidthMismatch));
            }
            Ok(())
        }
        (TypeKind::Tuple(x), TypeKind::Tuple(y)) => unify(arena, x, y),
        (TypeKind::Map(f1, r1), TypeKind::Map(f2, r2)) => {
            unify(arena, f1, f2)?;
            unify(arena, r1, r2)
        }
        (TypeKind::Var { id: i }, TypeKind::Var { id: j }) => {
            if i == j {
                Ok(())
            } else {
                Err(UnifyError::new(arena, a, b, UnifyErrorKind::RigidMismatch))
            }
        }
        (TypeKind::Var { .. }, _) | (_, TypeKind::Var { .. }) => {
            Err(UnifyError::new(arena, a, b, UnifyErrorKind::RigidMismatch))
        }
        _ => Err(UnifyError::new(arena, a, b, UnifyErrorKind::Mismatch)),
    }
}

/// Bind `hole` to `target` after the occurs check and width narrowing.
fn bind_hole(arena: &mut TypeArena, hole: TypeRef, target: TypeRef) -> Result<(), UnifyError> {
    if occurs(arena, hole, target) {
        return Err(UnifyError::new(arena, hole, target, UnifyErrorKind::Occurs));
    }
    narrow(arena, hole, target, target)?;
    arena.node_mut(hole).kind = TypeKind::Indirect(target);
    Ok(())
}

/// Intersect the width ranges of two sides and store the result on
/// `into`. Fails if the intersection is empty.
fn narrow(
    arena: &mut TypeArena,
    a: TypeRef,
    b: TypeRef,
    into: TypeRef,
) -> Result<(), UnifyError> {
    let (amin, amax) = arena.width_range(a);
    let (bmin, bmax) = arena.width_range(b);
    let minw = amin.max(bmin);
    let maxw = amax.min(bmax);
    if minw > maxw {
        return Err(UnifyError::new(arena, a, b, UnifyErrorKind::WidthMismatch));
    }
    let node = arena.node_mut(into);
    node.minw = minw;
    node.maxw = maxw;
    Ok(())
}

/// Does `hole` occur inside `t`?
fn occurs(arena: &TypeArena, hole: TypeRef, t: TypeRef) -> bool {
    let t = arena.resolve_ref(t);
    if t == hole {
        return true;
    }
    match arena.kind(t) {
        TypeKind::Unknown { .. } | TypeKind::Var { .. } | TypeKind::Atomic(_) => false,
        TypeKind::Indirect(_) => unreachable!("resolved"),
        TypeKind::Tensor(items) => items.iter().any(|&it| occurs(arena, hole, it)),
        TypeKind::Tuple(inner) => occurs(arena, hole, *inner),
        TypeKind::Map(from, to) => occurs(arena, hole, *from) || occurs(arena, hole, *to),
        TypeKind::ForAll { body, .. } => occurs(arena, hole, *body),
    }
}

/// Instantiate a `ForAll` scheme: copy the body with every quantified
/// variable replaced by a fresh hole. Non-scheme types are returned
/// unchanged.
pub fn instantiate(arena: &mut TypeArena, scheme: TypeRef) -> TypeRef {
    let scheme = arena.resolve(scheme);
    let TypeKind::ForAll { vars, body } = arena.kind(scheme).clone() else {
        return scheme;
    };
    let mut subst = HashMap::new();
    for v in vars {
        let v = arena.resolve(v);
        let h = arena.new_hole();
        subst.insert(v, h);
    }
    copy_subst(arena, body, &subst)
}

fn copy_subst(arena: &mut TypeArena, t: TypeRef, subst: &HashMap<TypeRef, TypeRef>) -> TypeRef {
    let t = arena.resolve(t);
    if let Some(&replacement) = subst.get(&t) {
        return replacement;
    }
    match arena.kind(t).clone() {
        TypeKind::Unknown { .. } | TypeKind::Var { .. } | TypeKind::Atomic(_) => t,
        TypeKind::Indirect(_) => unreachable!("resolved"),
        TypeKind::Tensor(items) => {
            let copied: Vec<_> = items
                .iter()
                .map(|&it| copy_subst(arena, it, subst))
                .collect();
            if copied == items {
                t
            } else {
                arena.new_tensor(copied)
            }
        }
        TypeKind::Tuple(inner) => {
            let copied = copy_subst(arena, inner, subst);
            if copied == inner {
                t
            } else {
                arena.new_tuple(copied)
            }
        }
        TypeKind::Map(from, to) => {
            let f = copy_subst(arena, from, subst);
            let r = copy_subst(arena, to, subst);
            if f == from && r == to {
                t
            } else {
                arena.new_map(f, r)
            }
        }
        TypeKind::ForAll { vars, body } => {
            // nested quantifiers keep their own variables
            let copied = copy_subst(arena, body, subst);
            if copied == body {
                t
            } else {
                arena.new_forall(vars, copied)
            }
        }
    }
}

/// Chase indirections from `t` and return the principal representative.
/// When `forbidden` is given, chasing stops in front of that node (used
/// while generalizing, to avoid collapsing a type into the scheme being
/// built).
pub fn remove_indirect(arena: &mut TypeArena, t: TypeRef, forbidden: Option<TypeRef>) -> TypeRef {
    match forbidden {
        None => arena.resolve(t),
        Some(stop) => {
            let mut cur = t;
            while let TypeKind::Indirect(next) = *arena.kind(cur) {
                if next == stop {
                    return cur;
                }
                cur = next;
            }
            cur
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Atomic, W_INF};

    #[test]
    fn test_unify_atomic() {
        let mut a = TypeArena::new();
        let i1 = a.new_atomic(Atomic::Int);
        let i2 = a.new_atomic(Atomic::Int);
        let c = a.new_atomic(Atomic::Cell);
        assert!(unify(&mut a, i1, i2).is_ok());
        let err = unify(&mut a, i1, c).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::Mismatch);
    }

    #[test]
    fn test_hole_binds_and_equals() {
        let mut a = TypeArena::new();
        let h = a.new_hole();
        let int = a.new_atomic(Atomic::Int);
        unify(&mut a, h, int).unwrap();
        assert!(a.equals(h, int));
        assert_eq!(a.get_width(h), Some(1));
    }

    #[test]
    fn test_hole_merge_prefers_elder() {
        let mut a = TypeArena::new();
        let h1 = a.new_hole();
        let h2 = a.new_hole();
        unify(&mut a, h2, h1).unwrap();
        // the younger h2 forwards to the elder h1
        assert_eq!(a.resolve(h2), a.resolve(h1));
        assert!(matches!(a.kind(a.resolve_ref(h2)), TypeKind::Unknown { id: 1 }));
    }

    #[test]
    fn test_width_narrows_never_widens() {
        let mut a = TypeArena::new();
        let h = a.new_hole_width(2);
        let int = a.new_atomic(Atomic::Int);
        let cell = a.new_atomic(Atomic::Cell);
        let pair = a.new_tensor(vec![int, cell]);
        unify(&mut a, h, pair).unwrap();
        assert_eq!(a.get_width(h), Some(2));
    }

    #[test]
    fn test_disjoint_widths_fail() {
        let mut a = TypeArena::new();
        let h = a.new_hole_width(2);
        let int = a.new_atomic(Atomic::Int);
        let err = unify(&mut a, h, int).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::WidthMismatch);
    }

    #[test]
    fn test_occurs_check() {
        let mut a = TypeArena::new();
        let h = a.new_hole();
        let t = a.new_tuple(h);
        let err = unify(&mut a, h, t).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::Occurs);
    }

    #[test]
    fn test_tensor_arity() {
        let mut a = TypeArena::new();
        let int = a.new_atomic(Atomic::Int);
        let two = a.new_tensor(vec![int, int]);
        let three = a.new_tensor(vec![int, int, int]);
        let err = unify(&mut a, two, three).unwrap_err();
        assert_eq!(err.kind, UnifyErrorKind::ArityMismatch);
    }

    #[test]
    fn test_rigid_var_rules() {
        let mut a = TypeArena::new();
        let x = a.new_var();
        let y = a.new_var();
        let int = a.new_atomic(Atomic::Int);
        assert!(unify(&mut a, x, x).is_ok());
        assert_eq!(
            unify(&mut a, x, y).unwrap_err().kind,
            UnifyErrorKind::RigidMismatch
        );
        assert_eq!(
            unify(&mut a, x, int).unwrap_err().kind,
            UnifyErrorKind::RigidMismatch
        );
        // but a hole takes a rigid var fine
        let h = a.new_hole();
        assert!(unify(&mut a, h, x).is_ok());
    }

    #[test]
    fn test_tensor_children_unify_and_width_propagates() {
        let mut a = TypeArena::new();
        let int = a.new_atomic(Atomic::Int);
        let h = a.new_hole();
        let lhs = a.new_tensor(vec![int, h]);
        let cell = a.new_atomic(Atomic::Cell);
        let rhs = a.new_tensor(vec![int, cell]);
        assert_eq!(a.width_range(lhs), (1, W_INF));
        unify(&mut a, lhs, rhs).unwrap();
        assert_eq!(a.get_width(lhs), Some(2));
        assert!(a.equals(h, cell));
    }

    #[test]
    fn test_instantiate_scheme() {
        // forall X. (X, X) -> X applied at int
        let mut a = TypeArena::new();
        let x = a.new_var();
        let pair = a.new_tensor(vec![x, x]);
        let f = a.new_map(pair, x);
        let scheme = a.new_forall(vec![x], f);

        let inst = instantiate(&mut a, scheme);
        let int = a.new_atomic(Atomic::Int);
        let arg = a.new_tensor(vec![int, int]);
        let ret = a.new_hole();
        let expected = a.new_map(arg, ret);
        unify(&mut a, inst, expected).unwrap();
        assert!(a.equals(ret, int));
        // the scheme itself is untouched
        assert!(matches!(a.kind(scheme), TypeKind::ForAll { .. }));
    }

    #[test]
    fn test_remove_indirect_stops_at_forbidden() {
        let mut a = TypeArena::new();
        let h1 = a.new_hole();
        let h2 = a.new_hole();
        let int = a.new_atomic(Atomic::Int);
        unify(&mut a, h2, h1).unwrap();
        unify(&mut a, h1, int).unwrap();
        // full chase lands on the atomic
        assert_eq!(remove_indirect(&mut a, h2, None), int);
        // but chasing is refused past a forbidden node
        let h3 = a.new_hole();
        let h4 = a.new_hole();
        unify(&mut a, h4, h3).unwrap();
        assert_eq!(remove_indirect(&mut a, h4, Some(h3)), h4);
    }

    #[test]
    fn test_new_func_is_most_general_map() {
        let mut a = TypeArena::new();
        let f = a.new_func();
        let int = a.new_atomic(Atomic::Int);
        let cell = a.new_atomic(Atomic::Cell);
        let g = a.new_map(int, cell);
        unify(&mut a, f, g).unwrap();
        assert!(a.equals(f, g));
    }

    #[test]
    fn test_map_unifies_componentwise() {
        let mut a = TypeArena::new();
        let int = a.new_atomic(Atomic::Int);
        let h1 = a.new_hole();
        let h2 = a.new_hole();
        let f1 = a.new_map(h1, int);
        let f2 = a.new_map(int, h2);
        unify(&mut a, f1, f2).unwrap();
        assert!(a.equals(h1, int));
        assert!(a.equals(h2, int));
    }
}
