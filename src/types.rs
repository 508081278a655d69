//! Structural type expressions for Tolk
//!
//! Types are allocated in a per-compilation arena and addressed by
//! `TypeRef` indices. Unification never rewrites nodes in place except
//! to retarget a hole through an `Indirect` forwarding entry; reads
//! compress forwarding chains.
//!
//! Every type has a *stack width* range `[minw, maxw]` - the number of
//! stack cells a value of that type occupies once materialized. Atomic
//! types, tuples and maps (continuations) are one cell wide; a tensor
//! is as wide as the sum of its parts; a fresh hole can still be
//! anything up to `W_INF`.

use std::fmt;

/// Upper bound standing in for "unbounded width".
pub const W_INF: i32 = 1023;

/// Index of a type node in a [`TypeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub(crate) u32);

impl TypeRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The seven atomic types. Each occupies exactly one stack cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Atomic {
    Int,
    Cell,
    Slice,
    Builder,
    Cont,
    Tuple,
    Type,
}

impl Atomic {
    fn name(self) -> &'static str {
        match self {
            Atomic::Int => "int",
            Atomic::Cell => "cell",
            Atomic::Slice => "slice",
            Atomic::Builder => "builder",
            Atomic::Cont => "cont",
            Atomic::Tuple => "tuple",
            Atomic::Type => "type",
        }
    }
}

/// One node of a type expression.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    /// A unification hole; narrows as facts accumulate.
    Unknown { id: u32 },
    /// A rigid variable bound by an enclosing `ForAll`.
    Var { id: u32 },
    /// Forwarding entry left behind by unification.
    Indirect(TypeRef),
    Atomic(Atomic),
    /// Ordered product; width is the sum of the children.
    Tensor(Vec<TypeRef>),
    /// Boxed tensor; a single cell at runtime.
    Tuple(TypeRef),
    /// Function type `from -> to`; a continuation, one cell.
    Map(TypeRef, TypeRef),
    /// Quantified scheme `forall vars. body`.
    ForAll { vars: Vec<TypeRef>, body: TypeRef },
}

#[derive(Debug, Clone)]
pub struct TypeNode {
    pub kind: TypeKind,
    pub minw: i32,
    pub maxw: i32,
}

/// Arena owning every type node of one compilation unit.
#[derive(Debug, Default)]
pub struct TypeArena {
    nodes: Vec<TypeNode>,
    holes: u32,
    vars: u32,
}

impl TypeArena {
    pub fn new() -> Self {
        TypeArena::default()
    }

    fn alloc(&mut self, kind: TypeKind, minw: i32, maxw: i32) -> TypeRef {
        let idx = self.nodes.len() as u32;
        self.nodes.push(TypeNode { kind, minw, maxw });
        TypeRef(idx)
    }

    pub fn node(&self, t: TypeRef) -> &TypeNode {
        &self.nodes[t.index()]
    }

    pub(crate) fn node_mut(&mut self, t: TypeRef) -> &mut TypeNode {
        &mut self.nodes[t.index()]
    }

    pub fn kind(&self, t: TypeRef) -> &TypeKind {
        &self.nodes[t.index()].kind
    }

    /// Fresh hole of unconstrained width.
    pub fn new_hole(&mut self) -> TypeRef {
        self.holes += 1;
        let id = self.holes;
        self.alloc(TypeKind::Unknown { id }, 0, W_INF)
    }

    /// Fresh hole already known to be exactly `width` cells wide.
    pub fn new_hole_width(&mut self, width: i32) -> TypeRef {
        self.holes += 1;
        let id = self.holes;
        self.alloc(TypeKind::Unknown { id }, width, width)
    }

    /// The empty tensor `()`, zero cells wide.
    pub fn new_unit(&mut self) -> TypeRef {
        self.alloc(TypeKind::Tensor(Vec::new()), 0, 0)
    }

    pub fn new_atomic(&mut self, a: Atomic) -> TypeRef {
        self.alloc(TypeKind::Atomic(a), 1, 1)
    }

    /// A tensor of `items`. A one-element tensor collapses to its
    /// single component.
    pub fn new_tensor(&mut self, items: Vec<TypeRef>) -> TypeRef {
        if items.len() == 1 {
            return items[0];
        }
        let (minw, maxw) = self.sum_widths(&items);
        self.alloc(TypeKind::Tensor(items), minw, maxw)
    }

    pub fn new_tuple(&mut self, inner: TypeRef) -> TypeRef {
        self.alloc(TypeKind::Tuple(inner), 1, 1)
    }

    pub fn new_tuple_of(&mut self, items: Vec<TypeRef>) -> TypeRef {
        let inner = self.new_tensor(items);
        self.new_tuple(inner)
    }

    pub fn new_map(&mut self, from: TypeRef, to: TypeRef) -> TypeRef {
        self.alloc(TypeKind::Map(from, to), 1, 1)
    }

    /// `?? -> ??`, the most general function type.
    pub fn new_func(&mut self) -> TypeRef {
        let from = self.new_hole();
        let to = self.new_hole();
        self.new_map(from, to)
    }

    /// Fresh rigid variable for a `forall` quantifier.
    pub fn new_var(&mut self) -> TypeRef {
        self.vars += 1;
        let id = self.vars;
        self.alloc(TypeKind::Var { id }, 1, 1)
    }

    pub fn new_forall(&mut self, vars: Vec<TypeRef>, body: TypeRef) -> TypeRef {
        let TypeNode { minw, maxw, .. } = *self.node(body);
        self.alloc(TypeKind::ForAll { vars, body }, minw, maxw)
    }

    fn sum_widths(&self, items: &[TypeRef]) -> (i32, i32) {
        let mut minw = 0;
        let mut maxw = 0;
        for &it in items {
            let n = self.node(self.resolve_ref(it));
            minw = (minw + n.minw).min(W_INF);
            maxw = (maxw + n.maxw).min(W_INF);
        }
        (minw, maxw)
    }

    /// Chase `Indirect` forwarding entries, compressing the path so the
    /// next lookup is O(1).
    pub fn resolve(&mut self, t: TypeRef) -> TypeRef {
        let mut root = t;
        while let TypeKind::Indirect(next) = self.nodes[root.index()].kind {
            root = next;
        }
        let mut cur = t;
        while let TypeKind::Indirect(next) = self.nodes[cur.index()].kind {
            self.nodes[cur.index()].kind = TypeKind::Indirect(root);
            cur = next;
        }
        root
    }

    /// Non-compressing resolve for read-only contexts.
    pub fn resolve_ref(&self, t: TypeRef) -> TypeRef {
        let mut root = t;
        while let TypeKind::Indirect(next) = self.nodes[root.index()].kind {
            root = next;
        }
        root
    }

    pub fn has_fixed_width(&self, t: TypeRef) -> bool {
        let n = self.node(self.resolve_ref(t));
        n.minw == n.maxw
    }

    /// The exact width of `t`, if it is already determined.
    pub fn get_width(&self, t: TypeRef) -> Option<i32> {
        let n = self.node(self.resolve_ref(t));
        (n.minw == n.maxw).then_some(n.minw)
    }

    pub fn width_range(&self, t: TypeRef) -> (i32, i32) {
        let n = self.node(self.resolve_ref(t));
        (n.minw, n.maxw)
    }

    /// Re-derive the width range of a compound node after one of its
    /// children was unified. Returns `false` if the range collapsed to
    /// an empty interval.
    pub fn recompute_width(&mut self, t: TypeRef) -> bool {
        let t = self.resolve(t);
        let (minw, maxw) = match self.node(t).kind.clone() {
            TypeKind::Tensor(items) => self.sum_widths(&items),
            TypeKind::ForAll { body, .. } => {
                let n = self.node(self.resolve_ref(body));
                (n.minw, n.maxw)
            }
            _ => return true,
        };
        let node = self.node_mut(t);
        // ranges only ever narrow
        node.minw = node.minw.max(minw);
        node.maxw = node.maxw.min(maxw);
        node.minw <= node.maxw
    }

    /// Structural equality modulo indirections.
    pub fn equals(&self, a: TypeRef, b: TypeRef) -> bool {
        let a = self.resolve_ref(a);
        let b = self.resolve_ref(b);
        if a == b {
            return true;
        }
        match (&self.node(a).kind, &self.node(b).kind) {
            (TypeKind::Unknown { id: i }, TypeKind::Unknown { id: j }) => i == j,
            (TypeKind::Var { id: i }, TypeKind::Var { id: j }) => i == j,
            (TypeKind::Atomic(x), TypeKind::Atomic(y)) => x == y,
            (TypeKind::Tensor(xs), TypeKind::Tensor(ys)) => {
                xs.len() == ys.len() && xs.iter().zip(ys).all(|(&x, &y)| self.equals(x, y))
            }
            (TypeKind::Tuple(x), TypeKind::Tuple(y)) => self.equals(*x, *y),
            (TypeKind::Map(f1, t1), TypeKind::Map(f2, t2)) => {
                self.equals(*f1, *f2) && self.equals(*t1, *t2)
            }
            (TypeKind::ForAll { vars: v1, body: b1 }, TypeKind::ForAll { vars: v2, body: b2 }) => {
                v1.len() == v2.len() && self.equals(*b1, *b2)
            }
            _ => false,
        }
    }

    /// Does any hole remain reachable from `t`?
    pub fn has_unknown_inside(&self, t: TypeRef) -> bool {
        let t = self.resolve_ref(t);
        match &self.node(t).kind {
            TypeKind::Unknown { .. } => true,
            TypeKind::Var { .. } | TypeKind::Atomic(_) => false,
            TypeKind::Indirect(_) => unreachable!("resolved"),
            TypeKind::Tensor(items) => items.iter().any(|&it| self.has_unknown_inside(it)),
            TypeKind::Tuple(inner) => self.has_unknown_inside(*inner),
            TypeKind::Map(from, to) => {
                self.has_unknown_inside(*from) || self.has_unknown_inside(*to)
            }
            TypeKind::ForAll { body, .. } => self.has_unknown_inside(*body),
        }
    }

    /// Flatten `t` into its scalar components: a tensor yields its
    /// (recursively flattened) children, anything else yields itself.
    /// Used when a wide variable is split into width-1 parts.
    pub fn extract_components(&self, t: TypeRef) -> Vec<TypeRef> {
        let t = self.resolve_ref(t);
        match &self.node(t).kind {
            TypeKind::Tensor(items) => {
                let mut out = Vec::new();
                for &it in items {
                    out.extend(self.extract_components(it));
                }
                out
            }
            _ => vec![t],
        }
    }

    /// Render `t` for diagnostics.
    pub fn show(&self, t: TypeRef) -> String {
        let mut s = String::new();
        self.print(&mut s, t, 0).expect("string write");
        s
    }

    fn print(&self, out: &mut String, t: TypeRef, prio: i32) -> fmt::Result {
        use fmt::Write;
        let t = self.resolve_ref(t);
        match &self.node(t).kind {
            TypeKind::Unknown { id } => write!(out, "??{}", id),
            TypeKind::Var { id } => {
                const NAMES: [char; 7] = ['X', 'Y', 'Z', 'T', 'S', 'U', 'V'];
                let i = (*id as usize - 1) % NAMES.len();
                let gen = (*id as usize - 1) / NAMES.len();
                if gen == 0 {
                    write!(out, "{}", NAMES[i])
                } else {
                    write!(out, "{}{}", NAMES[i], gen)
                }
            }
            TypeKind::Indirect(_) => unreachable!("resolved"),
            TypeKind::Atomic(a) => write!(out, "{}", a.name()),
            TypeKind::Tensor(items) => {
                write!(out, "(")?;
                for (i, &it) in items.iter().enumerate() {
                    if i > 0 {
                        write!(out, ", ")?;
                    }
                    self.print(out, it, 0)?;
                }
                write!(out, ")")
            }
            TypeKind::Tuple(inner) => {
                write!(out, "[")?;
                match &self.node(self.resolve_ref(*inner)).kind {
                    TypeKind::Tensor(items) => {
                        for (i, &it) in items.iter().enumerate() {
                            if i > 0 {
                                write!(out, ", ")?;
                            }
                            self.print(out, it, 0)?;
                        }
                    }
                    _ => self.print(out, *inner, 0)?,
                }
                write!(out, "]")
            }
            TypeKind::Map(from, to) => {
                if prio > 0 {
                    write!(out, "(")?;
                }
                self.print(out, *from, 1)?;
                write!(out, " -> ")?;
                self.print(out, *to, 0)?;
                if prio > 0 {
                    write!(out, ")")?;
                }
                Ok(())
            }
            TypeKind::ForAll { vars, body } => {
                write!(out, "Forall ")?;
                for (i, &v) in vars.iter().enumerate() {
                    if i > 0 {
                        write!(out, " ")?;
                    }
                    self.print(out, v, 0)?;
                }
                write!(out, " . ")?;
                self.print(out, *body, 0)
            }
        }
    }
}
