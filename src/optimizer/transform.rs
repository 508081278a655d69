//! Stack transforms
//!
//! A stack transform is a map `f : N -> N` with `f(x) = x + d` for all
//! but finitely many `x`. Transforms act on stacks on the right:
//! `(S*f)[n] = S[f(n)]`, where position 0 is the top. They form a
//! monoid under composition, and every stack-manipulation instruction
//! (XCHG, PUSH, POP, constant pushes) denotes one, so a whole window of
//! instructions collapses into a single transform that can be compared
//! against the transform of a shorter candidate sequence.
//!
//! The representation follows the classic scheme: the shift `d` plus an
//! ordered anomaly table `A` of pairs `(x, y)` meaning `f(x - d) = y`,
//! with `y != x` and at most [`MAX_ANOMALIES`] entries; overflowing the
//! table marks the transform invalid and disables matching. Pushed
//! constants are modeled as *markers*: negative values below
//! [`C_START`] that pass through composition untouched, so a constant
//! push followed by a drop cancels to the identity.

/// Anomaly table capacity.
pub const MAX_ANOMALIES: usize = 16;

/// Constant markers are `C_START - k` for the `k`-th constant pushed.
pub const C_START: i32 = -1000;

#[derive(Debug, Clone, Default)]
pub struct StackTransform {
    /// Shift: `f(x) = x + d` outside the anomaly table.
    d: i32,
    /// How deep into the source stack this transform reaches.
    dp: i32,
    /// Number of constant markers introduced.
    c: i32,
    invalid: bool,
    /// Pairs `(x, y)`, sorted by `x`: `f(x - d) = y`.
    a: Vec<(i32, i32)>,
}

impl StackTransform {
    pub fn id() -> Self {
        StackTransform::default()
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid
    }

    pub fn invalidate(&mut self) {
        self.invalid = true;
    }

    pub fn is_id(&self) -> bool {
        self.is_valid() && self.d == 0 && self.a.is_empty()
    }

    pub fn shift_by(&self) -> i32 {
        self.d
    }

    pub fn depth_touched(&self) -> i32 {
        self.dp
    }

    pub fn const_count(&self) -> i32 {
        self.c
    }

    pub fn anomalies(&self) -> &[(i32, i32)] {
        &self.a
    }

    /// `f(i)`.
    pub fn get(&self, i: i32) -> i32 {
        let x = i + self.d;
        match self.a.binary_search_by_key(&x, |p| p.0) {
            Ok(k) => self.a[k].1,
            Err(_) => x,
        }
    }

    /// Record `f(i) = v`, keeping the table sorted and minimal.
    fn set(&mut self, i: i32, v: i32) {
        let x = i + self.d;
        match self.a.binary_search_by_key(&x, |p| p.0) {
            Ok(k) => {
                if v == x {
                    self.a.remove(k);
                } else {
                    self.a[k].1 = v;
                }
            }
            Err(k) => {
                if v != x {
                    if self.a.len() >= MAX_ANOMALIES {
                        self.invalidate();
                        return;
                    }
                    self.a.insert(k, (x, v));
                }
            }
        }
    }

    fn touch(&mut self, i: i32) {
        self.dp = self.dp.max(i + self.d + 1);
    }

    fn touch_get(&mut self, i: i32) -> i32 {
        self.touch(i);
        self.get(i)
    }

    /// Post-compose with `x -> x + offs`. Anomaly entries keep their
    /// stored `x`; entries falling below the new `d` describe arguments
    /// that no longer exist and are dropped.
    fn shift(&mut self, offs: i32) {
        self.d += offs;
        if offs > 0 {
            let d = self.d;
            self.a.retain(|&(x, _)| x >= d);
        }
    }

    /// Post-compose with an exchange of depths `i` and `j`.
    pub fn apply_xchg(&mut self, i: i32, j: i32) {
        if self.invalid || i == j {
            return;
        }
        let vi = self.touch_get(i);
        let vj = self.touch_get(j);
        self.set(i, vj);
        self.set(j, vi);
    }

    /// Post-compose with `PUSH s(i)`.
    pub fn apply_push(&mut self, i: i32) {
        if self.invalid {
            return;
        }
        let v = self.touch_get(i);
        self.shift(-1);
        self.set(0, v);
    }

    /// Post-compose with `POP s(i)` (the top value lands at depth `i`).
    pub fn apply_pop(&mut self, i: i32) {
        if self.invalid {
            return;
        }
        let v = self.touch_get(0);
        self.touch(i);
        self.shift(1);
        if i > 0 {
            self.set(i - 1, v);
        }
    }

    /// Post-compose with a push of an opaque constant.
    pub fn apply_push_newconst(&mut self) {
        if self.invalid {
            return;
        }
        let marker = C_START - self.c;
        self.c += 1;
        self.shift(-1);
        self.set(0, marker);
    }

    /// Post-compose with a push of a specific marker (used when
    /// building candidate transforms that must mention the same
    /// constant as the window being matched).
    pub fn apply_push_marker(&mut self, marker: i32) {
        if self.invalid {
            return;
        }
        self.c += 1;
        self.shift(-1);
        self.set(0, marker);
    }

    /// `self = self * other` (run `self` first, then `other`):
    /// `(self*other)(x) = self(other(x))`.
    pub fn apply(&mut self, other: &StackTransform) {
        let result = StackTransform::compose(self, other);
        *self = result;
    }

    /// Composition `a * b`, i.e. the effect of running `a` then `b`.
    pub fn compose(a: &StackTransform, b: &StackTransform) -> StackTransform {
        if a.invalid || b.invalid {
            let mut t = StackTransform::id();
            t.invalidate();
            return t;
        }
        let mut c = StackTransform {
            d: a.d + b.d,
            dp: a.dp.max(b.dp + a.d).max(0),
            c: a.c + b.c,
            invalid: false,
            a: Vec::new(),
        };
        // candidate arguments where a(b(z)) may deviate from z + c.d
        let mut args: Vec<i32> = Vec::new();
        for &(x, _) in &b.a {
            args.push(x - b.d);
        }
        for &(x, _) in &a.a {
            args.push(x - a.d - b.d);
        }
        args.sort_unstable();
        args.dedup();
        for z in args {
            if z < 0 {
                continue;
            }
            let mid = b.get(z);
            let v = if mid <= C_START {
                // b pushed this constant; renumber after a's markers
                mid - a.c
            } else {
                a.get(mid)
            };
            if v != z + c.d {
                if c.a.len() >= MAX_ANOMALIES {
                    c.invalidate();
                    return c;
                }
                c.a.push((z + c.d, v));
            }
        }
        c
    }

    /// Equality of the maps themselves, ignoring the touched depth.
    pub fn almost_equal(&self, other: &StackTransform) -> bool {
        self.is_valid() && other.is_valid() && self.d == other.d && self.a == other.a
    }

    /// Strict equality: maps and touched depth agree.
    pub fn equal(&self, other: &StackTransform) -> bool {
        self.almost_equal(other) && self.dp == other.dp
    }

    /// Same map, touching no deeper than `other`. A replacement whose
    /// transform `le`s the window's is always safe to substitute.
    pub fn le(&self, other: &StackTransform) -> bool {
        self.almost_equal(other) && self.dp <= other.dp
    }

    /// Is `f` a bijection of stack positions (no consts, no drops)?
    pub fn is_permutation(&self) -> bool {
        if !self.is_valid() || self.d != 0 {
            return false;
        }
        let mut xs: Vec<i32> = self.a.iter().map(|p| p.0).collect();
        let mut ys: Vec<i32> = self.a.iter().map(|p| p.1).collect();
        if ys.iter().any(|&y| y < 0) {
            return false;
        }
        xs.sort_unstable();
        ys.sort_unstable();
        xs == ys
    }

    /// `f(x') = x' + d` for every `x' >= x`.
    pub fn is_trivial_after(&self, x: i32) -> bool {
        self.a.iter().all(|&(ax, _)| ax - self.d < x)
    }

    /// Any constant marker among the images?
    pub fn has_marker(&self) -> bool {
        self.a.iter().any(|&(_, y)| y <= C_START)
    }

    /// The marker values appearing among the images.
    pub fn markers(&self) -> Vec<i32> {
        let mut m: Vec<i32> = self
            .a
            .iter()
            .map(|&(_, y)| y)
            .filter(|&y| y <= C_START)
            .collect();
        m.sort_unstable();
        m.dedup();
        m
    }

    // --- generator constructors ---

    pub fn xchg(i: i32, j: i32) -> Self {
        let mut t = StackTransform::id();
        t.apply_xchg(i, j);
        t
    }

    pub fn push(i: i32) -> Self {
        let mut t = StackTransform::id();
        t.apply_push(i);
        t
    }

    pub fn pop(i: i32) -> Self {
        let mut t = StackTransform::id();
        t.apply_pop(i);
        t
    }

    pub fn push_newconst() -> Self {
        let mut t = StackTransform::id();
        t.apply_push_newconst();
        t
    }

    /// `BLKSWAP i, j`: the block of `i` values under the top `j` comes
    /// to the top, order preserved.
    pub fn blkswap(i: i32, j: i32) -> Self {
        let mut t = StackTransform::id();
        if i <= 0 || j <= 0 || (i + j) as usize > MAX_ANOMALIES {
            t.invalidate();
            return t;
        }
        for k in 0..i {
            t.a.push((k, j + k));
        }
        for k in 0..j {
            t.a.push((i + k, k));
        }
        t.dp = i + j;
        t
    }

    /// `BLKPUSH i, j` = `PUSH s(j)` done `i` times.
    pub fn blkpush(i: i32, j: i32) -> Self {
        let mut t = StackTransform::id();
        for _ in 0..i {
            t.apply_push(j);
        }
        t
    }

    /// `BLKDROP i`.
    pub fn blkdrop(i: i32) -> Self {
        let mut t = StackTransform::id();
        for _ in 0..i {
            t.apply_pop(0);
        }
        t
    }

    /// `BLKDROP2 i, j`: drop `i` values lying under the top `j`.
    pub fn blkdrop2(i: i32, j: i32) -> Self {
        let mut t = StackTransform::id();
        if i <= 0 || j < 0 || j as usize > MAX_ANOMALIES {
            t.invalidate();
            return t;
        }
        t.d = i;
        for k in 0..j {
            t.a.push((k + i, k));
        }
        t.dp = i + j;
        t
    }

    /// `REVERSE i, j`: reverse the `i` values starting at depth `j`.
    pub fn reverse(i: i32, j: i32) -> Self {
        let mut t = StackTransform::id();
        if i <= 1 || j < 0 || (i + j) as usize > MAX_ANOMALIES {
            t.invalidate();
            return t;
        }
        for k in 0..i {
            let y = j + i - 1 - k;
            if j + k != y {
                t.a.push((j + k, y));
            }
        }
        t.dp = i + j;
        t
    }

    // --- recognizers with direct parameter extraction ---

    /// Identity or a single transposition `(i j)`.
    pub fn is_xchg(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d != 0 {
            return None;
        }
        match self.a.as_slice() {
            [] => Some((0, 0)),
            [(x1, y1), (x2, y2)] if y1 == x2 && y2 == x1 => Some((*x1, *x2)),
            _ => None,
        }
    }

    pub fn is_push(&self) -> Option<i32> {
        if !self.is_valid() || self.d != -1 {
            return None;
        }
        match self.a.as_slice() {
            [(-1, y)] if *y >= 0 => Some(*y),
            _ => None,
        }
    }

    pub fn is_pop(&self) -> Option<i32> {
        if !self.is_valid() || self.d != 1 {
            return None;
        }
        // POP s(i) leaves the old top at position i-1, i.e. a single
        // anomaly f(i-1) = 0 stored as the pair (i, 0)
        match self.a.as_slice() {
            [] => Some(0),
            [(x, 0)] if *x >= 1 => Some(*x),
            _ => None,
        }
    }

    pub fn is_blkdrop(&self) -> Option<i32> {
        if self.is_valid() && self.d > 1 && self.a.is_empty() {
            Some(self.d)
        } else {
            None
        }
    }

    pub fn is_blkdrop2(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d <= 0 || self.a.is_empty() {
            return None;
        }
        let j = self.a.len() as i32;
        for (k, &(x, y)) in self.a.iter().enumerate() {
            if x != k as i32 + self.d || y != k as i32 {
                return None;
            }
        }
        Some((self.d, j))
    }

    pub fn is_blkswap(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d != 0 || self.a.is_empty() {
            return None;
        }
        let j = self.get(0);
        if j <= 0 {
            return None;
        }
        let i = self.a.iter().find(|&&(_, y)| y == 0).map(|&(x, _)| x)?;
        if i <= 0 {
            return None;
        }
        let cand = StackTransform::blkswap(i, j);
        cand.almost_equal(self).then_some((i, j))
    }

    pub fn is_blkpush(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d >= -1 {
            return None;
        }
        let i = -self.d;
        let j = self.get(i - 1);
        if j < 0 {
            return None;
        }
        let cand = StackTransform::blkpush(i, j);
        cand.almost_equal(self).then_some((i, j))
    }

    pub fn is_reverse(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d != 0 || self.a.len() < 2 {
            return None;
        }
        let j = self.a.first()?.0;
        let last = self.a.last()?.0;
        let i = last - j + 1;
        let cand = StackTransform::reverse(i, j);
        cand.almost_equal(self).then_some((i, j))
    }

    /// `POP s(i)` followed by `BLKDROP k`.
    pub fn is_pop_blkdrop(&self) -> Option<(i32, i32)> {
        if !self.is_valid() || self.d < 2 {
            return None;
        }
        let k = self.d - 1;
        // the popped value survives the drops at depth i - 1 - k
        let z = self.a.iter().find(|&&(_, y)| y == 0).map(|&(x, _)| x - self.d)?;
        let i = z + k + 1;
        if i <= 0 {
            return None;
        }
        let mut cand = StackTransform::pop(i);
        cand.apply(&StackTransform::blkdrop(k));
        cand.almost_equal(self).then_some((i, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A tiny symbolic interpreter: stack entries are labels of their
    /// original positions (top first), constants are markers.
    #[derive(Clone)]
    struct SymStack {
        s: Vec<i32>,
        consts: i32,
    }

    impl SymStack {
        fn new(depth: usize) -> Self {
            SymStack {
                s: (0..depth as i32).collect(),
                consts: 0,
            }
        }

        fn xchg(&mut self, i: usize, j: usize) {
            self.s.swap(i, j);
        }

        fn push(&mut self, i: usize) {
            let v = self.s[i];
            self.s.insert(0, v);
        }

        fn pop(&mut self, i: usize) {
            let v = self.s.remove(0);
            if i > 0 {
                self.s[i - 1] = v;
            }
        }

        fn push_const(&mut self) {
            self.s.insert(0, C_START - self.consts);
            self.consts += 1;
        }
    }

    #[derive(Clone, Copy)]
    enum SymOp {
        Xchg(i32, i32),
        Push(i32),
        Pop(i32),
        Const,
    }

    fn run(ops: &[SymOp], depth: usize) -> (SymStack, StackTransform) {
        let mut s = SymStack::new(depth);
        let mut t = StackTransform::id();
        for &op in ops {
            match op {
                SymOp::Xchg(i, j) => {
                    s.xchg(i as usize, j as usize);
                    t.apply_xchg(i, j);
                }
                SymOp::Push(i) => {
                    s.push(i as usize);
                    t.apply_push(i);
                }
                SymOp::Pop(i) => {
                    s.pop(i as usize);
                    t.apply_pop(i);
                }
                SymOp::Const => {
                    s.push_const();
                    t.apply_push_newconst();
                }
            }
        }
        (s, t)
    }

    /// Sequential generator application and the symbolic interpreter
    /// must agree position by position.
    fn check_round_trip(ops: &[SymOp], depth: usize) {
        let (s, t) = run(ops, depth);
        assert!(t.is_valid());
        for (n, &label) in s.s.iter().enumerate() {
            assert_eq!(t.get(n as i32), label, "position {} after {:?} ops", n, ops.len());
        }
    }

    #[test]
    fn test_round_trip_basic_ops() {
        check_round_trip(&[SymOp::Xchg(0, 1)], 4);
        check_round_trip(&[SymOp::Push(2)], 4);
        check_round_trip(&[SymOp::Pop(0)], 4);
        check_round_trip(&[SymOp::Pop(2)], 4);
        check_round_trip(&[SymOp::Const], 4);
    }

    #[test]
    fn test_round_trip_mixed_sequences() {
        check_round_trip(
            &[SymOp::Push(1), SymOp::Xchg(0, 2), SymOp::Pop(1), SymOp::Push(0)],
            6,
        );
        check_round_trip(
            &[
                SymOp::Const,
                SymOp::Xchg(0, 1),
                SymOp::Push(3),
                SymOp::Pop(2),
                SymOp::Pop(0),
            ],
            6,
        );
        check_round_trip(
            &[SymOp::Xchg(1, 2), SymOp::Xchg(0, 1), SymOp::Xchg(1, 2), SymOp::Xchg(0, 1)],
            5,
        );
    }

    #[test]
    fn test_composition_matches_sequential_application() {
        let ops1 = [SymOp::Push(1), SymOp::Xchg(0, 2)];
        let ops2 = [SymOp::Pop(1), SymOp::Push(0)];
        let (_, t1) = run(&ops1, 6);
        let (_, t2) = run(&ops2, 6);
        let all: Vec<SymOp> = ops1.iter().chain(&ops2).copied().collect();
        let (_, t_all) = run(&all, 6);
        let composed = StackTransform::compose(&t1, &t2);
        assert!(composed.equal(&t_all));
    }

    #[test]
    fn test_swap_swap_is_identity() {
        let mut t = StackTransform::id();
        t.apply_xchg(0, 1);
        t.apply_xchg(0, 1);
        assert!(t.is_id());
    }

    #[test]
    fn test_const_then_drop_cancels() {
        let mut t = StackTransform::id();
        t.apply_push_newconst();
        t.apply_pop(0);
        assert!(t.is_id());
    }

    #[test]
    fn test_push_then_blkdrop2_is_swap() {
        // PUSH s0, PUSH s2, BLKDROP2 2,2 rearranges (a b) into (b a)
        let mut t = StackTransform::id();
        t.apply_push(0);
        t.apply_push(2);
        t.apply(&StackTransform::blkdrop2(2, 2));
        assert_eq!(t.is_xchg(), Some((0, 1)));
    }

    #[test]
    fn test_recognize_push_and_pop() {
        assert_eq!(StackTransform::push(3).is_push(), Some(3));
        assert_eq!(StackTransform::pop(0).is_pop(), Some(0));
        assert_eq!(StackTransform::pop(4).is_pop(), Some(4));
        assert_eq!(StackTransform::push(3).is_pop(), None);
    }

    #[test]
    fn test_recognize_blk_ops() {
        assert_eq!(StackTransform::blkdrop(3).is_blkdrop(), Some(3));
        assert_eq!(StackTransform::blkswap(2, 3).is_blkswap(), Some((2, 3)));
        assert_eq!(StackTransform::blkdrop2(2, 2).is_blkdrop2(), Some((2, 2)));
        assert_eq!(StackTransform::reverse(3, 1).is_reverse(), Some((3, 1)));
        assert_eq!(StackTransform::blkpush(2, 1).is_blkpush(), Some((2, 1)));
    }

    #[test]
    fn test_recognize_pop_blkdrop() {
        let mut t = StackTransform::pop(3);
        t.apply(&StackTransform::blkdrop(2));
        assert_eq!(t.is_pop_blkdrop(), Some((3, 2)));
    }

    #[test]
    fn test_rot_is_blkswap_1_2() {
        // ROT = XCHG s1,s2; SWAP
        let mut t = StackTransform::id();
        t.apply_xchg(1, 2);
        t.apply_xchg(0, 1);
        let rot = StackTransform::blkswap(1, 2);
        assert!(rot.almost_equal(&t));
        // ROT then -ROT cancels, and ROT^3 = id
        let rotrev = StackTransform::blkswap(2, 1);
        let mut both = rot.clone();
        both.apply(&rotrev);
        assert!(both.is_id());
        let mut thrice = rot.clone();
        thrice.apply(&rot);
        thrice.apply(&rot);
        assert!(thrice.is_id());
    }

    #[test]
    fn test_anomaly_overflow_invalidates() {
        let mut t = StackTransform::id();
        for i in 0..((MAX_ANOMALIES as i32) + 2) {
            t.apply_push(2 * i + 1);
        }
        assert!(!t.is_valid());
    }

    #[test]
    fn test_permutation_check() {
        assert!(StackTransform::xchg(1, 3).is_permutation());
        assert!(StackTransform::blkswap(2, 2).is_permutation());
        assert!(!StackTransform::push(0).is_permutation());
        assert!(!StackTransform::blkdrop(1).is_permutation());
    }

    #[test]
    fn test_trivial_after() {
        let t = StackTransform::xchg(0, 2);
        assert!(t.is_trivial_after(3));
        assert!(!t.is_trivial_after(2));
    }

    #[test]
    fn test_le_allows_shallower_replacement() {
        // six swaps composing to identity touch depth 3; the empty
        // replacement touches nothing - still substitutable
        let mut t = StackTransform::id();
        t.apply_xchg(1, 2);
        t.apply_xchg(0, 1);
        t.apply_xchg(1, 2);
        t.apply_xchg(1, 2);
        t.apply_xchg(0, 1);
        t.apply_xchg(1, 2);
        assert!(t.is_id());
        assert!(StackTransform::id().le(&t));
        assert!(!t.le(&StackTransform::id()) || t.depth_touched() == 0);
    }
}
