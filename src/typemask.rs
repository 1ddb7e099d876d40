//! The type-speculation mask lattice: a bitset over a fixed, closed set of
//! runtime-type primitives, used by quickening and `TypeCheck` lowering.

use once_cell::sync::Lazy;
use serde::Serialize;

/// The closed universe of runtime-type primitives a `TypeMask` can speculate
/// over. Order here is the canonical iteration order used anywhere the
/// pipeline needs deterministic enumeration of set bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypePrimitive {
    Int32 = 0,
    Double = 1,
    DoubleNotNaN = 2,
    Boolean = 3,
    HeapString = 4,
    HeapObject = 5,
    HeapFunction = 6,
    Null = 7,
    Undefined = 8,
}

static CANONICAL_ORDER: Lazy<[TypePrimitive; 9]> = Lazy::new(|| {
    use TypePrimitive::*;
    [Int32, Double, DoubleNotNaN, Boolean, HeapString, HeapObject, HeapFunction, Null, Undefined]
});

/// A bitset over `TypePrimitive`. Bit `i` corresponds to `CANONICAL_ORDER[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize)]
pub struct TypeMask(u16);

impl TypeMask {
    pub const EMPTY: TypeMask = TypeMask(0);

    pub fn single(p: TypePrimitive) -> TypeMask {
        TypeMask(1 << (p as u16))
    }

    pub fn from_primitives(ps: impl IntoIterator<Item = TypePrimitive>) -> TypeMask {
        let mut m = TypeMask::EMPTY;
        for p in ps {
            m = m.union(TypeMask::single(p));
        }
        m
    }

    pub fn full() -> TypeMask {
        TypeMask::from_primitives(CANONICAL_ORDER.iter().copied())
    }

    pub fn contains(&self, p: TypePrimitive) -> bool {
        self.0 & (1 << (p as u16)) != 0
    }

    pub fn union(&self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 | other.0)
    }

    pub fn intersect(&self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 & other.0)
    }

    pub fn subtract(&self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 & !other.0)
    }

    pub fn is_subset_of(&self, other: TypeMask) -> bool {
        self.intersect(other) == *self
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_singleton(&self) -> bool {
        self.0 != 0 && (self.0 & (self.0 - 1)) == 0
    }

    /// Iterate the set primitives in canonical order. Used everywhere the
    /// pipeline must emit deterministic output (e.g. quickening variant
    /// ordinal assignment).
    pub fn iter_canonical(&self) -> impl Iterator<Item = TypePrimitive> + '_ {
        CANONICAL_ORDER.iter().copied().filter(move |p| self.contains(*p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TypePrimitive::*;

    #[test]
    fn union_and_intersect_behave_as_a_lattice() {
        let a = TypeMask::from_primitives([Int32, Double]);
        let b = TypeMask::from_primitives([Double, Boolean]);
        assert_eq!(a.union(b), TypeMask::from_primitives([Int32, Double, Boolean]));
        assert_eq!(a.intersect(b), TypeMask::single(Double));
    }

    #[test]
    fn is_subset_of_respects_partial_order() {
        let small = TypeMask::single(Int32);
        let big = TypeMask::from_primitives([Int32, Double]);
        assert!(small.is_subset_of(big));
        assert!(!big.is_subset_of(small));
    }

    #[test]
    fn iter_canonical_is_deterministic_regardless_of_insertion_order() {
        let a = TypeMask::from_primitives([Boolean, Int32, Double]);
        let b = TypeMask::from_primitives([Double, Boolean, Int32]);
        let va: Vec<_> = a.iter_canonical().collect();
        let vb: Vec<_> = b.iter_canonical().collect();
        assert_eq!(va, vb);
        assert_eq!(va, vec![Int32, Double, Boolean]);
    }

    #[test]
    fn is_singleton_detects_exactly_one_bit() {
        assert!(TypeMask::single(Int32).is_singleton());
        assert!(!TypeMask::from_primitives([Int32, Double]).is_singleton());
        assert!(!TypeMask::EMPTY.is_singleton());
    }
}
