//! Type-mask lattice for dataflow analysis
//!
//! A mask is a bitset over type categories:
//! - Bottom (`0`) = uninitialized / not yet reached
//! - Top (`ANY`) = every category and every identity bit set
//! - Bits 0..=8 are the primitive categories, bits 9..=62 are identities
//!   handed out by the [`TypeTable`](super::TypeTable) (classes, typed arrays)
//!
//! Bit 63 is the orthogonal `IsRef` flag. It is carried through merges but
//! is not part of the type lattice itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Bitset union of possible runtime types plus the alias flag
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypeMask(u64);

const REF_BIT: u64 = 1 << 63;
const TYPE_BITS: u64 = !REF_BIT;
const PRIMITIVE_BITS: u64 = (1 << TypeMask::FIRST_IDENTITY_BIT) - 1;
const IDENTITY_BITS: u64 = TYPE_BITS & !PRIMITIVE_BITS;

const PRIMITIVE_NAMES: [(TypeMask, &str); 9] = [
    (TypeMask::NULL, "null"),
    (TypeMask::BOOL, "bool"),
    (TypeMask::LONG, "int"),
    (TypeMask::DOUBLE, "float"),
    (TypeMask::STRING, "string"),
    (TypeMask::ARRAY, "array"),
    (TypeMask::RESOURCE, "resource"),
    (TypeMask::CALLABLE, "callable"),
    (TypeMask::OBJECT, "object"),
];

impl TypeMask {
    /// Nothing known yet on this path
    pub const BOTTOM: TypeMask = TypeMask(0);
    pub const NULL: TypeMask = TypeMask(1 << 0);
    pub const BOOL: TypeMask = TypeMask(1 << 1);
    pub const LONG: TypeMask = TypeMask(1 << 2);
    pub const DOUBLE: TypeMask = TypeMask(1 << 3);
    pub const STRING: TypeMask = TypeMask(1 << 4);
    pub const ARRAY: TypeMask = TypeMask(1 << 5);
    pub const RESOURCE: TypeMask = TypeMask(1 << 6);
    pub const CALLABLE: TypeMask = TypeMask(1 << 7);
    /// Object of a class the table has no identity for
    pub const OBJECT: TypeMask = TypeMask(1 << 8);
    pub const NUMBER: TypeMask = TypeMask(Self::LONG.0 | Self::DOUBLE.0);
    /// Top of the lattice
    pub const ANY: TypeMask = TypeMask(TYPE_BITS);
    /// The alias flag on its own
    pub const REF: TypeMask = TypeMask(REF_BIT);

    pub const FIRST_IDENTITY_BIT: u32 = 9;
    /// Number of identity bits available to the type table
    pub const IDENTITY_CAPACITY: u32 = 63 - Self::FIRST_IDENTITY_BIT;

    pub const fn from_bits(bits: u64) -> Self {
        TypeMask(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Mask holding a single identity bit
    pub fn identity(index: u32) -> Self {
        debug_assert!(index < Self::IDENTITY_CAPACITY);
        TypeMask(1 << (Self::FIRST_IDENTITY_BIT + index))
    }

    /// Identity indices present in the mask, ascending
    pub fn identities(self) -> impl Iterator<Item = u32> {
        let bits = self.0 & IDENTITY_BITS;
        (0..Self::IDENTITY_CAPACITY).filter(move |i| bits & (1 << (Self::FIRST_IDENTITY_BIT + i)) != 0)
    }

    pub fn has_identities(self) -> bool {
        self.0 & IDENTITY_BITS != 0
    }

    pub fn primitives(self) -> TypeMask {
        TypeMask(self.0 & PRIMITIVE_BITS)
    }

    /// Lattice join, the flag is carried along
    pub fn union(self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 | other.0)
    }

    pub fn is_bottom(self) -> bool {
        self.types().0 == 0
    }

    pub fn is_any(self) -> bool {
        self.0 & TYPE_BITS == TYPE_BITS
    }

    pub fn is_ref(self) -> bool {
        self.0 & REF_BIT != 0
    }

    pub fn with_ref(self) -> TypeMask {
        TypeMask(self.0 | REF_BIT)
    }

    pub fn without_ref(self) -> TypeMask {
        TypeMask(self.0 & TYPE_BITS)
    }

    /// The type part without the alias flag
    pub fn types(self) -> TypeMask {
        self.without_ref()
    }

    pub fn includes_null(self) -> bool {
        self.0 & Self::NULL.0 != 0
    }

    pub fn with_null(self) -> TypeMask {
        TypeMask(self.0 | Self::NULL.0)
    }

    pub fn without_null(self) -> TypeMask {
        TypeMask(self.0 & !Self::NULL.0)
    }

    /// Remove the type bits of `other`, the flag is kept
    pub fn without(self, other: TypeMask) -> TypeMask {
        TypeMask(self.0 & !other.types().0)
    }

    /// Every type of `other` is possible in `self`
    pub fn includes(self, other: TypeMask) -> bool {
        let other = other.types().0;
        self.0 & other == other
    }

    pub fn intersects(self, other: TypeMask) -> bool {
        self.types().0 & other.types().0 != 0
    }

    /// Non-empty and entirely inside `allowed`
    fn is_only(self, allowed: TypeMask) -> bool {
        let types = self.types().0;
        types != 0 && types & !allowed.0 == 0
    }

    pub fn is_integer_only(self) -> bool {
        self.is_only(Self::LONG)
    }

    pub fn is_float_only(self) -> bool {
        self.is_only(Self::DOUBLE)
    }

    pub fn is_number_only(self) -> bool {
        self.is_only(Self::NUMBER)
    }

    pub fn is_string_only(self) -> bool {
        self.is_only(Self::STRING)
    }

    pub fn is_bool_only(self) -> bool {
        self.is_only(Self::BOOL)
    }

    pub fn is_null_only(self) -> bool {
        self.is_only(Self::NULL)
    }

    pub fn is_single_type(self) -> bool {
        self.types().0.count_ones() == 1
    }

    pub fn may_be_array(self) -> bool {
        self.0 & Self::ARRAY.0 != 0
    }

    pub fn may_be_string(self) -> bool {
        self.0 & Self::STRING.0 != 0
    }
}

impl BitOr for TypeMask {
    type Output = TypeMask;

    fn bitor(self, rhs: TypeMask) -> TypeMask {
        self.union(rhs)
    }
}

impl BitOrAssign for TypeMask {
    fn bitor_assign(&mut self, rhs: TypeMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for TypeMask {
    type Output = TypeMask;

    fn bitand(self, rhs: TypeMask) -> TypeMask {
        TypeMask(self.0 & rhs.0)
    }
}

impl Not for TypeMask {
    type Output = TypeMask;

    fn not(self) -> TypeMask {
        TypeMask(!self.0)
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.is_ref() { "&" } else { "" };
        if self.is_any() {
            return write!(f, "mixed{suffix}");
        }
        if self.is_bottom() {
            return write!(f, "void{suffix}");
        }
        let mut parts: Vec<String> = PRIMITIVE_NAMES
            .iter()
            .filter(|(bit, _)| self.intersects(*bit))
            .map(|(_, name)| (*name).to_string())
            .collect();
        parts.extend(self.identities().map(|i| format!("#{i}")));
        write!(f, "{}{}", parts.join("|"), suffix)
    }
}

impl fmt::Debug for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeMask({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mask() -> impl Strategy<Value = TypeMask> {
        prop_oneof![
            any::<u64>().prop_map(TypeMask::from_bits),
            (0u64..512).prop_map(TypeMask::from_bits),
            Just(TypeMask::ANY),
            Just(TypeMask::BOTTOM),
        ]
    }

    proptest! {
        #[test]
        fn prop_merge_commutative(a in mask(), b in mask()) {
            prop_assert_eq!(a | b, b | a);
        }

        #[test]
        fn prop_merge_associative(a in mask(), b in mask(), c in mask()) {
            prop_assert_eq!(a | (b | c), (a | b) | c);
        }

        #[test]
        fn prop_merge_idempotent(a in mask()) {
            prop_assert_eq!(a | a, a);
        }

        #[test]
        fn prop_any_is_top(a in mask()) {
            prop_assert_eq!(a.types() | TypeMask::ANY, TypeMask::ANY);
            prop_assert!((a | TypeMask::ANY).is_any());
        }

        #[test]
        fn prop_bottom_is_identity(a in mask()) {
            prop_assert_eq!(a | TypeMask::BOTTOM, a);
        }

        #[test]
        fn prop_merge_is_monotone(a in mask(), b in mask()) {
            prop_assert!((a | b).includes(a));
            prop_assert!((a | b).includes(b));
        }

        #[test]
        fn prop_null_round_trip(a in mask()) {
            prop_assert_eq!(a.with_null().without_null(), a.without_null());
            prop_assert_eq!(a.without_null().with_null(), a.with_null());
        }

        #[test]
        fn prop_only_predicates_reject_any(a in mask()) {
            let widened = a | TypeMask::ANY;
            prop_assert!(!widened.is_integer_only());
            prop_assert!(!widened.is_float_only());
            prop_assert!(!widened.is_number_only());
        }
    }

    #[test]
    fn test_only_predicates_are_intersection_tests() {
        let int_or_string = TypeMask::LONG | TypeMask::STRING;
        assert!(!int_or_string.is_integer_only());
        assert!(!int_or_string.is_number_only());
        assert!(TypeMask::NUMBER.is_number_only());
        assert!(!TypeMask::NUMBER.is_integer_only());
        assert!(TypeMask::LONG.with_ref().is_integer_only());
        assert!(!TypeMask::BOTTOM.is_integer_only());
    }

    #[test]
    fn test_single_type() {
        assert!(TypeMask::STRING.is_single_type());
        assert!(TypeMask::identity(3).is_single_type());
        assert!(!TypeMask::NUMBER.is_single_type());
        assert!(!TypeMask::BOTTOM.is_single_type());
    }

    #[test]
    fn test_ref_flag_is_orthogonal() {
        let m = TypeMask::LONG.with_ref();
        assert!(m.is_ref());
        assert_eq!(m.types(), TypeMask::LONG);
        assert!(!TypeMask::ANY.is_ref());
        assert!(TypeMask::ANY.with_ref().is_any());
    }

    #[test]
    fn test_identities_round_trip() {
        let m = TypeMask::identity(0) | TypeMask::identity(7) | TypeMask::LONG;
        assert_eq!(m.identities().collect::<Vec<_>>(), vec![0, 7]);
        assert_eq!(m.primitives(), TypeMask::LONG);
        assert!(TypeMask::ANY.identities().count() == TypeMask::IDENTITY_CAPACITY as usize);
    }

    #[test]
    fn test_display() {
        assert_eq!((TypeMask::LONG | TypeMask::NULL).to_string(), "null|int");
        assert_eq!(TypeMask::ANY.with_ref().to_string(), "mixed&");
        assert_eq!(TypeMask::BOTTOM.to_string(), "void");
        assert_eq!((TypeMask::OBJECT | TypeMask::identity(2)).to_string(), "object|#2");
    }
}
