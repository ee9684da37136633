//! The closed lattice of built-in types plus opaque user object-type ids
//!. Deliberately shallow: this is instruction-specialization
//! inference, not a static type checker, so `isCompat` only needs to answer
//! "can the emitter skip a runtime check here", not "is this program
//! well-typed".

use crate::interned_id;

interned_id! {
    /// A type in the lattice. Built-ins occupy the first
    /// [`TypeId::FIRST_OBJECT.0`] slots at fixed, well-known values; every
    /// id at or above that is a user object type allocated contiguously by
    /// [`TypeLattice::alloc_object_type`].
    TypeId
}

macro_rules! builtin_types {
    ($($name:ident = $idx:expr),* $(,)?) => {
        impl TypeId {
            $(pub const $name: TypeId = TypeId($idx);)*
            /// One past the last built-in slot; the first free id for
            /// user object types.
            pub const FIRST_OBJECT: TypeId = TypeId(builtin_types!(@count $($idx),*));
        }
    };
    (@count $($idx:expr),*) => {
        { const N: u32 = 0 $(+ { let _ = $idx; 1 })*; N }
    };
}

builtin_types! {
    ANY = 0,
    BOOLEAN = 1,
    FLOAT = 2,
    INTEGER = 3,
    STRING = 4,
    STATIC_STRING = 5,
    RAWSTRING = 6,
    SYMBOL = 7,
    LIST = 8,
    LIST_ITERATOR = 9,
    MAP = 10,
    MAP_ITERATOR = 11,
    POINTER = 12,
    NONE = 13,
    ERROR = 14,
    FIBER = 15,
    METATYPE = 16,
    DYNAMIC = 17,
    UNDEFINED = 18,
}

#[derive(Debug, Default)]
pub struct TypeLattice {
    next_object: u32,
    object_names: Vec<arcstr::ArcStr>,
}

impl TypeLattice {
    pub fn new() -> Self {
        Self { next_object: TypeId::FIRST_OBJECT.0, object_names: Vec::new() }
    }

    /// Allocate a fresh, contiguous object-type id for a user-declared
    /// `object`/`enum` type.
    pub fn alloc_object_type(&mut self, name: &str) -> TypeId {
        let id = TypeId(self.next_object);
        self.next_object += 1;
        self.object_names.push(name.into());
        id
    }

    pub fn object_name(&self, id: TypeId) -> Option<&str> {
        if id.0 < TypeId::FIRST_OBJECT.0 {
            None
        } else {
            self.object_names.get((id.0 - TypeId::FIRST_OBJECT.0) as usize).map(|s| s.as_str())
        }
    }

    pub fn is_object(&self, id: TypeId) -> bool {
        id.0 >= TypeId::FIRST_OBJECT.0
    }

    /// `isCompat(src, tgt)` — is a value of type `src` usable where `tgt`
    /// is requested.
    pub fn is_compat(&self, src: TypeId, tgt: TypeId) -> bool {
        if tgt == TypeId::ANY {
            return true;
        }
        if src == TypeId::DYNAMIC {
            return true;
        }
        if src == tgt {
            return true;
        }
        // integer literal narrowing: an Integer value is accepted where a
        // Float is requested (the emitter inserts the int->float coercion).
        if src == TypeId::INTEGER && tgt == TypeId::FLOAT {
            return true;
        }
        false
    }

    /// Is `ty` a reference-counting candidate — i.e. can a value of this
    /// type point at a heap object whose refcount the emitter must manage?
    pub fn is_rc_candidate(&self, ty: TypeId) -> bool {
        match ty {
            TypeId::STRING
            | TypeId::LIST
            | TypeId::MAP
            | TypeId::LIST_ITERATOR
            | TypeId::MAP_ITERATOR
            | TypeId::POINTER
            | TypeId::FIBER
            | TypeId::ANY
            | TypeId::DYNAMIC
            | TypeId::ERROR => true,
            t if self.is_object(t) => true,
            _ => false,
        }
    }

    /// The common type of two branches with identical inferred type is
    /// that type; otherwise `any` (used by `and`/`or` and `if`/`match`
    /// result typing).
    pub fn common_type(&self, a: TypeId, b: TypeId) -> TypeId {
        if a == b {
            a
        } else {
            TypeId::ANY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_accepts_everything() {
        let lat = TypeLattice::new();
        assert!(lat.is_compat(TypeId::INTEGER, TypeId::ANY));
        assert!(lat.is_compat(TypeId::STRING, TypeId::ANY));
    }

    #[test]
    fn dynamic_is_compatible_with_anything_as_source() {
        let lat = TypeLattice::new();
        assert!(lat.is_compat(TypeId::DYNAMIC, TypeId::STRING));
    }

    #[test]
    fn integer_narrows_to_float_only() {
        let lat = TypeLattice::new();
        assert!(lat.is_compat(TypeId::INTEGER, TypeId::FLOAT));
        assert!(!lat.is_compat(TypeId::FLOAT, TypeId::INTEGER));
        assert!(!lat.is_compat(TypeId::STRING, TypeId::INTEGER));
    }

    #[test]
    fn object_types_are_contiguous_and_rc_candidates() {
        let mut lat = TypeLattice::new();
        let a = lat.alloc_object_type("Point");
        let b = lat.alloc_object_type("Color");
        assert_eq!(a.0 + 1, b.0);
        assert_eq!(a, TypeId::FIRST_OBJECT);
        assert!(lat.is_rc_candidate(a));
        assert!(lat.is_rc_candidate(TypeId::STRING));
        assert!(!lat.is_rc_candidate(TypeId::INTEGER));
        assert!(!lat.is_rc_candidate(TypeId::BOOLEAN));
    }
}
