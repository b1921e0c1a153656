//! Identity bits of type masks
//!
//! Masks reserve bits for specific classes and for typed arrays
//! (`array<int>`). The table hands those bits out on first use and is
//! shared by every routine of a program. Allocation only ever grows and is
//! capped by [`TypeMask::IDENTITY_CAPACITY`], which keeps the lattice height
//! finite; past the cap classes degrade to the generic `object` bit and
//! arrays to the generic `array` bit.

use super::mask::TypeMask;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeIdentity {
    Class(String),
    /// Array whose elements are covered by the given primitive mask
    ArrayOf(TypeMask),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdentityKey {
    Class(String),
    ArrayOf(TypeMask),
}

#[derive(Debug, Default)]
struct TableInner {
    identities: Vec<TypeIdentity>,
    index: FxHashMap<IdentityKey, u32>,
    /// Some array lost its identity, element types can no longer be trusted
    arrays_overflowed: bool,
}

impl TableInner {
    fn lookup_or_insert(&mut self, key: IdentityKey, identity: TypeIdentity) -> Option<u32> {
        if let Some(&index) = self.index.get(&key) {
            return Some(index);
        }
        let index = u32::try_from(self.identities.len()).ok()?;
        if index >= TypeMask::IDENTITY_CAPACITY {
            if matches!(identity, TypeIdentity::ArrayOf(_)) {
                self.arrays_overflowed = true;
            }
            return None;
        }
        self.identities.push(identity);
        self.index.insert(key, index);
        Some(index)
    }

    fn normalize_element(&self, elem: TypeMask) -> TypeMask {
        let elem = elem.types();
        if elem.is_any() {
            return TypeMask::ANY;
        }
        let mut out = elem.primitives();
        for id in elem.identities() {
            match self.identities.get(id as usize) {
                Some(TypeIdentity::ArrayOf(_)) => out |= TypeMask::ARRAY,
                _ => out |= TypeMask::OBJECT,
            }
        }
        out
    }
}

/// Program-wide registry of class and typed-array identities
#[derive(Debug, Default)]
pub struct TypeTable {
    inner: RwLock<TableInner>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mask of an instance of `name`
    pub fn class(&self, name: &str) -> TypeMask {
        let name = name.trim_start_matches('\\');
        let key = IdentityKey::Class(name.to_ascii_lowercase());
        if let Some(&index) = self.inner.read().index.get(&key) {
            return TypeMask::identity(index);
        }
        let mut inner = self.inner.write();
        match inner.lookup_or_insert(key, TypeIdentity::Class(name.to_string())) {
            Some(index) => TypeMask::identity(index),
            None => TypeMask::OBJECT,
        }
    }

    /// Mask of an array whose elements are covered by `elem`
    pub fn array_of(&self, elem: TypeMask) -> TypeMask {
        let mut inner = self.inner.write();
        let elem = inner.normalize_element(elem);
        let key = IdentityKey::ArrayOf(elem);
        match inner.lookup_or_insert(key, TypeIdentity::ArrayOf(elem)) {
            Some(index) => TypeMask::ARRAY | TypeMask::identity(index),
            None => TypeMask::ARRAY,
        }
    }

    /// Array whose element type is unknown
    pub fn any_array(&self) -> TypeMask {
        self.array_of(TypeMask::ANY)
    }

    pub fn identity(&self, index: u32) -> Option<TypeIdentity> {
        self.inner.read().identities.get(index as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type of the values produced by iterating or indexing into `mask`.
    /// `BOTTOM` means the mask only holds arrays known to be empty.
    pub fn element_type(&self, mask: TypeMask) -> TypeMask {
        if mask.is_any() {
            return TypeMask::ANY;
        }
        let inner = self.inner.read();
        let mut elem = TypeMask::BOTTOM;
        let mut typed_arrays = false;
        for id in mask.identities() {
            match inner.identities.get(id as usize) {
                Some(TypeIdentity::ArrayOf(e)) => {
                    typed_arrays = true;
                    elem |= *e;
                }
                // Traversable objects yield anything
                _ => return TypeMask::ANY,
            }
        }
        if mask.intersects(TypeMask::OBJECT) {
            return TypeMask::ANY;
        }
        if mask.may_be_array() && (!typed_arrays || inner.arrays_overflowed) {
            return TypeMask::ANY;
        }
        elem
    }

    /// Result of reading `mask[...]`
    pub fn index_type(&self, mask: TypeMask) -> TypeMask {
        if mask.is_string_only() {
            return TypeMask::STRING;
        }
        let elem = self.element_type(mask);
        let mut result = if elem.is_bottom() { TypeMask::NULL } else { elem };
        if mask.may_be_string() {
            result |= TypeMask::STRING;
        }
        if mask.includes_null() {
            result |= TypeMask::NULL;
        }
        result
    }

    /// Array mask after storing `value` into one of its elements
    pub fn with_element(&self, array: TypeMask, value: TypeMask) -> TypeMask {
        let array = array.types();
        if array.is_any() {
            return TypeMask::ANY;
        }
        let arrays = self.array_part(array);
        let previous = if arrays.is_bottom() {
            TypeMask::BOTTOM
        } else {
            self.element_type(arrays)
        };
        // strings and objects keep their kind, null becomes an array
        self.array_of(previous | value.types()) | array.without_null().without(arrays)
    }

    /// Only the array-related bits of `mask`
    pub fn array_part(&self, mask: TypeMask) -> TypeMask {
        let inner = self.inner.read();
        let mut out = mask.types() & TypeMask::ARRAY;
        for id in mask.identities() {
            if let Some(TypeIdentity::ArrayOf(_)) = inner.identities.get(id as usize) {
                out |= TypeMask::identity(id);
            }
        }
        out
    }

    /// Only the class-identity bits of `mask`
    pub fn class_part(&self, mask: TypeMask) -> TypeMask {
        let inner = self.inner.read();
        let mut out = TypeMask::BOTTOM;
        for id in mask.identities() {
            if let Some(TypeIdentity::Class(_)) = inner.identities.get(id as usize) {
                out |= TypeMask::identity(id);
            }
        }
        out
    }

    pub fn may_be_object(&self, mask: TypeMask) -> bool {
        mask.intersects(TypeMask::OBJECT) || !self.class_part(mask).is_bottom()
    }

    /// Object-ness of `mask` without regard to the concrete classes
    pub fn object_mask(&self, mask: TypeMask) -> TypeMask {
        (mask.types() & TypeMask::OBJECT) | self.class_part(mask)
    }

    /// The class name when `mask` (ignoring `null`) is exactly one class
    pub fn single_class(&self, mask: TypeMask) -> Option<String> {
        let types = mask.types().without_null();
        if !types.is_single_type() || !types.has_identities() {
            return None;
        }
        let id = types.identities().next()?;
        match self.identity(id)? {
            TypeIdentity::Class(name) => Some(name),
            TypeIdentity::ArrayOf(_) => None,
        }
    }

    /// Union of a declared hint list; an empty list means untyped
    pub fn from_hint(&self, names: &[String], self_class: Option<&str>) -> TypeMask {
        if names.is_empty() {
            return TypeMask::ANY;
        }
        names
            .iter()
            .fold(TypeMask::BOTTOM, |acc, name| acc | self.parse_hint(name, self_class))
    }

    /// Mask for a single written type name such as `?int`, `Foo[]` or `int|string`
    pub fn parse_hint(&self, name: &str, self_class: Option<&str>) -> TypeMask {
        let name = name.trim();
        if name.contains('|') {
            return name
                .split('|')
                .fold(TypeMask::BOTTOM, |acc, part| acc | self.parse_hint(part, self_class));
        }
        if let Some(inner) = name.strip_prefix('?') {
            return self.parse_hint(inner, self_class).with_null();
        }
        if let Some(elem) = name.strip_suffix("[]") {
            let elem = self.parse_hint(elem, self_class);
            return self.array_of(elem);
        }
        match name.to_ascii_lowercase().as_str() {
            "" | "mixed" => TypeMask::ANY,
            "int" | "integer" | "long" => TypeMask::LONG,
            "float" | "double" => TypeMask::DOUBLE,
            "number" => TypeMask::NUMBER,
            "string" => TypeMask::STRING,
            "bool" | "boolean" | "true" | "false" => TypeMask::BOOL,
            "array" => self.any_array(),
            "null" | "void" => TypeMask::NULL,
            "callable" | "closure" => TypeMask::CALLABLE | self.class("Closure"),
            "resource" => TypeMask::RESOURCE,
            "object" => TypeMask::OBJECT,
            "iterable" => self.any_array() | TypeMask::OBJECT,
            "self" | "static" | "$this" => match self_class {
                Some(class) => self.class(class),
                None => TypeMask::OBJECT,
            },
            _ => self.class(name),
        }
    }

    /// Human-readable rendering with class names and array element types
    pub fn display(&self, mask: TypeMask) -> String {
        let suffix = if mask.is_ref() { "&" } else { "" };
        if mask.is_any() || mask.is_bottom() {
            return mask.to_string();
        }
        let inner = self.inner.read();
        let mut parts = Vec::new();
        let has_typed_arrays = mask
            .identities()
            .any(|id| matches!(inner.identities.get(id as usize), Some(TypeIdentity::ArrayOf(_))));
        let mut primitives = mask.primitives();
        if has_typed_arrays {
            primitives = primitives.without(TypeMask::ARRAY);
        }
        if !primitives.is_bottom() {
            parts.push(primitives.to_string());
        }
        for id in mask.identities() {
            match inner.identities.get(id as usize) {
                Some(TypeIdentity::Class(name)) => parts.push(name.clone()),
                Some(TypeIdentity::ArrayOf(elem)) if elem.is_any() => parts.push("array".to_string()),
                Some(TypeIdentity::ArrayOf(elem)) => parts.push(format!("array<{elem}>")),
                None => parts.push(format!("#{id}")),
            }
        }
        format!("{}{}", parts.join("|"), suffix)
    }
}
