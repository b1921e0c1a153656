//! Library functions known by name
//!
//! Calls that resolve to no routine of the program are looked up here
//! before being reported as unresolved.

use crate::dataflow::mask::TypeMask;
use crate::dataflow::type_table::TypeTable;

/// `is_*` predicates that narrow their argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TypeCheck {
    Null,
    Int,
    Float,
    String,
    Bool,
    Array,
    Object,
    Callable,
    Numeric,
}

impl TypeCheck {
    pub(super) fn from_name(name: &str) -> Option<Self> {
        let check = match name.trim_start_matches('\\').to_ascii_lowercase().as_str() {
            "is_null" => TypeCheck::Null,
            "is_int" | "is_integer" | "is_long" => TypeCheck::Int,
            "is_float" | "is_double" => TypeCheck::Float,
            "is_string" => TypeCheck::String,
            "is_bool" => TypeCheck::Bool,
            "is_array" => TypeCheck::Array,
            "is_object" => TypeCheck::Object,
            "is_callable" => TypeCheck::Callable,
            "is_numeric" => TypeCheck::Numeric,
            _ => return None,
        };
        Some(check)
    }

    /// Types of `current` for which the check can hold
    fn accepted(self, table: &TypeTable, current: TypeMask) -> TypeMask {
        match self {
            TypeCheck::Null => TypeMask::NULL,
            TypeCheck::Int => TypeMask::LONG,
            TypeCheck::Float => TypeMask::DOUBLE,
            TypeCheck::String => TypeMask::STRING,
            TypeCheck::Bool => TypeMask::BOOL,
            TypeCheck::Array => TypeMask::ARRAY | table.array_part(current),
            TypeCheck::Object => TypeMask::OBJECT | table.class_part(current),
            // strings and arrays can name functions and methods
            TypeCheck::Callable => {
                TypeMask::CALLABLE
                    | TypeMask::STRING
                    | TypeMask::OBJECT
                    | table.array_part(current)
                    | table.class_part(current)
            }
            TypeCheck::Numeric => TypeMask::NUMBER | TypeMask::STRING,
        }
    }

    fn fallback(self, table: &TypeTable) -> TypeMask {
        match self {
            TypeCheck::Null => TypeMask::NULL,
            TypeCheck::Int => TypeMask::LONG,
            TypeCheck::Float => TypeMask::DOUBLE,
            TypeCheck::String => TypeMask::STRING,
            TypeCheck::Bool => TypeMask::BOOL,
            TypeCheck::Array => table.any_array(),
            TypeCheck::Object => TypeMask::OBJECT,
            TypeCheck::Callable => TypeMask::CALLABLE,
            TypeCheck::Numeric => TypeMask::NUMBER,
        }
    }

    /// A failed check rules the accepted types out
    fn is_exact(self) -> bool {
        !matches!(self, TypeCheck::Callable | TypeCheck::Numeric)
    }

    /// Mask of the argument on the path where the check `holds` (or not)
    pub(super) fn narrow(self, table: &TypeTable, current: TypeMask, holds: bool) -> TypeMask {
        let current = current.types();
        let accepted = self.accepted(table, current);
        if holds {
            let both = current & accepted;
            if both.is_bottom() {
                self.fallback(table)
            } else {
                both
            }
        } else if self.is_exact() {
            current.without(accepted)
        } else {
            current
        }
    }
}

/// Return type of a known library function
pub(super) fn return_type(table: &TypeTable, name: &str) -> Option<TypeMask> {
    let name = name.trim_start_matches('\\').to_ascii_lowercase();
    if TypeCheck::from_name(&name).is_some() {
        return Some(TypeMask::BOOL);
    }
    let mask = match name.as_str() {
        "strlen" | "count" | "sizeof" | "intval" | "ord" | "time" | "extract" => TypeMask::LONG,
        "floatval" | "sqrt" | "pi" => TypeMask::DOUBLE,
        "strval" | "implode" | "join" | "sprintf" | "str_repeat" | "strtolower" | "strtoupper" | "trim"
        | "chr" => TypeMask::STRING,
        "boolval" | "in_array" | "array_key_exists" | "function_exists" | "class_exists" | "is_iterable" => {
            TypeMask::BOOL
        }
        "array_keys" | "array_values" | "array_merge" | "explode" | "compact" | "get_defined_vars" => {
            table.any_array()
        }
        "parse_str" | "var_dump" => TypeMask::NULL,
        _ => return None,
    };
    Some(mask)
}

/// Calls that may create or overwrite arbitrary local variables
pub(super) fn writes_scope(name: &str, arg_count: usize) -> bool {
    match name.trim_start_matches('\\').to_ascii_lowercase().as_str() {
        "extract" => true,
        "parse_str" => arg_count == 1,
        _ => false,
    }
}
