//! Result types of operators, casts and literals
//!
//! Integer arithmetic widens to `int|float` because any operation may
//! overflow; it only stays `int` when both operands are literals and the
//! computation is checked not to overflow.

use super::mask::TypeMask;
use super::type_table::TypeTable;
use crate::hir::{BinOp, CastKind, IncDecKind, Literal, UnaryOp};

pub fn literal(lit: &Literal) -> TypeMask {
    match lit {
        Literal::Int(_) => TypeMask::LONG,
        Literal::Float(_) => TypeMask::DOUBLE,
        Literal::String(_) => TypeMask::STRING,
        Literal::Bool(_) => TypeMask::BOOL,
        Literal::Null => TypeMask::NULL,
    }
}

/// Result of `left op right`. `constants` carries both operands when they
/// are integer literals.
pub fn binary(
    table: &TypeTable,
    op: BinOp,
    left: TypeMask,
    right: TypeMask,
    constants: Option<(i64, i64)>,
) -> TypeMask {
    let (left, right) = (left.types(), right.types());
    match op {
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Pow => {
            let mut result = TypeMask::BOTTOM;
            let arrays_only = op == BinOp::Add && is_array_only(table, left) && is_array_only(table, right);
            if op == BinOp::Add && left.may_be_array() && right.may_be_array() {
                // array union
                result |= table.array_part(left) | table.array_part(right);
            }
            if !arrays_only {
                result |= arithmetic(op, left, right, constants);
            }
            result
        }
        BinOp::Div => {
            if let Some((a, b)) = constants {
                return match a.checked_rem(b) {
                    Some(0) => TypeMask::LONG,
                    _ => TypeMask::DOUBLE,
                };
            }
            if left.is_float_only() || right.is_float_only() {
                TypeMask::DOUBLE
            } else {
                TypeMask::NUMBER
            }
        }
        BinOp::Mod | BinOp::Shl | BinOp::Shr | BinOp::Spaceship => TypeMask::LONG,
        BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
            if left.is_string_only() && right.is_string_only() {
                TypeMask::STRING
            } else {
                TypeMask::LONG
            }
        }
        BinOp::Concat => TypeMask::STRING,
        BinOp::Coalesce => left.without_null() | right,
        BinOp::And
        | BinOp::Or
        | BinOp::Xor
        | BinOp::Eq
        | BinOp::NotEq
        | BinOp::Identical
        | BinOp::NotIdentical
        | BinOp::Lt
        | BinOp::LtEq
        | BinOp::Gt
        | BinOp::GtEq => TypeMask::BOOL,
    }
}

fn is_array_only(table: &TypeTable, mask: TypeMask) -> bool {
    !mask.is_bottom() && table.array_part(mask) == mask.types()
}

fn arithmetic(op: BinOp, left: TypeMask, right: TypeMask, constants: Option<(i64, i64)>) -> TypeMask {
    if let Some((a, b)) = constants {
        let exact = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Pow => u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp)),
            _ => None,
        };
        return if exact.is_some() {
            TypeMask::LONG
        } else {
            TypeMask::DOUBLE
        };
    }
    if left.is_float_only() || right.is_float_only() {
        TypeMask::DOUBLE
    } else {
        TypeMask::NUMBER
    }
}

pub fn unary(op: UnaryOp, operand: TypeMask, is_literal: bool) -> TypeMask {
    let operand = operand.types();
    match op {
        UnaryOp::Not => TypeMask::BOOL,
        UnaryOp::Silence => operand,
        UnaryOp::BitNot => {
            if operand.is_string_only() {
                TypeMask::STRING
            } else {
                TypeMask::LONG
            }
        }
        UnaryOp::Plus | UnaryOp::Neg => {
            if operand.is_float_only() {
                TypeMask::DOUBLE
            } else if operand.is_integer_only() && (op == UnaryOp::Plus || is_literal) {
                TypeMask::LONG
            } else {
                // -PHP_INT_MIN and numeric strings
                TypeMask::NUMBER
            }
        }
    }
}

/// Value after `++`/`--`. `below_max` holds when the variable is known to be
/// strictly less than `PHP_INT_MAX`.
pub fn inc_dec(kind: IncDecKind, operand: TypeMask, below_max: bool) -> TypeMask {
    let operand = operand.types();
    if operand.is_any() {
        return TypeMask::ANY;
    }
    let increment = kind.is_increment();
    let mut result = operand.without(TypeMask::LONG | TypeMask::NULL | TypeMask::STRING);
    if operand.intersects(TypeMask::LONG) {
        result |= if increment && below_max {
            TypeMask::LONG
        } else {
            TypeMask::NUMBER
        };
    }
    if operand.includes_null() {
        // null++ is 1, null-- stays null
        result |= if increment { TypeMask::LONG } else { TypeMask::NULL };
    }
    if operand.may_be_string() {
        result |= TypeMask::STRING | TypeMask::NUMBER;
    }
    result
}

pub fn cast(table: &TypeTable, kind: CastKind, operand: TypeMask) -> TypeMask {
    let operand = operand.types();
    match kind {
        CastKind::Int => TypeMask::LONG,
        CastKind::Float => TypeMask::DOUBLE,
        CastKind::String => TypeMask::STRING,
        CastKind::Bool => TypeMask::BOOL,
        CastKind::Unset => TypeMask::NULL,
        CastKind::Array => {
            if is_array_only(table, operand) {
                operand
            } else {
                table.any_array()
            }
        }
        CastKind::Object => {
            let objects = table.object_mask(operand);
            if !objects.is_bottom() && objects == operand {
                operand
            } else {
                table.class("stdClass")
            }
        }
    }
}

/// Type of a predefined constant
pub fn constant(name: &str) -> Option<TypeMask> {
    match name.to_ascii_lowercase().as_str() {
        "true" | "false" => return Some(TypeMask::BOOL),
        "null" => return Some(TypeMask::NULL),
        _ => {}
    }
    let mask = match name.trim_start_matches('\\') {
        "PHP_INT_MAX" | "PHP_INT_MIN" | "PHP_INT_SIZE" | "PHP_MAJOR_VERSION" | "PHP_MINOR_VERSION"
        | "E_ALL" | "E_ERROR" | "E_WARNING" | "E_NOTICE" | "E_STRICT" | "E_DEPRECATED" => TypeMask::LONG,
        "PHP_EOL" | "PHP_VERSION" | "PHP_OS" | "PHP_OS_FAMILY" | "DIRECTORY_SEPARATOR" | "PATH_SEPARATOR" => {
            TypeMask::STRING
        }
        "M_PI" | "M_E" | "PHP_FLOAT_EPSILON" | "PHP_FLOAT_MAX" | "PHP_FLOAT_MIN" | "NAN" | "INF" => {
            TypeMask::DOUBLE
        }
        _ => return None,
    };
    Some(mask)
}
