//! Unreachable code detection
//!
//! A one-shot sweep from the entry block that refuses to follow the
//! branch a constant condition rules out. Folding is best effort: a
//! condition it cannot evaluate keeps both branches alive, so dead code
//! may go unreported but live code is never flagged.

use super::cfg::{BlockId, Cfg, Edge};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::hir::{BinOp, HirExpr, Literal, Span, UnaryOp};
use crate::program::RoutineId;
use std::collections::BTreeSet;
use tracing::debug;

/// Blocks control can reach from the entry, in discovery order
pub fn reachable_blocks(cfg: &Cfg) -> Vec<BlockId> {
    let color = cfg.new_color();
    let mut reached = Vec::new();
    let mut stack = vec![cfg.entry];
    while let Some(id) = stack.pop() {
        let Some(block) = cfg.block(id) else {
            continue;
        };
        if !block.tag(color) {
            continue;
        }
        reached.push(id);
        let targets = match &block.edge {
            Some(Edge::Conditional {
                condition,
                true_target,
                false_target,
            }) => match constant_truth(condition) {
                Some(true) => vec![*true_target],
                Some(false) => vec![*false_target],
                None => vec![*true_target, *false_target],
            },
            Some(edge) => edge.targets(),
            None => Vec::new(),
        };
        // reversed so the first target is explored first
        stack.extend(targets.into_iter().rev());
    }
    reached
}

/// One `UnreachableCode` diagnostic per dead region that holds a real
/// statement
pub fn unreachable_code(routine: RoutineId, cfg: &Cfg) -> Vec<Diagnostic> {
    let reachable: BTreeSet<BlockId> = reachable_blocks(cfg).into_iter().collect();
    let dead: BTreeSet<BlockId> = cfg
        .blocks()
        .map(|block| block.id)
        .filter(|id| !reachable.contains(id))
        .collect();
    if dead.is_empty() {
        return Vec::new();
    }

    // a region starts at a dead block no other dead block jumps to
    let mut roots: Vec<BlockId> = dead
        .iter()
        .copied()
        .filter(|&id| cfg.predecessors(id).iter().all(|pred| !dead.contains(pred)))
        .collect();
    let rest: Vec<BlockId> = dead.iter().copied().filter(|id| !roots.contains(id)).collect();
    roots.extend(rest);

    let color = cfg.new_color();
    let mut diagnostics = Vec::new();
    for root in roots {
        if cfg.block(root).is_some_and(|block| block.has_color(color)) {
            continue;
        }
        if let Some(span) = first_span_in_region(cfg, root, &dead, color) {
            diagnostics.push(Diagnostic::new(routine, Some(span), DiagnosticKind::UnreachableCode));
        }
    }
    debug!(%routine, dead = dead.len(), reported = diagnostics.len(), "reachability");
    diagnostics
}

/// Color the dead region below `root` and return its first positioned
/// statement, following edges when the root has none
fn first_span_in_region(cfg: &Cfg, root: BlockId, dead: &BTreeSet<BlockId>, color: u32) -> Option<Span> {
    let mut found = None;
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        let Some(block) = cfg.block(id) else {
            continue;
        };
        if !dead.contains(&id) || !block.tag(color) {
            continue;
        }
        if found.is_none() {
            found = block.first_span();
        }
        stack.extend(block.successors().into_iter().rev());
    }
    found
}

/// Truth value of a condition when it is a compile-time constant
pub fn constant_truth(expr: &HirExpr) -> Option<bool> {
    match expr {
        HirExpr::Literal(literal) => Some(literal_truth(literal)),
        HirExpr::Constant(name) => match name.to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" | "null" => Some(false),
            _ => None,
        },
        HirExpr::Unary {
            op: UnaryOp::Not,
            operand,
        } => constant_truth(operand).map(|value| !value),
        HirExpr::Binary { op, left, right } => match op {
            BinOp::And => match (constant_truth(left), constant_truth(right)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            BinOp::Or => match (constant_truth(left), constant_truth(right)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            _ => compare_literals(*op, left, right),
        },
        _ => None,
    }
}

fn literal_truth(literal: &Literal) -> bool {
    match literal {
        Literal::Bool(value) => *value,
        Literal::Int(value) => *value != 0,
        Literal::Float(value) => *value != 0.0,
        Literal::String(value) => !(value.is_empty() || value == "0"),
        Literal::Null => false,
    }
}

/// Comparisons between literals of the same kind
fn compare_literals(op: BinOp, left: &HirExpr, right: &HirExpr) -> Option<bool> {
    let (HirExpr::Literal(left), HirExpr::Literal(right)) = (left, right) else {
        return None;
    };
    let ordering = match (left, right) {
        (Literal::Int(a), Literal::Int(b)) => a.cmp(b),
        (Literal::String(a), Literal::String(b)) if matches!(op, BinOp::Identical | BinOp::NotIdentical) => a.cmp(b),
        (Literal::Bool(a), Literal::Bool(b)) => a.cmp(b),
        (Literal::Null, Literal::Null) => std::cmp::Ordering::Equal,
        _ => return None,
    };
    match op {
        BinOp::Identical | BinOp::Eq => Some(ordering.is_eq()),
        BinOp::NotIdentical | BinOp::NotEq => Some(ordering.is_ne()),
        BinOp::Lt => Some(ordering.is_lt()),
        BinOp::LtEq => Some(ordering.is_le()),
        BinOp::Gt => Some(ordering.is_gt()),
        BinOp::GtEq => Some(ordering.is_ge()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::cfg::CfgBuilder;
    use crate::hir::{HirStmt, StmtKind};

    fn spans(diagnostics: &[Diagnostic]) -> Vec<Span> {
        diagnostics.iter().filter_map(|d| d.span).collect()
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(constant_truth(&HirExpr::bool(true)), Some(true));
        assert_eq!(constant_truth(&HirExpr::not(HirExpr::int(0))), Some(true));
        assert_eq!(constant_truth(&HirExpr::string("0")), Some(false));
        assert_eq!(constant_truth(&HirExpr::Constant("FALSE".to_string())), Some(false));
        let and = HirExpr::binary(BinOp::And, HirExpr::var("x"), HirExpr::bool(false));
        assert_eq!(constant_truth(&and), Some(false));
        let or = HirExpr::binary(BinOp::Or, HirExpr::var("x"), HirExpr::bool(false));
        assert_eq!(constant_truth(&or), None);
        let lt = HirExpr::binary(BinOp::Lt, HirExpr::int(1), HirExpr::int(2));
        assert_eq!(constant_truth(&lt), Some(true));
        let loose = HirExpr::binary(BinOp::Eq, HirExpr::string("1"), HirExpr::string("01"));
        assert_eq!(constant_truth(&loose), None);
    }

    #[test]
    fn test_if_true_flags_else_branch_only() {
        let cfg = CfgBuilder::new().build(&[HirStmt::if_else(
            HirExpr::bool(true),
            vec![HirStmt::echo(HirExpr::string("a")).at(2, 5)],
            Some(vec![HirStmt::echo(HirExpr::string("b")).at(4, 5)]),
        )
        .at(1, 1)]);
        let diagnostics = unreachable_code(RoutineId(0), &cfg);
        assert_eq!(spans(&diagnostics), vec![Span::new(4, 5)]);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::UnreachableCode);
    }

    #[test]
    fn test_unknown_condition_keeps_both_branches() {
        let cfg = CfgBuilder::new().build(&[HirStmt::if_else(
            HirExpr::var("flag"),
            vec![HirStmt::echo(HirExpr::string("a")).at(2, 5)],
            Some(vec![HirStmt::echo(HirExpr::string("b")).at(4, 5)]),
        )]);
        assert!(unreachable_code(RoutineId(0), &cfg).is_empty());
    }

    #[test]
    fn test_code_after_return_reported_once() {
        let cfg = CfgBuilder::new().build(&[
            HirStmt::ret(Some(HirExpr::int(1))).at(1, 1),
            HirStmt::echo(HirExpr::string("x")).at(2, 1),
            HirStmt::if_else(
                HirExpr::var("y"),
                vec![HirStmt::echo(HirExpr::string("z")).at(4, 1)],
                None,
            ),
        ]);
        let diagnostics = unreachable_code(RoutineId(3), &cfg);
        assert_eq!(spans(&diagnostics), vec![Span::new(2, 1)]);
        assert_eq!(diagnostics[0].routine, RoutineId(3));
    }

    #[test]
    fn test_trailing_return_is_not_reported() {
        let cfg = CfgBuilder::new().build(&[HirStmt::ret(None).at(1, 1)]);
        assert!(unreachable_code(RoutineId(0), &cfg).is_empty());
    }

    #[test]
    fn test_infinite_loop_without_break() {
        let cfg = CfgBuilder::new().build(&[
            HirStmt::while_loop(HirExpr::bool(true), vec![HirStmt::echo(HirExpr::int(1)).at(2, 5)]),
            HirStmt::echo(HirExpr::string("after")).at(4, 1),
        ]);
        assert_eq!(spans(&unreachable_code(RoutineId(0), &cfg)), vec![Span::new(4, 1)]);

        let with_break = CfgBuilder::new().build(&[
            HirStmt::while_loop(HirExpr::bool(true), vec![StmtKind::Break.at(2, 5)]),
            HirStmt::echo(HirExpr::string("after")).at(4, 1),
        ]);
        assert!(unreachable_code(RoutineId(0), &with_break).is_empty());
    }
}
