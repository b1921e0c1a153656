//! Conditions and branch narrowing
//!
//! A condition is visited once per outgoing branch with the truth value
//! that branch assumes. Guards on plain variables (`!== null`, `isset`,
//! `instanceof`, `is_int`, ...) restrict the variable's mask on that path
//! only; the context aggregate is never narrowed.

use super::builtins::TypeCheck;
use super::Walker;
use crate::dataflow::mask::TypeMask;
use crate::dataflow::operators;
use crate::dataflow::state::FlowState;
use crate::error::Result;
use crate::hir::{BinOp, CallKind, HirExpr, UnaryOp};
use crate::program::{CallTarget, Resolution};

/// Truth value a branch assumes for its condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Branch {
    ToTrue,
    ToFalse,
}

impl Branch {
    pub(crate) fn negate(self) -> Branch {
        match self {
            Branch::ToTrue => Branch::ToFalse,
            Branch::ToFalse => Branch::ToTrue,
        }
    }

    fn holds(self) -> bool {
        self == Branch::ToTrue
    }
}

impl<'a> Walker<'a> {
    /// State on the path where `condition` evaluates like `branch`; the
    /// current state is left as it was
    pub(crate) fn branch(&mut self, condition: &HirExpr, branch: Branch) -> Result<FlowState> {
        let (_, state) = self.with_state(self.state.clone(), |walker| walker.visit_condition(condition, branch))?;
        Ok(state)
    }

    pub(crate) fn visit_condition(&mut self, condition: &HirExpr, branch: Branch) -> Result<()> {
        match condition {
            HirExpr::Unary {
                op: UnaryOp::Not,
                operand,
            } => self.visit_condition(operand, branch.negate()),
            HirExpr::Binary { op: BinOp::And, left, right } => match branch {
                Branch::ToTrue => {
                    self.visit_condition(left, Branch::ToTrue)?;
                    self.visit_condition(right, Branch::ToTrue)
                }
                // (left false) joined with (left true, right false)
                Branch::ToFalse => {
                    let left_false = self.branch(left, Branch::ToFalse)?;
                    self.visit_condition(left, Branch::ToTrue)?;
                    self.visit_condition(right, Branch::ToFalse)?;
                    self.state = self.state.merge(&left_false)?;
                    Ok(())
                }
            },
            HirExpr::Binary { op: BinOp::Or, left, right } => match branch {
                Branch::ToFalse => {
                    self.visit_condition(left, Branch::ToFalse)?;
                    self.visit_condition(right, Branch::ToFalse)
                }
                Branch::ToTrue => {
                    let left_true = self.branch(left, Branch::ToTrue)?;
                    self.visit_condition(left, Branch::ToFalse)?;
                    self.visit_condition(right, Branch::ToTrue)?;
                    self.state = self.state.merge(&left_true)?;
                    Ok(())
                }
            },
            HirExpr::Binary {
                op: op @ (BinOp::Identical | BinOp::NotIdentical | BinOp::Eq | BinOp::NotEq),
                left,
                right,
            } => self.visit_equality(*op, left, right, branch),
            HirExpr::Binary {
                op: op @ (BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq),
                left,
                right,
            } => self.visit_ordering(*op, left, right, branch),
            HirExpr::InstanceOf { expr, class } => {
                self.visit_expr(expr)?;
                let class_mask = self.class_mask(class);
                if branch.holds() {
                    self.narrow_var(expr, |_| class_mask)
                } else if class_mask.identities().next().is_some() {
                    self.narrow_var(expr, |current| current.types().without(class_mask))
                } else {
                    // the generic object bit also covers every other class
                    Ok(())
                }
            }
            HirExpr::Isset(vars) => {
                for var in vars {
                    self.visit_quiet(var)?;
                }
                if branch.holds() {
                    for var in vars {
                        self.narrow_var(var, TypeMask::without_null)?;
                    }
                }
                Ok(())
            }
            HirExpr::Empty(expr) => {
                self.visit_quiet(expr)?;
                if branch.holds() {
                    Ok(())
                } else {
                    self.narrow_var(expr, TypeMask::without_null)
                }
            }
            HirExpr::Var(_) => {
                self.visit_expr(condition)?;
                self.narrow_truthy(condition, branch)
            }
            HirExpr::Assign { target, by_ref: false, .. } => {
                self.visit_expr(condition)?;
                self.narrow_truthy(target, branch)
            }
            HirExpr::Call {
                kind: CallKind::Function { name },
                args,
            } if args.len() == 1 && !args[0].unpack => {
                self.visit_expr(condition)?;
                match self.type_check(name) {
                    Some(check) => {
                        let table = self.types();
                        self.narrow_var(&args[0].value, |current| check.narrow(table, current, branch.holds()))
                    }
                    None => Ok(()),
                }
            }
            other => {
                self.visit_expr(other)?;
                Ok(())
            }
        }
    }

    /// `is_*` check, unless the program defines a function of that name
    fn type_check(&self, name: &str) -> Option<TypeCheck> {
        let check = TypeCheck::from_name(name)?;
        let resolution = self
            .scheduler
            .resolver()
            .resolve_call(self.program(), CallTarget::Function(name));
        match resolution {
            Resolution::Routine(id) => {
                let analyzable = self.program().routine(id).is_some_and(|r| r.is_analyzable());
                (!analyzable).then_some(check)
            }
            Resolution::Ambiguous => None,
            Resolution::Unresolved => Some(check),
        }
    }

    /// `null` is falsy, so a truthy variable cannot hold it
    fn narrow_truthy(&mut self, var: &HirExpr, branch: Branch) -> Result<()> {
        if branch.holds() {
            self.narrow_var(var, TypeMask::without_null)
        } else {
            Ok(())
        }
    }

    fn visit_equality(&mut self, op: BinOp, left: &HirExpr, right: &HirExpr, branch: Branch) -> Result<()> {
        self.visit_expr(left)?;
        self.visit_expr(right)?;

        let strict = matches!(op, BinOp::Identical | BinOp::NotIdentical);
        let equal = matches!(op, BinOp::Identical | BinOp::Eq) == branch.holds();
        let (var, other) = if left.as_direct_var().is_some() {
            (left, right)
        } else {
            (right, left)
        };

        if other.is_null_literal() {
            if !equal {
                return self.narrow_var(var, TypeMask::without_null);
            }
            // loose `== null` also holds for false, 0 and ""
            if strict {
                return self.narrow_var(var, |current| current.types() & TypeMask::NULL);
            }
            return Ok(());
        }

        if strict && equal {
            if let HirExpr::Literal(literal) = other {
                let mask = operators::literal(literal);
                return self.narrow_var(var, |current| current.types() & mask);
            }
        }
        Ok(())
    }

    /// Record that an integer variable is provably below `PHP_INT_MAX`
    fn visit_ordering(&mut self, op: BinOp, left: &HirExpr, right: &HirExpr, branch: Branch) -> Result<()> {
        let left_mask = self.visit_expr(left)?;
        let right_mask = self.visit_expr(right)?;
        if !left_mask.is_integer_only() || !right_mask.is_integer_only() {
            return Ok(());
        }
        let smaller = match (op, branch) {
            (BinOp::Lt, Branch::ToTrue) | (BinOp::GtEq, Branch::ToFalse) => left,
            (BinOp::Gt, Branch::ToTrue) | (BinOp::LtEq, Branch::ToFalse) => right,
            _ => return Ok(()),
        };
        if let Some(slot) = smaller.as_direct_var().and_then(|name| self.ctx.existing_slot(name)) {
            self.state.note_lt_long_max(slot);
        }
        Ok(())
    }

    /// Restrict a plain variable on the current path. Aliased and unset
    /// variables are left alone, as is any narrowing to nothing.
    pub(super) fn narrow_var(&mut self, var: &HirExpr, narrow: impl FnOnce(TypeMask) -> TypeMask) -> Result<()> {
        let Some(slot) = var.as_direct_var().and_then(|name| self.ctx.existing_slot(name)) else {
            return Ok(());
        };
        if !self.state.is_initialized(slot) {
            return Ok(());
        }
        let current = self.state.get(slot)?;
        if current.is_ref() {
            return Ok(());
        }
        let narrowed = narrow(current);
        if narrowed.is_bottom() || narrowed == current {
            return Ok(());
        }
        self.state.narrow(slot, narrowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::dataflow::cfg::BlockKey;
    use crate::dataflow::context::FlowContext;
    use crate::dataflow::type_table::TypeTable;
    use crate::dataflow::worklist::Scheduler;
    use crate::dataflow::BlockId;
    use crate::hir::{HirFunction, HirModule};
    use crate::program::{NameResolver, Program, RoutineId};
    use std::sync::Arc;

    struct Fixture {
        scheduler: Scheduler,
        ctx: FlowContext,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_routine(HirFunction::new("f", vec![], vec![]))
        }

        fn with_routine(routine: HirFunction) -> Self {
            let program = Program::from_module(&HirModule::new(vec![routine]));
            Self {
                scheduler: Scheduler::new(
                    program,
                    Arc::new(TypeTable::new()),
                    Box::new(NameResolver),
                    AnalysisConfig::default().sequential(),
                ),
                ctx: FlowContext::new(RoutineId(0)),
            }
        }

        fn walker(&self, vars: &[(&str, TypeMask)]) -> Walker<'_> {
            let mut state = FlowState::new(&self.ctx);
            for (name, mask) in vars {
                state.set(&self.ctx, self.ctx.slot(name), *mask).unwrap();
            }
            Walker::new(&self.scheduler, BlockKey::new(RoutineId(0), BlockId(0)), &self.ctx, state)
        }

        fn mask(&self, state: &FlowState, name: &str) -> TypeMask {
            state.get(self.ctx.existing_slot(name).unwrap()).unwrap()
        }
    }

    fn not_null(name: &str) -> HirExpr {
        HirExpr::binary(BinOp::NotIdentical, HirExpr::var(name), HirExpr::null())
    }

    #[test]
    fn test_strict_null_narrows_both_branches() {
        let fx = Fixture::new();
        let mut walker = fx.walker(&[("x", TypeMask::LONG | TypeMask::NULL)]);
        let on_true = walker.branch(&not_null("x"), Branch::ToTrue).unwrap();
        let on_false = walker.branch(&not_null("x"), Branch::ToFalse).unwrap();
        assert_eq!(fx.mask(&on_true, "x"), TypeMask::LONG);
        assert_eq!(fx.mask(&on_false, "x"), TypeMask::NULL);
    }

    #[test]
    fn test_loose_null_narrows_only_not_null_branch() {
        let fx = Fixture::new();
        let mixed = TypeMask::BOOL | TypeMask::NULL;
        let mut walker = fx.walker(&[("x", mixed)]);
        let cond = HirExpr::binary(BinOp::Eq, HirExpr::var("x"), HirExpr::null());
        let on_true = walker.branch(&cond, Branch::ToTrue).unwrap();
        let on_false = walker.branch(&cond, Branch::ToFalse).unwrap();
        assert_eq!(fx.mask(&on_true, "x"), mixed);
        assert_eq!(fx.mask(&on_false, "x"), TypeMask::BOOL);
    }

    #[test]
    fn test_short_circuit_false_branch_is_a_join() {
        let fx = Fixture::new();
        let nullable = TypeMask::LONG | TypeMask::NULL;
        let mut walker = fx.walker(&[("a", nullable), ("b", nullable)]);
        let cond = HirExpr::binary(BinOp::And, not_null("a"), not_null("b"));

        let on_false = walker.branch(&cond, Branch::ToFalse).unwrap();
        let a_false = walker.branch(&not_null("a"), Branch::ToFalse).unwrap();
        let a_true_b_false = {
            let (_, state) = walker
                .with_state(walker.state.clone(), |w| {
                    w.visit_condition(&not_null("a"), Branch::ToTrue)?;
                    w.visit_condition(&not_null("b"), Branch::ToFalse)
                })
                .unwrap();
            state
        };
        assert_eq!(on_false, a_false.merge(&a_true_b_false).unwrap());
        assert_eq!(fx.mask(&on_false, "a"), nullable);
        assert_eq!(fx.mask(&on_false, "b"), nullable);

        let on_true = walker.branch(&cond, Branch::ToTrue).unwrap();
        assert_eq!(fx.mask(&on_true, "a"), TypeMask::LONG);
        assert_eq!(fx.mask(&on_true, "b"), TypeMask::LONG);
    }

    #[test]
    fn test_instanceof_and_type_checks() {
        let fx = Fixture::new();
        let table = fx.scheduler.types();
        let foo = table.class("Foo");
        let mut walker = fx.walker(&[("o", foo | TypeMask::NULL), ("v", TypeMask::LONG | TypeMask::STRING)]);

        let is_foo = HirExpr::instance_of(HirExpr::var("o"), "Foo");
        assert_eq!(fx.mask(&walker.branch(&is_foo, Branch::ToTrue).unwrap(), "o"), foo);
        assert_eq!(fx.mask(&walker.branch(&is_foo, Branch::ToFalse).unwrap(), "o"), TypeMask::NULL);

        let is_int = HirExpr::call("is_int", vec![HirExpr::var("v")]);
        assert_eq!(fx.mask(&walker.branch(&is_int, Branch::ToTrue).unwrap(), "v"), TypeMask::LONG);
        assert_eq!(
            fx.mask(&walker.branch(&HirExpr::not(is_int), Branch::ToTrue).unwrap(), "v"),
            TypeMask::STRING
        );
    }

    #[test]
    fn test_instanceof_without_class_identity_keeps_objects() {
        let fx = Fixture::new();
        let table = fx.scheduler.types();
        for i in 0..TypeMask::IDENTITY_CAPACITY {
            table.class(&format!("Filler{i}"));
        }
        assert_eq!(table.class("Foo"), TypeMask::OBJECT);

        let maybe = TypeMask::OBJECT | TypeMask::NULL;
        let mut walker = fx.walker(&[("o", maybe)]);
        let is_foo = HirExpr::instance_of(HirExpr::var("o"), "Foo");
        assert_eq!(fx.mask(&walker.branch(&is_foo, Branch::ToTrue).unwrap(), "o"), TypeMask::OBJECT);
        assert_eq!(fx.mask(&walker.branch(&is_foo, Branch::ToFalse).unwrap(), "o"), maybe);
    }

    #[test]
    fn test_instanceof_self_uses_declaring_class() {
        let fx = Fixture::with_routine(HirFunction::method("Node", "pick", vec![], vec![]));
        let node = fx.scheduler.types().class("Node");
        let other = fx.scheduler.types().class("Leaf");
        let mut walker = fx.walker(&[("o", node | other)]);

        let is_self = HirExpr::instance_of(HirExpr::var("o"), "self");
        assert_eq!(fx.mask(&walker.branch(&is_self, Branch::ToTrue).unwrap(), "o"), node);
        assert_eq!(fx.mask(&walker.branch(&is_self, Branch::ToFalse).unwrap(), "o"), other);
    }

    #[test]
    fn test_instanceof_self_outside_class_does_not_narrow_else() {
        let fx = Fixture::new();
        let foo = fx.scheduler.types().class("Foo");
        let mut walker = fx.walker(&[("o", foo | TypeMask::NULL)]);

        let is_self = HirExpr::instance_of(HirExpr::var("o"), "static");
        assert_eq!(fx.mask(&walker.branch(&is_self, Branch::ToTrue).unwrap(), "o"), TypeMask::OBJECT);
        assert_eq!(
            fx.mask(&walker.branch(&is_self, Branch::ToFalse).unwrap(), "o"),
            foo | TypeMask::NULL
        );
    }

    #[test]
    fn test_isset_and_truthiness() {
        let fx = Fixture::new();
        let nullable = TypeMask::STRING | TypeMask::NULL;
        let mut walker = fx.walker(&[("s", nullable)]);

        let isset = HirExpr::isset(vec![HirExpr::var("s")]);
        assert_eq!(fx.mask(&walker.branch(&isset, Branch::ToTrue).unwrap(), "s"), TypeMask::STRING);
        assert_eq!(fx.mask(&walker.branch(&isset, Branch::ToFalse).unwrap(), "s"), nullable);

        let plain = HirExpr::var("s");
        assert_eq!(fx.mask(&walker.branch(&plain, Branch::ToTrue).unwrap(), "s"), TypeMask::STRING);
    }

    #[test]
    fn test_aliases_are_never_narrowed() {
        let fx = Fixture::new();
        let mut walker = fx.walker(&[("r", (TypeMask::LONG | TypeMask::NULL).with_ref())]);
        let state = walker.branch(&not_null("r"), Branch::ToTrue).unwrap();
        assert_eq!(fx.mask(&state, "r"), (TypeMask::LONG | TypeMask::NULL).with_ref());
    }

    #[test]
    fn test_less_than_records_note() {
        let fx = Fixture::new();
        let mut walker = fx.walker(&[("i", TypeMask::LONG), ("n", TypeMask::LONG)]);
        let cond = HirExpr::binary(BinOp::Lt, HirExpr::var("i"), HirExpr::var("n"));
        let inside = walker.branch(&cond, Branch::ToTrue).unwrap();
        let outside = walker.branch(&cond, Branch::ToFalse).unwrap();
        let i = fx.ctx.existing_slot("i").unwrap();
        assert!(inside.has_lt_long_max(i));
        assert!(!outside.has_lt_long_max(i));
    }
}
