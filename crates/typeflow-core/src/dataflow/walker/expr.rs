//! Expression transfer: reads, writes and calls

use super::builtins;
use super::conditions::Branch;
use super::Walker;
use crate::dataflow::mask::TypeMask;
use crate::dataflow::operators;
use crate::diagnostics::DiagnosticKind;
use crate::error::Result;
use crate::hir::{
    Argument, ArrayItem, BinOp, CallKind, HirExpr, IncDecKind, LambdaUse, ListItem, Literal, PseudoConst, VarName,
};
use crate::interprocedural::CallSite;
use crate::program::{CallTarget, DocTarget, Resolution, Routine, RoutineId};
use tracing::trace;

const SUPERGLOBALS: [&str; 9] = [
    "GLOBALS", "_SERVER", "_GET", "_POST", "_FILES", "_COOKIE", "_SESSION", "_REQUEST", "_ENV",
];

fn is_superglobal(name: &str) -> bool {
    SUPERGLOBALS.contains(&name)
}

/// Expressions that denote storage and can be bound by reference
fn is_reference_target(expr: &HirExpr) -> bool {
    matches!(expr, HirExpr::Var(_) | HirExpr::Index { .. } | HirExpr::Field { .. })
}

impl<'a> Walker<'a> {
    /// Type of `expr`, updating the current state with its effects
    pub(crate) fn visit_expr(&mut self, expr: &HirExpr) -> Result<TypeMask> {
        match expr {
            HirExpr::Literal(literal) => Ok(operators::literal(literal)),
            HirExpr::Var(name) => self.read_var(name, false),
            HirExpr::Assign {
                target,
                value,
                by_ref: false,
            } => {
                let mask = self.visit_expr(value)?.types();
                self.assign_to(target, mask)?;
                Ok(mask)
            }
            HirExpr::Assign {
                target,
                value,
                by_ref: true,
            } => {
                let mask = self.bind_alias(value)?;
                self.assign_to(target, mask)?;
                self.mark_alias_of(target);
                Ok(mask)
            }
            HirExpr::CompoundAssign { op, target, value } => self.compound_assign(*op, target, value),
            HirExpr::IncDec { kind, target } => self.inc_dec(*kind, target),
            HirExpr::Binary { op, left, right } => self.visit_binary(*op, left, right),
            HirExpr::Unary { op, operand } => {
                let is_literal = matches!(**operand, HirExpr::Literal(_));
                let mask = self.visit_expr(operand)?;
                Ok(operators::unary(*op, mask, is_literal))
            }
            HirExpr::Cast { kind, expr } => {
                let mask = self.visit_expr(expr)?;
                Ok(operators::cast(self.types(), *kind, mask))
            }
            HirExpr::Field { object, name } => {
                let object = self.visit_expr(object)?;
                Ok(self.field_type(object, name))
            }
            HirExpr::Index { base, index } => {
                let base = self.visit_expr(base)?;
                match index {
                    Some(index) => {
                        self.visit_expr(index)?;
                        Ok(self.types().index_type(base))
                    }
                    None => Ok(TypeMask::ANY),
                }
            }
            HirExpr::Call { kind, args } => self.visit_call(kind, args),
            HirExpr::Isset(vars) => {
                for var in vars {
                    self.visit_quiet(var)?;
                }
                Ok(TypeMask::BOOL)
            }
            HirExpr::Empty(expr) => {
                self.visit_quiet(expr)?;
                Ok(TypeMask::BOOL)
            }
            HirExpr::List(items) => {
                for item in items.iter().flatten() {
                    if let Some(key) = &item.key {
                        self.visit_expr(key)?;
                    }
                    self.visit_quiet(&item.target)?;
                }
                Ok(self.types().any_array())
            }
            HirExpr::Array(items) => self.visit_array(items),
            HirExpr::Include(path) => {
                self.visit_expr(path)?;
                self.state.set_all_unknown(self.ctx);
                self.state.widen_aliases(self.ctx)?;
                Ok(TypeMask::ANY)
            }
            HirExpr::Lambda { uses, .. } => self.visit_lambda(uses),
            HirExpr::PseudoConst(PseudoConst::Line) => Ok(TypeMask::LONG),
            HirExpr::PseudoConst(_) => Ok(TypeMask::STRING),
            HirExpr::Constant(name) => Ok(operators::constant(name)
                .or_else(|| self.scheduler.resolver().constant_type(name))
                .unwrap_or(TypeMask::ANY)),
            HirExpr::InstanceOf { expr, .. } => {
                self.visit_expr(expr)?;
                Ok(TypeMask::BOOL)
            }
            HirExpr::Conditional {
                condition,
                if_true,
                if_false,
            } => self.visit_conditional(condition, if_true.as_deref(), if_false),
        }
    }

    /// Read without reporting undefined variables (`isset`, `??`, `empty`)
    pub(crate) fn visit_quiet(&mut self, expr: &HirExpr) -> Result<TypeMask> {
        match expr {
            HirExpr::Var(name) => self.read_var(name, true),
            HirExpr::Index { base, index } => {
                let base = self.visit_quiet(base)?;
                if let Some(index) = index {
                    self.visit_expr(index)?;
                }
                Ok(self.types().index_type(base))
            }
            HirExpr::Field { object, name } => {
                let object = self.visit_quiet(object)?;
                Ok(self.field_type(object, name))
            }
            other => self.visit_expr(other),
        }
    }

    fn read_var(&mut self, name: &VarName, quiet: bool) -> Result<TypeMask> {
        let name = match name {
            VarName::Direct(name) => name,
            VarName::Indirect(inner) => {
                self.visit_expr(inner)?;
                self.state.set_all_unknown(self.ctx);
                return Ok(TypeMask::ANY);
            }
        };
        if is_superglobal(name) {
            return Ok(self.types().any_array());
        }

        let slot = self.ctx.slot(name);
        self.ctx.mark_used(slot);
        let mask = self.state.get(slot)?;
        if !self.state.is_initialized(slot) && !self.state.is_all_unknown() {
            if !quiet && slot.is_tracked() && self.scheduler.config().report_undefined_variables {
                self.report(DiagnosticKind::UndefinedVariable(name.clone()));
            }
            if mask.is_bottom() {
                return Ok(TypeMask::NULL);
            }
        }
        Ok(mask.types())
    }

    fn field_type(&self, object: TypeMask, field: &str) -> TypeMask {
        let class = self.types().single_class(object);
        self.scheduler
            .resolver()
            .field_type(class.as_deref(), field)
            .unwrap_or(TypeMask::ANY)
    }

    /// Store `mask` into the storage `target` denotes
    pub(crate) fn assign_to(&mut self, target: &HirExpr, mask: TypeMask) -> Result<()> {
        match target {
            HirExpr::Var(VarName::Direct(name)) => {
                if is_superglobal(name) {
                    return Ok(());
                }
                let slot = self.ctx.slot(name);
                self.state.set(self.ctx, slot, mask)
            }
            HirExpr::Var(VarName::Indirect(inner)) => {
                self.visit_expr(inner)?;
                self.state.set_all_unknown(self.ctx);
                Ok(())
            }
            HirExpr::Index { base, index } => {
                if let Some(index) = index {
                    self.visit_expr(index)?;
                }
                let current = self.visit_quiet(base)?;
                let updated = self.types().with_element(current, mask);
                self.assign_to(base, updated)
            }
            HirExpr::Field { object, .. } => {
                self.visit_quiet(object)?;
                Ok(())
            }
            HirExpr::List(items) => self.destructure(items, mask),
            other => {
                self.visit_expr(other)?;
                Ok(())
            }
        }
    }

    fn destructure(&mut self, items: &[Option<ListItem>], source: TypeMask) -> Result<()> {
        let mut element = self.types().element_type(source);
        if element.is_bottom() || source.includes_null() {
            element |= TypeMask::NULL;
        }
        for item in items.iter().flatten() {
            if let Some(key) = &item.key {
                self.visit_expr(key)?;
            }
            if item.by_ref {
                self.assign_to(&item.target, TypeMask::ANY.with_ref())?;
                self.mark_alias_of(&item.target);
            } else {
                self.assign_to(&item.target, element)?;
            }
        }
        Ok(())
    }

    /// Bind `target` by reference: it keeps its value, gains the flag and
    /// becomes an alias slot
    fn bind_alias(&mut self, target: &HirExpr) -> Result<TypeMask> {
        let mut mask = self.visit_quiet(target)?.types();
        if mask.is_bottom() {
            mask = TypeMask::NULL;
        }
        let mask = mask.with_ref();
        if is_reference_target(target) {
            self.assign_to(target, mask)?;
            self.mark_alias_of(target);
        }
        Ok(mask)
    }

    fn mark_alias_of(&self, target: &HirExpr) {
        if let Some(name) = target.as_direct_var().filter(|name| !is_superglobal(name)) {
            self.ctx.mark_alias(self.ctx.slot(name));
        }
    }

    fn compound_assign(&mut self, op: BinOp, target: &HirExpr, value: &HirExpr) -> Result<TypeMask> {
        if op == BinOp::Coalesce {
            let current = self.visit_quiet(target)?;
            let skipped = self.state.clone();
            let value = self.visit_expr(value)?;
            self.state = self.state.merge(&skipped)?;
            let result = operators::binary(self.types(), op, current, value, None);
            self.assign_to(target, result)?;
            return Ok(result);
        }
        let current = self.visit_expr(target)?;
        let value = self.visit_expr(value)?;
        let result = operators::binary(self.types(), op, current, value, None);
        self.assign_to(target, result)?;
        Ok(result)
    }

    fn inc_dec(&mut self, kind: IncDecKind, target: &HirExpr) -> Result<TypeMask> {
        let current = self.visit_expr(target)?;
        let below_max = target
            .as_direct_var()
            .and_then(|name| self.ctx.existing_slot(name))
            .is_some_and(|slot| self.state.has_lt_long_max(slot));
        let updated = operators::inc_dec(kind, current, below_max);
        self.assign_to(target, updated)?;
        Ok(if kind.is_prefix() { updated } else { current })
    }

    fn visit_binary(&mut self, op: BinOp, left: &HirExpr, right: &HirExpr) -> Result<TypeMask> {
        match op {
            BinOp::And | BinOp::Or => {
                let (evaluates, skips) = if op == BinOp::And {
                    (Branch::ToTrue, Branch::ToFalse)
                } else {
                    (Branch::ToFalse, Branch::ToTrue)
                };
                let skipped = self.branch(left, skips)?;
                self.visit_condition(left, evaluates)?;
                self.visit_expr(right)?;
                self.state = self.state.merge(&skipped)?;
                Ok(TypeMask::BOOL)
            }
            BinOp::Coalesce => {
                let left = self.visit_quiet(left)?;
                let skipped = self.state.clone();
                let right = self.visit_expr(right)?;
                self.state = self.state.merge(&skipped)?;
                Ok(operators::binary(self.types(), op, left, right, None))
            }
            _ => {
                let constants = match (left, right) {
                    (HirExpr::Literal(Literal::Int(a)), HirExpr::Literal(Literal::Int(b))) => Some((*a, *b)),
                    _ => None,
                };
                let left = self.visit_expr(left)?;
                let right = self.visit_expr(right)?;
                Ok(operators::binary(self.types(), op, left, right, constants))
            }
        }
    }

    fn visit_conditional(
        &mut self,
        condition: &HirExpr,
        if_true: Option<&HirExpr>,
        if_false: &HirExpr,
    ) -> Result<TypeMask> {
        match if_true {
            Some(if_true) => {
                let on_true = self.branch(condition, Branch::ToTrue)?;
                let on_false = self.branch(condition, Branch::ToFalse)?;
                let (true_mask, after_true) = self.with_state(on_true, |walker| walker.visit_expr(if_true))?;
                self.state = on_false;
                let false_mask = self.visit_expr(if_false)?;
                self.state = self.state.merge(&after_true)?;
                Ok(true_mask | false_mask)
            }
            // `a ?: b`
            None => {
                let value = self.visit_expr(condition)?;
                let skipped = self.state.clone();
                let other = self.visit_expr(if_false)?;
                self.state = self.state.merge(&skipped)?;
                Ok(value | other)
            }
        }
    }

    fn visit_array(&mut self, items: &[ArrayItem]) -> Result<TypeMask> {
        let mut element = TypeMask::BOTTOM;
        for item in items {
            if let Some(key) = &item.key {
                self.visit_expr(key)?;
            }
            let mask = if item.by_ref {
                self.bind_alias(&item.value)?
            } else {
                self.visit_expr(&item.value)?
            };
            element |= mask.types();
        }
        Ok(self.types().array_of(element))
    }

    fn visit_lambda(&mut self, uses: &[LambdaUse]) -> Result<TypeMask> {
        for capture in uses {
            let var = HirExpr::var(&capture.name);
            if capture.by_ref {
                self.bind_alias(&var)?;
            } else {
                self.visit_expr(&var)?;
            }
        }
        Ok(self.types().class("Closure"))
    }

    /// `self`/`static` name the declaring class
    fn class_name(&self, class: &str) -> String {
        let class = class.trim_start_matches('\\');
        match (class.to_ascii_lowercase().as_str(), self.routine.and_then(|r| r.class.as_deref())) {
            ("self" | "static", Some(declaring)) => declaring.to_string(),
            _ => class.to_string(),
        }
    }

    /// Instance mask of a class operand; `self`/`static` outside a class
    /// only tells that the value is some object
    pub(super) fn class_mask(&self, class: &str) -> TypeMask {
        let declaring = self.routine.and_then(|r| r.class.as_deref());
        let bare = class.trim_start_matches('\\');
        if declaring.is_none() && matches!(bare.to_ascii_lowercase().as_str(), "self" | "static") {
            return TypeMask::OBJECT;
        }
        self.types().class(&self.class_name(class))
    }

    fn visit_call(&mut self, kind: &CallKind, args: &[Argument]) -> Result<TypeMask> {
        let table = self.types();
        let program = self.program();
        let scheduler = self.scheduler;
        let resolver = scheduler.resolver();

        let resolution = match kind {
            CallKind::Function { name } => {
                if builtins::writes_scope(name, args.len()) {
                    for arg in args {
                        self.visit_expr(&arg.value)?;
                    }
                    self.state.set_all_unknown(self.ctx);
                    return Ok(builtins::return_type(table, name).unwrap_or(TypeMask::ANY));
                }
                resolver.resolve_call(program, CallTarget::Function(name))
            }
            CallKind::Method { object, name } => {
                let receiver = self.visit_expr(object)?;
                if receiver.types().is_null_only() {
                    self.report(DiagnosticKind::MethodCallOnNull(name.clone()));
                }
                let class = table.single_class(receiver);
                resolver.resolve_call(
                    program,
                    CallTarget::Method {
                        class: class.as_deref(),
                        name,
                    },
                )
            }
            CallKind::Static { class, name } => {
                let class = self.class_name(class);
                resolver.resolve_call(program, CallTarget::Static { class: &class, name })
            }
            CallKind::New { class } => {
                let class = self.class_name(class);
                resolver.resolve_call(program, CallTarget::Constructor(&class))
            }
        };

        let callee = match resolution {
            Resolution::Routine(id) => program.routine(id),
            Resolution::Ambiguous | Resolution::Unresolved => None,
        };
        self.visit_arguments(callee, args)?;
        // the callee may write through any reference it can reach
        self.state.widen_aliases(self.ctx)?;

        if let CallKind::New { class } = kind {
            return Ok(table.class(&self.class_name(class)));
        }
        let result = match (resolution, callee) {
            (Resolution::Routine(id), Some(routine)) if routine.is_analyzable() => self.callee_return(id),
            (Resolution::Routine(_), Some(routine)) => self.declared_return(routine),
            (Resolution::Unresolved, _) => self.unresolved_return(kind),
            _ => TypeMask::ANY,
        };
        Ok(result)
    }

    fn visit_arguments(&mut self, callee: Option<&Routine>, args: &[Argument]) -> Result<()> {
        for (position, arg) in args.iter().enumerate() {
            let by_ref = callee
                .and_then(|routine| routine.param_for_argument(position))
                .is_some_and(|param| param.by_ref);
            if by_ref && !arg.unpack && is_reference_target(&arg.value) {
                self.visit_quiet(&arg.value)?;
                self.assign_to(&arg.value, TypeMask::ANY.with_ref())?;
                self.mark_alias_of(&arg.value);
            } else {
                self.visit_expr(&arg.value)?;
            }
        }
        Ok(())
    }

    /// Subscribe to an analyzed callee and read what it published so far
    fn callee_return(&mut self, callee: RoutineId) -> TypeMask {
        let scheduler = self.scheduler;
        let Some(block) = self.site else {
            return scheduler.call_graph().published(callee).unwrap_or(TypeMask::ANY);
        };
        let site = CallSite {
            block,
            ordinal: self.call_ordinal,
        };
        self.call_ordinal += 1;
        let status = scheduler.enqueue_routine(callee, site);
        let published = scheduler.call_graph().published(callee);
        trace!(%callee, ?status, ?published, "call");
        published.unwrap_or(TypeMask::BOTTOM)
    }

    /// Declared and documented return type of a library routine
    fn declared_return(&self, routine: &Routine) -> TypeMask {
        let table = self.types();
        let self_class = routine.class.as_deref();
        let documented = self.program().doc_hints().get(&routine.name, &DocTarget::Return);
        let mut mask = TypeMask::BOTTOM;
        if !routine.return_hint.is_empty() {
            mask |= table.from_hint(&routine.return_hint, self_class);
        }
        if !documented.is_empty() {
            mask |= table.from_hint(documented, self_class);
        }
        if mask.is_bottom() {
            builtins::return_type(table, &routine.name).unwrap_or(TypeMask::ANY)
        } else {
            mask
        }
    }

    fn unresolved_return(&mut self, kind: &CallKind) -> TypeMask {
        match kind {
            CallKind::Function { name } => match builtins::return_type(self.types(), name) {
                Some(mask) => mask,
                None => {
                    self.report(DiagnosticKind::UnresolvedCall(kind.display_name()));
                    TypeMask::ANY
                }
            },
            CallKind::Static { .. } => {
                self.report(DiagnosticKind::UnresolvedCall(kind.display_name()));
                TypeMask::ANY
            }
            // the receiver's class may come from outside the program
            CallKind::Method { .. } | CallKind::New { .. } => TypeMask::ANY,
        }
    }
}
