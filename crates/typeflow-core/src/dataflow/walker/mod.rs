//! Transfer functions of the flow analysis
//!
//! A [`Walker`] owns a clone of a block's entry state, visits the block's
//! statements in order and finally computes one outgoing state per edge
//! target. Everything it learns about variables is written to the clone;
//! the scheduler merges the outgoing states into the successors.

mod builtins;
mod conditions;
mod expr;

use conditions::Branch;

use super::cfg::{BasicBlock, BlockId, BlockKey, CatchArm, CfgStmtKind, Edge};
use super::context::{FlowContext, VariableHandle};
use super::mask::TypeMask;
use super::state::FlowState;
use super::type_table::TypeTable;
use super::worklist::Scheduler;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::error::Result;
use crate::hir::{HirExpr, Span};
use crate::program::{DocTarget, Program, Routine, RoutineId};
use indexmap::IndexSet;

/// What visiting one block produced
#[derive(Debug)]
pub(crate) struct BlockOutcome {
    /// Outgoing state per edge target
    pub edges: Vec<(BlockId, FlowState)>,
    /// The aggregated return type grew
    pub return_changed: bool,
    /// Successors to revisit even if their entry state did not change
    pub requeue: Vec<BlockId>,
    pub diagnostics: Vec<Diagnostic>,
}

pub(crate) struct Walker<'a> {
    scheduler: &'a Scheduler,
    ctx: &'a FlowContext,
    /// Block being walked, `None` for expressions outside any routine
    site: Option<BlockKey>,
    routine: Option<&'a Routine>,
    state: FlowState,
    diagnostics: IndexSet<Diagnostic>,
    span: Option<Span>,
    call_ordinal: u32,
    return_changed: bool,
    requeue: Vec<BlockId>,
}

impl<'a> Walker<'a> {
    pub(crate) fn new(scheduler: &'a Scheduler, key: BlockKey, ctx: &'a FlowContext, state: FlowState) -> Self {
        let program: &'a Program = scheduler.program();
        Self {
            scheduler,
            ctx,
            site: Some(key),
            routine: program.routine(key.routine),
            state,
            diagnostics: IndexSet::new(),
            span: None,
            call_ordinal: 0,
            return_changed: false,
            requeue: Vec::new(),
        }
    }

    /// Walker for expressions evaluated outside any routine, such as
    /// parameter defaults
    pub(crate) fn standalone(scheduler: &'a Scheduler, ctx: &'a FlowContext) -> Self {
        Self {
            scheduler,
            ctx,
            site: None,
            routine: None,
            state: FlowState::new(ctx),
            diagnostics: IndexSet::new(),
            span: None,
            call_ordinal: 0,
            return_changed: false,
            requeue: Vec::new(),
        }
    }

    fn types(&self) -> &'a TypeTable {
        let scheduler: &'a Scheduler = self.scheduler;
        scheduler.types()
    }

    fn program(&self) -> &'a Program {
        let scheduler: &'a Scheduler = self.scheduler;
        scheduler.program()
    }

    fn owner(&self) -> RoutineId {
        self.ctx.owner()
    }

    fn report(&mut self, kind: DiagnosticKind) {
        if self.site.is_none() {
            return;
        }
        self.diagnostics.insert(Diagnostic::new(self.owner(), self.span, kind));
    }

    /// Run `f` against `state` instead of the current one and hand back
    /// what `f` left behind
    fn with_state<T>(
        &mut self,
        state: FlowState,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<(T, FlowState)> {
        let saved = std::mem::replace(&mut self.state, state);
        let result = f(self);
        let after = std::mem::replace(&mut self.state, saved);
        Ok((result?, after))
    }

    pub(crate) fn walk_block(mut self, block: &BasicBlock) -> Result<BlockOutcome> {
        for stmt in &block.stmts {
            self.span = stmt.span;
            self.visit_stmt(&stmt.kind)?;
        }
        self.span = block.first_span();
        let edges = match &block.edge {
            Some(edge) => self.visit_edge(block.id, edge)?,
            None => Vec::new(),
        };
        Ok(BlockOutcome {
            edges,
            return_changed: self.return_changed,
            requeue: self.requeue,
            diagnostics: self.diagnostics.into_iter().collect(),
        })
    }

    fn visit_stmt(&mut self, stmt: &CfgStmtKind) -> Result<()> {
        match stmt {
            CfgStmtKind::Expr(expr) | CfgStmtKind::Throw(expr) => {
                self.visit_expr(expr)?;
            }
            CfgStmtKind::Echo(exprs) => {
                for expr in exprs {
                    self.visit_expr(expr)?;
                }
            }
            CfgStmtKind::Return(value) => {
                let mask = match value {
                    Some(expr) => self.visit_expr(expr)?,
                    None => TypeMask::NULL,
                };
                if self.site.is_some() && self.ctx.fold_return(mask.types()) {
                    self.return_changed = true;
                }
            }
            CfgStmtKind::Unset(targets) => {
                for target in targets {
                    self.unset(target)?;
                }
            }
            CfgStmtKind::Global(names) => {
                for name in names {
                    self.bind_external(name)?;
                }
            }
            CfgStmtKind::Static(vars) => {
                for (name, initializer) in vars {
                    if let Some(init) = initializer {
                        self.visit_expr(init)?;
                    }
                    self.bind_external(name)?;
                }
            }
        }
        Ok(())
    }

    /// `global $x` / `static $x`: storage lives outside this activation
    fn bind_external(&mut self, name: &str) -> Result<()> {
        let slot = self.ctx.slot(name);
        self.state.set(self.ctx, slot, TypeMask::ANY.with_ref())?;
        self.ctx.mark_alias(slot);
        Ok(())
    }

    fn unset(&mut self, target: &HirExpr) -> Result<()> {
        match target {
            HirExpr::Var(_) => match target.as_direct_var() {
                Some(name) => {
                    let slot = self.ctx.slot(name);
                    self.state.unset(slot)?;
                }
                None => {
                    self.visit_expr(target)?;
                }
            },
            HirExpr::Index { base, index } => {
                self.visit_quiet(base)?;
                if let Some(index) = index {
                    self.visit_expr(index)?;
                }
            }
            HirExpr::Field { object, .. } => {
                self.visit_quiet(object)?;
            }
            other => {
                self.visit_expr(other)?;
            }
        }
        Ok(())
    }

    fn visit_edge(&mut self, block: BlockId, edge: &Edge) -> Result<Vec<(BlockId, FlowState)>> {
        match edge {
            Edge::Simple(target) => Ok(vec![(*target, self.state.clone())]),
            Edge::Conditional {
                condition,
                true_target,
                false_target,
            } => {
                let on_true = self.branch(condition, Branch::ToTrue)?;
                let on_false = self.branch(condition, Branch::ToFalse)?;
                Ok(vec![(*true_target, on_true), (*false_target, on_false)])
            }
            Edge::ForeachEnumeree { enumeree, move_next } => {
                let mask = self.visit_expr(enumeree)?;
                if self.ctx.record_enumeree(block, mask.types()) {
                    self.requeue.push(*move_next);
                }
                Ok(vec![(*move_next, self.state.clone())])
            }
            Edge::ForeachMoveNext {
                enumeree_block,
                key,
                value,
                by_ref,
                body,
                end,
            } => {
                let table = self.types();
                let enumerated = self.ctx.enumeree(*enumeree_block).unwrap_or(TypeMask::ANY);
                let exhausted = self.state.clone();

                if let Some(key) = key {
                    let key_mask = if enumerated.is_any() || table.may_be_object(enumerated) {
                        TypeMask::ANY
                    } else {
                        TypeMask::LONG | TypeMask::STRING
                    };
                    self.assign_to(key, key_mask)?;
                }

                let mut element = table.element_type(enumerated);
                if element.is_bottom() {
                    element = TypeMask::ANY;
                }
                if *by_ref {
                    self.assign_to(value, element.with_ref())?;
                    if let Some(name) = value.as_direct_var() {
                        self.ctx.mark_alias(self.ctx.slot(name));
                    }
                } else {
                    self.assign_to(value, element)?;
                }
                Ok(vec![(*body, self.state.clone()), (*end, exhausted)])
            }
            Edge::Switch { value, arms } => {
                self.visit_expr(value)?;
                for arm in arms {
                    if let Some(label) = &arm.label {
                        self.visit_expr(label)?;
                    }
                }
                Ok(arms.iter().map(|arm| (arm.target, self.state.clone())).collect())
            }
            Edge::TryCatch { body, catches, finally } => {
                let mut out = vec![(*body, self.state.clone())];
                // control may leave the guarded body after any statement
                let mut unknown = self.state.clone();
                unknown.set_all_unknown(self.ctx);
                for arm in catches {
                    let (_, state) = self.with_state(unknown.clone(), |walker| walker.bind_exception(arm))?;
                    out.push((arm.target, state));
                }
                if let Some(finally) = finally {
                    out.push((*finally, unknown));
                }
                Ok(out)
            }
        }
    }

    fn bind_exception(&mut self, arm: &CatchArm) -> Result<()> {
        let Some(variable) = &arm.variable else {
            return Ok(());
        };
        let table = self.types();
        let mask = if arm.types.is_empty() {
            TypeMask::OBJECT
        } else {
            arm.types
                .iter()
                .fold(TypeMask::BOTTOM, |acc, name| acc | table.class(name))
        };
        let slot = self.ctx.slot(variable);
        self.state.set(self.ctx, slot, mask)
    }
}

/// Entry state of a routine: parameters, `$this` and closure captures
pub(crate) fn seed_entry(scheduler: &Scheduler, routine: &Routine, ctx: &FlowContext) -> Result<FlowState> {
    let table = scheduler.types();
    let docs = scheduler.program().doc_hints();
    let self_class = routine.class.as_deref();
    let mut state = FlowState::new(ctx);
    let mut aliases: Vec<VariableHandle> = Vec::new();

    for param in &routine.params {
        let documented = docs.get(&routine.name, &DocTarget::Param(param.name.clone()));
        let mut mask = TypeMask::BOTTOM;
        if !param.type_hint.is_empty() {
            mask |= table.from_hint(&param.type_hint, self_class);
        }
        if !documented.is_empty() {
            mask |= table.from_hint(documented, self_class);
        }
        if mask.is_bottom() {
            mask = TypeMask::ANY;
        }
        if let Some(default) = &param.default {
            mask |= default_type(scheduler, default)?;
        }
        if param.variadic {
            mask = table.array_of(mask);
        }

        let slot = ctx.slot(&param.name);
        if param.by_ref {
            mask = mask.with_ref();
            aliases.push(slot);
        }
        state.set(ctx, slot, mask)?;
    }

    if let (Some(class), false) = (self_class, routine.is_static) {
        let this = ctx.slot("this");
        state.set(ctx, this, table.class(class))?;
    }

    for capture in &routine.uses {
        let slot = ctx.slot(&capture.name);
        if capture.by_ref {
            state.set(ctx, slot, TypeMask::ANY.with_ref())?;
            aliases.push(slot);
        } else {
            state.set(ctx, slot, TypeMask::ANY)?;
        }
    }

    // marked last so seeding one alias does not widen the others
    for slot in aliases {
        ctx.mark_alias(slot);
    }
    Ok(state)
}

/// Type of a parameter default, evaluated in a throwaway context
fn default_type(scheduler: &Scheduler, default: &HirExpr) -> Result<TypeMask> {
    let ctx = FlowContext::standalone();
    let mut walker = Walker::standalone(scheduler, &ctx);
    Ok(walker.visit_expr(default)?.types())
}
