//! Control Flow Graph construction from HIR

use crate::hir::{HirExpr, HirStmt, Span, StmtKind};
use crate::program::RoutineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Unique identifier for a basic block, also its creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const ENTRY: BlockId = BlockId(0);
    pub const EXIT: BlockId = BlockId(1);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A block addressed across the whole program
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockKey {
    pub routine: RoutineId,
    pub block: BlockId,
}

impl BlockKey {
    pub fn new(routine: RoutineId, block: BlockId) -> Self {
        Self { routine, block }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.routine, self.block)
    }
}

/// Straight-line statement inside a block
#[derive(Debug, Clone, PartialEq)]
pub enum CfgStmtKind {
    Expr(HirExpr),
    Echo(Vec<HirExpr>),
    Return(Option<HirExpr>),
    Unset(Vec<HirExpr>),
    Global(Vec<String>),
    Static(Vec<(String, Option<HirExpr>)>),
    Throw(HirExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CfgStmt {
    pub kind: CfgStmtKind,
    /// `None` for statements the builder synthesized
    pub span: Option<Span>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseArm {
    /// `None` for `default:`
    pub label: Option<HirExpr>,
    pub target: BlockId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchArm {
    pub types: Vec<String>,
    pub variable: Option<String>,
    pub target: BlockId,
}

/// How control leaves a block
#[derive(Debug, Clone, PartialEq)]
pub enum Edge {
    Simple(BlockId),
    Conditional {
        condition: HirExpr,
        true_target: BlockId,
        false_target: BlockId,
    },
    /// Evaluates the enumerated expression once before the loop
    ForeachEnumeree {
        enumeree: HirExpr,
        move_next: BlockId,
    },
    /// Loop header: binds key and value, then enters the body or leaves
    ForeachMoveNext {
        enumeree_block: BlockId,
        key: Option<HirExpr>,
        value: HirExpr,
        by_ref: bool,
        body: BlockId,
        end: BlockId,
    },
    Switch {
        value: HirExpr,
        arms: Vec<CaseArm>,
    },
    TryCatch {
        body: BlockId,
        catches: Vec<CatchArm>,
        finally: Option<BlockId>,
    },
}

impl Edge {
    pub fn targets(&self) -> Vec<BlockId> {
        match self {
            Edge::Simple(target) => vec![*target],
            Edge::Conditional {
                true_target,
                false_target,
                ..
            } => vec![*true_target, *false_target],
            Edge::ForeachEnumeree { move_next, .. } => vec![*move_next],
            Edge::ForeachMoveNext { body, end, .. } => vec![*body, *end],
            Edge::Switch { arms, .. } => arms.iter().map(|arm| arm.target).collect(),
            Edge::TryCatch {
                body,
                catches,
                finally,
            } => std::iter::once(*body)
                .chain(catches.iter().map(|c| c.target))
                .chain(finally.iter().copied())
                .collect(),
        }
    }
}

/// A basic block in the CFG
#[derive(Debug)]
pub struct BasicBlock {
    pub id: BlockId,
    pub stmts: Vec<CfgStmt>,
    /// `None` when control never leaves (exit block, after `throw`)
    pub edge: Option<Edge>,
    color: AtomicU32,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            stmts: Vec::new(),
            edge: None,
            color: AtomicU32::new(0),
        }
    }

    /// Mark the block with `color`, returns `false` if it already carried it
    pub fn tag(&self, color: u32) -> bool {
        self.color.swap(color, Ordering::AcqRel) != color
    }

    pub fn has_color(&self, color: u32) -> bool {
        self.color.load(Ordering::Acquire) == color
    }

    pub fn successors(&self) -> Vec<BlockId> {
        self.edge.as_ref().map(Edge::targets).unwrap_or_default()
    }

    /// Position of the first statement that has one
    pub fn first_span(&self) -> Option<Span> {
        self.stmts.iter().find_map(|stmt| stmt.span)
    }
}

/// Control Flow Graph
#[derive(Debug)]
pub struct Cfg {
    blocks: Vec<BasicBlock>,
    pub entry: BlockId,
    pub exit: BlockId,
    next_color: AtomicU32,
}

impl Cfg {
    pub fn new() -> Self {
        let mut cfg = Self {
            blocks: Vec::new(),
            entry: BlockId::ENTRY,
            exit: BlockId::EXIT,
            next_color: AtomicU32::new(0),
        };
        cfg.entry = cfg.new_block();
        cfg.exit = cfg.new_block();
        cfg
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock::new(id));
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id.index())
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn set_edge(&mut self, block: BlockId, edge: Edge) {
        if let Some(b) = self.blocks.get_mut(block.index()) {
            b.edge = Some(edge);
        }
    }

    pub fn add_stmt(&mut self, block: BlockId, stmt: CfgStmt) {
        if let Some(b) = self.blocks.get_mut(block.index()) {
            b.stmts.push(stmt);
        }
    }

    /// Fresh color for a traversal, distinct from every earlier one
    pub fn new_color(&self) -> u32 {
        self.next_color.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter()
            .filter(|b| b.successors().contains(&id))
            .map(|b| b.id)
            .collect()
    }

    /// Blocks reachable from the entry in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let color = self.new_color();
        let mut postorder = Vec::new();
        self.dfs_postorder(self.entry, color, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn dfs_postorder(&self, block: BlockId, color: u32, postorder: &mut Vec<BlockId>) {
        let Some(b) = self.block(block) else {
            return;
        };
        if !b.tag(color) {
            return;
        }
        for succ in b.successors() {
            self.dfs_postorder(succ, color, postorder);
        }
        postorder.push(block);
    }
}

impl Default for Cfg {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder lowering structured HIR statements into a CFG
pub struct CfgBuilder {
    cfg: Cfg,
    current_block: BlockId,
    loop_stack: Vec<LoopContext>,
}

struct LoopContext {
    continue_block: BlockId,
    break_block: BlockId,
}

impl CfgBuilder {
    pub fn new() -> Self {
        let cfg = Cfg::new();
        let entry = cfg.entry;
        Self {
            cfg,
            current_block: entry,
            loop_stack: Vec::new(),
        }
    }

    pub fn build(mut self, body: &[HirStmt]) -> Cfg {
        self.build_body(body);

        // falling off the end returns null
        self.push(CfgStmtKind::Return(None), None);
        self.jump_to(self.cfg.exit);

        self.cfg
    }

    fn build_body(&mut self, stmts: &[HirStmt]) {
        for stmt in stmts {
            self.build_stmt(stmt);
        }
    }

    fn push(&mut self, kind: CfgStmtKind, span: Option<Span>) {
        self.cfg.add_stmt(self.current_block, CfgStmt { kind, span });
    }

    fn is_open(&self) -> bool {
        self.cfg
            .block(self.current_block)
            .is_some_and(|b| b.edge.is_none())
    }

    /// Close the current block with a simple edge unless already closed
    fn jump_to(&mut self, target: BlockId) {
        if self.is_open() {
            self.cfg.set_edge(self.current_block, Edge::Simple(target));
        }
    }

    /// Statements after a jump land in a block nothing enters
    fn start_dead_block(&mut self) {
        self.current_block = self.cfg.new_block();
    }

    fn build_stmt(&mut self, stmt: &HirStmt) {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(expr) => self.push(CfgStmtKind::Expr(expr.clone()), span),
            StmtKind::Echo(exprs) => self.push(CfgStmtKind::Echo(exprs.clone()), span),
            StmtKind::Unset(exprs) => self.push(CfgStmtKind::Unset(exprs.clone()), span),
            StmtKind::Global(names) => self.push(CfgStmtKind::Global(names.clone()), span),
            StmtKind::Static(vars) => self.push(CfgStmtKind::Static(vars.clone()), span),
            StmtKind::Return(expr) => {
                self.push(CfgStmtKind::Return(expr.clone()), span);
                self.jump_to(self.cfg.exit);
                self.start_dead_block();
            }
            StmtKind::Throw(expr) => {
                self.push(CfgStmtKind::Throw(expr.clone()), span);
                self.start_dead_block();
            }
            StmtKind::If {
                condition,
                then_body,
                else_body,
            } => self.build_if(condition, then_body, else_body.as_deref()),
            StmtKind::While { condition, body } => self.build_while(condition, body),
            StmtKind::DoWhile { body, condition } => self.build_do_while(body, condition),
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => self.build_for(init, condition.as_ref(), step, body, span),
            StmtKind::Foreach {
                enumeree,
                key,
                value,
                by_ref,
                body,
            } => self.build_foreach(enumeree, key.as_ref(), value, *by_ref, body),
            StmtKind::Switch { value, cases } => self.build_switch(value, cases),
            StmtKind::Try {
                body,
                catches,
                finally,
            } => self.build_try(body, catches, finally.as_deref()),
            StmtKind::Break => {
                if let Some(target) = self.loop_stack.last().map(|ctx| ctx.break_block) {
                    self.jump_to(target);
                }
                self.start_dead_block();
            }
            StmtKind::Continue => {
                if let Some(target) = self.loop_stack.last().map(|ctx| ctx.continue_block) {
                    self.jump_to(target);
                }
                self.start_dead_block();
            }
        }
    }

    fn build_if(&mut self, condition: &HirExpr, then_body: &[HirStmt], else_body: Option<&[HirStmt]>) {
        let then_block = self.cfg.new_block();
        let else_block = self.cfg.new_block();
        let merge_block = self.cfg.new_block();

        self.cfg.set_edge(
            self.current_block,
            Edge::Conditional {
                condition: condition.clone(),
                true_target: then_block,
                false_target: else_block,
            },
        );

        self.current_block = then_block;
        self.build_body(then_body);
        self.jump_to(merge_block);

        self.current_block = else_block;
        if let Some(else_stmts) = else_body {
            self.build_body(else_stmts);
        }
        self.jump_to(merge_block);

        self.current_block = merge_block;
    }

    fn build_while(&mut self, condition: &HirExpr, body: &[HirStmt]) {
        let header_block = self.cfg.new_block();
        let body_block = self.cfg.new_block();
        let exit_block = self.cfg.new_block();

        self.jump_to(header_block);
        self.cfg.set_edge(
            header_block,
            Edge::Conditional {
                condition: condition.clone(),
                true_target: body_block,
                false_target: exit_block,
            },
        );

        self.build_loop_body(body_block, body, header_block, exit_block);
        // back edge
        self.jump_to(header_block);

        self.current_block = exit_block;
    }

    fn build_do_while(&mut self, body: &[HirStmt], condition: &HirExpr) {
        let body_block = self.cfg.new_block();
        let condition_block = self.cfg.new_block();
        let exit_block = self.cfg.new_block();

        self.jump_to(body_block);
        self.build_loop_body(body_block, body, condition_block, exit_block);
        self.jump_to(condition_block);

        self.cfg.set_edge(
            condition_block,
            Edge::Conditional {
                condition: condition.clone(),
                true_target: body_block,
                false_target: exit_block,
            },
        );
        self.current_block = exit_block;
    }

    fn build_for(
        &mut self,
        init: &[HirExpr],
        condition: Option<&HirExpr>,
        step: &[HirExpr],
        body: &[HirStmt],
        span: Option<Span>,
    ) {
        for expr in init {
            self.push(CfgStmtKind::Expr(expr.clone()), span);
        }
        let header_block = self.cfg.new_block();
        let body_block = self.cfg.new_block();
        let step_block = self.cfg.new_block();
        let exit_block = self.cfg.new_block();

        self.jump_to(header_block);
        let header_edge = match condition {
            Some(condition) => Edge::Conditional {
                condition: condition.clone(),
                true_target: body_block,
                false_target: exit_block,
            },
            None => Edge::Simple(body_block),
        };
        self.cfg.set_edge(header_block, header_edge);

        self.build_loop_body(body_block, body, step_block, exit_block);
        self.jump_to(step_block);

        self.current_block = step_block;
        for expr in step {
            self.push(CfgStmtKind::Expr(expr.clone()), None);
        }
        self.jump_to(header_block);

        self.current_block = exit_block;
    }

    fn build_foreach(
        &mut self,
        enumeree: &HirExpr,
        key: Option<&HirExpr>,
        value: &HirExpr,
        by_ref: bool,
        body: &[HirStmt],
    ) {
        let enumeree_block = self.current_block;
        let move_next_block = self.cfg.new_block();
        let body_block = self.cfg.new_block();
        let end_block = self.cfg.new_block();

        self.cfg.set_edge(
            enumeree_block,
            Edge::ForeachEnumeree {
                enumeree: enumeree.clone(),
                move_next: move_next_block,
            },
        );
        self.cfg.set_edge(
            move_next_block,
            Edge::ForeachMoveNext {
                enumeree_block,
                key: key.cloned(),
                value: value.clone(),
                by_ref,
                body: body_block,
                end: end_block,
            },
        );

        self.build_loop_body(body_block, body, move_next_block, end_block);
        self.jump_to(move_next_block);

        self.current_block = end_block;
    }

    fn build_loop_body(&mut self, start: BlockId, body: &[HirStmt], continue_block: BlockId, break_block: BlockId) {
        self.loop_stack.push(LoopContext {
            continue_block,
            break_block,
        });
        self.current_block = start;
        self.build_body(body);
        self.loop_stack.pop();
    }

    fn build_switch(&mut self, value: &HirExpr, cases: &[crate::hir::SwitchCase]) {
        let switch_block = self.current_block;
        let case_blocks: Vec<BlockId> = cases.iter().map(|_| self.cfg.new_block()).collect();
        let end_block = self.cfg.new_block();

        let mut arms: Vec<CaseArm> = cases
            .iter()
            .zip(&case_blocks)
            .map(|(case, &target)| CaseArm {
                label: case.label.clone(),
                target,
            })
            .collect();
        if !cases.iter().any(|case| case.label.is_none()) {
            arms.push(CaseArm {
                label: None,
                target: end_block,
            });
        }
        self.cfg.set_edge(
            switch_block,
            Edge::Switch {
                value: value.clone(),
                arms,
            },
        );

        // `continue` inside a switch behaves like `break`
        self.loop_stack.push(LoopContext {
            continue_block: end_block,
            break_block: end_block,
        });
        for (i, case) in cases.iter().enumerate() {
            self.current_block = case_blocks[i];
            self.build_body(&case.body);
            // fall through into the next case
            let next = case_blocks.get(i + 1).copied().unwrap_or(end_block);
            self.jump_to(next);
        }
        self.loop_stack.pop();

        self.current_block = end_block;
    }

    fn build_try(&mut self, body: &[HirStmt], catches: &[crate::hir::CatchClause], finally: Option<&[HirStmt]>) {
        let try_block = self.current_block;
        let body_block = self.cfg.new_block();
        let catch_blocks: Vec<BlockId> = catches.iter().map(|_| self.cfg.new_block()).collect();
        let finally_block = finally.map(|_| self.cfg.new_block());
        let end_block = self.cfg.new_block();
        let after_handlers = finally_block.unwrap_or(end_block);

        self.cfg.set_edge(
            try_block,
            Edge::TryCatch {
                body: body_block,
                catches: catches
                    .iter()
                    .zip(&catch_blocks)
                    .map(|(clause, &target)| CatchArm {
                        types: clause.types.clone(),
                        variable: clause.variable.clone(),
                        target,
                    })
                    .collect(),
                finally: finally_block,
            },
        );

        self.current_block = body_block;
        self.build_body(body);
        self.jump_to(after_handlers);

        for (clause, &block) in catches.iter().zip(&catch_blocks) {
            self.current_block = block;
            self.build_body(&clause.body);
            self.jump_to(after_handlers);
        }

        if let (Some(block), Some(stmts)) = (finally_block, finally) {
            self.current_block = block;
            self.build_body(stmts);
            self.jump_to(end_block);
        }

        self.current_block = end_block;
    }
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new()
    }
}
