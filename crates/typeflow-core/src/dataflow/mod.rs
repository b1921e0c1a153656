//! Flow-sensitive type inference
//!
//! This module implements the fixed-point analysis:
//! - Type masks with class and typed-array identities
//! - Control Flow Graph (CFG) construction from HIR
//! - Per-routine flow contexts and per-block flow states
//! - A shared worklist drained in batches, with return-type pings between routines
//! - Transfer functions with branch narrowing and arithmetic widening
//! - Unreachable code detection over the same CFGs

mod cfg;
mod context;
mod mask;
mod operators;
mod reachability;
mod state;
mod type_inference;
mod type_table;
mod walker;
mod worklist;

pub use cfg::{BasicBlock, BlockId, BlockKey, CaseArm, CatchArm, Cfg, CfgBuilder, CfgStmt, CfgStmtKind, Edge};
pub use context::{FlowContext, VariableHandle};
pub use mask::TypeMask;
pub use reachability::{constant_truth, reachable_blocks, unreachable_code};
pub use state::FlowState;
pub use type_inference::{
    analyze_module, analyze_module_with_config, AnalysisReport, AnalysisStatus, FlowAnalyzer, InferredTypes,
};
pub use type_table::{TypeIdentity, TypeTable};
pub use worklist::{CalleeStatus, DrainStats, Scheduler};
