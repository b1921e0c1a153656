//! # Typeflow Core
//!
//! Worklist-driven, fixed-point type inference over the control-flow
//! graphs of a dynamic-language program.
//!
//! Every variable, expression and return value is approximated by a
//! [`TypeMask`], a 64-bit set of runtime types plus class and typed-array
//! identities. Blocks of all routines share one queue; a routine's return
//! mask is published to the call sites that read it, and the drain loop
//! runs until no block state changes any more.
//!
//! ## Modules
//!
//! - **[`hir`]** - Bound tree consumed by the engine
//! - **[`program`]** - Routines, PHPDoc hints and call binding
//! - **[`dataflow`]** - Masks, CFGs, flow states, the scheduler and the walker
//! - **[`interprocedural`]** - Call graph and exit nodes
//! - **[`diagnostics`]** - Findings reported alongside the inferred types
//!
//! ## Quick Start
//!
//! ```rust
//! use typeflow_core::hir::{HirExpr, HirFunction, HirModule, HirParam, HirStmt};
//! use typeflow_core::{AnalysisConfig, FlowAnalyzer, Program, TypeMask};
//!
//! let module = HirModule::new(vec![HirFunction::new(
//!     "label",
//!     vec![HirParam::typed("n", &["?int"])],
//!     vec![
//!         HirStmt::if_else(
//!             HirExpr::binary(
//!                 typeflow_core::hir::BinOp::Identical,
//!                 HirExpr::var("n"),
//!                 HirExpr::null(),
//!             ),
//!             vec![HirStmt::ret(Some(HirExpr::string("none")))],
//!             None,
//!         ),
//!         HirStmt::ret(Some(HirExpr::var("n"))),
//!     ],
//! )]);
//!
//! let report = FlowAnalyzer::new(Program::from_module(&module))
//!     .with_config(AnalysisConfig::default().sequential())
//!     .analyze()
//!     .unwrap();
//!
//! let label = report.routine("label").unwrap();
//! assert_eq!(label.return_mask, TypeMask::LONG | TypeMask::STRING);
//! ```

pub mod config;
pub mod dataflow;
pub mod diagnostics;
pub mod error;
pub mod hir;
pub mod interprocedural;
pub mod program;

pub use config::AnalysisConfig;
pub use dataflow::{
    analyze_module, analyze_module_with_config, AnalysisReport, AnalysisStatus, FlowAnalyzer, InferredTypes,
    TypeMask, TypeTable,
};
pub use diagnostics::{Diagnostic, DiagnosticKind, Severity};
pub use error::{FlowError, Result};
pub use program::{DocHints, NameResolver, Program, RoutineId, SymbolResolver};
