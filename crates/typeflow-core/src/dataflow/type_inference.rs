//! High-level API for flow-based type inference

use super::cfg::Cfg;
use super::mask::TypeMask;
use super::reachability::unreachable_code;
use super::type_table::TypeTable;
use super::worklist::{DrainStats, Scheduler};
use crate::config::AnalysisConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Severity};
use crate::error::{FlowError, Result};
use crate::hir::HirModule;
use crate::program::{NameResolver, Program, RoutineId, SymbolResolver};
use indexmap::{IndexMap, IndexSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, warn};

/// Analyze every routine of a module with the default configuration.
///
/// # Example
/// ```
/// use typeflow_core::analyze_module;
/// use typeflow_core::hir::{HirExpr, HirFunction, HirModule, HirStmt};
///
/// let module = HirModule::new(vec![HirFunction::new(
///     "answer",
///     vec![],
///     vec![HirStmt::ret(Some(HirExpr::int(42)))],
/// )]);
/// let report = analyze_module(&module).unwrap();
/// assert_eq!(report.describe_return("answer").as_deref(), Some("int"));
/// ```
pub fn analyze_module(module: &HirModule) -> anyhow::Result<AnalysisReport> {
    Ok(FlowAnalyzer::new(Program::from_module(module)).analyze()?)
}

/// Analyze a module with a configuration given as JSON
pub fn analyze_module_with_config(module: &HirModule, config_json: &str) -> anyhow::Result<AnalysisReport> {
    let config = AnalysisConfig::from_json(config_json)?;
    let report = FlowAnalyzer::new(Program::from_module(module))
        .with_config(config)
        .analyze()?;
    Ok(report)
}

/// Whether a routine's results may be used
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisStatus {
    Converged,
    /// Results must not be consumed, only the reason is meaningful
    Failed(FlowError),
}

/// Result of flow analysis for one routine
#[derive(Debug, Clone)]
pub struct InferredTypes {
    pub routine: RoutineId,
    pub name: String,
    /// Union of every mask each variable held, in first-seen order
    pub variables: IndexMap<String, TypeMask>,
    pub return_mask: TypeMask,
    pub status: AnalysisStatus,
}

impl InferredTypes {
    pub fn variable(&self, name: &str) -> Option<TypeMask> {
        self.variables.get(name.trim_start_matches('$')).copied()
    }

    pub fn is_converged(&self) -> bool {
        self.status == AnalysisStatus::Converged
    }

    /// One line per variable plus the return type
    pub fn render(&self, types: &TypeTable) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}(): {}", self.name, types.display(self.return_mask));
        for (name, mask) in &self.variables {
            let _ = writeln!(out, "  ${name}: {}", types.display(*mask));
        }
        if let AnalysisStatus::Failed(err) = &self.status {
            let _ = writeln!(out, "  failed: {err}");
        }
        out
    }
}

/// Everything one analysis run produced
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub routines: IndexMap<String, InferredTypes>,
    /// Sorted by routine, then position
    pub diagnostics: Vec<Diagnostic>,
    pub stats: DrainStats,
    types: Arc<TypeTable>,
}

impl AnalysisReport {
    pub fn routine(&self, name: &str) -> Option<&InferredTypes> {
        self.routines.get(name)
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Rendered return type of a converged routine
    pub fn describe_return(&self, routine: &str) -> Option<String> {
        self.routine(routine)
            .filter(|types| types.is_converged())
            .map(|types| self.types.display(types.return_mask))
    }

    /// Rendered aggregated type of a variable in a converged routine
    pub fn describe_variable(&self, routine: &str, variable: &str) -> Option<String> {
        self.routine(routine)
            .filter(|types| types.is_converged())
            .and_then(|types| types.variable(variable))
            .map(|mask| self.types.display(mask))
    }

    pub fn failed_routines(&self) -> Vec<&str> {
        self.routines
            .values()
            .filter(|types| !types.is_converged())
            .map(|types| types.name.as_str())
            .collect()
    }

    pub fn diagnostics_of(&self, kind: fn(&DiagnosticKind) -> bool) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| kind(&d.kind)).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity() == Severity::Error)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for types in self.routines.values() {
            out.push_str(&types.render(&self.types));
        }
        for diagnostic in &self.diagnostics {
            let _ = writeln!(out, "{diagnostic}");
        }
        out
    }
}

enum Stage {
    Configuring {
        program: Program,
        resolver: Box<dyn SymbolResolver>,
    },
    Running(Box<Scheduler>),
}

/// Runs the worklist analysis over a whole program
pub struct FlowAnalyzer {
    types: Arc<TypeTable>,
    config: AnalysisConfig,
    stage: Option<Stage>,
    /// Diagnostics produced by the drain loop itself
    drain_diagnostics: Vec<Diagnostic>,
}

impl FlowAnalyzer {
    pub fn new(program: Program) -> Self {
        Self {
            types: Arc::new(TypeTable::new()),
            config: AnalysisConfig::default(),
            stage: Some(Stage::Configuring {
                program,
                resolver: Box::new(NameResolver),
            }),
            drain_diagnostics: Vec::new(),
        }
    }

    /// Replace the default name-based call binding. Ignored once the
    /// analysis has started.
    pub fn with_resolver(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        if let Some(Stage::Configuring { resolver: current, .. }) = self.stage.as_mut() {
            *current = Box::new(resolver);
        }
        self
    }

    /// Ignored once the analysis has started
    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        if matches!(self.stage, Some(Stage::Configuring { .. })) {
            self.config = config;
        }
        self
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Analyze until every routine converged, failed or was abandoned.
    /// Only an invalid configuration is an error.
    pub fn analyze(&mut self) -> Result<AnalysisReport> {
        let scheduler = self.start()?;
        let outcome = scheduler.drain();
        self.settle(outcome)?;
        self.report()
    }

    /// Swap in a rewritten CFG for one routine and bring the analysis back
    /// to a fixed point
    pub fn replace_cfg(&mut self, routine: RoutineId, cfg: Cfg) -> Result<AnalysisReport> {
        self.start()?;
        let Some(Stage::Running(scheduler)) = self.stage.as_mut() else {
            return Err(FlowError::UnknownRoutine(routine));
        };
        scheduler.replace_cfg(routine, cfg)?;
        let outcome = scheduler.drain();
        self.settle(outcome)?;
        self.report()
    }

    /// Build the scheduler and seed every routine on first use
    fn start(&mut self) -> Result<&Scheduler> {
        if let Some(Stage::Configuring { .. }) = self.stage {
            self.config.validate()?;
            let Some(Stage::Configuring { program, resolver }) = self.stage.take() else {
                return Err(FlowError::InvalidConfig("analyzer lost its program".to_string()));
            };
            let scheduler = Scheduler::new(program, Arc::clone(&self.types), resolver, self.config.clone());
            let routines: Vec<RoutineId> = scheduler
                .program()
                .routines()
                .filter(|routine| routine.is_analyzable())
                .map(|routine| routine.id)
                .collect();
            info!(routines = routines.len(), "starting flow analysis");
            for routine in routines {
                if let Err(err) = scheduler.seed(routine) {
                    scheduler.fail_routine(routine, err);
                }
            }
            self.stage = Some(Stage::Running(Box::new(scheduler)));
        }
        self.scheduler()
    }

    fn scheduler(&self) -> Result<&Scheduler> {
        match &self.stage {
            Some(Stage::Running(scheduler)) => Ok(&**scheduler),
            _ => Err(FlowError::InvalidConfig("analysis has not started".to_string())),
        }
    }

    /// Turn a failed drain into failed routines
    fn settle(&mut self, outcome: Result<()>) -> Result<()> {
        let Err(err) = outcome else {
            return Ok(());
        };
        let scheduler = self.scheduler()?;
        let mut roots: IndexSet<RoutineId> = scheduler.routines_with_work().into_iter().collect();
        let mut stalled = None;
        if let FlowError::NonConvergence { routines } = &err {
            roots.extend(routines.iter().copied());
            let names = routines
                .iter()
                .filter_map(|&id| scheduler.program().routine(id))
                .map(|routine| routine.name.clone())
                .collect();
            let owner = routines.first().copied().unwrap_or(RoutineId::STANDALONE);
            stalled = Some(Diagnostic::new(owner, None, DiagnosticKind::NonConvergence(names)));
        }
        let roots: Vec<RoutineId> = roots.into_iter().collect();
        let failed = scheduler.call_graph().transitive_callers(&roots);
        warn!(failed = failed.len(), error = %err, "marking routines as failed");
        for routine in failed {
            scheduler.fail_routine(routine, err.clone());
        }
        scheduler.clear_queue();
        self.drain_diagnostics.extend(stalled);
        Ok(())
    }

    fn report(&self) -> Result<AnalysisReport> {
        let scheduler = self.scheduler()?;
        let mut routines = IndexMap::new();
        let mut diagnostics = self.drain_diagnostics.clone();

        for (routine, runtime) in scheduler.program().routines().zip(scheduler.runtimes()) {
            let Some(cfg) = routine.cfg.as_deref() else {
                continue;
            };
            let status = match runtime.failure() {
                Some(err) => AnalysisStatus::Failed(err),
                None => {
                    diagnostics.extend(runtime.diagnostics());
                    AnalysisStatus::Converged
                }
            };
            if self.config.reachability {
                diagnostics.extend(unreachable_code(routine.id, cfg));
            }
            routines.insert(
                routine.name.clone(),
                InferredTypes {
                    routine: routine.id,
                    name: routine.name.clone(),
                    variables: runtime.ctx.variables(),
                    return_mask: runtime.ctx.return_mask(),
                    status,
                },
            );
        }

        diagnostics.sort_by_key(Diagnostic::sort_key);
        diagnostics.dedup();
        Ok(AnalysisReport {
            routines,
            diagnostics,
            stats: scheduler.stats(),
            types: Arc::clone(&self.types),
        })
    }
}
