//! Routines of a program and the symbol resolution seam
//!
//! A [`Program`] is built once from a [`HirModule`]: every function with a
//! body gets its control flow graph, functions without one become library
//! routines whose results come from their declared hints.

use crate::dataflow::{Cfg, CfgBuilder, TypeMask};
use crate::hir::{HirExpr, HirFunction, HirModule, LambdaUse};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Index of a routine within its [`Program`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutineId(pub u32);

impl RoutineId {
    /// Owner of contexts that evaluate expressions outside any routine
    pub const STANDALONE: RoutineId = RoutineId(u32::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == RoutineId::STANDALONE {
            write!(f, "<standalone>")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub type_hint: Vec<String>,
    pub by_ref: bool,
    pub variadic: bool,
    pub default: Option<HirExpr>,
}

#[derive(Debug, Clone)]
pub struct Routine {
    pub id: RoutineId,
    pub name: String,
    pub params: Vec<Parameter>,
    pub class: Option<String>,
    pub is_static: bool,
    pub return_hint: Vec<String>,
    pub uses: Vec<LambdaUse>,
    /// `None` for library routines
    pub cfg: Option<Arc<Cfg>>,
}

impl Routine {
    pub fn is_analyzable(&self) -> bool {
        self.cfg.is_some()
    }

    pub fn short_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }

    /// Parameter bound to the argument at `position`, variadics absorb the tail
    pub fn param_for_argument(&self, position: usize) -> Option<&Parameter> {
        match self.params.get(position) {
            Some(param) => Some(param),
            None => self.params.last().filter(|p| p.variadic),
        }
    }
}

/// What a PHPDoc hint is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocTarget {
    Param(String),
    Return,
}

/// Type names collected from doc comments, keyed by routine name
#[derive(Debug, Clone, Default)]
pub struct DocHints {
    hints: FxHashMap<(String, DocTarget), Vec<String>>,
}

impl DocHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, routine: &str, target: DocTarget, names: &[&str]) {
        self.hints.insert(
            (routine.to_ascii_lowercase(), target),
            names.iter().map(|s| (*s).to_string()).collect(),
        );
    }

    pub fn with_param(mut self, routine: &str, param: &str, names: &[&str]) -> Self {
        self.insert(routine, DocTarget::Param(param.to_string()), names);
        self
    }

    pub fn with_return(mut self, routine: &str, names: &[&str]) -> Self {
        self.insert(routine, DocTarget::Return, names);
        self
    }

    pub fn get(&self, routine: &str, target: &DocTarget) -> &[String] {
        self.hints
            .get(&(routine.to_ascii_lowercase(), target.clone()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Program {
    routines: Vec<Routine>,
    by_name: FxHashMap<String, RoutineId>,
    /// Lowercased method names to every routine declaring one
    methods: FxHashMap<String, Vec<RoutineId>>,
    doc_hints: DocHints,
}

impl Program {
    pub fn from_module(module: &HirModule) -> Self {
        let mut program = Program::default();
        for func in &module.functions {
            program.add_function(func);
        }
        program
    }

    pub fn with_doc_hints(mut self, doc_hints: DocHints) -> Self {
        self.doc_hints = doc_hints;
        self
    }

    pub fn add_function(&mut self, func: &HirFunction) -> RoutineId {
        let id = RoutineId(self.routines.len() as u32);
        let cfg = func
            .body
            .as_ref()
            .map(|body| Arc::new(CfgBuilder::new().build(body)));
        let routine = Routine {
            id,
            name: func.name.clone(),
            params: func
                .params
                .iter()
                .map(|p| Parameter {
                    name: p.name.clone(),
                    type_hint: p.type_hint.clone(),
                    by_ref: p.by_ref,
                    variadic: p.variadic,
                    default: p.default.clone(),
                })
                .collect(),
            class: func.class.clone(),
            is_static: func.is_static,
            return_hint: func.return_hint.clone(),
            uses: func.uses.clone(),
            cfg,
        };
        let key = func.name.trim_start_matches('\\').to_ascii_lowercase();
        // duplicate names make plain lookups ambiguous
        if self.by_name.insert(key.clone(), id).is_some() {
            self.by_name.insert(key, RoutineId::STANDALONE);
        }
        if routine.class.is_some() {
            self.methods
                .entry(routine.short_name().to_ascii_lowercase())
                .or_default()
                .push(id);
        }
        self.routines.push(routine);
        id
    }

    pub fn routine(&self, id: RoutineId) -> Option<&Routine> {
        self.routines.get(id.index())
    }

    pub fn routines(&self) -> impl Iterator<Item = &Routine> {
        self.routines.iter()
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn doc_hints(&self) -> &DocHints {
        &self.doc_hints
    }

    /// Exact lookup by (case-insensitive) name, duplicates resolve to ambiguous
    pub fn lookup(&self, name: &str) -> Resolution {
        let key = name.trim_start_matches('\\').to_ascii_lowercase();
        match self.by_name.get(&key) {
            Some(&RoutineId::STANDALONE) => Resolution::Ambiguous,
            Some(&id) => Resolution::Routine(id),
            None => Resolution::Unresolved,
        }
    }

    pub fn methods_named(&self, name: &str) -> &[RoutineId] {
        self.methods
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub(crate) fn set_cfg(&mut self, id: RoutineId, cfg: Cfg) -> bool {
        match self.routines.get_mut(id.index()) {
            Some(routine) => {
                routine.cfg = Some(Arc::new(cfg));
                true
            }
            None => false,
        }
    }
}

/// Outcome of binding a call expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Routine(RoutineId),
    /// Several candidates, none can be preferred
    Ambiguous,
    Unresolved,
}

/// Shape of a call as seen by the resolver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget<'a> {
    Function(&'a str),
    /// `class` is the receiver's class when its mask names exactly one
    Method {
        class: Option<&'a str>,
        name: &'a str,
    },
    Static {
        class: &'a str,
        name: &'a str,
    },
    Constructor(&'a str),
}

/// Binds calls, fields and constants to what the program declares
pub trait SymbolResolver: Send + Sync {
    fn resolve_call(&self, program: &Program, target: CallTarget<'_>) -> Resolution;

    /// Declared type of `class->field`, `None` when unknown
    fn field_type(&self, _class: Option<&str>, _field: &str) -> Option<TypeMask> {
        None
    }

    /// Type of a user constant, `None` when unknown
    fn constant_type(&self, _name: &str) -> Option<TypeMask> {
        None
    }
}

/// Resolves purely by name
#[derive(Debug, Clone, Copy, Default)]
pub struct NameResolver;

impl NameResolver {
    fn unique_method(program: &Program, name: &str) -> Resolution {
        match program.methods_named(name) {
            [] => Resolution::Unresolved,
            [single] => Resolution::Routine(*single),
            _ => Resolution::Ambiguous,
        }
    }
}

impl SymbolResolver for NameResolver {
    fn resolve_call(&self, program: &Program, target: CallTarget<'_>) -> Resolution {
        match target {
            CallTarget::Function(name) => program.lookup(name),
            CallTarget::Method { class: Some(class), name } => {
                match program.lookup(&format!("{class}::{name}")) {
                    Resolution::Unresolved => Self::unique_method(program, name),
                    found => found,
                }
            }
            CallTarget::Method { class: None, name } => Self::unique_method(program, name),
            CallTarget::Static { class, name } => {
                match program.lookup(&format!("{class}::{name}")) {
                    Resolution::Unresolved => Self::unique_method(program, name),
                    found => found,
                }
            }
            CallTarget::Constructor(class) => program.lookup(&format!("{class}::__construct")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{HirParam, HirStmt};

    fn sample() -> Program {
        Program::from_module(&HirModule::new(vec![
            HirFunction::new("Helper", vec![], vec![HirStmt::ret(None)]),
            HirFunction::method("Foo", "run", vec![], vec![]),
            HirFunction::method("Bar", "run", vec![], vec![]),
            HirFunction::method("Bar", "__construct", vec![], vec![]),
            HirFunction::method("Bar", "only", vec![], vec![]),
            HirFunction::library("strlen", vec![HirParam::new("s")], &["int"]),
        ]))
    }

    #[test]
    fn test_function_lookup_ignores_case() {
        let program = sample();
        assert_eq!(
            NameResolver.resolve_call(&program, CallTarget::Function("\\helper")),
            Resolution::Routine(RoutineId(0))
        );
        assert_eq!(
            NameResolver.resolve_call(&program, CallTarget::Function("missing")),
            Resolution::Unresolved
        );
    }

    #[test]
    fn test_method_resolution() {
        let program = sample();
        let on_foo = CallTarget::Method { class: Some("Foo"), name: "run" };
        assert_eq!(NameResolver.resolve_call(&program, on_foo), Resolution::Routine(RoutineId(1)));

        let unknown_receiver = CallTarget::Method { class: None, name: "run" };
        assert_eq!(NameResolver.resolve_call(&program, unknown_receiver), Resolution::Ambiguous);

        let unique = CallTarget::Method { class: None, name: "only" };
        assert_eq!(NameResolver.resolve_call(&program, unique), Resolution::Routine(RoutineId(4)));

        assert_eq!(
            NameResolver.resolve_call(&program, CallTarget::Constructor("bar")),
            Resolution::Routine(RoutineId(3))
        );
    }

    #[test]
    fn test_library_routines_have_no_cfg() {
        let program = sample();
        let strlen = program.routine(RoutineId(5)).unwrap();
        assert!(!strlen.is_analyzable());
        assert!(program.routine(RoutineId(0)).unwrap().is_analyzable());
    }

    #[test]
    fn test_duplicate_names_are_ambiguous() {
        let mut program = sample();
        program.add_function(&HirFunction::new("helper", vec![], vec![]));
        assert_eq!(program.lookup("Helper"), Resolution::Ambiguous);
    }

    #[test]
    fn test_doc_hints_lookup() {
        let hints = DocHints::new()
            .with_param("Foo::run", "x", &["int", "null"])
            .with_return("foo::run", &["string"]);
        assert_eq!(hints.get("FOO::RUN", &DocTarget::Param("x".into())).len(), 2);
        assert_eq!(hints.get("foo::run", &DocTarget::Return), ["string".to_string()]);
        assert!(hints.get("other", &DocTarget::Return).is_empty());
    }

    #[test]
    fn test_variadic_absorbs_tail() {
        let program = Program::from_module(&HirModule::new(vec![HirFunction::new(
            "f",
            vec![HirParam::new("a"), HirParam::new("rest").by_ref().variadic()],
            vec![],
        )]));
        let f = program.routine(RoutineId(0)).unwrap();
        assert_eq!(f.param_for_argument(0).map(|p| p.name.as_str()), Some("a"));
        assert_eq!(f.param_for_argument(4).map(|p| p.by_ref), Some(true));
        assert_eq!(RoutineId(3).to_string(), "#3");
    }
}
