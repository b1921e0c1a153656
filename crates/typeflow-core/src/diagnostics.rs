//! Diagnostics emitted by the flow analysis and the reachability pass

use crate::hir::Span;
use crate::program::RoutineId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// Statement can never execute
    UnreachableCode,
    /// Variable read before any path assigned it
    UndefinedVariable(String),
    /// Method invoked on a value that can only be `null`
    MethodCallOnNull(String),
    /// Call target could not be bound to any routine
    UnresolvedCall(String),
    /// The drain loop gave up on a set of mutually dependent routines
    NonConvergence(Vec<String>),
}

impl DiagnosticKind {
    pub fn severity(&self) -> Severity {
        match self {
            DiagnosticKind::UnreachableCode | DiagnosticKind::UnresolvedCall(_) => Severity::Info,
            DiagnosticKind::UndefinedVariable(_) | DiagnosticKind::MethodCallOnNull(_) => {
                Severity::Warning
            }
            DiagnosticKind::NonConvergence(_) => Severity::Error,
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticKind::UnreachableCode => write!(f, "unreachable code detected"),
            DiagnosticKind::UndefinedVariable(name) => write!(f, "undefined variable ${name}"),
            DiagnosticKind::MethodCallOnNull(method) => {
                write!(f, "call to method {method}() on null")
            }
            DiagnosticKind::UnresolvedCall(name) => write!(f, "call to undefined function {name}()"),
            DiagnosticKind::NonConvergence(routines) => {
                write!(f, "type analysis did not converge for {}", routines.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub routine: RoutineId,
    pub span: Option<Span>,
    pub kind: DiagnosticKind,
}

impl Diagnostic {
    pub fn new(routine: RoutineId, span: Option<Span>, kind: DiagnosticKind) -> Self {
        Self { routine, span, kind }
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Ordering key used when reports are assembled
    pub(crate) fn sort_key(&self) -> (RoutineId, Option<Span>) {
        (self.routine, self.span)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Some(span) => write!(f, "{} at {}: {}", self.routine, span, self.kind),
            None => write!(f, "{}: {}", self.routine, self.kind),
        }
    }
}
