//! Bound tree consumed by the flow analysis
//!
//! The binder hands over routines whose bodies are structured statements
//! over a closed set of expression kinds. `CfgBuilder` lowers the
//! statements into basic blocks; expressions stay as they are and are
//! interpreted by the analysis walker.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source position of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    /// `&&` / `and`
    And,
    /// `||` / `or`
    Or,
    Xor,
    Eq,
    NotEq,
    Identical,
    NotIdentical,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Spaceship,
    Coalesce,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq
                | BinOp::NotEq
                | BinOp::Identical
                | BinOp::NotIdentical
                | BinOp::Lt
                | BinOp::LtEq
                | BinOp::Gt
                | BinOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    BitNot,
    /// Error suppression `@expr`
    Silence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastKind {
    Int,
    Float,
    String,
    Bool,
    Array,
    Object,
    Unset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncDecKind {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

impl IncDecKind {
    pub fn is_increment(self) -> bool {
        matches!(self, IncDecKind::PreInc | IncDecKind::PostInc)
    }

    pub fn is_prefix(self) -> bool {
        matches!(self, IncDecKind::PreInc | IncDecKind::PreDec)
    }
}

/// Compile-time magic constants such as `__LINE__`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PseudoConst {
    Line,
    File,
    Dir,
    Function,
    Class,
    Method,
    Namespace,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VarName {
    Direct(String),
    /// `$$expr`
    Indirect(Box<HirExpr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub value: HirExpr,
    /// `...$args`
    pub unpack: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayItem {
    pub key: Option<HirExpr>,
    pub value: HirExpr,
    pub by_ref: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListItem {
    pub key: Option<HirExpr>,
    pub target: HirExpr,
    pub by_ref: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LambdaUse {
    pub name: String,
    pub by_ref: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallKind {
    Function { name: String },
    Method { object: Box<HirExpr>, name: String },
    Static { class: String, name: String },
    New { class: String },
}

impl CallKind {
    /// Name used in diagnostics and for resolution
    pub fn display_name(&self) -> String {
        match self {
            CallKind::Function { name } => name.clone(),
            CallKind::Method { name, .. } => name.clone(),
            CallKind::Static { class, name } => format!("{class}::{name}"),
            CallKind::New { class } => format!("{class}::__construct"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirExpr {
    Literal(Literal),
    Var(VarName),
    Assign {
        target: Box<HirExpr>,
        value: Box<HirExpr>,
        by_ref: bool,
    },
    CompoundAssign {
        op: BinOp,
        target: Box<HirExpr>,
        value: Box<HirExpr>,
    },
    IncDec {
        kind: IncDecKind,
        target: Box<HirExpr>,
    },
    Binary {
        op: BinOp,
        left: Box<HirExpr>,
        right: Box<HirExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<HirExpr>,
    },
    Cast {
        kind: CastKind,
        expr: Box<HirExpr>,
    },
    Field {
        object: Box<HirExpr>,
        name: String,
    },
    /// `$base[index]`, `$base[]` when `index` is `None`
    Index {
        base: Box<HirExpr>,
        index: Option<Box<HirExpr>>,
    },
    Call {
        kind: CallKind,
        args: Vec<Argument>,
    },
    Isset(Vec<HirExpr>),
    Empty(Box<HirExpr>),
    /// Destructuring target `list(...)` / `[...] =`
    List(Vec<Option<ListItem>>),
    Array(Vec<ArrayItem>),
    Include(Box<HirExpr>),
    Lambda {
        function: String,
        uses: Vec<LambdaUse>,
    },
    PseudoConst(PseudoConst),
    Constant(String),
    InstanceOf {
        expr: Box<HirExpr>,
        class: String,
    },
    /// `cond ? a : b`, or `cond ?: b` when `if_true` is `None`
    Conditional {
        condition: Box<HirExpr>,
        if_true: Option<Box<HirExpr>>,
        if_false: Box<HirExpr>,
    },
}

impl HirExpr {
    pub fn var(name: &str) -> Self {
        HirExpr::Var(VarName::Direct(name.to_string()))
    }

    pub fn int(value: i64) -> Self {
        HirExpr::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        HirExpr::Literal(Literal::Float(value))
    }

    pub fn string(value: &str) -> Self {
        HirExpr::Literal(Literal::String(value.to_string()))
    }

    pub fn bool(value: bool) -> Self {
        HirExpr::Literal(Literal::Bool(value))
    }

    pub fn null() -> Self {
        HirExpr::Literal(Literal::Null)
    }

    pub fn assign(target: HirExpr, value: HirExpr) -> Self {
        HirExpr::Assign {
            target: Box::new(target),
            value: Box::new(value),
            by_ref: false,
        }
    }

    pub fn assign_ref(target: HirExpr, value: HirExpr) -> Self {
        HirExpr::Assign {
            target: Box::new(target),
            value: Box::new(value),
            by_ref: true,
        }
    }

    pub fn binary(op: BinOp, left: HirExpr, right: HirExpr) -> Self {
        HirExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, operand: HirExpr) -> Self {
        HirExpr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn not(operand: HirExpr) -> Self {
        Self::unary(UnaryOp::Not, operand)
    }

    pub fn inc_dec(kind: IncDecKind, target: HirExpr) -> Self {
        HirExpr::IncDec {
            kind,
            target: Box::new(target),
        }
    }

    pub fn call(name: &str, args: Vec<HirExpr>) -> Self {
        HirExpr::Call {
            kind: CallKind::Function {
                name: name.to_string(),
            },
            args: args.into_iter().map(Argument::from).collect(),
        }
    }

    pub fn method_call(object: HirExpr, name: &str, args: Vec<HirExpr>) -> Self {
        HirExpr::Call {
            kind: CallKind::Method {
                object: Box::new(object),
                name: name.to_string(),
            },
            args: args.into_iter().map(Argument::from).collect(),
        }
    }

    pub fn new_object(class: &str, args: Vec<HirExpr>) -> Self {
        HirExpr::Call {
            kind: CallKind::New {
                class: class.to_string(),
            },
            args: args.into_iter().map(Argument::from).collect(),
        }
    }

    pub fn index(base: HirExpr, index: Option<HirExpr>) -> Self {
        HirExpr::Index {
            base: Box::new(base),
            index: index.map(Box::new),
        }
    }

    pub fn field(object: HirExpr, name: &str) -> Self {
        HirExpr::Field {
            object: Box::new(object),
            name: name.to_string(),
        }
    }

    pub fn array(values: Vec<HirExpr>) -> Self {
        HirExpr::Array(
            values
                .into_iter()
                .map(|value| ArrayItem {
                    key: None,
                    value,
                    by_ref: false,
                })
                .collect(),
        )
    }

    pub fn instance_of(expr: HirExpr, class: &str) -> Self {
        HirExpr::InstanceOf {
            expr: Box::new(expr),
            class: class.to_string(),
        }
    }

    pub fn ternary(condition: HirExpr, if_true: HirExpr, if_false: HirExpr) -> Self {
        HirExpr::Conditional {
            condition: Box::new(condition),
            if_true: Some(Box::new(if_true)),
            if_false: Box::new(if_false),
        }
    }

    pub fn isset(vars: Vec<HirExpr>) -> Self {
        HirExpr::Isset(vars)
    }

    /// Name of a plain `$name` variable
    pub fn as_direct_var(&self) -> Option<&str> {
        match self {
            HirExpr::Var(VarName::Direct(name)) => Some(name),
            _ => None,
        }
    }

    pub fn is_null_literal(&self) -> bool {
        match self {
            HirExpr::Literal(Literal::Null) => true,
            HirExpr::Constant(name) => name.eq_ignore_ascii_case("null"),
            _ => false,
        }
    }
}

impl From<HirExpr> for Argument {
    fn from(value: HirExpr) -> Self {
        Argument {
            value,
            unpack: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    /// `None` for `default:`
    pub label: Option<HirExpr>,
    pub body: Vec<HirStmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub types: Vec<String>,
    pub variable: Option<String>,
    pub body: Vec<HirStmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(HirExpr),
    Echo(Vec<HirExpr>),
    Return(Option<HirExpr>),
    Unset(Vec<HirExpr>),
    Global(Vec<String>),
    Static(Vec<(String, Option<HirExpr>)>),
    Throw(HirExpr),
    If {
        condition: HirExpr,
        then_body: Vec<HirStmt>,
        else_body: Option<Vec<HirStmt>>,
    },
    While {
        condition: HirExpr,
        body: Vec<HirStmt>,
    },
    DoWhile {
        body: Vec<HirStmt>,
        condition: HirExpr,
    },
    For {
        init: Vec<HirExpr>,
        condition: Option<HirExpr>,
        step: Vec<HirExpr>,
        body: Vec<HirStmt>,
    },
    Foreach {
        enumeree: HirExpr,
        key: Option<HirExpr>,
        value: HirExpr,
        by_ref: bool,
        body: Vec<HirStmt>,
    },
    Switch {
        value: HirExpr,
        cases: Vec<SwitchCase>,
    },
    Try {
        body: Vec<HirStmt>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<HirStmt>>,
    },
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirStmt {
    pub kind: StmtKind,
    pub span: Option<Span>,
}

impl StmtKind {
    /// Attach a source position
    pub fn at(self, line: u32, column: u32) -> HirStmt {
        HirStmt {
            kind: self,
            span: Some(Span::new(line, column)),
        }
    }
}

impl From<StmtKind> for HirStmt {
    fn from(kind: StmtKind) -> Self {
        HirStmt { kind, span: None }
    }
}

impl HirStmt {
    pub fn expr(expr: HirExpr) -> Self {
        StmtKind::Expr(expr).into()
    }

    pub fn assign(target: &str, value: HirExpr) -> Self {
        Self::expr(HirExpr::assign(HirExpr::var(target), value))
    }

    pub fn echo(expr: HirExpr) -> Self {
        StmtKind::Echo(vec![expr]).into()
    }

    pub fn ret(expr: Option<HirExpr>) -> Self {
        StmtKind::Return(expr).into()
    }

    pub fn if_else(condition: HirExpr, then_body: Vec<HirStmt>, else_body: Option<Vec<HirStmt>>) -> Self {
        StmtKind::If {
            condition,
            then_body,
            else_body,
        }
        .into()
    }

    pub fn while_loop(condition: HirExpr, body: Vec<HirStmt>) -> Self {
        StmtKind::While { condition, body }.into()
    }

    pub fn foreach(enumeree: HirExpr, key: Option<&str>, value: &str, body: Vec<HirStmt>) -> Self {
        StmtKind::Foreach {
            enumeree,
            key: key.map(HirExpr::var),
            value: HirExpr::var(value),
            by_ref: false,
            body,
        }
        .into()
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.span = Some(Span::new(line, column));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirParam {
    pub name: String,
    /// Declared type names, empty when untyped
    pub type_hint: Vec<String>,
    pub by_ref: bool,
    pub variadic: bool,
    pub default: Option<HirExpr>,
}

impl HirParam {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_hint: Vec::new(),
            by_ref: false,
            variadic: false,
            default: None,
        }
    }

    pub fn typed(name: &str, hint: &[&str]) -> Self {
        Self {
            type_hint: hint.iter().map(|s| (*s).to_string()).collect(),
            ..Self::new(name)
        }
    }

    pub fn by_ref(mut self) -> Self {
        self.by_ref = true;
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn with_default(mut self, default: HirExpr) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirFunction {
    /// Function name, or `Class::method` for methods
    pub name: String,
    pub params: Vec<HirParam>,
    /// `None` for routines implemented outside the program
    pub body: Option<Vec<HirStmt>>,
    /// Declaring class of a method
    pub class: Option<String>,
    pub is_static: bool,
    pub return_hint: Vec<String>,
    /// Captured variables of a closure
    pub uses: Vec<LambdaUse>,
}

impl HirFunction {
    pub fn new(name: &str, params: Vec<HirParam>, body: Vec<HirStmt>) -> Self {
        Self {
            name: name.to_string(),
            params,
            body: Some(body),
            class: None,
            is_static: false,
            return_hint: Vec::new(),
            uses: Vec::new(),
        }
    }

    pub fn method(class: &str, name: &str, params: Vec<HirParam>, body: Vec<HirStmt>) -> Self {
        Self {
            class: Some(class.to_string()),
            ..Self::new(&format!("{class}::{name}"), params, body)
        }
    }

    /// A routine the analysis cannot look into
    pub fn library(name: &str, params: Vec<HirParam>, return_hint: &[&str]) -> Self {
        Self {
            body: None,
            return_hint: return_hint.iter().map(|s| (*s).to_string()).collect(),
            ..Self::new(name, params, Vec::new())
        }
    }

    pub fn returning(mut self, hint: &[&str]) -> Self {
        self.return_hint = hint.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Unqualified name of a method (`m` for `C::m`)
    pub fn short_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HirModule {
    pub functions: Vec<HirFunction>,
}

impl HirModule {
    pub fn new(functions: Vec<HirFunction>) -> Self {
        Self { functions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_of_method() {
        let func = HirFunction::method("Foo", "bar", vec![], vec![]);
        assert_eq!(func.name, "Foo::bar");
        assert_eq!(func.short_name(), "bar");
        assert_eq!(func.class.as_deref(), Some("Foo"));
    }

    #[test]
    fn test_null_literal_detection() {
        assert!(HirExpr::null().is_null_literal());
        assert!(HirExpr::Constant("NULL".to_string()).is_null_literal());
        assert!(!HirExpr::bool(false).is_null_literal());
    }

    #[test]
    fn test_statement_span() {
        let stmt = HirStmt::echo(HirExpr::string("a")).at(3, 5);
        assert_eq!(stmt.span, Some(Span::new(3, 5)));
    }
}
