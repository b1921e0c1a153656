//! End-to-end tests for the flow analysis
//!
//! Programs are built directly as HIR and run through `FlowAnalyzer`;
//! assertions look at rendered masks so they do not depend on the order
//! in which class and array identities were allocated.

use std::collections::BTreeMap;
use std::time::Duration;
use typeflow_core::dataflow::CfgBuilder;
use typeflow_core::hir::{
    BinOp, CatchClause, HirExpr, HirFunction, HirModule, HirParam, HirStmt, IncDecKind, StmtKind,
};
use typeflow_core::{
    AnalysisConfig, AnalysisReport, AnalysisStatus, DiagnosticKind, FlowAnalyzer, FlowError, Program, TypeMask,
};

/// Install a subscriber honoring `RUST_LOG`, once per test binary
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn analyze_with(functions: Vec<HirFunction>, config: AnalysisConfig) -> AnalysisReport {
    init_tracing();
    FlowAnalyzer::new(Program::from_module(&HirModule::new(functions)))
        .with_config(config)
        .analyze()
        .expect("analysis failed")
}

fn analyze(functions: Vec<HirFunction>) -> AnalysisReport {
    analyze_with(functions, AnalysisConfig::default().sequential())
}

fn assert_return(report: &AnalysisReport, routine: &str, expected: &str) {
    let actual = report.describe_return(routine);
    assert_eq!(
        actual.as_deref(),
        Some(expected),
        "return type of {routine}\nReport:\n{}",
        report.render()
    );
}

fn assert_variable(report: &AnalysisReport, routine: &str, variable: &str, expected: &str) {
    let actual = report.describe_variable(routine, variable);
    assert_eq!(
        actual.as_deref(),
        Some(expected),
        "${variable} in {routine}\nReport:\n{}",
        report.render()
    );
}

fn rendered_types(report: &AnalysisReport) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, types) in &report.routines {
        out.insert(format!("{name}()"), report.types().display(types.return_mask));
        for (variable, mask) in &types.variables {
            out.insert(format!("{name}::${variable}"), report.types().display(*mask));
        }
    }
    out
}

// ============================================================================
// Rendering
// ============================================================================

#[test]
fn test_report_rendering() {
    // function greet($name) { $msg = "hi " . $name; return $msg; }
    let report = analyze(vec![HirFunction::new(
        "greet",
        vec![HirParam::typed("name", &["string"])],
        vec![
            HirStmt::assign(
                "msg",
                HirExpr::binary(BinOp::Concat, HirExpr::string("hi "), HirExpr::var("name")),
            ),
            HirStmt::ret(Some(HirExpr::var("msg"))),
        ],
    )]);

    insta::assert_snapshot!(report.render(), @r"
    greet(): string
      $name: string
      $msg: string
    ");
}

// ============================================================================
// Recursion
// ============================================================================

#[test]
fn test_self_recursive_factorial() {
    // function fact(int $n) { if ($n <= 1) return 1; return $n * fact($n - 1); }
    let report = analyze(vec![HirFunction::new(
        "fact",
        vec![HirParam::typed("n", &["int"])],
        vec![
            HirStmt::if_else(
                HirExpr::binary(BinOp::LtEq, HirExpr::var("n"), HirExpr::int(1)),
                vec![HirStmt::ret(Some(HirExpr::int(1)))],
                None,
            ),
            HirStmt::ret(Some(HirExpr::binary(
                BinOp::Mul,
                HirExpr::var("n"),
                HirExpr::call(
                    "fact",
                    vec![HirExpr::binary(BinOp::Sub, HirExpr::var("n"), HirExpr::int(1))],
                ),
            ))),
        ],
    )]);

    assert!(report.routine("fact").unwrap().is_converged());
    assert_return(&report, "fact", "int|float");
    assert!(!report.has_errors());
}

#[test]
fn test_mutual_recursion_converges_to_constant() {
    // function f(?int $x) { if ($x === null) return 1; return g(); }
    // function g() { return f(null); }
    let report = analyze(vec![
        HirFunction::new(
            "f",
            vec![HirParam::typed("x", &["?int"])],
            vec![
                HirStmt::if_else(
                    HirExpr::binary(BinOp::Identical, HirExpr::var("x"), HirExpr::null()),
                    vec![HirStmt::ret(Some(HirExpr::int(1)))],
                    None,
                ),
                HirStmt::ret(Some(HirExpr::call("g", vec![]))),
            ],
        ),
        HirFunction::new(
            "g",
            vec![],
            vec![HirStmt::ret(Some(HirExpr::call("f", vec![HirExpr::null()])))],
        ),
    ]);

    assert_return(&report, "f", "int");
    assert_return(&report, "g", "int");
    assert!(report.failed_routines().is_empty());
    assert!(report.diagnostics.is_empty(), "{}", report.render());
}

#[test]
fn test_coalesce_with_recursive_fallback() {
    // function main() { return r(1); }
    // function r(?int $x) { return $x ?? r($x + 1); }
    let report = analyze(vec![
        HirFunction::new(
            "main",
            vec![],
            vec![HirStmt::ret(Some(HirExpr::call("r", vec![HirExpr::int(1)])))],
        ),
        HirFunction::new(
            "r",
            vec![HirParam::typed("x", &["?int"])],
            vec![HirStmt::ret(Some(HirExpr::binary(
                BinOp::Coalesce,
                HirExpr::var("x"),
                HirExpr::call(
                    "r",
                    vec![HirExpr::binary(BinOp::Add, HirExpr::var("x"), HirExpr::int(1))],
                ),
            )))],
        ),
    ]);

    let r = report.routine("r").unwrap();
    assert!(r.is_converged());
    assert!(report
        .diagnostics_of(|kind| matches!(kind, DiagnosticKind::NonConvergence(_)))
        .is_empty());
    // $x without null joined with r's own fixed point
    assert_eq!(r.return_mask, TypeMask::LONG);
    assert_return(&report, "r", "int");
    assert_variable(&report, "r", "x", "null|int");

    // main read r before it was published, so it must have been re-run
    assert!(report.routine("main").unwrap().is_converged());
    assert_return(&report, "main", "int");
}

// ============================================================================
// Narrowing
// ============================================================================

#[test]
fn test_short_circuit_narrows_both_operands() {
    // function h(?int $a) { if ($a === null || $a < 0) return 0; $ok = $a !== null && is_int($a); return $a; }
    let report = analyze(vec![HirFunction::new(
        "h",
        vec![HirParam::typed("a", &["?int"])],
        vec![
            HirStmt::if_else(
                HirExpr::binary(
                    BinOp::Or,
                    HirExpr::binary(BinOp::Identical, HirExpr::var("a"), HirExpr::null()),
                    HirExpr::binary(BinOp::Lt, HirExpr::var("a"), HirExpr::int(0)),
                ),
                vec![HirStmt::ret(Some(HirExpr::int(0)))],
                None,
            ),
            HirStmt::assign(
                "ok",
                HirExpr::binary(
                    BinOp::And,
                    HirExpr::binary(BinOp::NotIdentical, HirExpr::var("a"), HirExpr::null()),
                    HirExpr::call("is_int", vec![HirExpr::var("a")]),
                ),
            ),
            HirStmt::ret(Some(HirExpr::var("a"))),
        ],
    )]);

    assert_return(&report, "h", "int");
    assert_variable(&report, "h", "ok", "bool");
    assert!(report.diagnostics.is_empty(), "{}", report.render());
}

#[test]
fn test_null_check_narrows_class_hint() {
    // function n(?Foo $o) { if ($o !== null) return $o; return new Foo(); }
    let report = analyze(vec![HirFunction::new(
        "n",
        vec![HirParam::typed("o", &["?Foo"])],
        vec![
            HirStmt::if_else(
                HirExpr::binary(BinOp::NotIdentical, HirExpr::var("o"), HirExpr::null()),
                vec![HirStmt::ret(Some(HirExpr::var("o")))],
                None,
            ),
            HirStmt::ret(Some(HirExpr::new_object("Foo", vec![]))),
        ],
    )]);

    assert_return(&report, "n", "Foo");
    assert_variable(&report, "n", "o", "null|Foo");
}

// ============================================================================
// References
// ============================================================================

#[test]
fn test_by_ref_argument_becomes_reference() {
    // function inc(&$v) { $v = $v + 1; }
    // function main() { $x = 1; inc($x); return $x; }
    let report = analyze(vec![
        HirFunction::new(
            "inc",
            vec![HirParam::new("v").by_ref()],
            vec![HirStmt::assign(
                "v",
                HirExpr::binary(BinOp::Add, HirExpr::var("v"), HirExpr::int(1)),
            )],
        ),
        HirFunction::new(
            "main",
            vec![],
            vec![
                HirStmt::assign("x", HirExpr::int(1)),
                HirStmt::expr(HirExpr::call("inc", vec![HirExpr::var("x")])),
                HirStmt::ret(Some(HirExpr::var("x"))),
            ],
        ),
    ]);

    let main = report.routine("main").unwrap();
    assert!(main.variable("x").unwrap().is_ref());
    let inc = report.routine("inc").unwrap();
    assert!(inc.variable("v").unwrap().is_ref());
    assert_return(&report, "inc", "null");
}

// ============================================================================
// Loops and widening
// ============================================================================

#[test]
fn test_foreach_binds_element_type() {
    // $list = [1, 2, 3]; $sum = 0; foreach ($list as $v) { $sum = $sum + $v; } return $sum;
    let report = analyze(vec![HirFunction::new(
        "total",
        vec![],
        vec![
            HirStmt::assign(
                "list",
                HirExpr::array(vec![HirExpr::int(1), HirExpr::int(2), HirExpr::int(3)]),
            ),
            HirStmt::assign("sum", HirExpr::int(0)),
            HirStmt::foreach(
                HirExpr::var("list"),
                None,
                "v",
                vec![HirStmt::assign(
                    "sum",
                    HirExpr::binary(BinOp::Add, HirExpr::var("sum"), HirExpr::var("v")),
                )],
            ),
            HirStmt::ret(Some(HirExpr::var("sum"))),
        ],
    )]);

    assert_variable(&report, "total", "list", "array<int>");
    assert_variable(&report, "total", "v", "int");
    assert_return(&report, "total", "int|float");
}

#[test]
fn test_bounded_counter_stays_int() {
    // $i = 0; while ($i < 10) { $i++; } return $i;
    let bounded = analyze(vec![HirFunction::new(
        "count",
        vec![],
        vec![
            HirStmt::assign("i", HirExpr::int(0)),
            HirStmt::while_loop(
                HirExpr::binary(BinOp::Lt, HirExpr::var("i"), HirExpr::int(10)),
                vec![HirStmt::expr(HirExpr::inc_dec(IncDecKind::PostInc, HirExpr::var("i")))],
            ),
            HirStmt::ret(Some(HirExpr::var("i"))),
        ],
    )]);
    assert_return(&bounded, "count", "int");

    // without the comparison the increment may overflow
    let unbounded = analyze(vec![HirFunction::new(
        "count",
        vec![HirParam::new("flag")],
        vec![
            HirStmt::assign("i", HirExpr::int(0)),
            HirStmt::while_loop(
                HirExpr::var("flag"),
                vec![HirStmt::expr(HirExpr::inc_dec(IncDecKind::PostInc, HirExpr::var("i")))],
            ),
            HirStmt::ret(Some(HirExpr::var("i"))),
        ],
    )]);
    assert_return(&unbounded, "count", "int|float");
}

// ============================================================================
// Exceptions
// ============================================================================

#[test]
fn test_catch_merges_with_try_body() {
    // try { $x = risky(); } catch (RuntimeException $e) { $x = "failed"; } return $x;
    let report = analyze(vec![
        HirFunction::library("risky", vec![], &["int"]),
        HirFunction::new(
            "guarded",
            vec![],
            vec![
                StmtKind::Try {
                    body: vec![HirStmt::assign("x", HirExpr::call("risky", vec![]))],
                    catches: vec![CatchClause {
                        types: vec!["RuntimeException".to_string()],
                        variable: Some("e".to_string()),
                        body: vec![HirStmt::assign("x", HirExpr::string("failed"))],
                    }],
                    finally: None,
                }
                .into(),
                HirStmt::ret(Some(HirExpr::var("x"))),
            ],
        ),
    ]);

    assert_return(&report, "guarded", "int|string");
    assert_variable(&report, "guarded", "e", "RuntimeException");
}

// ============================================================================
// Reachability
// ============================================================================

#[test]
fn test_constant_condition_reports_dead_branch() {
    // if (true) { echo "a"; } else { echo "b"; }
    let report = analyze(vec![HirFunction::new(
        "r",
        vec![],
        vec![HirStmt::if_else(
            HirExpr::bool(true),
            vec![HirStmt::echo(HirExpr::string("a")).at(2, 5)],
            Some(vec![HirStmt::echo(HirExpr::string("b")).at(4, 5)]),
        )
        .at(1, 1)],
    )]);

    let unreachable = report.diagnostics_of(|kind| matches!(kind, DiagnosticKind::UnreachableCode));
    assert_eq!(unreachable.len(), 1, "{}", report.render());
    let span = unreachable[0].span.unwrap();
    assert_eq!((span.line, span.column), (4, 5));

    let quiet = analyze_with(
        vec![HirFunction::new(
            "r",
            vec![],
            vec![HirStmt::if_else(
                HirExpr::bool(true),
                vec![HirStmt::echo(HirExpr::string("a"))],
                Some(vec![HirStmt::echo(HirExpr::string("b")).at(4, 5)]),
            )],
        )],
        AnalysisConfig::default().sequential().without_reachability(),
    );
    assert!(quiet.diagnostics.is_empty());
}

// ============================================================================
// Scheduling
// ============================================================================

fn mixed_program() -> Vec<HirFunction> {
    vec![
        HirFunction::new(
            "a",
            vec![HirParam::typed("n", &["int"])],
            vec![
                HirStmt::if_else(
                    HirExpr::binary(BinOp::Gt, HirExpr::var("n"), HirExpr::int(0)),
                    vec![HirStmt::ret(Some(HirExpr::call(
                        "b",
                        vec![HirExpr::binary(BinOp::Sub, HirExpr::var("n"), HirExpr::int(1))],
                    )))],
                    None,
                ),
                HirStmt::ret(Some(HirExpr::string("done"))),
            ],
        ),
        HirFunction::new(
            "b",
            vec![HirParam::typed("n", &["int"])],
            vec![HirStmt::ret(Some(HirExpr::call("a", vec![HirExpr::var("n")])))],
        ),
        HirFunction::new(
            "c",
            vec![],
            vec![
                HirStmt::assign("s", HirExpr::call("a", vec![HirExpr::int(3)])),
                HirStmt::assign("t", HirExpr::binary(BinOp::Concat, HirExpr::var("s"), HirExpr::string("!"))),
                HirStmt::ret(Some(HirExpr::var("t"))),
            ],
        ),
    ]
}

#[test]
fn test_parallel_matches_sequential() {
    let sequential = analyze_with(mixed_program(), AnalysisConfig::default().sequential());
    let parallel = analyze_with(mixed_program(), AnalysisConfig::default().with_batch_size(2));
    let whole_queue = analyze_with(mixed_program(), AnalysisConfig::default().with_batch_size(0));

    assert_return(&sequential, "a", "string");
    assert_return(&sequential, "c", "string");
    assert_eq!(rendered_types(&sequential), rendered_types(&parallel));
    assert_eq!(rendered_types(&sequential), rendered_types(&whole_queue));
}

#[test]
fn test_replace_cfg_reanalyzes_callers() {
    init_tracing();
    let module = HirModule::new(vec![
        HirFunction::new("f", vec![], vec![HirStmt::ret(Some(HirExpr::int(1)))]),
        HirFunction::new("g", vec![], vec![HirStmt::ret(Some(HirExpr::call("f", vec![])))]),
    ]);
    let mut analyzer =
        FlowAnalyzer::new(Program::from_module(&module)).with_config(AnalysisConfig::default().sequential());
    let first = analyzer.analyze().unwrap();
    assert_return(&first, "g", "int");

    let f = first.routine("f").unwrap().routine;
    let rewritten = CfgBuilder::new().build(&[HirStmt::ret(Some(HirExpr::string("x")))]);
    let second = analyzer.replace_cfg(f, rewritten).unwrap();

    assert_return(&second, "f", "string");
    // caller states only ever grow
    assert_return(&second, "g", "int|string");
}

#[test]
fn test_deadline_abandons_every_pending_routine() {
    let report = analyze_with(
        mixed_program(),
        AnalysisConfig::default()
            .sequential()
            .with_deadline(Duration::from_millis(0)),
    );

    assert_eq!(report.failed_routines().len(), 3);
    for types in report.routines.values() {
        assert!(
            matches!(types.status, AnalysisStatus::Failed(FlowError::Abandoned { .. })),
            "{:?}",
            types.status
        );
    }
    assert!(report.describe_return("c").is_none());
}
