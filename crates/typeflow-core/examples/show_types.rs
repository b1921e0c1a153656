//! Demo: Show inferred types from the flow analysis
//!
//! Run with `RUST_LOG=typeflow_core=debug` to watch the drain loop.

use typeflow_core::hir::{BinOp, HirExpr, HirFunction, HirModule, HirParam, HirStmt};
use typeflow_core::{AnalysisConfig, DocHints, FlowAnalyzer, Program};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // function stats(array $numbers) {
    //     $total = 0; $count = 0;
    //     foreach ($numbers as $num) { $total = $total + $num; $count++; }
    //     if ($count > 0) { $average = $total / $count; } else { $average = 0.0; }
    //     return [$total, $average];
    // }
    let stats = HirFunction::new(
        "stats",
        vec![HirParam::new("numbers")],
        vec![
            HirStmt::assign("total", HirExpr::int(0)),
            HirStmt::assign("count", HirExpr::int(0)),
            HirStmt::foreach(
                HirExpr::var("numbers"),
                None,
                "num",
                vec![
                    HirStmt::assign(
                        "total",
                        HirExpr::binary(BinOp::Add, HirExpr::var("total"), HirExpr::var("num")),
                    ),
                    HirStmt::expr(HirExpr::inc_dec(
                        typeflow_core::hir::IncDecKind::PostInc,
                        HirExpr::var("count"),
                    )),
                ],
            ),
            HirStmt::if_else(
                HirExpr::binary(BinOp::Gt, HirExpr::var("count"), HirExpr::int(0)),
                vec![HirStmt::assign(
                    "average",
                    HirExpr::binary(BinOp::Div, HirExpr::var("total"), HirExpr::var("count")),
                )],
                Some(vec![HirStmt::assign("average", HirExpr::float(0.0))]),
            ),
            HirStmt::ret(Some(HirExpr::array(vec![HirExpr::var("total"), HirExpr::var("average")]))),
        ],
    );

    // function find_max($items) { if (count($items) === 0) return null; return $items[0]; }
    let find_max = HirFunction::new(
        "find_max",
        vec![HirParam::new("items")],
        vec![
            HirStmt::if_else(
                HirExpr::binary(
                    BinOp::Identical,
                    HirExpr::call("count", vec![HirExpr::var("items")]),
                    HirExpr::int(0),
                ),
                vec![HirStmt::ret(Some(HirExpr::null()))],
                None,
            ),
            HirStmt::ret(Some(HirExpr::index(HirExpr::var("items"), Some(HirExpr::int(0))))),
        ],
    );

    let docs = DocHints::new()
        .with_param("stats", "numbers", &["int[]"])
        .with_param("find_max", "items", &["string[]"]);
    let program = Program::from_module(&HirModule::new(vec![stats, find_max])).with_doc_hints(docs);

    let report = FlowAnalyzer::new(program)
        .with_config(AnalysisConfig::default())
        .analyze()?;

    println!("=== Flow Type Inference Results ===\n");
    for types in report.routines.values() {
        println!("Function: {}", types.name);
        println!("{}", "-".repeat(40));
        print!("{}", types.render(report.types()));
        println!();
    }

    if !report.diagnostics.is_empty() {
        println!("Diagnostics:");
        for diagnostic in &report.diagnostics {
            println!("  [{:?}] {}", diagnostic.severity(), diagnostic);
        }
    }

    println!(
        "\n{} batches, {} blocks, {} dirty flushes",
        report.stats.batches, report.stats.blocks, report.stats.dirty_flushes
    );
    Ok(())
}
