/// Scenario runner: executes every scenario in sequence and produces an
/// aggregated pass/fail report.
///
/// Scenarios: bootstrap → capacity → failover → flood
use std::time::Instant;

use serde::Serialize;

use crate::events::emit;
use crate::scenario_common::ScenarioResult;
use crate::{scenario_bootstrap, scenario_capacity, scenario_failover, scenario_flood};

#[derive(Serialize)]
struct RunnerSummary {
    event: &'static str,
    scenarios: Vec<ScenarioLine>,
    total_passed: usize,
    total_failed: usize,
    total_elapsed_s: f64,
    overall_status: &'static str,
}

#[derive(Serialize)]
struct ScenarioLine {
    scenario: String,
    status: &'static str,
    passed: usize,
    failed: usize,
    elapsed_ms: f64,
}

/// Returns whether every scenario passed.
pub async fn run(group: &str) -> bool {
    let runner_start = Instant::now();

    let scenarios: Vec<(&str, anyhow::Result<ScenarioResult>)> = vec![
        ("bootstrap", announce("bootstrap", scenario_bootstrap::run(group, 5)).await),
        ("capacity", announce("capacity", scenario_capacity::run(group, 3, 5)).await),
        ("failover", announce("failover", scenario_failover::run(group, 3)).await),
        ("flood", announce("flood", scenario_flood::run(group, 6, 20)).await),
    ];

    let mut lines = Vec::new();
    let mut total_passed = 0usize;
    let mut total_failed = 0usize;

    for (name, result) in &scenarios {
        match result {
            Ok(r) => {
                r.print_summary();
                emit(r);
                total_passed += r.passed;
                total_failed += r.failed;
                lines.push(ScenarioLine {
                    scenario: name.to_string(),
                    status: if r.success() { "PASS" } else { "FAIL" },
                    passed: r.passed,
                    failed: r.failed,
                    elapsed_ms: r.total_ms,
                });
            }
            Err(e) => {
                eprintln!("\n[FAIL] Scenario {name}: {e}");
                total_failed += 1;
                lines.push(ScenarioLine {
                    scenario: name.to_string(),
                    status: "ERROR",
                    passed: 0,
                    failed: 1,
                    elapsed_ms: 0.0,
                });
            }
        }
    }

    let all_passed = lines.iter().all(|l| l.status == "PASS");
    let overall = if all_passed { "PASS" } else { "FAIL" };
    let elapsed_s = runner_start.elapsed().as_secs_f64();

    let summary = RunnerSummary {
        event: "scenario_runner_summary",
        scenarios: lines,
        total_passed,
        total_failed,
        total_elapsed_s: elapsed_s,
        overall_status: overall,
    };
    emit(&summary);

    eprintln!("\n── Summary ─────────────────────────────────");
    for s in &summary.scenarios {
        let icon = if s.status == "PASS" { " OK " } else { "FAIL" };
        eprintln!(
            "  [{icon}] {:<10} {}/{} steps ({:.1}ms)",
            s.scenario,
            s.passed,
            s.passed + s.failed,
            s.elapsed_ms,
        );
    }
    eprintln!("  Total: {total_passed} passed, {total_failed} failed | {elapsed_s:.1}s | [{overall}]");

    all_passed
}

async fn announce(
    name: &str,
    future: impl std::future::Future<Output = anyhow::Result<ScenarioResult>>,
) -> anyhow::Result<ScenarioResult> {
    eprintln!("\n── Running scenario: {name} ──");
    future.await
}
