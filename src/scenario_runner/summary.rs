use super::{RunSummary, ScenarioResult};
use anyhow::Context;
use chrono::{DateTime, Utc};
use colored::*;
use serde::Serialize;
use std::{fs, path::Path};
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};

/// JSON document written with `--report`.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub generated_at: DateTime<Utc>,
    pub scenario: &'a str,
    pub passed: bool,
    pub interrupted: bool,
    pub totals: Totals,
    pub results: &'a [ScenarioResult],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Counts every scenario that ran, included ones too.
pub fn totals(results: &[ScenarioResult]) -> Totals {
    let mut totals = Totals::default();
    for result in results {
        let inner = self::totals(&result.included);
        totals.total += inner.total + 1;
        totals.passed += inner.passed;
        totals.failed += inner.failed;
        if result.passed() {
            totals.passed += 1;
        } else {
            totals.failed += 1;
        }
    }
    totals
}

fn flatten<'a>(results: &'a [ScenarioResult], depth: usize, out: &mut Vec<(usize, &'a ScenarioResult)>) {
    for result in results {
        out.push((depth, result));
        flatten(&result.included, depth + 1, out);
    }
}

pub fn print_summary(summary: &RunSummary) {
    println!("\n{}", " Summary ".reversed().green());
    println!("run {}", summary.run_id.bright_black());

    let mut flat = vec![];
    flatten(&summary.results, 0, &mut flat);

    let mut rows = rows![row![
        TableCell::builder("Scenario".bold()).build(),
        TableCell::builder("Result".bold()).build(),
        TableCell::builder("Steps".bold()).build(),
        TableCell::builder("Attempts".bold()).build(),
        TableCell::builder("Duration (s)".bold()).build()
    ]];
    for (depth, result) in &flat {
        let status = if result.passed() {
            "✓ PASSED".green()
        } else if result.interrupted {
            "✗ INTERRUPTED".yellow()
        } else {
            "✗ FAILED".red()
        };
        let steps_ok = result.steps.iter().filter(|s| s.counted_success).count();
        let attempts: u32 = result.steps.iter().map(|s| s.attempts).sum();
        rows.push(row![
            TableCell::new(format!("{}{}", "  ".repeat(*depth), result.name)),
            TableCell::new(status),
            TableCell::new(format!("{}/{}", steps_ok, result.steps.len())),
            TableCell::new(attempts),
            TableCell::new(format!("{:.3}", result.duration_secs))
        ]);
    }

    let table = Table::builder()
        .rows(rows)
        .style(TableStyle::rounded())
        .build();
    println!("{}", table.render());

    for (_, result) in &flat {
        if let Some(error) = &result.error {
            println!("{} {}: {}", "✗".red(), result.name, error);
        }
        for step in result.steps.iter().filter(|s| !s.success) {
            let message = step.message.as_deref().unwrap_or("--");
            if step.counted_success {
                println!("{} {}/{}: {}", "!".yellow(), result.name, step.name, message.bright_black());
            } else {
                println!("{} {}/{}: {}", "✗".red(), result.name, step.name, message);
            }
        }
    }

    let t = totals(&summary.results);
    println!(
        "Total: {}, Passed: {}, Failed: {}",
        t.total,
        t.passed.to_string().green(),
        if t.failed > 0 { t.failed.to_string().red() } else { t.failed.to_string().normal() }
    );
}

pub fn write_report(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    let report = RunReport {
        run_id: &summary.run_id,
        generated_at: Utc::now(),
        scenario: &summary.scenario,
        passed: summary.passed(),
        interrupted: summary.interrupted,
        totals: totals(&summary.results),
        results: &summary.results,
    };
    let json = serde_json::to_string_pretty(&report)?;
    fs::write(path, json).context(format!("Unable to write report to {}", path.display()))?;
    Ok(())
}

pub fn print_plan(scenario: &str, lines: &[String]) {
    println!("{}", format!(" Dry run: {} ", scenario).reversed().green());
    for line in lines {
        println!("{}", line);
    }
}
