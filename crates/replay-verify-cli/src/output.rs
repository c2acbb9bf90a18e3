//! Report rendering.

use anyhow::Result;
use owo_colors::OwoColorize;
use tabled::{Table, Tabled};

use replay_verify::range::SplitPlan;
use replay_verify::scheduler::{FailureRecord, ReplayReport};

use crate::OutputFormat;

/// Prints the final report of a run.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn print_report(report: &ReplayReport, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
        OutputFormat::Text => {
            let verdict = if report.is_success() {
                "PASSED".green().to_string()
            } else {
                "MISMATCH".red().to_string()
            };
            println!("Run: {} ({})", report.label, report.network);
            println!("Result: {verdict}");
            println!("Interval: {}", report.interval);
            println!();
            println!("Summary:");
            println!("  Ranges:     {}", report.tasks_planned);
            println!("  Attempts:   {}", report.summary.attempt_count);
            println!("  Retries:    {}", report.summary.total_retries);
            println!("  Mean:       {:.1}s", report.summary.mean_attempt_secs);
            println!("  Max:        {:.1}s", report.summary.max_attempt_secs);
            if let Some(slowest) = &report.summary.slowest_task {
                println!("  Slowest:    {slowest}");
            }
            print_records("Mismatches", &report.mismatches);
            print_records("Failures", &report.failures);
            if !report.unverified.is_empty() {
                println!();
                println!("{}", "Unverified (below minimum range size):".yellow());
                for range in &report.unverified {
                    println!("  {range}");
                }
            }
        }
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct TaskRow {
                #[tabled(rename = "Pod")]
                name: String,
                #[tabled(rename = "Attempts")]
                attempts: usize,
                #[tabled(rename = "Retries")]
                retries: u32,
                #[tabled(rename = "Total (s)")]
                total: String,
                #[tabled(rename = "Finished")]
                finished: String,
            }

            let rows: Vec<_> = report
                .stats
                .iter()
                .map(|s| TaskRow {
                    name: s.name.clone(),
                    attempts: s.durations.len(),
                    retries: s.retry_count,
                    total: format!("{:.1}", s.total_duration().as_secs_f64()),
                    finished: s.end_time.map_or_else(
                        || "-".to_string(),
                        |t| t.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ),
                })
                .collect();

            if rows.is_empty() {
                println!("No tasks ran");
            } else {
                println!("{}", Table::new(rows));
            }
            print_records("Mismatches", &report.mismatches);
            print_records("Failures", &report.failures);
        }
    }

    Ok(())
}

fn print_records(title: &str, records: &[FailureRecord]) {
    if records.is_empty() {
        return;
    }
    println!();
    println!("{}:", title.red());
    for record in records {
        let code = record
            .exit_code
            .map_or(String::new(), |code| format!(", exit code {code}"));
        println!("  {} {} ({}{code})", record.pod, record.range, record.reason);
    }
}

/// Prints a split plan.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn print_plan(plan: &SplitPlan, format: &OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(plan)?);
        }
        OutputFormat::Text => {
            println!(
                "{} ranges, {} versions",
                plan.tasks.len(),
                plan.scheduled_versions()
            );
            for range in &plan.tasks {
                println!("  {range}");
            }
            if !plan.dropped.is_empty() {
                println!(
                    "{}",
                    format!(
                        "{} ranges below the minimum size, {} versions unverified",
                        plan.dropped.len(),
                        plan.dropped_versions()
                    )
                    .yellow()
                );
                for range in &plan.dropped {
                    println!("  {}", range.dimmed());
                }
            }
        }
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct RangeRow {
                #[tabled(rename = "Start")]
                start: u64,
                #[tabled(rename = "End")]
                end: u64,
                #[tabled(rename = "Versions")]
                versions: u64,
                #[tabled(rename = "Scheduled")]
                scheduled: bool,
            }

            let mut rows: Vec<_> = plan
                .tasks
                .iter()
                .map(|r| (r, true))
                .chain(plan.dropped.iter().map(|r| (r, false)))
                .map(|(r, scheduled)| RangeRow {
                    start: r.start(),
                    end: r.end(),
                    versions: r.len(),
                    scheduled,
                })
                .collect();
            rows.sort_by_key(|row| row.start);

            if rows.is_empty() {
                println!("No ranges");
            } else {
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}
