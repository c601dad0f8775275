//! Console output for the provision CLI.
//!
//! Per-host progress lines and the final run summary. Detailed tool output
//! goes through `tracing`; this is the short human-readable layer on top.

use std::time::Duration;

use colored::Colorize;

use crate::orchestrator::RunSummary;

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

/// One summary line per host, in input order.
#[must_use]
pub fn summary_lines(summary: &RunSummary) -> Vec<String> {
    summary
        .results
        .iter()
        .map(|result| match &result.outcome {
            Ok(_) => format!(
                "[OK]   {} ({})",
                result.host,
                format_elapsed(result.elapsed)
            ),
            Err(e) => format!("[FAIL] {}: {e}", result.host),
        })
        .collect()
}

/// Print the end-of-run summary.
pub fn print_summary(summary: &RunSummary) {
    print_section("Provisioning Summary");
    for (line, result) in summary_lines(summary).iter().zip(&summary.results) {
        if result.outcome.is_ok() {
            println!("  {}", line.green());
        } else {
            println!("  {}", line.red());
        }
    }
    println!();

    let failed = summary.failures();
    let total = summary.results.len();
    if failed == 0 {
        print_success(&format!("All {total} host(s) provisioned"));
    } else {
        print_error(&format!("{failed} of {total} host(s) failed"));
    }
}
