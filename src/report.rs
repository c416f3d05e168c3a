//! Result documents, merging and reporting.
//!
//! - [`junit`]: JUnit XML parsing and deterministic writing
//! - [`merge`]: per-module attempt merge and cross-module combination
//! - [`html`]: standalone HTML reports
//! - [`generator`]: the external report generator
//! - [`junit_adapter`]: result items back to runner-native test ids

pub mod generator;
pub mod html;
pub mod junit;
pub mod junit_adapter;
pub mod merge;

pub use generator::{GenerateOutcome, ReportGenerator};
pub use html::{render_html, write_html_report};
pub use junit::{ItemStatus, ResultCounts, ResultDocument, TestItem};
pub use junit_adapter::JunitFormat;
pub use merge::{CombinedArchive, MergedModule, ModuleArchive, combine_modules, merge_attempts};

use tracing::info;

use crate::layout::LatestLayout;
use crate::orchestrator::RunSummary;

/// Errors that can occur while reading or writing results.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Malformed result XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Failed to parse result file: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Builds the combined archive in `latest` and runs the report generator.
///
/// Generation is awaited; its failure is logged and recorded, not raised.
pub async fn merge_all(
    modules: &[ModuleArchive],
    latest: &LatestLayout,
    generator: Option<&ReportGenerator>,
) -> ReportResult<(CombinedArchive, Option<GenerateOutcome>)> {
    let archive = combine_modules(modules, latest)?;
    write_html_report("Combined results", &archive.document, &latest.report_file())?;

    let outcome = match generator {
        Some(generator) => Some(
            generator
                .generate(&archive.artifacts_dir, &latest.generated_report_dir())
                .await,
        ),
        None => {
            info!("Report generation disabled");
            None
        }
    };

    Ok((archive, outcome))
}

/// Prints per-module and combined results to the console.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("Test Results:");
    for module in &summary.modules {
        let counts = &module.counts;
        let marker = if counts.has_failures() {
            console::style("✗").red()
        } else {
            console::style("✓").green()
        };
        println!(
            "  {} {:<16} {:>4} total  {:>4} passed  {:>4} failed  {:>4} skipped  ({} attempts)",
            marker,
            module.name,
            counts.total,
            counts.passed,
            counts.failed + counts.errors,
            counts.skipped,
            module.attempts
        );
    }

    let combined = &summary.combined;
    println!();
    println!("  Total:   {}", combined.total);
    println!("  Passed:  {}", console::style(combined.passed).green());
    println!("  Failed:  {}", console::style(combined.failed + combined.errors).red());
    println!("  Skipped: {}", console::style(combined.skipped).yellow());
    println!("  Duration: {:?}", summary.duration);
    println!("  Results: {}", summary.latest_dir.display());

    match summary.report {
        Some(GenerateOutcome::Failed(_)) | Some(GenerateOutcome::Unavailable) => {
            println!("  {}", console::style("Report generation failed").yellow());
        }
        _ => {}
    }

    println!();
    if summary.modules.is_empty() {
        println!("{}", console::style("No test modules were run.").yellow().bold());
    } else if combined.has_failures() {
        println!("{}", console::style("Some tests failed.").red().bold());
    } else if combined.total == 0 {
        println!("{}", console::style("No test results were collected.").red().bold());
    } else {
        println!("{}", console::style("All tests passed!").green().bold());
    }
}
