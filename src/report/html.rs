//! Self-contained HTML report for a result document.

use std::path::Path;

use maud::{DOCTYPE, Markup, PreEscaped, html};

use super::ReportResult;
use super::junit::{ItemStatus, ResultDocument, TestItem};

const STYLE: &str = r#"
body { font-family: -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; margin: 2rem; color: #222; }
h1 { font-size: 1.4rem; }
.summary span { display: inline-block; margin-right: 1.2rem; font-weight: 600; }
table { border-collapse: collapse; width: 100%; margin-top: 1rem; }
th, td { text-align: left; padding: 0.35rem 0.6rem; border-bottom: 1px solid #e4e4e4; vertical-align: top; }
th { background: #f6f6f6; }
tr.passed td.status { color: #1a7f37; }
tr.failed td.status, tr.error td.status { color: #cf222e; font-weight: 600; }
tr.skipped td.status { color: #9a6700; }
pre { margin: 0.3rem 0 0; white-space: pre-wrap; font-size: 0.8rem; color: #555; }
"#;

/// Renders `document` as a standalone HTML page.
pub fn render_html(title: &str, document: &ResultDocument) -> String {
    let counts = document.counts();
    let markup = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { (title) }
                style { (PreEscaped(STYLE)) }
            }
            body {
                h1 { (title) }
                div.summary {
                    span { "Total: " (counts.total) }
                    span { "Passed: " (counts.passed) }
                    span { "Failed: " (counts.failed) }
                    span { "Errors: " (counts.errors) }
                    span { "Skipped: " (counts.skipped) }
                }
                @for (suite, items) in document.suites() {
                    h2 { (suite) }
                    table {
                        thead {
                            tr { th { "Test" } th { "Status" } th { "Time (s)" } }
                        }
                        tbody {
                            @for item in items {
                                (row(item))
                            }
                        }
                    }
                }
            }
        }
    };
    markup.into_string()
}

fn row(item: &TestItem) -> Markup {
    html! {
        tr class=(item.status.as_str()) {
            td {
                @if !item.classname.is_empty() {
                    (item.classname) " :: "
                }
                (item.name)
                @if item.status != ItemStatus::Passed {
                    @if let Some(message) = &item.message {
                        pre { (message) }
                    }
                    @if let Some(details) = &item.details {
                        pre { (details) }
                    }
                }
            }
            td.status { (item.status.as_str()) }
            td { (format!("{:.3}", item.duration_ms as f64 / 1000.0)) }
        }
    }
}

/// Writes the HTML report for `document` to `path`.
pub fn write_html_report(title: &str, document: &ResultDocument, path: &Path) -> ReportResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_html(title, document))?;
    Ok(())
}
