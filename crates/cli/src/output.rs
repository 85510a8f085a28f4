//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use serde::Serialize;

use visreg_engine::baseline::{BaselineSummary, BaselineVersion};
use visreg_engine::report::{EntryStatus, Report, ReportEntry};

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// Markdown format
    Markdown,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        _ if items.is_empty() => println!("No items found."),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic);

            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }

            println!("{table}");
        }
        OutputFormat::Markdown => print!("{}", markdown_table(items)),
    }
}

fn markdown_table<T: TableDisplay>(items: &[T]) -> String {
    let headers = T::headers();
    let mut md = format!("| {} |\n", headers.join(" | "));
    md.push_str(&format!("|{}\n", "---|".repeat(headers.len())));
    for item in items {
        md.push_str(&format!("| {} |\n", item.row().join(" | ")));
    }
    md
}

/// Print a run report
pub fn print_report(report: &Report, format: OutputFormat) {
    match format {
        OutputFormat::Json => match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => print_error(&format!("Failed to serialize report: {}", e)),
        },
        OutputFormat::Markdown => print!("{}", report.to_markdown()),
        OutputFormat::Table => print_report_table(report),
    }
}

fn status_cell(status: EntryStatus) -> Cell {
    let color = match status {
        EntryStatus::Pass => Color::Green,
        EntryStatus::BaselineCreated => Color::Cyan,
        EntryStatus::Fail | EntryStatus::DimensionMismatch => Color::Red,
        EntryStatus::CaptureFailed | EntryStatus::BaselineError => Color::Yellow,
    };
    Cell::new(status.as_str()).fg(color)
}

fn print_report_table(report: &Report) {
    println!();
    println!("{}", "━".repeat(60).dimmed());
    println!("{}", format!(" Visual Regression: {}", report.suite).bold());
    println!("{}", "━".repeat(60).dimmed());
    println!("   Run:      {}", report.run_id);
    println!("   Duration: {} ms", report.duration_ms);
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(ReportEntry::headers());
    for entry in &report.entries {
        let mut row = entry.row();
        row.remove(2);
        let mut cells: Vec<Cell> = row.into_iter().map(Cell::new).collect();
        cells.insert(2, status_cell(entry.status));
        table.add_row(cells);
    }
    println!("{table}");

    let visual: Vec<_> = report.visual_failures().collect();
    if !visual.is_empty() {
        println!();
        println!("{}", " Visual differences".bold());
        for e in visual {
            println!(
                "   {} {}@{}: {}",
                "✗".red(),
                e.page,
                e.viewport,
                e.detail.as_deref().unwrap_or("")
            );
            if let Some(diff) = &e.diff_image {
                println!("     diff: {}", diff.to_string().dimmed());
            }
        }
    }

    let unmeasured: Vec<_> = report.unmeasured().collect();
    if !unmeasured.is_empty() {
        println!();
        println!("{}", " Could not be measured".bold());
        for e in unmeasured {
            println!(
                "   {} {}@{}: {}",
                "!".yellow(),
                e.page,
                e.viewport,
                e.detail.as_deref().unwrap_or("")
            );
        }
    }

    let s = &report.summary;
    println!();
    println!(
        "   {} passed, {} failed, {} baseline(s) created, {} unmeasured",
        s.passed.to_string().green(),
        s.failed.to_string().red(),
        s.baseline_created.to_string().cyan(),
        s.unmeasured.to_string().yellow()
    );
    let verdict = if report.clean {
        "✅ CLEAN".green().bold()
    } else if report.cancelled {
        "⚠️  CANCELLED".yellow().bold()
    } else {
        "❌ NOT CLEAN".red().bold()
    };
    println!("   Verdict: {}", verdict);
    println!("{}", "━".repeat(60).dimmed());
}

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "Error:".red().bold(), message);
}

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

impl TableDisplay for ReportEntry {
    fn headers() -> Vec<&'static str> {
        vec!["Page", "Viewport", "Status", "Similarity", "Baseline", "Attempts"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.page_name.clone(),
            format!("{} ({}x{})", self.viewport, self.width, self.height),
            self.status.as_str().to_string(),
            or_dash(self.similarity.map(|s| format!("{:.4}", s))),
            or_dash(self.baseline_version.map(|v| format!("v{}", v))),
            self.attempts.to_string(),
        ]
    }
}

impl TableDisplay for BaselineSummary {
    fn headers() -> Vec<&'static str> {
        vec!["Key", "Active", "Versions", "Size", "Digest", "Created"]
    }

    fn row(&self) -> Vec<String> {
        let active = self.active.as_ref();
        vec![
            self.key.to_string(),
            or_dash(active.map(|v| format!("v{}", v.version))),
            self.version_count.to_string(),
            or_dash(active.map(|v| v.dimensions)),
            or_dash(active.map(|v| v.digest[..12.min(v.digest.len())].to_string())),
            or_dash(active.map(|v| v.created_at.format("%Y-%m-%d %H:%M:%S"))),
        ]
    }
}

impl TableDisplay for BaselineVersion {
    fn headers() -> Vec<&'static str> {
        vec!["Version", "Size", "Bytes", "Digest", "Source", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            format!("v{}", self.version),
            self.dimensions.to_string(),
            self.size_bytes.to_string(),
            self.digest[..12.min(self.digest.len())].to_string(),
            self.source.clone().unwrap_or_else(|| "-".to_string()),
            self.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]
    }
}
