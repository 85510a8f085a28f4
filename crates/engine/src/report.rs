//! Report generation from a finished run

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use visreg_common::{
    BlobRef, BoundingBox, ComparisonFailure, PairOutcome, PairResult, Result, RunCounts,
    SuiteRunResult, ViewportClass,
};

/// Per-pair status as shown to a triager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pass,
    /// Same size, similarity below threshold
    Fail,
    /// Size changed, most likely a layout break
    DimensionMismatch,
    BaselineCreated,
    CaptureFailed,
    BaselineError,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pass => "pass",
            EntryStatus::Fail => "fail",
            EntryStatus::DimensionMismatch => "dimension mismatch",
            EntryStatus::BaselineCreated => "baseline created",
            EntryStatus::CaptureFailed => "capture failed",
            EntryStatus::BaselineError => "baseline error",
        }
    }

    /// Failed because the pages look different
    pub fn is_visual_failure(&self) -> bool {
        matches!(self, EntryStatus::Fail | EntryStatus::DimensionMismatch)
    }

    /// Failed because nothing could be measured
    pub fn is_unmeasured(&self) -> bool {
        matches!(self, EntryStatus::CaptureFailed | EntryStatus::BaselineError)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub page: String,
    pub page_name: String,
    pub viewport: ViewportClass,
    pub width: u32,
    pub height: u32,
    pub status: EntryStatus,
    pub similarity: Option<f64>,
    pub threshold: Option<f64>,
    pub baseline_version: Option<u32>,
    pub largest_cluster: Option<BoundingBox>,
    pub diff_pixels: Option<u64>,
    pub diff_image: Option<BlobRef>,
    pub capture: Option<BlobRef>,
    /// Human-readable explanation for anything that is not a plain pass
    pub detail: Option<String>,
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ReportEntry {
    fn from_pair(pair: &PairResult) -> Self {
        let mut entry = ReportEntry {
            page: pair.key.page.clone(),
            page_name: pair.page_name.clone(),
            viewport: pair.viewport.class,
            width: pair.viewport.width,
            height: pair.viewport.height,
            status: EntryStatus::Pass,
            similarity: None,
            threshold: None,
            baseline_version: None,
            largest_cluster: None,
            diff_pixels: None,
            diff_image: None,
            capture: pair.capture.clone(),
            detail: None,
            attempts: pair.capture_attempts,
            duration_ms: pair.duration_ms,
        };

        match &pair.outcome {
            PairOutcome::BaselineCreated { version, reason } => {
                entry.status = EntryStatus::BaselineCreated;
                entry.baseline_version = Some(*version);
                entry.detail = Some(format!("v{} ({:?})", version, reason).to_lowercase());
            }
            PairOutcome::Compared(c) => {
                entry.threshold = Some(c.threshold);
                entry.baseline_version = c.baseline_version;
                entry.diff_image = c.diff_image.clone();
                entry.status = match &c.failure {
                    None => {
                        entry.similarity = Some(c.similarity);
                        entry.diff_pixels = Some(c.metadata.diff_pixels);
                        entry.largest_cluster = c.metadata.largest_cluster;
                        EntryStatus::Pass
                    }
                    // Sizes differ, so no pixels were compared
                    Some(ComparisonFailure::DimensionMismatch { candidate, baseline }) => {
                        entry.detail =
                            Some(format!("captured {} but baseline is {}", candidate, baseline));
                        EntryStatus::DimensionMismatch
                    }
                    Some(ComparisonFailure::BelowThreshold { similarity, threshold }) => {
                        entry.similarity = Some(*similarity);
                        entry.diff_pixels = Some(c.metadata.diff_pixels);
                        entry.largest_cluster = c.metadata.largest_cluster;
                        entry.detail = Some(format!(
                            "similarity {:.4} below threshold {:.4}",
                            similarity, threshold
                        ));
                        EntryStatus::Fail
                    }
                };
            }
            PairOutcome::CaptureFailed { reason, attempts } => {
                entry.status = EntryStatus::CaptureFailed;
                entry.detail = Some(format!("{} (after {} attempt(s))", reason, attempts));
            }
            PairOutcome::BaselineError { reason } => {
                entry.status = EntryStatus::BaselineError;
                entry.detail = Some(reason.clone());
            }
        }
        entry
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    /// Visual failures, dimension mismatches included
    pub failed: usize,
    pub dimension_mismatches: usize,
    pub baseline_created: usize,
    /// Capture failures plus baseline errors
    pub unmeasured: usize,
    pub capture_failed: usize,
    pub baseline_errors: usize,
}

impl ReportSummary {
    fn new(counts: &RunCounts, entries: &[ReportEntry]) -> Self {
        Self {
            total: counts.total,
            passed: counts.passed,
            failed: counts.failed,
            dimension_mismatches: entries
                .iter()
                .filter(|e| e.status == EntryStatus::DimensionMismatch)
                .count(),
            baseline_created: counts.baseline_created,
            unmeasured: counts.capture_failed + counts.baseline_errors,
            capture_failed: counts.capture_failed,
            baseline_errors: counts.baseline_errors,
        }
    }
}

/// Structured report of one suite run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub clean: bool,
    pub cancelled: bool,
    pub summary: ReportSummary,
    pub entries: Vec<ReportEntry>,
}

impl Report {
    /// Pure transformation of a run result; performs no I/O
    pub fn generate(run: &SuiteRunResult) -> Self {
        let entries: Vec<ReportEntry> = run.results.iter().map(ReportEntry::from_pair).collect();
        Self {
            run_id: run.run_id.clone(),
            suite: run.suite.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            clean: run.is_clean(),
            cancelled: run.cancelled,
            summary: ReportSummary::new(&run.counts, &entries),
            entries,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn visual_failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.status.is_visual_failure())
    }

    pub fn unmeasured(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.status.is_unmeasured())
    }

    /// Human-readable summary with a per-target table
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let verdict = if self.clean {
            "CLEAN"
        } else if self.cancelled {
            "CANCELLED"
        } else {
            "NOT CLEAN"
        };

        let _ = writeln!(md, "# Visual regression report: {}", self.suite);
        let _ = writeln!(md);
        let _ = writeln!(md, "- Run: `{}`", self.run_id);
        let _ = writeln!(md, "- Started: {}", self.started_at.to_rfc3339());
        let _ = writeln!(md, "- Finished: {} ({} ms)", self.finished_at.to_rfc3339(), self.duration_ms);
        let _ = writeln!(md, "- Verdict: **{}**", verdict);
        let _ = writeln!(md);

        let s = &self.summary;
        let _ = writeln!(md, "| Total | Passed | Failed | Baselines created | Unmeasured |");
        let _ = writeln!(md, "|------:|-------:|-------:|------------------:|-----------:|");
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} |",
            s.total, s.passed, s.failed, s.baseline_created, s.unmeasured
        );
        let _ = writeln!(md);

        let _ = writeln!(md, "## Targets");
        let _ = writeln!(md);
        let _ = writeln!(md, "| Page | Viewport | Status | Similarity | Diff |");
        let _ = writeln!(md, "|------|----------|--------|-----------:|------|");
        for e in &self.entries {
            let _ = writeln!(
                md,
                "| {} | {} ({}x{}) | {} | {} | {} |",
                e.page_name,
                e.viewport,
                e.width,
                e.height,
                e.status.as_str(),
                e.similarity.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string()),
                e.diff_image.as_ref().map(|b| format!("`{}`", b)).unwrap_or_else(|| "-".to_string()),
            );
        }

        let visual: Vec<_> = self.visual_failures().collect();
        if !visual.is_empty() {
            let _ = writeln!(md);
            let _ = writeln!(md, "## Visual differences");
            let _ = writeln!(md);
            for e in visual {
                let _ = write!(md, "- **{}@{}**: {}", e.page, e.viewport, e.detail.as_deref().unwrap_or(""));
                if let Some(bbox) = &e.largest_cluster {
                    let _ = write!(
                        md,
                        "; largest change at ({}, {}) {}x{}",
                        bbox.x, bbox.y, bbox.width, bbox.height
                    );
                }
                let _ = writeln!(md);
            }
        }

        let unmeasured: Vec<_> = self.unmeasured().collect();
        if !unmeasured.is_empty() {
            let _ = writeln!(md);
            let _ = writeln!(md, "## Could not be measured");
            let _ = writeln!(md);
            for e in unmeasured {
                let _ = writeln!(
                    md,
                    "- **{}@{}** ({}): {}",
                    e.page,
                    e.viewport,
                    e.status.as_str(),
                    e.detail.as_deref().unwrap_or("")
                );
            }
        }
        md
    }
}
