//! Core types for visreg

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::BlobRef;
use crate::error::Error;

/// Named viewport class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewportClass {
    Desktop,
    Tablet,
    Mobile,
}

impl ViewportClass {
    pub const ALL: [ViewportClass; 3] = [
        ViewportClass::Desktop,
        ViewportClass::Tablet,
        ViewportClass::Mobile,
    ];

    /// Preset pixel size for this class
    pub fn default_size(&self) -> (u32, u32) {
        match self {
            ViewportClass::Desktop => (1920, 1080),
            ViewportClass::Tablet => (768, 1024),
            ViewportClass::Mobile => (375, 667),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewportClass::Desktop => "desktop",
            ViewportClass::Tablet => "tablet",
            ViewportClass::Mobile => "mobile",
        }
    }
}

impl fmt::Display for ViewportClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViewportClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(ViewportClass::Desktop),
            "tablet" => Ok(ViewportClass::Tablet),
            "mobile" => Ok(ViewportClass::Mobile),
            other => Err(Error::InvalidConfig(format!(
                "unknown viewport class '{}' (expected desktop, tablet or mobile)",
                other
            ))),
        }
    }
}

/// A viewport class with its fixed pixel size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "ViewportSpecRepr")]
pub struct ViewportSpec {
    pub class: ViewportClass,
    pub width: u32,
    pub height: u32,
}

impl ViewportSpec {
    pub fn preset(class: ViewportClass) -> Self {
        let (width, height) = class.default_size();
        Self { class, width, height }
    }

    pub fn new(class: ViewportClass, width: u32, height: u32) -> Self {
        Self { class, width, height }
    }
}

impl From<ViewportClass> for ViewportSpec {
    fn from(class: ViewportClass) -> Self {
        Self::preset(class)
    }
}

impl fmt::Display for ViewportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}x{})", self.class, self.width, self.height)
    }
}

/// Viewports may be written as a bare preset name or with explicit size.
#[derive(Deserialize)]
#[serde(untagged)]
enum ViewportSpecRepr {
    Preset(ViewportClass),
    Explicit {
        class: ViewportClass,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        height: Option<u32>,
    },
}

impl From<ViewportSpecRepr> for ViewportSpec {
    fn from(repr: ViewportSpecRepr) -> Self {
        match repr {
            ViewportSpecRepr::Preset(class) => ViewportSpec::preset(class),
            ViewportSpecRepr::Explicit { class, width, height } => {
                let (w, h) = class.default_size();
                ViewportSpec::new(class, width.unwrap_or(w), height.unwrap_or(h))
            }
        }
    }
}

/// Identity of one (page, viewport) pair within a suite
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetKey {
    pub page: String,
    pub viewport: ViewportClass,
}

impl TargetKey {
    pub fn new(page: impl Into<String>, viewport: ViewportClass) -> Self {
        Self {
            page: page.into(),
            viewport,
        }
    }

    /// Relative storage path, `<page>/<viewport>`
    pub fn storage_path(&self) -> String {
        format!("{}/{}", self.page, self.viewport)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.page, self.viewport)
    }
}

/// What to capture: one page across a set of viewports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTarget {
    /// Stable page identifier, used in storage keys
    pub id: String,

    /// Human-readable page name
    pub name: String,

    /// URL path relative to the application base URL
    pub path: String,

    pub viewports: Vec<ViewportSpec>,

    /// Per-target similarity threshold override
    #[serde(default)]
    pub threshold: Option<f64>,

    /// Per-target full-page override
    #[serde(default)]
    pub full_page: Option<bool>,
}

impl CaptureTarget {
    pub fn new(id: impl Into<String>, path: impl Into<String>, viewports: Vec<ViewportSpec>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            path: path.into(),
            viewports,
            threshold: None,
            full_page: None,
        }
    }

    pub fn key(&self, viewport: ViewportClass) -> TargetKey {
        TargetKey::new(self.id.clone(), viewport)
    }
}

/// Pixel dimensions of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A captured screenshot, immutable once produced
#[derive(Debug, Clone, Serialize)]
pub struct ScreenshotArtifact {
    pub key: TargetKey,
    pub page_name: String,
    pub viewport: ViewportSpec,
    pub captured_at: DateTime<Utc>,
    pub dimensions: Dimensions,

    /// SHA-256 of the encoded image
    pub digest: String,

    /// Where the run stored the bytes
    pub blob: Option<BlobRef>,

    #[serde(skip)]
    pub bytes: Bytes,
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Why a comparison did not pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonFailure {
    /// Sizes differ; no pixel comparison was attempted
    DimensionMismatch {
        candidate: Dimensions,
        baseline: Dimensions,
    },
    BelowThreshold { similarity: f64, threshold: f64 },
}

impl fmt::Display for ComparisonFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonFailure::DimensionMismatch { candidate, baseline } => {
                write!(f, "dimension mismatch: candidate {} vs baseline {}", candidate, baseline)
            }
            ComparisonFailure::BelowThreshold { similarity, threshold } => {
                write!(f, "similarity {:.4} below threshold {:.4}", similarity, threshold)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffMetadata {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    pub cluster_count: usize,
    pub largest_cluster: Option<BoundingBox>,
    pub largest_cluster_pixels: u64,
}

/// Outcome of comparing a candidate against its baseline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub key: TargetKey,
    /// Fraction of pixels within tolerance, in [0, 1]
    pub similarity: f64,
    pub threshold: f64,
    pub passed: bool,
    pub failure: Option<ComparisonFailure>,
    pub metadata: DiffMetadata,
    pub candidate_digest: String,
    pub baseline_digest: String,
    pub baseline_version: Option<u32>,
    pub diff_image: Option<BlobRef>,
}

impl ComparisonResult {
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(self.failure, Some(ComparisonFailure::DimensionMismatch { .. }))
    }

    pub fn with_baseline_version(mut self, version: u32) -> Self {
        self.baseline_version = Some(version);
        self
    }

    pub fn with_diff_image(mut self, blob: BlobRef) -> Self {
        self.diff_image = Some(blob);
        self
    }
}

/// Why a baseline was written instead of comparing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineReason {
    Missing,
    Forced,
}

/// Terminal outcome for one (page, viewport) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairOutcome {
    BaselineCreated { version: u32, reason: BaselineReason },
    Compared(ComparisonResult),
    CaptureFailed { reason: String, attempts: u32 },
    BaselineError { reason: String },
}

impl PairOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, PairOutcome::Compared(c) if c.passed)
    }

    pub fn is_visual_failure(&self) -> bool {
        matches!(self, PairOutcome::Compared(c) if !c.passed)
    }

    /// Failed without a measurement being possible
    pub fn is_unmeasured(&self) -> bool {
        matches!(
            self,
            PairOutcome::CaptureFailed { .. } | PairOutcome::BaselineError { .. }
        )
    }

    pub fn comparison(&self) -> Option<&ComparisonResult> {
        match self {
            PairOutcome::Compared(c) => Some(c),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairResult {
    pub key: TargetKey,
    pub page_name: String,
    pub viewport: ViewportSpec,
    pub outcome: PairOutcome,
    pub capture: Option<BlobRef>,
    pub capture_attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub baseline_created: usize,
    pub capture_failed: usize,
    pub baseline_errors: usize,
}

impl RunCounts {
    pub fn tally<'a>(results: impl IntoIterator<Item = &'a PairResult>) -> Self {
        let mut counts = RunCounts::default();
        for result in results {
            counts.total += 1;
            match &result.outcome {
                PairOutcome::BaselineCreated { .. } => counts.baseline_created += 1,
                PairOutcome::Compared(c) if c.passed => counts.passed += 1,
                PairOutcome::Compared(_) => counts.failed += 1,
                PairOutcome::CaptureFailed { .. } => counts.capture_failed += 1,
                PairOutcome::BaselineError { .. } => counts.baseline_errors += 1,
            }
        }
        counts
    }
}

/// Aggregate result of one suite run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteRunResult {
    pub run_id: String,
    pub suite: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<PairResult>,
    pub counts: RunCounts,
    /// Set when the run stopped early; `results` holds completed pairs only
    pub cancelled: bool,
}

impl SuiteRunResult {
    pub fn new(
        run_id: String,
        suite: String,
        started_at: DateTime<Utc>,
        results: Vec<PairResult>,
        cancelled: bool,
    ) -> Self {
        let counts = RunCounts::tally(&results);
        Self {
            run_id,
            suite,
            started_at,
            finished_at: Utc::now(),
            results,
            counts,
            cancelled,
        }
    }

    /// No failing comparisons, no unmeasured pairs, and the run completed
    pub fn is_clean(&self) -> bool {
        !self.cancelled
            && self.counts.failed == 0
            && self.counts.capture_failed == 0
            && self.counts.baseline_errors == 0
    }

    pub fn get(&self, key: &TargetKey) -> Option<&PairResult> {
        self.results.iter().find(|r| &r.key == key)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at).num_milliseconds().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viewport_spec_from_preset_name() {
        let spec: ViewportSpec = serde_json::from_str("\"mobile\"").unwrap();
        assert_eq!(spec, ViewportSpec::new(ViewportClass::Mobile, 375, 667));
    }

    #[test]
    fn test_viewport_spec_explicit_size() {
        let spec: ViewportSpec =
            serde_json::from_str(r#"{"class":"mobile","width":390,"height":844}"#).unwrap();
        assert_eq!(spec.width, 390);
        assert_eq!(spec.height, 844);

        // Serialized form reads back identically
        let json = serde_json::to_string(&spec).unwrap();
        let back: ViewportSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_viewport_class_parse() {
        assert_eq!("Tablet".parse::<ViewportClass>().unwrap(), ViewportClass::Tablet);
        assert!("watch".parse::<ViewportClass>().is_err());
    }

    #[test]
    fn test_target_key_display() {
        let key = TargetKey::new("home", ViewportClass::Desktop);
        assert_eq!(key.to_string(), "home@desktop");
        assert_eq!(key.storage_path(), "home/desktop");
    }

    #[test]
    fn test_bounding_box_contains() {
        let bbox = BoundingBox { x: 10, y: 10, width: 5, height: 5 };
        assert!(bbox.contains(10, 14));
        assert!(!bbox.contains(15, 10));
        assert_eq!(bbox.area(), 25);
    }

    fn pair(page: &str, outcome: PairOutcome) -> PairResult {
        PairResult {
            key: TargetKey::new(page, ViewportClass::Desktop),
            page_name: page.to_string(),
            viewport: ViewportSpec::preset(ViewportClass::Desktop),
            outcome,
            capture: None,
            capture_attempts: 1,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_clean_verdict() {
        let created = pair(
            "a",
            PairOutcome::BaselineCreated { version: 1, reason: BaselineReason::Missing },
        );
        let run = SuiteRunResult::new("r".into(), "s".into(), Utc::now(), vec![created.clone()], false);
        assert!(run.is_clean());
        assert_eq!(run.counts.baseline_created, 1);
        assert_eq!(run.counts.passed, 0);

        let failed = pair(
            "b",
            PairOutcome::CaptureFailed { reason: "timeout".into(), attempts: 2 },
        );
        let run = SuiteRunResult::new("r".into(), "s".into(), Utc::now(), vec![created, failed], false);
        assert!(!run.is_clean());
        assert_eq!(run.counts.capture_failed, 1);
    }

    #[test]
    fn test_cancelled_run_is_not_clean() {
        let run = SuiteRunResult::new("r".into(), "s".into(), Utc::now(), vec![], true);
        assert!(!run.is_clean());
    }
}
