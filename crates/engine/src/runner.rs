//! Regression test runner: capture, then promote or compare, per pair

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use visreg_common::{
    BaselineReason, BlobStore, Error, PairOutcome, PairResult, Result, ScreenshotArtifact,
    SuiteRunResult, TargetKey, ViewportClass,
};

use crate::baseline::BaselineStore;
use crate::compare::{compare, compare_encoded, encode_png, CompareOptions, DecodedImage};
use crate::context::RunContext;
use crate::driver::BrowserDriver;
use crate::orchestrator::{CaptureJob, CaptureOrchestrator, CaptureRecord, CaptureSettings};
use crate::report::Report;
use crate::suite::SuiteConfig;

/// Name of the persisted report inside a run namespace
pub const REPORT_FILE: &str = "report.json";

/// Narrows a run to one page and/or a subset of viewports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFilter {
    #[serde(default)]
    pub page: Option<String>,
    /// Empty means every configured viewport
    #[serde(default)]
    pub viewports: Vec<ViewportClass>,
}

impl RunFilter {
    pub fn is_empty(&self) -> bool {
        self.page.is_none() && self.viewports.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Replace baselines with this run's captures instead of comparing
    pub update_baselines: bool,
    pub filter: RunFilter,
}

/// Lifecycle of a single (page, viewport) pair within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Pending,
    Captured,
    CaptureFailed,
    BaselineCreated,
    Compared,
    Done,
}

impl PairState {
    fn can_advance_to(self, next: PairState) -> bool {
        use PairState::*;
        matches!(
            (self, next),
            (Pending, Captured)
                | (Pending, CaptureFailed)
                | (Captured, BaselineCreated)
                | (Captured, Compared)
                // baseline I/O errors end the pair straight after capture
                | (Captured, Done)
                | (CaptureFailed, Done)
                | (BaselineCreated, Done)
                | (Compared, Done)
        )
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PairState::Pending => "PENDING",
            PairState::Captured => "CAPTURED",
            PairState::CaptureFailed => "CAPTURE_FAILED",
            PairState::BaselineCreated => "BASELINE_CREATED",
            PairState::Compared => "COMPARED",
            PairState::Done => "DONE",
        };
        write!(f, "{}", s)
    }
}

struct PairTracker {
    key: TargetKey,
    state: PairState,
}

impl PairTracker {
    fn new(key: TargetKey) -> Self {
        Self {
            key,
            state: PairState::Pending,
        }
    }

    fn advance(&mut self, next: PairState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::InvalidStateTransition {
                key: self.key.to_string(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!("{}: {} -> {}", self.key, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Which side of a comparison failed to decode
enum Undecodable {
    Candidate(Error),
    Baseline(Error),
}

/// A planned pair and the comparison options that apply to it
#[derive(Debug, Clone)]
pub struct PlannedPair {
    pub job: CaptureJob,
    pub options: CompareOptions,
}

/// Composes orchestrator, baseline store and comparator into suite runs
pub struct RegressionRunner {
    suite: SuiteConfig,
    orchestrator: CaptureOrchestrator,
    baselines: Arc<BaselineStore>,
    blobs: Arc<dyn BlobStore>,
}

impl RegressionRunner {
    /// Validates the suite eagerly; nothing is captured for a bad config
    pub fn new(
        suite: SuiteConfig,
        driver: Arc<dyn BrowserDriver>,
        blobs: Arc<dyn BlobStore>,
        baselines: Arc<BaselineStore>,
    ) -> Result<Self> {
        suite.validate()?;
        let settings = CaptureSettings {
            concurrency: suite.concurrency,
            timeout: suite.capture_timeout(),
            ..Default::default()
        };
        let orchestrator = CaptureOrchestrator::new(driver, blobs.clone(), settings)?;
        Ok(Self {
            suite,
            orchestrator,
            baselines,
            blobs,
        })
    }

    pub fn suite(&self) -> &SuiteConfig {
        &self.suite
    }

    pub fn baselines(&self) -> &Arc<BaselineStore> {
        &self.baselines
    }

    pub fn orchestrator(&self) -> &CaptureOrchestrator {
        &self.orchestrator
    }

    /// Pairs a run with `filter` would process, in configuration order
    pub fn plan(&self, filter: &RunFilter) -> Result<Vec<PlannedPair>> {
        let targets = self.suite.targets();
        if let Some(page) = &filter.page {
            if !targets.iter().any(|t| &t.id == page) {
                return Err(Error::InvalidConfig(format!(
                    "suite '{}' has no target '{}'",
                    self.suite.name, page
                )));
            }
        }

        let mut pairs = Vec::new();
        for target in &targets {
            if filter.page.as_ref().is_some_and(|p| p != &target.id) {
                continue;
            }
            let options = self.suite.compare_options(target);
            let url = self.suite.url_for(&target.path);
            let full_page = self.suite.full_page(target);
            for viewport in &target.viewports {
                if !filter.viewports.is_empty() && !filter.viewports.contains(&viewport.class) {
                    continue;
                }
                pairs.push(PlannedPair {
                    job: CaptureJob::new(target, *viewport, url.clone(), full_page),
                    options,
                });
            }
        }

        if pairs.is_empty() {
            return Err(Error::InvalidConfig(
                "filter selects no (page, viewport) pairs".to_string(),
            ));
        }
        Ok(pairs)
    }

    /// Run the suite.
    ///
    /// Only configuration errors and an unusable driver fail the run as a
    /// whole; everything else is recorded per pair. A cancelled run returns
    /// the pairs completed so far with `cancelled` set.
    pub async fn run(&self, ctx: &RunContext, options: &RunOptions) -> Result<SuiteRunResult> {
        let plan = self.plan(&options.filter)?;

        self.orchestrator
            .driver()
            .probe()
            .await
            .map_err(|e| Error::DriverUnavailable(e.to_string()))?;

        info!(
            "Run {} of suite '{}': {} pair(s){}",
            ctx.run_id,
            self.suite.name,
            plan.len(),
            if options.update_baselines { ", updating baselines" } else { "" }
        );

        let compare_options: HashMap<TargetKey, CompareOptions> = plan
            .iter()
            .map(|p| (p.job.key.clone(), p.options))
            .collect();
        let order: Vec<TargetKey> = plan.iter().map(|p| p.job.key.clone()).collect();

        let records = self
            .orchestrator
            .capture_all(ctx, plan.into_iter().map(|p| p.job).collect())
            .await;

        let settled = futures::future::join_all(records.into_iter().map(|record| {
            let opts = compare_options
                .get(&record.job.key)
                .copied()
                .unwrap_or_default();
            self.settle(ctx, options.update_baselines, opts, record)
        }))
        .await;

        let mut by_key = HashMap::new();
        for pair in settled {
            let pair = pair?;
            by_key.insert(pair.key.clone(), pair);
        }
        let results: Vec<PairResult> = order.iter().filter_map(|k| by_key.remove(k)).collect();

        let cancelled = ctx.is_cancelled() && results.len() < order.len();
        if cancelled {
            warn!(
                "Run {} cancelled after {} of {} pair(s)",
                ctx.run_id,
                results.len(),
                order.len()
            );
        }

        let run = SuiteRunResult::new(
            ctx.run_id.clone(),
            self.suite.name.clone(),
            ctx.started_at,
            results,
            cancelled,
        );
        self.persist_report(ctx, &run).await;

        info!(
            "Run {} finished: {} passed, {} failed, {} baseline(s) created, {} capture failure(s), {} baseline error(s) - {}",
            run.run_id,
            run.counts.passed,
            run.counts.failed,
            run.counts.baseline_created,
            run.counts.capture_failed,
            run.counts.baseline_errors,
            if run.is_clean() { "clean" } else { "NOT clean" }
        );
        Ok(run)
    }

    async fn settle(
        &self,
        ctx: &RunContext,
        update_baselines: bool,
        options: CompareOptions,
        record: CaptureRecord,
    ) -> Result<PairResult> {
        let CaptureRecord {
            job,
            attempts,
            duration_ms,
            result,
        } = record;
        let mut tracker = PairTracker::new(job.key.clone());

        let (outcome, capture) = match result {
            Err(e) => {
                tracker.advance(PairState::CaptureFailed)?;
                (
                    PairOutcome::CaptureFailed {
                        reason: e.to_string(),
                        attempts,
                    },
                    None,
                )
            }
            Ok(artifact) => {
                tracker.advance(PairState::Captured)?;
                let capture = artifact.blob.clone();
                let outcome = self
                    .resolve(ctx, update_baselines, options, &artifact, attempts, &mut tracker)
                    .await?;
                (outcome, capture)
            }
        };
        tracker.advance(PairState::Done)?;

        match &outcome {
            PairOutcome::Compared(c) if c.passed => {
                info!("{}: pass (similarity {:.4})", job.key, c.similarity)
            }
            PairOutcome::Compared(c) => warn!(
                "{}: FAIL (similarity {:.4} < {:.4})",
                job.key, c.similarity, c.threshold
            ),
            PairOutcome::BaselineCreated { version, .. } => {
                info!("{}: baseline v{} created", job.key, version)
            }
            PairOutcome::CaptureFailed { reason, .. } => {
                warn!("{}: capture failed: {}", job.key, reason)
            }
            PairOutcome::BaselineError { reason } => {
                warn!("{}: baseline error: {}", job.key, reason)
            }
        }

        Ok(PairResult {
            key: job.key,
            page_name: job.page_name,
            viewport: job.viewport,
            outcome,
            capture,
            capture_attempts: attempts,
            duration_ms,
        })
    }

    /// Decide between baseline promotion and comparison for a captured pair
    async fn resolve(
        &self,
        ctx: &RunContext,
        update_baselines: bool,
        options: CompareOptions,
        artifact: &ScreenshotArtifact,
        attempts: u32,
        tracker: &mut PairTracker,
    ) -> Result<PairOutcome> {
        let key = &artifact.key;
        let existing = if update_baselines {
            None
        } else {
            match self.baselines.get(key).await {
                Ok(existing) => existing,
                Err(e) => return Ok(PairOutcome::BaselineError { reason: e.to_string() }),
            }
        };

        let Some(baseline) = existing else {
            let reason = if update_baselines {
                BaselineReason::Forced
            } else {
                BaselineReason::Missing
            };
            return match self.baselines.put(key, &artifact.bytes, Some(&ctx.run_id)).await {
                Ok(version) => {
                    tracker.advance(PairState::BaselineCreated)?;
                    Ok(PairOutcome::BaselineCreated {
                        version: version.version,
                        reason,
                    })
                }
                Err(e) => Ok(PairOutcome::BaselineError { reason: e.to_string() }),
            };
        };

        let candidate = artifact.bytes.clone();
        let reference = baseline.bytes.clone();
        let compare_key = key.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let comparison = if candidate == reference {
                compare_encoded(&compare_key, &candidate, &reference, &options)
                    .map_err(Undecodable::Candidate)?
            } else {
                let candidate = DecodedImage::decode(&candidate).map_err(Undecodable::Candidate)?;
                let reference = DecodedImage::decode(&reference).map_err(Undecodable::Baseline)?;
                compare(&compare_key, &candidate, &reference, &options)
            };
            let diff_png = match comparison.diff_image.as_ref().map(encode_png).transpose() {
                Ok(png) => png,
                Err(e) => {
                    warn!("Could not encode diff image for {}: {}", compare_key, e);
                    None
                }
            };
            Ok::<_, Undecodable>((comparison.result, diff_png))
        })
        .await
        .map_err(|e| Error::Internal(format!("comparison task for {} failed: {}", key, e)))?;

        let (result, diff_png) = match outcome {
            Ok(done) => done,
            Err(Undecodable::Candidate(e)) => {
                return Ok(PairOutcome::CaptureFailed {
                    reason: format!("capture is not a decodable image: {}", e),
                    attempts,
                });
            }
            Err(Undecodable::Baseline(e)) => {
                return Ok(PairOutcome::BaselineError {
                    reason: format!("baseline v{} is not a decodable image: {}", baseline.meta.version, e),
                });
            }
        };
        tracker.advance(PairState::Compared)?;

        let mut result = result.with_baseline_version(baseline.meta.version);
        if let Some(png) = diff_png {
            let diff_key = format!("diffs/{}.png", key.storage_path());
            match self.blobs.put(&ctx.namespace(), &diff_key, &png).await {
                Ok(blob) => result = result.with_diff_image(blob),
                Err(e) => warn!("Could not store diff image for {}: {}", key, e),
            }
        }
        Ok(PairOutcome::Compared(result))
    }

    async fn persist_report(&self, ctx: &RunContext, run: &SuiteRunResult) {
        let report = Report::generate(run);
        let json = match report.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Could not serialize report for run {}: {}", run.run_id, e);
                return;
            }
        };
        if let Err(e) = self
            .blobs
            .put(&ctx.namespace(), REPORT_FILE, json.as_bytes())
            .await
        {
            warn!("Could not persist report for run {}: {}", run.run_id, e);
        }
    }
}
