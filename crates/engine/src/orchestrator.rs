//! Capture orchestration across (page, viewport) pairs

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use visreg_common::blob::digest;
use visreg_common::{
    BlobStore, CaptureTarget, DriverError, Error, Result, ScreenshotArtifact, TargetKey,
    ViewportSpec,
};

use crate::compare::decoded_dimensions;
use crate::context::RunContext;
use crate::driver::{BrowserDriver, CaptureRequest};

/// Slack on top of the page timeout before the orchestrator gives up on a
/// driver call that did not enforce its own deadline
const DRIVER_GRACE: Duration = Duration::from_secs(10);

/// Capture settings
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Maximum captures in flight
    pub concurrency: usize,
    /// Per-capture page timeout
    pub timeout: Duration,
    /// Extra attempts after a failed capture
    pub max_retries: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            timeout: Duration::from_secs(30),
            max_retries: 1,
        }
    }
}

/// One (target, viewport) capture to perform
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub key: TargetKey,
    pub page_name: String,
    pub viewport: ViewportSpec,
    pub url: String,
    pub full_page: bool,
}

impl CaptureJob {
    pub fn new(target: &CaptureTarget, viewport: ViewportSpec, url: String, full_page: bool) -> Self {
        Self {
            key: target.key(viewport.class),
            page_name: target.name.clone(),
            viewport,
            url,
            full_page,
        }
    }
}

/// Result of one capture job
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub job: CaptureJob,
    pub attempts: u32,
    pub duration_ms: u64,
    pub result: std::result::Result<ScreenshotArtifact, DriverError>,
}

/// Drives a [`BrowserDriver`] over many capture jobs with bounded concurrency
#[derive(Clone)]
pub struct CaptureOrchestrator {
    driver: Arc<dyn BrowserDriver>,
    blobs: Arc<dyn BlobStore>,
    settings: CaptureSettings,
}

impl CaptureOrchestrator {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        blobs: Arc<dyn BlobStore>,
        settings: CaptureSettings,
    ) -> Result<Self> {
        if settings.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        Ok(Self {
            driver,
            blobs,
            settings,
        })
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    /// Capture every job, at most `concurrency` at a time.
    ///
    /// Per-job failures are recorded, never propagated. Once the run is
    /// cancelled no new capture starts; jobs that never started are absent
    /// from the output. Output order is completion order.
    pub async fn capture_all(&self, ctx: &RunContext, jobs: Vec<CaptureJob>) -> Vec<CaptureRecord> {
        info!(
            "Capturing {} pair(s) with concurrency {} (run {})",
            jobs.len(),
            self.settings.concurrency,
            ctx.run_id
        );

        stream::iter(jobs)
            .map(|job| async move {
                if ctx.is_cancelled() {
                    debug!("Run {} cancelled, not capturing {}", ctx.run_id, job.key);
                    return None;
                }
                Some(self.capture_job(ctx, job).await)
            })
            .buffer_unordered(self.settings.concurrency)
            .filter_map(|record| async move { record })
            .collect()
            .await
    }

    async fn capture_job(&self, ctx: &RunContext, job: CaptureJob) -> CaptureRecord {
        let started = Instant::now();
        let request = CaptureRequest {
            url: job.url.clone(),
            width: job.viewport.width,
            height: job.viewport.height,
            full_page: job.full_page,
            timeout: self.settings.timeout,
        };

        let (bytes, attempts) = self.capture_with_retry(&request).await;
        let result = match bytes {
            Ok(bytes) => self.store_artifact(ctx, &job, bytes).await,
            Err(e) => {
                warn!("Capture failed for {} after {} attempt(s): {}", job.key, attempts, e);
                Err(e)
            }
        };

        CaptureRecord {
            job,
            attempts,
            duration_ms: started.elapsed().as_millis() as u64,
            result,
        }
    }

    /// Run one capture, retrying once unless the driver is unavailable.
    ///
    /// Returns the outcome and the number of attempts made.
    pub async fn capture_with_retry(
        &self,
        request: &CaptureRequest,
    ) -> (std::result::Result<Vec<u8>, DriverError>, u32) {
        capture_with_retry(self.driver.as_ref(), request, self.settings.max_retries).await
    }

    async fn store_artifact(
        &self,
        ctx: &RunContext,
        job: &CaptureJob,
        bytes: Vec<u8>,
    ) -> std::result::Result<ScreenshotArtifact, DriverError> {
        // Full decode: a truncated PNG has a valid header
        let (bytes, decoded) = tokio::task::spawn_blocking(move || {
            let decoded = decoded_dimensions(&bytes);
            (bytes, decoded)
        })
        .await
        .map_err(|e| DriverError::Crashed(format!("image check for {} failed: {}", job.key, e)))?;
        let dimensions = decoded.map_err(|e| {
            warn!("Capture for {} is not a decodable image: {}", job.key, e);
            DriverError::Crashed(format!("driver returned an undecodable image: {}", e))
        })?;

        let key = format!("captures/{}.png", job.key.storage_path());
        let blob = match self.blobs.put(&ctx.namespace(), &key, &bytes).await {
            Ok(blob) => Some(blob),
            Err(e) => {
                // The in-memory artifact is still usable for comparison
                warn!("Could not persist capture {}: {}", job.key, e);
                None
            }
        };

        debug!("Captured {} ({}, {} bytes)", job.key, dimensions, bytes.len());
        Ok(ScreenshotArtifact {
            key: job.key.clone(),
            page_name: job.page_name.clone(),
            viewport: job.viewport,
            captured_at: Utc::now(),
            dimensions,
            digest: digest(&bytes),
            blob,
            bytes: Bytes::from(bytes),
        })
    }
}

/// Capture with a hard deadline, retrying failures up to `max_retries` times
/// unless the driver is unavailable. Returns the outcome and the attempts made.
pub async fn capture_with_retry(
    driver: &dyn BrowserDriver,
    request: &CaptureRequest,
    max_retries: u32,
) -> (std::result::Result<Vec<u8>, DriverError>, u32) {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let outcome =
            match tokio::time::timeout(request.timeout + DRIVER_GRACE, driver.capture(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(DriverError::Timeout(request.timeout)),
            };

        match outcome {
            Ok(bytes) => return (Ok(bytes), attempts),
            Err(e) if e.is_retryable() && attempts <= max_retries => {
                warn!("Capture of {} failed ({}), retrying", request.url, e);
            }
            Err(e) => return (Err(e), attempts),
        }
    }
}
