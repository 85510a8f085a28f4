//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use visreg_common::{
    BlobRef, BlobStore, DriverError, Error, MemoryBlobStore, Result, ViewportClass, ViewportSpec,
};
use visreg_engine::baseline::{BaselineStore, BASELINE_NAMESPACE};
use visreg_engine::compare::encode_png;
use visreg_engine::driver::{BrowserDriver, CaptureRequest};
use visreg_engine::runner::RegressionRunner;
use visreg_engine::suite::{SuiteConfig, TargetConfig};

pub const BASE_URL: &str = "http://app.test";

/// How the fake application renders a page differently from normal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Top fifth of the page shifts colour
    Band,
    /// Page grows by 16 pixels
    Taller,
}

#[derive(Default)]
struct FakeState {
    fail: HashMap<String, DriverError>,
    transient: HashMap<String, u32>,
    hang: HashSet<String>,
    change: HashMap<String, Change>,
    truncate: HashSet<String>,
    unavailable: bool,
    cancel_on_call: Option<(usize, CancellationToken)>,
}

/// Instrumented driver that renders deterministic images per path
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn fail(&self, path: &str, error: DriverError) {
        self.state.lock().fail.insert(path.to_string(), error);
    }

    /// Fail `times` captures of `path` with a transient error, then succeed
    pub fn flaky(&self, path: &str, times: u32) {
        self.state.lock().transient.insert(path.to_string(), times);
    }

    pub fn hang(&self, path: &str) {
        self.state.lock().hang.insert(path.to_string());
    }

    pub fn change(&self, path: &str, change: Change) {
        self.state.lock().change.insert(path.to_string(), change);
    }

    /// Return `path` as a PNG cut off after its header
    pub fn truncate(&self, path: &str) {
        self.state.lock().truncate.insert(path.to_string());
    }

    pub fn restore(&self, path: &str) {
        self.state.lock().truncate.remove(path);
    }

    pub fn set_unavailable(&self) {
        self.state.lock().unavailable = true;
    }

    /// Cancel `token` when the `nth` capture (1-based) starts
    pub fn cancel_on_call(&self, nth: usize, token: CancellationToken) {
        self.state.lock().cancel_on_call = Some((nth, token));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn probe(&self) -> std::result::Result<(), DriverError> {
        if self.state.lock().unavailable {
            return Err(DriverError::Unavailable("chromium not installed".to_string()));
        }
        Ok(())
    }

    async fn capture(&self, request: &CaptureRequest) -> std::result::Result<Vec<u8>, DriverError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let path = request.url.trim_start_matches(BASE_URL).to_string();
        let (hang, change, truncate) = {
            let mut state = self.state.lock();
            if let Some((nth, token)) = &state.cancel_on_call {
                if *nth == call {
                    token.cancel();
                }
            }
            if let Some(error) = state.fail.get(&path) {
                return Err(error.clone());
            }
            if let Some(left) = state.transient.get_mut(&path) {
                if *left > 0 {
                    *left -= 1;
                    return Err(DriverError::Transient("connection reset by peer".to_string()));
                }
            }
            (
                state.hang.contains(&path),
                state.change.get(&path).copied(),
                state.truncate.contains(&path),
            )
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut png = render(&path, request.width, request.height, change);
        if truncate {
            png.truncate(60);
        }
        Ok(png)
    }
}

/// Deterministic page rendering; each path gets its own pattern
pub fn render(path: &str, width: u32, height: u32, change: Option<Change>) -> Vec<u8> {
    let seed = path.bytes().fold(7u8, |acc, b| acc.wrapping_mul(31).wrapping_add(b));
    let height = if change == Some(Change::Taller) { height + 16 } else { height };
    let band = height / 5;

    let img = RgbaImage::from_fn(width, height, |x, y| {
        let r = ((x * 4) as u8) ^ seed;
        let g = (y * 4) as u8;
        let r = if change == Some(Change::Band) && y < band {
            r.wrapping_add(128)
        } else {
            r
        };
        Rgba([r, g, seed, 255])
    });
    encode_png(&img).unwrap()
}

/// Small explicit viewports keep PNG work cheap
pub fn viewports() -> Vec<ViewportSpec> {
    vec![
        ViewportSpec::new(ViewportClass::Desktop, 64, 48),
        ViewportSpec::new(ViewportClass::Mobile, 24, 40),
    ]
}

pub fn suite(pages: &[&str], concurrency: usize) -> SuiteConfig {
    SuiteConfig {
        name: "assistant-ui".to_string(),
        base_url: BASE_URL.to_string(),
        concurrency,
        threshold: 0.95,
        pixel_tolerance: 5,
        capture_timeout_ms: 2_000,
        full_page: false,
        viewports: viewports(),
        targets: pages
            .iter()
            .map(|id| TargetConfig {
                id: id.to_string(),
                name: None,
                path: format!("/{}", id),
                viewports: None,
                threshold: None,
                full_page: None,
            })
            .collect(),
    }
}

/// Blob store that refuses every write to the baseline namespace
pub struct ReadOnlyBaselines {
    pub inner: MemoryBlobStore,
}

#[async_trait]
impl BlobStore for ReadOnlyBaselines {
    async fn put(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobRef> {
        if namespace == BASELINE_NAMESPACE {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only filesystem",
            )));
        }
        self.inner.put(namespace, key, data).await
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(namespace, key).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.inner.delete(namespace, key).await
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(namespace, prefix).await
    }
}

/// Driver, blob store and baseline store wired together
pub struct Harness {
    pub driver: Arc<FakeDriver>,
    pub blobs: Arc<dyn BlobStore>,
    pub baselines: Arc<BaselineStore>,
}

impl Harness {
    pub fn new(driver: FakeDriver) -> Self {
        Self::with_blobs(driver, Arc::new(MemoryBlobStore::new()))
    }

    pub fn with_blobs(driver: FakeDriver, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            driver: Arc::new(driver),
            baselines: Arc::new(BaselineStore::new(blobs.clone())),
            blobs,
        }
    }

    pub fn runner(&self, suite: SuiteConfig) -> RegressionRunner {
        RegressionRunner::new(suite, self.driver.clone(), self.blobs.clone(), self.baselines.clone())
            .unwrap()
    }
}
