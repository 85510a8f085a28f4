//! Browser capture driver
//!
//! The engine consumes a single capability from the browser layer: render a
//! URL at a viewport size and hand back encoded image bytes. [`BrowserDriver`]
//! is that seam; [`PlaywrightDriver`] implements it by generating a small
//! Playwright script per capture and running it under Node.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use visreg_common::DriverError;

/// A single capture request
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub full_page: bool,
    pub timeout: Duration,
}

/// Renders pages into encoded (PNG) screenshots
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Check that the driver can launch a browser at all.
    async fn probe(&self) -> Result<(), DriverError>;

    /// Navigate to `request.url` and return the screenshot bytes.
    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, DriverError>;
}

/// Configuration for Playwright
#[derive(Debug, Clone)]
pub struct PlaywrightConfig {
    /// Node.js executable
    pub node_binary: PathBuf,
    pub headless: bool,
    /// Extra wait after network idle, lets fonts and transitions settle
    pub settle_ms: u64,
    /// Grace period on top of the page timeout before the process is killed
    pub kill_grace: Duration,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            node_binary: PathBuf::from("node"),
            headless: true,
            settle_ms: 250,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Playwright-backed capture driver
#[derive(Debug, Clone, Default)]
pub struct PlaywrightDriver {
    config: PlaywrightConfig,
}

/// A running browser process and its scratch directory.
///
/// Dropping the session kills the process and removes the directory, so a
/// capture abandoned by timeout or cancellation cannot leak a browser.
struct PlaywrightSession {
    child: Child,
    workdir: TempDir,
}

impl Drop for PlaywrightSession {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // Already exited
            debug!("Playwright session cleanup: {}", e);
        }
    }
}

#[derive(Debug, Deserialize)]
struct ScriptFailure {
    error: String,
}

impl PlaywrightDriver {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Build the Playwright script for one capture
    pub fn build_script(&self, request: &CaptureRequest, output: &str) -> String {
        // JSON string literals are valid JavaScript string literals
        let url = serde_json::to_string(&request.url).unwrap_or_else(|_| "\"\"".to_string());
        let output = serde_json::to_string(output).unwrap_or_else(|_| "\"\"".to_string());

        format!(
            r#"
const {{ chromium }} = require('playwright');

(async () => {{
  const browser = await chromium.launch({{ headless: {headless} }});
  try {{
    const context = await browser.newContext({{
      viewport: {{ width: {width}, height: {height} }},
      deviceScaleFactor: 1
    }});
    const page = await context.newPage();
    const response = await page.goto({url}, {{ waitUntil: 'networkidle', timeout: {timeout} }});
    if (response && response.status() >= 400) {{
      throw new Error('HTTP_STATUS ' + response.status());
    }}
    await page.waitForTimeout({settle});
    await page.screenshot({{ path: {output}, fullPage: {full_page}, animations: 'disabled' }});
    console.log(JSON.stringify({{ success: true }}));
  }} catch (error) {{
    console.error(JSON.stringify({{ success: false, error: error.message }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            headless = self.config.headless,
            width = request.width,
            height = request.height,
            url = url,
            timeout = request.timeout.as_millis(),
            settle = self.config.settle_ms,
            output = output,
            full_page = request.full_page,
        )
    }

    fn spawn(&self, workdir: TempDir, script: &str) -> Result<PlaywrightSession, DriverError> {
        let script_path = workdir.path().join("capture.js");
        std::fs::write(&script_path, script)
            .map_err(|e| DriverError::Unavailable(format!("cannot write script: {}", e)))?;

        let child = Command::new(&self.config.node_binary)
            .arg(&script_path)
            .current_dir(workdir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Unavailable(format!(
                    "failed to spawn {}: {}",
                    self.config.node_binary.display(),
                    e
                ))
            })?;

        Ok(PlaywrightSession { child, workdir })
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn probe(&self) -> Result<(), DriverError> {
        let status = Command::new(&self.config.node_binary)
            .args(["-e", "require('playwright')"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(DriverError::Unavailable(
                "playwright module not found. Install with: npm i playwright && npx playwright install chromium"
                    .to_string(),
            )),
            Err(e) => Err(DriverError::Unavailable(format!(
                "{} not runnable: {}",
                self.config.node_binary.display(),
                e
            ))),
        }
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<Vec<u8>, DriverError> {
        let workdir = tempfile::Builder::new()
            .prefix("visreg-capture")
            .tempdir()
            .map_err(|e| DriverError::Unavailable(format!("cannot create scratch dir: {}", e)))?;
        let png_path = workdir.path().join("screenshot.png");
        let script = self.build_script(request, &png_path.to_string_lossy());

        let mut session = self.spawn(workdir, &script)?;
        debug!(
            "Capturing {} at {}x{} (workdir {})",
            request.url,
            request.width,
            request.height,
            session.workdir.path().display()
        );

        // Drain stderr concurrently so a chatty browser cannot block on a full pipe
        let stderr_task = session.child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            })
        });

        let deadline = request.timeout + self.config.kill_grace;
        let status = match tokio::time::timeout(deadline, session.child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(DriverError::Crashed(e.to_string())),
            Err(_) => {
                warn!("Capture of {} exceeded {:?}, killing browser", request.url, deadline);
                return Err(DriverError::Timeout(request.timeout));
            }
        };

        if !status.success() {
            let message = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            return Err(classify_failure(&message, request.timeout));
        }

        tokio::fs::read(&png_path)
            .await
            .map_err(|e| DriverError::Crashed(format!("screenshot not written: {}", e)))
    }
}

/// Map Playwright stderr output onto the driver error taxonomy
pub fn classify_failure(stderr: &str, timeout: Duration) -> DriverError {
    static PATTERNS: OnceLock<Vec<(Regex, u8)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"Cannot find module 'playwright'|Executable doesn't exist|browserType\.launch", 0),
            (r"Timeout \d+ms exceeded|TimeoutError", 1),
            (r"ECONNRESET|ERR_CONNECTION_RESET|socket hang up|EPIPE", 2),
            (r"net::ERR_|NS_ERROR_|HTTP_STATUS \d+", 3),
        ]
        .into_iter()
        .filter_map(|(p, kind)| Regex::new(p).ok().map(|re| (re, kind)))
        .collect()
    });

    let message = stderr
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str::<ScriptFailure>(line.trim()).ok())
        .map(|f| f.error)
        .unwrap_or_else(|| stderr.trim().to_string());

    for (pattern, kind) in patterns.iter() {
        if pattern.is_match(&message) {
            return match kind {
                0 => DriverError::Unavailable(message),
                1 => DriverError::Timeout(timeout),
                2 => DriverError::Transient(message),
                _ => DriverError::Navigation(message),
            };
        }
    }

    DriverError::Crashed(if message.is_empty() {
        "browser exited without output".to_string()
    } else {
        message
    })
}
