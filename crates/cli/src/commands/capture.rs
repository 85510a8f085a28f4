//! Capture Command

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;

use visreg_common::blob::digest;
use visreg_common::{Dimensions, DriverError, Error, ViewportClass};
use visreg_engine::compare::decoded_dimensions;
use visreg_engine::orchestrator::capture_with_retry;
use visreg_engine::{BrowserDriver, CaptureRequest, PlaywrightConfig, PlaywrightDriver};

use super::run::parse_viewport;
use crate::output::{print_success, OutputFormat};

#[derive(Args, Debug)]
pub struct CaptureArgs {
    /// Page URL
    #[arg(short, long)]
    pub url: String,

    /// Viewport class preset
    #[arg(long, default_value = "desktop", value_parser = parse_viewport)]
    pub viewport: ViewportClass,

    /// Explicit viewport width, overrides the preset
    #[arg(long, requires = "height")]
    pub width: Option<u32>,

    /// Explicit viewport height, overrides the preset
    #[arg(long, requires = "width")]
    pub height: Option<u32>,

    /// Capture the full scrollable page
    #[arg(long)]
    pub full_page: bool,

    /// Output PNG file
    #[arg(short, long)]
    pub out: PathBuf,

    /// Page timeout in milliseconds
    #[arg(long, default_value = "30000")]
    pub timeout_ms: u64,

    /// Node.js executable used to drive Playwright
    #[arg(long, default_value = "node")]
    pub node: PathBuf,
}

impl CaptureArgs {
    fn request(&self) -> CaptureRequest {
        let (preset_w, preset_h) = self.viewport.default_size();
        CaptureRequest {
            url: self.url.clone(),
            width: self.width.unwrap_or(preset_w),
            height: self.height.unwrap_or(preset_h),
            full_page: self.full_page,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Serialize)]
struct CaptureSummary {
    url: String,
    path: String,
    dimensions: Dimensions,
    size_bytes: usize,
    digest: String,
    attempts: u32,
}

/// Capture a single page outside of any suite
pub async fn execute(args: CaptureArgs, format: OutputFormat) -> Result<()> {
    let driver = PlaywrightDriver::new(PlaywrightConfig {
        node_binary: args.node.clone(),
        ..Default::default()
    });
    driver
        .probe()
        .await
        .map_err(|e| Error::DriverUnavailable(e.to_string()))?;

    let request = args.request();
    let (result, attempts) = capture_with_retry(&driver, &request, 1).await;
    let bytes = result.map_err(Error::Driver)?;
    let dimensions = decoded_dimensions(&bytes).map_err(|e| {
        Error::Driver(DriverError::Crashed(format!("driver returned an undecodable image: {}", e)))
    })?;

    tokio::fs::write(&args.out, &bytes)
        .await
        .with_context(|| format!("failed to write {}", args.out.display()))?;

    let summary = CaptureSummary {
        url: args.url,
        path: args.out.display().to_string(),
        dimensions,
        size_bytes: bytes.len(),
        digest: digest(&bytes),
        attempts,
    };

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        _ => {
            print_success(&format!("Captured {} -> {}", summary.url, summary.path));
            println!("   Size:     {}", summary.dimensions);
            println!("   Bytes:    {}", summary.size_bytes);
            println!("   Digest:   {}", summary.digest);
            println!("   Attempts: {}", summary.attempts);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(width: Option<u32>, height: Option<u32>) -> CaptureArgs {
        CaptureArgs {
            url: "http://localhost:3000/chat".to_string(),
            viewport: ViewportClass::Tablet,
            width,
            height,
            full_page: true,
            out: PathBuf::from("chat.png"),
            timeout_ms: 5_000,
            node: PathBuf::from("node"),
        }
    }

    #[test]
    fn test_request_uses_preset_size() {
        let req = args(None, None).request();
        assert_eq!((req.width, req.height), (768, 1024));
        assert!(req.full_page);
        assert_eq!(req.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_request_explicit_size_wins() {
        let req = args(Some(1280), Some(720)).request();
        assert_eq!((req.width, req.height), (1280, 720));
    }
}
