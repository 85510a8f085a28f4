//! Declarative YAML suite configuration

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use visreg_common::{CaptureTarget, Error, Result, ViewportClass, ViewportSpec};

use crate::compare::{validate_threshold, CompareOptions, DEFAULT_PIXEL_TOLERANCE, DEFAULT_THRESHOLD};

/// A complete suite definition parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Suite name, recorded in every run result
    pub name: String,

    /// Base URL of the running application
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Maximum concurrent browser captures
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default similarity threshold (0.0 - 1.0)
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Per-channel delta tolerated as rendering noise
    #[serde(default = "default_pixel_tolerance")]
    pub pixel_tolerance: u8,

    /// Per-capture timeout
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Capture the full scrollable page rather than the viewport
    #[serde(default = "default_true")]
    pub full_page: bool,

    /// Viewports used by targets that do not list their own
    #[serde(default = "default_viewports")]
    pub viewports: Vec<ViewportSpec>,

    pub targets: Vec<TargetConfig>,
}

/// A target as written in YAML; viewports fall back to the suite default
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub path: String,
    #[serde(default)]
    pub viewports: Option<Vec<ViewportSpec>>,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub full_page: Option<bool>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_concurrency() -> usize {
    2 // each capture holds a browser process
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_pixel_tolerance() -> u8 {
    DEFAULT_PIXEL_TOLERANCE
}

fn default_capture_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_viewports() -> Vec<ViewportSpec> {
    ViewportClass::ALL.iter().copied().map(ViewportSpec::preset).collect()
}

impl SuiteConfig {
    /// Parse a suite from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::InvalidConfig(format!("suite YAML: {}", e)))
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Reject anything that would make a run meaningless, before capturing
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("suite name is empty".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::InvalidConfig(format!(
                "base_url '{}' must be an absolute http(s) URL",
                self.base_url
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        if self.capture_timeout_ms == 0 {
            return Err(Error::InvalidConfig("capture_timeout_ms must be positive".to_string()));
        }
        validate_threshold(self.threshold)?;

        if self.targets.is_empty() {
            return Err(Error::InvalidConfig("suite has no targets".to_string()));
        }

        let mut ids = HashSet::new();
        for target in self.targets() {
            if target.id.is_empty()
                || !target
                    .id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
                || target.id.starts_with('.')
            {
                return Err(Error::InvalidConfig(format!(
                    "target id '{}' must be non-empty [A-Za-z0-9._-] and not start with '.'",
                    target.id
                )));
            }
            if !ids.insert(target.id.clone()) {
                return Err(Error::InvalidConfig(format!("duplicate target id '{}'", target.id)));
            }
            if target.viewports.is_empty() {
                return Err(Error::InvalidConfig(format!("target '{}' has no viewports", target.id)));
            }
            let mut classes = HashSet::new();
            for viewport in &target.viewports {
                if viewport.width == 0 || viewport.height == 0 {
                    return Err(Error::InvalidConfig(format!(
                        "target '{}' viewport {} has a zero dimension",
                        target.id, viewport.class
                    )));
                }
                if !classes.insert(viewport.class) {
                    return Err(Error::InvalidConfig(format!(
                        "target '{}' lists viewport {} twice",
                        target.id, viewport.class
                    )));
                }
            }
            if let Some(threshold) = target.threshold {
                validate_threshold(threshold).map_err(|e| {
                    Error::InvalidConfig(format!("target '{}': {}", target.id, e))
                })?;
            }
        }

        Ok(())
    }

    /// Resolved capture targets, suite defaults applied
    pub fn targets(&self) -> Vec<CaptureTarget> {
        self.targets
            .iter()
            .map(|t| CaptureTarget {
                id: t.id.clone(),
                name: t.name.clone().unwrap_or_else(|| t.id.clone()),
                path: t.path.clone(),
                viewports: t.viewports.clone().unwrap_or_else(|| self.viewports.clone()),
                threshold: t.threshold,
                full_page: t.full_page,
            })
            .collect()
    }

    /// Comparison options for a target, honouring its threshold override
    pub fn compare_options(&self, target: &CaptureTarget) -> CompareOptions {
        CompareOptions {
            threshold: target.threshold.unwrap_or(self.threshold),
            pixel_tolerance: self.pixel_tolerance,
        }
    }

    pub fn full_page(&self, target: &CaptureTarget) -> bool {
        target.full_page.unwrap_or(self.full_page)
    }

    /// Join the base URL and a target path
    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

/// Resolve `path` against `base_url`; absolute URLs pass through
pub fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
