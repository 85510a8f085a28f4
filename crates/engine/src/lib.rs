//! visreg Engine
//!
//! Captures rendered pages across viewports, compares them against stored
//! baselines and aggregates the verdicts into a report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  RegressionRunner (per run)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteConfig (YAML) ── plan(filter) -> [CaptureJob]         │
//! │                                                             │
//! │  CaptureOrchestrator ── BrowserDriver (Playwright)          │
//! │    └── bounded concurrency, 1 retry per failed capture      │
//! │                                                             │
//! │  per pair: PENDING -> CAPTURED -> BASELINE_CREATED | COMPARED│
//! │            PENDING -> CAPTURE_FAILED            -> DONE     │
//! │                                                             │
//! │  BaselineStore (versioned)    compare() -> ComparisonResult │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SuiteRunResult ── Report::generate -> JSON / Markdown      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod baseline;
pub mod compare;
pub mod context;
pub mod driver;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod server;
pub mod suite;

pub use baseline::{BaselineStore, BaselineVersion};
pub use compare::{compare, compare_encoded, CompareOptions};
pub use context::RunContext;
pub use driver::{BrowserDriver, CaptureRequest, PlaywrightConfig, PlaywrightDriver};
pub use orchestrator::{CaptureOrchestrator, CaptureSettings};
pub use report::Report;
pub use runner::{RegressionRunner, RunFilter, RunOptions};
pub use server::{AppServer, AppServerConfig};
pub use suite::SuiteConfig;
