//! Run Command

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use visreg_common::{BlobStore, FsBlobStore, ViewportClass};
use visreg_engine::{
    AppServer, AppServerConfig, BaselineStore, PlaywrightConfig, PlaywrightDriver,
    RegressionRunner, Report, RunContext, RunFilter, RunOptions, SuiteConfig,
};

use crate::output::{print_report, OutputFormat};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Suite configuration (YAML)
    #[arg(short, long)]
    pub suite: PathBuf,

    /// Only run this page id
    #[arg(short, long)]
    pub page: Option<String>,

    /// Only run these viewport classes (repeatable)
    #[arg(long = "viewport", value_parser = parse_viewport)]
    pub viewports: Vec<ViewportClass>,

    /// Replace every baseline with the fresh capture
    #[arg(long)]
    pub update_baselines: bool,

    /// Override the suite's capture concurrency
    #[arg(short, long)]
    pub concurrency: Option<usize>,

    /// Override the suite's similarity threshold
    #[arg(short, long)]
    pub threshold: Option<f64>,

    /// Override the suite's base URL
    #[arg(long, env = "VISREG_BASE_URL")]
    pub base_url: Option<String>,

    /// Start this application binary for the run and capture against it
    #[arg(long)]
    pub server_binary: Option<PathBuf>,

    /// Arguments passed to the application binary
    #[arg(long = "server-arg", allow_hyphen_values = true)]
    pub server_args: Vec<String>,

    /// Seconds to wait for the application to become healthy
    #[arg(long, default_value = "30")]
    pub server_timeout: u64,

    /// Node.js executable used to drive Playwright
    #[arg(long, default_value = "node")]
    pub node: PathBuf,
}

pub(crate) fn parse_viewport(s: &str) -> std::result::Result<ViewportClass, String> {
    s.parse::<ViewportClass>().map_err(|e| e.to_string())
}

impl RunArgs {
    fn filter(&self) -> RunFilter {
        RunFilter {
            page: self.page.clone(),
            viewports: self.viewports.clone(),
        }
    }

    /// Load the suite, apply command line overrides and validate the result
    fn load_suite(&self) -> Result<SuiteConfig> {
        let mut suite = SuiteConfig::from_file(&self.suite)
            .with_context(|| format!("failed to load suite {}", self.suite.display()))?;
        if let Some(base_url) = &self.base_url {
            suite.base_url = base_url.clone();
        }
        if let Some(concurrency) = self.concurrency {
            suite.concurrency = concurrency;
        }
        if let Some(threshold) = self.threshold {
            suite.threshold = threshold;
        }
        suite.validate()?;
        Ok(suite)
    }
}

/// Execute a suite run, returning whether it was clean
pub async fn execute(args: RunArgs, store: PathBuf, format: OutputFormat) -> Result<bool> {
    let mut suite = args.load_suite()?;

    // Held until the end of the run; dropping it stops the application.
    let _server = match &args.server_binary {
        Some(binary) => {
            let mut config = AppServerConfig::new(binary);
            config.args = args.server_args.clone();
            config.startup_timeout = Duration::from_secs(args.server_timeout);
            let server = AppServer::spawn(config).await?;
            info!("Application listening at {}", server.base_url());
            suite.base_url = server.base_url().to_string();
            Some(server)
        }
        None => None,
    };

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(&store).await?);
    let baselines = Arc::new(BaselineStore::new(blobs.clone()));
    let driver = Arc::new(PlaywrightDriver::new(PlaywrightConfig {
        node_binary: args.node.clone(),
        ..Default::default()
    }));
    let runner = RegressionRunner::new(suite, driver, blobs, baselines)?;

    let ctx = RunContext::new();
    let cancel = ctx.cancellation().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight captures");
            cancel.cancel();
        }
    });

    let options = RunOptions {
        update_baselines: args.update_baselines,
        filter: args.filter(),
    };
    let result = runner.run(&ctx, &options).await?;
    let report = Report::generate(&result);
    print_report(&report, format);

    Ok(report.clean)
}
