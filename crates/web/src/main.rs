use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use visreg_common::FsBlobStore;
use visreg_engine::driver::PlaywrightDriver;
use visreg_engine::suite::SuiteConfig;
use visreg_web::server::WebServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let web_addr: SocketAddr = std::env::var("VISREG_WEB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8090".to_string())
        .parse()?;

    let store = std::env::var("VISREG_STORE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| visreg_common::default_store_path());

    let base_url = std::env::var("VISREG_BASE_URL").ok();

    // Without a suite the server still captures screenshots and serves baselines
    let suite = match std::env::var("VISREG_SUITE") {
        Ok(path) => {
            let mut suite = SuiteConfig::from_file(std::path::Path::new(&path))?;
            if let Some(base_url) = &base_url {
                suite.base_url = base_url.clone();
            }
            suite.validate()?;
            Some(suite)
        }
        Err(_) => None,
    };

    let mut cfg = WebServerConfig::default();
    if let Some(base_url) = base_url {
        cfg.base_url = base_url;
    } else if let Some(suite) = &suite {
        cfg.base_url = suite.base_url.clone();
    }
    if let Some(suite) = &suite {
        cfg.capture_timeout = suite.capture_timeout();
    }
    cfg.suite = suite;

    info!(
        "Starting visreg web on http://{} (store: {}, suite: {})",
        web_addr,
        store.display(),
        cfg.suite.as_ref().map(|s| s.name.as_str()).unwrap_or("none")
    );

    let blobs = Arc::new(FsBlobStore::new(&store).await?);
    let driver = Arc::new(PlaywrightDriver::default());
    visreg_web::server::serve(web_addr, cfg, driver, blobs).await
}
