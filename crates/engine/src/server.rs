//! Application-under-test process management

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{info, warn};

use visreg_common::{Error, Result};

/// Configuration for launching the application under test
#[derive(Debug, Clone)]
pub struct AppServerConfig {
    /// Application binary
    pub binary: PathBuf,

    /// Extra command-line arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,

    /// Environment variable through which the port is passed
    pub port_env: String,

    /// Port to listen on (None = find a free one)
    pub port: Option<u16>,

    /// Path polled until it answers 2xx
    pub health_path: String,

    pub startup_timeout: Duration,
}

impl AppServerConfig {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: Vec::new(),
            port_env: "PORT".to_string(),
            port: None,
            health_path: "/health".to_string(),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// A running application instance; terminated on drop
pub struct AppServer {
    child: Child,
    base_url: String,
    port: u16,
}

impl AppServer {
    /// Launch the application and wait until its health endpoint answers
    pub async fn spawn(config: AppServerConfig) -> Result<Self> {
        let port = match config.port {
            Some(port) => port,
            None => find_free_port()?,
        };
        let base_url = format!("http://127.0.0.1:{}", port);

        info!("Starting {} on port {}", config.binary.display(), port);

        let mut cmd = Command::new(&config.binary);
        cmd.args(&config.args)
            .env(&config.port_env, port.to_string())
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let child = cmd.spawn().map_err(|e| {
            Error::AppServer(format!("failed to spawn {}: {}", config.binary.display(), e))
        })?;

        // Constructed before the health wait so a failed start is still torn down
        let server = AppServer {
            child,
            base_url,
            port,
        };
        server
            .wait_for_healthy(&config.health_path, config.startup_timeout)
            .await?;

        info!("Application is healthy at {}", server.base_url);
        Ok(server)
    }

    async fn wait_for_healthy(&self, path: &str, limit: Duration) -> Result<()> {
        let health_url = format!("{}{}", self.base_url, path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| Error::AppServer(e.to_string()))?;

        let start = Instant::now();
        let mut attempts = 0u32;

        while start.elapsed() < limit {
            attempts += 1;
            match client.get(&health_url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => warn!("Health check returned {}", resp.status()),
                Err(e) => {
                    if attempts == 1 {
                        info!("Waiting for application to start...");
                    }
                    // refused connections are expected during startup
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
            }
            sleep(Duration::from_millis(100)).await;
        }

        Err(Error::AppServer(format!(
            "{} not healthy after {} attempt(s) in {:?}",
            health_url, attempts, limit
        )))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// SIGTERM, a short grace period, then kill
    pub fn stop(&mut self) {
        if let Ok(Some(_)) = self.child.try_wait() {
            return;
        }
        info!("Stopping application (pid: {})", self.child.id());

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                std::thread::sleep(Duration::from_millis(500));
            }
        }

        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for AppServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Ask the OS for an unused local port
pub fn find_free_port() -> Result<u16> {
    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let config = AppServerConfig::new("/nonexistent/visreg-app-under-test");
        let err = AppServer::spawn(config).await.err().unwrap();
        assert!(matches!(err, Error::AppServer(ref msg) if msg.contains("failed to spawn")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unhealthy_process_is_reported_and_killed() {
        let mut config = AppServerConfig::new("sleep");
        config.args = vec!["30".to_string()];
        config.startup_timeout = Duration::from_millis(300);
        let err = AppServer::spawn(config).await.err().unwrap();
        assert!(matches!(err, Error::AppServer(ref msg) if msg.contains("not healthy")));
    }
}
