//! Session controller
//!
//! Lifecycle of one proxy instance as seen by a test harness: start once per
//! suite, configure per subtest, stop at the end.
//!
//! ```no_run
//! # async fn run() -> tapedeck_core::Result<()> {
//! use tapedeck_core::{ProxyOptions, ProxySession, SnapshotId};
//!
//! let session = ProxySession::start(ProxyOptions::new("https://api.githubcopilot.com")).await?;
//! // point the CLI under test at session.base_url()
//! let id = SnapshotId::new("session", "should answer a question");
//! session
//!     .configure_for("/repo/test/snapshots".as_ref(), &id, "/tmp/work".as_ref())
//!     .await?;
//! // ... drive the CLI ...
//! session.stop(false).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::{wait_for_shutdown, Engine, FlushOutcome, ProxyMode, ProxyOptions};
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::settings::Settings;
use crate::snapshot::{SnapshotContext, SnapshotId};

/// How long stop waits for open connections before aborting the server
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running proxy bound to a local port
pub struct ProxySession {
    engine: Arc<Engine>,
    local_addr: SocketAddr,
    base_url: String,
    server: Option<JoinHandle<()>>,
}

impl ProxySession {
    /// Start on an ephemeral loopback port
    pub async fn start(options: ProxyOptions) -> Result<Self> {
        Self::start_on(options, 0).await
    }

    /// Start with options resolved from the environment
    pub async fn start_from_env() -> Result<Self> {
        let options = ProxyOptions::from_settings(Settings::global()?)?;
        Self::start(options).await
    }

    pub async fn start_on(options: ProxyOptions, port: u16) -> Result<Self> {
        let engine = Arc::new(Engine::new(options)?);

        let addr = format!("127.0.0.1:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;
        let base_url = format!("http://{local_addr}");

        let app = engine.router();
        let shutdown = engine.shutdown_signal();
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown(shutdown))
                .await;
            if let Err(e) = result {
                error!("Proxy server error: {}", e);
            }
        });

        info!(
            "Proxy listening on {} -> {}",
            base_url,
            engine.options().upstream_url
        );

        Ok(Self {
            engine,
            local_addr,
            base_url,
            server: Some(server),
        })
    }

    /// `http://127.0.0.1:<port>`; point the client under test here
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn mode(&self) -> ProxyMode {
        self.engine.mode().await
    }

    /// Bind the next subtest to `snapshot_path`, replaying if it has
    /// exchanges and recording otherwise
    pub async fn configure(
        &self,
        snapshot_path: impl AsRef<Path>,
        work_dir: impl AsRef<Path>,
    ) -> Result<ProxyMode> {
        self.ensure_running()?;
        self.engine
            .configure(
                snapshot_path.as_ref(),
                work_dir.as_ref(),
                SnapshotContext::default(),
            )
            .await
    }

    /// Configure from a snapshot identity under `snapshots_root`
    pub async fn configure_for(
        &self,
        snapshots_root: &Path,
        id: &SnapshotId,
        work_dir: &Path,
    ) -> Result<ProxyMode> {
        self.ensure_running()?;
        self.engine
            .configure(&id.path_in(snapshots_root), work_dir, id.context())
            .await
    }

    /// Close the current subtest's window without stopping the server
    pub async fn finish_test(&self, test_failed: bool) -> Result<FlushOutcome> {
        self.engine.flush(test_failed).await
    }

    /// Exchanges captured since the last configure, in arrival order
    pub async fn exchanges(&self) -> Vec<Exchange> {
        self.engine.exchanges().await
    }

    /// Flush and shut down
    ///
    /// The port is released even when the flush reports an error.
    pub async fn stop(mut self, test_failed: bool) -> Result<FlushOutcome> {
        let outcome = self.engine.flush(test_failed).await;
        self.shutdown_server().await;
        outcome
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.server {
            Some(server) if !server.is_finished() => Ok(()),
            _ => Err(Error::NotRunning),
        }
    }

    async fn shutdown_server(&mut self) {
        self.engine.shutdown();
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                warn!("Proxy server did not stop in time; aborting");
                server.abort();
            }
        }
        info!("Proxy on {} stopped", self.base_url);
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.engine.shutdown();
            server.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let session = ProxySession::start(ProxyOptions::new("http://127.0.0.1:9"))
            .await
            .unwrap();
        assert!(session.base_url().starts_with("http://127.0.0.1:"));
        assert_ne!(session.local_addr().port(), 0);
        assert_eq!(session.mode().await, ProxyMode::Idle);

        let health: serde_json::Value = reqwest::get(format!("{}/__tapedeck/health", session.base_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["mode"], "idle");

        session.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let session = ProxySession::start(ProxyOptions::new("http://127.0.0.1:9"))
            .await
            .unwrap();
        let addr = session.local_addr();
        session.stop(false).await.unwrap();

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_configure_for_uses_snapshot_layout() {
        let root = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let session = ProxySession::start(ProxyOptions::new("http://127.0.0.1:9"))
            .await
            .unwrap();

        let id = SnapshotId::new("permissions", "Should deny tool");
        let mode = session
            .configure_for(root.path(), &id, work.path())
            .await
            .unwrap();
        assert_eq!(mode, ProxyMode::Recording);
        assert!(root.path().join("permissions").is_dir());

        // nothing recorded, nothing written
        let outcome = session.stop(false).await.unwrap();
        assert!(!outcome.persisted);
        assert!(!root
            .path()
            .join("permissions")
            .join("should_deny_tool.yaml")
            .exists());
    }

    #[tokio::test]
    async fn test_idle_request_is_rejected() {
        let session = ProxySession::start(ProxyOptions::new("http://127.0.0.1:9"))
            .await
            .unwrap();
        let response = reqwest::get(format!("{}/models", session.base_url()))
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        session.stop(false).await.unwrap();
    }
}
