//! Helper daemon: startup, shutdown, and the serve loop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tracing::{info, warn};

use vigil_config::{HelperConfig, SOCKET_PATH_ENV};

use crate::applicator::{Applicator, RulesetApplicator};
use crate::listener::{Listener, ListenerError, ListenerSettings};

/// Shutdown signal sent via broadcast channel.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The privileged helper daemon.
pub struct Daemon {
    config: HelperConfig,
    socket_path: PathBuf,
    applicator: Arc<dyn Applicator>,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    /// Created with the channel so a shutdown requested before `run` is
    /// still seen. Taken by the first `run`.
    shutdown_rx: Mutex<Option<broadcast::Receiver<ShutdownSignal>>>,
}

impl Daemon {
    /// Create the production daemon: `nft` applicator, socket path resolved
    /// from `VIGIL_SOCKET_PATH`, the config file and the default, in that
    /// order.
    pub fn new(config: HelperConfig) -> Self {
        let resolved = config.resolve_socket_path(std::env::var_os(SOCKET_PATH_ENV));
        if let Some(rejected) = &resolved.rejected {
            warn!(
                source = ?rejected.source,
                len = rejected.len,
                fallback = %resolved.path.display(),
                "socket path override is too long for a unix socket; falling back to default"
            );
        }

        let applicator = RulesetApplicator::nft().with_timeout(config.applicator.timeout());
        Self::with_applicator(config, resolved.path, Arc::new(applicator))
    }

    /// Create a daemon with an explicit socket path and applicator.
    pub fn with_applicator(
        config: HelperConfig,
        socket_path: PathBuf,
        applicator: Arc<dyn Applicator>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        Self {
            config,
            socket_path,
            applicator,
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
        }
    }

    /// Bind the socket and serve until a shutdown signal is received.
    ///
    /// SIGINT and SIGTERM are forwarded to the shutdown channel. Binding
    /// failures are returned; per-connection failures never are.
    pub async fn run(&self) -> Result<(), DaemonError> {
        let shutdown_rx = self
            .shutdown_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());

        let settings = ListenerSettings::from(&self.config.listener);
        let listener = Listener::bind(&self.socket_path, settings)?;
        info!(
            path = %listener.path().display(),
            max_payload_bytes = settings.max_payload_bytes,
            read_timeout = ?settings.read_timeout,
            apply_timeout = ?self.config.applicator.timeout(),
            "privileged helper ready"
        );

        let signals = tokio::spawn(forward_termination(self.shutdown_tx.clone()));

        listener.serve(self.applicator.as_ref(), shutdown_rx).await;

        signals.abort();
        info!("privileged helper stopped");
        Ok(())
    }

    /// Request a graceful shutdown of the daemon.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(ShutdownSignal);
    }

    /// The socket path this daemon binds.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get a reference to the daemon's configuration.
    pub fn config(&self) -> &HelperConfig {
        &self.config
    }
}

/// Wait for SIGINT or SIGTERM and turn it into a [`ShutdownSignal`].
async fn forward_termination(shutdown_tx: broadcast::Sender<ShutdownSignal>) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            None
        }
    };

    let terminate = async {
        match sigterm.as_mut() {
            Some(s) => {
                s.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, initiating graceful shutdown");
        }
        _ = terminate => {
            warn!("SIGTERM received, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(ShutdownSignal);
}

/// Errors from the daemon runtime.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::applicator::ApplyError;
    use crate::{BoxFuture, Outcome};

    struct AlwaysFail;

    impl Applicator for AlwaysFail {
        fn apply<'a>(&'a self, _ruleset: &'a [u8]) -> BoxFuture<'a, Outcome> {
            Box::pin(async { Outcome::Failure(ApplyError::Exit { code: 1 }) })
        }
    }

    #[test]
    fn test_daemon_creation() {
        let daemon = Daemon::with_applicator(
            HelperConfig::default(),
            PathBuf::from("/tmp/vigil-test.sock"),
            Arc::new(AlwaysFail),
        );
        assert_eq!(daemon.socket_path(), Path::new("/tmp/vigil-test.sock"));
        assert_eq!(daemon.config().listener.max_payload_bytes, 8192);
    }

    #[test]
    fn test_daemon_shutdown_without_run() {
        let daemon = Daemon::with_applicator(
            HelperConfig::default(),
            PathBuf::from("/tmp/vigil-test.sock"),
            Arc::new(AlwaysFail),
        );
        // Shutdown should not panic
        daemon.shutdown();
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let tmp = tempfile::TempDir::new().unwrap();
        let daemon = Arc::new(Daemon::with_applicator(
            HelperConfig::default(),
            tmp.path().join("vigil.sock"),
            Arc::new(AlwaysFail),
        ));

        let runner = Arc::clone(&daemon);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(daemon.socket_path().exists());

        daemon.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(!daemon.socket_path().exists());
    }

    #[tokio::test]
    async fn test_shutdown_before_run_is_not_lost() {
        let tmp = tempfile::TempDir::new().unwrap();
        let daemon = Daemon::with_applicator(
            HelperConfig::default(),
            tmp.path().join("vigil.sock"),
            Arc::new(AlwaysFail),
        );

        daemon.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), daemon.run())
            .await
            .expect("run ignored an earlier shutdown request");
        assert!(result.is_ok());
        assert!(!daemon.socket_path().exists());
    }

    #[tokio::test]
    async fn test_run_fails_when_socket_cannot_be_bound() {
        let tmp = tempfile::TempDir::new().unwrap();
        let occupied = tmp.path().join("dir");
        std::fs::create_dir(&occupied).unwrap();

        let daemon =
            Daemon::with_applicator(HelperConfig::default(), occupied, Arc::new(AlwaysFail));
        assert!(matches!(daemon.run().await, Err(DaemonError::Listener(_))));
    }
}
