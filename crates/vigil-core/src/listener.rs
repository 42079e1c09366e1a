//! Channel listener: the helper's single Unix socket endpoint.
//!
//! Connections are handled strictly one at a time: accept, read one request,
//! apply it, answer `OK` or `FAIL`, close. The next connection is not accepted
//! until the rule compiler for the current one has exited, which gives callers
//! a total order over ruleset installs.
//!
//! Reaching the socket is the only authentication. Whoever can open the path
//! can install rulesets, so its filesystem permissions are the policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use vigil_config::ListenerConfig;

use crate::applicator::Applicator;
use crate::daemon::ShutdownSignal;
use crate::protocol::Response;

/// Errors that prevent the listener from coming up. All of them are fatal.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to remove stale socket at {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to bind socket at {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerSettings {
    pub max_payload_bytes: usize,
    pub read_timeout: Option<Duration>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from(&ListenerConfig::default())
    }
}

impl From<&ListenerConfig> for ListenerSettings {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            max_payload_bytes: config.max_payload_bytes.max(1),
            read_timeout: config.read_timeout(),
        }
    }
}

/// Why a connection was closed without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The client closed before sending anything.
    Empty,
    /// The request exceeded the payload cap.
    Oversized,
    /// The client sent nothing within the read deadline.
    ReadTimeout,
    /// The socket read failed.
    ReadError,
}

/// What happened to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The request was applied and a token was written.
    Responded(Response),
    /// The request was never applied and nothing was written.
    Dropped(DropReason),
}

/// The bound helper socket.
pub struct Listener {
    inner: UnixListener,
    path: PathBuf,
    settings: ListenerSettings,
}

impl Listener {
    /// Bind the socket at `path`.
    ///
    /// Whatever is left at `path` from an earlier run is removed first, so a
    /// restart after an unclean exit succeeds.
    pub fn bind(path: &Path, settings: ListenerSettings) -> Result<Self, ListenerError> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ListenerError::StaleSocket {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let inner = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            inner,
            path: path.to_path_buf(),
            settings,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections sequentially until a shutdown signal arrives.
    ///
    /// Shutdown is only observed between connections; a request that has
    /// been accepted always runs to completion. The socket file is removed
    /// on return.
    pub async fn serve(
        self,
        applicator: &dyn Applicator,
        mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
    ) {
        info!(path = %self.path.display(), "listening for ruleset requests");

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("listener shutting down");
                    break;
                }
                accepted = self.inner.accept() => accepted,
            };
            let Some(stream) = accepted_stream(accepted) else {
                continue;
            };

            info!("accepted connection from agent");
            let disposition = self.handle(stream, applicator).await;
            debug!(?disposition, "connection closed");
        }

        std::fs::remove_file(&self.path).ok();
    }

    /// Run one connection through read, apply and respond.
    pub async fn handle(&self, mut stream: UnixStream, applicator: &dyn Applicator) -> Disposition {
        let request = match self.read_request(&mut stream).await {
            Ok(request) => request,
            Err(reason) => return Disposition::Dropped(reason),
        };

        let outcome = applicator.apply(&request).await;
        drop(request);

        if let Err(e) = stream.write_all(outcome.token()).await {
            warn!(error = %e, "failed to write response");
        }
        stream.shutdown().await.ok();

        Disposition::Responded(if outcome.is_success() {
            Response::Applied
        } else {
            Response::Rejected
        })
    }

    /// A single read bounded by the payload cap and the read deadline.
    ///
    /// One byte more than the cap is requested so an oversized request can be
    /// told apart from one that exactly fills it.
    async fn read_request(&self, stream: &mut UnixStream) -> Result<Vec<u8>, DropReason> {
        let cap = self.settings.max_payload_bytes;
        let mut buf = vec![0u8; cap + 1];

        let read = stream.read(&mut buf);
        let result = match self.settings.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?limit, "client sent no request before the deadline");
                    return Err(DropReason::ReadTimeout);
                }
            },
            None => read.await,
        };

        match result {
            Ok(0) => {
                error!("read from client failed: connection closed with no data");
                Err(DropReason::Empty)
            }
            Ok(n) if n > cap => {
                error!(limit = cap, "request exceeds payload limit");
                Err(DropReason::Oversized)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => {
                error!(error = %e, "read from client failed");
                Err(DropReason::ReadError)
            }
        }
    }
}

/// A failed accept is logged and skipped; it never stops the loop.
fn accepted_stream(
    accepted: std::io::Result<(UnixStream, tokio::net::unix::SocketAddr)>,
) -> Option<UnixStream> {
    match accepted {
        Ok((stream, _addr)) => Some(stream),
        Err(e) => {
            error!(error = %e, "accept failed");
            None
        }
    }
}
