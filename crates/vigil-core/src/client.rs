//! Client for the helper socket.
//!
//! Used by the `submit` command and by tests. Sends one ruleset, half-closes
//! the connection so the helper sees the end of the request, then reads
//! whatever the helper answers before it closes its side.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::protocol::{FAIL_TOKEN, Response};

/// Errors from the helper client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("helper is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("failed to connect to helper socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("helper did not answer within {0:?}")]
    Timeout(Duration),

    #[error("unexpected response from helper: {0:?}")]
    UnexpectedResponse(String),
}

/// Submits rulesets to a running helper.
pub struct RulesetClient {
    socket_path: PathBuf,
    timeout: Option<Duration>,
}

impl RulesetClient {
    /// Create a client targeting the given socket path.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: None,
        }
    }

    /// Give up on a submission after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Check if the helper socket exists (helper is likely running).
    pub fn helper_available(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one ruleset and report how the helper answered.
    pub async fn submit(&self, ruleset: &[u8]) -> Result<Response, ClientError> {
        if !self.helper_available() {
            return Err(ClientError::NotRunning(self.socket_path.clone()));
        }

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(ruleset))
                .await
                .map_err(|_| ClientError::Timeout(limit))?,
            None => self.exchange(ruleset).await,
        }
    }

    async fn exchange(&self, ruleset: &[u8]) -> Result<Response, ClientError> {
        let mut stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| ClientError::Connect {
                    path: self.socket_path.clone(),
                    source,
                })?;

        debug!(bytes = ruleset.len(), "submitting ruleset");

        // The helper may close early (oversized request); that still reads
        // as a dropped connection below.
        match stream.write_all(ruleset).await {
            Ok(()) => stream.shutdown().await?,
            Err(e) if is_closed_by_peer(&e) => return Ok(Response::Dropped),
            Err(e) => return Err(e.into()),
        }

        let mut reply = Vec::with_capacity(FAIL_TOKEN.len());
        match (&mut stream)
            .take(FAIL_TOKEN.len() as u64 + 1)
            .read_to_end(&mut reply)
            .await
        {
            Ok(_) => {}
            Err(e) if is_closed_by_peer(&e) => return Ok(Response::Dropped),
            Err(e) => return Err(e.into()),
        }

        Response::from_wire(&reply).ok_or_else(|| {
            ClientError::UnexpectedResponse(String::from_utf8_lossy(&reply).into_owned())
        })
    }
}

fn is_closed_by_peer(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    /// Accept one connection, read the request, answer with `reply`.
    async fn one_shot_server(listener: UnixListener, reply: &'static [u8]) -> Vec<u8> {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        stream.read_to_end(&mut request).await.unwrap();
        stream.write_all(reply).await.unwrap();
        request
    }

    #[test]
    fn test_client_creation() {
        let client = RulesetClient::new("/tmp/nonexistent-vigil-client.sock");
        assert!(!client.helper_available());
    }

    #[tokio::test]
    async fn test_not_running_error() {
        let client = RulesetClient::new("/tmp/nonexistent-vigil-client.sock");
        let result = client.submit(b"table ip filter {}").await;
        assert!(matches!(result, Err(ClientError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_submit_reads_tokens() {
        for (reply, expected) in [
            (&b"OK"[..], Response::Applied),
            (&b"FAIL"[..], Response::Rejected),
            (&b""[..], Response::Dropped),
        ] {
            let tmp = TempDir::new().unwrap();
            let path = tmp.path().join("helper.sock");
            let listener = UnixListener::bind(&path).unwrap();
            let server = tokio::spawn(one_shot_server(listener, reply));

            let response = RulesetClient::new(&path).submit(b"flush ruleset").await.unwrap();
            assert_eq!(response, expected);
            assert_eq!(server.await.unwrap(), b"flush ruleset".to_vec());
        }
    }

    #[tokio::test]
    async fn test_garbage_reply_is_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("helper.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(one_shot_server(listener, b"MAYBE"));

        let result = RulesetClient::new(&path).submit(b"flush ruleset").await;
        assert!(matches!(result, Err(ClientError::UnexpectedResponse(_))));
    }

    #[tokio::test]
    async fn test_timeout_when_helper_stalls() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("helper.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        // Connection sits in the backlog and is never accepted.
        let client = RulesetClient::new(&path).with_timeout(Duration::from_millis(100));
        let result = client.submit(b"flush ruleset").await;
        assert!(matches!(result, Err(ClientError::Timeout(_))));
    }
}
