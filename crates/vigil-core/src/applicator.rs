//! Ruleset applicator: the only place privilege is exercised.
//!
//! A request is handed to the rule compiler (`nft -f -`) as raw standard
//! input. The payload never reaches a command line, an argument vector or a
//! shell; the executable and its arguments are constants, and the binary is
//! checked before anything is spawned.
//!
//! ```text
//!   payload ──▶ stdin pipe ──▶ /usr/sbin/nft -f - ──▶ exit status ──▶ Outcome
//!                                     │
//!                                   stderr ──▶ local log only
//! ```
//!
//! Every path out of [`RulesetApplicator::run`] leaves the child reaped: it is
//! waited on after a failed write, killed and waited on after a deadline, and
//! `kill_on_drop` covers cancellation of the future itself.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::{AccessFlags, access};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::BoxFuture;
use crate::protocol::{FAIL_TOKEN, OK_TOKEN};

/// Trusted absolute path of the rule compiler.
pub const NFT_PATH: &str = "/usr/sbin/nft";

/// Fixed arguments: read the ruleset from standard input.
pub const NFT_ARGS: [&str; 2] = ["-f", "-"];

/// The only environment variable the rule compiler inherits.
pub const TRUSTED_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// How much of the compiler's stderr is kept for the local log.
const STDERR_LOG_LIMIT: usize = 4096;

/// How long stderr may stay open after the compiler has been reaped.
const STDERR_GRACE: Duration = Duration::from_millis(100);

/// Why a ruleset application failed. Never sent to the client.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("rule compiler {path} is missing or not executable: {reason}")]
    ToolMissing { path: PathBuf, reason: String },

    #[error("failed to spawn rule compiler: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write ruleset to rule compiler: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to wait for rule compiler: {0}")]
    Wait(#[source] std::io::Error),

    #[error("rule compiler exited with status {code}")]
    Exit { code: i32 },

    #[error("rule compiler terminated by signal {signal}")]
    Signaled { signal: String },

    #[error("rule compiler did not finish within {0:?}")]
    TimedOut(Duration),
}

/// Binary result of one application attempt.
#[derive(Debug)]
pub enum Outcome {
    Success,
    /// The error is a local diagnostic only.
    Failure(ApplyError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// The response token for this outcome.
    pub fn token(&self) -> &'static [u8] {
        match self {
            Self::Success => OK_TOKEN,
            Self::Failure(_) => FAIL_TOKEN,
        }
    }
}

impl From<Result<(), ApplyError>> for Outcome {
    fn from(result: Result<(), ApplyError>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e),
        }
    }
}

/// Something that can install a ruleset and report the outcome.
///
/// The listener only depends on this trait, so the privileged implementation
/// can be swapped for a recording double in tests.
pub trait Applicator: Send + Sync {
    fn apply<'a>(&'a self, ruleset: &'a [u8]) -> BoxFuture<'a, Outcome>;
}

/// Installs rulesets by streaming them into the rule compiler.
#[derive(Debug, Clone)]
pub struct RulesetApplicator {
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl RulesetApplicator {
    /// The production applicator: `/usr/sbin/nft -f -`.
    pub fn nft() -> Self {
        Self::new(NFT_PATH, NFT_ARGS)
    }

    /// An applicator for an arbitrary program and constant argument list.
    pub fn new<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
        }
    }

    /// Bound the write and wait phases (`None` = wait forever).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check that the rule compiler is a regular, executable file.
    pub fn verify_tool(&self) -> Result<(), ApplyError> {
        let missing = |reason: String| ApplyError::ToolMissing {
            path: self.program.clone(),
            reason,
        };

        let meta = std::fs::metadata(&self.program).map_err(|e| missing(e.to_string()))?;
        if !meta.is_file() {
            return Err(missing("not a regular file".to_string()));
        }
        access(self.program.as_path(), AccessFlags::X_OK).map_err(|e| missing(e.to_string()))
    }

    /// Spawn the rule compiler, feed it `ruleset` and classify its exit.
    pub async fn run(&self, ruleset: &[u8]) -> Result<(), ApplyError> {
        self.verify_tool()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env_clear()
            .env("PATH", TRUSTED_PATH)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ApplyError::Spawn)?;

        debug!(pid = ?child.id(), program = %self.program.display(), "rule compiler spawned");

        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let mut diagnostics = Vec::new();

        // The outcome is decided by the exit status alone. Stderr is drained
        // alongside and gets a short grace period once the child is reaped,
        // since a descendant may still hold it open.
        let finished = {
            let drained = drain(stderr, &mut diagnostics);
            tokio::pin!(drained);
            let mut drain_done = false;

            let exchange = async {
                let fed = feed(stdin, ruleset).await;
                let status = child.wait().await;
                (fed, status)
            };
            tokio::pin!(exchange);

            let until_exit = async {
                loop {
                    tokio::select! {
                        done = &mut exchange => break done,
                        () = &mut drained, if !drain_done => drain_done = true,
                    }
                }
            };

            let finished = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, until_exit).await.ok(),
                None => Some(until_exit.await),
            };

            if finished.is_some()
                && !drain_done
                && tokio::time::timeout(STDERR_GRACE, &mut drained).await.is_err()
            {
                debug!("rule compiler exited with stderr still held open");
            }
            finished
        };

        let Some((fed, status)) = finished else {
            // The deadline only fires while the child is still running.
            let limit = self.timeout.unwrap_or_default();
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill timed-out rule compiler");
            }
            return Err(ApplyError::TimedOut(limit));
        };

        let status = status.map_err(ApplyError::Wait)?;
        if !diagnostics.is_empty() {
            let text = String::from_utf8_lossy(&diagnostics);
            if status.success() {
                debug!(stderr = %text.trim_end(), "rule compiler diagnostics");
            } else {
                warn!(stderr = %text.trim_end(), "rule compiler diagnostics");
            }
        }

        if let Err(e) = fed {
            warn!(status = %status, "rule compiler stopped reading its input");
            return Err(ApplyError::Write(e));
        }

        classify(status)
    }
}

impl Default for RulesetApplicator {
    fn default() -> Self {
        Self::nft()
    }
}

impl Applicator for RulesetApplicator {
    fn apply<'a>(&'a self, ruleset: &'a [u8]) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            info!(bytes = ruleset.len(), "applying new ruleset");
            match self.run(ruleset).await {
                Ok(()) => {
                    info!("rule compiler succeeded");
                    Outcome::Success
                }
                Err(e) => {
                    error!(error = %e, "ruleset application failed");
                    Outcome::Failure(e)
                }
            }
        })
    }
}

/// Write the whole payload, then close stdin so the child sees EOF.
async fn feed(stdin: Option<ChildStdin>, ruleset: &[u8]) -> std::io::Result<()> {
    let mut stdin = stdin.ok_or_else(|| std::io::Error::other("stdin was not piped"))?;
    stdin.write_all(ruleset).await?;
    stdin.flush().await
}

/// Read stderr to EOF, keeping only the first [`STDERR_LOG_LIMIT`] bytes.
async fn drain(stderr: Option<ChildStderr>, kept: &mut Vec<u8>) {
    let Some(mut stderr) = stderr else {
        return;
    };
    let mut chunk = [0u8; 1024];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_LOG_LIMIT.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
}

/// Map an exit status to success or a failure diagnostic.
pub fn classify(status: ExitStatus) -> Result<(), ApplyError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(ApplyError::Exit { code }),
        None => Err(ApplyError::Signaled {
            signal: status
                .signal()
                .map(signal_name)
                .unwrap_or_else(|| "unknown".to_string()),
        }),
    }
}

fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signo.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use vigil_test_utils::fake_tool::FakeCompiler;

    fn applicator_for(tool: &FakeCompiler) -> RulesetApplicator {
        RulesetApplicator::new(tool.program(), tool.args())
    }

    #[test]
    fn test_nft_defaults() {
        let app = RulesetApplicator::nft();
        assert_eq!(app.program(), Path::new("/usr/sbin/nft"));
        assert_eq!(app.args, vec![OsString::from("-f"), OsString::from("-")]);
        assert_eq!(app.timeout(), None);
    }

    #[test]
    fn test_outcome_tokens() {
        assert_eq!(Outcome::Success.token(), b"OK");
        assert_eq!(Outcome::Failure(ApplyError::Exit { code: 1 }).token(), b"FAIL");
        assert!(Outcome::from(Ok(())).is_success());
        assert!(!Outcome::from(Err(ApplyError::Exit { code: 2 })).is_success());
    }

    #[test]
    fn test_classify_exit_codes() {
        assert!(classify(ExitStatus::from_raw(0)).is_ok());
        assert!(matches!(
            classify(ExitStatus::from_raw(1 << 8)),
            Err(ApplyError::Exit { code: 1 })
        ));
        match classify(ExitStatus::from_raw(9)) {
            Err(ApplyError::Signaled { signal }) => assert_eq!(signal, "SIGKILL"),
            other => panic!("expected Signaled, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_tool_missing() {
        let app = RulesetApplicator::new("/nonexistent/vigil/nft", NFT_ARGS);
        assert!(matches!(
            app.verify_tool(),
            Err(ApplyError::ToolMissing { .. })
        ));
    }

    #[test]
    fn test_verify_tool_rejects_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let app = RulesetApplicator::new(dir.path(), NFT_ARGS);
        let err = app.verify_tool().unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }

    #[test]
    fn test_verify_tool_rejects_non_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nft");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let app = RulesetApplicator::new(&path, NFT_ARGS);
        assert!(matches!(
            app.verify_tool(),
            Err(ApplyError::ToolMissing { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_tool_is_failure_without_spawn() {
        let app = RulesetApplicator::new("/nonexistent/vigil/nft", NFT_ARGS);
        let outcome = app.apply(b"table ip filter {}").await;
        assert!(matches!(
            outcome,
            Outcome::Failure(ApplyError::ToolMissing { .. })
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_success_streams_payload_verbatim() {
        let tool = FakeCompiler::accepting();
        let app = applicator_for(&tool);

        let ruleset = b"table ip filter { chain input { type filter hook input priority 0; policy accept; } }";
        app.run(ruleset).await.unwrap();

        assert_eq!(tool.captured().unwrap(), ruleset.to_vec());
    }

    #[tokio::test]
    async fn test_metacharacters_and_nul_are_only_data() {
        let tool = FakeCompiler::accepting();
        let app = applicator_for(&tool);

        let ruleset = b"; rm -rf / $(reboot) `id` | cat /etc/shadow && \0 trailing\0";
        app.run(ruleset).await.unwrap();

        assert_eq!(tool.captured().unwrap(), ruleset.to_vec());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure() {
        let tool = FakeCompiler::rejecting(3);
        let app = applicator_for(&tool);

        let err = app.run(b"not a real ruleset !!").await.unwrap_err();
        assert!(matches!(err, ApplyError::Exit { code: 3 }));
        assert_eq!(tool.captured().unwrap(), b"not a real ruleset !!".to_vec());
    }

    #[tokio::test]
    async fn test_signal_termination_is_failure() {
        let tool = FakeCompiler::script("cat > /dev/null; kill -9 $$");
        let app = applicator_for(&tool);

        match app.run(b"table inet t {}").await {
            Err(ApplyError::Signaled { signal }) => assert_eq!(signal, "SIGKILL"),
            other => panic!("expected Signaled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_compiler_environment_is_scrubbed() {
        let tool = FakeCompiler::script("cat > /dev/null; env > \"$0\"");
        let app = applicator_for(&tool);
        app.run(b"").await.unwrap();

        let env = String::from_utf8(tool.captured().unwrap()).unwrap();
        assert!(env.lines().any(|l| l == format!("PATH={TRUSTED_PATH}")));
        assert!(!env.lines().any(|l| l.starts_with("HOME=")));
        assert!(!env.lines().any(|l| l.starts_with("RUST_")));
    }

    #[tokio::test]
    async fn test_unread_input_is_write_failure() {
        // Exits before reading; a payload larger than the pipe buffer cannot
        // be delivered.
        let tool = FakeCompiler::script("exit 0");
        let app = applicator_for(&tool);

        let payload = vec![b'x'; 1024 * 1024];
        let err = app.run(&payload).await.unwrap_err();
        assert!(matches!(err, ApplyError::Write(_)));
    }

    #[tokio::test]
    async fn test_early_exit_with_error_status_is_write_failure() {
        let tool = FakeCompiler::script("exit 4");
        let app = applicator_for(&tool);

        let payload = vec![b'x'; 1024 * 1024];
        let err = app.run(&payload).await.unwrap_err();
        assert!(matches!(err, ApplyError::Write(_)));
        assert!(!Outcome::from(Err(err)).is_success());
    }

    // A background process inherits stderr and outlives the compiler.
    const LINGERING_STDERR: &str = "(sleep 3 &); cat > /dev/null; exit 0";

    #[tokio::test]
    async fn test_exit_status_decides_despite_open_stderr() {
        let tool = FakeCompiler::script(LINGERING_STDERR);
        let app = applicator_for(&tool).with_timeout(Some(Duration::from_secs(1)));

        let started = std::time::Instant::now();
        app.run(b"table ip filter {}").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_open_stderr_does_not_block_without_deadline() {
        let tool = FakeCompiler::script(LINGERING_STDERR);
        let app = applicator_for(&tool);

        let result = tokio::time::timeout(Duration::from_secs(2), app.run(b"table ip filter {}"))
            .await
            .expect("run waited for stderr to close");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_deadline_kills_hung_compiler() {
        let tool = FakeCompiler::hanging();
        let app = applicator_for(&tool).with_timeout(Some(Duration::from_millis(200)));

        let started = std::time::Instant::now();
        let err = app.run(b"table ip filter {}").await.unwrap_err();
        assert!(matches!(err, ApplyError::TimedOut(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stderr_is_not_part_of_outcome() {
        let tool = FakeCompiler::nft_like();
        let app = applicator_for(&tool);

        let outcome = app.apply(b"not a real ruleset !!").await;
        match outcome {
            Outcome::Failure(ApplyError::Exit { code }) => assert_eq!(code, 1),
            other => panic!("expected exit failure, got {other:?}"),
        }
    }
}
