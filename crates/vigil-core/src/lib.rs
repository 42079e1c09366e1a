#![deny(unsafe_code)]

//! Vigil privileged helper runtime.
//!
//! A root-owned daemon that accepts firewall rulesets from the unprivileged
//! agent over a Unix socket and installs them by streaming each one into
//! `nft -f -`. The helper never interprets a ruleset itself; the caller only
//! ever learns `OK` or `FAIL`.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used where a trait method must
/// stay object-safe (`&dyn Applicator`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Ruleset applicator: spawns the rule compiler and classifies its exit.
pub mod applicator;
/// Client side of the helper socket protocol.
pub mod client;
/// Daemon runtime and shutdown handling.
pub mod daemon;
/// Socket listener: bind, sequential accept loop, bounded read, response.
pub mod listener;
/// `[helper]`-prefixed stderr logging.
pub mod logging;
/// Startup root check.
pub mod privilege;
/// Wire protocol constants and response tokens.
pub mod protocol;

pub use applicator::{Applicator, ApplyError, Outcome, RulesetApplicator};
pub use client::{ClientError, RulesetClient};
pub use daemon::{Daemon, DaemonError, ShutdownSignal};
pub use listener::{Disposition, DropReason, Listener, ListenerError, ListenerSettings};
pub use protocol::Response;
