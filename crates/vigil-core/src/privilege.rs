//! Startup privilege check.
//!
//! The helper exists to run the rule compiler as root, so it refuses to
//! start otherwise. The check happens once, before the socket is bound.

use nix::unistd::{Uid, geteuid};

#[derive(Debug, thiserror::Error)]
pub enum PrivilegeError {
    #[error("the helper must be run as root (effective uid is {0})")]
    NotRoot(u32),
}

/// Fail unless the effective uid is 0.
pub fn require_root() -> Result<(), PrivilegeError> {
    check_euid(geteuid())
}

fn check_euid(euid: Uid) -> Result<(), PrivilegeError> {
    if euid.is_root() {
        Ok(())
    } else {
        Err(PrivilegeError::NotRoot(euid.as_raw()))
    }
}
