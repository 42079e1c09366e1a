//! Wire protocol between the agent and the helper.
//!
//! The protocol is unframed and single-shot: the client writes the raw
//! ruleset bytes, the helper answers with one of two fixed tokens and closes
//! the connection. A connection closed with no bytes at all means the request
//! was never processed (empty, oversized, timed out or unreadable).

/// Response sent when the ruleset was installed.
pub const OK_TOKEN: &[u8] = b"OK";

/// Response sent for every failure, with no further detail.
pub const FAIL_TOKEN: &[u8] = b"FAIL";

/// The three outcomes a client can observe for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The helper answered `OK`.
    Applied,
    /// The helper answered `FAIL`.
    Rejected,
    /// The helper closed the connection without answering.
    Dropped,
}

impl Response {
    /// Interpret the bytes read from the helper before it closed the connection.
    ///
    /// Returns `None` for anything other than the two tokens or silence.
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [] => Some(Self::Dropped),
            OK_TOKEN => Some(Self::Applied),
            FAIL_TOKEN => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Whether a well-behaved caller should treat this as success.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied => write!(f, "OK"),
            Self::Rejected => write!(f, "FAIL"),
            Self::Dropped => write!(f, "no response (connection dropped)"),
        }
    }
}
