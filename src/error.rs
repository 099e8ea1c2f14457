//! Typed error taxonomy for the consensus core.
//!
//! Protocol-level disagreements (`StaleTerm`, `LogInconsistent`) are not
//! faults — they are information for the peer that sent the RPC, and are
//! normally surfaced as a `success = false` / `vote_granted = false` reply
//! rather than propagated as an `Err`. `PersistenceFailure` and
//! `LogUnderflow` are the two variants that must never be silently
//! swallowed: they indicate the node can no longer vouch for its own
//! durable state.

use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RaftError {
    /// A client proposal was routed to a node that is not currently leader.
    #[error("not leader{}", hint_suffix(.0))]
    NotLeader(Option<String>),

    /// An inbound RPC or response carried a term older than ours.
    #[error("stale term")]
    StaleTerm,

    /// A follower's prev-log consistency check failed.
    #[error("log inconsistent at the requested prev_log_index")]
    LogInconsistent,

    /// Attempted to truncate the log below `commit_index`.
    #[error("refusing to truncate committed log entries")]
    LogUnderflow,

    /// A durable write failed. The operation that triggered it must fail too.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// A client-issued proposal did not commit before its deadline.
    #[error("proposal timed out before committing")]
    ProposalTimeout,

    /// The node is shutting down and cannot service the request.
    #[error("node is shutting down")]
    Shutdown,
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(id) => format!(" (hint: {id})"),
        None => String::new(),
    }
}

impl RaftError {
    pub fn not_leader(hint: Option<String>) -> Self {
        RaftError::NotLeader(hint)
    }
}

/// Shorthand used throughout the library for library-internal `Result`s.
pub type Result<T> = std::result::Result<T, RaftError>;

/// Redacted debug helper used by log lines that must not print full
/// command payloads (commands can be arbitrary client bytes).
pub(crate) struct Redacted<'a>(pub &'a [u8]);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} bytes>", self.0.len())
    }
}
