//! External collaborators the node depends on, reified as traits.
//!
//! The original source reached for global mutable hooks
//! (`native_consensus_now()`, `native_consensus_random()`,
//! `native_consensus_send()`). That makes the protocol state machine
//! non-deterministic and untestable. Here every such dependency is an
//! injected port instead, so `RaftNode` can be driven by fakes in tests and
//! by real TCP/clock/rng implementations in the binaries.

use async_trait::async_trait;

use crate::error::Result;
use crate::log::LogEntry;
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};

/// Durable storage for the three records that must survive a restart:
/// current term, the vote cast in that term, and the log prefix.
///
/// Implementations must make `save_term_vote` and `save_log` durable
/// (flushed to stable storage) before returning, since callers rely on
/// that to satisfy the "persist before replying" rule in the Raft paper.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn load(&self) -> Result<PersistedState>;

    async fn save_term_vote(&self, term: u64, voted_for: Option<String>) -> Result<()>;

    /// Persists the full current log. Implementations may optimize this to
    /// an incremental write; the port only requires that, once this
    /// returns, the given entries are durable.
    async fn save_log(&self, entries: &[LogEntry]) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,
}

/// Best-effort message delivery between peers, addressed by peer id.
///
/// A `send_*` call returning `Err` means the message was not delivered
/// (timeout, connection refused, peer unreachable) and the caller should
/// simply not credit that peer this round — it is not a protocol fault.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request_vote(
        &self,
        peer: &str,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse>;

    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}

/// A deterministic, idempotent (by index) application of committed
/// commands. `apply` is only ever called with indices in strictly
/// increasing order and with no gaps.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Applies the command at `index`, returning an opaque result that the
    /// client surface can relay back to whichever client proposed it.
    async fn apply(&self, index: u64, command: &[u8]) -> Result<Vec<u8>>;

    /// Highest index this state machine has applied, 0 if none.
    async fn last_applied(&self) -> u64;
}

/// Monotonic milliseconds. Never the wall clock directly — a `Clock` lets
/// tests substitute a fake that advances deterministically.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Uniform integers in `[min, max]`, used only for election timeout jitter.
pub trait RandomSource: Send + Sync {
    fn gen_range_ms(&self, min: u64, max: u64) -> u64;
}
