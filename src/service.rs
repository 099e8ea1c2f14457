//! The client-facing surface: what a CLI or application actually calls.
//! Generalizes the teacher's `handle_client`/`NOT_LEADER:<id>` redirect
//! convention (see `src/bin/client.rs`) into a typed request/response pair
//! that a transport can frame however it likes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RaftError;
use crate::kv::{KvCommand, KvStateMachine};
use crate::lock::{LockCommand, LockResult, LockStateMachine};
use crate::node::RaftNode;
use crate::ports::Clock;

const PROPOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Tag bytes prefixed onto a proposed command so a combined state machine
/// (see `bin/server.rs::DualStateMachine`) knows which table to apply it
/// against. Owned here since `ClientService` is the only thing that ever
/// constructs a command.
pub const KV_TAG: u8 = 0;
pub const LOCK_TAG: u8 = 1;

/// How a read should be served. `Local` answers from this node's own applied
/// state immediately, even if it's a follower lagging the leader — the
/// response is labeled `stale` so the caller can tell. `Linearizable`
/// confirms this node is still the leader (via `RaftNode::confirm_leadership`)
/// before answering, and fails with `NotLeader` if it can't.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadKind {
    Local,
    Linearizable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientRequest {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    Get { key: String, read_kind: ReadKind },
    LockAcquire { key: String, owner: String, ttl_ms: u64, request_id: Option<String> },
    LockRelease { key: String, owner: String, request_id: Option<String> },
    LockInspect { key: String, read_kind: ReadKind },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientResponse {
    Put,
    Delete,
    Value { value: Option<Vec<u8>>, stale: bool },
    LockAcquired { fence_token: u64 },
    LockDenied { held_by: String, expires_at_ms: u64 },
    LockReleased,
    LockReleaseDenied,
    LockInspect { record: Option<(String, u64, u64)>, stale: bool },
    NotLeader { leader_hint: Option<String> },
    Error(String),
}

/// Binds a `RaftNode` to the two state machines it can drive, and exposes
/// one call per client operation. Separate from `RaftNode` itself so that
/// swapping in a different state machine set doesn't touch the consensus
/// core.
pub struct ClientService {
    node: Arc<RaftNode>,
    kv: Arc<KvStateMachine>,
    lock: Arc<LockStateMachine>,
    clock: Arc<dyn Clock>,
}

impl ClientService {
    pub fn new(
        node: Arc<RaftNode>,
        kv: Arc<KvStateMachine>,
        lock: Arc<LockStateMachine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { node, kv, lock, clock }
    }

    pub async fn handle(&self, request: ClientRequest) -> ClientResponse {
        match request {
            ClientRequest::Put { key, value } => {
                let command = KvCommand::Put { key, value };
                self.propose_kv(command).await.map(|_| ClientResponse::Put).unwrap_or_else(to_error)
            }
            ClientRequest::Delete { key } => {
                let command = KvCommand::Delete { key };
                self.propose_kv(command).await.map(|_| ClientResponse::Delete).unwrap_or_else(to_error)
            }
            ClientRequest::Get { key, read_kind } => match self.resolve_read(read_kind).await {
                Ok(stale) => ClientResponse::Value { value: self.kv.get(&key), stale },
                Err(e) => to_error(e),
            },
            ClientRequest::LockAcquire { key, owner, ttl_ms, request_id } => {
                let now_ms = self.clock.now_ms();
                let command = LockCommand::Acquire { key, owner, ttl_ms, now_ms, request_id };
                match self.propose_lock(command).await {
                    Ok(LockResult::Acquired { fence_token }) => ClientResponse::LockAcquired { fence_token },
                    Ok(LockResult::AlreadyHeld { held_by, expires_at_ms }) => {
                        ClientResponse::LockDenied { held_by, expires_at_ms }
                    }
                    Ok(_) => ClientResponse::Error("unexpected lock result for acquire".to_string()),
                    Err(e) => to_error(e),
                }
            }
            ClientRequest::LockRelease { key, owner, request_id } => {
                let command = LockCommand::Release { key, owner, request_id };
                match self.propose_lock(command).await {
                    Ok(LockResult::Released) => ClientResponse::LockReleased,
                    Ok(LockResult::ReleaseDenied) => ClientResponse::LockReleaseDenied,
                    Ok(_) => ClientResponse::Error("unexpected lock result for release".to_string()),
                    Err(e) => to_error(e),
                }
            }
            ClientRequest::LockInspect { key, read_kind } => match self.resolve_read(read_kind).await {
                Ok(stale) => ClientResponse::LockInspect { record: self.lock.inspect(&key), stale },
                Err(e) => to_error(e),
            },
        }
    }

    /// Resolves a read's staleness: `Local` always labels itself stale
    /// (even on the leader, since it hasn't confirmed anything), while
    /// `Linearizable` confirms leadership first and reports not-stale only
    /// once a majority of peers have acked this term within the call.
    async fn resolve_read(&self, read_kind: ReadKind) -> Result<bool, RaftError> {
        match read_kind {
            ReadKind::Local => Ok(true),
            ReadKind::Linearizable => {
                self.node.confirm_leadership().await?;
                Ok(false)
            }
        }
    }

    async fn propose_kv(&self, command: KvCommand) -> Result<Vec<u8>, RaftError> {
        let mut bytes = vec![KV_TAG];
        bytes.extend(bincode::serialize(&command).expect("KvCommand always serializes"));
        let (_index, result) = self.node.propose(bytes, PROPOSE_TIMEOUT).await?;
        Ok(result)
    }

    async fn propose_lock(&self, command: LockCommand) -> Result<LockResult, RaftError> {
        let mut bytes = vec![LOCK_TAG];
        bytes.extend(bincode::serialize(&command).expect("LockCommand always serializes"));
        let (_index, result) = self.node.propose(bytes, PROPOSE_TIMEOUT).await?;
        bincode::deserialize(&result).map_err(|e| RaftError::PersistenceFailure(e.to_string()))
    }
}

fn to_error(err: RaftError) -> ClientResponse {
    match err {
        RaftError::NotLeader(hint) => ClientResponse::NotLeader { leader_hint: hint },
        other => ClientResponse::Error(other.to_string()),
    }
}
