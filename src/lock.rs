//! The fenced distributed lock service: a `StateMachine` whose commands are
//! proposed through Raft, so every node that applies the same committed log
//! prefix reaches the same lock table.
//!
//! Fencing: each successful acquire bumps a per-key monotonic counter and
//! hands the new value to the caller as a fence token. A holder uses that
//! token when writing to a downstream resource so the resource can reject a
//! write from a fence token older than the latest one it has seen, even if
//! the old holder hasn't noticed it lost the lock yet (a GC pause, a network
//! partition). The token only ever moves forward, including across the
//! unconditional-overwrite case in `apply_acquire`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ports::StateMachine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockCommand {
    Acquire {
        key: String,
        owner: String,
        ttl_ms: u64,
        /// Stamped by the leader at propose time so that every follower
        /// applies the same command with the same notion of "now" — using
        /// each node's own wall clock here would make `apply` non-
        /// deterministic across the cluster.
        now_ms: u64,
        /// Reserved for client-session de-duplication. Not acted on yet —
        /// see the open question on exactly-once semantics.
        request_id: Option<String>,
    },
    Release {
        key: String,
        owner: String,
        request_id: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LockResult {
    Acquired { fence_token: u64 },
    AlreadyHeld { held_by: String, expires_at_ms: u64 },
    Released,
    ReleaseDenied,
}

#[derive(Debug, Clone)]
struct LockRecord {
    owner: String,
    expires_at_ms: u64,
    fence_token: u64,
}

#[derive(Debug, Default)]
struct Table {
    locks: HashMap<String, LockRecord>,
    last_applied: u64,
}

/// `StateMachine` backing the lock service. Cheap to clone: internally an
/// `Arc`-free `Mutex<Table>`, since the node only ever calls `apply` from
/// inside its own state lock and never concurrently.
pub struct LockStateMachine {
    table: Mutex<Table>,
}

impl LockStateMachine {
    pub fn new() -> Self {
        Self { table: Mutex::new(Table::default()) }
    }

    /// Read path for the client surface's `get`: bypasses Raft entirely,
    /// since a lock inspection does not need linearizability stronger than
    /// "this node's locally applied state".
    pub fn inspect(&self, key: &str) -> Option<(String, u64, u64)> {
        let table = self.table.lock().expect("lock table mutex poisoned");
        table
            .locks
            .get(key)
            .map(|r| (r.owner.clone(), r.expires_at_ms, r.fence_token))
    }

    fn apply_acquire(table: &mut Table, key: String, owner: String, ttl_ms: u64, now_ms: u64) -> LockResult {
        let expired = table
            .locks
            .get(&key)
            .map(|r| r.expires_at_ms <= now_ms)
            .unwrap_or(true);

        let same_owner_renewal = table
            .locks
            .get(&key)
            .map(|r| r.owner == owner)
            .unwrap_or(false);

        if !expired && !same_owner_renewal {
            let held = table.locks.get(&key).expect("checked above");
            return LockResult::AlreadyHeld {
                held_by: held.owner.clone(),
                expires_at_ms: held.expires_at_ms,
            };
        }

        let next_token = table.locks.get(&key).map(|r| r.fence_token + 1).unwrap_or(1);
        table.locks.insert(
            key,
            LockRecord { owner, expires_at_ms: now_ms + ttl_ms, fence_token: next_token },
        );
        LockResult::Acquired { fence_token: next_token }
    }

    fn apply_release(table: &mut Table, key: String, owner: String) -> LockResult {
        match table.locks.get(&key) {
            Some(record) if record.owner == owner => {
                table.locks.remove(&key);
                LockResult::Released
            }
            _ => LockResult::ReleaseDenied,
        }
    }
}

impl Default for LockStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for LockStateMachine {
    async fn apply(&self, index: u64, command: &[u8]) -> Result<Vec<u8>> {
        let decoded: LockCommand = bincode::deserialize(command)
            .map_err(|e| crate::error::RaftError::PersistenceFailure(e.to_string()))?;

        let mut table = self.table.lock().expect("lock table mutex poisoned");
        let result = match decoded {
            LockCommand::Acquire { key, owner, ttl_ms, now_ms, request_id: _ } => {
                Self::apply_acquire(&mut table, key, owner, ttl_ms, now_ms)
            }
            LockCommand::Release { key, owner, request_id: _ } => Self::apply_release(&mut table, key, owner),
        };
        table.last_applied = index;

        bincode::serialize(&result).map_err(|e| crate::error::RaftError::PersistenceFailure(e.to_string()))
    }

    async fn last_applied(&self) -> u64 {
        self.table.lock().expect("lock table mutex poisoned").last_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_grants_increasing_fence_tokens_on_expiry() {
        let sm = LockStateMachine::new();

        let cmd = LockCommand::Acquire { key: "k".into(), owner: "a".into(), ttl_ms: 1000, now_ms: 0, request_id: None };
        let bytes = bincode::serialize(&cmd).unwrap();
        let result: LockResult = bincode::deserialize(&sm.apply(1, &bytes).await.unwrap()).unwrap();
        assert!(matches!(result, LockResult::Acquired { fence_token: 1 }));

        // Second owner tries before expiry: denied.
        let cmd = LockCommand::Acquire { key: "k".into(), owner: "b".into(), ttl_ms: 1000, now_ms: 500, request_id: None };
        let bytes = bincode::serialize(&cmd).unwrap();
        let result: LockResult = bincode::deserialize(&sm.apply(2, &bytes).await.unwrap()).unwrap();
        assert!(matches!(result, LockResult::AlreadyHeld { .. }));

        // After expiry, a new owner gets a strictly higher fence token.
        let cmd = LockCommand::Acquire { key: "k".into(), owner: "b".into(), ttl_ms: 1000, now_ms: 1500, request_id: None };
        let bytes = bincode::serialize(&cmd).unwrap();
        let result: LockResult = bincode::deserialize(&sm.apply(3, &bytes).await.unwrap()).unwrap();
        assert!(matches!(result, LockResult::Acquired { fence_token: 2 }));
    }

    #[tokio::test]
    async fn release_only_succeeds_for_current_owner() {
        let sm = LockStateMachine::new();
        let acquire = LockCommand::Acquire { key: "k".into(), owner: "a".into(), ttl_ms: 1000, now_ms: 0, request_id: None };
        sm.apply(1, &bincode::serialize(&acquire).unwrap()).await.unwrap();

        let release_wrong = LockCommand::Release { key: "k".into(), owner: "b".into(), request_id: None };
        let result: LockResult =
            bincode::deserialize(&sm.apply(2, &bincode::serialize(&release_wrong).unwrap()).await.unwrap())
                .unwrap();
        assert!(matches!(result, LockResult::ReleaseDenied));

        let release_right = LockCommand::Release { key: "k".into(), owner: "a".into(), request_id: None };
        let result: LockResult =
            bincode::deserialize(&sm.apply(3, &bincode::serialize(&release_right).unwrap()).await.unwrap())
                .unwrap();
        assert!(matches!(result, LockResult::Released));
        assert!(sm.inspect("k").is_none());
    }

    #[tokio::test]
    async fn same_owner_renewal_keeps_fence_token_monotonic() {
        let sm = LockStateMachine::new();
        let acquire = LockCommand::Acquire { key: "k".into(), owner: "a".into(), ttl_ms: 1000, now_ms: 0, request_id: None };
        sm.apply(1, &bincode::serialize(&acquire).unwrap()).await.unwrap();

        let renew = LockCommand::Acquire { key: "k".into(), owner: "a".into(), ttl_ms: 1000, now_ms: 100, request_id: None };
        let result: LockResult =
            bincode::deserialize(&sm.apply(2, &bincode::serialize(&renew).unwrap()).await.unwrap()).unwrap();
        assert!(matches!(result, LockResult::Acquired { fence_token: 2 }));
    }
}
