//! A minimal key/value `StateMachine`, used by `propose`/`get` for clients
//! that just want replicated storage rather than the lock service. Modeled
//! after a key/value layer sitting on top of a replicated log: writes go
//! through `apply`, reads are served locally without going through Raft.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ports::StateMachine;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<String, Vec<u8>>,
    last_applied: u64,
}

pub struct KvStateMachine {
    table: Mutex<Table>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self { table: Mutex::new(Table::default()) }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.table.lock().expect("kv table mutex poisoned").entries.get(key).cloned()
    }
}

impl Default for KvStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateMachine for KvStateMachine {
    async fn apply(&self, index: u64, command: &[u8]) -> Result<Vec<u8>> {
        let decoded: KvCommand = bincode::deserialize(command)
            .map_err(|e| crate::error::RaftError::PersistenceFailure(e.to_string()))?;

        let mut table = self.table.lock().expect("kv table mutex poisoned");
        match decoded {
            KvCommand::Put { key, value } => {
                table.entries.insert(key, value);
            }
            KvCommand::Delete { key } => {
                table.entries.remove(&key);
            }
        }
        table.last_applied = index;
        Ok(Vec::new())
    }

    async fn last_applied(&self) -> u64 {
        self.table.lock().expect("kv table mutex poisoned").last_applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let sm = KvStateMachine::new();
        let cmd = KvCommand::Put { key: "a".into(), value: b"hello".to_vec() };
        sm.apply(1, &bincode::serialize(&cmd).unwrap()).await.unwrap();
        assert_eq!(sm.get("a"), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let sm = KvStateMachine::new();
        let put = KvCommand::Put { key: "a".into(), value: b"hello".to_vec() };
        sm.apply(1, &bincode::serialize(&put).unwrap()).await.unwrap();
        let del = KvCommand::Delete { key: "a".into() };
        sm.apply(2, &bincode::serialize(&del).unwrap()).await.unwrap();
        assert_eq!(sm.get("a"), None);
    }
}
