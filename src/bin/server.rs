//! Node process: starts the Raft core, the replication listener, and the
//! client-facing listener. Port layout follows the teacher's dual-port
//! convention — the client port is what's given on the command line, the
//! replication port is that plus `RAFT_PORT_OFFSET`.

use std::env;
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{error, info};
use raftlock::clock::{SystemClock, ThreadRngRandom};
use raftlock::config::NodeConfig;
use raftlock::kv::KvStateMachine;
use raftlock::lock::LockStateMachine;
use raftlock::node::RaftNode;
use raftlock::persistence::FilePersistence;
use raftlock::ports::StateMachine;
use raftlock::service::ClientService;
use raftlock::transport::{serve_client, serve_replication, TcpTransport};

const RAFT_PORT_OFFSET: u16 = 1000;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("Usage: server <port> <node_id> [peer_host:port] ...");
    }

    let port: u16 = args[1].parse()?;
    let node_id = args[2].clone();
    let client_peers: Vec<String> = args[3..].to_vec();

    let replication_peers: Vec<String> = client_peers
        .iter()
        .map(|p| {
            let parts: Vec<&str> = p.split(':').collect();
            let peer_port: u16 = parts[1].parse().expect("peer address must be host:port");
            format!("{}:{}", parts[0], peer_port + RAFT_PORT_OFFSET)
        })
        .collect();

    info!("starting node {} on client port {}", node_id, port);
    info!("peers: {:?}", client_peers);

    let config = NodeConfig {
        node_id: node_id.clone(),
        peers: replication_peers,
        persistence_path: format!("raft_state_{}.bin", node_id),
        ..NodeConfig::default()
    };

    let transport = Box::new(TcpTransport::new());
    let persistence = Box::new(FilePersistence::new(config.persistence_path.clone()));
    let kv = Arc::new(KvStateMachine::new());
    let lock = Arc::new(LockStateMachine::new());
    let state_machine: Arc<dyn StateMachine> = Arc::new(DualStateMachine {
        kv: Arc::clone(&kv),
        lock: Arc::clone(&lock),
    });
    let clock = Arc::new(SystemClock);
    let random = Box::new(ThreadRngRandom);

    let node = RaftNode::new(config, transport, persistence, state_machine, Box::new(SystemClock), random)
        .await?;
    node.spawn_background_tasks();

    let replication_port = port + RAFT_PORT_OFFSET;
    let replication_addr = format!("127.0.0.1:{}", replication_port);
    let replication_node = Arc::clone(&node);
    tokio::spawn(async move {
        if let Err(e) = serve_replication(replication_addr, replication_node).await {
            error!("replication listener error: {}", e);
        }
    });

    let service = Arc::new(ClientService::new(Arc::clone(&node), kv, lock, clock));
    let client_addr = format!("127.0.0.1:{}", port);
    info!("client transport on {}, replication transport on {}", client_addr, replication_port);
    serve_client(client_addr, service).await?;

    Ok(())
}

/// A command's first byte selects which state machine decodes the rest,
/// so `RaftNode` can stay agnostic to having two. `ClientService` is the
/// only caller that needs to know about this split, but `RaftNode` still
/// requires a single `StateMachine` to apply against — this adapter is
/// that seam. In this crate only the lock/kv commands proposed via
/// `ClientService` ever reach it, and those are always routed correctly by
/// construction, so the tag byte is really just a defensive format guard.
struct DualStateMachine {
    kv: Arc<KvStateMachine>,
    lock: Arc<LockStateMachine>,
}

#[async_trait::async_trait]
impl StateMachine for DualStateMachine {
    async fn apply(&self, index: u64, command: &[u8]) -> raftlock::Result<Vec<u8>> {
        use raftlock::service::{KV_TAG, LOCK_TAG};
        match command.first() {
            Some(&KV_TAG) => self.kv.apply(index, &command[1..]).await,
            Some(&LOCK_TAG) => self.lock.apply(index, &command[1..]).await,
            _ => Err(raftlock::RaftError::PersistenceFailure(
                "command missing state machine tag byte".to_string(),
            )),
        }
    }

    async fn last_applied(&self) -> u64 {
        std::cmp::max(self.kv.last_applied().await, self.lock.last_applied().await)
    }
}
