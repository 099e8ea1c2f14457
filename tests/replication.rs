//! Integration tests driving real `RaftNode`s over real TCP loopback
//! connections, one task per node, the same way the teacher's replication
//! tests did: spawn a listener per node, let the election timer run, then
//! assert on the resulting state. Ports are picked per-test from a counter
//! so tests can run concurrently without colliding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use raftlock::clock::{SystemClock, ThreadRngRandom};
use raftlock::config::NodeConfig;
use raftlock::lock::LockStateMachine;
use raftlock::node::RaftNode;
use raftlock::persistence::FilePersistence;
use raftlock::ports::StateMachine;
use raftlock::transport::{serve_replication, TcpTransport};

static NEXT_PORT_BASE: AtomicU16 = AtomicU16::new(21000);

fn next_port_base() -> u16 {
    NEXT_PORT_BASE.fetch_add(10, Ordering::SeqCst)
}

fn state_path(test_name: &str, node_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("raftlock_test_{}_{}.bin", test_name, node_id))
}

async fn spawn_node(
    test_name: &str,
    node_id: &str,
    port: u16,
    peer_ports: &[u16],
) -> (Arc<RaftNode>, Arc<LockStateMachine>) {
    let peers: Vec<String> = peer_ports.iter().map(|p| format!("127.0.0.1:{}", p)).collect();

    let path = state_path(test_name, node_id);
    let _ = std::fs::remove_file(&path);

    let config = NodeConfig {
        node_id: node_id.to_string(),
        peers,
        election_timeout_min_ms: 60,
        election_timeout_max_ms: 120,
        heartbeat_interval_ms: 20,
        max_batch_entries: 64,
        persistence_path: path.to_string_lossy().to_string(),
    };

    let lock_sm = Arc::new(LockStateMachine::new());
    let state_machine: Arc<dyn StateMachine> = Arc::clone(&lock_sm) as Arc<dyn StateMachine>;

    let node = RaftNode::new(
        config,
        Box::new(TcpTransport::new()),
        Box::new(FilePersistence::new(path)),
        state_machine,
        Box::new(SystemClock),
        Box::new(ThreadRngRandom),
    )
    .await
    .expect("node construction should succeed");

    let addr = format!("127.0.0.1:{}", port);
    let listener_node = Arc::clone(&node);
    tokio::spawn(async move {
        let _ = serve_replication(addr, listener_node).await;
    });

    node.spawn_background_tasks();
    (node, lock_sm)
}

async fn wait_for_leader(nodes: &[Arc<RaftNode>], timeout: Duration) -> Arc<RaftNode> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        for node in nodes {
            if node.is_leader().await {
                return Arc::clone(node);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no leader elected within timeout");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn lock_acquire_command(key: &str, owner: &str) -> Vec<u8> {
    let command = raftlock::lock::LockCommand::Acquire {
        key: key.to_string(),
        owner: owner.to_string(),
        ttl_ms: 60_000,
        now_ms: 0,
        request_id: None,
    };
    bincode::serialize(&command).unwrap()
}

#[tokio::test]
async fn replication_basic() {
    let base = next_port_base();
    let ports = [base, base + 1, base + 2];
    let ids = ["n1", "n2", "n3"];

    let mut nodes = Vec::new();
    let mut state_machines = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let peers: Vec<u16> = ports.iter().copied().filter(|p| *p != ports[i]).collect();
        let (node, sm) = spawn_node("replication_basic", id, ports[i], &peers).await;
        nodes.push(node);
        state_machines.push(sm);
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(3)).await;

    let (index, _result) = leader
        .propose(lock_acquire_command("k", "alice"), Duration::from_secs(2))
        .await
        .expect("propose should succeed on the leader");
    assert_eq!(index, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;

    for sm in &state_machines {
        let (owner, _expires, fence_token) = sm.inspect("k").expect("all nodes should have replicated the lock");
        assert_eq!(owner, "alice");
        assert_eq!(fence_token, 1);
    }
}

#[tokio::test]
async fn replication_multi_node_advances_commit_index() {
    let base = next_port_base();
    let ports = [base, base + 1, base + 2];
    let ids = ["n1", "n2", "n3"];

    let mut nodes = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let peers: Vec<u16> = ports.iter().copied().filter(|p| *p != ports[i]).collect();
        let (node, _sm) = spawn_node("replication_multi_node", id, ports[i], &peers).await;
        nodes.push(node);
    }

    let leader = wait_for_leader(&nodes, Duration::from_secs(3)).await;

    leader
        .propose(lock_acquire_command("k1", "alice"), Duration::from_secs(2))
        .await
        .expect("first proposal should commit");
    leader
        .propose(lock_acquire_command("k2", "bob"), Duration::from_secs(2))
        .await
        .expect("second proposal should commit");

    tokio::time::sleep(Duration::from_millis(200)).await;

    for node in &nodes {
        assert!(node.last_applied().await >= 2, "every node should have applied both entries");
    }
}

#[tokio::test]
async fn persistence_restart_recovers_term_and_log() {
    let path = state_path("persistence_restart", "solo");
    let _ = std::fs::remove_file(&path);

    let config = NodeConfig {
        node_id: "solo".to_string(),
        peers: Vec::new(),
        election_timeout_min_ms: 40,
        election_timeout_max_ms: 80,
        heartbeat_interval_ms: 20,
        max_batch_entries: 64,
        persistence_path: path.to_string_lossy().to_string(),
    };

    let lock_sm = Arc::new(LockStateMachine::new());
    let node = RaftNode::new(
        config.clone(),
        Box::new(TcpTransport::new()),
        Box::new(FilePersistence::new(path.clone())),
        Arc::clone(&lock_sm) as Arc<dyn StateMachine>,
        Box::new(SystemClock),
        Box::new(ThreadRngRandom),
    )
    .await
    .unwrap();
    node.spawn_background_tasks();

    // A single-node cluster is its own majority; wait for it to self-elect.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !node.is_leader().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("single node should become leader quickly");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for i in 0..3 {
        node.propose(lock_acquire_command(&format!("k{}", i), "alice"), Duration::from_secs(2))
            .await
            .unwrap();
    }

    let term_before = node.current_term().await;
    drop(node);

    let lock_sm_after = Arc::new(LockStateMachine::new());
    let restarted = RaftNode::new(
        config,
        Box::new(TcpTransport::new()),
        Box::new(FilePersistence::new(path.clone())),
        Arc::clone(&lock_sm_after) as Arc<dyn StateMachine>,
        Box::new(SystemClock),
        Box::new(ThreadRngRandom),
    )
    .await
    .unwrap();

    assert_eq!(restarted.current_term().await, term_before);
}
