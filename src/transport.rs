//! TCP `Transport`: each RPC is one connection carrying a length-prefixed
//! `serde_json`-encoded `RaftMessage`. Grounded in the teacher's
//! `send_raft_message`/`handle_raft_message` (`write_u32`/`read_u32` framing,
//! a 5-second per-call timeout, one task per outbound peer call).

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{RaftError, Result};
use crate::node::RaftNode;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
use crate::service::{ClientRequest, ClientResponse, ClientService};

const RPC_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }

    async fn call(&self, peer: &str, message: RaftMessage) -> Result<RaftMessage> {
        tokio::time::timeout(RPC_TIMEOUT, Self::call_inner(peer, message))
            .await
            .map_err(|_| RaftError::PersistenceFailure("rpc timed out".to_string()))?
    }

    async fn call_inner(peer: &str, message: RaftMessage) -> Result<RaftMessage> {
        let mut stream = TcpStream::connect(peer)
            .await
            .map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;

        write_framed(&mut stream, &message)
            .await
            .map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;

        read_framed(&mut stream).await.map_err(|e| RaftError::PersistenceFailure(e.to_string()))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl crate::ports::Transport for TcpTransport {
    async fn send_request_vote(&self, peer: &str, request: RequestVoteRequest) -> Result<RequestVoteResponse> {
        match self.call(peer, RaftMessage::RequestVote(request)).await? {
            RaftMessage::RequestVoteResponse(response) => Ok(response),
            _ => Err(RaftError::PersistenceFailure("unexpected reply to RequestVote".to_string())),
        }
    }

    async fn send_append_entries(
        &self,
        peer: &str,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.call(peer, RaftMessage::AppendEntries(request)).await? {
            RaftMessage::AppendEntriesResponse(response) => Ok(response),
            _ => Err(RaftError::PersistenceFailure("unexpected reply to AppendEntries".to_string())),
        }
    }
}

async fn write_framed<T: Serialize>(stream: &mut TcpStream, message: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(message)?;
    stream.write_u32(bytes.len() as u32).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}

async fn read_framed<T: DeserializeOwned>(stream: &mut TcpStream) -> io::Result<T> {
    let len = stream.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(io::Error::from)
}

/// Accepts inbound peer connections on `bind_addr` and dispatches each
/// framed `RaftMessage` to the node, forever. Intended to be spawned once
/// per node at startup; one task per connection, matching the teacher's
/// `start_raft_listener`/`handle_raft_message`.
pub async fn serve_replication(bind_addr: String, node: Arc<RaftNode>) -> io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("[{}] replication transport listening on {}", node.node_id(), bind_addr);

    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            loop {
                let message = match read_framed(&mut stream).await {
                    Ok(message) => message,
                    Err(e) => {
                        if e.kind() != io::ErrorKind::UnexpectedEof {
                            log::debug!("replication connection from {} closed: {}", peer_addr, e);
                        }
                        return;
                    }
                };

                let reply = match message {
                    RaftMessage::RequestVote(request) => {
                        RaftMessage::RequestVoteResponse(node.handle_request_vote(request).await)
                    }
                    RaftMessage::AppendEntries(request) => {
                        RaftMessage::AppendEntriesResponse(node.handle_append_entries(request).await)
                    }
                    RaftMessage::RequestVoteResponse(_) | RaftMessage::AppendEntriesResponse(_) => {
                        log::warn!("received a response-shaped message on the listener side; ignoring");
                        continue;
                    }
                };

                if let Err(e) = write_framed(&mut stream, &reply).await {
                    log::debug!("failed to reply to {}: {}", peer_addr, e);
                    return;
                }
            }
        });
    }
}

/// Accepts inbound client connections on `bind_addr`, one request per
/// connection, and dispatches each to the `ClientService`. Mirrors the
/// teacher's separate app-facing port (distinct from the replication port
/// by `RAFT_PORT_OFFSET`).
pub async fn serve_client(bind_addr: String, service: Arc<ClientService>) -> io::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("client transport listening on {}", bind_addr);

    loop {
        let (mut stream, peer_addr) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let request: ClientRequest = match read_framed(&mut stream).await {
                Ok(request) => request,
                Err(e) => {
                    log::debug!("client connection from {} failed: {}", peer_addr, e);
                    return;
                }
            };

            let response = service.handle(request).await;
            if let Err(e) = write_framed(&mut stream, &response).await {
                log::debug!("failed to reply to client {}: {}", peer_addr, e);
            }
        });
    }
}

/// One-shot client call: connects, sends `request`, reads back one
/// `ClientResponse`, and closes the connection.
pub async fn send_client_request(addr: &str, request: &ClientRequest) -> io::Result<ClientResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    write_framed(&mut stream, request).await?;
    read_framed(&mut stream).await
}
