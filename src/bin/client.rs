//! CLI client: generalizes the teacher's leader-discovery retry loop
//! (`handle_encrypt`/`send_request_to_server`, `NOT_LEADER:<id>`/`NO_LEADER`
//! sentinel strings) into a typed retry over `ClientResponse::NotLeader`.

use std::fs;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use raftlock::service::{ClientRequest, ClientResponse, ReadKind};
use raftlock::transport::send_client_request;

const SERVER_CONFIG_FILE: &str = "servers.conf";
const MAX_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a key/value pair through the replicated log.
    Put { key: String, value: String },
    /// Remove a key through the replicated log.
    Delete { key: String },
    /// Read a key. Local (default) answers from whatever node is asked,
    /// possibly stale; --linearizable requires that node to confirm
    /// leadership first and fails if it isn't the leader.
    Get {
        key: String,
        #[arg(long)]
        linearizable: bool,
    },
    /// Acquire a fenced lock, proposing through the replicated log.
    LockAcquire {
        key: String,
        owner: String,
        #[arg(long, default_value_t = 10_000)]
        ttl_ms: u64,
    },
    /// Release a fenced lock this owner currently holds.
    LockRelease { key: String, owner: String },
    /// Inspect a lock's current holder and fence token, if any.
    LockInspect {
        key: String,
        #[arg(long)]
        linearizable: bool,
    },
}

fn read_kind(linearizable: bool) -> ReadKind {
    if linearizable {
        ReadKind::Linearizable
    } else {
        ReadKind::Local
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let request = match cli.command {
        Commands::Put { key, value } => ClientRequest::Put { key, value: value.into_bytes() },
        Commands::Delete { key } => ClientRequest::Delete { key },
        Commands::Get { key, linearizable } => ClientRequest::Get { key, read_kind: read_kind(linearizable) },
        Commands::LockAcquire { key, owner, ttl_ms } => {
            ClientRequest::LockAcquire { key, owner, ttl_ms, request_id: None }
        }
        Commands::LockRelease { key, owner } => ClientRequest::LockRelease { key, owner, request_id: None },
        Commands::LockInspect { key, linearizable } => {
            ClientRequest::LockInspect { key, read_kind: read_kind(linearizable) }
        }
    };

    let response = send_with_leader_discovery(&request).await?;
    print_response(response);
    Ok(())
}

fn load_servers() -> Result<Vec<String>> {
    let content = fs::read_to_string(SERVER_CONFIG_FILE)?;
    let servers: Vec<String> = content.lines().filter(|s| !s.is_empty()).map(String::from).collect();
    if servers.is_empty() {
        bail!("No servers found in '{}'", SERVER_CONFIG_FILE);
    }
    Ok(servers)
}

/// Tries every known server in turn; a `NotLeader` reply (with or without a
/// hint) just means "ask someone else". Gives up after `MAX_ATTEMPTS` full
/// passes over the server list.
async fn send_with_leader_discovery(request: &ClientRequest) -> Result<ClientResponse> {
    let servers = load_servers()?;

    for attempt in 1..=MAX_ATTEMPTS {
        println!("attempt {} of {}", attempt, MAX_ATTEMPTS);

        for server_addr in &servers {
            match send_client_request(server_addr, request).await {
                Ok(ClientResponse::NotLeader { leader_hint }) => match leader_hint {
                    Some(id) => println!("  {} is not the leader (hint: {})", server_addr, id),
                    None => println!("  {} is not the leader (no leader known)", server_addr),
                },
                Ok(response) => return Ok(response),
                Err(e) => println!("  {} unreachable: {}", server_addr, e),
            }
        }

        println!("no leader available, retrying in {:?}", RETRY_DELAY);
        tokio::time::sleep(RETRY_DELAY).await;
    }

    bail!("failed to reach the leader after {} attempts", MAX_ATTEMPTS)
}

fn print_response(response: ClientResponse) {
    match response {
        ClientResponse::Put => println!("OK"),
        ClientResponse::Delete => println!("OK"),
        ClientResponse::Value { value, stale } => {
            let suffix = if stale { " (stale)" } else { "" };
            match value {
                Some(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(s) => println!("{}{}", s, suffix),
                    Err(_) => println!("{:?}{}", bytes, suffix),
                },
                None => println!("(not found){}", suffix),
            }
        }
        ClientResponse::LockAcquired { fence_token } => println!("acquired, fence_token={}", fence_token),
        ClientResponse::LockDenied { held_by, expires_at_ms } => {
            println!("denied: held by {} until {}ms", held_by, expires_at_ms)
        }
        ClientResponse::LockReleased => println!("released"),
        ClientResponse::LockReleaseDenied => println!("release denied: not the current owner"),
        ClientResponse::LockInspect { record, stale } => {
            let suffix = if stale { " (stale)" } else { "" };
            match record {
                Some((owner, expires_at_ms, fence_token)) => {
                    println!("held by {} until {}ms, fence_token={}{}", owner, expires_at_ms, fence_token, suffix)
                }
                None => println!("(no lock held){}", suffix),
            }
        }
        ClientResponse::NotLeader { .. } => unreachable!("handled by send_with_leader_discovery"),
        ClientResponse::Error(message) => println!("error: {}", message),
    }
}
