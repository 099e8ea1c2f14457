//! The Raft node: role state machine, RequestVote/AppendEntries handlers,
//! the leader's replication loop, commit advancement, and election timers.
//!
//! All state transitions are serialized through `state: Mutex<NodeState>`.
//! RPC handlers (`handle_request_vote`, `handle_append_entries`) hold the
//! lock for their entire duration, including the durability flush, so a
//! handler either completes as one atomic step or not at all — this is the
//! simplest way to guarantee no transition ever observes a partially
//! updated term/log/commit triple (spec's single-logical-ordering
//! requirement). The leader's fan-out paths (`start_election`,
//! `send_append_entries_round`) instead snapshot what they need, drop the
//! lock before the network round-trip, and re-check `current_term` after
//! re-acquiring it — those suspension points are where a higher-term event
//! can legitimately have been processed in between.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant as TokioInstant;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::ports::{Clock, Persistence, RandomSource, StateMachine, Transport};
use crate::rpc::{AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

pub(crate) struct NodeState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub role: Role,
    pub log: Log,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<String>,
    /// Absolute monotonic millisecond deadline; a follower/candidate that
    /// reaches this deadline without hearing from a leader starts (or
    /// restarts) an election.
    pub election_deadline_ms: u64,
    pub votes_received: HashSet<String>,
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,
    /// Results of `StateMachine::apply`, keyed by log index, so that a
    /// concurrent `propose` can retrieve the outcome once it commits even
    /// though some other task may be the one that actually drove the apply.
    pub apply_results: HashMap<u64, Vec<u8>>,
}

const APPLY_RESULT_RETENTION: u64 = 4096;

pub struct RaftNode {
    pub(crate) config: NodeConfig,
    pub(crate) state: Mutex<NodeState>,
    transport: Box<dyn Transport>,
    persistence: Box<dyn Persistence>,
    state_machine: Arc<dyn StateMachine>,
    clock: Box<dyn Clock>,
    random: Box<dyn RandomSource>,
}

impl RaftNode {
    pub async fn new(
        config: NodeConfig,
        transport: Box<dyn Transport>,
        persistence: Box<dyn Persistence>,
        state_machine: Arc<dyn StateMachine>,
        clock: Box<dyn Clock>,
        random: Box<dyn RandomSource>,
    ) -> Result<Arc<Self>> {
        let persisted = persistence.load().await?;
        let now = clock.now_ms();
        let deadline = now
            + random.gen_range_ms(config.election_timeout_min_ms, config.election_timeout_max_ms);

        let state = NodeState {
            current_term: persisted.current_term,
            voted_for: persisted.voted_for,
            role: Role::Follower,
            log: Log::from_entries(persisted.log),
            commit_index: 0,
            // No snapshotting: commit_index is not persisted and is instead
            // re-learned from the leader's next AppendEntries, so replay
            // starts from scratch rather than from a stale on-disk value.
            last_applied: 0,
            leader_id: None,
            election_deadline_ms: deadline,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            apply_results: HashMap::new(),
        };

        info!(
            "[{}] recovered: term={} voted_for={:?} log_len={}",
            config.node_id,
            state.current_term,
            state.voted_for,
            state.log.last_index()
        );

        Ok(Arc::new(Self {
            config,
            state: Mutex::new(state),
            transport,
            persistence,
            state_machine,
            clock,
            random,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Spawns the election timer and heartbeat sender as background tasks.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let election_node = Arc::clone(self);
        tokio::spawn(async move { election_node.run_election_timer().await });

        let heartbeat_node = Arc::clone(self);
        tokio::spawn(async move { heartbeat_node.run_heartbeat_sender().await });
    }

    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == Role::Leader
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.lock().await.leader_id.clone()
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    // ---------------------------------------------------------------
    // Timers
    // ---------------------------------------------------------------

    async fn run_election_timer(&self) {
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;

            let should_elect = {
                let state = self.state.lock().await;
                if state.role == Role::Leader {
                    continue;
                }
                self.clock.now_ms() >= state.election_deadline_ms
            };

            if should_elect {
                self.start_election().await;
            }
        }
    }

    async fn run_heartbeat_sender(&self) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval()).await;

            let (is_leader, term, leader_commit) = {
                let state = self.state.lock().await;
                (state.role == Role::Leader, state.current_term, state.commit_index)
            };

            if is_leader {
                self.send_append_entries_round(term, leader_commit).await;
            }
        }
    }

    fn reset_election_deadline(&self, state: &mut NodeState) {
        let jitter = self
            .random
            .gen_range_ms(self.config.election_timeout_min_ms, self.config.election_timeout_max_ms);
        state.election_deadline_ms = self.clock.now_ms() + jitter;
    }

    // ---------------------------------------------------------------
    // Election
    // ---------------------------------------------------------------

    pub async fn start_election(&self) {
        let (term, last_log_index, last_log_term, voted_for) = {
            let mut state = self.state.lock().await;
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.config.node_id.clone());
            state.votes_received.clear();
            state.votes_received.insert(self.config.node_id.clone());
            self.reset_election_deadline(&mut state);

            info!("[{}] starting election for term {}", self.config.node_id, state.current_term);

            (
                state.current_term,
                state.log.last_index(),
                state.log.last_term(),
                state.voted_for.clone(),
            )
        };

        if let Err(e) = self.persistence.save_term_vote(term, voted_for).await {
            error!("[{}] failed to persist candidacy: {}", self.config.node_id, e);
            return;
        }

        let majority = self.config.majority();
        if majority == 1 {
            self.become_leader().await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id.clone(),
            last_log_index,
            last_log_term,
        };

        let mut votes_granted = 1usize;
        for peer in &self.config.peers {
            match self.transport.send_request_vote(peer, request.clone()).await {
                Ok(response) => {
                    let mut state = self.state.lock().await;

                    if response.term > state.current_term {
                        self.step_down(&mut state, response.term).await;
                        return;
                    }

                    // Discard stale responses from a since-superseded term.
                    if state.role != Role::Candidate || state.current_term != term {
                        return;
                    }

                    if response.vote_granted {
                        votes_granted += 1;
                        state.votes_received.insert(peer.clone());
                        debug!(
                            "[{}] received vote from {} ({}/{})",
                            self.config.node_id, peer, votes_granted, majority
                        );
                        if votes_granted >= majority {
                            drop(state);
                            self.become_leader().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!("[{}] vote request to {} failed: {}", self.config.node_id, peer, e);
                }
            }
        }

        let mut state = self.state.lock().await;
        if state.role == Role::Candidate && state.current_term == term {
            info!("[{}] election for term {} did not reach a majority", self.config.node_id, term);
        }
    }

    pub async fn become_leader(&self) {
        let (term, leader_commit) = {
            let mut state = self.state.lock().await;
            if state.role == Role::Leader {
                return;
            }
            state.role = Role::Leader;
            state.leader_id = Some(self.config.node_id.clone());

            let last_index = state.log.last_index();
            for peer in &self.config.peers {
                state.next_index.insert(peer.clone(), last_index + 1);
                state.match_index.insert(peer.clone(), 0);
            }
            state.match_index.insert(self.config.node_id.clone(), last_index);

            // A lone (or already-self-majority) leader never gets an
            // AppendEntries response to trigger this from, so check here too.
            self.advance_commit_index(&mut state).await;

            info!("[{}] became leader for term {}", self.config.node_id, state.current_term);
            (state.current_term, state.commit_index)
        };

        self.send_append_entries_round(term, leader_commit).await;
    }

    /// Steps down to follower for a newly observed higher term. Must be
    /// called with `state` already locked.
    async fn step_down(&self, state: &mut MutexGuard<'_, NodeState>, term: u64) {
        state.current_term = term;
        state.role = Role::Follower;
        state.voted_for = None;
        state.leader_id = None;

        if let Err(e) = self.persistence.save_term_vote(term, None).await {
            error!("[{}] failed to persist stepped-down term: {}", self.config.node_id, e);
        }
    }

    // ---------------------------------------------------------------
    // RPC handlers (inbound)
    // ---------------------------------------------------------------

    pub async fn handle_request_vote(&self, req: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.lock().await;

        if req.term > state.current_term {
            self.step_down(&mut state, req.term).await;
        }

        if req.term < state.current_term {
            return RequestVoteResponse { term: state.current_term, vote_granted: false };
        }

        let last_log_term = state.log.last_term();
        let last_log_index = state.log.last_index();
        let up_to_date = req.last_log_term > last_log_term
            || (req.last_log_term == last_log_term && req.last_log_index >= last_log_index);

        let can_vote = match &state.voted_for {
            None => true,
            Some(voted_for) => voted_for == &req.candidate_id,
        };

        if can_vote && up_to_date {
            state.voted_for = Some(req.candidate_id.clone());
            let term = state.current_term;

            if let Err(e) = self.persistence.save_term_vote(term, state.voted_for.clone()).await {
                error!("[{}] failed to persist vote: {}", self.config.node_id, e);
                return RequestVoteResponse { term, vote_granted: false };
            }

            self.reset_election_deadline(&mut state);
            info!(
                "[{}] granted vote to {} for term {}",
                self.config.node_id, req.candidate_id, term
            );
            RequestVoteResponse { term, vote_granted: true }
        } else {
            debug!(
                "[{}] denied vote to {} for term {} (voted_for={:?}, up_to_date={})",
                self.config.node_id, req.candidate_id, state.current_term, state.voted_for, up_to_date
            );
            RequestVoteResponse { term: state.current_term, vote_granted: false }
        }
    }

    pub async fn handle_append_entries(&self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.lock().await;

        if req.term < state.current_term {
            return AppendEntriesResponse {
                term: state.current_term,
                success: false,
                match_index: state.log.last_index(),
            };
        }

        if req.term > state.current_term {
            self.step_down(&mut state, req.term).await;
        }

        state.role = Role::Follower;
        state.leader_id = Some(req.leader_id.clone());
        self.reset_election_deadline(&mut state);

        if req.prev_log_index > 0 {
            let matches = state.log.term_at(req.prev_log_index) == Some(req.prev_log_term);
            if req.prev_log_index > state.log.last_index() || !matches {
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.log.last_index(),
                };
            }
        }

        let mut log_changed = false;
        for entry in &req.entries {
            match state.log.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => {
                    // Already present and matching: idempotent, skip.
                }
                Some(_) => {
                    let commit_index = state.commit_index;
                    if let Err(e) = state.log.truncate_after(entry.index - 1, commit_index) {
                        error!("[{}] refused truncation: {}", self.config.node_id, e);
                        return AppendEntriesResponse {
                            term: state.current_term,
                            success: false,
                            match_index: state.log.last_index(),
                        };
                    }
                    if let Err(e) = state.log.append(vec![entry.clone()]) {
                        error!("[{}] failed to append after truncation: {}", self.config.node_id, e);
                        return AppendEntriesResponse {
                            term: state.current_term,
                            success: false,
                            match_index: state.log.last_index(),
                        };
                    }
                    log_changed = true;
                }
                None => {
                    if let Err(e) = state.log.append(vec![entry.clone()]) {
                        error!("[{}] failed to append entry {}: {}", self.config.node_id, entry.index, e);
                        return AppendEntriesResponse {
                            term: state.current_term,
                            success: false,
                            match_index: state.log.last_index(),
                        };
                    }
                    log_changed = true;
                }
            }
        }

        if log_changed {
            let entries = state.log.entries().to_vec();
            if let Err(e) = self.persistence.save_log(&entries).await {
                error!("[{}] failed to persist log: {}", self.config.node_id, e);
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                    match_index: state.log.last_index(),
                };
            }
        }

        if req.leader_commit > state.commit_index {
            state.commit_index = std::cmp::min(req.leader_commit, state.log.last_index());
            self.apply_committed(&mut state).await;
        }

        AppendEntriesResponse {
            term: state.current_term,
            success: true,
            match_index: state.log.last_index(),
        }
    }

    // ---------------------------------------------------------------
    // Leader replication
    // ---------------------------------------------------------------

    async fn send_append_entries_round(&self, term: u64, leader_commit: u64) {
        let peers = self.config.peers.clone();
        let max_batch = self.config.max_batch_entries;

        for peer in peers {
            let (prev_log_index, prev_log_term, entries) = {
                let state = self.state.lock().await;
                if state.role != Role::Leader || state.current_term != term {
                    return;
                }
                let next_index = *state
                    .next_index
                    .get(&peer)
                    .unwrap_or(&(state.log.last_index() + 1));
                let prev_index = next_index.saturating_sub(1);
                let prev_term = state.log.term_at(prev_index).unwrap_or(0);
                let entries = state.log.slice(next_index, max_batch);
                (prev_index, prev_term, entries)
            };

            let entries_len = entries.len() as u64;
            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            };

            match self.transport.send_append_entries(&peer, request).await {
                Ok(response) => {
                    self.handle_append_entries_response(&peer, term, prev_log_index, entries_len, response)
                        .await;
                }
                Err(e) => {
                    debug!("[{}] append entries to {} failed: {}", self.config.node_id, peer, e);
                }
            }
        }
    }

    async fn handle_append_entries_response(
        &self,
        peer: &str,
        sent_term: u64,
        prev_log_index: u64,
        entries_len: u64,
        response: AppendEntriesResponse,
    ) {
        let mut state = self.state.lock().await;

        if response.term > state.current_term {
            self.step_down(&mut state, response.term).await;
            return;
        }

        if state.role != Role::Leader || state.current_term != sent_term {
            return;
        }

        if response.success {
            let inferred = prev_log_index + entries_len;
            let new_match = std::cmp::max(inferred, response.match_index);
            let current = state.match_index.get(peer).copied().unwrap_or(0);
            if new_match > current {
                state.match_index.insert(peer.to_string(), new_match);
                state.next_index.insert(peer.to_string(), new_match + 1);
            }
            self.advance_commit_index(&mut state).await;
        } else {
            let suggested = response.match_index.saturating_add(1).max(1);
            let current_next = state.next_index.get(peer).copied().unwrap_or(1);
            let new_next = std::cmp::min(suggested, current_next.saturating_sub(1).max(1));
            if new_next < current_next {
                state.next_index.insert(peer.to_string(), new_next);
            }
        }
    }

    /// Finds the highest N > commit_index replicated to a majority whose
    /// term matches `current_term`, and applies up through it. The
    /// same-term restriction is required for Leader Completeness.
    async fn advance_commit_index(&self, state: &mut NodeState) {
        let last_index = state.log.last_index();
        let majority = self.config.majority();
        let mut new_commit = state.commit_index;

        for n in (state.commit_index + 1)..=last_index {
            if state.log.term_at(n) != Some(state.current_term) {
                continue;
            }
            let count = state
                .match_index
                .values()
                .filter(|&&match_index| match_index >= n)
                .count();
            if count >= majority {
                new_commit = n;
            }
        }

        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            info!("[{}] advanced commit_index to {}", self.config.node_id, new_commit);
            self.apply_committed(state).await;
        }
    }

    async fn apply_committed(&self, state: &mut NodeState) {
        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            let Some(entry) = state.log.entry_at(index) else { break };
            let command = entry.command.clone();

            match self.state_machine.apply(index, &command).await {
                Ok(result) => {
                    state.apply_results.insert(index, result);
                    state.last_applied = index;
                }
                Err(e) => {
                    error!("[{}] state machine apply failed at index {}: {}", self.config.node_id, index, e);
                    break;
                }
            }
        }

        if state.apply_results.len() as u64 > APPLY_RESULT_RETENTION {
            let floor = state.last_applied.saturating_sub(APPLY_RESULT_RETENTION);
            state.apply_results.retain(|&index, _| index > floor);
        }
    }

    // ---------------------------------------------------------------
    // Client surface: propose
    // ---------------------------------------------------------------

    /// Proposes `command` to the cluster and waits (up to `timeout`) for it
    /// to commit and apply, returning the committed index and the state
    /// machine's apply result. Only succeeds when called on the leader.
    pub async fn propose(&self, command: Vec<u8>, timeout: Duration) -> Result<(u64, Vec<u8>)> {
        let index = {
            let mut state = self.state.lock().await;
            if state.role != Role::Leader {
                return Err(RaftError::not_leader(state.leader_id.clone()));
            }
            let term = state.current_term;
            let entry = state.log.append_one(term, command);
            let entries = state.log.entries().to_vec();
            self.persistence.save_log(&entries).await?;

            let last_index = state.log.last_index();
            state.match_index.insert(self.config.node_id.clone(), last_index);

            // With no peers (or peers already at match_index >= this entry),
            // nothing will ever drive handle_append_entries_response for it,
            // so check for a self-satisfied majority right away.
            self.advance_commit_index(&mut state).await;

            entry.index
        };

        let (term, leader_commit) = {
            let state = self.state.lock().await;
            (state.current_term, state.commit_index)
        };
        self.send_append_entries_round(term, leader_commit).await;

        let deadline = TokioInstant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                if let Some(result) = state.apply_results.get(&index) {
                    return Ok((index, result.clone()));
                }
                if state.role != Role::Leader {
                    return Err(RaftError::not_leader(state.leader_id.clone()));
                }
            }
            if TokioInstant::now() >= deadline {
                return Err(RaftError::ProposalTimeout);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Confirms leadership by completing one successful heartbeat round to
    /// a majority, for callers that want a linearizable read guarantee
    /// rather than a possibly-stale local read.
    pub async fn confirm_leadership(&self) -> Result<()> {
        let (term, leader_commit, is_leader) = {
            let state = self.state.lock().await;
            (state.current_term, state.commit_index, state.role == Role::Leader)
        };
        if !is_leader {
            let hint = self.state.lock().await.leader_id.clone();
            return Err(RaftError::not_leader(hint));
        }

        if self.config.peers.is_empty() {
            return Ok(());
        }

        let mut acks = 1usize;
        for peer in &self.config.peers {
            let request = {
                let state = self.state.lock().await;
                let next_index = *state.next_index.get(peer).unwrap_or(&(state.log.last_index() + 1));
                let prev_index = next_index.saturating_sub(1);
                AppendEntriesRequest {
                    term,
                    leader_id: self.config.node_id.clone(),
                    prev_log_index: prev_index,
                    prev_log_term: state.log.term_at(prev_index).unwrap_or(0),
                    entries: Vec::new(),
                    leader_commit,
                }
            };
            if let Ok(response) = self.transport.send_append_entries(peer, request).await {
                if response.term == term && response.success {
                    acks += 1;
                }
            }
        }

        if acks >= self.config.majority() {
            Ok(())
        } else {
            Err(RaftError::not_leader(None))
        }
    }

    pub async fn last_applied(&self) -> u64 {
        self.state.lock().await.last_applied
    }
}
