//! Raft consensus node
//!
//! One `RaftNode` per process. State lives behind a std `Mutex` that is
//! never held across an `.await`: requests are built under the lock, sent
//! without it, and their replies re-checked against the current term.
//!
//! Background tasks:
//! - ticker: election timeouts, heartbeats, leader quorum check
//! - applier: feeds committed entries to the state machine, takes snapshots
//! - one replication task per peer while it has something in flight

use crate::common::{Error, NodeId, Peer, RaftConfig, Result};
use crate::raft::log::RaftLog;
use crate::raft::message::{
    AppendRequest, AppendResponse, EntryKind, InstallSnapshotRequest, InstallSnapshotResponse,
    LogEntry, ProposeRequest, Proposed, Snapshot, VoteRequest, VoteResponse,
};
use crate::raft::storage::{HardState, RaftStorage};
use crate::transport::Transport;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::time::Instant;

/// What committed entries are applied to
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed entry; the bytes are handed back to the proposer
    fn apply(&self, entry: &LogEntry) -> Result<Vec<u8>>;

    /// Serialized state and the index it reflects
    fn snapshot(&self) -> Result<(u64, Vec<u8>)>;

    fn restore(&self, data: &[u8]) -> Result<()>;

    /// Committed voter set; empty until the cluster is initialized
    fn members(&self) -> Vec<Peer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_index: u64,
    /// Last index covered by the local snapshot; the log starts after it
    pub snapshot_index: u64,
}

struct Waiter {
    term: u64,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

struct RaftState {
    role: RaftRole,
    hard: HardState,
    leader_id: Option<NodeId>,
    log: RaftLog,
    snapshot: Option<Snapshot>,
    commit_index: u64,
    last_applied: u64,
    election_deadline: Instant,
    next_heartbeat: Instant,
    votes: HashSet<NodeId>,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    last_ack: HashMap<NodeId, Instant>,
    in_flight: HashSet<NodeId>,
    waiters: BTreeMap<u64, Waiter>,
}

enum Outgoing {
    Append(AppendRequest),
    Snapshot(InstallSnapshotRequest),
}

pub struct RaftNode {
    id: NodeId,
    this: Weak<RaftNode>,
    config: RaftConfig,
    bootstrap_peers: Vec<Peer>,
    state: Mutex<RaftState>,
    storage: RaftStorage,
    state_machine: Arc<dyn StateMachine>,
    transport: Arc<dyn Transport>,
    apply_notify: Notify,
    shutdown_tx: watch::Sender<bool>,
}

fn majority(voters: usize) -> usize {
    voters / 2 + 1
}

impl RaftNode {
    /// Rebuild the node from its storage. The state machine is restored from
    /// the last snapshot; later committed entries are re-applied once the
    /// commit index is learned again.
    pub fn new(
        id: NodeId,
        config: RaftConfig,
        bootstrap_peers: Vec<Peer>,
        storage: RaftStorage,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let recovered = storage.load()?;
        let (log, applied) = match &recovered.snapshot {
            Some(snapshot) => {
                state_machine.restore(&snapshot.data)?;
                let log = RaftLog::from_parts(
                    snapshot.last_included_index,
                    snapshot.last_included_term,
                    recovered.entries,
                );
                (log, snapshot.last_included_index)
            }
            None => (RaftLog::from_parts(0, 0, recovered.entries), 0),
        };

        tracing::info!(
            "Raft node {} recovered: term {}, last index {}, snapshot at {}",
            id,
            recovered.hard_state.term,
            log.last_index(),
            applied
        );

        let now = Instant::now();
        let state = RaftState {
            role: RaftRole::Follower,
            hard: recovered.hard_state,
            leader_id: None,
            log,
            snapshot: recovered.snapshot,
            commit_index: applied,
            last_applied: applied,
            election_deadline: now + Self::random_election_timeout(&config),
            next_heartbeat: now,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_ack: HashMap::new(),
            in_flight: HashSet::new(),
            waiters: BTreeMap::new(),
        };
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            config,
            bootstrap_peers,
            state: Mutex::new(state),
            storage,
            state_machine,
            transport,
            apply_notify: Notify::new(),
            shutdown_tx,
        }))
    }

    /// Spawn the ticker and the applier
    pub fn start(self: &Arc<Self>) {
        let ticker = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { ticker.run_ticker(shutdown).await });

        let applier = self.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move { applier.run_applier(shutdown).await });
    }

    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn state(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn random_election_timeout(config: &RaftConfig) -> Duration {
        let base = config.election_timeout_ms;
        Duration::from_millis(rand::thread_rng().gen_range(base..base * 2))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.state().role == RaftRole::Leader
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state().leader_id
    }

    pub fn status(&self) -> RaftStatus {
        let st = self.state();
        RaftStatus {
            id: self.id,
            role: st.role,
            term: st.hard.term,
            leader: st.leader_id,
            commit_index: st.commit_index,
            last_applied: st.last_applied,
            last_index: st.log.last_index(),
            snapshot_index: st.log.snapshot_index(),
        }
    }

    /// Current voters: the committed membership, or the bootstrap peers
    /// while the cluster is not initialized
    pub fn voters(&self) -> Vec<Peer> {
        let members = self.state_machine.members();
        if members.is_empty() {
            self.bootstrap_peers.clone()
        } else {
            members
        }
    }

    /// Is this node part of the committed membership?
    pub fn is_member(&self) -> bool {
        self.state_machine
            .members()
            .iter()
            .any(|p| p.id == self.id)
    }

    fn peer(&self, id: NodeId) -> Option<Peer> {
        self.voters().into_iter().find(|p| p.id == id)
    }

    // === State transitions (called with the lock held) ===

    fn persist_hard_state(&self, st: &RaftState) -> Result<()> {
        self.storage.save_hard_state(&st.hard)
    }

    fn reset_election_deadline(&self, st: &mut RaftState) {
        st.election_deadline = Instant::now() + Self::random_election_timeout(&self.config);
    }

    fn become_follower(&self, st: &mut RaftState, term: u64, leader: Option<NodeId>) -> Result<()> {
        if term > st.hard.term {
            st.hard.term = term;
            st.hard.voted_for = None;
            self.persist_hard_state(st)?;
        }
        if st.role != RaftRole::Follower {
            tracing::info!("Node {} stepping down to follower in term {}", self.id, term);
        }
        st.role = RaftRole::Follower;
        st.leader_id = leader;
        st.votes.clear();
        self.reset_election_deadline(st);
        Ok(())
    }

    fn become_leader(&self, st: &mut RaftState, voters: &[Peer]) -> Result<()> {
        tracing::info!("Node {} became leader in term {}", self.id, st.hard.term);
        st.role = RaftRole::Leader;
        st.leader_id = Some(self.id);
        st.votes.clear();
        let next = st.log.last_index() + 1;
        st.next_index.clear();
        st.match_index.clear();
        st.last_ack.clear();
        let now = Instant::now();
        for peer in voters {
            st.next_index.insert(peer.id, next);
            st.match_index.insert(peer.id, 0);
            st.last_ack.insert(peer.id, now);
        }
        st.next_heartbeat = now;

        // Commits entries left over from earlier terms
        let entry = LogEntry {
            term: st.hard.term,
            index: next,
            kind: EntryKind::Noop,
            data: Vec::new(),
        };
        self.storage.append(std::slice::from_ref(&entry))?;
        st.log.append(entry);
        self.advance_commit(st, voters);
        Ok(())
    }

    /// Move the commit index to the highest current-term entry a majority stores
    fn advance_commit(&self, st: &mut RaftState, voters: &[Peer]) {
        if st.role != RaftRole::Leader || voters.is_empty() {
            return;
        }
        let needed = majority(voters.len());
        let last = st.log.last_index();
        let mut n = last;
        while n > st.commit_index {
            if st.log.term_at(n) != Some(st.hard.term) {
                break;
            }
            let acks = voters
                .iter()
                .filter(|p| {
                    if p.id == self.id {
                        true
                    } else {
                        st.match_index.get(&p.id).copied().unwrap_or(0) >= n
                    }
                })
                .count();
            if acks >= needed {
                tracing::debug!("Commit index {} -> {}", st.commit_index, n);
                st.commit_index = n;
                self.apply_notify.notify_one();
                break;
            }
            n -= 1;
        }
    }

    /// Fail waiters whose entries were removed from the log
    fn fail_waiters_from(st: &mut RaftState, index: u64) {
        let dropped = st.waiters.split_off(&index);
        for (_, waiter) in dropped {
            let _ = waiter.tx.send(Err(Error::LeaderChanged));
        }
    }

    // === Ticker ===

    async fn run_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let tick = (self.config.heartbeat_interval() / 2).max(Duration::from_millis(5));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if self.is_shut_down() {
                break;
            }
            if let Err(e) = self.tick() {
                tracing::error!("Raft tick failed on node {}: {}", self.id, e);
            }
        }
        tracing::debug!("Raft ticker on node {} stopped", self.id);
    }

    fn tick(self: &Arc<Self>) -> Result<()> {
        let now = Instant::now();
        let voters = self.voters();
        let role = self.state().role;
        match role {
            RaftRole::Leader => {
                let heartbeat_due = {
                    let mut st = self.state();
                    if !self.leader_has_quorum(&st, &voters, now) {
                        tracing::warn!(
                            "Leader {} lost contact with a majority in term {}",
                            self.id,
                            st.hard.term
                        );
                        let term = st.hard.term;
                        self.become_follower(&mut st, term, None)?;
                        return Ok(());
                    }
                    if now >= st.next_heartbeat {
                        st.next_heartbeat = now + self.config.heartbeat_interval();
                        true
                    } else {
                        false
                    }
                };
                if heartbeat_due {
                    self.replicate_all(&voters);
                }
            }
            RaftRole::Follower | RaftRole::Candidate => {
                let due = self.state().election_deadline <= now;
                if due && voters.iter().any(|p| p.id == self.id) {
                    self.start_election(&voters)?;
                }
            }
        }
        Ok(())
    }

    fn leader_has_quorum(&self, st: &RaftState, voters: &[Peer], now: Instant) -> bool {
        if voters.is_empty() {
            return true;
        }
        let window = self.config.election_timeout() * 2;
        let reachable = voters
            .iter()
            .filter(|p| {
                p.id == self.id
                    || st
                        .last_ack
                        .get(&p.id)
                        .map(|at| now.duration_since(*at) < window)
                        // A voter added after election has not been contacted yet
                        .unwrap_or(true)
            })
            .count();
        reachable >= majority(voters.len())
    }

    // === Election ===

    fn start_election(self: &Arc<Self>, voters: &[Peer]) -> Result<()> {
        let request = {
            let mut st = self.state();
            st.role = RaftRole::Candidate;
            st.hard.term += 1;
            st.hard.voted_for = Some(self.id);
            st.leader_id = None;
            self.persist_hard_state(&st)?;
            self.reset_election_deadline(&mut st);
            st.votes.clear();
            st.votes.insert(self.id);
            tracing::info!("Node {} starting election for term {}", self.id, st.hard.term);

            if st.votes.len() >= majority(voters.len()) {
                self.become_leader(&mut st, voters)?;
                return Ok(());
            }
            VoteRequest {
                term: st.hard.term,
                candidate_id: self.id,
                last_log_index: st.log.last_index(),
                last_log_term: st.log.last_term(),
            }
        };

        for peer in voters.iter().filter(|p| p.id != self.id) {
            let node = self.clone();
            let peer = peer.clone();
            let request = request.clone();
            let voters = voters.to_vec();
            tokio::spawn(async move {
                let sent = tokio::time::timeout(
                    node.config.rpc_timeout(),
                    node.transport.request_vote(&peer, request.clone()),
                )
                .await;
                match sent {
                    Ok(Ok(response)) => {
                        if let Err(e) = node.handle_vote_response(&peer, &request, response, &voters) {
                            tracing::error!("Vote handling failed: {}", e);
                        }
                    }
                    Ok(Err(e)) => tracing::debug!("Vote request to {} failed: {}", peer.id, e),
                    Err(_) => tracing::debug!("Vote request to {} timed out", peer.id),
                }
            });
        }
        Ok(())
    }

    fn handle_vote_response(
        self: &Arc<Self>,
        peer: &Peer,
        request: &VoteRequest,
        response: VoteResponse,
        voters: &[Peer],
    ) -> Result<()> {
        let became_leader = {
            let mut st = self.state();
            if response.term > st.hard.term {
                self.become_follower(&mut st, response.term, None)?;
                return Ok(());
            }
            if st.role != RaftRole::Candidate || st.hard.term != request.term {
                return Ok(());
            }
            if !response.vote_granted {
                return Ok(());
            }
            st.votes.insert(peer.id);
            if st.votes.len() >= majority(voters.len()) {
                self.become_leader(&mut st, voters)?;
                true
            } else {
                false
            }
        };
        if became_leader {
            self.replicate_all(voters);
        }
        Ok(())
    }

    // === Replication (leader side) ===

    fn replicate_all(&self, voters: &[Peer]) {
        for peer in voters.iter().filter(|p| p.id != self.id) {
            self.spawn_replication(peer.clone());
        }
    }

    fn spawn_replication(&self, peer: Peer) {
        let Some(node) = self.this.upgrade() else {
            return;
        };
        {
            let mut st = self.state();
            if st.role != RaftRole::Leader || !st.in_flight.insert(peer.id) {
                return;
            }
        }
        tokio::spawn(async move {
            loop {
                match node.replicate_once(&peer).await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        tracing::debug!("Replication to {} failed: {}", peer.id, e);
                        break;
                    }
                }
            }
            node.state().in_flight.remove(&peer.id);
        });
    }

    /// Send one AppendEntries or InstallSnapshot. `Ok(true)` if more is pending.
    async fn replicate_once(&self, peer: &Peer) -> Result<bool> {
        if self.is_shut_down() {
            return Ok(false);
        }
        let outgoing = {
            let mut st = self.state();
            if st.role != RaftRole::Leader {
                return Ok(false);
            }
            let last = st.log.last_index();
            let next = st
                .next_index
                .get(&peer.id)
                .copied()
                .unwrap_or(last + 1)
                .clamp(1, last + 1);
            st.next_index.insert(peer.id, next);

            if next <= st.log.snapshot_index() {
                let snapshot = st
                    .snapshot
                    .clone()
                    .ok_or_else(|| Error::Raft("log compacted without a snapshot".into()))?;
                Outgoing::Snapshot(InstallSnapshotRequest {
                    term: st.hard.term,
                    leader_id: self.id,
                    last_included_index: snapshot.last_included_index,
                    last_included_term: snapshot.last_included_term,
                    data: snapshot.data,
                })
            } else {
                let prev_log_index = next - 1;
                let prev_log_term = st.log.term_at(prev_log_index).ok_or_else(|| {
                    Error::Raft(format!("missing term for index {}", prev_log_index))
                })?;
                Outgoing::Append(AppendRequest {
                    term: st.hard.term,
                    leader_id: self.id,
                    prev_log_index,
                    prev_log_term,
                    entries: st.log.entries_from(next, self.config.max_append_entries),
                    leader_commit: st.commit_index,
                })
            }
        };

        match outgoing {
            Outgoing::Append(request) => {
                let term = request.term;
                let response = tokio::time::timeout(
                    self.config.rpc_timeout(),
                    self.transport.append_entries(peer, request),
                )
                .await
                .map_err(|_| Error::Timeout(format!("append to {}", peer.id)))??;
                self.handle_append_response(peer, term, response)
            }
            Outgoing::Snapshot(request) => {
                let term = request.term;
                let index = request.last_included_index;
                tracing::info!("Sending snapshot at {} to node {}", index, peer.id);
                let response = tokio::time::timeout(
                    self.config.rpc_timeout() * 4,
                    self.transport.install_snapshot(peer, request),
                )
                .await
                .map_err(|_| Error::Timeout(format!("snapshot to {}", peer.id)))??;

                let mut st = self.state();
                if response.term > st.hard.term {
                    self.become_follower(&mut st, response.term, None)?;
                    return Ok(false);
                }
                if st.role != RaftRole::Leader || st.hard.term != term {
                    return Ok(false);
                }
                st.last_ack.insert(peer.id, Instant::now());
                let matched = st.match_index.entry(peer.id).or_insert(0);
                *matched = (*matched).max(index);
                st.next_index.insert(peer.id, index + 1);
                Ok(st.log.last_index() > index)
            }
        }
    }

    fn handle_append_response(
        &self,
        peer: &Peer,
        term: u64,
        response: AppendResponse,
    ) -> Result<bool> {
        let voters = self.voters();
        let mut st = self.state();
        if response.term > st.hard.term {
            self.become_follower(&mut st, response.term, None)?;
            return Ok(false);
        }
        if st.role != RaftRole::Leader || st.hard.term != term {
            return Ok(false);
        }
        st.last_ack.insert(peer.id, Instant::now());

        if response.success {
            let matched = st.match_index.entry(peer.id).or_insert(0);
            *matched = (*matched).max(response.match_index);
            let matched = *matched;
            st.next_index.insert(peer.id, matched + 1);
            self.advance_commit(&mut st, &voters);
            Ok(st.log.last_index() > matched)
        } else {
            let last = st.log.last_index();
            st.next_index
                .insert(peer.id, response.conflict_index.clamp(1, last + 1));
            Ok(true)
        }
    }

    // === RPC handlers (follower side) ===

    pub fn handle_request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        let mut st = self.state();
        if request.term < st.hard.term {
            return Ok(VoteResponse {
                term: st.hard.term,
                vote_granted: false,
            });
        }
        if request.term > st.hard.term {
            self.become_follower(&mut st, request.term, None)?;
        }

        let can_vote = st.hard.voted_for.is_none() || st.hard.voted_for == Some(request.candidate_id);
        let vote_granted =
            can_vote && st.log.is_up_to_date(request.last_log_index, request.last_log_term);
        if vote_granted {
            st.hard.voted_for = Some(request.candidate_id);
            self.persist_hard_state(&st)?;
            self.reset_election_deadline(&mut st);
            tracing::debug!(
                "Node {} votes for {} in term {}",
                self.id,
                request.candidate_id,
                request.term
            );
        }
        Ok(VoteResponse {
            term: st.hard.term,
            vote_granted,
        })
    }

    pub fn handle_append_entries(&self, request: AppendRequest) -> Result<AppendResponse> {
        let mut st = self.state();
        if request.term < st.hard.term {
            return Ok(AppendResponse {
                term: st.hard.term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }
        if request.term > st.hard.term || st.role != RaftRole::Follower {
            self.become_follower(&mut st, request.term, Some(request.leader_id))?;
        }
        if st.leader_id != Some(request.leader_id) {
            tracing::info!(
                "Node {} follows leader {} in term {}",
                self.id,
                request.leader_id,
                request.term
            );
        }
        st.leader_id = Some(request.leader_id);
        self.reset_election_deadline(&mut st);

        // Entries covered by our snapshot are committed and therefore match
        let snapshot_index = st.log.snapshot_index();
        let (prev_log_index, prev_log_term, entries) = if request.prev_log_index < snapshot_index {
            let entries: Vec<LogEntry> = request
                .entries
                .into_iter()
                .filter(|e| e.index > snapshot_index)
                .collect();
            (snapshot_index, st.log.snapshot_term(), entries)
        } else {
            (request.prev_log_index, request.prev_log_term, request.entries)
        };

        if prev_log_index > st.log.last_index() {
            return Ok(AppendResponse {
                term: st.hard.term,
                success: false,
                match_index: 0,
                conflict_index: st.log.last_index() + 1,
            });
        }
        if st.log.term_at(prev_log_index) != Some(prev_log_term) {
            let conflict_index = st
                .log
                .first_index_of_term(prev_log_index)
                .max(st.commit_index + 1);
            return Ok(AppendResponse {
                term: st.hard.term,
                success: false,
                match_index: 0,
                conflict_index,
            });
        }

        let match_index = entries.last().map(|e| e.index).unwrap_or(prev_log_index);
        let mut to_append = Vec::new();
        for entry in entries {
            if to_append.is_empty() {
                match st.log.term_at(entry.index) {
                    Some(term) if term == entry.term => continue,
                    Some(_) => {
                        tracing::info!(
                            "Node {} truncating conflicting log from {}",
                            self.id,
                            entry.index
                        );
                        self.storage.truncate_from(entry.index)?;
                        st.log.truncate_from(entry.index);
                        Self::fail_waiters_from(&mut st, entry.index);
                    }
                    None => {}
                }
            }
            to_append.push(entry);
        }
        if !to_append.is_empty() {
            self.storage.append(&to_append)?;
            for entry in to_append {
                st.log.append(entry);
            }
        }

        let new_commit = request.leader_commit.min(match_index);
        if new_commit > st.commit_index {
            st.commit_index = new_commit;
            self.apply_notify.notify_one();
        }

        Ok(AppendResponse {
            term: st.hard.term,
            success: true,
            match_index,
            conflict_index: 0,
        })
    }

    pub fn handle_install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut st = self.state();
        if request.term < st.hard.term {
            return Ok(InstallSnapshotResponse {
                term: st.hard.term,
            });
        }
        if request.term > st.hard.term || st.role != RaftRole::Follower {
            self.become_follower(&mut st, request.term, Some(request.leader_id))?;
        }
        st.leader_id = Some(request.leader_id);
        self.reset_election_deadline(&mut st);

        if request.last_included_index <= st.commit_index {
            return Ok(InstallSnapshotResponse {
                term: st.hard.term,
            });
        }

        tracing::info!(
            "Node {} installing snapshot at {} (term {})",
            self.id,
            request.last_included_index,
            request.last_included_term
        );
        let snapshot = Snapshot {
            last_included_index: request.last_included_index,
            last_included_term: request.last_included_term,
            data: request.data,
        };
        self.storage.install_snapshot(&snapshot)?;
        self.state_machine.restore(&snapshot.data)?;
        st.log
            .reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term);
        st.commit_index = snapshot.last_included_index;
        st.last_applied = snapshot.last_included_index;
        st.snapshot = Some(snapshot);
        Self::fail_waiters_from(&mut st, 0);

        Ok(InstallSnapshotResponse {
            term: st.hard.term,
        })
    }

    /// A proposal forwarded by a follower; never forwarded again
    pub async fn handle_propose(&self, request: ProposeRequest) -> Result<Proposed> {
        self.propose_local(request.kind, request.data).await
    }

    // === Proposals ===

    /// Replicate `data` and wait for it to be applied. Followers forward to
    /// the leader once.
    pub async fn propose(&self, kind: EntryKind, data: Vec<u8>) -> Result<Proposed> {
        match self.propose_local(kind, data.clone()).await {
            Err(Error::NotLeader(leader)) => {
                let peer = self.peer(leader).ok_or(Error::NoLeader)?;
                tracing::debug!("Forwarding proposal to leader {}", leader);
                let forwarded = tokio::time::timeout(
                    self.config.proposal_timeout() + self.config.rpc_timeout(),
                    self.transport
                        .forward_proposal(&peer, ProposeRequest { kind, data }),
                )
                .await
                .map_err(|_| Error::ConsensusTimeout)?;
                forwarded
            }
            other => other,
        }
    }

    /// Append on this node if it leads; fails with `NotLeader` otherwise
    pub async fn propose_local(&self, kind: EntryKind, data: Vec<u8>) -> Result<Proposed> {
        let voters = self.voters();
        let (index, rx) = {
            let mut st = self.state();
            if st.role != RaftRole::Leader {
                return Err(match st.leader_id {
                    Some(leader) if leader != self.id => Error::NotLeader(leader),
                    _ => Error::NoLeader,
                });
            }
            if kind == EntryKind::Membership {
                let pending = (st.commit_index + 1..=st.log.last_index()).any(|i| {
                    st.log
                        .entry(i)
                        .map(|e| e.kind == EntryKind::Membership)
                        .unwrap_or(false)
                });
                if pending {
                    return Err(Error::MembershipChangeInProgress);
                }
            }

            let index = st.log.last_index() + 1;
            let entry = LogEntry {
                term: st.hard.term,
                index,
                kind,
                data,
            };
            self.storage.append(std::slice::from_ref(&entry))?;
            st.log.append(entry);
            let (tx, rx) = oneshot::channel();
            let term = st.hard.term;
            st.waiters.insert(index, Waiter { term, tx });
            self.advance_commit(&mut st, &voters);
            (index, rx)
        };

        self.replicate_all(&voters);

        match tokio::time::timeout(self.config.proposal_timeout(), rx).await {
            Ok(Ok(Ok(response))) => Ok(Proposed { index, response }),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::LeaderChanged),
            Err(_) => {
                self.state().waiters.remove(&index);
                tracing::warn!("Proposal at index {} timed out", index);
                Err(Error::ConsensusTimeout)
            }
        }
    }

    // === Applier ===

    async fn run_applier(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.apply_notify.notified() => {}
                _ = shutdown.changed() => break,
            }
            if self.is_shut_down() {
                break;
            }
            if let Err(e) = self.apply_committed() {
                tracing::error!("Applying committed entries failed on node {}: {}", self.id, e);
            }
        }
        tracing::debug!("Raft applier on node {} stopped", self.id);
    }

    fn apply_committed(&self) -> Result<()> {
        loop {
            let batch = {
                let mut st = self.state();
                if st.last_applied >= st.commit_index {
                    break;
                }
                if st.last_applied < st.log.snapshot_index() {
                    st.last_applied = st.log.snapshot_index();
                    continue;
                }
                let pending = (st.commit_index - st.last_applied) as usize;
                st.log.entries_from(st.last_applied + 1, pending.min(1024))
            };
            if batch.is_empty() {
                break;
            }

            for entry in batch {
                let result = self.state_machine.apply(&entry);
                if let Err(e) = &result {
                    tracing::error!("State machine failed on entry {}: {}", entry.index, e);
                }
                let mut st = self.state();
                st.last_applied = st.last_applied.max(entry.index);
                if let Some(waiter) = st.waiters.remove(&entry.index) {
                    let reply = if waiter.term == entry.term {
                        result
                    } else {
                        Err(Error::LeaderChanged)
                    };
                    let _ = waiter.tx.send(reply);
                }
            }
            self.maybe_snapshot()?;
        }
        Ok(())
    }

    fn maybe_snapshot(&self) -> Result<()> {
        {
            let st = self.state();
            if st.last_applied < st.log.snapshot_index() + self.config.snapshot_threshold {
                return Ok(());
            }
        }
        let (index, data) = self.state_machine.snapshot()?;
        let mut st = self.state();
        if index <= st.log.snapshot_index() {
            return Ok(());
        }
        let Some(term) = st.log.term_at(index) else {
            return Ok(());
        };
        let snapshot = Snapshot {
            last_included_index: index,
            last_included_term: term,
            data,
        };
        self.storage.save_snapshot(&snapshot)?;
        st.log.compact_to(index, term);
        st.snapshot = Some(snapshot);
        tracing::info!("Node {} compacted log through {}", self.id, index);
        Ok(())
    }
}
