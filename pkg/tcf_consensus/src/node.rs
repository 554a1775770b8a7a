use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::ConsensusError;
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RequestVoteRequest, RequestVoteResponse, Transport,
};
use crate::state_machine::StateMachine;
use crate::types::{LogEntry, LogIndex, NodeId, Role, Term};

/// At some random point in this window a follower that hasn't heard from a
/// leader becomes a candidate. Grounded on
/// `examples/dennisss-repo/pkg/raft/src/consensus.rs`'s `ELECTION_TIMEOUT`.
const ELECTION_TIMEOUT: (u64, u64) = (400, 800);

/// How often a leader sends (possibly empty) `AppendEntries` to followers.
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(150);

/// Granularity of the background driver loop's wakeups.
const TICK_INTERVAL: Duration = Duration::from_millis(25);

struct Inner {
    role: Role,
    current_term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    peers: Vec<NodeId>,
    leader_id: Option<NodeId>,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    election_deadline: Instant,
    last_heartbeat_sent: Instant,
    pending: HashMap<LogIndex, oneshot::Sender<Result<(), ConsensusError>>>,
}

impl Inner {
    fn last_log_index(&self) -> LogIndex {
        self.log.last().map(|e| e.index).unwrap_or(LogIndex::ZERO)
    }

    fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or_default()
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index.0 == 0 {
            return Some(Term(0));
        }
        self.log.get((index.0 - 1) as usize).map(|e| e.term)
    }

    fn reset_election_deadline(&mut self) {
        let millis = rand::thread_rng().gen_range(ELECTION_TIMEOUT.0..=ELECTION_TIMEOUT.1);
        self.election_deadline = Instant::now() + Duration::from_millis(millis);
    }

    fn step_down(&mut self, term: Term) {
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower;
        self.leader_id = None;
        self.reset_election_deadline();
        self.abort_pending(ConsensusError::NotLeader { leader_hint: None });
    }

    fn abort_pending(&mut self, err_factory: ConsensusError) {
        for (_, sender) in self.pending.drain() {
            let _ = sender.send(Err(clone_err(&err_factory)));
        }
    }
}

fn clone_err(err: &ConsensusError) -> ConsensusError {
    match err {
        ConsensusError::NotLeader { leader_hint } => ConsensusError::NotLeader {
            leader_hint: leader_hint.clone(),
        },
        other => ConsensusError::Apply(other.to_string()),
    }
}

/// A replicated command log and the driver that keeps it in sync with
/// peers: leader election on a randomized timeout, log replication over an
/// abstract [`Transport`], and ordered application of committed entries to
/// an [`StateMachine`]. Structurally grounded on
/// `examples/dennisss-repo/pkg/raft/src/consensus.rs`'s `ConsensusModule`.
pub struct ConsensusNode<T: Transport, M: StateMachine> {
    id: NodeId,
    transport: Arc<T>,
    state_machine: Arc<M>,
    inner: Mutex<Inner>,
    role_tx: watch::Sender<Role>,
}

impl<T: Transport, M: StateMachine> ConsensusNode<T, M> {
    pub fn new(id: NodeId, peers: Vec<NodeId>, transport: Arc<T>, state_machine: Arc<M>) -> Arc<Self> {
        let (role_tx, _) = watch::channel(Role::Follower);
        let mut inner = Inner {
            role: Role::Follower,
            current_term: Term(0),
            voted_for: None,
            log: Vec::new(),
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            peers,
            leader_id: None,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            election_deadline: Instant::now(),
            last_heartbeat_sent: Instant::now(),
            pending: HashMap::new(),
        };
        inner.reset_election_deadline();

        Arc::new(Self {
            id,
            transport,
            state_machine,
            inner: Mutex::new(inner),
            role_tx,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Observes role transitions (`Follower`/`Candidate`/`Leader`), used by
    /// `tcf_kv`'s TTL loop and `tcf_discovery`'s broadcaster to start/stop
    /// themselves.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.lock().await.role == Role::Leader
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.inner.lock().await.leader_id.clone()
    }

    pub async fn peers(&self) -> Vec<NodeId> {
        self.inner.lock().await.peers.clone()
    }

    pub async fn add_peer(&self, peer: NodeId) {
        let mut inner = self.inner.lock().await;
        if peer != self.id && !inner.peers.contains(&peer) {
            inner.peers.push(peer.clone());
            inner.next_index.insert(peer.clone(), inner.last_log_index().next());
            inner.match_index.insert(peer, LogIndex::ZERO);
        }
    }

    pub async fn remove_peer(&self, peer: &NodeId) {
        let mut inner = self.inner.lock().await;
        inner.peers.retain(|p| p != peer);
        inner.next_index.remove(peer);
        inner.match_index.remove(peer);
    }

    pub async fn set_peers(&self, peers: Vec<NodeId>) {
        let mut inner = self.inner.lock().await;
        inner.peers = peers.into_iter().filter(|p| p != &self.id).collect();
        inner.next_index.clear();
        inner.match_index.clear();
    }

    /// Lets a node elect itself immediately when it is (at most) the only
    /// known member ("single-server mode"). Used only to bootstrap the
    /// very first node of a cluster.
    pub async fn become_single_server_leader(&self) {
        let mut inner = self.inner.lock().await;
        if inner.peers.is_empty() {
            inner.current_term.0 += 1;
            inner.role = Role::Leader;
            inner.leader_id = Some(self.id.clone());
            drop(inner);
            let _ = self.role_tx.send(Role::Leader);
        }
    }

    /// Proposes `command` for replication. Resolves once the entry commits
    /// and has been applied locally, or with `NotLeader`/`Timeout`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex, ConsensusError> {
        let (tx, rx) = oneshot::channel();
        let index = {
            let mut inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                return Err(ConsensusError::NotLeader {
                    leader_hint: inner.leader_id.clone(),
                });
            }
            let index = inner.last_log_index().next();
            inner.log.push(LogEntry {
                index,
                term: inner.current_term,
                command,
            });
            inner.pending.insert(index, tx);
            if inner.peers.is_empty() {
                // Single-node cluster: the entry is trivially a majority.
                inner.commit_index = index;
            }
            index
        };

        self.replicate_to_peers().await;
        self.advance_commit_and_apply().await;

        match tokio::time::timeout(Duration::from_secs(10), rx).await {
            Ok(Ok(result)) => result.map(|_| index),
            Ok(Err(_)) => Err(ConsensusError::Timeout(Duration::from_secs(10))),
            Err(_) => Err(ConsensusError::Timeout(Duration::from_secs(10))),
        }
    }

    /// Spawns the background election/heartbeat driver. Returns when
    /// `cancel` is triggered.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(node = %self.id, "consensus driver shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.on_tick().await;
                }
            }
        }
    }

    async fn on_tick(&self) {
        let (role, election_due, heartbeat_due) = {
            let inner = self.inner.lock().await;
            (
                inner.role,
                Instant::now() >= inner.election_deadline,
                Instant::now() >= inner.last_heartbeat_sent + HEARTBEAT_INTERVAL,
            )
        };

        match role {
            Role::Leader => {
                if heartbeat_due {
                    self.replicate_to_peers().await;
                    self.inner.lock().await.last_heartbeat_sent = Instant::now();
                }
            }
            Role::Follower | Role::Candidate => {
                if election_due {
                    self.start_election().await;
                }
            }
        }
        self.advance_commit_and_apply().await;
    }

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, peers) = {
            let mut inner = self.inner.lock().await;
            inner.current_term.0 += 1;
            inner.role = Role::Candidate;
            inner.voted_for = Some(self.id.clone());
            inner.leader_id = None;
            inner.reset_election_deadline();
            (
                inner.current_term,
                inner.last_log_index(),
                inner.last_log_term(),
                inner.peers.clone(),
            )
        };

        tracing::info!(node = %self.id, term = term.0, "starting election");

        if peers.is_empty() {
            self.become_leader_for(term).await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        let mut votes = 1usize; // vote for self
        let needed = (peers.len() + 1) / 2 + 1;

        let mut futures = Vec::new();
        for peer in &peers {
            let transport = self.transport.clone();
            let peer = peer.clone();
            let request = request.clone();
            futures.push(async move { (peer.clone(), transport.request_vote(&peer, request).await) });
        }
        let results = futures::future::join_all(futures).await;

        for (peer, result) in results {
            match result {
                Ok(RequestVoteResponse { term: reply_term, vote_granted }) => {
                    let mut inner = self.inner.lock().await;
                    if reply_term > inner.current_term {
                        inner.step_down(reply_term);
                        return;
                    }
                    if vote_granted && reply_term == term {
                        votes += 1;
                    }
                }
                Err(err) => {
                    tracing::debug!(node = %self.id, %peer, ?err, "request_vote failed");
                }
            }
        }

        let still_candidate = {
            let inner = self.inner.lock().await;
            inner.role == Role::Candidate && inner.current_term == term
        };
        if still_candidate && votes >= needed {
            self.become_leader_for(term).await;
        }
    }

    async fn become_leader_for(&self, term: Term) {
        let mut inner = self.inner.lock().await;
        if inner.current_term != term || inner.role == Role::Leader {
            return;
        }
        inner.role = Role::Leader;
        inner.leader_id = Some(self.id.clone());
        let next = inner.last_log_index().next();
        for peer in inner.peers.clone() {
            inner.next_index.insert(peer.clone(), next);
            inner.match_index.insert(peer, LogIndex::ZERO);
        }
        inner.last_heartbeat_sent = Instant::now() - HEARTBEAT_INTERVAL;
        tracing::info!(node = %self.id, term = term.0, "became leader");
        drop(inner);
        let _ = self.role_tx.send(Role::Leader);
    }

    async fn replicate_to_peers(&self) {
        let (term, leader_id, leader_commit, peers, requests) = {
            let inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                return;
            }
            let mut requests = Vec::new();
            for peer in &inner.peers {
                let next = *inner.next_index.get(peer).unwrap_or(&LogIndex(1));
                let prev_index = LogIndex(next.0.saturating_sub(1));
                let prev_term = inner.term_at(prev_index).unwrap_or_default();
                let entries = inner
                    .log
                    .iter()
                    .filter(|e| e.index >= next)
                    .cloned()
                    .collect::<Vec<_>>();
                requests.push((
                    peer.clone(),
                    AppendEntriesRequest {
                        term: inner.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index: prev_index,
                        prev_log_term: prev_term,
                        entries,
                        leader_commit: inner.commit_index,
                    },
                ));
            }
            (
                inner.current_term,
                self.id.clone(),
                inner.commit_index,
                inner.peers.clone(),
                requests,
            )
        };
        let _ = (term, leader_id, leader_commit, peers);

        let mut futures = Vec::new();
        for (peer, request) in requests {
            let transport = self.transport.clone();
            let sent_up_to = request
                .entries
                .last()
                .map(|e| e.index)
                .unwrap_or(request.prev_log_index);
            futures.push(async move {
                (peer.clone(), sent_up_to, transport.append_entries(&peer, request).await)
            });
        }
        let results = futures::future::join_all(futures).await;

        let mut inner = self.inner.lock().await;
        for (peer, sent_up_to, result) in results {
            match result {
                Ok(response) => {
                    if response.term > inner.current_term {
                        inner.step_down(response.term);
                        return;
                    }
                    if response.success {
                        inner.match_index.insert(peer.clone(), sent_up_to);
                        inner.next_index.insert(peer.clone(), sent_up_to.next());
                    } else if let Some(next) = inner.next_index.get_mut(&peer) {
                        *next = response
                            .conflict_index
                            .unwrap_or(LogIndex(next.0.saturating_sub(1).max(1)));
                    }
                }
                Err(err) => {
                    tracing::debug!(node = %self.id, %peer, ?err, "append_entries failed");
                }
            }
        }
    }

    async fn advance_commit_and_apply(&self) {
        let (to_commit, term, match_index) = {
            let inner = self.inner.lock().await;
            (inner.commit_index, inner.current_term, inner.match_index.clone())
        };

        // Leader-only: an entry is committed once replicated on a majority
        // and it was proposed in the leader's current term.
        let new_commit = {
            let inner = self.inner.lock().await;
            if inner.role != Role::Leader {
                to_commit
            } else {
                let mut candidate = to_commit;
                for index in (to_commit.0 + 1)..=inner.last_log_index().0 {
                    let index = LogIndex(index);
                    let replicated = 1 + match_index.values().filter(|m| **m >= index).count();
                    let majority = (inner.peers.len() + 1) / 2 + 1;
                    if replicated >= majority && inner.term_at(index) == Some(term) {
                        candidate = index;
                    }
                }
                candidate
            }
        };

        if new_commit > to_commit {
            self.inner.lock().await.commit_index = new_commit;
        }

        self.apply_committed().await;
    }

    async fn apply_committed(&self) {
        loop {
            let (next_index, entry) = {
                let inner = self.inner.lock().await;
                if inner.last_applied >= inner.commit_index {
                    return;
                }
                let next_index = inner.last_applied.next();
                let entry = inner.log.get((next_index.0 - 1) as usize).cloned();
                (next_index, entry)
            };
            let Some(entry) = entry else { return };

            let result = self.state_machine.apply(entry.index, &entry.command).await;

            let mut inner = self.inner.lock().await;
            inner.last_applied = next_index;
            if let Some(sender) = inner.pending.remove(&next_index) {
                let _ = sender.send(result.map_err(ConsensusError::Apply));
            }
        }
    }

    /// Inbound `RequestVote` handler; a concrete `Transport` implementation
    /// wires its RPC server to call this.
    pub async fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut inner = self.inner.lock().await;
        if request.term > inner.current_term {
            inner.step_down(request.term);
        }
        if request.term < inner.current_term {
            return RequestVoteResponse {
                term: inner.current_term,
                vote_granted: false,
            };
        }

        let log_ok = request.last_log_term > inner.last_log_term()
            || (request.last_log_term == inner.last_log_term()
                && request.last_log_index >= inner.last_log_index());

        let can_vote = match &inner.voted_for {
            None => true,
            Some(candidate) => candidate == &request.candidate_id,
        };

        let grant = log_ok && can_vote;
        if grant {
            inner.voted_for = Some(request.candidate_id.clone());
            inner.reset_election_deadline();
        }

        RequestVoteResponse {
            term: inner.current_term,
            vote_granted: grant,
        }
    }

    /// Inbound `AppendEntries` handler.
    pub async fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut inner = self.inner.lock().await;
        if request.term < inner.current_term {
            return AppendEntriesResponse {
                term: inner.current_term,
                success: false,
                conflict_index: None,
            };
        }

        if request.term > inner.current_term || inner.role != Role::Follower {
            inner.step_down(request.term);
        }
        inner.leader_id = Some(request.leader_id.clone());
        inner.reset_election_deadline();

        if request.prev_log_index.0 > 0 {
            match inner.term_at(request.prev_log_index) {
                Some(term) if term == request.prev_log_term => {}
                _ => {
                    let conflict = LogIndex(request.prev_log_index.0.saturating_sub(1).max(1));
                    return AppendEntriesResponse {
                        term: inner.current_term,
                        success: false,
                        conflict_index: Some(conflict),
                    };
                }
            }
        }

        for entry in request.entries {
            let position = (entry.index.0 - 1) as usize;
            if position < inner.log.len() {
                if inner.log[position].term != entry.term {
                    inner.log.truncate(position);
                    inner.log.push(entry);
                }
            } else {
                inner.log.push(entry);
            }
        }

        if request.leader_commit > inner.commit_index {
            let last = inner.last_log_index();
            inner.commit_index = request.leader_commit.min(last);
        }

        let current_term = inner.current_term;
        drop(inner);
        self.apply_committed().await;

        AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_index: None,
        }
    }
}
