//! Replication group actor
//!
//! A [`ReplicationGroup`] is a cheap handle to a task that owns one group's
//! Raft state. Client calls and peer RPCs become [`Command`]s on the task's
//! channel; outbound RPCs run on spawned tasks and report back through the
//! same channel.

use super::log::{is_caught_up, majority, quorum_commit_index, RaftLog};
use super::snapshot::SnapshotScheduler;
use super::{
    AppendRequest, AppendResponse, GroupId, GroupStatus, LogIndex, RaftConfig, Role,
    SnapshotRequest, SnapshotResponse, StateMachine, Term, Transport, VoteRequest, VoteResponse,
};
use crate::cluster::NodeId;
use crate::config::ConsistencyLevel;
use crate::{Error, Result};

use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 1024;

/// Replication progress of one member, as seen by the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaState {
    pub node: NodeId,
    pub match_index: LogIndex,
    pub lag: u64,
    pub caught_up: bool,
}

enum Command {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    ReadIndex {
        level: ConsistencyLevel,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Progress {
        reply: oneshot::Sender<Result<Vec<ReplicaState>>>,
    },
    Vote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    Append {
        request: AppendRequest,
        reply: oneshot::Sender<AppendResponse>,
    },
    InstallSnapshot {
        request: SnapshotRequest,
        reply: oneshot::Sender<SnapshotResponse>,
    },
    VoteResult {
        term: Term,
        from: NodeId,
        response: Result<VoteResponse>,
    },
    AppendResult {
        from: NodeId,
        response: Result<AppendResponse>,
    },
    SnapshotResult {
        term: Term,
        from: NodeId,
        last_included: LogIndex,
        response: Result<SnapshotResponse>,
    },
    Shutdown,
}

/// Handle to a running replication group
#[derive(Clone)]
pub struct ReplicationGroup {
    id: GroupId,
    node: NodeId,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<GroupStatus>,
}

impl std::fmt::Debug for ReplicationGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationGroup")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}

impl ReplicationGroup {
    /// Start the group's consensus task on the current runtime
    ///
    /// `members` is the full replica set including `node`.
    pub fn spawn(
        id: GroupId,
        node: NodeId,
        members: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (core, status_rx) = GroupCore::new(
            id.clone(),
            node.clone(),
            members,
            config,
            transport,
            state_machine,
            tx.downgrade(),
        );
        tokio::spawn(core.run(rx));

        Self {
            id,
            node,
            tx,
            status: status_rx,
        }
    }

    pub fn id(&self) -> &GroupId {
        &self.id
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn status(&self) -> GroupStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GroupStatus> {
        self.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().role == Role::Leader
    }

    /// Leader hint from the last published status
    pub fn leader(&self) -> Option<NodeId> {
        self.status.borrow().leader.clone()
    }

    /// Wait until this replica knows a leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                if let Some(leader) = status.borrow_and_update().leader.clone() {
                    return Ok::<_, Error>(leader);
                }
                if status.changed().await.is_err() {
                    return Err(self.closed());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout {
                after_ms: timeout.as_millis() as u64,
            })?
    }

    /// Replicate `command`; resolves once it is committed and applied here
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex> {
        self.request(|reply| Command::Propose { command, reply })
            .await?
    }

    /// Index a read at `level` must observe before serving local state
    pub async fn read_index(&self, level: ConsistencyLevel) -> Result<LogIndex> {
        self.request(|reply| Command::ReadIndex { level, reply })
            .await?
    }

    /// Per-member match index and lag; only the leader can answer
    pub async fn replica_progress(&self) -> Result<Vec<ReplicaState>> {
        self.request(|reply| Command::Progress { reply }).await?
    }

    pub async fn handle_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.request(|reply| Command::Vote { request, reply }).await
    }

    pub async fn handle_append(&self, request: AppendRequest) -> Result<AppendResponse> {
        self.request(|reply| Command::Append { request, reply })
            .await
    }

    pub async fn handle_install_snapshot(
        &self,
        request: SnapshotRequest,
    ) -> Result<SnapshotResponse> {
        self.request(|reply| Command::InstallSnapshot { request, reply })
            .await
    }

    /// Stop the consensus task; pending proposals fail
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::Rpc(format!("group {} on {} is shut down", self.id, self.node))
    }
}

#[derive(Debug, Clone)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    last_ack: Option<Instant>,
    in_flight: bool,
}

struct GroupCore {
    id: GroupId,
    node: NodeId,
    member_count: usize,
    peers: Vec<NodeId>,
    config: RaftConfig,
    transport: Arc<dyn Transport>,
    state_machine: Arc<dyn StateMachine>,
    self_tx: mpsc::WeakSender<Command>,
    status_tx: watch::Sender<GroupStatus>,

    term: Term,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,
    log: RaftLog,
    commit_index: LogIndex,
    last_applied: LogIndex,
    election_deadline: Instant,
    votes: HashSet<NodeId>,
    progress: HashMap<NodeId, Progress>,
    /// Proposal waiters keyed by index, with the term they were appended in
    pending: BTreeMap<LogIndex, (Term, oneshot::Sender<Result<LogIndex>>)>,
    snapshots: SnapshotScheduler,
    snapshot_data: Vec<u8>,
    last_broadcast: Instant,
}

impl GroupCore {
    fn new(
        id: GroupId,
        node: NodeId,
        mut members: Vec<NodeId>,
        config: RaftConfig,
        transport: Arc<dyn Transport>,
        state_machine: Arc<dyn StateMachine>,
        self_tx: mpsc::WeakSender<Command>,
    ) -> (Self, watch::Receiver<GroupStatus>) {
        let initial = GroupStatus {
            term: 0,
            role: Role::Follower,
            leader: None,
            commit_index: 0,
            last_log_index: 0,
            snapshot_index: 0,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        if !members.contains(&node) {
            members.push(node.clone());
        }
        let peers = members.iter().filter(|m| **m != node).cloned().collect();

        let core = GroupCore {
            id,
            node,
            member_count: members.len(),
            peers,
            snapshots: SnapshotScheduler::new(config.snapshot.clone()),
            config,
            transport,
            state_machine,
            self_tx,
            status_tx,
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            election_deadline: Instant::now(),
            votes: HashSet::new(),
            progress: HashMap::new(),
            pending: BTreeMap::new(),
            snapshot_data: Vec::new(),
            last_broadcast: Instant::now(),
        };
        (core, status_rx)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let tick = (self.config.heartbeat_interval / 2).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.reset_election_deadline();

        debug!(
            group = %self.id,
            node = %self.node,
            members = self.member_count,
            "Replication group started"
        );

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },
                _ = ticker.tick() => self.tick(),
            }
            self.publish();
        }

        self.fail_pending();
        debug!(group = %self.id, node = %self.node, "Replication group stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Propose { command, reply } => self.propose(command, reply),
            Command::ReadIndex { level, reply } => {
                let _ = reply.send(self.read_index(level));
            }
            Command::Progress { reply } => {
                let _ = reply.send(self.replica_progress());
            }
            Command::Vote { request, reply } => {
                let _ = reply.send(self.on_vote_request(request));
            }
            Command::Append { request, reply } => {
                let _ = reply.send(self.on_append_request(request));
            }
            Command::InstallSnapshot { request, reply } => {
                let _ = reply.send(self.on_snapshot_request(request));
            }
            Command::VoteResult {
                term,
                from,
                response,
            } => self.on_vote_result(term, from, response),
            Command::AppendResult { from, response } => self.on_append_result(from, response),
            Command::SnapshotResult {
                term,
                from,
                last_included,
                response,
            } => self.on_snapshot_result(term, from, last_included, response),
            Command::Shutdown => {}
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        match self.role {
            Role::Leader => {
                if now.duration_since(self.last_broadcast) >= self.config.heartbeat_interval {
                    self.broadcast_append();
                }
                self.maybe_snapshot();
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.start_election();
                }
            }
        }
    }

    fn publish(&self) {
        let status = GroupStatus {
            term: self.term,
            role: self.role,
            leader: self.leader.clone(),
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn reset_election_deadline(&mut self) {
        let base = self.config.election_timeout;
        let jitter_ms = rand::rng().random_range(0..(base.as_millis() as u64).max(1));
        self.election_deadline = Instant::now() + base + Duration::from_millis(jitter_ms);
    }

    fn not_leader_error(&self) -> Error {
        match &self.leader {
            Some(leader) => Error::NotLeader {
                group: self.id.to_string(),
                leader: Some(leader.clone()),
            },
            None => Error::NoLeader {
                group: self.id.to_string(),
            },
        }
    }

    // ---- election ----

    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.node.clone());
        self.leader = None;
        self.votes = HashSet::from([self.node.clone()]);
        self.reset_election_deadline();

        debug!(group = %self.id, node = %self.node, term = self.term, "Starting election");

        if self.votes.len() >= majority(self.member_count) {
            self.become_leader();
            return;
        }

        let request = VoteRequest {
            term: self.term,
            candidate: self.node.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.peers.clone() {
            let transport = self.transport.clone();
            let group = self.id.clone();
            let request = request.clone();
            let term = self.term;
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                let response = transport.request_vote(&group, &peer, request).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx
                        .send(Command::VoteResult {
                            term,
                            from: peer,
                            response,
                        })
                        .await;
                }
            });
        }
    }

    fn on_vote_result(&mut self, term: Term, from: NodeId, response: Result<VoteResponse>) {
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(group = %self.id, peer = %from, error = %e, "Vote request failed");
                return;
            }
        };
        if response.term > self.term {
            self.step_down(response.term, None);
            return;
        }
        if self.role != Role::Candidate || term != self.term || !response.granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= majority(self.member_count) {
            self.become_leader();
        }
    }

    fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.leader = Some(self.node.clone());
        let next_index = self.log.last_index() + 1;
        self.progress = self
            .peers
            .iter()
            .map(|peer| {
                (
                    peer.clone(),
                    Progress {
                        next_index,
                        match_index: 0,
                        last_ack: None,
                        in_flight: false,
                    },
                )
            })
            .collect();

        info!(group = %self.id, node = %self.node, term = self.term, "Elected leader");

        // Commits entries from earlier terms once this no-op is replicated
        self.log.append(self.term, Vec::new());
        self.advance_commit();
        self.broadcast_append();
    }

    fn step_down(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        let was_leader = self.role == Role::Leader;
        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        if was_leader {
            info!(group = %self.id, node = %self.node, term = self.term, "Stepping down");
            self.progress.clear();
            self.fail_pending();
        }
        self.reset_election_deadline();
    }

    fn on_vote_request(&mut self, request: VoteRequest) -> VoteResponse {
        if request.term > self.term {
            self.step_down(request.term, None);
        }
        let up_to_date = (request.last_log_term, request.last_log_index)
            >= (self.log.last_term(), self.log.last_index());
        let free = self
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == request.candidate);
        let granted = request.term == self.term && up_to_date && free;
        if granted {
            self.voted_for = Some(request.candidate);
            self.reset_election_deadline();
        }
        VoteResponse {
            term: self.term,
            granted,
        }
    }

    // ---- replication ----

    fn propose(&mut self, command: Vec<u8>, reply: oneshot::Sender<Result<LogIndex>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader_error()));
            return;
        }
        let index = self.log.append(self.term, command);
        self.pending.insert(index, (self.term, reply));
        self.advance_commit();
        self.broadcast_append();
    }

    fn broadcast_append(&mut self) {
        self.last_broadcast = Instant::now();
        for peer in self.peers.clone() {
            self.send_append(&peer);
        }
    }

    fn send_append(&mut self, peer: &NodeId) {
        let Some(progress) = self.progress.get_mut(peer) else {
            return;
        };
        if progress.in_flight {
            return;
        }
        progress.in_flight = true;
        let next_index = progress.next_index;

        let transport = self.transport.clone();
        let group = self.id.clone();
        let tx = self.self_tx.clone();
        let peer = peer.clone();

        if next_index <= self.log.snapshot_index() {
            let request = SnapshotRequest {
                term: self.term,
                leader: self.node.clone(),
                last_included_index: self.log.snapshot_index(),
                last_included_term: self.log.snapshot_term(),
                data: self.snapshot_data.clone(),
            };
            let last_included = request.last_included_index;
            let term = self.term;
            debug!(group = %self.id, peer = %peer, last_included, "Sending snapshot");
            tokio::spawn(async move {
                let response = transport.install_snapshot(&group, &peer, request).await;
                if let Some(tx) = tx.upgrade() {
                    let _ = tx
                        .send(Command::SnapshotResult {
                            term,
                            from: peer,
                            last_included,
                            response,
                        })
                        .await;
                }
            });
            return;
        }

        let prev_log_index = next_index - 1;
        let request = AppendRequest {
            term: self.term,
            leader: self.node.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or_default(),
            entries: self
                .log
                .entries_from(next_index, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        };
        tokio::spawn(async move {
            let response = transport.append_entries(&group, &peer, request).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(Command::AppendResult {
                        from: peer,
                        response,
                    })
                    .await;
            }
        });
    }

    fn on_append_request(&mut self, request: AppendRequest) -> AppendResponse {
        if request.term < self.term {
            return AppendResponse {
                term: self.term,
                success: false,
                match_index: 0,
                last_log_index: self.log.last_index(),
            };
        }
        if request.term > self.term || self.role != Role::Follower {
            self.step_down(request.term, Some(request.leader.clone()));
        }
        self.leader = Some(request.leader);
        self.reset_election_deadline();

        if !self
            .log
            .matches(request.prev_log_index, request.prev_log_term)
        {
            return AppendResponse {
                term: self.term,
                success: false,
                match_index: 0,
                last_log_index: self.log.last_index(),
            };
        }

        let match_index = request.prev_log_index + request.entries.len() as u64;
        self.log.merge(request.entries);

        if request.leader_commit > self.commit_index {
            self.commit_index = request.leader_commit.min(match_index);
            self.apply_committed();
        }

        AppendResponse {
            term: self.term,
            success: true,
            match_index,
            last_log_index: self.log.last_index(),
        }
    }

    fn on_append_result(&mut self, from: NodeId, response: Result<AppendResponse>) {
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(group = %self.id, peer = %from, error = %e, "Append request failed");
                if let Some(progress) = self.progress.get_mut(&from) {
                    progress.in_flight = false;
                }
                return;
            }
        };
        if response.term > self.term {
            self.step_down(response.term, None);
            return;
        }
        if self.role != Role::Leader || response.term != self.term {
            return;
        }
        let last_index = self.log.last_index();
        let Some(progress) = self.progress.get_mut(&from) else {
            return;
        };
        progress.in_flight = false;
        progress.last_ack = Some(Instant::now());

        if response.success {
            progress.match_index = progress.match_index.max(response.match_index);
            progress.next_index = progress.match_index + 1;
            let behind = progress.match_index < last_index;
            self.advance_commit();
            if behind {
                self.send_append(&from);
            }
        } else {
            progress.next_index = progress
                .next_index
                .saturating_sub(1)
                .min(response.last_log_index + 1)
                .max(1);
            self.send_append(&from);
        }
    }

    fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let candidate = quorum_commit_index(
            self.log.last_index(),
            self.progress.values().map(|p| p.match_index),
            self.member_count,
        );
        // Only entries from the current term commit by counting replicas
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.term) {
            self.commit_index = candidate;
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.get(index).cloned();
            let mut applied = Ok(index);
            if let Some(entry) = entry.as_ref().filter(|e| !e.command.is_empty()) {
                // Every replica rejects the same entry, so the position is
                // consumed without a state change
                if let Err(e) = self.state_machine.apply(&self.id, entry) {
                    error!(group = %self.id, index, error = %e, "State machine rejected entry");
                    applied = Err(Error::StorageEngine(format!(
                        "entry {} rejected by the state machine: {}",
                        index, e
                    )));
                }
            }
            self.last_applied = index;

            if let Some((term, reply)) = self.pending.remove(&index) {
                let result = match &entry {
                    Some(entry) if entry.term == term => applied,
                    _ => Err(self.not_leader_error()),
                };
                let _ = reply.send(result);
            }
        }
        self.maybe_snapshot();
    }

    fn fail_pending(&mut self) {
        for (_, (_, reply)) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(self.not_leader_error()));
        }
    }

    // ---- snapshots ----

    fn maybe_snapshot(&mut self) {
        let applied_uncompacted = self.last_applied.saturating_sub(self.log.snapshot_index());
        if !self
            .snapshots
            .should_snapshot(applied_uncompacted, Instant::now())
        {
            return;
        }
        let index = self.last_applied;
        match self.state_machine.snapshot(&self.id, index) {
            Ok(data) => {
                self.snapshot_data = data;
                self.log.compact(index);
                self.snapshots.snapshot_taken();
                info!(group = %self.id, node = %self.node, index, "Snapshot taken, log compacted");
            }
            Err(e) => {
                warn!(group = %self.id, index, error = %e, "Snapshot failed");
            }
        }
    }

    fn on_snapshot_request(&mut self, request: SnapshotRequest) -> SnapshotResponse {
        if request.term < self.term {
            return SnapshotResponse { term: self.term };
        }
        if request.term > self.term || self.role != Role::Follower {
            self.step_down(request.term, Some(request.leader.clone()));
        }
        self.leader = Some(request.leader);
        self.reset_election_deadline();

        let index = request.last_included_index;
        if index > self.last_applied {
            match self.state_machine.restore(&self.id, index, &request.data) {
                Ok(()) => {
                    self.log
                        .install_snapshot(index, request.last_included_term);
                    self.snapshot_data = request.data;
                    self.commit_index = self.commit_index.max(index);
                    self.last_applied = index;
                    info!(group = %self.id, node = %self.node, index, "Installed leader snapshot");
                }
                Err(e) => {
                    error!(group = %self.id, index, error = %e, "Failed to restore snapshot");
                }
            }
        }
        SnapshotResponse { term: self.term }
    }

    fn on_snapshot_result(
        &mut self,
        term: Term,
        from: NodeId,
        last_included: LogIndex,
        response: Result<SnapshotResponse>,
    ) {
        let response = match response {
            Ok(r) => r,
            Err(e) => {
                debug!(group = %self.id, peer = %from, error = %e, "Snapshot transfer failed");
                if let Some(progress) = self.progress.get_mut(&from) {
                    progress.in_flight = false;
                }
                return;
            }
        };
        if response.term > self.term {
            self.step_down(response.term, None);
            return;
        }
        // Progress was reset when this term's leadership began
        if self.role != Role::Leader || term != self.term || response.term != self.term {
            debug!(
                group = %self.id,
                peer = %from,
                term,
                "Ignoring snapshot result from an earlier term"
            );
            return;
        }
        if let Some(progress) = self.progress.get_mut(&from) {
            progress.in_flight = false;
            progress.last_ack = Some(Instant::now());
            progress.match_index = progress.match_index.max(last_included);
            progress.next_index = progress.match_index + 1;
        }
        self.advance_commit();
        self.send_append(&from);
    }

    // ---- reads ----

    fn read_index(&self, level: ConsistencyLevel) -> Result<LogIndex> {
        match level {
            ConsistencyLevel::Weak => Ok(self.last_applied),
            ConsistencyLevel::Strong => {
                if self.role != Role::Leader {
                    return Err(self.not_leader_error());
                }
                let required = majority(self.member_count);
                // A fresh leader must commit its no-op before its commit index is current
                if self.log.term_at(self.commit_index) != Some(self.term) {
                    return Err(Error::ReadQuorumUnavailable {
                        group: self.id.to_string(),
                        caught_up: 0,
                        required,
                    });
                }
                let caught_up = 1 + self.confirmed_followers();
                if caught_up < required {
                    return Err(Error::ReadQuorumUnavailable {
                        group: self.id.to_string(),
                        caught_up,
                        required,
                    });
                }
                Ok(self.commit_index)
            }
        }
    }

    /// Followers within the catch-up threshold that acknowledged this
    /// leader within one election timeout
    fn confirmed_followers(&self) -> usize {
        let now = Instant::now();
        let last_index = self.log.last_index();
        self.progress
            .values()
            .filter(|p| is_caught_up(last_index, p.match_index, self.config.max_catch_up_log_num))
            .filter(|p| {
                p.last_ack
                    .is_some_and(|at| now.duration_since(at) <= self.config.election_timeout)
            })
            .count()
    }

    fn replica_progress(&self) -> Result<Vec<ReplicaState>> {
        if self.role != Role::Leader {
            return Err(self.not_leader_error());
        }
        let last_index = self.log.last_index();
        let threshold = self.config.max_catch_up_log_num;
        let mut states = vec![ReplicaState {
            node: self.node.clone(),
            match_index: last_index,
            lag: 0,
            caught_up: true,
        }];
        let mut peers: Vec<_> = self.progress.iter().collect();
        peers.sort_by(|a, b| a.0.cmp(b.0));
        states.extend(peers.into_iter().map(|(node, p)| ReplicaState {
            node: node.clone(),
            match_index: p.match_index,
            lag: last_index.saturating_sub(p.match_index),
            caught_up: is_caught_up(last_index, p.match_index, threshold),
        }));
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Entry, LocalNetwork};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<Vec<u8>>>,
    }

    impl StateMachine for Recorder {
        fn apply(&self, _group: &GroupId, entry: &Entry) -> Result<()> {
            self.applied.lock().push(entry.command.clone());
            Ok(())
        }
    }

    fn fast_config() -> RaftConfig {
        RaftConfig {
            election_timeout: Duration::from_millis(50),
            heartbeat_interval: Duration::from_millis(10),
            ..RaftConfig::default()
        }
    }

    #[tokio::test]
    async fn test_single_node_group_elects_itself_and_applies() {
        let network = LocalNetwork::new();
        let recorder = Arc::new(Recorder::default());
        let group = ReplicationGroup::spawn(
            GroupId::Metadata,
            "n1".to_string(),
            vec!["n1".to_string()],
            fast_config(),
            network.transport_for("n1"),
            recorder.clone(),
        );

        let leader = group.wait_for_leader(Duration::from_secs(2)).await.unwrap();
        assert_eq!(leader, "n1");

        let index = group.propose(b"hello".to_vec()).await.unwrap();
        assert!(index >= 2, "no-op occupies the first slot of the term");
        assert_eq!(recorder.applied.lock().as_slice(), &[b"hello".to_vec()]);

        let strong = group.read_index(ConsistencyLevel::Strong).await.unwrap();
        assert!(strong >= index);

        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_follower_rejects_proposals() {
        let network = LocalNetwork::new();
        let group = ReplicationGroup::spawn(
            GroupId::Metadata,
            "n1".to_string(),
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
            fast_config(),
            network.transport_for("n1"),
            Arc::new(Recorder::default()),
        );

        // Peers are never registered: no leader can be elected
        let err = group.propose(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, Error::NoLeader { .. }));
        let err = group
            .read_index(ConsistencyLevel::Strong)
            .await
            .unwrap_err();
        assert!(err.is_redirectable());
        assert_eq!(
            group.read_index(ConsistencyLevel::Weak).await.unwrap(),
            0
        );
        group.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_term_append_is_rejected() {
        let network = LocalNetwork::new();
        let group = ReplicationGroup::spawn(
            GroupId::Metadata,
            "n1".to_string(),
            vec!["n1".to_string(), "n2".to_string()],
            RaftConfig {
                election_timeout: Duration::from_secs(10),
                ..RaftConfig::default()
            },
            network.transport_for("n1"),
            Arc::new(Recorder::default()),
        );
        let response = group
            .handle_append(AppendRequest {
                term: 5,
                leader: "n2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            })
            .await
            .unwrap();
        assert!(response.success);
        let leader = group.wait_for_leader(Duration::from_secs(1)).await.unwrap();
        assert_eq!(leader, "n2");

        let response = group
            .handle_append(AppendRequest {
                term: 4,
                leader: "n3".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            })
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.term, 5);
        group.shutdown().await;
    }

    /// Three member core driven directly, already leader of term 3 with
    /// entries 1..=10 committed
    fn leader_core(network: &LocalNetwork, config: RaftConfig) -> GroupCore {
        let (tx, _rx) = mpsc::channel(64);
        let (mut core, _status) = GroupCore::new(
            GroupId::Metadata,
            "n1".to_string(),
            vec!["n1".to_string(), "n2".to_string(), "n3".to_string()],
            config,
            network.transport_for("n1"),
            Arc::new(Recorder::default()),
            tx.downgrade(),
        );
        core.term = 3;
        core.become_leader();
        while core.log.last_index() < 10 {
            core.log.append(3, b"w".to_vec());
        }
        core.commit_index = 10;
        core.last_applied = 10;
        for progress in core.progress.values_mut() {
            progress.in_flight = false;
        }
        core
    }

    fn set_progress(core: &mut GroupCore, peer: &str, match_index: LogIndex, acked: bool) {
        let progress = core.progress.get_mut(peer).unwrap();
        progress.match_index = match_index;
        progress.next_index = match_index + 1;
        progress.last_ack = acked.then(Instant::now);
    }

    #[tokio::test]
    async fn test_strong_read_counts_follower_exactly_at_catch_up_threshold() {
        let network = LocalNetwork::new();
        let mut core = leader_core(
            &network,
            RaftConfig {
                max_catch_up_log_num: 3,
                ..fast_config()
            },
        );
        set_progress(&mut core, "n3", 0, false);

        // Lag of 3 equals the threshold
        set_progress(&mut core, "n2", 7, true);
        assert_eq!(core.read_index(ConsistencyLevel::Strong).unwrap(), 10);

        // One entry further behind drops it out of the quorum
        set_progress(&mut core, "n2", 6, true);
        let err = core.read_index(ConsistencyLevel::Strong).unwrap_err();
        assert!(matches!(
            err,
            Error::ReadQuorumUnavailable {
                caught_up: 1,
                required: 2,
                ..
            }
        ));

        // Caught up but silent for longer than an election timeout
        set_progress(&mut core, "n2", 10, false);
        assert!(core.read_index(ConsistencyLevel::Strong).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_result_from_earlier_term_is_ignored() {
        let network = LocalNetwork::new();
        let mut core = leader_core(&network, fast_config());
        set_progress(&mut core, "n2", 0, false);

        core.on_snapshot_result(1, "n2".to_string(), 10, Ok(SnapshotResponse { term: 1 }));
        assert_eq!(core.progress["n2"].match_index, 0);
        assert_eq!(core.role, Role::Leader);

        // Sent in this term but answered by a follower still in an older one
        core.on_snapshot_result(3, "n2".to_string(), 10, Ok(SnapshotResponse { term: 2 }));
        assert_eq!(core.progress["n2"].match_index, 0);

        core.on_snapshot_result(3, "n2".to_string(), 10, Ok(SnapshotResponse { term: 3 }));
        assert_eq!(core.progress["n2"].match_index, 10);
        assert_eq!(core.progress["n2"].next_index, 11);

        // A newer term seen in the response deposes this leader
        core.on_snapshot_result(3, "n3".to_string(), 10, Ok(SnapshotResponse { term: 4 }));
        assert_eq!(core.role, Role::Follower);
        assert_eq!(core.term, 4);
    }
}
