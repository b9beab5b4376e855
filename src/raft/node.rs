use super::log::{Command, Entry, Index, Log, Term};
use super::message::{Envelope, Message, ReplicaId, RequestId};
use super::state::State;
use crate::errinput;
use crate::error::Result;

use itertools::Itertools as _;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Tunable protocol timings and limits, defaulting to the wire-contract
/// constants in the module root. Tests shrink or expire them to force
/// behavior.
#[derive(Clone)]
pub struct Options {
    /// The interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// The minimum interval between catch-up appends to a lagging peer.
    /// Heartbeats are not subject to it.
    pub append_interval: Duration,
    /// The election timeout range in milliseconds while no leader is known.
    /// Short, so a leaderless cluster converges quickly.
    pub election_timeout_leaderless: RangeInclusive<u64>,
    /// The election timeout range in milliseconds while a leader is known.
    /// Long, to avoid false-positive elections.
    pub election_timeout_steady: RangeInclusive<u64>,
    /// How long buffered client requests wait while no leader is known before
    /// they fail.
    pub client_timeout: Duration,
    /// How long a pending read may wait for commit confirmation before it
    /// fails.
    pub read_timeout: Duration,
    /// The maximum number of entries per append_entries message.
    pub max_append_entries: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: super::HEARTBEAT_INTERVAL,
            append_interval: super::APPEND_INTERVAL,
            election_timeout_leaderless: super::ELECTION_TIMEOUT_LEADERLESS,
            election_timeout_steady: super::ELECTION_TIMEOUT_STEADY,
            client_timeout: super::CLIENT_TIMEOUT,
            read_timeout: super::READ_TIMEOUT,
            max_append_entries: super::MAX_APPEND_ENTRIES,
        }
    }
}

/// One replica of the cluster, in whichever of the three roles it currently
/// holds. Drive it by feeding inbound envelopes to step() and calling tick()
/// once per event-loop pass; both take the node by value and hand back the
/// node in whatever role it landed in, so callers rebind:
/// node = node.step(envelope)?. Anything the node wants to say goes out
/// through the channel given to new(); the server drains that queue into the
/// transport after every call.
///
/// The enum itself is a thin shell: the per-role logic lives in the wrapped
/// RawNode<Role> values.
pub enum Node {
    Follower(RawNode<Follower>),
    Candidate(RawNode<Candidate>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Builds a replica node. It comes up as a follower that knows no leader,
    /// except that a cluster of one seats itself immediately.
    pub fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        if id == ReplicaId::BROADCAST {
            return errinput!("replica ID {id} is reserved");
        }
        if peers.contains(&id) {
            return errinput!("replica {id} can't be its own peer");
        }
        if peers.contains(&ReplicaId::BROADCAST) {
            return errinput!("peer ID {} is reserved", ReplicaId::BROADCAST);
        }
        let node = RawNode::new(id, peers, log, state, node_tx, opts);
        if node.peers.is_empty() {
            // With nobody to ask for votes, a lone replica is its own quorum.
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    /// The replica's own ID.
    pub fn id(&self) -> ReplicaId {
        match self {
            Node::Follower(n) => n.id,
            Node::Candidate(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    /// The term this replica currently believes in.
    pub fn term(&self) -> Term {
        match self {
            Node::Follower(n) => n.term(),
            Node::Candidate(n) => n.term(),
            Node::Leader(n) => n.term(),
        }
    }

    /// Routes one inbound envelope to the current role's handler.
    pub fn step(self, envelope: Envelope) -> Result<Self> {
        match self {
            Node::Follower(n) => n.step(envelope),
            Node::Candidate(n) => n.step(envelope),
            Node::Leader(n) => n.step(envelope),
        }
    }

    /// Runs the periodic work of one event-loop iteration: client buffer
    /// management, timeouts, sends, and entry application.
    pub fn tick(self) -> Result<Self> {
        match self {
            Node::Follower(n) => n.tick(),
            Node::Candidate(n) => n.tick(),
            Node::Leader(n) => n.tick(),
        }
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// Marker for the three replica roles.
pub trait Role {}

/// The working half of a node: the replica state shared by every role, plus
/// one role marker R carrying role-specific data. Behavior lives in impl
/// blocks per concrete R, so calls that make no sense for a role (a follower
/// heartbeating, say) don't exist on it, and transitions consume the node to
/// rebuild it around the next role's data.
pub struct RawNode<R: Role = Follower> {
    id: ReplicaId,
    peers: HashSet<ReplicaId>,
    log: Log,
    state: Box<dyn State>,
    node_tx: crossbeam::channel::Sender<Envelope>,
    opts: Options,
    /// Election timeouts are drawn from a per-replica seeded RNG, so a
    /// replica's timing is reproducible across runs.
    rng: StdRng,
    /// The believed leader, if any. Stamped into every outbound envelope.
    leader: Option<ReplicaId>,
    /// Client requests held while this node can't serve them, deduplicated by
    /// MID. Flushed every tick: dispatched when leader, redirected when a
    /// leader is known, failed after client_timeout otherwise.
    buffered: Vec<Envelope>,
    /// When the buffer was last flushed (or flushable).
    last_flush: Instant,
    role: R,
}

impl<R: Role> RawNode<R> {
    /// Moves the shared replica state into a node with a different role.
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            rng: self.rng,
            leader: self.leader,
            buffered: self.buffered,
            last_flush: self.last_flush,
            role,
        }
    }

    /// The current term, as recorded alongside the log.
    fn term(&self) -> Term {
        self.log.get_term().0
    }

    /// The number of replicas in the cluster, ourselves included.
    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// The number of replicas forming a strict majority.
    fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    /// Picks the largest value that a strict majority of replicas is at or
    /// above, given one value per cluster member (in any order).
    fn quorum_value<T: Ord + Copy>(&self, mut values: Vec<T>) -> T {
        assert_eq!(values.len(), self.cluster_size(), "need one value per cluster member");
        *values.select_nth_unstable_by(self.quorum_size() - 1, |a, b: &T| a.cmp(b).reverse()).1
    }

    /// Sends a message, stamping the sender, term, and believed leader.
    fn send(&self, dst: ReplicaId, message: Message) -> Result<()> {
        let envelope = Envelope {
            src: self.id,
            dst,
            leader: self.leader.unwrap_or(ReplicaId::BROADCAST),
            term: self.term(),
            message,
        };
        debug!("Sending {envelope:?}");
        Ok(self.node_tx.send(envelope)?)
    }

    /// Queues a copy of the message for every peer.
    fn broadcast(&self, message: Message) -> Result<()> {
        // Fixed ID order, so tests can assert on the outbound queue.
        for peer in self.peers.iter().copied().sorted() {
            self.send(peer, message.clone())?;
        }
        Ok(())
    }

    /// Draws a randomized election deadline. The range depends on whether a
    /// leader is currently known.
    fn gen_election_deadline(&mut self) -> Instant {
        let range = match self.leader {
            Some(_) => self.opts.election_timeout_steady.clone(),
            None => self.opts.election_timeout_leaderless.clone(),
        };
        Instant::now() + Duration::from_millis(self.rng.gen_range(range))
    }

    /// Checks that an envelope was addressed to this replica at all.
    fn assert_step(&self, envelope: &Envelope) {
        assert!(
            envelope.dst == self.id || envelope.dst == ReplicaId::BROADCAST,
            "message for {} stepped on {}",
            envelope.dst,
            self.id
        );
    }

    /// Answers a message from a past term so the sender steps down: vote
    /// solicitations are denied, appends are failed with a conflict hint.
    /// Anything else from a past term is dropped.
    fn reply_stale(&self, src: ReplicaId, message: &Message) -> Result<()> {
        debug!("Answering stale-term message from {src}");
        match message {
            Message::RequestVote { .. } => self.send(src, Message::ResponseVote { value: false }),
            Message::AppendEntries { prev_log_idx, .. } => self.send(
                src,
                Message::Fail {
                    mid: None,
                    term_first_idx: Some(self.log.first_index_of_term_at(*prev_log_idx)),
                },
            ),
            _ => Ok(()),
        }
    }

    /// Extracts the believed leader from a message, ignoring nonsense hints.
    fn leader_hint(&self, envelope: &Envelope) -> Option<ReplicaId> {
        envelope.leader_hint().filter(|leader| self.peers.contains(leader))
    }

    /// Holds a client request for later handling, deduplicating retries by
    /// their MID.
    fn buffer_client(&mut self, envelope: Envelope) {
        if self.buffered.iter().any(|held| held.message.mid() == envelope.message.mid()) {
            return;
        }
        self.buffered.push(envelope);
    }

    /// Manages buffered client requests on a non-leader: redirect them all
    /// when a leader is known, fail them all after a bounded leaderless wait
    /// (so clients don't hammer the cluster during elections).
    fn flush_buffered(&mut self) -> Result<()> {
        if self.leader.is_some() {
            for envelope in std::mem::take(&mut self.buffered) {
                if let Some(mid) = envelope.message.mid() {
                    self.send(envelope.src, Message::Redirect { mid: mid.to_string() })?;
                }
            }
            self.last_flush = Instant::now();
        } else if self.last_flush.elapsed() >= self.opts.client_timeout {
            for envelope in std::mem::take(&mut self.buffered) {
                if let Some(mid) = envelope.message.mid() {
                    self.send(
                        envelope.src,
                        Message::Fail { mid: Some(mid.to_string()), term_first_idx: None },
                    )?;
                }
            }
            self.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Applies any committed but unapplied entries, without client responses
    /// (only leaders answer clients).
    fn maybe_apply(&mut self) -> Result<()> {
        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let entry = self.log.entry(index).expect("missing committed entry").clone();
            debug!("Applying entry {index}");
            self.state.apply(index, &entry);
        }
        Ok(())
    }
}

/// The passive role: accepts whatever the leader replicates, and votes in
/// elections.
pub struct Follower {
    /// When the election timer fires, absent valid leader contact.
    election_deadline: Instant,
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Boots a fresh replica: a follower that has yet to hear from anyone.
    fn new(
        id: ReplicaId,
        peers: HashSet<ReplicaId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: crossbeam::channel::Sender<Envelope>,
        opts: Options,
    ) -> Self {
        let mut node = Self {
            id,
            peers,
            log,
            state,
            node_tx,
            opts,
            rng: StdRng::seed_from_u64(u16::from(id) as u64),
            leader: None,
            buffered: Vec::new(),
            last_flush: Instant::now(),
            role: Follower { election_deadline: Instant::now() },
        };
        node.role.election_deadline = node.gen_election_deadline();
        node
    }

    /// Transitions to a follower with a new leader and/or term: a new term
    /// resets the vote, a known leader arms the longer steady timeout.
    fn into_follower(mut self, leader: Option<ReplicaId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term {term} is behind ours {}", self.term());
        if term > self.term() {
            info!("Adopting term {term}");
            self.log.set_term(term, None);
        }
        if let Some(leader) = leader {
            if self.leader != Some(leader) {
                info!("Recognizing {leader} as leader of term {term}");
            }
        }
        self.leader = leader;
        self.role.election_deadline = self.gen_election_deadline();
        Ok(self)
    }

    /// Gives up waiting for a leader and stands for election instead.
    fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        self.leader = None;
        let mut node = self.into_role(Candidate {
            votes: HashSet::new(),
            election_deadline: Instant::now(),
        });
        node.campaign()?;
        Ok(node)
    }

    /// Handles one envelope as a follower.
    fn step(mut self, envelope: Envelope) -> Result<Node> {
        self.assert_step(&envelope);

        // Client requests don't carry a meaningful term; hold them for the
        // next flush.
        if matches!(envelope.message, Message::Get { .. } | Message::Put { .. }) {
            self.buffer_client(envelope);
            return Ok(self.into());
        }

        // Messages from future terms move us into that term; the leader, if
        // the message names one, is adopted as well.
        if envelope.term > self.term() {
            let leader = self.leader_hint(&envelope);
            return self.into_follower(leader, envelope.term)?.step(envelope);
        }

        // Messages from past terms are answered with our term so the sender
        // steps down.
        if envelope.term < self.term() {
            self.reply_stale(envelope.src, &envelope.message)?;
            return Ok(self.into());
        }

        let src = envelope.src;
        match envelope.message {
            // The leader replicates entries and asserts its leadership. Any
            // valid append defers the next election.
            Message::AppendEntries { prev_log_idx, prev_log_term, entries, leader_commit } => {
                match self.leader {
                    Some(leader) => {
                        assert_eq!(leader, src, "two leaders in term {}", envelope.term)
                    }
                    None => self = self.into_follower(Some(src), envelope.term)?,
                }
                self.role.election_deadline = self.gen_election_deadline();

                if !self.log.prefix_matches(prev_log_idx, prev_log_term) {
                    debug!("Rejecting append from {src}: no entry {prev_log_idx}@{prev_log_term}");
                    self.send(
                        src,
                        Message::Fail {
                            mid: None,
                            term_first_idx: Some(self.log.first_index_of_term_at(prev_log_idx)),
                        },
                    )?;
                } else {
                    self.log.splice(prev_log_idx, &entries);
                    let commit = std::cmp::min(self.log.last_index(), leader_commit);
                    if commit > self.log.commit_index() {
                        self.log.commit(commit);
                        self.maybe_apply()?;
                    }
                    // Echo the append back, so the leader can derive the new
                    // match index from the reply alone.
                    self.send(
                        src,
                        Message::Ok {
                            mid: None,
                            value: None,
                            prev_log_idx: Some(prev_log_idx),
                            entries: Some(entries),
                        },
                    )?;
                }
            }

            // Someone is standing for election in this term.
            Message::RequestVote { last_log_idx, last_log_term } => {
                // Our vote is single-use per term.
                if let (_, Some(vote)) = self.log.get_term() {
                    if vote != src {
                        self.send(src, Message::ResponseVote { value: false })?;
                        return Ok(self.into());
                    }
                }
                // Never elect a candidate whose log is missing entries we hold.
                let (log_idx, log_term) = (self.log.last_index(), self.log.last_term());
                if last_log_term < log_term || (last_log_term == log_term && last_log_idx < log_idx)
                {
                    self.send(src, Message::ResponseVote { value: false })?;
                    return Ok(self.into());
                }
                // Grant the vote, deferring the next election.
                info!("Granting term {} vote to {src}", self.term());
                self.log.set_term(self.term(), Some(src));
                self.role.election_deadline = self.gen_election_deadline();
                self.send(src, Message::ResponseVote { value: true })?;
            }

            // Votes may arrive after an election we lost; append replies may
            // arrive after we stopped leading. Ignore them.
            Message::ResponseVote { .. } | Message::Ok { .. } | Message::Fail { .. } => {}

            // Replicas don't receive redirects; clients were handled above.
            Message::Redirect { .. } | Message::Get { .. } | Message::Put { .. } => {}
        }
        Ok(self.into())
    }

    /// Runs the follower's periodic work: buffered client management and the
    /// election timer, then entry application.
    fn tick(mut self) -> Result<Node> {
        self.flush_buffered()?;
        if Instant::now() >= self.role.election_deadline {
            return Ok(self.into_candidate()?.into());
        }
        self.maybe_apply()?;
        Ok(self.into())
    }
}

/// The campaigning role: collecting votes to take over leadership.
pub struct Candidate {
    /// Who has granted us their vote so far, ourselves included.
    votes: HashSet<ReplicaId>,
    /// When this election gives up and a new one starts.
    election_deadline: Instant,
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Opens an election round: moves to the next term, casts our own vote,
    /// and asks every peer for theirs.
    fn campaign(&mut self) -> Result<()> {
        let term = self.term() + 1;
        info!("Campaigning for term {term}");
        self.leader = None;
        self.log.set_term(term, Some(self.id));
        self.role.votes = std::iter::once(self.id).collect();
        self.role.election_deadline = self.gen_election_deadline();
        let (last_log_idx, last_log_term) = (self.log.last_index(), self.log.last_term());
        self.broadcast(Message::RequestVote { last_log_idx, last_log_term })?;
        Ok(())
    }

    /// Abandons the campaign: this term already produced a winner, or a later
    /// term surfaced.
    fn into_follower(mut self, leader: Option<ReplicaId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term >= self.term(), "term {term} is behind ours {}", self.term());
        if term > self.term() {
            info!("Adopting term {term}");
            self.log.set_term(term, None);
        }
        if let Some(leader) = leader {
            info!("Conceding term {term} to {leader}");
        }
        self.leader = leader;
        let election_deadline = self.gen_election_deadline();
        Ok(self.into_role(Follower { election_deadline }))
    }

    /// Takes office after a majority granted their votes.
    fn into_leader(mut self) -> Result<RawNode<Leader>> {
        info!("Election won, leading term {}", self.term());
        self.leader = Some(self.id);
        let next_index = self.log.commit_index() + 1;
        let progress = self
            .peers
            .iter()
            .map(|peer| (*peer, Progress { next_index, match_index: 0, last_append: None }))
            .collect();
        let mut node = self.into_role(Leader {
            progress,
            reads: VecDeque::new(),
            last_heartbeat: Instant::now(),
        });
        // Assert leadership right away, replicating anything peers may lack.
        node.heartbeat()?;
        node.maybe_commit_and_apply()?;
        Ok(node)
    }

    /// Handles one envelope as a candidate.
    fn step(mut self, envelope: Envelope) -> Result<Node> {
        self.assert_step(&envelope);

        if matches!(envelope.message, Message::Get { .. } | Message::Put { .. }) {
            self.buffer_client(envelope);
            return Ok(self.into());
        }

        if envelope.term > self.term() {
            let leader = self.leader_hint(&envelope);
            return self.into_follower(leader, envelope.term)?.step(envelope);
        }
        if envelope.term < self.term() {
            self.reply_stale(envelope.src, &envelope.message)?;
            return Ok(self.into());
        }

        let src = envelope.src;
        match envelope.message {
            // A leader exists in this term; we lost the election. Follow it
            // and process the append as a follower.
            Message::AppendEntries { .. } => {
                return self.into_follower(Some(src), envelope.term)?.step(envelope);
            }

            // Our own candidacy holds our vote.
            Message::RequestVote { .. } => {
                self.send(src, Message::ResponseVote { value: false })?;
            }

            // Tally votes; a majority of the cluster makes us leader.
            Message::ResponseVote { value: true } => {
                self.role.votes.insert(src);
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }
            Message::ResponseVote { value: false } => {}

            // Stale replies from an earlier leadership; ignore.
            Message::Ok { .. } | Message::Fail { .. } => {}

            Message::Redirect { .. } | Message::Get { .. } | Message::Put { .. } => {}
        }
        Ok(self.into())
    }

    /// Runs the candidate's periodic work. An expired election restarts the
    /// campaign in a new term.
    fn tick(mut self) -> Result<Node> {
        self.flush_buffered()?;
        if Instant::now() >= self.role.election_deadline {
            self.campaign()?;
        }
        self.maybe_apply()?;
        Ok(self.into())
    }
}

/// What the leader knows about one follower's log.
struct Progress {
    /// The first index the follower still needs from us.
    next_index: Index,
    /// The highest index we know the follower stores. Never moves backwards
    /// while we hold the term.
    match_index: Index,
    /// When an append was last sent, for the catch-up throttle.
    last_append: Option<Instant>,
}

impl Progress {
    /// Raises the match index if the given one is forward progress, pulling
    /// the next index along; stale confirmations change nothing. Returns
    /// whether anything moved.
    fn advance(&mut self, match_index: Index) -> bool {
        if match_index <= self.match_index {
            return false;
        }
        self.match_index = match_index;
        self.next_index = std::cmp::max(self.next_index, match_index + 1);
        true
    }
}

/// A client read awaiting commit confirmation. Answered once the commit index
/// advances past the index recorded at receipt, proving we were still leader
/// after the read arrived; failed if that takes longer than read_timeout.
struct PendingRead {
    /// The commit index when the read arrived.
    commit_index: Index,
    /// The requesting client.
    src: ReplicaId,
    /// The client request ID.
    mid: RequestId,
    /// The key to read.
    key: String,
    /// When the read arrived.
    received: Instant,
}

/// The active role: the one endpoint serving client traffic and pushing the
/// log out to its followers.
pub struct Leader {
    /// Per-peer replication state.
    progress: HashMap<ReplicaId, Progress>,
    /// Pending client reads, in arrival order.
    reads: VecDeque<PendingRead>,
    /// When the last periodic heartbeat was broadcast.
    last_heartbeat: Instant,
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Transitions the leader into a follower after discovering a later
    /// term. All in-flight client work is failed: uncommitted writes in the
    /// log and all pending reads. The clients retry against the next leader.
    fn into_follower(mut self, leader: Option<ReplicaId>, term: Term) -> Result<RawNode<Follower>> {
        assert!(term > self.term(), "leaders only step down to later terms");
        info!("Stepping down: term {term} supersedes our term {}", self.term());
        self.log.set_term(term, None);
        self.leader = leader;

        let mut failed = Vec::new();
        for index in self.log.commit_index() + 1..=self.log.last_index() {
            let entry = self.log.entry(index).expect("missing log entry");
            if let Some(Command::Put { src, mid, .. }) = &entry.command {
                failed.push((*src, mid.clone()));
            }
        }
        for read in std::mem::take(&mut self.role.reads) {
            failed.push((read.src, read.mid));
        }
        for (dst, mid) in failed {
            self.send(dst, Message::Fail { mid: Some(mid), term_first_idx: None })?;
        }

        let election_deadline = self.gen_election_deadline();
        Ok(self.into_role(Follower { election_deadline }))
    }

    /// Handles one envelope as the leader.
    fn step(mut self, envelope: Envelope) -> Result<Node> {
        self.assert_step(&envelope);

        // Leaders serve client requests immediately.
        match envelope.message {
            Message::Put { mid, key, value } => {
                self.client_put(envelope.src, mid, key, value)?;
                return Ok(self.into());
            }
            Message::Get { mid, key } => {
                self.client_get(envelope.src, mid, key)?;
                return Ok(self.into());
            }
            _ => {}
        }

        if envelope.term > self.term() {
            let leader = self.leader_hint(&envelope);
            return self.into_follower(leader, envelope.term)?.step(envelope);
        }
        if envelope.term < self.term() {
            self.reply_stale(envelope.src, &envelope.message)?;
            return Ok(self.into());
        }

        let src = envelope.src;
        match envelope.message {
            // Election safety means this term has exactly one leader: us.
            Message::AppendEntries { .. } => {
                panic!("another leader {src} claims term {}", envelope.term);
            }

            // We lead this term; there is no vote to give in it.
            Message::RequestVote { .. } => {
                self.send(src, Message::ResponseVote { value: false })?;
            }

            // Surplus votes from the election we already won.
            Message::ResponseVote { .. } => {}

            // A follower accepted entries. The echoed append tells us its new
            // match index; try to commit.
            Message::Ok { prev_log_idx: Some(prev_log_idx), entries, .. }
                if self.role.progress.contains_key(&src) =>
            {
                let appended = entries.map(|entries| entries.len() as Index).unwrap_or(0);
                let match_index = prev_log_idx + appended;
                assert!(match_index <= self.log.last_index(), "follower ahead of leader log");
                if self.progress(src).advance(match_index) {
                    self.maybe_commit_and_apply()?;
                }
            }

            // A follower rejected an append. Rewind its next index, using the
            // conflict hint when the reply carries one, and retry immediately
            // rather than waiting out the send throttle.
            Message::Fail { term_first_idx, .. } if self.role.progress.contains_key(&src) => {
                let progress = self.progress(src);
                progress.next_index = match term_first_idx {
                    Some(hint) => std::cmp::max(hint, progress.match_index),
                    None => progress.next_index.saturating_sub(1),
                }
                .max(1);
                debug!("Append rejected by {src}, rewinding next index to {}", progress.next_index);
                self.send_append(src)?;
            }

            // Client-shaped replies or replies from unknown endpoints; drop.
            Message::Ok { .. } | Message::Fail { .. } => {}

            Message::Redirect { .. } | Message::Get { .. } | Message::Put { .. } => {}
        }
        Ok(self.into())
    }

    /// Runs the leader's periodic work, in event-loop order: dispatch
    /// buffered client requests, fail stale reads, send throttled catch-up
    /// appends, heartbeat, and apply whatever committed.
    fn tick(mut self) -> Result<Node> {
        self.dispatch_buffered()?;
        self.fail_stale_reads()?;
        self.maybe_send_appends()?;
        if self.role.last_heartbeat.elapsed() >= self.opts.heartbeat_interval {
            self.heartbeat()?;
        }
        self.maybe_commit_and_apply()?;
        Ok(self.into())
    }

    /// A client write. Writes whose MID already committed are acknowledged
    /// without re-appending (the client is retrying a request we served);
    /// otherwise the write is appended and the reply deferred until commit.
    fn client_put(&mut self, src: ReplicaId, mid: RequestId, key: String, value: String) -> Result<()> {
        if self.log.has_committed(&mid) {
            let value = self.state.read(&key);
            return self.send(
                src,
                Message::Ok { mid: Some(mid), value: Some(value), prev_log_idx: None, entries: None },
            );
        }
        let index = self.log.append(Command::Put { src, mid, key, value });
        debug!("Appended client write at index {index}");
        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
        }
        Ok(())
    }

    /// A client read. The read is answered once the commit index advances
    /// past its recorded position, which proves we were still the leader
    /// after it arrived. If nothing is in flight to commit, append a no-op to
    /// force a commit round.
    fn client_get(&mut self, src: ReplicaId, mid: RequestId, key: String) -> Result<()> {
        self.role.reads.push_back(PendingRead {
            commit_index: self.log.commit_index(),
            src,
            mid,
            key,
            received: Instant::now(),
        });
        if self.log.commit_index() == self.log.last_index() {
            self.log.append(Command::NoOp);
        }
        if self.peers.is_empty() {
            self.maybe_commit_and_apply()?;
        }
        Ok(())
    }

    /// Dispatches client requests buffered before we became leader.
    fn dispatch_buffered(&mut self) -> Result<()> {
        for envelope in std::mem::take(&mut self.buffered) {
            match envelope.message {
                Message::Put { mid, key, value } => {
                    self.client_put(envelope.src, mid, key, value)?
                }
                Message::Get { mid, key } => self.client_get(envelope.src, mid, key)?,
                _ => {}
            }
        }
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Fails pending reads that have waited too long for a commit round
    /// (e.g. because a partition cost us our quorum).
    fn fail_stale_reads(&mut self) -> Result<()> {
        while let Some(read) = self.role.reads.front() {
            if read.received.elapsed() < self.opts.read_timeout {
                break;
            }
            let read = self.role.reads.pop_front().expect("no pending read");
            debug!("Failing stale read {}", read.mid);
            self.send(read.src, Message::Fail { mid: Some(read.mid), term_first_idx: None })?;
        }
        Ok(())
    }

    /// Sends catch-up appends to lagging peers, at most one per peer per
    /// append_interval.
    fn maybe_send_appends(&mut self) -> Result<()> {
        let last_index = self.log.last_index();
        for peer in self.peers.iter().copied().sorted() {
            let progress = &self.role.progress[&peer];
            if progress.match_index >= last_index {
                continue;
            }
            if let Some(at) = progress.last_append {
                if at.elapsed() < self.opts.append_interval {
                    continue;
                }
            }
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Broadcasts appends to all peers regardless of match state or the send
    /// throttle, asserting leadership and propagating the commit index.
    fn heartbeat(&mut self) -> Result<()> {
        for peer in self.peers.iter().copied().sorted() {
            self.send_append(peer)?;
        }
        self.role.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Sends an append to a peer with the entries it should have next, if
    /// any. An empty append doubles as a heartbeat.
    fn send_append(&mut self, peer: ReplicaId) -> Result<()> {
        let progress = self.role.progress.get_mut(&peer).expect("unknown peer");
        assert!(progress.next_index >= 1, "invalid next index 0");
        let prev_log_idx = progress.next_index - 1;
        let next = progress.next_index;
        progress.last_append = Some(Instant::now());

        let prev_log_term = self.log.entry(prev_log_idx).expect("missing append base").term;
        let entries = self.log.range(next, self.opts.max_append_entries);
        self.send(
            peer,
            Message::AppendEntries {
                prev_log_idx,
                prev_log_term,
                entries,
                leader_commit: self.log.commit_index(),
            },
        )
    }

    /// Looks up a peer's replication state for mutation.
    fn progress(&mut self, peer: ReplicaId) -> &mut Progress {
        self.role.progress.get_mut(&peer).expect("unknown peer")
    }

    /// Moves the commit index up to whatever a majority now stores, feeds the
    /// newly committed entries to the state machine, and settles the client
    /// traffic that was waiting on them. Counting replicas only ever commits
    /// entries of the current term; older entries ride along beneath them.
    fn maybe_commit_and_apply(&mut self) -> Result<()> {
        let quorum_index = self.quorum_value(
            self.role
                .progress
                .values()
                .map(|p| p.match_index)
                .chain(std::iter::once(self.log.last_index()))
                .collect(),
        );

        let mut advanced = false;
        if quorum_index > self.log.commit_index() {
            let term = self.log.entry(quorum_index).expect("missing quorum entry").term;
            if term == self.term() {
                self.log.commit(quorum_index);
                debug!("Committed entries up to {quorum_index}");
                advanced = true;
            }
        }

        // Apply whatever is committed. Writes from our own term get their
        // deferred ok here; writes from earlier terms were already failed by
        // the leader that accepted them, and their clients have retried.
        let mut acks = Vec::new();
        while self.state.applied_index() < self.log.commit_index() {
            let index = self.state.applied_index() + 1;
            let entry = self.log.entry(index).expect("missing committed entry").clone();
            self.state.apply(index, &entry);
            if entry.term == self.term() {
                if let Some(Command::Put { src, mid, .. }) = entry.command {
                    acks.push((src, mid));
                }
            }
        }
        for (dst, mid) in acks {
            self.send(dst, Message::Ok { mid: Some(mid), value: None, prev_log_idx: None, entries: None })?;
        }

        // A commit round in our term confirms we are still the leader, so
        // reads that were waiting on it can now be answered.
        if advanced {
            self.maybe_answer_reads()?;
        }
        Ok(())
    }

    /// Answers pending reads whose recorded commit index has been reached.
    fn maybe_answer_reads(&mut self) -> Result<()> {
        let commit_index = self.log.commit_index();
        while let Some(read) = self.role.reads.front() {
            if read.commit_index > commit_index {
                break;
            }
            let read = self.role.reads.pop_front().expect("no pending read");
            let value = self.state.read(&read.key);
            self.send(
                read.src,
                Message::Ok {
                    mid: Some(read.mid),
                    value: Some(value),
                    prev_log_idx: None,
                    entries: None,
                },
            )?;
        }
        Ok(())
    }
}
