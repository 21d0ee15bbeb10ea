//! Gossip Engine (SWIM-like)
//!
//! Cluster membership and failure detection:
//!
//! - **Probe**: one random member per probe interval, with indirect probes
//!   through other members when the direct ack is late
//! - **Suspicion**: unacknowledged members become suspects and are declared
//!   dead after a timeout that grows with the cluster size, unless they
//!   refute with a higher incarnation
//! - **Piggyback**: membership changes and user broadcasts are queued and
//!   retransmitted a bounded number of times to random members
//! - **Push-pull**: periodic full state exchange over a stream, carrying the
//!   delegate's user state
//!
//! Uses Sans-IO pattern: message processing returns actions, and the engine
//! runtime performs the I/O.

use crate::cluster::config::ClusterConfig;
use crate::cluster::transport::{BoxedStream, HttpTransport, Packet};
use crate::cluster::types::{ClusterError, NodeId};
use crate::infrastructure::ShutdownController;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

const MAX_STREAM_FRAME: u32 = 32 * 1024 * 1024;
const MAX_BROADCASTS_PER_PACKET: usize = 16;
const SEEN_USER_MESSAGES: usize = 4096;

/// State of a cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Member is alive and reachable
    Alive,
    /// Member missed a probe and may be down
    Suspect,
    /// Member has been declared dead by the cluster
    Dead,
    /// Member left gracefully
    Left,
}

impl MemberState {
    pub fn is_departed(&self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }
}

/// Information about a cluster member.
#[derive(Debug, Clone)]
pub struct Member {
    /// Node identifier
    pub name: NodeId,
    /// Advertised address
    pub addr: SocketAddr,
    /// Opaque metadata published by the member's delegate
    pub meta: Vec<u8>,
    /// Incarnation number for state reconciliation
    pub incarnation: u64,
    /// Current state
    pub state: MemberState,
    /// When the state last changed
    pub state_change: Instant,
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        // state_change is time-based
        self.name == other.name
            && self.addr == other.addr
            && self.meta == other.meta
            && self.incarnation == other.incarnation
            && self.state == other.state
    }
}

/// Announcement that a node is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u64,
    pub node: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
}

/// Accusation that a node may be down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

/// Declaration that a node is dead. `from == node` means a graceful leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

/// Datagram payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwimMessage {
    Ping { seq: u32, from: String, target: String },
    IndirectPing { seq: u32, from: String, target: String },
    Ack { seq: u32, from: String },
    Alive(Alive),
    Suspect(Suspect),
    Dead(Dead),
    User { id: u64, payload: Vec<u8> },
    Compound(Vec<SwimMessage>),
}

/// One member as carried by push-pull.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushNode {
    pub name: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: MemberState,
}

/// Stream payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    PushPull {
        from: String,
        join: bool,
        nodes: Vec<PushNode>,
        user_state: Vec<u8>,
    },
}

/// Membership changes reported to the delegate.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberEvent {
    Join(Member),
    Leave(Member),
    Update(Member),
}

/// Output action from message processing (Sans-IO pattern).
#[derive(Debug, Clone, PartialEq)]
pub enum GossipAction {
    /// Send a datagram to a member
    Send { to: NodeId, message: SwimMessage },
    /// Queue a message for piggybacked dissemination
    Broadcast(SwimMessage),
    /// Report a membership change
    Emit(MemberEvent),
    /// Hand a user broadcast to the delegate
    Deliver { id: u64, payload: Vec<u8> },
    /// An ack for a pending probe arrived
    AckReceived { seq: u32 },
    /// Probe `target` on behalf of `requester`
    ProbeFor { requester: NodeId, seq: u32, target: NodeId },
}

/// Callbacks from the gossip engine.
///
/// Called from the engine's tasks; implementations must not block for long.
pub trait GossipDelegate: Send + Sync {
    /// Metadata advertised for the local node.
    fn node_meta(&self) -> Vec<u8>;

    /// A user broadcast arrived.
    fn notify_msg(&self, msg: &[u8]);

    /// User state sent during push-pull.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// User state received during push-pull.
    fn merge_remote_state(&self, buf: &[u8], join: bool);

    fn notify_join(&self, member: &Member);

    fn notify_leave(&self, member: &Member);

    fn notify_update(&self, member: &Member);
}

/// Shared member table.
pub type MemberTable = RwLock<HashMap<NodeId, Member>>;

/// The local node as seen by the protocol.
#[derive(Debug)]
pub struct LocalNode {
    pub name: NodeId,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    incarnation: AtomicU64,
    leaving: AtomicBool,
}

impl LocalNode {
    pub fn new(name: NodeId, addr: SocketAddr, meta: Vec<u8>) -> Self {
        Self {
            name,
            addr,
            meta,
            incarnation: AtomicU64::new(0),
            leaving: AtomicBool::new(false),
        }
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::SeqCst)
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    /// Move past an accusation made at `accused` incarnation.
    pub fn refute(&self, accused: u64) -> u64 {
        let next = accused + 1;
        self.incarnation.fetch_max(next, Ordering::SeqCst).max(next)
    }

    pub fn alive(&self) -> Alive {
        Alive {
            incarnation: self.incarnation(),
            node: self.name.0.clone(),
            addr: self.addr,
            meta: self.meta.clone(),
        }
    }

    fn push_node(&self) -> PushNode {
        PushNode {
            name: self.name.0.clone(),
            addr: self.addr,
            meta: self.meta.clone(),
            incarnation: self.incarnation(),
            state: MemberState::Alive,
        }
    }
}

// ==================== Sans-IO Functions ====================

/// Suspicion timeout for a cluster of `n` members.
pub fn suspicion_timeout(mult: u32, n: usize, interval: Duration) -> Duration {
    let scale = (n.max(1) as f64).log10().max(1.0);
    interval.mul_f64(mult as f64 * scale)
}

/// Number of times a broadcast is transmitted in a cluster of `n` members.
pub fn retransmit_limit(mult: usize, n: usize) -> usize {
    let scale = ((n + 1) as f64).log10().ceil() as usize;
    (mult * scale).max(1)
}

/// Apply an alive announcement.
pub fn apply_alive(
    members: &MemberTable,
    local: &LocalNode,
    alive: &Alive,
    reclaim: Duration,
) -> Vec<GossipAction> {
    if alive.node == local.name.0 {
        if alive.incarnation > local.incarnation() && !local.is_leaving() {
            let incarnation = local.refute(alive.incarnation);
            tracing::debug!("refuting stale alive for self, incarnation={}", incarnation);
            return vec![GossipAction::Broadcast(SwimMessage::Alive(local.alive()))];
        }
        return Vec::new();
    }

    let node_id = NodeId::new(&alive.node);
    let mut guard = members.write();

    let member = match guard.get_mut(&node_id) {
        None => {
            let member = Member {
                name: node_id.clone(),
                addr: alive.addr,
                meta: alive.meta.clone(),
                incarnation: alive.incarnation,
                state: MemberState::Alive,
                state_change: Instant::now(),
            };
            guard.insert(node_id, member.clone());
            return vec![
                GossipAction::Emit(MemberEvent::Join(member)),
                GossipAction::Broadcast(SwimMessage::Alive(alive.clone())),
            ];
        }
        Some(member) => member,
    };

    let departed = member.state.is_departed();
    let reclaimable = departed && member.state_change.elapsed() >= reclaim;
    if alive.incarnation <= member.incarnation && !reclaimable {
        return Vec::new();
    }

    let changed = member.meta != alive.meta || member.addr != alive.addr;
    member.incarnation = alive.incarnation;
    member.meta = alive.meta.clone();
    member.addr = alive.addr;
    if member.state != MemberState::Alive {
        member.state = MemberState::Alive;
        member.state_change = Instant::now();
    }

    let snapshot = member.clone();
    let mut actions = Vec::new();
    if departed {
        actions.push(GossipAction::Emit(MemberEvent::Join(snapshot)));
    } else if changed {
        actions.push(GossipAction::Emit(MemberEvent::Update(snapshot)));
    }
    actions.push(GossipAction::Broadcast(SwimMessage::Alive(alive.clone())));
    actions
}

/// Apply a suspicion.
pub fn apply_suspect(members: &MemberTable, local: &LocalNode, suspect: &Suspect) -> Vec<GossipAction> {
    if suspect.node == local.name.0 {
        if suspect.incarnation < local.incarnation() || local.is_leaving() {
            return Vec::new();
        }
        let incarnation = local.refute(suspect.incarnation);
        tracing::warn!(
            "refuting suspicion from {}, incarnation={}",
            suspect.from,
            incarnation
        );
        return vec![GossipAction::Broadcast(SwimMessage::Alive(local.alive()))];
    }

    let mut guard = members.write();
    let Some(member) = guard.get_mut(&NodeId::new(&suspect.node)) else {
        return Vec::new();
    };
    if suspect.incarnation < member.incarnation || member.state != MemberState::Alive {
        return Vec::new();
    }

    member.incarnation = suspect.incarnation;
    member.state = MemberState::Suspect;
    member.state_change = Instant::now();
    tracing::info!("member {} suspected by {}", suspect.node, suspect.from);

    vec![GossipAction::Broadcast(SwimMessage::Suspect(suspect.clone()))]
}

/// Apply a death declaration.
pub fn apply_dead(members: &MemberTable, local: &LocalNode, dead: &Dead) -> Vec<GossipAction> {
    if dead.node == local.name.0 {
        if local.is_leaving() || dead.incarnation < local.incarnation() {
            return Vec::new();
        }
        let incarnation = local.refute(dead.incarnation);
        tracing::warn!("refuting death from {}, incarnation={}", dead.from, incarnation);
        return vec![GossipAction::Broadcast(SwimMessage::Alive(local.alive()))];
    }

    let mut guard = members.write();
    let Some(member) = guard.get_mut(&NodeId::new(&dead.node)) else {
        return Vec::new();
    };
    if dead.incarnation < member.incarnation || member.state.is_departed() {
        return Vec::new();
    }

    member.incarnation = dead.incarnation;
    member.state = if dead.from == dead.node {
        MemberState::Left
    } else {
        MemberState::Dead
    };
    member.state_change = Instant::now();

    vec![
        GossipAction::Emit(MemberEvent::Leave(member.clone())),
        GossipAction::Broadcast(SwimMessage::Dead(dead.clone())),
    ]
}

/// Declare suspects dead once their suspicion timed out.
pub fn reap_suspects(members: &MemberTable, local: &LocalNode, timeout: Duration) -> Vec<GossipAction> {
    let expired: Vec<Dead> = members
        .read()
        .values()
        .filter(|m| m.state == MemberState::Suspect && m.state_change.elapsed() >= timeout)
        .map(|m| Dead {
            incarnation: m.incarnation,
            node: m.name.0.clone(),
            from: local.name.0.clone(),
        })
        .collect();

    expired
        .iter()
        .flat_map(|dead| apply_dead(members, local, dead))
        .collect()
}

/// Forget departed members after the reclaim period.
pub fn purge_departed(members: &MemberTable, reclaim: Duration) -> Vec<NodeId> {
    let mut guard = members.write();
    let purged: Vec<NodeId> = guard
        .values()
        .filter(|m| m.state.is_departed() && m.state_change.elapsed() >= reclaim)
        .map(|m| m.name.clone())
        .collect();
    for name in &purged {
        guard.remove(name);
    }
    purged
}

/// Merge the member list received through push-pull.
pub fn merge_remote_nodes(
    members: &MemberTable,
    local: &LocalNode,
    nodes: &[PushNode],
    reclaim: Duration,
) -> Vec<GossipAction> {
    let mut actions = Vec::new();
    for node in nodes {
        let alive = Alive {
            incarnation: node.incarnation,
            node: node.name.clone(),
            addr: node.addr,
            meta: node.meta.clone(),
        };
        match node.state {
            MemberState::Alive => actions.extend(apply_alive(members, local, &alive, reclaim)),
            MemberState::Suspect => {
                actions.extend(apply_alive(members, local, &alive, reclaim));
                actions.extend(apply_suspect(
                    members,
                    local,
                    &Suspect {
                        incarnation: node.incarnation,
                        node: node.name.clone(),
                        from: local.name.0.clone(),
                    },
                ));
            }
            // A remote verdict of death is only trusted as far as suspicion.
            MemberState::Dead => actions.extend(apply_suspect(
                members,
                local,
                &Suspect {
                    incarnation: node.incarnation,
                    node: node.name.clone(),
                    from: local.name.0.clone(),
                },
            )),
            MemberState::Left => actions.extend(apply_dead(
                members,
                local,
                &Dead {
                    incarnation: node.incarnation,
                    node: node.name.clone(),
                    from: node.name.clone(),
                },
            )),
        }
    }
    actions
}

/// Pure function to process a datagram message (Sans-IO pattern).
pub fn process_message(
    msg: &SwimMessage,
    members: &MemberTable,
    local: &LocalNode,
    reclaim: Duration,
) -> Vec<GossipAction> {
    match msg {
        SwimMessage::Ping { seq, from, target } => {
            if *target != local.name.0 {
                tracing::debug!("ignoring ping for {} from {}", target, from);
                return Vec::new();
            }
            vec![GossipAction::Send {
                to: NodeId::new(from),
                message: SwimMessage::Ack {
                    seq: *seq,
                    from: local.name.0.clone(),
                },
            }]
        }
        SwimMessage::IndirectPing { seq, from, target } => vec![GossipAction::ProbeFor {
            requester: NodeId::new(from),
            seq: *seq,
            target: NodeId::new(target),
        }],
        SwimMessage::Ack { seq, .. } => vec![GossipAction::AckReceived { seq: *seq }],
        SwimMessage::Alive(alive) => apply_alive(members, local, alive, reclaim),
        SwimMessage::Suspect(suspect) => apply_suspect(members, local, suspect),
        SwimMessage::Dead(dead) => apply_dead(members, local, dead),
        SwimMessage::User { id, payload } => vec![GossipAction::Deliver {
            id: *id,
            payload: payload.clone(),
        }],
        SwimMessage::Compound(messages) => messages
            .iter()
            .flat_map(|m| process_message(m, members, local, reclaim))
            .collect(),
    }
}

/// Pick up to `k` random members matching `filter`.
pub fn select_random_members(
    members: &MemberTable,
    k: usize,
    filter: impl Fn(&Member) -> bool,
) -> Vec<Member> {
    let mut candidates: Vec<Member> = members.read().values().filter(|m| filter(m)).cloned().collect();
    candidates.shuffle(&mut rand::thread_rng());
    candidates.truncate(k);
    candidates
}

/// Encode a datagram.
pub fn encode_packet(msg: &SwimMessage) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a datagram.
pub fn decode_packet(data: &[u8]) -> anyhow::Result<SwimMessage> {
    Ok(bincode::deserialize(data)?)
}

/// Encode a stream message with a 4-byte big-endian length prefix.
pub fn encode_frame(msg: &StreamMessage) -> anyhow::Result<Vec<u8>> {
    let data = bincode::serialize(msg)?;
    let len = data.len() as u32;

    let mut result = Vec::with_capacity(4 + data.len());
    result.extend_from_slice(&len.to_be_bytes());
    result.extend_from_slice(&data);

    Ok(result)
}

/// Decode a length from the first 4 bytes.
pub fn decode_length(buf: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*buf)
}

/// Read one length-prefixed stream message.
pub async fn read_frame<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> anyhow::Result<StreamMessage> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = decode_length(&len_buf);
    if len > MAX_STREAM_FRAME {
        anyhow::bail!("stream frame of {} bytes exceeds limit", len);
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}

/// Write one length-prefixed stream message.
pub async fn write_frame<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, msg: &StreamMessage) -> anyhow::Result<()> {
    let data = encode_frame(msg)?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

fn broadcast_key(msg: &SwimMessage) -> Option<NodeId> {
    match msg {
        SwimMessage::Alive(a) => Some(NodeId::new(&a.node)),
        SwimMessage::Suspect(s) => Some(NodeId::new(&s.node)),
        SwimMessage::Dead(d) => Some(NodeId::new(&d.node)),
        _ => None,
    }
}

// ==================== Broadcast Queue ====================

#[derive(Debug)]
struct QueuedBroadcast {
    id: u64,
    key: Option<NodeId>,
    message: SwimMessage,
    transmits: usize,
}

/// Retransmit-limited queue of piggybacked messages.
///
/// A membership message replaces any queued message about the same node.
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    items: Mutex<Vec<QueuedBroadcast>>,
    next_id: AtomicU64,
}

impl BroadcastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, message: SwimMessage) {
        let key = broadcast_key(&message);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.lock();
        if key.is_some() {
            items.retain(|b| b.key != key);
        }
        items.push(QueuedBroadcast {
            id,
            key,
            message,
            transmits: 0,
        });
    }

    /// Take up to `max` messages, least transmitted first.
    pub fn take(&self, max: usize, limit: usize) -> Vec<SwimMessage> {
        let mut items = self.items.lock();
        items.sort_by_key(|b| (b.transmits, b.id));

        let mut taken = Vec::new();
        for item in items.iter_mut().take(max) {
            item.transmits += 1;
            taken.push(item.message.clone());
        }
        items.retain(|b| b.transmits < limit);
        taken
    }

    pub fn contains_key(&self, key: &NodeId) -> bool {
        self.items.lock().iter().any(|b| b.key.as_ref() == Some(key))
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

// ==================== Runtime ====================

enum AckHandler {
    Local(oneshot::Sender<()>),
    Forward { requester: NodeId, seq: u32 },
}

#[derive(Default)]
struct SeenMessages {
    order: VecDeque<u64>,
    ids: HashSet<u64>,
}

impl SeenMessages {
    /// Returns true the first time an id is seen.
    fn insert(&mut self, id: u64) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_USER_MESSAGES {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }
}

/// Gossip engine bound to an [`HttpTransport`].
pub struct GossipEngine {
    config: ClusterConfig,
    local: LocalNode,
    members: MemberTable,
    broadcasts: BroadcastQueue,
    transport: Arc<HttpTransport>,
    delegate: Arc<dyn GossipDelegate>,
    seq: AtomicU32,
    ack_handlers: Mutex<HashMap<u32, AckHandler>>,
    seen: Mutex<SeenMessages>,
    shutdown: ShutdownController,
}

impl GossipEngine {
    /// Create the engine and start its background tasks.
    pub fn create(
        config: ClusterConfig,
        transport: Arc<HttpTransport>,
        packet_rx: mpsc::Receiver<Packet>,
        stream_rx: mpsc::Receiver<BoxedStream>,
        delegate: Arc<dyn GossipDelegate>,
    ) -> anyhow::Result<Arc<Self>> {
        let addr = transport.final_advertise_addr()?;
        let local = LocalNode::new(NodeId::new(&config.node_id), addr, delegate.node_meta());

        let engine = Arc::new(Self {
            config,
            local,
            members: RwLock::new(HashMap::new()),
            broadcasts: BroadcastQueue::new(),
            transport,
            delegate,
            seq: AtomicU32::new(0),
            ack_handlers: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenMessages::default()),
            shutdown: ShutdownController::new(),
        });

        engine.clone().start_packet_loop(packet_rx);
        engine.clone().start_stream_loop(stream_rx);
        engine.clone().start_probe_loop();
        engine.clone().start_gossip_loop();
        engine.clone().start_push_pull_loop();
        engine.clone().start_reap_loop();

        tracing::info!(
            "gossip engine started node_id={} advertise={}",
            engine.local.name,
            engine.local.addr
        );
        Ok(engine)
    }

    pub fn local_node(&self) -> &LocalNode {
        &self.local
    }

    /// Get all known members, including departed ones not yet purged.
    pub fn members(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    /// Get alive members only.
    pub fn alive_members(&self) -> Vec<Member> {
        self.members
            .read()
            .values()
            .filter(|m| m.state == MemberState::Alive)
            .cloned()
            .collect()
    }

    pub fn get_member(&self, name: &NodeId) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Queue a user broadcast for dissemination.
    pub fn queue_user_broadcast(&self, payload: Vec<u8>) {
        let id = rand::random::<u64>();
        self.seen.lock().insert(id);
        self.broadcasts.queue(SwimMessage::User { id, payload });
    }

    /// Join the cluster through the given members.
    ///
    /// Each target must already be routable by the transport. Returns the
    /// number of members contacted successfully.
    pub async fn join(self: &Arc<Self>, targets: &[NodeId]) -> anyhow::Result<usize> {
        let mut joined = 0;
        let mut errors = Vec::new();

        for target in targets {
            match self.push_pull(target, true).await {
                Ok(()) => {
                    tracing::info!("joined cluster through {}", target);
                    joined += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to join through {}: {:#}", target, e);
                    errors.push(format!("{}: {:#}", target, e));
                }
            }
        }

        if joined == 0 && !errors.is_empty() {
            anyhow::bail!("failed to join cluster: {}", errors.join("; "));
        }
        Ok(joined)
    }

    /// Announce a graceful leave and wait for it to be disseminated.
    pub async fn leave(&self, timeout: Duration) -> anyhow::Result<()> {
        if self.local.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.broadcasts.queue(SwimMessage::Dead(Dead {
            incarnation: self.local.incarnation(),
            node: self.local.name.0.clone(),
            from: self.local.name.0.clone(),
        }));

        if self.alive_members().is_empty() {
            return Ok(());
        }

        let drained = tokio::time::timeout(timeout, async {
            while self.broadcasts.contains_key(&self.local.name) {
                tokio::time::sleep(self.config.gossip_interval).await;
            }
        })
        .await;

        match drained {
            Ok(()) => Ok(()),
            Err(_) => Err(ClusterError::Timeout.into()),
        }
    }

    /// Stop all background tasks.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(ClusterError::NotRunning.into());
        }
        self.shutdown.shutdown();
        self.ack_handlers.lock().clear();
        self.broadcasts.clear();
        tracing::info!("gossip engine stopped");
        Ok(())
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    fn local_push_pull(&self, join: bool) -> StreamMessage {
        let mut nodes: Vec<PushNode> = self
            .members
            .read()
            .values()
            .map(|m| PushNode {
                name: m.name.0.clone(),
                addr: m.addr,
                meta: m.meta.clone(),
                incarnation: m.incarnation,
                state: m.state,
            })
            .collect();
        nodes.push(self.local.push_node());

        StreamMessage::PushPull {
            from: self.local.name.0.clone(),
            join,
            nodes,
            user_state: self.delegate.local_state(join),
        }
    }

    fn merge_push_pull(self: &Arc<Self>, nodes: &[PushNode], user_state: &[u8], join: bool) {
        let actions = merge_remote_nodes(&self.members, &self.local, nodes, self.config.dead_node_reclaim);
        self.execute(actions);
        self.delegate.merge_remote_state(user_state, join);
    }

    async fn push_pull(self: &Arc<Self>, target: &NodeId, join: bool) -> anyhow::Result<()> {
        let mut stream = self
            .transport
            .dial_timeout(target, self.config.stream_timeout)
            .await?;
        let request = self.local_push_pull(join);

        let exchange = async {
            write_frame(&mut stream, &request).await?;
            read_frame(&mut stream).await
        };
        let reply = match tokio::time::timeout(self.config.stream_timeout, exchange).await {
            Ok(reply) => reply?,
            Err(_) => return Err(ClusterError::Timeout.into()),
        };

        let StreamMessage::PushPull { nodes, user_state, .. } = reply;
        self.merge_push_pull(&nodes, &user_state, join);
        Ok(())
    }

    async fn handle_stream(self: Arc<Self>, mut stream: BoxedStream) -> anyhow::Result<()> {
        let timeout = self.config.stream_timeout;
        let request = match tokio::time::timeout(timeout, read_frame(&mut stream)).await {
            Ok(request) => request?,
            Err(_) => return Err(ClusterError::Timeout.into()),
        };

        let StreamMessage::PushPull {
            from,
            join,
            nodes,
            user_state,
        } = request;
        tracing::debug!("push-pull from {} join={}", from, join);

        let reply = self.local_push_pull(join);
        match tokio::time::timeout(timeout, write_frame(&mut stream, &reply)).await {
            Ok(result) => result?,
            Err(_) => return Err(ClusterError::Timeout.into()),
        }

        self.merge_push_pull(&nodes, &user_state, join);
        Ok(())
    }

    async fn send_message(&self, to: &NodeId, message: &SwimMessage) -> anyhow::Result<()> {
        let data = encode_packet(message)?;
        self.transport.write_to(&data, to).await?;
        Ok(())
    }

    fn spawn_send(self: &Arc<Self>, to: NodeId, message: SwimMessage) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.send_message(&to, &message).await {
                tracing::debug!("gossip send to {} failed: {:#}", to, e);
            }
        });
    }

    /// Perform the actions produced by message processing.
    fn execute(self: &Arc<Self>, actions: Vec<GossipAction>) {
        for action in actions {
            match action {
                GossipAction::Send { to, message } => self.spawn_send(to, message),
                GossipAction::Broadcast(message) => self.broadcasts.queue(message),
                GossipAction::Emit(event) => self.emit(event),
                GossipAction::Deliver { id, payload } => {
                    if self.seen.lock().insert(id) {
                        self.delegate.notify_msg(&payload);
                    }
                }
                GossipAction::AckReceived { seq } => {
                    let handler = self.ack_handlers.lock().remove(&seq);
                    match handler {
                        Some(AckHandler::Local(tx)) => {
                            let _ = tx.send(());
                        }
                        Some(AckHandler::Forward { requester, seq }) => {
                            let ack = SwimMessage::Ack {
                                seq,
                                from: self.local.name.0.clone(),
                            };
                            self.spawn_send(requester, ack);
                        }
                        None => {}
                    }
                }
                GossipAction::ProbeFor {
                    requester,
                    seq,
                    target,
                } => self.probe_for(requester, seq, target),
            }
        }
    }

    fn emit(&self, event: MemberEvent) {
        match &event {
            MemberEvent::Join(member) => {
                tracing::info!("member joined: {} ({})", member.name, member.addr);
                self.delegate.notify_join(member);
            }
            MemberEvent::Leave(member) => {
                tracing::info!("member left: {} ({:?})", member.name, member.state);
                self.delegate.notify_leave(member);
            }
            MemberEvent::Update(member) => {
                tracing::info!("member updated: {}", member.name);
                self.delegate.notify_update(member);
            }
        }
    }

    fn probe_for(self: &Arc<Self>, requester: NodeId, seq: u32, target: NodeId) {
        let local_seq = self.next_seq();
        self.ack_handlers
            .lock()
            .insert(local_seq, AckHandler::Forward { requester, seq });

        let engine = self.clone();
        tokio::spawn(async move {
            let ping = SwimMessage::Ping {
                seq: local_seq,
                from: engine.local.name.0.clone(),
                target: target.0.clone(),
            };
            if let Err(e) = engine.send_message(&target, &ping).await {
                tracing::debug!("indirect ping to {} failed: {:#}", target, e);
            }
            tokio::time::sleep(engine.config.probe_timeout).await;
            engine.ack_handlers.lock().remove(&local_seq);
        });
    }

    /// Run one failure-detection round.
    async fn probe_once(self: &Arc<Self>) {
        let Some(target) = select_random_members(&self.members, 1, |m| {
            matches!(m.state, MemberState::Alive | MemberState::Suspect)
        })
        .pop() else {
            return;
        };

        let seq = self.next_seq();
        let (tx, mut rx) = oneshot::channel();
        self.ack_handlers.lock().insert(seq, AckHandler::Local(tx));

        let ping = SwimMessage::Ping {
            seq,
            from: self.local.name.0.clone(),
            target: target.name.0.clone(),
        };
        if let Err(e) = self.send_message(&target.name, &ping).await {
            tracing::debug!("ping to {} failed: {:#}", target.name, e);
        }

        let mut acked = matches!(
            tokio::time::timeout(self.config.probe_timeout, &mut rx).await,
            Ok(Ok(()))
        );

        if !acked {
            let helpers = select_random_members(&self.members, self.config.indirect_checks, |m| {
                m.state == MemberState::Alive && m.name != target.name
            });
            for helper in helpers {
                let request = SwimMessage::IndirectPing {
                    seq,
                    from: self.local.name.0.clone(),
                    target: target.name.0.clone(),
                };
                self.spawn_send(helper.name, request);
            }

            let remaining = self
                .config
                .probe_interval
                .saturating_sub(self.config.probe_timeout);
            acked = matches!(tokio::time::timeout(remaining, &mut rx).await, Ok(Ok(())));
        }

        self.ack_handlers.lock().remove(&seq);

        if !acked {
            let suspect = Suspect {
                incarnation: target.incarnation,
                node: target.name.0.clone(),
                from: self.local.name.0.clone(),
            };
            let actions = apply_suspect(&self.members, &self.local, &suspect);
            self.execute(actions);
        }
    }

    /// Send pending broadcasts to random members.
    fn gossip_once(self: &Arc<Self>) {
        let targets = select_random_members(&self.members, self.config.gossip_nodes, |m| {
            matches!(m.state, MemberState::Alive | MemberState::Suspect)
        });
        if targets.is_empty() {
            return;
        }

        let limit = retransmit_limit(self.config.retransmit_mult, self.members.read().len() + 1);
        for target in targets {
            let messages = self.broadcasts.take(MAX_BROADCASTS_PER_PACKET, limit);
            if messages.is_empty() {
                break;
            }
            self.spawn_send(target.name, SwimMessage::Compound(messages));
        }
    }

    fn reap_once(self: &Arc<Self>) {
        let timeout = suspicion_timeout(
            self.config.suspicion_mult,
            self.members.read().len() + 1,
            self.config.probe_interval,
        );
        let actions = reap_suspects(&self.members, &self.local, timeout);
        self.execute(actions);

        for name in purge_departed(&self.members, self.config.dead_node_reclaim) {
            tracing::debug!("purged departed member {}", name);
        }
    }

    async fn handle_packet(self: &Arc<Self>, packet: Packet) {
        match decode_packet(&packet.buf) {
            Ok(msg) => {
                let actions = process_message(&msg, &self.members, &self.local, self.config.dead_node_reclaim);
                self.execute(actions);
            }
            Err(e) => {
                tracing::warn!("dropping malformed gossip packet from {}: {}", packet.from, e);
            }
        }
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_packet_loop(self: Arc<Self>, mut packet_rx: mpsc::Receiver<Packet>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    packet = packet_rx.recv() => match packet {
                        Some(packet) => self.handle_packet(packet).await,
                        None => break,
                    },
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_stream_loop(self: Arc<Self>, mut stream_rx: mpsc::Receiver<BoxedStream>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    stream = stream_rx.recv() => match stream {
                        Some(stream) => {
                            let engine = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = engine.handle_stream(stream).await {
                                    tracing::warn!("push-pull stream failed: {:#}", e);
                                }
                            });
                        }
                        None => break,
                    },
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_probe_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.probe_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = timer.tick() => self.probe_once().await,
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_gossip_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.gossip_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = timer.tick() => self.gossip_once(),
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_push_pull_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.push_pull_interval);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = timer.tick() => {
                        let target = select_random_members(&self.members, 1, |m| m.state == MemberState::Alive).pop();
                        if let Some(target) = target {
                            if let Err(e) = self.push_pull(&target.name, false).await {
                                tracing::debug!("push-pull with {} failed: {:#}", target.name, e);
                            }
                        }
                    }
                }
            }
        });
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn start_reap_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.config.probe_interval);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = timer.tick() => self.reap_once(),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> LocalNode {
        LocalNode::new(NodeId::new(name), "127.0.0.1:9113".parse().unwrap(), b"http://127.0.0.1:9113".to_vec())
    }

    fn alive(node: &str, incarnation: u64, meta: &str) -> Alive {
        Alive {
            incarnation,
            node: node.to_string(),
            addr: "10.0.0.2:9113".parse().unwrap(),
            meta: meta.as_bytes().to_vec(),
        }
    }

    fn table() -> MemberTable {
        RwLock::new(HashMap::new())
    }

    const RECLAIM: Duration = Duration::from_secs(30);

    fn has_event(actions: &[GossipAction], f: impl Fn(&MemberEvent) -> bool) -> bool {
        actions.iter().any(|a| matches!(a, GossipAction::Emit(e) if f(e)))
    }

    #[test]
    fn test_alive_new_member_emits_join() {
        let members = table();
        let me = local("node-a");

        let actions = apply_alive(&members, &me, &alive("node-b", 0, "http://10.0.0.2:9113"), RECLAIM);

        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Join(m) if m.name.as_str() == "node-b")));
        assert!(actions.iter().any(|a| matches!(a, GossipAction::Broadcast(SwimMessage::Alive(_)))));
        assert_eq!(members.read().len(), 1);
    }

    #[test]
    fn test_alive_stale_incarnation_ignored() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 3, "m"), RECLAIM);

        let actions = apply_alive(&members, &me, &alive("node-b", 2, "other"), RECLAIM);
        assert!(actions.is_empty());
        assert_eq!(members.read()[&NodeId::new("node-b")].meta, b"m".to_vec());
    }

    #[test]
    fn test_alive_meta_change_emits_update() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "http://10.0.0.2:9113"), RECLAIM);

        let actions = apply_alive(&members, &me, &alive("node-b", 2, "http://10.0.0.9:9113"), RECLAIM);
        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Update(_))));
    }

    #[test]
    fn test_alive_about_self_with_higher_incarnation_refutes() {
        let members = table();
        let me = local("node-a");

        let actions = apply_alive(&members, &me, &alive("node-a", 5, "x"), RECLAIM);
        assert_eq!(me.incarnation(), 6);
        assert!(matches!(&actions[0], GossipAction::Broadcast(SwimMessage::Alive(a)) if a.incarnation == 6));
        assert!(members.read().is_empty());
    }

    #[test]
    fn test_suspect_then_refute_by_alive() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);

        let suspect = Suspect { incarnation: 1, node: "node-b".into(), from: "node-a".into() };
        let actions = apply_suspect(&members, &me, &suspect);
        assert_eq!(actions.len(), 1);
        assert_eq!(members.read()[&NodeId::new("node-b")].state, MemberState::Suspect);

        // same incarnation does not clear suspicion
        assert!(apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM).is_empty());

        let actions = apply_alive(&members, &me, &alive("node-b", 2, "m"), RECLAIM);
        assert!(!actions.is_empty());
        assert_eq!(members.read()[&NodeId::new("node-b")].state, MemberState::Alive);
    }

    #[test]
    fn test_suspect_about_self_refutes() {
        let members = table();
        let me = local("node-a");

        let suspect = Suspect { incarnation: 0, node: "node-a".into(), from: "node-c".into() };
        let actions = apply_suspect(&members, &me, &suspect);
        assert_eq!(me.incarnation(), 1);
        assert!(matches!(&actions[0], GossipAction::Broadcast(SwimMessage::Alive(a)) if a.incarnation == 1));
    }

    #[test]
    fn test_dead_emits_leave_once() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);

        let dead = Dead { incarnation: 1, node: "node-b".into(), from: "node-c".into() };
        let actions = apply_dead(&members, &me, &dead);
        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Leave(m) if m.state == MemberState::Dead)));
        assert!(apply_dead(&members, &me, &dead).is_empty());
    }

    #[test]
    fn test_graceful_leave_marks_left() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);

        let dead = Dead { incarnation: 1, node: "node-b".into(), from: "node-b".into() };
        apply_dead(&members, &me, &dead);
        assert_eq!(members.read()[&NodeId::new("node-b")].state, MemberState::Left);
    }

    #[test]
    fn test_dead_node_rejoins_with_higher_incarnation() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);
        apply_dead(&members, &me, &Dead { incarnation: 1, node: "node-b".into(), from: "node-b".into() });

        let actions = apply_alive(&members, &me, &alive("node-b", 2, "m"), RECLAIM);
        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Join(_))));
    }

    #[test]
    fn test_dead_about_self_ignored_while_leaving() {
        let members = table();
        let me = local("node-a");
        me.leaving.store(true, Ordering::SeqCst);

        let dead = Dead { incarnation: 0, node: "node-a".into(), from: "node-a".into() };
        assert!(apply_dead(&members, &me, &dead).is_empty());
        assert_eq!(me.incarnation(), 0);
    }

    #[test]
    fn test_reap_suspects_after_timeout() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);
        apply_suspect(&members, &me, &Suspect { incarnation: 1, node: "node-b".into(), from: "node-a".into() });

        assert!(reap_suspects(&members, &me, Duration::from_secs(60)).is_empty());

        let actions = reap_suspects(&members, &me, Duration::ZERO);
        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Leave(_))));
        assert_eq!(members.read()[&NodeId::new("node-b")].state, MemberState::Dead);
    }

    #[test]
    fn test_purge_departed() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);
        apply_alive(&members, &me, &alive("node-c", 1, "m"), RECLAIM);
        apply_dead(&members, &me, &Dead { incarnation: 1, node: "node-b".into(), from: "node-b".into() });

        let purged = purge_departed(&members, Duration::ZERO);
        assert_eq!(purged, vec![NodeId::new("node-b")]);
        assert_eq!(members.read().len(), 1);
    }

    #[test]
    fn test_process_ping_for_self_acks() {
        let members = table();
        let me = local("node-a");

        let ping = SwimMessage::Ping { seq: 7, from: "node-b".into(), target: "node-a".into() };
        let actions = process_message(&ping, &members, &me, RECLAIM);
        assert_eq!(
            actions,
            vec![GossipAction::Send {
                to: NodeId::new("node-b"),
                message: SwimMessage::Ack { seq: 7, from: "node-a".into() },
            }]
        );
    }

    #[test]
    fn test_process_ping_for_other_node_ignored() {
        let members = table();
        let me = local("node-a");
        let ping = SwimMessage::Ping { seq: 7, from: "node-b".into(), target: "node-z".into() };
        assert!(process_message(&ping, &members, &me, RECLAIM).is_empty());
    }

    #[test]
    fn test_process_compound() {
        let members = table();
        let me = local("node-a");
        let msg = SwimMessage::Compound(vec![
            SwimMessage::Alive(alive("node-b", 0, "m")),
            SwimMessage::User { id: 1, payload: b"\x01".to_vec() },
            SwimMessage::Ack { seq: 3, from: "node-b".into() },
        ]);

        let actions = process_message(&msg, &members, &me, RECLAIM);
        assert!(actions.contains(&GossipAction::AckReceived { seq: 3 }));
        assert!(actions.contains(&GossipAction::Deliver { id: 1, payload: b"\x01".to_vec() }));
        assert!(has_event(&actions, |e| matches!(e, MemberEvent::Join(_))));
    }

    #[test]
    fn test_merge_remote_dead_becomes_suspect() {
        let members = table();
        let me = local("node-a");
        apply_alive(&members, &me, &alive("node-b", 1, "m"), RECLAIM);

        let nodes = vec![PushNode {
            name: "node-b".into(),
            addr: "10.0.0.2:9113".parse().unwrap(),
            meta: b"m".to_vec(),
            incarnation: 1,
            state: MemberState::Dead,
        }];
        merge_remote_nodes(&members, &me, &nodes, RECLAIM);
        assert_eq!(members.read()[&NodeId::new("node-b")].state, MemberState::Suspect);
    }

    #[test]
    fn test_merge_remote_skips_self_entry() {
        let members = table();
        let me = local("node-a");
        let nodes = vec![me.push_node()];
        assert!(merge_remote_nodes(&members, &me, &nodes, RECLAIM).is_empty());
        assert!(members.read().is_empty());
    }

    #[test]
    fn test_broadcast_queue_replaces_same_node() {
        let queue = BroadcastQueue::new();
        queue.queue(SwimMessage::Alive(alive("node-b", 1, "m")));
        queue.queue(SwimMessage::Suspect(Suspect { incarnation: 1, node: "node-b".into(), from: "x".into() }));
        queue.queue(SwimMessage::User { id: 1, payload: vec![1] });
        queue.queue(SwimMessage::User { id: 2, payload: vec![1] });

        assert_eq!(queue.len(), 3);
        assert!(queue.contains_key(&NodeId::new("node-b")));
    }

    #[test]
    fn test_broadcast_queue_retransmit_limit() {
        let queue = BroadcastQueue::new();
        queue.queue(SwimMessage::User { id: 1, payload: vec![1] });

        assert_eq!(queue.take(16, 2).len(), 1);
        assert_eq!(queue.take(16, 2).len(), 1);
        assert!(queue.take(16, 2).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_broadcast_queue_prefers_fresh_messages() {
        let queue = BroadcastQueue::new();
        queue.queue(SwimMessage::User { id: 1, payload: vec![1] });
        queue.take(1, 10);
        queue.queue(SwimMessage::User { id: 2, payload: vec![2] });

        let taken = queue.take(1, 10);
        assert_eq!(taken, vec![SwimMessage::User { id: 2, payload: vec![2] }]);
    }

    #[test]
    fn test_suspicion_timeout_scales() {
        let interval = Duration::from_secs(1);
        assert_eq!(suspicion_timeout(4, 1, interval), Duration::from_secs(4));
        assert_eq!(suspicion_timeout(4, 10, interval), Duration::from_secs(4));
        assert_eq!(suspicion_timeout(4, 100, interval), Duration::from_secs(8));
    }

    #[test]
    fn test_retransmit_limit() {
        assert_eq!(retransmit_limit(4, 0), 1);
        assert_eq!(retransmit_limit(4, 2), 4);
        assert_eq!(retransmit_limit(4, 10), 8);
    }

    #[test]
    fn test_seen_messages_bounded() {
        let mut seen = SeenMessages::default();
        assert!(seen.insert(1));
        assert!(!seen.insert(1));
        for id in 2..(SEEN_USER_MESSAGES as u64 + 10) {
            seen.insert(id);
        }
        assert!(seen.order.len() <= SEEN_USER_MESSAGES);
        assert!(seen.insert(1));
    }

    #[test]
    fn test_packet_codec() {
        let msg = SwimMessage::Compound(vec![
            SwimMessage::Ping { seq: 1, from: "a".into(), target: "b".into() },
            SwimMessage::Dead(Dead { incarnation: 2, node: "c".into(), from: "a".into() }),
        ]);
        let data = encode_packet(&msg).unwrap();
        assert_eq!(decode_packet(&data).unwrap(), msg);
        assert!(decode_packet(&[0xff, 0xff]).is_err());
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = StreamMessage::PushPull {
            from: "node-a".into(),
            join: true,
            nodes: vec![local("node-a").push_node()],
            user_state: b"{}".to_vec(),
        };

        write_frame(&mut a, &msg).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_frame_rejects_oversized_length() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }
}
