use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::node::{Node, NodeId, NodeInfo, NodeState, Prefix};
use crate::constants::{K, NUM_BUCKETS};

/// Answers whether a node is still alive, typically by pinging it.
///
/// The routing table asks this before evicting a questionable node in favour
/// of a new one.
pub trait LivenessProbe {
    fn probe(&self, node: NodeInfo) -> impl Future<Output = bool> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The node took a free slot.
    Added,
    /// The node was already present; its address and activity were updated.
    Refreshed,
    /// The node replaced a bad or unresponsive member.
    Replaced(NodeId),
    /// The bucket is full of nodes that are still good.
    Rejected,
    /// Our own id is never stored.
    Ignored,
}

impl InsertOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(
            self,
            InsertOutcome::Added | InsertOutcome::Refreshed | InsertOutcome::Replaced(_)
        )
    }
}

enum Placement {
    Done(InsertOutcome),
    Full { questionable: Vec<NodeInfo> },
}

#[derive(Debug)]
struct Bucket {
    prefix: Prefix,
    nodes: Vec<Node>,
    last_changed: Instant,
}

impl Bucket {
    fn new(prefix: Prefix, k: usize) -> Self {
        Self {
            prefix,
            nodes: Vec::with_capacity(k),
            last_changed: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| &n.id == id)
    }

    fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    fn push(&mut self, node: Node) {
        self.nodes.push(node);
        self.last_changed = Instant::now();
    }

    fn replace(&mut self, pos: usize, node: Node) -> NodeId {
        let old = std::mem::replace(&mut self.nodes[pos], node);
        self.last_changed = Instant::now();
        old.id
    }
}

/// The Kademlia routing table: one bucket per shared-prefix length with the
/// local id.
///
/// Bucket `i` holds nodes whose ids share exactly `i` leading bits with ours,
/// so bucket 0 covers half the id space and bucket 159 a single id. Each
/// bucket has its own lock; no lock is held across an await.
pub struct RoutingTable {
    our_id: NodeId,
    k: usize,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        Self::with_capacity(our_id, K)
    }

    pub fn with_capacity(our_id: NodeId, k: usize) -> Self {
        let buckets = (0..NUM_BUCKETS)
            .map(|i| RwLock::new(Bucket::new(Self::prefix_for(&our_id, i), k)))
            .collect();

        Self { our_id, k, buckets }
    }

    fn prefix_for(our_id: &NodeId, index: usize) -> Prefix {
        let mut bits = our_id.0;
        bits[index / 8] ^= 0x80 >> (index % 8);
        NodeId(bits).prefix(index + 1)
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    pub fn capacity(&self) -> usize {
        self.k
    }

    /// Bucket for `id`, or `None` for our own id.
    pub fn bucket_index(&self, id: &NodeId) -> Option<usize> {
        let shared = self.our_id.shared_prefix_bits(id);
        (shared < NUM_BUCKETS).then_some(shared)
    }

    pub fn bucket_prefix(&self, index: usize) -> Prefix {
        self.buckets[index].read().prefix
    }

    pub fn bucket_len(&self, index: usize) -> usize {
        self.buckets[index].read().nodes.len()
    }

    fn place(&self, node: Node) -> Placement {
        let Some(idx) = self.bucket_index(&node.id) else {
            return Placement::Done(InsertOutcome::Ignored);
        };
        let mut bucket = self.buckets[idx].write();

        if let Some(existing) = bucket.get_mut(&node.id) {
            existing.addr = node.addr;
            if node.last_activity.is_some() {
                existing.touch();
            }
            return Placement::Done(InsertOutcome::Refreshed);
        }

        if bucket.nodes.len() < self.k {
            bucket.push(node);
            return Placement::Done(InsertOutcome::Added);
        }

        let now = Instant::now();
        if let Some(pos) = bucket
            .nodes
            .iter()
            .position(|n| n.state_at(now) == NodeState::Bad)
        {
            let evicted = bucket.replace(pos, node);
            return Placement::Done(InsertOutcome::Replaced(evicted));
        }

        let questionable: Vec<NodeInfo> = bucket
            .nodes
            .iter()
            .filter(|n| n.state_at(now) == NodeState::Questionable)
            .map(Node::info)
            .collect();

        if questionable.is_empty() {
            Placement::Done(InsertOutcome::Rejected)
        } else {
            Placement::Full { questionable }
        }
    }

    /// Inserts without probing anyone: a full bucket only gives way to a new
    /// node if it holds a bad member.
    pub fn observe(&self, node: Node) -> InsertOutcome {
        match self.place(node) {
            Placement::Done(outcome) => outcome,
            Placement::Full { .. } => InsertOutcome::Rejected,
        }
    }

    /// Inserts a node, evicting a bad member, or else the first questionable
    /// member that fails a liveness probe. Good members are never evicted.
    pub async fn insert<P: LivenessProbe + Sync>(&self, node: Node, probe: &P) -> InsertOutcome {
        let questionable = match self.place(node.clone()) {
            Placement::Done(outcome) => return outcome,
            Placement::Full { questionable } => questionable,
        };

        for candidate in questionable {
            if probe.probe(candidate).await {
                self.mark_seen(&candidate.id);
                continue;
            }
            self.mark_failed(&candidate.id);

            let Some(idx) = self.bucket_index(&node.id) else {
                return InsertOutcome::Ignored;
            };
            let mut bucket = self.buckets[idx].write();
            if bucket.position(&node.id).is_some() {
                return InsertOutcome::Refreshed;
            }
            if let Some(pos) = bucket.position(&candidate.id) {
                let evicted = bucket.replace(pos, node);
                return InsertOutcome::Replaced(evicted);
            }
            if bucket.nodes.len() < self.k {
                bucket.push(node);
                return InsertOutcome::Added;
            }
        }

        InsertOutcome::Rejected
    }

    pub fn remove(&self, id: &NodeId) -> Option<Node> {
        let idx = self.bucket_index(id)?;
        let mut bucket = self.buckets[idx].write();
        let pos = bucket.position(id)?;
        Some(bucket.nodes.remove(pos))
    }

    pub fn mark_failed(&self, id: &NodeId) {
        let Some(idx) = self.bucket_index(id) else {
            return;
        };
        if let Some(node) = self.buckets[idx].write().get_mut(id) {
            node.fail();
        }
    }

    pub fn mark_seen(&self, id: &NodeId) {
        let Some(idx) = self.bucket_index(id) else {
            return;
        };
        let mut bucket = self.buckets[idx].write();
        if let Some(node) = bucket.get_mut(id) {
            node.touch();
            bucket.last_changed = Instant::now();
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<Node> {
        let idx = self.bucket_index(id)?;
        let bucket = self.buckets[idx].read();
        bucket.nodes.iter().find(|n| &n.id == id).cloned()
    }

    /// Up to `limit` stored nodes, closest to `target` first.
    pub fn closest_nodes(&self, target: &NodeId, limit: usize) -> Vec<NodeInfo> {
        self.closest_matching(target, limit, |_| true)
    }

    /// Like [`RoutingTable::closest_nodes`], but leaves out bad nodes. This is
    /// what we hand to other nodes.
    pub fn closest_live_nodes(&self, target: &NodeId, limit: usize) -> Vec<NodeInfo> {
        let now = Instant::now();
        self.closest_matching(target, limit, |n| n.state_at(now) != NodeState::Bad)
    }

    fn closest_matching(
        &self,
        target: &NodeId,
        limit: usize,
        keep: impl Fn(&Node) -> bool,
    ) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            nodes.extend(bucket.nodes.iter().filter(|n| keep(n)).map(Node::info));
        }

        nodes.sort_by_key(|n| n.id.distance(target));
        nodes.truncate(limit);
        nodes
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend(bucket.read().nodes.iter().cloned());
        }
        nodes
    }

    /// The empty buckets closer to us than the deepest populated bucket.
    ///
    /// Scans from bucket 159 downwards and stops at the first populated one.
    /// A lookup for our own id converges on the populated region and never
    /// asks for ids in these ranges, so they have to be refreshed explicitly.
    pub fn empty_buckets_farther_than_non_empty(&self) -> Vec<usize> {
        let mut empty = Vec::new();
        for idx in (0..NUM_BUCKETS).rev() {
            if self.buckets[idx].read().nodes.is_empty() {
                empty.push(idx);
            } else {
                return empty;
            }
        }
        Vec::new()
    }

    /// Populated buckets that have not changed for `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                let bucket = bucket.read();
                !bucket.nodes.is_empty() && bucket.last_changed.elapsed() > threshold
            })
            .map(|(i, _)| i)
            .collect()
    }
}
