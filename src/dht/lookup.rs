//! Iterative parallel lookups.
//!
//! [`Lookup`] drives the Kademlia search: each round it queries the
//! `alpha` closest unqueried candidates concurrently, merges the nodes they
//! return, and stops once the result stops improving. What is asked and
//! what is collected is delegated to a [`LookupStrategy`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, trace};

use super::message::{InfoHash, Query, Response};
use super::node::{Distance, Node, NodeId, NodeInfo};
use super::routing::RoutingTable;
use super::transport::Transport;

/// What a lookup asks and how it digests the answers.
pub trait LookupStrategy {
    type Output;

    fn query(&self) -> Query;

    /// Nodes in `response` worth querying next.
    fn extract_candidates(&self, response: &Response) -> Vec<NodeInfo>;

    /// Folds a response into the result.
    fn accumulate(&mut self, responder: NodeInfo, response: Response);

    /// Builds the result from the closest responders, best first.
    fn finish(self, closest: Vec<NodeInfo>) -> Self::Output;
}

/// find_node: the result is the closest nodes that answered.
#[derive(Debug, Clone)]
pub struct FindNode {
    target: NodeId,
}

impl FindNode {
    pub fn new(target: NodeId) -> Self {
        Self { target }
    }
}

impl LookupStrategy for FindNode {
    type Output = Vec<NodeInfo>;

    fn query(&self) -> Query {
        Query::FindNode {
            target: self.target,
        }
    }

    fn extract_candidates(&self, response: &Response) -> Vec<NodeInfo> {
        match response {
            Response::FindNode { nodes, .. } => nodes.clone(),
            _ => Vec::new(),
        }
    }

    fn accumulate(&mut self, _responder: NodeInfo, _response: Response) {}

    fn finish(self, closest: Vec<NodeInfo>) -> Vec<NodeInfo> {
        closest
    }
}

/// Result of a get_peers lookup.
#[derive(Debug, Clone, Default)]
pub struct GetPeersOutcome {
    /// Distinct peers, in the order they were discovered.
    pub peers: Vec<SocketAddr>,
    /// Announce token of every responder that issued one. A token is only
    /// valid for the node that issued it.
    pub tokens: HashMap<NodeInfo, Bytes>,
    /// The closest nodes that answered.
    pub closest: Vec<NodeInfo>,
}

/// get_peers: collects peers and the per-node announce tokens.
#[derive(Debug, Clone)]
pub struct GetPeers {
    info_hash: InfoHash,
    seen: HashSet<SocketAddr>,
    outcome: GetPeersOutcome,
}

impl GetPeers {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            seen: HashSet::new(),
            outcome: GetPeersOutcome::default(),
        }
    }
}

impl LookupStrategy for GetPeers {
    type Output = GetPeersOutcome;

    fn query(&self) -> Query {
        Query::GetPeers {
            info_hash: self.info_hash,
        }
    }

    fn extract_candidates(&self, response: &Response) -> Vec<NodeInfo> {
        match response {
            Response::GetPeers {
                nodes: Some(nodes), ..
            } => nodes.clone(),
            _ => Vec::new(),
        }
    }

    fn accumulate(&mut self, responder: NodeInfo, response: Response) {
        if let Response::GetPeers { token, peers, .. } = response {
            if !token.is_empty() {
                self.outcome.tokens.insert(responder, token);
            }
            for peer in peers.into_iter().flatten() {
                if self.seen.insert(peer) {
                    self.outcome.peers.push(peer);
                }
            }
        }
    }

    fn finish(mut self, closest: Vec<NodeInfo>) -> GetPeersOutcome {
        self.outcome.closest = closest;
        self.outcome
    }
}

/// A finished lookup.
#[derive(Debug, Clone)]
pub struct LookupOutcome<T> {
    pub result: T,
    pub rounds: usize,
    pub queried: usize,
    pub responded: usize,
}

/// One lookup invocation: the search state plus what it runs against.
pub struct Lookup<'a, S> {
    target: NodeId,
    strategy: S,
    routing: &'a RoutingTable,
    transport: &'a Transport,
    k: usize,
    alpha: usize,
    max_rounds: usize,
    queried: HashSet<NodeId>,
    candidates: BTreeMap<Distance, NodeInfo>,
    accepted: BTreeMap<Distance, NodeInfo>,
}

impl<'a, S: LookupStrategy> Lookup<'a, S> {
    pub fn new(
        target: NodeId,
        strategy: S,
        routing: &'a RoutingTable,
        transport: &'a Transport,
    ) -> Self {
        let config = &transport.context().config;
        Self {
            target,
            strategy,
            routing,
            transport,
            k: routing.capacity().max(1),
            alpha: config.alpha,
            max_rounds: config.max_rounds,
            queried: HashSet::new(),
            candidates: BTreeMap::new(),
            accepted: BTreeMap::new(),
        }
    }

    /// Seeds the lookup with the closest nodes from the routing table.
    pub fn seeded_from_table(self) -> Self {
        let seeds = self.routing.closest_nodes(&self.target, self.k);
        self.with_seeds(seeds)
    }

    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = NodeInfo>) -> Self {
        for node in seeds {
            self.add_candidate(node);
        }
        self
    }

    fn add_candidate(&mut self, node: NodeInfo) {
        if node.id == *self.transport.local_id() || self.queried.contains(&node.id) {
            return;
        }
        self.candidates
            .entry(node.id.distance(&self.target))
            .or_insert(node);
    }

    fn best_accepted(&self) -> Option<Distance> {
        self.accepted.keys().next().copied()
    }

    /// True once every remaining candidate is farther than the k-th closest
    /// responder, so querying them cannot improve the result.
    fn frontier_exhausted(&self) -> bool {
        if self.accepted.len() < self.k {
            return false;
        }
        let kth = self.accepted.keys().nth(self.k - 1);
        match (self.candidates.keys().next(), kth) {
            (Some(closest), Some(kth)) => closest > kth,
            _ => true,
        }
    }

    fn next_batch(&mut self) -> Vec<NodeInfo> {
        let mut batch = Vec::with_capacity(self.alpha);
        while batch.len() < self.alpha {
            let Some((_, node)) = self.candidates.pop_first() else {
                break;
            };
            self.queried.insert(node.id);
            batch.push(node);
        }
        batch
    }

    pub async fn run(mut self) -> LookupOutcome<S::Output> {
        let transport = self.transport;
        let routing = self.routing;
        let query = self.strategy.query();
        let mut rounds = 0;
        let mut responded = 0;

        loop {
            if transport.is_closed() {
                debug!(lookup = %self.target, "lookup interrupted by shutdown");
                break;
            }
            if rounds >= self.max_rounds || self.frontier_exhausted() {
                break;
            }

            let batch = self.next_batch();
            if batch.is_empty() {
                break;
            }
            rounds += 1;
            let best_before = self.best_accepted();

            let results = join_all(batch.into_iter().map(|node| {
                let query = query.clone();
                async move { (node, transport.send_query(node.addr, query).await) }
            }))
            .await;

            for (node, result) in results {
                match result {
                    Ok(response) => {
                        let responder = NodeInfo::new(response.id(), node.addr);
                        if responder.id == *transport.local_id() {
                            trace!(node = %node, "ignoring response carrying our own id");
                            continue;
                        }
                        responded += 1;
                        if responder.id != node.id {
                            self.queried.insert(responder.id);
                            self.candidates.remove(&responder.id.distance(&self.target));
                        }
                        routing.observe(Node::new(responder));

                        for candidate in self.strategy.extract_candidates(&response) {
                            self.add_candidate(candidate);
                        }
                        self.strategy.accumulate(responder, response);
                        self.accepted
                            .insert(responder.id.distance(&self.target), responder);
                    }
                    Err(e) => {
                        trace!(node = %node, "lookup query failed: {}", e);
                        if e.is_node_failure() {
                            routing.mark_failed(&node.id);
                        }
                    }
                }
            }

            let improved = match (best_before, self.best_accepted()) {
                (None, Some(_)) => true,
                (Some(before), Some(after)) => after < before,
                _ => false,
            };
            if !improved && self.accepted.len() >= self.k {
                break;
            }
        }

        debug!(
            lookup = %self.target,
            rounds,
            queried = self.queried.len(),
            responded,
            "lookup finished"
        );

        let closest = self.accepted.values().take(self.k).copied().collect();
        LookupOutcome {
            result: self.strategy.finish(closest),
            rounds,
            queried: self.queried.len(),
            responded,
        }
    }
}

/// Shorthand for a find_node lookup seeded from the routing table.
pub async fn find_node(
    routing: &RoutingTable,
    transport: &Transport,
    target: NodeId,
) -> Vec<NodeInfo> {
    Lookup::new(target, FindNode::new(target), routing, transport)
        .seeded_from_table()
        .run()
        .await
        .result
}

/// Shorthand for a get_peers lookup seeded from the routing table.
pub async fn get_peers(
    routing: &RoutingTable,
    transport: &Transport,
    info_hash: InfoHash,
) -> GetPeersOutcome {
    let target = NodeId(info_hash);
    Lookup::new(target, GetPeers::new(info_hash), routing, transport)
        .seeded_from_table()
        .run()
        .await
        .result
}
