use std::time::Duration;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use super::error::DhtError;
use super::lookup::{FindNode, Lookup};
use super::node::{Node, NodeInfo};
use super::routing::RoutingTable;
use super::transport::Transport;

/// Bootstrap and bucket refresh, built from the routing table and the
/// iterative lookup.
pub struct Maintenance<'a> {
    routing: &'a RoutingTable,
    transport: &'a Transport,
}

impl<'a> Maintenance<'a> {
    pub fn new(routing: &'a RoutingTable, transport: &'a Transport) -> Self {
        Self { routing, transport }
    }

    /// Joins the network through `node`.
    ///
    /// Looks up our own id starting from `node` alone. Fails with
    /// [`DhtError::BootstrapFailed`] if that leaves the routing table empty;
    /// otherwise stores `node` and refreshes the buckets the lookup cannot
    /// reach.
    pub async fn bootstrap(&self, node: NodeInfo) -> Result<(), DhtError> {
        let our_id = *self.transport.local_id();
        info!(bootstrap = %node, "starting DHT bootstrap");

        let outcome = Lookup::new(our_id, FindNode::new(our_id), self.routing, self.transport)
            .with_seeds([node])
            .run()
            .await;

        if self.routing.is_empty() {
            warn!(bootstrap = %node, "bootstrap node did not respond");
            return Err(DhtError::BootstrapFailed);
        }

        self.routing.insert(Node::new(node), self.transport).await;

        let gaps = self.routing.empty_buckets_farther_than_non_empty();
        let concurrency = self.transport.context().config.refresh_concurrency.max(1);
        debug!(
            rounds = outcome.rounds,
            gaps = gaps.len(),
            "initial lookup done, refreshing unreachable buckets"
        );

        let added: usize = stream::iter(gaps)
            .map(|idx| self.refresh_bucket(idx))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .sum();

        info!(
            nodes = self.routing.node_count(),
            added, "DHT bootstrap complete"
        );
        Ok(())
    }

    /// Looks up a random id inside bucket `index` and inserts what it finds.
    /// Returns how many of them are now stored.
    pub async fn refresh_bucket(&self, index: usize) -> usize {
        let target = self.routing.bucket_prefix(index).random_id();
        let found = Lookup::new(target, FindNode::new(target), self.routing, self.transport)
            .seeded_from_table()
            .run()
            .await
            .result;

        let mut stored = 0;
        for node in found {
            if self.routing.insert(Node::new(node), self.transport).await.is_stored() {
                stored += 1;
            }
        }
        debug!(bucket = index, stored, "bucket refreshed");
        stored
    }

    /// Refreshes every populated bucket unchanged for `threshold`.
    pub async fn refresh_stale(&self, threshold: Duration) -> usize {
        let stale = self.routing.stale_buckets(threshold);
        if stale.is_empty() {
            return 0;
        }
        debug!("Refreshing {} stale DHT buckets", stale.len());

        let concurrency = self.transport.context().config.refresh_concurrency.max(1);
        stream::iter(stale)
            .map(|idx| self.refresh_bucket(idx))
            .buffer_unordered(concurrency)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .sum()
    }
}
