use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::config::{DhtConfig, DhtContext};
use super::error::DhtError;
use super::lookup::{self, GetPeersOutcome};
use super::maintenance::Maintenance;
use super::message::{InfoHash, Query};
use super::node::{NodeId, NodeInfo};
use super::routing::RoutingTable;
use super::server::QueryServer;
use super::socket::DatagramSocket;
use super::transport::Transport;

/// Told about peers whenever a get_peers lookup finds some.
pub trait PeerDiscoveryListener: Send + Sync {
    fn peers_discovered(&self, info_hash: InfoHash, peers: &[SocketAddr]);
}

impl<F> PeerDiscoveryListener for F
where
    F: Fn(InfoHash, &[SocketAddr]) + Send + Sync,
{
    fn peers_discovered(&self, info_hash: InfoHash, peers: &[SocketAddr]) {
        self(info_hash, peers)
    }
}

struct Inner {
    context: Arc<DhtContext>,
    routing: Arc<RoutingTable>,
    transport: Transport,
    server: QueryServer,
    bootstrap_addrs: RwLock<Vec<SocketAddr>>,
    registered: RwLock<HashSet<InfoHash>>,
    listener: RwLock<Option<Arc<dyn PeerDiscoveryListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A DHT node.
///
/// Cheap to clone; all clones drive the same node.
///
/// # Examples
///
/// ```no_run
/// use rbit_dht::dht::{Dht, DhtConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dht = Dht::bind(DhtConfig::default()).await?;
/// dht.start()?;
/// dht.bootstrap().await?;
///
/// let outcome = dht.get_peers([0u8; 20]).await?;
/// println!("found {} peers", outcome.peers.len());
///
/// dht.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Dht {
    inner: Arc<Inner>,
}

impl Dht {
    /// Binds a UDP socket to `config.bind_addr` under a fresh node id.
    pub async fn bind(config: DhtConfig) -> Result<Self, DhtError> {
        let context = Arc::new(DhtContext::new(config));
        let transport = Transport::bind(Arc::clone(&context)).await?;
        Ok(Self::from_transport(transport))
    }

    /// Runs on an already bound socket.
    pub fn with_socket(socket: Arc<dyn DatagramSocket>, context: DhtContext) -> Self {
        Self::from_transport(Transport::new(socket, Arc::new(context)))
    }

    fn from_transport(transport: Transport) -> Self {
        let context = Arc::clone(transport.context());
        let routing = Arc::new(RoutingTable::with_capacity(
            context.local_id,
            context.config.k,
        ));
        let server = QueryServer::new(Arc::clone(&context), Arc::clone(&routing));

        Self {
            inner: Arc::new(Inner {
                context,
                routing,
                transport,
                server,
                bootstrap_addrs: RwLock::new(Vec::new()),
                registered: RwLock::new(HashSet::new()),
                listener: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.inner.context.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        self.inner.transport.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.context.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn server(&self) -> &QueryServer {
        &self.inner.server
    }

    pub fn is_running(&self) -> bool {
        !self.inner.tasks.lock().is_empty() && !self.inner.transport.is_closed()
    }

    /// Spawns the receive loop and the maintenance loop. Must be called from
    /// within a Tokio runtime. Starting a running node does nothing.
    pub fn start(&self) -> Result<(), DhtError> {
        if self.inner.transport.is_closed() {
            return Err(DhtError::Shutdown);
        }

        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = inner.transport.run(&inner.server).await {
                warn!("DHT receive loop failed: {}", e);
                inner.transport.close();
            }
        }));

        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(maintenance_loop(inner)));

        info!(id = %self.local_id(), "DHT started");
        Ok(())
    }

    /// Closes the transport and waits for the background tasks. In-flight
    /// lookups finish with what they have.
    pub async fn stop(&self) {
        self.inner.transport.close();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(id = %self.local_id(), "DHT stopped");
    }

    /// Adds an address [`Dht::bootstrap`] will try before the configured
    /// bootstrap hosts.
    pub fn add_bootstrap_node_address(&self, addr: SocketAddr) {
        let mut addrs = self.inner.bootstrap_addrs.write();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    /// Joins the network through the first bootstrap address that answers.
    pub async fn bootstrap(&self) -> Result<(), DhtError> {
        let addrs = self.bootstrap_addresses().await;
        if addrs.is_empty() {
            return Err(DhtError::NoBootstrapNodes);
        }

        let maintenance = Maintenance::new(&self.inner.routing, &self.inner.transport);
        for addr in addrs {
            let id = match self.inner.transport.ping(addr).await {
                Ok(id) => id,
                Err(DhtError::Shutdown) => return Err(DhtError::Shutdown),
                Err(e) => {
                    debug!(%addr, "bootstrap node unreachable: {}", e);
                    continue;
                }
            };

            match maintenance.bootstrap(NodeInfo::new(id, addr)).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(%addr, "bootstrap through node failed: {}", e),
            }
        }

        Err(DhtError::BootstrapFailed)
    }

    async fn bootstrap_addresses(&self) -> Vec<SocketAddr> {
        let mut addrs = self.inner.bootstrap_addrs.read().clone();

        for host in &self.inner.context.config.bootstrap_nodes {
            match tokio::net::lookup_host(host.as_str()).await {
                Ok(resolved) => {
                    if let Some(addr) = resolved.into_iter().find(SocketAddr::is_ipv4) {
                        if !addrs.contains(&addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", host, e),
            }
        }

        addrs
    }

    /// Pings `addr` and returns the id it answers with.
    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        self.inner.transport.ping(addr).await
    }

    /// The closest nodes to `target` that answered.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<NodeInfo>, DhtError> {
        if self.inner.transport.is_closed() {
            return Err(DhtError::Shutdown);
        }
        Ok(lookup::find_node(&self.inner.routing, &self.inner.transport, target).await)
    }

    /// Looks up peers for `info_hash`; the peer listener hears about any
    /// that are found.
    pub async fn get_peers(&self, info_hash: InfoHash) -> Result<GetPeersOutcome, DhtError> {
        if self.inner.transport.is_closed() {
            return Err(DhtError::Shutdown);
        }
        Ok(self.inner.lookup_peers(info_hash).await)
    }

    /// Announces that we serve `info_hash` on `port` to the K closest nodes
    /// that handed out a token. Returns how many accepted.
    pub async fn announce(&self, info_hash: InfoHash, port: u16) -> Result<usize, DhtError> {
        let outcome = self.get_peers(info_hash).await?;
        let transport = &self.inner.transport;

        let closest: HashSet<NodeInfo> = outcome.closest.iter().copied().collect();
        let targets = outcome
            .tokens
            .into_iter()
            .filter(|(node, _)| closest.contains(node));

        let results = join_all(targets.map(|(node, token)| async move {
            let query = Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port: false,
            };
            (node, transport.send_query(node.addr, query).await)
        }))
        .await;

        let mut accepted = 0;
        for (node, result) in results {
            match result {
                Ok(_) => accepted += 1,
                Err(e) => debug!(node = %node, "announce_peer failed: {}", e),
            }
        }

        info!(
            info_hash = %hex::encode(info_hash),
            accepted, "announced to DHT"
        );
        Ok(accepted)
    }

    /// Keeps looking up peers for `info_hash` until deregistered. A running
    /// node starts the first lookup right away.
    pub fn register_info_hash(&self, info_hash: InfoHash) {
        if !self.inner.registered.write().insert(info_hash) {
            return;
        }
        debug!(info_hash = %hex::encode(info_hash), "registered info hash");

        if !self.is_running() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                inner.lookup_peers(info_hash).await;
            });
        }
    }

    pub fn deregister_info_hash(&self, info_hash: &InfoHash) {
        if self.inner.registered.write().remove(info_hash) {
            debug!(info_hash = %hex::encode(info_hash), "deregistered info hash");
        }
    }

    pub fn registered_info_hashes(&self) -> Vec<InfoHash> {
        self.inner.registered.read().iter().copied().collect()
    }

    pub fn set_peer_listener(&self, listener: impl PeerDiscoveryListener + 'static) {
        *self.inner.listener.write() = Some(Arc::new(listener));
    }
}

impl Inner {
    async fn lookup_peers(&self, info_hash: InfoHash) -> GetPeersOutcome {
        let outcome = lookup::get_peers(&self.routing, &self.transport, info_hash).await;

        if !outcome.peers.is_empty() {
            let listener = self.listener.read().clone();
            if let Some(listener) = listener {
                listener.peers_discovered(info_hash, &outcome.peers);
            }
        }
        outcome
    }

    async fn lookup_registered(&self) {
        let hashes: Vec<InfoHash> = self.registered.read().iter().copied().collect();
        if hashes.is_empty() {
            return;
        }
        debug!("Refreshing peers for {} registered info hashes", hashes.len());
        join_all(hashes.into_iter().map(|hash| self.lookup_peers(hash))).await;
    }
}

async fn maintenance_loop(inner: Arc<Inner>) {
    let config = &inner.context.config;
    let mut refresh = interval(config.refresh_interval);
    let mut token_rotation = interval(config.token_rotation_interval);
    let mut peer_lookups = interval(config.peer_lookup_interval);

    refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);
    token_rotation.set_missed_tick_behavior(MissedTickBehavior::Skip);
    peer_lookups.set_missed_tick_behavior(MissedTickBehavior::Skip);

    refresh.tick().await;
    token_rotation.tick().await;
    peer_lookups.tick().await;

    loop {
        tokio::select! {
            _ = inner.transport.closed() => break,
            _ = refresh.tick() => {
                Maintenance::new(&inner.routing, &inner.transport)
                    .refresh_stale(config.bucket_stale_after)
                    .await;
            }
            _ = token_rotation.tick() => {
                inner.server.rotate_token_secret();
                inner.server.expire_peers();
            }
            _ = peer_lookups.tick() => {
                inner.lookup_registered().await;
            }
        }
    }

    debug!("DHT maintenance loop stopped");
}
