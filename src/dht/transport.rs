use super::config::DhtContext;
use super::error::DhtError;
use super::message::{Body, KrpcError, KrpcMessage, Method, Query, Response, TransactionId};
use super::node::{NodeId, NodeInfo};
use super::routing::LivenessProbe;
use super::socket::DatagramSocket;
use crate::constants::{MAX_DATAGRAM_SIZE, TRANSACTION_ID_LEN};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace};

/// Server side of the protocol: turns an incoming query into the response
/// or error sent back to its sender.
pub trait QueryHandler: Send + Sync {
    fn handle(&self, from: SocketAddr, sender: NodeId, query: Query) -> Result<Response, KrpcError>;
}

impl<F> QueryHandler for F
where
    F: Fn(SocketAddr, NodeId, Query) -> Result<Response, KrpcError> + Send + Sync,
{
    fn handle(&self, from: SocketAddr, sender: NodeId, query: Query) -> Result<Response, KrpcError> {
        self(from, sender, query)
    }
}

type Completion = oneshot::Sender<Result<Response, DhtError>>;
type Registration = (TransactionId, oneshot::Receiver<Result<Response, DhtError>>, Instant);

struct PendingTransaction {
    method: Method,
    addr: SocketAddr,
    completion: Completion,
    deadline: Instant,
}

/// Removes the pending entry however `send_query` ends, including when its
/// future is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<TransactionId, PendingTransaction>>,
    tid: TransactionId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.tid);
    }
}

/// KRPC over a datagram socket.
///
/// Outgoing queries are correlated with their responses through the
/// transaction id. [`Transport::run`] is the single reader of the socket;
/// any number of tasks may call [`Transport::send_query`] concurrently.
pub struct Transport {
    socket: Arc<dyn DatagramSocket>,
    context: Arc<DhtContext>,
    pending: Mutex<HashMap<TransactionId, PendingTransaction>>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    pub fn new(socket: Arc<dyn DatagramSocket>, context: Arc<DhtContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            socket,
            context,
            pending: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Binds a UDP socket to the configured address.
    pub async fn bind(context: Arc<DhtContext>) -> Result<Self, DhtError> {
        let socket = UdpSocket::bind(context.config.bind_addr).await?;
        info!(
            "DHT transport bound to {} with id {}",
            socket.local_addr()?,
            context.local_id
        );
        Ok(Self::new(Arc::new(socket), context))
    }

    pub fn context(&self) -> &Arc<DhtContext> {
        &self.context
    }

    pub fn local_id(&self) -> &NodeId {
        &self.context.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DhtError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, tid: &[u8]) -> bool {
        self.pending.lock().contains_key(tid)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once [`Transport::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Stops the receive loop and fails every pending query with
    /// [`DhtError::Shutdown`].
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        let drained: Vec<PendingTransaction> =
            self.pending.lock().drain().map(|(_, p)| p).collect();
        debug!("DHT transport closed, failing {} pending queries", drained.len());
        for pending in drained {
            let _ = pending.completion.send(Err(DhtError::Shutdown));
        }
    }

    fn register(&self, method: Method, addr: SocketAddr) -> Result<Registration, DhtError> {
        let mut pending = self.pending.lock();
        if self.is_closed() {
            return Err(DhtError::Shutdown);
        }
        if pending.len() >= self.context.config.max_pending {
            return Err(DhtError::RateLimited);
        }

        let tid = loop {
            let id: [u8; TRANSACTION_ID_LEN] = rand::random();
            let tid = Bytes::copy_from_slice(&id);
            if !pending.contains_key(&tid) {
                break tid;
            }
        };

        let (completion, rx) = oneshot::channel();
        let deadline = Instant::now() + self.context.config.query_timeout;
        pending.insert(
            tid.clone(),
            PendingTransaction {
                method,
                addr,
                completion,
                deadline,
            },
        );

        Ok((tid, rx, deadline))
    }

    /// Sends a query and waits for its outcome.
    ///
    /// Resolves exactly once: with the response, with
    /// [`DhtError::Protocol`] if the node answered with a KRPC error, with
    /// [`DhtError::Timeout`] once the deadline passes, or with
    /// [`DhtError::Shutdown`] if the transport is closed meanwhile.
    pub async fn send_query(&self, addr: SocketAddr, query: Query) -> Result<Response, DhtError> {
        if self.is_closed() {
            return Err(DhtError::Shutdown);
        }

        let method = query.method();
        let (tid, rx, deadline) = self.register(method, addr)?;
        let _guard = PendingGuard {
            pending: &self.pending,
            tid: tid.clone(),
        };

        let data = KrpcMessage::query(tid, self.context.local_id, query).encode();
        self.socket.send_to(&data, addr).await?;
        trace!(%addr, %method, "sent query");

        match timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DhtError::Shutdown),
            Err(_) => {
                debug!(%addr, %method, "query timed out");
                Err(DhtError::Timeout)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId, DhtError> {
        Ok(self.send_query(addr, Query::Ping).await?.id())
    }

    /// The receive loop. Runs until the transport is closed or the socket
    /// fails; malformed and unmatched datagrams are dropped.
    pub async fn run(&self, handler: &dyn QueryHandler) -> Result<(), DhtError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let received = tokio::select! {
                result = self.socket.recv_from(&mut buf) => Some(result),
                _ = self.closed() => None,
            };

            let (n, from) = match received {
                Some(Ok(received)) => received,
                Some(Err(e)) if self.is_closed() => {
                    debug!("socket error after shutdown: {}", e);
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    debug!("DHT receive loop stopped");
                    return Ok(());
                }
            };

            self.handle_datagram(&buf[..n], from, handler).await;
        }
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr, handler: &dyn QueryHandler) {
        let message = KrpcMessage::decode(data, |tid| {
            self.pending.lock().get(tid).map(|p| p.method)
        });

        let message = match message {
            Ok(message) => message,
            Err(DhtError::TransactionMismatch) => {
                trace!(%from, "dropping response with unknown transaction id");
                return;
            }
            Err(e) => {
                debug!("Failed to parse DHT message from {}: {}", from, e);
                return;
            }
        };

        let tid = message.transaction_id;
        match message.body {
            Body::Query { sender, query } => {
                let method = query.method();
                let reply = match handler.handle(from, sender, query) {
                    Ok(response) => KrpcMessage::response(tid, response),
                    Err(error) => {
                        debug!(%from, %method, "answering query with error: {}", error);
                        KrpcMessage::error(tid, error)
                    }
                };
                if let Err(e) = self.socket.send_to(&reply.encode(), from).await {
                    debug!(%from, "failed to send reply: {}", e);
                }
            }
            Body::Response(response) => self.complete(&tid, from, Ok(response)),
            Body::Error(error) => self.complete(
                &tid,
                from,
                Err(DhtError::Protocol {
                    code: error.code,
                    message: error.message,
                }),
            ),
        }
    }

    fn complete(&self, tid: &TransactionId, from: SocketAddr, outcome: Result<Response, DhtError>) {
        let mut pending = self.pending.lock();

        let matches = pending
            .get(tid)
            .is_some_and(|p| p.addr == from && Instant::now() <= p.deadline);
        if !matches {
            trace!(%from, "dropping reply that matches no pending transaction");
            return;
        }

        if let Some(entry) = pending.remove(tid) {
            let _ = entry.completion.send(outcome);
        }
    }
}

impl LivenessProbe for Transport {
    fn probe(&self, node: NodeInfo) -> impl Future<Output = bool> + Send {
        async move {
            match self.ping(node.addr).await {
                Ok(id) => id == node.id,
                Err(e) => {
                    trace!(node = %node, "liveness probe failed: {}", e);
                    false
                }
            }
        }
    }
}
