//! Datagram sockets the transport can run on.
//!
//! [`UdpSocket`] is the production socket. [`MemoryNetwork`] wires any number
//! of [`MemorySocket`]s together inside one process, which lets several DHT
//! nodes talk to each other without touching the OS network stack.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

/// An unconnected datagram socket.
pub trait DatagramSocket: Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>>;

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>>;
}

impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        UdpSocket::send_to(self, buf, target).boxed()
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        UdpSocket::recv_from(self, buf).boxed()
    }
}

type Datagram = (Bytes, SocketAddr);

#[derive(Default)]
struct Switch {
    ports: HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    next_host: u32,
}

/// An in-process datagram network.
///
/// Datagrams to an address nobody is bound to are dropped, like UDP.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    switch: Arc<Mutex<Switch>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<MemorySocket> {
        let mut switch = self.switch.lock();
        if switch.ports.contains_key(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} already bound", addr),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        switch.ports.insert(addr, tx);

        Ok(MemorySocket {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    /// Binds to the next free address of the form `10.x.y.z:6881`.
    pub fn bind_any(&self) -> MemorySocket {
        loop {
            let host = {
                let mut switch = self.switch.lock();
                switch.next_host += 1;
                switch.next_host
            };
            let addr = SocketAddr::from((Ipv4Addr::from(0x0a00_0000 | host), 6881));
            if let Ok(socket) = self.bind(addr) {
                return socket;
            }
        }
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let switch = self.switch.lock();
        match switch.ports.get(&to) {
            Some(port) => {
                let _ = port.send((Bytes::copy_from_slice(data), from));
            }
            None => trace!(%from, %to, "memory network dropped datagram"),
        }
    }

    fn unbind(&self, addr: &SocketAddr) {
        self.switch.lock().ports.remove(addr);
    }
}

pub struct MemorySocket {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl DatagramSocket for MemorySocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn send_to<'a>(&'a self, buf: &'a [u8], target: SocketAddr) -> BoxFuture<'a, io::Result<usize>> {
        self.network.deliver(self.addr, target, buf);
        futures::future::ready(Ok(buf.len())).boxed()
    }

    fn recv_from<'a>(&'a self, buf: &'a mut [u8]) -> BoxFuture<'a, io::Result<(usize, SocketAddr)>> {
        async move {
            let mut inbox = self.inbox.lock().await;
            let (data, from) = inbox
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionAborted))?;
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok((n, from))
        }
        .boxed()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.unbind(&self.addr);
    }
}
