use super::error::DhtError;
use crate::constants::{ID_BITS, ID_LEN, MAX_NODE_FAILURES, NODE_GOOD_WINDOW};
use rand::Rng as _;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// A 160-bit identifier: a node id or an info hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn generate() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        let id: [u8; ID_LEN] = bytes.try_into().map_err(|_| DhtError::InvalidNodeId)?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut dist = [0u8; ID_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(dist)
    }

    /// Number of leading bits shared with `other`, in `0..=160`.
    pub fn shared_prefix_bits(&self, other: &NodeId) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Value of bit `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// The first `len` bits of this id.
    pub fn prefix(&self, len: usize) -> Prefix {
        Prefix::new(*self, len)
    }
}

impl From<[u8; ID_LEN]> for NodeId {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// XOR distance between two identifiers, ordered as an unsigned
/// big-endian integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Distance(pub [u8; ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_LEN]);

    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

/// A bit string of `len` bits, stored left-aligned with the tail zeroed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    bits: [u8; ID_LEN],
    len: usize,
}

impl Prefix {
    pub fn new(id: NodeId, len: usize) -> Self {
        let len = len.min(ID_BITS);
        let mut bits = id.0;
        mask_from(&mut bits, len, |_| 0);
        Self { bits, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        Prefix::new(*id, self.len).bits == self.bits
    }

    /// A uniformly random identifier starting with this prefix.
    pub fn random_id(&self) -> NodeId {
        let mut rng = rand::rng();
        let mut bits = self.bits;
        mask_from(&mut bits, self.len, |_| rng.random());
        NodeId(bits)
    }
}

/// Overwrites every bit from position `from` onwards with bits of `fill`.
fn mask_from(bits: &mut [u8; ID_LEN], from: usize, mut fill: impl FnMut(usize) -> u8) {
    if from >= ID_BITS {
        return;
    }
    let byte_idx = from / 8;
    let keep = from % 8;
    let keep_mask = !(0xffu8 >> keep);
    bits[byte_idx] = (bits[byte_idx] & keep_mask) | (fill(byte_idx) & !keep_mask);
    for (i, byte) in bits.iter_mut().enumerate().skip(byte_idx + 1) {
        *byte = fill(i);
    }
}

impl fmt::Debug for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prefix(")?;
        for i in 0..self.len.min(16) {
            let set = NodeId(self.bits).bit(i);
            write!(f, "{}", if set { '1' } else { '0' })?;
        }
        if self.len > 16 {
            write!(f, "..")?;
        }
        write!(f, "/{})", self.len)
    }
}

/// Contact information as carried in compact node info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Liveness of a routing-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Good,
    Questionable,
    Bad,
}

/// A routing-table entry with its liveness bookkeeping.
///
/// The [`NodeState`] is never stored; it is derived from the last activity
/// and the consecutive failure count.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_activity: Option<Instant>,
    pub failures: u8,
}

impl Node {
    /// A node that just talked to us.
    pub fn new(info: NodeInfo) -> Self {
        Self {
            id: info.id,
            addr: info.addr,
            last_activity: Some(Instant::now()),
            failures: 0,
        }
    }

    /// A node we only heard about from a third party.
    pub fn discovered(info: NodeInfo) -> Self {
        Self {
            id: info.id,
            addr: info.addr,
            last_activity: None,
            failures: 0,
        }
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo::new(self.id, self.addr)
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
        self.failures = 0;
    }

    pub fn fail(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn state_at(&self, now: Instant) -> NodeState {
        if self.failures >= MAX_NODE_FAILURES {
            return NodeState::Bad;
        }
        match self.last_activity {
            Some(at) if self.failures == 0 && now.saturating_duration_since(at) < NODE_GOOD_WINDOW => {
                NodeState::Good
            }
            _ => NodeState::Questionable,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state_at(Instant::now())
    }

    pub fn is_good(&self) -> bool {
        self.state() == NodeState::Good
    }

    pub fn is_bad(&self) -> bool {
        self.state() == NodeState::Bad
    }
}
