//! Point-to-point transport between ranks.
//!
//! [`Transport`] is the only way ranks talk to each other: reliable, tagged
//! messages with no shared address space. Delivery is ordered per
//! `(source, tag)`; messages with other tags are buffered until asked for.
//! Buffered messages nobody will ever ask for (traffic of an aborted
//! iteration) are dropped through [`Transport::discard_stale`].
//!
//! [`ChannelTransport`] implements it in-process over `crossbeam-channel`,
//! one inbox per rank, for co-located ranks and tests.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Nothing matching arrived before the deadline
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),

    /// The peer's endpoint is gone
    #[error("peer {0} disconnected")]
    Disconnected(usize),

    /// Peer rank outside the group
    #[error("rank {peer} is outside a group of {world_size}")]
    InvalidPeer {
        /// Requested rank
        peer: usize,
        /// Group size
        world_size: usize,
    },
}

/// Tagged point-to-point messaging between ranks of one group.
pub trait Transport<T>: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Send `payload` to `dest`. Never blocks on the receiver.
    fn send(&mut self, dest: usize, tag: u64, payload: T) -> Result<(), TransportError>;

    /// Receive the next payload from `src` carrying `tag`, waiting at most `timeout`.
    fn recv(&mut self, src: usize, tag: u64, timeout: Duration) -> Result<T, TransportError>;

    /// Drop every delivered but unclaimed payload whose tag satisfies `is_stale`.
    ///
    /// Returns how many payloads were dropped. Transports that cannot inspect
    /// pending traffic keep the default, which drops nothing.
    fn discard_stale(&mut self, is_stale: &dyn Fn(u64) -> bool) -> usize {
        let _ = is_stale;
        0
    }
}

struct Envelope<T> {
    src: usize,
    tag: u64,
    payload: T,
}

/// In-process transport endpoint.
pub struct ChannelTransport<T> {
    rank: usize,
    peers: Vec<Sender<Envelope<T>>>,
    inbox: Receiver<Envelope<T>>,
    mailbox: HashMap<(usize, u64), VecDeque<T>>,
}

impl<T: Send> ChannelTransport<T> {
    /// Create a fully connected group of `world_size` endpoints, indexed by rank.
    pub fn mesh(world_size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..world_size).map(|_| crossbeam_channel::unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelTransport {
                rank,
                peers: senders.clone(),
                inbox,
                mailbox: HashMap::new(),
            })
            .collect()
    }

    /// Payloads received but not yet claimed by a matching `recv`.
    pub fn buffered(&self) -> usize {
        self.mailbox.values().map(VecDeque::len).sum()
    }

    fn take_buffered(&mut self, src: usize, tag: u64) -> Option<T> {
        let queue = self.mailbox.get_mut(&(src, tag))?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.mailbox.remove(&(src, tag));
        }
        payload
    }

    fn stash(&mut self, envelope: Envelope<T>) {
        self.mailbox
            .entry((envelope.src, envelope.tag))
            .or_default()
            .push_back(envelope.payload);
    }
}

impl<T: Send> Transport<T> for ChannelTransport<T> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.peers.len()
    }

    fn send(&mut self, dest: usize, tag: u64, payload: T) -> Result<(), TransportError> {
        let world_size = self.peers.len();
        let peer = self
            .peers
            .get(dest)
            .ok_or(TransportError::InvalidPeer { peer: dest, world_size })?;
        peer.send(Envelope {
            src: self.rank,
            tag,
            payload,
        })
        .map_err(|_| TransportError::Disconnected(dest))
    }

    fn recv(&mut self, src: usize, tag: u64, timeout: Duration) -> Result<T, TransportError> {
        if src >= self.peers.len() {
            return Err(TransportError::InvalidPeer {
                peer: src,
                world_size: self.peers.len(),
            });
        }
        if let Some(payload) = self.take_buffered(src, tag) {
            return Ok(payload);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let envelope = match deadline {
                Some(deadline) => self.inbox.recv_deadline(deadline).map_err(|e| match e {
                    RecvTimeoutError::Timeout => TransportError::Timeout(timeout),
                    RecvTimeoutError::Disconnected => TransportError::Disconnected(src),
                })?,
                None => self
                    .inbox
                    .recv()
                    .map_err(|_| TransportError::Disconnected(src))?,
            };
            if envelope.src == src && envelope.tag == tag {
                return Ok(envelope.payload);
            }
            self.stash(envelope);
        }
    }

    fn discard_stale(&mut self, is_stale: &dyn Fn(u64) -> bool) -> usize {
        while let Ok(envelope) = self.inbox.try_recv() {
            self.stash(envelope);
        }
        let before = self.buffered();
        self.mailbox.retain(|&(_, tag), _| !is_stale(tag));
        before - self.buffered()
    }
}
