use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Identifier of a connected peer, unique for the relay's lifetime.
pub type PeerId = usize;

/// Handle to one websocket connection.
///
/// Frames are queued to the connection's writer task, so sending never
/// waits on the network.
#[derive(Debug, Clone)]
pub struct Peer {
    id: PeerId,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl Peer {
    pub fn new(id: PeerId, remote_addr: Option<SocketAddr>, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// `None` for the outbound connection in connect mode.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Queues a text frame. Returns `false` if the connection is closed.
    pub fn send(&self, text: String) -> bool {
        self.is_open() && self.outbound.send(Message::text(text)).is_ok()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    pub(crate) fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }
}

/// All currently connected peers.
#[derive(Debug, Default)]
pub struct PeerSet {
    peers: DashMap<PeerId, Peer>,
    next_id: AtomicUsize,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> PeerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, peer: Peer) {
        self.peers.insert(peer.id(), peer);
    }

    pub fn remove(&self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id).map(|(_, peer)| peer)
    }

    pub fn get(&self, id: PeerId) -> Option<Peer> {
        self.peers.get(&id).map(|peer| peer.value().clone())
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|peer| *peer.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_peer_refuses_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = Peer::new(0, None, tx);

        assert!(peer.send("one".to_string()));
        peer.close();
        assert!(!peer.is_open());
        assert!(!peer.send("two".to_string()));

        assert_eq!(rx.try_recv().unwrap(), Message::text("one"));
        assert!(matches!(rx.try_recv().unwrap(), Message::Close(None)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_peer_closes_with_its_writer() {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Peer::new(0, None, tx);
        drop(rx);
        assert!(!peer.is_open());
        assert!(!peer.send("lost".to_string()));
    }

    #[test]
    fn test_peer_set_ids_are_unique() {
        let peers = PeerSet::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let a = peers.next_id();
        let b = peers.next_id();
        assert_ne!(a, b);

        peers.insert(Peer::new(a, None, tx.clone()));
        peers.insert(Peer::new(b, None, tx));
        assert_eq!(peers.len(), 2);

        assert_eq!(peers.remove(a).map(|p| p.id()), Some(a));
        assert!(peers.get(a).is_none());
        assert_eq!(peers.ids(), vec![b]);
    }
}
