use super::peer::PeerId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Event name -> peers that asked for it.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    events: DashMap<String, HashSet<PeerId>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, peer: PeerId, events: &[String]) {
        for event in events {
            if self.events.entry(event.clone()).or_default().insert(peer) {
                debug!("Peer {} subscribed to '{}'", peer, event);
            }
        }
    }

    pub fn unsubscribe(&self, peer: PeerId, events: &[String]) {
        for event in events {
            if let Some(mut peers) = self.events.get_mut(event) {
                if peers.remove(&peer) {
                    debug!("Peer {} unsubscribed from '{}'", peer, event);
                }
            }
        }
        // Dropping empty sets keeps the table bounded by live interest.
        self.events.retain(|_, peers| !peers.is_empty());
    }

    /// Drops `peer` from every event.
    pub fn remove_peer(&self, peer: PeerId) {
        self.events.retain(|_, peers| {
            peers.remove(&peer);
            !peers.is_empty()
        });
    }

    pub fn subscribers(&self, event: &str) -> Vec<PeerId> {
        self.events
            .get(event)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, event: &str, peer: PeerId) -> bool {
        self.events
            .get(event)
            .map(|peers| peers.contains(&peer))
            .unwrap_or(false)
    }
}
