//! Websocket relay.
//!
//! Peers subscribe to event names and receive every matching event the
//! bridge broadcasts; they can also send console commands. The relay either
//! accepts connections (listen mode, filtered by an allow-list) or keeps one
//! outbound connection alive (connect mode, retried forever after a fixed
//! delay). Both modes feed the same per-connection loop.

mod peer;
mod subscriptions;

pub use peer::{Peer, PeerId, PeerSet};
pub use subscriptions::SubscriptionTable;

use crate::config::{SocketConfig, SocketMode};
use crate::error::{BridgeError, Result};
use crate::events::DomainEvent;
use crate::protocol::{InboundMessage, OutboundMessage};
use futures::{SinkExt, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: i32 = 1024;

pub struct SocketRelay {
    config: SocketConfig,
    peers: PeerSet,
    subscriptions: SubscriptionTable,
    commands_tx: mpsc::UnboundedSender<String>,
    commands_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SocketRelay {
    pub fn new(config: SocketConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            config,
            peers: PeerSet::new(),
            subscriptions: SubscriptionTable::new(),
            commands_tx,
            commands_rx: Mutex::new(Some(commands_rx)),
        }
    }

    pub fn config(&self) -> &SocketConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    /// Console commands received from peers. Available once.
    pub fn take_commands(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.commands_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Applies one text frame from `peer`.
    pub fn handle_message(&self, peer: PeerId, text: &str) -> Result<()> {
        match InboundMessage::parse(text)? {
            InboundMessage::Command(command) => {
                info!("📨 Command from peer {}: {}", peer, command);
                if self.commands_tx.send(command).is_err() {
                    warn!("No command handler attached, dropping command from peer {}", peer);
                }
            }
            InboundMessage::Subscribe(events) => self.subscriptions.subscribe(peer, &events),
            InboundMessage::Unsubscribe(events) => self.subscriptions.unsubscribe(peer, &events),
        }
        Ok(())
    }

    /// Sends `event` to every open subscriber. Returns how many got it.
    pub fn broadcast(&self, event: &DomainEvent) -> usize {
        let subscribers = self.subscriptions.subscribers(event.kind.name());
        if subscribers.is_empty() {
            return 0;
        }

        let text = match OutboundMessage::Event(event.clone()).encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode '{}' event: {}", event.kind, e);
                return 0;
            }
        };

        // Closed peers are skipped; they leave the table when their loop ends.
        subscribers
            .into_iter()
            .filter_map(|id| self.peers.get(id))
            .filter(|peer| peer.send(text.clone()))
            .count()
    }

    /// Runs the configured mode until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        match self.config.mode.clone() {
            SocketMode::Listen { bind_address } => {
                let listener = self.bind(bind_address)?;
                self.serve(listener, shutdown).await;
            }
            SocketMode::Connect { host, port } => {
                self.connect(&format!("ws://{host}:{port}"), shutdown).await;
            }
            SocketMode::Disabled => {
                info!("Socket relay disabled");
                let mut shutdown = shutdown;
                let _ = shutdown.recv().await;
            }
        }
        Ok(())
    }

    /// Binds the listen socket.
    pub fn bind(&self, address: SocketAddr) -> Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| BridgeError::Network(format!("Socket creation failed: {e}")))?;
        socket.set_reuse_address(true).ok();
        socket
            .bind(&address.into())
            .map_err(|e| BridgeError::Network(format!("Bind failed: {e}")))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| BridgeError::Network(format!("Listen failed: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| BridgeError::Network(format!("Tokio listener creation failed: {e}")))?;

        info!("✅ Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accepts peers on `listener` until `shutdown` fires, then closes them all.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if !self.config.allow.permits(addr.ip()) {
                            warn!("🚫 Rejected connection from {}", addr);
                            continue;
                        }
                        let relay = self.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => relay.attach(ws, Some(addr)).await,
                                Err(e) => error!("WebSocket handshake failed for {}: {}", addr, e),
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                _ = shutdown.recv() => break,
            }
        }
        self.close_all();
    }

    /// Keeps one outbound connection to `url`, reconnecting after the
    /// configured delay whenever it drops or cannot be made.
    pub async fn connect(self: &Arc<Self>, url: &str, mut shutdown: broadcast::Receiver<()>) {
        let delay = self.config.reconnect_delay;
        loop {
            let attempt = tokio::select! {
                attempt = connect_async(url) => attempt,
                _ = shutdown.recv() => break,
            };

            match attempt {
                Ok((ws, _)) => {
                    info!("🔗 Connected to {}", url);
                    tokio::select! {
                        _ = self.attach(ws, None) => warn!("Connection to {} lost", url),
                        _ = shutdown.recv() => break,
                    }
                }
                Err(e) => warn!("Failed to connect to {}: {}", url, e),
            }

            info!("Reconnecting to {} in {:?}", url, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        self.close_all();
    }

    /// Drives one connection until it closes.
    async fn attach<S>(&self, ws: WebSocketStream<S>, remote_addr: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let id = self.peers.next_id();
        let peer = Peer::new(id, remote_addr, outbound);
        let open = peer.open_flag();
        self.peers.insert(peer);

        match remote_addr {
            Some(addr) => info!("🔌 Peer {} connected from {}", id, addr),
            None => info!("🔌 Peer {} connected", id),
        }

        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("Write to peer {} failed: {}", id, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            open.store(false, Ordering::Release);
            let _ = sink.close().await;
        });

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if let Err(e) = self.handle_message(id, text.as_str()) {
                        warn!("Dropping message from peer {}: {}", id, e);
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(_) => warn!("Ignoring non-text message from peer {}", id),
                Err(e) => {
                    warn!("WebSocket error for peer {}: {}", id, e);
                    break;
                }
            }
        }

        self.detach(id);
    }

    fn detach(&self, id: PeerId) {
        self.subscriptions.remove_peer(id);
        if let Some(peer) = self.peers.remove(id) {
            peer.close();
            info!("Peer {} disconnected", id);
        }
    }

    fn close_all(&self) {
        for id in self.peers.ids() {
            self.detach(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllowList;
    use crate::events::EventKind;
    use serde_json::json;

    fn relay() -> SocketRelay {
        SocketRelay::new(SocketConfig {
            mode: SocketMode::Disabled,
            ..SocketConfig::default()
        })
    }

    fn attach_fake_peer(relay: &SocketRelay) -> (PeerId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = relay.peers().next_id();
        relay.peers().insert(Peer::new(id, None, tx));
        (id, rx)
    }

    fn weather() -> DomainEvent {
        DomainEvent::new(EventKind::Weather, json!({"new": 1}))
    }

    #[test]
    fn test_subscribe_then_broadcast_delivers_once() {
        let relay = relay();
        let (peer, mut frames) = attach_fake_peer(&relay);

        relay.handle_message(peer, r#"{"type":2,"body":["Weather"]}"#).unwrap();
        relay.handle_message(peer, r#"{"type":2,"body":["Weather"]}"#).unwrap();
        assert_eq!(relay.broadcast(&weather()), 1);

        let frame = frames.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(value["body"]["event"], "Weather");
        assert_eq!(value["body"]["type"], 6);
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let relay = relay();
        let (peer, mut frames) = attach_fake_peer(&relay);

        relay.handle_message(peer, r#"{"type":2,"body":["Weather"]}"#).unwrap();
        relay.handle_message(peer, r#"{"type":3,"body":["Weather"]}"#).unwrap();

        assert_eq!(relay.broadcast(&weather()), 0);
        assert!(frames.try_recv().is_err());
    }

    #[test]
    fn test_closed_peer_is_skipped_not_pruned() {
        let relay = relay();
        let (open_peer, _open_frames) = attach_fake_peer(&relay);
        let (closed_peer, _closed_frames) = attach_fake_peer(&relay);
        for peer in [open_peer, closed_peer] {
            relay.handle_message(peer, r#"{"type":2,"body":["Weather"]}"#).unwrap();
        }

        relay.peers().get(closed_peer).unwrap().close();

        assert_eq!(relay.broadcast(&weather()), 1);
        assert!(relay.subscriptions().is_subscribed("Weather", closed_peer));
        assert_eq!(relay.peers().len(), 2);
    }

    #[test]
    fn test_detach_drops_subscriptions() {
        let relay = relay();
        let (peer, _frames) = attach_fake_peer(&relay);
        relay.handle_message(peer, r#"{"type":2,"body":["Weather","Death"]}"#).unwrap();

        relay.detach(peer);

        assert!(relay.peers().is_empty());
        assert!(relay.subscriptions().subscribers("Weather").is_empty());
        assert!(relay.subscriptions().subscribers("Death").is_empty());
    }

    #[test]
    fn test_commands_are_forwarded() {
        let relay = relay();
        let mut commands = relay.take_commands().unwrap();
        assert!(relay.take_commands().is_none());

        relay.handle_message(0, r#"{"type":1,"body":"time set day"}"#).unwrap();
        assert_eq!(commands.try_recv().unwrap(), "time set day");
    }

    #[test]
    fn test_bad_frames_are_rejected_without_side_effects() {
        let relay = relay();
        let (peer, _frames) = attach_fake_peer(&relay);

        assert!(relay.handle_message(peer, "{{{").is_err());
        assert!(relay.handle_message(peer, r#"{"type":7}"#).is_err());
        assert_eq!(relay.peers().len(), 1);
        assert!(relay.subscriptions().subscribers("Weather").is_empty());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let relay = SocketRelay::new(SocketConfig {
            mode: SocketMode::Disabled,
            allow: AllowList::All,
            ..SocketConfig::default()
        });
        let listener = relay.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
