//! Connected peer directory.
//!
//! One entry per online nickname, holding the outbound queue of its session
//! actor, where it connected from, where it accepts transfer connections
//! and the file index it last announced. A reconnect with the same nickname
//! supersedes the previous entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use hubshare_shared::protocol::HubEvent;
use hubshare_shared::types::IndexEntry;

pub type Outbox = mpsc::UnboundedSender<HubEvent>;

#[derive(Debug, Clone)]
struct PeerEntry {
    connection_id: u64,
    outbox: Outbox,
    remote_addr: SocketAddr,
    transfer_addr: Option<String>,
    files: Vec<IndexEntry>,
    connected_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct PeerDirectory {
    peers: Arc<RwLock<HashMap<String, PeerEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live connection. Returns its id and the receiving end of
    /// its outbound queue.
    pub async fn connect(
        &self,
        nickname: &str,
        remote_addr: SocketAddr,
    ) -> (u64, mpsc::UnboundedReceiver<HubEvent>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self.peers.write().await.insert(
            nickname.to_string(),
            PeerEntry {
                connection_id,
                outbox,
                remote_addr,
                transfer_addr: None,
                files: Vec::new(),
                connected_at: Utc::now(),
            },
        );
        if let Some(old) = previous {
            debug!(user = nickname, old_addr = %old.remote_addr, "Superseding previous connection");
        }
        debug!(user = nickname, addr = %remote_addr, connection_id, "Peer connected");

        (connection_id, rx)
    }

    /// Remove the entry, unless a newer connection has already replaced it.
    pub async fn disconnect(&self, nickname: &str, connection_id: u64) {
        let mut peers = self.peers.write().await;
        if peers.get(nickname).is_some_and(|p| p.connection_id == connection_id) {
            peers.remove(nickname);
            debug!(user = nickname, connection_id, "Peer disconnected");
        }
    }

    pub async fn set_transfer_addr(&self, nickname: &str, addr: Option<String>) {
        if let Some(peer) = self.peers.write().await.get_mut(nickname) {
            peer.transfer_addr = addr;
        }
    }

    pub async fn set_index(&self, nickname: &str, files: Vec<IndexEntry>) -> usize {
        match self.peers.write().await.get_mut(nickname) {
            Some(peer) => {
                peer.files = files;
                peer.files.len()
            }
            None => 0,
        }
    }

    /// Push an event to a connected peer. Returns `false` if it is offline.
    pub async fn notify(&self, nickname: &str, event: HubEvent) -> bool {
        match self.peers.read().await.get(nickname) {
            Some(peer) => peer.outbox.send(event).is_ok(),
            None => false,
        }
    }

    /// Send on one specific connection. Returns `false` once that
    /// connection has been superseded or closed.
    pub async fn reply(&self, nickname: &str, connection_id: u64, event: HubEvent) -> bool {
        match self.peers.read().await.get(nickname) {
            Some(peer) if peer.connection_id == connection_id => peer.outbox.send(event).is_ok(),
            _ => false,
        }
    }

    pub async fn is_online(&self, nickname: &str) -> bool {
        self.peers.read().await.contains_key(nickname)
    }

    pub async fn transfer_addr(&self, nickname: &str) -> Option<String> {
        self.peers
            .read()
            .await
            .get(nickname)
            .and_then(|p| p.transfer_addr.clone())
    }

    pub async fn index_of(&self, nickname: &str) -> Vec<IndexEntry> {
        self.peers
            .read()
            .await
            .get(nickname)
            .map(|p| p.files.clone())
            .unwrap_or_default()
    }

    pub async fn online(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut online: Vec<_> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(nick, p)| (nick.clone(), p.connected_at))
            .collect();
        online.sort();
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn notify_reaches_connected_peer() {
        let dir = PeerDirectory::new();
        let (_, mut rx) = dir.connect("bob", addr()).await;

        assert!(dir.notify("bob", HubEvent::KeysUpdated { file_hash: "h".into() }).await);
        assert!(!dir.notify("carol", HubEvent::KeysUpdated { file_hash: "h".into() }).await);

        assert_eq!(rx.recv().await, Some(HubEvent::KeysUpdated { file_hash: "h".into() }));
    }

    #[tokio::test]
    async fn reconnect_supersedes_and_old_disconnect_is_ignored() {
        let dir = PeerDirectory::new();
        let (old_id, _old_rx) = dir.connect("bob", addr()).await;
        let (new_id, mut new_rx) = dir.connect("bob", addr()).await;
        assert_ne!(old_id, new_id);

        assert!(!dir.reply("bob", old_id, HubEvent::IndexAck { count: 0 }).await);
        dir.disconnect("bob", old_id).await;
        assert!(dir.is_online("bob").await);
        assert!(dir.notify("bob", HubEvent::IndexAck { count: 0 }).await);
        assert!(new_rx.recv().await.is_some());

        dir.disconnect("bob", new_id).await;
        assert!(!dir.is_online("bob").await);
    }

    #[tokio::test]
    async fn index_and_transfer_addr() {
        let dir = PeerDirectory::new();
        dir.connect("alice", addr()).await;

        dir.set_transfer_addr("alice", Some("ws://127.0.0.1:4000".into())).await;
        let count = dir
            .set_index(
                "alice",
                vec![IndexEntry { file_name: "a".into(), file_hash: "h".into(), size: 1 }],
            )
            .await;

        assert_eq!(count, 1);
        assert_eq!(dir.index_of("alice").await.len(), 1);
        assert_eq!(dir.transfer_addr("alice").await.as_deref(), Some("ws://127.0.0.1:4000"));
        assert_eq!(dir.online().await.len(), 1);
    }
}
