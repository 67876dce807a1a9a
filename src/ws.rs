//! WebSocket fan-out: the connection registry and broadcast plumbing.
//!
//! Every socket gets a bounded outbound queue drained by its own writer
//! task, so one slow subscriber can never stall a broadcast; a socket whose
//! queue overflows is dropped from the registry. The registry lock is never
//! held across an actual socket write.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound queue depth per socket before it is considered stuck.
const SOCKET_QUEUE_DEPTH: usize = 256;

/// Every message kind the hub pushes to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsKind {
    StateSync,
    OddsUpdate,
    MarketStatus,
    GameState,
    BetResult,
    PositionAdded,
    ConnectionCount,
    SessionSettled,
    SessionVersionUpdated,
    ConfigUpdated,
    GameCreated,
    LpDeposit,
    LpWithdrawal,
    PoolUpdate,
    VolumeUpdate,
    OrderPlaced,
    OrderFilled,
    OrderbookUpdate,
    OrderCancelled,
    P2pBetResult,
}

impl WsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WsKind::StateSync => "STATE_SYNC",
            WsKind::OddsUpdate => "ODDS_UPDATE",
            WsKind::MarketStatus => "MARKET_STATUS",
            WsKind::GameState => "GAME_STATE",
            WsKind::BetResult => "BET_RESULT",
            WsKind::PositionAdded => "POSITION_ADDED",
            WsKind::ConnectionCount => "CONNECTION_COUNT",
            WsKind::SessionSettled => "SESSION_SETTLED",
            WsKind::SessionVersionUpdated => "SESSION_VERSION_UPDATED",
            WsKind::ConfigUpdated => "CONFIG_UPDATED",
            WsKind::GameCreated => "GAME_CREATED",
            WsKind::LpDeposit => "LP_DEPOSIT",
            WsKind::LpWithdrawal => "LP_WITHDRAWAL",
            WsKind::PoolUpdate => "POOL_UPDATE",
            WsKind::VolumeUpdate => "VOLUME_UPDATE",
            WsKind::OrderPlaced => "ORDER_PLACED",
            WsKind::OrderFilled => "ORDER_FILLED",
            WsKind::OrderbookUpdate => "ORDERBOOK_UPDATE",
            WsKind::OrderCancelled => "ORDER_CANCELLED",
            WsKind::P2pBetResult => "P2P_BET_RESULT",
        }
    }
}

/// Serialize a message once; every recipient shares the same bytes.
pub fn envelope(kind: WsKind, data: Value) -> String {
    json!({
        "type": kind.as_str(),
        "data": data,
        "timestamp": chrono::Utc::now(),
    })
    .to_string()
}

pub type ConnId = u64;

struct Socket {
    tx: mpsc::Sender<String>,
    address: Option<String>,
}

#[derive(Default)]
struct Registry {
    next_id: ConnId,
    sockets: HashMap<ConnId, Socket>,
    by_address: HashMap<String, HashSet<ConnId>>,
}

#[derive(Default)]
pub struct ConnectionManager {
    registry: Mutex<Registry>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket, optionally bound to a participant address.
    /// Returns the connection id and the queue the socket's writer task
    /// must drain.
    pub fn add_connection(&self, address: Option<String>) -> (ConnId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SOCKET_QUEUE_DEPTH);
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        if let Some(address) = &address {
            registry
                .by_address
                .entry(address.clone())
                .or_default()
                .insert(id);
        }
        registry.sockets.insert(id, Socket { tx, address });
        debug!(conn_id = id, "ws connection added");
        (id, rx)
    }

    pub fn remove_connection(&self, id: ConnId) {
        let mut registry = self.registry.lock();
        if let Some(socket) = registry.sockets.remove(&id) {
            if let Some(address) = socket.address {
                if let Some(ids) = registry.by_address.get_mut(&address) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        registry.by_address.remove(&address);
                    }
                }
            }
        }
        debug!(conn_id = id, "ws connection removed");
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().sockets.len()
    }

    /// Send to every connected socket. Individual failures drop the socket
    /// and are otherwise silent.
    pub fn broadcast(&self, kind: WsKind, data: Value) {
        let payload = envelope(kind, data);
        let targets: Vec<(ConnId, mpsc::Sender<String>)> = {
            let registry = self.registry.lock();
            registry
                .sockets
                .iter()
                .map(|(id, socket)| (*id, socket.tx.clone()))
                .collect()
        };
        self.deliver(&payload, targets);
    }

    /// Send only to the sockets registered under `address`; a no-op when
    /// there are none.
    pub fn send_to(&self, address: &str, kind: WsKind, data: Value) {
        let payload = envelope(kind, data);
        let targets: Vec<(ConnId, mpsc::Sender<String>)> = {
            let registry = self.registry.lock();
            let Some(ids) = registry.by_address.get(address) else {
                return;
            };
            ids.iter()
                .filter_map(|id| registry.sockets.get(id).map(|s| (*id, s.tx.clone())))
                .collect()
        };
        self.deliver(&payload, targets);
    }

    /// Targeted send to one socket; used for the STATE_SYNC handshake.
    pub fn send_to_socket(&self, id: ConnId, kind: WsKind, data: Value) {
        let payload = envelope(kind, data);
        let target = {
            let registry = self.registry.lock();
            registry.sockets.get(&id).map(|s| (id, s.tx.clone()))
        };
        if let Some(target) = target {
            self.deliver(&payload, vec![target]);
        }
    }

    /// Drop every socket; their writer tasks end when the queues close.
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.sockets.clear();
        registry.by_address.clear();
    }

    fn deliver(&self, payload: &str, targets: Vec<(ConnId, mpsc::Sender<String>)>) {
        let mut stuck = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(payload.to_string()).is_err() {
                stuck.push(id);
            }
        }
        for id in stuck {
            warn!(conn_id = id, "dropping ws connection with a full or closed queue");
            self.remove_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_every_socket_in_order() {
        let manager = ConnectionManager::new();
        let (_a, mut rx_a) = manager.add_connection(None);
        let (_b, mut rx_b) = manager.add_connection(Some("0xabc".to_string()));
        assert_eq!(manager.connection_count(), 2);

        manager.broadcast(WsKind::OddsUpdate, json!({"prices": [0.5, 0.5]}));
        manager.broadcast(WsKind::VolumeUpdate, json!({"volume": 10.0}));

        for rx in [&mut rx_a, &mut rx_b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(first.contains("ODDS_UPDATE"));
            assert!(second.contains("VOLUME_UPDATE"));
        }
    }

    #[tokio::test]
    async fn targeted_send_only_hits_the_address() {
        let manager = ConnectionManager::new();
        let (_a, mut rx_a) = manager.add_connection(Some("0xaaa".to_string()));
        let (_b, mut rx_b) = manager.add_connection(Some("0xbbb".to_string()));

        manager.send_to("0xaaa", WsKind::BetResult, json!({"result": "WIN"}));
        // Unknown address is a silent no-op.
        manager.send_to("0xccc", WsKind::BetResult, json!({}));

        assert!(rx_a.recv().await.unwrap().contains("BET_RESULT"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn socket_targeted_send_supports_state_sync() {
        let manager = ConnectionManager::new();
        let (id, mut rx) = manager.add_connection(None);
        manager.send_to_socket(id, WsKind::StateSync, json!({"markets": []}));
        assert!(rx.recv().await.unwrap().contains("STATE_SYNC"));
    }

    #[tokio::test]
    async fn overflowing_socket_is_dropped_without_blocking() {
        let manager = ConnectionManager::new();
        let (_id, rx) = manager.add_connection(None);
        // Never drained; the queue fills and the socket must be dropped.
        std::mem::forget(rx);
        for _ in 0..(SOCKET_QUEUE_DEPTH + 2) {
            manager.broadcast(WsKind::VolumeUpdate, json!({}));
        }
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_unregisters_the_address() {
        let manager = ConnectionManager::new();
        let (id, _rx) = manager.add_connection(Some("0xaaa".to_string()));
        manager.remove_connection(id);
        assert_eq!(manager.connection_count(), 0);
        // No receiver left; must not panic or send.
        manager.send_to("0xaaa", WsKind::BetResult, json!({}));
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let manager = ConnectionManager::new();
        let (_a, mut rx_a) = manager.add_connection(None);
        let (_b, mut rx_b) = manager.add_connection(Some("0xabc".to_string()));
        manager.clear();
        assert_eq!(manager.connection_count(), 0);
        assert!(rx_a.recv().await.is_none());
        assert!(rx_b.recv().await.is_none());
    }
}
