use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;

use crate::relay::{
    control::{ConnId, Outbound},
    protocol::ServerMessage,
    telemetry,
};

struct Tracked {
    tx: Outbound,
    remote: String,
}

/// Table of live control connections plus best-effort fan-out over it.
///
/// Sends never wait: a connection whose queue is closed is skipped, and one
/// whose queue is full loses the frame.
pub struct Notifier {
    conns: DashMap<ConnId, Tracked>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("connections", &self.conns.len())
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn register(&self, id: ConnId, tx: Outbound, remote: &str) {
        self.conns.insert(
            id,
            Tracked {
                tx,
                remote: remote.to_string(),
            },
        );
    }

    pub fn unregister(&self, id: ConnId) {
        self.conns.remove(&id);
    }

    /// True while the connection is tracked and its queue is still open.
    pub fn is_connected(&self, id: ConnId) -> bool {
        self.conns.get(&id).is_some_and(|c| !c.tx.is_closed())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Outbound queue of a tracked connection, for notices that must not be
    /// dropped; the caller awaits capacity on it.
    pub fn sender(&self, id: ConnId) -> Option<Outbound> {
        self.conns
            .get(&id)
            .filter(|c| !c.tx.is_closed())
            .map(|c| c.tx.clone())
    }

    pub fn send_to(&self, id: ConnId, msg: ServerMessage) -> bool {
        let Some(conn) = self.conns.get(&id) else {
            return false;
        };
        deliver(id, &conn, msg)
    }

    /// Sends `msg` to every ready connection; returns how many accepted it.
    pub fn broadcast(&self, msg: ServerMessage) -> usize {
        let mut delivered = 0;
        for entry in self.conns.iter() {
            if entry.tx.is_closed() {
                continue;
            }
            if deliver(*entry.key(), entry.value(), msg.clone()) {
                delivered += 1;
            }
        }
        tracing::debug!(kind = msg.kind(), recipients = delivered, "notify: broadcast");
        delivered
    }
}

fn deliver(id: ConnId, conn: &Tracked, msg: ServerMessage) -> bool {
    match conn.tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            metrics::counter!(telemetry::BROADCAST_DROPS_TOTAL).increment(1);
            tracing::warn!(
                cid = %id,
                client = %conn.remote,
                kind = msg.kind(),
                "notify: queue full, frame dropped"
            );
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
