use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::relay::{dispatch::Dispatcher, protocol::ServerMessage, telemetry};

/// Outbound half of a control connection. Bounded: producers that await on
/// it are throttled by the peer's read speed.
pub type Outbound = mpsc::Sender<ServerMessage>;

/// Identity of one control connection, rendered as `c-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        Self(telemetry::next_seq())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c-{}", self.0)
    }
}

/// Handle the dispatcher uses to answer the connection a frame came from.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: ConnId,
    pub tx: Outbound,
}

impl Peer {
    pub fn new(tx: Outbound) -> Self {
        Self {
            id: ConnId::next(),
            tx,
        }
    }

    /// Queues a reply. A closed connection is not an error here; its
    /// teardown path does the cleanup.
    pub async fn reply(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg).await;
    }
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub outbound_queue: usize,
}

/// Drives one upgraded WebSocket until the peer goes away or the relay shuts
/// down. Inbound frames are dispatched one at a time, in arrival order.
pub async fn serve_connection(
    socket: WebSocket,
    remote: Option<SocketAddr>,
    dispatcher: Arc<Dispatcher>,
    opts: ControlOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let _guard = telemetry::ControlConnGuard::new();
    let remote = remote.map(|a| a.to_string()).unwrap_or_default();

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(opts.outbound_queue.max(1));
    let peer = Peer::new(tx);
    let cid = peer.id;

    dispatcher.connect(&peer, &remote);
    tracing::info!(cid = %cid, client = %remote, "control: connected");

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(cid = %cid, kind = msg.kind(), err = %err, "control: encode failed");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatcher.handle_text(&peer, text.as_str()).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary frames carry nothing in this protocol; pings are answered by the socket.
                    }
                    Some(Err(err)) => {
                        tracing::debug!(cid = %cid, err = %err, "control: read failed");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.disconnect(cid);
    drop(peer);

    // In-flight joins may still hold a sender; give queued replies a moment to flush.
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    tracing::info!(cid = %cid, client = %remote, "control: disconnected");
}
