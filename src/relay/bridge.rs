use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::relay::{
    control::{ConnId, Outbound},
    net,
    protocol::{McServer, ServerMessage},
    session::SessionStore,
    telemetry,
};

/// Client-to-target chunks queued per bridge before `mc-data` senders wait.
const TO_TARGET_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connect to {addr} timed out after {timeout}")]
    ConnectTimeout { addr: String, timeout: String },
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Owner's grip on a running bridge. Dropping it aborts the task, which
/// closes the target socket.
#[derive(Debug)]
pub struct BridgeHandle {
    id: u64,
    to_target: mpsc::Sender<Bytes>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    pub(crate) fn new(id: u64, to_target: mpsc::Sender<Bytes>, task: JoinHandle<()>) -> Self {
        Self {
            id,
            to_target,
            task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn to_target(&self) -> mpsc::Sender<Bytes> {
        self.to_target.clone()
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn connect(target: &McServer, timeout: Duration) -> Result<TcpStream, BridgeError> {
    let addr = net::target_addr(&target.host, target.port);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
        Err(_) => {
            return Err(BridgeError::ConnectTimeout {
                addr,
                timeout: humantime::format_duration(timeout).to_string(),
            });
        }
        Ok(Err(source)) => return Err(BridgeError::Connect { addr, source }),
        Ok(Ok(s)) => s,
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Everything a bridge task needs besides its socket.
pub struct BridgeContext {
    pub session_id: String,
    pub client: ConnId,
    pub client_tx: Outbound,
    pub sessions: Arc<SessionStore>,
    pub buffer_size: usize,
}

/// Starts the relay task for an established target socket.
///
/// The task idles until the returned `oneshot::Sender` fires, so the caller
/// can register the handle first; dropping the sender cancels the bridge.
pub fn spawn(ctx: BridgeContext, stream: TcpStream) -> (BridgeHandle, oneshot::Sender<()>) {
    let id = telemetry::next_seq();
    let (to_target_tx, to_target_rx) = mpsc::channel(TO_TARGET_QUEUE);
    let (armed_tx, armed_rx) = oneshot::channel();

    let task = tokio::spawn(run(id, ctx, stream, to_target_rx, armed_rx));
    (BridgeHandle::new(id, to_target_tx, task), armed_tx)
}

#[derive(Debug)]
enum End {
    TargetClosed,
    ClientGone,
    Released,
}

struct ActiveBridgeGuard;

impl ActiveBridgeGuard {
    fn new() -> Self {
        metrics::gauge!(telemetry::ACTIVE_BRIDGES).increment(1.0);
        Self
    }
}

impl Drop for ActiveBridgeGuard {
    fn drop(&mut self) {
        metrics::gauge!(telemetry::ACTIVE_BRIDGES).decrement(1.0);
    }
}

async fn run(
    id: u64,
    ctx: BridgeContext,
    stream: TcpStream,
    from_client: mpsc::Receiver<Bytes>,
    armed: oneshot::Receiver<()>,
) {
    if armed.await.is_err() {
        return;
    }
    let _active = ActiveBridgeGuard::new();

    tracing::debug!(sid = %ctx.session_id, cid = %ctx.client, bridge = id, "bridge: started");

    match relay(&ctx, stream, from_client).await {
        Ok(end) => {
            tracing::debug!(sid = %ctx.session_id, cid = %ctx.client, bridge = id, end = ?end, "bridge: closed");
        }
        Err(err) => {
            tracing::info!(sid = %ctx.session_id, cid = %ctx.client, bridge = id, err = %err, "bridge: target error");
            let _ = ctx
                .client_tx
                .send(ServerMessage::error(format!("connection to game server failed: {err}")))
                .await;
        }
    }

    // Must stay last: dropping our own handle aborts this task at its next await.
    ctx.sessions.detach_bridge(&ctx.session_id, ctx.client, id);
}

async fn relay(
    ctx: &BridgeContext,
    stream: TcpStream,
    mut from_client: mpsc::Receiver<Bytes>,
) -> std::io::Result<End> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = vec![0u8; ctx.buffer_size.max(1)];

    loop {
        tokio::select! {
            _ = ctx.client_tx.closed() => return Ok(End::ClientGone),
            res = rd.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(End::TargetClosed);
                }
                metrics::counter!(telemetry::BRIDGE_BYTES_TOTAL, "direction" => "to_client").increment(n as u64);
                if ctx
                    .client_tx
                    .send(ServerMessage::mc_data(&ctx.session_id, &buf[..n]))
                    .await
                    .is_err()
                {
                    return Ok(End::ClientGone);
                }
            }
            chunk = from_client.recv() => {
                let Some(chunk) = chunk else {
                    return Ok(End::Released);
                };
                wr.write_all(&chunk).await?;
                metrics::counter!(telemetry::BRIDGE_BYTES_TOTAL, "direction" => "to_target").increment(chunk.len() as u64);
            }
        }
    }
}
