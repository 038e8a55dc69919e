use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::relay::{
    bridge::{self, BridgeContext, BridgeOptions},
    control::{ConnId, Peer},
    discovery::{DiscoveryEntry, DiscoveryIndex},
    notifier::Notifier,
    protocol::{
        self, ClientMessage, ListedServer, McServer, RegisterError, RegisterRequest,
        ServerMessage, SessionSummary,
    },
    session::{ClosedSession, SessionStore},
    telemetry,
};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub bridge: BridgeOptions,
    pub client_to_target: bool,
    pub max_frame_bytes: usize,
    pub close_on_host_disconnect: bool,
    pub session_idle_timeout: Duration,
    pub discovery_ttl: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_expired: usize,
    pub discovery_evicted: usize,
}

/// Routes control frames to the session store, discovery index and bridge
/// engine. One instance is shared by every control connection.
pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    discovery: Arc<DiscoveryIndex>,
    notifier: Arc<Notifier>,
    opts: DispatchOptions,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        discovery: Arc<DiscoveryIndex>,
        notifier: Arc<Notifier>,
        opts: DispatchOptions,
    ) -> Self {
        Self {
            sessions,
            discovery,
            notifier,
            opts,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn discovery(&self) -> &Arc<DiscoveryIndex> {
        &self.discovery
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn connect(&self, peer: &Peer, remote: &str) {
        self.notifier.register(peer.id, peer.tx.clone(), remote);
    }

    /// Tears down everything the connection owned: its bridges, and (per
    /// configuration) the sessions it hosts.
    pub fn disconnect(&self, cid: ConnId) {
        self.notifier.unregister(cid);
        let released = self
            .sessions
            .release_connection(cid, self.opts.close_on_host_disconnect);

        if released.bridges_closed > 0 || !released.closed_sessions.is_empty() {
            tracing::info!(
                cid = %cid,
                bridges = released.bridges_closed,
                sessions = released.closed_sessions.len(),
                "dispatch: released connection resources"
            );
        }
        self.announce_closed(&released.closed_sessions);
    }

    /// Parses and dispatches one inbound text frame. Malformed frames are
    /// logged and dropped; the connection stays open.
    pub async fn handle_text(self: &Arc<Self>, peer: &Peer, text: &str) {
        match protocol::parse_client_frame(text, self.opts.max_frame_bytes) {
            Ok(msg) => self.dispatch(peer, msg).await,
            Err(err) => {
                tracing::warn!(cid = %peer.id, err = %err, "dispatch: malformed frame ignored");
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, peer: &Peer, msg: ClientMessage) {
        match msg {
            ClientMessage::Register(req) => self.register(peer, req).await,
            ClientMessage::List => {
                let servers = self
                    .sessions
                    .list()
                    .into_iter()
                    .map(ListedServer::from)
                    .collect();
                peer.reply(ServerMessage::List { servers }).await;
            }
            ClientMessage::JoinSession { id } => self.join(peer, id).await,
            ClientMessage::LeaveSession { id } => self.leave(peer, &id).await,
            ClientMessage::McData { id, data } if self.opts.client_to_target => {
                self.forward_to_target(peer, id.as_deref(), &data).await;
            }
            ClientMessage::McData { .. } => {
                tracing::debug!(cid = %peer.id, "dispatch: client mc-data disabled, frame ignored");
            }
            ClientMessage::Unknown => {
                tracing::debug!(cid = %peer.id, "dispatch: unknown frame type ignored");
            }
        }
    }

    /// Stores the session and its discovery entry. Shared by the control
    /// channel and the query surface; the caller announces the change.
    pub fn register_target(
        &self,
        id: Option<String>,
        target: McServer,
        host: Option<ConnId>,
    ) -> SessionSummary {
        let now = telemetry::now_unix_ms();
        let id = id.unwrap_or_else(telemetry::new_session_id);

        let registered = self
            .sessions
            .create_or_update(&id, target.clone(), host, now);
        self.discovery
            .upsert(target.discovery_key(), DiscoveryEntry::new(&target, &id, now));
        metrics::counter!(telemetry::SESSIONS_REGISTERED_TOTAL).increment(1);

        for cid in &registered.displaced {
            self.notifier
                .send_to(*cid, ServerMessage::SessionClosed { id: id.clone() });
        }

        tracing::info!(
            sid = %id,
            host = ?host.map(|h| h.to_string()),
            target = %target.discovery_key(),
            name = %target.name,
            replaced = registered.replaced,
            "dispatch: session registered"
        );
        registered.summary
    }

    /// Query-surface registration: validates, stores, and broadcasts
    /// `listChanged` on success.
    pub fn register_from_query(&self, req: RegisterRequest) -> Result<SessionSummary, RegisterError> {
        let (id, target) = req.into_target()?;
        let summary = self.register_target(id, target, None);
        self.notifier.broadcast(ServerMessage::ListChanged);
        Ok(summary)
    }

    /// Removes a session and closes its bridges. Returns false if unknown.
    pub fn close_session(&self, id: &str) -> bool {
        let Some(closed) = self.sessions.remove(id) else {
            return false;
        };
        tracing::info!(sid = %id, clients = closed.clients.len(), "dispatch: session closed");
        self.announce_closed(std::slice::from_ref(&closed));
        true
    }

    async fn register(&self, peer: &Peer, req: RegisterRequest) {
        let (id, target) = match req.into_target() {
            Ok(v) => v,
            Err(err) => {
                peer.reply(ServerMessage::error(format!("register failed: {err}")))
                    .await;
                return;
            }
        };

        let summary = self.register_target(id, target, Some(peer.id));
        peer.reply(ServerMessage::Created {
            id: summary.id,
            mc_server: summary.mc_server,
        })
        .await;
        self.notifier.broadcast(ServerMessage::ListChanged);
    }

    async fn join(self: &Arc<Self>, peer: &Peer, id: String) {
        let Some(target) = self.sessions.target(&id) else {
            tracing::debug!(cid = %peer.id, sid = %id, "dispatch: join for unknown session");
            peer.reply(ServerMessage::error(format!("session not found: {id}")))
                .await;
            return;
        };

        // The dial runs off the connection's task so later frames keep flowing.
        let this = Arc::clone(self);
        let peer = peer.clone();
        tokio::spawn(async move { this.complete_join(peer, id, target).await });
    }

    async fn complete_join(self: Arc<Self>, peer: Peer, id: String, target: McServer) {
        let stream = match bridge::connect(&target, self.opts.bridge.connect_timeout).await {
            Ok(s) => s,
            Err(err) => {
                tracing::info!(cid = %peer.id, sid = %id, err = %err, "dispatch: join dial failed");
                peer.reply(ServerMessage::error(format!(
                    "failed to reach game server: {err}"
                )))
                .await;
                return;
            }
        };

        // The outbound queue outlives a disconnect briefly; the notifier
        // table is what says whether the connection still exists.
        if !self.notifier.is_connected(peer.id) {
            tracing::debug!(cid = %peer.id, sid = %id, "dispatch: joiner left during dial");
            return;
        }

        let (handle, armed) = bridge::spawn(
            BridgeContext {
                session_id: id.clone(),
                client: peer.id,
                client_tx: peer.tx.clone(),
                sessions: self.sessions.clone(),
                buffer_size: self.opts.bridge.buffer_size,
            },
            stream,
        );
        let bridge_id = handle.id();

        let attached = match self
            .sessions
            .attach_bridge(&id, peer.id, handle, telemetry::now_unix_ms())
        {
            Ok(a) => a,
            Err(err) => {
                peer.reply(ServerMessage::error(err.to_string())).await;
                return;
            }
        };

        // A disconnect that raced the attach has already run its release;
        // undo the attach so the departed connection owns nothing.
        if !self.notifier.is_connected(peer.id) {
            self.sessions.detach_bridge(&id, peer.id, bridge_id);
            tracing::debug!(cid = %peer.id, sid = %id, "dispatch: joiner left during attach");
            return;
        }

        tracing::info!(
            cid = %peer.id,
            sid = %id,
            clients = attached.client_count,
            "dispatch: client joined"
        );

        // `joined` goes out before the bridge may queue any mc-data.
        peer.reply(ServerMessage::Joined {
            id: id.clone(),
            client_count: attached.client_count,
            mc_server: target,
        })
        .await;
        if let Some(host_tx) = attached.host.and_then(|h| self.notifier.sender(h)) {
            let _ = host_tx
                .send(ServerMessage::ClientJoined {
                    id,
                    client_count: attached.client_count,
                })
                .await;
        }
        let _ = armed.send(());
    }

    async fn leave(&self, peer: &Peer, id: &str) {
        match self
            .sessions
            .leave(id, peer.id, telemetry::now_unix_ms())
        {
            Ok(remaining) => {
                tracing::info!(cid = %peer.id, sid = %id, clients = remaining, "dispatch: client left");
                peer.reply(ServerMessage::Ok {
                    message: "left".into(),
                })
                .await;
            }
            Err(err) => peer.reply(ServerMessage::error(err.to_string())).await,
        }
    }

    async fn forward_to_target(&self, peer: &Peer, id: Option<&str>, data: &str) {
        let payload = match protocol::decode_payload(data) {
            Ok(p) => p,
            Err(err) => {
                peer.reply(ServerMessage::error(err.to_string())).await;
                return;
            }
        };
        let (sid, tx) = match self.sessions.bridge_sender(id, peer.id) {
            Ok(v) => v,
            Err(err) => {
                peer.reply(ServerMessage::error(err.to_string())).await;
                return;
            }
        };
        if payload.is_empty() {
            return;
        }
        if tx.send(Bytes::from(payload)).await.is_err() {
            peer.reply(ServerMessage::error(format!("bridge closed: {sid}")))
                .await;
        }
    }

    /// Periodic housekeeping: expires idle sessions and stale discovery
    /// entries.
    pub fn sweep(&self, now_ms: u64) -> SweepReport {
        let discovery_evicted = self.discovery.evict_stale(self.opts.discovery_ttl, now_ms);
        let closed = self.sessions.expire_idle(
            self.opts.session_idle_timeout,
            now_ms,
            |host| self.notifier.is_connected(host),
        );
        for s in &closed {
            tracing::info!(sid = %s.id, "sweep: idle session expired");
        }
        self.announce_closed(&closed);
        SweepReport {
            sessions_expired: closed.len(),
            discovery_evicted,
        }
    }

    fn announce_closed(&self, closed: &[ClosedSession]) {
        if closed.is_empty() {
            return;
        }
        for s in closed {
            for cid in &s.clients {
                self.notifier
                    .send_to(*cid, ServerMessage::SessionClosed { id: s.id.clone() });
            }
        }
        self.notifier.broadcast(ServerMessage::ListChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
        time::timeout,
    };

    const WAIT: Duration = Duration::from_secs(3);

    fn dispatcher_with(opts: impl FnOnce(&mut DispatchOptions)) -> Arc<Dispatcher> {
        let mut o = DispatchOptions {
            bridge: BridgeOptions {
                connect_timeout: Duration::from_secs(2),
                buffer_size: 16 * 1024,
            },
            client_to_target: true,
            max_frame_bytes: 1 << 20,
            close_on_host_disconnect: true,
            session_idle_timeout: Duration::from_secs(60),
            discovery_ttl: Duration::from_secs(60),
        };
        opts(&mut o);
        Arc::new(Dispatcher::new(
            Arc::new(SessionStore::new()),
            Arc::new(DiscoveryIndex::new()),
            Arc::new(Notifier::new()),
            o,
        ))
    }

    fn dispatcher() -> Arc<Dispatcher> {
        dispatcher_with(|_| {})
    }

    fn connect_peer(d: &Dispatcher) -> (Peer, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let peer = Peer::new(tx);
        d.connect(&peer, "test");
        (peer, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed")
    }

    /// Skips broadcast noise until a frame that is not `listChanged` arrives.
    async fn next_reply(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        loop {
            let msg = next(rx).await;
            if msg != ServerMessage::ListChanged {
                return msg;
            }
        }
    }

    async fn register(d: &Arc<Dispatcher>, peer: &Peer, rx: &mut mpsc::Receiver<ServerMessage>, frame: &str) -> String {
        d.handle_text(peer, frame).await;
        match next_reply(rx).await {
            ServerMessage::Created { id, .. } => id,
            other => panic!("expected created, got {other:?}"),
        }
    }

    async fn game_server() -> (TcpListener, u16) {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        (ln, port)
    }

    #[tokio::test]
    async fn register_then_list_roundtrip() {
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (other, mut other_rx) = connect_peer(&d);

        let id = register(
            &d,
            &host,
            &mut host_rx,
            r#"{"type":"register","name":"World1","ip":"10.0.0.5","port":19132}"#,
        )
        .await;
        assert!(id.starts_with("lan-"));
        assert_eq!(next(&mut other_rx).await, ServerMessage::ListChanged);

        d.handle_text(&other, r#"{"type":"list"}"#).await;
        let ServerMessage::List { servers } = next_reply(&mut other_rx).await else {
            panic!("expected list");
        };
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, id);
        assert_eq!(
            servers[0].server,
            McServer {
                name: "World1".into(),
                host: "10.0.0.5".into(),
                port: 19132,
            }
        );

        let e = d.discovery().get("10.0.0.5:19132").expect("discovery entry");
        assert_eq!(e.session_id, id);
    }

    #[tokio::test]
    async fn reregister_same_id_keeps_only_latest() {
        let d = dispatcher();
        let (host, mut rx) = connect_peer(&d);
        register(&d, &host, &mut rx, r#"{"type":"create-session","id":"w","name":"A","ip":"10.0.0.1","port":1}"#).await;
        register(&d, &host, &mut rx, r#"{"type":"register-server","id":"w","name":"B","ip":"10.0.0.2","port":2}"#).await;

        let list = d.sessions().list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].mc_server.name, "B");
        assert_eq!(list[0].mc_server.port, 2);
    }

    #[tokio::test]
    async fn join_unknown_session_is_an_error_without_side_effects() {
        let d = dispatcher();
        let (peer, mut rx) = connect_peer(&d);
        d.handle_text(&peer, r#"{"type":"join-session","id":"missing"}"#).await;

        let ServerMessage::Error { message } = next(&mut rx).await else {
            panic!("expected error");
        };
        assert!(message.contains("missing"));
        assert_eq!(d.sessions().len(), 0);
        assert_eq!(d.discovery().len(), 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_ignored() {
        let d = dispatcher();
        let (peer, mut rx) = connect_peer(&d);
        d.handle_text(&peer, "{not json").await;
        d.handle_text(&peer, r#"{"type":"teleport"}"#).await;
        d.handle_text(&peer, r#"{"type":"list"}"#).await;
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::List { servers: vec![] }
        );
    }

    #[tokio::test]
    async fn join_relays_target_bytes_and_notifies_host() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);

        let frame = format!(r#"{{"type":"register","name":"World1","ip":"127.0.0.1","port":{port}}}"#);
        let id = register(&d, &host, &mut host_rx, &frame).await;

        let chunks: Vec<Vec<u8>> = vec![b"first".to_vec(), vec![0, 1, 2, 255], b"third".to_vec()];
        let server = tokio::spawn({
            let chunks = chunks.clone();
            async move {
                let (mut s, _) = ln.accept().await.unwrap();
                for c in chunks {
                    s.write_all(&c).await.unwrap();
                    s.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                s
            }
        });

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;

        let ServerMessage::Joined { client_count, mc_server, .. } = next_reply(&mut client_rx).await
        else {
            panic!("expected joined");
        };
        assert_eq!(client_count, 1);
        assert_eq!(mc_server.port, port);
        assert_eq!(
            next_reply(&mut host_rx).await,
            ServerMessage::ClientJoined {
                id: id.clone(),
                client_count: 1,
            }
        );

        let expected: Vec<u8> = chunks.concat();
        let mut got = Vec::new();
        while got.len() < expected.len() {
            let ServerMessage::McData { id: sid, data } = next_reply(&mut client_rx).await else {
                panic!("expected mc-data");
            };
            assert_eq!(sid, id);
            got.extend(protocol::decode_payload(&data).unwrap());
        }
        assert_eq!(got, expected);

        // Target closes: bridge is removed without notifying anyone.
        drop(server.await.unwrap());
        let deadline = tokio::time::Instant::now() + WAIT;
        while d.sessions().client_count(&id) != Some(0) {
            assert!(tokio::time::Instant::now() < deadline, "bridge not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_joins_get_independent_bridges() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (a, mut a_rx) = connect_peer(&d);
        let (b, mut b_rx) = connect_peer(&d);

        let accept = tokio::spawn(async move {
            let (s1, _) = ln.accept().await.unwrap();
            let (s2, _) = ln.accept().await.unwrap();
            (s1, s2)
        });

        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","id":"w","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;
        let join = format!(r#"{{"type":"join-session","id":"{id}"}}"#);
        d.handle_text(&a, &join).await;
        d.handle_text(&b, &join).await;

        let mut counts = Vec::new();
        for rx in [&mut a_rx, &mut b_rx] {
            let ServerMessage::Joined { client_count, .. } = next_reply(rx).await else {
                panic!("expected joined");
            };
            counts.push(client_count);
        }
        counts.sort();
        assert_eq!(counts, vec![1, 2]);

        let mut host_counts = Vec::new();
        for _ in 0..2 {
            let ServerMessage::ClientJoined { id: sid, client_count } = next_reply(&mut host_rx).await
            else {
                panic!("expected client-joined");
            };
            assert_eq!(sid, id);
            host_counts.push(client_count);
        }
        host_counts.sort();
        assert_eq!(host_counts, vec![1, 2]);

        assert_eq!(d.sessions().client_count(&id), Some(2));
        let _sockets = accept.await.unwrap();
    }

    #[tokio::test]
    async fn client_joined_waits_for_a_full_host_queue() {
        let (ln, port) = game_server().await;
        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });

        let d = dispatcher();
        let (host_tx, mut host_rx) = mpsc::channel(1);
        let host = Peer::new(host_tx);
        d.connect(&host, "host");
        let (client, mut client_rx) = connect_peer(&d);
        d.register_target(
            Some("w".into()),
            McServer {
                name: "World".into(),
                host: "127.0.0.1".into(),
                port,
            },
            Some(host.id),
        );

        // The host's only slot is taken before the join lands.
        host.tx.try_send(ServerMessage::ListChanged).unwrap();
        d.handle_text(&client, r#"{"type":"join-session","id":"w"}"#).await;
        assert!(matches!(next(&mut client_rx).await, ServerMessage::Joined { .. }));

        assert_eq!(next(&mut host_rx).await, ServerMessage::ListChanged);
        assert_eq!(
            next(&mut host_rx).await,
            ServerMessage::ClientJoined {
                id: "w".into(),
                client_count: 1,
            }
        );
        let _target = accept.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_during_dial_leaves_no_bridge() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = Vec::new();
            // EOF: the relay dropped the dialed socket.
            s.read_to_end(&mut buf).await.unwrap();
        });

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;
        // The dial task has not run yet; the client is gone before it does.
        d.disconnect(client.id);

        timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(d.sessions().client_count(&id), Some(0));
        while let Ok(msg) = host_rx.try_recv() {
            assert!(!matches!(msg, ServerMessage::ClientJoined { .. }), "{msg:?}");
        }
        while let Ok(msg) = client_rx.try_recv() {
            assert!(!matches!(msg, ServerMessage::Joined { .. }), "{msg:?}");
        }
    }

    #[tokio::test]
    async fn target_reset_reports_error_and_removes_bridge() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        let (reset_tx, reset_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let (s, _) = ln.accept().await.unwrap();
            let _ = reset_rx.await;
            // Zero linger turns the close into an RST.
            #[allow(deprecated)]
            s.set_linger(Some(Duration::ZERO)).unwrap();
            drop(s);
        });

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;
        assert!(matches!(next_reply(&mut client_rx).await, ServerMessage::Joined { .. }));
        reset_tx.send(()).unwrap();
        timeout(WAIT, server).await.unwrap().unwrap();

        let ServerMessage::Error { message } = next_reply(&mut client_rx).await else {
            panic!("expected error");
        };
        assert!(message.contains("connection to game server failed"), "{message}");
        let deadline = tokio::time::Instant::now() + WAIT;
        while d.sessions().client_count(&id) != Some(0) {
            assert!(tokio::time::Instant::now() < deadline, "bridge not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn overwrite_closes_session_for_joined_clients() {
        let (ln, port) = game_server().await;
        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });

        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let frame = format!(r#"{{"type":"register","id":"w","ip":"127.0.0.1","port":{port}}}"#);
        register(&d, &host, &mut host_rx, &frame).await;

        d.handle_text(&client, r#"{"type":"join-session","id":"w"}"#).await;
        assert!(matches!(next_reply(&mut client_rx).await, ServerMessage::Joined { .. }));
        let _target = accept.await.unwrap();

        register(&d, &host, &mut host_rx, &frame).await;
        assert_eq!(
            next_reply(&mut client_rx).await,
            ServerMessage::SessionClosed { id: "w".into() }
        );
        assert_eq!(d.sessions().client_count("w"), Some(0));
    }

    #[tokio::test]
    async fn host_disconnect_notifies_joined_clients() {
        let (ln, port) = game_server().await;
        let accept = tokio::spawn(async move { ln.accept().await.unwrap().0 });

        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","id":"w","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        d.handle_text(&client, r#"{"type":"join-session","id":"w"}"#).await;
        assert!(matches!(next_reply(&mut client_rx).await, ServerMessage::Joined { .. }));
        let _target = accept.await.unwrap();

        d.disconnect(host.id);
        assert_eq!(
            next_reply(&mut client_rx).await,
            ServerMessage::SessionClosed { id: "w".into() }
        );
        assert!(d.sessions().get("w").is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_dropped_and_peer_stays_connected() {
        let d = dispatcher_with(|o| o.max_frame_bytes = 32);
        let (peer, mut rx) = connect_peer(&d);
        let big = format!(r#"{{"type":"list","pad":"{}"}}"#, "x".repeat(64));
        d.handle_text(&peer, &big).await;
        assert!(rx.try_recv().is_err());
        assert!(d.notifier().is_connected(peer.id));

        d.handle_text(&peer, r#"{"type":"list"}"#).await;
        assert_eq!(next(&mut rx).await, ServerMessage::List { servers: vec![] });
    }

    #[tokio::test]
    async fn failed_dial_registers_no_bridge() {
        let (ln, port) = game_server().await;
        drop(ln);

        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;
        let ServerMessage::Error { message } = next_reply(&mut client_rx).await else {
            panic!("expected error");
        };
        assert!(message.contains("failed to reach"), "{message}");
        assert_eq!(d.sessions().client_count(&id), Some(0));
    }

    #[tokio::test]
    async fn client_bytes_reach_target_and_leave_closes_bridge() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        let (got_tx, got_rx) = tokio::sync::oneshot::channel();
        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut got = [0u8; 5];
            s.read_exact(&mut got).await.unwrap();
            got_tx.send(got).unwrap();
            let mut rest = Vec::new();
            s.read_to_end(&mut rest).await.unwrap();
            rest
        });

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;
        assert!(matches!(next_reply(&mut client_rx).await, ServerMessage::Joined { .. }));

        // "hello" in base64.
        d.handle_text(&client, r#"{"type":"mc-data","data":"aGVsbG8="}"#).await;
        assert_eq!(&timeout(WAIT, got_rx).await.unwrap().unwrap(), b"hello");

        d.handle_text(&client, &format!(r#"{{"type":"leave-session","id":"{id}"}}"#))
            .await;
        assert_eq!(
            next_reply(&mut client_rx).await,
            ServerMessage::Ok {
                message: "left".into()
            }
        );

        assert!(timeout(WAIT, server).await.unwrap().unwrap().is_empty());
        assert_eq!(d.sessions().client_count(&id), Some(0));
    }

    #[tokio::test]
    async fn mc_data_is_ignored_when_client_to_target_disabled() {
        let d = dispatcher_with(|o| o.client_to_target = false);
        let (peer, mut rx) = connect_peer(&d);
        d.handle_text(&peer, r#"{"type":"mc-data","data":"aGVsbG8="}"#).await;
        d.handle_text(&peer, r#"{"type":"list"}"#).await;
        assert!(matches!(next(&mut rx).await, ServerMessage::List { .. }));
    }

    #[tokio::test]
    async fn client_disconnect_releases_its_bridge() {
        let (ln, port) = game_server().await;
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (client, mut client_rx) = connect_peer(&d);
        let id = register(
            &d,
            &host,
            &mut host_rx,
            &format!(r#"{{"type":"register","ip":"127.0.0.1","port":{port}}}"#),
        )
        .await;

        let server = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut buf = Vec::new();
            // EOF here means the relay closed its side.
            s.read_to_end(&mut buf).await.unwrap();
        });

        d.handle_text(&client, &format!(r#"{{"type":"join-session","id":"{id}"}}"#))
            .await;
        assert!(matches!(next_reply(&mut client_rx).await, ServerMessage::Joined { .. }));

        d.disconnect(client.id);
        assert_eq!(d.sessions().client_count(&id), Some(0));
        timeout(WAIT, server).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn host_disconnect_closes_hosted_sessions() {
        let d = dispatcher();
        let (host, mut host_rx) = connect_peer(&d);
        let (_watcher, mut watcher_rx) = connect_peer(&d);
        let id = register(&d, &host, &mut host_rx, r#"{"type":"register","ip":"10.0.0.9"}"#).await;
        assert_eq!(next(&mut watcher_rx).await, ServerMessage::ListChanged);

        d.disconnect(host.id);
        assert!(d.sessions().get(&id).is_none());
        assert_eq!(next(&mut watcher_rx).await, ServerMessage::ListChanged);
    }

    #[tokio::test]
    async fn sessions_survive_host_when_configured() {
        let d = dispatcher_with(|o| o.close_on_host_disconnect = false);
        let (host, mut host_rx) = connect_peer(&d);
        let id = register(&d, &host, &mut host_rx, r#"{"type":"register"}"#).await;
        d.disconnect(host.id);
        assert!(d.sessions().get(&id).is_some());
    }

    #[tokio::test]
    async fn sweep_expires_idle_hostless_sessions_and_stale_discovery() {
        let d = dispatcher_with(|o| {
            o.session_idle_timeout = Duration::from_secs(1);
            o.discovery_ttl = Duration::from_secs(1);
        });
        let summary = d
            .register_from_query(RegisterRequest {
                name: Some("Query".into()),
                ..Default::default()
            })
            .unwrap();

        let now = telemetry::now_unix_ms();
        assert_eq!(d.sweep(now), SweepReport::default());

        let later = now + 5_000;
        let report = d.sweep(later);
        assert_eq!(report.sessions_expired, 1);
        assert_eq!(report.discovery_evicted, 1);
        assert!(d.sessions().get(&summary.id).is_none());
    }

    #[tokio::test]
    async fn query_registration_rejects_invalid_port() {
        let d = dispatcher();
        let err = d
            .register_from_query(RegisterRequest {
                port: Some(protocol::PortValue::Number(0)),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, RegisterError::InvalidPort(_)));
        assert_eq!(d.sessions().len(), 0);
    }
}
