//! Authoritative session registry.
//!
//! A session binds one registered target to the clients bridged to it. Every
//! operation takes the single registry lock, runs to completion and releases
//! it before returning; nothing here awaits. Bridge handles that leave the
//! map are dropped after the lock is released, which aborts their tasks.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::relay::{
    bridge::BridgeHandle,
    control::ConnId,
    protocol::{McServer, SessionSummary},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("not joined to session {0}")]
    NotJoined(String),
    #[error("not joined to any session")]
    NoBridge,
    #[error("joined to several sessions; include an id")]
    Ambiguous,
}

struct Session {
    id: String,
    host: Option<ConnId>,
    target: McServer,
    clients: HashMap<ConnId, BridgeHandle>,
    created_at: u64,
    last_activity: u64,
}

impl Session {
    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            client_count: self.clients.len(),
            mc_server: self.target.clone(),
            created_at: self.created_at,
        }
    }
}

/// A session removed from the store, with the clients that were bridged to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    pub id: String,
    pub clients: Vec<ConnId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attached {
    pub client_count: usize,
    pub host: Option<ConnId>,
}

#[derive(Debug, Default)]
pub struct Released {
    pub bridges_closed: usize,
    pub closed_sessions: Vec<ClosedSession>,
}

#[derive(Debug)]
pub struct Registered {
    pub summary: SessionSummary,
    /// Clients whose bridges went away because the id was overwritten.
    pub displaced: Vec<ConnId>,
    pub replaced: bool,
}

#[derive(Default)]
pub struct SessionStore {
    state: Mutex<HashMap<String, Session>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        // Nothing panics while holding the lock, but a poisoned map is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the session or overwrites an existing one with the same id
    /// (last writer wins, no merge).
    pub fn create_or_update(
        &self,
        id: &str,
        target: McServer,
        host: Option<ConnId>,
        now_ms: u64,
    ) -> Registered {
        let session = Session {
            id: id.to_string(),
            host,
            target,
            clients: HashMap::new(),
            created_at: now_ms,
            last_activity: now_ms,
        };
        let summary = session.summary();

        let old = self.lock().insert(id.to_string(), session);

        let replaced = old.is_some();
        let displaced = old
            .map(|s| s.clients.into_keys().collect())
            .unwrap_or_default();
        Registered {
            summary,
            displaced,
            replaced,
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionSummary> {
        self.lock().get(id).map(Session::summary)
    }

    pub fn target(&self, id: &str) -> Option<McServer> {
        self.lock().get(id).map(|s| s.target.clone())
    }

    pub fn client_count(&self, id: &str) -> Option<usize> {
        self.lock().get(id).map(|s| s.clients.len())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot ordered by creation time, then id.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self.lock().values().map(Session::summary).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Registers `bridge` as `client`'s socket in session `id`. A previous
    /// bridge of the same client in that session is replaced and closed.
    pub fn attach_bridge(
        &self,
        id: &str,
        client: ConnId,
        bridge: BridgeHandle,
        now_ms: u64,
    ) -> Result<Attached, SessionError> {
        let mut st = self.lock();
        let Some(s) = st.get_mut(id) else {
            drop(st);
            drop(bridge);
            return Err(SessionError::NotFound(id.to_string()));
        };
        let previous = s.clients.insert(client, bridge);
        s.last_activity = now_ms;
        let attached = Attached {
            client_count: s.clients.len(),
            host: s.host,
        };
        drop(st);
        drop(previous);
        Ok(attached)
    }

    /// Removes `client`'s bridge from session `id`, but only if it is still
    /// bridge `bridge_id`; a newer bridge for the same pair is left alone.
    pub fn detach_bridge(&self, id: &str, client: ConnId, bridge_id: u64) -> Option<usize> {
        let mut st = self.lock();
        let s = st.get_mut(id)?;
        if s.clients.get(&client).is_none_or(|b| b.id() != bridge_id) {
            return None;
        }
        let removed = s.clients.remove(&client);
        s.last_activity = crate::relay::telemetry::now_unix_ms();
        let count = s.clients.len();
        drop(st);
        drop(removed);
        Some(count)
    }

    /// Explicit leave: closes `client`'s bridge in session `id`.
    pub fn leave(&self, id: &str, client: ConnId, now_ms: u64) -> Result<usize, SessionError> {
        let mut st = self.lock();
        let s = st
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let removed = s
            .clients
            .remove(&client)
            .ok_or_else(|| SessionError::NotJoined(id.to_string()))?;
        s.last_activity = now_ms;
        let count = s.clients.len();
        drop(st);
        drop(removed);
        Ok(count)
    }

    /// Finds the sender feeding `client`'s bridge. Without an id the client
    /// must be joined to exactly one session.
    pub fn bridge_sender(
        &self,
        id: Option<&str>,
        client: ConnId,
    ) -> Result<(String, mpsc::Sender<Bytes>), SessionError> {
        let st = self.lock();
        if let Some(id) = id {
            let s = st
                .get(id)
                .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
            let b = s
                .clients
                .get(&client)
                .ok_or_else(|| SessionError::NotJoined(id.to_string()))?;
            return Ok((s.id.clone(), b.to_target()));
        }

        let mut found = st
            .values()
            .filter_map(|s| s.clients.get(&client).map(|b| (s.id.clone(), b.to_target())));
        let first = found.next().ok_or(SessionError::NoBridge)?;
        if found.next().is_some() {
            return Err(SessionError::Ambiguous);
        }
        Ok(first)
    }

    /// Releases everything `conn` owns: its bridges in any session and, when
    /// `close_hosted` is set, the sessions it hosts.
    pub fn release_connection(&self, conn: ConnId, close_hosted: bool) -> Released {
        let mut dropped = Vec::new();
        let mut out = Released::default();

        let mut st = self.lock();
        for s in st.values_mut() {
            if let Some(b) = s.clients.remove(&conn) {
                dropped.push(b);
            }
        }
        out.bridges_closed = dropped.len();

        if close_hosted {
            let hosted: Vec<String> = st
                .values()
                .filter(|s| s.host == Some(conn))
                .map(|s| s.id.clone())
                .collect();
            for id in hosted {
                if let Some(s) = st.remove(&id) {
                    out.closed_sessions.push(close(s, &mut dropped));
                }
            }
        }
        drop(st);
        drop(dropped);
        out
    }

    pub fn remove(&self, id: &str) -> Option<ClosedSession> {
        let mut dropped = Vec::new();
        let closed = self.lock().remove(id).map(|s| close(s, &mut dropped));
        drop(dropped);
        closed
    }

    /// Removes sessions with no clients and no live host that have been
    /// idle for longer than `idle`. A zero `idle` disables expiry.
    pub fn expire_idle(
        &self,
        idle: Duration,
        now_ms: u64,
        host_alive: impl Fn(ConnId) -> bool,
    ) -> Vec<ClosedSession> {
        if idle.is_zero() {
            return Vec::new();
        }
        let idle_ms = idle.as_millis() as u64;
        let mut st = self.lock();
        let expired: Vec<String> = st
            .values()
            .filter(|s| {
                s.clients.is_empty()
                    && !s.host.is_some_and(&host_alive)
                    && now_ms.saturating_sub(s.last_activity) > idle_ms
            })
            .map(|s| s.id.clone())
            .collect();
        let mut dropped = Vec::new();
        let closed = expired
            .into_iter()
            .filter_map(|id| st.remove(&id))
            .map(|s| close(s, &mut dropped))
            .collect();
        drop(st);
        closed
    }
}

fn close(s: Session, dropped: &mut Vec<BridgeHandle>) -> ClosedSession {
    let mut clients = Vec::with_capacity(s.clients.len());
    for (cid, b) in s.clients {
        clients.push(cid);
        dropped.push(b);
    }
    clients.sort();
    ClosedSession { id: s.id, clients }
}
