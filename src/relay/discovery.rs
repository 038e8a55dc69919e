use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use crate::relay::protocol::McServer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryEntry {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub session_id: String,
    pub last_seen: u64,
}

impl DiscoveryEntry {
    pub fn new(server: &McServer, session_id: &str, now_ms: u64) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            name: server.name.clone(),
            session_id: session_id.to_string(),
            last_seen: now_ms,
        }
    }
}

/// Last-seen descriptors keyed by `host:port`, independent of session state.
#[derive(Debug, Default)]
pub struct DiscoveryIndex {
    entries: DashMap<String, DiscoveryEntry>,
}

impl DiscoveryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, key: String, entry: DiscoveryEntry) {
        self.entries.insert(key, entry);
    }

    pub fn get(&self, key: &str) -> Option<DiscoveryEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Newest first.
    pub fn list(&self) -> Vec<DiscoveryEntry> {
        let mut out: Vec<DiscoveryEntry> = self.entries.iter().map(|e| e.value().clone()).collect();
        out.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.host.cmp(&b.host))
                .then_with(|| a.port.cmp(&b.port))
        });
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops entries not seen for longer than `ttl`. A zero ttl keeps everything.
    pub fn evict_stale(&self, ttl: Duration, now_ms: u64) -> usize {
        if ttl.is_zero() {
            return 0;
        }
        let ttl_ms = ttl.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_ms.saturating_sub(e.last_seen) <= ttl_ms);
        before.saturating_sub(self.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(host: &str, port: u16, name: &str) -> McServer {
        McServer {
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    #[test]
    fn upsert_refreshes_last_seen_and_session() {
        let idx = DiscoveryIndex::new();
        let s = server("10.0.0.5", 19132, "World1");
        idx.upsert(s.discovery_key(), DiscoveryEntry::new(&s, "lan-1-aaaaaa", 100));
        idx.upsert(s.discovery_key(), DiscoveryEntry::new(&s, "lan-2-bbbbbb", 200));

        assert_eq!(idx.len(), 1);
        let e = idx.get("10.0.0.5:19132").expect("entry");
        assert_eq!(e.session_id, "lan-2-bbbbbb");
        assert_eq!(e.last_seen, 200);
    }

    #[test]
    fn evicts_only_entries_older_than_ttl() {
        let idx = DiscoveryIndex::new();
        let old = server("10.0.0.5", 19132, "old");
        let fresh = server("10.0.0.6", 19132, "fresh");
        idx.upsert(old.discovery_key(), DiscoveryEntry::new(&old, "a", 1_000));
        idx.upsert(fresh.discovery_key(), DiscoveryEntry::new(&fresh, "b", 9_000));

        assert_eq!(idx.evict_stale(Duration::ZERO, 100_000), 0);
        assert_eq!(idx.evict_stale(Duration::from_secs(5), 10_000), 1);

        let left = idx.list();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "fresh");
    }
}
