use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rand::Rng;

pub const CONTROL_CONNECTIONS: &str = "lanrelay_control_connections";
pub const CONTROL_CONNECTIONS_TOTAL: &str = "lanrelay_control_connections_total";
pub const SESSIONS_REGISTERED_TOTAL: &str = "lanrelay_sessions_registered_total";
pub const ACTIVE_BRIDGES: &str = "lanrelay_active_bridges";
pub const BRIDGE_BYTES_TOTAL: &str = "lanrelay_bridge_bytes_total";
pub const BROADCAST_DROPS_TOTAL: &str = "lanrelay_broadcast_drops_total";

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Counts one live control connection for as long as it is held.
pub struct ControlConnGuard;

impl ControlConnGuard {
    pub fn new() -> Self {
        metrics::counter!(CONTROL_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONTROL_CONNECTIONS).increment(1.0);
        Self
    }
}

impl Drop for ControlConnGuard {
    fn drop(&mut self) {
        metrics::gauge!(CONTROL_CONNECTIONS).decrement(1.0);
    }
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn next_seq() -> u64 {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

const ID_SUFFIX_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates a session id of the form `lan-<unix ms>-<6 base36 chars>`.
pub fn new_session_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| ID_SUFFIX_CHARS[rng.random_range(0..ID_SUFFIX_CHARS.len())] as char)
        .collect();
    format!("lan-{}-{suffix}", now_unix_ms())
}
