use std::borrow::Cow;

/// Expands the `":PORT"` listen shorthand to `"0.0.0.0:PORT"`; tokio's bind
/// does not accept a missing host.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Builds a dialable `host:port` string for a registered target.
///
/// Bare IPv6 literals get brackets; hosts that are already bracketed or are
/// names/IPv4 pass through unchanged.
pub fn target_addr(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
