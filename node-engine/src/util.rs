use rand::RngCore;
use std::net::TcpListener;

/// Bind an ephemeral TCP port to find one the OS considers free, then
/// release it immediately. Inherently racy against other binders, but
/// good enough for picking a loopback port for an engine's local admin
/// API (Xray's stats API, Hysteria2's auth callback).
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A random lowercase hex string of `len` characters, used for short-lived
/// local secrets (e.g. the Xray API auth token) that never cross the wire
/// to the controller and so need no deterministic derivation.
pub fn random_secret_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = hex::encode(bytes);
    hex.truncate(len);
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_free_port_returns_a_bindable_port() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
    }

    #[test]
    fn random_secret_hex_has_requested_length() {
        assert_eq!(random_secret_hex(16).len(), 16);
        assert_eq!(random_secret_hex(7).len(), 7);
    }

    #[test]
    fn random_secret_hex_is_lowercase_hex() {
        let s = random_secret_hex(32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
