use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A controller-issued user. `(id, username)` is the logical primary key;
/// the pair is rendered as `"<id>.<username>"` wherever an engine needs a
/// per-account identifier — this is the only encoding permitted, since the
/// controller uses it verbatim to de-map usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
    /// Per-user secret seed; credentials are deterministically derived from it.
    pub key: String,
}

/// Render the `"<id>.<username>"` identifier used by every engine's admin API.
pub fn user_identifier(user: &User) -> String {
    format!("{}.{}", user.id, user.username)
}

/// Parse a `"<id>.<username>"` identifier back into its numeric id.
///
/// Usage aggregation keys stats by this prefix; malformed identifiers
/// (never emitted by this agent, but possibly left over from a stale
/// engine process) are skipped by the caller rather than causing a panic.
pub fn parse_user_id(identifier: &str) -> Option<u64> {
    identifier.split('.').next()?.parse().ok()
}

/// Protocols an inbound may speak. Not every engine supports every protocol;
/// the adapter rejects unsupported combinations at config-parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
    #[serde(rename = "shadowtls")]
    ShadowTls,
    Naive,
    Socks,
    Mixed,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vmess => "vmess",
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::ShadowTls => "shadowtls",
            Protocol::Naive => "naive",
            Protocol::Socks => "socks",
            Protocol::Mixed => "mixed",
            Protocol::Http => "http",
        }
    }
}

/// A named listening endpoint of a proxy engine. `tag` is globally unique
/// across every engine on the node; it is the routing key from the control
/// plane to an engine adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub tag: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// The supervised backend kinds this agent knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Xray,
    #[serde(rename = "sing-box")]
    SingBox,
    Hysteria2,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Xray => "xray",
            EngineKind::SingBox => "sing-box",
            EngineKind::Hysteria2 => "hysteria2",
        }
    }
}

/// Snapshot of a supervised engine, exposed to the controller via `FetchBackends`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: EngineKind,
    pub version: Option<String>,
    pub inbounds: Vec<Inbound>,
    pub running: bool,
}

/// Compute the added/removed tag sets for a `SyncUsers` diff step.
pub fn diff_inbounds(old: &HashSet<String>, new: &HashSet<String>) -> (HashSet<String>, HashSet<String>) {
    let added = new.difference(old).cloned().collect();
    let removed = old.difference(new).cloned().collect();
    (added, removed)
}
