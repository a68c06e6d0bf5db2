use crate::singbox::accounts::{identifies, render_account};
use crate::xray::config::derive_x25519;
use node_core::keys::CredentialMode;
use node_core::model::{Inbound, Protocol};
use node_core::NodeError;
use serde_json::{json, Map, Value};
use std::path::Path;

const SUPPORTED_TYPES: &[&str] = &[
    "shadowsocks",
    "vmess",
    "trojan",
    "vless",
    "hysteria2",
    "tuic",
    "shadowtls",
];

/// Parsed and API-augmented sing-box configuration.
///
/// Mirrors the reference `SingBoxConfig`: resolve the operator's inbound
/// list into typed descriptors for storage, then enable the `v2ray_api`
/// experimental feature sing-box exposes for exactly this purpose — a
/// `StatsService`/`HandlerService` pair wire-compatible with Xray's.
pub struct SingBoxConfig {
    document: Map<String, Value>,
    inbounds: Vec<Inbound>,
}

impl SingBoxConfig {
    pub fn parse(raw: &str, api_host: &str, api_port: u16, xray_binary: &Path) -> Result<Self, NodeError> {
        let value: Value =
            json5::from_str(raw).map_err(|e| NodeError::ConfigInvalid(format!("sing-box config: {e}")))?;
        let Value::Object(mut document) = value else {
            return Err(NodeError::ConfigInvalid("sing-box config: not a JSON object".into()));
        };

        let inbounds = resolve_inbounds(&document, xray_binary)?;
        apply_v2ray_api(&mut document, api_host, api_port);

        Ok(Self { document, inbounds })
    }

    pub fn list_inbounds(&self) -> Vec<Inbound> {
        self.inbounds.clone()
    }

    /// Add `identifier`'s account to every raw inbound entry tagged `tag`,
    /// and register it with the `v2ray_api` stats user list so its traffic
    /// is counted. Idempotent: a repeat add is a silent no-op duplicate
    /// rather than an error — the dirty flag only fires the reload.
    pub fn append_user(&mut self, tag: &str, protocol: Protocol, identifier: &str, seed: &str, mode: CredentialMode) {
        let account = render_account(protocol, identifier, seed, mode);
        if let Some(Value::Array(inbounds)) = self.document.get_mut("inbounds") {
            for inbound in inbounds {
                if inbound.get("tag").and_then(Value::as_str) != Some(tag) {
                    continue;
                }
                let users = inbound
                    .as_object_mut()
                    .unwrap()
                    .entry("users")
                    .or_insert_with(|| json!([]));
                if let Value::Array(users) = users {
                    if !users.iter().any(|u| identifies(u, identifier)) {
                        users.push(Value::Object(account));
                    }
                }
                break;
            }
        }
        self.mark_stats_user(identifier);
    }

    pub fn pop_user(&mut self, tag: &str, identifier: &str) {
        if let Some(Value::Array(inbounds)) = self.document.get_mut("inbounds") {
            for inbound in inbounds {
                if inbound.get("tag").and_then(Value::as_str) != Some(tag) {
                    continue;
                }
                if let Some(Value::Array(users)) = inbound.get_mut("users") {
                    users.retain(|u| !identifies(u, identifier));
                }
                break;
            }
        }
    }

    fn mark_stats_user(&mut self, identifier: &str) {
        let Some(experimental) = self.document.get_mut("experimental").and_then(Value::as_object_mut) else {
            return;
        };
        let Some(api) = experimental.get_mut("v2ray_api").and_then(Value::as_object_mut) else {
            return;
        };
        let Some(Value::Object(stats)) = api.get_mut("stats") else {
            return;
        };
        if let Some(Value::Array(users)) = stats.get_mut("users") {
            if !users.iter().any(|u| u.as_str() == Some(identifier)) {
                users.push(json!(identifier));
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&Value::Object(self.document.clone()))
            .expect("config document is always valid JSON")
    }
}

fn resolve_inbounds(document: &Map<String, Value>, xray_binary: &Path) -> Result<Vec<Inbound>, NodeError> {
    let mut inbounds = Vec::new();
    let Some(Value::Array(raw_inbounds)) = document.get("inbounds") else {
        return Ok(inbounds);
    };

    for raw in raw_inbounds {
        let Some(obj) = raw.as_object() else { continue };
        let Some(tag) = obj.get("tag").and_then(Value::as_str) else { continue };
        let Some(kind) = obj.get("type").and_then(Value::as_str) else { continue };
        if !SUPPORTED_TYPES.contains(&kind) {
            continue;
        }
        let protocol = parse_protocol(kind)?;

        let mut settings = Map::new();
        settings.insert("tag".into(), json!(tag));
        settings.insert("protocol".into(), json!(kind));
        settings.insert("port".into(), obj.get("listen_port").cloned().unwrap_or(Value::Null));

        if let Some(tls) = obj.get("tls").and_then(Value::as_object) {
            if tls.get("enabled").and_then(Value::as_bool) == Some(true) {
                settings.insert("tls".into(), json!("tls"));
                if let Some(sni) = tls.get("server_name") {
                    settings.insert("sni".into(), json!([sni]));
                }
                if let Some(reality) = tls.get("reality").and_then(Value::as_object) {
                    if reality.get("enabled").and_then(Value::as_bool) == Some(true) {
                        settings.insert("tls".into(), json!("reality"));
                        let private_key = reality.get("private_key").and_then(Value::as_str);
                        let keys = derive_x25519(xray_binary, private_key)?;
                        settings.insert("pbk".into(), json!(keys.public_key));
                        let short_id = reality
                            .get("short_id")
                            .and_then(Value::as_array)
                            .filter(|ids| !ids.is_empty())
                            .and_then(|ids| ids.first())
                            .cloned()
                            .ok_or_else(|| NodeError::ConfigInvalid(format!("inbound {tag}: reality missing short_id")))?;
                        settings.insert("sid".into(), short_id);
                    }
                }
            }
        }

        inbounds.push(Inbound {
            tag: tag.to_string(),
            protocol,
            config: settings,
        });
    }

    Ok(inbounds)
}

fn parse_protocol(kind: &str) -> Result<Protocol, NodeError> {
    match kind {
        "shadowsocks" => Ok(Protocol::Shadowsocks),
        "vmess" => Ok(Protocol::Vmess),
        "trojan" => Ok(Protocol::Trojan),
        "vless" => Ok(Protocol::Vless),
        "hysteria2" => Ok(Protocol::Hysteria2),
        "tuic" => Ok(Protocol::Tuic),
        "shadowtls" => Ok(Protocol::ShadowTls),
        other => Err(NodeError::ConfigInvalid(format!("unsupported sing-box inbound type: {other}"))),
    }
}

fn apply_v2ray_api(document: &mut Map<String, Value>, api_host: &str, api_port: u16) {
    let experimental = document
        .entry("experimental".to_string())
        .or_insert_with(|| json!({}));
    if let Value::Object(experimental) = experimental {
        experimental.insert(
            "v2ray_api".into(),
            json!({
                "listen": format!("{api_host}:{api_port}"),
                "stats": {"enabled": true, "users": []},
            }),
        );
    }
}

/// Parse the `sing-box version <x.y.z>` banner from `sing-box version`.
pub fn parse_version(banner: &str) -> Option<String> {
    let re = regex::Regex::new(r"^sing-box version (\d+\.\d+\.\d+)").unwrap();
    banner.lines().find_map(|line| re.captures(line).map(|c| c[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_vless_inbound() {
        let raw = r#"{"inbounds": [{"tag": "vless-in", "type": "vless", "listen_port": 443}]}"#;
        let config = SingBoxConfig::parse(raw, "127.0.0.1", 10086, Path::new("/bin/true")).unwrap();
        let inbounds = config.list_inbounds();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].tag, "vless-in");
        assert_eq!(inbounds[0].protocol, Protocol::Vless);
    }

    #[test]
    fn injects_v2ray_api_block() {
        let raw = r#"{"inbounds": []}"#;
        let config = SingBoxConfig::parse(raw, "127.0.0.1", 10086, Path::new("/bin/true")).unwrap();
        let rendered = config.to_json();
        assert!(rendered.contains("v2ray_api"));
    }

    #[test]
    fn append_and_pop_user_round_trip() {
        let raw = r#"{"inbounds": [{"tag": "vless-in", "type": "vless", "listen_port": 443}]}"#;
        let mut config = SingBoxConfig::parse(raw, "127.0.0.1", 10086, Path::new("/bin/true")).unwrap();
        config.append_user("vless-in", Protocol::Vless, "7.alice", "seed", CredentialMode::Hashed);
        assert!(config.to_json().contains("7.alice"));
        config.pop_user("vless-in", "7.alice");
        let rendered: Value = serde_json::from_str(&config.to_json()).unwrap();
        let users = rendered["inbounds"][0]["users"].as_array().unwrap();
        assert!(users.is_empty());
    }

    #[test]
    fn unsupported_type_is_skipped_not_fatal() {
        let raw = r#"{"inbounds": [{"tag": "direct-in", "type": "direct"}]}"#;
        let config = SingBoxConfig::parse(raw, "127.0.0.1", 1, Path::new("/bin/true")).unwrap();
        assert!(config.list_inbounds().is_empty());
    }

    #[test]
    fn parse_version_extracts_semver() {
        assert_eq!(parse_version("sing-box version 1.9.3\ngo version go1.22"), Some("1.9.3".to_string()));
    }

    #[test]
    fn reality_inbound_without_short_id_is_fatal() {
        let raw = r#"{
            "inbounds": [{
                "tag": "vless-reality",
                "type": "vless",
                "listen_port": 443,
                "tls": {
                    "enabled": true,
                    "server_name": "example.com",
                    "reality": {"enabled": true}
                }
            }]
        }"#;
        let err = SingBoxConfig::parse(raw, "127.0.0.1", 10086, Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(msg) if msg.contains("short_id")));
    }
}
