use node_core::model::{Inbound, Protocol};
use node_core::NodeError;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::process::Command;

const SUPPORTED_PROTOCOLS: &[&str] = &["vmess", "vless", "trojan", "shadowsocks"];

/// Parsed and API-augmented Xray-core configuration.
///
/// Mirrors the reference `XrayConfig`: load the operator's JSON5 config,
/// extract a typed inbound list for storage, then graft on the admin API
/// inbound/service/policy/routing-rule block this agent needs to manage
/// users at runtime.
pub struct XrayConfig {
    document: Map<String, Value>,
    inbounds: Vec<Inbound>,
}

impl XrayConfig {
    /// Parse `raw` (JSON5, matching Xray's own comment-tolerant config
    /// format) and wire in the local admin API on `api_host:api_port`.
    pub fn parse(raw: &str, api_host: &str, api_port: u16, xray_binary: &Path) -> Result<Self, NodeError> {
        let value: Value =
            json5::from_str(raw).map_err(|e| NodeError::ConfigInvalid(format!("xray config: {e}")))?;
        let Value::Object(mut document) = value else {
            return Err(NodeError::ConfigInvalid("xray config: not a JSON object".into()));
        };

        let inbounds = resolve_inbounds(&document, xray_binary)?;
        apply_admin_api(&mut document, api_host, api_port);

        Ok(Self { document, inbounds })
    }

    pub fn list_inbounds(&self) -> Vec<Inbound> {
        self.inbounds.clone()
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
        let Some(tag) = obj.get("tag").and_then(Value::as_str) else {
            continue;
        };
        let Some(protocol_name) = obj.get("protocol").and_then(Value::as_str) else {
            continue;
        };
        let protocol_name = protocol_name.to_lowercase();
        if !SUPPORTED_PROTOCOLS.contains(&protocol_name.as_str()) {
            continue;
        }
        let protocol = parse_protocol(&protocol_name)?;

        let mut settings = Map::new();
        settings.insert("tag".into(), json!(tag));
        settings.insert("protocol".into(), json!(protocol_name));
        settings.insert("port".into(), obj.get("port").cloned().unwrap_or(Value::Null));
        settings.insert("network".into(), json!("tcp"));
        settings.insert("tls".into(), json!("none"));
        settings.insert("flow".into(), json!(""));

        if let Some(stream) = obj.get("streamSettings").and_then(Value::as_object) {
            annotate_stream_settings(&mut settings, stream, xray_binary)?;
        }

        inbounds.push(Inbound {
            tag: tag.to_string(),
            protocol,
            config: settings,
        });
    }

    Ok(inbounds)
}

fn parse_protocol(name: &str) -> Result<Protocol, NodeError> {
    match name {
        "vmess" => Ok(Protocol::Vmess),
        "vless" => Ok(Protocol::Vless),
        "trojan" => Ok(Protocol::Trojan),
        "shadowsocks" => Ok(Protocol::Shadowsocks),
        other => Err(NodeError::ConfigInvalid(format!("unsupported xray protocol: {other}"))),
    }
}

fn annotate_stream_settings(
    settings: &mut Map<String, Value>,
    stream: &Map<String, Value>,
    xray_binary: &Path,
) -> Result<(), NodeError> {
    let network = stream.get("network").and_then(Value::as_str).unwrap_or("tcp");
    settings.insert("network".into(), json!(transport_name(network)));

    let security = stream.get("security").and_then(Value::as_str);
    match security {
        Some("tls") => {
            settings.insert("tls".into(), json!("tls"));
        }
        Some("reality") => {
            settings.insert("tls".into(), json!("reality"));
            settings.insert("fp".into(), json!("chrome"));
            let Some(reality) = stream.get("realitySettings").and_then(Value::as_object) else {
                return Err(NodeError::ConfigInvalid("reality inbound missing realitySettings".into()));
            };

            let short_ids = reality.get("shortIds").and_then(Value::as_array);
            match short_ids {
                Some(ids) if !ids.is_empty() => {
                    settings.insert("sid".into(), ids.first().cloned().unwrap_or(json!("")));
                }
                _ => {
                    return Err(NodeError::ConfigInvalid(
                        "reality inbound missing shortIds".into(),
                    ));
                }
            }

            if let Some(names) = reality.get("serverNames") {
                settings.insert("sni".into(), names.clone());
            }
            if let Some(private_key) = reality.get("privateKey").and_then(Value::as_str) {
                let keys = derive_x25519(xray_binary, Some(private_key))?;
                settings.insert("pbk".into(), json!(keys.public_key));
            }
        }
        _ => {}
    }

    Ok(())
}

fn transport_name(network: &str) -> &'static str {
    match network {
        "tcp" | "raw" => "tcp",
        "splithttp" | "xhttp" => "splithttp",
        "grpc" => "grpc",
        "kcp" | "mkcp" => "kcp",
        "h2" | "h3" | "http" => "http",
        "ws" | "websocket" => "ws",
        "httpupgrade" => "httpupgrade",
        "quic" => "quic",
        _ => "tcp",
    }
}

fn apply_admin_api(document: &mut Map<String, Value>, api_host: &str, api_port: u16) {
    document.insert(
        "api".into(),
        json!({
            "tag": "API",
            "services": ["HandlerService", "StatsService", "LoggerService"],
        }),
    );
    document.insert("stats".into(), json!({}));

    let forced_policy = json!({
        "levels": {"0": {"statsUserUplink": true, "statsUserDownlink": true}},
        "system": {
            "statsInboundDownlink": false,
            "statsInboundUplink": false,
            "statsOutboundDownlink": true,
            "statsOutboundUplink": true,
        },
    });
    document.insert("policy".into(), forced_policy);

    let api_inbound = json!({
        "listen": api_host,
        "port": api_port,
        "protocol": "dokodemo-door",
        "settings": {"address": api_host},
        "tag": "API_INBOUND",
    });
    match document.entry("inbounds".to_string()).or_insert_with(|| json!([])) {
        Value::Array(inbounds) => inbounds.insert(0, api_inbound),
        _ => {}
    }

    let rule = json!({"inboundTag": ["API_INBOUND"], "outboundTag": "API", "type": "field"});
    let routing = document
        .entry("routing".to_string())
        .or_insert_with(|| json!({"rules": []}));
    if let Value::Object(routing) = routing {
        match routing.entry("rules".to_string()).or_insert_with(|| json!([])) {
            Value::Array(rules) => rules.insert(0, rule),
            _ => {}
        }
    }
}

/// An x25519 keypair as reported by `xray x25519`.
pub struct X25519Keys {
    pub private_key: String,
    pub public_key: String,
}

/// Derive (or regenerate) an x25519 keypair by shelling out to the Xray
/// binary itself — Xray doesn't expose this via its gRPC API.
pub fn derive_x25519(xray_binary: &Path, private_key: Option<&str>) -> Result<X25519Keys, NodeError> {
    let mut cmd = Command::new(xray_binary);
    cmd.arg("x25519");
    if let Some(key) = private_key {
        cmd.arg("-i").arg(key);
    }
    let output = cmd
        .output()
        .map_err(|e| NodeError::ConfigInvalid(format!("failed to run xray x25519: {e}")))?;
    let text = String::from_utf8_lossy(&output.stdout);

    let private = text
        .lines()
        .find_map(|l| l.strip_prefix("Private key: "))
        .unwrap_or_default()
        .to_string();
    let public = text
        .lines()
        .find_map(|l| l.strip_prefix("Public key: "))
        .unwrap_or_default()
        .to_string();

    if public.is_empty() {
        return Err(NodeError::ConfigInvalid("xray x25519 produced no public key".into()));
    }

    Ok(X25519Keys {
        private_key: private,
        public_key: public,
    })
}

/// Parse the `Xray <major.minor.patch>` banner from `xray version`.
pub fn parse_version(banner: &str) -> Option<String> {
    let re = regex::Regex::new(r"^Xray (\d+\.\d+\.\d+)").unwrap();
    re.captures(banner.lines().next()?)
        .map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_plain_vless_inbound() {
        let raw = r#"{
            "inbounds": [
                {"tag": "vless-tcp", "protocol": "vless", "port": 443, "settings": {}}
            ]
        }"#;
        let config = XrayConfig::parse(raw, "127.0.0.1", 10085, Path::new("/bin/true")).unwrap();
        let inbounds = config.list_inbounds();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].tag, "vless-tcp");
        assert_eq!(inbounds[0].protocol, Protocol::Vless);
    }

    #[test]
    fn injects_admin_api_inbound_and_policy() {
        let raw = r#"{"inbounds": []}"#;
        let config = XrayConfig::parse(raw, "127.0.0.1", 10085, Path::new("/bin/true")).unwrap();
        let rendered = config.to_json();
        assert!(rendered.contains("API_INBOUND"));
        assert!(rendered.contains("statsUserUplink"));
    }

    #[test]
    fn rejects_non_object_documents() {
        let err = XrayConfig::parse("[1,2,3]", "127.0.0.1", 1, Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(_)));
    }

    #[test]
    fn unsupported_protocol_is_skipped_not_fatal() {
        let raw = r#"{
            "inbounds": [{"tag": "socks-in", "protocol": "socks", "settings": {}}]
        }"#;
        let config = XrayConfig::parse(raw, "127.0.0.1", 1, Path::new("/bin/true")).unwrap();
        assert!(config.list_inbounds().is_empty());
    }

    #[test]
    fn reality_inbound_without_short_ids_is_fatal() {
        let raw = r#"{
            "inbounds": [{
                "tag": "vless-reality",
                "protocol": "vless",
                "port": 443,
                "settings": {},
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": {"serverNames": ["example.com"]}
                }
            }]
        }"#;
        let err = XrayConfig::parse(raw, "127.0.0.1", 10085, Path::new("/bin/true")).unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(msg) if msg.contains("shortIds")));
    }

    #[test]
    fn parse_version_extracts_semver() {
        assert_eq!(
            parse_version("Xray 1.8.4 (Xray, Penetrates Everything.)"),
            Some("1.8.4".to_string())
        );
    }
}
