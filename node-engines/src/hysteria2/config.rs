use node_core::model::{Inbound, Protocol};
use node_core::NodeError;
use serde_yaml::Value;

/// Hysteria2 only ever exposes the single fixed `"hysteria2"` inbound tag —
/// the engine has no concept of multiple listeners the way Xray/sing-box
/// do, matching the reference `HysteriaConfig`.
pub const INBOUND_TAG: &str = "hysteria2";

/// Parsed Hysteria2 YAML config, enriched with the HTTP auth callback and
/// traffic-stats listener this adapter needs to manage users and usage.
pub struct Hysteria2Config {
    document: Value,
}

impl Hysteria2Config {
    pub fn parse(raw: &str, auth_port: u16, stats_port: u16, stats_secret: &str) -> Result<Self, NodeError> {
        let mut document: Value =
            serde_yaml::from_str(raw).map_err(|e| NodeError::ConfigInvalid(format!("hysteria2 config: {e}")))?;

        let Value::Mapping(map) = &mut document else {
            return Err(NodeError::ConfigInvalid("hysteria2 config: not a YAML mapping".into()));
        };

        map.insert(
            Value::String("auth".into()),
            serde_yaml::to_value(serde_json::json!({
                "type": "http",
                "http": {"url": format!("http://127.0.0.1:{auth_port}")},
            }))
            .unwrap(),
        );
        map.insert(
            Value::String("trafficStats".into()),
            serde_yaml::to_value(serde_json::json!({
                "listen": format!("127.0.0.1:{stats_port}"),
                "secret": stats_secret,
            }))
            .unwrap(),
        );

        Ok(Self { document })
    }

    pub fn inbound(&self) -> Inbound {
        Inbound {
            tag: INBOUND_TAG.to_string(),
            protocol: Protocol::Hysteria2,
            config: serde_json::json!({"tag": INBOUND_TAG, "protocol": "hysteria2", "port": 443})
                .as_object()
                .unwrap()
                .clone(),
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(&self.document).expect("config document is always valid YAML")
    }
}

/// Parse the `Version: v<x.y.z>` banner from `hysteria version`.
pub fn parse_version(banner: &str) -> Option<String> {
    let re = regex::Regex::new(r"Version:\s*v(\d+\.\d+\.\d+)").unwrap();
    re.captures(banner).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_auth_and_stats() {
        let raw = "listen: :443\n";
        let config = Hysteria2Config::parse(raw, 8080, 9999, "secret").unwrap();
        let rendered = config.to_yaml();
        assert!(rendered.contains("auth"));
        assert!(rendered.contains("trafficStats"));
        assert!(rendered.contains("8080"));
    }

    #[test]
    fn fixed_inbound_tag() {
        let config = Hysteria2Config::parse("listen: :443\n", 1, 2, "s").unwrap();
        assert_eq!(config.inbound().tag, INBOUND_TAG);
    }

    #[test]
    fn rejects_non_mapping_documents() {
        let err = Hysteria2Config::parse("- 1\n- 2\n", 1, 2, "s").unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(_)));
    }

    #[test]
    fn parse_version_extracts_semver() {
        assert_eq!(parse_version("Version: v2.4.3"), Some("2.4.3".to_string()));
    }
}
