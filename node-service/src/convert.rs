//! Wire <-> domain conversions between `node_proto` messages and
//! `node_core::model` types. Kept separate from the RPC handlers so the
//! handlers read as control flow, not field-by-field mapping.

use node_core::model::{BackendDescriptor, EngineKind, Inbound, User};
use node_core::NodeError;
use std::collections::HashSet;

pub fn core_user(proto: node_proto::User) -> User {
    User { id: proto.id, username: proto.username, key: proto.key }
}

/// `UserData.inbounds[].tag` is all a reconciliation pass needs — the
/// inbound's protocol/config were already registered by the supervisor at
/// startup, so there is no reason to round-trip them through the wire.
pub fn inbound_tags(inbounds: &[node_proto::Inbound]) -> HashSet<String> {
    inbounds.iter().map(|i| i.tag.clone()).collect()
}

pub fn proto_inbound(inbound: &Inbound) -> Result<node_proto::Inbound, NodeError> {
    Ok(node_proto::Inbound {
        tag: inbound.tag.clone(),
        protocol: inbound.protocol.as_str().to_string(),
        config: serde_json::to_string(&inbound.config)?,
    })
}

pub fn proto_backend(descriptor: &BackendDescriptor) -> Result<node_proto::BackendDescriptor, NodeError> {
    Ok(node_proto::BackendDescriptor {
        name: descriptor.name.clone(),
        kind: descriptor.kind.as_str().to_string(),
        version: descriptor.version.clone(),
        inbounds: descriptor.inbounds.iter().map(proto_inbound).collect::<Result<_, _>>()?,
        running: descriptor.running,
    })
}

/// `BackendConfig.config_format`/`RestartBackendRequest.config_format`:
/// `0` for the JSON-rendering engines (xray, sing-box), `1` for
/// Hysteria2's YAML.
pub fn config_format_for(kind: EngineKind) -> u32 {
    match kind {
        EngineKind::Xray | EngineKind::SingBox => 0,
        EngineKind::Hysteria2 => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_core::model::Protocol;

    #[test]
    fn core_user_copies_fields_verbatim() {
        let proto = node_proto::User { id: 7, username: "alice".into(), key: "seed".into() };
        let user = core_user(proto);
        assert_eq!(user.id, 7);
        assert_eq!(user.username, "alice");
        assert_eq!(user.key, "seed");
    }

    #[test]
    fn inbound_tags_collects_tags_only() {
        let inbounds = vec![
            node_proto::Inbound { tag: "a".into(), protocol: "vless".into(), config: "{}".into() },
            node_proto::Inbound { tag: "b".into(), protocol: "trojan".into(), config: "{}".into() },
        ];
        let tags = inbound_tags(&inbounds);
        assert_eq!(tags, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn proto_inbound_encodes_config_as_json() {
        let inbound = Inbound { tag: "a".into(), protocol: Protocol::Vless, config: Default::default() };
        let proto = proto_inbound(&inbound).unwrap();
        assert_eq!(proto.tag, "a");
        assert_eq!(proto.protocol, "vless");
        assert_eq!(proto.config, "{}");
    }

    #[test]
    fn config_format_distinguishes_hysteria2_yaml() {
        assert_eq!(config_format_for(EngineKind::Xray), 0);
        assert_eq!(config_format_for(EngineKind::SingBox), 0);
        assert_eq!(config_format_for(EngineKind::Hysteria2), 1);
    }
}
