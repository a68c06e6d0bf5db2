use node_core::keys::{password, uuid, CredentialMode};
use node_core::model::Protocol;
use serde_json::{json, Map, Value};

/// Render a sing-box inbound user entry for `protocol`, keyed by `identifier`
/// (`"<id>.<username>"`) and credentialed from `seed`.
///
/// Mirrors `accounts_map` in the reference sing-box backend: every account
/// carries either `name` (most protocols) or `username` (the socks/http/
/// mixed/naive family) plus whatever secret fields that protocol needs.
pub fn render_account(protocol: Protocol, identifier: &str, seed: &str, mode: CredentialMode) -> Map<String, Value> {
    let mut account = Map::new();
    if uses_username_field(protocol) {
        account.insert("username".into(), json!(identifier));
    } else {
        account.insert("name".into(), json!(identifier));
    }

    match protocol {
        Protocol::Vmess => {
            account.insert("uuid".into(), json!(uuid(seed, mode).to_string()));
        }
        Protocol::Vless => {
            account.insert("uuid".into(), json!(uuid(seed, mode).to_string()));
            account.insert("flow".into(), json!(""));
        }
        Protocol::Trojan | Protocol::Shadowsocks | Protocol::Hysteria2 | Protocol::ShadowTls | Protocol::Naive => {
            account.insert("password".into(), json!(password(seed, mode)));
        }
        Protocol::Tuic => {
            account.insert("uuid".into(), json!(uuid(seed, mode).to_string()));
            account.insert("password".into(), json!(password(seed, mode)));
        }
        Protocol::Socks | Protocol::Http | Protocol::Mixed => {
            account.insert("password".into(), json!(password(seed, mode)));
        }
    }

    account
}

fn uses_username_field(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Naive | Protocol::Socks | Protocol::Http | Protocol::Mixed)
}

/// True if the account entry at `user` identifies `identifier` — used when
/// popping a user out of an inbound's user list.
pub fn identifies(user: &Value, identifier: &str) -> bool {
    let name = user.get("name").and_then(Value::as_str);
    let username = user.get("username").and_then(Value::as_str);
    name == Some(identifier) || username == Some(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vless_account_has_uuid_and_flow() {
        let account = render_account(Protocol::Vless, "7.alice", "seed", CredentialMode::Hashed);
        assert!(account.contains_key("uuid"));
        assert_eq!(account.get("name").unwrap(), "7.alice");
    }

    #[test]
    fn socks_account_uses_username_field() {
        let account = render_account(Protocol::Socks, "7.alice", "seed", CredentialMode::Hashed);
        assert!(account.contains_key("username"));
        assert!(!account.contains_key("name"));
    }

    #[test]
    fn accounts_are_deterministic() {
        let a = render_account(Protocol::Trojan, "7.alice", "seed", CredentialMode::Hashed);
        let b = render_account(Protocol::Trojan, "7.alice", "seed", CredentialMode::Hashed);
        assert_eq!(a, b);
    }

    #[test]
    fn plain_mode_passes_password_through() {
        let account = render_account(Protocol::Trojan, "7.alice", "raw-secret", CredentialMode::Plain);
        assert_eq!(account.get("password").unwrap(), "raw-secret");
    }

    #[test]
    fn identifies_matches_name_or_username() {
        let named = json!({"name": "7.alice"});
        let usernamed = json!({"username": "7.alice"});
        assert!(identifies(&named, "7.alice"));
        assert!(identifies(&usernamed, "7.alice"));
        assert!(!identifies(&named, "8.bob"));
    }
}
