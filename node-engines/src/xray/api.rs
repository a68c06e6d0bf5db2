use node_core::keys::CredentialMode;
use node_core::model::{Protocol, User};
use node_core::NodeError;
use node_engine::UsageRecord;
use prost::Message;
use prost::Name;
use xray_core::app::proxyman::command::{
    handler_service_client::HandlerServiceClient, AddUserOperation, AlterInboundRequest, RemoveUserOperation,
};
use xray_core::app::stats::command::{stats_service_client::StatsServiceClient, QueryStatsRequest};
use xray_core::common::protocol::User as XrayUser;
use xray_core::common::serial::TypedMessage;

/// Thin gRPC client for Xray-core's own `HandlerService`/`StatsService`,
/// the same admin channel the reference agent talks to — just reached
/// through `tonic` instead of `grpclib`.
pub struct XrayApi {
    endpoint: String,
    credential_mode: CredentialMode,
}

impl XrayApi {
    pub fn new(host: &str, port: u16, credential_mode: CredentialMode) -> Self {
        Self {
            endpoint: format!("http://{host}:{port}"),
            credential_mode,
        }
    }

    async fn handler_client(&self) -> Result<HandlerServiceClient<tonic::transport::Channel>, NodeError> {
        HandlerServiceClient::connect(self.endpoint.clone())
            .await
            .map_err(|e| NodeError::EngineDown(e.to_string()))
    }

    async fn stats_client(&self) -> Result<StatsServiceClient<tonic::transport::Channel>, NodeError> {
        StatsServiceClient::connect(self.endpoint.clone())
            .await
            .map_err(|e| NodeError::EngineDown(e.to_string()))
    }

    /// Add `user` to the inbound `tag`, encoding the protocol-specific
    /// account the way the reference `accounts_map` does.
    pub async fn add_inbound_user(&self, tag: &str, user: &User, protocol: Protocol, flow: &str) -> Result<(), NodeError> {
        let email = node_core::model::user_identifier(user);
        let account = encode_account(protocol, &user.key, flow, self.credential_mode)?;

        let xray_user = XrayUser {
            level: 0,
            email: email.clone(),
            account: Some(account),
        };
        let operation = TypedMessage {
            r#type: AddUserOperation::type_url(),
            value: AddUserOperation { user: Some(xray_user) }.encode_to_vec(),
        };
        let request = AlterInboundRequest {
            tag: tag.to_string(),
            operation: Some(operation),
        };

        self.handler_client()
            .await?
            .alter_inbound(tonic::Request::new(request))
            .await
            .map_err(|e| NodeError::EngineDown(e.to_string()))?;
        Ok(())
    }

    pub async fn remove_inbound_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        let email = node_core::model::user_identifier(user);
        let operation = TypedMessage {
            r#type: RemoveUserOperation::type_url(),
            value: RemoveUserOperation { email }.encode_to_vec(),
        };
        let request = AlterInboundRequest {
            tag: tag.to_string(),
            operation: Some(operation),
        };

        self.handler_client()
            .await?
            .alter_inbound(tonic::Request::new(request))
            .await
            .map_err(|e| NodeError::EngineDown(e.to_string()))?;
        Ok(())
    }

    /// Query per-user traffic counters via `user>>>` stat names, resetting
    /// the counters as it reads them.
    pub async fn get_users_stats(&self, reset: bool) -> Result<Vec<UsageRecord>, NodeError> {
        let response = self
            .stats_client()
            .await?
            .query_stats(tonic::Request::new(QueryStatsRequest {
                pattern: "user>>>".to_string(),
                reset,
            }))
            .await
            .map_err(|e| NodeError::EngineDown(e.to_string()))?
            .into_inner();

        let mut records = Vec::new();
        for stat in response.stat {
            let Some((email, link)) = stat.name.strip_prefix("user>>>").and_then(|rest| {
                let mut parts = rest.rsplitn(2, ">>>");
                let link = parts.next()?;
                let email = parts.next()?;
                Some((email.to_string(), link.to_string()))
            }) else {
                continue;
            };
            let Some(user_id) = node_core::model::parse_user_id(&email) else {
                continue;
            };
            let username = email.split('.').nth(1).unwrap_or("").to_string();

            let entry = records
                .iter_mut()
                .find(|r: &&mut UsageRecord| r.user_id == user_id);
            let record = match entry {
                Some(r) => r,
                None => {
                    records.push(UsageRecord {
                        user_id,
                        username,
                        uplink: 0,
                        downlink: 0,
                    });
                    records.last_mut().unwrap()
                }
            };
            match link.as_str() {
                "uplink" => record.uplink += stat.value as u64,
                "downlink" => record.downlink += stat.value as u64,
                _ => {}
            }
        }
        Ok(records)
    }
}

fn encode_account(protocol: Protocol, seed: &str, flow: &str, mode: CredentialMode) -> Result<TypedMessage, NodeError> {
    let id = node_core::keys::uuid(seed, mode).to_string();
    let (type_url, value) = match protocol {
        Protocol::Vless => {
            let account = xray_core::proxy::vless::Account {
                id,
                flow: flow.to_string(),
                encryption: "none".to_string(),
            };
            (xray_core::proxy::vless::Account::type_url(), account.encode_to_vec())
        }
        Protocol::Vmess => {
            let account = xray_core::proxy::vmess::Account {
                id,
                alter_id: 0,
                security_settings: None,
                tests_enabled: String::new(),
            };
            (xray_core::proxy::vmess::Account::type_url(), account.encode_to_vec())
        }
        Protocol::Trojan => {
            let account = xray_core::proxy::trojan::Account {
                password: node_core::keys::password(seed, mode),
            };
            (xray_core::proxy::trojan::Account::type_url(), account.encode_to_vec())
        }
        Protocol::Shadowsocks => {
            let account = xray_core::proxy::shadowsocks::Account {
                password: node_core::keys::password(seed, mode),
                cipher_type: xray_core::proxy::shadowsocks::CipherType::Aes128Gcm as i32,
                iv_check: false,
            };
            (xray_core::proxy::shadowsocks::Account::type_url(), account.encode_to_vec())
        }
        other => {
            return Err(NodeError::ConfigInvalid(format!(
                "xray has no account encoder for protocol {}",
                other.as_str()
            )))
        }
    };

    Ok(TypedMessage { r#type: type_url, value })
}
