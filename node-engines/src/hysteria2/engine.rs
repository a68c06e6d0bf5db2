use super::config::{self, Hysteria2Config, INBOUND_TAG};
use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use node_core::keys::{password, CredentialMode};
use node_core::model::{user_identifier, Inbound, User};
use node_core::NodeError;
use node_engine::{ChildProcess, Engine, LogBroadcaster, LogSubscription, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Users currently entitled to authenticate, keyed by their derived
/// Hysteria2 password.
type UserTable = Arc<Mutex<HashMap<String, User>>>;

struct Running {
    child: ChildProcess,
    auth_server: JoinHandle<()>,
    config: Hysteria2Config,
    stats_port: u16,
    stats_secret: String,
}

/// Hysteria2 adapter. Unlike Xray/sing-box there is no admin gRPC channel;
/// users authenticate via an HTTP callback this adapter serves itself, and
/// usage is polled from Hysteria2's own traffic-stats HTTP endpoint.
pub struct Hysteria2Engine {
    binary_path: PathBuf,
    config_path: PathBuf,
    auth_addr: std::net::SocketAddr,
    credential_mode: CredentialMode,
    logs: Arc<LogBroadcaster>,
    crash_signal: Arc<Notify>,
    version: Mutex<Option<String>>,
    running: Mutex<Option<Running>>,
    users: UserTable,
}

impl Hysteria2Engine {
    pub fn new(
        binary_path: PathBuf,
        config_path: PathBuf,
        auth_addr: std::net::SocketAddr,
        credential_mode: CredentialMode,
    ) -> Self {
        Self {
            binary_path,
            config_path,
            auth_addr,
            credential_mode,
            logs: Arc::new(LogBroadcaster::default()),
            crash_signal: Arc::new(Notify::new()),
            version: Mutex::new(None),
            running: Mutex::new(None),
            users: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn probe_version(&self) {
        let binary = self.binary_path.clone();
        let banner =
            tokio::task::spawn_blocking(move || std::process::Command::new(&binary).arg("version").output()).await;
        let version = match banner {
            Ok(Ok(output)) => config::parse_version(&String::from_utf8_lossy(&output.stdout)),
            _ => None,
        };
        *self.version.lock().await = version;
    }
}

#[derive(Deserialize)]
struct AuthRequest {
    auth: String,
}

#[derive(Serialize)]
struct AuthOk {
    ok: bool,
    id: String,
}

async fn auth_callback(
    State(users): State<UserTable>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthOk>, axum::http::StatusCode> {
    let table = users.lock().await;
    match table.get(&request.auth) {
        Some(user) => Ok(Json(AuthOk { ok: true, id: user_identifier(user) })),
        None => Err(axum::http::StatusCode::NOT_FOUND),
    }
}

#[async_trait]
impl Engine for Hysteria2Engine {
    fn name(&self) -> &str {
        "hysteria2"
    }

    async fn start(&self) -> Result<(), NodeError> {
        self.probe_version().await;

        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("reading hysteria2 config: {e}")))?;

        let stats_port =
            node_engine::util::pick_free_port().map_err(|e| NodeError::PortBindFailed(e.to_string()))?;
        // 16 bytes hex-encoded, per the reference backend's `token_hex(16)`.
        let stats_secret = node_engine::util::random_secret_hex(32);

        let config = Hysteria2Config::parse(&raw, self.auth_addr.port(), stats_port, &stats_secret)?;

        let router = Router::new()
            .route("/", post(auth_callback))
            .with_state(self.users.clone());
        let listener = tokio::net::TcpListener::bind(self.auth_addr)
            .await
            .map_err(|e| NodeError::PortBindFailed(e.to_string()))?;
        let auth_server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "hysteria2 auth server exited");
            }
        });

        let config_path = self.config_path.with_extension("full.yaml");
        tokio::fs::write(&config_path, config.to_yaml())
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("writing rendered hysteria2 config: {e}")))?;

        let child = ChildProcess::spawn(
            &self.binary_path,
            &["run".to_string(), "-c".to_string(), config_path.to_string_lossy().to_string()],
            &HashMap::new(),
            self.logs.clone(),
            self.crash_signal.clone(),
            None,
        )
        .await?;

        *self.running.lock().await = Some(Running { child, auth_server, config, stats_port, stats_secret });
        info!(binary = %self.binary_path.display(), "hysteria2 started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), NodeError> {
        let mut guard = self.running.lock().await;
        if let Some(running) = guard.take() {
            running.auth_server.abort();
            running.child.stop(Duration::from_secs(3)).await?;
        }
        Ok(())
    }

    async fn add_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        if tag != INBOUND_TAG {
            return Err(NodeError::UnknownTag(tag.to_string()));
        }
        let key = password(&user.key, self.credential_mode);
        self.users.lock().await.insert(key, user.clone());
        Ok(())
    }

    async fn remove_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        if tag != INBOUND_TAG {
            return Err(NodeError::UnknownTag(tag.to_string()));
        }
        let key = password(&user.key, self.credential_mode);
        if self.users.lock().await.remove(&key).is_none() {
            return Ok(());
        }

        let guard = self.running.lock().await;
        if let Some(running) = guard.as_ref() {
            let url = format!("http://127.0.0.1:{}/kick", running.stats_port);
            let client = reqwest::Client::new();
            let _ = client
                .post(url)
                .header("Authorization", &running.stats_secret)
                .json(&[user_identifier(user)])
                .send()
                .await;
        }
        Ok(())
    }

    async fn get_usages(&self) -> Result<Vec<UsageRecord>, NodeError> {
        let (stats_port, stats_secret) = {
            let guard = self.running.lock().await;
            let Some(running) = guard.as_ref() else {
                return Ok(Vec::new());
            };
            (running.stats_port, running.stats_secret.clone())
        };

        let fetch = async {
            let url = format!("http://127.0.0.1:{stats_port}/traffic?clear=1");
            reqwest::Client::new()
                .get(url)
                .header("Authorization", &stats_secret)
                .send()
                .await?
                .json::<HashMap<String, Value>>()
                .await
        };

        let data = match tokio::time::timeout(Duration::from_secs(3), fetch).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for (identifier, usage) in data {
            let Some(user_id) = node_core::model::parse_user_id(&identifier) else { continue };
            let username = identifier.split('.').nth(1).unwrap_or("").to_string();
            let tx = usage.get("tx").and_then(Value::as_u64).unwrap_or(0);
            let rx = usage.get("rx").and_then(Value::as_u64).unwrap_or(0);
            records.push(UsageRecord { user_id, username, uplink: tx, downlink: rx });
        }
        Ok(records)
    }

    fn get_logs(&self) -> LogSubscription {
        self.logs.subscribe()
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.running
            .try_lock()
            .map(|g| g.as_ref().map(|r| vec![r.config.inbound()]).unwrap_or_default())
            .unwrap_or_default()
    }

    async fn get_config(&self) -> Result<String, NodeError> {
        tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| NodeError::Internal(e.to_string()))
    }

    async fn set_config(&self, raw: &str) -> Result<(), NodeError> {
        tokio::fs::write(&self.config_path, raw)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("writing hysteria2 config: {e}")))
    }

    fn contains_tag(&self, tag: &str) -> bool {
        tag == INBOUND_TAG
    }

    fn running(&self) -> bool {
        self.running
            .try_lock()
            .map(|g| g.as_ref().map(|r| r.child.running()).unwrap_or(false))
            .unwrap_or(false)
    }

    fn version(&self) -> Option<String> {
        self.version.try_lock().ok().and_then(|v| v.clone())
    }

    fn crash_signal(&self) -> Arc<Notify> {
        self.crash_signal.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> User {
        User { id: 7, username: "alice".to_string(), key: "seed".to_string() }
    }

    #[tokio::test]
    async fn auth_callback_accepts_a_known_password() {
        let users: UserTable = Arc::new(Mutex::new(HashMap::new()));
        let user = alice();
        let key = password(&user.key, CredentialMode::Hashed);
        users.lock().await.insert(key.clone(), user.clone());

        let result = auth_callback(State(users), Json(AuthRequest { auth: key })).await.unwrap();
        assert!(result.0.ok);
        assert_eq!(result.0.id, user_identifier(&user));
    }

    #[tokio::test]
    async fn auth_callback_rejects_an_unknown_password() {
        let users: UserTable = Arc::new(Mutex::new(HashMap::new()));
        let result = auth_callback(State(users), Json(AuthRequest { auth: "nope".to_string() })).await;
        assert_eq!(result.unwrap_err(), axum::http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn only_hysteria2_tag_is_accepted() {
        let engine = Hysteria2Engine::new(
            PathBuf::from("/bin/true"),
            PathBuf::from("/dev/null"),
            "127.0.0.1:0".parse().unwrap(),
            CredentialMode::Hashed,
        );
        assert!(engine.contains_tag(INBOUND_TAG));
        assert!(!engine.contains_tag("other"));
    }
}
