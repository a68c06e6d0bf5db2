use super::config::{self, SingBoxConfig};
use async_trait::async_trait;
use node_core::keys::CredentialMode;
use node_core::model::{user_identifier, Inbound, User};
use node_core::NodeError;
use node_engine::{ChildProcess, Engine, LogBroadcaster, LogSubscription, UsageRecord};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use xray_core::app::stats::command::{stats_service_client::StatsServiceClient, QueryStatsRequest};

const API_HOST: &str = "127.0.0.1";

struct Running {
    child: ChildProcess,
    config: SingBoxConfig,
    api_port: u16,
}

/// sing-box adapter. User mutations only edit the in-memory config and set
/// a dirty flag; a background loop batches them into a full reload +
/// `SIGHUP` every `reload_interval`, matching the reference agent's
/// `_user_update_handler`.
pub struct SingBoxEngine {
    binary_path: PathBuf,
    config_path: PathBuf,
    reload_interval: Duration,
    credential_mode: CredentialMode,
    logs: Arc<LogBroadcaster>,
    crash_signal: Arc<Notify>,
    version: Mutex<Option<String>>,
    running: Mutex<Option<Running>>,
    dirty: Arc<AtomicBool>,
}

impl SingBoxEngine {
    pub fn new(
        binary_path: PathBuf,
        config_path: PathBuf,
        reload_interval: Duration,
        credential_mode: CredentialMode,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            binary_path,
            config_path,
            reload_interval,
            credential_mode,
            logs: Arc::new(LogBroadcaster::default()),
            crash_signal: Arc::new(Notify::new()),
            version: Mutex::new(None),
            running: Mutex::new(None),
            dirty: Arc::new(AtomicBool::new(false)),
        });
        tokio::spawn(reload_loop(engine.clone()));
        engine
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

    fn full_config_path(&self) -> PathBuf {
        let mut path = self.config_path.as_os_str().to_os_string();
        path.push(".full");
        PathBuf::from(path)
    }
}

/// Wakes every `reload_interval`; if a mutation set the dirty flag since
/// the last pass, writes the full config and sends `SIGHUP`.
async fn reload_loop(engine: Arc<SingBoxEngine>) {
    let mut ticker = tokio::time::interval(engine.reload_interval);
    loop {
        ticker.tick().await;
        if !engine.dirty.swap(false, Ordering::SeqCst) {
            continue;
        }
        debug!("applying batched sing-box user modifications");
        let guard = engine.running.lock().await;
        let Some(running) = guard.as_ref() else { continue };
        if let Err(e) = tokio::fs::write(engine.full_config_path(), running.config.to_json()).await {
            warn!(error = %e, "failed to write sing-box full config");
            continue;
        }
        if let Some(pid) = running.child.pid() {
            unsafe {
                libc::kill(pid as i32, libc::SIGHUP);
            }
        }
    }
}

#[async_trait]
impl Engine for SingBoxEngine {
    fn name(&self) -> &str {
        "sing-box"
    }

    async fn start(&self) -> Result<(), NodeError> {
        self.probe_version().await;

        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("reading sing-box config: {e}")))?;

        let api_port =
            node_engine::util::pick_free_port().map_err(|e| NodeError::PortBindFailed(e.to_string()))?;

        let config = SingBoxConfig::parse(&raw, API_HOST, api_port, &self.binary_path)?;
        let rendered = config.to_json();

        let full_path = self.full_config_path();
        tokio::fs::write(&full_path, &rendered)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("writing rendered sing-box config: {e}")))?;

        let child = ChildProcess::spawn(
            &self.binary_path,
            &["run".to_string(), "-c".to_string(), full_path.to_string_lossy().to_string()],
            &HashMap::new(),
            self.logs.clone(),
            self.crash_signal.clone(),
            None,
        )
        .await?;

        *self.running.lock().await = Some(Running { child, config, api_port });
        self.dirty.store(false, Ordering::SeqCst);
        info!(binary = %self.binary_path.display(), "sing-box started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), NodeError> {
        let mut guard = self.running.lock().await;
        if let Some(running) = guard.take() {
            running.child.stop(Duration::from_secs(3)).await?;
        }
        Ok(())
    }

    async fn add_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return Err(NodeError::EngineDown("sing-box".into()));
        };
        let Some(inbound) = running.config.list_inbounds().into_iter().find(|i| i.tag == tag) else {
            return Err(NodeError::UnknownTag(tag.to_string()));
        };
        running
            .config
            .append_user(tag, inbound.protocol, &user_identifier(user), &user.key, self.credential_mode);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.as_mut() else {
            return Err(NodeError::EngineDown("sing-box".into()));
        };
        running.config.pop_user(tag, &user_identifier(user));
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_usages(&self) -> Result<Vec<UsageRecord>, NodeError> {
        let api_port = {
            let guard = self.running.lock().await;
            let Some(running) = guard.as_ref() else {
                return Ok(Vec::new());
            };
            running.api_port
        };

        let query = async {
            let mut client = StatsServiceClient::connect(format!("http://{API_HOST}:{api_port}"))
                .await
                .map_err(|e| NodeError::EngineDown(e.to_string()))?;
            client
                .query_stats(tonic::Request::new(QueryStatsRequest {
                    pattern: "user>>>".to_string(),
                    reset: true,
                }))
                .await
                .map_err(|e| NodeError::EngineDown(e.to_string()))
        };

        let response = match tokio::time::timeout(Duration::from_secs(3), query).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(_)) | Err(_) => return Ok(Vec::new()),
        };

        let mut records: Vec<UsageRecord> = Vec::new();
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
            let record = match records.iter_mut().find(|r| r.user_id == user_id) {
                Some(r) => r,
                None => {
                    records.push(UsageRecord { user_id, username, uplink: 0, downlink: 0 });
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

    fn get_logs(&self) -> LogSubscription {
        self.logs.subscribe()
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.running
            .try_lock()
            .map(|g| g.as_ref().map(|r| r.config.list_inbounds()).unwrap_or_default())
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
            .map_err(|e| NodeError::ConfigInvalid(format!("writing sing-box config: {e}")))
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
