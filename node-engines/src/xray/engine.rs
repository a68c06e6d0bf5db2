use super::api::XrayApi;
use super::config::{self, XrayConfig};
use async_trait::async_trait;
use node_core::keys::CredentialMode;
use node_core::model::{Inbound, User};
use node_core::NodeError;
use node_engine::{ChildProcess, Engine, LogBroadcaster, LogSubscription, UsageRecord};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

const API_HOST: &str = "127.0.0.1";

struct Running {
    child: ChildProcess,
    api: XrayApi,
    document: XrayConfig,
}

/// Xray-core adapter. Owns a child process fed its rendered config over
/// stdin (`xray run -config stdin:`) and talks to Xray's own gRPC
/// `HandlerService`/`StatsService` for live user mutation and stats.
pub struct XrayEngine {
    binary_path: PathBuf,
    assets_path: PathBuf,
    config_path: PathBuf,
    startup_timeout: Duration,
    credential_mode: CredentialMode,
    logs: Arc<LogBroadcaster>,
    crash_signal: Arc<Notify>,
    version: Mutex<Option<String>>,
    running: Mutex<Option<Running>>,
}

impl XrayEngine {
    pub fn new(
        binary_path: PathBuf,
        assets_path: PathBuf,
        config_path: PathBuf,
        startup_timeout: Duration,
        credential_mode: CredentialMode,
    ) -> Self {
        Self {
            binary_path,
            assets_path,
            config_path,
            startup_timeout,
            credential_mode,
            logs: Arc::new(LogBroadcaster::default()),
            crash_signal: Arc::new(Notify::new()),
            version: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    async fn probe_version(&self) {
        let binary = self.binary_path.clone();
        let banner = tokio::task::spawn_blocking(move || {
            std::process::Command::new(&binary).arg("version").output()
        })
        .await;
        let version = match banner {
            Ok(Ok(output)) => config::parse_version(&String::from_utf8_lossy(&output.stdout)),
            _ => None,
        };
        *self.version.lock().await = version;
    }

    /// Tail the log broadcast until the startup banner appears or the
    /// configured timeout elapses, per the reference agent's startup gate.
    async fn await_startup_banner(&self) {
        let mut sub: LogSubscription = self.logs.subscribe();
        let deadline = tokio::time::sleep(self.startup_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return,
                line = sub.receiver.recv() => {
                    match line {
                        Ok(line) if is_startup_line(&line) => return,
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
            }
        }
    }
}

fn is_startup_line(line: &str) -> bool {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| regex::Regex::new(r"^.*\[Warning\] core: Xray \d+\.\d+\.\d+ started").unwrap());
    re.is_match(line)
}

#[async_trait]
impl Engine for XrayEngine {
    fn name(&self) -> &str {
        "xray"
    }

    async fn start(&self) -> Result<(), NodeError> {
        self.probe_version().await;

        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("reading xray config: {e}")))?;

        let api_port = node_engine::util::pick_free_port()
            .map_err(|e| NodeError::PortBindFailed(e.to_string()))?;

        let document = XrayConfig::parse(&raw, API_HOST, api_port, &self.binary_path)?;
        let rendered = document.to_json();

        let full_path = full_config_path(&self.config_path);
        tokio::fs::write(&full_path, &rendered)
            .await
            .map_err(|e| NodeError::ConfigInvalid(format!("writing rendered xray config: {e}")))?;

        let mut envs = std::collections::HashMap::new();
        envs.insert(
            "XRAY_LOCATION_ASSET".to_string(),
            self.assets_path.to_string_lossy().to_string(),
        );

        let child = ChildProcess::spawn(
            &self.binary_path,
            &["run".to_string(), "-config".to_string(), "stdin:".to_string()],
            &envs,
            self.logs.clone(),
            self.crash_signal.clone(),
            Some(rendered.as_bytes()),
        )
        .await?;

        let api = XrayApi::new(API_HOST, api_port, self.credential_mode);
        *self.running.lock().await = Some(Running { child, api, document });

        self.await_startup_banner().await;
        info!(binary = %self.binary_path.display(), "xray started");
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
        let guard = self.running.lock().await;
        let Some(running) = guard.as_ref() else {
            return Err(NodeError::EngineDown("xray".into()));
        };
        let Some(inbound) = running.document.list_inbounds().into_iter().find(|i| i.tag == tag) else {
            return Err(NodeError::UnknownTag(tag.to_string()));
        };
        let flow = inbound.config.get("flow").and_then(|v| v.as_str()).unwrap_or("");
        match running.api.add_inbound_user(tag, user, inbound.protocol, flow).await {
            Ok(()) => Ok(()),
            Err(NodeError::EngineDown(msg)) => {
                warn!(tag, "user addition requested when xray api is down: {msg}");
                Err(NodeError::EngineDown(msg))
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_user(&self, tag: &str, user: &User) -> Result<(), NodeError> {
        let guard = self.running.lock().await;
        let Some(running) = guard.as_ref() else {
            return Err(NodeError::EngineDown("xray".into()));
        };
        running.api.remove_inbound_user(tag, user).await
    }

    async fn get_usages(&self) -> Result<Vec<UsageRecord>, NodeError> {
        let guard = self.running.lock().await;
        let Some(running) = guard.as_ref() else {
            return Ok(Vec::new());
        };
        match tokio::time::timeout(Duration::from_secs(3), running.api.get_users_stats(true)).await {
            Ok(Ok(records)) => Ok(records),
            Ok(Err(_)) | Err(_) => Ok(Vec::new()),
        }
    }

    fn get_logs(&self) -> LogSubscription {
        self.logs.subscribe()
    }

    fn list_inbounds(&self) -> Vec<Inbound> {
        self.running
            .try_lock()
            .map(|g| g.as_ref().map(|r| r.document.list_inbounds()).unwrap_or_default())
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
            .map_err(|e| NodeError::ConfigInvalid(format!("writing xray config: {e}")))
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

fn full_config_path(config_path: &std::path::Path) -> PathBuf {
    let mut path = config_path.as_os_str().to_os_string();
    path.push(".full");
    PathBuf::from(path)
}
