use crate::keys::CredentialMode;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration for the node control agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// gRPC control-plane listener address.
    #[serde(default = "default_service_addr")]
    pub service_addr: SocketAddr,

    /// Skip mTLS entirely and serve plaintext gRPC. Only meant for local
    /// development; the binary logs a warning whenever this is set.
    #[serde(default)]
    pub insecure: bool,

    /// How user credentials are derived from their seed key.
    #[serde(default)]
    pub credential_mode: CredentialMode,

    /// Secure-transport material.
    #[serde(default)]
    pub tls: TlsConfig,

    /// Xray-core adapter configuration.
    #[serde(default)]
    pub xray: XrayConfig,

    /// sing-box adapter configuration.
    #[serde(default)]
    pub singbox: SingBoxConfig,

    /// Hysteria2 adapter configuration.
    #[serde(default)]
    pub hysteria2: Hysteria2Config,

    /// Supervisor behavior shared across every engine.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Log level passed to the tracing env-filter.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable verbose debug logging of engine stdio.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Directory holding ssl_cert.pem / ssl_key.pem / ssl_client_cert.pem.
    #[serde(default = "default_tls_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XrayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_xray_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_xray_assets")]
    pub assets_path: PathBuf,
    #[serde(default = "default_xray_config")]
    pub config_path: PathBuf,
    /// Seconds to wait for the startup log line before declaring a launch failed.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingBoxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_singbox_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_singbox_config")]
    pub config_path: PathBuf,
    /// How often pending user mutations are batched into a config reload.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hysteria2Config {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_hysteria2_binary")]
    pub binary_path: PathBuf,
    #[serde(default = "default_hysteria2_config")]
    pub config_path: PathBuf,
    /// Local address the in-process auth callback listens on.
    #[serde(default = "default_hysteria2_auth_addr")]
    pub auth_addr: SocketAddr,
    #[serde(default = "default_hysteria2_stats_poll_secs")]
    pub stats_poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    /// Delay before restarting a crashed engine.
    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,
}

fn default_service_addr() -> SocketAddr {
    "0.0.0.0:62050".parse().unwrap()
}
fn default_tls_dir() -> PathBuf {
    PathBuf::from("/var/lib/marznode")
}
fn default_xray_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/xray")
}
fn default_xray_assets() -> PathBuf {
    PathBuf::from("/usr/local/share/xray")
}
fn default_xray_config() -> PathBuf {
    PathBuf::from("/etc/marznode/xray_config.json")
}
fn default_singbox_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/sing-box")
}
fn default_singbox_config() -> PathBuf {
    PathBuf::from("/etc/marznode/sing_box_config.json")
}
fn default_hysteria2_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/hysteria")
}
fn default_hysteria2_config() -> PathBuf {
    PathBuf::from("/etc/marznode/hysteria.yaml")
}
fn default_hysteria2_auth_addr() -> SocketAddr {
    "127.0.0.1:18080".parse().unwrap()
}
fn default_hysteria2_stats_poll_secs() -> u64 {
    5
}
fn default_startup_timeout() -> u64 {
    4
}
fn default_reload_interval() -> u64 {
    30
}
fn default_restart_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self { dir: default_tls_dir() }
    }
}

impl Default for XrayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: default_xray_binary(),
            assets_path: default_xray_assets(),
            config_path: default_xray_config(),
            startup_timeout_secs: default_startup_timeout(),
        }
    }
}

impl Default for SingBoxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            binary_path: default_singbox_binary(),
            config_path: default_singbox_config(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl Default for Hysteria2Config {
    fn default() -> Self {
        Self {
            enabled: false,
            binary_path: default_hysteria2_binary(),
            config_path: default_hysteria2_config(),
            auth_addr: default_hysteria2_auth_addr(),
            stats_poll_secs: default_hysteria2_stats_poll_secs(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_on_failure: true,
            restart_interval_secs: default_restart_interval(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `NODE_`-prefixed environment variables (double underscore nesting,
    /// e.g. `NODE_XRAY__ENABLED=false`).
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &["node.yaml", "/etc/marznode/node.yaml", "config/node.yaml"] {
                if std::path::Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        figment = figment.merge(Env::prefixed("NODE_").split("__"));

        let config: Self = figment.extract()?;
        Ok(config)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_addr: default_service_addr(),
            insecure: false,
            credential_mode: CredentialMode::default(),
            tls: TlsConfig::default(),
            xray: XrayConfig::default(),
            singbox: SingBoxConfig::default(),
            hysteria2: Hysteria2Config::default(),
            supervisor: SupervisorConfig::default(),
            log_level: default_log_level(),
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.service_addr.port(), 62050);
        assert!(!config.insecure);
        assert_eq!(config.credential_mode, CredentialMode::Hashed);
        assert!(config.xray.enabled);
        assert!(!config.singbox.enabled);
        assert!(!config.hysteria2.enabled);
        assert!(config.supervisor.restart_on_failure);
    }

    #[test]
    fn load_falls_back_to_defaults_when_file_is_absent() {
        // a missing explicit file contributes no data rather than erroring;
        // every field still resolves via its serde default.
        let config = NodeConfig::load(Some("/nonexistent/path/node.yaml")).unwrap();
        assert_eq!(config.service_addr.port(), 62050);
        assert!(config.xray.enabled);
    }
}
