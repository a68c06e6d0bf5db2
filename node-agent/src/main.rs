//! Node control agent entry point: loads configuration, wires storage, the
//! engine adapters and the supervisor together, then serves the
//! reconciliation gRPC service over mTLS until a shutdown signal arrives.

use clap::Parser;
use node_core::model::EngineKind;
use node_core::NodeConfig;
use node_engines::{Hysteria2Engine, SingBoxEngine, XrayEngine};
use node_proto::node_control_server::NodeControlServer;
use node_service::ReconciliationService;
use node_store::Storage;
use node_supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "marznode", version, about = "marznode-rs node control agent")]
struct Cli {
    /// Path to the YAML configuration file. Falls back to the
    /// `node.yaml`/`/etc/marznode/node.yaml`/`config/node.yaml` search path
    /// used by `NodeConfig::load` when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured log level.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli.config.as_ref().map(|p| p.to_string_lossy().into_owned());
    let config = NodeConfig::load(config_path.as_deref())?;

    node_observability::init_tracing(cli.log_level.as_deref().unwrap_or(&config.log_level));

    info!(version = env!("CARGO_PKG_VERSION"), addr = %config.service_addr, "marznode starting");

    let storage = Arc::new(Storage::new());
    let mut supervisor = Supervisor::new(
        storage.clone(),
        config.supervisor.restart_on_failure,
        Duration::from_secs(config.supervisor.restart_interval_secs),
    );

    if config.xray.enabled {
        let engine = Arc::new(XrayEngine::new(
            config.xray.binary_path.clone(),
            config.xray.assets_path.clone(),
            config.xray.config_path.clone(),
            Duration::from_secs(config.xray.startup_timeout_secs),
            config.credential_mode,
        ));
        supervisor.register(EngineKind::Xray, engine);
        info!("xray-core adapter registered");
    }

    if config.singbox.enabled {
        let engine = SingBoxEngine::new(
            config.singbox.binary_path.clone(),
            config.singbox.config_path.clone(),
            Duration::from_secs(config.singbox.reload_interval_secs),
            config.credential_mode,
        );
        supervisor.register(EngineKind::SingBox, engine);
        info!("sing-box adapter registered");
    }

    if config.hysteria2.enabled {
        let engine = Arc::new(Hysteria2Engine::new(
            config.hysteria2.binary_path.clone(),
            config.hysteria2.config_path.clone(),
            config.hysteria2.auth_addr,
            config.credential_mode,
        ));
        supervisor.register(EngineKind::Hysteria2, engine);
        info!("hysteria2 adapter registered");
    }

    let supervisor = Arc::new(supervisor);
    supervisor.start_all().await?;
    info!(users = storage.user_count(), "adapters started");

    let service = NodeControlServer::new(ReconciliationService::new(storage, supervisor));
    let mut server = Server::builder();

    if config.insecure {
        warn!("insecure mode: serving gRPC without TLS, do not use in production");
    } else {
        let cert_path = config.tls.dir.join("ssl_cert.pem");
        let key_path = config.tls.dir.join("ssl_key.pem");
        let client_ca_path = config.tls.dir.join("ssl_client_cert.pem");

        let material = match node_transport::load_tls_material(&cert_path, &key_path, &client_ca_path).await {
            Ok(material) => material,
            Err(e) => {
                tracing::error!(error = %e, "failed to set up secure transport");
                std::process::exit(1);
            }
        };
        server = server.tls_config(node_transport::server_tls_config(&material))?;
    }

    info!(addr = %config.service_addr, "serving gRPC");
    server
        .add_service(service)
        .serve_with_shutdown(config.service_addr, shutdown_signal())
        .await?;

    info!("marznode stopped");
    Ok(())
}

/// Resolves once SIGTERM (container stop) or SIGINT (Ctrl+C) is received,
/// handing `tonic` a graceful-shutdown future instead of the blocking
/// signal-poll loop a non-async server would use.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}
