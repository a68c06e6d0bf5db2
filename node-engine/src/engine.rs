use async_trait::async_trait;
use node_core::model::{Inbound, User};
use node_core::NodeError;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::logs::LogSubscription;

/// Traffic consumed by a single user since the last collection, as reported
/// by an engine's own accounting API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: u64,
    pub username: String,
    pub uplink: u64,
    pub downlink: u64,
}

/// A supervised proxy engine (Xray-core, sing-box, Hysteria2, ...).
///
/// Implementations own exactly one child process plus whatever in-process
/// admin channel that engine exposes (gRPC stats API, SIGHUP reload, local
/// HTTP auth callback). All methods are engine-local; cross-engine tag
/// routing lives in the supervisor, not here.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Stable adapter name, e.g. `"xray"`, used in logs and status reports.
    fn name(&self) -> &str;

    /// Launch the child process and block until it reports readiness.
    async fn start(&self) -> Result<(), NodeError>;

    /// Stop the child process, waiting up to the adapter's configured grace
    /// period before force-killing it.
    async fn stop(&self) -> Result<(), NodeError>;

    /// Stop then start. The default implementation is sequential; adapters
    /// with faster restart paths (e.g. sing-box's SIGHUP reload) override
    /// this entirely rather than tearing down the process.
    async fn restart(&self) -> Result<(), NodeError> {
        self.stop().await?;
        self.start().await
    }

    /// Add or update a user on the given inbound tag. Errors with
    /// `UnknownTag` if this engine doesn't own `tag`.
    async fn add_user(&self, tag: &str, user: &User) -> Result<(), NodeError>;

    /// Remove a user from the given inbound tag. A user absent from the
    /// engine's own state is not an error — removal is idempotent.
    async fn remove_user(&self, tag: &str, user: &User) -> Result<(), NodeError>;

    /// Collect per-user traffic counters since the last call.
    async fn get_usages(&self) -> Result<Vec<UsageRecord>, NodeError>;

    /// Subscribe to this engine's log stream (backlog + live tail).
    fn get_logs(&self) -> LogSubscription;

    /// Inbounds this engine currently serves, as parsed from its own config.
    fn list_inbounds(&self) -> Vec<Inbound>;

    /// The engine's rendered configuration, for `FetchBackendConfig`.
    async fn get_config(&self) -> Result<String, NodeError>;

    /// Overwrite the engine's on-disk source configuration ahead of a
    /// restart, for `RestartBackend`'s optional `configuration` field. Takes
    /// effect on the next `start`/`restart`, not immediately. The default
    /// implementation rejects the call; adapters that persist a config file
    /// override it.
    async fn set_config(&self, _raw: &str) -> Result<(), NodeError> {
        Err(NodeError::ConfigInvalid(format!(
            "{} does not support replacing its configuration",
            self.name()
        )))
    }

    fn contains_tag(&self, tag: &str) -> bool {
        self.list_inbounds().iter().any(|i| i.tag == tag)
    }

    fn running(&self) -> bool;

    /// Engine binary version string, cached from the startup probe.
    fn version(&self) -> Option<String>;

    /// Notify fired exactly once per child-process exit, whether planned or
    /// a crash. The supervisor's crash-watch task awaits this to tell the
    /// two apart (a restart mutex held at notify time means "planned").
    /// Engines with no backing process may leave the default, which never
    /// fires.
    fn crash_signal(&self) -> Arc<Notify> {
        Arc::new(Notify::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogBroadcaster;
    use async_trait::async_trait;
    use node_core::model::Protocol;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct StubEngine {
        running: AtomicBool,
        logs: Arc<LogBroadcaster>,
        inbounds: Vec<Inbound>,
    }

    #[async_trait]
    impl Engine for StubEngine {
        fn name(&self) -> &str {
            "stub"
        }

        async fn start(&self) -> Result<(), NodeError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<(), NodeError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn add_user(&self, tag: &str, _user: &User) -> Result<(), NodeError> {
            if !self.contains_tag(tag) {
                return Err(NodeError::UnknownTag(tag.to_string()));
            }
            Ok(())
        }

        async fn remove_user(&self, _tag: &str, _user: &User) -> Result<(), NodeError> {
            Ok(())
        }

        async fn get_usages(&self) -> Result<Vec<UsageRecord>, NodeError> {
            Ok(vec![])
        }

        fn get_logs(&self) -> LogSubscription {
            self.logs.subscribe()
        }

        fn list_inbounds(&self) -> Vec<Inbound> {
            self.inbounds.clone()
        }

        async fn get_config(&self) -> Result<String, NodeError> {
            Ok("{}".to_string())
        }

        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn version(&self) -> Option<String> {
            Some("1.0.0".to_string())
        }
    }

    fn stub() -> StubEngine {
        StubEngine {
            running: AtomicBool::new(false),
            logs: Arc::new(LogBroadcaster::new(16)),
            inbounds: vec![Inbound {
                tag: "vless-tcp".to_string(),
                protocol: Protocol::Vless,
                config: Default::default(),
            }],
        }
    }

    #[tokio::test]
    async fn default_restart_stops_then_starts() {
        let engine = stub();
        engine.start().await.unwrap();
        assert!(engine.running());
        engine.restart().await.unwrap();
        assert!(engine.running());
    }

    #[tokio::test]
    async fn add_user_rejects_unknown_tag() {
        let engine = stub();
        let user = User {
            id: 1,
            username: "alice".into(),
            key: "k".into(),
        };
        let err = engine.add_user("ghost", &user).await.unwrap_err();
        assert!(matches!(err, NodeError::UnknownTag(t) if t == "ghost"));
    }

    #[test]
    fn contains_tag_default_impl_scans_list_inbounds() {
        let engine = stub();
        assert!(engine.contains_tag("vless-tcp"));
        assert!(!engine.contains_tag("missing"));
    }

    #[tokio::test]
    async fn default_set_config_is_rejected() {
        let engine = stub();
        let err = engine.set_config("{}").await.unwrap_err();
        assert!(matches!(err, NodeError::ConfigInvalid(_)));
    }
}
