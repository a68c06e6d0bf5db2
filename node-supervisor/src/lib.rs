//! Engine lifecycle supervision: tag-based routing to the right adapter,
//! on-demand restart, and restart-on-crash.
//!
//! Grounded in the background-watch-loop idiom of the reference gateway's
//! `HealthChecker::start_active_check` (a `tokio::spawn`ed loop reacting to
//! external state) but event-driven here: each adapter contributes a stable
//! `Notify` fired once per child-process exit, rather than a polling
//! interval.

use node_core::model::{BackendDescriptor, EngineKind, User};
use node_core::NodeError;
use node_engine::{Engine, UsageRecord};
use node_store::Storage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

struct Adapter {
    kind: EngineKind,
    engine: Arc<dyn Engine>,
    /// Held for the duration of a deliberate restart, so the crash-watch
    /// task can tell a planned exit from a crash.
    restart_lock: Arc<Mutex<()>>,
}

/// Routes tags to engine adapters in registration order and supervises
/// their lifecycle.
pub struct Supervisor {
    storage: Arc<Storage>,
    adapters: Vec<Adapter>,
    restart_on_failure: bool,
    restart_interval: Duration,
}

impl Supervisor {
    pub fn new(storage: Arc<Storage>, restart_on_failure: bool, restart_interval: Duration) -> Self {
        Self {
            storage,
            adapters: Vec::new(),
            restart_on_failure,
            restart_interval,
        }
    }

    /// Register an adapter. Adapters are scanned in registration order when
    /// resolving a tag — the agent wires xray, then sing-box, then
    /// hysteria2, and that order is the routing order.
    pub fn register(&mut self, kind: EngineKind, engine: Arc<dyn Engine>) {
        self.adapters.push(Adapter {
            kind,
            engine,
            restart_lock: Arc::new(Mutex::new(())),
        });
    }

    /// Find the adapter that owns `tag`, scanning in registration order.
    pub fn resolve_tag(&self, tag: &str) -> Result<Arc<dyn Engine>, NodeError> {
        self.adapters
            .iter()
            .find(|a| a.engine.contains_tag(tag))
            .map(|a| a.engine.clone())
            .ok_or_else(|| NodeError::UnknownTag(tag.to_string()))
    }

    pub fn engine_by_name(&self, name: &str) -> Option<Arc<dyn Engine>> {
        self.adapters.iter().find(|a| a.engine.name() == name).map(|a| a.engine.clone())
    }

    /// Look up a registered adapter by its stable name, along with its kind
    /// — used by `FetchBackendConfig`/`RestartBackend`/`GetBackendStats`,
    /// which address a backend by name rather than by tag.
    pub fn adapter_by_name(&self, name: &str) -> Option<(EngineKind, Arc<dyn Engine>)> {
        self.adapters
            .iter()
            .find(|a| a.engine.name() == name)
            .map(|a| (a.kind, a.engine.clone()))
    }

    /// Restart the adapter identified by its stable name (rather than one
    /// of its tags) — `RestartBackend` addresses backends this way.
    pub async fn restart_name(&self, name: &str) -> Result<(), NodeError> {
        let index = self
            .adapters
            .iter()
            .position(|a| a.engine.name() == name)
            .ok_or_else(|| NodeError::UnknownBackend(name.to_string()))?;
        self.restart_adapter(index).await
    }

    /// Collect per-user traffic across every registered adapter, the
    /// `FetchUsersStats` RPC's data source. An adapter that fails to report
    /// is logged and skipped rather than failing the whole collection.
    pub async fn collect_usages(&self) -> Vec<UsageRecord> {
        let mut all = Vec::new();
        for adapter in &self.adapters {
            match adapter.engine.get_usages().await {
                Ok(records) => all.extend(records),
                Err(e) => warn!(backend = adapter.engine.name(), error = %e, "failed to collect usage"),
            }
        }
        all
    }

    /// Status snapshot of every registered adapter, for `FetchBackends`.
    pub fn list_backends(&self) -> Vec<BackendDescriptor> {
        self.adapters
            .iter()
            .map(|a| BackendDescriptor {
                name: a.engine.name().to_string(),
                kind: a.kind,
                version: a.engine.version(),
                inbounds: a.engine.list_inbounds(),
                running: a.engine.running(),
            })
            .collect()
    }

    /// Start every registered adapter, project its inbounds into storage,
    /// and (if enabled) spawn a crash-watch task for each. Call once at
    /// startup after every adapter has been registered.
    pub async fn start_all(self: &Arc<Self>) -> Result<(), NodeError> {
        for index in 0..self.adapters.len() {
            let adapter = &self.adapters[index];
            adapter.engine.start().await?;
            for inbound in adapter.engine.list_inbounds() {
                self.storage.register_inbound(inbound);
            }
            if self.restart_on_failure {
                tokio::spawn(crash_watch(self.clone(), index));
            }
        }
        Ok(())
    }

    /// Persist the new config, stop, purge this engine's inbounds from
    /// storage, start, and re-project the users that were wired into them —
    /// the `RestartBackend` RPC's implementation.
    pub async fn restart_tag(&self, tag: &str) -> Result<(), NodeError> {
        let index = self
            .adapters
            .iter()
            .position(|a| a.engine.contains_tag(tag))
            .ok_or_else(|| NodeError::UnknownTag(tag.to_string()))?;
        self.restart_adapter(index).await
    }

    async fn restart_adapter(&self, index: usize) -> Result<(), NodeError> {
        let adapter = &self.adapters[index];
        let _guard = adapter.restart_lock.lock().await;
        self.cycle_adapter(adapter).await
    }

    async fn cycle_adapter(&self, adapter: &Adapter) -> Result<(), NodeError> {
        let displaced = self.purge_adapter_inbounds(adapter);

        adapter.engine.stop().await?;
        adapter.engine.start().await?;

        for inbound in adapter.engine.list_inbounds() {
            self.storage.register_inbound(inbound);
        }
        reproject_users(&adapter.engine, &displaced).await;

        info!(backend = adapter.engine.name(), "backend restarted");
        Ok(())
    }

    fn purge_adapter_inbounds(&self, adapter: &Adapter) -> Vec<(String, Vec<User>)> {
        let tags: Vec<String> = adapter.engine.list_inbounds().into_iter().map(|i| i.tag).collect();
        let mut displaced = Vec::with_capacity(tags.len());
        for tag in tags {
            let users = self.storage.list_inbound_users(&tag);
            self.storage.remove_inbound(&tag);
            displaced.push((tag, users));
        }
        displaced
    }
}

async fn reproject_users(engine: &Arc<dyn Engine>, displaced: &[(String, Vec<User>)]) {
    for (tag, users) in displaced {
        if !engine.contains_tag(tag) {
            continue;
        }
        for user in users {
            if let Err(e) = engine.add_user(tag, user).await {
                warn!(
                    tag,
                    user = %node_core::model::user_identifier(user),
                    error = %e,
                    "failed to re-project user after restart"
                );
            }
        }
    }
}

/// Awaits an adapter's crash signal; if it fires while no restart is in
/// flight, treats the exit as a crash: waits the configured interval, then
/// restarts the adapter and re-projects its users. A signal observed while
/// the restart lock is held was a deliberate stop, not a crash, and is
/// ignored.
async fn crash_watch(supervisor: Arc<Supervisor>, index: usize) {
    loop {
        let notify = supervisor.adapters[index].engine.crash_signal();
        notify.notified().await;

        let adapter = &supervisor.adapters[index];
        let Ok(_guard) = adapter.restart_lock.clone().try_lock_owned() else {
            continue;
        };
        if adapter.engine.running() {
            continue;
        }

        warn!(backend = adapter.engine.name(), "backend crashed, restarting");
        tokio::time::sleep(supervisor.restart_interval).await;

        let displaced = supervisor.purge_adapter_inbounds(adapter);
        if let Err(e) = adapter.engine.start().await {
            warn!(backend = adapter.engine.name(), error = %e, "crash recovery failed to restart backend");
            continue;
        }
        for inbound in adapter.engine.list_inbounds() {
            supervisor.storage.register_inbound(inbound);
        }
        reproject_users(&adapter.engine, &displaced).await;
    }
}
