//! The control plane's single gRPC service: reconciles the fleet
//! controller's view of users and inbounds against the locally supervised
//! engines.
//!
//! Grounded in the reference agent's `MarzService` (`service/service.py`):
//! `_add_user`/`_update_user`/`_remove_user` collapse here into
//! `apply_user_data`/`drop_user`, generalized from a single `XrayAPI` call
//! site to routing through [`Supervisor::resolve_tag`] so any engine can
//! own any tag.

use crate::{convert, status};
use node_core::model::{user_identifier, User};
use node_core::NodeError;
use node_proto::node_control_server::NodeControl;
use node_proto::{
    BackendConfig, BackendLogsRequest, BackendName, BackendStats, BackendsResponse, Empty, LogLine,
    RestartBackendRequest, UserData, UserStat, UsersData, UsersStats,
};
use node_store::Storage;
use node_supervisor::Supervisor;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::warn;

pub struct ReconciliationService {
    storage: Arc<Storage>,
    supervisor: Arc<Supervisor>,
}

impl ReconciliationService {
    pub fn new(storage: Arc<Storage>, supervisor: Arc<Supervisor>) -> Self {
        Self { storage, supervisor }
    }

    /// Apply a single user's target inbound set: an empty set means the
    /// user no longer belongs anywhere and is dropped entirely, matching
    /// `_update_user`'s `if not user_data.inbounds: return await
    /// self._remove_user(...)` branch. Otherwise the user is upserted and
    /// the tag diff is projected onto the owning engines.
    ///
    /// Storage-level failures (an inbound tag unknown to this node) are
    /// returned to the caller — they mean the request itself was invalid.
    /// Failures projecting onto an individual engine are logged and
    /// skipped, since storage has already committed to the new state and a
    /// later sync will retry the projection.
    async fn apply_user_data(&self, user: User, tags: HashSet<String>) -> Result<(), NodeError> {
        if tags.is_empty() {
            self.drop_user(user.id).await;
            return Ok(());
        }

        let (added, removed) = self.storage.update_user_inbounds(user.clone(), tags)?;
        for tag in &removed {
            self.remove_from_tag(tag, &user).await;
        }
        for tag in &added {
            self.add_to_tag(tag, &user).await;
        }
        Ok(())
    }

    async fn drop_user(&self, user_id: u64) {
        let Some(user) = self.storage.get_user(user_id) else {
            return;
        };
        for tag in self.storage.remove_user(user_id) {
            self.remove_from_tag(&tag, &user).await;
        }
    }

    async fn add_to_tag(&self, tag: &str, user: &User) {
        match self.supervisor.resolve_tag(tag) {
            Ok(engine) => {
                if let Err(e) = engine.add_user(tag, user).await {
                    warn!(tag, user = %user_identifier(user), error = %e, "failed to add user to inbound");
                }
            }
            Err(e) => warn!(tag, error = %e, "no engine owns tag"),
        }
    }

    async fn remove_from_tag(&self, tag: &str, user: &User) {
        match self.supervisor.resolve_tag(tag) {
            Ok(engine) => {
                if let Err(e) = engine.remove_user(tag, user).await {
                    warn!(tag, user = %user_identifier(user), error = %e, "failed to remove user from inbound");
                }
            }
            Err(e) => warn!(tag, error = %e, "no engine owns tag"),
        }
    }
}

fn user_data_user(user_data: &UserData) -> Result<User, Status> {
    user_data
        .user
        .clone()
        .map(convert::core_user)
        .ok_or_else(|| Status::invalid_argument("user_data missing user"))
}

#[tonic::async_trait]
impl NodeControl for ReconciliationService {
    async fn sync_users(&self, request: Request<Streaming<UserData>>) -> Result<Response<Empty>, Status> {
        let mut stream = request.into_inner();
        while let Some(user_data) = stream.message().await? {
            let user = user_data_user(&user_data)?;
            let tags = convert::inbound_tags(&user_data.inbounds);
            self.apply_user_data(user, tags).await.map_err(status::to_status)?;
        }
        Ok(Response::new(Empty {}))
    }

    async fn repopulate_users(&self, request: Request<UsersData>) -> Result<Response<Empty>, Status> {
        let users_data = request.into_inner().users_data;

        let mut seen = HashSet::with_capacity(users_data.len());
        for user_data in &users_data {
            let user = user_data_user(user_data)?;
            seen.insert(user.id);
            let tags = convert::inbound_tags(&user_data.inbounds);
            self.apply_user_data(user, tags).await.map_err(status::to_status)?;
        }

        for user in self.storage.list_users() {
            if !seen.contains(&user.id) {
                self.drop_user(user.id).await;
            }
        }

        Ok(Response::new(Empty {}))
    }

    async fn fetch_backends(&self, _request: Request<Empty>) -> Result<Response<BackendsResponse>, Status> {
        let backends = self
            .supervisor
            .list_backends()
            .iter()
            .map(convert::proto_backend)
            .collect::<Result<_, _>>()
            .map_err(status::to_status)?;
        Ok(Response::new(BackendsResponse { backends }))
    }

    async fn fetch_users_stats(&self, _request: Request<Empty>) -> Result<Response<UsersStats>, Status> {
        let mut totals: HashMap<u64, u64> = HashMap::new();
        for record in self.supervisor.collect_usages().await {
            *totals.entry(record.user_id).or_insert(0) += record.uplink + record.downlink;
        }
        let users_stats = totals.into_iter().map(|(uid, usage)| UserStat { uid, usage }).collect();
        Ok(Response::new(UsersStats { users_stats }))
    }

    type StreamBackendLogsStream = Pin<Box<dyn Stream<Item = Result<LogLine, Status>> + Send + 'static>>;

    async fn stream_backend_logs(
        &self,
        request: Request<BackendLogsRequest>,
    ) -> Result<Response<Self::StreamBackendLogsStream>, Status> {
        let req = request.into_inner();
        let Some((_, engine)) = self.supervisor.adapter_by_name(&req.backend_name) else {
            return Err(Status::not_found(format!("unknown backend: {}", req.backend_name)));
        };

        let mut subscription = engine.get_logs();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            if req.include_buffer {
                for line in subscription.backlog.drain(..) {
                    if tx.send(Ok(LogLine { line: line.into_bytes() })).await.is_err() {
                        return;
                    }
                }
            }
            loop {
                match subscription.receiver.recv().await {
                    Ok(line) => {
                        if tx.send(Ok(LogLine { line: line.into_bytes() })).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn fetch_backend_config(&self, request: Request<BackendName>) -> Result<Response<BackendConfig>, Status> {
        let name = request.into_inner().name;
        let Some((kind, engine)) = self.supervisor.adapter_by_name(&name) else {
            return Err(Status::not_found(format!("unknown backend: {name}")));
        };
        let configuration = engine.get_config().await.map_err(status::to_status)?;
        Ok(Response::new(BackendConfig { configuration, config_format: convert::config_format_for(kind) }))
    }

    async fn restart_backend(&self, request: Request<RestartBackendRequest>) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let Some((_, engine)) = self.supervisor.adapter_by_name(&req.backend_name) else {
            return Err(Status::not_found(format!("unknown backend: {}", req.backend_name)));
        };

        if let Some(configuration) = req.configuration {
            engine.set_config(&configuration).await.map_err(status::to_status)?;
        }

        self.supervisor.restart_name(&req.backend_name).await.map_err(status::to_status)?;
        Ok(Response::new(Empty {}))
    }

    async fn get_backend_stats(&self, request: Request<BackendName>) -> Result<Response<BackendStats>, Status> {
        let name = request.into_inner().name;
        let Some((_, engine)) = self.supervisor.adapter_by_name(&name) else {
            return Err(Status::not_found(format!("unknown backend: {name}")));
        };
        Ok(Response::new(BackendStats { running: engine.running() }))
    }
}
