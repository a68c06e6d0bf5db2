//! gRPC reconciliation service: the node agent's implementation of the
//! `NodeControl` control-plane RPCs, wired against a [`node_store::Storage`]
//! and a [`node_supervisor::Supervisor`].

mod convert;
mod service;
mod status;

pub use service::ReconciliationService;
