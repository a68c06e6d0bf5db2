//! Xray-core adapter: JSON5 config, gRPC admin channel (`HandlerService` /
//! `StatsService`), reality key derivation via the `xray` binary itself.

pub mod api;
pub mod config;
mod engine;

pub use engine::XrayEngine;
