//! Hysteria2 adapter: YAML config, HTTP auth callback served in-process,
//! usage polled from Hysteria2's own traffic-stats HTTP endpoint.

pub mod config;
mod engine;

pub use engine::Hysteria2Engine;
