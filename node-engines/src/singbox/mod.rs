//! sing-box adapter: JSON config, batched user mutation + `SIGHUP` reload,
//! the same v2ray-style stats API Xray exposes (sing-box's `v2ray_api`
//! experimental feature speaks the identical `StatsService` wire protocol).

pub mod accounts;
pub mod config;
mod engine;

pub use engine::SingBoxEngine;
