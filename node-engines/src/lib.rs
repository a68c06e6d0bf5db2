//! Concrete engine adapters: Xray-core, sing-box, Hysteria2.
//!
//! Each submodule owns a typed config-AST for its engine's native format
//! plus an `Engine` impl wiring that config to a supervised child process.

pub mod hysteria2;
pub mod singbox;
pub mod xray;

pub use hysteria2::Hysteria2Engine;
pub use singbox::SingBoxEngine;
pub use xray::XrayEngine;
