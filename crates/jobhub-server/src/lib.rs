//! jobhub hub server library.
//!
//! Wires the broker and the message router together behind an HTTP API with
//! server-sent-event push connections for workers, clients and monitors.

pub mod config;
pub mod connections;
pub mod http;
pub mod hub;
pub mod metrics;
pub mod tasks;

pub use config::{ConfigError, ServerConfig};
pub use connections::ConnectionRegistry;
pub use hub::{default_rules, Hub};
