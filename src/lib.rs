pub mod auth;
pub mod client;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod limits;
pub mod model;
pub mod node;
pub mod observability;
pub mod orchestrator;
pub mod reaper;
pub mod sql;
pub mod store;
pub mod wal;
pub mod wire;
