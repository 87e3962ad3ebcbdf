//! Telos: taint-based mandatory access control for AI agent processes.
//!
//! The control plane for the Telos LSM engine. It creates the shared
//! tables, loads and attaches the enforcement hooks, writes the default
//! policy, and serves a line-delimited JSON protocol on a Unix socket that
//! upstream sensors use to raise or clear a process's taint.
//!
//! The decision logic itself lives in [`telos_engine`].

pub mod audit;
pub mod client;
pub mod config;
pub mod daemon;
pub mod handler;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod store;
pub mod sys;

pub use telos_engine as engine;
