//! # molt-server
//!
//! Websocket server with hot reload: `SIGHUP` hands the listening socket to
//! a fresh process, and the old process drains its connections before
//! exiting.

pub mod config;
pub mod server;
pub mod telemetry;

pub use config::ServerConfig;
pub use server::routes::websocket::Reply;
