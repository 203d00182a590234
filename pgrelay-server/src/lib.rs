//! gRPC surface of the pgrelay gateway
//!
//! Exposes `DB.DBService`:
//! - `executeQuery`: run a parameterized query, rows returned as JSON
//! - `listenToChannel`: stream LISTEN/NOTIFY events for one channel

pub mod proto;
pub mod server;
pub mod service;
pub mod status;

pub use proto::{DbServiceClient, DbServiceServer};
pub use server::{run_server, serve, shutdown_signal, ServerConfig, ServerError};
pub use service::DbServiceImpl;
