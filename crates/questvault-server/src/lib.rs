//! Monitoring server for the Questvault persistence layer.
//!
//! The persistence core is consumed in-process by the transport layer;
//! the only network surface this crate adds is a pair of read-only
//! endpoints for the external monitoring collaborator:
//!
//! - `GET /health` -- [`HealthReport`](questvault_types::HealthReport),
//!   `200` when healthy and `503` otherwise
//! - `GET /stats` -- [`StorageStats`](questvault_types::StorageStats) in
//!   the result envelope
//!
//! # Modules
//!
//! - [`router`] -- Route table and middleware
//! - [`handlers`] -- Endpoint handlers
//! - [`state`] -- Shared handler state
//! - [`server`] -- Listener lifecycle
//! - [`error`] -- Error types

pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

// Re-export primary types for convenience.
pub use error::MonitorError;
pub use router::build_router;
pub use server::{DEFAULT_PORT, ServerConfig, ServerError, start_server};
pub use state::AppState;
