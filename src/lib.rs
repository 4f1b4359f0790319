//! Job Relay Server Library
//!
//! WebSocket relay between mobile clients and a desktop job runner, plus the
//! small account and device-pairing API it needs. Exported for the server
//! binary and the integration tests.

pub mod api_contract;
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod services;

// Re-export commonly used types for convenience
pub use config::AppSettings;
pub use error::AppError;
