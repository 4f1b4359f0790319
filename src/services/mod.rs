pub mod auth;
pub mod identity_store;
pub mod relay_hub;
pub mod relay_router;
pub mod relay_ws;
pub mod token_verifier;

// Re-export commonly used types
pub use relay_hub::RelayHub;
pub use token_verifier::{AuthError, TokenVerifier};
