pub mod auth_handlers;
pub mod device_handlers;
pub mod health;
