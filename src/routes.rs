use actix_web::web;

use crate::handlers;

/// Public account routes, mounted under `/auth` behind the IP rate limiter.
pub fn configure_auth_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/register", web::post().to(handlers::auth_handlers::register_handler))
        .route("/login", web::post().to(handlers::auth_handlers::login_handler))
        .route("/refresh", web::post().to(handlers::auth_handlers::refresh_handler));
}

/// Device management, mounted under `/devices` behind bearer authentication.
pub fn configure_device_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/pair", web::post().to(handlers::device_handlers::pair_device_handler))
        .route("", web::get().to(handlers::device_handlers::list_devices_handler))
        .route("/{device_id}", web::delete().to(handlers::device_handlers::delete_device_handler));
}

/// Unauthenticated routes. The WebSocket checks its own query credentials.
pub fn configure_public_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::health::health_check))
        .route("/ws", web::get().to(handlers::device_handlers::relay_ws_handler));
}
