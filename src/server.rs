use actix_cors::Cors;
use actix_web::dev::Server;
use actix_web::{App, HttpServer, middleware::Logger, web};
use log::info;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppSettings;
use crate::middleware::{IpRateLimiter, RateLimitMiddleware, SecureAuthentication};
use crate::routes;
use crate::services::auth::jwt::JwtService;
use crate::services::identity_store::IdentityStore;
use crate::services::relay_hub::RelayHub;
use crate::services::token_verifier::{RelayTokenVerifier, TokenVerifier};

const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Process-wide state shared by every worker.
#[derive(Clone)]
pub struct RelayServices {
    pub identity: IdentityStore,
    pub jwt: JwtService,
    pub hub: web::Data<RelayHub>,
    pub verifier: web::Data<dyn TokenVerifier>,
    pub auth_limiter: IpRateLimiter,
}

impl RelayServices {
    pub fn new(settings: &AppSettings) -> Self {
        let identity = IdentityStore::new();
        let jwt = JwtService::new(&settings.auth.jwt_secret, settings.auth.token_duration_minutes);
        let verifier: Arc<dyn TokenVerifier> =
            Arc::new(RelayTokenVerifier::new(jwt.clone(), identity.clone()));

        Self {
            identity,
            jwt,
            hub: web::Data::new(RelayHub::new(settings.relay.clone())),
            verifier: web::Data::from(verifier),
            auth_limiter: IpRateLimiter::new(&settings.rate_limit),
        }
    }
}

fn build_cors(origins: &[String]) -> Cors {
    let mut cors = Cors::default();

    if origins.iter().any(|origin| origin == "*") {
        cors = cors.allow_any_origin();
    } else {
        for origin in origins {
            cors = cors.allowed_origin(origin);
        }
    }

    cors.allow_any_method().allow_any_header()
}

/// Bind the HTTP server to an already-open listener and start it.
pub fn run(settings: AppSettings, listener: TcpListener) -> std::io::Result<Server> {
    let services = RelayServices::new(&settings);

    let limiter = services.auth_limiter.clone();
    actix_rt::spawn(async move {
        let mut ticker = actix_rt::time::interval(RATE_LIMIT_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            limiter.purge_expired();
        }
    });

    info!(
        "{} ({}) listening on {:?}",
        settings.app.name,
        settings.app.environment,
        listener.local_addr()
    );

    let server = HttpServer::new(move || {
        let services = services.clone();

        App::new()
            .wrap(Logger::default())
            .wrap(build_cors(&settings.server.cors_origins))
            .app_data(web::Data::new(services.identity.clone()))
            .app_data(web::Data::new(services.jwt.clone()))
            .app_data(services.hub.clone())
            .app_data(services.verifier.clone())
            .configure(routes::configure_public_routes)
            .service(
                web::scope("/auth")
                    .wrap(RateLimitMiddleware::new(services.auth_limiter.clone()))
                    .configure(routes::configure_auth_routes),
            )
            .service(
                web::scope("/devices")
                    .wrap(SecureAuthentication::new(services.jwt.clone(), services.identity.clone()))
                    .configure(routes::configure_device_routes),
            )
    })
    .listen(listener)?
    .run();

    Ok(server)
}
