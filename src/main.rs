use dotenv::dotenv;
use std::net::TcpListener;

use job_relay::config;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // Load application settings
    let app_settings = match config::init_config() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load application settings: {}", e);
            std::process::exit(1);
        }
    };

    let host = app_settings.server.host.clone();
    let port = app_settings.server.port;
    log::info!("Starting server at http://{}:{}", host, port);

    let listener = TcpListener::bind((host.as_str(), port))?;
    job_relay::server::run(app_settings, listener)?.await
}
