pub mod settings;

use log::info;

pub use settings::{AppSettings, DesktopConflictPolicy, OverflowPolicy, RelayConfig, ResponseRouting};

/// Initialize application configuration
pub fn init_config() -> Result<settings::AppSettings, crate::error::AppError> {
    info!("Initializing application configuration from environment");
    settings::AppSettings::from_env()
}
