use std::env;
use std::str::FromStr;
use std::time::Duration;
use crate::error::AppError;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppSettings {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub relay: RelayConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_duration_minutes: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u64,
}

/// What happens when a peer's outbound queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Deregister and close the slow consumer.
    Close,
    /// Discard the frame that did not fit.
    DropNewest,
}

/// Where desktop responses are delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseRouting {
    /// Every mobile in the account group.
    Broadcast,
    /// Only the mobile that issued the matching command id.
    Originator,
}

/// How a second desktop for the same account is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesktopConflictPolicy {
    Replace,
    Reject,
}

impl FromStr for OverflowPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "close" => Ok(Self::Close),
            "drop_newest" => Ok(Self::DropNewest),
            other => Err(AppError::Configuration(format!(
                "RELAY_OVERFLOW_POLICY must be 'close' or 'drop_newest', got '{}'",
                other
            ))),
        }
    }
}

impl FromStr for ResponseRouting {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "originator" => Ok(Self::Originator),
            other => Err(AppError::Configuration(format!(
                "RELAY_RESPONSE_ROUTING must be 'broadcast' or 'originator', got '{}'",
                other
            ))),
        }
    }
}

impl FromStr for DesktopConflictPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "reject" => Ok(Self::Reject),
            other => Err(AppError::Configuration(format!(
                "RELAY_DESKTOP_CONFLICT must be 'replace' or 'reject', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub send_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub response_routing: ResponseRouting,
    pub desktop_conflict: DesktopConflictPolicy,
    pub max_connections_per_account: usize,
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: u32,
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        let positive = [
            ("RELAY_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval_secs == 0),
            ("RELAY_SEND_QUEUE_CAPACITY", self.send_queue_capacity == 0),
            ("RELAY_MAX_CONNECTIONS_PER_ACCOUNT", self.max_connections_per_account == 0),
            ("RELAY_RATE_LIMIT_BURST", self.rate_limit_burst == 0),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, is_zero)| *is_zero) {
            return Err(AppError::Configuration(format!(
                "{} must be greater than zero",
                name
            )));
        }
        if self.client_timeout_secs <= self.heartbeat_interval_secs {
            return Err(AppError::Configuration(
                "RELAY_CLIENT_TIMEOUT_SECS must exceed RELAY_HEARTBEAT_INTERVAL_SECS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            send_queue_capacity: 256,
            overflow_policy: OverflowPolicy::Close,
            response_routing: ResponseRouting::Broadcast,
            desktop_conflict: DesktopConflictPolicy::Replace,
            max_connections_per_account: 5,
            rate_limit_burst: 50,
            rate_limit_per_sec: 25,
        }
    }
}

fn parse_env<T: FromStr>(name: &str, default: &str) -> Result<T, AppError> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse::<T>()
        .map_err(|_| AppError::Configuration(format!("{} must be a valid number", name)))
}

impl AppSettings {
    pub fn from_env() -> Result<Self, AppError> {
        // App config
        let app_name = env::var("APP_NAME").unwrap_or_else(|_| "job-relay".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        // Server config
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8090".to_string())
            .parse::<u16>()
            .map_err(|_| AppError::Configuration("SERVER_PORT must be a valid port number".to_string()))?;

        // CORS origins
        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Auth config
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Configuration("JWT_SECRET must be set".to_string()))?;
        if jwt_secret.trim().is_empty() {
            return Err(AppError::Configuration("JWT_SECRET must not be empty".to_string()));
        }

        let token_duration_minutes = parse_env::<i64>("JWT_ACCESS_TOKEN_DURATION_MINUTES", "60")?;

        // Rate limiting
        let rate_limit_window_ms = parse_env::<u64>("RATE_LIMIT_WINDOW_MS", "60000")?;
        let rate_limit_max_requests = parse_env::<u64>("RATE_LIMIT_MAX_REQUESTS", "10")?;

        // Relay hub
        let relay = RelayConfig {
            heartbeat_interval_secs: parse_env("RELAY_HEARTBEAT_INTERVAL_SECS", "30")?,
            client_timeout_secs: parse_env("RELAY_CLIENT_TIMEOUT_SECS", "90")?,
            send_queue_capacity: parse_env("RELAY_SEND_QUEUE_CAPACITY", "256")?,
            overflow_policy: env::var("RELAY_OVERFLOW_POLICY")
                .unwrap_or_else(|_| "close".to_string())
                .parse()?,
            response_routing: env::var("RELAY_RESPONSE_ROUTING")
                .unwrap_or_else(|_| "broadcast".to_string())
                .parse()?,
            desktop_conflict: env::var("RELAY_DESKTOP_CONFLICT")
                .unwrap_or_else(|_| "replace".to_string())
                .parse()?,
            max_connections_per_account: parse_env("RELAY_MAX_CONNECTIONS_PER_ACCOUNT", "5")?,
            rate_limit_burst: parse_env("RELAY_RATE_LIMIT_BURST", "50")?,
            rate_limit_per_sec: parse_env("RELAY_RATE_LIMIT_PER_SEC", "25")?,
        };

        relay.validate()?;

        Ok(Self {
            app: AppConfig {
                name: app_name,
                environment,
            },
            server: ServerConfig {
                host: server_host,
                port: server_port,
                cors_origins,
            },
            auth: AuthConfig {
                jwt_secret,
                token_duration_minutes,
            },
            rate_limit: RateLimitConfig {
                window_ms: rate_limit_window_ms,
                max_requests: rate_limit_max_requests,
            },
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("close".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::Close);
        assert_eq!(" DROP_NEWEST ".parse::<OverflowPolicy>().unwrap(), OverflowPolicy::DropNewest);
        assert_eq!("originator".parse::<ResponseRouting>().unwrap(), ResponseRouting::Originator);
        assert_eq!("Reject".parse::<DesktopConflictPolicy>().unwrap(), DesktopConflictPolicy::Reject);
    }

    #[test]
    fn test_unknown_policy_is_configuration_error() {
        let err = "sometimes".parse::<OverflowPolicy>().unwrap_err();
        assert!(matches!(err, AppError::Configuration(_)));
    }

    #[test]
    fn test_relay_defaults() {
        let relay = RelayConfig::default();
        assert_eq!(relay.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(relay.client_timeout(), Duration::from_secs(90));
        assert_eq!(relay.response_routing, ResponseRouting::Broadcast);
        assert_eq!(relay.desktop_conflict, DesktopConflictPolicy::Replace);
        assert!(relay.validate().is_ok());
    }

    #[test]
    fn test_relay_validation_rejects_zero_values() {
        let cases = [
            RelayConfig {
                heartbeat_interval_secs: 0,
                ..RelayConfig::default()
            },
            RelayConfig {
                rate_limit_burst: 0,
                ..RelayConfig::default()
            },
            RelayConfig {
                send_queue_capacity: 0,
                ..RelayConfig::default()
            },
            RelayConfig {
                max_connections_per_account: 0,
                ..RelayConfig::default()
            },
            RelayConfig {
                client_timeout_secs: 30,
                ..RelayConfig::default()
            },
        ];
        for relay in cases {
            assert!(matches!(relay.validate(), Err(AppError::Configuration(_))));
        }
    }
}
