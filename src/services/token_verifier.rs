use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::models::Principal;
use crate::services::auth::jwt::JwtService;
use crate::services::identity_store::IdentityStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials: provide token or device_token")]
    MissingCredentials,
    #[error("ambiguous credentials: provide only one of token or device_token")]
    AmbiguousCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    #[error("unknown or revoked device")]
    UnknownDevice,
    #[error("unknown account")]
    UnknownAccount,
}

/// The two credential shapes a relay handshake may present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Account access token, presented by mobile clients
    Bearer(String),
    /// Paired device token, presented by the desktop job runner
    Device(String),
}

impl Credentials {
    /// Build credentials from the handshake query. Exactly one must be present;
    /// empty values count as absent.
    pub fn from_query(token: Option<&str>, device_token: Option<&str>) -> Result<Self, AuthError> {
        let token = token.map(str::trim).filter(|t| !t.is_empty());
        let device_token = device_token.map(str::trim).filter(|t| !t.is_empty());

        match (token, device_token) {
            (Some(t), None) => Ok(Credentials::Bearer(t.to_string())),
            (None, Some(d)) => Ok(Credentials::Device(d.to_string())),
            (Some(_), Some(_)) => Err(AuthError::AmbiguousCredentials),
            (None, None) => Err(AuthError::MissingCredentials),
        }
    }
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError>;
}

/// Verifies access tokens as JWTs and device tokens against the identity store.
#[derive(Clone)]
pub struct RelayTokenVerifier {
    jwt: JwtService,
    identity: IdentityStore,
}

impl RelayTokenVerifier {
    pub fn new(jwt: JwtService, identity: IdentityStore) -> Self {
        Self { jwt, identity }
    }
}

#[async_trait]
impl TokenVerifier for RelayTokenVerifier {
    async fn verify(&self, credentials: &Credentials) -> Result<Principal, AuthError> {
        match credentials {
            Credentials::Bearer(token) => {
                let (account_id, _claims) = self.jwt.verify_account(token)?;
                if !self.identity.user_exists(&account_id) {
                    return Err(AuthError::UnknownAccount);
                }
                debug!("Verified mobile principal for account {}", account_id);
                Ok(Principal::mobile(account_id))
            }
            Credentials::Device(token) => {
                let device = self
                    .identity
                    .resolve_device_token(token)
                    .ok_or(AuthError::UnknownDevice)?;
                debug!(
                    "Verified desktop principal {} for account {}",
                    device.device_id, device.account_id
                );
                Ok(Principal::desktop(device.account_id, device.device_id, device.device_name))
            }
        }
    }
}
