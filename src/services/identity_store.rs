use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::services::auth::password::{hash_password, verify_password};

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_DEVICE_NAME_LENGTH: usize = 100;
const DEVICE_TOKEN_BYTES: usize = 48;
const REFRESH_TOKEN_BYTES: usize = 64;
const REFRESH_TOKEN_TTL_DAYS: i64 = 30;
/// How long a spent refresh token is kept so that its reuse can be detected
const SPENT_REFRESH_TOKEN_RETENTION_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub device_id: Uuid,
    pub account_id: Uuid,
    pub device_name: String,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RefreshRecord {
    user_id: Uuid,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    spent: bool,
}

enum RefreshCheck {
    Valid,
    Reused,
    Expired,
}

/// In-memory users, paired devices and refresh tokens.
///
/// Device and refresh tokens are never stored; only their SHA-256 digest is
/// kept and used as the lookup key.
#[derive(Clone, Default)]
pub struct IdentityStore {
    users: Arc<DashMap<Uuid, UserRecord>>,
    emails: Arc<DashMap<String, Uuid>>,
    devices: Arc<DashMap<Uuid, DeviceRecord>>,
    device_tokens: Arc<DashMap<String, Uuid>>,
    refresh_tokens: Arc<DashMap<String, RefreshRecord>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_user(&self, email: &str, password: &str) -> Result<UserRecord, AppError> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(AppError::Validation("invalid email".to_string()));
        }
        if password.len() < MIN_PASSWORD_LENGTH {
            return Err(AppError::Validation(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_LENGTH
            )));
        }

        let password_hash = hash_password(password)?;
        let user_id = Uuid::new_v4();

        // The email index entry is the uniqueness guard
        let mut claimed = false;
        self.emails.entry(email.clone()).or_insert_with(|| {
            claimed = true;
            user_id
        });
        if !claimed {
            return Err(AppError::Conflict("email already registered".to_string()));
        }

        let record = UserRecord {
            user_id,
            email,
            password_hash,
            created_at: Utc::now(),
        };
        self.users.insert(user_id, record.clone());
        info!(user_id = %user_id, "user_registered");
        Ok(record)
    }

    pub fn authenticate(&self, email: &str, password: &str) -> Result<UserRecord, AppError> {
        let invalid = || AppError::Unauthorized("invalid email or password".to_string());

        let user_id = self
            .emails
            .get(&normalize_email(email))
            .map(|entry| *entry.value())
            .ok_or_else(invalid)?;
        let record = self
            .users
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(invalid)?;

        if verify_password(password, &record.password_hash) {
            Ok(record)
        } else {
            Err(invalid())
        }
    }

    pub fn user_exists(&self, user_id: &Uuid) -> bool {
        self.users.contains_key(user_id)
    }

    /// Pair a new desktop device and return its record with the plaintext token.
    /// The token is only ever returned here.
    pub fn pair_device(
        &self,
        account_id: Uuid,
        device_name: &str,
    ) -> Result<(DeviceRecord, String), AppError> {
        let device_name = device_name.trim();
        if device_name.is_empty() {
            return Err(AppError::BadRequest("device_name is required".to_string()));
        }
        if device_name.chars().count() > MAX_DEVICE_NAME_LENGTH {
            return Err(AppError::BadRequest(format!(
                "device_name must be at most {} characters",
                MAX_DEVICE_NAME_LENGTH
            )));
        }

        let token = generate_token(DEVICE_TOKEN_BYTES);
        let record = DeviceRecord {
            device_id: Uuid::new_v4(),
            account_id,
            device_name: device_name.to_string(),
            token_hash: hash_token(&token),
            created_at: Utc::now(),
            last_seen: None,
        };

        self.device_tokens
            .insert(record.token_hash.clone(), record.device_id);
        self.devices.insert(record.device_id, record.clone());

        info!(
            account_id = %account_id,
            device_id = %record.device_id,
            "device_paired"
        );
        Ok((record, token))
    }

    /// Devices paired to an account, oldest first.
    pub fn list_devices(&self, account_id: &Uuid) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter(|entry| entry.account_id == *account_id)
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by_key(|device| device.created_at);
        devices
    }

    /// Unpair a device. Devices of other accounts are reported as not found.
    pub fn remove_device(&self, account_id: &Uuid, device_id: &Uuid) -> Result<DeviceRecord, AppError> {
        let (_, record) = self
            .devices
            .remove_if(device_id, |_, device| device.account_id == *account_id)
            .ok_or_else(|| AppError::NotFound("device not found".to_string()))?;

        self.device_tokens.remove(&record.token_hash);
        info!(account_id = %account_id, device_id = %device_id, "device_unpaired");
        Ok(record)
    }

    /// Resolve a plaintext device token, stamping the device's `last_seen`.
    pub fn resolve_device_token(&self, token: &str) -> Option<DeviceRecord> {
        let device_id = *self.device_tokens.get(&hash_token(token))?.value();

        let mut device = self.devices.get_mut(&device_id)?;
        device.last_seen = Some(Utc::now());
        debug!(device_id = %device_id, "device_token_resolved");
        Some(device.value().clone())
    }

    /// Issue a new single-use refresh token for a user.
    pub fn issue_refresh_token(&self, user_id: Uuid) -> String {
        let now = Utc::now();
        let token = generate_token(REFRESH_TOKEN_BYTES);
        self.refresh_tokens.insert(
            hash_token(&token),
            RefreshRecord {
                user_id,
                created_at: now,
                expires_at: now + Duration::days(REFRESH_TOKEN_TTL_DAYS),
                spent: false,
            },
        );
        token
    }

    /// Spend a refresh token and issue its replacement.
    ///
    /// Presenting a token that was already spent revokes every refresh token
    /// of its user.
    pub fn rotate_refresh_token(&self, token: &str) -> Result<(UserRecord, String), AppError> {
        let invalid = || AppError::Unauthorized("invalid refresh token".to_string());
        let token_hash = hash_token(token);
        let now = Utc::now();

        let (user_id, check) = {
            let mut record = self.refresh_tokens.get_mut(&token_hash).ok_or_else(invalid)?;
            let check = if record.spent {
                RefreshCheck::Reused
            } else if record.expires_at < now {
                RefreshCheck::Expired
            } else {
                record.spent = true;
                RefreshCheck::Valid
            };
            (record.user_id, check)
        };

        match check {
            RefreshCheck::Reused => {
                warn!(user_id = %user_id, "refresh_token_reused_revoking_all");
                self.revoke_refresh_tokens(&user_id);
                return Err(invalid());
            }
            RefreshCheck::Expired => {
                self.refresh_tokens.remove(&token_hash);
                return Err(invalid());
            }
            RefreshCheck::Valid => {}
        }

        let retention = Duration::minutes(SPENT_REFRESH_TOKEN_RETENTION_MINUTES);
        self.refresh_tokens.retain(|_, record| {
            record.expires_at >= now && !(record.spent && record.created_at < now - retention)
        });

        let user = self
            .users
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(invalid)?;
        debug!(user_id = %user_id, "refresh_token_rotated");
        Ok((user, self.issue_refresh_token(user_id)))
    }

    pub fn revoke_refresh_tokens(&self, user_id: &Uuid) {
        self.refresh_tokens.retain(|_, record| record.user_id != *user_id);
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn generate_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_normalizes_and_rejects_duplicates() {
        let store = IdentityStore::new();
        let user = store.register_user("  Alice@Example.com ", "password123").unwrap();
        assert_eq!(user.email, "alice@example.com");

        let err = store.register_user("alice@example.com", "password456").unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_register_validates_input() {
        let store = IdentityStore::new();
        assert!(matches!(
            store.register_user("no-at-sign", "password123"),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            store.register_user("a@example.com", "short"),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_authenticate() {
        let store = IdentityStore::new();
        let user = store.register_user("a@example.com", "password123").unwrap();

        assert_eq!(
            store.authenticate("A@example.com", "password123").unwrap().user_id,
            user.user_id
        );
        assert!(matches!(
            store.authenticate("a@example.com", "wrong-password"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(matches!(
            store.authenticate("nobody@example.com", "password123"),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_pair_resolve_and_remove_device() {
        let store = IdentityStore::new();
        let account_id = Uuid::new_v4();

        let (device, token) = store.pair_device(account_id, " workstation ").unwrap();
        assert_eq!(device.device_name, "workstation");
        assert_eq!(token.len(), 64);
        assert_ne!(device.token_hash, token);

        let resolved = store.resolve_device_token(&token).unwrap();
        assert_eq!(resolved.device_id, device.device_id);
        assert!(resolved.last_seen.is_some());
        assert!(store.resolve_device_token("bogus").is_none());

        // Another account cannot unpair it
        assert!(matches!(
            store.remove_device(&Uuid::new_v4(), &device.device_id),
            Err(AppError::NotFound(_))
        ));

        store.remove_device(&account_id, &device.device_id).unwrap();
        assert!(store.resolve_device_token(&token).is_none());
        assert!(store.list_devices(&account_id).is_empty());
    }

    #[test]
    fn test_refresh_token_rotation() {
        let store = IdentityStore::new();
        let user = store.register_user("r@example.com", "password123").unwrap();
        let first = store.issue_refresh_token(user.user_id);
        assert_eq!(first.len(), 86);

        let (owner, second) = store.rotate_refresh_token(&first).unwrap();
        assert_eq!(owner.user_id, user.user_id);
        assert_ne!(first, second);

        let (_, third) = store.rotate_refresh_token(&second).unwrap();
        assert!(matches!(
            store.rotate_refresh_token("bogus"),
            Err(AppError::Unauthorized(_))
        ));
        assert!(store.rotate_refresh_token(&third).is_ok());
    }

    #[test]
    fn test_refresh_token_reuse_revokes_family() {
        let store = IdentityStore::new();
        let user = store.register_user("r@example.com", "password123").unwrap();
        let other = store.register_user("o@example.com", "password123").unwrap();
        let stolen = store.issue_refresh_token(user.user_id);
        let bystander = store.issue_refresh_token(other.user_id);

        let (_, current) = store.rotate_refresh_token(&stolen).unwrap();
        assert!(matches!(
            store.rotate_refresh_token(&stolen),
            Err(AppError::Unauthorized(_))
        ));
        // The legitimate holder's token went with it
        assert!(store.rotate_refresh_token(&current).is_err());
        assert!(store.rotate_refresh_token(&bystander).is_ok());
    }

    #[test]
    fn test_expired_refresh_token_is_rejected() {
        let store = IdentityStore::new();
        let user = store.register_user("r@example.com", "password123").unwrap();
        let token = store.issue_refresh_token(user.user_id);
        if let Some(mut record) = store.refresh_tokens.get_mut(&hash_token(&token)) {
            record.expires_at = Utc::now() - Duration::seconds(1);
        }

        assert!(matches!(
            store.rotate_refresh_token(&token),
            Err(AppError::Unauthorized(_))
        ));
        assert!(store.refresh_tokens.is_empty());
    }

    #[test]
    fn test_pair_rejects_blank_name() {
        let store = IdentityStore::new();
        assert!(matches!(
            store.pair_device(Uuid::new_v4(), "   "),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_list_devices_is_scoped_to_account() {
        let store = IdentityStore::new();
        let mine = Uuid::new_v4();
        store.pair_device(mine, "one").unwrap();
        store.pair_device(mine, "two").unwrap();
        store.pair_device(Uuid::new_v4(), "theirs").unwrap();

        let names: Vec<String> = store
            .list_devices(&mine)
            .into_iter()
            .map(|d| d.device_name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(!names.contains(&"theirs".to_string()));
    }
}
