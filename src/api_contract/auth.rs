use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of both `POST /auth/register` and `POST /auth/login`.
#[derive(Deserialize, Serialize)]
pub struct EmailPasswordRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, Serialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Returned by register, login and refresh. The refresh token is single use.
#[derive(Deserialize, Serialize)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
}
