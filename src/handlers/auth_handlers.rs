use actix_web::{HttpResponse, web};
use log::info;

use crate::api_contract::auth::{AuthResponse, EmailPasswordRequest, RefreshRequest};
use crate::error::AppError;
use crate::services::auth::jwt::JwtService;
use crate::services::identity_store::{IdentityStore, UserRecord};

fn token_pair(jwt: &JwtService, user: &UserRecord, refresh_token: String) -> Result<AuthResponse, AppError> {
    let access_token = jwt.generate_token(user.user_id, &user.email)?;
    Ok(AuthResponse {
        user_id: user.user_id,
        access_token,
        refresh_token,
    })
}

/// Create an account and return a token pair for it
pub async fn register_handler(
    identity: web::Data<IdentityStore>,
    jwt: web::Data<JwtService>,
    body: web::Json<EmailPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    let user = identity.register_user(&body.email, &body.password)?;
    let tokens = token_pair(&jwt, &user, identity.issue_refresh_token(user.user_id))?;

    info!("Registered account {}", user.user_id);
    Ok(HttpResponse::Ok().json(tokens))
}

pub async fn login_handler(
    identity: web::Data<IdentityStore>,
    jwt: web::Data<JwtService>,
    body: web::Json<EmailPasswordRequest>,
) -> Result<HttpResponse, AppError> {
    let user = identity.authenticate(&body.email, &body.password)?;
    let tokens = token_pair(&jwt, &user, identity.issue_refresh_token(user.user_id))?;

    info!("Account {} logged in", user.user_id);
    Ok(HttpResponse::Ok().json(tokens))
}

/// Exchange a refresh token for a new token pair
pub async fn refresh_handler(
    identity: web::Data<IdentityStore>,
    jwt: web::Data<JwtService>,
    body: web::Json<RefreshRequest>,
) -> Result<HttpResponse, AppError> {
    let (user, refresh_token) = identity.rotate_refresh_token(&body.refresh_token)?;
    let tokens = token_pair(&jwt, &user, refresh_token)?;

    info!("Refreshed tokens for account {}", user.user_id);
    Ok(HttpResponse::Ok().json(tokens))
}
