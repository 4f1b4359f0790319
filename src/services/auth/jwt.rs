use crate::error::AppError;
use crate::models::auth_jwt_claims::Claims;
use crate::services::token_verifier::AuthError;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, error, trace};
use uuid::Uuid;

// Default access token duration in minutes
pub const DEFAULT_TOKEN_DURATION_MINUTES: i64 = 60;

// Issuer name for JWT tokens
pub const JWT_ISSUER: &str = "job-relay";

/// Issues and verifies HS256 access tokens.
///
/// Keys are held per instance rather than in process globals so that several
/// servers (for example in tests) can run with different secrets.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_duration_minutes: i64,
}

impl JwtService {
    pub fn new(jwt_secret: &str, token_duration_minutes: i64) -> Self {
        let secret = jwt_secret.as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            token_duration_minutes,
        }
    }

    /// Generate an access token for an account
    pub fn generate_token(&self, user_id: Uuid, email: &str) -> Result<String, AppError> {
        let iat = Utc::now();
        let exp = iat
            .checked_add_signed(
                Duration::try_minutes(self.token_duration_minutes)
                    .unwrap_or_else(|| Duration::minutes(DEFAULT_TOKEN_DURATION_MINUTES)),
            )
            .ok_or_else(|| AppError::Internal("Failed to calculate JWT expiration time".to_string()))?;

        self.encode_claims(&Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp().max(0) as usize,
            iat: iat.timestamp().max(0) as usize,
            iss: JWT_ISSUER.to_string(),
            email: email.to_string(),
            jti: Uuid::new_v4().to_string(),
        })
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String, AppError> {
        debug!("Generating JWT token for account {} (exp: {})", claims.sub, claims.exp);
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| {
            error!("Failed to generate JWT token: {}", e);
            AppError::Internal(format!("Token generation failed: {}", e))
        })
    }

    /// Verify an access token and extract the claims
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        trace!("Verifying JWT token");

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[JWT_ISSUER]); // Trust only our issuer

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|err| {
            debug!("JWT validation failed: {}", err);
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    AuthError::InvalidToken("invalid signature".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer => {
                    AuthError::InvalidToken("invalid issuer".to_string())
                }
                jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) => {
                    AuthError::InvalidToken(format!("missing required claim: {}", claim))
                }
                _ => AuthError::InvalidToken("malformed token".to_string()),
            }
        })?;

        debug!("JWT token verified successfully for account {}", token_data.claims.sub);
        Ok(token_data.claims)
    }

    /// Verify a token and return the account id it names
    pub fn verify_account(&self, token: &str) -> Result<(Uuid, Claims), AuthError> {
        let claims = self.verify_token(token)?;
        let account_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| AuthError::InvalidToken("subject is not an account id".to_string()))?;
        Ok((account_id, claims))
    }
}
