use serde::{Deserialize, Serialize};

/// JWT claims structure that will be encoded/decoded for authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (account ID)
    pub sub: String,
    /// Expiration time (as UTC timestamp)
    pub exp: usize,
    /// Issued at (as UTC timestamp)
    pub iat: usize,
    /// Issuer
    pub iss: String,
    /// Account email
    pub email: String,
    /// JWT ID (unique identifier for the token)
    pub jti: String,
}
