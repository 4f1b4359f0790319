pub mod rate_limiting;
pub mod secure_auth;

pub use rate_limiting::{IpRateLimiter, RateLimitMiddleware};
pub use secure_auth::SecureAuthentication;
