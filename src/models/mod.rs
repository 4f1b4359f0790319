pub mod auth_jwt_claims;
pub mod authenticated_user;
pub mod principal;
pub use auth_jwt_claims::*;
pub use authenticated_user::AuthenticatedUser;
pub use principal::{Principal, Role};
