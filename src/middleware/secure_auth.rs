use actix_web::{
    Error, HttpMessage,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
    http::header::Header,
};
use actix_web_httpauth::headers::authorization::{Authorization, Bearer};
use futures_util::future::{Ready, ok, ready};
use log::{debug, warn};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::AppError;
use crate::models::AuthenticatedUser;
use crate::services::auth::jwt::JwtService;
use crate::services::identity_store::IdentityStore;

/// Bearer JWT authentication for the REST façade.
///
/// On success the request carries an [`AuthenticatedUser`] in its extensions.
#[derive(Clone)]
pub struct SecureAuthentication {
    jwt: JwtService,
    identity: IdentityStore,
}

impl SecureAuthentication {
    pub fn new(jwt: JwtService, identity: IdentityStore) -> Self {
        Self { jwt, identity }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecureAuthentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = SecureAuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(SecureAuthenticationMiddleware {
            service: Rc::new(service),
            jwt: self.jwt.clone(),
            identity: self.identity.clone(),
        })
    }
}

pub struct SecureAuthenticationMiddleware<S> {
    service: Rc<S>,
    jwt: JwtService,
    identity: IdentityStore,
}

impl<S> SecureAuthenticationMiddleware<S> {
    fn authenticate(&self, req: &ServiceRequest) -> Result<AuthenticatedUser, AppError> {
        let auth = Authorization::<Bearer>::parse(req).map_err(|_| {
            warn!("Missing or malformed Bearer token for path: {}", req.path());
            AppError::Auth("missing or malformed Bearer token".to_string())
        })?;

        let (user_id, claims) = self.jwt.verify_account(auth.as_ref().token())?;
        if !self.identity.user_exists(&user_id) {
            warn!("Token for unknown account {} on path: {}", user_id, req.path());
            return Err(AppError::Auth("unknown account".to_string()));
        }

        debug!("JWT valid for account {} on route {}", user_id, req.path());
        Ok(AuthenticatedUser {
            user_id,
            email: claims.email,
        })
    }
}

impl<S, B> Service<ServiceRequest> for SecureAuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        // CORS pre-flight carries no credentials
        if req.method() == actix_web::http::Method::OPTIONS {
            return Box::pin(self.service.call(req));
        }

        match self.authenticate(&req) {
            Ok(user) => {
                req.extensions_mut().insert(user);
                Box::pin(self.service.call(req))
            }
            Err(e) => Box::pin(ready(Err(Error::from(e)))),
        }
    }
}
