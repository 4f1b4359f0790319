use actix_web::{
    Error,
    dev::{Service, ServiceRequest, ServiceResponse, Transform},
};
use dashmap::DashMap;
use futures_util::future::{Ready, ok, ready};
use log::{debug, warn};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::config::settings::RateLimitConfig;
use crate::error::AppError;

/// Rate limiter entry for tracking requests
#[derive(Debug, Clone)]
pub struct RateLimitEntry {
    count: u64,
    window_start: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn is_window_expired(&self, now: Instant, window_duration: Duration) -> bool {
        now.saturating_duration_since(self.window_start) > window_duration
    }

    fn increment_if_valid(&mut self, now: Instant, max_requests: u64, window_duration: Duration) -> bool {
        if self.is_window_expired(now, window_duration) {
            // Reset window
            self.count = 1;
            self.window_start = now;
            true
        } else if self.count < max_requests {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Fixed-window request counter keyed by client IP.
#[derive(Clone)]
pub struct IpRateLimiter {
    entries: Arc<DashMap<String, RateLimitEntry>>,
    max_requests: u64,
    window: Duration,
}

impl IpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_requests: config.max_requests,
            window: Duration::from_millis(config.window_ms),
        }
    }

    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));
        entry.increment_if_valid(now, self.max_requests, self.window)
    }

    /// Drop entries whose window has passed
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| !entry.is_window_expired(now, self.window));
    }
}

pub fn extract_client_ip(req: &ServiceRequest) -> String {
    // Try to get real IP from headers (for proxies)
    if let Some(forwarded_for) = req.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = req.headers().get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            return real_ip_str.to_string();
        }
    }

    // Fallback to connection info
    match req.peer_addr() {
        Some(peer_addr) => peer_addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Per-IP rate limiting for the public `/auth` routes.
#[derive(Clone)]
pub struct RateLimitMiddleware {
    limiter: IpRateLimiter,
}

impl RateLimitMiddleware {
    pub fn new(limiter: IpRateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RateLimitService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RateLimitService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
        })
    }
}

pub struct RateLimitService<S> {
    service: Rc<S>,
    limiter: IpRateLimiter,
}

impl<S, B> Service<ServiceRequest> for RateLimitService<S>
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
        let client_ip = extract_client_ip(&req);

        if !self.limiter.check(&client_ip) {
            warn!("Rate limit exceeded for IP {} on {}", client_ip, req.path());
            return Box::pin(ready(Err(Error::from(AppError::TooManyRequests(
                "rate limit exceeded, try again later".to_string(),
            )))));
        }

        debug!("Rate limit check passed for IP {}", client_ip);
        Box::pin(self.service.call(req))
    }
}
