//! Tower middleware and the HTTP-facing wire surface.
//!
//! [`AdmissionLayer`] wraps a service and asks an [`AdmissionCheck`] before
//! every call; a denial short-circuits with [`AdmissionError::Denied`]
//! without touching the inner service. The header and body helpers render a
//! verdict the way HTTP callers expect: `RateLimit-*` headers with
//! `X-RateLimit-*` legacy aliases, `Retry-After`, and a structured 429 JSON
//! body.

use crate::clock::{Clock, SystemClock};
use crate::engine::{AdmissionCheck, Verdict};
use crate::error::AdmissionError;
use crate::rules::AdmissionKey;
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

pub const HEADER_LIMIT: &str = "RateLimit-Limit";
pub const HEADER_REMAINING: &str = "RateLimit-Remaining";
pub const HEADER_RESET: &str = "RateLimit-Reset";
pub const HEADER_LIMIT_LEGACY: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING_LEGACY: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET_LEGACY: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// HTTP status a denial maps to.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// What the middleware needs to know about an incoming request.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    pub key: AdmissionKey,
    pub endpoint: String,
}

/// Rate-limit response headers for a verdict, standard and legacy names.
/// `Retry-After` is present only on denial.
pub fn rate_limit_headers(verdict: &Verdict) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        (HEADER_LIMIT, verdict.limit.to_string()),
        (HEADER_REMAINING, verdict.remaining.to_string()),
        (HEADER_RESET, verdict.reset_at.to_string()),
        (HEADER_LIMIT_LEGACY, verdict.limit.to_string()),
        (HEADER_REMAINING_LEGACY, verdict.remaining.to_string()),
        (HEADER_RESET_LEGACY, verdict.reset_at.to_string()),
    ];
    if !verdict.allowed {
        let retry_after = verdict.retry_after(SystemClock.now_secs());
        headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
    }
    headers
}

/// The 429 JSON body for a denial.
pub fn denial_body(verdict: &Verdict) -> serde_json::Value {
    json!({
        "success": false,
        "error": {
            "code": verdict.reason.as_str(),
            "message": "Too many requests, please try again later",
            "retryAfter": verdict.retry_after(SystemClock.now_secs()),
        }
    })
}

type Extractor<Req> = Arc<dyn Fn(&Req) -> AdmissionRequest + Send + Sync>;

/// A layer that enforces admission via an [`AdmissionCheck`].
pub struct AdmissionLayer<Req> {
    checker: Arc<dyn AdmissionCheck>,
    extractor: Extractor<Req>,
}

impl<Req> AdmissionLayer<Req> {
    pub fn new<F>(checker: Arc<dyn AdmissionCheck>, extractor: F) -> Self
    where
        F: Fn(&Req) -> AdmissionRequest + Send + Sync + 'static,
    {
        Self { checker, extractor: Arc::new(extractor) }
    }
}

impl<Req> Clone for AdmissionLayer<Req> {
    fn clone(&self) -> Self {
        Self { checker: self.checker.clone(), extractor: self.extractor.clone() }
    }
}

impl<S, Req> Layer<S> for AdmissionLayer<Req> {
    type Service = AdmissionService<S, Req>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            checker: self.checker.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

/// Middleware service that checks admission before forwarding.
pub struct AdmissionService<S, Req> {
    inner: S,
    checker: Arc<dyn AdmissionCheck>,
    extractor: Extractor<Req>,
}

impl<S: Clone, Req> Clone for AdmissionService<S, Req> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            checker: self.checker.clone(),
            extractor: self.extractor.clone(),
        }
    }
}

impl<S, Req> Service<Req> for AdmissionService<S, Req>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let admission = (self.extractor)(&req);
        let checker = self.checker.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let verdict = checker.check(&admission.key, &admission.endpoint).await;
            if verdict.allowed {
                inner.call(req).await.map_err(AdmissionError::Inner)
            } else {
                Err(AdmissionError::Denied(verdict))
            }
        })
    }
}
